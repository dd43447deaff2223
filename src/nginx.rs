use anyhow::{Context, Result};
use log::{error, info, warn};
use regex::Regex;
use std::fs;
use tokio::process::Command;

use crate::{backup, security, utils};

// Системные пути Nginx
pub const SITES_AVAILABLE: &str = "/etc/nginx/sites-available";
pub const SITES_ENABLED: &str = "/etc/nginx/sites-enabled";
pub const WEB_ROOT: &str = "/var/www";
pub const CERTBOT_WEBROOT: &str = "/var/www/certbot";

/// Тип сайта, определяемый целью в строке "domain:target"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteKind {
    /// Статический сайт из /var/www/<domain>
    Static,
    /// PHP-FPM сайт из /var/www/<domain>
    Php,
    /// Реверс-прокси на адрес апстрима
    Proxy(String),
}

/// Структура для хранения информации о домене
#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub domain: String,
    pub kind: SiteKind,
}

impl DomainConfig {
    pub fn new(domain: &str, kind: SiteKind) -> Self {
        Self {
            domain: domain.to_string(),
            kind,
        }
    }

    /// Парсит конфигурацию домена из строки вида "domain:target",
    /// где target - "static", "php" или адрес апстрима "host:port"
    pub fn from_string(config_str: &str) -> Result<Self> {
        let mut parts = config_str.splitn(2, ':');

        let domain = parts.next().unwrap_or("").trim();
        let target = parts.next().unwrap_or("").trim();

        if domain.is_empty() || target.is_empty() {
            return Err(anyhow::anyhow!(
                "Домен или цель не могут быть пустыми: {}",
                config_str
            ));
        }

        if !is_valid_domain(domain) {
            return Err(anyhow::anyhow!("Некорректное доменное имя: {}", domain));
        }

        let kind = match target {
            "static" => SiteKind::Static,
            "php" => SiteKind::Php,
            upstream => SiteKind::Proxy(upstream.to_string()),
        };

        Ok(Self::new(domain, kind))
    }

    /// Корневая директория сайта
    pub fn web_root(&self) -> String {
        format!("{}/{}", WEB_ROOT, self.domain)
    }
}

/// Проверяет корректность доменного имени
pub fn is_valid_domain(domain: &str) -> bool {
    let re = match Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)+$")
    {
        Ok(re) => re,
        Err(_) => return false,
    };
    domain.len() <= 253 && re.is_match(domain)
}

// Общий location для прохождения ACME-челленджа
fn acme_location() -> &'static str {
    r#"    location /.well-known/acme-challenge/ {
        root /var/www/certbot;
    }
"#
}

// Содержимое location в зависимости от типа сайта
fn content_block(config: &DomainConfig, php_version: &str) -> String {
    match &config.kind {
        SiteKind::Static => format!(
            r#"    root {root};
    index index.html;

    location / {{
        try_files $uri $uri/ =404;
    }}
"#,
            root = config.web_root()
        ),
        SiteKind::Php => format!(
            r#"    root {root};
    index index.php index.html;

    location / {{
        try_files $uri $uri/ /index.php?$query_string;
    }}

    location ~ \.php$ {{
        include snippets/fastcgi-php.conf;
        fastcgi_pass unix:/run/php/php{version}-fpm.sock;
    }}

    location ~ /\.ht {{
        deny all;
    }}
"#,
            root = config.web_root(),
            version = php_version
        ),
        SiteKind::Proxy(target) => format!(
            r#"    location / {{
        proxy_pass http://{target};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }}
"#,
            target = target
        ),
    }
}

/// Формирует HTTP-конфигурацию сайта (до получения SSL сертификата)
///
/// Сайт обслуживается по 80 порту вместе с ACME-локацией, чтобы certbot
/// мог пройти webroot-проверку
pub fn render_http_site(config: &DomainConfig, php_version: &str) -> String {
    format!(
        r#"server {{
    listen 80;
    listen [::]:80;
    server_name {domain};

{acme}
{content}}}
"#,
        domain = config.domain,
        acme = acme_location(),
        content = content_block(config, php_version)
    )
}

/// Формирует итоговую конфигурацию сайта с редиректом на HTTPS
pub fn render_https_site(config: &DomainConfig, php_version: &str) -> String {
    format!(
        r#"server {{
    listen 80;
    listen [::]:80;
    server_name {domain};

{acme}
    location / {{
        return 301 https://$host$request_uri;
    }}
}}

server {{
    listen 443 ssl;
    listen [::]:443 ssl;
    server_name {domain};

    ssl_certificate /etc/letsencrypt/live/{domain}/fullchain.pem;
    ssl_certificate_key /etc/letsencrypt/live/{domain}/privkey.pem;

    ssl_protocols TLSv1.2 TLSv1.3;
    ssl_prefer_server_ciphers on;
    ssl_ciphers ECDHE-RSA-AES256-GCM-SHA512:DHE-RSA-AES256-GCM-SHA512:ECDHE-RSA-AES256-GCM-SHA384:DHE-RSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-SHA384;
    ssl_session_timeout 1d;
    ssl_session_cache shared:SSL:10m;
    ssl_stapling on;
    ssl_stapling_verify on;
    add_header Strict-Transport-Security "max-age=31536000; includeSubDomains" always;

{content}}}
"#,
        domain = config.domain,
        acme = acme_location(),
        content = content_block(config, php_version)
    )
}

/// Устанавливает Nginx и подготавливает директории
pub async fn setup_nginx(user: &str) -> Result<()> {
    info!("Настройка Nginx...");

    utils::install_package("nginx").await?;

    fs::create_dir_all(CERTBOT_WEBROOT)
        .with_context(|| format!("Не удалось создать директорию {}", CERTBOT_WEBROOT))?;

    utils::enable_and_start("nginx").await?;

    // Логируем событие установки Nginx
    let audit_log = security::AuditLog::new(
        "nginx_setup",
        user,
        Some("Install nginx and prepare certbot webroot"),
        "success",
        None,
        None,
    );

    security::log_audit_event(audit_log, None).await?;

    info!("Nginx успешно установлен и запущен");

    Ok(())
}

/// Настраивает сайт для домена (HTTP-фаза, до выпуска сертификата)
pub async fn configure_domain(
    domain_config: &DomainConfig,
    php_version: &str,
    user: &str,
) -> Result<()> {
    info!(
        "Настройка домена {}: {:?}",
        domain_config.domain, domain_config.kind
    );

    // Для сайтов с корнем на диске создаем директорию и тестовую страницу
    if matches!(domain_config.kind, SiteKind::Static | SiteKind::Php) {
        let web_root = domain_config.web_root();
        fs::create_dir_all(&web_root)
            .with_context(|| format!("Не удалось создать директорию {}", web_root))?;

        if domain_config.kind == SiteKind::Static {
            let index = format!("{}/index.html", web_root);
            utils::create_test_html(&index, &domain_config.domain).await?;
        }
    }

    let conf_content = render_http_site(domain_config, php_version);
    write_site_config(&domain_config.domain, &conf_content, user).await?;

    info!("Домен {} настроен (HTTP)", domain_config.domain);

    Ok(())
}

/// Переключает домен на HTTPS-конфигурацию после выпуска сертификата
pub async fn enable_https(
    domain_config: &DomainConfig,
    php_version: &str,
    user: &str,
) -> Result<()> {
    info!("Включение HTTPS для домена {}", domain_config.domain);

    let conf_content = render_https_site(domain_config, php_version);
    write_site_config(&domain_config.domain, &conf_content, user).await?;

    info!("HTTPS включен для домена {}", domain_config.domain);

    Ok(())
}

// Записывает конфигурацию сайта, включает её и проверяет nginx -t.
// При ошибке валидации новая конфигурация отключается
async fn write_site_config(domain: &str, conf_content: &str, user: &str) -> Result<()> {
    let conf_file = format!("{}/{}.conf", SITES_AVAILABLE, domain);
    let enabled_link = format!("{}/{}.conf", SITES_ENABLED, domain);

    let backup_path = backup::backup_file(&conf_file).await?;

    fs::write(&conf_file, conf_content)
        .with_context(|| format!("Не удалось создать файл конфигурации домена: {}", conf_file))?;

    security::execute_command_with_audit(
        "ln",
        &["-sf", &conf_file, &enabled_link],
        user,
        &format!("Включение сайта {}", domain),
    )
    .await?;

    if let Err(e) = validate_config().await {
        error!(
            "Конфигурация Nginx для домена {} не прошла проверку: {}",
            domain, e
        );

        // Возвращаем предыдущую конфигурацию или отключаем сайт целиком
        if backup_path != std::path::Path::new(&conf_file) {
            backup::restore_from_backup(backup_path.as_path(), std::path::Path::new(&conf_file))
                .await?;
        } else if let Err(cleanup_err) = fs::remove_file(&enabled_link) {
            warn!(
                "Не удалось отключить сайт {}: {}",
                domain, cleanup_err
            );
        }

        return Err(e);
    }

    reload().await?;

    info!("Создан файл конфигурации для домена: {}", conf_file);

    Ok(())
}

/// Проверяет конфигурацию Nginx через nginx -t
pub async fn validate_config() -> Result<()> {
    let output = Command::new("nginx")
        .args(["-t"])
        .output()
        .await
        .context("Не удалось выполнить проверку конфигурации Nginx")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!(
            "Ошибка конфигурации Nginx: {}",
            stderr
        ));
    }

    Ok(())
}

/// Перезагружает конфигурацию Nginx
pub async fn reload() -> Result<()> {
    utils::systemctl("reload", "nginx").await
}

/// Отключает сайт и удаляет его конфигурацию
pub async fn disable_site(domain: &str, user: &str) -> Result<()> {
    let conf_file = format!("{}/{}.conf", SITES_AVAILABLE, domain);
    let enabled_link = format!("{}/{}.conf", SITES_ENABLED, domain);

    for path in [&enabled_link, &conf_file] {
        if std::path::Path::new(path).exists() {
            if let Err(e) = fs::remove_file(path) {
                warn!("Не удалось удалить {}: {}", path, e);
            }
        }
    }

    // Логируем событие отключения сайта
    let audit_log = security::AuditLog::new(
        "nginx_site_disable",
        user,
        Some(&format!("Disable site {}", domain)),
        "success",
        None,
        None,
    );

    security::log_audit_event(audit_log, None).await?;

    info!("Сайт {} отключен", domain);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_static_domain() {
        let config = DomainConfig::from_string("example.com:static").unwrap();
        assert_eq!(config.domain, "example.com");
        assert_eq!(config.kind, SiteKind::Static);
    }

    #[test]
    fn parses_php_domain() {
        let config = DomainConfig::from_string("shop.example.com:php").unwrap();
        assert_eq!(config.kind, SiteKind::Php);
    }

    #[test]
    fn parses_proxy_domain_with_port() {
        let config = DomainConfig::from_string("api.example.com:127.0.0.1:3000").unwrap();
        assert_eq!(
            config.kind,
            SiteKind::Proxy("127.0.0.1:3000".to_string())
        );
    }

    #[test]
    fn rejects_malformed_domain_strings() {
        assert!(DomainConfig::from_string("example.com").is_err());
        assert!(DomainConfig::from_string(":static").is_err());
        assert!(DomainConfig::from_string("example.com:").is_err());
        assert!(DomainConfig::from_string("bad_domain!:static").is_err());
    }

    #[test]
    fn validates_domain_names() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("sub.example-site.co.uk"));
        assert!(!is_valid_domain("localhost"));
        assert!(!is_valid_domain("-example.com"));
        assert!(!is_valid_domain("example..com"));
    }

    #[test]
    fn http_site_serves_acme_challenge() {
        let config = DomainConfig::new("example.com", SiteKind::Static);
        let conf = render_http_site(&config, "8.3");
        assert!(conf.contains("server_name example.com;"));
        assert!(conf.contains("/.well-known/acme-challenge/"));
        assert!(conf.contains("root /var/www/example.com;"));
        assert!(!conf.contains("443"));
    }

    #[test]
    fn php_site_points_to_fpm_socket() {
        let config = DomainConfig::new("example.com", SiteKind::Php);
        let conf = render_https_site(&config, "8.3");
        assert!(conf.contains("fastcgi_pass unix:/run/php/php8.3-fpm.sock;"));
        assert!(conf.contains("index index.php index.html;"));
    }

    #[test]
    fn proxy_site_forwards_to_upstream() {
        let config = DomainConfig::new(
            "api.example.com",
            SiteKind::Proxy("127.0.0.1:3000".to_string()),
        );
        let conf = render_https_site(&config, "8.3");
        assert!(conf.contains("proxy_pass http://127.0.0.1:3000;"));
        assert!(conf.contains("return 301 https://$host$request_uri;"));
        assert!(conf.contains("ssl_certificate /etc/letsencrypt/live/api.example.com/fullchain.pem;"));
        assert!(conf.contains("Strict-Transport-Security"));
    }
}
