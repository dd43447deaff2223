use anyhow::{Context, Result};
use log::{error, info, warn};
use std::{fs, path::Path};
use tokio::process::Command;

use crate::{nginx, security, utils};

pub const LETSENCRYPT_LIVE_DIR: &str = "/etc/letsencrypt/live";
const RENEWAL_CRON_PATH: &str = "/etc/cron.d/certbot-renewal";

/// Максимальное количество попыток конвертации бандла в PFX
pub const MAX_PFX_ATTEMPTS: usize = 3;

/// Сведения о сертификате, извлеченные из вывода openssl x509
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub subject: String,
    pub not_after: String,
}

/// Стратегия упаковки бандла в PKCS#12
///
/// Стратегии пробуются по порядку: полный бандл с цепочкой, затем без
/// цепочки, затем режим -legacy для старых потребителей PFX
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfxStrategy {
    WithChain,
    WithoutChain,
    Legacy,
}

impl PfxStrategy {
    pub fn describe(&self) -> &'static str {
        match self {
            PfxStrategy::WithChain => "с цепочкой CA",
            PfxStrategy::WithoutChain => "без цепочки CA",
            PfxStrategy::Legacy => "режим -legacy",
        }
    }

    /// Аргументы openssl pkcs12 для этой стратегии
    pub fn openssl_args(
        &self,
        cert_path: &str,
        key_path: &str,
        chain_path: &str,
        output_path: &str,
        password: &str,
    ) -> Vec<String> {
        let mut args = vec![
            "pkcs12".to_string(),
            "-export".to_string(),
            "-out".to_string(),
            output_path.to_string(),
            "-inkey".to_string(),
            key_path.to_string(),
            "-in".to_string(),
            cert_path.to_string(),
        ];

        match self {
            PfxStrategy::WithChain => {
                args.push("-certfile".to_string());
                args.push(chain_path.to_string());
            }
            PfxStrategy::WithoutChain => {}
            PfxStrategy::Legacy => {
                args.push("-certfile".to_string());
                args.push(chain_path.to_string());
                args.push("-legacy".to_string());
            }
        }

        args.push("-passout".to_string());
        args.push(format!("pass:{}", password));

        args
    }
}

/// План попыток конвертации, ограниченный MAX_PFX_ATTEMPTS
pub fn pfx_attempt_plan() -> Vec<PfxStrategy> {
    let mut plan = vec![
        PfxStrategy::WithChain,
        PfxStrategy::WithoutChain,
        PfxStrategy::Legacy,
    ];
    plan.truncate(MAX_PFX_ATTEMPTS);
    plan
}

/// Разбирает вывод openssl x509 -noout -subject -enddate
pub fn parse_cert_fields(output: &str) -> Result<CertInfo> {
    let mut subject = None;
    let mut not_after = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("subject=") {
            subject = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("notAfter=") {
            not_after = Some(value.trim().to_string());
        }
    }

    match (subject, not_after) {
        (Some(subject), Some(not_after)) => Ok(CertInfo { subject, not_after }),
        _ => Err(anyhow::anyhow!(
            "Не удалось разобрать вывод openssl: {}",
            output
        )),
    }
}

/// Извлекает модуль ключа из вывода openssl x509/rsa -noout -modulus
pub fn parse_modulus(output: &str) -> Option<String> {
    output
        .lines()
        .map(|line| line.trim())
        .find_map(|line| line.strip_prefix("Modulus="))
        .map(|modulus| modulus.to_string())
}

// Пути к файлам живого сертификата домена
fn live_paths(domain: &str) -> (String, String, String, String) {
    let live_dir = format!("{}/{}", LETSENCRYPT_LIVE_DIR, domain);
    (
        format!("{}/cert.pem", live_dir),
        format!("{}/privkey.pem", live_dir),
        format!("{}/chain.pem", live_dir),
        format!("{}/fullchain.pem", live_dir),
    )
}

/// Устанавливает certbot с плагином nginx
pub async fn install_certbot(user: &str) -> Result<()> {
    for package in ["certbot", "python3-certbot-nginx"] {
        utils::install_package(package).await?;
    }

    // Логируем событие установки certbot
    let audit_log = security::AuditLog::new(
        "certbot_install",
        user,
        Some("Install certbot and nginx plugin"),
        "success",
        None,
        None,
    );

    security::log_audit_event(audit_log, None).await?;

    Ok(())
}

/// Выпускает SSL сертификат для домена
///
/// Сначала пробует webroot-проверку через подготовленную ACME-локацию,
/// при неудаче переключается на nginx-аутентификатор certbot
pub async fn obtain_certificate(domain: &str, email: &str, user: &str) -> Result<()> {
    info!("Выпуск SSL сертификата для домена: {}", domain);

    // Проверяем, существует ли уже сертификат
    let (_, _, _, fullchain) = live_paths(domain);
    if Path::new(&fullchain).exists() {
        info!("Сертификат для домена {} уже существует", domain);
        return Ok(());
    }

    let webroot_result = security::execute_command_with_audit(
        "certbot",
        &[
            "certonly",
            "--webroot",
            "--webroot-path",
            nginx::CERTBOT_WEBROOT,
            "--email",
            email,
            "--agree-tos",
            "--no-eff-email",
            "--non-interactive",
            "-d",
            domain,
        ],
        user,
        &format!("Выпуск сертификата для {} (webroot)", domain),
    )
    .await;

    if let Err(e) = webroot_result {
        warn!(
            "Webroot-проверка для {} не прошла: {}. Пробуем nginx-аутентификатор...",
            domain, e
        );

        security::execute_command_with_audit(
            "certbot",
            &[
                "certonly",
                "--nginx",
                "--email",
                email,
                "--agree-tos",
                "--no-eff-email",
                "--non-interactive",
                "-d",
                domain,
            ],
            user,
            &format!("Выпуск сертификата для {} (nginx)", domain),
        )
        .await?;
    }

    info!("SSL сертификат для домена {} успешно получен", domain);

    Ok(())
}

/// Настраивает автообновление SSL сертификатов
pub async fn setup_certbot_renewal(user: &str) -> Result<()> {
    info!("Настройка автообновления SSL сертификатов...");

    // Создаем cron-задачу для обновления сертификатов
    let cron_content = "0 */12 * * * root certbot renew --quiet --deploy-hook \"systemctl reload nginx\" >/dev/null 2>&1\n";

    fs::write(RENEWAL_CRON_PATH, cron_content)
        .with_context(|| format!("Не удалось создать cron-задачу: {}", RENEWAL_CRON_PATH))?;

    // Устанавливаем правильные права на файл
    let output = Command::new("chmod")
        .args(["644", RENEWAL_CRON_PATH])
        .output()
        .await
        .with_context(|| format!("Не удалось установить права на файл: {}", RENEWAL_CRON_PATH))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("Ошибка установки прав на cron-файл: {}", stderr);
    }

    // Логируем событие настройки автообновления
    let audit_log = security::AuditLog::new(
        "certbot_renewal_setup",
        user,
        Some("Setup automatic SSL certificate renewal"),
        "success",
        None,
        None,
    );

    security::log_audit_event(audit_log, None).await?;

    info!("Автообновление SSL сертификатов успешно настроено");

    Ok(())
}

/// Читает subject и срок действия живого сертификата домена
pub async fn cert_info(domain: &str) -> Result<CertInfo> {
    let (cert_path, _, _, _) = live_paths(domain);

    let output = Command::new("openssl")
        .args(["x509", "-in", &cert_path, "-noout", "-subject", "-enddate"])
        .output()
        .await
        .context("Не удалось запустить openssl x509")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!(
            "Ошибка чтения сертификата {}: {}",
            cert_path,
            stderr
        ));
    }

    parse_cert_fields(&String::from_utf8_lossy(&output.stdout))
}

/// Проверяет соответствие приватного ключа сертификату по модулю
pub async fn verify_key_matches(domain: &str) -> Result<bool> {
    let (cert_path, key_path, _, _) = live_paths(domain);

    let cert_output = Command::new("openssl")
        .args(["x509", "-in", &cert_path, "-noout", "-modulus"])
        .output()
        .await
        .context("Не удалось прочитать модуль сертификата")?;

    let key_output = Command::new("openssl")
        .args(["rsa", "-in", &key_path, "-noout", "-modulus"])
        .output()
        .await
        .context("Не удалось прочитать модуль ключа")?;

    if !cert_output.status.success() || !key_output.status.success() {
        return Err(anyhow::anyhow!(
            "openssl не смог прочитать сертификат или ключ домена {}",
            domain
        ));
    }

    let cert_modulus = parse_modulus(&String::from_utf8_lossy(&cert_output.stdout));
    let key_modulus = parse_modulus(&String::from_utf8_lossy(&key_output.stdout));

    match (cert_modulus, key_modulus) {
        (Some(cert_modulus), Some(key_modulus)) => Ok(cert_modulus == key_modulus),
        _ => Err(anyhow::anyhow!(
            "Не удалось извлечь модуль из вывода openssl"
        )),
    }
}

/// Конвертирует бандл сертификата в PFX (PKCS#12)
///
/// Стратегии упаковки пробуются по порядку плана, не более
/// MAX_PFX_ATTEMPTS попыток
pub async fn convert_to_pfx(
    domain: &str,
    password: &str,
    output_path: &str,
    user: &str,
) -> Result<()> {
    info!("Конвертация бандла {} в PFX...", domain);

    let (cert_path, key_path, chain_path, _) = live_paths(domain);

    if !Path::new(&cert_path).exists() {
        return Err(anyhow::anyhow!(
            "Сертификат для домена {} не найден. Сначала выполните выпуск сертификата",
            domain
        ));
    }

    // Ключ обязан соответствовать сертификату до упаковки
    if !verify_key_matches(domain).await? {
        return Err(anyhow::anyhow!(
            "Приватный ключ не соответствует сертификату домена {}",
            domain
        ));
    }

    let cert = cert_info(domain).await?;
    info!(
        "Упаковывается сертификат {} (действителен до {})",
        cert.subject, cert.not_after
    );

    let mut last_error = anyhow::anyhow!("План конвертации пуст");

    for (attempt, strategy) in pfx_attempt_plan().iter().enumerate() {
        info!(
            "Попытка {} из {}: упаковка {}",
            attempt + 1,
            MAX_PFX_ATTEMPTS,
            strategy.describe()
        );

        let args =
            strategy.openssl_args(&cert_path, &key_path, &chain_path, output_path, password);
        let arg_refs: Vec<&str> = args.iter().map(|arg| arg.as_str()).collect();

        let output = Command::new("openssl")
            .args(&arg_refs)
            .output()
            .await
            .context("Не удалось запустить openssl pkcs12")?;

        if output.status.success() {
            // Ограничиваем доступ к файлу с приватным ключом
            security::execute_command_with_audit(
                "chmod",
                &["600", output_path],
                user,
                &format!("Установка прав на PFX файл {}", output_path),
            )
            .await?;

            #[cfg(unix)]
            inspect_pfx(output_path, password)?;

            // Логируем событие конвертации
            let audit_log = security::AuditLog::new(
                "pfx_conversion",
                user,
                Some(&format!("Convert {} bundle to PFX", domain)),
                "success",
                None,
                None,
            );

            security::log_audit_event(audit_log, None).await?;

            info!("PFX файл создан: {}", output_path);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        warn!(
            "Стратегия \"{}\" не сработала: {}",
            strategy.describe(),
            stderr.trim()
        );
        last_error = anyhow::anyhow!("{}", stderr);
    }

    error!(
        "Конвертация бандла {} в PFX не удалась после {} попыток",
        domain, MAX_PFX_ATTEMPTS
    );

    Err(anyhow::anyhow!(
        "Не удалось сконвертировать бандл в PFX: {}",
        last_error
    ))
}

/// Контрольная проверка: полученный PFX должен разбираться с тем же паролем
#[cfg(unix)]
fn inspect_pfx(path: &str, password: &str) -> Result<()> {
    use openssl::pkcs12::Pkcs12;

    let der = fs::read(path).with_context(|| format!("Не удалось прочитать файл {}", path))?;

    let pkcs12 =
        Pkcs12::from_der(&der).with_context(|| format!("Файл {} не является PKCS#12", path))?;

    let parsed = pkcs12
        .parse2(password)
        .with_context(|| format!("Не удалось разобрать PFX {} с заданным паролем", path))?;

    if parsed.cert.is_none() || parsed.pkey.is_none() {
        return Err(anyhow::anyhow!(
            "PFX {} не содержит сертификат или ключ",
            path
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_is_bounded_and_ordered() {
        let plan = pfx_attempt_plan();
        assert_eq!(plan.len(), MAX_PFX_ATTEMPTS);
        assert_eq!(
            plan,
            vec![
                PfxStrategy::WithChain,
                PfxStrategy::WithoutChain,
                PfxStrategy::Legacy
            ]
        );
    }

    #[test]
    fn legacy_strategy_adds_flag() {
        let args = PfxStrategy::Legacy.openssl_args(
            "/tmp/cert.pem",
            "/tmp/key.pem",
            "/tmp/chain.pem",
            "/tmp/out.pfx",
            "Secret123",
        );

        assert!(args.contains(&"-legacy".to_string()));
        assert!(args.contains(&"-certfile".to_string()));
        assert!(args.contains(&"pass:Secret123".to_string()));
    }

    #[test]
    fn without_chain_omits_certfile() {
        let args = PfxStrategy::WithoutChain.openssl_args(
            "/tmp/cert.pem",
            "/tmp/key.pem",
            "/tmp/chain.pem",
            "/tmp/out.pfx",
            "Secret123",
        );

        assert!(!args.contains(&"-certfile".to_string()));
        assert!(!args.contains(&"-legacy".to_string()));
    }

    #[test]
    fn parses_subject_and_enddate() {
        let output = "subject=CN = example.com\nnotAfter=Mar  5 12:00:00 2026 GMT\n";
        let info = parse_cert_fields(output).unwrap();

        assert_eq!(info.subject, "CN = example.com");
        assert_eq!(info.not_after, "Mar  5 12:00:00 2026 GMT");
    }

    #[test]
    fn incomplete_cert_output_is_error() {
        assert!(parse_cert_fields("subject=CN = example.com\n").is_err());
        assert!(parse_cert_fields("").is_err());
    }

    #[test]
    fn parses_modulus_line() {
        let output = "Modulus=C9AF3B5D1E\n";
        assert_eq!(parse_modulus(output), Some("C9AF3B5D1E".to_string()));
        assert_eq!(parse_modulus("unable to load certificate\n"), None);
    }
}
