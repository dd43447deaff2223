use anyhow::{Context, Result};
use log::{info, warn};
use regex::Regex;
use std::fs;
use tokio::process::Command;

use crate::{
    config::ServerConfig,
    logger, security, utils,
};

/// Максимальное количество попыток аутентификации в MySQL
pub const MAX_AUTH_ATTEMPTS: usize = 3;

const DEBIAN_CNF_PATH: &str = "/etc/mysql/debian.cnf";

/// Способ аутентификации при подключении к MySQL
///
/// Методы пробуются строго по порядку плана: сначала socket-аутентификация
/// свежей установки, затем известный пароль, затем служебные учетные
/// данные debian-sys-maint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Подключение через unix socket без пароля (свежая установка)
    Socket,
    /// Подключение root с известным паролем
    Password(String),
    /// Служебная учетная запись из /etc/mysql/debian.cnf
    DebianMaint { user: String, password: String },
}

impl AuthMethod {
    pub fn describe(&self) -> &'static str {
        match self {
            AuthMethod::Socket => "socket-аутентификация root",
            AuthMethod::Password(_) => "root с известным паролем",
            AuthMethod::DebianMaint { .. } => "учетная запись debian-sys-maint",
        }
    }

    /// Аргументы командной строки mysql для этого метода
    pub fn cli_args(&self) -> Vec<String> {
        match self {
            AuthMethod::Socket => vec!["-uroot".to_string()],
            AuthMethod::Password(password) => {
                vec!["-uroot".to_string(), format!("-p{}", password)]
            }
            AuthMethod::DebianMaint { user, password } => {
                vec![format!("-u{}", user), format!("-p{}", password)]
            }
        }
    }
}

/// Строит план попыток аутентификации
///
/// План ограничен MAX_AUTH_ATTEMPTS методами
pub fn auth_attempt_plan(
    known_password: Option<&str>,
    maint_credentials: Option<(String, String)>,
) -> Vec<AuthMethod> {
    let mut plan = vec![AuthMethod::Socket];

    if let Some(password) = known_password {
        plan.push(AuthMethod::Password(password.to_string()));
    }

    if let Some((user, password)) = maint_credentials {
        plan.push(AuthMethod::DebianMaint { user, password });
    }

    plan.truncate(MAX_AUTH_ATTEMPTS);
    plan
}

/// Извлекает учетные данные клиента из содержимого debian.cnf
pub fn parse_debian_cnf(contents: &str) -> Option<(String, String)> {
    let mut in_client_section = false;
    let mut user = None;
    let mut password = None;

    for line in contents.lines() {
        let line = line.trim();

        if line.starts_with('[') {
            in_client_section = line == "[client]";
            continue;
        }

        if !in_client_section {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "user" => user = Some(value.trim().to_string()),
                "password" => password = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    match (user, password) {
        (Some(user), Some(password)) => Some((user, password)),
        _ => None,
    }
}

/// Экранирует строку для подстановки в SQL-литерал
pub fn escape_sql_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Проверяет имя базы данных или пользователя MySQL
pub fn is_valid_identifier(name: &str) -> bool {
    match Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,31}$") {
        Ok(re) => re.is_match(name),
        Err(_) => false,
    }
}

// Выполняет SQL под указанным методом аутентификации
async fn run_sql(auth: &AuthMethod, sql: &str) -> Result<String> {
    let mut args = auth.cli_args();
    args.push("-N".to_string());
    args.push("-e".to_string());
    args.push(sql.to_string());

    let output = Command::new("mysql")
        .args(&args)
        .output()
        .await
        .context("Не удалось запустить клиент mysql")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!("Ошибка выполнения SQL: {}", stderr));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Выполняет SQL, перебирая методы аутентификации из плана
///
/// Возвращает вывод mysql и номер сработавшей попытки
pub async fn execute_with_auth_fallback(
    plan: &[AuthMethod],
    sql: &str,
    user: &str,
    action_description: &str,
) -> Result<(String, usize)> {
    let mut last_error = anyhow::anyhow!("План аутентификации пуст");

    for (attempt, auth) in plan.iter().enumerate().take(MAX_AUTH_ATTEMPTS) {
        info!(
            "Попытка {} из {}: {}",
            attempt + 1,
            plan.len().min(MAX_AUTH_ATTEMPTS),
            auth.describe()
        );

        match run_sql(auth, sql).await {
            Ok(stdout) => {
                // Логируем успешную попытку без текста SQL с паролями
                let audit_log = security::AuditLog::new(
                    action_description,
                    user,
                    Some(&format!("mysql ({})", auth.describe())),
                    "success",
                    None,
                    None,
                );
                security::log_audit_event(audit_log, None).await?;

                return Ok((stdout, attempt + 1));
            }
            Err(e) => {
                warn!(
                    "Метод \"{}\" не сработал: {}",
                    auth.describe(),
                    e
                );
                last_error = e;
            }
        }
    }

    let audit_log = security::AuditLog::new(
        action_description,
        user,
        Some("mysql (all auth methods failed)"),
        "error",
        Some(&last_error.to_string()),
        None,
    );
    security::log_audit_event(audit_log, None).await?;

    Err(anyhow::anyhow!(
        "Не удалось подключиться к MySQL ни одним из методов: {}",
        last_error
    ))
}

// Читает учетные данные debian-sys-maint, если файл доступен
fn read_maint_credentials() -> Option<(String, String)> {
    fs::read_to_string(DEBIAN_CNF_PATH)
        .ok()
        .and_then(|contents| parse_debian_cnf(&contents))
}

/// Устанавливает и настраивает MySQL сервер
///
/// Устанавливает пароль root через цепочку методов аутентификации,
/// выполняет базовую защиту установки и создает базу приложения
pub async fn setup_mysql(config: &mut ServerConfig, user: &str) -> Result<()> {
    info!("Настройка MySQL...");

    utils::install_package("mysql-server").await?;
    utils::enable_and_start("mysql").await?;

    if !is_valid_identifier(&config.mysql_database) {
        return Err(anyhow::anyhow!(
            "Некорректное имя базы данных: {}",
            config.mysql_database
        ));
    }
    if !is_valid_identifier(&config.mysql_user) {
        return Err(anyhow::anyhow!(
            "Некорректное имя пользователя MySQL: {}",
            config.mysql_user
        ));
    }

    config.ensure_encryption_key()?;

    // Известный пароль root из прошлого запуска, если он сохранен
    let known_password = match &config.mysql_root_password {
        Some(encrypted) => Some(config.decrypt_string(encrypted)?),
        None => None,
    };

    let root_password = match known_password.clone() {
        Some(password) => password,
        None => {
            let generated = ServerConfig::generate_strong_password(16)?;
            logger::password_info(&format!(
                "Сгенерирован пароль root MySQL: {}",
                &generated
            ));
            generated
        }
    };

    // Цепочка методов аутентификации: socket -> известный пароль -> debian.cnf
    let plan = auth_attempt_plan(known_password.as_deref(), read_maint_credentials());

    let alter_sql = format!(
        "ALTER USER 'root'@'localhost' IDENTIFIED WITH mysql_native_password BY '{}'; FLUSH PRIVILEGES;",
        escape_sql_string(&root_password)
    );

    let (_, attempt) =
        execute_with_auth_fallback(&plan, &alter_sql, user, "Установка пароля root MySQL").await?;
    info!("Пароль root MySQL установлен (метод {})", attempt);

    // Дальше работаем только под новым паролем root
    let root_auth = vec![AuthMethod::Password(root_password.clone())];

    // Базовая защита установки
    let harden_sql = "DELETE FROM mysql.user WHERE User=''; \
         DROP DATABASE IF EXISTS test; \
         DELETE FROM mysql.db WHERE Db='test' OR Db='test\\_%'; \
         DELETE FROM mysql.user WHERE User='root' AND Host NOT IN ('localhost', '127.0.0.1', '::1'); \
         FLUSH PRIVILEGES;";

    execute_with_auth_fallback(&root_auth, harden_sql, user, "Защита установки MySQL").await?;
    info!("Анонимные пользователи и тестовая база удалены");

    // Создаем базу и пользователя приложения
    let app_password = match &config.mysql_app_password {
        Some(encrypted) => config.decrypt_string(encrypted)?,
        None => {
            let generated = ServerConfig::generate_strong_password(16)?;
            logger::password_info(&format!(
                "Сгенерирован пароль пользователя {} MySQL: {}",
                config.mysql_user, &generated
            ));
            generated
        }
    };

    let app_sql = format!(
        "CREATE DATABASE IF NOT EXISTS `{db}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci; \
         CREATE USER IF NOT EXISTS '{user}'@'localhost' IDENTIFIED BY '{password}'; \
         GRANT ALL PRIVILEGES ON `{db}`.* TO '{user}'@'localhost'; \
         FLUSH PRIVILEGES;",
        db = config.mysql_database,
        user = config.mysql_user,
        password = escape_sql_string(&app_password)
    );

    execute_with_auth_fallback(
        &root_auth,
        &app_sql,
        user,
        "Создание базы данных приложения",
    )
    .await?;
    info!(
        "База данных {} и пользователь {} созданы",
        config.mysql_database, config.mysql_user
    );

    // Сохраняем пароли в конфигурации в зашифрованном виде
    config.mysql_root_password = Some(config.encrypt_string(&root_password)?);
    config.mysql_app_password = Some(config.encrypt_string(&app_password)?);

    info!("MySQL успешно настроен");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_starts_with_socket_auth() {
        let plan = auth_attempt_plan(None, None);
        assert_eq!(plan, vec![AuthMethod::Socket]);
    }

    #[test]
    fn plan_orders_socket_password_maint() {
        let plan = auth_attempt_plan(
            Some("Old1Password"),
            Some(("debian-sys-maint".to_string(), "maintpw".to_string())),
        );

        assert_eq!(plan.len(), MAX_AUTH_ATTEMPTS);
        assert_eq!(plan[0], AuthMethod::Socket);
        assert_eq!(plan[1], AuthMethod::Password("Old1Password".to_string()));
        assert_eq!(
            plan[2],
            AuthMethod::DebianMaint {
                user: "debian-sys-maint".to_string(),
                password: "maintpw".to_string()
            }
        );
    }

    #[test]
    fn password_flag_has_no_space() {
        let args = AuthMethod::Password("Secret123".to_string()).cli_args();
        assert_eq!(args, vec!["-uroot".to_string(), "-pSecret123".to_string()]);
    }

    #[test]
    fn parses_debian_cnf_client_section() {
        let cnf = r#"# Automatically generated for Debian scripts. DO NOT TOUCH!
[client]
host     = localhost
user     = debian-sys-maint
password = AbC123xyz
socket   = /var/run/mysqld/mysqld.sock
[mysql_upgrade]
user     = other
"#;

        let (user, password) = parse_debian_cnf(cnf).unwrap();
        assert_eq!(user, "debian-sys-maint");
        assert_eq!(password, "AbC123xyz");
    }

    #[test]
    fn debian_cnf_without_client_section_is_none() {
        assert!(parse_debian_cnf("[mysql_upgrade]\nuser = x\npassword = y\n").is_none());
        assert!(parse_debian_cnf("").is_none());
    }

    #[test]
    fn sql_strings_are_escaped() {
        assert_eq!(escape_sql_string("pa'ss"), "pa\\'ss");
        assert_eq!(escape_sql_string("a\\b"), "a\\\\b");
        assert_eq!(escape_sql_string("plain"), "plain");
    }

    #[test]
    fn identifiers_validated() {
        assert!(is_valid_identifier("app_db"));
        assert!(is_valid_identifier("Shop2024"));
        assert!(!is_valid_identifier("1starts_with_digit"));
        assert!(!is_valid_identifier("bad-name"));
        assert!(!is_valid_identifier(""));
    }
}
