use anyhow::{Context, Result};
use log::{info, warn};
use std::fs;
use tokio::process::Command;

use crate::{backup, config::ServerConfig, logger, security, utils};

pub const REDIS_CONF_PATH: &str = "/etc/redis/redis.conf";

/// Переписывает redis.conf под управляемую установку
///
/// Изменяет директивы supervised, maxmemory, maxmemory-policy и requirepass,
/// сохраняя остальные строки без изменений; отсутствующие директивы
/// добавляются в конец файла
pub fn rewrite_redis_config(
    contents: &str,
    maxmemory_mb: u64,
    password: Option<&str>,
) -> String {
    let mut new_config = String::new();
    let mut supervised_set = false;
    let mut maxmemory_set = false;
    let mut policy_set = false;
    let mut requirepass_set = false;

    for line in contents.lines() {
        let directive = line.split_whitespace().next().unwrap_or("");

        match directive {
            "supervised" => {
                new_config.push_str("supervised systemd\n");
                supervised_set = true;
            }
            "maxmemory" => {
                new_config.push_str(&format!("maxmemory {}mb\n", maxmemory_mb));
                maxmemory_set = true;
            }
            "maxmemory-policy" => {
                new_config.push_str("maxmemory-policy allkeys-lru\n");
                policy_set = true;
            }
            "requirepass" => {
                if let Some(password) = password {
                    new_config.push_str(&format!("requirepass {}\n", password));
                }
                requirepass_set = true;
            }
            _ => {
                new_config.push_str(line);
                new_config.push('\n');
            }
        }
    }

    // Добавляем отсутствующие директивы
    if !supervised_set {
        new_config.push_str("supervised systemd\n");
    }
    if !maxmemory_set {
        new_config.push_str(&format!("maxmemory {}mb\n", maxmemory_mb));
    }
    if !policy_set {
        new_config.push_str("maxmemory-policy allkeys-lru\n");
    }
    if !requirepass_set {
        if let Some(password) = password {
            new_config.push_str(&format!("requirepass {}\n", password));
        }
    }

    new_config
}

/// Проверяет, что redis-cli ответил PONG
pub fn is_pong(output: &str) -> bool {
    output.trim().eq_ignore_ascii_case("pong")
}

/// Устанавливает и настраивает Redis
pub async fn setup_redis(config: &mut ServerConfig, user: &str) -> Result<()> {
    info!("Настройка Redis...");

    utils::install_package("redis-server").await?;

    config.ensure_encryption_key()?;

    // Пароль из прошлого запуска или новый сгенерированный
    let password = match &config.redis_password {
        Some(encrypted) => config.decrypt_string(encrypted)?,
        None => {
            let generated = ServerConfig::generate_strong_password(16)?;
            logger::password_info(&format!("Сгенерирован пароль Redis: {}", &generated));
            generated
        }
    };

    backup::backup_file(REDIS_CONF_PATH).await?;

    let contents = fs::read_to_string(REDIS_CONF_PATH)
        .with_context(|| format!("Не удалось прочитать файл {}", REDIS_CONF_PATH))?;

    let new_config = rewrite_redis_config(&contents, config.redis_maxmemory_mb, Some(&password));

    fs::write(REDIS_CONF_PATH, new_config)
        .with_context(|| format!("Не удалось записать файл {}", REDIS_CONF_PATH))?;

    utils::enable_and_start("redis-server").await?;

    // Проверяем, что сервер отвечает. Команда выполняется напрямую,
    // чтобы пароль не попал в журнал аудита
    let output = Command::new("redis-cli")
        .args(["-a", &password, "ping"])
        .output()
        .await
        .context("Не удалось запустить redis-cli")?;

    let ping_output = String::from_utf8_lossy(&output.stdout).to_string();

    if !is_pong(&ping_output) {
        warn!("Redis ответил неожиданно: {}", ping_output.trim());
        return Err(anyhow::anyhow!(
            "Redis не ответил PONG после настройки"
        ));
    }

    // Сохраняем пароль в конфигурации в зашифрованном виде
    config.redis_password = Some(config.encrypt_string(&password)?);

    // Логируем событие настройки Redis
    let audit_log = security::AuditLog::new(
        "redis_setup",
        user,
        Some("Install and configure redis-server"),
        "success",
        None,
        None,
    );

    security::log_audit_event(audit_log, None).await?;

    info!("Redis успешно настроен");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_existing_directives() {
        let original = "bind 127.0.0.1\nsupervised no\nmaxmemory 0\nmaxmemory-policy noeviction\n";
        let rewritten = rewrite_redis_config(original, 256, Some("Secret123"));

        assert!(rewritten.contains("bind 127.0.0.1\n"));
        assert!(rewritten.contains("supervised systemd\n"));
        assert!(rewritten.contains("maxmemory 256mb\n"));
        assert!(rewritten.contains("maxmemory-policy allkeys-lru\n"));
        assert!(rewritten.contains("requirepass Secret123\n"));
        assert!(!rewritten.contains("supervised no"));
    }

    #[test]
    fn appends_missing_directives() {
        let rewritten = rewrite_redis_config("bind 127.0.0.1\n", 128, Some("Secret123"));

        assert!(rewritten.contains("supervised systemd\n"));
        assert!(rewritten.contains("maxmemory 128mb\n"));
        assert!(rewritten.ends_with("requirepass Secret123\n"));
    }

    #[test]
    fn commented_directives_left_untouched() {
        let original = "# requirepass foobared\n# maxmemory <bytes>\n";
        let rewritten = rewrite_redis_config(original, 64, Some("Secret123"));

        assert!(rewritten.contains("# requirepass foobared\n"));
        assert!(rewritten.contains("requirepass Secret123\n"));
    }

    #[test]
    fn no_password_omits_requirepass() {
        let rewritten = rewrite_redis_config("requirepass old\n", 64, None);
        assert!(!rewritten.contains("requirepass"));
    }

    #[test]
    fn pong_detection() {
        assert!(is_pong("PONG\n"));
        assert!(is_pong("pong"));
        assert!(!is_pong("NOAUTH Authentication required."));
    }
}
