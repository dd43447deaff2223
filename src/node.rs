use anyhow::{Context, Result};
use log::{info, warn};
use tokio::{fs, process::Command};

use crate::{config, security};

/// Извлекает мажорную версию из вывода node --version ("v20.11.1")
pub fn node_major_from_version(output: &str) -> Option<u32> {
    output
        .trim()
        .strip_prefix('v')
        .and_then(|rest| rest.split('.').next())
        .and_then(|major| major.parse::<u32>().ok())
}

/// Извлекает команду настройки автозапуска из вывода pm2 startup
///
/// pm2 печатает готовую команду вида
/// "sudo env PATH=... pm2 startup systemd -u deploy --hp /home/deploy";
/// префикс sudo отбрасывается, так как утилита уже работает от root
pub fn parse_pm2_startup_command(output: &str) -> Option<String> {
    output
        .lines()
        .map(|line| line.trim())
        .find(|line| line.starts_with("sudo env ") && line.contains("pm2 startup"))
        .and_then(|line| line.strip_prefix("sudo "))
        .map(|line| line.to_string())
}

/// Формирует ecosystem.config.js для PM2
pub fn render_ecosystem_config(app_name: &str, script: &str, cwd: &str) -> String {
    format!(
        r#"module.exports = {{
  apps: [
    {{
      name: '{app_name}',
      script: '{script}',
      cwd: '{cwd}',
      instances: 1,
      autorestart: true,
      max_memory_restart: '300M',
      env: {{
        NODE_ENV: 'production',
      }},
    }},
  ],
}};
"#,
        app_name = app_name,
        script = script,
        cwd = cwd
    )
}

// Возвращает установленную мажорную версию Node.js, если node доступен
async fn installed_node_major() -> Option<u32> {
    let output = Command::new("node").args(["--version"]).output().await.ok()?;

    if !output.status.success() {
        return None;
    }

    node_major_from_version(&String::from_utf8_lossy(&output.stdout))
}

/// Устанавливает Node.js и PM2, настраивает автозапуск PM2
pub async fn setup_node(major: u32, deploy_user: &str, user: &str) -> Result<()> {
    info!("Настройка Node.js {} и PM2...", major);

    // Пропускаем установку, если нужная версия уже стоит
    match installed_node_major().await {
        Some(installed) if installed == major => {
            info!("Node.js {} уже установлен", installed);
        }
        installed => {
            if let Some(installed) = installed {
                info!(
                    "Установлен Node.js {}, требуется {}. Переустановка...",
                    installed, major
                );
            }

            // Подключаем репозиторий NodeSource
            info!("Подключение репозитория NodeSource...");
            let setup_cmd = format!(
                "curl -fsSL https://deb.nodesource.com/setup_{}.x | bash -",
                major
            );

            let output = Command::new("sh")
                .arg("-c")
                .arg(&setup_cmd)
                .output()
                .await
                .context("Не удалось выполнить скрипт настройки NodeSource")?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(anyhow::anyhow!(
                    "Ошибка подключения репозитория NodeSource: {}",
                    stderr
                ));
            }

            crate::utils::install_package("nodejs").await?;
        }
    }

    // Устанавливаем PM2 глобально
    security::execute_command_with_audit(
        "npm",
        &["install", "-g", "pm2"],
        user,
        "Глобальная установка PM2",
    )
    .await?;

    // Настраиваем автозапуск PM2 для пользователя деплоя
    let home_dir = format!("/home/{}", deploy_user);
    let startup_output = security::execute_command_with_audit(
        "pm2",
        &["startup", "systemd", "-u", deploy_user, "--hp", &home_dir],
        user,
        "Генерация команды автозапуска PM2",
    )
    .await?;

    match parse_pm2_startup_command(&startup_output) {
        Some(startup_cmd) => {
            let output = Command::new("sh")
                .arg("-c")
                .arg(&startup_cmd)
                .output()
                .await
                .context("Не удалось выполнить команду автозапуска PM2")?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!("Команда автозапуска PM2 завершилась с ошибкой: {}", stderr);
            } else {
                info!("Автозапуск PM2 настроен для пользователя {}", deploy_user);
            }
        }
        None => {
            // pm2 startup, запущенный от root, может настроить все сам
            info!("pm2 startup не вернул дополнительную команду");
        }
    }

    // Шаблон конфигурации приложения в директории приложений
    let apps_dir = config::get_full_path(deploy_user, config::APPS_DIR);
    let ecosystem_path = format!("{}/ecosystem.config.js", apps_dir);
    let ecosystem = render_ecosystem_config("app", "index.js", &apps_dir);

    fs::create_dir_all(&apps_dir)
        .await
        .with_context(|| format!("Не удалось создать директорию {}", apps_dir))?;
    fs::write(&ecosystem_path, ecosystem)
        .await
        .with_context(|| format!("Не удалось записать файл {}", ecosystem_path))?;

    info!("Создан шаблон конфигурации PM2: {}", ecosystem_path);

    // Логируем событие установки Node.js
    let audit_log = security::AuditLog::new(
        "node_setup",
        user,
        Some(&format!("Install Node.js {} and PM2", major)),
        "success",
        None,
        None,
    );

    security::log_audit_event(audit_log, None).await?;

    info!("Node.js и PM2 успешно настроены");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_major_version() {
        assert_eq!(node_major_from_version("v20.11.1\n"), Some(20));
        assert_eq!(node_major_from_version("v18.0.0"), Some(18));
        assert_eq!(node_major_from_version("not a version"), None);
        assert_eq!(node_major_from_version(""), None);
    }

    #[test]
    fn extracts_pm2_startup_command() {
        let output = r#"[PM2] Init System found: systemd
[PM2] To setup the Startup Script, copy/paste the following command:
sudo env PATH=$PATH:/usr/bin /usr/lib/node_modules/pm2/bin/pm2 startup systemd -u deploy --hp /home/deploy
"#;

        let cmd = parse_pm2_startup_command(output).unwrap();
        assert!(cmd.starts_with("env PATH="));
        assert!(cmd.contains("pm2 startup systemd -u deploy"));
    }

    #[test]
    fn missing_startup_command_is_none() {
        assert_eq!(
            parse_pm2_startup_command("[PM2] Startup already configured\n"),
            None
        );
    }

    #[test]
    fn ecosystem_config_mentions_app() {
        let config = render_ecosystem_config("shop", "server.js", "/home/deploy/apps");
        assert!(config.contains("name: 'shop'"));
        assert!(config.contains("script: 'server.js'"));
        assert!(config.contains("cwd: '/home/deploy/apps'"));
        assert!(config.contains("NODE_ENV: 'production'"));
    }
}
