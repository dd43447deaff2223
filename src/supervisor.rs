use anyhow::{Context, Result};
use log::{info, warn};
use std::fs;

use crate::{backup, security, utils};

pub const SUPERVISOR_CONF_DIR: &str = "/etc/supervisor/conf.d";

/// Описание программы под управлением Supervisor
#[derive(Debug, Clone)]
pub struct ProgramConfig {
    pub name: String,
    pub command: String,
    pub directory: String,
    pub user: String,
}

impl ProgramConfig {
    pub fn new(name: &str, command: &str, directory: &str, user: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            directory: directory.to_string(),
            user: user.to_string(),
        }
    }
}

/// Формирует конфигурацию программы для conf.d
pub fn render_program_config(program: &ProgramConfig) -> String {
    format!(
        r#"[program:{name}]
command={command}
directory={directory}
user={user}
autostart=true
autorestart=true
startretries=3
stopasgroup=true
killasgroup=true
stdout_logfile=/var/log/supervisor/{name}.out.log
stderr_logfile=/var/log/supervisor/{name}.err.log
"#,
        name = program.name,
        command = program.command,
        directory = program.directory,
        user = program.user
    )
}

/// Извлекает состояние программы из вывода supervisorctl status
///
/// Строка статуса имеет вид "name  RUNNING   pid 123, uptime 0:00:05"
pub fn parse_program_state(output: &str, name: &str) -> Option<String> {
    output
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .find(|line| line.split_whitespace().next() == Some(name))
        .and_then(|line| line.split_whitespace().nth(1))
        .map(|state| state.to_string())
}

/// Устанавливает Supervisor
pub async fn setup_supervisor(user: &str) -> Result<()> {
    info!("Настройка Supervisor...");

    utils::install_package("supervisor").await?;
    utils::enable_and_start("supervisor").await?;

    // Логируем событие установки Supervisor
    let audit_log = security::AuditLog::new(
        "supervisor_setup",
        user,
        Some("Install and enable supervisor"),
        "success",
        None,
        None,
    );

    security::log_audit_event(audit_log, None).await?;

    info!("Supervisor успешно установлен");

    Ok(())
}

/// Добавляет программу под управление Supervisor
pub async fn add_program(program: &ProgramConfig, user: &str) -> Result<()> {
    info!("Добавление программы {} в Supervisor...", program.name);

    let conf_path = format!("{}/{}.conf", SUPERVISOR_CONF_DIR, program.name);

    backup::backup_file(&conf_path).await?;

    fs::write(&conf_path, render_program_config(program))
        .with_context(|| format!("Не удалось записать файл {}", conf_path))?;

    // Применяем новую конфигурацию
    security::execute_command_with_audit(
        "supervisorctl",
        &["reread"],
        user,
        "Перечитывание конфигурации Supervisor",
    )
    .await?;

    security::execute_command_with_audit(
        "supervisorctl",
        &["update"],
        user,
        "Применение конфигурации Supervisor",
    )
    .await?;

    // Проверяем состояние программы
    let status_output = security::execute_command_with_audit(
        "supervisorctl",
        &["status", &program.name],
        user,
        &format!("Проверка состояния программы {}", program.name),
    )
    .await
    .unwrap_or_default();

    match parse_program_state(&status_output, &program.name) {
        Some(state) if state == "RUNNING" || state == "STARTING" => {
            info!("Программа {} запущена ({})", program.name, state);
        }
        Some(state) => {
            warn!(
                "Программа {} в неожиданном состоянии: {}",
                program.name, state
            );
        }
        None => {
            warn!(
                "Не удалось определить состояние программы {}",
                program.name
            );
        }
    }

    info!("Программа {} добавлена в Supervisor", program.name);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_config_renders_ini_section() {
        let program = ProgramConfig::new(
            "worker",
            "/usr/bin/php /home/deploy/apps/artisan queue:work",
            "/home/deploy/apps",
            "deploy",
        );
        let conf = render_program_config(&program);

        assert!(conf.starts_with("[program:worker]"));
        assert!(conf.contains("command=/usr/bin/php /home/deploy/apps/artisan queue:work"));
        assert!(conf.contains("user=deploy"));
        assert!(conf.contains("autorestart=true"));
        assert!(conf.contains("stdout_logfile=/var/log/supervisor/worker.out.log"));
    }

    #[test]
    fn parses_program_state_from_status() {
        let output = "worker    RUNNING   pid 1234, uptime 0:00:05\nother    STOPPED   Not started\n";

        assert_eq!(
            parse_program_state(output, "worker"),
            Some("RUNNING".to_string())
        );
        assert_eq!(
            parse_program_state(output, "other"),
            Some("STOPPED".to_string())
        );
        assert_eq!(parse_program_state(output, "missing"), None);
    }
}
