use anyhow::{Context, Result};
use chrono::Local;
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
};
use tokio::process::Command;

use crate::{config, php, security};

/// Состояние службы по данным systemctl is-active
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Active,
    Inactive,
    Failed,
    Unknown(String),
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Active => write!(f, "active"),
            ServiceState::Inactive => write!(f, "inactive"),
            ServiceState::Failed => write!(f, "failed"),
            ServiceState::Unknown(raw) => write!(f, "unknown ({})", raw),
        }
    }
}

/// Разбирает вывод systemctl is-active
pub fn parse_service_state(output: &str) -> ServiceState {
    match output.trim() {
        "active" => ServiceState::Active,
        "inactive" => ServiceState::Inactive,
        "failed" => ServiceState::Failed,
        other => ServiceState::Unknown(other.to_string()),
    }
}

/// Отчет о состоянии одной службы
#[derive(Debug, Clone)]
pub struct ServiceReport {
    pub name: String,
    pub state: ServiceState,
}

/// Список служб, за которыми следит утилита
pub fn managed_services(php_version: &str) -> Vec<String> {
    vec![
        "nginx".to_string(),
        php::fpm_service_name(php_version),
        "mysql".to_string(),
        "redis-server".to_string(),
        "supervisor".to_string(),
        "fail2ban".to_string(),
        "ssh".to_string(),
    ]
}

/// Формирует сводный отчет диагностики
pub fn render_summary(timestamp: &str, services: &[ServiceReport]) -> String {
    let mut report = String::new();

    report.push_str("ДИАГНОСТИЧЕСКИЙ ОТЧЕТ СЕРВЕРА\n");
    report.push_str(&format!("Дата: {}\n\n", timestamp));
    report.push_str("Состояние служб:\n");

    for service in services {
        let marker = if service.state == ServiceState::Active {
            "[OK]  "
        } else {
            "[FAIL]"
        };
        report.push_str(&format!("  {} {} - {}\n", marker, service.name, service.state));
    }

    let failed = services
        .iter()
        .filter(|s| s.state != ServiceState::Active)
        .count();

    report.push('\n');
    if failed == 0 {
        report.push_str("Все службы работают.\n");
    } else {
        report.push_str(&format!("Неактивных служб: {}\n", failed));
    }

    report
}

/// Вычисляет SHA-256 от байтов в шестнадцатеричном виде
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

// Пробы, результат каждой сохраняется в отдельный файл бандла
fn probes() -> Vec<(&'static str, &'static str, Vec<&'static str>)> {
    vec![
        ("nginx_version.txt", "nginx", vec!["-v"]),
        ("nginx_config_test.txt", "nginx", vec!["-t"]),
        ("php_version.txt", "php", vec!["-v"]),
        ("mysql_version.txt", "mysql", vec!["--version"]),
        ("redis_version.txt", "redis-server", vec!["--version"]),
        ("node_version.txt", "node", vec!["--version"]),
        ("disk_usage.txt", "df", vec!["-h"]),
        ("memory.txt", "free", vec!["-m"]),
        ("listening_sockets.txt", "ss", vec!["-tulpn"]),
        ("ufw_status.txt", "ufw", vec!["status", "verbose"]),
        (
            "nginx_error_log.txt",
            "tail",
            vec!["-n", "200", "/var/log/nginx/error.log"],
        ),
        (
            "mysql_error_log.txt",
            "tail",
            vec!["-n", "200", "/var/log/mysql/error.log"],
        ),
        (
            "fail2ban_log.txt",
            "tail",
            vec!["-n", "200", "/var/log/fail2ban.log"],
        ),
    ]
}

// Выполняет пробу и возвращает объединенный вывод
// Неудачная проба не прерывает сбор диагностики
async fn run_probe(command: &str, args: &[&str]) -> String {
    match Command::new(command).args(args).output().await {
        Ok(output) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.is_empty() {
                combined.push_str(&stderr);
            }
            combined
        }
        Err(e) => format!("проба не выполнена: {}\n", e),
    }
}

/// Собирает диагностический бандл
///
/// Каждая проба пишется в отдельный файл, затем директория упаковывается
/// в tar.gz с контрольной суммой SHA-256 рядом
pub async fn collect_diagnostics(php_version: &str, user: &str) -> Result<PathBuf> {
    info!("Сбор диагностики сервера...");

    let timestamp = Local::now().format("%Y%m%d%H%M%S").to_string();
    let diagnostics_root = config::get_full_path(user, config::DIAGNOSTICS_DIR);
    let bundle_name = format!("diag_{}", timestamp);
    let bundle_dir = format!("{}/{}", diagnostics_root, bundle_name);

    fs::create_dir_all(&bundle_dir)
        .with_context(|| format!("Не удалось создать директорию {}", bundle_dir))?;

    // Выполняем пробы
    for (file_name, command, args) in probes() {
        let contents = run_probe(command, &args).await;
        let probe_path = format!("{}/{}", bundle_dir, file_name);

        if let Err(e) = fs::write(&probe_path, contents) {
            warn!("Не удалось записать файл пробы {}: {}", probe_path, e);
        }
    }

    // Собираем состояние служб
    let mut services = Vec::new();
    for service in managed_services(php_version) {
        let output = run_probe("systemctl", &["is-active", &service]).await;
        services.push(ServiceReport {
            name: service,
            state: parse_service_state(&output),
        });
    }

    let summary = render_summary(&Local::now().format("%Y-%m-%d %H:%M:%S").to_string(), &services);
    fs::write(format!("{}/summary.txt", bundle_dir), &summary)
        .with_context(|| "Не удалось записать сводный отчет")?;

    println!("{}", summary);

    // Упаковываем бандл
    let archive_path = format!("{}/{}.tar.gz", diagnostics_root, bundle_name);
    let tar_output = Command::new("tar")
        .args(["czf", &archive_path, "-C", &diagnostics_root, &bundle_name])
        .output()
        .await
        .context("Не удалось запустить tar")?;

    if !tar_output.status.success() {
        let stderr = String::from_utf8_lossy(&tar_output.stderr);
        return Err(anyhow::anyhow!("Ошибка упаковки бандла: {}", stderr));
    }

    // Контрольная сумма архива
    let archive_bytes = fs::read(&archive_path)
        .with_context(|| format!("Не удалось прочитать архив {}", archive_path))?;
    let checksum = sha256_hex(&archive_bytes);

    let checksum_path = format!("{}.sha256", archive_path);
    let archive_file_name = Path::new(&archive_path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| archive_path.clone());
    fs::write(&checksum_path, format!("{}  {}\n", checksum, archive_file_name))
        .with_context(|| format!("Не удалось записать контрольную сумму {}", checksum_path))?;

    // Логируем событие сбора диагностики
    let audit_log = security::AuditLog::new(
        "diagnostics_bundle",
        user,
        Some(&format!("Collect diagnostics bundle {}", bundle_name)),
        "success",
        None,
        None,
    );

    security::log_audit_event(audit_log, None).await?;

    info!("Диагностический бандл создан: {}", archive_path);

    Ok(PathBuf::from(archive_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_states() {
        assert_eq!(parse_service_state("active\n"), ServiceState::Active);
        assert_eq!(parse_service_state("inactive"), ServiceState::Inactive);
        assert_eq!(parse_service_state("failed\n"), ServiceState::Failed);
        assert_eq!(
            parse_service_state("activating"),
            ServiceState::Unknown("activating".to_string())
        );
    }

    #[test]
    fn managed_services_follow_php_version() {
        let services = managed_services("8.2");
        assert!(services.contains(&"php8.2-fpm".to_string()));
        assert!(services.contains(&"nginx".to_string()));
        assert!(services.contains(&"fail2ban".to_string()));
    }

    #[test]
    fn summary_marks_failed_services() {
        let services = vec![
            ServiceReport {
                name: "nginx".to_string(),
                state: ServiceState::Active,
            },
            ServiceReport {
                name: "mysql".to_string(),
                state: ServiceState::Failed,
            },
        ];

        let summary = render_summary("2026-01-01 00:00:00", &services);
        assert!(summary.contains("[OK]   nginx - active"));
        assert!(summary.contains("[FAIL] mysql - failed"));
        assert!(summary.contains("Неактивных служб: 1"));
    }

    #[test]
    fn summary_reports_all_healthy() {
        let services = vec![ServiceReport {
            name: "nginx".to_string(),
            state: ServiceState::Active,
        }];

        let summary = render_summary("2026-01-01 00:00:00", &services);
        assert!(summary.contains("Все службы работают."));
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
