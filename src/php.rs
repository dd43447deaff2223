use anyhow::{Context, Result};
use log::{info, warn};
use std::{fs, path::Path};

use crate::{backup, security, utils};

// Репозиторий с актуальными сборками PHP
const ONDREJ_PPA: &str = "ppa:ondrej/php";
const APT_SOURCES_DIR: &str = "/etc/apt/sources.list.d";

/// Имя службы PHP-FPM для версии
pub fn fpm_service_name(version: &str) -> String {
    format!("php{}-fpm", version)
}

/// Путь к конфигурации пула www для версии
pub fn pool_config_path(version: &str) -> String {
    format!("/etc/php/{}/fpm/pool.d/www.conf", version)
}

/// Список пакетов PHP для установки
pub fn package_names(version: &str, extensions: &[String]) -> Vec<String> {
    let mut packages = vec![format!("php{}-fpm", version), format!("php{}-cli", version)];

    for ext in extensions {
        packages.push(format!("php{}-{}", version, ext));
    }

    packages
}

/// Извлекает объем памяти в мегабайтах из содержимого /proc/meminfo
pub fn parse_mem_total_mb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

/// Подбирает pm.max_children под объем памяти сервера
///
/// Считаем примерно 64 МБ на воркер, от 4 до 50 воркеров
pub fn max_children_for_mem(mem_mb: u64) -> u32 {
    ((mem_mb / 64) as u32).clamp(4, 50)
}

/// Формирует конфигурацию пула PHP-FPM
pub fn render_pool_config(version: &str, max_children: u32) -> String {
    let start_servers = (max_children / 4).max(2);
    let max_spare = (max_children / 2).max(start_servers);

    format!(
        r#"[www]
user = www-data
group = www-data

listen = /run/php/php{version}-fpm.sock
listen.owner = www-data
listen.group = www-data

pm = dynamic
pm.max_children = {max_children}
pm.start_servers = {start_servers}
pm.min_spare_servers = {start_servers}
pm.max_spare_servers = {max_spare}
pm.max_requests = 500
"#,
        version = version,
        max_children = max_children,
        start_servers = start_servers,
        max_spare = max_spare
    )
}

// Проверяет, подключен ли репозиторий ondrej/php
fn has_ondrej_repo() -> bool {
    let entries = match fs::read_dir(APT_SOURCES_DIR) {
        Ok(entries) => entries,
        Err(_) => return false,
    };

    entries
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.file_name().to_string_lossy().contains("ondrej"))
}

/// Устанавливает PHP-FPM с расширениями и настраивает пул
pub async fn setup_php(version: &str, extensions: &[String], user: &str) -> Result<()> {
    info!("Настройка PHP {} с FPM...", version);

    // Подключаем репозиторий ondrej/php, если он еще не подключен
    if has_ondrej_repo() {
        info!("Репозиторий {} уже подключен", ONDREJ_PPA);
    } else {
        info!("Подключение репозитория {}...", ONDREJ_PPA);
        security::execute_command_with_audit(
            "add-apt-repository",
            &["-y", ONDREJ_PPA],
            user,
            "Подключение репозитория ondrej/php",
        )
        .await?;

        utils::update_package_lists().await?;
    }

    // Устанавливаем PHP-FPM и расширения
    for package in package_names(version, extensions) {
        utils::install_package(&package).await?;
    }

    // Настраиваем пул под доступную память
    let mem_mb = fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|meminfo| parse_mem_total_mb(&meminfo))
        .unwrap_or(1024);
    let max_children = max_children_for_mem(mem_mb);

    info!(
        "Настройка пула PHP-FPM: {} МБ памяти, pm.max_children = {}",
        mem_mb, max_children
    );

    let pool_path = pool_config_path(version);
    if Path::new(&pool_path).exists() {
        backup::backup_file(&pool_path).await?;
    } else {
        warn!("Файл пула {} не найден, будет создан заново", pool_path);
    }

    fs::write(&pool_path, render_pool_config(version, max_children))
        .with_context(|| format!("Не удалось записать файл пула {}", pool_path))?;

    // Перезапускаем FPM с новой конфигурацией
    let service = fpm_service_name(version);
    utils::enable_and_start(&service).await?;

    // Логируем событие установки PHP
    let audit_log = security::AuditLog::new(
        "php_setup",
        user,
        Some(&format!("Install PHP {} with FPM pool tuning", version)),
        "success",
        None,
        None,
    );

    security::log_audit_event(audit_log, None).await?;

    info!("PHP {} успешно настроен", version);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_list_includes_fpm_and_extensions() {
        let extensions = vec!["mysql".to_string(), "redis".to_string()];
        let packages = package_names("8.3", &extensions);

        assert!(packages.contains(&"php8.3-fpm".to_string()));
        assert!(packages.contains(&"php8.3-cli".to_string()));
        assert!(packages.contains(&"php8.3-mysql".to_string()));
        assert!(packages.contains(&"php8.3-redis".to_string()));
    }

    #[test]
    fn parses_mem_total_from_meminfo() {
        let meminfo = "MemTotal:        4046436 kB\nMemFree:          271552 kB\n";
        assert_eq!(parse_mem_total_mb(meminfo), Some(3951));
        assert_eq!(parse_mem_total_mb("MemFree: 100 kB\n"), None);
    }

    #[test]
    fn max_children_clamped_to_sane_range() {
        assert_eq!(max_children_for_mem(128), 4);
        assert_eq!(max_children_for_mem(1024), 16);
        assert_eq!(max_children_for_mem(65536), 50);
    }

    #[test]
    fn pool_config_references_version_socket() {
        let pool = render_pool_config("8.3", 16);
        assert!(pool.contains("listen = /run/php/php8.3-fpm.sock"));
        assert!(pool.contains("pm.max_children = 16"));
        assert!(pool.contains("pm.start_servers = 4"));
        assert!(pool.contains("pm.max_spare_servers = 8"));
    }
}
