// ! Модуль для генерации bash скриптов
// !
// ! Этот модуль содержит функции для создания bash скриптов обслуживания
// ! настроенного сервера: обновление системных пакетов и резервное
// ! копирование баз данных и веб-директорий по расписанию.

use anyhow::{Context, Result};
use log::info;
use std::path::Path;
use tokio::fs;

const BACKUP_CRON_PATH: &str = "/etc/cron.d/server-backup";

/// Формирует содержимое скрипта обновления сервера
pub fn render_update_script() -> String {
    r#"#!/bin/bash

# Автоматически сгенерированный скрипт обновления сервера

set -e

# Проверка наличия прав суперпользователя
if [ "$EUID" -ne 0 ]; then
  echo "Для запуска скрипта необходимы права суперпользователя"
  exit 1
fi

export DEBIAN_FRONTEND=noninteractive

apt-get update
apt-get upgrade -y
apt-get autoremove -y

# Обновление сертификатов и перезагрузка Nginx при необходимости
if command -v certbot >/dev/null 2>&1; then
    certbot renew --quiet --deploy-hook "systemctl reload nginx"
fi

echo "Обновление сервера завершено"
exit 0
"#
    .to_string()
}

/// Формирует содержимое скрипта резервного копирования
///
/// Скрипт выгружает все базы MySQL через mysqldump, архивирует
/// веб-директории и удаляет бекапы старше 14 дней
pub fn render_backup_script(backup_dir: &str) -> String {
    format!(
        r#"#!/bin/bash

# Автоматически сгенерированный скрипт резервного копирования

set -e

# Проверка наличия прав суперпользователя
if [ "$EUID" -ne 0 ]; then
  echo "Для запуска скрипта необходимы права суперпользователя"
  exit 1
fi

BACKUP_DIR="{backup_dir}"
TIMESTAMP="$(date +%Y%m%d%H%M%S)"

mkdir -p "$BACKUP_DIR"

# Резервная копия баз данных
if command -v mysqldump >/dev/null 2>&1; then
    mysqldump --all-databases --single-transaction \
        --defaults-extra-file=/etc/mysql/debian.cnf \
        | gzip > "$BACKUP_DIR/mysql_$TIMESTAMP.sql.gz"
fi

# Резервная копия веб-директорий
if [ -d /var/www ]; then
    tar czf "$BACKUP_DIR/www_$TIMESTAMP.tar.gz" -C / var/www
fi

# Удаление бекапов старше 14 дней
find "$BACKUP_DIR" -type f -mtime +14 -delete

echo "Резервное копирование завершено: $BACKUP_DIR"
exit 0
"#,
        backup_dir = backup_dir
    )
}

// Записывает скрипт и делает его исполняемым
async fn write_script(output_path: &str, contents: String) -> Result<()> {
    // Создаем директорию для скрипта, если она не существует
    if let Some(parent) = Path::new(output_path).parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Не удалось создать директорию {}", parent.display()))?;
        }
    }

    fs::write(output_path, contents)
        .await
        .with_context(|| format!("Не удалось записать скрипт в файл {}", output_path))?;

    // Делаем скрипт исполняемым
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = fs::metadata(output_path)
            .await
            .with_context(|| format!("Не удалось прочитать атрибуты файла {}", output_path))?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(output_path, permissions)
            .await
            .with_context(|| format!("Не удалось сделать скрипт исполняемым: {}", output_path))?;
    }

    Ok(())
}

/// Генерирует bash скрипт обновления сервера
pub async fn generate_update_script(output_path: &str) -> Result<()> {
    info!("Генерация скрипта обновления сервера...");

    write_script(output_path, render_update_script()).await?;

    info!("Скрипт обновления создан: {}", output_path);
    Ok(())
}

/// Генерирует bash скрипт резервного копирования
pub async fn generate_backup_script(output_path: &str, backup_dir: &str) -> Result<()> {
    info!("Генерация скрипта резервного копирования...");

    write_script(output_path, render_backup_script(backup_dir)).await?;

    info!("Скрипт резервного копирования создан: {}", output_path);
    Ok(())
}

/// Подключает скрипт резервного копирования в cron
pub async fn install_backup_cron(script_path: &str) -> Result<()> {
    let cron_content = format!("30 3 * * * root {} >/dev/null 2>&1\n", script_path);

    fs::write(BACKUP_CRON_PATH, cron_content)
        .await
        .with_context(|| format!("Не удалось создать cron-задачу: {}", BACKUP_CRON_PATH))?;

    info!("Ежедневный запуск бекапа подключен: {}", BACKUP_CRON_PATH);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_script_refreshes_packages_and_certs() {
        let script = render_update_script();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("apt-get upgrade -y"));
        assert!(script.contains("certbot renew --quiet"));
    }

    #[test]
    fn backup_script_dumps_databases_and_webroot() {
        let script = render_backup_script("/var/backups/server");
        assert!(script.contains("BACKUP_DIR=\"/var/backups/server\""));
        assert!(script.contains("mysqldump --all-databases"));
        assert!(script.contains("tar czf \"$BACKUP_DIR/www_$TIMESTAMP.tar.gz\""));
        assert!(script.contains("-mtime +14 -delete"));
    }

    #[tokio::test]
    async fn generated_script_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scripts/server-update.sh");
        let path_str = path.to_str().unwrap();

        generate_update_script(path_str).await.unwrap();

        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o755, 0o755);
        }
    }
}
