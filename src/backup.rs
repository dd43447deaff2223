use anyhow::{Context, Result};
use chrono::Local;
use log::{debug, info, warn};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Директория бекапов по умолчанию (относительно рабочей директории)
pub const DEFAULT_BACKUP_DIR: &str = "server-settings/backups";

/// Создает бекап файла перед его модификацией
pub async fn backup_file<P: AsRef<Path>>(file_path: P) -> Result<PathBuf> {
    backup_file_in(file_path, Path::new(DEFAULT_BACKUP_DIR)).await
}

/// Создает бекап файла в указанной директории бекапов
pub async fn backup_file_in<P: AsRef<Path>>(file_path: P, backup_dir: &Path) -> Result<PathBuf> {
    let path = file_path.as_ref();

    if !path.exists() {
        debug!("Файл {:?} не существует, бекап не требуется", path);
        return Ok(path.to_path_buf());
    }

    let timestamp = Local::now().format("%Y%m%d%H%M%S").to_string();
    fs::create_dir_all(backup_dir).with_context(|| {
        format!(
            "Не удалось создать директорию для бекапов: {:?}",
            backup_dir
        )
    })?;

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Не удалось получить имя файла из пути"))?
        .to_string_lossy();

    let backup_path = backup_dir.join(format!("{}_{}", file_name, timestamp));

    fs::copy(path, &backup_path)
        .with_context(|| format!("Не удалось создать бекап файла {:?}", path))?;

    info!("Создан бекап {:?} -> {:?}", path, backup_path);

    Ok(backup_path)
}

/// Восстанавливает файл из бекапа
pub async fn restore_from_backup<P: AsRef<Path>>(backup_path: P, original_path: P) -> Result<()> {
    let src = backup_path.as_ref();
    let dst = original_path.as_ref();

    if !src.exists() {
        return Err(anyhow::anyhow!("Бекап {:?} не существует", src));
    }

    // Создаем директорию для оригинального файла, если она не существует
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Не удалось создать директорию: {:?}", parent))?;
    }

    fs::copy(src, dst).with_context(|| {
        format!(
            "Не удалось восстановить файл из бекапа {:?} в {:?}",
            src, dst
        )
    })?;

    info!("Файл восстановлен из бекапа {:?} -> {:?}", src, dst);

    Ok(())
}

/// Удаляет старые бекапы (оставляет последние N бекапов для каждого файла)
pub async fn clean_old_backups(keep_last: usize) -> Result<()> {
    clean_old_backups_in(Path::new(DEFAULT_BACKUP_DIR), keep_last).await
}

/// Удаляет старые бекапы в указанной директории
pub async fn clean_old_backups_in(backup_dir: &Path, keep_last: usize) -> Result<()> {
    if !backup_dir.exists() {
        debug!("Директория бекапов не существует, нечего очищать");
        return Ok(());
    }

    // Получаем список всех файлов в директории бекапов
    let entries = fs::read_dir(backup_dir)
        .with_context(|| format!("Не удалось прочитать директорию бекапов: {:?}", backup_dir))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.path())
        .collect::<Vec<_>>();

    // Группируем файлы по основному имени (без временной метки)
    let mut files_by_name = std::collections::HashMap::new();

    for path in entries {
        if let Some(file_name) = path.file_name().and_then(|name| name.to_str()) {
            if let Some(base_name) = file_name.split('_').next() {
                files_by_name
                    .entry(base_name.to_string())
                    .or_insert_with(Vec::new)
                    .push(path.clone());
            }
        }
    }

    // Для каждой группы файлов оставляем только последние keep_last
    for (_name, mut files) in files_by_name {
        if files.len() <= keep_last {
            continue;
        }

        // Сортируем файлы по времени создания (от новых к старым)
        files.sort_by(|a, b| {
            let a_meta = fs::metadata(a);
            let b_meta = fs::metadata(b);

            match (a_meta, b_meta) {
                (Ok(a_meta), Ok(b_meta)) => match (a_meta.created(), b_meta.created()) {
                    (Ok(a_time), Ok(b_time)) => b_time.cmp(&a_time),
                    _ => std::cmp::Ordering::Equal,
                },
                _ => std::cmp::Ordering::Equal,
            }
        });

        // Удаляем старые файлы, оставляя keep_last
        for file in files.iter().skip(keep_last) {
            if let Err(e) = fs::remove_file(file) {
                warn!("Не удалось удалить старый бекап {:?}: {}", file, e);
            } else {
                debug!("Удален старый бекап: {:?}", file);
            }
        }
    }

    info!("Очистка старых бекапов завершена");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backup_copies_file_with_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("redis.conf");
        std::fs::write(&original, "maxmemory 256mb").unwrap();

        let backup_dir = dir.path().join("backups");
        let backup_path = backup_file_in(&original, &backup_dir).await.unwrap();

        assert!(backup_path.exists());
        let name = backup_path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("redis.conf_"));
        assert_eq!(
            std::fs::read_to_string(&backup_path).unwrap(),
            "maxmemory 256mb"
        );
    }

    #[tokio::test]
    async fn missing_file_skips_backup() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("nope.conf");
        let backup_dir = dir.path().join("backups");

        let result = backup_file_in(&original, &backup_dir).await.unwrap();
        assert_eq!(result, original);
        assert!(!backup_dir.exists());
    }

    #[tokio::test]
    async fn restore_overwrites_original() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("sshd.conf");
        let backup = dir.path().join("sshd.conf.bak");
        std::fs::write(&backup, "PermitRootLogin yes").unwrap();

        restore_from_backup(&backup, &original).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&original).unwrap(),
            "PermitRootLogin yes"
        );
    }

    #[tokio::test]
    async fn prune_keeps_requested_count() {
        let dir = tempfile::tempdir().unwrap();
        let backup_dir = dir.path().join("backups");
        std::fs::create_dir_all(&backup_dir).unwrap();

        for i in 0..5 {
            std::fs::write(backup_dir.join(format!("conf_2024010100000{}", i)), "x").unwrap();
        }

        clean_old_backups_in(&backup_dir, 2).await.unwrap();

        let remaining = std::fs::read_dir(&backup_dir).unwrap().count();
        assert_eq!(remaining, 2);
    }
}
