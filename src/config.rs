use std::{
    fs::{self, create_dir_all, File},
    io::{Read, Write},
    path::Path,
};

use anyhow::{Context, Result};
use base64::{decode, encode};
use log::{debug, info};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Используем импорты aes-gcm более структурированно
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
// Используем OsRng из rand
use rand::rngs::OsRng;

// Константы путей настроек сервера
pub const SERVER_SETTINGS_DIR: &str = "server-settings";
pub const CERTBOT_WEBROOT_DIR: &str = "certbot/www";
pub const DIAGNOSTICS_DIR: &str = "diagnostics";
pub const SCRIPTS_DIR: &str = "scripts";
pub const APPS_DIR: &str = "apps";
pub const BACKUP_DIR: &str = "backups";
pub const AUDIT_DIR: &str = "audit";
pub const CONFIG_FILE: &str = "config.json";

/// Получает полный путь к директории настроек сервера
pub fn get_settings_dir(user: &str) -> String {
    format!("/home/{}/{}", user, SERVER_SETTINGS_DIR)
}

/// Получает полный путь к поддиректории в директории настроек
pub fn get_full_path(user: &str, subdir: &str) -> String {
    format!("/home/{}/{}/{}", user, SERVER_SETTINGS_DIR, subdir)
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Ошибка шифрования: {0}")]
    EncryptionError(String),
    #[error("Ошибка чтения конфигурации: {0}")]
    ReadError(String),
    #[error("Ошибка записи конфигурации: {0}")]
    WriteError(String),
    #[error("Ошибка валидации пароля: {0}")]
    PasswordValidation(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub log_level: String,
    /// Домены в формате "domain:target", где target - адрес апстрима,
    /// "static" для статического сайта или "php" для PHP-FPM сайта
    pub domains: Vec<String>,
    pub admin_email: String,
    pub packages: Vec<String>,
    pub php_version: String,
    pub php_extensions: Vec<String>,
    pub mysql_database: String,
    pub mysql_user: String,
    /// Пароли хранятся зашифрованными AES-GCM, если включено шифрование
    pub mysql_root_password: Option<String>,
    pub mysql_app_password: Option<String>,
    pub redis_password: Option<String>,
    pub redis_maxmemory_mb: u64,
    pub node_major: u32,
    pub encryption_key: Option<String>,
    pub encrypt_sensitive_data: bool,
    pub enable_firewall: bool,
    pub allowed_ports: Vec<u16>,
    pub is_audit_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            domains: vec![],
            admin_email: "admin@example.com".to_string(),
            packages: vec![
                "apt-transport-https".to_string(),
                "ca-certificates".to_string(),
                "curl".to_string(),
                "gnupg".to_string(),
                "lsb-release".to_string(),
                "software-properties-common".to_string(),
                "ufw".to_string(),
                "tar".to_string(),
            ],
            php_version: "8.3".to_string(),
            php_extensions: vec![
                "mysql".to_string(),
                "redis".to_string(),
                "curl".to_string(),
                "mbstring".to_string(),
                "xml".to_string(),
                "zip".to_string(),
                "gd".to_string(),
                "intl".to_string(),
            ],
            mysql_database: "app".to_string(),
            mysql_user: "app".to_string(),
            mysql_root_password: None,
            mysql_app_password: None,
            redis_password: None,
            redis_maxmemory_mb: 256,
            node_major: 20,
            encryption_key: None,
            encrypt_sensitive_data: true,
            enable_firewall: true,
            allowed_ports: vec![22, 80, 443],
            is_audit_enabled: true,
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Конфигурационный файл не найден, создаем по умолчанию");
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let mut file = File::open(path)
            .with_context(|| format!("Не удалось открыть файл конфигурации: {:?}", path))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_json::from_str(&contents).with_context(|| {
            format!(
                "Не удалось десериализовать конфигурацию из файла: {:?}",
                path
            )
        })
    }

    /// Загружает конфигурацию из директории настроек пользователя
    pub fn load_or_create(user: &str) -> Result<Self> {
        let path = format!("{}/{}", get_settings_dir(user), CONFIG_FILE);
        Self::load(path)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .with_context(|| "Не удалось сериализовать конфигурацию в JSON")?;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Не удалось создать директорию: {:?}", parent))?;
        }

        let mut file = File::create(path)
            .with_context(|| format!("Не удалось создать файл конфигурации: {:?}", path))?;
        file.write_all(json.as_bytes())
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;

        info!("Конфигурация сохранена в {:?}", path);
        Ok(())
    }

    /// Сохраняет конфигурацию в директорию настроек пользователя
    pub fn save_for_user(&self, user: &str) -> Result<()> {
        let path = format!("{}/{}", get_settings_dir(user), CONFIG_FILE);
        self.save(path)
    }

    /// Создает ключ шифрования, если он еще не задан
    pub fn ensure_encryption_key(&mut self) -> Result<()> {
        if self.encryption_key.is_some() {
            return Ok(());
        }

        let key_bytes = OsRng.gen::<[u8; 32]>();
        self.encryption_key = Some(encode(key_bytes));
        debug!("Сгенерирован новый ключ шифрования конфигурации");

        Ok(())
    }

    /// Шифрует строку с использованием AES-GCM
    pub fn encrypt_string(&self, plaintext: &str) -> Result<String> {
        if !self.encrypt_sensitive_data {
            return Ok(plaintext.to_string());
        }

        let key_string = self
            .encryption_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Encryption key is not set"))?;

        // Расшифровываем ключ из base64
        let key_bytes = decode(&key_string)
            .with_context(|| "Не удалось декодировать ключ шифрования из Base64")?;

        // Преобразуем байты в ключ AES-256-GCM
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);

        // Создаем шифр
        let cipher = Aes256Gcm::new(key);

        // Генерируем случайный nonce
        let nonce_bytes = OsRng.gen::<[u8; 12]>(); // 96 бит
        let nonce = Nonce::from_slice(&nonce_bytes);

        // Шифруем
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| ConfigError::EncryptionError(e.to_string()))?;

        // Комбинируем nonce и шифротекст для хранения
        let mut result = Vec::new();
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(encode(result))
    }

    /// Дешифрует строку, зашифрованную с помощью AES-GCM
    pub fn decrypt_string(&self, encrypted: &str) -> Result<String> {
        if !self.encrypt_sensitive_data {
            return Ok(encrypted.to_string());
        }

        let key_string = self
            .encryption_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Encryption key is not set"))?;

        // Расшифровываем ключ и шифротекст из base64
        let key_bytes = decode(&key_string)
            .with_context(|| "Не удалось декодировать ключ шифрования из Base64")?;
        let all_bytes =
            decode(encrypted).with_context(|| "Не удалось декодировать Base64 данные")?;

        if all_bytes.len() < 12 {
            return Err(anyhow::anyhow!("Некорректный формат зашифрованных данных"));
        }

        // Извлекаем nonce и шифротекст
        let nonce_bytes = &all_bytes[..12];
        let ciphertext = &all_bytes[12..];

        // Преобразуем байты в ключ и nonce для AES-256-GCM
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        let nonce = Nonce::from_slice(nonce_bytes);

        // Создаем шифр
        let cipher = Aes256Gcm::new(key);

        // Расшифровываем
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| ConfigError::EncryptionError(e.to_string()))?;

        String::from_utf8(plaintext)
            .with_context(|| "Не удалось преобразовать расшифрованные данные в строку")
    }

    /// Создает директории, необходимые для работы
    pub fn create_directories(user: &str) -> Result<()> {
        let settings_dir = get_settings_dir(user);

        // Создаем основную директорию
        create_dir_all(&settings_dir)
            .with_context(|| format!("Не удалось создать директорию {}", settings_dir))?;

        // Создаем поддиректории
        let dirs = [
            get_full_path(user, CERTBOT_WEBROOT_DIR),
            get_full_path(user, DIAGNOSTICS_DIR),
            get_full_path(user, SCRIPTS_DIR),
            get_full_path(user, APPS_DIR),
            get_full_path(user, BACKUP_DIR),
            get_full_path(user, AUDIT_DIR),
        ];

        for dir in &dirs {
            create_dir_all(dir)
                .with_context(|| format!("Не удалось создать директорию {}", dir))?;
            debug!("Создана директория: {}", dir);
        }

        Ok(())
    }

    /// Генерирует надежный пароль
    pub fn generate_strong_password(length: usize) -> Result<String> {
        if length < 8 {
            return Err(ConfigError::PasswordValidation(
                "Длина пароля должна быть не менее 8 символов".to_string(),
            )
            .into());
        }

        let mut rng = thread_rng();
        let password: String = (0..length)
            .map(|_| {
                let char_type = rng.gen_range(0..3);
                match char_type {
                    0 => rng.gen_range(b'A'..=b'Z') as char, // Прописные
                    1 => rng.gen_range(b'a'..=b'z') as char, // Строчные
                    _ => rng.gen_range(b'0'..=b'9') as char, // Цифры
                }
            })
            .collect();

        // Проверяем, что пароль содержит все необходимые типы символов
        let has_uppercase = password.chars().any(|c| c.is_uppercase());
        let has_lowercase = password.chars().any(|c| c.is_lowercase());
        let has_digit = password.chars().any(|c| c.is_digit(10));

        if has_uppercase && has_lowercase && has_digit {
            Ok(password)
        } else {
            // Повторяем генерацию, если не удовлетворяет требованиям
            Self::generate_strong_password(length)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_base_packages() {
        let config = ServerConfig::default();
        assert!(config.packages.contains(&"ufw".to_string()));
        assert!(config.packages.contains(&"curl".to_string()));
        assert_eq!(config.allowed_ports, vec![22, 80, 443]);
        assert!(config.encrypt_sensitive_data);
    }

    #[test]
    fn generated_password_satisfies_rules() {
        let password = ServerConfig::generate_strong_password(16).unwrap();
        assert_eq!(password.len(), 16);
        assert!(password.chars().any(|c| c.is_uppercase()));
        assert!(password.chars().any(|c| c.is_lowercase()));
        assert!(password.chars().any(|c| c.is_digit(10)));
    }

    #[test]
    fn short_password_length_rejected() {
        assert!(ServerConfig::generate_strong_password(4).is_err());
    }

    #[test]
    fn encrypt_and_decrypt_secret() {
        let mut config = ServerConfig::default();
        config.ensure_encryption_key().unwrap();

        let encrypted = config.encrypt_string("Secret123").unwrap();
        assert_ne!(encrypted, "Secret123");
        assert_eq!(config.decrypt_string(&encrypted).unwrap(), "Secret123");
    }

    #[test]
    fn encryption_disabled_passes_through() {
        let mut config = ServerConfig::default();
        config.encrypt_sensitive_data = false;

        let value = config.encrypt_string("plain").unwrap();
        assert_eq!(value, "plain");
    }

    #[test]
    fn load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = ServerConfig::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.php_version, "8.3");

        // Повторная загрузка читает уже существующий файл
        let reloaded = ServerConfig::load(&path).unwrap();
        assert_eq!(reloaded.mysql_database, config.mysql_database);
    }
}
