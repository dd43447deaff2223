use std::{
    fs,
    io::ErrorKind,
    path::Path,
    process::Stdio,
};

use anyhow::{Context, Result};
use dialoguer::{Confirm, Input, Password};
use log::{error, info, warn};
use tokio::process::Command;

use crate::{
    backup, bash_script, config, config::ServerConfig, logger, mysql, nginx, node, php, redis,
    security, ssl, supervisor, utils,
};

const TOTAL_STEPS: usize = 12;

// Модуль для логики удаления сервера
mod uninstall_helpers {
    use super::*;

    /// Извлекает пользователей с домашними директориями из /etc/passwd
    pub fn home_dirs_from_passwd(passwd: &str) -> Vec<(String, String)> {
        passwd
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.split(':').collect();
                if parts.len() > 5 && parts[5].starts_with("/home/") && parts[0] != "root" {
                    Some((parts[0].to_string(), parts[5].to_string()))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Ищет директорию server-settings среди домашних директорий пользователей
    pub fn find_settings_dir() -> Result<String> {
        if let Ok(passwd) = fs::read_to_string("/etc/passwd") {
            for (_, home) in home_dirs_from_passwd(&passwd) {
                let candidate = format!("{}/{}", home, config::SERVER_SETTINGS_DIR);
                if Path::new(&candidate).exists() {
                    return Ok(candidate);
                }
            }
        }

        // Если директория не найдена в домашних директориях, ищем в текущей
        match fs::metadata(config::SERVER_SETTINGS_DIR) {
            Ok(_) => Ok(config::SERVER_SETTINGS_DIR.to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(anyhow::anyhow!(
                "Директория {} не найдена",
                config::SERVER_SETTINGS_DIR
            )),
            Err(e) => Err(anyhow::anyhow!(
                "Ошибка проверки директории {}: {}",
                config::SERVER_SETTINGS_DIR,
                e
            )),
        }
    }

    /// Останавливает службы, установленные при настройке сервера
    pub async fn stop_services(php_version: &str, user: &str) -> Result<()> {
        info!("Остановка служб...");

        let fpm_service = php::fpm_service_name(php_version);
        let services = [
            "nginx",
            fpm_service.as_str(),
            "mysql",
            "redis-server",
            "supervisor",
            "fail2ban",
        ];

        for service in services {
            if let Err(e) = security::execute_command_with_audit(
                "systemctl",
                &["stop", service],
                user,
                &format!("Остановка службы {}", service),
            )
            .await
            {
                warn!("Не удалось остановить службу {}: {}", service, e);
            }
        }

        Ok(())
    }

    /// Отключает настроенные сайты Nginx
    pub async fn remove_sites(domains: &[String], user: &str) -> Result<()> {
        for domain_str in domains {
            if let Ok(domain_config) = nginx::DomainConfig::from_string(domain_str) {
                if let Err(e) = nginx::disable_site(&domain_config.domain, user).await {
                    warn!(
                        "Не удалось отключить сайт {}: {}",
                        domain_config.domain, e
                    );
                }
            }
        }

        Ok(())
    }

    /// Удаляет cron-задачи, созданные при настройке
    pub async fn remove_cron_files() -> Result<()> {
        for cron_file in ["/etc/cron.d/certbot-renewal", "/etc/cron.d/server-backup"] {
            if Path::new(cron_file).exists() {
                if let Err(e) = fs::remove_file(cron_file) {
                    warn!("Не удалось удалить cron-файл {}: {}", cron_file, e);
                } else {
                    info!("Удален cron-файл {}", cron_file);
                }
            }
        }

        Ok(())
    }

    /// Восстанавливает SSH конфигурацию из бекапа
    pub async fn restore_ssh_config(user: &str) -> Result<()> {
        info!("Восстановление SSH конфигурации...");

        let ssh_config_path = "/etc/ssh/sshd_config";
        let backup_path = format!("{}.bak", ssh_config_path);

        if Path::new(&backup_path).exists() {
            // Копируем бекап обратно
            security::execute_command_with_audit(
                "cp",
                &[&backup_path, ssh_config_path],
                user,
                "Восстановление SSH конфигурации из бекапа",
            )
            .await?;

            // Перезапускаем SSH сервис
            security::execute_command_with_audit(
                "systemctl",
                &["restart", "sshd"],
                user,
                "Перезапуск SSH сервиса",
            )
            .await?;

            info!("SSH конфигурация успешно восстановлена");
        } else {
            info!("Бекап SSH конфигурации не найден, пропускаем восстановление");
        }

        Ok(())
    }

    /// Удаляет установленные пакеты
    pub async fn remove_installed_packages(php_version: &str, user: &str) -> Result<()> {
        info!("Удаление установленных пакетов...");

        let fpm_package = format!("php{}-fpm", php_version);
        let packages = [
            "nginx",
            fpm_package.as_str(),
            "mysql-server",
            "redis-server",
            "supervisor",
            "certbot",
            "fail2ban",
        ];

        for pkg in packages {
            if let Err(e) = security::execute_command_with_audit(
                "apt-get",
                &["remove", "-y", pkg],
                user,
                &format!("Удаление пакета {}", pkg),
            )
            .await
            {
                warn!("Ошибка при удалении пакета {}: {}", pkg, e);
            }
        }

        // Очищаем неиспользуемые пакеты
        if let Err(e) = security::execute_command_with_audit(
            "apt-get",
            &["autoremove", "-y"],
            user,
            "Очистка неиспользуемых пакетов",
        )
        .await
        {
            warn!("Ошибка при очистке пакетов: {}", e);
        }

        Ok(())
    }

    /// Удаляет созданного пользователя
    pub async fn remove_created_user(user: &str) -> Result<()> {
        info!("Удаление созданного пользователя...");

        // Получаем список пользователей из /etc/passwd
        let passwd = fs::read_to_string("/etc/passwd")?;

        for (username, _) in home_dirs_from_passwd(&passwd) {
            // Удаляем пользователя и его домашнюю директорию
            if let Err(e) = security::execute_command_with_audit(
                "userdel",
                &["-r", &username],
                user,
                &format!("Удаление пользователя {}", username),
            )
            .await
            {
                warn!("Ошибка при удалении пользователя {}: {}", username, e);
            }
        }

        Ok(())
    }

    /// Удаляет директории, созданные при настройке сервера
    pub async fn remove_server_settings(settings_dir: &str) -> Result<()> {
        info!("Удаление директорий сервера...");

        if !Path::new(settings_dir).exists() {
            info!(
                "Директория {} не найдена, пропускаем удаление",
                settings_dir
            );
            return Ok(());
        }

        // Рекурсивно удаляем директорию настроек
        fs::remove_dir_all(settings_dir)
            .with_context(|| format!("Не удалось удалить директорию {}", settings_dir))?;

        info!("Директории сервера успешно удалены");

        Ok(())
    }
}

/// Изменяет пароль для пользователя root
async fn change_root_password(auto_mode: bool) -> Result<()> {
    info!("Изменение пароля для root пользователя...");

    let password = if auto_mode {
        // В автоматическом режиме генерируем пароль
        let generated_password = ServerConfig::generate_strong_password(12)?;

        logger::password_info(&format!(
            "Сгенерирован надежный пароль для root: {}",
            &generated_password
        ));

        // Пишем пароль в файл для дальнейшего использования
        let password_file = "root_password.txt";
        fs::write(password_file, &generated_password)
            .with_context(|| format!("Не удалось записать пароль в файл {}", password_file))?;

        info!("Пароль root сохранен в файле {}", password_file);

        generated_password
    } else {
        // В ручном режиме запрашиваем пароль у пользователя
        loop {
            let password = Password::new()
                .with_prompt("Введите новый пароль для root (или оставьте пустым для генерации)")
                .allow_empty_password(true)
                .interact()?;

            if password.is_empty() {
                let generated = ServerConfig::generate_strong_password(12)?;
                logger::password_info(&format!("Сгенерирован надежный пароль: {}", &generated));
                break generated;
            }

            // Проверяем надежность пароля
            if let Err(e) = security::check_password_strength(&password) {
                error!("Пароль не соответствует требованиям: {}", e);
                continue;
            }

            // Просим подтвердить пароль
            let confirmation = Password::new()
                .with_prompt("Подтвердите пароль")
                .interact()?;

            if password != confirmation {
                error!("Пароли не совпадают, попробуйте еще раз");
                continue;
            }

            break password;
        }
    };

    // Устанавливаем пароль для root
    let shadow_hash = security::hash_password(&password)?;
    security::execute_command_with_audit(
        "usermod",
        &["-p", &shadow_hash, "root"],
        "root",
        "Изменение пароля root пользователя",
    )
    .await?;

    info!("Пароль для root пользователя успешно изменен");

    Ok(())
}

/// Создает нового пользователя деплоя с правами sudo
///
/// # Arguments
/// * `username` - Имя создаваемого пользователя
/// * `auto_mode` - Режим автоматической настройки
/// * `custom_password` - Опциональный пользовательский пароль
///
/// # Returns
/// * `Result<String>` - Имя созданного пользователя или ошибка
async fn create_user(
    username: &str,
    auto_mode: bool,
    custom_password: Option<String>,
) -> Result<String> {
    info!("Создание пользователя {}...", username);

    // Проверяем существование пользователя
    let user_exists = Command::new("id")
        .args(["-u", username])
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false);

    if user_exists {
        info!("Пользователь {} уже существует", username);
        return Ok(username.to_string());
    }

    // Создаем пользователя
    security::execute_command_with_audit(
        "useradd",
        &["-m", "-s", "/bin/bash", username],
        "root",
        &format!("Создание пользователя {}", username),
    )
    .await?;

    // Устанавливаем пароль для пользователя
    let password = if auto_mode {
        // В автоматическом режиме генерируем пароль
        let generated_password = ServerConfig::generate_strong_password(16)?;

        logger::password_info(&format!(
            "Сгенерирован надежный пароль для {}: {}",
            username, &generated_password
        ));

        // Пишем пароль в файл для дальнейшего использования
        let password_file = format!("{}_password.txt", username);
        fs::write(&password_file, &generated_password)
            .with_context(|| format!("Не удалось записать пароль в файл {}", password_file))?;

        info!(
            "Пароль пользователя {} сохранен в файле {}",
            username, password_file
        );

        generated_password
    } else if let Some(pwd) = custom_password {
        // Проверяем надежность пользовательского пароля
        if let Err(e) = security::check_password_strength(&pwd) {
            return Err(anyhow::anyhow!(
                "Пароль не соответствует требованиям: {}",
                e
            ));
        }
        pwd
    } else {
        // В ручном режиме запрашиваем пароль у пользователя
        loop {
            let password = Password::new()
                .with_prompt(&format!(
                    "Введите пароль для {} (или оставьте пустым для генерации)",
                    username
                ))
                .allow_empty_password(true)
                .interact()?;

            if password.is_empty() {
                let generated = ServerConfig::generate_strong_password(16)?;
                logger::password_info(&format!("Сгенерирован надежный пароль: {}", &generated));
                break generated;
            }

            // Проверяем надежность пароля
            if let Err(e) = security::check_password_strength(&password) {
                error!("Пароль не соответствует требованиям: {}", e);
                continue;
            }

            // Просим подтвердить пароль
            let confirmation = Password::new()
                .with_prompt("Подтвердите пароль")
                .interact()?;

            if password != confirmation {
                error!("Пароли не совпадают, попробуйте еще раз");
                continue;
            }

            break password;
        }
    };

    // Устанавливаем пароль через chpasswd
    let chpasswd_input = format!("{}:{}", username, password);
    let mut child = Command::new("chpasswd")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("Не удалось запустить chpasswd")?;

    if let Some(mut stdin) = child.stdin.take() {
        tokio::io::AsyncWriteExt::write_all(&mut stdin, chpasswd_input.as_bytes())
            .await
            .context("Не удалось передать пароль в chpasswd")?;
    }

    let output = child
        .wait_with_output()
        .await
        .context("Ошибка выполнения chpasswd")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!("Ошибка установки пароля: {}", stderr));
    }

    // Добавляем пользователя в группу sudo
    security::execute_command_with_audit(
        "usermod",
        &["-aG", "sudo", username],
        "root",
        &format!("Добавление пользователя {} в группу sudo", username),
    )
    .await?;

    info!(
        "Пользователь {} успешно создан и добавлен в группу sudo",
        username
    );

    Ok(username.to_string())
}

/// Настраивает SSH доступ для пользователя
///
/// Запрещает вход root и аутентификацию по паролю, добавляет публичный
/// ключ пользователя в authorized_keys
async fn setup_ssh_access(username: &str, ssh_key: Option<&str>, auto_mode: bool) -> Result<()> {
    info!("Настройка SSH доступа для пользователя {}...", username);

    // Создаем бекап файла sshd_config
    let sshd_config_path = "/etc/ssh/sshd_config";
    backup::backup_file(sshd_config_path).await?;
    // Плоский бекап рядом с оригиналом нужен для восстановления при uninstall
    let flat_backup = format!("{}.bak", sshd_config_path);
    if !Path::new(&flat_backup).exists() {
        fs::copy(sshd_config_path, &flat_backup)
            .with_context(|| format!("Не удалось создать бекап {}", flat_backup))?;
    }

    // Читаем текущий конфиг
    let sshd_config = fs::read_to_string(sshd_config_path)
        .with_context(|| format!("Не удалось прочитать файл: {}", sshd_config_path))?;

    // Модифицируем параметры
    let mut new_config = String::new();
    let mut permit_root_login_set = false;
    let mut password_auth_set = false;
    let mut pubkey_auth_set = false;

    for line in sshd_config.lines() {
        if line.starts_with("PermitRootLogin") {
            new_config.push_str("PermitRootLogin no\n");
            permit_root_login_set = true;
        } else if line.starts_with("PasswordAuthentication") {
            new_config.push_str("PasswordAuthentication no\n");
            password_auth_set = true;
        } else if line.starts_with("PubkeyAuthentication") {
            new_config.push_str("PubkeyAuthentication yes\n");
            pubkey_auth_set = true;
        } else if line.starts_with("AuthorizedKeysFile") {
            new_config.push_str("AuthorizedKeysFile .ssh/authorized_keys\n");
        } else {
            new_config.push_str(line);
            new_config.push('\n');
        }
    }

    // Добавляем отсутствующие параметры
    if !permit_root_login_set {
        new_config.push_str("PermitRootLogin no\n");
    }
    if !password_auth_set {
        new_config.push_str("PasswordAuthentication no\n");
    }
    if !pubkey_auth_set {
        new_config.push_str("PubkeyAuthentication yes\n");
    }

    // Записываем новый конфиг
    fs::write(sshd_config_path, new_config)
        .with_context(|| format!("Не удалось записать файл: {}", sshd_config_path))?;

    // Создаем .ssh директорию для пользователя
    let ssh_dir = format!("/home/{}/.ssh", username);
    fs::create_dir_all(&ssh_dir)
        .with_context(|| format!("Не удалось создать директорию: {}", ssh_dir))?;

    // Добавляем SSH ключ, если он предоставлен
    if let Some(key) = ssh_key {
        let auth_keys_file = format!("{}/authorized_keys", ssh_dir);
        fs::write(&auth_keys_file, key)
            .with_context(|| format!("Не удалось записать SSH ключ в файл: {}", auth_keys_file))?;

        info!("SSH ключ добавлен для пользователя {}", username);
    } else if !auto_mode {
        // В ручном режиме запрашиваем SSH ключ
        let ssh_key = Input::<String>::new()
            .with_prompt("Введите публичный SSH ключ для пользователя")
            .allow_empty(true)
            .interact()?;

        if !ssh_key.is_empty() {
            let auth_keys_file = format!("{}/authorized_keys", ssh_dir);
            fs::write(&auth_keys_file, ssh_key).with_context(|| {
                format!("Не удалось записать SSH ключ в файл: {}", auth_keys_file)
            })?;

            info!("SSH ключ добавлен для пользователя {}", username);
        } else {
            warn!("SSH ключ не предоставлен, доступ по паролю будет отключен!");
        }
    }

    // Устанавливаем правильные права на .ssh директорию и файлы
    security::set_permissions(&ssh_dir, "700", username, username).await?;
    let auth_keys_file = format!("{}/authorized_keys", ssh_dir);
    if Path::new(&auth_keys_file).exists() {
        security::set_permissions(&auth_keys_file, "600", username, username).await?;
    }

    // Перезапускаем SSH службу
    utils::systemctl("restart", "sshd").await?;

    // Логируем событие настройки SSH
    let audit_log = security::AuditLog::new(
        "ssh_setup",
        username,
        Some(&format!("Setup SSH access for user {}", username)),
        "success",
        None,
        None,
    );

    security::log_audit_event(audit_log, None).await?;

    info!("SSH доступ успешно настроен для пользователя {}", username);

    Ok(())
}

/// Настраивает домены: конфигурации Nginx, сертификаты и HTTPS
///
/// # Arguments
/// * `domains` - Список доменов в формате "domain:target"
/// * `admin_email` - Email администратора для SSL сертификатов
/// * `php_version` - Версия PHP для fastcgi-сокета
/// * `user` - Имя текущего пользователя (для аудита)
pub async fn setup_domains(
    domains: &[String],
    admin_email: &str,
    php_version: &str,
    user: &str,
) -> Result<()> {
    if domains.is_empty() {
        warn!("Список доменов пуст, пропускаем настройку");
        return Ok(());
    }

    info!("Настройка доменов для Nginx...");

    for domain_str in domains {
        let domain_config = nginx::DomainConfig::from_string(domain_str)
            .with_context(|| format!("Неверный формат конфигурации домена: {}", domain_str))?;

        // Сначала HTTP-конфигурация для прохождения ACME-проверки
        nginx::configure_domain(&domain_config, php_version, user).await?;

        // Выпускаем сертификат и переключаем сайт на HTTPS
        ssl::obtain_certificate(&domain_config.domain, admin_email, user).await?;
        nginx::enable_https(&domain_config, php_version, user).await?;
    }

    // Настраиваем автоматическое обновление сертификатов
    ssl::setup_certbot_renewal(user).await?;

    // Логируем событие настройки доменов
    let audit_log = security::AuditLog::new(
        "domains_setup",
        user,
        Some(&format!("Setup domains: {}", domains.join(", "))),
        "success",
        None,
        None,
    );

    security::log_audit_event(audit_log, None).await?;

    info!("Домены успешно настроены");

    Ok(())
}

/// Устанавливает Supervisor и опционально добавляет программу
pub async fn setup_supervisor_step(auto_mode: bool, deploy_user: &str, user: &str) -> Result<()> {
    supervisor::setup_supervisor(user).await?;

    if auto_mode {
        return Ok(());
    }

    let add_program = Confirm::new()
        .with_prompt("Добавить программу под управление Supervisor?")
        .default(false)
        .interact()?;

    if add_program {
        let name = Input::<String>::new()
            .with_prompt("Имя программы")
            .interact()?;
        let command = Input::<String>::new()
            .with_prompt("Команда запуска")
            .interact()?;
        let directory = Input::<String>::new()
            .with_prompt("Рабочая директория")
            .default(config::get_full_path(deploy_user, config::APPS_DIR))
            .interact()?;

        let program = supervisor::ProgramConfig::new(&name, &command, &directory, deploy_user);
        supervisor::add_program(&program, user).await?;
    }

    Ok(())
}

/// Генерирует скрипты обслуживания в директории настроек
pub async fn setup_maintenance_scripts(deploy_user: &str) -> Result<()> {
    let scripts_dir = config::get_full_path(deploy_user, config::SCRIPTS_DIR);
    let backup_dir = config::get_full_path(deploy_user, config::BACKUP_DIR);

    let update_script = format!("{}/server-update.sh", scripts_dir);
    let backup_script = format!("{}/server-backup.sh", scripts_dir);

    bash_script::generate_update_script(&update_script).await?;
    bash_script::generate_backup_script(&backup_script, &backup_dir).await?;
    bash_script::install_backup_cron(&backup_script).await?;

    Ok(())
}

/// Инициализирует сервер с заданными параметрами
///
/// # Arguments
/// * `auto_mode` - Режим автоматической настройки
/// * `user_name` - Опциональное имя пользователя деплоя
/// * `ssh_key` - Опциональный SSH ключ
/// * `password` - Опциональный пароль пользователя деплоя
///
/// # Returns
/// * `Result<()>` - Успех или ошибка инициализации
pub async fn init_server(
    auto_mode: bool,
    user_name: Option<String>,
    ssh_key: Option<String>,
    password: Option<String>,
) -> Result<()> {
    info!("Начало инициализации сервера...");

    // Проверяем, запущен ли скрипт от имени root
    if !utils::is_root() {
        return Err(anyhow::anyhow!("Скрипт должен быть запущен от имени root"));
    }

    // Обрабатываем ошибки и делаем откат при необходимости
    let result = try_init_server(auto_mode, user_name, ssh_key, password).await;

    if let Err(e) = &result {
        error!("Произошла ошибка при инициализации сервера: {}", e);

        // Спрашиваем пользователя, хочет ли он откатить изменения
        if !auto_mode {
            let rollback = Confirm::new()
                .with_prompt("Произошла ошибка. Хотите откатить все изменения?")
                .default(true)
                .interact()?;

            if rollback {
                info!("Откат изменений...");
                if let Err(rollback_err) = uninstall_server(true).await {
                    error!("Ошибка при откате изменений: {}", rollback_err);
                } else {
                    info!("Изменения успешно откачены.");
                }
            }
        } else {
            // В автоматическом режиме делаем откат автоматически
            info!("Автоматический откат изменений...");
            if let Err(rollback_err) = uninstall_server(true).await {
                error!("Ошибка при откате изменений: {}", rollback_err);
            } else {
                info!("Изменения успешно откачены.");
            }
        }
    }

    result
}

// Основная функция инициализации, выделенная для обработки ошибок
async fn try_init_server(
    auto_mode: bool,
    user_name: Option<String>,
    ssh_key: Option<String>,
    password: Option<String>,
) -> Result<()> {
    // В автоматическом режиме используем переданные параметры или значения по умолчанию
    let (username, ssh_key_str) = if auto_mode {
        (
            user_name.unwrap_or_else(|| "deploy".to_string()),
            ssh_key.clone(),
        )
    } else {
        // В ручном режиме запрашиваем параметры у пользователя
        let username = Input::<String>::new()
            .with_prompt("Введите имя пользователя деплоя")
            .default("deploy".to_string())
            .interact()?;

        let ssh_key_str = ssh_key.clone().or_else(|| {
            Input::<String>::new()
                .with_prompt("Введите публичный SSH ключ для пользователя (можно оставить пустым)")
                .allow_empty(true)
                .interact()
                .ok()
                .filter(|key| !key.is_empty())
        });

        (username, ssh_key_str)
    };

    logger::step(1, TOTAL_STEPS, "Пользователи и SSH доступ");
    change_root_password(auto_mode).await?;
    let user = create_user(&username, auto_mode, password).await?;
    setup_ssh_access(&user, ssh_key_str.as_deref(), auto_mode).await?;

    // Создаем необходимые директории в домашней директории пользователя
    ServerConfig::create_directories(&user)?;

    // Загружаем или создаем конфигурацию
    let mut config = ServerConfig::load_or_create(&user)?;
    config.ensure_encryption_key()?;

    // В ручном режиме уточняем домены и email администратора
    if !auto_mode {
        let domains_input = Input::<String>::new()
            .with_prompt(
                "Введите домены через запятую в формате domain:target \
                 (target: static, php или адрес апстрима; можно оставить пустым)",
            )
            .allow_empty(true)
            .interact()?;

        if !domains_input.is_empty() {
            let domains: Vec<String> = domains_input
                .split(',')
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect();

            // Проверяем формат до начала установки
            for domain_str in &domains {
                nginx::DomainConfig::from_string(domain_str).with_context(|| {
                    format!("Неверный формат конфигурации домена: {}", domain_str)
                })?;
            }

            config.domains = domains;
        }

        let admin_email = Input::<String>::new()
            .with_prompt("Email администратора для SSL сертификатов")
            .default(config.admin_email.clone())
            .interact()?;
        config.admin_email = admin_email;
    }

    logger::step(2, TOTAL_STEPS, "Обновление системы");
    utils::update_system().await?;
    for package in config.packages.clone() {
        utils::install_package(&package).await?;
    }

    logger::step(3, TOTAL_STEPS, "Брандмауэр UFW");
    if config.enable_firewall {
        security::configure_firewall(&config.allowed_ports, &user).await?;
    } else {
        info!("Настройка брандмауэра отключена в конфигурации");
    }

    logger::step(4, TOTAL_STEPS, "Fail2ban");
    security::setup_fail2ban(&user).await?;

    logger::step(5, TOTAL_STEPS, "Nginx");
    nginx::setup_nginx(&user).await?;

    logger::step(6, TOTAL_STEPS, "PHP-FPM");
    php::setup_php(&config.php_version, &config.php_extensions, &user).await?;

    logger::step(7, TOTAL_STEPS, "MySQL");
    mysql::setup_mysql(&mut config, &user).await?;

    logger::step(8, TOTAL_STEPS, "Redis");
    redis::setup_redis(&mut config, &user).await?;

    logger::step(9, TOTAL_STEPS, "Node.js и PM2");
    node::setup_node(config.node_major, &user, &user).await?;

    logger::step(10, TOTAL_STEPS, "Supervisor");
    setup_supervisor_step(auto_mode, &user, &user).await?;

    logger::step(11, TOTAL_STEPS, "Домены и SSL сертификаты");
    ssl::install_certbot(&user).await?;
    setup_domains(&config.domains, &config.admin_email, &config.php_version, &user).await?;

    logger::step(12, TOTAL_STEPS, "Скрипты обслуживания");
    setup_maintenance_scripts(&user).await?;

    // Подчищаем накопившиеся бекапы конфигурационных файлов
    backup::clean_old_backups(10).await?;

    // Сохраняем конфигурацию с зашифрованными паролями
    config.save_for_user(&user)?;

    logger::success("Инициализация сервера успешно завершена");

    Ok(())
}

/// Удаляет все настройки сервера
///
/// Останавливает службы, отключает сайты, восстанавливает SSH конфигурацию,
/// удаляет установленные пакеты и созданных пользователей
///
/// # Arguments
/// * `skip_confirmation` - Не запрашивать подтверждение (откат после ошибки)
pub async fn uninstall_server(skip_confirmation: bool) -> Result<()> {
    info!("Начало удаления настроек сервера...");

    if !skip_confirmation {
        // Получаем подтверждение от пользователя
        let confirmed = Confirm::new()
            .with_prompt(
                "Вы уверены, что хотите удалить все настройки сервера? Это действие необратимо.",
            )
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Удаление отменено");
            return Ok(());
        }
    }

    // Определяем текущего пользователя для логирования
    let current_user = "root"; // Скрипт должен запускаться от имени root

    // Ищем директорию с настройками сервера
    let settings_dir = match uninstall_helpers::find_settings_dir() {
        Ok(dir) => dir,
        Err(e) => {
            warn!("Не удалось найти директорию с настройками сервера: {}", e);
            // Используем значение по умолчанию
            config::SERVER_SETTINGS_DIR.to_string()
        }
    };

    // Загружаем конфигурацию для списка доменов и версии PHP
    let config_path = format!("{}/{}", settings_dir, config::CONFIG_FILE);
    let config = if Path::new(&config_path).exists() {
        ServerConfig::load(&config_path).unwrap_or_default()
    } else {
        ServerConfig::default()
    };

    // Отключаем сайты
    if let Err(e) = uninstall_helpers::remove_sites(&config.domains, current_user).await {
        warn!("Ошибка при отключении сайтов: {}", e);
    }

    // Останавливаем службы
    if let Err(e) = uninstall_helpers::stop_services(&config.php_version, current_user).await {
        warn!("Ошибка при остановке служб: {}", e);
    }

    // Удаляем cron-задачи
    if let Err(e) = uninstall_helpers::remove_cron_files().await {
        warn!("Ошибка при удалении cron-задач: {}", e);
    }

    // Восстанавливаем SSH конфигурацию
    if let Err(e) = uninstall_helpers::restore_ssh_config(current_user).await {
        warn!("Ошибка при восстановлении SSH конфигурации: {}", e);
    }

    // Удаляем установленные пакеты
    if let Err(e) =
        uninstall_helpers::remove_installed_packages(&config.php_version, current_user).await
    {
        warn!("Ошибка при удалении пакетов: {}", e);
    }

    // Удаляем созданного пользователя
    if let Err(e) = uninstall_helpers::remove_created_user(current_user).await {
        warn!("Ошибка при удалении пользователя: {}", e);
    }

    // Удаляем директории с настройками
    if let Err(e) = uninstall_helpers::remove_server_settings(&settings_dir).await {
        warn!("Ошибка при удалении директорий с настройками: {}", e);
    }

    info!("Удаление настроек сервера успешно завершено");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::uninstall_helpers::home_dirs_from_passwd;

    #[test]
    fn extracts_home_users_from_passwd() {
        let passwd = "root:x:0:0:root:/root:/bin/bash\n\
                      daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
                      deploy:x:1000:1000::/home/deploy:/bin/bash\n\
                      www-data:x:33:33:www-data:/var/www:/usr/sbin/nologin\n";

        let users = home_dirs_from_passwd(passwd);
        assert_eq!(
            users,
            vec![("deploy".to_string(), "/home/deploy".to_string())]
        );
    }

    #[test]
    fn root_is_never_listed_for_removal() {
        let passwd = "root:x:0:0:root:/home/root:/bin/bash\n";
        assert!(home_dirs_from_passwd(passwd).is_empty());
    }
}
