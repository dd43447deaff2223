use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

mod backup;
mod bash_script;
mod config;
mod diagnostics;
mod logger;
mod mysql;
mod nginx;
mod node;
mod php;
mod redis;
mod security;
mod server;
mod ssl;
mod supervisor;
mod utils;

use config::ServerConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Автоматический режим настройки
    #[arg(short, long)]
    auto: bool,

    /// Имя пользователя деплоя
    #[arg(short, long)]
    user: Option<String>,

    /// SSH-ключ для добавления пользователю
    #[arg(long)]
    ssh_key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Полная инициализация сервера
    Init,
    /// Установка и настройка Nginx
    Nginx,
    /// Установка PHP-FPM с расширениями
    Php,
    /// Установка и настройка MySQL
    Mysql,
    /// Установка и настройка Redis
    Redis,
    /// Установка Node.js и PM2
    Node,
    /// Установка Supervisor
    Supervisor,
    /// Выпуск SSL сертификатов для доменов
    Ssl {
        /// Домен в формате "domain:target" (по умолчанию все домены из конфигурации)
        #[arg(short, long)]
        domain: Option<String>,
    },
    /// Настройка Fail2ban
    Fail2ban,
    /// Сбор диагностического бандла
    Diagnostics,
    /// Конвертация сертификата домена в PFX
    Pfx {
        /// Доменное имя с выпущенным сертификатом
        #[arg(short, long)]
        domain: String,

        /// Путь к создаваемому PFX файлу
        #[arg(short, long)]
        output: Option<String>,

        /// Пароль PFX контейнера (по умолчанию генерируется)
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Генерация bash скриптов обслуживания
    GenerateScripts {
        /// Путь для сохранения скриптов
        #[arg(short, long, default_value = "/usr/local/bin")]
        output_dir: String,

        /// Директория для бэкапов
        #[arg(short, long, default_value = "/var/backups/server")]
        backup_dir: String,
    },
    /// Удаление настроек сервера
    Uninstall,
}

// Проверка прав для команд, изменяющих систему
fn require_root() -> Result<()> {
    if !utils::is_root() {
        return Err(anyhow::anyhow!("Команда должна быть запущена от имени root"));
    }
    Ok(())
}

// Конфигурация для отдельных подкоманд: директория настроек ищется
// в домашней директории пользователя деплоя
fn load_config(deploy_user: &str) -> Result<ServerConfig> {
    ServerConfig::load_or_create(deploy_user)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    // Инициализация логгера
    logger::init()?;

    // Предупреждаем о незавершенной настройке при прерывании
    ctrlc::set_handler(|| {
        eprintln!(
            "Настройка прервана. Частично настроенный сервер можно откатить командой uninstall"
        );
        std::process::exit(130);
    })
    .context("Не удалось установить обработчик прерывания")?;

    info!("Запуск утилиты настройки веб-сервера");

    let deploy_user = cli.user.clone().unwrap_or_else(|| "deploy".to_string());

    match &cli.command {
        Some(Commands::Init) => {
            server::init_server(cli.auto, cli.user, cli.ssh_key, None).await?;
        }
        Some(Commands::Nginx) => {
            require_root()?;
            nginx::setup_nginx("root").await?;
        }
        Some(Commands::Php) => {
            require_root()?;
            let config = load_config(&deploy_user)?;
            php::setup_php(&config.php_version, &config.php_extensions, "root").await?;
        }
        Some(Commands::Mysql) => {
            require_root()?;
            let mut config = load_config(&deploy_user)?;
            mysql::setup_mysql(&mut config, "root").await?;
            config.save_for_user(&deploy_user)?;
        }
        Some(Commands::Redis) => {
            require_root()?;
            let mut config = load_config(&deploy_user)?;
            redis::setup_redis(&mut config, "root").await?;
            config.save_for_user(&deploy_user)?;
        }
        Some(Commands::Node) => {
            require_root()?;
            let config = load_config(&deploy_user)?;
            node::setup_node(config.node_major, &deploy_user, "root").await?;
        }
        Some(Commands::Supervisor) => {
            require_root()?;
            server::setup_supervisor_step(cli.auto, &deploy_user, "root").await?;
        }
        Some(Commands::Ssl { domain }) => {
            require_root()?;
            let config = load_config(&deploy_user)?;

            let domains = match domain {
                Some(entry) if entry.contains(':') => vec![entry.clone()],
                Some(name) => {
                    // Ищем домен среди настроенных
                    let found = config
                        .domains
                        .iter()
                        .find(|entry| entry.starts_with(&format!("{}:", name)))
                        .cloned();

                    match found {
                        Some(entry) => vec![entry],
                        None => {
                            return Err(anyhow::anyhow!(
                                "Домен {} не найден в конфигурации. \
                                 Укажите его в формате domain:target",
                                name
                            ));
                        }
                    }
                }
                None => config.domains.clone(),
            };

            ssl::install_certbot("root").await?;
            server::setup_domains(&domains, &config.admin_email, &config.php_version, "root")
                .await?;
        }
        Some(Commands::Fail2ban) => {
            require_root()?;
            security::setup_fail2ban("root").await?;
        }
        Some(Commands::Diagnostics) => {
            let config = load_config(&deploy_user)?;
            let bundle = diagnostics::collect_diagnostics(&config.php_version, &deploy_user).await?;
            logger::success(&format!("Диагностический бандл: {}", bundle.display()));
        }
        Some(Commands::Pfx {
            domain,
            output,
            password,
        }) => {
            require_root()?;

            if !nginx::is_valid_domain(domain) {
                return Err(anyhow::anyhow!("Некорректное доменное имя: {}", domain));
            }

            let output_path = output
                .clone()
                .unwrap_or_else(|| format!("{}.pfx", domain));

            let password = match password {
                Some(password) => password.clone(),
                None => {
                    let generated = ServerConfig::generate_strong_password(16)?;
                    logger::password_info(&format!(
                        "Сгенерирован пароль PFX контейнера: {}",
                        &generated
                    ));
                    generated
                }
            };

            ssl::convert_to_pfx(domain, &password, &output_path, "root").await?;
            logger::success(&format!("PFX файл создан: {}", output_path));
        }
        Some(Commands::GenerateScripts {
            output_dir,
            backup_dir,
        }) => {
            info!("Генерация bash скриптов...");

            // Формируем пути для скриптов
            let update_script_path = format!("{}/server-update.sh", output_dir);
            let backup_script_path = format!("{}/server-backup.sh", output_dir);

            // Генерируем скрипты
            bash_script::generate_update_script(&update_script_path).await?;
            bash_script::generate_backup_script(&backup_script_path, backup_dir).await?;

            info!("Все скрипты успешно сгенерированы:");
            info!("  - Скрипт обновления: {}", update_script_path);
            info!("  - Скрипт бэкапа: {}", backup_script_path);
        }
        Some(Commands::Uninstall) => {
            require_root()?;
            server::uninstall_server(false).await?;
        }
        None => {
            if cli.auto {
                server::init_server(true, cli.user, cli.ssh_key, None).await?;
            } else {
                warn!("Подкоманда не указана, запускается полная инициализация");
                server::init_server(false, None, None, None).await?;
            }
        }
    }

    Ok(())
}
