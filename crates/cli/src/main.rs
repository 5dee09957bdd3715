use anyhow::Context;
use clap::{Parser, Subcommand};
use lessonbot::channels::TelegramClient;
use lessonbot::config::{self, Config, Secrets};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lessonbot")]
#[command(about = "Lesson notes bot: OCR, summary and archive for photos sent on Telegram", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the webhook server. Secrets are read from the environment (BOT_TOKEN, GEMINI_API_KEY, ...).
    Serve {
        /// Config file path (default: LESSONBOT_CONFIG_PATH or ~/.lessonbot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP port (default: PORT env, then config, then 8080)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Register the webhook URL with Telegram.
    SetWebhook {
        /// Config file path (default: LESSONBOT_CONFIG_PATH or ~/.lessonbot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Public URL of /webhook (default: telegram.webhookUrl from config)
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },

    /// Remove the webhook from Telegram.
    DeleteWebhook {
        /// Config file path (default: LESSONBOT_CONFIG_PATH or ~/.lessonbot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Load config and secrets and print a summary (secrets redacted).
    CheckConfig {
        /// Config file path (default: LESSONBOT_CONFIG_PATH or ~/.lessonbot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("lessonbot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Serve { config, port }) => run_serve(config, port).await,
        Some(Commands::SetWebhook { config, url }) => run_set_webhook(config, url).await,
        Some(Commands::DeleteWebhook { config }) => run_delete_webhook(config).await,
        Some(Commands::CheckConfig { config }) => run_check_config(config),
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn load(config_path: Option<PathBuf>) -> anyhow::Result<(Config, Secrets)> {
    let (config, path) = config::load_config(config_path)?;
    log::debug!("using config {}", path.display());
    let secrets = Secrets::from_env(config.archive.enabled)?;
    Ok((config, secrets))
}

async fn run_serve(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (config, secrets) = load(config_path)?;
    let port = port.unwrap_or_else(|| config::resolve_port(&config));
    log::info!("starting lessonbot on {}:{}", config.server.bind, port);
    lessonbot::gateway::run_gateway(config, secrets, port).await
}

fn telegram_client(config: &Config) -> anyhow::Result<TelegramClient> {
    let token = std::env::var(config::ENV_BOT_TOKEN)
        .ok()
        .filter(|t| !t.trim().is_empty())
        .with_context(|| format!("{} is not set", config::ENV_BOT_TOKEN))?;
    Ok(TelegramClient::new(&config.telegram.api_base, token))
}

async fn run_set_webhook(config_path: Option<PathBuf>, url: Option<String>) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let url = url
        .or_else(|| config.telegram.webhook_url.clone())
        .context("no webhook URL (pass --url or set telegram.webhookUrl)")?;
    let secret = config::resolve_webhook_secret(&config);
    telegram_client(&config)?
        .set_webhook(&url, secret.as_deref())
        .await
        .context("setWebhook")?;
    println!("webhook set to {}", url);
    Ok(())
}

async fn run_delete_webhook(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    telegram_client(&config)?
        .delete_webhook()
        .await
        .context("deleteWebhook")?;
    println!("webhook removed");
    Ok(())
}

fn run_check_config(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    let secrets = Secrets::from_env(config.archive.enabled)?;
    println!("config: {}", path.display());
    println!(
        "listen: {}:{}",
        config.server.bind,
        config::resolve_port(&config)
    );
    println!(
        "webhook: {} (secret {})",
        config.telegram.webhook_url.as_deref().unwrap_or("not set"),
        if config::resolve_webhook_secret(&config).is_some() {
            "set"
        } else {
            "not set"
        }
    );
    println!("gemini model: {}", config.gemini.model);
    match &secrets.archive {
        Some(a) => println!("archive: enabled, document {}", a.document_id),
        None => println!("archive: disabled"),
    }
    println!(
        "debug error replies: {}",
        config::resolve_debug_errors(&config)
    );
    log::debug!("{:?}", secrets);
    Ok(())
}
