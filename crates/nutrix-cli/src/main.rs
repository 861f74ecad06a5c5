//! Nutrix CLI
//!
//! Command-line entry point for the Nutrix bot

mod logging;

use anyhow::Result;
use clap::Parser;
use nutrix_config::Config;
use nutrix_core::Runtime;
use nutrix_storage::Storage;
use std::path::{Path, PathBuf};
use tracing::info;

const EXAMPLE_CONFIG: &str = include_str!("../../../config/config.example.toml");

#[derive(Parser)]
#[command(name = "nutrix")]
#[command(about = "Telegram bot for photo-based nutrition tracking", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (falls back to core.log_level from the config)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match load_config(cli.config.clone())? {
        Some(config) => config,
        None => return Ok(()),
    };

    let data_dir = get_data_dir(&config);
    std::fs::create_dir_all(&data_dir)?;

    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let log_level = resolve_log_level(cli.log_level.as_deref(), &config);
    let _logging_guard = logging::init_logging(&log_dir, &log_level)?;

    let db_path = data_dir.join("nutrix.db");
    let storage = Storage::new(&db_path)?;
    let runtime = Runtime::new(config, storage)?;
    info!("Starting Nutrix runtime in foreground...");
    runtime.run().await
}

/// Loads the config from the explicit path or the default location. When the
/// default path does not exist yet, writes the bundled example there and
/// returns `None` so the first run prints setup instructions instead of an
/// error.
fn load_config(config_path: Option<String>) -> Result<Option<Config>> {
    if let Some(path) = config_path {
        return Ok(Some(Config::load(&path)?));
    }
    let Some(default_path) = Config::default_path() else {
        anyhow::bail!("No config file found")
    };
    if default_path.exists() {
        return Ok(Some(Config::load(&default_path)?));
    }
    write_example_config(&default_path)?;
    println!("Configuration created at: {}", default_path.display());
    println!("\nEdit the file to set telegram.bot_token and vision.api_key");
    println!("(or vision.mock = true for canned analyses), then run nutrix again.");
    Ok(None)
}

fn write_example_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, EXAMPLE_CONFIG)?;
    Ok(())
}

fn resolve_log_level(flag: Option<&str>, config: &Config) -> String {
    flag.map(|level| level.to_string())
        .or_else(|| config.core.log_level.clone())
        .unwrap_or_else(|| "info".to_string())
}

fn get_data_dir(config: &Config) -> PathBuf {
    if let Some(data_dir) = &config.core.data_dir {
        if data_dir == "~" || data_dir.starts_with("~/") {
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
            if data_dir == "~" {
                home
            } else {
                home.join(data_dir.trim_start_matches("~/"))
            }
        } else {
            PathBuf::from(data_dir)
        }
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nutrix")
    }
}
