//! Nutrix Configuration
//!
//! TOML configuration loading and validation

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    pub telegram: Option<TelegramConfig>,
    pub vision: Option<VisionConfig>,
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
    /// Directory for downloaded photos awaiting confirmation. Defaults to
    /// `<data_dir>/temp`.
    pub temp_dir: Option<String>,
    /// Directory holding `<lang>.json` translation files.
    pub locale_dir: Option<String>,
    #[serde(default = "default_language")]
    pub default_language: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            log_level: None,
            temp_dir: None,
            locale_dir: None,
            default_language: default_language(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// When set, updates from any other chat are ignored.
    #[serde(default)]
    pub allowed_chats: Option<Vec<i64>>,
    pub poll_timeout_secs: Option<u64>,
    pub client_recreate_interval_secs: Option<u64>,
}

impl TelegramConfig {
    pub fn is_chat_allowed(&self, chat_id: i64) -> bool {
        match &self.allowed_chats {
            Some(allowed) => allowed.contains(&chat_id),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_vision_base_url")]
    pub base_url: String,
    #[serde(default = "default_vision_model")]
    pub model: String,
    /// Canned responses instead of live API calls, for development.
    #[serde(default)]
    pub mock: bool,
    pub timeout_secs: Option<u64>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_vision_base_url(),
            model: default_vision_model(),
            mock: false,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_stats_days")]
    pub default_days: u32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            default_days: default_stats_days(),
        }
    }
}

pub fn telegram_account_tag(bot_token: &str) -> String {
    let token = bot_token.trim();
    token.split(':').next().unwrap_or(token).trim().to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_vision_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_stats_days() -> u32 {
    7
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nutrix").join("config.toml"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.core.default_language.trim().is_empty() {
            anyhow::bail!("core.default_language cannot be empty");
        }

        if let Some(telegram) = &self.telegram {
            let token = telegram.bot_token.trim();
            if token.is_empty() {
                anyhow::bail!("telegram.bot_token cannot be empty");
            }
            let account_tag = token.split(':').next().unwrap_or(token).trim();
            if account_tag.is_empty() {
                anyhow::bail!("telegram.bot_token has invalid account tag");
            }
            if let Some(timeout) = telegram.poll_timeout_secs {
                if timeout == 0 || timeout > 300 {
                    anyhow::bail!("telegram.poll_timeout_secs must be in range 1..=300");
                }
            }
            if let Some(interval) = telegram.client_recreate_interval_secs {
                if interval < 60 {
                    anyhow::bail!("telegram.client_recreate_interval_secs must be >= 60");
                }
            }
        }

        if let Some(vision) = &self.vision {
            if vision.base_url.trim().is_empty() {
                anyhow::bail!("vision.base_url cannot be empty");
            }
            if vision.model.trim().is_empty() {
                anyhow::bail!("vision.model cannot be empty");
            }
            if !vision.mock && vision.api_key.trim().is_empty() {
                anyhow::bail!("vision.api_key is required unless vision.mock=true");
            }
            if let Some(timeout) = vision.timeout_secs {
                if timeout == 0 || timeout > 600 {
                    anyhow::bail!("vision.timeout_secs must be in range 1..=600");
                }
            }
        }

        if self.stats.default_days == 0 || self.stats.default_days > 365 {
            anyhow::bail!("stats.default_days must be in range 1..=365");
        }

        Ok(())
    }
}
