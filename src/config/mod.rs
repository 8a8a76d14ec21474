// src/config/mod.rs - Bot configuration loaded from YAML with environment overrides

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

const BOT_CONFIG_FILE: &str = "bot.yaml";

/// Top-level bot configuration (`config/bot.yaml`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfiguration {
    pub version: String,

    /// Operator that can never be removed or banned. Overridden by `SUPER_ADMIN_ID`.
    pub super_admin_id: i64,

    /// Number of dispatch workers; events of one user always land on the same worker
    pub dispatch_workers: usize,

    pub session: SessionConfig,
    pub persistence: PersistenceConfig,
    pub telegram: TelegramSettings,
}

/// Matchmaking behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Waiting users are dropped from the queue after this long. `None` waits forever.
    #[serde(default)]
    pub search_timeout_seconds: Option<u64>,
    pub spam: SpamConfig,
}

/// Fixed-window relay limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamConfig {
    pub message_limit: u32,
    pub window_seconds: u64,
    pub cooldown_seconds: u64,
}

/// State snapshot location and flush retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Overridden by `DATA_DIR`
    pub data_dir: PathBuf,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// How often activity-only changes (relay counters, last-seen times) are written
    #[serde(default = "default_activity_flush_seconds")]
    pub activity_flush_seconds: u64,
}

fn default_activity_flush_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramSettings {
    pub api_base: String,
    pub poll_timeout_seconds: u64,
}

impl Default for BotConfiguration {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            super_admin_id: 0,
            dispatch_workers: 8,
            session: SessionConfig::default(),
            persistence: PersistenceConfig::default(),
            telegram: TelegramSettings::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            search_timeout_seconds: None,
            spam: SpamConfig::default(),
        }
    }
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            message_limit: 15,    // messages allowed per window
            window_seconds: 60,
            cooldown_seconds: 20,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            retry_initial_ms: 250,
            retry_max_ms: 30_000,
            activity_flush_seconds: default_activity_flush_seconds(),
        }
    }
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            poll_timeout_seconds: 30,
        }
    }
}

impl BotConfiguration {
    /// Reject configurations the bot cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.super_admin_id == 0 {
            return Err(anyhow::anyhow!(
                "super_admin_id is not set (use {} or SUPER_ADMIN_ID)",
                BOT_CONFIG_FILE
            ));
        }
        if self.dispatch_workers == 0 {
            return Err(anyhow::anyhow!("dispatch_workers must be at least 1"));
        }
        if self.session.spam.message_limit == 0 || self.session.spam.window_seconds == 0 {
            return Err(anyhow::anyhow!("spam limits must be positive"));
        }
        if self.session.search_timeout_seconds == Some(0) {
            return Err(anyhow::anyhow!("search_timeout_seconds must be positive when set"));
        }
        if self.persistence.retry_initial_ms == 0
            || self.persistence.retry_max_ms < self.persistence.retry_initial_ms
        {
            return Err(anyhow::anyhow!("invalid persistence retry bounds"));
        }
        if self.persistence.activity_flush_seconds == 0 {
            return Err(anyhow::anyhow!("activity_flush_seconds must be positive"));
        }
        Ok(())
    }

    /// Apply `SUPER_ADMIN_ID` and `DATA_DIR` from the environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = env::var("SUPER_ADMIN_ID") {
            self.super_admin_id = raw
                .trim()
                .parse()
                .with_context(|| format!("SUPER_ADMIN_ID must be an integer, got '{}'", raw))?;
            debug!("super_admin_id overridden from environment");
        }
        if let Ok(dir) = env::var("DATA_DIR") {
            self.persistence.data_dir = PathBuf::from(dir);
            debug!("data_dir overridden from environment");
        }
        Ok(())
    }
}

/// Loads and caches the bot configuration from a config directory
#[derive(Clone)]
pub struct ConfigurationManager {
    config_dir: PathBuf,
    bot_config: Arc<RwLock<BotConfiguration>>,
}

impl ConfigurationManager {
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
            bot_config: Arc::new(RwLock::new(BotConfiguration::default())),
        }
    }

    /// Create the directory, load `bot.yaml` (writing defaults when missing) and apply env overrides
    pub async fn initialize(&self) -> Result<()> {
        if !self.config_dir.exists() {
            fs::create_dir_all(&self.config_dir).await.with_context(|| {
                format!("Failed to create config directory {}", self.config_dir.display())
            })?;
            info!("Created configuration directory: {}", self.config_dir.display());
        }

        // A broken file is an error; only a missing one is replaced by defaults
        let mut config = match self.load_bot_config().await? {
            Some(config) => config,
            None => {
                warn!("No {} found, writing defaults", BOT_CONFIG_FILE);
                self.create_default_bot_config().await?
            }
        };

        config.apply_env_overrides()?;
        *self.bot_config.write().await = config;

        info!("Configuration loaded from {}", self.config_dir.display());
        Ok(())
    }

    async fn load_bot_config(&self) -> Result<Option<BotConfiguration>> {
        let config_path = self.config_dir.join(BOT_CONFIG_FILE);
        if !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path).await?;
        let config: BotConfiguration = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid YAML in {}", config_path.display()))?;

        debug!("Loaded bot configuration from {}", config_path.display());
        Ok(Some(config))
    }

    async fn create_default_bot_config(&self) -> Result<BotConfiguration> {
        let config = BotConfiguration::default();
        let config_path = self.config_dir.join(BOT_CONFIG_FILE);
        let content = serde_yaml::to_string(&config)?;
        fs::write(&config_path, content)
            .await
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        info!("Created default bot configuration at {}", config_path.display());
        Ok(config)
    }

    pub async fn get_bot_config(&self) -> BotConfiguration {
        self.bot_config.read().await.clone()
    }
}
