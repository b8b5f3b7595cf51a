use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, ConfigBuilder, Environment, builder::DefaultState};
use reqwest::Method;
use serde::Deserialize;
use strum::{Display, EnumString};

/// Which upstream requests are merged by the request deduplicator
#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DedupScope {
    /// Only GET requests
    #[default]
    Get,
    /// GET, HEAD and OPTIONS
    Safe,
    /// Every method, with the request body as part of the identity
    All,
}

impl DedupScope {
    pub fn merges(self, method: &Method) -> bool {
        match self {
            DedupScope::Get => method == Method::GET,
            DedupScope::Safe => {
                method == Method::GET || method == Method::HEAD || method == Method::OPTIONS
            }
            DedupScope::All => true,
        }
    }
}

/// Settings for the request deduplicator
#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub scope: DedupScope,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            scope: DedupScope::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_listen() -> String {
    "localhost:3000".to_string()
}

fn default_submit_cooldown_ms() -> u64 {
    300
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct FlightdeckConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Base URL every proxied request is forwarded to
    pub upstream: String,
    #[serde(default)]
    pub dedup: DedupConfig,
    /// How long an identical write stays blocked after it completes
    #[serde(default = "default_submit_cooldown_ms")]
    pub submit_cooldown_ms: u64,
}

impl FlightdeckConfig {
    /// Loads the config file, then applies `FLIGHTDECK_*` environment
    /// overrides (`FLIGHTDECK_DEDUP__SCOPE=safe` sets `dedup.scope`).
    pub fn load(path: &Path) -> Result<Self> {
        let path_str = path.display().to_string();
        Self::from_builder(
            Config::builder().add_source(config::File::with_name(&path_str)),
        )
        .with_context(|| format!("Failed to load config from: {}", path_str))
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config = builder
            .add_source(
                Environment::with_prefix("FLIGHTDECK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn submit_cooldown(&self) -> Duration {
        Duration::from_millis(self.submit_cooldown_ms)
    }
}
