//! Configuration for the Concord command-line driver
//!
//! Sources are layered lowest to highest: built-in defaults, an optional
//! config file, `CONCORD_`-prefixed environment variables (nested keys joined
//! with `__`, e.g. `CONCORD_SESSION__TTL_SECS=10`), then command-line flags.

use std::path::Path;

use concord_concurrency::SessionConfig;
use config::{Config, Environment, File, Value};
use serde::Deserialize;

pub const ENV_PREFIX: &str = "CONCORD";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Default tracing filter when RUST_LOG is not set
    pub log_level: String,
    pub session: SessionConfig,
    pub lock: LockConfig,
    pub queue: QueueConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            session: SessionConfig::default(),
            lock: LockConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub prefix: String,
    /// Number of sessions contending for the mutex
    pub contenders: usize,
    /// How long each contender holds the mutex
    pub hold_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            prefix: "/concord/lock".to_string(),
            contenders: 2,
            hold_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub prefix: String,
    pub items: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: "/concord/queue".to_string(),
            items: 5,
        }
    }
}

impl CliConfig {
    /// Build the configuration from every source. `overrides` are applied last,
    /// keyed by dotted path (`lock.prefix`).
    pub fn load(file: Option<&Path>, overrides: Vec<(&str, Value)>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in overrides {
            builder = builder.set_override(key, value)?;
        }

        let config = builder.build()?.try_deserialize::<CliConfig>()?;
        Ok(config)
    }
}
