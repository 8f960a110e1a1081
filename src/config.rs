// src/config.rs

//! Manages dispatcher configuration: loading from TOML, defaults and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Settings the dispatcher itself consumes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DispatcherSettings {
    /// The queue the intake loop consumes from. Fixed for the dispatcher's lifetime.
    #[serde(default = "default_destination")]
    pub destination: String,
    /// How long `stop` waits for each execution context before moving on.
    #[serde(with = "humantime_serde", default = "default_stop_grace_period")]
    pub stop_grace_period: Duration,
    /// Log a warning whenever the session pool grows beyond this many open
    /// sessions. The pool itself is never capped.
    #[serde(default)]
    pub pool_warn_threshold: Option<usize>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            stop_grace_period: default_stop_grace_period(),
            pool_warn_threshold: None,
        }
    }
}

impl DispatcherSettings {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..Default::default()
        }
    }
}

/// Where the routing key of a message comes from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "source", content = "name", rename_all = "snake_case")]
pub enum KeySource {
    /// A message property (header).
    Property(String),
    /// A top-level field of a JSON body.
    JsonField(String),
}

impl Default for KeySource {
    fn default() -> Self {
        KeySource::Property("key".to_string())
    }
}

impl KeySource {
    pub fn name(&self) -> &str {
        match self {
            KeySource::Property(name) | KeySource::JsonField(name) => name,
        }
    }
}

/// Configuration for the metrics output.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, the Prometheus text exposition is logged when the process shuts down.
    #[serde(default)]
    pub log_on_shutdown: bool,
}

/// Settings for the in-memory demo the binary runs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DemoConfig {
    /// Messages published before the dispatcher starts.
    #[serde(default = "default_demo_messages")]
    pub messages: usize,
    /// Number of distinct keys the demo messages are spread over.
    #[serde(default = "default_demo_keys")]
    pub keys: usize,
    /// Simulated processing time per message.
    #[serde(with = "humantime_serde", default = "default_demo_processing_time")]
    pub processing_time: Duration,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            messages: default_demo_messages(),
            keys: default_demo_keys(),
            processing_time: default_demo_processing_time(),
        }
    }
}

fn default_destination() -> String {
    "seqdispatch.inbound".to_string()
}
fn default_stop_grace_period() -> Duration {
    Duration::from_millis(5000)
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_demo_messages() -> usize {
    20
}
fn default_demo_keys() -> usize {
    4
}
fn default_demo_processing_time() -> Duration {
    Duration::from_millis(50)
}

/// The top-level configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub key: KeySource,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub demo: DemoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            dispatcher: DispatcherSettings::default(),
            key: KeySource::default(),
            metrics: MetricsConfig::default(),
            demo: DemoConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file '{path}'"))
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.destination.trim().is_empty() {
            return Err(anyhow!("dispatcher.destination cannot be empty"));
        }
        if self.dispatcher.stop_grace_period.is_zero() {
            return Err(anyhow!("dispatcher.stop_grace_period cannot be 0"));
        }
        if self.dispatcher.pool_warn_threshold == Some(0) {
            return Err(anyhow!("dispatcher.pool_warn_threshold cannot be 0"));
        }
        if self.key.name().trim().is_empty() {
            return Err(anyhow!("key.name cannot be empty"));
        }
        if self.demo.messages > 0 && self.demo.keys == 0 {
            return Err(anyhow!("demo.keys cannot be 0 when demo.messages is set"));
        }

        if self.dispatcher.stop_grace_period > Duration::from_secs(60) {
            warn!(
                "dispatcher.stop_grace_period is {:?}; stop() may block for up to twice that long.",
                self.dispatcher.stop_grace_period
            );
        }
        Ok(())
    }
}
