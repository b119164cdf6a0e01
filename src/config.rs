use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Backtest,
    Realtime,
}

impl Mode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "backtest" => Ok(Mode::Backtest),
            "realtime" => Ok(Mode::Realtime),
            other => Err(anyhow!("unknown mode {:?} (expected backtest or realtime)", other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Backtest => "backtest",
            Mode::Realtime => "realtime",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Csv,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub data_path: String,
    pub data_source: DataSource,
    pub symbol: String,
    pub candle_secs: u64,
    pub binance_base: String,
    pub poll_secs: u64,
    pub sqlite_path: String,
    pub plugin_config: Option<String>,
    pub subscriptions_path: Option<String>,
    pub halt_on_consumer_error: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mode = Mode::parse(&std::env::var("MODE").unwrap_or_else(|_| "backtest".to_string()))?;
        let data_source = match std::env::var("DATA_SOURCE").unwrap_or_default().as_str() {
            "sqlite" => DataSource::Sqlite,
            _ => DataSource::Csv,
        };
        Ok(Self {
            mode,
            data_path: std::env::var("DATA_PATH").unwrap_or_else(|_| "data.csv".to_string()),
            data_source,
            symbol: std::env::var("SYMBOL").unwrap_or_else(|_| "BTCUSDT".to_string()),
            candle_secs: std::env::var("CANDLE_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(60),
            binance_base: std::env::var("BINANCE_BASE").unwrap_or_else(|_| "https://api.binance.com".to_string()),
            poll_secs: std::env::var("POLL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(10),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./candles.sqlite".to_string()),
            plugin_config: std::env::var("PLUGIN_CONFIG").ok(),
            subscriptions_path: std::env::var("SUBSCRIPTIONS").ok(),
            halt_on_consumer_error: matches!(
                std::env::var("HALT_ON_CONSUMER_ERROR").as_deref(),
                Ok("1") | Ok("true")
            ),
        })
    }

    /// Plugin settings from `PLUGIN_CONFIG`, or the built-in defaults.
    pub fn plugin_settings(&self) -> Result<PluginSettings> {
        match &self.plugin_config {
            Some(path) => PluginSettings::from_file(Path::new(path)),
            None => Ok(PluginSettings::defaults()),
        }
    }
}

/// Per-plugin section of the configuration: `enabled` plus free-form options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub options: serde_json::Map<String, Value>,
}

impl PluginSection {
    pub fn enabled() -> Self {
        Self { enabled: true, options: serde_json::Map::new() }
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.options.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn str_or(&self, key: &str, default: &str) -> String {
        self.options
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }
}

/// Plugin configuration keyed by slug. Unknown slugs are disabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginSettings {
    sections: HashMap<String, PluginSection>,
}

impl PluginSettings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("reading plugin config {}", path.display()))?;
        Self::from_json(&body).with_context(|| format!("parsing plugin config {}", path.display()))
    }

    pub fn from_json(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn defaults() -> Self {
        let value = json!({
            "tradingAdvisor": { "enabled": true, "threshold": 0.002 },
            "paperTrader": { "enabled": true, "cash": 1000.0, "fee_rate": 0.001 },
            "performanceAnalyzer": { "enabled": true },
            "candleWriter": { "enabled": false },
            "eventLogger": { "enabled": true },
        });
        serde_json::from_value(value).unwrap_or_default()
    }

    pub fn section(&self, slug: &str) -> Option<&PluginSection> {
        self.sections.get(slug)
    }

    pub fn is_enabled(&self, slug: &str) -> bool {
        self.sections.get(slug).map(|s| s.enabled).unwrap_or(false)
    }

    pub fn set(&mut self, slug: &str, section: PluginSection) {
        self.sections.insert(slug.to_string(), section);
    }
}
