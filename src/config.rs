//! Configuration for the gateway client

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::types::SecType;

/// Historical data request settings.
///
/// The defaults keep a single connection under the gateway's pacing ceiling
/// for one-second bars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySettings {
    /// Bar size in seconds
    pub bar_size_secs: u32,

    /// Maximum number of bars per request
    pub max_block_bars: u32,

    /// Fixed delay between consecutive historical requests
    pub pacing_interval_secs: u64,

    /// Only request regular trading hours data
    pub use_rth: bool,

    /// Gateway date format code (2 = seconds since the epoch)
    pub date_format: i32,

    /// Data kind per security type code, e.g. `CASH -> BID_ASK`
    #[serde(default = "default_what_to_show")]
    pub what_to_show: HashMap<String, String>,
}

const FALLBACK_WHAT_TO_SHOW: &str = "TRADES";

fn default_what_to_show() -> HashMap<String, String> {
    [(SecType::Stock, "TRADES"), (SecType::Cash, "BID_ASK")]
        .into_iter()
        .map(|(sec_type, kind)| (sec_type.code().to_string(), kind.to_string()))
        .collect()
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            bar_size_secs: 1,
            max_block_bars: 1800,
            pacing_interval_secs: 18,
            use_rth: false,
            date_format: 2,
            what_to_show: default_what_to_show(),
        }
    }
}

impl HistorySettings {
    pub fn pacing_interval(&self) -> Duration {
        Duration::from_secs(self.pacing_interval_secs)
    }

    /// Bar size in gateway text form, e.g. `1 secs`
    pub fn bar_size_setting(&self) -> String {
        format!("{} secs", self.bar_size_secs)
    }

    /// Data kind to request for a security type; `TRADES` when the table
    /// has no entry
    pub fn what_to_show(&self, sec_type: SecType) -> &str {
        self.what_to_show
            .get(sec_type.code())
            .map(String::as_str)
            .unwrap_or(FALLBACK_WHAT_TO_SHOW)
    }
}

/// Configuration for a gateway client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Gateway host name or IP address
    pub host: String,

    /// Gateway port
    pub port: u16,

    /// Identifies this client connection. Client 0 also receives orders
    /// entered manually in the gateway UI.
    pub client_id: i32,

    pub history: HistorySettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4001,
            client_id: 0,
            history: HistorySettings::default(),
        }
    }
}

impl ClientConfig {
    /// Build a config from the defaults overlaid with environment variables
    ///
    /// Reads (all optional):
    /// - `GATEWAY_HOST`, `GATEWAY_PORT`, `GATEWAY_CLIENT_ID`
    /// - `HISTORY_PACING_SECS`, `HISTORY_MAX_BLOCK_BARS`, `HISTORY_BAR_SIZE_SECS`
    /// - `HISTORY_USE_RTH` ("true"/"false")
    /// - `HISTORY_WHAT_TO_SHOW`, e.g. `CASH=MIDPOINT,FUT=TRADES`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("GATEWAY_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_var(&lookup, "GATEWAY_PORT")? {
            config.port = port;
        }
        if let Some(client_id) = parse_var(&lookup, "GATEWAY_CLIENT_ID")? {
            config.client_id = client_id;
        }
        if let Some(secs) = parse_var(&lookup, "HISTORY_PACING_SECS")? {
            config.history.pacing_interval_secs = secs;
        }
        if let Some(bars) = parse_var::<u32, _>(&lookup, "HISTORY_MAX_BLOCK_BARS")? {
            if bars == 0 {
                return Err(invalid("HISTORY_MAX_BLOCK_BARS", "must be positive"));
            }
            config.history.max_block_bars = bars;
        }
        if let Some(secs) = parse_var::<u32, _>(&lookup, "HISTORY_BAR_SIZE_SECS")? {
            if secs == 0 {
                return Err(invalid("HISTORY_BAR_SIZE_SECS", "must be positive"));
            }
            config.history.bar_size_secs = secs;
        }
        if let Some(use_rth) = parse_var(&lookup, "HISTORY_USE_RTH")? {
            config.history.use_rth = use_rth;
        }
        if let Some(table) = lookup("HISTORY_WHAT_TO_SHOW") {
            for entry in table.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let Some((code, kind)) = entry.split_once('=') else {
                    return Err(invalid("HISTORY_WHAT_TO_SHOW", "expected CODE=KIND pairs"));
                };
                config
                    .history
                    .what_to_show
                    .insert(code.trim().to_uppercase(), kind.trim().to_uppercase());
            }
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .to_lowercase()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &e.to_string())),
    }
}

fn invalid(key: &str, reason: &str) -> ClientError {
    ClientError::InvalidConfig {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
