use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{FerryError, FerryResult};

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(FerryError::Config(format!(
                "FERRY_LOG_FORMAT: unknown format {other:?}"
            ))),
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listen address (default: 127.0.0.1:8123)
    pub bind: String,

    /// Directory files are served from (default: ./web)
    pub doc_root: PathBuf,

    /// Seconds a connection may sit without traffic (default: 30)
    pub idle_timeout_secs: u64,

    /// Number of WebSocket reactors (default: one per CPU)
    pub ws_workers: usize,

    /// Value of the `Server` response header
    pub server_name: String,

    /// Pin each reactor thread to its own core
    pub pin_cores: bool,

    /// Default filter when `RUST_LOG` is unset (default: info)
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8123".to_string(),
            doc_root: PathBuf::from("./web"),
            idle_timeout_secs: 30,
            ws_workers: num_cpus::get().max(1),
            server_name: concat!("ferry/", env!("CARGO_PKG_VERSION")).to_string(),
            pin_cores: false,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> FerryResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup; unset keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> FerryResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let ws_workers: usize = parse_or(&lookup, "FERRY_WS_WORKERS", defaults.ws_workers)?;
        let idle_timeout_secs =
            parse_or(&lookup, "FERRY_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs)?;
        if idle_timeout_secs == 0 {
            return Err(FerryError::Config(
                "FERRY_IDLE_TIMEOUT_SECS: must be at least 1".to_string(),
            ));
        }

        Ok(Config {
            bind: lookup("FERRY_BIND").unwrap_or(defaults.bind),
            doc_root: lookup("FERRY_DOC_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.doc_root),
            idle_timeout_secs,
            ws_workers: ws_workers.max(1),
            server_name: lookup("FERRY_SERVER_NAME").unwrap_or(defaults.server_name),
            pin_cores: match lookup("FERRY_PIN_CORES") {
                Some(raw) => parse_flag("FERRY_PIN_CORES", &raw)?,
                None => defaults.pin_cores,
            },
            log_level: lookup("FERRY_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: match lookup("FERRY_LOG_FORMAT") {
                Some(raw) => raw.parse()?,
                None => defaults.log_format,
            },
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> FerryResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| FerryError::Config(format!("{key}: invalid value {raw:?}"))),
        None => Ok(default),
    }
}

fn parse_flag(key: &str, raw: &str) -> FerryResult<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(FerryError::Config(format!("{key}: invalid flag {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> FerryResult<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:8123");
        assert_eq!(cfg.doc_root, PathBuf::from("./web"));
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(30));
        assert!(cfg.ws_workers >= 1);
        assert!(cfg.server_name.starts_with("ferry/"));
        assert!(!cfg.pin_cores);
        assert_eq!(cfg.log_format, LogFormat::Compact);
    }

    #[test]
    fn overrides() {
        let cfg = load(&[
            ("FERRY_BIND", "0.0.0.0:9000"),
            ("FERRY_DOC_ROOT", "/srv/www"),
            ("FERRY_IDLE_TIMEOUT_SECS", "5"),
            ("FERRY_WS_WORKERS", "0"),
            ("FERRY_PIN_CORES", "yes"),
            ("FERRY_LOG_FORMAT", "JSON"),
        ])
        .unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:9000");
        assert_eq!(cfg.doc_root, PathBuf::from("/srv/www"));
        assert_eq!(cfg.idle_timeout_secs, 5);
        assert_eq!(cfg.ws_workers, 1);
        assert!(cfg.pin_cores);
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn invalid_values_are_errors() {
        for pairs in [
            [("FERRY_WS_WORKERS", "many")],
            [("FERRY_IDLE_TIMEOUT_SECS", "0")],
            [("FERRY_PIN_CORES", "sometimes")],
            [("FERRY_LOG_FORMAT", "xml")],
        ] {
            assert!(matches!(load(&pairs), Err(FerryError::Config(_))), "{pairs:?}");
        }
    }
}
