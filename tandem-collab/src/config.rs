//! Server configuration with environment overrides.
//!
//! | Variable                    | Field                      |
//! |-----------------------------|----------------------------|
//! | `TANDEM_BIND`               | `bind_addr`                |
//! | `PORT`                      | `bind_addr` = `0.0.0.0:PORT` (if `TANDEM_BIND` unset) |
//! | `TANDEM_IDLE_TIMEOUT_SECS`  | `idle_timeout_secs`        |
//! | `TANDEM_LOG_RETENTION`      | `log_retention`            |
//! | `TANDEM_RATE_LIMIT`         | `rate_limit` as `messages/window_ms` |
//! | `TANDEM_CHECKPOINT_EVERY`   | `checkpoint_every`         |
//! | `TANDEM_DATA_DIR`           | `data_dir`                 |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Inbound message budget per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_messages: u32,
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_messages: 10,
            window: Duration::from_secs(1),
        }
    }
}

impl FromStr for RateLimit {
    type Err = ConfigError;

    /// `"20/500"` → 20 messages per 500ms. A bare number keeps the 1s window.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid {
            key: "TANDEM_RATE_LIMIT",
            value: s.to_string(),
        };
        let (count, window_ms) = match s.split_once('/') {
            Some((count, window)) => (count, Some(window)),
            None => (s, None),
        };
        let max_messages: u32 = count.trim().parse().map_err(|_| invalid())?;
        let window = match window_ms {
            Some(ms) => Duration::from_millis(ms.trim().parse().map_err(|_| invalid())?),
            None => Duration::from_secs(1),
        };
        if max_messages == 0 || window.is_zero() {
            return Err(invalid());
        }
        Ok(Self {
            max_messages,
            window,
        })
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum attached clients per document
    pub max_clients_per_document: usize,
    /// Session event channel capacity (per document)
    pub event_capacity: usize,
    /// Outbound mailbox capacity per connection (presence, notifications)
    pub notify_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this many seconds without inbound frames
    pub idle_timeout_secs: u64,
    /// Operations always kept in each session's log
    pub log_retention: usize,
    /// Hard cap on each session's log
    pub max_log_len: usize,
    /// Persist a snapshot every N accepted operations (0 = only on teardown)
    pub checkpoint_every: u64,
    pub rate_limit: RateLimit,
    /// Snapshot storage directory (None = in-memory only)
    pub data_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_clients_per_document: 100,
            event_capacity: 256,
            notify_capacity: 64,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
            log_retention: 1000,
            max_log_len: 10_000,
            checkpoint_every: 100,
            rate_limit: RateLimit::default(),
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl ServerConfig {
    /// Defaults overridden by process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(bind) = lookup("TANDEM_BIND") {
            config.bind_addr = bind;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = parse("PORT", &port)?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(secs) = lookup("TANDEM_IDLE_TIMEOUT_SECS") {
            config.idle_timeout_secs = parse("TANDEM_IDLE_TIMEOUT_SECS", &secs)?;
        }
        if let Some(retention) = lookup("TANDEM_LOG_RETENTION") {
            config.log_retention = parse("TANDEM_LOG_RETENTION", &retention)?;
            config.max_log_len = config.max_log_len.max(config.log_retention);
        }
        if let Some(limit) = lookup("TANDEM_RATE_LIMIT") {
            config.rate_limit = limit.parse()?;
        }
        if let Some(every) = lookup("TANDEM_CHECKPOINT_EVERY") {
            config.checkpoint_every = parse("TANDEM_CHECKPOINT_EVERY", &every)?;
        }
        if let Some(dir) = lookup("TANDEM_DATA_DIR").filter(|d| !d.is_empty()) {
            config.data_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.rate_limit.max_messages, 10);
        assert_eq!(config.rate_limit.window, Duration::from_secs(1));
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_port_variable() {
        let config = from_pairs(&[("PORT", "8000")]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8000");

        let config = from_pairs(&[("PORT", "8000"), ("TANDEM_BIND", "127.0.0.1:7000")]).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:7000");
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("TANDEM_IDLE_TIMEOUT_SECS", "5"),
            ("TANDEM_LOG_RETENTION", "50000"),
            ("TANDEM_RATE_LIMIT", "20/500"),
            ("TANDEM_CHECKPOINT_EVERY", "0"),
            ("TANDEM_DATA_DIR", "/var/lib/tandem"),
        ])
        .unwrap();
        assert_eq!(config.idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.log_retention, 50_000);
        assert_eq!(config.max_log_len, 50_000);
        assert_eq!(
            config.rate_limit,
            RateLimit {
                max_messages: 20,
                window: Duration::from_millis(500)
            }
        );
        assert_eq!(config.checkpoint_every, 0);
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/tandem")));
    }

    #[test]
    fn test_invalid_values() {
        assert!(from_pairs(&[("PORT", "http")]).is_err());
        assert!(from_pairs(&[("TANDEM_RATE_LIMIT", "0/100")]).is_err());
        assert_eq!("15".parse::<RateLimit>().unwrap().window, Duration::from_secs(1));
    }
}
