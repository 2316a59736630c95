//! Server configuration.
//!
//! Defaults suit a local single-process deployment. [`ServerConfig::from_env`]
//! layers environment overrides on top:
//!
//! | variable                    | field                  |
//! |-----------------------------|------------------------|
//! | `COEDIT_BIND`               | `bind_addr`            |
//! | `PORT`                      | `bind_addr` = `0.0.0.0:$PORT` |
//! | `COEDIT_SESSION_BUFFER`     | `session_buffer`       |
//! | `COEDIT_MAX_MEMBERS`        | `max_members_per_room` |
//! | `COEDIT_ROOM_IDLE_TTL_SECS` | `room_idle_ttl`        |
//!
//! `COEDIT_BIND` wins over `PORT` when both are set.

use std::str::FromStr;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per session
    pub session_buffer: usize,
    /// Maximum members per room
    pub max_members_per_room: usize,
    /// WebSocket ping interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
    /// Evict rooms left without members this long (None = keep forever)
    pub room_idle_ttl: Option<Duration>,
    /// How often the idle reaper runs
    pub reap_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            session_buffer: 256,
            max_members_per_room: 100,
            heartbeat_interval_secs: 30,
            room_idle_ttl: None,
            reap_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT") {
            let port: u16 = parse("PORT", &port)?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(bind) = lookup("COEDIT_BIND") {
            if bind.trim().is_empty() {
                return Err(ConfigError::InvalidValue { key: "COEDIT_BIND".into(), value: bind });
            }
            config.bind_addr = bind;
        }
        if let Some(buffer) = lookup("COEDIT_SESSION_BUFFER") {
            config.session_buffer = parse_positive("COEDIT_SESSION_BUFFER", &buffer)?;
        }
        if let Some(max) = lookup("COEDIT_MAX_MEMBERS") {
            config.max_members_per_room = parse_positive("COEDIT_MAX_MEMBERS", &max)?;
        }
        if let Some(ttl) = lookup("COEDIT_ROOM_IDLE_TTL_SECS") {
            let secs: u64 = parse("COEDIT_ROOM_IDLE_TTL_SECS", &ttl)?;
            config.room_idle_ttl = Some(Duration::from_secs(secs));
        }

        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_positive(key: &str, value: &str) -> Result<usize, ConfigError> {
    match parse::<usize>(key, value)? {
        0 => Err(ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() }),
        n => Ok(n),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue { key: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { key, value } => write!(f, "Invalid value for {key}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.session_buffer, 256);
        assert_eq!(config.max_members_per_room, 100);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.room_idle_ttl.is_none());
    }

    #[test]
    fn test_empty_environment_is_default() {
        assert_eq!(ServerConfig::from_lookup(lookup(&[])).unwrap(), ServerConfig::default());
    }

    #[test]
    fn test_port_binds_all_interfaces() {
        let config = ServerConfig::from_lookup(lookup(&[("PORT", "8080")])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_bind_overrides_port() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("COEDIT_BIND", "127.0.0.1:9000"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
    }

    #[test]
    fn test_numeric_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("COEDIT_SESSION_BUFFER", "32"),
            ("COEDIT_MAX_MEMBERS", "4"),
            ("COEDIT_ROOM_IDLE_TTL_SECS", "600"),
        ]))
        .unwrap();
        assert_eq!(config.session_buffer, 32);
        assert_eq!(config.max_members_per_room, 4);
        assert_eq!(config.room_idle_ttl, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "http")])).unwrap_err();
        assert_eq!(err, ConfigError::InvalidValue { key: "PORT".into(), value: "http".into() });

        assert!(ServerConfig::from_lookup(lookup(&[("COEDIT_MAX_MEMBERS", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("COEDIT_BIND", " ")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("PORT", "70000")])).is_err());
    }

    #[test]
    fn test_heartbeat_interval() {
        let mut config = ServerConfig::default();
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(30)));
        config.heartbeat_interval_secs = 0;
        assert_eq!(config.heartbeat_interval(), None);
    }
}
