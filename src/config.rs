use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};
use thiserror::Error;

use crate::admission::IpAllowList;

/// Largest chunk a single relay read may carry. One chunk maps to one
/// WebSocket binary message, so the ceiling is the 16-bit length limit.
pub const MAX_CHUNK_SIZE: usize = 65535;

pub const DEFAULT_POOL_SIZE: usize = 2;

pub const DEFAULT_REJECT_COOLDOWN_MS: u64 = 3000;

/// Upper bound on TLS plus WebSocket handshakes. A listener serves one
/// connection at a time, so a silent client must not hold it forever.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("illegal address '{0}', expected host:port or :port")]
    InvalidAddress(String),
    #[error("illegal pair '{0}', expected <ws-addr>,<tcp-addr>")]
    InvalidPair(String),
    #[error("invalid IP address or CIDR in allow list: {0}")]
    InvalidIpPattern(String),
    #[error("pool_size must be at least 1")]
    PoolSize,
    #[error("chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {0}")]
    ChunkSize(usize),
    #[error("handshake_timeout_ms must be at least 1")]
    HandshakeTimeout,
    #[error("max_sessions must be at least 1")]
    MaxSessions,
    #[error("no tunnel pairs configured")]
    NoPairs,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

/// Tuning shared by every relay in the process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Buffers per direction. Bounds how many reads may be in flight before
    /// the destination has to drain one.
    pub pool_size: usize,
    pub chunk_size: usize,
    /// How long a side may wait for a free buffer while its counterpart is
    /// gone. `None` waits forever.
    pub stall_timeout_secs: Option<u64>,
    pub reject_cooldown_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            chunk_size: MAX_CHUNK_SIZE,
            stall_timeout_secs: None,
            reject_cooldown_ms: DEFAULT_REJECT_COOLDOWN_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn reject_cooldown(&self) -> Duration {
        Duration::from_millis(self.reject_cooldown_ms)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::PoolSize);
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::HandshakeTimeout);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairConfig {
    pub ws: String,
    pub tcp: String,
    pub allowed_ips: Option<Vec<String>>,
    pub max_sessions: Option<usize>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

impl PairConfig {
    pub fn ws_bind_addr(&self) -> Result<String, ConfigError> {
        parse_endpoint(&self.ws)
    }

    pub fn tcp_bind_addr(&self) -> Result<String, ConfigError> {
        parse_endpoint(&self.tcp)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ws_bind_addr()?;
        self.tcp_bind_addr()?;
        if self.max_sessions == Some(0) {
            return Err(ConfigError::MaxSessions);
        }
        if let Some(patterns) = &self.allowed_ips {
            IpAllowList::parse(patterns)?;
        }
        Ok(())
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse tunnel configuration as valid TOML")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pairs.is_empty() {
            return Err(ConfigError::NoPairs);
        }
        self.relay.validate()?;
        self.pairs.iter().try_for_each(PairConfig::validate)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    Config::from_toml(&content).with_context(|| format!("Invalid config file {}", path.display()))
}

/// Parses a `<ws-addr>,<tcp-addr>` command line argument.
pub fn parse_pair(arg: &str) -> Result<PairConfig, ConfigError> {
    let Some((ws, tcp)) = arg.split_once(',') else {
        return Err(ConfigError::InvalidPair(arg.to_string()));
    };
    let pair = PairConfig {
        ws: ws.trim().to_string(),
        tcp: tcp.trim().to_string(),
        allowed_ips: None,
        max_sessions: None,
        tls: None,
    };
    pair.ws_bind_addr()
        .and(pair.tcp_bind_addr())
        .map_err(|_| ConfigError::InvalidPair(arg.to_string()))?;
    Ok(pair)
}

/// Normalizes `host:port` into a bindable address. An empty host binds all
/// interfaces. A leading `scheme://` and any trailing path are ignored.
pub fn parse_endpoint(name: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidAddress(name.to_string());

    let rest = name.split_once("://").map_or(name, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or_default();
    let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;

    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid());
    }
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod endpoints {
        use super::*;

        #[test]
        fn empty_host_binds_all_interfaces() {
            assert_eq!(parse_endpoint(":9001").unwrap(), "0.0.0.0:9001");
        }

        #[test]
        fn keeps_explicit_host() {
            assert_eq!(parse_endpoint("localhost:1234").unwrap(), "localhost:1234");
            assert_eq!(parse_endpoint("[::1]:80").unwrap(), "[::1]:80");
        }

        #[test]
        fn strips_scheme_and_path() {
            assert_eq!(
                parse_endpoint("ws://example.com:8080/tunnel").unwrap(),
                "example.com:8080"
            );
            assert_eq!(parse_endpoint("tcp://:22").unwrap(), "0.0.0.0:22");
        }

        #[test]
        fn rejects_missing_or_bad_port() {
            assert!(parse_endpoint("localhost").is_err());
            assert!(parse_endpoint("localhost:http").is_err());
            assert!(parse_endpoint("localhost:70000").is_err());
            assert!(parse_endpoint("::1:80").is_err());
        }
    }

    mod pairs {
        use super::*;

        #[test]
        fn parses_ws_and_tcp_addresses() {
            let pair = parse_pair(":9001,:9002").unwrap();
            assert_eq!(pair.ws_bind_addr().unwrap(), "0.0.0.0:9001");
            assert_eq!(pair.tcp_bind_addr().unwrap(), "0.0.0.0:9002");
            assert!(pair.allowed_ips.is_none());
        }

        #[test]
        fn rejects_single_address() {
            assert_eq!(
                parse_pair(":9001").unwrap_err(),
                ConfigError::InvalidPair(":9001".to_string())
            );
        }

        #[test]
        fn rejects_bad_half() {
            assert!(parse_pair(":9001,nope").is_err());
        }
    }

    mod files {
        use super::*;

        #[test]
        fn loads_pairs_and_relay_tuning() {
            let config = Config::from_toml(
                r#"
                verbose = true

                [relay]
                pool_size = 4
                stall_timeout_secs = 30

                [[pairs]]
                ws = ":9001"
                tcp = ":9002"
                allowed_ips = ["10.0.0.0/24"]
                max_sessions = 2

                [[pairs]]
                ws = "127.0.0.1:9101"
                tcp = "127.0.0.1:9102"
                tls = { cert_file = "cert.pem", key_file = "key.pem" }
                "#,
            )
            .unwrap();

            assert!(config.verbose);
            assert_eq!(config.relay.pool_size, 4);
            assert_eq!(config.relay.chunk_size, MAX_CHUNK_SIZE);
            assert_eq!(config.relay.stall_timeout(), Some(Duration::from_secs(30)));
            assert_eq!(config.pairs.len(), 2);
            assert_eq!(config.pairs[0].max_sessions, Some(2));
            assert!(config.pairs[1].tls.is_some());
            config.validate().unwrap();
        }

        #[test]
        fn defaults_match_relay_constants() {
            let relay = RelayConfig::default();
            assert_eq!(relay.pool_size, DEFAULT_POOL_SIZE);
            assert_eq!(relay.reject_cooldown(), Duration::from_secs(3));
            assert_eq!(relay.stall_timeout(), None);
            assert_eq!(relay.handshake_timeout(), Duration::from_secs(10));
        }

        #[test]
        fn validation_catches_bad_limits() {
            let mut config = Config {
                pairs: vec![parse_pair(":1,:2").unwrap()],
                ..Config::default()
            };
            config.relay.chunk_size = MAX_CHUNK_SIZE + 1;
            assert_eq!(
                config.validate().unwrap_err(),
                ConfigError::ChunkSize(MAX_CHUNK_SIZE + 1)
            );

            config.relay.chunk_size = MAX_CHUNK_SIZE;
            config.relay.pool_size = 0;
            assert_eq!(config.validate().unwrap_err(), ConfigError::PoolSize);

            config.relay.pool_size = 2;
            config.relay.handshake_timeout_ms = 0;
            assert_eq!(config.validate().unwrap_err(), ConfigError::HandshakeTimeout);

            config.relay.handshake_timeout_ms = DEFAULT_HANDSHAKE_TIMEOUT_MS;
            config.pairs[0].max_sessions = Some(0);
            assert_eq!(config.validate().unwrap_err(), ConfigError::MaxSessions);
        }

        #[test]
        fn malformed_allow_list_fails_validation() {
            let mut pair = parse_pair(":1,:2").unwrap();
            pair.allowed_ips = Some(vec!["10.0.0.0/24,bogus".to_string()]);
            assert_eq!(
                pair.validate().unwrap_err(),
                ConfigError::InvalidIpPattern("bogus".to_string())
            );
        }

        #[test]
        fn empty_config_has_no_pairs() {
            assert_eq!(
                Config::default().validate().unwrap_err(),
                ConfigError::NoPairs
            );
        }

        #[test]
        fn unknown_keys_are_rejected() {
            assert!(Config::from_toml("[relay]\nbogus = 1\n").is_err());
        }
    }
}
