// Copyright (c) 2024 Botho Foundation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::DEFAULT_PROXY_CAPACITY;
use crate::crypto::{EdgeKey, CIPHER_BLOCK_SIZE};
use crate::message::{Framing, MessageType, REPLY_HEADER_LEN};
use crate::mixing::{MixerConfig, ReplySizingConfig};
use crate::network::frame::{frame_len, DEFAULT_MAX_FRAME_LEN};
use crate::network::{DownstreamConfig, ListenerConfig, UpstreamConfig};
use crate::queue::DEFAULT_QUEUE_CAPACITY;

/// Invalid or inconsistent configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("cannot resolve {field} address '{value}'")]
    Address { field: &'static str, value: String },

    #[error("relays other than the last need an upstream address")]
    MissingUpstream,

    #[error("invalid edge key: {0}")]
    Key(#[from] crate::crypto::CipherError),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Main configuration for a cascade relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Position in the cascade
    #[serde(default)]
    pub cascade: CascadeSettings,
    /// Client listener (first relay)
    #[serde(default)]
    pub listener: ListenerSettings,
    /// Edge to the next relay
    #[serde(default)]
    pub upstream: UpstreamSettings,
    /// Edge from the previous relay
    #[serde(default)]
    pub downstream: DownstreamSettings,
    /// Payload sizes
    #[serde(default)]
    pub framing: FramingSettings,
    /// Reply sizing (last relay)
    #[serde(default)]
    pub reply: ReplySettings,
    /// Batch mixer and queues
    #[serde(default)]
    pub mixing: MixingSettings,
    /// Pre-shared edge key (needed when the cascade spans processes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<KeySettings>,
}

/// Position of this relay in the cascade
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CascadeSettings {
    /// Relays before this one
    #[serde(default)]
    pub previous_hops: u32,
    /// Relays after this one
    #[serde(default)]
    pub further_hops: u32,
}

/// Client-facing listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// Address clients connect to (first relay only)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Client port
    #[serde(default = "default_client_port")]
    pub port: u16,

    /// Connections accepted per readiness cycle
    #[serde(default = "default_backlog")]
    pub backlog: usize,

    /// Longest readiness wait
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,

    /// Global client cap
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Per-IP cap, 0 disables it
    #[serde(default = "default_max_per_ip")]
    pub max_per_ip: u32,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_client_port(),
            backlog: default_backlog(),
            accept_timeout_ms: default_accept_timeout_ms(),
            max_connections: default_max_connections(),
            max_per_ip: default_max_per_ip(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_client_port() -> u16 {
    7300
}

fn default_backlog() -> usize {
    64
}

fn default_accept_timeout_ms() -> u64 {
    100
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_per_ip() -> u32 {
    16
}

/// Edge to the next relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Edge listener of the next relay, `host:port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Key information port of the next relay
    #[serde(default = "default_info_port")]
    pub info_port: u16,

    /// Pause between reconnect attempts
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            address: None,
            info_port: default_info_port(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

fn default_info_port() -> u16 {
    7302
}

fn default_reconnect_backoff_ms() -> u64 {
    1000
}

/// Edge from the previous relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamSettings {
    /// Edge listener for the previous relay (all but the first relay)
    #[serde(default = "default_edge_listen")]
    pub listen: String,
}

impl Default for DownstreamSettings {
    fn default() -> Self {
        Self {
            listen: default_edge_listen(),
        }
    }
}

fn default_edge_listen() -> String {
    "0.0.0.0:7301".to_string()
}

/// Frame and payload sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramingSettings {
    /// Header cipher block size, must be 16
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Processing header bytes each relay strips
    #[serde(default = "default_header_unit")]
    pub header_unit: usize,

    /// Establish payload once every relay has stripped its header
    #[serde(default = "default_establish_base")]
    pub establish_base: usize,

    /// Message payload once every relay has stripped its header
    #[serde(default = "default_message_base")]
    pub message_base: usize,

    /// Largest reply payload, header included
    #[serde(default = "default_max_reply_len")]
    pub max_reply_len: usize,

    /// Largest inter-relay frame accepted
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for FramingSettings {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            header_unit: default_header_unit(),
            establish_base: default_establish_base(),
            message_base: default_message_base(),
            max_reply_len: default_max_reply_len(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

fn default_block_size() -> usize {
    CIPHER_BLOCK_SIZE
}

fn default_header_unit() -> usize {
    16
}

fn default_establish_base() -> usize {
    64
}

fn default_message_base() -> usize {
    512
}

fn default_max_reply_len() -> usize {
    4096
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

/// Reply sizing on the last relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplySettings {
    /// Volume sampling interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Buffered bytes at which a channel counts as filled
    #[serde(default = "default_min_volume")]
    pub min_volume: usize,

    /// Fraction of filled channels that flushes a round early
    #[serde(default = "default_min_fraction")]
    pub min_fraction: f64,

    /// Longest reply round
    #[serde(default = "default_reply_timeout_ms")]
    pub timeout_ms: u64,

    /// Quantile `g` of the weighted median
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Length field in front of the reply data
    #[serde(default = "default_header_len")]
    pub header_len: usize,
}

impl Default for ReplySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            min_volume: default_min_volume(),
            min_fraction: default_min_fraction(),
            timeout_ms: default_reply_timeout_ms(),
            weight: default_weight(),
            header_len: default_header_len(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_min_volume() -> usize {
    256
}

fn default_min_fraction() -> f64 {
    0.5
}

fn default_reply_timeout_ms() -> u64 {
    2000
}

fn default_weight() -> f64 {
    0.5
}

fn default_header_len() -> usize {
    REPLY_HEADER_LEN
}

/// Batch mixer and queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixingSettings {
    /// Requests per round, until the previous relay announces one
    #[serde(default = "default_round_size")]
    pub round_size: usize,

    /// Longest time a partial round is held
    #[serde(default = "default_round_timeout_ms")]
    pub round_timeout_ms: u64,

    /// Capacity of each of the four queues
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Capacity of each per-channel proxy buffer on the last relay
    #[serde(default = "default_proxy_capacity")]
    pub proxy_capacity: usize,
}

impl Default for MixingSettings {
    fn default() -> Self {
        Self {
            round_size: default_round_size(),
            round_timeout_ms: default_round_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            proxy_capacity: default_proxy_capacity(),
        }
    }
}

fn default_round_size() -> usize {
    8
}

fn default_round_timeout_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_proxy_capacity() -> usize {
    DEFAULT_PROXY_CAPACITY
}

/// Pre-shared edge key material
#[derive(Clone, Serialize, Deserialize)]
pub struct KeySettings {
    /// AES-128 key, hex
    pub key: String,
    /// CTR initial counter block, hex
    pub iv: String,
}

impl std::fmt::Debug for KeySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySettings(..)")
    }
}

fn resolve(field: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::Address {
            field,
            value: value.to_string(),
        })
}

impl Config {
    /// Create a config for a relay at the given cascade position
    pub fn new(previous_hops: u32, further_hops: u32, upstream: Option<String>) -> Self {
        Self {
            cascade: CascadeSettings {
                previous_hops,
                further_hops,
            },
            upstream: UpstreamSettings {
                address: upstream,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// This relay accepts clients
    pub fn is_first(&self) -> bool {
        self.cascade.previous_hops == 0
    }

    /// This relay talks to the destination
    pub fn is_last(&self) -> bool {
        self.cascade.further_hops == 0
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let framing = &self.framing;
        if framing.block_size != CIPHER_BLOCK_SIZE {
            return Err(invalid(
                "framing.block_size",
                format!("must be {}, got {}", CIPHER_BLOCK_SIZE, framing.block_size),
            ));
        }
        if framing.max_reply_len < framing.block_size {
            return Err(invalid(
                "framing.max_reply_len",
                "must hold at least one cipher block",
            ));
        }
        let largest = self
            .framing()
            .inbound_len(MessageType::ChannelEstablish)
            .into_iter()
            .chain(self.framing().inbound_len(MessageType::ChannelMessage))
            .chain(Some(framing.max_reply_len))
            .max()
            .unwrap_or(0);
        if frame_len(largest) > framing.max_frame_len {
            return Err(invalid(
                "framing.max_frame_len",
                format!("{} is smaller than the largest frame", framing.max_frame_len),
            ));
        }

        let reply = &self.reply;
        if !(0.0..=1.0).contains(&reply.weight) {
            return Err(invalid("reply.weight", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&reply.min_fraction) {
            return Err(invalid("reply.min_fraction", "must be within [0, 1]"));
        }
        if reply.header_len != REPLY_HEADER_LEN {
            return Err(invalid(
                "reply.header_len",
                format!("only {} is supported", REPLY_HEADER_LEN),
            ));
        }
        if reply.poll_interval_ms == 0 {
            return Err(invalid("reply.poll_interval_ms", "must be positive"));
        }

        if self.mixing.round_size == 0 {
            return Err(invalid("mixing.round_size", "must be positive"));
        }
        if self.mixing.queue_capacity == 0 {
            return Err(invalid("mixing.queue_capacity", "must be positive"));
        }

        if !self.is_last() && self.upstream.address.is_none() {
            return Err(ConfigError::MissingUpstream);
        }
        if let Some(keys) = &self.keys {
            EdgeKey::from_hex(&keys.key, &keys.iv)?;
        }
        Ok(())
    }

    /// Payload sizes at this relay
    pub fn framing(&self) -> Framing {
        Framing {
            header_unit: self.framing.header_unit,
            establish_base: self.framing.establish_base,
            message_base: self.framing.message_base,
            further_hops: self.cascade.further_hops,
        }
    }

    /// Settings of the client listener
    pub fn listener_config(&self) -> Result<ListenerConfig, ConfigError> {
        let bind = format!("{}:{}", self.listener.bind_address, self.listener.port);
        Ok(ListenerConfig {
            bind: resolve("listener", &bind)?,
            backlog: self.listener.backlog,
            accept_timeout: Duration::from_millis(self.listener.accept_timeout_ms),
            max_connections: self.listener.max_connections,
            max_connections_per_ip: self.listener.max_per_ip,
            framing: self.framing(),
            max_frame_len: self.framing.max_frame_len,
            is_last: self.is_last(),
        })
    }

    /// Settings of the link to the next relay
    pub fn upstream_config(&self) -> Result<UpstreamConfig, ConfigError> {
        let address = self
            .upstream
            .address
            .as_deref()
            .ok_or(ConfigError::MissingUpstream)?;
        Ok(UpstreamConfig {
            peer: resolve("upstream", address)?,
            info_port: self.upstream.info_port,
            reconnect_backoff: Duration::from_millis(self.upstream.reconnect_backoff_ms),
            max_frame_len: self.framing.max_frame_len,
        })
    }

    /// Settings of the link from the previous relay
    pub fn downstream_config(&self) -> Result<DownstreamConfig, ConfigError> {
        Ok(DownstreamConfig {
            listen: resolve("downstream", &self.downstream.listen)?,
            max_frame_len: self.framing.max_frame_len,
            framing: self.framing(),
            is_last: self.is_last(),
        })
    }

    /// Settings of the batch mixer
    pub fn mixer_config(&self) -> MixerConfig {
        MixerConfig {
            round_size: self.mixing.round_size,
            round_timeout: Duration::from_millis(self.mixing.round_timeout_ms),
            header_unit: self.framing.header_unit,
            is_first: self.is_first(),
            is_last: self.is_last(),
        }
    }

    /// Settings of the reply sizing decision
    pub fn reply_sizing_config(&self) -> ReplySizingConfig {
        ReplySizingConfig {
            poll_interval: Duration::from_millis(self.reply.poll_interval_ms),
            min_volume: self.reply.min_volume,
            min_fraction: self.reply.min_fraction,
            timeout: Duration::from_millis(self.reply.timeout_ms),
            weight: self.reply.weight,
            block_size: self.framing.block_size,
            header_len: self.reply.header_len,
            max_reply_len: self.framing.max_reply_len,
        }
    }

    /// Pre-shared edge key, if configured
    pub fn edge_key(&self) -> Result<Option<EdgeKey>, ConfigError> {
        self.keys
            .as_ref()
            .map(|keys| EdgeKey::from_hex(&keys.key, &keys.iv))
            .transpose()
            .map_err(ConfigError::from)
    }

    /// Load config from a file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        // May hold the pre-shared edge key
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms)
                .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        }

        Ok(())
    }

    /// Check if config file exists
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }
}

/// Get the default config directory path
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".cascade"))
        .context("Could not determine home directory")
}

/// Get the default config file path
pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_data_dir()?.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::new(1, 1, Some("127.0.0.1:7401".to_string()));
        config.keys = Some(KeySettings {
            key: "00".repeat(16),
            iv: "11".repeat(16),
        });
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.cascade.previous_hops, 1);
        assert_eq!(loaded.cascade.further_hops, 1);
        assert_eq!(loaded.upstream.address.as_deref(), Some("127.0.0.1:7401"));
        assert!(loaded.edge_key().unwrap().is_some());
        loaded.validate().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_config_file_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        Config::default().save(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_sparse_file_takes_defaults() {
        let config: Config = toml::from_str("[cascade]\nfurther_hops = 0\n").unwrap();
        assert!(config.is_first());
        assert!(config.is_last());
        assert_eq!(config.framing.block_size, 16);
        assert_eq!(config.reply.header_len, REPLY_HEADER_LEN);
        assert!(config.keys.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_position() {
        let middle = Config::new(1, 1, Some("127.0.0.1:1".to_string()));
        assert!(!middle.is_first());
        assert!(!middle.is_last());
        assert_eq!(middle.framing().remaining_hops(), 2);
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let mut config = Config::default();
        config.framing.block_size = 8;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reply.weight = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reply.min_fraction = -0.1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.framing.max_reply_len = 8;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.framing.max_frame_len = 64;
        assert!(config.validate().is_err());

        let config = Config::new(0, 2, None);
        assert!(matches!(config.validate(), Err(ConfigError::MissingUpstream)));

        let mut config = Config::default();
        config.keys = Some(KeySettings {
            key: "zz".to_string(),
            iv: "00".to_string(),
        });
        assert!(matches!(config.validate(), Err(ConfigError::Key(_))));
    }

    #[test]
    fn test_component_configs() {
        let mut config = Config::new(0, 1, Some("127.0.0.1:7401".to_string()));
        config.listener.bind_address = "127.0.0.1".to_string();
        config.listener.port = 0;

        let listener = config.listener_config().unwrap();
        assert_eq!(listener.bind.port(), 0);
        assert!(!listener.is_last);

        let upstream = config.upstream_config().unwrap();
        assert_eq!(upstream.peer.port(), 7401);

        let sizing = config.reply_sizing_config();
        assert_eq!(sizing.block_size, 16);
        assert_eq!(sizing.header_len, 4);
    }

    #[test]
    fn test_unresolvable_address() {
        let mut config = Config::default();
        config.downstream.listen = "not an address".to_string();
        assert!(matches!(
            config.downstream_config(),
            Err(ConfigError::Address { field: "downstream", .. })
        ));
    }
}
