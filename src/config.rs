//! DSO Server Configuration
//!
//! Configuration structures for the server. The whole tree is loaded once at
//! process start and handed to each component's constructor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::id::{GroupID, ServerID};

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsoConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Replication group configuration
    #[serde(default)]
    pub group: GroupConfig,

    /// Transaction pipeline configuration
    #[serde(default)]
    pub transactions: TransactionConfig,

    /// DNA codec configuration
    #[serde(default)]
    pub dna: DnaConfig,

    /// Client handshake configuration
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// Stage (worker pool) configuration
    #[serde(default)]
    pub stages: StageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique server identifier within the group
    pub id: String,

    /// Address to bind for server-to-server (group) communication
    pub group_bind_address: String,

    /// Address to bind for client connections
    #[serde(default = "default_client_bind_address")]
    pub client_bind_address: String,

    /// Data directory for persisted transaction state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Advertised group address for other servers to connect
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Keep transaction state on disk (false keeps it in memory only)
    #[serde(default = "default_true")]
    pub persistent: bool,
}

/// A peer server in the replication group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    /// Peer server id
    pub id: String,
    /// Peer group address (host:port)
    pub address: String,
}

/// Replication group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Group identifier
    #[serde(default)]
    pub id: u32,

    /// Start this server as the active coordinator
    #[serde(default)]
    pub bootstrap_active: bool,

    /// Other servers in the group
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Interval between low watermark broadcasts in milliseconds
    #[serde(default = "default_low_watermark_interval_ms")]
    pub low_watermark_interval_ms: u64,

    /// Timeout for request/response group messages in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Connection timeout to peers in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Transaction pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Largest accepted frame (client batch or group message) in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// DNA codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnaConfig {
    /// Compress long string literals
    #[serde(default = "default_true")]
    pub string_compression: bool,

    /// Minimum string size in bytes before compression applies
    #[serde(default = "default_string_compress_min_size")]
    pub string_compress_min_size: usize,

    /// Intern class and field names once per batch
    #[serde(default = "default_true")]
    pub intern_strings: bool,
}

/// Client handshake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Wait for previously connected clients to reconnect after a restart
    #[serde(default = "default_true")]
    pub reconnect_enabled: bool,

    /// Reconnect window in milliseconds
    #[serde(default = "default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,

    /// Number of object ids reserved per handshake that requests them
    #[serde(default = "default_object_id_batch_size")]
    pub object_id_batch_size: i64,
}

/// Stage (worker pool) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Bounded queue capacity per stage worker
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Workers for the incoming transaction stage (0 = auto)
    #[serde(default)]
    pub transaction_workers: usize,

    /// Workers for the persistence stage (0 = auto)
    #[serde(default)]
    pub persistence_workers: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_client_bind_address() -> String {
    "0.0.0.0:9510".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/dsoserver")
}

fn default_low_watermark_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_max_frame_size() -> usize {
    16 * 1024 * 1024
}

fn default_string_compress_min_size() -> usize {
    512
}

fn default_reconnect_timeout_ms() -> u64 {
    120_000
}

fn default_object_id_batch_size() -> i64 {
    1000
}

fn default_queue_size() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            id: 0,
            bootstrap_active: false,
            peers: Vec::new(),
            low_watermark_interval_ms: default_low_watermark_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for DnaConfig {
    fn default() -> Self {
        Self {
            string_compression: true,
            string_compress_min_size: default_string_compress_min_size(),
            intern_strings: true,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            reconnect_enabled: true,
            reconnect_timeout_ms: default_reconnect_timeout_ms(),
            object_id_batch_size: default_object_id_batch_size(),
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            transaction_workers: 0,
            persistence_workers: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl DsoConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: DsoConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.group_bind_address.is_empty() {
            return Err(crate::Error::Config(
                "node.group_bind_address cannot be empty".into(),
            ));
        }

        if self.group.peers.iter().any(|p| p.id == self.node.id) {
            return Err(crate::Error::Config(format!(
                "group.peers contains this node's own id {}",
                self.node.id
            )));
        }

        if self.handshake.object_id_batch_size <= 0 {
            return Err(crate::Error::Config(
                "handshake.object_id_batch_size must be positive".into(),
            ));
        }

        if self.transactions.max_frame_size < 1024 {
            return Err(crate::Error::Config(
                "transactions.max_frame_size must be at least 1024".into(),
            ));
        }

        if self.stages.queue_size == 0 {
            return Err(crate::Error::Config("stages.queue_size cannot be 0".into()));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be pretty or json, got {}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// This server's id
    pub fn server_id(&self) -> ServerID {
        ServerID(self.node.id.clone())
    }

    /// This server's group id
    pub fn group_id(&self) -> GroupID {
        GroupID(self.group.id)
    }

    /// Get the advertised group address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.group_bind_address)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Path of the persistence database
    pub fn database_path(&self) -> PathBuf {
        self.node.data_dir.join("dso.db")
    }

    /// Reconnect window, or `None` when reconnect waiting is disabled
    pub fn reconnect_timeout(&self) -> Option<Duration> {
        if self.handshake.reconnect_enabled {
            Some(Duration::from_millis(self.handshake.reconnect_timeout_ms))
        } else {
            None
        }
    }

    /// Get low watermark broadcast interval as Duration
    pub fn low_watermark_interval(&self) -> Duration {
        Duration::from_millis(self.group.low_watermark_interval_ms)
    }

    /// Get group request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.group.request_timeout_ms)
    }

    /// Get peer connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.group.connect_timeout_ms)
    }
}
