//! Configuration models for lodectl.
//!
//! Everything the control plane needs to reach the checkpoint store, the
//! coordinator, the storage fleet, the import backend and the SQL target is
//! parameterized here and loaded from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default region split size hint used when the config leaves it at zero.
pub const DEFAULT_REGION_SPLIT_SIZE: u64 = 96 * 1024 * 1024;

/// Top-level configuration for lodectl.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Checkpoint ledger location
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Import backend selection and addresses
    #[serde(default)]
    pub importer: ImporterConfig,

    /// Coordinator (placement driver) of the storage fleet
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// SQL target used for table drops and metadata cleanup
    #[serde(default)]
    pub tidb: TidbConfig,

    /// TLS material shared by every client
    #[serde(default)]
    pub security: SecurityConfig,

    /// Application-level settings
    #[serde(default)]
    pub app: AppConfig,

    /// Fleet dispatch settings
    #[serde(default)]
    pub fleet: FleetConfig,
}

/// Checkpoint driver.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointDriver {
    /// JSON file on local disk
    #[default]
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Whether checkpoints are recorded at all
    #[serde(default = "default_true")]
    pub enable: bool,

    #[serde(default)]
    pub driver: CheckpointDriver,

    /// Path of the checkpoint file
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("/tmp/lodectl.checkpoints.json")
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enable: true,
            driver: CheckpointDriver::default(),
            path: default_checkpoint_path(),
        }
    }
}

/// Which import backend the load job used.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Remote importer service, engines live in its memory/disk
    Importer,
    /// Local sorted files, ingested directly into the cluster
    #[default]
    Local,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Importer => write!(f, "importer"),
            Self::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImporterConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Address of the remote importer (host:port), importer backend only
    #[serde(default)]
    pub addr: String,

    /// Directory holding local engine segments, local backend only
    #[serde(default = "default_sorted_kv_dir")]
    pub sorted_kv_dir: PathBuf,

    /// Target byte size of one imported range (0 = default)
    #[serde(default)]
    pub region_split_size: u64,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_sorted_kv_dir() -> PathBuf {
    PathBuf::from("/tmp/sorted-kv")
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            addr: String::new(),
            sorted_kv_dir: default_sorted_kv_dir(),
            region_split_size: 0,
            timeout_secs: default_timeout(),
        }
    }
}

impl ImporterConfig {
    /// Region split size with the zero value resolved to the default.
    pub fn effective_region_split_size(&self) -> u64 {
        if self.region_split_size == 0 {
            DEFAULT_REGION_SPLIT_SIZE
        } else {
            self.region_split_size
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Placement driver address (host:port)
    #[serde(default = "default_pd_addr")]
    pub pd_addr: String,

    /// Request timeout in seconds, applied to every node call
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries for a single node call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_pd_addr() -> String {
    "127.0.0.1:2379".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            pd_addr: default_pd_addr(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl ClusterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TidbConfig {
    #[serde(default = "default_tidb_host")]
    pub host: String,

    #[serde(default = "default_tidb_port")]
    pub port: u16,

    #[serde(default = "default_tidb_user")]
    pub user: String,

    /// Password, `${VAR}` references are expanded from the environment
    #[serde(default)]
    pub password: String,
}

fn default_tidb_host() -> String {
    "127.0.0.1".to_string()
}

fn default_tidb_port() -> u16 {
    4000
}

fn default_tidb_user() -> String {
    "root".to_string()
}

impl Default for TidbConfig {
    fn default() -> Self {
        Self {
            host: default_tidb_host(),
            port: default_tidb_port(),
            user: default_tidb_user(),
            password: String::new(),
        }
    }
}

impl TidbConfig {
    /// Password with `${VAR}` references resolved.
    pub fn resolved_password(&self) -> String {
        expand_env_vars(&self.password)
    }
}

/// TLS material. All empty means plain TCP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub ca_path: Option<PathBuf>,

    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl SecurityConfig {
    pub fn is_enabled(&self) -> bool {
        self.ca_path.is_some()
    }

    /// URL scheme for HTTP clients.
    pub fn scheme(&self) -> &'static str {
        if self.is_enabled() {
            "https"
        } else {
            "http"
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Schema holding the load task's own bookkeeping tables
    #[serde(default = "default_meta_schema")]
    pub meta_schema_name: String,
}

fn default_meta_schema() -> String {
    "lightning_metadata".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            meta_schema_name: default_meta_schema(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Maximum number of nodes contacted at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    8
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field requirements that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.importer.backend == BackendKind::Importer && self.importer.addr.is_empty() {
            return Err(ConfigError::Missing("importer.addr"));
        }
        if self.cluster.pd_addr.is_empty() {
            return Err(ConfigError::Missing("cluster.pd_addr"));
        }
        if self.fleet.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "fleet.concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        let security = &self.security;
        if security.cert_path.is_some() != security.key_path.is_some() {
            return Err(ConfigError::Invalid {
                field: "security",
                reason: "cert_path and key_path must be set together".to_string(),
            });
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return result;
    };

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Example configuration printed by `lodectl example`.
pub const EXAMPLE_CONFIG: &str = r#"# lodectl configuration file

[checkpoint]
enable = true
driver = "file"
path = "/tmp/lodectl.checkpoints.json"

[importer]
# "local" or "importer"
backend = "local"
# addr = "127.0.0.1:8287"
sorted_kv_dir = "/mnt/ssd/sorted-kv"
region_split_size = 0   # 0 = 96 MiB
timeout_secs = 30

[cluster]
pd_addr = "127.0.0.1:2379"
timeout_secs = 30
max_retries = 3

[tidb]
host = "127.0.0.1"
port = 4000
user = "root"
password = "${TIDB_PASSWORD}"

[security]
# ca_path = "/etc/tls/ca.pem"
# cert_path = "/etc/tls/client.pem"
# key_path = "/etc/tls/client-key.pem"

[app]
meta_schema_name = "lightning_metadata"

[fleet]
concurrency = 8
"#;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to load TLS material {path:?}: {reason}")]
    Tls { path: PathBuf, reason: String },
}
