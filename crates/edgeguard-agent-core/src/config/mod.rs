//! Agent configuration - loading, validation, and persistence.
//!
//! The configuration has two validity profiles:
//! - **Bootstrap**: the minimum needed to register with the control plane
//!   (`org_id` + `install_token`, both of which may come from the
//!   environment).
//! - **Runtime**: the full set required for normal operation, only
//!   satisfiable after a successful bootstrap.
//!
//! Environment variables overlay *empty* fields in a loaded config -
//! non-empty file values win. This keeps `ORG_ID`/`INSTALL_TOKEN` ergonomic
//! for first-run provisioning without surprising operators who have edited
//! the file.

pub mod log_level;

pub use log_level::LogLevel;

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Minimum accepted collection interval.
pub const MIN_COLLECTION_INTERVAL_SECS: u64 = 10;
/// Inclusive batch size bounds.
pub const MIN_BATCH_SIZE: usize = 1;
/// Inclusive batch size bounds.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Errors produced by the config store.
///
/// All variants are distinguishable so the supervisor can branch on them
/// (missing file triggers bootstrap, an expired certificate triggers
/// re-bootstrap, and so on).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found")]
    NotFound,

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid bootstrap configuration: {0}")]
    InvalidBootstrap(String),

    #[error("invalid runtime configuration: {0}")]
    InvalidRuntime(String),

    #[error("agent not bootstrapped")]
    NotBootstrapped,

    #[error("certificate expired")]
    CertExpired,

    #[error("bootstrap already in progress")]
    BootstrapInProgress,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Paths of the on-disk identity triple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
}

impl Default for TlsPaths {
    fn default() -> Self {
        let certs = default_data_dir().join("certs");
        Self {
            cert_file: certs.join("agent.crt"),
            key_file: certs.join("agent.key"),
            ca_file: certs.join("ca.crt"),
        }
    }
}

/// Persisted agent configuration.
///
/// Serialized as a single pretty-printed JSON record. Duration-valued
/// fields are stored as integer seconds. Copies handed to other components
/// are read-only snapshots; the supervisor is the single writer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub bootstrapped: bool,

    // Agent identity
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub install_token: String,

    #[serde(default)]
    pub api_base_url: String,
    #[serde(default)]
    pub tls: TlsPaths,

    // Data collection
    pub collection_interval_secs: u64,
    pub batch_size: usize,

    // Buffering
    pub max_buffer_bytes: u64,
    pub buffer_dir: PathBuf,

    // Health & monitoring
    pub heartbeat_interval_secs: u64,

    // Logging
    pub log_level: LogLevel,
    pub log_file: PathBuf,
    pub log_max_size_mb: u64,
    pub log_max_backups: usize,

    // Auto-update
    pub update_enabled: bool,
    pub update_check_interval_secs: u64,
}

impl Config {
    /// Reads configuration from a JSON file.
    ///
    /// Returns [`ConfigError::NotFound`] if the file does not exist.
    /// `ORG_ID` and `INSTALL_TOKEN` from the environment overlay empty
    /// fields in the loaded value.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };

        let mut cfg: Config = serde_json::from_slice(&data)?;
        cfg.overlay_env(env::var("ORG_ID").ok(), env::var("INSTALL_TOKEN").ok());
        Ok(cfg)
    }

    /// Writes configuration to a JSON file.
    ///
    /// The write is atomic: the record goes to a temp file in the same
    /// directory (mode 0600 on unix) which is then renamed over the target.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let data = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Validates the minimal configuration needed for bootstrap.
    pub fn validate_bootstrap(&self) -> Result<(), ConfigError> {
        if self.org_id.is_empty() {
            return Err(ConfigError::InvalidBootstrap("org_id is required".into()));
        }
        if self.install_token.is_empty() {
            return Err(ConfigError::InvalidBootstrap(
                "install_token is required".into(),
            ));
        }
        Ok(())
    }

    /// Validates the full configuration needed for normal operation.
    pub fn validate_runtime(&self) -> Result<(), ConfigError> {
        if !self.bootstrapped {
            return Err(ConfigError::NotBootstrapped);
        }
        if self.org_id.is_empty() {
            return Err(ConfigError::InvalidRuntime("org_id is required".into()));
        }
        if self.agent_id.is_empty() {
            return Err(ConfigError::InvalidRuntime("agent_id is required".into()));
        }
        if self.api_base_url.is_empty() {
            return Err(ConfigError::InvalidRuntime(
                "api_base_url is required".into(),
            ));
        }
        if self.collection_interval_secs < MIN_COLLECTION_INTERVAL_SECS {
            return Err(ConfigError::InvalidRuntime(format!(
                "collection_interval must be at least {MIN_COLLECTION_INTERVAL_SECS} seconds"
            )));
        }
        if self.batch_size < MIN_BATCH_SIZE || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::InvalidRuntime(format!(
                "batch_size must be between {MIN_BATCH_SIZE} and {MAX_BATCH_SIZE}"
            )));
        }
        Ok(())
    }

    /// Marks the configuration as bootstrapped and fills the runtime fields.
    ///
    /// The install token is cleared - it is single-use and must not persist
    /// past a successful registration.
    pub fn mark_bootstrapped(&mut self, agent_id: &str, api_base_url: &str) {
        self.bootstrapped = true;
        self.agent_id = agent_id.to_string();
        self.api_base_url = api_base_url.to_string();
        self.install_token = String::new();
    }

    /// Builds a defaults-filled bootstrap configuration from the
    /// environment (`ORG_ID`, `INSTALL_TOKEN`).
    pub fn from_environment() -> Self {
        let mut cfg = Self::bootstrap_defaults();
        cfg.overlay_env(env::var("ORG_ID").ok(), env::var("INSTALL_TOKEN").ok());
        cfg
    }

    /// Defaults-filled, not-yet-bootstrapped configuration.
    pub fn bootstrap_defaults() -> Self {
        let data_dir = default_data_dir();
        Self {
            bootstrapped: false,
            org_id: String::new(),
            agent_id: String::new(),
            install_token: String::new(),
            api_base_url: String::new(),
            tls: TlsPaths::default(),
            collection_interval_secs: 60,
            batch_size: 100,
            max_buffer_bytes: 100 * 1024 * 1024,
            buffer_dir: data_dir.join("buffer"),
            heartbeat_interval_secs: 5 * 60,
            log_level: LogLevel::Info,
            log_file: default_log_dir().join("agent.log"),
            log_max_size_mb: 10,
            log_max_backups: 3,
            update_enabled: true,
            update_check_interval_secs: 60 * 60,
        }
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.update_check_interval_secs)
    }

    fn overlay_env(&mut self, org_id: Option<String>, install_token: Option<String>) {
        if self.org_id.is_empty() {
            if let Some(v) = org_id.filter(|v| !v.is_empty()) {
                self.org_id = v;
            }
        }
        if self.install_token.is_empty() {
            if let Some(v) = install_token.filter(|v| !v.is_empty()) {
                self.install_token = v;
            }
        }
    }
}

/// Resolves the config file path: `--config` flag value, `AGENT_CONFIG`
/// env var, then the platform default.
pub fn config_path(flag: Option<PathBuf>) -> PathBuf {
    if let Some(path) = flag {
        return path;
    }
    if let Some(path) = env::var_os("AGENT_CONFIG") {
        return PathBuf::from(path);
    }
    default_config_path()
}

pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.json")
}

fn default_data_dir() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\ProgramData\EdgeGuard\Agent")
    } else if cfg!(target_os = "macos") {
        PathBuf::from("/Library/Application Support/edgeguard/agent")
    } else {
        PathBuf::from("/var/lib/edgeguard-agent")
    }
}

fn default_log_dir() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\ProgramData\EdgeGuard\Agent\logs")
    } else {
        PathBuf::from("/var/log/edgeguard-agent")
    }
}
