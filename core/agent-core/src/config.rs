//! Agent configuration loaded from TOML.
//!
//! Every key is optional; a missing file yields [`AgentConfig::default`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::storage::{AgentPaths, DEFAULT_CODE_ROOT, DEFAULT_DAEMON_DIR};

pub const DEFAULT_CONFIG_PATH: &str = "/hpcaas/daemon/agent.toml";
pub const CONFIG_PATH_ENV: &str = "HPCAAS_AGENT_CONFIG";
pub const DEFAULT_CODE_NAME: &str = "hpcaas-code";
pub const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_ADOPTED_POLL_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AgentConfig {
    #[serde(default = "default_code_root")]
    pub code_root: PathBuf,
    #[serde(default = "default_daemon_dir")]
    pub daemon_dir: PathBuf,
    #[serde(default = "default_code_name")]
    pub default_code_name: String,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    #[serde(default = "default_adopted_poll_interval_ms")]
    pub adopted_poll_interval_ms: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Extra log sink next to stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Default filter when `RUST_LOG` is unset, e.g. `"info"` or `"agent_core=debug"`.
    #[serde(default)]
    pub level: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            code_root: default_code_root(),
            daemon_dir: default_daemon_dir(),
            default_code_name: default_code_name(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            adopted_poll_interval_ms: default_adopted_poll_interval_ms(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Config rooted at a single directory, for tests.
    pub fn with_root(root: &Path) -> Self {
        let paths = AgentPaths::with_root(root);
        Self {
            code_root: paths.code_root().to_path_buf(),
            daemon_dir: paths.daemon_dir().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn paths(&self) -> AgentPaths {
        AgentPaths::new(self.code_root.clone(), self.daemon_dir.clone())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }

    pub fn adopted_poll_interval(&self) -> Duration {
        Duration::from_millis(self.adopted_poll_interval_ms.max(1))
    }
}

/// Resolves the config path: explicit argument, then `HPCAAS_AGENT_CONFIG`,
/// then [`DEFAULT_CONFIG_PATH`].
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn load_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    if !path.exists() {
        return Ok(AgentConfig::default());
    }

    let content = fs_err::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<AgentConfig>(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_code_root() -> PathBuf {
    PathBuf::from(DEFAULT_CODE_ROOT)
}

fn default_daemon_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DAEMON_DIR)
}

fn default_code_name() -> String {
    DEFAULT_CODE_NAME.to_string()
}

fn default_reconcile_interval_ms() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_MS
}

fn default_adopted_poll_interval_ms() -> u64 {
    DEFAULT_ADOPTED_POLL_INTERVAL_MS
}
