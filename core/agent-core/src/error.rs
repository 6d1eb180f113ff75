//! Error types for agent-core operations.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Supervisor Errors (returned to the control surface)
// ═══════════════════════════════════════════════════════════════════════════════

/// Failures of `execute_code` / `kill_code`.
///
/// Precondition violations (`AlreadyRunning`, `NoProcessRunning`) leave state
/// untouched. The others are also recorded in state as a status transition.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Code already started")]
    AlreadyRunning,

    #[error("Code executable is missing: {}", path.display())]
    ExecutableMissing { path: PathBuf },

    #[error("Code failed to start: {}: {source}", path.display())]
    StartFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No process currently running")]
    NoProcessRunning,

    #[error("Code cannot be reset while a process may still be alive")]
    ResetRefused,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Persistence Errors (always logged, never fatal)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
