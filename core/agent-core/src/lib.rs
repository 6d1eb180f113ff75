//! # agent-core
//!
//! Supervision core of the hpcaas per-node agent: it starts, watches and
//! kills exactly one user executable, adopts it when something else (an MPI
//! launcher over SSH) starts it, and keeps a crash-recoverable record of all
//! of it.
//!
//! ## Design Principles
//!
//! - **Synchronous**: background work runs on plain threads; no async runtime.
//! - **One owner of state**: every component shares one [`StateStore`] handle;
//!   nothing reads or writes [`DaemonState`] fields directly.
//! - **Background failures become state**: watchers and the reconciler never
//!   return errors, they record a status or an error message.
//! - **Best-effort durability**: snapshots lag mutations and may be lost on a
//!   crash; persistence failures are logged, not fatal.

pub mod agent;
pub mod config;
pub mod error;
pub mod process;
pub mod reconcile;
pub mod shutdown;
pub mod state;
pub mod storage;
pub mod supervisor;

pub use agent::Agent;
pub use config::{load_config, resolve_config_path, AgentConfig, LoggingConfig};
pub use error::{ConfigError, Result, SnapshotError, SupervisorError};
pub use hpcaas_daemon_protocol::{
    parse_declared_state, CodeStatus, DaemonState, DeclaredState, ErrorInfo, StartedMethod,
};
pub use process::{ProcessProbe, SystemProbe};
pub use reconcile::Reconciler;
pub use shutdown::StopSignal;
pub use state::{load_snapshot, StateOrigin, StateStore};
pub use storage::AgentPaths;
pub use supervisor::Supervisor;
