//! Filesystem layout for the agent.
//!
//! Every path the agent touches is derived here so tests can point the whole
//! agent at a temp directory with [`AgentPaths::with_root`].
//!
//! ```text
//! <code_root>/<codeName>          supervised executables
//! <daemon_dir>/state.json         durable snapshot of DaemonState
//! <daemon_dir>/daemon_has_started marker: a snapshot may exist to recover
//! ```

use std::path::{Path, PathBuf};

pub const DEFAULT_CODE_ROOT: &str = "/hpcaas/code";
pub const DEFAULT_DAEMON_DIR: &str = "/hpcaas/daemon";
const SNAPSHOT_FILE: &str = "state.json";
const STARTUP_MARKER: &str = "daemon_has_started";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    code_root: PathBuf,
    daemon_dir: PathBuf,
}

impl Default for AgentPaths {
    fn default() -> Self {
        Self {
            code_root: PathBuf::from(DEFAULT_CODE_ROOT),
            daemon_dir: PathBuf::from(DEFAULT_DAEMON_DIR),
        }
    }
}

impl AgentPaths {
    pub fn new(code_root: PathBuf, daemon_dir: PathBuf) -> Self {
        Self {
            code_root,
            daemon_dir,
        }
    }

    /// Lays out `code/` and `daemon/` under a single root. Used by tests.
    pub fn with_root(root: &Path) -> Self {
        Self {
            code_root: root.join("code"),
            daemon_dir: root.join("daemon"),
        }
    }

    pub fn code_root(&self) -> &Path {
        &self.code_root
    }

    pub fn daemon_dir(&self) -> &Path {
        &self.daemon_dir
    }

    /// Location of the executable for `code_name`. Does not check existence.
    pub fn executable(&self, code_name: &str) -> PathBuf {
        self.code_root.join(code_name)
    }

    pub fn snapshot_file(&self) -> PathBuf {
        self.daemon_dir.join(SNAPSHOT_FILE)
    }

    pub fn startup_marker(&self) -> PathBuf {
        self.daemon_dir.join(STARTUP_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_container_convention() {
        let paths = AgentPaths::default();
        assert_eq!(paths.executable("lammps"), PathBuf::from("/hpcaas/code/lammps"));
        assert_eq!(
            paths.startup_marker(),
            PathBuf::from("/hpcaas/daemon/daemon_has_started")
        );
    }

    #[test]
    fn with_root_isolates_everything() {
        let paths = AgentPaths::with_root(Path::new("/tmp/agent-test"));
        assert!(paths.snapshot_file().starts_with("/tmp/agent-test"));
        assert!(paths.executable("x").starts_with("/tmp/agent-test/code"));
    }
}
