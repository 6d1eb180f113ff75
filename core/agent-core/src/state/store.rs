//! Thread-safe owner of the node's [`DaemonState`].
//!
//! Readers take a shared lock and get a copy back; writers take the exclusive
//! lock. Every mutation marks the snapshot writer dirty before the lock is
//! released. The writer copies the state itself when it wakes, so its last
//! write always covers the last mutation, and the disk write never blocks a
//! mutation.
//!
//! Runtime fields (status, pid, outputs) are changed through the transition
//! methods below, which apply check-and-set in a single locked section so a
//! watcher can never overwrite a concurrent kill.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use chrono::{SecondsFormat, Utc};
use hpcaas_daemon_protocol::{CodeStatus, DaemonState, DeclaredState, StartedMethod};
use tracing::{info, warn};

use super::snapshot::{SnapshotWriter, Snapshotter};
use crate::storage::AgentPaths;

/// How an agent-started process ended, as seen by its watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure(String),
}

/// Where the initial state came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateOrigin {
    FirstStart,
    Recovered,
    /// Marker present but the snapshot could not be used.
    RecoveryFailed(String),
}

pub struct StateStore {
    state: Arc<RwLock<DaemonState>>,
    writer: Option<SnapshotWriter>,
}

impl StateStore {
    /// Store over `initial`, persisted through `snapshotter` when given.
    pub fn new(initial: DaemonState, snapshotter: Option<Snapshotter>) -> Self {
        let state = Arc::new(RwLock::new(initial));
        let writer = snapshotter
            .map(|snapshotter| SnapshotWriter::spawn(snapshotter, Arc::clone(&state)));
        Self { state, writer }
    }

    /// Store without durability. Used by tests and tooling.
    pub fn new_in_memory(code_name: &str) -> Self {
        Self::new(DaemonState::with_code_name(code_name), None)
    }

    /// Opens the store for a starting agent.
    ///
    /// On first start the marker file is created and the state starts from
    /// defaults. If the marker exists the last snapshot is loaded; a missing
    /// or unreadable snapshot falls back to defaults rather than failing.
    pub fn open(paths: &AgentPaths, default_code_name: &str) -> (Self, StateOrigin) {
        let marker = paths.startup_marker();
        let snapshotter = Snapshotter::new(paths.snapshot_file());

        let (initial, origin) = if marker.exists() {
            match snapshotter.load() {
                Ok(state) => {
                    info!(
                        path = %snapshotter.path().display(),
                        status = state.code_status.as_str(),
                        pid = ?state.code_pid,
                        "Rehydrated state from snapshot"
                    );
                    (state, StateOrigin::Recovered)
                }
                Err(err) => {
                    warn!(error = %err, "Failed to rehydrate state; starting from defaults");
                    (
                        DaemonState::with_code_name(default_code_name),
                        StateOrigin::RecoveryFailed(err.to_string()),
                    )
                }
            }
        } else {
            if let Err(err) = write_marker(paths) {
                warn!(error = %err, path = %marker.display(), "Failed to write startup marker");
            }
            (
                DaemonState::with_code_name(default_code_name),
                StateOrigin::FirstStart,
            )
        };

        let store = Self::new(initial, Some(snapshotter));
        // Persist immediately so the marker never points at a missing snapshot.
        store.mark_dirty();
        (store, origin)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> DaemonState {
        self.read().clone()
    }

    pub fn code_name(&self) -> String {
        self.read().code_name.clone()
    }

    pub fn code_arguments(&self) -> Vec<String> {
        self.read().code_arguments.clone()
    }

    pub fn code_params(&self) -> BTreeMap<String, String> {
        self.read().code_params.clone()
    }

    pub fn code_status(&self) -> CodeStatus {
        self.read().code_status
    }

    pub fn code_started_method(&self) -> Option<StartedMethod> {
        self.read().code_started_method
    }

    pub fn code_pid(&self) -> Option<u32> {
        self.read().code_pid
    }

    pub fn code_stdout(&self) -> String {
        self.read().code_stdout.clone()
    }

    pub fn code_stderr(&self) -> String {
        self.read().code_stderr.clone()
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.read().error_messages.clone()
    }

    pub fn ssh_addresses(&self) -> BTreeMap<u32, String> {
        self.read().ssh_addresses.clone()
    }

    pub fn authorization_key(&self) -> String {
        self.read().authorization_key.clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_code_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.mutate(|state| state.code_name = name);
    }

    pub fn set_code_arguments(&self, arguments: Vec<String>) {
        self.mutate(|state| state.code_arguments = arguments);
    }

    pub fn set_code_params(&self, params: BTreeMap<String, String>) {
        self.mutate(|state| state.code_params = params);
    }

    /// Overlays `params` onto the current map; incoming values win.
    pub fn merge_code_params(&self, params: BTreeMap<String, String>) {
        self.mutate(|state| state.code_params.extend(params));
    }

    pub fn set_code_status(&self, status: CodeStatus) {
        self.mutate(|state| state.code_status = status);
    }

    pub fn set_code_started_method(&self, method: Option<StartedMethod>) {
        self.mutate(|state| state.code_started_method = method);
    }

    pub fn set_code_pid(&self, pid: Option<u32>) {
        self.mutate(|state| state.code_pid = pid);
    }

    pub fn set_code_stdout(&self, stdout: impl Into<String>) {
        let stdout = stdout.into();
        self.mutate(|state| state.code_stdout = stdout);
    }

    pub fn set_code_stderr(&self, stderr: impl Into<String>) {
        let stderr = stderr.into();
        self.mutate(|state| state.code_stderr = stderr);
    }

    pub fn add_error_message(&self, message: impl AsRef<str>) {
        let entry = stamp(message.as_ref());
        self.mutate(|state| state.error_messages.push(entry));
    }

    pub fn set_ssh_addresses(&self, addresses: BTreeMap<u32, String>) {
        self.mutate(|state| state.ssh_addresses = addresses);
    }

    pub fn set_authorization_key(&self, key: impl Into<String>) {
        let key = key.into();
        self.mutate(|state| state.authorization_key = key);
    }

    /// Applies a control-plane update in one locked section. Runtime fields
    /// are not part of [`DeclaredState`] and are never touched here.
    pub fn apply_declared(&self, declared: DeclaredState) {
        self.mutate(|state| {
            if let Some(name) = declared.code_name {
                state.code_name = name;
            }
            if let Some(arguments) = declared.code_arguments {
                state.code_arguments = arguments;
            }
            if let Some(params) = declared.code_params {
                state.code_params = params;
            }
            if let Some(addresses) = declared.ssh_addresses {
                state.ssh_addresses = addresses;
            }
            if let Some(key) = declared.authorization_key {
                state.authorization_key = key;
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Run transitions
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn begin_run(&self, method: StartedMethod, pid: u32) {
        self.mutate(|state| {
            state.code_started_method = Some(method);
            state.code_pid = Some(pid);
            state.code_status = CodeStatus::Running;
        });
    }

    /// Records a failed start attempt and moves to `status`.
    pub(crate) fn record_failure(&self, status: CodeStatus, message: &str) {
        let entry = stamp(message);
        self.mutate(|state| {
            state.code_status = status;
            state.error_messages.push(entry);
        });
    }

    /// Records the end of an agent-started run.
    ///
    /// Only a `Running` status moves: success to `Stopped`, failure to
    /// `Error`. `Killed` and any later status are kept. Output is captured
    /// whenever the run still belongs to `pid`. Returns the resulting status.
    pub(crate) fn finish_run(
        &self,
        pid: u32,
        outcome: RunOutcome,
        stdout: String,
        stderr: String,
    ) -> CodeStatus {
        let entry = match &outcome {
            RunOutcome::Failure(reason) => Some(stamp(reason)),
            RunOutcome::Success => None,
        };
        self.mutate(|state| {
            if state.code_pid != Some(pid) {
                return state.code_status;
            }
            if state.code_status == CodeStatus::Running {
                match entry {
                    None => state.code_status = CodeStatus::Stopped,
                    Some(entry) => {
                        state.code_status = CodeStatus::Error;
                        state.error_messages.push(entry);
                    }
                }
            }
            state.code_stdout = stdout;
            state.code_stderr = stderr;
            state.code_status
        })
    }

    /// Adopted process `pid` is gone. Any live status becomes `Stopped`.
    pub(crate) fn mark_process_gone(&self, pid: u32) -> bool {
        self.mutate(|state| {
            if state.code_pid == Some(pid) && state.code_status.has_live_process() {
                state.code_status = CodeStatus::Stopped;
                true
            } else {
                false
            }
        })
    }

    /// A recovered run whose process is gone. `Running` becomes `Stopped`
    /// with a diagnostic; `Killed` is kept. Returns the resulting status.
    pub(crate) fn settle_lost_run(&self, pid: Option<u32>) -> CodeStatus {
        let entry = stamp(&match pid {
            Some(pid) => format!("code process {} exited while the agent was down", pid),
            None => "running code had no recorded pid after restart".to_string(),
        });
        self.mutate(|state| {
            if state.code_pid == pid && state.code_status == CodeStatus::Running {
                state.code_status = CodeStatus::Stopped;
                state.error_messages.push(entry);
            }
            state.code_status
        })
    }

    /// `Running` → `Killed`. Returns the pid to signal, or the status that
    /// prevented the transition.
    pub(crate) fn claim_kill(&self) -> Result<Option<u32>, CodeStatus> {
        self.mutate(|state| {
            if state.code_status != CodeStatus::Running {
                return Err(state.code_status);
            }
            state.code_status = CodeStatus::Killed;
            Ok(state.code_pid)
        })
    }

    /// Back to `Waiting` after a run, keeping outputs and the error log.
    pub(crate) fn reset_to_waiting(&self) {
        self.mutate(|state| {
            state.code_status = CodeStatus::Waiting;
            state.code_pid = None;
            state.code_started_method = None;
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Durability
    // ─────────────────────────────────────────────────────────────────────

    /// Blocks until queued snapshots are on disk. No-op without a writer.
    pub fn flush_snapshots(&self) {
        if let Some(writer) = &self.writer {
            writer.flush();
        }
    }

    /// Flushes and stops the snapshot writer.
    pub fn close(&self) {
        if let Some(writer) = &self.writer {
            writer.shutdown();
        }
    }

    fn mark_dirty(&self) {
        if let Some(writer) = &self.writer {
            writer.mark_dirty();
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, DaemonState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<R>(&self, apply: impl FnOnce(&mut DaemonState) -> R) -> R {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let result = apply(&mut state);
        self.mark_dirty();
        result
    }
}

fn stamp(message: &str) -> String {
    format!(
        "{} {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        message
    )
}

fn write_marker(paths: &AgentPaths) -> std::io::Result<()> {
    fs_err::create_dir_all(paths.daemon_dir())?;
    fs_err::write(paths.startup_marker(), b"")
}
