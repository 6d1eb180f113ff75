//! Lifecycle of the supervised code.
//!
//! ```text
//! Waiting --execute, executable missing--> Missing
//! Waiting --execute, spawn fails---------> FailedToStart
//! Waiting --execute, spawned-------------> Running (ByAgent)
//! Waiting --reconciler finds process-----> Running (Externally)
//! Running --child exits 0----------------> Stopped
//! Running --child fails------------------> Error
//! Running --kill-------------------------> Killed (before the signal is sent)
//! Killed  --signal delivery fails--------> FailedToKill
//! Killed  --child exits------------------> Killed
//! Running/Killed --adopted pid vanishes--> Stopped
//! ```
//!
//! Operations that start or stop a process hold the control lock, so the
//! status check and the transition that follows are one step as far as other
//! operations are concerned. Watchers do not take it; they go through the
//! store's guarded transitions instead.

use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use hpcaas_daemon_protocol::{validate_code_name, CodeStatus, StartedMethod};
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};
use crate::process::ProcessProbe;
use crate::shutdown::StopSignal;
use crate::state::{RunOutcome, StateStore};
use crate::storage::AgentPaths;

pub struct Supervisor {
    store: Arc<StateStore>,
    paths: AgentPaths,
    probe: Arc<dyn ProcessProbe>,
    stop: StopSignal,
    adopted_poll_interval: Duration,
    control: Mutex<()>,
}

impl Supervisor {
    pub fn new(
        store: Arc<StateStore>,
        paths: AgentPaths,
        probe: Arc<dyn ProcessProbe>,
        stop: StopSignal,
        adopted_poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            paths,
            probe,
            stop,
            adopted_poll_interval,
            control: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Starts the code named in the store and returns its pid.
    ///
    /// Returns as soon as the child is running; a watcher thread records
    /// its exit status and output.
    pub fn execute_code(&self) -> Result<u32> {
        let _control = self.control();
        let state = self.store.snapshot();
        if state.code_status != CodeStatus::Waiting {
            return Err(SupervisorError::AlreadyRunning);
        }

        let path = self.paths.executable(&state.code_name);
        if validate_code_name(&state.code_name).is_err() || !path.is_file() {
            warn!(path = %path.display(), "Code executable is missing");
            self.store.record_failure(
                CodeStatus::Missing,
                &format!("code executable is missing: {}", path.display()),
            );
            return Err(SupervisorError::ExecutableMissing { path });
        }

        let spawned = Command::new(&path)
            .args(&state.code_arguments)
            .env_clear()
            .envs(&state.code_params)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(source) => {
                warn!(path = %path.display(), error = %source, "Code failed to start");
                self.store.record_failure(
                    CodeStatus::FailedToStart,
                    &format!("code failed to start: {}: {}", path.display(), source),
                );
                return Err(SupervisorError::StartFailed { path, source });
            }
        };

        let pid = child.id();
        self.store.begin_run(StartedMethod::ByAgent, pid);
        info!(pid, path = %path.display(), "Code started");
        self.spawn_child_watcher(child, pid, path);
        Ok(pid)
    }

    /// Sends SIGTERM to the running code.
    ///
    /// The status becomes `Killed` before the signal goes out. Does not wait
    /// for the process to die; its watcher finishes the bookkeeping.
    pub fn kill_code(&self) -> Result<()> {
        let _control = self.control();
        let pid = match self.store.claim_kill() {
            Ok(pid) => pid,
            Err(status) => {
                debug!(status = status.as_str(), "Kill requested with no running code");
                return Err(SupervisorError::NoProcessRunning);
            }
        };

        let Some(pid) = pid else {
            warn!("Running code has no recorded pid");
            self.store
                .record_failure(CodeStatus::FailedToKill, "no pid recorded for running code");
            return Ok(());
        };

        if !self.probe.is_alive(pid) {
            debug!(pid, "Code already exited before kill");
            return Ok(());
        }

        match self.probe.terminate(pid) {
            Ok(()) => info!(pid, "Sent SIGTERM to code"),
            Err(err) => {
                warn!(pid, error = %err, "Failed to signal code");
                self.store.record_failure(
                    CodeStatus::FailedToKill,
                    &format!("failed to kill code process {}: {}", pid, err),
                );
            }
        }
        Ok(())
    }

    /// Adopts a process named like the code if nothing is supervised yet.
    /// Returns the adopted pid.
    pub fn try_adopt(&self) -> Option<u32> {
        if self.store.code_status() != CodeStatus::Waiting {
            return None;
        }
        let code_name = self.store.code_name();
        let pid = self.probe.find_by_name(&code_name)?;

        let _control = self.control();
        let state = self.store.snapshot();
        if state.code_status != CodeStatus::Waiting || state.code_name != code_name {
            return None;
        }
        if !self.probe.is_alive(pid) {
            return None;
        }

        self.store.begin_run(StartedMethod::Externally, pid);
        info!(pid, code_name = %code_name, "Adopted externally started code");
        self.spawn_liveness_watcher(pid);
        Some(pid)
    }

    /// Reconnects to a run recorded in a rehydrated snapshot.
    ///
    /// The child handle did not survive the restart, so a live process is
    /// watched by liveness only. A `Running` process that vanished while the
    /// agent was down is recorded as `Stopped`.
    pub fn resume_after_recovery(&self) {
        let _control = self.control();
        let state = self.store.snapshot();
        if !state.code_status.has_live_process() {
            return;
        }

        match state.code_pid {
            Some(pid) if self.probe.is_alive(pid) => {
                info!(
                    pid,
                    status = state.code_status.as_str(),
                    "Resuming supervision of recovered process"
                );
                self.spawn_liveness_watcher(pid);
            }
            pid => {
                let status = self.store.settle_lost_run(pid);
                info!(pid = ?pid, status = status.as_str(), "Recovered process is gone");
            }
        }
    }

    /// Returns a finished code to `Waiting` so it can be started again.
    ///
    /// Refused while the recorded process may still run: always for
    /// `Running`, and for `Killed` or `FailedToKill` until the pid is gone.
    pub fn reset_code(&self) -> Result<()> {
        let _control = self.control();
        let state = self.store.snapshot();
        let refuse = match state.code_status {
            CodeStatus::Waiting => return Ok(()),
            CodeStatus::Running => true,
            CodeStatus::Killed | CodeStatus::FailedToKill => state
                .code_pid
                .map(|pid| self.probe.is_alive(pid))
                .unwrap_or(false),
            CodeStatus::Stopped
            | CodeStatus::Missing
            | CodeStatus::FailedToStart
            | CodeStatus::Error => false,
        };
        if refuse {
            return Err(SupervisorError::ResetRefused);
        }

        self.store.reset_to_waiting();
        info!(from = state.code_status.as_str(), "Code reset to waiting");
        Ok(())
    }

    fn spawn_child_watcher(&self, child: Child, pid: u32, path: PathBuf) {
        let store = Arc::clone(&self.store);
        // The child stays reachable here if the thread never starts.
        let handoff = Arc::new(Mutex::new(Some(child)));
        let watched = Arc::clone(&handoff);
        let spawned = thread::Builder::new()
            .name(format!("code-watcher-{}", pid))
            .spawn(move || {
                let child = watched.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(child) = child {
                    watch_child(store, child, pid);
                }
            });
        if let Err(err) = spawned {
            warn!(pid, error = %err, "Failed to spawn code watcher");
            let orphan = handoff.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(child) = orphan {
                self.abandon_child(
                    child,
                    pid,
                    format!("could not watch {} (pid {}): {}", path.display(), pid, err),
                );
            }
        }
    }

    /// Stops and reaps a child nobody can watch, recording the run as failed.
    fn abandon_child(&self, mut child: Child, pid: u32, reason: String) {
        if let Err(err) = child.kill() {
            debug!(pid, error = %err, "Unwatched child already exited");
        }
        let status = match child.wait() {
            Ok(_) => self
                .store
                .finish_run(pid, RunOutcome::Failure(reason), String::new(), String::new()),
            Err(err) => self.store.finish_run(
                pid,
                RunOutcome::Failure(format!("{}; reaping failed: {}", reason, err)),
                String::new(),
                String::new(),
            ),
        };
        warn!(pid, status = status.as_str(), "Abandoned unwatched code process");
    }

    fn spawn_liveness_watcher(&self, pid: u32) {
        let store = Arc::clone(&self.store);
        let probe = Arc::clone(&self.probe);
        let stop = self.stop.clone();
        let interval = self.adopted_poll_interval;
        let spawned = thread::Builder::new()
            .name(format!("adopted-watcher-{}", pid))
            .spawn(move || watch_liveness(store, probe, stop, pid, interval));
        if let Err(err) = spawned {
            warn!(pid, error = %err, "Failed to spawn adopted process watcher");
            self.store
                .add_error_message(format!("could not watch adopted pid {}: {}", pid, err));
        }
    }

    fn control(&self) -> MutexGuard<'_, ()> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn watch_child(store: Arc<StateStore>, child: Child, pid: u32) {
    let (outcome, stdout, stderr) = match child.wait_with_output() {
        Ok(output) => {
            let outcome = if output.status.success() {
                RunOutcome::Success
            } else {
                RunOutcome::Failure(describe_exit(output.status))
            };
            (
                outcome,
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            )
        }
        Err(err) => (
            RunOutcome::Failure(format!("failed to wait on code process {}: {}", pid, err)),
            String::new(),
            String::new(),
        ),
    };

    let status = store.finish_run(pid, outcome, stdout, stderr);
    info!(pid, status = status.as_str(), "Code process exited");
}

fn watch_liveness(
    store: Arc<StateStore>,
    probe: Arc<dyn ProcessProbe>,
    stop: StopSignal,
    pid: u32,
    interval: Duration,
) {
    loop {
        if stop.wait_timeout(interval) {
            debug!(pid, "Adopted process watcher stopped");
            return;
        }
        if store.code_pid() != Some(pid) {
            debug!(pid, "Adopted process no longer tracked");
            return;
        }
        if !probe.is_alive(pid) {
            if store.mark_process_gone(pid) {
                info!(pid, "Adopted process exited");
            }
            return;
        }
    }
}

#[cfg(unix)]
fn describe_exit(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("code exited with status {}", code),
        (None, Some(signal)) => format!("code terminated by signal {}", signal),
        _ => format!("code exited abnormally: {}", status),
    }
}

#[cfg(not(unix))]
fn describe_exit(status: ExitStatus) -> String {
    format!("code exited abnormally: {}", status)
}
