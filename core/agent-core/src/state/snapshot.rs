//! Durable snapshots of the supervision state.
//!
//! # File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "saved_at": "2026-10-16T09:00:00+00:00",
//!   "state": { "codeName": "...", "codeStatus": "running", ... }
//! }
//! ```
//!
//! Writes go through a single writer thread fed by a channel. Callers only
//! mark the state dirty and return immediately; the writer copies the shared
//! state when it wakes, so a burst of mutations becomes one write of the
//! current state. The file is replaced atomically (temp file in the same
//! directory + rename) so a crash mid-write leaves the previous snapshot
//! intact.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use hpcaas_daemon_protocol::{DaemonState, SNAPSHOT_VERSION};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::SnapshotError;

#[derive(Debug, Deserialize)]
struct SnapshotFile {
    version: u32,
    state: DaemonState,
}

#[derive(Serialize)]
struct SnapshotEnvelope<'a> {
    version: u32,
    saved_at: String,
    state: &'a DaemonState,
}

/// Reads and writes the snapshot file. Writes are serialized by a file lock
/// that is independent of the state lock.
#[derive(Debug)]
pub struct Snapshotter {
    path: PathBuf,
    file_lock: Mutex<()>,
}

impl Snapshotter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, state: &DaemonState) -> Result<(), SnapshotError> {
        let _guard = self
            .file_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let file = SnapshotEnvelope {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now().to_rfc3339(),
            state,
        };
        let content = serde_json::to_vec_pretty(&file).map_err(|source| SnapshotError::Json {
            context: "serialize snapshot".to_string(),
            source,
        })?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs_err::create_dir_all(parent).map_err(|source| SnapshotError::Io {
            context: format!("create snapshot dir {}", parent.display()),
            source,
        })?;

        let mut temp_file = NamedTempFile::new_in(parent).map_err(|source| SnapshotError::Io {
            context: "create temp snapshot".to_string(),
            source,
        })?;
        temp_file
            .write_all(&content)
            .and_then(|_| temp_file.flush())
            .map_err(|source| SnapshotError::Io {
                context: "write temp snapshot".to_string(),
                source,
            })?;
        temp_file
            .persist(&self.path)
            .map_err(|err| SnapshotError::Io {
                context: format!("commit snapshot {}", self.path.display()),
                source: err.error,
            })?;
        Ok(())
    }

    pub fn load(&self) -> Result<DaemonState, SnapshotError> {
        load_snapshot(&self.path)
    }
}

/// Reads a snapshot file without going through a writer.
pub fn load_snapshot(path: &Path) -> Result<DaemonState, SnapshotError> {
    let content = fs_err::read(path).map_err(|source| SnapshotError::Io {
        context: format!("read snapshot {}", path.display()),
        source,
    })?;
    let file: SnapshotFile =
        serde_json::from_slice(&content).map_err(|source| SnapshotError::Json {
            context: format!("parse snapshot {}", path.display()),
            source,
        })?;
    if file.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion {
            found: file.version,
            expected: SNAPSHOT_VERSION,
        });
    }
    Ok(file.state)
}

enum SnapshotCommand {
    Dirty,
    Flush(Sender<()>),
}

/// Handle to the background snapshot writer thread.
pub struct SnapshotWriter {
    sender: Mutex<Option<Sender<SnapshotCommand>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotWriter {
    /// Starts a writer that persists `source` whenever it is marked dirty.
    pub fn spawn(snapshotter: Snapshotter, source: Arc<RwLock<DaemonState>>) -> Self {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("snapshot-writer".to_string())
            .spawn(move || run_writer(snapshotter, source, receiver));

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "Failed to spawn snapshot writer; persistence disabled");
                None
            }
        };
        let sender = handle.as_ref().map(|_| sender);

        Self {
            sender: Mutex::new(sender),
            handle: Mutex::new(handle),
        }
    }

    /// Schedules a write of the current state. Never blocks on disk.
    pub fn mark_dirty(&self) {
        self.send(SnapshotCommand::Dirty);
    }

    /// Blocks until every change marked before this call has been written.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.send(SnapshotCommand::Flush(ack_tx)) {
            let _ = ack_rx.recv();
        }
    }

    /// Drains outstanding writes and stops the writer thread.
    pub fn shutdown(&self) {
        self.flush();
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Snapshot writer thread panicked");
            }
        }
    }

    fn send(&self, command: SnapshotCommand) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(command).is_ok(),
            None => false,
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_writer(
    snapshotter: Snapshotter,
    source: Arc<RwLock<DaemonState>>,
    receiver: Receiver<SnapshotCommand>,
) {
    while let Ok(command) = receiver.recv() {
        let mut dirty = false;
        let mut acks = Vec::new();
        collect(command, &mut dirty, &mut acks);
        while let Ok(command) = receiver.try_recv() {
            collect(command, &mut dirty, &mut acks);
        }

        if dirty {
            let state = source.read().unwrap_or_else(PoisonError::into_inner).clone();
            match snapshotter.write(&state) {
                Ok(()) => debug!(
                    path = %snapshotter.path().display(),
                    status = state.code_status.as_str(),
                    "Snapshot written"
                ),
                Err(err) => warn!(error = %err, "Failed to write state snapshot"),
            }
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }
    debug!("Snapshot writer stopped");
}

fn collect(command: SnapshotCommand, dirty: &mut bool, acks: &mut Vec<Sender<()>>) {
    match command {
        SnapshotCommand::Dirty => *dirty = true,
        SnapshotCommand::Flush(ack) => acks.push(ack),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpcaas_daemon_protocol::CodeStatus;

    #[test]
    fn write_then_load() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let snapshotter = Snapshotter::new(temp_dir.path().join("daemon").join("state.json"));

        let mut state = DaemonState::with_code_name("namd");
        state.code_status = CodeStatus::Killed;
        state.code_pid = Some(777);
        snapshotter.write(&state).expect("write");

        assert_eq!(snapshotter.load().expect("load"), state);
    }

    #[test]
    fn load_rejects_unknown_version() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("state.json");
        fs_err::write(&path, r#"{"version": 99, "state": {}}"#).expect("write");

        let err = load_snapshot(&path).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::UnsupportedVersion { found: 99, .. }
        ));
    }

    #[test]
    fn load_rejects_corrupt_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("state.json");
        fs_err::write(&path, "{ not json").expect("write");

        assert!(matches!(
            load_snapshot(&path).unwrap_err(),
            SnapshotError::Json { .. }
        ));
    }

    #[test]
    fn writer_persists_latest_shared_state() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("state.json");
        let source = Arc::new(RwLock::new(DaemonState::default()));
        let writer = SnapshotWriter::spawn(Snapshotter::new(path.clone()), Arc::clone(&source));

        for i in 0..50 {
            {
                let mut state = source.write().expect("state lock");
                state.code_name = format!("code-{}", i);
                state.code_arguments = vec![i.to_string()];
            }
            writer.mark_dirty();
        }
        writer.flush();

        let loaded = load_snapshot(&path).expect("load");
        assert_eq!(loaded.code_name, "code-49");
        assert_eq!(loaded.code_arguments, vec!["49".to_string()]);
    }

    #[test]
    fn flush_without_changes_writes_nothing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("state.json");
        let source = Arc::new(RwLock::new(DaemonState::default()));
        let writer = SnapshotWriter::spawn(Snapshotter::new(path.clone()), source);

        writer.flush();
        assert!(!path.exists());
        writer.shutdown();
    }

    #[test]
    fn writer_survives_unwritable_path() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let blocker = temp_dir.path().join("not-a-dir");
        fs_err::write(&blocker, "").expect("write");
        let source = Arc::new(RwLock::new(DaemonState::default()));
        let writer = SnapshotWriter::spawn(Snapshotter::new(blocker.join("state.json")), source);

        writer.mark_dirty();
        writer.flush();
        writer.mark_dirty();
        writer.shutdown();
    }
}
