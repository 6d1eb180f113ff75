//! Periodic reconciliation of declared state against the process table.
//!
//! The code can be launched by a peer's MPI/SSH session instead of through
//! `execute_code`. While the node is `Waiting`, every tick scans for a process
//! named like the code and adopts the first match.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::shutdown::StopSignal;
use crate::supervisor::Supervisor;

pub struct Reconciler {
    supervisor: Arc<Supervisor>,
    stop: StopSignal,
    interval: Duration,
}

impl Reconciler {
    pub fn new(supervisor: Arc<Supervisor>, stop: StopSignal, interval: Duration) -> Self {
        Self {
            supervisor,
            stop,
            interval,
        }
    }

    /// One reconciliation pass. Returns the adopted pid, if any.
    pub fn tick(&self) -> Option<u32> {
        self.supervisor.try_adopt()
    }

    /// Runs until the stop signal fires.
    pub fn run(self) {
        info!(interval_ms = self.interval.as_millis() as u64, "Reconciler started");
        while !self.stop.wait_timeout(self.interval) {
            if let Some(pid) = self.tick() {
                debug!(pid, "Reconciler adopted process");
            }
        }
        info!("Reconciler stopped");
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("reconciler".to_string())
            .spawn(move || self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessProbe;
    use crate::state::StateStore;
    use crate::storage::AgentPaths;
    use hpcaas_daemon_protocol::{CodeStatus, StartedMethod};
    use std::io;
    use std::path::Path;
    use std::time::Instant;

    struct OneProcess {
        name: &'static str,
        pid: u32,
    }

    impl ProcessProbe for OneProcess {
        fn find_by_name(&self, name: &str) -> Option<u32> {
            (name == self.name).then_some(self.pid)
        }

        fn is_alive(&self, pid: u32) -> bool {
            pid == self.pid
        }

        fn terminate(&self, _pid: u32) -> io::Result<()> {
            Ok(())
        }
    }

    fn reconciler(store: Arc<StateStore>, stop: StopSignal) -> Reconciler {
        let supervisor = Supervisor::new(
            store,
            AgentPaths::with_root(Path::new("/nonexistent/reconcile-test")),
            Arc::new(OneProcess { name: "wrf", pid: 31 }),
            stop.clone(),
            Duration::from_millis(10),
        );
        Reconciler::new(Arc::new(supervisor), stop, Duration::from_millis(10))
    }

    #[test]
    fn tick_adopts_only_while_waiting() {
        let store = Arc::new(StateStore::new_in_memory("wrf"));
        store.set_code_status(CodeStatus::Stopped);
        let stop = StopSignal::new();
        let reconciler = reconciler(Arc::clone(&store), stop.clone());

        assert_eq!(reconciler.tick(), None);
        assert_eq!(store.code_status(), CodeStatus::Stopped);
        stop.stop();
    }

    #[test]
    fn loop_adopts_and_stops_on_signal() {
        let store = Arc::new(StateStore::new_in_memory("wrf"));
        let stop = StopSignal::new();
        let handle = reconciler(Arc::clone(&store), stop.clone())
            .spawn()
            .expect("spawn reconciler");

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.code_status() != CodeStatus::Running && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(store.code_status(), CodeStatus::Running);
        assert_eq!(store.code_started_method(), Some(StartedMethod::Externally));
        assert_eq!(store.code_pid(), Some(31));

        stop.stop();
        handle.join().expect("reconciler thread");
    }
}
