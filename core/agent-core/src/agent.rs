//! Agent - wires the state store, supervisor and reconciler together.
//!
//! Startup order:
//! 1. Open the state store (first start, or rehydrate from the last snapshot)
//! 2. Reattach to any process recorded as running in a recovered snapshot
//! 3. Start the reconciliation thread
//!
//! ```rust,ignore
//! let agent = Agent::start(&config)?;
//! agent.supervisor().execute_code()?;
//! agent.shutdown();
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::process::{ProcessProbe, SystemProbe};
use crate::reconcile::Reconciler;
use crate::shutdown::StopSignal;
use crate::state::{StateOrigin, StateStore};
use crate::supervisor::Supervisor;

pub struct Agent {
    store: Arc<StateStore>,
    supervisor: Arc<Supervisor>,
    origin: StateOrigin,
    stop: StopSignal,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    /// Starts the agent against the real process table.
    pub fn start(config: &AgentConfig) -> std::io::Result<Self> {
        Self::start_with_probe(config, Arc::new(SystemProbe))
    }

    pub fn start_with_probe(
        config: &AgentConfig,
        probe: Arc<dyn ProcessProbe>,
    ) -> std::io::Result<Self> {
        let paths = config.paths();
        let (store, origin) = StateStore::open(&paths, &config.default_code_name);
        let store = Arc::new(store);
        let stop = StopSignal::new();

        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&store),
            paths,
            probe,
            stop.clone(),
            config.adopted_poll_interval(),
        ));
        if origin == StateOrigin::Recovered {
            supervisor.resume_after_recovery();
        }

        let reconciler = Reconciler::new(
            Arc::clone(&supervisor),
            stop.clone(),
            config.reconcile_interval(),
        )
        .spawn()?;

        info!(
            origin = ?origin,
            code_name = %store.code_name(),
            status = store.code_status().as_str(),
            "Agent started"
        );

        Ok(Self {
            store,
            supervisor,
            origin,
            stop,
            reconciler: Mutex::new(Some(reconciler)),
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn origin(&self) -> &StateOrigin {
        &self.origin
    }

    /// Blocks until the reconciler exits, i.e. until [`Agent::shutdown`] is
    /// called from another thread.
    pub fn wait(&self) {
        let handle = self.take_reconciler();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Reconciler thread panicked");
            }
        }
    }

    /// Stops background loops and flushes the last snapshot. Processes the
    /// agent started keep running.
    pub fn shutdown(&self) {
        self.stop.stop();
        self.wait();
        self.store.close();
        info!("Agent stopped");
    }

    fn take_reconciler(&self) -> Option<JoinHandle<()>> {
        self.reconciler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if !self.stop.is_stopped() {
            self.shutdown();
        }
    }
}
