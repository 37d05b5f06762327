//! The root runtime value: constructed once at startup, it owns the
//! session tracker, the lifecycle manager and the event bus, and runs
//! the control loop that feeds state diffs into the manager.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::Receiver;
use tracing::info;

use crate::config::{ApiKeys, DemodConfig};
use crate::events::{Event, EventBus};
use crate::manager::RuntimeManager;
use crate::session::SessionTracker;

pub struct Runtime {
    pub tracker: Arc<SessionTracker>,
    pub manager: Arc<RuntimeManager>,
    pub events: EventBus,
    control: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Build the runtime and start the control-plane thread. Returns
    /// the runtime plus the receiver carrying every emitted event;
    /// delivery to clients is the caller's concern.
    pub fn start(
        demod_config: DemodConfig,
        api_keys: ApiKeys,
        output_dir: impl Into<String>,
    ) -> (Self, Receiver<Event>) {
        let (events, event_rx) = EventBus::new();
        let (tracker, changes) = SessionTracker::new();
        let tracker = Arc::new(tracker);
        let manager = Arc::new(RuntimeManager::new(
            Arc::clone(&tracker),
            events.clone(),
            demod_config,
            api_keys,
            output_dir,
        ));

        let manager_for_loop = Arc::clone(&manager);
        let control = std::thread::Builder::new()
            .name("groundwave-control".to_string())
            .spawn(move || {
                manager_for_loop.run(changes);
                info!("control loop finished");
            })
            .expect("spawning the control thread cannot fail with a valid name");

        (
            Self {
                tracker,
                manager,
                events,
                control: Some(control),
            },
            event_rx,
        )
    }

    /// Graceful shutdown: stop every source runtime, then let the
    /// control thread drain.
    pub fn shutdown(mut self) {
        info!("runtime shutting down");
        self.manager.shutdown();
        // Closing the diff channel ends the control loop.
        self.tracker.close();
        if let Some(control) = self.control.take() {
            let _ = control.join();
        }
    }
}
