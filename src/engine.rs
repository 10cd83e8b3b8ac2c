use std::sync::Arc;
use std::time::Duration;

use crate::classifier::{VolumeClassifier, CLASSIFICATION_TTL};
use crate::config::Configuration;
use crate::device::InventoryPoller;
use crate::error::KillSwitchError;
use crate::host::Host;
use crate::logger::{EventLog, EventSink};
use crate::pipeline::{ResponsePipeline, TaskResult};
use crate::watcher::{
    identifier_loop, inventory_loop, Services, WatcherKind, WatcherSlot, WatcherState, DISARM_SIGNALS,
};

/// Owns the classification cache and both watchers for the lifetime of the
/// process. Dropping it without `shutdown` leaves running loops detached.
pub struct Engine {
    services: Arc<Services>,
    identifier: Arc<WatcherSlot>,
    inventory: Arc<WatcherSlot>,
}

impl Engine {
    pub fn new(host: Arc<dyn Host>, sink: Arc<dyn EventSink>) -> Self {
        Self::with_classifier_ttl(host, sink, CLASSIFICATION_TTL)
    }

    pub fn with_classifier_ttl(host: Arc<dyn Host>, sink: Arc<dyn EventSink>, ttl: Duration) -> Self {
        let events = EventLog::new(sink);
        let classifier = Arc::new(VolumeClassifier::with_ttl(host.clone(), events.clone(), ttl));
        let services = Services {
            pipeline: ResponsePipeline::new(host.clone(), classifier.clone(), events.clone()),
            classifier,
            poller: InventoryPoller::new(host, events.clone()),
            events,
        };

        Self {
            services: Arc::new(services),
            identifier: Arc::new(WatcherSlot::new(WatcherKind::Identifier)),
            inventory: Arc::new(WatcherSlot::new(WatcherKind::Inventory)),
        }
    }

    fn slot(&self, kind: WatcherKind) -> &Arc<WatcherSlot> {
        match kind {
            WatcherKind::Identifier => &self.identifier,
            WatcherKind::Inventory => &self.inventory,
        }
    }

    /// Validate `config`, capture it for this armed run and start the
    /// watcher's loop. Re-arming an armed watcher replaces its loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(&self, kind: WatcherKind, config: Configuration) -> Result<WatcherState, KillSwitchError> {
        if let Err(e) = config.validate() {
            self.services.events.log_error(&format!("Cannot arm {} watcher: {}", kind, e));
            return Err(e.into());
        }

        let config = Arc::new(config);
        let slot = self.slot(kind).clone();
        let generation = slot.control().arm();
        let services = self.services.clone();

        let handle = match kind {
            WatcherKind::Identifier => {
                tokio::spawn(identifier_loop(slot.clone(), services, generation, config.clone()))
            }
            WatcherKind::Inventory => {
                tokio::spawn(inventory_loop(slot.clone(), services, generation, config.clone()))
            }
        };
        slot.track(handle);

        let tasks: Vec<String> = config.tasks.iter().map(|t| t.to_string()).collect();
        self.services.events.log_info(&format!(
            "{} watcher armed (identifier {}, tasks: {}, {} custom commands)",
            kind,
            config.identifier,
            tasks.join(", "),
            config.custom_commands.len()
        ));

        Ok(slot.control().state())
    }

    /// Count one disarm signal; the fifth disarms the watcher.
    pub fn request_disarm_signal(&self, kind: WatcherKind) -> WatcherState {
        let control = self.slot(kind).control();
        let was = control.state();
        let state = control.disarm_signal();

        match (was, state) {
            (WatcherState::Armed, WatcherState::Disarmed) => {
                self.services.events.log_info(&format!("{} watcher disarmed", kind));
            }
            (WatcherState::Armed, WatcherState::Armed) => {
                self.services.events.log_info(&format!(
                    "{} watcher disarm signal {}/{}",
                    kind,
                    control.counter(),
                    DISARM_SIGNALS
                ));
            }
            _ => {}
        }
        state
    }

    pub fn state(&self, kind: WatcherKind) -> WatcherState {
        self.slot(kind).control().state()
    }

    pub fn disarm_count(&self, kind: WatcherKind) -> u8 {
        self.slot(kind).control().counter()
    }

    pub fn any_armed(&self) -> bool {
        [WatcherKind::Identifier, WatcherKind::Inventory]
            .into_iter()
            .any(|kind| self.state(kind) == WatcherState::Armed)
    }

    /// Completed pipeline runs triggered by `kind`.
    pub fn runs(&self, kind: WatcherKind) -> usize {
        self.slot(kind).runs()
    }

    pub fn last_results(&self, kind: WatcherKind) -> Vec<TaskResult> {
        self.slot(kind).last_results()
    }

    pub fn classifier(&self) -> &Arc<VolumeClassifier> {
        &self.services.classifier
    }

    pub fn poller(&self) -> &InventoryPoller {
        &self.services.poller
    }

    pub fn events(&self) -> &EventLog {
        &self.services.events
    }

    /// Disarm both watchers and wait for their loops, including any pipeline
    /// run still in flight.
    pub async fn shutdown(&self) {
        for slot in [&self.identifier, &self.inventory] {
            slot.control().force_disarm();
        }

        for slot in [&self.identifier, &self.inventory] {
            for handle in slot.take_loops() {
                if let Err(e) = handle.await {
                    self.services.events.log_error(&format!("{} watcher loop failed: {}", slot.kind(), e));
                }
            }
        }
        self.services.events.log_info("Engine stopped");
    }
}
