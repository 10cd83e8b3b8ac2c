//! Arm/disarm state machine and the two trigger watchers.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::classifier::VolumeClassifier;
use crate::config::Configuration;
use crate::device::{DeviceSnapshot, InventoryPoller, SnapshotDiff};
use crate::logger::EventLog;
use crate::pipeline::{ResponsePipeline, TaskResult, TriggerContext};
use crate::worker::{bounded, ENUMERATION_LIMIT};

/// Disarm signals needed to disarm an armed watcher.
pub const DISARM_SIGNALS: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherKind {
    /// Trips when the identifier volume is no longer mounted.
    Identifier,
    /// Trips on any change in the attached device set.
    Inventory,
}

impl fmt::Display for WatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherKind::Identifier => write!(f, "identifier"),
            WatcherKind::Inventory => write!(f, "inventory"),
        }
    }
}

impl FromStr for WatcherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "identifier" | "presence" => Ok(WatcherKind::Identifier),
            "inventory" | "usb" => Ok(WatcherKind::Inventory),
            other => Err(format!("unknown watcher '{}' (expected identifier or inventory)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    Disarmed,
    Armed,
}

#[derive(Debug)]
struct ArmState {
    state: WatcherState,
    counter: u8,
    generation: u64,
}

/// State, disarm counter and arm generation of one watcher.
///
/// Every arm starts a new generation; a loop keeps running only while its
/// generation is current and the watcher is armed.
#[derive(Debug)]
pub struct ArmControl {
    inner: Mutex<ArmState>,
}

impl Default for ArmControl {
    fn default() -> Self {
        Self {
            inner: Mutex::new(ArmState { state: WatcherState::Disarmed, counter: 0, generation: 0 }),
        }
    }
}

impl ArmControl {
    fn lock(&self) -> MutexGuard<'_, ArmState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm (or re-arm) and return the new generation.
    pub fn arm(&self) -> u64 {
        let mut inner = self.lock();
        inner.state = WatcherState::Armed;
        inner.counter = 0;
        inner.generation += 1;
        inner.generation
    }

    /// Count one disarm signal. Ignored while disarmed.
    pub fn disarm_signal(&self) -> WatcherState {
        let mut inner = self.lock();
        if inner.state == WatcherState::Disarmed {
            return WatcherState::Disarmed;
        }

        inner.counter += 1;
        if inner.counter >= DISARM_SIGNALS {
            inner.counter = 0;
            inner.state = WatcherState::Disarmed;
        }
        inner.state
    }

    /// Disarm immediately, for engine teardown.
    pub fn force_disarm(&self) {
        let mut inner = self.lock();
        inner.state = WatcherState::Disarmed;
        inner.counter = 0;
    }

    pub fn state(&self) -> WatcherState {
        self.lock().state
    }

    pub fn counter(&self) -> u8 {
        self.lock().counter
    }

    pub fn is_current(&self, generation: u64) -> bool {
        let inner = self.lock();
        inner.state == WatcherState::Armed && inner.generation == generation
    }
}

/// Tick logic of the identifier watcher: one trigger per absence, latched
/// until the next arm.
#[derive(Debug)]
pub struct IdentifierWatcher {
    label: String,
    latched: bool,
}

impl IdentifierWatcher {
    pub fn new(label: &str) -> Self {
        Self { label: label.to_string(), latched: false }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn latched(&self) -> bool {
        self.latched
    }

    /// Returns true when this observation must start the pipeline.
    pub fn observe(&mut self, present: bool) -> bool {
        if self.latched || present {
            return false;
        }
        self.latched = true;
        true
    }
}

/// Tick logic of the inventory watcher: trigger on every transition of the
/// device set, then adopt the new set as baseline.
#[derive(Debug)]
pub struct InventoryWatcher {
    baseline: DeviceSnapshot,
}

impl InventoryWatcher {
    pub fn new(baseline: DeviceSnapshot) -> Self {
        Self { baseline }
    }

    pub fn baseline(&self) -> &DeviceSnapshot {
        &self.baseline
    }

    /// Incomplete snapshots never trigger and never replace the baseline.
    pub fn observe(&mut self, current: DeviceSnapshot) -> Option<SnapshotDiff> {
        if !current.complete {
            return None;
        }
        if !self.baseline.complete {
            // nothing trustworthy to compare against yet
            self.baseline = current;
            return None;
        }

        let diff = self.baseline.diff(&current);
        if diff.is_empty() {
            return None;
        }
        self.baseline = current;
        Some(diff)
    }
}

/// Collaborators shared by both watcher loops.
pub struct Services {
    pub pipeline: ResponsePipeline,
    pub classifier: Arc<VolumeClassifier>,
    pub poller: InventoryPoller,
    pub events: EventLog,
}

/// Everything the engine keeps per watcher.
pub struct WatcherSlot {
    kind: WatcherKind,
    control: ArmControl,
    /// Held for the duration of a pipeline run started by this watcher.
    run_guard: tokio::sync::Mutex<()>,
    runs: AtomicUsize,
    last_results: Mutex<Vec<TaskResult>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl WatcherSlot {
    pub fn new(kind: WatcherKind) -> Self {
        Self {
            kind,
            control: ArmControl::default(),
            run_guard: tokio::sync::Mutex::new(()),
            runs: AtomicUsize::new(0),
            last_results: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> WatcherKind {
        self.kind
    }

    pub fn control(&self) -> &ArmControl {
        &self.control
    }

    /// Completed pipeline runs started by this watcher.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_results(&self) -> Vec<TaskResult> {
        self.last_results.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Keep the handle of a newly spawned loop, dropping finished ones.
    pub fn track(&self, handle: JoinHandle<()>) {
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        loops.retain(|h| !h.is_finished());
        loops.push(handle);
    }

    pub fn take_loops(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.loops.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn respond(&self, services: &Services, config: &Configuration, trigger: TriggerContext) {
        let _running = self.run_guard.lock().await;
        let results = services.pipeline.run(config, &trigger).await;
        *self.last_results.lock().unwrap_or_else(|e| e.into_inner()) = results;
        self.runs.fetch_add(1, Ordering::SeqCst);
    }
}

pub async fn identifier_loop(
    slot: Arc<WatcherSlot>,
    services: Arc<Services>,
    generation: u64,
    config: Arc<Configuration>,
) {
    let mut watcher = IdentifierWatcher::new(&config.identifier);
    let mut ticker = interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !slot.control.is_current(generation) {
            break;
        }
        if watcher.latched() {
            continue;
        }

        let present = services.poller.identifier_present(watcher.label()).await;
        if watcher.observe(present) {
            let trigger = TriggerContext::new(
                WatcherKind::Identifier,
                format!("identifier volume {} is no longer present", watcher.label()),
            );
            slot.respond(&services, &config, trigger).await;
        }
    }

    services.events.log_info("Identifier watcher stopped");
}

pub async fn inventory_loop(
    slot: Arc<WatcherSlot>,
    services: Arc<Services>,
    generation: u64,
    config: Arc<Configuration>,
) {
    let baseline = services.poller.snapshot().await;
    services.events.log_info(&format!("USB inventory baseline: {} devices", baseline.len()));

    let classifier = services.classifier.clone();
    if let Err(e) = bounded("volume cache refresh", ENUMERATION_LIMIT, move || classifier.refresh()).await {
        services.events.log_warning(&format!("Error updating volume cache: {}", e));
    }

    let mut watcher = InventoryWatcher::new(baseline);
    let mut ticker = interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick is immediate; the baseline was just taken
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !slot.control.is_current(generation) {
            break;
        }

        let current = services.poller.snapshot().await;
        if let Some(diff) = watcher.observe(current) {
            let trigger = TriggerContext::new(
                WatcherKind::Inventory,
                format!("device set changed: {} added, {} removed", diff.added.len(), diff.removed.len()),
            );
            for device in diff.added.iter() {
                services.events.log_warning(&format!("New device: {}", device));
            }
            for device in diff.removed.iter() {
                services.events.log_warning(&format!("Device removed: {}", device));
            }
            slot.respond(&services, &config, trigger).await;
        }
    }

    services.events.log_info("Inventory watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed() -> ArmControl {
        let control = ArmControl::default();
        control.arm();
        control
    }

    #[test]
    fn test_five_signals_disarm() {
        let control = armed();
        for _ in 0..4 {
            assert_eq!(control.disarm_signal(), WatcherState::Armed);
        }
        assert_eq!(control.counter(), 4);

        assert_eq!(control.disarm_signal(), WatcherState::Disarmed);
        assert_eq!(control.state(), WatcherState::Disarmed);
        assert_eq!(control.counter(), 0);
    }

    #[test]
    fn test_rearm_resets_counter() {
        let control = armed();
        control.disarm_signal();
        control.disarm_signal();
        let generation = control.arm();

        assert_eq!(control.counter(), 0);
        assert!(control.is_current(generation));
        assert!(!control.is_current(generation - 1));
        for _ in 0..4 {
            control.disarm_signal();
        }
        assert_eq!(control.state(), WatcherState::Armed);
    }

    #[test]
    fn test_signals_while_disarmed_are_ignored() {
        let control = ArmControl::default();
        assert_eq!(control.disarm_signal(), WatcherState::Disarmed);
        assert_eq!(control.counter(), 0);
    }

    #[test]
    fn test_identifier_latch_triggers_once() {
        let mut watcher = IdentifierWatcher::new("K");
        assert!(!watcher.observe(true));

        let triggers = (0..20).filter(|_| watcher.observe(false)).count();
        assert_eq!(triggers, 1);
        // reinsertion does not reset the latch
        assert!(!watcher.observe(true));
        assert!(!watcher.observe(false));
    }

    #[test]
    fn test_inventory_triggers_once_per_transition() {
        let a = DeviceSnapshot::from_descriptors(["usb 1-1 0781:5581"]);
        let b = DeviceSnapshot::from_descriptors(["usb 1-1 0781:5581", "usb 1-2 058f:6387"]);
        let mut watcher = InventoryWatcher::new(a.clone());

        let mut triggers = 0;
        for snapshot in [&a, &a, &b, &b, &b, &a, &a] {
            if watcher.observe(snapshot.clone()).is_some() {
                triggers += 1;
            }
        }
        assert_eq!(triggers, 2);
        assert_eq!(watcher.baseline(), &a);
    }

    #[test]
    fn test_incomplete_snapshot_is_no_change() {
        let a = DeviceSnapshot::from_descriptors(["usb 1-1 0781:5581"]);
        let mut watcher = InventoryWatcher::new(a.clone());

        assert!(watcher.observe(DeviceSnapshot::default()).is_none());
        assert_eq!(watcher.baseline(), &a);
        assert!(watcher.observe(a).is_none());
    }

    #[test]
    fn test_incomplete_baseline_is_replaced_silently() {
        let mut watcher = InventoryWatcher::new(DeviceSnapshot::default());
        let a = DeviceSnapshot::from_descriptors(["usb 1-1 0781:5581"]);

        assert!(watcher.observe(a.clone()).is_none());
        assert!(watcher.baseline().complete);

        let b = DeviceSnapshot::from_descriptors(["usb 1-2 058f:6387"]);
        let diff = watcher.observe(b).unwrap();
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.removed.len(), 1);
    }

    #[test]
    fn test_watcher_kind_names() {
        assert_eq!("Inventory".parse::<WatcherKind>().unwrap(), WatcherKind::Inventory);
        assert_eq!(WatcherKind::Identifier.to_string(), "identifier");
        assert!("timer".parse::<WatcherKind>().is_err());
    }
}
