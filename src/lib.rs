// src/lib.rs
pub mod config;

pub use config::{ConfigBuilder, ConfigFile, Configuration, ShutdownMode, SwitchConfig};
pub use config::{verify_config_paths, generate_example_config};
pub use config::DEFAULT_CONFIG_PATH;

pub mod error;
pub use error::{ConfigError, KillSwitchError};

pub mod logger;
pub use logger::{Event, EventLevel, EventLog, EventSink, JsonLinesSink, Logger, MemorySink};

pub mod host;
pub use host::{CommandOutput, EraseMethod, Host, UnmountMode};

pub mod system;
pub use system::SystemHost;

pub mod worker;

pub mod device;
pub use device::{DeviceSnapshot, InventoryPoller, MountRecord, SnapshotDiff};

pub mod classifier;
pub use classifier::{VolumeClass, VolumeClassifier};

pub mod desktop;
pub use desktop::DesktopEnvironment;

pub mod pipeline;
pub use pipeline::{ResponsePipeline, Step, TaskKind, TaskOutcome, TaskResult, TriggerContext};

pub mod watcher;
pub use watcher::{WatcherKind, WatcherState, DISARM_SIGNALS};

pub mod engine;
pub use engine::Engine;

#[cfg(test)]
mod testing;
