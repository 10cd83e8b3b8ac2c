//! The operating-system surface consumed by the engine.
//!
//! Every call here may block. The engine never calls a `Host` method on a
//! watcher loop directly; it goes through `worker::bounded` so a hung
//! syscall or child process cannot stall the loop.

use std::io;
use std::path::Path;
use std::time::Duration;

use crate::device::MountRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountMode {
    /// Plain unmount; fails while the volume is busy.
    Normal,
    /// Detach now, clean up once the last reference goes away.
    Lazy,
}

/// How a file was erased by `Host::secure_erase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseMethod {
    /// Dedicated secure-erase tool.
    Shred,
    /// In-process random overwrite; reduced guarantee.
    Overwrite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the child was killed by a signal.
    pub code: Option<i32>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub trait Host: Send + Sync + 'static {
    /// One opaque line per device attached to the external bus.
    fn bus_devices(&self) -> io::Result<Vec<String>>;

    fn mount_table(&self) -> io::Result<Vec<MountRecord>>;

    fn is_mount_point(&self, path: &Path) -> io::Result<bool>;

    /// Whether `device` has an entry in the persistent mount table.
    fn persistent_mount_listed(&self, device: &str) -> io::Result<bool>;

    fn unmount(&self, mount_point: &Path, mode: UnmountMode) -> io::Result<()>;

    /// Force-kill every process matching `name`, returning how many were
    /// signalled. Zero is not an error.
    fn kill_matching(&self, name: &str) -> io::Result<usize>;

    fn process_running(&self, name: &str) -> bool;

    /// Size of a regular file, `None` when `path` is missing or not a file.
    fn file_size(&self, path: &Path) -> io::Result<Option<u64>>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Overwrite `path` `passes` times and unlink it. Implementations must
    /// give up once `limit` has elapsed and report `ErrorKind::TimedOut`.
    fn secure_erase(&self, path: &Path, passes: u32, limit: Duration) -> io::Result<EraseMethod>;

    /// Run a shell command line, killing it when `limit` elapses
    /// (`ErrorKind::TimedOut`).
    fn run_command(&self, command: &str, limit: Duration) -> io::Result<CommandOutput>;

    fn env_var(&self, key: &str) -> Option<String>;
}
