//! Scripted `Host` used by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::device::MountRecord;
use crate::host::{CommandOutput, EraseMethod, Host, UnmountMode};

#[derive(Default)]
struct State {
    bus: Vec<String>,
    fail_bus: bool,
    mounts: Vec<MountRecord>,
    fail_mounts: bool,
    mount_points: HashSet<PathBuf>,
    fail_presence: bool,
    persistent: HashSet<String>,
    busy: HashSet<String>,
    stuck: HashSet<String>,
    unmount_delay: Option<Duration>,
    hung_unmounts: HashMap<String, Duration>,
    processes: Vec<String>,
    files: BTreeMap<PathBuf, u64>,
    failing_commands: HashMap<String, i32>,
    slow_commands: HashMap<String, Duration>,
    env: HashMap<String, String>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<State>,
    persistent_lookups: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn set_bus(&self, lines: &[&str]) {
        self.state().bus = lines.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_bus(&self, fail: bool) {
        self.state().fail_bus = fail;
    }

    pub fn set_mounts(&self, mounts: Vec<MountRecord>) {
        self.state().mounts = mounts;
    }

    pub fn fail_mounts(&self, fail: bool) {
        self.state().fail_mounts = fail;
    }

    pub fn add_mount_point(&self, path: &str) {
        self.state().mount_points.insert(PathBuf::from(path));
    }

    pub fn remove_mount_point(&self, path: &str) {
        self.state().mount_points.remove(Path::new(path));
    }

    pub fn fail_presence(&self, fail: bool) {
        self.state().fail_presence = fail;
    }

    pub fn set_persistent(&self, devices: &[&str]) {
        self.state().persistent = devices.iter().map(|s| s.to_string()).collect();
    }

    pub fn persistent_lookups(&self) -> usize {
        self.persistent_lookups.load(Ordering::SeqCst)
    }

    /// Plain unmount of `mount_point` fails; lazy unmount succeeds.
    pub fn set_busy(&self, mount_point: &str) {
        self.state().busy.insert(mount_point.to_string());
    }

    /// Every unmount of `mount_point` fails.
    pub fn set_stuck(&self, mount_point: &str) {
        self.state().stuck.insert(mount_point.to_string());
    }

    pub fn set_unmount_delay(&self, delay: Duration) {
        self.state().unmount_delay = Some(delay);
    }

    /// Every unmount call on `mount_point` blocks for `delay` first.
    pub fn hang_unmount(&self, mount_point: &str, delay: Duration) {
        self.state().hung_unmounts.insert(mount_point.to_string(), delay);
    }

    pub fn add_process(&self, name: &str) {
        self.state().processes.push(name.to_string());
    }

    pub fn add_file(&self, path: &str, size: u64) {
        self.state().files.insert(PathBuf::from(path), size);
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.state().files.contains_key(Path::new(path))
    }

    pub fn fail_command(&self, command: &str, code: i32) {
        self.state().failing_commands.insert(command.to_string(), code);
    }

    pub fn slow_command(&self, command: &str, delay: Duration) {
        self.state().slow_commands.insert(command.to_string(), delay);
    }

    pub fn set_env(&self, key: &str, value: &str) {
        self.state().env.insert(key.to_string(), value.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("run ").map(str::to_string))
            .collect()
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }
}

impl Host for FakeHost {
    fn bus_devices(&self) -> io::Result<Vec<String>> {
        let state = self.state();
        if state.fail_bus {
            return Err(io::Error::other("bus enumeration failed"));
        }
        Ok(state.bus.clone())
    }

    fn mount_table(&self) -> io::Result<Vec<MountRecord>> {
        let state = self.state();
        if state.fail_mounts {
            return Err(io::Error::other("mount table unreadable"));
        }
        Ok(state.mounts.clone())
    }

    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        let state = self.state();
        if state.fail_presence {
            return Err(io::Error::other("I/O error"));
        }
        Ok(state.mount_points.contains(path))
    }

    fn persistent_mount_listed(&self, device: &str) -> io::Result<bool> {
        self.persistent_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().persistent.contains(device))
    }

    fn unmount(&self, mount_point: &Path, mode: UnmountMode) -> io::Result<()> {
        let target = mount_point.to_string_lossy().to_string();
        let delay = {
            let state = self.state();
            state.hung_unmounts.get(&target).copied().or(state.unmount_delay)
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        self.record(format!("unmount {:?} {}", mode, target));

        let mut state = self.state();
        if state.stuck.contains(&target) {
            return Err(io::Error::other("device or resource busy"));
        }
        if mode == UnmountMode::Normal && state.busy.contains(&target) {
            return Err(io::Error::other("device or resource busy"));
        }
        state.mounts.retain(|m| m.mount_point != target);
        Ok(())
    }

    fn kill_matching(&self, name: &str) -> io::Result<usize> {
        self.record(format!("kill {}", name));
        let mut state = self.state();
        let before = state.processes.len();
        state.processes.retain(|p| p != name);
        Ok(before - state.processes.len())
    }

    fn process_running(&self, name: &str) -> bool {
        self.state().processes.iter().any(|p| p == name)
    }

    fn file_size(&self, path: &Path) -> io::Result<Option<u64>> {
        Ok(self.state().files.get(path).copied())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.record(format!("remove {}", path.display()));
        match self.state().files.remove(path) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn secure_erase(&self, path: &Path, passes: u32, _limit: Duration) -> io::Result<EraseMethod> {
        self.record(format!("erase {} x{}", path.display(), passes));
        match self.state().files.remove(path) {
            Some(_) => Ok(EraseMethod::Shred),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn run_command(&self, command: &str, limit: Duration) -> io::Result<CommandOutput> {
        self.record(format!("run {}", command));
        let (delay, code) = {
            let state = self.state();
            (
                state.slow_commands.get(command).copied(),
                state.failing_commands.get(command).copied(),
            )
        };

        if let Some(delay) = delay {
            if delay > limit {
                thread::sleep(limit);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "killed after deadline"));
            }
            thread::sleep(delay);
        }

        match code {
            Some(code) => Ok(CommandOutput { code: Some(code), stderr: "failed".into() }),
            None => Ok(CommandOutput { code: Some(0), stderr: String::new() }),
        }
    }

    fn env_var(&self, key: &str) -> Option<String> {
        self.state().env.get(key).cloned()
    }
}
