//! `Host` implementation for Linux.

use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use regex::Regex;

use crate::device::{parse_mount_table, usb_devices_from_sysfs, MountRecord};
use crate::host::{CommandOutput, EraseMethod, Host, UnmountMode};
use crate::worker::deadline_after;

const WAIT_POLL: Duration = Duration::from_millis(20);
const STDERR_GRACE: Duration = Duration::from_millis(200);
const OVERWRITE_CHUNK: usize = 1024 * 1024;

pub struct SystemHost {
    usb_devices: PathBuf,
    mounts: PathBuf,
    fstab: PathBuf,
    proc_root: PathBuf,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self {
            usb_devices: PathBuf::from("/sys/bus/usb/devices"),
            mounts: PathBuf::from("/proc/self/mounts"),
            fstab: PathBuf::from("/etc/fstab"),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl SystemHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use another persistent mount table, e.g. a fixture.
    pub fn with_fstab(mut self, path: impl Into<PathBuf>) -> Self {
        self.fstab = path.into();
        self
    }

    /// Pids (other than our own) whose command name matches the pattern
    /// `name`, the way `pkill` matches.
    fn matching_pids(&self, name: &str) -> io::Result<Vec<libc::pid_t>> {
        if name.trim().is_empty() {
            return Ok(Vec::new());
        }
        let pattern = process_pattern(name)?;
        let own = std::process::id() as libc::pid_t;
        let mut pids = Vec::new();

        for entry in fs::read_dir(&self.proc_root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let pid: libc::pid_t = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                Some(pid) => pid,
                None => continue,
            };
            if pid == own {
                continue;
            }
            // processes can exit while we look at them
            if process_matches(&entry.path(), &pattern) {
                pids.push(pid);
            }
        }
        Ok(pids)
    }
}

/// An entry that is not a valid regex is matched literally.
fn process_pattern(name: &str) -> io::Result<Regex> {
    Regex::new(name)
        .or_else(|_| Regex::new(&regex::escape(name)))
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))
}

/// `comm` is truncated to 15 bytes, so the argv0 basename is tried too.
fn process_matches(dir: &Path, pattern: &Regex) -> bool {
    if let Ok(comm) = fs::read_to_string(dir.join("comm")) {
        if pattern.is_match(comm.trim_end_matches('\n')) {
            return true;
        }
    }

    match fs::read(dir.join("cmdline")) {
        Ok(cmdline) => {
            let argv0 = cmdline.split(|&b| b == 0).next().unwrap_or_default();
            let argv0 = Path::new(std::ffi::OsStr::from_bytes(argv0));
            argv0.file_name().is_some_and(|base| pattern.is_match(&base.to_string_lossy()))
        }
        Err(_) => false,
    }
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "path contains a NUL byte"))
}

/// Resolve an fstab source (`/dev/...`, `UUID=`, `LABEL=`, `PARTUUID=`,
/// `PARTLABEL=`) to a path that can be compared with a device.
fn fstab_source_path(spec: &str) -> PathBuf {
    let links = [
        ("UUID=", "/dev/disk/by-uuid"),
        ("LABEL=", "/dev/disk/by-label"),
        ("PARTUUID=", "/dev/disk/by-partuuid"),
        ("PARTLABEL=", "/dev/disk/by-partlabel"),
    ];
    for (prefix, dir) in links {
        if let Some(value) = spec.strip_prefix(prefix) {
            return Path::new(dir).join(value.trim_matches('"'));
        }
    }
    PathBuf::from(spec)
}

/// Whether `fstab` lists `device`, directly or through a udev link.
pub fn fstab_lists(fstab: &str, device: &str) -> bool {
    let resolved = fs::canonicalize(device).unwrap_or_else(|_| PathBuf::from(device));

    fstab
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .any(|spec| {
            if spec == device {
                return true;
            }
            let source = fstab_source_path(spec);
            source == resolved || fs::canonicalize(&source).is_ok_and(|p| p == resolved)
        })
}

/// Wait for `child` until `deadline`, then kill its process group.
fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let pgid = child.id() as libc::pid_t;
            // the child leads its own group, so this reaches its descendants too
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(ErrorKind::TimedOut, "killed after deadline"));
        }
        thread::sleep(WAIT_POLL);
    }
}

/// Overwrite `path` in place with random data `passes` times, then zeros,
/// then unlink it.
fn overwrite_in_place(path: &Path, passes: u32, deadline: Instant) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    let mut rng = SmallRng::from_entropy();
    let mut chunk = vec![0u8; OVERWRITE_CHUNK];

    for pass in 0..=passes {
        let zero_pass = pass == passes;
        file.seek(SeekFrom::Start(0))?;

        let mut remaining = len;
        while remaining > 0 {
            if Instant::now() >= deadline {
                return Err(io::Error::new(ErrorKind::TimedOut, "overwrite deadline passed"));
            }
            let n = remaining.min(OVERWRITE_CHUNK as u64) as usize;
            if zero_pass {
                chunk[..n].fill(0);
            } else {
                rng.fill_bytes(&mut chunk[..n]);
            }
            file.write_all(&chunk[..n])?;
            remaining -= n as u64;
        }
        file.sync_data()?;
    }

    drop(file);
    fs::remove_file(path)
}

impl Host for SystemHost {
    fn bus_devices(&self) -> io::Result<Vec<String>> {
        usb_devices_from_sysfs(&self.usb_devices)
    }

    fn mount_table(&self) -> io::Result<Vec<MountRecord>> {
        let content = fs::read_to_string(&self.mounts)?;
        Ok(parse_mount_table(&content))
    }

    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        let meta = fs::metadata(path)?;
        let parent = match path.parent() {
            Some(parent) => fs::metadata(parent)?,
            None => return Ok(true),
        };
        Ok(meta.dev() != parent.dev() || meta.ino() == parent.ino())
    }

    fn persistent_mount_listed(&self, device: &str) -> io::Result<bool> {
        match fs::read_to_string(&self.fstab) {
            Ok(content) => Ok(fstab_lists(&content, device)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn unmount(&self, mount_point: &Path, mode: UnmountMode) -> io::Result<()> {
        let target = path_cstring(mount_point)?;
        let flags = match mode {
            UnmountMode::Normal => 0,
            UnmountMode::Lazy => libc::MNT_DETACH,
        };

        let rc = unsafe { libc::umount2(target.as_ptr(), flags) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // not mounted (any more)
            Some(libc::EINVAL) | Some(libc::ENOENT) => {
                debug!("{} is not mounted: {}", mount_point.display(), err);
                Ok(())
            }
            _ => Err(err),
        }
    }

    fn kill_matching(&self, name: &str) -> io::Result<usize> {
        let mut killed = 0;
        for pid in self.matching_pids(name)? {
            let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
            if rc == 0 {
                killed += 1;
                continue;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!("cannot kill {} ({}): {}", pid, name, err);
            }
        }
        Ok(killed)
    }

    fn process_running(&self, name: &str) -> bool {
        self.matching_pids(name).is_ok_and(|pids| !pids.is_empty())
    }

    fn file_size(&self, path: &Path) -> io::Result<Option<u64>> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn secure_erase(&self, path: &Path, passes: u32, limit: Duration) -> io::Result<EraseMethod> {
        let deadline = deadline_after(limit);
        fs::metadata(path)?;

        let spawned = Command::new("shred")
            .arg("-z")
            .arg("-u")
            .arg("-n")
            .arg(passes.to_string())
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("shred not available, overwriting {} in place", path.display());
                overwrite_in_place(path, passes, deadline)?;
                return Ok(EraseMethod::Overwrite);
            }
            Err(e) => return Err(e),
        };

        let status = wait_until(&mut child, deadline)?;
        if status.success() {
            Ok(EraseMethod::Shred)
        } else {
            Err(io::Error::other(format!("shred exited with {}", status)))
        }
    }

    fn run_command(&self, command: &str, limit: Duration) -> io::Result<CommandOutput> {
        let deadline = deadline_after(limit);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()?;

        let (tx, rx) = mpsc::channel();
        if let Some(mut stderr) = child.stderr.take() {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                let _ = tx.send(text);
            });
        }

        let status = wait_until(&mut child, deadline)?;
        // background descendants may keep the pipe open
        let stderr = rx.recv_timeout(STDERR_GRACE).unwrap_or_default();

        Ok(CommandOutput { code: status.code(), stderr })
    }

    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}
