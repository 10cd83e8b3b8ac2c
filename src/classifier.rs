use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::device::MountRecord;
use crate::host::Host;
use crate::logger::EventLog;

/// Validity window of a classification epoch.
pub const CLASSIFICATION_TTL: Duration = Duration::from_secs(60);

const CRITICAL_MOUNTS: &[&str] = &["/", "/boot", "/boot/efi", "/home", "/var", "/usr", "/etc", "/bin", "/sbin"];
const NETWORK_MARKERS: &[&str] = &["nfs", "cifs", "smb"];
const REMOVABLE_ROOTS: &[&str] = &["/media/", "/run/media/"];
const BLOCK_DEVICE_PATTERNS: &[&str] = &["/dev/sd", "/dev/mmcblk", "/dev/usb"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeClass {
    System,
    Removable,
}

impl std::fmt::Display for VolumeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeClass::System => write!(f, "system"),
            VolumeClass::Removable => write!(f, "removable"),
        }
    }
}

/// Verdicts keyed by device path and by mount point, sharing one refresh
/// timestamp. A key maps to exactly one class.
#[derive(Debug, Default)]
pub struct ClassificationCache {
    entries: HashMap<String, VolumeClass>,
    refreshed_at: Option<Instant>,
}

impl ClassificationCache {
    fn expire(&mut self, ttl: Duration, now: Instant) {
        if let Some(at) = self.refreshed_at {
            if now.saturating_duration_since(at) >= ttl {
                self.clear();
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.refreshed_at = None;
    }

    fn lookup(&self, device: &str, mount_point: &str) -> Option<VolumeClass> {
        let by_device = self.entries.get(device).copied();
        let by_mount = self.entries.get(mount_point).copied();

        if by_device == Some(VolumeClass::System) || by_mount == Some(VolumeClass::System) {
            return Some(VolumeClass::System);
        }
        if by_device == Some(VolumeClass::Removable) && by_mount == Some(VolumeClass::Removable) {
            return Some(VolumeClass::Removable);
        }
        None
    }

    fn insert(&mut self, device: &str, mount_point: &str, class: VolumeClass, now: Instant) {
        self.entries.insert(device.to_string(), class);
        self.entries.insert(mount_point.to_string(), class);
        self.refreshed_at = Some(now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decides whether a mounted volume belongs to the host or is removable
/// media. Anything it cannot place is treated as a system volume.
pub struct VolumeClassifier {
    host: Arc<dyn Host>,
    events: EventLog,
    cache: Mutex<ClassificationCache>,
    ttl: Duration,
}

impl VolumeClassifier {
    pub fn new(host: Arc<dyn Host>, events: EventLog) -> Self {
        Self::with_ttl(host, events, CLASSIFICATION_TTL)
    }

    pub fn with_ttl(host: Arc<dyn Host>, events: EventLog, ttl: Duration) -> Self {
        Self {
            host,
            events,
            cache: Mutex::new(ClassificationCache::default()),
            ttl,
        }
    }

    fn cache(&self) -> MutexGuard<'_, ClassificationCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn classify(&self, device: &str, mount_point: &str) -> VolumeClass {
        self.classify_with(device, mount_point, None)
    }

    pub fn classify_mount(&self, mount: &MountRecord) -> VolumeClass {
        self.classify_with(&mount.device, &mount.mount_point, Some(&mount.fstype))
    }

    fn classify_with(&self, device: &str, mount_point: &str, fstype: Option<&str>) -> VolumeClass {
        {
            let mut cache = self.cache();
            cache.expire(self.ttl, Instant::now());
            if let Some(class) = cache.lookup(device, mount_point) {
                debug!("cache hit: {} on {} is {}", device, mount_point, class);
                return class;
            }
        }

        let class = self.decide(device, mount_point, fstype);
        self.cache().insert(device, mount_point, class, Instant::now());
        class
    }

    fn decide(&self, device: &str, mount_point: &str, fstype: Option<&str>) -> VolumeClass {
        if CRITICAL_MOUNTS.contains(&mount_point) {
            return VolumeClass::System;
        }

        match self.host.persistent_mount_listed(device) {
            Ok(true) => return VolumeClass::System,
            Ok(false) => {}
            Err(e) => debug!("persistent mount lookup for {} failed: {}", device, e),
        }

        let network = NETWORK_MARKERS.iter().any(|m| {
            mount_point.contains(m) || fstype.is_some_and(|fs| fs.starts_with(m))
        });
        if network {
            return VolumeClass::System;
        }

        let removable_root = REMOVABLE_ROOTS.iter().any(|r| mount_point.starts_with(r));
        let block_device = BLOCK_DEVICE_PATTERNS.iter().any(|p| device.starts_with(p));
        if removable_root && block_device {
            return VolumeClass::Removable;
        }

        VolumeClass::System
    }

    /// Start a new epoch: drop every verdict and classify each volume
    /// currently mounted. Blocks on the mount table query.
    pub fn refresh(&self) -> usize {
        self.cache().clear();

        let mounts = match self.host.mount_table() {
            Ok(mounts) => mounts,
            Err(e) => {
                self.events.log_warning(&format!("Error updating volume cache: {}", e));
                return 0;
            }
        };

        for mount in &mounts {
            self.classify_mount(mount);
        }

        self.events.log_info(&format!("Volume cache updated ({} volumes)", mounts.len()));
        mounts.len()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache().len()
    }
}
