use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::host::Host;
use crate::logger::EventLog;
use crate::worker::{ENUMERATION_LIMIT, bounded};

/// Device or mount-point fragments that make a mount line part of the
/// inventory snapshot.
const INVENTORY_MOUNT_PATTERNS: &[&str] = &["/dev/sd", "/dev/usb", "/media", "/mnt", "/run/media"];

/// A mounted volume as reported by the mount table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountRecord {
    pub device: String,
    pub mount_point: String,
    pub fstype: String,
}

impl MountRecord {
    pub fn new(device: &str, mount_point: &str, fstype: &str) -> Self {
        MountRecord {
            device: device.to_string(),
            mount_point: mount_point.to_string(),
            fstype: fstype.to_string(),
        }
    }

    fn descriptor(&self) -> String {
        format!("mount {} on {} type {}", self.device, self.mount_point, self.fstype)
    }

    fn in_inventory(&self) -> bool {
        INVENTORY_MOUNT_PATTERNS
            .iter()
            .any(|p| self.device.contains(p) || self.mount_point.contains(p))
    }
}

/// The set of device descriptors seen at one poll instant.
///
/// Equality only looks at the descriptors. `complete` is false when part of
/// the enumeration failed, in which case the snapshot must not be diffed.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub devices: BTreeSet<String>,
    pub complete: bool,
}

impl PartialEq for DeviceSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.devices == other.devices
    }
}

impl Eq for DeviceSnapshot {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl DeviceSnapshot {
    pub fn from_descriptors<I, S>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DeviceSnapshot {
            devices: descriptors.into_iter().map(Into::into).collect(),
            complete: true,
        }
    }

    /// What changed going from `self` (the baseline) to `current`.
    pub fn diff(&self, current: &DeviceSnapshot) -> SnapshotDiff {
        SnapshotDiff {
            added: current.devices.difference(&self.devices).cloned().collect(),
            removed: self.devices.difference(&current.devices).cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Decode the octal escapes (`\040` etc.) the kernel uses in mount tables.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `/proc/mounts` style content.
pub fn parse_mount_table(content: &str) -> Vec<MountRecord> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fstype = fields.next().unwrap_or("");
            Some(MountRecord {
                device: unescape_mount_field(device),
                mount_point: unescape_mount_field(mount_point),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

fn read_attr(dir: &Path, name: &str) -> String {
    fs::read_to_string(dir.join(name))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Enumerate USB devices below a sysfs `bus/usb/devices` directory.
///
/// Interface entries (`1-1:1.0`) and entries without a vendor id are skipped.
pub fn usb_devices_from_sysfs(root: &Path) -> std::io::Result<Vec<String>> {
    let mut devices = Vec::new();

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.contains(':') {
            continue;
        }

        let dir = entry.path();
        let vendor = read_attr(&dir, "idVendor");
        if vendor.is_empty() {
            continue;
        }
        let product_id = read_attr(&dir, "idProduct");
        let product = read_attr(&dir, "product");
        let serial = read_attr(&dir, "serial");

        let mut line = format!("usb {} {}:{}", name, vendor, product_id);
        if !product.is_empty() {
            line.push_str(&format!(" {}", product));
        }
        if !serial.is_empty() {
            line.push_str(&format!(" sn.{}", serial));
        }
        devices.push(line);
    }

    devices.sort();
    Ok(devices)
}

/// Paths under which a volume labelled `label` may be mounted, for the
/// given login names.
pub fn identifier_candidates(label: &str, users: &[String]) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for user in users {
        candidates.push(PathBuf::from(format!("/media/{}/{}", user, label)));
    }
    candidates.push(PathBuf::from(format!("/media/{}", label)));
    candidates.push(PathBuf::from(format!("/mnt/{}", label)));
    for user in users {
        candidates.push(PathBuf::from(format!("/run/media/{}/{}", user, label)));
    }
    candidates
}

/// Polls the host for attached and mounted devices. Never fails: errors are
/// logged and produce an incomplete snapshot, or "absent" for presence checks.
pub struct InventoryPoller {
    host: Arc<dyn Host>,
    events: EventLog,
}

impl InventoryPoller {
    pub fn new(host: Arc<dyn Host>, events: EventLog) -> Self {
        Self { host, events }
    }

    pub async fn snapshot(&self) -> DeviceSnapshot {
        let host = self.host.clone();
        let queried = bounded("inventory enumeration", ENUMERATION_LIMIT, move || {
            (host.bus_devices(), host.mount_table())
        })
        .await;

        let (bus, mounts) = match queried {
            Ok(results) => results,
            Err(e) => {
                self.events.log_warning(&format!("Error getting USB devices: {}", e));
                return DeviceSnapshot::default();
            }
        };

        let mut snapshot = DeviceSnapshot { devices: BTreeSet::new(), complete: true };

        match bus {
            Ok(lines) => snapshot.devices.extend(lines),
            Err(e) => {
                self.events.log_warning(&format!("Error enumerating bus devices: {}", e));
                snapshot.complete = false;
            }
        }

        match mounts {
            Ok(records) => snapshot.devices.extend(
                records.iter().filter(|r| r.in_inventory()).map(MountRecord::descriptor),
            ),
            Err(e) => {
                self.events.log_warning(&format!("Error reading mount table: {}", e));
                snapshot.complete = false;
            }
        }

        snapshot
    }

    /// Whether a volume labelled `label` is mounted at any candidate path.
    ///
    /// Any error or timeout reads as "absent", which trips the identifier
    /// watcher.
    pub async fn identifier_present(&self, label: &str) -> bool {
        let host = self.host.clone();
        let label = label.to_string();
        let checked = bounded("identifier presence check", ENUMERATION_LIMIT, move || {
            let mut users: Vec<String> = Vec::new();
            for key in ["USER", "SUDO_USER"] {
                if let Some(user) = host.env_var(key) {
                    if !user.is_empty() && !users.contains(&user) {
                        users.push(user);
                    }
                }
            }

            let mut last_error = None;
            for path in identifier_candidates(&label, &users) {
                match host.is_mount_point(&path) {
                    Ok(true) => return Ok(true),
                    Ok(false) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => last_error = Some(e),
                }
            }
            match last_error {
                Some(e) => Err(e),
                None => Ok(false),
            }
        })
        .await;

        match checked {
            Ok(Ok(present)) => present,
            Ok(Err(e)) => {
                self.events.log_warning(&format!("Error checking USB identifier presence: {}", e));
                false
            }
            Err(e) => {
                self.events.log_warning(&format!("Error checking USB identifier presence: {}", e));
                false
            }
        }
    }

    /// Mounted volumes, or an empty list when the mount table is unreadable.
    pub async fn mounted_volumes(&self) -> Vec<MountRecord> {
        let host = self.host.clone();
        match bounded("mount table query", ENUMERATION_LIMIT, move || host.mount_table()).await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                self.events.log_warning(&format!("Error getting mounted volumes: {}", e));
                Vec::new()
            }
            Err(e) => {
                self.events.log_warning(&format!("Error getting mounted volumes: {}", e));
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemorySink;
    use crate::testing::FakeHost;
    use tempfile::TempDir;

    fn poller(host: Arc<FakeHost>) -> (InventoryPoller, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (InventoryPoller::new(host, EventLog::new(sink.clone())), sink)
    }

    #[test]
    fn test_parse_mount_table_decodes_escapes() {
        let content = "/dev/sda2 / ext4 rw,relatime 0 0\n\
                       /dev/sdb1 /media/alice/MY\\040DISK vfat rw 0 0\n\
                       \n";
        let records = parse_mount_table(content);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], MountRecord::new("/dev/sda2", "/", "ext4"));
        assert_eq!(records[1].mount_point, "/media/alice/MY DISK");
        assert_eq!(records[1].fstype, "vfat");
    }

    #[test]
    fn test_snapshot_equality_ignores_order_and_completeness() {
        let a = DeviceSnapshot::from_descriptors(["usb 1-1", "usb 1-2"]);
        let mut b = DeviceSnapshot::from_descriptors(["usb 1-2", "usb 1-1"]);
        b.complete = false;
        assert_eq!(a, b);
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn test_diff_reports_added_and_removed() {
        let before = DeviceSnapshot::from_descriptors(["usb 1-1", "usb 1-2"]);
        let after = DeviceSnapshot::from_descriptors(["usb 1-2", "usb 1-3"]);
        let diff = before.diff(&after);
        assert_eq!(diff.added, vec!["usb 1-3".to_string()]);
        assert_eq!(diff.removed, vec!["usb 1-1".to_string()]);
    }

    #[test]
    fn test_usb_devices_from_sysfs_skips_interfaces() {
        let dir = TempDir::new().unwrap();
        let dev = dir.path().join("1-1");
        fs::create_dir(&dev).unwrap();
        fs::write(dev.join("idVendor"), "0781\n").unwrap();
        fs::write(dev.join("idProduct"), "5581\n").unwrap();
        fs::write(dev.join("product"), "Ultra\n").unwrap();
        fs::write(dev.join("serial"), "4C53\n").unwrap();
        fs::create_dir(dir.path().join("1-1:1.0")).unwrap();
        fs::create_dir(dir.path().join("usb1")).unwrap();

        let devices = usb_devices_from_sysfs(dir.path()).unwrap();
        assert_eq!(devices, vec!["usb 1-1 0781:5581 Ultra sn.4C53".to_string()]);
    }

    #[test]
    fn test_identifier_candidates_cover_desktop_layouts() {
        let candidates = identifier_candidates("K", &["alice".to_string()]);
        let expected: Vec<PathBuf> = ["/media/alice/K", "/media/K", "/mnt/K", "/run/media/alice/K"]
            .iter()
            .map(PathBuf::from)
            .collect();
        assert_eq!(candidates, expected);
    }

    #[tokio::test]
    async fn test_snapshot_keeps_only_removable_mounts() {
        let host = Arc::new(FakeHost::new());
        host.set_bus(&["usb 1-1 0781:5581"]);
        host.set_mounts(vec![
            MountRecord::new("/dev/nvme0n1p2", "/", "ext4"),
            MountRecord::new("/dev/sdb1", "/media/alice/STICK", "vfat"),
        ]);
        let (poller, _) = poller(host);

        let snapshot = poller.snapshot().await;
        assert!(snapshot.complete);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.devices.contains("usb 1-1 0781:5581"));
        assert!(snapshot.devices.iter().any(|d| d.contains("/dev/sdb1")));
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_soft() {
        let host = Arc::new(FakeHost::new());
        host.fail_bus(true);
        host.set_mounts(vec![MountRecord::new("/dev/sdb1", "/mnt/x", "vfat")]);
        let (poller, sink) = poller(host);

        let snapshot = poller.snapshot().await;
        assert!(!snapshot.complete);
        assert_eq!(snapshot.len(), 1);
        assert!(sink.contains("Error enumerating bus devices"));
    }

    #[tokio::test]
    async fn test_identifier_presence_and_error_reads_absent() {
        let host = Arc::new(FakeHost::new());
        host.set_env("USER", "alice");
        host.add_mount_point("/media/alice/K");
        let (poller, sink) = poller(host.clone());

        assert!(poller.identifier_present("K").await);
        assert!(!poller.identifier_present("OTHER").await);

        host.fail_presence(true);
        assert!(!poller.identifier_present("K").await);
        assert!(sink.contains("Error checking USB identifier presence"));
    }
}
