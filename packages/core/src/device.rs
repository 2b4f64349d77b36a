//! Device classification for mount point assignment.
//!
//! The backend reports a snapshot of every block device it knows about. This
//! module decides which of those devices may be offered for assignment, which
//! are locked encrypted containers, and which devices sit below another one
//! in the storage hierarchy (used by the reformat cascade rule).

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::request::Request;

/// Format type reported for swap space.
pub const FORMAT_SWAP: &str = "swap";

/// Format type reported for a LUKS container.
pub const FORMAT_LUKS: &str = "luks";

/// Device type reported for an opened (mapped) LUKS device.
pub const DEVICE_TYPE_LUKS_MAPPED: &str = "luks/dm-crypt";

/// Format information of a device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FormatData {
    /// Filesystem type (e.g., "ext4", "swap", "luks"). Empty if unformatted.
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Whether the existing format can be mounted.
    #[serde(default)]
    pub mountable: bool,
    /// Whether the device can be reformatted.
    #[serde(default)]
    pub formattable: bool,
    /// Human-readable format description (e.g., "ext4", "LUKS").
    #[serde(default)]
    pub description: String,
    /// LUKS only: whether the container key is loaded (unlocked).
    #[serde(default)]
    pub has_key: bool,
}

/// Backend view of a single device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceInfo {
    /// Device identifier (e.g., "sda1").
    pub name: String,
    /// Device type (e.g., "disk", "partition", "luks/dm-crypt").
    #[serde(rename = "type")]
    pub device_type: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Devices directly below this one.
    #[serde(default)]
    pub children: Vec<String>,
    /// Devices directly above this one.
    #[serde(default)]
    pub parents: Vec<String>,
    /// Current format, if the backend reported one.
    #[serde(default)]
    pub format: Option<FormatData>,
}

impl DeviceInfo {
    /// Returns the current format type, or "" if unknown.
    pub fn format_type(&self) -> &str {
        self.format.as_ref().map_or("", |f| f.fs_type.as_str())
    }

    pub fn is_swap(&self) -> bool {
        self.format_type() == FORMAT_SWAP
    }

    pub fn is_luks(&self) -> bool {
        self.format_type() == FORMAT_LUKS
    }

    /// Returns true for a LUKS container whose key is not loaded.
    pub fn is_locked(&self) -> bool {
        self.is_luks() && !self.format.as_ref().is_some_and(|f| f.has_key)
    }

    pub fn is_formattable(&self) -> bool {
        self.format.as_ref().is_some_and(|f| f.formattable)
    }

    pub fn is_mountable(&self) -> bool {
        self.format.as_ref().is_some_and(|f| f.mountable)
    }

    /// Returns true if the device is an opened encrypted mapping.
    pub fn is_encrypted(&self) -> bool {
        self.device_type == DEVICE_TYPE_LUKS_MAPPED
    }

    /// Description shown next to the device in a picker: "<format>, <size>".
    pub fn option_description(&self) -> String {
        let format = self.format.as_ref().map_or("", |f| f.description.as_str());
        format!("{}, {}", format, format_bytes(self.size))
    }
}

/// Read-only device snapshot keyed by device identifier.
pub type DeviceSnapshot = BTreeMap<String, DeviceInfo>;

/// Returns true if the device may be offered for mount point assignment.
///
/// LUKS containers are always listed, locked or not, so that they can be
/// unlocked elsewhere. Otherwise only swap and mountable formats qualify.
pub fn is_usable_device(device_id: &str, devices: &DeviceSnapshot) -> bool {
    let Some(format) = devices.get(device_id).and_then(|d| d.format.as_ref()) else {
        return false;
    };

    format.fs_type == FORMAT_LUKS || format.fs_type == FORMAT_SWAP || format.mountable
}

/// Returns the locked LUKS devices referenced by the given requests.
pub fn locked_devices(requests: &[Request], devices: &DeviceSnapshot) -> BTreeSet<String> {
    requests
        .iter()
        .filter_map(|r| r.device())
        .filter(|id| devices.get(*id).is_some_and(DeviceInfo::is_locked))
        .map(str::to_string)
        .collect()
}

/// Returns every device below `device_id` in the storage hierarchy.
///
/// Depth-first, the device itself excluded. Cycles in a malformed snapshot
/// are ignored.
pub fn child_devices(devices: &DeviceSnapshot, device_id: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut visited = HashSet::from([device_id.to_string()]);
    collect_children(devices, device_id, &mut visited, &mut result);
    result
}

fn collect_children(
    devices: &DeviceSnapshot,
    device_id: &str,
    visited: &mut HashSet<String>,
    result: &mut Vec<String>,
) {
    let Some(device) = devices.get(device_id) else {
        return;
    };

    for child in &device.children {
        if !visited.insert(child.clone()) {
            continue;
        }
        result.push(child.clone());
        collect_children(devices, child, visited, result);
    }
}

/// Lists the devices that can be picked, in backend request order.
///
/// Only devices the backend already enumerated in its requests are
/// addressable.
pub fn assignable_devices(requests: &[Request], devices: &DeviceSnapshot) -> Vec<String> {
    let mut seen = HashSet::new();
    requests
        .iter()
        .filter_map(|r| r.device())
        .filter(|id| is_usable_device(id, devices))
        .filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect()
}

/// One entry of a row's device picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceOption {
    pub device: String,
    pub description: String,
    pub disabled: bool,
}

/// Builds the picker entries for one row.
///
/// Locked LUKS devices are disabled. Swap devices are disabled on rows whose
/// mount point is required, because picking swap replaces the mount point.
pub fn device_options(
    assignable: &[String],
    devices: &DeviceSnapshot,
    locked: &BTreeSet<String>,
    mount_point_required: bool,
) -> Vec<DeviceOption> {
    assignable
        .iter()
        .map(|id| {
            let info = devices.get(id);
            let is_swap = info.is_some_and(DeviceInfo::is_swap);
            DeviceOption {
                device: id.clone(),
                description: info.map(DeviceInfo::option_description).unwrap_or_default(),
                disabled: locked.contains(id) || (is_swap && mount_point_required),
            }
        })
        .collect()
}

/// Formats a byte count for display using decimal units (e.g., "536.9 MB").
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];

    let mut steps = 0;
    let mut val = bytes as f64;
    while val >= 1000.0 && steps < UNITS.len() - 1 {
        val /= 1000.0;
        steps += 1;
    }

    if steps == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", val, UNITS[steps])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn device(name: &str, fs_type: &str) -> DeviceInfo {
        DeviceInfo {
            name: name.to_string(),
            device_type: "partition".to_string(),
            size: 1_000_000_000,
            children: Vec::new(),
            parents: Vec::new(),
            format: Some(FormatData {
                fs_type: fs_type.to_string(),
                mountable: !matches!(fs_type, "" | FORMAT_SWAP | FORMAT_LUKS),
                formattable: true,
                description: fs_type.to_string(),
                has_key: false,
            }),
        }
    }

    pub(crate) fn snapshot(devices: Vec<DeviceInfo>) -> DeviceSnapshot {
        devices.into_iter().map(|d| (d.name.clone(), d)).collect()
    }

    fn with_children(mut device: DeviceInfo, children: &[&str]) -> DeviceInfo {
        device.children = children.iter().map(|c| c.to_string()).collect();
        device
    }

    #[test]
    fn test_is_usable_device() {
        let mut unlocked = device("sdb1", FORMAT_LUKS);
        unlocked.format.as_mut().unwrap().has_key = true;
        let devices = snapshot(vec![
            device("sda1", "ext4"),
            device("sda2", FORMAT_SWAP),
            device("sda3", FORMAT_LUKS),
            device("sda4", ""),
            unlocked,
            DeviceInfo {
                name: "sda".to_string(),
                device_type: "disk".to_string(),
                ..Default::default()
            },
        ]);

        assert!(is_usable_device("sda1", &devices));
        assert!(is_usable_device("sda2", &devices));
        assert!(is_usable_device("sda3", &devices));
        assert!(is_usable_device("sdb1", &devices));
        assert!(!is_usable_device("sda4", &devices));
        assert!(!is_usable_device("sda", &devices));
        assert!(!is_usable_device("missing", &devices));
    }

    #[test]
    fn test_locked_devices_only_for_requested() {
        let mut unlocked = device("sdb1", FORMAT_LUKS);
        unlocked.format.as_mut().unwrap().has_key = true;
        let devices = snapshot(vec![
            device("sda1", "ext4"),
            device("sda3", FORMAT_LUKS),
            device("sdc1", FORMAT_LUKS),
            unlocked,
        ]);
        let requests = vec![
            Request::new("/", "sda1"),
            Request::new("", "sda3"),
            Request::new("", "sdb1"),
        ];

        let locked = locked_devices(&requests, &devices);
        assert_eq!(locked, BTreeSet::from(["sda3".to_string()]));
    }

    #[test]
    fn test_child_devices_recursive() {
        let devices = snapshot(vec![
            with_children(device("sda", ""), &["sda1", "sda2"]),
            with_children(device("sda2", FORMAT_LUKS), &["luks-sda2"]),
            device("sda1", "ext4"),
            device("luks-sda2", "xfs"),
        ]);

        assert_eq!(
            child_devices(&devices, "sda"),
            vec!["sda1", "sda2", "luks-sda2"]
        );
        assert_eq!(child_devices(&devices, "sda2"), vec!["luks-sda2"]);
        assert!(child_devices(&devices, "sda1").is_empty());
        assert!(child_devices(&devices, "missing").is_empty());
    }

    #[test]
    fn test_child_devices_ignores_cycles() {
        let devices = snapshot(vec![
            with_children(device("a", ""), &["b"]),
            with_children(device("b", ""), &["a"]),
        ]);
        assert_eq!(child_devices(&devices, "a"), vec!["b"]);
    }

    #[test]
    fn test_device_options_disabling() {
        let devices = snapshot(vec![
            device("sda1", "ext4"),
            device("sda2", FORMAT_SWAP),
            device("sda3", FORMAT_LUKS),
            device("sda4", ""),
        ]);
        let requests = vec![
            Request::new("", "sda1"),
            Request::new("", "sda2"),
            Request::new("", "sda3"),
            Request::new("", "sda4"),
            Request::new("", "sda1"),
        ];

        let assignable = assignable_devices(&requests, &devices);
        assert_eq!(assignable, vec!["sda1", "sda2", "sda3"]);

        let locked = locked_devices(&requests, &devices);
        let options = device_options(&assignable, &devices, &locked, true);
        let disabled: Vec<_> = options.iter().map(|o| o.disabled).collect();
        assert_eq!(disabled, vec![false, true, true]);

        let options = device_options(&assignable, &devices, &locked, false);
        let disabled: Vec<_> = options.iter().map(|o| o.disabled).collect();
        assert_eq!(disabled, vec![false, false, true]);
        assert_eq!(options[0].description, "ext4, 1.0 GB");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(999), "999 B");
        assert_eq!(format_bytes(1000), "1.0 kB");
        assert_eq!(format_bytes(536_870_912), "536.9 MB");
        assert_eq!(format_bytes(500_107_862_016), "500.1 GB");
    }

    #[test]
    fn test_device_wire_shape() {
        let json = r#"{
            "name": "sda2",
            "type": "partition",
            "size": 1024,
            "children": ["luks-sda2"],
            "format": {
                "type": "luks",
                "mountable": false,
                "formattable": true,
                "description": "LUKS",
                "has-key": false
            }
        }"#;
        let device: DeviceInfo = serde_json::from_str(json).unwrap();
        assert!(device.is_luks());
        assert!(device.is_locked());
        assert!(device.parents.is_empty());
        assert_eq!(device.children, vec!["luks-sda2"]);
    }
}
