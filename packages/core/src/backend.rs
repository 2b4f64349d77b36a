//! The partitioning backend port.
//!
//! The backend owns the real partitioning plan. The engine only needs a few
//! operations from it, collected in [`PartitioningBackend`]. Implementations:
//!
//! - [`MemoryBackend`]: in-process, used by tests and as a building block
//! - [`crate::state::FileBackend`]: persisted to a JSON state file
//! - [`crate::client::ProcessBackend`]: talks to a backend daemon process

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constraint::MountPointConstraint;
use crate::device::DeviceSnapshot;
use crate::error::{Error, Result};
use crate::request::Request;

/// Opaque backend handle of one partitioning plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitioningTarget(String);

impl PartitioningTarget {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitioningTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitioningTarget {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// How a partitioning plan was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitioningMethod {
    #[default]
    Manual,
    Automatic,
    Interactive,
}

/// Backend view of one partitioning plan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitioningInfo {
    pub method: PartitioningMethod,
    #[serde(default)]
    pub requests: Vec<Request>,
}

/// Operations the engine consumes from the partitioning backend.
pub trait PartitioningBackend {
    /// Sets the bootloader drive. An empty drive clears the selection.
    fn set_bootloader_drive(&mut self, drive: &str) -> Result<()>;

    /// Creates a new manual partitioning plan.
    fn create_manual_partitioning(&mut self) -> Result<PartitioningTarget>;

    /// Replaces the full request list of a plan.
    fn set_manual_partitioning_requests(
        &mut self,
        target: &PartitioningTarget,
        requests: &[Request],
    ) -> Result<()>;

    /// Resets the applied partitioning.
    fn reset_partitioning(&mut self) -> Result<()>;

    /// Reads a plan.
    fn partitioning(&self, target: &PartitioningTarget) -> Result<PartitioningInfo>;

    /// Reads the mount point constraints.
    fn mount_point_constraints(&self) -> Result<Vec<MountPointConstraint>>;

    /// Reads the device snapshot.
    fn device_data(&self) -> Result<DeviceSnapshot>;
}

/// In-memory backend.
///
/// Every new plan is seeded with one empty request per device of the
/// snapshot, which mirrors how a real backend enumerates existing devices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MemoryBackend {
    #[serde(default)]
    pub bootloader_drive: String,
    #[serde(default)]
    pub next_target: u32,
    #[serde(default)]
    pub partitionings: BTreeMap<PartitioningTarget, PartitioningInfo>,
    #[serde(default)]
    pub constraints: Vec<MountPointConstraint>,
    #[serde(default)]
    pub devices: DeviceSnapshot,
    /// Plan applied to the system by the installer, if any.
    #[serde(default)]
    pub applied: Option<PartitioningTarget>,
}

impl MemoryBackend {
    pub fn new(constraints: Vec<MountPointConstraint>, devices: DeviceSnapshot) -> Self {
        Self {
            constraints,
            devices,
            ..Default::default()
        }
    }

    /// Requests a new plan starts with: one unassigned slot per device.
    fn seed_requests(&self) -> Vec<Request> {
        self.devices
            .values()
            .filter(|d| d.format.is_some())
            .map(|d| Request::new("", d.name.clone()).with_format_type(d.format_type()))
            .collect()
    }
}

impl PartitioningBackend for MemoryBackend {
    fn set_bootloader_drive(&mut self, drive: &str) -> Result<()> {
        self.bootloader_drive = drive.to_string();
        Ok(())
    }

    fn create_manual_partitioning(&mut self) -> Result<PartitioningTarget> {
        self.next_target += 1;
        let target = PartitioningTarget::new(format!("/partitioning/{}", self.next_target));
        let info = PartitioningInfo {
            method: PartitioningMethod::Manual,
            requests: self.seed_requests(),
        };
        self.partitionings.insert(target.clone(), info);
        info!(partitioning = %target, "created manual partitioning");
        Ok(target)
    }

    fn set_manual_partitioning_requests(
        &mut self,
        target: &PartitioningTarget,
        requests: &[Request],
    ) -> Result<()> {
        let info = self
            .partitionings
            .get_mut(target)
            .ok_or_else(|| Error::UnknownTarget {
                target: target.to_string(),
            })?;
        info.requests = requests.to_vec();
        debug!(partitioning = %target, count = requests.len(), "stored mount point requests");
        Ok(())
    }

    fn reset_partitioning(&mut self) -> Result<()> {
        self.applied = None;
        Ok(())
    }

    fn partitioning(&self, target: &PartitioningTarget) -> Result<PartitioningInfo> {
        self.partitionings
            .get(target)
            .cloned()
            .ok_or_else(|| Error::UnknownTarget {
                target: target.to_string(),
            })
    }

    fn mount_point_constraints(&self) -> Result<Vec<MountPointConstraint>> {
        Ok(self.constraints.clone())
    }

    fn device_data(&self) -> Result<DeviceSnapshot> {
        Ok(self.devices.clone())
    }
}

/// Returns the manual partitioning target to edit.
///
/// The current plan is reused only when `reuse` is set and it is manual.
/// Otherwise the bootloader drive is cleared first, so that it is chosen again
/// for the new plan instead of carrying over a stale placement, and a new
/// manual plan is created.
pub fn start_manual_partitioning(
    backend: &mut dyn PartitioningBackend,
    current: Option<(&PartitioningTarget, &PartitioningInfo)>,
    reuse: bool,
) -> Result<PartitioningTarget> {
    if reuse
        && let Some((target, info)) = current
        && info.method == PartitioningMethod::Manual
    {
        debug!(partitioning = %target, "reusing manual partitioning");
        return Ok(target.clone());
    }

    backend.set_bootloader_drive("")?;
    backend.create_manual_partitioning()
}

/// Returns true when a previously applied plan differs from the current one.
pub fn needs_reset(applied: Option<&PartitioningTarget>, current: &PartitioningTarget) -> bool {
    applied.is_some_and(|applied| applied != current)
}

/// Resets the backend partitioning if a different plan was applied before.
pub fn reset_if_needed(
    backend: &mut dyn PartitioningBackend,
    applied: Option<&PartitioningTarget>,
    current: &PartitioningTarget,
) -> Result<bool> {
    if !needs_reset(applied, current) {
        return Ok(false);
    }
    info!(partitioning = %current, "resetting previously applied partitioning");
    backend.reset_partitioning()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{device, snapshot};

    fn backend() -> MemoryBackend {
        MemoryBackend::new(
            vec![MountPointConstraint::new("/").required()],
            snapshot(vec![device("sda1", "ext4"), device("sda2", "swap")]),
        )
    }

    #[test]
    fn test_new_partitioning_is_seeded_with_devices() {
        let mut backend = backend();
        let target = backend.create_manual_partitioning().unwrap();
        let info = backend.partitioning(&target).unwrap();

        assert_eq!(info.method, PartitioningMethod::Manual);
        assert_eq!(
            info.requests,
            vec![
                Request::new("", "sda1").with_format_type("ext4"),
                Request::new("", "sda2").with_format_type("swap"),
            ]
        );
    }

    #[test]
    fn test_start_clears_bootloader_drive() {
        let mut backend = backend();
        backend.bootloader_drive = "sda".to_string();

        let target = start_manual_partitioning(&mut backend, None, true).unwrap();
        assert_eq!(backend.bootloader_drive, "");
        assert!(backend.partitionings.contains_key(&target));
    }

    #[test]
    fn test_start_reuses_manual_partitioning() {
        let mut backend = backend();
        let target = backend.create_manual_partitioning().unwrap();
        let info = backend.partitioning(&target).unwrap();
        backend.bootloader_drive = "sda".to_string();

        let reused = start_manual_partitioning(&mut backend, Some((&target, &info)), true).unwrap();
        assert_eq!(reused, target);
        assert_eq!(backend.bootloader_drive, "sda");

        let fresh = start_manual_partitioning(&mut backend, Some((&target, &info)), false).unwrap();
        assert_ne!(fresh, target);

        let automatic = PartitioningInfo {
            method: PartitioningMethod::Automatic,
            requests: Vec::new(),
        };
        let fresh = start_manual_partitioning(&mut backend, Some((&target, &automatic)), true).unwrap();
        assert_ne!(fresh, target);
    }

    #[test]
    fn test_unknown_target() {
        let mut backend = backend();
        let target = PartitioningTarget::from("/nope");
        assert!(matches!(
            backend.set_manual_partitioning_requests(&target, &[]),
            Err(Error::UnknownTarget { .. })
        ));
        assert!(backend.partitioning(&target).is_err());
    }

    #[test]
    fn test_reset_if_needed() {
        let mut backend = backend();
        let first = PartitioningTarget::from("/1");
        let second = PartitioningTarget::from("/2");
        backend.applied = Some(first.clone());

        assert!(!needs_reset(None, &first));
        assert!(!reset_if_needed(&mut backend, Some(&first), &first).unwrap());
        assert!(reset_if_needed(&mut backend, Some(&first), &second).unwrap());
        assert_eq!(backend.applied, None);
    }
}
