//! Mount point constraint catalog.
//!
//! The backend declares, per well-known mount point, whether it is required
//! or recommended, which filesystem it must use and whether it may live on an
//! encrypted device. The catalog is loaded once per partitioning target and
//! never mutated afterwards.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A backend-declared rule for one mount point.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountPointConstraint {
    /// Mount point path (e.g., "/", "/boot").
    pub mount_point: String,
    /// The mount point must be assigned before installation.
    pub required: bool,
    /// The mount point should be assigned.
    pub recommended: bool,
    /// Filesystem the device must carry. Empty means any.
    pub required_filesystem_type: String,
    /// Whether the mount point may be placed on an encrypted device.
    pub encryption_allowed: bool,
}

impl MountPointConstraint {
    /// Creates a constraint with encryption allowed and no filesystem requirement.
    pub fn new(mount_point: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
            encryption_allowed: true,
            ..Default::default()
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn recommended(mut self) -> Self {
        self.recommended = true;
        self
    }

    pub fn with_filesystem(mut self, filesystem: impl Into<String>) -> Self {
        self.required_filesystem_type = filesystem.into();
        self
    }

    pub fn without_encryption(mut self) -> Self {
        self.encryption_allowed = false;
        self
    }

    /// Returns the required filesystem type, if any.
    pub fn required_filesystem(&self) -> Option<&str> {
        Some(self.required_filesystem_type.as_str()).filter(|fs| !fs.is_empty())
    }
}

/// How a row's mount point relates to the catalog; drives the row label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountPointKind {
    Required,
    Recommended,
    Custom,
}

/// Read-only list of mount point constraints.
///
/// An unloaded catalog is distinct from an empty one: listing an unloaded
/// catalog fails with [`Error::ConstraintsUnavailable`].
#[derive(Debug, Clone, Default)]
pub struct ConstraintCatalog {
    constraints: Option<Vec<MountPointConstraint>>,
}

impl ConstraintCatalog {
    /// Creates a catalog that has not been loaded yet.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Creates a loaded catalog.
    pub fn new(constraints: Vec<MountPointConstraint>) -> Self {
        Self {
            constraints: Some(constraints),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.constraints.is_some()
    }

    /// Returns all constraints in catalog order.
    pub fn list_constraints(&self) -> Result<&[MountPointConstraint]> {
        self.constraints
            .as_deref()
            .ok_or(Error::ConstraintsUnavailable)
    }

    /// Returns the constraints, or an empty slice while unloaded.
    pub(crate) fn as_slice(&self) -> &[MountPointConstraint] {
        self.constraints.as_deref().unwrap_or_default()
    }

    /// Finds the constraint for a mount point.
    pub fn find(&self, mount_point: &str) -> Option<&MountPointConstraint> {
        find_constraint(self.as_slice(), mount_point)
    }

    pub fn is_required(&self, mount_point: &str) -> bool {
        self.find(mount_point).is_some_and(|c| c.required)
    }

    pub fn is_recommended(&self, mount_point: &str) -> bool {
        self.find(mount_point).is_some_and(|c| c.recommended)
    }

    /// Classifies a mount point; required wins over recommended.
    pub fn kind_of(&self, mount_point: &str) -> MountPointKind {
        if self.is_required(mount_point) {
            MountPointKind::Required
        } else if self.is_recommended(mount_point) {
            MountPointKind::Recommended
        } else {
            MountPointKind::Custom
        }
    }
}

/// Finds the constraint matching a non-empty mount point.
pub fn find_constraint<'a>(
    constraints: &'a [MountPointConstraint],
    mount_point: &str,
) -> Option<&'a MountPointConstraint> {
    if mount_point.is_empty() {
        return None;
    }
    constraints.iter().find(|c| c.mount_point == mount_point)
}
