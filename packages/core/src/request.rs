//! Mount point requests and the editable request set.
//!
//! A [`Request`] assigns one mount point to one device. Requests use the
//! backend's wire shape directly: every field is always present and the empty
//! string means "unset".

use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::constraint::MountPointConstraint;

/// Root mount point. Always reformatted.
pub const ROOT_MOUNT_POINT: &str = "/";

/// Mount point carried by every swap device.
pub const SWAP_MOUNT_POINT: &str = "swap";

/// A single mount point to device assignment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Request {
    /// Device identifier, or "" when unassigned.
    pub device_spec: String,
    /// Format type of the device when the request was tracked, or "".
    pub format_type: String,
    /// Mount point path, or "" when unassigned.
    pub mount_point: String,
    /// Whether the device will be reformatted.
    pub reformat: bool,
}

impl Request {
    /// Creates a request with the given mount point and device.
    pub fn new(mount_point: impl Into<String>, device_spec: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
            device_spec: device_spec.into(),
            ..Default::default()
        }
    }

    pub fn with_format_type(mut self, format_type: impl Into<String>) -> Self {
        self.format_type = format_type.into();
        self
    }

    pub fn with_reformat(mut self, reformat: bool) -> Self {
        self.reformat = reformat;
        self
    }

    /// Returns the mount point, or None when unset.
    pub fn mount_point(&self) -> Option<&str> {
        non_empty(&self.mount_point)
    }

    /// Returns the device identifier, or None when unassigned.
    pub fn device(&self) -> Option<&str> {
        non_empty(&self.device_spec)
    }

    /// Returns the tracked format type, or None when unknown.
    pub fn format_type(&self) -> Option<&str> {
        non_empty(&self.format_type)
    }

    pub fn is_root(&self) -> bool {
        self.mount_point == ROOT_MOUNT_POINT
    }

    pub fn is_swap(&self) -> bool {
        self.mount_point == SWAP_MOUNT_POINT
    }
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value).filter(|v| !v.is_empty())
}

/// Ordered set of requests edited by the user.
///
/// Position is display order only. New requests are always appended.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestSet {
    requests: Vec<Request>,
}

impl RequestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<Request> {
        self.requests
    }

    pub(crate) fn push(&mut self, request: Request) {
        self.requests.push(request);
    }

    pub(crate) fn remove(&mut self, index: usize) -> Request {
        self.requests.remove(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Request> {
        self.requests.get_mut(index)
    }

    /// Returns the first request that references the device.
    pub fn find_by_device(&self, device: &str) -> Option<&Request> {
        find_by_device(&self.requests, device)
    }
}

impl Deref for RequestSet {
    type Target = [Request];

    fn deref(&self) -> &Self::Target {
        &self.requests
    }
}

impl From<Vec<Request>> for RequestSet {
    fn from(requests: Vec<Request>) -> Self {
        Self { requests }
    }
}

impl FromIterator<Request> for RequestSet {
    fn from_iter<I: IntoIterator<Item = Request>>(iter: I) -> Self {
        Self {
            requests: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a RequestSet {
    type Item = &'a Request;
    type IntoIter = std::slice::Iter<'a, Request>;

    fn into_iter(self) -> Self::IntoIter {
        self.requests.iter()
    }
}

/// Returns the first request that references a non-empty device.
pub fn find_by_device<'a>(requests: &'a [Request], device: &str) -> Option<&'a Request> {
    if device.is_empty() {
        return None;
    }
    requests.iter().find(|r| r.device_spec == device)
}

/// Builds the initial request set for a partitioning target.
///
/// Every constrained mount point gets a row (catalog order), seeded from the
/// backend request with the same mount point when one exists. Root is marked
/// for reformatting and every other constrained row is not, whatever the
/// backend had.
/// Backend requests with a mount point that no constraint covers follow in
/// backend order.
pub fn build_initial_request_set(
    backend_requests: &[Request],
    constraints: &[MountPointConstraint],
) -> RequestSet {
    let constrained = constraints
        .iter()
        .filter(|c| !c.mount_point.is_empty())
        .map(|constraint| {
            let mut request = backend_requests
                .iter()
                .find(|r| r.mount_point == constraint.mount_point)
                .cloned()
                .unwrap_or_default();

            request.mount_point = constraint.mount_point.clone();
            request.reformat = request.is_root();
            request
        });

    let custom = backend_requests
        .iter()
        .filter(|r| {
            !r.mount_point.is_empty()
                && !constraints.iter().any(|c| c.mount_point == r.mount_point)
        })
        .cloned();

    constrained.chain(custom).collect()
}
