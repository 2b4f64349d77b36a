//! Edits to the request set and reconciliation with the backend.
//!
//! The user edits a working copy of the requests one field at a time. After
//! every edit the working copy is merged over the backend's last-known list
//! and the result is pushed to the backend.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{PartitioningBackend, PartitioningTarget};
use crate::device::FORMAT_SWAP;
use crate::error::{Error, Result};
use crate::request::{Request, RequestSet, SWAP_MOUNT_POINT, find_by_device};

/// A single user edit of the request set.
///
/// `request_index == len` with `remove == false` appends a new row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RequestEdit {
    pub request_index: usize,
    #[serde(default)]
    pub mount_point: Option<String>,
    #[serde(default)]
    pub device_spec: Option<String>,
    #[serde(default)]
    pub reformat: Option<bool>,
    #[serde(default)]
    pub remove: bool,
}

impl RequestEdit {
    /// Edit of the row at `request_index`.
    pub fn at(request_index: usize) -> Self {
        Self {
            request_index,
            ..Default::default()
        }
    }

    /// Removal of the row at `request_index`.
    pub fn remove(request_index: usize) -> Self {
        Self {
            request_index,
            remove: true,
            ..Default::default()
        }
    }

    pub fn mount_point(mut self, mount_point: impl Into<String>) -> Self {
        self.mount_point = Some(mount_point.into());
        self
    }

    pub fn device_spec(mut self, device_spec: impl Into<String>) -> Self {
        self.device_spec = Some(device_spec.into());
        self
    }

    pub fn reformat(mut self, reformat: bool) -> Self {
        self.reformat = Some(reformat);
        self
    }
}

/// Applies an edit and returns the new request set.
///
/// The format type of the incoming device is copied from the request already
/// tracking that device, looked up in `known` (the backend's requests) first
/// and then in the working set, even when it is empty. A row whose format type
/// is swap always gets the "swap" mount point and root is always reformatted,
/// whatever the edit supplied.
pub fn apply_edit(requests: &RequestSet, edit: &RequestEdit, known: &[Request]) -> Result<RequestSet> {
    let len = requests.len();
    let index = edit.request_index;
    let mut updated = requests.clone();

    if edit.remove {
        if index >= len {
            return Err(Error::EditIndexOutOfRange { index, len });
        }
        let removed = updated.remove(index);
        debug!(index, device = %removed.device_spec, "removed mount point request");
        return Ok(updated);
    }

    if index > len {
        return Err(Error::EditIndexOutOfRange { index, len });
    }

    let mut request = requests.get(index).cloned().unwrap_or_default();

    if let Some(mount_point) = &edit.mount_point {
        request.mount_point = mount_point.clone();
    }

    if let Some(device_spec) = &edit.device_spec {
        request.device_spec = device_spec.clone();

        let tracked = find_by_device(known, device_spec)
            .or_else(|| requests.find_by_device(device_spec));
        if let Some(tracked) = tracked {
            request.format_type = tracked.format_type.clone();
        }
    }

    if let Some(reformat) = edit.reformat {
        request.reformat = reformat;
    }

    if request.format_type == FORMAT_SWAP {
        request.mount_point = SWAP_MOUNT_POINT.to_string();
    }

    if request.is_root() {
        request.reformat = true;
    }

    debug!(
        index,
        mount_point = %request.mount_point,
        device = %request.device_spec,
        reformat = request.reformat,
        "applied mount point request edit"
    );

    match updated.get_mut(index) {
        Some(slot) => *slot = request,
        None => updated.push(request),
    }

    Ok(updated)
}

/// Builds the list to send to the backend from the edited requests.
///
/// Only devices the backend already knows are addressable: each backend slot
/// is replaced by the edited request for the same device, or has its mount
/// point cleared if no edited request references the device anymore. Edited
/// requests for unknown devices are dropped.
pub fn reconcile_with_backend(backend_requests: &[Request], edited: &[Request]) -> Vec<Request> {
    backend_requests
        .iter()
        .map(|backend| match find_by_device(edited, &backend.device_spec) {
            Some(request) => request.clone(),
            None => Request {
                mount_point: String::new(),
                ..backend.clone()
            },
        })
        .collect()
}

/// Sends the outgoing requests to the backend.
///
/// Any backend failure is reported as [`Error::PersistFailure`] with the
/// backend's message unchanged. There is no retry.
pub fn persist(
    backend: &mut dyn PartitioningBackend,
    target: &PartitioningTarget,
    outgoing: &[Request],
) -> Result<()> {
    backend
        .set_manual_partitioning_requests(target, outgoing)
        .map_err(|e| {
            warn!(partitioning = %target, error = %e, "failed to persist mount point requests");
            match e {
                Error::PersistFailure { .. } => e,
                other => Error::PersistFailure {
                    target: target.to_string(),
                    message: other.to_string(),
                },
            }
        })
}
