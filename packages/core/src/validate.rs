//! Validation of the request set.
//!
//! All functions here are pure computations over the passed-in snapshots.
//! A problem is reported as a [`ValidationIssue`] value, never as an error:
//! every issue can be fixed by further edits.

use std::fmt;

use serde::Serialize;

use crate::constraint::{ConstraintCatalog, MountPointConstraint, MountPointKind, find_constraint};
use crate::device::{DeviceSnapshot, child_devices};
use crate::request::Request;

/// A row- or set-level validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ValidationIssue {
    /// The row lacks a mount point or a device.
    Incomplete,
    /// Another row uses the same mount point.
    DuplicateMountPoint,
    /// Another row uses the same device.
    DuplicateDevice,
    /// The device is not part of the device snapshot.
    UnknownDevice { device: String },
    /// The device is a locked encrypted container.
    LockedDevice { device: String },
    /// The device's current format cannot be reformatted.
    NotFormattable { format: String },
    /// A parent is reformatted but a child in the set is not.
    ReformatMismatch,
    /// The mount point requires a specific filesystem.
    RequiredFilesystem {
        mount_point: String,
        filesystem: String,
    },
    /// The mount point cannot live on an encrypted device.
    EncryptionNotAllowed { mount_point: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete => write!(f, "Mount point and device must both be set."),
            Self::DuplicateMountPoint => write!(f, "Duplicate mount point."),
            Self::DuplicateDevice => write!(f, "Duplicate device."),
            Self::UnknownDevice { device } => write!(f, "Device '{}' is not available.", device),
            Self::LockedDevice { device } => {
                write!(f, "Device '{}' is locked and must be unlocked first.", device)
            }
            Self::NotFormattable { format } => write!(
                f,
                "Selected device's format '{}' cannot be reformatted.",
                format
            ),
            Self::ReformatMismatch => write!(
                f,
                "Mismatch between parent device and child device reformat selection."
            ),
            Self::RequiredFilesystem {
                mount_point,
                filesystem,
            } => write!(
                f,
                "'{}' must be on a device formatted to '{}'",
                mount_point, filesystem
            ),
            Self::EncryptionNotAllowed { mount_point } => write!(
                f,
                "'{}' filesystem cannot be on an encrypted block device",
                mount_point
            ),
        }
    }
}

/// Returns true if both mount point and device are set.
pub fn is_request_complete(request: &Request) -> bool {
    request.mount_point().is_some() && request.device().is_some()
}

/// Counts requests whose field equals a non-empty value.
fn count_matching<'a>(
    requests: &'a [Request],
    value: &str,
    field: impl Fn(&'a Request) -> &'a str,
) -> usize {
    if value.is_empty() {
        return 0;
    }
    requests.iter().filter(|r| field(*r) == value).count()
}

/// Returns true if more than one request uses this non-empty mount point.
pub fn duplicated_mount_point(requests: &[Request], mount_point: &str) -> bool {
    count_matching(requests, mount_point, |r| r.mount_point.as_str()) > 1
}

/// Returns true if more than one request uses this non-empty device.
pub fn duplicated_device(requests: &[Request], device: &str) -> bool {
    count_matching(requests, device, |r| r.device_spec.as_str()) > 1
}

/// Returns true if any non-empty mount point appears twice.
pub fn has_duplicate_mount_points(requests: &[Request]) -> bool {
    requests
        .iter()
        .any(|r| duplicated_mount_point(requests, &r.mount_point))
}

/// Returns true if any non-empty device appears twice.
pub fn has_duplicate_devices(requests: &[Request]) -> bool {
    requests
        .iter()
        .any(|r| duplicated_device(requests, &r.device_spec))
}

/// Checks the reformat flag of a request.
///
/// A reformatted device must be formattable, and every child device that has
/// its own request must be reformatted as well. Children without a request do
/// not count.
pub fn is_reformat_invalid(
    devices: &DeviceSnapshot,
    request: &Request,
    requests: &[Request],
) -> Option<ValidationIssue> {
    let device_id = request.device()?;
    if !request.reformat {
        return None;
    }

    let Some(device) = devices.get(device_id) else {
        return Some(ValidationIssue::UnknownDevice {
            device: device_id.to_string(),
        });
    };

    if !device.is_formattable() {
        return Some(ValidationIssue::NotFormattable {
            format: device.format_type().to_string(),
        });
    }

    let children_agree = child_devices(devices, device_id).iter().all(|child| {
        requests
            .iter()
            .find(|r| r.device_spec == *child)
            .is_none_or(|r| r.reformat)
    });

    if children_agree {
        None
    } else {
        Some(ValidationIssue::ReformatMismatch)
    }
}

/// Checks a request's device against the constraint for its mount point.
pub fn is_device_mount_point_invalid(
    devices: &DeviceSnapshot,
    constraints: &[MountPointConstraint],
    request: &Request,
) -> Option<ValidationIssue> {
    let device_id = request.device()?;
    let mount_point = request.mount_point()?;
    let constraint = find_constraint(constraints, mount_point)?;
    let device = devices.get(device_id)?;

    if let Some(filesystem) = constraint.required_filesystem()
        && device.format_type() != filesystem
    {
        return Some(ValidationIssue::RequiredFilesystem {
            mount_point: mount_point.to_string(),
            filesystem: filesystem.to_string(),
        });
    }

    if !constraint.encryption_allowed && device.is_encrypted() {
        return Some(ValidationIssue::EncryptionNotAllowed {
            mount_point: mount_point.to_string(),
        });
    }

    None
}

/// Returns the locked-device issue for a request, if any.
fn locked_device_issue(devices: &DeviceSnapshot, request: &Request) -> Option<ValidationIssue> {
    let device_id = request.device()?;
    devices
        .get(device_id)
        .filter(|d| d.is_locked())
        .map(|_| ValidationIssue::LockedDevice {
            device: device_id.to_string(),
        })
}

/// Returns true if the request set may be submitted.
///
/// Requires unique mount points and devices, complete rows, valid reformat
/// selections, and no locked devices. Constraint mismatches are not checked
/// here; see [`is_request_set_valid_with_constraints`].
pub fn is_request_set_valid(requests: &[Request], devices: &DeviceSnapshot) -> bool {
    !has_duplicate_mount_points(requests)
        && !has_duplicate_devices(requests)
        && requests.iter().all(|r| {
            is_request_complete(r)
                && locked_device_issue(devices, r).is_none()
                && is_reformat_invalid(devices, r, requests).is_none()
        })
}

/// Like [`is_request_set_valid`], but constraint mismatches also fail.
pub fn is_request_set_valid_with_constraints(
    requests: &[Request],
    devices: &DeviceSnapshot,
    constraints: &[MountPointConstraint],
) -> bool {
    is_request_set_valid(requests, devices)
        && requests
            .iter()
            .all(|r| is_device_mount_point_invalid(devices, constraints, r).is_none())
}

/// Conceptual lifecycle state of a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum RequestState {
    Empty,
    DeviceChosen,
    MountPointAssigned,
    Valid,
    Invalid { issue: ValidationIssue },
}

/// Computes the state of the request at `index`.
///
/// The first issue found wins, checked in the order the row displays them.
pub fn request_state(
    requests: &[Request],
    index: usize,
    devices: &DeviceSnapshot,
    constraints: &[MountPointConstraint],
) -> RequestState {
    let Some(request) = requests.get(index) else {
        return RequestState::Empty;
    };

    match (request.mount_point(), request.device()) {
        (None, None) => return RequestState::Empty,
        (None, Some(_)) => return RequestState::DeviceChosen,
        (Some(_), None) => return RequestState::MountPointAssigned,
        (Some(_), Some(_)) => {}
    }

    let issue = if duplicated_mount_point(requests, &request.mount_point) {
        Some(ValidationIssue::DuplicateMountPoint)
    } else if duplicated_device(requests, &request.device_spec) {
        Some(ValidationIssue::DuplicateDevice)
    } else {
        locked_device_issue(devices, request)
            .or_else(|| is_device_mount_point_invalid(devices, constraints, request))
            .or_else(|| is_reformat_invalid(devices, request, requests))
    };

    match issue {
        Some(issue) => RequestState::Invalid { issue },
        None => RequestState::Valid,
    }
}

/// Everything a front end needs to render one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowReport {
    pub index: usize,
    pub kind: MountPointKind,
    /// Mount point, or the tracked format type when the mount point is empty.
    pub display_mount_point: String,
    /// Required and recommended mount points are fixed unless duplicated;
    /// swap rows are never editable.
    pub mount_point_editable: bool,
    pub duplicate_mount_point: bool,
    pub duplicate_device: bool,
    pub device_issue: Option<ValidationIssue>,
    pub reformat_issue: Option<ValidationIssue>,
    /// Root is always reformatted.
    pub reformat_locked: bool,
    /// Required rows cannot be removed unless duplicated.
    pub removable: bool,
}

/// Builds the row reports for the whole set.
pub fn row_reports(
    requests: &[Request],
    devices: &DeviceSnapshot,
    catalog: &ConstraintCatalog,
) -> Vec<RowReport> {
    let constraints = catalog.as_slice();

    requests
        .iter()
        .enumerate()
        .map(|(index, request)| {
            let kind = catalog.kind_of(&request.mount_point);
            let duplicate_mount_point = duplicated_mount_point(requests, &request.mount_point);
            let fixed = matches!(kind, MountPointKind::Required | MountPointKind::Recommended)
                && !duplicate_mount_point;
            let display_mount_point = request
                .mount_point()
                .or(request.format_type())
                .unwrap_or_default()
                .to_string();

            RowReport {
                index,
                kind,
                display_mount_point,
                mount_point_editable: !(fixed || request.is_swap()),
                duplicate_mount_point,
                duplicate_device: duplicated_device(requests, &request.device_spec),
                device_issue: locked_device_issue(devices, request)
                    .or_else(|| is_device_mount_point_invalid(devices, constraints, request)),
                reformat_issue: is_reformat_invalid(devices, request, requests),
                reformat_locked: request.is_root(),
                removable: !(kind == MountPointKind::Required && !duplicate_mount_point),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{device, snapshot};
    use crate::device::{DEVICE_TYPE_LUKS_MAPPED, FORMAT_LUKS, FORMAT_SWAP};

    fn hierarchy() -> DeviceSnapshot {
        let mut parent = device("sda", "ext4");
        parent.children = vec!["sda1".to_string(), "sda2".to_string()];
        snapshot(vec![parent, device("sda1", "ext4"), device("sda2", "xfs")])
    }

    #[test]
    fn test_request_complete() {
        assert!(is_request_complete(&Request::new("/", "sda1")));
        assert!(!is_request_complete(&Request::new("/", "")));
        assert!(!is_request_complete(&Request::new("", "sda1")));
    }

    #[test]
    fn test_duplicate_mount_points_invalidate_set() {
        let devices = snapshot(vec![device("sda1", "ext4"), device("sda2", "ext4")]);
        let requests = vec![Request::new("/home", "sda1"), Request::new("/home", "sda2")];

        assert!(has_duplicate_mount_points(&requests));
        assert!(!is_request_set_valid(&requests, &devices));
    }

    #[test]
    fn test_duplicate_devices_invalidate_set() {
        let devices = snapshot(vec![device("sda3", "ext4")]);
        let requests = vec![Request::new("/home", "sda3"), Request::new("/var", "sda3")];

        assert!(!is_request_set_valid(&requests, &devices));
        for index in 0..requests.len() {
            assert!(duplicated_device(&requests, &requests[index].device_spec));
            assert_eq!(
                request_state(&requests, index, &devices, &[]),
                RequestState::Invalid {
                    issue: ValidationIssue::DuplicateDevice
                }
            );
        }

        let reports = row_reports(&requests, &devices, &ConstraintCatalog::new(Vec::new()));
        assert!(reports.iter().all(|r| r.duplicate_device));
    }

    #[test]
    fn test_empty_values_are_not_duplicates() {
        let devices = snapshot(vec![device("sda1", "ext4")]);
        let requests = vec![Request::new("", ""), Request::new("", "")];
        assert!(!has_duplicate_mount_points(&requests));
        assert!(!has_duplicate_devices(&requests));
        assert!(!is_request_set_valid(&requests, &devices));
    }

    #[test]
    fn test_valid_set() {
        let devices = snapshot(vec![device("sda1", "ext4"), device("sda2", FORMAT_SWAP)]);
        let requests = vec![
            Request::new("/", "sda1").with_reformat(true),
            Request::new("swap", "sda2"),
        ];
        assert!(is_request_set_valid(&requests, &devices));
    }

    #[test]
    fn test_reformat_not_formattable() {
        let mut devices = snapshot(vec![device("sda1", "ntfs")]);
        devices.get_mut("sda1").unwrap().format.as_mut().unwrap().formattable = false;

        let request = Request::new("/data", "sda1").with_reformat(true);
        let issue = is_reformat_invalid(&devices, &request, std::slice::from_ref(&request));
        assert_eq!(
            issue,
            Some(ValidationIssue::NotFormattable {
                format: "ntfs".to_string()
            })
        );
        assert_eq!(
            issue.unwrap().to_string(),
            "Selected device's format 'ntfs' cannot be reformatted."
        );

        let keep = Request::new("/data", "sda1");
        assert_eq!(is_reformat_invalid(&devices, &keep, &[]), None);
        assert_eq!(is_reformat_invalid(&devices, &Request::new("/", ""), &[]), None);
    }

    #[test]
    fn test_reformat_cascade() {
        let devices = hierarchy();
        let mut requests = vec![
            Request::new("/", "sda").with_reformat(true),
            Request::new("/home", "sda1").with_reformat(true),
        ];
        assert_eq!(is_reformat_invalid(&devices, &requests[0], &requests), None);

        // Child present and not reformatted.
        requests[1].reformat = false;
        assert_eq!(
            is_reformat_invalid(&devices, &requests[0], &requests),
            Some(ValidationIssue::ReformatMismatch)
        );
        assert!(!is_request_set_valid(&requests, &devices));

        // Emptying the child's mount point keeps it in the set.
        requests[1].mount_point.clear();
        assert_eq!(
            is_reformat_invalid(&devices, &requests[0], &requests),
            Some(ValidationIssue::ReformatMismatch)
        );

        // Removing the child clears the violation.
        requests.remove(1);
        assert_eq!(is_reformat_invalid(&devices, &requests[0], &requests), None);
    }

    #[test]
    fn test_required_filesystem() {
        let devices = snapshot(vec![device("sda1", "vfat"), device("sda2", "efi")]);
        let constraints = vec![MountPointConstraint::new("/boot/efi").with_filesystem("efi")];

        let issue =
            is_device_mount_point_invalid(&devices, &constraints, &Request::new("/boot/efi", "sda1"));
        assert_eq!(
            issue.unwrap().to_string(),
            "'/boot/efi' must be on a device formatted to 'efi'"
        );
        assert_eq!(
            is_device_mount_point_invalid(&devices, &constraints, &Request::new("/boot/efi", "sda2")),
            None
        );
        // No constraint, no device or no mount point: nothing to check.
        assert_eq!(
            is_device_mount_point_invalid(&devices, &constraints, &Request::new("/srv", "sda1")),
            None
        );
        assert_eq!(
            is_device_mount_point_invalid(&devices, &constraints, &Request::new("/boot/efi", "")),
            None
        );
    }

    #[test]
    fn test_encryption_not_allowed() {
        let mut mapped = device("luks-sda2", "ext4");
        mapped.device_type = DEVICE_TYPE_LUKS_MAPPED.to_string();
        let devices = snapshot(vec![mapped]);
        let constraints = vec![MountPointConstraint::new("/boot").without_encryption()];

        let request = Request::new("/boot", "luks-sda2");
        assert_eq!(
            is_device_mount_point_invalid(&devices, &constraints, &request),
            Some(ValidationIssue::EncryptionNotAllowed {
                mount_point: "/boot".to_string()
            })
        );

        // Advisory by default, enforced by the strict check.
        let requests = vec![request];
        assert!(is_request_set_valid(&requests, &devices));
        assert!(!is_request_set_valid_with_constraints(
            &requests,
            &devices,
            &constraints
        ));
    }

    #[test]
    fn test_locked_device_invalidates_set() {
        let devices = snapshot(vec![device("sda3", FORMAT_LUKS)]);
        let requests = vec![Request::new("/home", "sda3")];
        assert!(!is_request_set_valid(&requests, &devices));
        assert_eq!(
            request_state(&requests, 0, &devices, &[]),
            RequestState::Invalid {
                issue: ValidationIssue::LockedDevice {
                    device: "sda3".to_string()
                }
            }
        );
    }

    #[test]
    fn test_request_states() {
        let devices = snapshot(vec![device("sda1", "ext4")]);
        let requests = vec![
            Request::new("", ""),
            Request::new("", "sda1"),
            Request::new("/home", ""),
        ];
        assert_eq!(request_state(&requests, 0, &devices, &[]), RequestState::Empty);
        assert_eq!(
            request_state(&requests, 1, &devices, &[]),
            RequestState::DeviceChosen
        );
        assert_eq!(
            request_state(&requests, 2, &devices, &[]),
            RequestState::MountPointAssigned
        );

        let requests = vec![Request::new("/home", "sda1")];
        assert_eq!(request_state(&requests, 0, &devices, &[]), RequestState::Valid);
    }

    #[test]
    fn test_row_reports() {
        let devices = snapshot(vec![
            device("sda1", "ext4"),
            device("sda2", FORMAT_SWAP),
            device("sda3", "xfs"),
        ]);
        let catalog = ConstraintCatalog::new(vec![
            MountPointConstraint::new("/").required(),
            MountPointConstraint::new("/home").recommended(),
        ]);
        let requests = vec![
            Request::new("/", "sda1").with_reformat(true),
            Request::new("swap", "sda2"),
            Request::new("/home", "sda3"),
            Request::new("/srv", ""),
            Request::new("", "").with_format_type("swap"),
        ];

        let reports = row_reports(&requests, &devices, &catalog);

        assert_eq!(reports[0].kind, MountPointKind::Required);
        assert!(!reports[0].mount_point_editable);
        assert!(reports[0].reformat_locked);
        assert!(!reports[0].removable);

        assert_eq!(reports[1].kind, MountPointKind::Custom);
        assert!(!reports[1].mount_point_editable);
        assert!(reports[1].removable);

        assert_eq!(reports[2].kind, MountPointKind::Recommended);
        assert!(!reports[2].mount_point_editable);
        assert!(reports[2].removable);

        assert!(reports[3].mount_point_editable);
        assert_eq!(reports[4].display_mount_point, "swap");
    }

    #[test]
    fn test_duplicated_required_row_becomes_editable() {
        let devices = snapshot(vec![device("sda1", "ext4"), device("sda2", "ext4")]);
        let catalog = ConstraintCatalog::new(vec![MountPointConstraint::new("/boot").required()]);
        let requests = vec![Request::new("/boot", "sda1"), Request::new("/boot", "sda2")];

        let reports = row_reports(&requests, &devices, &catalog);
        assert!(reports.iter().all(|r| r.duplicate_mount_point));
        assert!(reports.iter().all(|r| r.mount_point_editable && r.removable));
    }
}
