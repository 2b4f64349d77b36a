//! mountmap-core: mount point mapping engine for installer partitioning.
//!
//! This library keeps a user-edited list of mount point to device
//! assignments consistent with a partitioning backend, and decides when the
//! list is complete and valid enough to submit.
//!
//! # Modules
//!
//! - [`constraint`]: Mount point constraint catalog
//! - [`device`]: Device snapshot and classification
//! - [`request`]: Requests, the request set and its initial construction
//! - [`validate`]: Validation of rows and of the whole set
//! - [`reconcile`]: Edits and reconciliation with the backend
//! - [`backend`]: The partitioning backend port and an in-memory backend
//! - [`session`]: Editing session tying everything together
//! - [`state`]: JSON file backed backend
//! - [`protocol`]: Signed JSON-lines protocol of the backend daemon
//! - [`client`]: Protocol client and child process backend
//! - [`config`]: Session configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use mountmap_core::{FileBackend, MappingConfig, MountPointSession, RequestEdit};
//!
//! let mut backend = FileBackend::open(Path::new("/var/lib/mountmap/state.json")).unwrap();
//! let mut session = MountPointSession::open(&mut backend, None, MappingConfig::default()).unwrap();
//!
//! // Put root on sda3 and push the result to the backend
//! let ticket = session.edit(&RequestEdit::at(0).device_spec("sda3")).unwrap();
//! session.persist_with(&mut backend, &ticket);
//!
//! for row in session.rows() {
//!     println!("{} {:?}", row.display_mount_point, row.device_issue);
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod constraint;
pub mod device;
pub mod error;
pub mod protocol;
pub mod reconcile;
pub mod request;
pub mod session;
pub mod state;
pub mod validate;

// Re-export commonly used types
pub use backend::{MemoryBackend, PartitioningBackend, PartitioningTarget};
pub use client::ProcessBackend;
pub use config::MappingConfig;
pub use constraint::{ConstraintCatalog, MountPointConstraint};
pub use device::{DeviceInfo, DeviceSnapshot};
pub use error::{Error, Result};
pub use reconcile::RequestEdit;
pub use request::{Request, RequestSet};
pub use session::{MappingView, MountPointSession, PersistOutcome, PersistTicket};
pub use state::FileBackend;
pub use validate::ValidationIssue;
