//! Mount point mapping session.
//!
//! A [`MountPointSession`] is the single writer of the request set for one
//! partitioning target. It rebuilds the set when the target changes, applies
//! edits, tracks validity, and hands out [`PersistTicket`]s describing what
//! must be sent to the backend.
//!
//! Persisting is decoupled from editing: a caller may issue another edit
//! before an earlier ticket completes. Tickets carry a monotonic sequence
//! number and completions older than the last applied one are discarded, so a
//! slow early response can never overwrite the outcome of a later one.
//!
//! # Example
//!
//! ```
//! use mountmap_core::backend::MemoryBackend;
//! use mountmap_core::config::MappingConfig;
//! use mountmap_core::constraint::MountPointConstraint;
//! use mountmap_core::reconcile::RequestEdit;
//! use mountmap_core::session::{MountPointSession, PersistOutcome};
//!
//! let mut backend = MemoryBackend::new(
//!     vec![MountPointConstraint::new("/").required()],
//!     Default::default(),
//! );
//! let mut session =
//!     MountPointSession::open(&mut backend, None, MappingConfig::default()).unwrap();
//!
//! let ticket = session.edit(&RequestEdit::at(1).mount_point("/srv")).unwrap();
//! assert_eq!(session.persist_with(&mut backend, &ticket), PersistOutcome::Applied);
//! assert!(!session.is_form_valid());
//! ```

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{PartitioningBackend, PartitioningTarget, start_manual_partitioning};
use crate::config::MappingConfig;
use crate::constraint::{ConstraintCatalog, MountPointConstraint};
use crate::device::{self, DeviceOption, DeviceSnapshot};
use crate::error::{Error, Result};
use crate::reconcile::{self, RequestEdit};
use crate::request::{Request, RequestSet, build_initial_request_set};
use crate::validate::{self, RowReport};

/// What the front end should show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "view", rename_all = "kebab-case")]
pub enum MappingView {
    /// Target, constraints or backend requests are not available yet.
    Loading,
    /// Locked encrypted devices must be unlocked (or skipped) first.
    UnlockRequired { devices: BTreeSet<String> },
    /// The request table can be edited.
    Ready,
}

/// A pending push of the full request list to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistTicket {
    pub seq: u64,
    pub target: PartitioningTarget,
    pub requests: Vec<Request>,
}

/// Result of completing a [`PersistTicket`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum PersistOutcome {
    /// The backend accepted the requests.
    Applied,
    /// The backend failed; the message is kept verbatim.
    Failed { message: String },
    /// A newer ticket already completed, or the target changed.
    Stale,
}

/// Editing state of one partitioning target.
#[derive(Debug, Clone, Default)]
pub struct MountPointSession {
    config: MappingConfig,
    catalog: ConstraintCatalog,
    devices: DeviceSnapshot,
    target: Option<PartitioningTarget>,
    backend_requests: Option<Vec<Request>>,
    requests: RequestSet,
    initialized: bool,
    skip_unlock: bool,
    next_seq: u64,
    last_completed_seq: u64,
    persist_failure: Option<String>,
}

impl MountPointSession {
    pub fn new(config: MappingConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Starts a session against a backend.
    ///
    /// Picks (or creates) the manual partitioning target, then loads the
    /// constraints, devices and requests for it.
    pub fn open(
        backend: &mut dyn PartitioningBackend,
        current: Option<&PartitioningTarget>,
        config: MappingConfig,
    ) -> Result<Self> {
        let current_info = match current {
            Some(target) => Some((target, backend.partitioning(target)?)),
            None => None,
        };
        let target = start_manual_partitioning(
            backend,
            current_info.as_ref().map(|(t, info)| (*t, info)),
            config.reuse_partitioning,
        )?;

        let mut session = Self::new(config);
        session.set_constraints(backend.mount_point_constraints()?);
        session.set_devices(backend.device_data()?);
        let info = backend.partitioning(&target)?;
        session.sync(target, info.requests);
        Ok(session)
    }

    /// Re-reads devices and requests of the current target.
    pub fn refresh(&mut self, backend: &dyn PartitioningBackend) -> Result<()> {
        let target = self.target.clone().ok_or(Error::NoPartitioning)?;
        self.set_devices(backend.device_data()?);
        let info = backend.partitioning(&target)?;
        self.sync(target, info.requests);
        Ok(())
    }

    /// Loads the constraint catalog.
    pub fn set_constraints(&mut self, constraints: Vec<MountPointConstraint>) {
        self.catalog = ConstraintCatalog::new(constraints);
        self.initialize_if_pending();
    }

    /// Replaces the device snapshot. Never rebuilds the request set.
    pub fn set_devices(&mut self, devices: DeviceSnapshot) {
        self.devices = devices;
    }

    /// Updates the backend view of a target.
    ///
    /// The target acts as a fencing token: the request set is rebuilt only
    /// when it differs from the remembered one. Otherwise only the
    /// reconciliation baseline is refreshed. Returns true on rebuild.
    pub fn sync(&mut self, target: PartitioningTarget, backend_requests: Vec<Request>) -> bool {
        self.backend_requests = Some(backend_requests);

        if self.target.as_ref() == Some(&target) {
            return false;
        }

        info!(partitioning = %target, "switching mount point mapping to new partitioning");
        self.target = Some(target);
        self.initialized = false;
        self.persist_failure = None;
        self.last_completed_seq = self.next_seq;
        self.initialize_if_pending();
        true
    }

    fn initialize_if_pending(&mut self) {
        if self.initialized {
            return;
        }
        let (Ok(constraints), Some(backend_requests)) =
            (self.catalog.list_constraints(), self.backend_requests.as_deref())
        else {
            return;
        };

        self.requests = build_initial_request_set(backend_requests, constraints);
        self.initialized = true;
        debug!(rows = self.requests.len(), "built initial mount point requests");
    }

    /// Applies an edit and returns the ticket to persist.
    pub fn edit(&mut self, edit: &RequestEdit) -> Result<PersistTicket> {
        let target = self.target.clone().ok_or(Error::NoPartitioning)?;
        if !self.initialized {
            return Err(Error::ConstraintsUnavailable);
        }
        let known = self.backend_requests.as_deref().unwrap_or_default();

        self.requests = reconcile::apply_edit(&self.requests, edit, known)?;

        self.next_seq += 1;
        let ticket = PersistTicket {
            seq: self.next_seq,
            target,
            requests: reconcile::reconcile_with_backend(known, &self.requests),
        };
        debug!(seq = ticket.seq, valid = self.requests_valid(), "issued persist ticket");
        Ok(ticket)
    }

    /// Records the backend's answer to a ticket.
    ///
    /// Local edits are never rolled back on failure.
    pub fn complete_persist(&mut self, ticket: &PersistTicket, result: Result<()>) -> PersistOutcome {
        if self.target.as_ref() != Some(&ticket.target) || ticket.seq <= self.last_completed_seq {
            warn!(
                seq = ticket.seq,
                last = self.last_completed_seq,
                "discarding stale persist completion"
            );
            return PersistOutcome::Stale;
        }

        self.last_completed_seq = ticket.seq;
        match result {
            Ok(()) => {
                self.persist_failure = None;
                PersistOutcome::Applied
            }
            Err(e) => {
                let message = e.to_string();
                warn!(seq = ticket.seq, error = %message, "persisting mount point requests failed");
                self.persist_failure = Some(message.clone());
                PersistOutcome::Failed { message }
            }
        }
    }

    /// Sends a ticket to the backend and records the answer.
    pub fn persist_with(
        &mut self,
        backend: &mut dyn PartitioningBackend,
        ticket: &PersistTicket,
    ) -> PersistOutcome {
        let result = reconcile::persist(backend, &ticket.target, &ticket.requests);
        self.complete_persist(ticket, result)
    }

    /// Lets the user continue without unlocking encrypted devices.
    pub fn skip_unlock(&mut self) {
        self.skip_unlock = true;
    }

    pub fn view(&self) -> MappingView {
        let locked = self.locked_devices();
        if !locked.is_empty() && !self.skip_unlock {
            return MappingView::UnlockRequired { devices: locked };
        }

        if self.target.is_none() || !self.initialized {
            return MappingView::Loading;
        }

        MappingView::Ready
    }

    fn requests_valid(&self) -> bool {
        if self.config.enforce_constraints {
            validate::is_request_set_valid_with_constraints(
                &self.requests,
                &self.devices,
                self.catalog.as_slice(),
            )
        } else {
            validate::is_request_set_valid(&self.requests, &self.devices)
        }
    }

    /// Returns true if the mapping may be submitted.
    pub fn is_form_valid(&self) -> bool {
        self.initialized && self.persist_failure.is_none() && self.requests_valid()
    }

    /// The raw message of the last failed persist, if not yet superseded.
    pub fn persist_failure(&self) -> Option<&str> {
        self.persist_failure.as_deref()
    }

    pub fn target(&self) -> Option<&PartitioningTarget> {
        self.target.as_ref()
    }

    pub fn requests(&self) -> &RequestSet {
        &self.requests
    }

    pub fn backend_requests(&self) -> &[Request] {
        self.backend_requests.as_deref().unwrap_or_default()
    }

    pub fn catalog(&self) -> &ConstraintCatalog {
        &self.catalog
    }

    pub fn devices(&self) -> &DeviceSnapshot {
        &self.devices
    }

    pub fn locked_devices(&self) -> BTreeSet<String> {
        device::locked_devices(self.backend_requests(), &self.devices)
    }

    pub fn rows(&self) -> Vec<RowReport> {
        validate::row_reports(&self.requests, &self.devices, &self.catalog)
    }

    /// Picker entries for the row at `index`.
    pub fn device_options(&self, index: usize) -> Vec<DeviceOption> {
        let required = self
            .requests
            .get(index)
            .is_some_and(|r| self.catalog.is_required(&r.mount_point));
        let assignable = device::assignable_devices(self.backend_requests(), &self.devices);
        device::device_options(&assignable, &self.devices, &self.locked_devices(), required)
    }
}
