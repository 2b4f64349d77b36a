//! File-backed partitioning backend.
//!
//! The whole backend state lives in one JSON document. Every mutation is
//! written back before the call returns, through a temporary file that is
//! renamed over the previous file so a crash never leaves a half-written state.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::debug;

use crate::backend::{MemoryBackend, PartitioningBackend, PartitioningInfo, PartitioningTarget};
use crate::constraint::MountPointConstraint;
use crate::device::DeviceSnapshot;
use crate::error::{IoResultExt, Result, StateParseSnafu};
use crate::request::Request;

/// On-disk document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StateFile {
    #[serde(flatten)]
    pub backend: MemoryBackend,
    /// Plan the command line front end keeps editing between invocations.
    #[serde(default)]
    pub current: Option<PartitioningTarget>,
}

/// A [`MemoryBackend`] persisted to a JSON file.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    state: StateFile,
}

impl FileBackend {
    /// Opens an existing state file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = fs::read_to_string(&path).state_read_context(&path)?;
        let state = serde_json::from_str(&content).context(StateParseSnafu { path: &path })?;
        debug!(path = %path.display(), "loaded backend state");
        Ok(Self { path, state })
    }

    /// Writes a fresh state file, replacing any existing one.
    pub fn create(path: impl Into<PathBuf>, backend: MemoryBackend) -> Result<Self> {
        let this = Self {
            path: path.into(),
            state: StateFile {
                backend,
                current: None,
            },
        };
        this.save()?;
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.state.backend
    }

    pub fn current(&self) -> Option<&PartitioningTarget> {
        self.state.current.as_ref()
    }

    /// Remembers the plan being edited.
    pub fn set_current(&mut self, target: Option<PartitioningTarget>) -> Result<()> {
        self.state.current = target;
        self.save()
    }

    fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.state)
            .with_whatever_context(|e| format!("failed to serialize backend state: {}", e))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, content).state_write_context(&tmp)?;
        fs::rename(&tmp, &self.path).state_write_context(&self.path)?;
        debug!(path = %self.path.display(), "saved backend state");
        Ok(())
    }

    fn mutate<T>(&mut self, f: impl FnOnce(&mut MemoryBackend) -> Result<T>) -> Result<T> {
        let value = f(&mut self.state.backend)?;
        self.save()?;
        Ok(value)
    }
}

impl PartitioningBackend for FileBackend {
    fn set_bootloader_drive(&mut self, drive: &str) -> Result<()> {
        self.mutate(|b| b.set_bootloader_drive(drive))
    }

    fn create_manual_partitioning(&mut self) -> Result<PartitioningTarget> {
        self.mutate(|b| b.create_manual_partitioning())
    }

    fn set_manual_partitioning_requests(
        &mut self,
        target: &PartitioningTarget,
        requests: &[Request],
    ) -> Result<()> {
        self.mutate(|b| b.set_manual_partitioning_requests(target, requests))
    }

    fn reset_partitioning(&mut self) -> Result<()> {
        self.mutate(|b| b.reset_partitioning())
    }

    fn partitioning(&self, target: &PartitioningTarget) -> Result<PartitioningInfo> {
        self.state.backend.partitioning(target)
    }

    fn mount_point_constraints(&self) -> Result<Vec<MountPointConstraint>> {
        self.state.backend.mount_point_constraints()
    }

    fn device_data(&self) -> Result<DeviceSnapshot> {
        self.state.backend.device_data()
    }
}
