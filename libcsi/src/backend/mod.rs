//! Pluggable storage backends.
//!
//! [`StorageBackend`] is the boundary between the driver's state machines
//! and the distributed filesystem that actually stores bytes.  The core
//! treats every backend call as fallible and retryable: backend calls are
//! issued *before* record transitions commit, and retries re-check backend
//! state (via [`StorageBackend::is_mounted`]) instead of trusting the local
//! record alone.
//!
//! Two implementations ship with the crate:
//!
//! * [`memory::MemoryBackend`] — in-memory bookkeeping for tests and local
//!   development.
//! * [`meshfs::MeshFsBackend`] — disk-backed MeshFS volumes with persisted
//!   metadata sidecars.

pub mod memory;
pub mod meshfs;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::{AccessMode, VolumeCapability, VolumeId, VolumeStats};

/// Opaque handle to a backend allocation.
///
/// The handle id matches the volume id the allocation was made for; the
/// context carries whatever the backend needs to mount the volume later
/// (object root, cluster address, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeHandle {
    /// Backend-side identifier of the allocation.
    pub id: String,
    /// Opaque context forwarded to Node operations via the volume.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// A volume the backend knows about, as reported by [`StorageBackend::list`].
///
/// Used by the Controller service to rebuild its records after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedVolume {
    /// The volume this allocation belongs to.
    pub volume_id: VolumeId,
    /// Handle for subsequent backend calls.
    pub handle: VolumeHandle,
    /// Allocated capacity in bytes.
    pub capacity_bytes: u64,
    /// Parameters recorded at allocation time.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Options for a backend mount call.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Filesystem type requested by the caller.
    pub fs_type: String,
    /// Additional mount flags.
    pub mount_flags: Vec<String>,
    /// Mount read-only.
    pub read_only: bool,
    /// When set, bind-mount from this already-mounted source path instead
    /// of mounting the filesystem itself.  Used by publish operations.
    pub bind_source: Option<String>,
}

impl MountOptions {
    /// Options for staging a volume at its global mount point.
    #[must_use]
    pub fn staging(capability: &VolumeCapability) -> Self {
        Self {
            fs_type: capability.fs_type.clone(),
            mount_flags: capability.mount_flags.clone(),
            read_only: false,
            bind_source: None,
        }
    }

    /// Options for bind-mounting a staged volume into a workload path.
    #[must_use]
    pub fn bind(staging_path: &str, capability: &VolumeCapability, read_only: bool) -> Self {
        Self {
            fs_type: capability.fs_type.clone(),
            mount_flags: capability.mount_flags.clone(),
            read_only,
            bind_source: Some(staging_path.to_owned()),
        }
    }
}

/// Interface to the distributed filesystem backing the driver.
///
/// Implementations must be safe to call from many Tokio tasks at once; the
/// driver's own per-volume locks only serialize calls for the same volume.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Smallest allocation granularity in bytes.  Requested capacities are
    /// rounded up to a multiple of this by the Controller service.
    fn allocation_unit(&self) -> u64;

    /// Access modes this backend can satisfy.
    fn supported_access_modes(&self) -> Vec<AccessMode>;

    /// Whether [`StorageBackend::stats`] is usable.  Gates the
    /// `GetVolumeStats` node capability.
    fn supports_stats(&self) -> bool;

    /// Allocate backing storage for a volume.
    async fn allocate(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
        parameters: &HashMap<String, String>,
    ) -> Result<VolumeHandle, CsiError>;

    /// Release the backing storage of a volume.  Deallocating a handle that
    /// is already gone must succeed.
    async fn deallocate(&self, handle: &VolumeHandle) -> Result<(), CsiError>;

    /// Make a volume reachable from a node.
    async fn attach(&self, handle: &VolumeHandle, node_id: &str) -> Result<(), CsiError>;

    /// Revoke a node's access to a volume.  Detaching a non-attached pair
    /// must succeed.
    async fn detach(&self, handle: &VolumeHandle, node_id: &str) -> Result<(), CsiError>;

    /// Mount a volume (or bind-mount its staging path) at `path`.
    async fn mount(
        &self,
        volume_id: &VolumeId,
        path: &str,
        options: &MountOptions,
    ) -> Result<(), CsiError>;

    /// Unmount whatever is mounted at `path`.
    async fn unmount(&self, path: &str) -> Result<(), CsiError>;

    /// Whether `path` is currently a mount point.  This is the query the
    /// state machines use to reconcile their records with reality.
    async fn is_mounted(&self, path: &str) -> Result<bool, CsiError>;

    /// Usage statistics for the filesystem mounted at `path`.
    async fn stats(&self, path: &str) -> Result<VolumeStats, CsiError>;

    /// Total capacity available for new allocations, in bytes.
    async fn capacity(&self) -> Result<u64, CsiError>;

    /// Enumerate the allocations this backend knows about.
    async fn list(&self) -> Result<Vec<ProvisionedVolume>, CsiError>;
}
