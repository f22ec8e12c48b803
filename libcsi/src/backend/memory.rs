//! In-memory storage backend.
//!
//! [`MemoryBackend`] keeps allocations and mounts in concurrent maps and
//! never touches the filesystem.  It backs the state-machine tests and the
//! daemon's `--backend memory` development mode.  Call counters expose how
//! often `allocate`, `attach`, and `mount` were actually invoked so tests
//! can assert that idempotent retries do not reach the backend twice.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::backend::{MountOptions, ProvisionedVolume, StorageBackend, VolumeHandle};
use crate::error::CsiError;
use crate::types::{AccessMode, VolumeId, VolumeStats};

/// Default allocation granularity: 1 MiB.
const DEFAULT_ALLOCATION_UNIT: u64 = 1 << 20;

/// Default pool size: 1 TiB.
const DEFAULT_POOL_BYTES: u64 = 1 << 40;

/// Storage backend that only exists in process memory.
pub struct MemoryBackend {
    allocation_unit: u64,
    pool_bytes: u64,
    stats_enabled: bool,
    volumes: DashMap<VolumeId, ProvisionedVolume>,
    attachments: DashMap<String, HashSet<String>>,
    mounts: DashMap<String, VolumeId>,
    allocate_calls: AtomicUsize,
    attach_calls: AtomicUsize,
    mount_calls: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a backend with the default allocation unit and pool size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            allocation_unit: DEFAULT_ALLOCATION_UNIT,
            pool_bytes: DEFAULT_POOL_BYTES,
            stats_enabled: true,
            volumes: DashMap::new(),
            attachments: DashMap::new(),
            mounts: DashMap::new(),
            allocate_calls: AtomicUsize::new(0),
            attach_calls: AtomicUsize::new(0),
            mount_calls: AtomicUsize::new(0),
        }
    }

    /// Same as [`Self::new`] but with `stats` reporting disabled, so the
    /// Node service advertises no `GetVolumeStats` capability.
    #[must_use]
    pub fn without_stats() -> Self {
        Self {
            stats_enabled: false,
            ..Self::new()
        }
    }

    /// Override the allocation granularity.
    #[must_use]
    pub fn with_allocation_unit(mut self, unit: u64) -> Self {
        self.allocation_unit = unit;
        self
    }

    /// How many times `allocate` reached the backend.
    #[must_use]
    pub fn allocate_calls(&self) -> usize {
        self.allocate_calls.load(Ordering::Relaxed)
    }

    /// How many times `attach` reached the backend.
    #[must_use]
    pub fn attach_calls(&self) -> usize {
        self.attach_calls.load(Ordering::Relaxed)
    }

    /// How many times `mount` reached the backend.
    #[must_use]
    pub fn mount_calls(&self) -> usize {
        self.mount_calls.load(Ordering::Relaxed)
    }

    fn allocated_bytes(&self) -> u64 {
        self.volumes.iter().map(|v| v.capacity_bytes).sum()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn allocation_unit(&self) -> u64 {
        self.allocation_unit
    }

    fn supported_access_modes(&self) -> Vec<AccessMode> {
        vec![
            AccessMode::ReadWriteOnce,
            AccessMode::ReadOnlyMany,
            AccessMode::ReadWriteMany,
        ]
    }

    fn supports_stats(&self) -> bool {
        self.stats_enabled
    }

    async fn allocate(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
        parameters: &HashMap<String, String>,
    ) -> Result<VolumeHandle, CsiError> {
        self.allocate_calls.fetch_add(1, Ordering::Relaxed);

        if self.volumes.contains_key(volume_id) {
            return Err(CsiError::BackendError(format!(
                "allocation {volume_id} already exists"
            )));
        }
        if self.allocated_bytes() + capacity_bytes > self.pool_bytes {
            return Err(CsiError::BackendError("pool exhausted".to_owned()));
        }

        let handle = VolumeHandle {
            id: volume_id.0.clone(),
            volume_context: HashMap::from([("pool".to_owned(), "memory".to_owned())]),
        };
        self.volumes.insert(
            volume_id.clone(),
            ProvisionedVolume {
                volume_id: volume_id.clone(),
                handle: handle.clone(),
                capacity_bytes,
                parameters: parameters.clone(),
            },
        );
        debug!(%volume_id, capacity_bytes, "memory allocation created");
        Ok(handle)
    }

    async fn deallocate(&self, handle: &VolumeHandle) -> Result<(), CsiError> {
        self.volumes.remove(&VolumeId(handle.id.clone()));
        self.attachments.remove(&handle.id);
        Ok(())
    }

    async fn attach(&self, handle: &VolumeHandle, node_id: &str) -> Result<(), CsiError> {
        self.attach_calls.fetch_add(1, Ordering::Relaxed);
        if !self.volumes.contains_key(&VolumeId(handle.id.clone())) {
            return Err(CsiError::BackendError(format!(
                "attach of unknown allocation {}",
                handle.id
            )));
        }
        self.attachments
            .entry(handle.id.clone())
            .or_default()
            .insert(node_id.to_owned());
        Ok(())
    }

    async fn detach(&self, handle: &VolumeHandle, node_id: &str) -> Result<(), CsiError> {
        if let Some(mut nodes) = self.attachments.get_mut(&handle.id) {
            nodes.remove(node_id);
        }
        Ok(())
    }

    async fn mount(
        &self,
        volume_id: &VolumeId,
        path: &str,
        _options: &MountOptions,
    ) -> Result<(), CsiError> {
        self.mount_calls.fetch_add(1, Ordering::Relaxed);
        if self.mounts.contains_key(path) {
            return Err(CsiError::MountFailed {
                path: path.to_owned(),
                reason: "already mounted".to_owned(),
            });
        }
        self.mounts.insert(path.to_owned(), volume_id.clone());
        Ok(())
    }

    async fn unmount(&self, path: &str) -> Result<(), CsiError> {
        if self.mounts.remove(path).is_none() {
            return Err(CsiError::UnmountFailed {
                path: path.to_owned(),
                reason: "not mounted".to_owned(),
            });
        }
        Ok(())
    }

    async fn is_mounted(&self, path: &str) -> Result<bool, CsiError> {
        Ok(self.mounts.contains_key(path))
    }

    async fn stats(&self, path: &str) -> Result<VolumeStats, CsiError> {
        if !self.stats_enabled {
            return Err(CsiError::Unimplemented(
                "volume stats disabled for this backend".to_owned(),
            ));
        }
        let volume_id = self
            .mounts
            .get(path)
            .map(|v| v.clone())
            .ok_or_else(|| CsiError::VolumeNotFound(format!("no mount at {path}")))?;
        let total = self
            .volumes
            .get(&volume_id)
            .map(|v| v.capacity_bytes)
            .unwrap_or_default();
        Ok(VolumeStats {
            total_bytes: total,
            available_bytes: total,
            used_bytes: 0,
        })
    }

    async fn capacity(&self) -> Result<u64, CsiError> {
        Ok(self.pool_bytes - self.allocated_bytes())
    }

    async fn list(&self) -> Result<Vec<ProvisionedVolume>, CsiError> {
        Ok(self.volumes.iter().map(|v| v.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocate_and_deallocate() {
        let backend = MemoryBackend::new();
        let id = VolumeId("vol-1".into());

        let handle = backend.allocate(&id, 1 << 20, &HashMap::new()).await.unwrap();
        assert_eq!(handle.id, "vol-1");
        assert_eq!(backend.list().await.unwrap().len(), 1);

        backend.deallocate(&handle).await.unwrap();
        assert!(backend.list().await.unwrap().is_empty());

        // Deallocating again is a no-op.
        backend.deallocate(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn double_allocate_rejected() {
        let backend = MemoryBackend::new();
        let id = VolumeId("vol-1".into());
        backend.allocate(&id, 1024, &HashMap::new()).await.unwrap();
        assert!(backend.allocate(&id, 1024, &HashMap::new()).await.is_err());
        assert_eq!(backend.allocate_calls(), 2);
    }

    #[tokio::test]
    async fn capacity_shrinks_with_allocations() {
        let backend = MemoryBackend::new();
        let before = backend.capacity().await.unwrap();
        backend
            .allocate(&VolumeId("vol-1".into()), 1 << 30, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(backend.capacity().await.unwrap(), before - (1 << 30));
    }

    #[tokio::test]
    async fn mount_bookkeeping() {
        let backend = MemoryBackend::new();
        let id = VolumeId("vol-1".into());
        backend.allocate(&id, 1024, &HashMap::new()).await.unwrap();

        assert!(!backend.is_mounted("/stage/v1").await.unwrap());
        backend
            .mount(&id, "/stage/v1", &MountOptions::default())
            .await
            .unwrap();
        assert!(backend.is_mounted("/stage/v1").await.unwrap());

        // Double mount at the same path is a backend error; the services
        // are expected to reconcile before re-issuing.
        assert!(
            backend
                .mount(&id, "/stage/v1", &MountOptions::default())
                .await
                .is_err()
        );

        backend.unmount("/stage/v1").await.unwrap();
        assert!(!backend.is_mounted("/stage/v1").await.unwrap());
        assert!(backend.unmount("/stage/v1").await.is_err());
    }

    #[tokio::test]
    async fn stats_follow_mounts() {
        let backend = MemoryBackend::new();
        let id = VolumeId("vol-1".into());
        backend.allocate(&id, 4096, &HashMap::new()).await.unwrap();
        backend
            .mount(&id, "/stage/v1", &MountOptions::default())
            .await
            .unwrap();

        let stats = backend.stats("/stage/v1").await.unwrap();
        assert_eq!(stats.total_bytes, 4096);

        let err = backend.stats("/stage/other").await.unwrap_err();
        assert!(matches!(err, CsiError::VolumeNotFound(_)));
    }
}
