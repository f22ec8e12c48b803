//! MeshFS storage backend.
//!
//! [`MeshFsBackend`] implements [`StorageBackend`] against a MeshFS export
//! rooted at a local data directory.  Volumes are stored as sub-directories
//! under a configurable `data_root`, made available to workloads by mounting
//! the volume's object root at the staging path (via the `mount.meshfs`
//! helper) and bind-mounting the staging path into workload targets.
//!
//! # On-disk layout
//!
//! ```text
//! <data_root>/
//!   <volume-id>/            # MeshFS object store for each volume
//!   <volume-id>.meta.json   # Persisted allocation metadata (used for recovery)
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use crate::backend::{MountOptions, ProvisionedVolume, StorageBackend, VolumeHandle};
use crate::error::CsiError;
use crate::types::{AccessMode, VolumeId, VolumeStats};

/// MeshFS allocates space in 4 MiB extents.
const ALLOCATION_UNIT: u64 = 4 << 20;

/// Mount helper invoked for staging mounts.
const MOUNT_HELPER: &str = "mount.meshfs";

/// How a path was mounted, so `unmount` can pick the matching teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountKind {
    /// FUSE mount of a volume's object root (staging).
    Fuse,
    /// Bind mount from a staging path (publish).
    Bind,
}

/// Storage backend backed by a MeshFS export on the local filesystem.
pub struct MeshFsBackend {
    /// Root directory for all MeshFS volume object stores.
    data_root: PathBuf,
    /// Attachment bookkeeping, keyed by allocation id.
    attachments: DashMap<String, HashSet<String>>,
    /// Live mounts issued by this process, keyed by mount path.
    mount_kinds: DashMap<String, MountKind>,
}

impl MeshFsBackend {
    /// Create a new backend rooted at `data_root`.
    ///
    /// The directory is created if it does not exist yet; allocations from
    /// a previous process run are picked up via [`StorageBackend::list`].
    pub async fn new(data_root: impl Into<PathBuf>) -> Result<Self, CsiError> {
        let data_root = data_root.into();
        tokio::fs::create_dir_all(&data_root).await.map_err(|e| {
            CsiError::BackendError(format!("create data root {}: {e}", data_root.display()))
        })?;
        Ok(Self {
            data_root,
            attachments: DashMap::new(),
            mount_kinds: DashMap::new(),
        })
    }

    /// Resolve the on-disk object store directory for a given volume.
    fn volume_root(&self, volume_id: &str) -> PathBuf {
        self.data_root.join(volume_id)
    }

    /// Resolve the path to the persisted metadata sidecar for a volume.
    fn meta_path(&self, volume_id: &str) -> PathBuf {
        self.data_root.join(format!("{volume_id}.meta.json"))
    }
}

/// Return `true` if `path` is currently listed as a mount point in
/// `/proc/self/mounts`.
///
/// Note: `/proc/self/mounts` uses octal escapes (`\040` for space, etc.).
/// CSI target paths must not contain whitespace, so direct string comparison
/// is safe here.
async fn is_mountpoint(path: &str) -> bool {
    let contents = match tokio::fs::read_to_string("/proc/self/mounts").await {
        Ok(c) => c,
        Err(_) => return false,
    };
    // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
    contents
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(path))
}

#[async_trait]
impl StorageBackend for MeshFsBackend {
    fn allocation_unit(&self) -> u64 {
        ALLOCATION_UNIT
    }

    fn supported_access_modes(&self) -> Vec<AccessMode> {
        vec![
            AccessMode::ReadWriteOnce,
            AccessMode::ReadOnlyMany,
            AccessMode::ReadWriteMany,
        ]
    }

    fn supports_stats(&self) -> bool {
        true
    }

    #[instrument(skip(self, parameters))]
    async fn allocate(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
        parameters: &HashMap<String, String>,
    ) -> Result<VolumeHandle, CsiError> {
        let vol_root = self.volume_root(&volume_id.0);

        tokio::fs::create_dir_all(&vol_root).await.map_err(|e| {
            CsiError::BackendError(format!("create dir {}: {e}", vol_root.display()))
        })?;

        let handle = VolumeHandle {
            id: volume_id.0.clone(),
            volume_context: HashMap::from([(
                "object_root".to_owned(),
                vol_root.to_string_lossy().into_owned(),
            )]),
        };

        // Persist metadata to disk *before* reporting success.  If the
        // write fails the caller can safely retry: nothing has been
        // committed on the driver side yet.
        let meta = ProvisionedVolume {
            volume_id: volume_id.clone(),
            handle: handle.clone(),
            capacity_bytes,
            parameters: parameters.clone(),
        };
        let meta_json = serde_json::to_string_pretty(&meta).map_err(CsiError::backend)?;
        tokio::fs::write(self.meta_path(&volume_id.0), meta_json)
            .await
            .map_err(|e| CsiError::BackendError(format!("write meta {volume_id}: {e}")))?;

        info!(%volume_id, capacity_bytes, "meshfs allocation created");
        Ok(handle)
    }

    #[instrument(skip(self))]
    async fn deallocate(&self, handle: &VolumeHandle) -> Result<(), CsiError> {
        let vol_root = self.volume_root(&handle.id);
        if vol_root.exists() {
            tokio::fs::remove_dir_all(&vol_root).await.map_err(|e| {
                CsiError::BackendError(format!("remove dir {}: {e}", vol_root.display()))
            })?;
        }

        let meta_path = self.meta_path(&handle.id);
        if meta_path.exists() {
            tokio::fs::remove_file(&meta_path).await.map_err(|e| {
                CsiError::BackendError(format!("remove meta {}: {e}", meta_path.display()))
            })?;
        }

        self.attachments.remove(&handle.id);
        info!(volume_id = %handle.id, "meshfs allocation removed");
        Ok(())
    }

    async fn attach(&self, handle: &VolumeHandle, node_id: &str) -> Result<(), CsiError> {
        if !self.volume_root(&handle.id).exists() {
            return Err(CsiError::BackendError(format!(
                "attach of unknown allocation {}",
                handle.id
            )));
        }
        self.attachments
            .entry(handle.id.clone())
            .or_default()
            .insert(node_id.to_owned());
        debug!(volume_id = %handle.id, node_id, "meshfs volume attached");
        Ok(())
    }

    async fn detach(&self, handle: &VolumeHandle, node_id: &str) -> Result<(), CsiError> {
        if let Some(mut nodes) = self.attachments.get_mut(&handle.id) {
            nodes.remove(node_id);
        }
        debug!(volume_id = %handle.id, node_id, "meshfs volume detached");
        Ok(())
    }

    #[instrument(skip(self, options))]
    async fn mount(
        &self,
        volume_id: &VolumeId,
        path: &str,
        options: &MountOptions,
    ) -> Result<(), CsiError> {
        tokio::fs::create_dir_all(Path::new(path))
            .await
            .map_err(|e| CsiError::MountFailed {
                path: path.to_owned(),
                reason: e.to_string(),
            })?;

        match &options.bind_source {
            // Publish: bind-mount the staged volume into the workload path.
            Some(source) => {
                let mut flags = nix::mount::MsFlags::MS_BIND;
                if options.read_only {
                    flags |= nix::mount::MsFlags::MS_RDONLY;
                }

                nix::mount::mount(Some(source.as_str()), path, None::<&str>, flags, None::<&str>)
                    .map_err(|e| CsiError::MountFailed {
                        path: path.to_owned(),
                        reason: e.to_string(),
                    })?;

                // Some kernels ignore MS_RDONLY on the initial bind-mount
                // call; a separate remount is required to actually enforce
                // read-only access.
                if options.read_only {
                    nix::mount::mount(
                        None::<&str>,
                        path,
                        None::<&str>,
                        nix::mount::MsFlags::MS_BIND
                            | nix::mount::MsFlags::MS_REMOUNT
                            | nix::mount::MsFlags::MS_RDONLY,
                        None::<&str>,
                    )
                    .map_err(|e| CsiError::MountFailed {
                        path: path.to_owned(),
                        reason: format!("remount read-only: {e}"),
                    })?;
                }

                self.mount_kinds.insert(path.to_owned(), MountKind::Bind);
                info!(%volume_id, path, read_only = options.read_only, "volume bind-mounted");
            }
            // Stage: FUSE-mount the volume's object root via the helper.
            None => {
                let vol_root = self.volume_root(&volume_id.0);
                let mut cmd = tokio::process::Command::new(MOUNT_HELPER);
                cmd.arg(&vol_root).arg(path);
                if !options.mount_flags.is_empty() {
                    cmd.arg("-o").arg(options.mount_flags.join(","));
                }

                let status = cmd.status().await.map_err(|e| CsiError::MountFailed {
                    path: path.to_owned(),
                    reason: format!("{MOUNT_HELPER}: {e}"),
                })?;
                if !status.success() {
                    return Err(CsiError::MountFailed {
                        path: path.to_owned(),
                        reason: format!("{MOUNT_HELPER} exited with {status}"),
                    });
                }

                self.mount_kinds.insert(path.to_owned(), MountKind::Fuse);
                info!(%volume_id, path, "volume staged");
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unmount(&self, path: &str) -> Result<(), CsiError> {
        // Mounts issued before a restart are no longer in `mount_kinds`;
        // fall back to a plain umount for those.
        let kind = self
            .mount_kinds
            .get(path)
            .map(|k| *k)
            .unwrap_or(MountKind::Bind);

        match kind {
            MountKind::Fuse => {
                let status = tokio::process::Command::new("fusermount3")
                    .args(["-u", path])
                    .status()
                    .await
                    .map_err(|e| CsiError::UnmountFailed {
                        path: path.to_owned(),
                        reason: e.to_string(),
                    })?;

                if !status.success() {
                    // A non-zero exit typically means the path was already
                    // unmounted.
                    warn!(path, code = ?status.code(), "fusermount3 returned non-zero");
                }

                // Remove the staging directory so a later mount-state query
                // unambiguously reports the volume as unstaged.
                tokio::fs::remove_dir(Path::new(path)).await.map_err(|e| {
                    CsiError::UnmountFailed {
                        path: path.to_owned(),
                        reason: format!("remove staging dir: {e}"),
                    }
                })?;
            }
            MountKind::Bind => {
                nix::mount::umount(path).map_err(|e| CsiError::UnmountFailed {
                    path: path.to_owned(),
                    reason: e.to_string(),
                })?;
            }
        }

        self.mount_kinds.remove(path);
        info!(path, "unmounted");
        Ok(())
    }

    async fn is_mounted(&self, path: &str) -> Result<bool, CsiError> {
        Ok(is_mountpoint(path).await)
    }

    async fn stats(&self, path: &str) -> Result<VolumeStats, CsiError> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|e| CsiError::Internal(format!("statvfs {path}: {e}")))?;
        let frag = stat.fragment_size();
        Ok(VolumeStats {
            total_bytes: frag * stat.blocks(),
            available_bytes: frag * stat.blocks_available(),
            used_bytes: frag * (stat.blocks() - stat.blocks_free()),
        })
    }

    async fn capacity(&self) -> Result<u64, CsiError> {
        let stat = nix::sys::statvfs::statvfs(
            self.data_root
                .to_str()
                .ok_or_else(|| CsiError::Internal("non-UTF8 data root path".into()))?,
        )
        .map_err(|e| CsiError::Internal(format!("statvfs: {e}")))?;
        Ok(stat.fragment_size() * stat.blocks_available())
    }

    /// Scan `data_root` for persisted allocation metadata.
    ///
    /// This is a best-effort operation: sidecars that are unreadable or
    /// whose volume directories are missing are skipped with a warning
    /// rather than treated as hard errors.
    async fn list(&self) -> Result<Vec<ProvisionedVolume>, CsiError> {
        let mut dir = tokio::fs::read_dir(&self.data_root).await.map_err(|e| {
            CsiError::BackendError(format!("read_dir {}: {e}", self.data_root.display()))
        })?;

        let mut volumes = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(CsiError::backend)? {
            let path = entry.path();

            // Only process `.meta.json` sidecar files.
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.ends_with(".meta.json") {
                continue;
            }

            let json = match tokio::fs::read_to_string(&path).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read volume metadata, skipping");
                    continue;
                }
            };

            let meta: ProvisionedVolume = match serde_json::from_str(&json) {
                Ok(v) => v,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse volume metadata, skipping");
                    continue;
                }
            };

            if !self.volume_root(&meta.volume_id.0).exists() {
                warn!(volume_id = %meta.volume_id, "volume directory missing, skipping");
                continue;
            }

            volumes.push(meta);
        }

        debug!(count = volumes.len(), "meshfs allocations listed");
        Ok(volumes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_backend(dir: &Path) -> MeshFsBackend {
        MeshFsBackend::new(dir).await.unwrap()
    }

    #[tokio::test]
    async fn allocate_writes_sidecar_and_object_root() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = make_backend(tmp.path()).await;
        let id = VolumeId("meshfs-test-1".into());

        let handle = backend
            .allocate(&id, 8 << 20, &HashMap::from([("tier".into(), "hot".into())]))
            .await
            .unwrap();
        assert_eq!(handle.id, "meshfs-test-1");
        assert!(backend.volume_root("meshfs-test-1").is_dir());
        assert!(backend.meta_path("meshfs-test-1").is_file());

        let listed = backend.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].capacity_bytes, 8 << 20);
        assert_eq!(listed[0].parameters.get("tier").unwrap(), "hot");
    }

    #[tokio::test]
    async fn deallocate_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = make_backend(tmp.path()).await;
        let id = VolumeId("meshfs-test-2".into());

        let handle = backend.allocate(&id, 1024, &HashMap::new()).await.unwrap();
        backend.deallocate(&handle).await.unwrap();
        assert!(!backend.volume_root("meshfs-test-2").exists());
        assert!(backend.list().await.unwrap().is_empty());

        // Already gone: still succeeds.
        backend.deallocate(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn list_skips_corrupt_sidecars() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = make_backend(tmp.path()).await;
        backend
            .allocate(&VolumeId("good".into()), 1024, &HashMap::new())
            .await
            .unwrap();

        tokio::fs::write(tmp.path().join("bad.meta.json"), "{ not json")
            .await
            .unwrap();

        let listed = backend.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].volume_id, VolumeId("good".into()));
    }

    #[tokio::test]
    async fn list_skips_sidecar_without_object_root() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = make_backend(tmp.path()).await;
        let handle = backend
            .allocate(&VolumeId("orphan".into()), 1024, &HashMap::new())
            .await
            .unwrap();

        // Simulate a half-deleted volume: directory gone, sidecar left.
        tokio::fs::remove_dir_all(backend.volume_root(&handle.id))
            .await
            .unwrap();

        assert!(backend.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn attach_requires_allocation() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = make_backend(tmp.path()).await;

        let bogus = VolumeHandle {
            id: "nope".into(),
            volume_context: HashMap::new(),
        };
        assert!(backend.attach(&bogus, "node-01").await.is_err());

        let handle = backend
            .allocate(&VolumeId("vol".into()), 1024, &HashMap::new())
            .await
            .unwrap();
        backend.attach(&handle, "node-01").await.unwrap();
        backend.detach(&handle, "node-01").await.unwrap();
        // Detaching a non-attached pair succeeds.
        backend.detach(&handle, "node-02").await.unwrap();
    }

    #[tokio::test]
    async fn unmounted_paths_report_unmounted() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = make_backend(tmp.path()).await;
        assert!(
            !backend
                .is_mounted(tmp.path().to_str().unwrap())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn capacity_and_stats_from_statvfs() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = make_backend(tmp.path()).await;

        assert!(backend.capacity().await.unwrap() > 0);

        let stats = backend.stats(tmp.path().to_str().unwrap()).await.unwrap();
        assert!(stats.total_bytes >= stats.available_bytes);
    }
}
