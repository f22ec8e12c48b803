//! CSI Node service: the per-node mount lifecycle state machine.
//!
//! The Node service runs on each worker node and handles the local
//! filesystem operations required to make a volume available to workloads:
//!
//! 1. **Stage** — mount the MeshFS volume at a global staging path.
//! 2. **Publish** — bind-mount the staging path into the workload.
//! 3. **Unpublish** — remove the bind-mount.
//! 4. **Unstage** — unmount the staging mount.
//!
//! Mount records are in-memory only.  Instead of trusting them blindly,
//! every operation re-checks the backend's mount table
//! ([`StorageBackend::is_mounted`]) on the paths it touches: a mount that
//! survived a crash is adopted, a mount that disappeared is re-issued.
//! That reconciliation is what makes retries safe after a crash between
//! "backend call issued" and "record updated".

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use crate::backend::{MountOptions, StorageBackend};
use crate::error::CsiError;
use crate::lock::VolumeLocks;
use crate::types::{
    MountState, NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest,
    Topology, VolumeId, VolumeStats,
};

/// Upper bound on volumes hosted by one node.
const MAX_VOLUMES_PER_NODE: u64 = 256;

/// Node service — local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume: mount it at the global staging path.
    ///
    /// Idempotent for the same staging path; staging an already-staged
    /// volume at a *different* path fails.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume: unmount the staging path and drop the record.
    ///
    /// Fails while any publish target still exists; idempotent once the
    /// volume is unstaged.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume: bind-mount the staged path into the workload.
    ///
    /// Requires a prior stage; idempotent per target path.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the bind-mount from the workload path.
    ///
    /// Idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Advertise the Node operations this driver implements.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    /// Usage statistics for a volume mounted at `volume_path`.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;
}

/// Authoritative in-memory state for one volume's mounts on this node.
#[derive(Debug, Clone)]
pub struct MountRecord {
    /// Global staging mount point.
    pub staging_path: String,
    /// Workload target paths the volume is bind-mounted into.  Empty
    /// unless `state` is [`MountState::Published`].
    pub publish_paths: HashSet<String>,
    /// Mount lifecycle state.  Never [`MountState::Unstaged`]: an unstaged
    /// volume has no record at all.
    pub state: MountState,
}

/// The driver's Node service over a [`StorageBackend`].
pub struct NodeService<B> {
    backend: Arc<B>,
    node_id: String,
    /// Mount records, keyed by volume id.
    mounts: DashMap<VolumeId, MountRecord>,
    locks: VolumeLocks,
}

impl<B: StorageBackend> NodeService<B> {
    /// Create a new Node service for the node identified by `node_id`.
    pub fn new(backend: Arc<B>, node_id: impl Into<String>) -> Self {
        Self {
            backend,
            node_id: node_id.into(),
            mounts: DashMap::new(),
            locks: VolumeLocks::new(),
        }
    }

    /// Current mount state of a volume on this node.
    #[must_use]
    pub fn mount_state(&self, volume_id: &VolumeId) -> MountState {
        self.mounts
            .get(volume_id)
            .map(|r| r.state)
            .unwrap_or(MountState::Unstaged)
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    pub async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        if req.staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument(
                "staging target path must not be empty".to_owned(),
            ));
        }

        let _guard = self.locks.lock(&req.volume_id.0).await?;

        let existing = self
            .mounts
            .get(&req.volume_id)
            .map(|r| r.staging_path.clone());
        if let Some(staged_at) = existing {
            if staged_at != req.staging_target_path {
                // A different path would silently drift the mount topology.
                return Err(CsiError::AlreadyExists(format!(
                    "volume {} is already staged at {staged_at}",
                    req.volume_id
                )));
            }
            // Re-check the mount table instead of trusting the record: the
            // mount may have vanished underneath us (node reboot, manual
            // unmount).
            if self.backend.is_mounted(&req.staging_target_path).await? {
                debug!("already staged, idempotent retry");
                return Ok(());
            }
            warn!(path = %req.staging_target_path, "staged volume no longer mounted, re-issuing mount");
            return self
                .backend
                .mount(
                    &req.volume_id,
                    &req.staging_target_path,
                    &MountOptions::staging(&req.volume_capability),
                )
                .await;
        }

        // No record.  If the path is already mounted we crashed between the
        // backend mount and the record commit: adopt the mount as ours.
        if !self.backend.is_mounted(&req.staging_target_path).await? {
            self.backend
                .mount(
                    &req.volume_id,
                    &req.staging_target_path,
                    &MountOptions::staging(&req.volume_capability),
                )
                .await?;
        } else {
            debug!(path = %req.staging_target_path, "adopting existing staging mount");
        }

        self.mounts.insert(
            req.volume_id.clone(),
            MountRecord {
                staging_path: req.staging_target_path.clone(),
                publish_paths: HashSet::new(),
                state: MountState::Staged,
            },
        );
        info!(path = %req.staging_target_path, "volume staged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    pub async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        if req.target_path.is_empty() {
            return Err(CsiError::InvalidArgument(
                "target path must not be empty".to_owned(),
            ));
        }

        let _guard = self.locks.lock(&req.volume_id.0).await?;

        let (staging_path, already_published) = {
            let Some(record) = self.mounts.get(&req.volume_id) else {
                return Err(CsiError::FailedPrecondition(format!(
                    "volume {} is not staged on this node",
                    req.volume_id
                )));
            };
            if record.staging_path != req.staging_target_path {
                return Err(CsiError::InvalidArgument(format!(
                    "volume {} is staged at {}, not {}",
                    req.volume_id, record.staging_path, req.staging_target_path
                )));
            }
            (
                record.staging_path.clone(),
                record.publish_paths.contains(&req.target_path),
            )
        };

        let mounted = self.backend.is_mounted(&req.target_path).await?;
        if !mounted {
            if already_published {
                warn!(path = %req.target_path, "published target no longer mounted, re-issuing bind mount");
            }
            self.backend
                .mount(
                    &req.volume_id,
                    &req.target_path,
                    &MountOptions::bind(&staging_path, &req.volume_capability, req.read_only),
                )
                .await?;
        } else if !already_published {
            debug!(path = %req.target_path, "adopting existing publish mount");
        } else {
            debug!(path = %req.target_path, "already published, idempotent retry");
        }

        if let Some(mut record) = self.mounts.get_mut(&req.volume_id) {
            record.publish_paths.insert(req.target_path.clone());
            record.state = MountState::Published;
        }
        info!(path = %req.target_path, read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        let _guard = self.locks.lock(&volume_id.0).await?;

        // Unmount first (if there is anything mounted), then commit the
        // record change; a failed unmount leaves the record untouched.
        if self.backend.is_mounted(target_path).await? {
            self.backend.unmount(target_path).await?;
        }

        if let Some(mut record) = self.mounts.get_mut(volume_id) {
            record.publish_paths.remove(target_path);
            if record.publish_paths.is_empty() {
                record.state = MountState::Staged;
            }
        } else {
            debug!(%volume_id, "no mount record, nothing to unpublish");
        }
        info!(path = %target_path, "volume unpublished");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        let _guard = self.locks.lock(&volume_id.0).await?;

        {
            let Some(record) = self.mounts.get(volume_id) else {
                // Idempotent — but still tear down a mount left behind by a
                // crash between unmount and record removal on a prior call.
                if self.backend.is_mounted(staging_target_path).await? {
                    warn!(path = %staging_target_path, "unrecorded staging mount found, unmounting");
                    self.backend.unmount(staging_target_path).await?;
                }
                debug!(%volume_id, "volume not staged, nothing to unstage");
                return Ok(());
            };
            if !record.publish_paths.is_empty() {
                return Err(CsiError::FailedPrecondition(format!(
                    "volume {volume_id} still has {} publish target(s)",
                    record.publish_paths.len()
                )));
            }
            if record.staging_path != staging_target_path {
                return Err(CsiError::InvalidArgument(format!(
                    "volume {volume_id} is staged at {}, not {staging_target_path}",
                    record.staging_path
                )));
            }
        }

        if self.backend.is_mounted(staging_target_path).await? {
            self.backend.unmount(staging_target_path).await?;
        }

        self.mounts.remove(volume_id);
        info!(path = %staging_target_path, "volume unstaged");
        Ok(())
    }

    /// The Node operations this service wires up.  `GetVolumeStats` is only
    /// advertised when the backend can actually report statistics.
    pub fn capabilities(&self) -> Vec<NodeCapability> {
        let mut caps = vec![NodeCapability::StageUnstageVolume];
        if self.backend.supports_stats() {
            caps.push(NodeCapability::GetVolumeStats);
        }
        caps
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: MAX_VOLUMES_PER_NODE,
            accessible_topology: Some(Topology {
                segments: HashMap::from([("node".to_owned(), self.node_id.clone())]),
            }),
        }
    }

    pub async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        if !self.backend.supports_stats() {
            return Err(CsiError::Unimplemented(
                "backend does not report volume statistics".to_owned(),
            ));
        }

        {
            let record = self
                .mounts
                .get(volume_id)
                .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))?;
            if record.staging_path != volume_path && !record.publish_paths.contains(volume_path) {
                return Err(CsiError::VolumeNotFound(format!(
                    "volume {volume_id} has no mount at {volume_path}"
                )));
            }
        }

        self.backend.stats(volume_path).await
    }
}
