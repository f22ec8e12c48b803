//! CSI Controller service: the volume provisioning state machine.
//!
//! [`CsiController`] is the trait the transport layer dispatches against;
//! [`ControllerService`] is the driver's implementation of it over a
//! [`StorageBackend`].
//!
//! Every mutating operation is idempotent, because the orchestrator delivers
//! RPCs at least once: the outcome is always re-derived from the request
//! parameters and the existing record, never from "has this been called
//! before" flags.  Backend calls are issued *before* record transitions
//! commit; a failed backend call rolls the record back so no half-applied
//! transition survives.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, instrument};

use crate::backend::{StorageBackend, VolumeHandle};
use crate::error::CsiError;
use crate::lock::VolumeLocks;
use crate::types::{
    ControllerCapability, CreateVolumeRequest, Volume, VolumeCapability, VolumeId, VolumeState,
};

/// Key stored in [`Volume::parameters`] to persist the caller-supplied volume
/// name across process restarts, enabling `create_volume` idempotency after
/// recovery.
const PARAM_CSI_NAME: &str = "_csi_name";

/// Controller service — centralized volume management.
///
/// Operations in this trait run on the control plane and coordinate with the
/// storage backend to provision, attach, and deprovision volumes.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, idempotent keyed on `req.name`.
    ///
    /// The returned [`Volume`] contains the assigned `volume_id` and
    /// `volume_context` that must be forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.  Deleting an unknown volume
    /// succeeds; deleting an attached volume fails.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Attach a volume to a node.  Returns the opaque publish context the
    /// Node service needs to mount the volume there.
    async fn controller_publish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
        capability: &VolumeCapability,
    ) -> Result<HashMap<String, String>, CsiError>;

    /// Detach a volume from a node.  Detaching a non-attached pair succeeds.
    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    /// List all volumes known to this controller.
    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError>;

    /// Return the total available capacity in bytes.
    async fn get_capacity(&self) -> Result<u64, CsiError>;

    /// Advertise the Controller operations this driver implements.
    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}

/// Authoritative in-memory state for one provisioned volume.
#[derive(Debug, Clone)]
pub struct VolumeRecord {
    /// The volume as returned to callers.
    pub volume: Volume,
    /// Backend handle for deallocate/attach/detach calls.
    pub handle: VolumeHandle,
    /// Provisioning lifecycle state.
    pub state: VolumeState,
    /// Nodes the volume is currently attached to.  Empty unless `state`
    /// is [`VolumeState::Attached`].
    pub attached_nodes: HashSet<String>,
}

/// The driver's Controller service over a [`StorageBackend`].
///
/// # Thread safety
///
/// Records live in concurrent maps; each mutating operation additionally
/// holds the per-key lock for its volume (the caller-supplied name for
/// `create_volume`, the volume id otherwise), so same-volume operations
/// serialize while different volumes proceed in parallel.
pub struct ControllerService<B> {
    backend: Arc<B>,
    /// Volume records, keyed by volume id.
    volumes: DashMap<VolumeId, VolumeRecord>,
    /// Maps the caller-supplied volume name to the assigned [`VolumeId`].
    volume_names: DashMap<String, VolumeId>,
    locks: VolumeLocks,
}

/// The caller-visible parameters of a record, with the internal name key
/// stripped for idempotency comparisons.
fn user_parameters(parameters: &HashMap<String, String>) -> HashMap<String, String> {
    parameters
        .iter()
        .filter(|(k, _)| k.as_str() != PARAM_CSI_NAME)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn publish_context(record: &VolumeRecord) -> HashMap<String, String> {
    let mut ctx = record.handle.volume_context.clone();
    ctx.insert("volume_handle".to_owned(), record.handle.id.clone());
    ctx
}

impl<B: StorageBackend> ControllerService<B> {
    /// Create a new Controller service.  Call [`Self::recover`] afterwards
    /// to rebuild records from the backend after a process restart.
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            volumes: DashMap::new(),
            volume_names: DashMap::new(),
            locks: VolumeLocks::new(),
        }
    }

    /// Rebuild volume records and the name index from the backend's
    /// allocation list.
    ///
    /// Attachments are not recoverable from the backend and reset to empty;
    /// a retried `controller_publish_volume` re-issues the attach and
    /// reconciles.
    pub async fn recover(&self) -> Result<(), CsiError> {
        for pv in self.backend.list().await? {
            if let Some(name) = pv.parameters.get(PARAM_CSI_NAME) {
                self.volume_names.insert(name.clone(), pv.volume_id.clone());
            }
            let volume = Volume {
                volume_id: pv.volume_id.clone(),
                capacity_bytes: pv.capacity_bytes,
                parameters: pv.parameters,
                volume_context: pv.handle.volume_context.clone(),
                accessible_topology: Vec::new(),
            };
            self.volumes.insert(
                pv.volume_id,
                VolumeRecord {
                    volume,
                    handle: pv.handle,
                    state: VolumeState::Created,
                    attached_nodes: HashSet::new(),
                },
            );
        }
        info!(count = self.volumes.len(), "controller records recovered");
        Ok(())
    }

    /// Reject capabilities the backend cannot satisfy.
    fn check_capabilities(&self, capabilities: &[VolumeCapability]) -> Result<(), CsiError> {
        let supported = self.backend.supported_access_modes();
        for cap in capabilities {
            if !supported.contains(&cap.access_mode) {
                return Err(CsiError::InvalidArgument(format!(
                    "access mode {:?} is not supported by this backend",
                    cap.access_mode
                )));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume name must not be empty".to_owned(),
            ));
        }
        self.check_capabilities(&req.volume_capabilities)?;

        // Round the requested capacity up to the backend's allocation unit;
        // zero means "smallest possible volume".
        let unit = self.backend.allocation_unit();
        let capacity = req.capacity_bytes.div_ceil(unit).max(1) * unit;

        // Serialize with other creates (and retries) for the same name.
        // Volume ids are uuid-suffixed, so name keys and id keys never
        // collide in the shared arena.
        let _guard = self.locks.lock(&req.name).await?;

        // Idempotency: if a volume with this name was already provisioned,
        // return it unchanged — unless the request conflicts with it.
        let existing = self.volume_names.get(&req.name).map(|r| r.clone());
        if let Some(id) = existing {
            match self.volumes.get(&id) {
                Some(record) => {
                    return match record.state {
                        VolumeState::Creating | VolumeState::Deleting => {
                            Err(CsiError::OperationPending(id.to_string()))
                        }
                        _ => {
                            if record.volume.capacity_bytes == capacity
                                && user_parameters(&record.volume.parameters) == req.parameters
                            {
                                debug!(%id, "returning existing volume for idempotent create");
                                Ok(record.volume.clone())
                            } else {
                                Err(CsiError::AlreadyExists(format!(
                                    "volume name {:?} is taken by {id} with different capacity or parameters",
                                    req.name
                                )))
                            }
                        }
                    };
                }
                // Stale entry: name is recorded but the record is gone.
                None => {
                    self.volume_names.remove(&req.name);
                }
            }
        }

        let volume_id = VolumeId(format!("meshfs-{}", uuid::Uuid::new_v4()));

        // Embed the caller-supplied name in parameters so it survives
        // restarts and can be used to rebuild `volume_names` during
        // recovery.
        let mut parameters = req.parameters;
        parameters.insert(PARAM_CSI_NAME.to_owned(), req.name.clone());

        // Reserve the record in Creating state before the backend call, so
        // concurrent operations on the new id observe the transition as
        // pending rather than racing a half-created volume.
        self.volumes.insert(
            volume_id.clone(),
            VolumeRecord {
                volume: Volume {
                    volume_id: volume_id.clone(),
                    capacity_bytes: capacity,
                    parameters: parameters.clone(),
                    volume_context: HashMap::new(),
                    accessible_topology: Vec::new(),
                },
                handle: VolumeHandle {
                    id: volume_id.0.clone(),
                    volume_context: HashMap::new(),
                },
                state: VolumeState::Creating,
                attached_nodes: HashSet::new(),
            },
        );
        self.volume_names.insert(req.name.clone(), volume_id.clone());

        match self.backend.allocate(&volume_id, capacity, &parameters).await {
            Ok(handle) => {
                let volume = {
                    let mut record = self.volumes.get_mut(&volume_id).ok_or_else(|| {
                        CsiError::Internal(format!("volume {volume_id} vanished during create"))
                    })?;
                    record.volume.volume_context = handle.volume_context.clone();
                    record.handle = handle;
                    record.state = VolumeState::Created;
                    record.volume.clone()
                };
                info!(%volume_id, capacity, "volume created");
                Ok(volume)
            }
            Err(e) => {
                // Roll the reservation back; the caller can retry cleanly.
                self.volumes.remove(&volume_id);
                self.volume_names.remove(&req.name);
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let _guard = self.locks.lock(&volume_id.0).await?;

        let (handle, name) = {
            let Some(mut record) = self.volumes.get_mut(volume_id) else {
                debug!(%volume_id, "volume already gone, nothing to delete");
                return Ok(());
            };
            if matches!(record.state, VolumeState::Creating | VolumeState::Deleting) {
                return Err(CsiError::OperationPending(volume_id.to_string()));
            }
            if !record.attached_nodes.is_empty() {
                return Err(CsiError::FailedPrecondition(format!(
                    "volume {volume_id} is still attached to {} node(s)",
                    record.attached_nodes.len()
                )));
            }
            record.state = VolumeState::Deleting;
            (
                record.handle.clone(),
                record.volume.parameters.get(PARAM_CSI_NAME).cloned(),
            )
        };

        if let Err(e) = self.backend.deallocate(&handle).await {
            // Leave the record intact for a retry.
            if let Some(mut record) = self.volumes.get_mut(volume_id) {
                record.state = VolumeState::Created;
            }
            return Err(e);
        }

        self.volumes.remove(volume_id);
        if let Some(name) = name {
            self.volume_names.remove(&name);
        }
        info!(%volume_id, "volume deleted");
        Ok(())
    }

    #[instrument(skip(self, capability))]
    pub async fn controller_publish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
        capability: &VolumeCapability,
    ) -> Result<HashMap<String, String>, CsiError> {
        if node_id.is_empty() {
            return Err(CsiError::InvalidArgument(
                "node id must not be empty".to_owned(),
            ));
        }
        self.check_capabilities(std::slice::from_ref(capability))?;

        let _guard = self.locks.lock(&volume_id.0).await?;

        let handle = {
            let record = self
                .volumes
                .get(volume_id)
                .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))?;
            if matches!(record.state, VolumeState::Creating | VolumeState::Deleting) {
                return Err(CsiError::OperationPending(volume_id.to_string()));
            }
            if record.attached_nodes.contains(node_id) {
                debug!(%volume_id, node_id, "already attached, idempotent publish");
                return Ok(publish_context(&record));
            }
            record.handle.clone()
        };

        self.backend.attach(&handle, node_id).await?;

        let mut record = self.volumes.get_mut(volume_id).ok_or_else(|| {
            CsiError::Internal(format!("volume {volume_id} vanished during attach"))
        })?;
        record.attached_nodes.insert(node_id.to_owned());
        record.state = VolumeState::Attached;
        info!(%volume_id, node_id, "volume attached");
        Ok(publish_context(&record))
    }

    #[instrument(skip(self))]
    pub async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError> {
        let _guard = self.locks.lock(&volume_id.0).await?;

        let handle = {
            let Some(record) = self.volumes.get(volume_id) else {
                debug!(%volume_id, "volume gone, nothing to detach");
                return Ok(());
            };
            if !record.attached_nodes.contains(node_id) {
                debug!(%volume_id, node_id, "not attached, idempotent unpublish");
                return Ok(());
            }
            record.handle.clone()
        };

        self.backend.detach(&handle, node_id).await?;

        if let Some(mut record) = self.volumes.get_mut(volume_id) {
            record.attached_nodes.remove(node_id);
            if record.attached_nodes.is_empty() {
                record.state = VolumeState::Created;
            }
        }
        info!(%volume_id, node_id, "volume detached");
        Ok(())
    }

    pub async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        if !self.volumes.contains_key(volume_id) {
            return Err(CsiError::VolumeNotFound(volume_id.to_string()));
        }
        let supported = self.backend.supported_access_modes();
        Ok(capabilities
            .iter()
            .all(|cap| supported.contains(&cap.access_mode)))
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        Ok(self
            .volumes
            .iter()
            .map(|entry| entry.value().volume.clone())
            .collect())
    }

    pub async fn get_capacity(&self) -> Result<u64, CsiError> {
        self.backend.capacity().await
    }

    /// The Controller operations this service wires up.  This is the single
    /// source of truth behind `controller_get_capabilities`.
    pub fn capabilities(&self) -> Vec<ControllerCapability> {
        vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::PublishUnpublishVolume,
            ControllerCapability::ListVolumes,
            ControllerCapability::GetCapacity,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;

    fn make_service() -> (Arc<MemoryBackend>, ControllerService<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let service = ControllerService::new(Arc::clone(&backend));
        (backend, service)
    }

    fn create_req(name: &str, capacity: u64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            capacity_bytes: capacity,
            volume_capabilities: vec![VolumeCapability::default()],
            parameters: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_volume_idempotent_by_name() {
        let (backend, service) = make_service();

        let vol1 = service.create_volume(create_req("vol-a", 10 * GIB)).await.unwrap();
        assert!(vol1.volume_id.0.starts_with("meshfs-"));
        assert_eq!(vol1.capacity_bytes, 10 * GIB);

        // Second call with identical name and parameters returns the same
        // volume and does not reach the backend again.
        let vol2 = service.create_volume(create_req("vol-a", 10 * GIB)).await.unwrap();
        assert_eq!(vol1.volume_id, vol2.volume_id);
        assert_eq!(vol2.capacity_bytes, 10 * GIB);
        assert_eq!(backend.allocate_calls(), 1);
        assert_eq!(service.list_volumes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_volume_conflicting_capacity_fails() {
        let (_, service) = make_service();

        service.create_volume(create_req("vol-a", 10 * GIB)).await.unwrap();
        let err = service
            .create_volume(create_req("vol-a", 20 * GIB))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::AlreadyExists(_)));

        // The original volume is untouched.
        let vols = service.list_volumes().await.unwrap();
        assert_eq!(vols.len(), 1);
        assert_eq!(vols[0].capacity_bytes, 10 * GIB);
    }

    #[tokio::test]
    async fn create_volume_conflicting_parameters_fails() {
        let (_, service) = make_service();

        service.create_volume(create_req("vol-a", GIB)).await.unwrap();

        let mut req = create_req("vol-a", GIB);
        req.parameters.insert("tier".into(), "cold".into());
        let err = service.create_volume(req).await.unwrap_err();
        assert!(matches!(err, CsiError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_volume_rounds_capacity_up() {
        let (_, service) = make_service();

        // 1.5 MiB rounds up to 2 MiB; zero rounds up to one unit.
        let vol = service.create_volume(create_req("odd", MIB + MIB / 2)).await.unwrap();
        assert_eq!(vol.capacity_bytes, 2 * MIB);

        let vol = service.create_volume(create_req("zero", 0)).await.unwrap();
        assert_eq!(vol.capacity_bytes, MIB);
    }

    #[tokio::test]
    async fn create_volume_rejects_empty_name() {
        let (_, service) = make_service();
        let err = service.create_volume(create_req("", GIB)).await.unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn delete_volume_is_idempotent() {
        let (_, service) = make_service();

        // Deleting an unknown volume succeeds silently.
        service.delete_volume(&"meshfs-nope".into()).await.unwrap();

        let vol = service.create_volume(create_req("vol-a", GIB)).await.unwrap();
        service.delete_volume(&vol.volume_id).await.unwrap();
        assert!(service.list_volumes().await.unwrap().is_empty());

        // Already gone: still succeeds.
        service.delete_volume(&vol.volume_id).await.unwrap();

        // The name is free again for a fresh volume.
        let vol2 = service.create_volume(create_req("vol-a", GIB)).await.unwrap();
        assert_ne!(vol.volume_id, vol2.volume_id);
    }

    #[tokio::test]
    async fn delete_attached_volume_fails() {
        let (_, service) = make_service();
        let cap = VolumeCapability::default();

        let vol = service.create_volume(create_req("vol-a", GIB)).await.unwrap();
        service
            .controller_publish_volume(&vol.volume_id, "node-01", &cap)
            .await
            .unwrap();

        let err = service.delete_volume(&vol.volume_id).await.unwrap_err();
        assert!(matches!(err, CsiError::FailedPrecondition(_)));

        // The record is intact and the volume still usable.
        assert_eq!(service.list_volumes().await.unwrap().len(), 1);

        service
            .controller_unpublish_volume(&vol.volume_id, "node-01")
            .await
            .unwrap();
        service.delete_volume(&vol.volume_id).await.unwrap();
    }

    #[tokio::test]
    async fn publish_and_unpublish_transition_state() {
        let (backend, service) = make_service();
        let cap = VolumeCapability::default();

        let vol = service.create_volume(create_req("vol-a", GIB)).await.unwrap();
        let id = vol.volume_id.clone();

        let ctx = service
            .controller_publish_volume(&id, "node-01", &cap)
            .await
            .unwrap();
        assert_eq!(ctx.get("volume_handle").unwrap(), &id.0);
        assert_eq!(service.volumes.get(&id).unwrap().state, VolumeState::Attached);

        // Publishing the same pair again is a no-op success.
        service
            .controller_publish_volume(&id, "node-01", &cap)
            .await
            .unwrap();
        assert_eq!(backend.attach_calls(), 1);

        // A second node attaches alongside the first.
        service
            .controller_publish_volume(&id, "node-02", &cap)
            .await
            .unwrap();
        {
            let record = service.volumes.get(&id).unwrap();
            assert_eq!(record.attached_nodes.len(), 2);
        }

        service.controller_unpublish_volume(&id, "node-01").await.unwrap();
        assert_eq!(service.volumes.get(&id).unwrap().state, VolumeState::Attached);

        service.controller_unpublish_volume(&id, "node-02").await.unwrap();
        assert_eq!(service.volumes.get(&id).unwrap().state, VolumeState::Created);

        // Unpublishing a non-attached pair is a no-op success.
        service.controller_unpublish_volume(&id, "node-03").await.unwrap();
    }

    #[tokio::test]
    async fn publish_unknown_volume_fails() {
        let (_, service) = make_service();
        let err = service
            .controller_publish_volume(&"meshfs-nope".into(), "node-01", &VolumeCapability::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::VolumeNotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_publish_different_nodes_both_succeed() {
        let (_, service) = make_service();
        let service = Arc::new(service);
        let cap = VolumeCapability::default();

        let vol = service.create_volume(create_req("vol-a", GIB)).await.unwrap();
        let id = vol.volume_id.clone();

        let s1 = Arc::clone(&service);
        let s2 = Arc::clone(&service);
        let (id1, id2) = (id.clone(), id.clone());
        let (c1, c2) = (cap.clone(), cap.clone());
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { s1.controller_publish_volume(&id1, "node-01", &c1).await }),
            tokio::spawn(async move { s2.controller_publish_volume(&id2, "node-02", &c2).await }),
        );
        r1.unwrap().unwrap();
        r2.unwrap().unwrap();

        let record = service.volumes.get(&id).unwrap();
        assert!(record.attached_nodes.contains("node-01"));
        assert!(record.attached_nodes.contains("node-02"));
    }

    #[tokio::test]
    async fn validate_volume_capabilities_checks_existence() {
        let (_, service) = make_service();

        let err = service
            .validate_volume_capabilities(&"meshfs-nope".into(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::VolumeNotFound(_)));

        let vol = service.create_volume(create_req("vol-a", GIB)).await.unwrap();
        let ok = service
            .validate_volume_capabilities(&vol.volume_id, &[VolumeCapability::default()])
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn recover_rebuilds_records_and_name_index() {
        let backend = Arc::new(MemoryBackend::new());
        let service = ControllerService::new(Arc::clone(&backend));
        let vol = service.create_volume(create_req("persistent", GIB)).await.unwrap();

        // A fresh service over the same backend knows nothing until it
        // recovers.
        let service2 = ControllerService::new(Arc::clone(&backend));
        assert!(service2.list_volumes().await.unwrap().is_empty());

        service2.recover().await.unwrap();
        assert_eq!(service2.list_volumes().await.unwrap().len(), 1);

        // Idempotent create still resolves to the recovered volume.
        let again = service2.create_volume(create_req("persistent", GIB)).await.unwrap();
        assert_eq!(again.volume_id, vol.volume_id);
        assert_eq!(backend.allocate_calls(), 1);
    }

    #[tokio::test]
    async fn capacity_reflects_backend_pool() {
        let (backend, service) = make_service();
        let before = service.get_capacity().await.unwrap();
        service.create_volume(create_req("vol-a", GIB)).await.unwrap();
        let after = service.get_capacity().await.unwrap();
        assert_eq!(before - after, GIB);
        assert_eq!(backend.allocate_calls(), 1);
    }

    #[tokio::test]
    async fn capabilities_cover_wired_operations() {
        let (_, service) = make_service();
        let caps = service.capabilities();
        assert!(caps.contains(&ControllerCapability::CreateDeleteVolume));
        assert!(caps.contains(&ControllerCapability::PublishUnpublishVolume));
        assert!(caps.contains(&ControllerCapability::ListVolumes));
        assert!(caps.contains(&ControllerCapability::GetCapacity));
    }
}
