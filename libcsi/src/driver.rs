//! Driver composition root.
//!
//! [`Driver`] owns the process-wide identity ([`DriverState`]), constructs
//! the Controller and Node services over one shared backend, and implements
//! the three CSI service traits by delegation so a single value can be
//! handed to the transport server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::backend::StorageBackend;
use crate::controller::{ControllerService, CsiController};
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::node::{CsiNode, NodeService};
use crate::types::{
    ControllerCapability, CreateVolumeRequest, NodeCapability, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, PluginCapability, PluginInfo, Volume, VolumeCapability, VolumeId,
    VolumeStats,
};

/// Startup configuration for a driver instance.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Plugin name advertised via `get_plugin_info`, e.g. `"meshfs-csi"`.
    pub name: String,
    /// Vendor version string.
    pub version: String,
    /// Identifier of the node this driver instance runs on.
    pub node_id: String,
    /// Address the transport listener binds to.
    pub endpoint: SocketAddr,
}

/// Process-wide driver identity, shared read-only by all services.
///
/// The identity fields are immutable after construction; the only mutable
/// piece is the readiness flag, flipped once after initialization.
pub struct DriverState {
    /// Plugin name.
    pub name: String,
    /// Vendor version string.
    pub version: String,
    /// Node identifier.
    pub node_id: String,
    /// Transport endpoint.
    pub endpoint: SocketAddr,
    ready: AtomicBool,
}

impl DriverState {
    /// Build the immutable identity from startup configuration.  The driver
    /// starts out not ready; [`Self::mark_ready`] flips it.
    #[must_use]
    pub fn new(config: DriverConfig) -> Self {
        Self {
            name: config.name,
            version: config.version,
            node_id: config.node_id,
            endpoint: config.endpoint,
            ready: AtomicBool::new(false),
        }
    }

    /// Whether initialization has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Mark initialization as complete; `probe` reports healthy from here on.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

/// The assembled CSI driver: identity, Controller, and Node services wired
/// over one shared [`StorageBackend`].
pub struct Driver<B> {
    state: Arc<DriverState>,
    controller: ControllerService<B>,
    node: NodeService<B>,
}

impl<B: StorageBackend> Driver<B> {
    /// Construct the driver.  Call [`Self::initialize`] before serving so
    /// records are recovered and `probe` starts reporting ready.
    pub fn new(config: DriverConfig, backend: Arc<B>) -> Self {
        info!(
            name = %config.name,
            version = %config.version,
            node_id = %config.node_id,
            endpoint = %config.endpoint,
            "driver configured",
        );
        let node_id = config.node_id.clone();
        Self {
            state: Arc::new(DriverState::new(config)),
            controller: ControllerService::new(Arc::clone(&backend)),
            node: NodeService::new(backend, node_id),
        }
    }

    /// Recover controller records from the backend and flip the readiness
    /// flag.  Until this returns, `probe` reports not ready.
    pub async fn initialize(&self) -> Result<(), CsiError> {
        self.controller.recover().await?;
        self.state.mark_ready();
        info!("driver initialized");
        Ok(())
    }

    /// Shared read-only driver identity.
    #[must_use]
    pub fn state(&self) -> &Arc<DriverState> {
        &self.state
    }

    /// The Controller service.
    #[must_use]
    pub fn controller(&self) -> &ControllerService<B> {
        &self.controller
    }

    /// The Node service.
    #[must_use]
    pub fn node(&self) -> &NodeService<B> {
        &self.node
    }
}

#[async_trait]
impl<B: StorageBackend> CsiIdentity for Driver<B> {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.state.name.clone(),
            vendor_version: self.state.version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(self.state.is_ready())
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }
}

#[async_trait]
impl<B: StorageBackend> CsiController for Driver<B> {
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        self.controller.create_volume(req).await
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.controller.delete_volume(volume_id).await
    }

    async fn controller_publish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
        capability: &VolumeCapability,
    ) -> Result<HashMap<String, String>, CsiError> {
        self.controller
            .controller_publish_volume(volume_id, node_id, capability)
            .await
    }

    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError> {
        self.controller
            .controller_unpublish_volume(volume_id, node_id)
            .await
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        self.controller
            .validate_volume_capabilities(volume_id, capabilities)
            .await
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        self.controller.list_volumes().await
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        self.controller.get_capacity().await
    }

    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(self.controller.capabilities())
    }
}

#[async_trait]
impl<B: StorageBackend> CsiNode for Driver<B> {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.node.stage_volume(req).await
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        self.node.unstage_volume(volume_id, staging_target_path).await
    }

    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.node.publish_volume(req).await
    }

    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        self.node.unpublish_volume(volume_id, target_path).await
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(self.node.capabilities())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(self.node.info())
    }

    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        self.node.get_volume_stats(volume_id, volume_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn make_driver(backend: Arc<MemoryBackend>) -> Driver<MemoryBackend> {
        Driver::new(
            DriverConfig {
                name: "meshfs-csi".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                node_id: "test-node".into(),
                endpoint: "127.0.0.1:0".parse().unwrap(),
            },
            backend,
        )
    }

    #[tokio::test]
    async fn probe_gated_on_initialization() {
        let driver = make_driver(Arc::new(MemoryBackend::new()));

        // Not ready until initialize() has run.
        assert!(!driver.probe().await.unwrap());

        driver.initialize().await.unwrap();
        assert!(driver.probe().await.unwrap());
    }

    #[tokio::test]
    async fn plugin_info_reflects_config() {
        let driver = make_driver(Arc::new(MemoryBackend::new()));
        let info = driver.get_plugin_info().await.unwrap();
        assert_eq!(info.name, "meshfs-csi");
        assert_eq!(info.vendor_version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn capabilities_match_wired_services() {
        let driver = make_driver(Arc::new(MemoryBackend::new()));

        let plugin = driver.get_plugin_capabilities().await.unwrap();
        assert_eq!(plugin, vec![PluginCapability::ControllerService]);

        let node = CsiNode::get_capabilities(&driver).await.unwrap();
        assert!(node.contains(&NodeCapability::GetVolumeStats));

        // With a stats-less backend the capability disappears rather than
        // being advertised unimplemented.
        let driver = make_driver(Arc::new(MemoryBackend::without_stats()));
        let node = CsiNode::get_capabilities(&driver).await.unwrap();
        assert_eq!(node, vec![NodeCapability::StageUnstageVolume]);
    }

    #[tokio::test]
    async fn controller_and_node_share_one_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let driver = make_driver(Arc::clone(&backend));
        driver.initialize().await.unwrap();

        let vol = driver
            .create_volume(CreateVolumeRequest {
                name: "shared".into(),
                capacity_bytes: 1 << 20,
                volume_capabilities: vec![VolumeCapability::default()],
                parameters: HashMap::new(),
            })
            .await
            .unwrap();

        driver
            .stage_volume(NodeStageVolumeRequest {
                volume_id: vol.volume_id.clone(),
                staging_target_path: "/stage/shared".into(),
                volume_capability: VolumeCapability::default(),
                volume_context: vol.volume_context.clone(),
            })
            .await
            .unwrap();

        let stats = driver
            .get_volume_stats(&vol.volume_id, "/stage/shared")
            .await
            .unwrap();
        assert_eq!(stats.total_bytes, 1 << 20);
    }
}
