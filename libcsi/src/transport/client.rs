//! QUIC client used by the orchestrator side to issue CSI requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use tracing::{debug, instrument};

use crate::error::CsiError;
use crate::message::CsiMessage;
use crate::types::*;

/// A lightweight CSI client that sends [`CsiMessage`] requests over a single
/// QUIC connection and returns the server's response.
///
/// The typed methods ([`Self::create_volume`], [`Self::stage_volume`], ...)
/// wrap [`Self::request`] and unwrap the matching response variant, turning
/// a [`CsiMessage::Error`] reply back into `Err`.
pub struct CsiClient {
    connection: quinn::Connection,
}

/// Unwrap one expected response variant, mapping `Error` replies and
/// mismatched variants to `Err`.
macro_rules! expect_response {
    ($response:expr, $variant:path) => {
        match $response {
            $variant(inner) => Ok(inner),
            CsiMessage::Error(e) => Err(e),
            other => Err(CsiError::TransportError(format!(
                "unexpected response: {other}"
            ))),
        }
    };
}

impl CsiClient {
    /// Establish a new QUIC connection to the CSI server at `addr`.
    ///
    /// * `addr` — socket address of the remote CSI server
    /// * `server_name` — TLS SNI name that must match a SAN in the server's
    ///   certificate
    /// * `tls_config` — client TLS configuration
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, CsiError> {
        let quic_client_config = QuicClientConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));

        let mut endpoint =
            quinn::Endpoint::client("0.0.0.0:0".parse().unwrap()).map_err(CsiError::transport)?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(CsiError::transport)?
            .await
            .map_err(CsiError::transport)?;

        debug!(%addr, %server_name, "CSI QUIC connection established");
        Ok(Self { connection })
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// Each call opens a new bi-directional QUIC stream, writes the
    /// JSON-serialized request, finishes the send side, then reads the
    /// full response and deserializes it.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(CsiError::transport)?;

        // Serialize and send.
        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;

        // Read the full response.
        let buf = recv
            .read_to_end(16 * 1024 * 1024) // 16 MiB upper bound
            .await
            .map_err(CsiError::transport)?;

        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::transport)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }

    /// Send a request whose success reply carries no payload.
    async fn request_ok(&self, msg: &CsiMessage) -> Result<(), CsiError> {
        match self.request(msg).await? {
            CsiMessage::Ok => Ok(()),
            CsiMessage::Error(e) => Err(e),
            other => Err(CsiError::TransportError(format!(
                "unexpected response: {other}"
            ))),
        }
    }

    // --- Identity -----------------------------------------------------------

    /// Readiness probe.
    pub async fn probe(&self) -> Result<bool, CsiError> {
        expect_response!(self.request(&CsiMessage::Probe).await?, CsiMessage::ProbeResult)
    }

    /// Query plugin name and version.
    pub async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        expect_response!(
            self.request(&CsiMessage::GetPluginInfo).await?,
            CsiMessage::PluginInfoResponse
        )
    }

    /// Query plugin capabilities.
    pub async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        expect_response!(
            self.request(&CsiMessage::GetPluginCapabilities).await?,
            CsiMessage::PluginCapabilitiesResponse
        )
    }

    // --- Controller ---------------------------------------------------------

    /// Provision a volume.
    pub async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        expect_response!(
            self.request(&CsiMessage::CreateVolume(req)).await?,
            CsiMessage::VolumeCreated
        )
    }

    /// Delete a volume.
    pub async fn delete_volume(&self, volume_id: VolumeId) -> Result<(), CsiError> {
        self.request_ok(&CsiMessage::DeleteVolume(volume_id)).await
    }

    /// Attach a volume to a node; returns the publish context.
    pub async fn controller_publish_volume(
        &self,
        volume_id: VolumeId,
        node_id: impl Into<String>,
        volume_capability: VolumeCapability,
    ) -> Result<HashMap<String, String>, CsiError> {
        expect_response!(
            self.request(&CsiMessage::ControllerPublishVolume {
                volume_id,
                node_id: node_id.into(),
                volume_capability,
            })
            .await?,
            CsiMessage::VolumeAttached
        )
    }

    /// Detach a volume from a node.
    pub async fn controller_unpublish_volume(
        &self,
        volume_id: VolumeId,
        node_id: impl Into<String>,
    ) -> Result<(), CsiError> {
        self.request_ok(&CsiMessage::ControllerUnpublishVolume {
            volume_id,
            node_id: node_id.into(),
        })
        .await
    }

    /// Check capabilities against an existing volume.
    pub async fn validate_volume_capabilities(
        &self,
        volume_id: VolumeId,
        capabilities: Vec<VolumeCapability>,
    ) -> Result<bool, CsiError> {
        expect_response!(
            self.request(&CsiMessage::ValidateVolumeCapabilities {
                volume_id,
                capabilities,
            })
            .await?,
            CsiMessage::CapabilitiesValid
        )
    }

    /// List all volumes.
    pub async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        expect_response!(
            self.request(&CsiMessage::ListVolumes).await?,
            CsiMessage::VolumeList
        )
    }

    /// Query remaining capacity.
    pub async fn get_capacity(&self) -> Result<u64, CsiError> {
        expect_response!(
            self.request(&CsiMessage::GetCapacity).await?,
            CsiMessage::Capacity
        )
    }

    /// Query Controller service capabilities.
    pub async fn controller_get_capabilities(
        &self,
    ) -> Result<Vec<ControllerCapability>, CsiError> {
        expect_response!(
            self.request(&CsiMessage::ControllerGetCapabilities).await?,
            CsiMessage::ControllerCapabilities
        )
    }

    // --- Node ---------------------------------------------------------------

    /// Stage a volume at its global mount point.
    pub async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.request_ok(&CsiMessage::StageVolume(req)).await
    }

    /// Unstage a volume.
    pub async fn unstage_volume(
        &self,
        volume_id: VolumeId,
        staging_target_path: impl Into<String>,
    ) -> Result<(), CsiError> {
        self.request_ok(&CsiMessage::UnstageVolume {
            volume_id,
            staging_target_path: staging_target_path.into(),
        })
        .await
    }

    /// Publish a staged volume into a workload path.
    pub async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.request_ok(&CsiMessage::PublishVolume(req)).await
    }

    /// Unpublish a volume from a workload path.
    pub async fn unpublish_volume(
        &self,
        volume_id: VolumeId,
        target_path: impl Into<String>,
    ) -> Result<(), CsiError> {
        self.request_ok(&CsiMessage::UnpublishVolume {
            volume_id,
            target_path: target_path.into(),
        })
        .await
    }

    /// Query Node service capabilities.
    pub async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        expect_response!(
            self.request(&CsiMessage::NodeGetCapabilities).await?,
            CsiMessage::NodeCapabilities
        )
    }

    /// Query node identity.
    pub async fn get_node_info(&self) -> Result<NodeInfo, CsiError> {
        expect_response!(
            self.request(&CsiMessage::GetNodeInfo).await?,
            CsiMessage::NodeInfoResponse
        )
    }

    /// Query usage statistics for a mounted volume.
    pub async fn get_volume_stats(
        &self,
        volume_id: VolumeId,
        volume_path: impl Into<String>,
    ) -> Result<VolumeStats, CsiError> {
        expect_response!(
            self.request(&CsiMessage::GetVolumeStats {
                volume_id,
                volume_path: volume_path.into(),
            })
            .await?,
            CsiMessage::VolumeStatsResponse
        )
    }

    /// Close the underlying QUIC connection gracefully.
    pub fn close(&self) {
        self.connection
            .close(quinn::VarInt::from_u32(0), b"client shutdown");
    }
}
