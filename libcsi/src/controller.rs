//! CSI Controller service client trait.
//!
//! The Controller service owns the cluster-wide half of a volume's life.  The
//! attacher only needs the publish side of it: making a volume reachable from
//! a node, taking it away again, and asking where volumes are published.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::proto;
use crate::types::ControllerCapabilities;

/// Controller service: the raw RPC surface used by [`crate::CsiAttacher`].
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Query which controller RPCs the driver implements.
    async fn controller_get_capabilities(&self) -> Result<ControllerCapabilities, CsiError>;

    /// Make a volume available on a node.
    async fn controller_publish_volume(
        &self,
        req: proto::ControllerPublishVolumeRequest,
    ) -> Result<proto::ControllerPublishVolumeResponse, CsiError>;

    /// Revoke a volume's availability on a node.
    async fn controller_unpublish_volume(
        &self,
        req: proto::ControllerUnpublishVolumeRequest,
    ) -> Result<proto::ControllerUnpublishVolumeResponse, CsiError>;

    /// Fetch one page of the driver's volumes.
    async fn list_volumes(
        &self,
        req: proto::ListVolumesRequest,
    ) -> Result<proto::ListVolumesResponse, CsiError>;
}
