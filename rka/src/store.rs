//! The attacher's view of the cluster: cached reads and versioned writes.
//!
//! Reads come from informer caches and never block.  Writes are merge
//! patches guarded by the resourceVersion of the object they were computed
//! from, so a stale write fails with [`AttacherError::Conflict`] and the
//! caller retries from a fresh cache read.
//!
//! [`AttacherError::Conflict`]: crate::error::AttacherError::Conflict

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, Secret};
use k8s_openapi::api::storage::v1::{CSINode, VolumeAttachment};

use crate::error::Result;

/// Read-only caches of the objects the handlers look at.
#[async_trait]
pub trait Listers: Send + Sync {
    /// Resolve once every cache has completed its initial listing.
    async fn wait_for_cache_sync(&self) -> Result<()>;

    fn volume_attachment(&self, name: &str) -> Option<Arc<VolumeAttachment>>;
    fn volume_attachments(&self) -> Vec<Arc<VolumeAttachment>>;
    fn persistent_volume(&self, name: &str) -> Option<Arc<PersistentVolume>>;
    fn persistent_volumes(&self) -> Vec<Arc<PersistentVolume>>;
    fn node(&self, name: &str) -> Option<Arc<Node>>;
    fn csi_node(&self, name: &str) -> Option<Arc<CSINode>>;
}

/// Writes, plus reads that are not cached.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// `Ok(None)` when the secret does not exist.
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Patch metadata and spec of `old` to match `new`.
    async fn patch_volume_attachment(
        &self,
        old: &VolumeAttachment,
        new: &VolumeAttachment,
    ) -> Result<VolumeAttachment>;

    /// Patch the status subresource of `old` to match `new`.
    async fn patch_volume_attachment_status(
        &self,
        old: &VolumeAttachment,
        new: &VolumeAttachment,
    ) -> Result<VolumeAttachment>;

    async fn patch_persistent_volume(
        &self,
        old: &PersistentVolume,
        new: &PersistentVolume,
    ) -> Result<PersistentVolume>;
}

/// Everything a handler needs from the cluster.
pub trait Cluster: Listers + ObjectClient {}

impl<T: Listers + ObjectClient> Cluster for T {}

/// A change observed on a watched object.
#[derive(Debug, Clone)]
pub enum ObjectEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}
