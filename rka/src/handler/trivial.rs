use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::{Handler, Queues, queues, set_queues};
use crate::error::Result;
use crate::queue::WorkQueue;
use crate::store::Cluster;
use crate::util;

/// Handler for drivers that need no controller publish step.
///
/// Every VolumeAttachment is marked attached as soon as it is seen, and no
/// finalizers are added because there is nothing to undo on detach.
pub struct TrivialHandler {
    cluster: Arc<dyn Cluster>,
    queues: OnceLock<Queues>,
}

impl TrivialHandler {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self {
            cluster,
            queues: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Handler for TrivialHandler {
    fn init(&self, va_queue: WorkQueue, pv_queue: WorkQueue) {
        set_queues(&self.queues, va_queue, pv_queue);
    }

    #[instrument(skip_all, fields(va = %va.name_any()))]
    async fn sync_volume_attachment(&self, va: Arc<VolumeAttachment>) -> Result<()> {
        let queue = &queues(&self.queues)?.va;
        let name = va.name_any();
        if util::is_attached(&va) {
            debug!("already attached");
            queue.forget(&name);
            return Ok(());
        }

        let mut attached = (*va).clone();
        attached.status.get_or_insert_with(Default::default).attached = true;
        match self
            .cluster
            .patch_volume_attachment_status(&va, &attached)
            .await
        {
            Ok(_) => {
                info!("marked as attached");
                queue.forget(&name);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to mark as attached");
                queue.add_rate_limited(name);
                Err(e)
            }
        }
    }

    async fn sync_persistent_volume(&self, _pv: Arc<PersistentVolume>) -> Result<()> {
        Ok(())
    }

    async fn reconcile_va(&self) -> Result<()> {
        Ok(())
    }
}
