use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::ResourceExt;
use libcsi::{AttachRequest, Attacher, PublishedVolumes, Secrets};
use tracing::{debug, info, instrument, warn};

use super::{Handler, Queues, queues, set_queues, volume_error};
use crate::error::{AttacherError, Result};
use crate::queue::WorkQueue;
use crate::store::Cluster;
use crate::util::{self, VA_NODE_ID_ANNOTATION};

#[derive(Clone, Copy)]
enum Operation {
    Attach,
    Detach,
}

/// Attach and detach volumes through the driver's Controller service.
///
/// Both the VolumeAttachment and its PersistentVolume carry the attacher's
/// finalizer while the volume may be published, so neither can disappear
/// before the driver has unpublished it.
pub struct CsiHandler {
    driver: String,
    finalizer: String,
    cluster: Arc<dyn Cluster>,
    attacher: Arc<dyn Attacher>,
    default_fs_type: String,
    readonly_publish: bool,
    list_published: bool,
    queues: OnceLock<Queues>,
}

impl CsiHandler {
    pub fn new(driver: &str, cluster: Arc<dyn Cluster>, attacher: Arc<dyn Attacher>) -> Self {
        Self {
            driver: driver.to_owned(),
            finalizer: util::finalizer_name(driver),
            cluster,
            attacher,
            default_fs_type: String::new(),
            readonly_publish: false,
            list_published: false,
            queues: OnceLock::new(),
        }
    }

    /// Filesystem used when a PV names none.
    pub fn with_default_fs_type(mut self, fs_type: &str) -> Self {
        self.default_fs_type = fs_type.to_owned();
        self
    }

    /// Whether the driver honours the read-only flag on publish.
    pub fn with_readonly_publish(mut self, supported: bool) -> Self {
        self.readonly_publish = supported;
        self
    }

    /// Whether `ListVolumes` reports the nodes each volume is published on.
    pub fn with_list_published_nodes(mut self, supported: bool) -> Self {
        self.list_published = supported;
        self
    }

    async fn sync_attach(&self, va: &VolumeAttachment) -> Result<()> {
        let Some(pv_name) = util::va_pv_name(va) else {
            let err = AttacherError::InvalidVolume(format!(
                "volume attachment {} does not reference a persistent volume",
                va.name_any()
            ));
            return Err(self.record(Operation::Attach, va, err).await);
        };
        let Some(pv) = self.cluster.persistent_volume(pv_name) else {
            let err = AttacherError::not_found("persistentvolume", pv_name);
            return Err(self.record(Operation::Attach, va, err).await);
        };
        if !util::pv_owned_by(&pv, &self.driver) {
            debug!(pv = pv_name, "persistent volume belongs to another driver");
            return Ok(());
        }
        if pv.metadata.deletion_timestamp.is_some() {
            let err =
                AttacherError::InvalidVolume(format!("PV {pv_name} is marked for deletion"));
            return Err(self.record(Operation::Attach, va, err).await);
        }

        if let Err(e) = self.ensure_pv_finalizer(&pv).await {
            return Err(self.record(Operation::Attach, va, e).await);
        }

        let node_id = self.resolve_node_id(&va.spec.node_name, None);
        let mut va = va.clone();
        if !util::has_finalizer(&va, &self.finalizer) {
            let mut new = va.clone();
            util::add_finalizer(&mut new, &self.finalizer);
            if let Ok(id) = &node_id {
                new.annotations_mut()
                    .insert(VA_NODE_ID_ANNOTATION.to_owned(), id.clone());
            }
            va = match self.cluster.patch_volume_attachment(&va, &new).await {
                Ok(updated) => updated,
                Err(e) => return Err(self.record(Operation::Attach, &va, e).await),
            };
            debug!(finalizer = %self.finalizer, "added finalizer to volume attachment");
        }

        if util::is_attached(&va) {
            if va.status.as_ref().is_some_and(|s| s.attach_error.is_some()) {
                let mut new = va.clone();
                if let Some(status) = new.status.as_mut() {
                    status.attach_error = None;
                }
                self.cluster
                    .patch_volume_attachment_status(&va, &new)
                    .await?;
                debug!("cleared stale attach error");
            }
            debug!("already attached");
            return Ok(());
        }

        let req = match self.attach_request(&va, &pv, node_id).await {
            Ok(req) => req,
            Err(e) => return Err(self.record(Operation::Attach, &va, e).await),
        };
        info!(volume = %req.volume_id, node = %req.node_id, "attaching volume");
        let publish_context = match self.attacher.attach(req).await {
            Ok(ctx) => ctx,
            Err(e) => {
                if e.is_final() {
                    warn!(error = %e, "attach failed");
                } else {
                    warn!(error = %e, "attach did not finish and may still be in progress");
                }
                return Err(self.record(Operation::Attach, &va, e.into()).await);
            }
        };

        let mut new = va.clone();
        let status = new.status.get_or_insert_with(Default::default);
        status.attached = true;
        status.attach_error = None;
        status.attachment_metadata =
            (!publish_context.is_empty()).then(|| publish_context.into_iter().collect());
        self.cluster
            .patch_volume_attachment_status(&va, &new)
            .await?;
        info!("volume attached");
        Ok(())
    }

    async fn attach_request(
        &self,
        va: &VolumeAttachment,
        pv: &PersistentVolume,
        node_id: Result<String>,
    ) -> Result<AttachRequest> {
        let node_id = node_id?;
        let (volume_id, read_only) = util::volume_handle(pv)?;
        let capability = util::volume_capability(pv, &self.default_fs_type)?;
        let secrets = self.load_secrets(pv).await?;
        debug!(va = %va.name_any(), volume = %volume_id, "prepared attach request");
        Ok(AttachRequest {
            volume_id,
            node_id,
            read_only: read_only && self.readonly_publish,
            capability,
            volume_context: util::volume_attributes(pv),
            secrets,
        })
    }

    async fn sync_detach(&self, va: &VolumeAttachment) -> Result<()> {
        if !util::has_finalizer(va, &self.finalizer) {
            debug!("already detached");
            return Ok(());
        }

        let node_id = match self.resolve_node_id(&va.spec.node_name, Some(va)) {
            Ok(id) => id,
            Err(e) => return Err(self.record(Operation::Detach, va, e).await),
        };
        let Some(pv_name) = util::va_pv_name(va) else {
            let err = AttacherError::InvalidVolume(format!(
                "volume attachment {} does not reference a persistent volume",
                va.name_any()
            ));
            return Err(self.record(Operation::Detach, va, err).await);
        };
        let (volume_id, secrets) = match self.detach_inputs(pv_name).await {
            Ok(inputs) => inputs,
            Err(e) => return Err(self.record(Operation::Detach, va, e).await),
        };

        info!(volume = %volume_id, node = %node_id, "detaching volume");
        match self.attacher.detach(&volume_id, &node_id, secrets).await {
            Ok(()) => {}
            Err(e) if e.is_final() => {
                info!(error = %e, "driver reports the volume is not published");
            }
            Err(e) => {
                warn!(error = %e, "detach did not finish and may still be in progress");
                return Err(self.record(Operation::Detach, va, e.into()).await);
            }
        }

        self.mark_detached(va).await?;
        queues(&self.queues)?.pv.add(pv_name.to_owned());
        info!("volume detached");
        Ok(())
    }

    async fn detach_inputs(&self, pv_name: &str) -> Result<(String, Secrets)> {
        let pv = self
            .cluster
            .persistent_volume(pv_name)
            .ok_or_else(|| AttacherError::not_found("persistentvolume", pv_name))?;
        let (volume_id, _) = util::volume_handle(&pv)?;
        let secrets = self.load_secrets(&pv).await?;
        Ok((volume_id, secrets))
    }

    /// Clear the attachment status, then drop the finalizer.
    async fn mark_detached(&self, va: &VolumeAttachment) -> Result<()> {
        let mut va = va.clone();
        let needs_status = va.status.as_ref().is_some_and(|s| {
            s.attached || s.detach_error.is_some() || s.attachment_metadata.is_some()
        });
        if needs_status {
            let mut new = va.clone();
            if let Some(status) = new.status.as_mut() {
                status.attached = false;
                status.detach_error = None;
                status.attachment_metadata = None;
            }
            va = self
                .cluster
                .patch_volume_attachment_status(&va, &new)
                .await?;
        }
        let mut new = va.clone();
        util::remove_finalizer(&mut new, &self.finalizer);
        self.cluster.patch_volume_attachment(&va, &new).await?;
        Ok(())
    }

    async fn ensure_pv_finalizer(&self, pv: &PersistentVolume) -> Result<()> {
        if util::has_finalizer(pv, &self.finalizer) {
            return Ok(());
        }
        let mut new = pv.clone();
        util::add_finalizer(&mut new, &self.finalizer);
        self.cluster.patch_persistent_volume(pv, &new).await?;
        debug!(pv = %pv.name_any(), "added finalizer to persistent volume");
        Ok(())
    }

    /// CSINode first, then the Node annotation, then the ID cached on the VA.
    fn resolve_node_id(&self, node_name: &str, va: Option<&VolumeAttachment>) -> Result<String> {
        if let Some(id) = self
            .cluster
            .csi_node(node_name)
            .and_then(|csi_node| util::node_id_from_csi_node(&self.driver, &csi_node))
        {
            return Ok(id);
        }
        let err = match self.cluster.node(node_name) {
            Some(node) => match util::node_id_from_node(&self.driver, &node) {
                Ok(id) => return Ok(id),
                Err(e) => e,
            },
            None => AttacherError::not_found("node", node_name),
        };
        if let Some(id) = va.and_then(|va| va.annotations().get(VA_NODE_ID_ANNOTATION)) {
            debug!(node = node_name, "using node ID cached on the volume attachment");
            return Ok(id.clone());
        }
        Err(err)
    }

    async fn load_secrets(&self, pv: &PersistentVolume) -> Result<Secrets> {
        let Some(secret_ref) = util::publish_secret_ref(pv) else {
            return Ok(Secrets::new());
        };
        let namespace = secret_ref.namespace.as_deref().unwrap_or_default();
        let name = secret_ref.name.as_deref().unwrap_or_default();
        match self.cluster.secret(namespace, name).await? {
            Some(secret) => Ok(util::secret_data(&secret)),
            None => Err(AttacherError::not_found(
                "secret",
                format!("{namespace}/{name}"),
            )),
        }
    }

    /// Save `err` on the VA status and hand it back.
    ///
    /// A failure to save is only logged; the caller retries either way.
    async fn record(
        &self,
        op: Operation,
        va: &VolumeAttachment,
        err: AttacherError,
    ) -> AttacherError {
        let mut new = va.clone();
        let status = new.status.get_or_insert_with(Default::default);
        let record = Some(volume_error(err.to_string()));
        match op {
            Operation::Attach => status.attach_error = record,
            Operation::Detach => status.detach_error = record,
        }
        if let Err(e) = self.cluster.patch_volume_attachment_status(va, &new).await {
            warn!(error = %e, "failed to save error on volume attachment");
        }
        err
    }

    async fn sync_pv(&self, pv: &PersistentVolume) -> Result<()> {
        if !util::has_finalizer(pv, &self.finalizer) {
            return Ok(());
        }
        if pv.metadata.deletion_timestamp.is_none() && util::pv_owned_by(pv, &self.driver) {
            return Ok(());
        }
        let name = pv.name_any();
        if let Some(va) = self
            .cluster
            .volume_attachments()
            .into_iter()
            .find(|va| util::va_pv_name(va) == Some(name.as_str()) && util::is_attached(va))
        {
            debug!(va = %va.name_any(), "volume still attached; keeping finalizer");
            return Ok(());
        }
        let mut new = pv.clone();
        util::remove_finalizer(&mut new, &self.finalizer);
        self.cluster.patch_persistent_volume(pv, &new).await?;
        info!("removed finalizer from persistent volume");
        Ok(())
    }

    /// Mark attachments the driver no longer publishes as detached.
    async fn reconcile_published(&self, published: &PublishedVolumes) {
        for va in self.cluster.volume_attachments() {
            if va.spec.attacher != self.driver
                || !util::is_attached(&va)
                || va.metadata.deletion_timestamp.is_some()
            {
                continue;
            }
            let Some(pv) = util::va_pv_name(&va).and_then(|n| self.cluster.persistent_volume(n))
            else {
                continue;
            };
            let Ok((volume_id, _)) = util::volume_handle(&pv) else {
                continue;
            };
            let Ok(node_id) = self.resolve_node_id(&va.spec.node_name, Some(&va)) else {
                continue;
            };
            if published
                .get(&volume_id)
                .is_some_and(|nodes| nodes.contains(&node_id))
            {
                continue;
            }

            info!(va = %va.name_any(), volume = %volume_id, node = %node_id,
                "volume is no longer published on its node; marking as detached");
            let mut new = (*va).clone();
            if let Some(status) = new.status.as_mut() {
                status.attached = false;
            }
            if let Err(e) = self.cluster.patch_volume_attachment_status(&va, &new).await {
                warn!(va = %va.name_any(), error = %e, "failed to mark volume attachment as detached");
            }
        }
    }
}

#[async_trait]
impl Handler for CsiHandler {
    fn init(&self, va_queue: WorkQueue, pv_queue: WorkQueue) {
        set_queues(&self.queues, va_queue, pv_queue);
    }

    #[instrument(skip_all, fields(va = %va.name_any()))]
    async fn sync_volume_attachment(&self, va: Arc<VolumeAttachment>) -> Result<()> {
        if va.spec.attacher != self.driver {
            debug!(attacher = %va.spec.attacher, "volume attachment belongs to another driver");
            return Ok(());
        }
        let queue = &queues(&self.queues)?.va;
        let name = va.name_any();
        let result = if va.metadata.deletion_timestamp.is_some() {
            self.sync_detach(&va).await
        } else {
            self.sync_attach(&va).await
        };
        match &result {
            Ok(()) => queue.forget(&name),
            Err(e) => {
                warn!(error = %e, "volume attachment sync failed; retrying");
                queue.add_rate_limited(name);
            }
        }
        result
    }

    #[instrument(skip_all, fields(pv = %pv.name_any()))]
    async fn sync_persistent_volume(&self, pv: Arc<PersistentVolume>) -> Result<()> {
        let queue = &queues(&self.queues)?.pv;
        let name = pv.name_any();
        let result = self.sync_pv(&pv).await;
        match &result {
            Ok(()) => queue.forget(&name),
            Err(e) => {
                warn!(error = %e, "persistent volume sync failed; retrying");
                queue.add_rate_limited(name);
            }
        }
        result
    }

    #[instrument(skip(self))]
    async fn reconcile_va(&self) -> Result<()> {
        let queues = queues(&self.queues)?;
        let mut result = Ok(());
        if self.list_published {
            match self.attacher.list_volumes().await {
                Ok(published) => self.reconcile_published(&published).await,
                Err(e) => {
                    warn!(error = %e, "failed to list published volumes");
                    result = Err(e.into());
                }
            }
        }
        for va in self.cluster.volume_attachments() {
            queues.va.add(va.name_any());
        }
        for pv in self.cluster.persistent_volumes() {
            queues.pv.add(pv.name_any());
        }
        result
    }
}
