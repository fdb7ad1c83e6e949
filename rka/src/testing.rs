//! In-memory cluster and driver used by the handler and controller tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, Node, PersistentVolume, PersistentVolumeSpec, Secret,
};
use k8s_openapi::api::storage::v1::{
    CSINode, CSINodeDriver, CSINodeSpec, VolumeAttachment, VolumeAttachmentSource,
    VolumeAttachmentSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use libcsi::{AttachRequest, Attacher, CsiError, PublishContext, PublishedVolumes, Secrets};

use crate::error::{AttacherError, Result};
use crate::queue::WorkQueue;
use crate::store::{Listers, ObjectClient};
use crate::util::NODE_ID_ANNOTATION;

pub const DRIVER: &str = "csi.example.com";

pub fn pv(name: &str, handle: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            csi: Some(CSIPersistentVolumeSource {
                driver: DRIVER.into(),
                volume_handle: handle.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn va(name: &str, pv_name: &str, node_name: &str) -> VolumeAttachment {
    VolumeAttachment {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        spec: VolumeAttachmentSpec {
            attacher: DRIVER.into(),
            node_name: node_name.into(),
            source: VolumeAttachmentSource {
                persistent_volume_name: Some(pv_name.into()),
                inline_volume_spec: None,
            },
        },
        status: None,
    }
}

pub fn node(name: &str, node_id: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            annotations: Some(BTreeMap::from([(
                NODE_ID_ANNOTATION.to_string(),
                serde_json::json!({ DRIVER: node_id }).to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn csi_node(name: &str, node_id: &str) -> CSINode {
    CSINode {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        spec: CSINodeSpec {
            drivers: vec![CSINodeDriver {
                name: DRIVER.into(),
                node_id: node_id.into(),
                ..Default::default()
            }],
        },
    }
}

pub fn secret(namespace: &str, name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// VA and PV queues with a backoff long enough to never fire during a test.
pub fn queues() -> (WorkQueue, WorkQueue) {
    let start = Duration::from_secs(60);
    let max = Duration::from_secs(600);
    (
        WorkQueue::new("volumeattachment", start, max),
        WorkQueue::new("persistentvolume", start, max),
    )
}

/// One successful write, holding the object as stored afterwards.
#[derive(Debug, Clone)]
pub enum Write {
    VolumeAttachment(VolumeAttachment),
    VolumeAttachmentStatus(VolumeAttachment),
    PersistentVolume(PersistentVolume),
}

#[derive(Default)]
struct Objects {
    vas: BTreeMap<String, VolumeAttachment>,
    pvs: BTreeMap<String, PersistentVolume>,
    nodes: BTreeMap<String, Node>,
    csi_nodes: BTreeMap<String, CSINode>,
    secrets: BTreeMap<(String, String), Secret>,
    writes: Vec<Write>,
    conflicts: usize,
    /// Attempted writes since `fail_write`, and which of them fails.
    attempts: usize,
    fail_at: Option<usize>,
    version: u64,
}

impl Objects {
    fn bump(&mut self, meta: &mut ObjectMeta) {
        self.version += 1;
        meta.resource_version = Some(self.version.to_string());
    }

    fn check(&mut self, name: &str, stored: Option<&str>, given: Option<&str>) -> Result<()> {
        self.attempts += 1;
        if self.fail_at == Some(self.attempts) {
            return Err(AttacherError::Conflict(name.to_owned()));
        }
        if self.conflicts > 0 {
            self.conflicts -= 1;
            return Err(AttacherError::Conflict(name.to_owned()));
        }
        if stored != given {
            return Err(AttacherError::Conflict(name.to_owned()));
        }
        Ok(())
    }
}

/// Object store with resourceVersion checks whose caches are always in sync.
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<Objects>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_va(&self, mut va: VolumeAttachment) {
        let mut objects = self.objects.lock().unwrap();
        objects.bump(&mut va.metadata);
        objects.vas.insert(va.name_any(), va);
    }

    pub fn insert_pv(&self, mut pv: PersistentVolume) {
        let mut objects = self.objects.lock().unwrap();
        objects.bump(&mut pv.metadata);
        objects.pvs.insert(pv.name_any(), pv);
    }

    pub fn insert_node(&self, node: Node) {
        let mut objects = self.objects.lock().unwrap();
        objects.nodes.insert(node.name_any(), node);
    }

    pub fn insert_csi_node(&self, csi_node: CSINode) {
        let mut objects = self.objects.lock().unwrap();
        objects.csi_nodes.insert(csi_node.name_any(), csi_node);
    }

    pub fn insert_secret(&self, secret: Secret) {
        let key = (secret.namespace().unwrap_or_default(), secret.name_any());
        self.objects.lock().unwrap().secrets.insert(key, secret);
    }

    pub fn remove_pv(&self, name: &str) {
        self.objects.lock().unwrap().pvs.remove(name);
    }

    pub fn remove_node(&self, name: &str) {
        self.objects.lock().unwrap().nodes.remove(name);
    }

    pub fn stored_va(&self, name: &str) -> Option<VolumeAttachment> {
        self.objects.lock().unwrap().vas.get(name).cloned()
    }

    pub fn stored_pv(&self, name: &str) -> Option<PersistentVolume> {
        self.objects.lock().unwrap().pvs.get(name).cloned()
    }

    /// Make the next `n` writes fail with a conflict.
    pub fn fail_with_conflicts(&self, n: usize) {
        self.objects.lock().unwrap().conflicts = n;
    }

    /// Make only the `n`th write from now (counting from 1) fail with a conflict.
    pub fn fail_write(&self, n: usize) {
        let mut objects = self.objects.lock().unwrap();
        objects.attempts = 0;
        objects.fail_at = Some(n);
    }

    pub fn writes(&self) -> Vec<Write> {
        self.objects.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.objects.lock().unwrap().writes.clear();
    }
}

#[async_trait]
impl Listers for FakeCluster {
    async fn wait_for_cache_sync(&self) -> Result<()> {
        Ok(())
    }

    fn volume_attachment(&self, name: &str) -> Option<Arc<VolumeAttachment>> {
        self.stored_va(name).map(Arc::new)
    }

    fn volume_attachments(&self) -> Vec<Arc<VolumeAttachment>> {
        let objects = self.objects.lock().unwrap();
        objects.vas.values().cloned().map(Arc::new).collect()
    }

    fn persistent_volume(&self, name: &str) -> Option<Arc<PersistentVolume>> {
        self.stored_pv(name).map(Arc::new)
    }

    fn persistent_volumes(&self) -> Vec<Arc<PersistentVolume>> {
        let objects = self.objects.lock().unwrap();
        objects.pvs.values().cloned().map(Arc::new).collect()
    }

    fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.objects.lock().unwrap().nodes.get(name).cloned().map(Arc::new)
    }

    fn csi_node(&self, name: &str) -> Option<Arc<CSINode>> {
        let objects = self.objects.lock().unwrap();
        objects.csi_nodes.get(name).cloned().map(Arc::new)
    }
}

#[async_trait]
impl ObjectClient for FakeCluster {
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .secrets
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned())
    }

    async fn patch_volume_attachment(
        &self,
        old: &VolumeAttachment,
        new: &VolumeAttachment,
    ) -> Result<VolumeAttachment> {
        let name = old.name_any();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .vas
            .get(&name)
            .cloned()
            .ok_or_else(|| AttacherError::not_found("volumeattachment", &name))?;
        objects.check(
            &name,
            stored.resource_version().as_deref(),
            old.resource_version().as_deref(),
        )?;
        let mut updated = new.clone();
        updated.status = stored.status;
        objects.bump(&mut updated.metadata);
        objects.writes.push(Write::VolumeAttachment(updated.clone()));
        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            objects.vas.remove(&name);
        } else {
            objects.vas.insert(name, updated.clone());
        }
        Ok(updated)
    }

    async fn patch_volume_attachment_status(
        &self,
        old: &VolumeAttachment,
        new: &VolumeAttachment,
    ) -> Result<VolumeAttachment> {
        let name = old.name_any();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .vas
            .get(&name)
            .cloned()
            .ok_or_else(|| AttacherError::not_found("volumeattachment", &name))?;
        objects.check(
            &name,
            stored.resource_version().as_deref(),
            old.resource_version().as_deref(),
        )?;
        let mut updated = stored;
        updated.status = new.status.clone();
        objects.bump(&mut updated.metadata);
        objects.writes.push(Write::VolumeAttachmentStatus(updated.clone()));
        objects.vas.insert(name, updated.clone());
        Ok(updated)
    }

    async fn patch_persistent_volume(
        &self,
        old: &PersistentVolume,
        new: &PersistentVolume,
    ) -> Result<PersistentVolume> {
        let name = old.name_any();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .pvs
            .get(&name)
            .cloned()
            .ok_or_else(|| AttacherError::not_found("persistentvolume", &name))?;
        objects.check(
            &name,
            stored.resource_version().as_deref(),
            old.resource_version().as_deref(),
        )?;
        let mut updated = new.clone();
        updated.status = stored.status;
        objects.bump(&mut updated.metadata);
        objects.writes.push(Write::PersistentVolume(updated.clone()));
        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            objects.pvs.remove(&name);
        } else {
            objects.pvs.insert(name, updated.clone());
        }
        Ok(updated)
    }
}

#[derive(Default)]
struct DriverState {
    attach_results: VecDeque<std::result::Result<PublishContext, CsiError>>,
    detach_results: VecDeque<std::result::Result<(), CsiError>>,
    list_result: Option<std::result::Result<PublishedVolumes, CsiError>>,
    attach_calls: Vec<AttachRequest>,
    detach_calls: Vec<(String, String, Secrets)>,
    list_calls: usize,
}

/// Scripted [`Attacher`].  Unscripted calls succeed.
#[derive(Default)]
pub struct FakeAttacher {
    state: Mutex<DriverState>,
}

impl FakeAttacher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_attach(&self, result: std::result::Result<PublishContext, CsiError>) {
        self.state.lock().unwrap().attach_results.push_back(result);
    }

    pub fn push_detach(&self, result: std::result::Result<(), CsiError>) {
        self.state.lock().unwrap().detach_results.push_back(result);
    }

    pub fn set_published(&self, result: std::result::Result<PublishedVolumes, CsiError>) {
        self.state.lock().unwrap().list_result = Some(result);
    }

    pub fn attach_calls(&self) -> Vec<AttachRequest> {
        self.state.lock().unwrap().attach_calls.clone()
    }

    pub fn detach_calls(&self) -> Vec<(String, String, Secrets)> {
        self.state.lock().unwrap().detach_calls.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }
}

#[async_trait]
impl Attacher for FakeAttacher {
    async fn attach(&self, req: AttachRequest) -> std::result::Result<PublishContext, CsiError> {
        let mut state = self.state.lock().unwrap();
        state.attach_calls.push(req);
        state
            .attach_results
            .pop_front()
            .unwrap_or_else(|| Ok(PublishContext::new()))
    }

    async fn detach(
        &self,
        volume_id: &str,
        node_id: &str,
        secrets: Secrets,
    ) -> std::result::Result<(), CsiError> {
        let mut state = self.state.lock().unwrap();
        state
            .detach_calls
            .push((volume_id.to_owned(), node_id.to_owned(), secrets));
        state.detach_results.pop_front().unwrap_or(Ok(()))
    }

    async fn list_volumes(&self) -> std::result::Result<PublishedVolumes, CsiError> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        state
            .list_result
            .clone()
            .unwrap_or_else(|| Ok(PublishedVolumes::new()))
    }
}
