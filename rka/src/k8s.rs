//! [`Cluster`](crate::store::Cluster) backed by kube-rs reflectors and merge patches.
//!
//! One watcher per object kind feeds a reflector store.  VolumeAttachment
//! and PersistentVolume watchers also turn every change into an
//! [`ObjectEvent`] for the controller; Node and CSINode are only cached.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, Secret};
use k8s_openapi::api::storage::v1::{CSINode, VolumeAttachment};
use kube::api::{Patch, PatchParams};
use kube::client::ClientBuilder;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::RateLimitLayer;
use tracing::{debug, info, warn};

use crate::controller::Events;
use crate::error::{AttacherError, Result};
use crate::store::{Listers, ObjectClient, ObjectEvent};
use crate::util;

const FIELD_MANAGER: &str = "external-attacher";
const EVENT_BUFFER: usize = 1024;

/// Client-side limit on API requests: `requests` may start within any
/// window of `per`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiRate {
    pub requests: u64,
    pub per: Duration,
}

impl ApiRate {
    /// `burst` requests back to back, `qps` per second on average.
    pub fn new(qps: f32, burst: u32) -> Self {
        let requests = u64::from(burst.max(1));
        let per = Duration::try_from_secs_f64(requests as f64 / f64::from(qps))
            .unwrap_or(Duration::MAX)
            .max(Duration::from_nanos(1));
        Self { requests, per }
    }

    pub fn layer(&self) -> RateLimitLayer {
        RateLimitLayer::new(self.requests, self.per)
    }
}

/// Build an API client whose requests are throttled to `rate`.
pub fn client(config: kube::Config, rate: ApiRate) -> Result<Client> {
    info!(
        cluster = %config.cluster_url,
        requests = rate.requests,
        per = ?rate.per,
        "connecting to kubernetes API"
    );
    Ok(ClientBuilder::try_from(config)?
        .with_layer(&rate.layer())
        .build())
}

pub struct KubeCluster {
    client: Client,
    params: PatchParams,
    vas: Store<VolumeAttachment>,
    pvs: Store<PersistentVolume>,
    nodes: Store<Node>,
    csi_nodes: Store<CSINode>,
}

impl KubeCluster {
    /// Start the watchers.  They stop when `cancel` fires.
    pub fn start(client: Client, cancel: &CancellationToken) -> (Arc<Self>, Events) {
        let (va_tx, va_rx) = mpsc::channel(EVENT_BUFFER);
        let (pv_tx, pv_rx) = mpsc::channel(EVENT_BUFFER);
        let cluster = Self {
            vas: spawn_informer(Api::all(client.clone()), Some(va_tx), cancel.clone()),
            pvs: spawn_informer(Api::all(client.clone()), Some(pv_tx), cancel.clone()),
            nodes: spawn_informer(Api::all(client.clone()), None, cancel.clone()),
            csi_nodes: spawn_informer(Api::all(client.clone()), None, cancel.clone()),
            params: PatchParams {
                field_manager: Some(FIELD_MANAGER.to_owned()),
                ..Default::default()
            },
            client,
        };
        let events = Events {
            volume_attachments: va_rx,
            persistent_volumes: pv_rx,
        };
        (Arc::new(cluster), events)
    }
}

fn spawn_informer<K>(
    api: Api<K>,
    events: Option<mpsc::Sender<ObjectEvent<K>>>,
    cancel: CancellationToken,
) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (reader, mut writer) = reflector::store();
    let cache = reader.clone();
    tokio::spawn(async move {
        let kind = K::kind(&()).to_string();
        let mut stream = watch(api).boxed();
        let mut listed = Vec::new();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        warn!(%kind, error = %e, "watch failed; retrying");
                        continue;
                    }
                    None => break,
                },
            };

            let notifications = match &event {
                Event::Apply(obj) => {
                    let new = Arc::new(obj.clone());
                    vec![match cache.get(&ObjectRef::from_obj(obj)) {
                        Some(old) => ObjectEvent::Updated { old, new },
                        None => ObjectEvent::Added(new),
                    }]
                }
                Event::Delete(obj) => vec![ObjectEvent::Deleted(Arc::new(obj.clone()))],
                Event::Init => {
                    listed.clear();
                    Vec::new()
                }
                Event::InitApply(obj) => {
                    listed.push(obj.clone());
                    Vec::new()
                }
                Event::InitDone => {
                    debug!(%kind, objects = listed.len(), "listed");
                    relist_events(cache.state(), std::mem::take(&mut listed))
                }
            };
            writer.apply_watcher_event(&event);

            if let Some(tx) = &events {
                for notification in notifications {
                    if tx.send(notification).await.is_err() {
                        return;
                    }
                }
            }
        }
        debug!(%kind, "watch stopped");
    });
    reader
}

fn watch<K>(api: Api<K>) -> impl futures::Stream<Item = std::result::Result<Event<K>, watcher::Error>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher::watcher(api, watcher::Config::default()).default_backoff()
}

/// Changes between the cache and a fresh listing.
fn relist_events<K>(cached: Vec<Arc<K>>, listed: Vec<K>) -> Vec<ObjectEvent<K>>
where
    K: Resource<DynamicType = ()> + Clone,
{
    let mut previous: HashMap<ObjectRef<K>, Arc<K>> = cached
        .into_iter()
        .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
        .collect();
    let mut out = Vec::with_capacity(listed.len());
    for obj in listed {
        let new = Arc::new(obj);
        match previous.remove(&ObjectRef::from_obj(new.as_ref())) {
            Some(old) => out.push(ObjectEvent::Updated { old, new }),
            None => out.push(ObjectEvent::Added(new)),
        }
    }
    out.extend(previous.into_values().map(ObjectEvent::Deleted));
    out
}

fn api_error(err: kube::Error, name: &str) -> AttacherError {
    match err {
        kube::Error::Api(response) if response.code == 409 => {
            AttacherError::Conflict(name.to_owned())
        }
        other => other.into(),
    }
}

async fn wait_ready<K>(store: &Store<K>, kind: &'static str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store
        .wait_until_ready()
        .await
        .map_err(|_| AttacherError::CacheSync(kind))
}

#[async_trait]
impl Listers for KubeCluster {
    async fn wait_for_cache_sync(&self) -> Result<()> {
        wait_ready(&self.vas, "volumeattachment").await?;
        wait_ready(&self.pvs, "persistentvolume").await?;
        wait_ready(&self.nodes, "node").await?;
        wait_ready(&self.csi_nodes, "csinode").await
    }

    fn volume_attachment(&self, name: &str) -> Option<Arc<VolumeAttachment>> {
        self.vas.get(&ObjectRef::new(name))
    }

    fn volume_attachments(&self) -> Vec<Arc<VolumeAttachment>> {
        self.vas.state()
    }

    fn persistent_volume(&self, name: &str) -> Option<Arc<PersistentVolume>> {
        self.pvs.get(&ObjectRef::new(name))
    }

    fn persistent_volumes(&self) -> Vec<Arc<PersistentVolume>> {
        self.pvs.state()
    }

    fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(&ObjectRef::new(name))
    }

    fn csi_node(&self, name: &str) -> Option<Arc<CSINode>> {
        self.csi_nodes.get(&ObjectRef::new(name))
    }
}

#[async_trait]
impl ObjectClient for KubeCluster {
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_volume_attachment(
        &self,
        old: &VolumeAttachment,
        new: &VolumeAttachment,
    ) -> Result<VolumeAttachment> {
        let name = old.name_any();
        let patch = util::merge_patch(old, new)?;
        let api: Api<VolumeAttachment> = Api::all(self.client.clone());
        api.patch(&name, &self.params, &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error(e, &name))
    }

    async fn patch_volume_attachment_status(
        &self,
        old: &VolumeAttachment,
        new: &VolumeAttachment,
    ) -> Result<VolumeAttachment> {
        let name = old.name_any();
        let patch = util::merge_patch(old, new)?;
        let api: Api<VolumeAttachment> = Api::all(self.client.clone());
        api.patch_status(&name, &self.params, &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error(e, &name))
    }

    async fn patch_persistent_volume(
        &self,
        old: &PersistentVolume,
        new: &PersistentVolume,
    ) -> Result<PersistentVolume> {
        let name = old.name_any();
        let patch = util::merge_patch(old, new)?;
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.patch(&name, &self.params, &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error(e, &name))
    }
}
