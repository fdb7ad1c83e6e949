//! Event intake and the worker pools driving the handler.
//!
//! Watch events are turned into queue keys; `worker_threads` workers per
//! queue take keys off the queues and call the handler with the current
//! cached object.  The queues serialize work per key, so the handler never
//! sees the same object on two workers at once.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::AttacherConfig;
use crate::error::Result;
use crate::handler::Handler;
use crate::metrics;
use crate::queue::WorkQueue;
use crate::store::{Cluster, ObjectEvent};
use crate::util;

/// Event streams the controller consumes.
pub struct Events {
    pub volume_attachments: mpsc::Receiver<ObjectEvent<VolumeAttachment>>,
    pub persistent_volumes: mpsc::Receiver<ObjectEvent<PersistentVolume>>,
}

pub struct Controller {
    driver: String,
    cluster: Arc<dyn Cluster>,
    handler: Arc<dyn Handler>,
    va_queue: WorkQueue,
    pv_queue: WorkQueue,
    workers: usize,
    resync: Duration,
    reconcile_sync: Duration,
}

impl Controller {
    pub fn new(
        driver: &str,
        cluster: Arc<dyn Cluster>,
        handler: Arc<dyn Handler>,
        config: &AttacherConfig,
    ) -> Self {
        let start = config.retry_interval_start;
        let max = config.retry_interval_max;
        Self {
            driver: driver.to_owned(),
            cluster,
            handler,
            va_queue: WorkQueue::new("volumeattachment", start, max),
            pv_queue: WorkQueue::new("persistentvolume", start, max),
            workers: config.worker_threads,
            resync: config.resync,
            reconcile_sync: config.reconcile_sync,
        }
    }

    /// Run until `cancel` fires or both event streams end.
    ///
    /// Workers start only after every cache has synced.  On shutdown the
    /// queues are closed and in-flight work is allowed to finish.
    pub async fn run(self: Arc<Self>, mut events: Events, cancel: CancellationToken) -> Result<()> {
        self.handler
            .init(self.va_queue.clone(), self.pv_queue.clone());

        info!(driver = %self.driver, "waiting for caches to sync");
        tokio::select! {
            synced = self.cluster.wait_for_cache_sync() => synced?,
            _ = cancel.cancelled() => return Ok(()),
        }
        info!(workers = self.workers, "caches synced, starting workers");

        let background = cancel.child_token();
        let mut tasks = JoinSet::new();
        for _ in 0..self.workers {
            let controller = self.clone();
            tasks.spawn(async move { while controller.process_next_va().await {} });
            let controller = self.clone();
            tasks.spawn(async move { while controller.process_next_pv().await {} });
        }
        if !self.resync.is_zero() {
            tasks.spawn(self.clone().resync_loop(background.clone()));
        }
        if !self.reconcile_sync.is_zero() {
            tasks.spawn(self.clone().reconcile_loop(background.clone()));
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = events.volume_attachments.recv() => self.handle_va_event(event),
                Some(event) = events.persistent_volumes.recv() => self.handle_pv_event(event),
                else => {
                    warn!("event streams closed");
                    break;
                }
            }
        }

        info!("shutting down workers");
        self.va_queue.shut_down();
        self.pv_queue.shut_down();
        background.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker task failed");
            }
        }
        Ok(())
    }

    pub fn handle_va_event(&self, event: ObjectEvent<VolumeAttachment>) {
        match event {
            ObjectEvent::Added(va) => self.va_queue.add(va.name_any()),
            ObjectEvent::Updated { old, new } => {
                if util::should_enqueue_va_change(&old, &new) {
                    self.va_queue.add(new.name_any());
                } else {
                    trace!(va = %new.name_any(), "ignoring status-only update");
                }
            }
            ObjectEvent::Deleted(va) => {
                // The PV may be waiting for its last attachment to go away.
                if let Some(pv) = util::va_pv_name(&va) {
                    self.pv_queue.add(pv.to_owned());
                }
            }
        }
    }

    pub fn handle_pv_event(&self, event: ObjectEvent<PersistentVolume>) {
        match event {
            ObjectEvent::Added(pv) | ObjectEvent::Updated { new: pv, .. } => {
                self.pv_queue.add(pv.name_any())
            }
            ObjectEvent::Deleted(_) => {}
        }
    }

    /// Queue every cached VolumeAttachment and PersistentVolume.
    pub fn resync(&self) {
        for va in self.cluster.volume_attachments() {
            self.va_queue.add(va.name_any());
        }
        for pv in self.cluster.persistent_volumes() {
            self.pv_queue.add(pv.name_any());
        }
    }

    /// Process one VolumeAttachment key.  `false` once the queue shut down.
    async fn process_next_va(&self) -> bool {
        let Some(name) = self.va_queue.get().await else {
            return false;
        };
        let result = self.sync_va(&name).await;
        metrics::record_reconcile(self.va_queue.name(), result.is_ok());
        self.va_queue.done(&name);
        metrics::set_queue_depth(self.va_queue.name(), self.va_queue.len());
        true
    }

    async fn process_next_pv(&self) -> bool {
        let Some(name) = self.pv_queue.get().await else {
            return false;
        };
        let result = self.sync_pv(&name).await;
        metrics::record_reconcile(self.pv_queue.name(), result.is_ok());
        self.pv_queue.done(&name);
        metrics::set_queue_depth(self.pv_queue.name(), self.pv_queue.len());
        true
    }

    async fn sync_va(&self, name: &str) -> Result<()> {
        let Some(va) = self.cluster.volume_attachment(name) else {
            debug!(va = %name, "volume attachment deleted");
            self.va_queue.forget(&name.to_owned());
            return Ok(());
        };
        if va.spec.attacher != self.driver {
            trace!(va = %name, attacher = %va.spec.attacher, "skipping attachment of another driver");
            return Ok(());
        }
        self.handler.sync_volume_attachment(va).await
    }

    async fn sync_pv(&self, name: &str) -> Result<()> {
        let Some(pv) = self.cluster.persistent_volume(name) else {
            debug!(pv = %name, "persistent volume deleted");
            self.pv_queue.forget(&name.to_owned());
            return Ok(());
        };
        self.handler.sync_persistent_volume(pv).await
    }

    async fn resync_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.resync, self.resync);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    debug!("periodic resync");
                    self.resync();
                }
            }
        }
    }

    async fn reconcile_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.reconcile_sync, self.reconcile_sync);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.handler.reconcile_va().await {
                        warn!(error = %e, "volume attachment reconciliation failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use k8s_openapi::api::storage::v1::VolumeAttachmentStatus;
    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::handler::CsiHandler;
    use crate::testing::{DRIVER, FakeAttacher, FakeCluster, node, pv, va};

    /// Counts VA syncs and parks each one until the test releases it.
    struct GatedHandler {
        calls: AtomicUsize,
        entered: Notify,
        gate: Semaphore,
    }

    impl GatedHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                entered: Notify::new(),
                gate: Semaphore::new(0),
            })
        }
    }

    #[async_trait]
    impl Handler for GatedHandler {
        fn init(&self, _va_queue: WorkQueue, _pv_queue: WorkQueue) {}

        async fn sync_volume_attachment(&self, _va: Arc<VolumeAttachment>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.gate.acquire().await.unwrap().forget();
            Ok(())
        }

        async fn sync_persistent_volume(&self, _pv: Arc<PersistentVolume>) -> Result<()> {
            Ok(())
        }

        async fn reconcile_va(&self) -> Result<()> {
            Ok(())
        }
    }

    fn controller(cluster: Arc<FakeCluster>, handler: Arc<dyn Handler>) -> Arc<Controller> {
        let config = AttacherConfig {
            worker_threads: 2,
            ..Default::default()
        };
        Arc::new(Controller::new(DRIVER, cluster, handler, &config))
    }

    fn cluster_with_va() -> Arc<FakeCluster> {
        let cluster = FakeCluster::new();
        cluster.insert_pv(pv("pv-1", "vol-1"));
        cluster.insert_va(va("va-1", "pv-1", "node-1"));
        cluster.insert_node(node("node-1", "node-id-1"));
        cluster
    }

    #[tokio::test]
    async fn burst_of_events_during_sync_runs_once_more() {
        let cluster = cluster_with_va();
        let handler = GatedHandler::new();
        let controller = controller(cluster.clone(), handler.clone());
        let stored = Arc::new(cluster.stored_va("va-1").unwrap());

        controller.handle_va_event(ObjectEvent::Added(stored.clone()));
        let worker = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller.process_next_va().await;
                controller.process_next_va().await;
            })
        };
        handler.entered.notified().await;

        for _ in 0..5 {
            controller.handle_va_event(ObjectEvent::Added(stored.clone()));
        }
        assert_eq!(controller.va_queue.len(), 0);

        handler.gate.add_permits(2);
        worker.await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(controller.va_queue.is_empty());
    }

    #[tokio::test]
    async fn attachments_of_other_drivers_are_not_dispatched() {
        let cluster = FakeCluster::new();
        let mut foreign = va("va-2", "pv-2", "node-1");
        foreign.spec.attacher = "other.example.com".into();
        cluster.insert_va(foreign);
        let handler = GatedHandler::new();
        let controller = controller(cluster.clone(), handler.clone());

        controller.va_queue.add("va-2".into());
        assert!(controller.process_next_va().await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(cluster.writes().is_empty());
    }

    #[tokio::test]
    async fn deleted_attachment_key_is_dropped() {
        let cluster = FakeCluster::new();
        let handler = GatedHandler::new();
        let controller = controller(cluster, handler.clone());

        controller.va_queue.add("gone".into());
        assert!(controller.process_next_va().await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn status_only_updates_are_filtered() {
        let cluster = cluster_with_va();
        let controller = controller(cluster.clone(), GatedHandler::new());
        let old = cluster.stored_va("va-1").unwrap();

        let mut errored = old.clone();
        errored.status = Some(VolumeAttachmentStatus {
            attach_error: Some(crate::handler::volume_error("rpc failed".into())),
            ..Default::default()
        });
        controller.handle_va_event(ObjectEvent::Updated {
            old: Arc::new(old.clone()),
            new: Arc::new(errored),
        });
        assert!(controller.va_queue.is_empty());

        let mut deleting = old.clone();
        deleting.metadata.finalizers = Some(vec![util::finalizer_name(DRIVER)]);
        controller.handle_va_event(ObjectEvent::Updated {
            old: Arc::new(old),
            new: Arc::new(deleting),
        });
        assert_eq!(controller.va_queue.len(), 1);
    }

    #[test]
    fn deleted_attachment_queues_its_volume() {
        let cluster = cluster_with_va();
        let controller = controller(cluster.clone(), GatedHandler::new());
        let gone = Arc::new(cluster.stored_va("va-1").unwrap());

        controller.handle_va_event(ObjectEvent::Deleted(gone));
        assert!(controller.va_queue.is_empty());
        assert_eq!(controller.pv_queue.len(), 1);

        controller.handle_pv_event(ObjectEvent::Deleted(Arc::new(pv("pv-9", "vol-9"))));
        assert_eq!(controller.pv_queue.len(), 1);
    }

    #[test]
    fn resync_queues_everything() {
        let cluster = cluster_with_va();
        cluster.insert_pv(pv("pv-2", "vol-2"));
        let controller = controller(cluster, GatedHandler::new());

        controller.resync();
        assert_eq!(controller.va_queue.len(), 1);
        assert_eq!(controller.pv_queue.len(), 2);
    }

    #[tokio::test]
    async fn run_attaches_until_cancelled() {
        let cluster = cluster_with_va();
        let attacher = FakeAttacher::new();
        let handler = Arc::new(CsiHandler::new(DRIVER, cluster.clone(), attacher.clone()));
        let controller = controller(cluster.clone(), handler);

        let (va_tx, va_rx) = mpsc::channel(16);
        let (_pv_tx, pv_rx) = mpsc::channel(16);
        let events = Events {
            volume_attachments: va_rx,
            persistent_volumes: pv_rx,
        };
        let cancel = CancellationToken::new();
        let run = tokio::spawn(controller.run(events, cancel.clone()));

        let stored = Arc::new(cluster.stored_va("va-1").unwrap());
        va_tx.send(ObjectEvent::Added(stored)).await.unwrap();

        let mut attached = false;
        for _ in 0..200 {
            if util::is_attached(&cluster.stored_va("va-1").unwrap()) {
                attached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(attached, "volume attachment was never marked attached");
        assert_eq!(attacher.attach_calls().len(), 1);

        cancel.cancel();
        run.await.unwrap().unwrap();
    }
}
