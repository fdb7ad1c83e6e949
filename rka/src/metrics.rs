//! Prometheus metrics of the attacher.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use libcsi::{AttachRequest, Attacher, CsiError, PublishContext, PublishedVolumes, Secrets};
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CSI_RPC_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static QUEUE_DEPTH: OnceLock<IntGaugeVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("rka".to_string()), None)
            .expect("failed to initialise rka metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register rka metric collector");
    collector
}

fn csi_rpc_total() -> &'static IntCounterVec {
    CSI_RPC_TOTAL.get_or_init(|| {
        let opts = Opts::new("csi_rpc_total", "CSI calls grouped by method and result code");
        let counter = IntCounterVec::new(opts, &["method", "code"])
            .expect("failed to build csi rpc counter");
        register_collector(counter)
    })
}

fn reconciles_total() -> &'static IntCounterVec {
    RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "reconciles_total",
            "Work queue reconciliations grouped by queue and result",
        );
        let counter = IntCounterVec::new(opts, &["queue", "result"])
            .expect("failed to build reconcile counter");
        register_collector(counter)
    })
}

fn queue_depth() -> &'static IntGaugeVec {
    QUEUE_DEPTH.get_or_init(|| {
        let opts = Opts::new("queue_depth", "Keys waiting in a work queue");
        let gauge =
            IntGaugeVec::new(opts, &["queue"]).expect("failed to build queue depth gauge");
        register_collector(gauge)
    })
}

fn code_label(result: Result<(), &CsiError>) -> String {
    match result {
        Ok(()) => "OK".to_string(),
        Err(err) => match err.code() {
            Some(code) => format!("{code:?}"),
            None => "Transport".to_string(),
        },
    }
}

pub fn record_rpc(method: &str, result: Result<(), &CsiError>) {
    let code = code_label(result);
    csi_rpc_total()
        .with_label_values(&[method, code.as_str()])
        .inc();
}

pub fn record_reconcile(queue: &str, ok: bool) {
    let result = if ok { "success" } else { "error" };
    reconciles_total().with_label_values(&[queue, result]).inc();
}

pub fn set_queue_depth(queue: &str, depth: usize) {
    queue_depth()
        .with_label_values(&[queue])
        .set(i64::try_from(depth).unwrap_or(i64::MAX));
}

/// Render every registered metric in the Prometheus text format.
pub fn gather() -> Result<Vec<u8>, prometheus::Error> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

/// Counts every call an [`Attacher`] makes by method and result code.
pub struct MetricsAttacher<A: ?Sized> {
    inner: Arc<A>,
}

impl<A: Attacher + ?Sized> MetricsAttacher<A> {
    pub fn new(inner: Arc<A>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<A: Attacher + ?Sized> Attacher for MetricsAttacher<A> {
    async fn attach(&self, req: AttachRequest) -> Result<PublishContext, CsiError> {
        let result = self.inner.attach(req).await;
        record_rpc("ControllerPublishVolume", result.as_ref().map(|_| ()));
        result
    }

    async fn detach(
        &self,
        volume_id: &str,
        node_id: &str,
        secrets: Secrets,
    ) -> Result<(), CsiError> {
        let result = self.inner.detach(volume_id, node_id, secrets).await;
        record_rpc("ControllerUnpublishVolume", result.as_ref().map(|_| ()));
        result
    }

    async fn list_volumes(&self) -> Result<PublishedVolumes, CsiError> {
        let result = self.inner.list_volumes().await;
        record_rpc("ListVolumes", result.as_ref().map(|_| ()));
        result
    }
}
