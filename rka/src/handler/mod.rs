//! Reconciliation of VolumeAttachments and PersistentVolumes.
//!
//! [`CsiHandler`] drives attach and detach through the driver.  Drivers
//! without `PUBLISH_UNPUBLISH_VOLUME` get the [`TrivialHandler`], which only
//! records attachments.  The choice is made once at startup.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::{VolumeAttachment, VolumeError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::error::{AttacherError, Result};
use crate::queue::WorkQueue;

mod csi;
mod trivial;

pub use csi::CsiHandler;
pub use trivial::TrivialHandler;

/// The two queues a handler schedules retries on.
#[derive(Clone)]
pub struct Queues {
    pub va: WorkQueue,
    pub pv: WorkQueue,
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Hand the handler the queues it reschedules work on.  Called once.
    fn init(&self, va_queue: WorkQueue, pv_queue: WorkQueue);

    /// Reconcile one VolumeAttachment addressed to this driver.
    ///
    /// Failures are recorded and the key is rescheduled before returning.
    async fn sync_volume_attachment(&self, va: Arc<VolumeAttachment>) -> Result<()>;

    async fn sync_persistent_volume(&self, pv: Arc<PersistentVolume>) -> Result<()>;

    /// Periodic sweep over every known VolumeAttachment.
    async fn reconcile_va(&self) -> Result<()>;
}

pub(crate) fn queues(cell: &OnceLock<Queues>) -> Result<&Queues> {
    cell.get()
        .ok_or_else(|| AttacherError::Config("handler used before init".into()))
}

pub(crate) fn set_queues(cell: &OnceLock<Queues>, va: WorkQueue, pv: WorkQueue) {
    if cell.set(Queues { va, pv }).is_err() {
        tracing::warn!("handler initialised twice; keeping the first queues");
    }
}

pub(crate) fn volume_error(message: String) -> VolumeError {
    VolumeError {
        message: Some(message),
        time: Some(Time(Utc::now())),
        ..Default::default()
    }
}
