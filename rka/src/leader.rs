//! Leader election over a `coordination.k8s.io/v1` Lease.
//!
//! The Lease itself is acquired, renewed and released by
//! `kube-lease-manager`; this module turns its leadership channel into
//! "block until leading" and "fail once no longer leading".

use std::time::Duration;

use kube::Client;
use kube_lease_manager::{LeaseManager, LeaseManagerBuilder, LeaseManagerError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LeaderElectionConfig;
use crate::error::{AttacherError, Result};
use crate::util;

pub fn lease_name(driver: &str) -> String {
    format!("external-attacher-leader-{}", util::sanitize_driver_name(driver))
}

/// `<hostname>_<uuid>`, unique per process.
pub fn identity() -> String {
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned());
    format!("{host}_{}", uuid::Uuid::new_v4())
}

/// Lease duration and renewal grace in whole seconds.
///
/// The holder renews `grace` seconds before the lease expires, which is
/// `renew_deadline` after its previous renewal.
fn lease_timing(config: &LeaderElectionConfig) -> (u64, u64) {
    let duration = config.lease_duration.as_secs().max(2);
    let grace = config
        .lease_duration
        .saturating_sub(config.renew_deadline)
        .as_secs()
        .clamp(1, duration - 1);
    (duration, grace)
}

fn lease_error(err: LeaseManagerError) -> AttacherError {
    AttacherError::LeaderElection(err.to_string())
}

pub struct LeaderElector {
    client: Client,
    name: String,
    namespace: String,
    identity: String,
    config: LeaderElectionConfig,
}

impl LeaderElector {
    pub fn new(client: Client, driver: &str, config: LeaderElectionConfig) -> Self {
        Self {
            client,
            name: lease_name(driver),
            namespace: config.namespace(),
            identity: identity(),
            config,
        }
    }

    async fn manager(&self) -> Result<LeaseManager> {
        let (duration, grace) = lease_timing(&self.config);
        LeaseManagerBuilder::new(self.client.clone(), &self.name)
            .with_namespace(&self.namespace)
            .with_identity(&self.identity)
            .with_duration(duration)
            .with_grace(grace)
            .build()
            .await
            .map_err(lease_error)
    }

    /// Block until this process holds the lease.  `None` if cancelled first.
    pub async fn acquire(self, cancel: &CancellationToken) -> Result<Option<Leadership>> {
        info!(lease = %self.name, namespace = %self.namespace, identity = %self.identity, "attempting to acquire leader lease");
        let manager = loop {
            match self.manager().await {
                Ok(manager) => break manager,
                Err(e) => warn!(lease = %self.name, error = %e, "failed to set up leader lease"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        };

        let (leading, task) = manager.watch().await;
        let mut leadership = Leadership {
            name: self.name,
            leading,
            task,
        };
        if !wait_for_leadership(&mut leadership.leading, cancel).await? {
            leadership.release().await;
            return Ok(None);
        }
        info!(lease = %leadership.name, "became leader");
        Ok(Some(leadership))
    }
}

/// A held lease, renewed in the background until released.
pub struct Leadership {
    name: String,
    leading: watch::Receiver<bool>,
    task: JoinHandle<std::result::Result<LeaseManager, LeaseManagerError>>,
}

impl Leadership {
    /// Keep the lease until `cancel` fires, then release it.
    ///
    /// If the lease is lost first, `cancel` is cancelled and an error returned.
    pub async fn hold(mut self, cancel: CancellationToken) -> Result<()> {
        let lost = tokio::select! {
            _ = cancel.cancelled() => None,
            reason = wait_for_loss(&mut self.leading) => Some(reason),
        };
        match lost {
            None => {
                self.release().await;
                Ok(())
            }
            Some(reason) => {
                warn!(lease = %self.name, reason, "lost leadership");
                cancel.cancel();
                Err(AttacherError::LeaderElection(format!(
                    "lost lease {}: {reason}",
                    self.name
                )))
            }
        }
    }

    /// Closing the channel makes the manager hand the lease back.
    async fn release(self) {
        drop(self.leading);
        match self.task.await {
            Ok(Ok(_)) => info!(lease = %self.name, "released leader lease"),
            Ok(Err(e)) => warn!(lease = %self.name, error = %e, "failed to release lease"),
            Err(e) => warn!(lease = %self.name, error = %e, "lease task failed"),
        }
    }
}

/// `Ok(false)` if cancelled before leading.
async fn wait_for_leadership(
    leading: &mut watch::Receiver<bool>,
    cancel: &CancellationToken,
) -> Result<bool> {
    loop {
        if *leading.borrow_and_update() {
            return Ok(true);
        }
        debug!("lease held by another instance");
        tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            changed = leading.changed() => changed.map_err(|_| {
                AttacherError::LeaderElection("lease manager stopped".into())
            })?,
        }
    }
}

/// Resolves with a reason once `leading` stops reporting leadership.
async fn wait_for_loss(leading: &mut watch::Receiver<bool>) -> &'static str {
    loop {
        if leading.changed().await.is_err() {
            return "lease manager stopped";
        }
        if !*leading.borrow_and_update() {
            return "lease taken over or not renewed in time";
        }
    }
}
