//! CSI Identity service client trait.
//!
//! The Identity service allows callers to discover plugin metadata and check
//! plugin health.  Every CSI plugin must implement this service, and the
//! attacher talks to it before anything else.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::CsiError;
use crate::retry::{Backoff, ExponentialBackoff};
use crate::types::{PluginCapability, PluginInfo};

/// Identity service: plugin discovery and health probing.
#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Return the plugin name and version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// Readiness probe.  Returns `true` when the plugin is ready to serve.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Advertise the capabilities supported by this plugin.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}

/// Call `Probe` until the plugin reports ready, waiting as `policy` says
/// between attempts.
///
/// Errors and "not ready" answers are logged and retried; this only returns
/// once the driver is ready.
pub async fn probe_forever<I>(identity: &I, mut policy: ExponentialBackoff)
where
    I: CsiIdentity + ?Sized,
{
    loop {
        info!("probing CSI driver for readiness");
        match identity.probe().await {
            Ok(true) => return,
            Ok(false) => warn!("CSI driver is not ready yet"),
            Err(e) => warn!(error = %e, "CSI driver probe failed"),
        }
        let wait = policy.next_backoff().unwrap_or(policy.max_interval);
        tokio::time::sleep(wait).await;
    }
}

/// Return the driver name reported by `GetPluginInfo`.
pub async fn driver_name<I>(identity: &I) -> Result<String, CsiError>
where
    I: CsiIdentity + ?Sized,
{
    let info = identity.get_plugin_info().await?;
    if info.name.is_empty() {
        return Err(CsiError::InvalidArgument(
            "driver returned an empty name from GetPluginInfo".into(),
        ));
    }
    Ok(info.name)
}

/// Returns `true` when the plugin provides a Controller service.
pub async fn supports_controller_service<I>(identity: &I) -> Result<bool, CsiError>
where
    I: CsiIdentity + ?Sized,
{
    Ok(identity
        .get_plugin_capabilities()
        .await?
        .contains(&PluginCapability::ControllerService))
}
