//! Rendering RPC payloads for logs.
//!
//! Every request and response is logged at `debug` level.  Secret values are
//! replaced before formatting and long payloads are cut to the configured
//! length.

use std::collections::HashMap;
use std::fmt::Debug;

use crate::proto;

/// Replacement for every secret value.
pub const STRIPPED: &str = "***stripped***";

/// A wire message that can be rendered into a log line.
pub trait LogPayload: Debug {
    /// `Debug` representation with secret values masked.
    fn stripped(&self) -> String {
        format!("{self:?}")
    }
}

fn mask(secrets: &mut HashMap<String, String>) {
    secrets
        .values_mut()
        .for_each(|value| *value = STRIPPED.to_owned());
}

impl LogPayload for proto::ControllerPublishVolumeRequest {
    fn stripped(&self) -> String {
        let mut req = self.clone();
        mask(&mut req.secrets);
        format!("{req:?}")
    }
}

impl LogPayload for proto::ControllerUnpublishVolumeRequest {
    fn stripped(&self) -> String {
        let mut req = self.clone();
        mask(&mut req.secrets);
        format!("{req:?}")
    }
}

macro_rules! plain_payload {
    ($($ty:ty),* $(,)?) => {
        $(impl LogPayload for $ty {})*
    };
}

plain_payload!(
    proto::GetPluginInfoRequest,
    proto::GetPluginInfoResponse,
    proto::GetPluginCapabilitiesRequest,
    proto::GetPluginCapabilitiesResponse,
    proto::ProbeRequest,
    proto::ProbeResponse,
    proto::ControllerGetCapabilitiesRequest,
    proto::ControllerGetCapabilitiesResponse,
    proto::ControllerPublishVolumeResponse,
    proto::ControllerUnpublishVolumeResponse,
    proto::ListVolumesRequest,
    proto::ListVolumesResponse,
);

/// Render `msg` for a log line, truncated to `max_len` characters when set.
pub fn render<T: LogPayload>(msg: &T, max_len: Option<usize>) -> String {
    truncate(msg.stripped(), max_len)
}

fn truncate(s: String, max_len: Option<usize>) -> String {
    let Some(max) = max_len else {
        return s;
    };
    let total = s.chars().count();
    if total <= max {
        return s;
    }
    let mut cut: String = s.chars().take(max).collect();
    cut.push_str(&format!("[...{} characters truncated]", total - max));
    cut
}

/// Convert the `max-grpc-log-length` option (`-1` = unbounded) into a limit.
pub fn max_log_length(option: i64) -> Option<usize> {
    usize::try_from(option).ok()
}
