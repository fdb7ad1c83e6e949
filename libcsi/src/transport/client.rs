//! gRPC client used by the attacher to issue CSI requests.

use std::time::Duration;

use async_trait::async_trait;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Request, Status};
use tracing::{debug, instrument};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::proto::{self, path};
use crate::transport::log::{self, LogPayload};
use crate::types::{ControllerCapabilities, PluginCapability, PluginInfo, plugin_capabilities};

/// A CSI client that sends unary requests over one shared gRPC channel.
///
/// Cloning is cheap; clones multiplex over the same HTTP/2 connection, so a
/// single client can serve every worker.
#[derive(Clone)]
pub struct CsiClient {
    grpc: Grpc<Channel>,
    timeout: Duration,
    max_log_len: Option<usize>,
}

impl CsiClient {
    /// Wrap an established channel.  Every call is bounded by `timeout`.
    pub fn new(channel: Channel, timeout: Duration) -> Self {
        Self {
            grpc: Grpc::new(channel),
            timeout,
            max_log_len: None,
        }
    }

    /// Limit logged payloads to `max` characters; `-1` disables the limit.
    pub fn with_max_log_length(mut self, max: i64) -> Self {
        self.max_log_len = log::max_log_length(max);
        self
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// A call that outlives the timeout fails with `DEADLINE_EXCEEDED`, the
    /// same status a driver-side deadline would produce.
    #[instrument(skip(self, req))]
    async fn unary<Req, Rsp>(&self, path: &'static str, req: Req) -> Result<Rsp, CsiError>
    where
        Req: prost::Message + LogPayload + Send + Sync + 'static,
        Rsp: prost::Message + LogPayload + Default + Send + Sync + 'static,
    {
        debug!(request = %crate::transport::log::render(&req, self.max_log_len), "GRPC call");

        let mut grpc = self.grpc.clone();
        let call = async move {
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("service was not ready: {e}")))?;
            let codec: ProstCodec<Req, Rsp> = ProstCodec::default();
            grpc.unary(Request::new(req), PathAndQuery::from_static(path), codec)
                .await
        };

        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map(tonic::Response::into_inner),
            Err(_) => Err(Status::deadline_exceeded(format!(
                "{path} did not complete within {:?}",
                self.timeout
            ))),
        };

        match &result {
            Ok(rsp) => debug!(response = %crate::transport::log::render(rsp, self.max_log_len), "GRPC response"),
            Err(status) => debug!(code = ?status.code(), error = %status.message(), "GRPC error"),
        }
        result.map_err(CsiError::from)
    }
}

#[async_trait]
impl CsiIdentity for CsiClient {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        let rsp: proto::GetPluginInfoResponse = self
            .unary(path::GET_PLUGIN_INFO, proto::GetPluginInfoRequest {})
            .await?;
        Ok(rsp.into())
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        let rsp: proto::ProbeResponse = self.unary(path::PROBE, proto::ProbeRequest {}).await?;
        // An unset readiness field means the plugin is ready.
        Ok(rsp.ready.unwrap_or(true))
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        let rsp: proto::GetPluginCapabilitiesResponse = self
            .unary(
                path::GET_PLUGIN_CAPABILITIES,
                proto::GetPluginCapabilitiesRequest {},
            )
            .await?;
        Ok(plugin_capabilities(&rsp))
    }
}

#[async_trait]
impl CsiController for CsiClient {
    async fn controller_get_capabilities(&self) -> Result<ControllerCapabilities, CsiError> {
        let rsp: proto::ControllerGetCapabilitiesResponse = self
            .unary(
                path::CONTROLLER_GET_CAPABILITIES,
                proto::ControllerGetCapabilitiesRequest {},
            )
            .await?;
        Ok(ControllerCapabilities::from(&rsp))
    }

    async fn controller_publish_volume(
        &self,
        req: proto::ControllerPublishVolumeRequest,
    ) -> Result<proto::ControllerPublishVolumeResponse, CsiError> {
        self.unary(path::CONTROLLER_PUBLISH_VOLUME, req).await
    }

    async fn controller_unpublish_volume(
        &self,
        req: proto::ControllerUnpublishVolumeRequest,
    ) -> Result<proto::ControllerUnpublishVolumeResponse, CsiError> {
        self.unary(path::CONTROLLER_UNPUBLISH_VOLUME, req).await
    }

    async fn list_volumes(
        &self,
        req: proto::ListVolumesRequest,
    ) -> Result<proto::ListVolumesResponse, CsiError> {
        self.unary(path::LIST_VOLUMES, req).await
    }
}
