//! The attach/detach adapter the attacher's state machine talks to.
//!
//! [`Attacher`] hides the CSI wire format behind three operations.  Failed
//! operations report whether the volume is *known* to be detached through
//! [`CsiError::is_final`]:
//!
//! * `attach` failing with a final error means nothing was published, so a
//!   fresh attempt is safe.
//! * `detach` failing with a final error means the volume is not published
//!   on the node (e.g. `NOT_FOUND`), so the caller may treat it as detached.
//! * Any other failure leaves the operation possibly running on the driver.

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::proto;
use crate::types::{PublishContext, PublishedVolumes, Secrets, VolumeCapability};

/// Everything `ControllerPublishVolume` needs.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachRequest {
    pub volume_id: String,
    pub node_id: String,
    pub read_only: bool,
    pub capability: VolumeCapability,
    pub volume_context: std::collections::HashMap<String, String>,
    pub secrets: Secrets,
}

/// Attach, detach and enumerate published volumes on a CSI driver.
#[async_trait]
pub trait Attacher: Send + Sync {
    /// Publish a volume to a node, returning the driver's publish context.
    async fn attach(&self, req: AttachRequest) -> Result<PublishContext, CsiError>;

    /// Unpublish a volume from a node.  `Ok(())` means it is detached.
    async fn detach(&self, volume_id: &str, node_id: &str, secrets: Secrets)
    -> Result<(), CsiError>;

    /// Return every volume the driver knows with the nodes it is published on.
    async fn list_volumes(&self) -> Result<PublishedVolumes, CsiError>;
}

/// [`Attacher`] backed by a driver's Controller service.
pub struct CsiAttacher<C> {
    controller: C,
    max_entries: i32,
}

impl<C: CsiController> CsiAttacher<C> {
    /// `max_entries` is the `ListVolumes` page size; `0` lets the driver pick.
    pub fn new(controller: C, max_entries: i32) -> Self {
        Self {
            controller,
            max_entries,
        }
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }
}

#[async_trait]
impl<C: CsiController> Attacher for CsiAttacher<C> {
    #[instrument(skip_all, fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn attach(&self, req: AttachRequest) -> Result<PublishContext, CsiError> {
        if req.volume_id.is_empty() || req.node_id.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume ID and node ID are required for attach".into(),
            ));
        }
        let rsp = self
            .controller
            .controller_publish_volume(proto::ControllerPublishVolumeRequest {
                volume_id: req.volume_id,
                node_id: req.node_id,
                volume_capability: Some(proto::VolumeCapability::from(&req.capability)),
                readonly: req.read_only,
                secrets: req.secrets,
                volume_context: req.volume_context,
            })
            .await?;
        debug!(keys = rsp.publish_context.len(), "volume published");
        Ok(rsp.publish_context)
    }

    #[instrument(skip(self, secrets))]
    async fn detach(
        &self,
        volume_id: &str,
        node_id: &str,
        secrets: Secrets,
    ) -> Result<(), CsiError> {
        self.controller
            .controller_unpublish_volume(proto::ControllerUnpublishVolumeRequest {
                volume_id: volume_id.to_owned(),
                node_id: node_id.to_owned(),
                secrets,
            })
            .await?;
        debug!("volume unpublished");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_volumes(&self) -> Result<PublishedVolumes, CsiError> {
        let mut published = PublishedVolumes::new();
        let mut token = String::new();
        loop {
            let rsp = self
                .controller
                .list_volumes(proto::ListVolumesRequest {
                    max_entries: self.max_entries,
                    starting_token: token,
                })
                .await?;
            for entry in rsp.entries {
                let Some(volume) = entry.volume else {
                    continue;
                };
                let nodes = entry
                    .status
                    .map(|status| status.published_node_ids)
                    .unwrap_or_default();
                published.insert(volume.volume_id, nodes);
            }
            if rsp.next_token.is_empty() {
                break;
            }
            token = rsp.next_token;
        }
        debug!(count = published.len(), "listed volumes");
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use tonic::Status;

    use super::*;
    use crate::proto::list_volumes_response::{Entry, VolumeStatus};
    use crate::types::{AccessMode, AccessType, ControllerCapabilities};

    /// In-memory controller recording requests and replaying canned answers.
    #[derive(Default)]
    struct FakeController {
        publish_error: Option<Status>,
        unpublish_error: Option<Status>,
        pages: Vec<proto::ListVolumesResponse>,
        published: Mutex<Vec<proto::ControllerPublishVolumeRequest>>,
        list_tokens: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CsiController for FakeController {
        async fn controller_get_capabilities(&self) -> Result<ControllerCapabilities, CsiError> {
            Ok(ControllerCapabilities::default())
        }

        async fn controller_publish_volume(
            &self,
            req: proto::ControllerPublishVolumeRequest,
        ) -> Result<proto::ControllerPublishVolumeResponse, CsiError> {
            self.published.lock().unwrap().push(req);
            match &self.publish_error {
                Some(status) => Err(status.clone().into()),
                None => Ok(proto::ControllerPublishVolumeResponse {
                    publish_context: HashMap::from([("devPath".into(), "/dev/x".into())]),
                }),
            }
        }

        async fn controller_unpublish_volume(
            &self,
            _req: proto::ControllerUnpublishVolumeRequest,
        ) -> Result<proto::ControllerUnpublishVolumeResponse, CsiError> {
            match &self.unpublish_error {
                Some(status) => Err(status.clone().into()),
                None => Ok(proto::ControllerUnpublishVolumeResponse {}),
            }
        }

        async fn list_volumes(
            &self,
            req: proto::ListVolumesRequest,
        ) -> Result<proto::ListVolumesResponse, CsiError> {
            let mut tokens = self.list_tokens.lock().unwrap();
            let page = tokens.len();
            tokens.push(req.starting_token);
            self.pages
                .get(page)
                .cloned()
                .ok_or_else(|| Status::out_of_range("no such page").into())
        }
    }

    fn request() -> AttachRequest {
        AttachRequest {
            volume_id: "vol-1".into(),
            node_id: "node-1".into(),
            read_only: false,
            capability: VolumeCapability {
                access_mode: AccessMode::SingleNodeWriter,
                access_type: AccessType::Mount {
                    fs_type: "ext4".into(),
                    mount_flags: Vec::new(),
                },
            },
            volume_context: HashMap::from([("pool".into(), "fast".into())]),
            secrets: HashMap::from([("key".into(), "value".into())]),
        }
    }

    fn entry(volume_id: &str, nodes: &[&str]) -> Entry {
        Entry {
            volume: Some(proto::Volume {
                volume_id: volume_id.into(),
                ..Default::default()
            }),
            status: Some(VolumeStatus {
                published_node_ids: nodes.iter().map(|n| n.to_string()).collect(),
            }),
        }
    }

    #[tokio::test]
    async fn attach_returns_publish_context() {
        let attacher = CsiAttacher::new(FakeController::default(), 0);
        let ctx = attacher.attach(request()).await.unwrap();
        assert_eq!(ctx.get("devPath").map(String::as_str), Some("/dev/x"));

        let sent = attacher.controller().published.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].volume_id, "vol-1");
        assert_eq!(sent[0].secrets.get("key").map(String::as_str), Some("value"));
        assert_eq!(sent[0].volume_context.get("pool").map(String::as_str), Some("fast"));
        assert!(sent[0].volume_capability.is_some());
    }

    #[tokio::test]
    async fn attach_failure_classification() {
        let transient = CsiAttacher::new(
            FakeController {
                publish_error: Some(Status::unavailable("driver restarting")),
                ..Default::default()
            },
            0,
        );
        let err = transient.attach(request()).await.unwrap_err();
        assert!(!err.is_final(), "attach may still be in progress");

        let final_ = CsiAttacher::new(
            FakeController {
                publish_error: Some(Status::invalid_argument("bad capability")),
                ..Default::default()
            },
            0,
        );
        assert!(final_.attach(request()).await.unwrap_err().is_final());
    }

    #[tokio::test]
    async fn attach_rejects_missing_ids_without_rpc() {
        let attacher = CsiAttacher::new(FakeController::default(), 0);
        let mut req = request();
        req.node_id.clear();
        let err = attacher.attach(req).await.unwrap_err();
        assert!(!err.is_final());
        assert!(attacher.controller().published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn detach_not_found_is_final() {
        let attacher = CsiAttacher::new(
            FakeController {
                unpublish_error: Some(Status::not_found("no such volume")),
                ..Default::default()
            },
            0,
        );
        let err = attacher
            .detach("vol-1", "node-1", Secrets::new())
            .await
            .unwrap_err();
        assert!(err.is_final());
    }

    #[tokio::test]
    async fn detach_deadline_is_transient() {
        let attacher = CsiAttacher::new(
            FakeController {
                unpublish_error: Some(Status::deadline_exceeded("slow")),
                ..Default::default()
            },
            0,
        );
        let err = attacher
            .detach("vol-1", "node-1", Secrets::new())
            .await
            .unwrap_err();
        assert!(!err.is_final());
    }

    #[tokio::test]
    async fn list_volumes_follows_tokens() {
        let attacher = CsiAttacher::new(
            FakeController {
                pages: vec![
                    proto::ListVolumesResponse {
                        entries: vec![entry("vol-1", &["node-1"]), entry("vol-2", &[])],
                        next_token: "page-2".into(),
                    },
                    proto::ListVolumesResponse {
                        entries: vec![entry("vol-3", &["node-1", "node-2"])],
                        next_token: String::new(),
                    },
                ],
                ..Default::default()
            },
            2,
        );
        let published = attacher.list_volumes().await.unwrap();
        assert_eq!(published.len(), 3);
        assert_eq!(published["vol-1"], vec!["node-1".to_string()]);
        assert!(published["vol-2"].is_empty());
        assert_eq!(published["vol-3"].len(), 2);
        assert_eq!(
            *attacher.controller().list_tokens.lock().unwrap(),
            vec![String::new(), "page-2".to_string()]
        );
    }
}
