//! # libcsi: CSI controller client for RK8s sidecars
//!
//! `libcsi` talks to a [Container Storage Interface][csi] driver over gRPC
//! (via [`tonic`]) on behalf of the external attacher.  It follows the RK8s
//! conventions: Tokio async runtime, `tracing` for observability and
//! `thiserror` for structured errors.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`proto`] | Wire messages of the Identity and Controller services. |
//! | [`types`] | Typed capabilities, access modes and plugin info. |
//! | [`error`] | [`CsiError`] and the final/transient classification. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & readiness. |
//! | [`controller`] | [`CsiController`] trait: publish, unpublish, list. |
//! | [`attacher`] | [`Attacher`] adapter used by the attach state machine. |
//! | [`retry`] | Exponential retry policy over the `backoff` crate. |
//! | [`transport`] | Unix-socket gRPC connection and the [`CsiClient`]. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod attacher;
pub mod controller;
pub mod error;
pub mod identity;
pub mod proto;
pub mod retry;
pub mod transport;
pub mod types;

pub use attacher::{AttachRequest, Attacher, CsiAttacher};
pub use controller::CsiController;
pub use error::{CsiError, is_final_code};
pub use identity::{CsiIdentity, driver_name, probe_forever, supports_controller_service};
pub use retry::{Backoff, ExponentialBackoff, retry_policy};
pub use transport::client::CsiClient;
pub use transport::connection::{ConnectionLostFn, DEFAULT_CSI_ADDRESS, connect};
pub use types::*;
