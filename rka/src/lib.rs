//! # rka: external attacher for CSI drivers
//!
//! Watches `VolumeAttachment` objects and drives `ControllerPublishVolume` /
//! `ControllerUnpublishVolume` on a CSI driver (through [`libcsi`]) until
//! each attachment's status matches what the cluster asked for.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`controller`] | Event intake, work queues and worker pools. |
//! | [`handler`] | The attach/detach state machine and its trivial variant. |
//! | [`queue`] | Keyed work queue with per-key backoff. |
//! | [`store`] | Listers and object client the handlers are written against. |
//! | [`k8s`] | kube-rs implementation of [`store`]. |
//! | [`util`] | Pure helpers over PVs, VAs, Nodes and finalizers. |
//! | [`leader`] | Lease-based leader election. |
//! | [`metrics`], [`server`] | Prometheus metrics and the health endpoint. |
//! | [`cli`], [`config`] | Command line and validated configuration. |

pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
pub mod k8s;
pub mod leader;
pub mod metrics;
pub mod queue;
pub mod server;
pub mod store;
pub mod util;

#[cfg(test)]
mod testing;

pub use error::{AttacherError, Result};
