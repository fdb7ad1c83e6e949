//! Error type shared by the attacher's controller and handlers.

use libcsi::CsiError;
use thiserror::Error;

pub type Result<T, E = AttacherError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AttacherError {
    /// An object the reconciliation depends on is absent from the cache.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// The object changed since it was read; retry with a fresh copy.
    #[error("conflict writing {0}: the object has been modified")]
    Conflict(String),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Csi(#[from] CsiError),

    /// The volume cannot be expressed as a CSI request.
    #[error("{0}")]
    InvalidVolume(String),

    #[error("failed to resolve node ID: {0}")]
    NodeId(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("timed out waiting for the {0} cache to sync")]
    CacheSync(&'static str),

    #[error("leader election: {0}")]
    LeaderElection(String),
}

impl AttacherError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
