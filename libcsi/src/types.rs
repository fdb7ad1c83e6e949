//! Core CSI types: volume capabilities, plugin and controller capabilities.
//!
//! These are the attacher-facing forms of the wire messages in
//! [`crate::proto`].  Conversions in both directions live next to each type.

use std::collections::{BTreeSet, HashMap};

use crate::proto;
use crate::proto::controller_service_capability::rpc::Type as RpcType;
use crate::proto::plugin_capability::service::Type as ServiceType;
use crate::proto::volume_capability::access_mode::Mode;

/// Opaque key/value data returned by `ControllerPublishVolume`.
pub type PublishContext = HashMap<String, String>;

/// Secret key/value data forwarded to the driver.  Never logged.
pub type Secrets = HashMap<String, String>;

/// Map of volume handle to the node IDs it is published on.
pub type PublishedVolumes = HashMap<String, Vec<String>>;

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Single-node read-write.
    SingleNodeWriter,
    /// Single-node read-only.
    SingleNodeReaderOnly,
    /// Multi-node read-only.
    MultiNodeReaderOnly,
    /// Multi-node, one writer.
    MultiNodeSingleWriter,
    /// Multi-node read-write.
    MultiNodeMultiWriter,
}

impl From<AccessMode> for Mode {
    fn from(mode: AccessMode) -> Self {
        match mode {
            AccessMode::SingleNodeWriter => Mode::SingleNodeWriter,
            AccessMode::SingleNodeReaderOnly => Mode::SingleNodeReaderOnly,
            AccessMode::MultiNodeReaderOnly => Mode::MultiNodeReaderOnly,
            AccessMode::MultiNodeSingleWriter => Mode::MultiNodeSingleWriter,
            AccessMode::MultiNodeMultiWriter => Mode::MultiNodeMultiWriter,
        }
    }
}

/// How the volume is consumed on the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessType {
    /// Raw block device.
    Block,
    /// Mounted filesystem.
    Mount {
        /// Filesystem type, e.g. `"ext4"`.
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        mount_flags: Vec<String>,
    },
}

/// Describes the capability a volume is published with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Block or mount access.
    pub access_type: AccessType,
}

impl From<&VolumeCapability> for proto::VolumeCapability {
    fn from(cap: &VolumeCapability) -> Self {
        use proto::volume_capability::{self as vc, BlockVolume, MountVolume};

        let access_type = match &cap.access_type {
            AccessType::Block => vc::AccessType::Block(BlockVolume {}),
            AccessType::Mount {
                fs_type,
                mount_flags,
            } => vc::AccessType::Mount(MountVolume {
                fs_type: fs_type.clone(),
                mount_flags: mount_flags.clone(),
            }),
        };
        Self {
            access_mode: Some(vc::AccessMode {
                mode: Mode::from(cap.access_mode) as i32,
            }),
            access_type: Some(access_type),
        }
    }
}

// ---------------------------------------------------------------------------
// Plugin info & capabilities
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    /// Driver name, e.g. `"hostpath.csi.k8s.io"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

impl From<proto::GetPluginInfoResponse> for PluginInfo {
    fn from(rsp: proto::GetPluginInfoResponse) -> Self {
        Self {
            name: rsp.name,
            vendor_version: rsp.vendor_version,
        }
    }
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// Decode the plugin capabilities we understand, dropping the rest.
pub fn plugin_capabilities(rsp: &proto::GetPluginCapabilitiesResponse) -> Vec<PluginCapability> {
    use proto::plugin_capability::Type;

    rsp.capabilities
        .iter()
        .filter_map(|cap| match &cap.r#type {
            Some(Type::Service(svc)) => match ServiceType::try_from(svc.r#type) {
                Ok(ServiceType::ControllerService) => Some(PluginCapability::ControllerService),
                Ok(ServiceType::VolumeAccessibilityConstraints) => {
                    Some(PluginCapability::VolumeAccessibilityConstraints)
                }
                _ => None,
            },
            _ => None,
        })
        .collect()
}

/// Controller RPCs the attacher cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControllerCapability {
    PublishUnpublishVolume,
    ListVolumes,
    PublishReadonly,
    ListVolumesPublishedNodes,
}

/// The set of controller capabilities a driver advertised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerCapabilities(BTreeSet<ControllerCapability>);

impl ControllerCapabilities {
    pub fn new(caps: impl IntoIterator<Item = ControllerCapability>) -> Self {
        Self(caps.into_iter().collect())
    }

    pub fn contains(&self, cap: ControllerCapability) -> bool {
        self.0.contains(&cap)
    }

    /// Driver implements `ControllerPublishVolume`/`ControllerUnpublishVolume`.
    pub fn supports_attach(&self) -> bool {
        self.contains(ControllerCapability::PublishUnpublishVolume)
    }

    /// Driver honours the `readonly` flag of `ControllerPublishVolume`.
    pub fn supports_readonly_attach(&self) -> bool {
        self.contains(ControllerCapability::PublishReadonly)
    }

    /// Driver reports published nodes through `ListVolumes`.
    pub fn supports_list_volumes_published_nodes(&self) -> bool {
        self.contains(ControllerCapability::ListVolumes)
            && self.contains(ControllerCapability::ListVolumesPublishedNodes)
    }
}

impl From<&proto::ControllerGetCapabilitiesResponse> for ControllerCapabilities {
    fn from(rsp: &proto::ControllerGetCapabilitiesResponse) -> Self {
        use proto::controller_service_capability::Type;

        Self::new(rsp.capabilities.iter().filter_map(|cap| {
            let Some(Type::Rpc(rpc)) = &cap.r#type else {
                return None;
            };
            match RpcType::try_from(rpc.r#type) {
                Ok(RpcType::PublishUnpublishVolume) => {
                    Some(ControllerCapability::PublishUnpublishVolume)
                }
                Ok(RpcType::ListVolumes) => Some(ControllerCapability::ListVolumes),
                Ok(RpcType::PublishReadonly) => Some(ControllerCapability::PublishReadonly),
                Ok(RpcType::ListVolumesPublishedNodes) => {
                    Some(ControllerCapability::ListVolumesPublishedNodes)
                }
                _ => None,
            }
        }))
    }
}
