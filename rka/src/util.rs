//! Pure helpers over VolumeAttachment, PersistentVolume and Node objects.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, Node, PersistentVolume, Secret, SecretReference,
};
use k8s_openapi::api::storage::v1::{CSINode, VolumeAttachment, VolumeAttachmentStatus};
use kube::ResourceExt;
use libcsi::{AccessMode, AccessType, Secrets, VolumeCapability};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{AttacherError, Result};

/// Node annotation holding a JSON map of driver name to node ID.
pub const NODE_ID_ANNOTATION: &str = "csi.volume.kubernetes.io/nodeid";
/// Set on an in-tree PV handed over to a CSI driver.
pub const MIGRATED_TO_ANNOTATION: &str = "pv.kubernetes.io/migrated-to";
/// Node ID cached on a VolumeAttachment for use during detach.
pub const VA_NODE_ID_ANNOTATION: &str = "csi.alpha.kubernetes.io/node-id";

const FINALIZER_PREFIX: &str = "external-attacher/";
const DEFAULT_FS_TYPE: &str = "ext4";

const ACCESS_RWO: &str = "ReadWriteOnce";
const ACCESS_ROX: &str = "ReadOnlyMany";
const ACCESS_RWX: &str = "ReadWriteMany";

/// Replace every character outside `[A-Za-z0-9-]` with `-`.
///
/// A trailing `-` gets an `X` appended so the result is a valid name suffix.
pub fn sanitize_driver_name(driver: &str) -> String {
    let mut name: String = driver
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if name.ends_with('-') {
        name.push('X');
    }
    name
}

pub fn finalizer_name(driver: &str) -> String {
    format!("{FINALIZER_PREFIX}{}", sanitize_driver_name(driver))
}

pub fn has_finalizer<K: ResourceExt>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Append `finalizer` unless present.  Returns `true` when `obj` changed.
pub fn add_finalizer<K: ResourceExt>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.finalizers_mut().push(finalizer.to_owned());
    true
}

/// Drop every copy of `finalizer`, keeping the order of the others.
pub fn remove_finalizer<K: ResourceExt>(obj: &mut K, finalizer: &str) -> bool {
    let finalizers = obj.finalizers_mut();
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    before != finalizers.len()
}

/// Resolve the driver's node ID from the Node annotation.
pub fn node_id_from_node(driver: &str, node: &Node) -> Result<String> {
    let name = node.name_any();
    let raw = node.annotations().get(NODE_ID_ANNOTATION).ok_or_else(|| {
        AttacherError::NodeId(format!(
            "node {name:?} has no {NODE_ID_ANNOTATION} annotation"
        ))
    })?;
    let ids: HashMap<String, String> = serde_json::from_str(raw).map_err(|e| {
        AttacherError::NodeId(format!(
            "cannot parse {NODE_ID_ANNOTATION} annotation on node {name:?}: {e}"
        ))
    })?;
    ids.get(driver).cloned().ok_or_else(|| {
        AttacherError::NodeId(format!(
            "node {name:?} has no node ID for driver {driver:?}"
        ))
    })
}

/// Resolve the driver's node ID registered in a CSINode object.
pub fn node_id_from_csi_node(driver: &str, csi_node: &CSINode) -> Option<String> {
    csi_node
        .spec
        .drivers
        .iter()
        .find(|d| d.name == driver && !d.node_id.is_empty())
        .map(|d| d.node_id.clone())
}

pub fn csi_source(pv: &PersistentVolume) -> Option<&CSIPersistentVolumeSource> {
    pv.spec.as_ref()?.csi.as_ref()
}

/// Whether `driver` is responsible for attaching `pv`.
///
/// CSI volumes belong to the driver named in their source; in-tree volumes
/// belong to the driver their migration annotation names.
pub fn pv_owned_by(pv: &PersistentVolume, driver: &str) -> bool {
    match csi_source(pv) {
        Some(csi) => csi.driver == driver,
        None => pv
            .annotations()
            .get(MIGRATED_TO_ANNOTATION)
            .is_some_and(|to| to == driver),
    }
}

/// `(volume handle, read-only flag)` of a CSI volume.
pub fn volume_handle(pv: &PersistentVolume) -> Result<(String, bool)> {
    let csi = csi_source(pv).ok_or_else(|| {
        AttacherError::InvalidVolume(format!(
            "persistent volume {} is not a CSI volume",
            pv.name_any()
        ))
    })?;
    Ok((csi.volume_handle.clone(), csi.read_only.unwrap_or(false)))
}

pub fn volume_attributes(pv: &PersistentVolume) -> HashMap<String, String> {
    csi_source(pv)
        .and_then(|csi| csi.volume_attributes.as_ref())
        .map(|attrs| attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

pub fn publish_secret_ref(pv: &PersistentVolume) -> Option<&SecretReference> {
    csi_source(pv)?.controller_publish_secret_ref.as_ref()
}

/// Secret data as strings.  Values are never logged.
pub fn secret_data(secret: &Secret) -> Secrets {
    secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect()
}

/// Derive the CSI capability a PV is published with.
///
/// An empty `default_fs_type` falls back to `ext4` when the PV does not name
/// a filesystem.
pub fn volume_capability(pv: &PersistentVolume, default_fs_type: &str) -> Result<VolumeCapability> {
    let spec = pv.spec.as_ref();
    let modes = spec
        .and_then(|s| s.access_modes.as_deref())
        .unwrap_or_default();
    let has = |mode: &str| modes.iter().any(|m| m == mode);

    let access_mode = if has(ACCESS_RWX) {
        AccessMode::MultiNodeMultiWriter
    } else if has(ACCESS_ROX) && has(ACCESS_RWO) {
        return Err(AttacherError::InvalidVolume(format!(
            "CSI does not support {ACCESS_ROX} and {ACCESS_RWO} on the same persistent volume {}",
            pv.name_any()
        )));
    } else if has(ACCESS_ROX) {
        AccessMode::MultiNodeReaderOnly
    } else if has(ACCESS_RWO) {
        AccessMode::SingleNodeWriter
    } else {
        return Err(AttacherError::InvalidVolume(format!(
            "persistent volume {} has unsupported access modes {modes:?}",
            pv.name_any()
        )));
    };

    let block = spec
        .and_then(|s| s.volume_mode.as_deref())
        .is_some_and(|mode| mode == "Block");
    let access_type = if block {
        AccessType::Block
    } else {
        let fs_type = csi_source(pv)
            .and_then(|csi| csi.fs_type.as_deref())
            .filter(|fs| !fs.is_empty())
            .or(Some(default_fs_type).filter(|fs| !fs.is_empty()))
            .unwrap_or(DEFAULT_FS_TYPE)
            .to_owned();
        AccessType::Mount {
            fs_type,
            mount_flags: spec
                .and_then(|s| s.mount_options.clone())
                .unwrap_or_default(),
        }
    };

    Ok(VolumeCapability {
        access_mode,
        access_type,
    })
}

/// Name of the PV a VolumeAttachment refers to, if any.
pub fn va_pv_name(va: &VolumeAttachment) -> Option<&str> {
    va.spec
        .source
        .persistent_volume_name
        .as_deref()
        .filter(|name| !name.is_empty())
}

pub fn is_attached(va: &VolumeAttachment) -> bool {
    va.status.as_ref().is_some_and(|s| s.attached)
}

/// Whether a VA update event carries anything worth reconciling.
///
/// Updates that only touch the attach/detach error records are the
/// attacher's own writes and must not come back around as work.
pub fn should_enqueue_va_change(old: &VolumeAttachment, new: &VolumeAttachment) -> bool {
    fn strip(va: &VolumeAttachment) -> VolumeAttachment {
        let mut va = va.clone();
        va.metadata.resource_version = None;
        va.metadata.managed_fields = None;
        if let Some(status) = va.status.as_mut() {
            status.attach_error = None;
            status.detach_error = None;
        }
        if va.status == Some(VolumeAttachmentStatus::default()) {
            va.status = None;
        }
        va
    }
    strip(old) != strip(new)
}

/// JSON merge patch turning `old` into `new`.
///
/// The patch carries `old`'s resourceVersion, so it is rejected with a
/// conflict when the stored object moved on in the meantime.
pub fn merge_patch<T: Serialize>(old: &T, new: &T) -> Result<Value> {
    let old = serde_json::to_value(old)?;
    let new = serde_json::to_value(new)?;
    let mut patch = match diff(&old, &new) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    if let Some(rv) = old.pointer("/metadata/resourceVersion") {
        let metadata = patch
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            metadata.insert("resourceVersion".into(), rv.clone());
        }
    }
    Ok(Value::Object(patch))
}

fn diff(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, value) in new {
                match old.get(key) {
                    Some(prev) => {
                        if let Some(d) = diff(prev, value) {
                            patch.insert(key.clone(), d);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in old.keys().filter(|k| !new.contains_key(*k)) {
                patch.insert(key.clone(), Value::Null);
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        _ if old == new => None,
        _ => Some(new.clone()),
    }
}
