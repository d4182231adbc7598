//! The `JivaVolume` custom resource as seen by the plugin.
//!
//! The resource is owned and reconciled by the jiva operator. The plugin
//! creates it (controller), reads its iSCSI target details and readiness
//! (node) and records where the volume got attached and mounted so that the
//! teardown verbs can find the same values again.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::{
    api::core::v1::{Affinity, ResourceRequirements, Toleration},
    apimachinery::pkg::api::resource::Quantity,
};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::{csi::CreateVolumeRequest, dev::AttachSpec};

/// Label carrying the name of the persistent volume.
pub const PV_LABEL: &str = "openebs.io/persistent-volume";
/// Label marking the object as a jiva volume.
pub const COMPONENT_LABEL: &str = "openebs.io/component";
/// Value of the component label.
pub const COMPONENT: &str = "jiva-volume";

/// Custom resource names can't be longer than this.
const MAX_NAME_LEN: usize = 63;
/// Port iSCSI targets listen on unless told otherwise.
pub const DEFAULT_ISCSI_PORT: i32 = 3260;

const GIB: i64 = 1024 * 1024 * 1024;

/// Phase the operator puts the volume in once its target and replicas are up.
pub const PHASE_CREATED: &str = "Created";
/// Phase the operator puts the volume in when it gave up on it.
pub const PHASE_FAILED: &str = "Failed";
/// Volume status reported while the volume only serves reads.
pub const STATUS_RO: &str = "RO";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "JivaVolume",
    namespaced,
    status = "JivaVolumeStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct JivaVolumeSpec {
    #[serde(default)]
    pub pv: String,
    #[serde(default)]
    pub capacity: String,
    #[serde(default)]
    pub access_type: String,
    #[serde(default, rename = "iscsiSpec")]
    pub iscsi_spec: IscsiSpec,
    #[serde(default)]
    pub mount_info: MountInfo,
    #[serde(default)]
    pub policy: JivaVolumePolicySpec,
    #[serde(default)]
    pub desired_replication_factor: u32,
}

/// Where the operator exposes the volume's iSCSI target.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IscsiSpec {
    #[serde(default, rename = "targetIP")]
    pub target_ip: String,
    #[serde(default)]
    pub target_port: i32,
    #[serde(default)]
    pub iqn: String,
    #[serde(default)]
    pub lun: i32,
    #[serde(default)]
    pub iscsi_interface: String,
    #[serde(default)]
    pub target_portals: Vec<String>,
}

/// Record of a volume's attachment and mounts on the node.
/// Device and paths stay empty until attach/mount succeeded and are only
/// cleared after the matching detach/unmount succeeded.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MountInfo {
    #[serde(default)]
    pub staging_path: String,
    #[serde(default)]
    pub target_path: String,
    #[serde(default)]
    pub fs_type: String,
    #[serde(default)]
    pub device_path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JivaVolumePolicySpec {
    #[serde(default, rename = "replicaSC")]
    pub replica_sc: String,
    #[serde(default)]
    pub enable_bufio: bool,
    #[serde(default)]
    pub auto_scaling: bool,
    #[serde(default)]
    pub service_account_name: String,
    #[serde(default)]
    pub priority_class_name: String,
    #[serde(default)]
    pub target: TargetSpec,
    #[serde(default)]
    pub replica: ReplicaSpec,
}

/// Scheduling knobs shared by the target and the replica pods.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub priority_class_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    #[serde(flatten)]
    pub pod: PodTemplateResources,
    #[serde(default)]
    pub replication_factor: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux_resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub disable_monitor: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    #[serde(flatten)]
    pub pod: PodTemplateResources,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JivaVolumeStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub replica_count: u32,
    #[serde(default, rename = "replicaStatus")]
    pub replica_statuses: Vec<ReplicaStatus>,
    #[serde(default)]
    pub phase: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub mode: String,
}

/// Lifecycle of a volume as far as the plugin is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeLifecyclePhase {
    Pending,
    Created,
    ReadOnlyDegraded,
    Failed,
}

impl JivaVolume {
    /// Derive the lifecycle phase from the status written by the operator.
    pub fn lifecycle_phase(&self) -> VolumeLifecyclePhase {
        match &self.status {
            Some(status) if status.phase == PHASE_CREATED => {
                VolumeLifecyclePhase::Created
            }
            Some(status) if status.status == STATUS_RO => {
                VolumeLifecyclePhase::ReadOnlyDegraded
            }
            Some(status) if status.phase == PHASE_FAILED => {
                VolumeLifecyclePhase::Failed
            }
            _ => VolumeLifecyclePhase::Pending,
        }
    }

    /// Per replica status, if the operator reported any.
    pub fn replica_statuses(&self) -> &[ReplicaStatus] {
        self.status
            .as_ref()
            .map(|status| status.replica_statuses.as_slice())
            .unwrap_or_default()
    }

    /// The "host:port" endpoint used to check that the target is listening.
    pub fn target_portal(&self) -> Option<String> {
        let iscsi = &self.spec.iscsi_spec;
        let port = if iscsi.target_port > 0 {
            iscsi.target_port
        } else {
            DEFAULT_ISCSI_PORT
        };
        if let Some(portal) = iscsi.target_portals.first() {
            Some(with_port(portal, port))
        } else if !iscsi.target_ip.is_empty() {
            Some(with_port(&iscsi.target_ip, port))
        } else {
            None
        }
    }

    /// Parameters for the iSCSI login of this volume.
    pub fn attach_spec(&self) -> AttachSpec {
        let iscsi = &self.spec.iscsi_spec;
        AttachSpec {
            volume_name: kube::ResourceExt::name_any(self),
            target_iqn: iscsi.iqn.clone(),
            target_port: if iscsi.target_port > 0 {
                iscsi.target_port
            } else {
                DEFAULT_ISCSI_PORT
            },
            lun: iscsi.lun,
            interface: iscsi.iscsi_interface.clone(),
            target_portals: iscsi.target_portals.clone(),
        }
    }
}

/// Append the port to a portal which does not carry one.
pub(crate) fn with_port(portal: &str, port: i32) -> String {
    if portal.contains(':') {
        portal.to_string()
    } else {
        format!("{}:{}", portal, port)
    }
}

/// Labels every volume created by the plugin carries, and which are used to
/// find it again on deletion.
pub fn labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(PV_LABEL.to_string(), name.to_string());
    labels.insert(COMPONENT_LABEL.to_string(), COMPONENT.to_string());
    labels
}

/// Normalise a CSI volume name into a valid resource name.
pub fn volume_name(name: &str) -> String {
    name.to_lowercase().chars().take(MAX_NAME_LEN).collect()
}

/// Storage class parameters understood by CreateVolume.
pub mod parameters {
    pub const NAMESPACE: &str = "namespace";
    pub const REPLICA_SC: &str = "replicaSC";
    pub const REPLICA_COUNT: &str = "replicaCount";
    pub const REPLICA_MIN_CPU: &str = "replicaMinCPU";
    pub const REPLICA_MIN_MEMORY: &str = "replicaMinMemory";
    pub const REPLICA_MAX_CPU: &str = "replicaMaxCPU";
    pub const REPLICA_MAX_MEMORY: &str = "replicaMaxMemory";
    pub const TARGET_MIN_CPU: &str = "targetMinCPU";
    pub const TARGET_MIN_MEMORY: &str = "targetMinMemory";
    pub const TARGET_MAX_CPU: &str = "targetMaxCPU";
    pub const TARGET_MAX_MEMORY: &str = "targetMaxMemory";
}

/// Values used for everything a CreateVolume request leaves out.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeDefaults {
    pub namespace: String,
    pub replica_sc: String,
    pub replication_factor: u32,
    pub capacity_bytes: i64,
    pub resource_quantity: String,
}

impl Default for VolumeDefaults {
    fn default() -> Self {
        Self {
            namespace: "openebs".to_string(),
            replica_sc: "openebs-hostpath".to_string(),
            replication_factor: 3,
            capacity_bytes: 10 * GIB,
            resource_quantity: "0".to_string(),
        }
    }
}

impl VolumeDefaults {
    /// Defaults which place volumes in the given namespace.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }
}

/// Errors building a volume from a CreateVolume request.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum BuildError {
    #[snafu(display("Missing volume name"))]
    MissingName {},
    #[snafu(display("Invalid {} parameter '{}': {}", key, value, source))]
    InvalidParameter {
        key: String,
        value: String,
        source: std::num::ParseIntError,
    },
    #[snafu(display(
        "Capacity of {} bytes cannot be provisioned in whole GiB",
        bytes
    ))]
    CapacityOutOfRange { bytes: i64 },
}

impl From<BuildError> for tonic::Status {
    fn from(error: BuildError) -> Self {
        match error {
            BuildError::CapacityOutOfRange { .. } => {
                tonic::Status::out_of_range(error.to_string())
            }
            _ => tonic::Status::invalid_argument(error.to_string()),
        }
    }
}

/// Capacity in bytes the volume is provisioned with: the requested size
/// rounded up to whole GiB, or the default size.
pub fn provisioned_bytes(
    request: &CreateVolumeRequest,
    defaults: &VolumeDefaults,
) -> Result<i64, BuildError> {
    let bytes = match &request.capacity_range {
        Some(range) if range.required_bytes > 0 => range.required_bytes,
        Some(range) if range.limit_bytes > 0 => range.limit_bytes,
        _ => defaults.capacity_bytes,
    };
    round_up_to_gib(bytes)
        .checked_mul(GIB)
        .ok_or(BuildError::CapacityOutOfRange { bytes })
}

fn round_up_to_gib(bytes: i64) -> i64 {
    bytes / GIB + i64::from(bytes % GIB != 0)
}

/// Build the full volume resource for a CreateVolume request, filling
/// whatever the request leaves out from `defaults`.
pub fn volume_from_request(
    request: &CreateVolumeRequest,
    defaults: &VolumeDefaults,
) -> Result<JivaVolume, BuildError> {
    use parameters::*;

    if request.name.is_empty() {
        return MissingName {}.fail();
    }
    let params = &request.parameters;
    let name = volume_name(&request.name);
    let namespace = param_or(params, NAMESPACE, &defaults.namespace);
    let replication_factor = match params.get(REPLICA_COUNT) {
        Some(value) if !value.is_empty() => {
            value.parse::<u32>().map_err(|source| {
                BuildError::InvalidParameter {
                    key: REPLICA_COUNT.to_string(),
                    value: value.clone(),
                    source,
                }
            })?
        }
        _ => defaults.replication_factor,
    };
    let capacity =
        format!("{}Gi", provisioned_bytes(request, defaults)? / GIB);

    let quantity =
        |key: &str| Quantity(param_or(params, key, &defaults.resource_quantity));
    let resources = |min_cpu: &str,
                     min_memory: &str,
                     max_cpu: &str,
                     max_memory: &str| {
        ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), quantity(min_cpu)),
                ("memory".to_string(), quantity(min_memory)),
            ])),
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), quantity(max_cpu)),
                ("memory".to_string(), quantity(max_memory)),
            ])),
            ..Default::default()
        }
    };

    let spec = JivaVolumeSpec {
        pv: name.clone(),
        capacity,
        desired_replication_factor: replication_factor,
        policy: JivaVolumePolicySpec {
            replica_sc: param_or(params, REPLICA_SC, &defaults.replica_sc),
            target: TargetSpec {
                pod: PodTemplateResources {
                    resources: Some(resources(
                        TARGET_MIN_CPU,
                        TARGET_MIN_MEMORY,
                        TARGET_MAX_CPU,
                        TARGET_MAX_MEMORY,
                    )),
                    tolerations: Some(vec![]),
                    affinity: Some(Affinity::default()),
                    node_selector: None,
                    priority_class_name: String::new(),
                },
                replication_factor,
                aux_resources: Some(ResourceRequirements::default()),
                disable_monitor: false,
            },
            replica: ReplicaSpec {
                pod: PodTemplateResources {
                    resources: Some(resources(
                        REPLICA_MIN_CPU,
                        REPLICA_MIN_MEMORY,
                        REPLICA_MAX_CPU,
                        REPLICA_MAX_MEMORY,
                    )),
                    tolerations: None,
                    affinity: Some(Affinity::default()),
                    node_selector: None,
                    priority_class_name: String::new(),
                },
            },
            ..Default::default()
        },
        ..Default::default()
    };

    let mut volume = JivaVolume::new(&name, spec);
    volume.metadata.namespace = Some(namespace);
    volume.metadata.labels = Some(labels(&name));
    Ok(volume)
}

fn param_or(
    params: &HashMap<String, String>,
    key: &str,
    default: &str,
) -> String {
    match params.get(key) {
        Some(value) if !value.is_empty() => value.clone(),
        _ => default.to_string(),
    }
}
