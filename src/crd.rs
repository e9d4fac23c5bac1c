use k8s_openapi::api::core::v1::{
    EnvVarSource, PersistentVolumeClaim, PodTemplateSpec, ServiceSpec,
};
use kube::ResourceExt;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const FINALIZER: &str = "pikach.us/consensusset-finalizer";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "pikach.us",
    version = "v1",
    kind = "ConsensusSet",
    status = "ConsensusSetStatus",
    shortname = "cs",
    derive = "PartialEq",
    scale = r#"{"specReplicasPath":".spec.replicas", "statusReplicasPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusSetSpec {
    /// replicas is the desired number of members. Defaults to 1.
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// selector adds match labels on top of the ones the operator manages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<BTreeMap<String, String>>,

    /// service, if set, is the read-write service routed to the leader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceTemplate>,

    pub template: PodTemplateSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_management_policy: Option<String>,

    /// memberUpdateStrategy switches the underlying statefulset to OnDelete
    /// and lets the operator pick the pod recreation order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_update_strategy: Option<MemberUpdateStrategy>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<ReplicaRole>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership_reconfiguration: Option<MembershipReconfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,

    #[serde(default)]
    pub termination_policy: TerminationPolicy,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    pub spec: ServiceSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaRole {
    pub name: String,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub can_vote: bool,
    #[serde(default)]
    pub is_leader: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Default, JsonSchema)]
pub enum AccessMode {
    ReadWrite,
    Readonly,
    #[default]
    None,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "ReadWrite",
            AccessMode::Readonly => "Readonly",
            AccessMode::None => "None",
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum MemberUpdateStrategy {
    /// unknown -> empty -> learner -> followers(none -> readonly -> readwrite) -> leader, one by one.
    Serial,
    /// learners and a minority of followers first, then the rest, the leader last.
    BestEffortParallel,
    Parallel,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Default, JsonSchema)]
pub enum TerminationPolicy {
    DoNotTerminate,
    Halt,
    #[default]
    Delete,
    WipeOut,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MembershipReconfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switchover_action: Option<ReconfigurationAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_join_action: Option<ReconfigurationAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_leave_action: Option<ReconfigurationAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_sync_action: Option<ReconfigurationAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promote_action: Option<ReconfigurationAction>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconfigurationAction {
    /// image falls back to the previous configured action's image, then to the operator default.
    #[serde(default)]
    pub image: String,
    pub command: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub username: CredentialVar,
    pub password: CredentialVar,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialVar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusSetStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// currentGeneration is the generation label of the live statefulset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_generation: Option<i64>,

    /// replicas is the number of Pods created by the StatefulSet controller.
    #[serde(default)]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,

    /// initReplicas is spec.replicas as seen on the first reconcile, it never changes afterwards.
    #[serde(default)]
    pub init_replicas: i32,

    /// readyInitReplicas counts members seen while initializing, frozen once it reaches initReplicas.
    #[serde(default)]
    pub ready_init_replicas: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members_status: Vec<MemberStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// message holds the last abnormal condition text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    pub pod_name: String,
    pub role: ReplicaRole,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    Initializing,
    Reconfiguring,
    Stable,
    Degraded,
    Deleting,
}

impl ConsensusSet {
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn members(&self) -> &[MemberStatus] {
        self.status
            .as_ref()
            .map(|s| s.members_status.as_slice())
            .unwrap_or(&[])
    }

    pub fn status_mut(&mut self) -> &mut ConsensusSetStatus {
        self.status.get_or_insert_with(ConsensusSetStatus::default)
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    pub fn leader_role(&self) -> Option<&ReplicaRole> {
        self.spec.roles.iter().find(|r| r.is_leader)
    }
}
