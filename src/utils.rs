//! Naming, labels and role helpers shared by the transformers.

use crate::client::Labels;
use crate::crd::{ConsensusSet, MemberStatus, ReplicaRole};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use std::cmp::Ordering;
use std::fmt;

pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const OWNER_LABEL: &str = "owner.pikach.us";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "consensusset";

pub const ROLE_LABEL: &str = "pikach.us/role";
pub const ACCESS_MODE_LABEL: &str = "pikach.us/access-mode";
pub const GENERATION_LABEL: &str = "pikach.us/generation";
pub const REVISION_LABEL: &str = "controller-revision-hash";

pub const JOB_SCENARIO_LABEL: &str = "jobs.pikach.us/scenario";
pub const JOB_TYPE_LABEL: &str = "jobs.pikach.us/type";
pub const JOB_HANDLED_LABEL: &str = "jobs.pikach.us/handled";
pub const JOB_ORDINAL_LABEL: &str = "jobs.pikach.us/ordinal";
pub const JOB_GENERATION_LABEL: &str = "jobs.pikach.us/generation";

pub const BACKUP_PROTECTION_LABEL: &str = "dataprotection.pikach.us/backup-protection";
pub const BACKUP_RETAIN: &str = "Retain";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionType {
    Switchover,
    MemberJoin,
    MemberLeave,
    LogSync,
    Promote,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Switchover => "switchover",
            ActionType::MemberJoin => "member-join",
            ActionType::MemberLeave => "member-leave",
            ActionType::LogSync => "log-sync",
            ActionType::Promote => "promote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "switchover" => Some(ActionType::Switchover),
            "member-join" => Some(ActionType::MemberJoin),
            "member-leave" => Some(ActionType::MemberLeave),
            "log-sync" => Some(ActionType::LogSync),
            "promote" => Some(ActionType::Promote),
            _ => None,
        }
    }

    /// Pre actions run while the target ordinal is still a member.
    pub fn is_pre_action(&self) -> bool {
        matches!(self, ActionType::Switchover | ActionType::MemberLeave)
    }

    /// Event reason for this action.
    pub fn reason(&self) -> String {
        self.as_str().to_uppercase()
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    MembershipReconfiguration,
    PodUpdate,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::MembershipReconfiguration => "membership-reconfiguration",
            Scenario::PodUpdate => "pod-update",
        }
    }
}

/// Role priority, lowest gets recreated first and leaves last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RolePriority {
    Unknown,
    Empty,
    Learner,
    FollowerNone,
    FollowerReadonly,
    FollowerReadWrite,
    Leader,
}

impl RolePriority {
    pub fn of_role(role: &ReplicaRole) -> Self {
        use crate::crd::AccessMode;
        if role.is_leader {
            RolePriority::Leader
        } else if role.can_vote {
            match role.access_mode {
                AccessMode::None => RolePriority::FollowerNone,
                AccessMode::Readonly => RolePriority::FollowerReadonly,
                AccessMode::ReadWrite => RolePriority::FollowerReadWrite,
            }
        } else {
            RolePriority::Learner
        }
    }

    /// Priority of a role label value; an absent label is `Empty`, one naming no role `Unknown`.
    pub fn of_name(roles: &[ReplicaRole], name: &str) -> Self {
        if name.is_empty() {
            return RolePriority::Empty;
        }
        find_role(roles, name).map_or(RolePriority::Unknown, RolePriority::of_role)
    }
}

pub fn find_role<'a>(roles: &'a [ReplicaRole], name: &str) -> Option<&'a ReplicaRole> {
    roles.iter().find(|r| r.name.eq_ignore_ascii_case(name))
}

/// Labels carried by every object the operator creates for `name`.
pub fn owned_labels(name: &str) -> Labels {
    Labels::from([
        (INSTANCE_LABEL.to_string(), name.to_string()),
        (OWNER_LABEL.to_string(), name.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ])
}

/// Pod selector: the owned labels plus any configured in the spec.
pub fn selector_labels(cs: &ConsensusSet) -> Labels {
    let mut labels = owned_labels(&cs_name(cs));
    if let Some(extra) = &cs.spec.selector {
        labels.extend(extra.clone());
    }
    labels
}

pub fn cs_name(cs: &ConsensusSet) -> String {
    cs.metadata.name.clone().unwrap_or_default()
}

pub fn cs_namespace(cs: &ConsensusSet) -> String {
    cs.metadata.namespace.clone().unwrap_or_default()
}

pub fn headless_svc_name(parent: &str) -> String {
    format!("{}-headless", parent)
}

pub fn env_config_name(parent: &str) -> String {
    format!("{}-env", parent)
}

pub fn pod_name(parent: &str, ordinal: i32) -> String {
    format!("{}-{}", parent, ordinal)
}

/// Stable host name of a pod behind the headless service.
pub fn pod_host(parent: &str, pod: &str) -> String {
    format!("{}.{}", pod, headless_svc_name(parent))
}

pub fn action_name(parent: &str, generation: i64, ordinal: i32, action: ActionType) -> String {
    format!("{}-{}-{}-{}", parent, generation, ordinal, action)
}

/// Splits `{parent}-{ordinal}`.
pub fn parent_and_ordinal(name: &str) -> Option<(&str, i32)> {
    let (parent, ordinal) = name.rsplit_once('-')?;
    Some((parent, ordinal.parse().ok()?))
}

pub fn ordinal_of(name: &str) -> Option<i32> {
    parent_and_ordinal(name).map(|(_, o)| o)
}

/// Ordinal of an action job name `{parent}-{generation}-{ordinal}-{type}`.
pub fn action_ordinal(name: &str) -> Option<i32> {
    // the type may contain dashes, the ordinal is the last numeric segment
    name.rsplit('-').find_map(|seg| seg.parse().ok())
}

pub fn label_of<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

pub fn role_name(pod: &Pod) -> String {
    label_of(pod, ROLE_LABEL).unwrap_or_default().to_lowercase()
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map_or(false, |cs| {
            cs.iter().any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub fn pod_ordinal(pod: &Pod) -> i32 {
    pod.metadata
        .name
        .as_deref()
        .and_then(ordinal_of)
        .unwrap_or(0)
}

/// Ascending priority, ties by ascending ordinal.
pub fn sort_pods(pods: &mut [Pod], roles: &[ReplicaRole]) {
    pods.sort_by(|a, b| {
        let pa = RolePriority::of_name(roles, &role_name(a));
        let pb = RolePriority::of_name(roles, &role_name(b));
        pa.cmp(&pb).then_with(|| pod_ordinal(a).cmp(&pod_ordinal(b)))
    });
}

fn member_cmp(a: &MemberStatus, b: &MemberStatus) -> Ordering {
    let pa = RolePriority::of_role(&a.role);
    let pb = RolePriority::of_role(&b.role);
    let oa = ordinal_of(&a.pod_name).unwrap_or(0);
    let ob = ordinal_of(&b.pod_name).unwrap_or(0);
    pb.cmp(&pa).then_with(|| oa.cmp(&ob))
}

/// Descending priority, ties by ascending ordinal.
pub fn sort_members_status(members: &mut [MemberStatus]) {
    members.sort_by(member_cmp);
}

pub fn leader_pod_name(members: &[MemberStatus]) -> Option<&str> {
    members
        .iter()
        .find(|m| m.role.is_leader)
        .map(|m| m.pod_name.as_str())
}

pub fn is_member(members: &[MemberStatus], pod: &str) -> bool {
    members.iter().any(|m| m.pod_name == pod)
}

/// Rebuilds `status.membersStatus` from the live pods.
///
/// Ready pods whose role label names a defined role become members. A member
/// without such a pod is kept while its ordinal is below `spec.replicas`.
pub fn set_members_status(cs: &mut ConsensusSet, pods: &[Pod]) {
    let mut members: Vec<MemberStatus> = pods
        .iter()
        .filter(|p| is_pod_ready(p) && label_of(p, ROLE_LABEL).is_some())
        .filter_map(|p| {
            let role = find_role(&cs.spec.roles, &role_name(p))?;
            Some(MemberStatus {
                pod_name: p.metadata.name.clone().unwrap_or_default(),
                role: role.clone(),
            })
        })
        .collect();

    let replicas = cs.spec.replicas;
    let kept: Vec<MemberStatus> = cs
        .members()
        .iter()
        .filter(|old| !is_member(&members, &old.pod_name))
        .filter(|old| ordinal_of(&old.pod_name).map_or(false, |o| o < replicas))
        .cloned()
        .collect();
    members.extend(kept);

    sort_members_status(&mut members);
    cs.status_mut().members_status = members;
}

/// Every ordinal below `spec.replicas` is a member, nothing else is, and
/// exactly one member leads.
pub fn is_consensus_ready(cs: &ConsensusSet) -> bool {
    let members = cs.members();
    let parent = cs_name(cs);
    members.len() == cs.spec.replicas.max(0) as usize
        && (0..cs.spec.replicas).all(|i| is_member(members, &pod_name(&parent, i)))
        && members.iter().filter(|m| m.role.is_leader).count() == 1
}

/// The controller has observed the latest spec and every pod it wants is ready.
pub fn is_sts_ready(sts: &StatefulSet) -> bool {
    let (status, spec) = match (&sts.status, &sts.spec) {
        (Some(status), Some(spec)) => (status, spec),
        _ => return false,
    };
    status.observed_generation == sts.metadata.generation
        && Some(status.replicas) == spec.replicas
        && status.ready_replicas.unwrap_or(0) == status.replicas
}

pub fn sts_ready_replicas(sts: &StatefulSet) -> i32 {
    sts.status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}
