//! Desired state of the objects a ConsensusSet owns.
//!
//! Every builder is a pure function of the ConsensusSet so that repeated
//! reconciles produce equal objects.

use crate::crd::{ConsensusSet, MembershipReconfiguration, ReconfigurationAction, FINALIZER};
use crate::utils::*;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, EnvFromSource, EnvVar, PodSpec, PodTemplateSpec,
    Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use std::collections::BTreeMap;

pub const LEADER_HOST_ENV: &str = "CS_LEADER_HOST";
pub const TARGET_HOST_ENV: &str = "CS_TARGET_HOST";
pub const SERVICE_PORT_ENV: &str = "CS_SERVICE_PORT";
pub const USERNAME_ENV: &str = "CS_USERNAME";
pub const PASSWORD_ENV: &str = "CS_PASSWORD";
const ENV_PREFIX: &str = "CS_";

fn object_meta(cs: &ConsensusSet, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cs.metadata.namespace.clone(),
        labels: Some(owned_labels(&cs_name(cs))),
        ..Default::default()
    }
}

/// Makes `cs` the controller owner of `meta` and adds the finalizer.
pub fn set_ownership(cs: &ConsensusSet, meta: &mut ObjectMeta) {
    if let Some(owner) = cs.controller_owner_ref(&()) {
        meta.owner_references = Some(vec![owner]);
    }
    let finalizers = meta.finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == FINALIZER) {
        finalizers.push(FINALIZER.to_string());
    }
}

pub fn build_sts(cs: &ConsensusSet) -> StatefulSet {
    let name = cs_name(cs);
    let mut meta = object_meta(cs, name.clone());
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(GENERATION_LABEL.to_string(), cs.generation().to_string());

    let selector = selector_labels(cs);
    let mut template = cs.spec.template.clone();
    let tmpl_meta = template.metadata.get_or_insert_with(Default::default);
    tmpl_meta
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(selector.clone());
    if let Some(pod_spec) = template.spec.as_mut() {
        for c in pod_spec.containers.iter_mut() {
            c.env_from.get_or_insert_with(Vec::new).push(EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: env_config_name(&name),
                    optional: Some(false),
                }),
                ..Default::default()
            });
        }
    }

    let update_strategy = cs.spec.member_update_strategy.map(|_| StatefulSetUpdateStrategy {
        type_: Some("OnDelete".to_string()),
        rolling_update: None,
    });

    StatefulSet {
        metadata: meta,
        spec: Some(StatefulSetSpec {
            replicas: Some(cs.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            service_name: headless_svc_name(&name),
            pod_management_policy: cs.spec.pod_management_policy.clone(),
            template,
            volume_claim_templates: if cs.spec.volume_claim_templates.is_empty() {
                None
            } else {
                Some(cs.spec.volume_claim_templates.clone())
            },
            update_strategy,
            ..Default::default()
        }),
        status: None,
    }
}

pub fn build_headless_svc(cs: &ConsensusSet) -> Service {
    let name = cs_name(cs);
    let ports: Vec<ServicePort> = cs
        .spec
        .template
        .spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .map(|p| {
            let protocol = p.protocol.clone().unwrap_or_else(|| "TCP".to_string());
            let (port_name, target) = match &p.name {
                Some(n) if !n.is_empty() => (n.clone(), IntOrString::String(n.clone())),
                _ => (
                    format!("{}-{}", protocol.to_lowercase(), p.container_port),
                    IntOrString::Int(p.container_port),
                ),
            };
            ServicePort {
                name: Some(port_name),
                port: p.container_port,
                protocol: Some(protocol),
                target_port: Some(target),
                ..Default::default()
            }
        })
        .collect();

    Service {
        metadata: object_meta(cs, headless_svc_name(&name)),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector_labels(cs)),
            ports: if ports.is_empty() { None } else { Some(ports) },
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        status: None,
    }
}

/// The client service, routed to the leader. None if the spec asks for no service.
pub fn build_svc(cs: &ConsensusSet) -> Option<Service> {
    let tmpl = cs.spec.service.as_ref()?;
    let mut meta = object_meta(cs, cs_name(cs));
    if let Some(extra) = &tmpl.labels {
        meta.labels.get_or_insert_with(BTreeMap::new).extend(extra.clone());
    }
    let mut selector = selector_labels(cs);
    if let Some(leader) = cs.leader_role() {
        selector.insert(ROLE_LABEL.to_string(), leader.name.to_lowercase());
    }
    let mut spec = tmpl.spec.clone();
    spec.selector = Some(selector);
    Some(Service {
        metadata: meta,
        spec: Some(spec),
        status: None,
    })
}

pub fn build_env_config_map(cs: &ConsensusSet) -> ConfigMap {
    let name = cs_name(cs);
    let mut data = BTreeMap::new();
    data.insert(format!("{}N", ENV_PREFIX), cs.spec.replicas.to_string());
    for i in 0..cs.spec.replicas {
        data.insert(
            format!("{}{}_HOSTNAME", ENV_PREFIX, i),
            pod_host(&name, &pod_name(&name, i)),
        );
    }
    let mut followers = vec![];
    for m in cs.members() {
        if m.role.is_leader {
            data.insert(format!("{}LEADER", ENV_PREFIX), m.pod_name.clone());
        } else if m.role.can_vote {
            followers.push(m.pod_name.as_str());
        }
    }
    if !followers.is_empty() {
        data.insert(format!("{}FOLLOWERS", ENV_PREFIX), followers.join(","));
    }
    let uid = cs.metadata.uid.clone().unwrap_or_default();
    let suffix = uid.len().saturating_sub(8);
    data.insert(
        format!("{}OWNER_UID_SUFFIX8", ENV_PREFIX),
        uid.get(suffix..).unwrap_or_default().to_string(),
    );
    data.insert(format!("{}OWNER_UID", ENV_PREFIX), uid);

    ConfigMap {
        metadata: object_meta(cs, env_config_name(&name)),
        data: Some(data),
        ..Default::default()
    }
}

/// Keeps a quorum available during voluntary disruptions.
pub fn build_pdb(cs: &ConsensusSet) -> Option<PodDisruptionBudget> {
    if cs.spec.roles.is_empty() || cs.spec.replicas < 3 {
        return None;
    }
    Some(PodDisruptionBudget {
        metadata: object_meta(cs, cs_name(cs)),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(cs.spec.replicas / 2 + 1)),
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(cs)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// Container port the client service targets, 0 if unknown.
pub fn find_svc_port(cs: &ConsensusSet) -> i32 {
    let port = match cs
        .spec
        .service
        .as_ref()
        .and_then(|s| s.spec.ports.as_ref())
        .and_then(|p| p.first())
    {
        Some(p) => p,
        None => return 0,
    };
    let containers = cs.spec.template.spec.iter().flat_map(|s| s.containers.iter());
    for c in containers {
        for p in c.ports.iter().flatten() {
            let hit = match &port.target_port {
                Some(IntOrString::String(n)) => p.name.as_deref() == Some(n.as_str()),
                Some(IntOrString::Int(i)) => p.container_port == *i,
                None => p.container_port == port.port,
            };
            if hit {
                return p.container_port;
            }
        }
    }
    0
}

fn configured(reconf: &MembershipReconfiguration, action: ActionType) -> Option<&ReconfigurationAction> {
    match action {
        ActionType::Switchover => reconf.switchover_action.as_ref(),
        ActionType::MemberJoin => reconf.member_join_action.as_ref(),
        ActionType::MemberLeave => reconf.member_leave_action.as_ref(),
        ActionType::LogSync => reconf.log_sync_action.as_ref(),
        ActionType::Promote => reconf.promote_action.as_ref(),
    }
}

pub fn is_action_configured(cs: &ConsensusSet, action: ActionType) -> bool {
    cs.spec
        .membership_reconfiguration
        .as_ref()
        .map_or(false, |r| configured(r, action).is_some())
}

/// First image set along promote, log-sync, member-leave, member-join,
/// switchover, starting at `action`.
pub fn find_action_image(reconf: &MembershipReconfiguration, action: ActionType, default: &str) -> String {
    const FALLBACK: [ActionType; 5] = [
        ActionType::Promote,
        ActionType::LogSync,
        ActionType::MemberLeave,
        ActionType::MemberJoin,
        ActionType::Switchover,
    ];
    let start = FALLBACK.iter().position(|a| *a == action).unwrap_or(0);
    FALLBACK[start..]
        .iter()
        .filter_map(|a| configured(reconf, *a))
        .map(|a| a.image.as_str())
        .find(|image| !image.is_empty())
        .unwrap_or(default)
        .to_string()
}

/// Parameters of one control action job.
pub struct ActionRequest<'a> {
    pub action: ActionType,
    pub scenario: Scenario,
    pub ordinal: i32,
    pub leader: &'a str,
    pub target: &'a str,
}

pub fn build_action(cs: &ConsensusSet, req: &ActionRequest<'_>, default_image: &str) -> Job {
    let parent = cs_name(cs);
    let name = action_name(&parent, cs.generation(), req.ordinal, req.action);
    let mut meta = object_meta(cs, name);
    meta.labels.get_or_insert_with(BTreeMap::new).extend([
        (JOB_SCENARIO_LABEL.to_string(), req.scenario.as_str().to_string()),
        (JOB_TYPE_LABEL.to_string(), req.action.as_str().to_string()),
        (JOB_HANDLED_LABEL.to_string(), "false".to_string()),
        (JOB_ORDINAL_LABEL.to_string(), req.ordinal.to_string()),
        (JOB_GENERATION_LABEL.to_string(), cs.generation().to_string()),
    ]);
    set_ownership(cs, &mut meta);

    let mut env = vec![
        EnvVar {
            name: LEADER_HOST_ENV.to_string(),
            value: Some(pod_host(&parent, req.leader)),
            value_from: None,
        },
        EnvVar {
            name: SERVICE_PORT_ENV.to_string(),
            value: Some(find_svc_port(cs).to_string()),
            value_from: None,
        },
        EnvVar {
            name: TARGET_HOST_ENV.to_string(),
            value: Some(pod_host(&parent, req.target)),
            value_from: None,
        },
    ];
    if let Some(cred) = &cs.spec.credential {
        env.push(EnvVar {
            name: USERNAME_ENV.to_string(),
            value: cred.username.value.clone(),
            value_from: cred.username.value_from.clone(),
        });
        env.push(EnvVar {
            name: PASSWORD_ENV.to_string(),
            value: cred.password.value.clone(),
            value_from: cred.password.value_from.clone(),
        });
    }

    let (image, command) = match &cs.spec.membership_reconfiguration {
        Some(reconf) => (
            find_action_image(reconf, req.action, default_image),
            configured(reconf, req.action).map(|a| a.command.clone()),
        ),
        None => (default_image.to_string(), None),
    };

    Job {
        metadata: meta,
        spec: Some(JobSpec {
            suspend: Some(false),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: req.action.as_str().to_string(),
                        image: Some(image),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        command,
                        env: Some(env),
                        ..Default::default()
                    }],
                    restart_policy: Some("OnFailure".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::consensus_set;

    #[test]
    fn statefulset_selects_its_pods_and_mounts_env() {
        let cs = consensus_set("db", 3);
        let sts = build_sts(&cs);
        let spec = sts.spec.unwrap();
        assert_eq!(spec.service_name.as_str(), "db-headless");
        let selector = spec.selector.match_labels.unwrap();
        let pod_labels = spec.template.metadata.unwrap().labels.unwrap();
        assert!(selector.iter().all(|(k, v)| pod_labels.get(k) == Some(v)));
        let env_from = spec.template.spec.unwrap().containers[0].env_from.clone().unwrap();
        assert_eq!(env_from[0].config_map_ref.as_ref().unwrap().name, "db-env");
        assert_eq!(
            spec.update_strategy.and_then(|s| s.type_).as_deref(),
            Some("OnDelete")
        );
        assert_eq!(sts.metadata.labels.unwrap()[GENERATION_LABEL], "1");
    }

    #[test]
    fn env_config_lists_hosts_and_members() {
        let cs = consensus_set("db", 3);
        let data = build_env_config_map(&cs).data.unwrap();
        assert_eq!(data["CS_N"], "3");
        assert_eq!(data["CS_2_HOSTNAME"], "db-2.db-headless");
        assert_eq!(data["CS_LEADER"], "db-0");
        assert_eq!(data["CS_FOLLOWERS"], "db-1,db-2");
    }

    #[test]
    fn pdb_only_for_quorum_sets() {
        assert!(build_pdb(&consensus_set("db", 1)).is_none());
        let pdb = build_pdb(&consensus_set("db", 5)).unwrap();
        assert_eq!(pdb.spec.unwrap().min_available, Some(IntOrString::Int(3)));
    }

    #[test]
    fn client_service_routes_to_leader() {
        let cs = consensus_set("db", 3);
        let svc = build_svc(&cs).unwrap();
        let selector = svc.spec.unwrap().selector.unwrap();
        assert_eq!(selector[ROLE_LABEL], "leader");
        assert_eq!(selector[INSTANCE_LABEL], "db");
        assert_eq!(find_svc_port(&cs), 3306);
    }

    #[test]
    fn action_image_falls_back_along_the_chain() {
        let reconf = MembershipReconfiguration {
            member_join_action: Some(ReconfigurationAction {
                image: "join:1".into(),
                command: vec!["join".into()],
            }),
            promote_action: Some(ReconfigurationAction {
                image: String::new(),
                command: vec!["promote".into()],
            }),
            ..Default::default()
        };
        assert_eq!(find_action_image(&reconf, ActionType::Promote, "busybox"), "join:1");
        assert_eq!(find_action_image(&reconf, ActionType::Switchover, "busybox"), "busybox");
    }

    #[test]
    fn action_job_is_labelled_and_owned() {
        let cs = consensus_set("db", 3);
        let req = ActionRequest {
            action: ActionType::MemberJoin,
            scenario: Scenario::MembershipReconfiguration,
            ordinal: 3,
            leader: "db-0",
            target: "db-3",
        };
        let job = build_action(&cs, &req, "busybox:latest");
        assert_eq!(job.metadata.name.as_deref(), Some("db-1-3-member-join"));
        let labels = job.metadata.labels.clone().unwrap();
        assert_eq!(labels[JOB_HANDLED_LABEL], "false");
        assert_eq!(labels[JOB_ORDINAL_LABEL], "3");
        assert_eq!(labels[JOB_SCENARIO_LABEL], "membership-reconfiguration");
        assert_eq!(job.metadata.finalizers, Some(vec![FINALIZER.to_string()]));
        let spec = job.spec.unwrap();
        assert_eq!(spec.suspend, Some(false));
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.name, "member-join");
        let env = container.env.clone().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == TARGET_HOST_ENV && e.value.as_deref() == Some("db-3.db-headless")));
    }
}
