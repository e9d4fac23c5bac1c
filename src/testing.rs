//! In-memory cluster and fixtures for unit tests.

use crate::builders::build_sts;
use crate::client::{ClusterClient, Labels};
use crate::crd::*;
use crate::errors::*;
use crate::model::{Object, ObjectKey, ObjectKind};
use crate::utils::*;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Pod, PodCondition, PodSpec, PodStatus, PodTemplateSpec, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::error::ErrorResponse;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq)]
pub enum FakeCall {
    Create(ObjectKey),
    Update(ObjectKey),
    Delete(ObjectKey),
    PatchStatus(ObjectKey),
}

/// A namespace-aware object store answering like the API server would.
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<ObjectKey, Object>>,
    calls: Mutex<Vec<FakeCall>>,
}

fn api_error(code: u16, reason: &str, key: &ObjectKey) -> Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} {}", key, reason),
        reason: reason.to_string(),
        code,
    })
    .into()
}

fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}

impl FakeCluster {
    pub fn with(objects: Vec<Object>) -> Self {
        let fake = FakeCluster::default();
        for o in objects {
            fake.insert(o);
        }
        fake
    }

    pub fn insert(&self, obj: Object) {
        self.objects.lock().unwrap().insert(obj.key(), obj);
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn object(&self, key: &ObjectKey) -> Option<Object> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, call: FakeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(&self, kind: &ObjectKind, namespace: &str, name: &str) -> Result<Option<Object>> {
        let key = ObjectKey {
            kind: kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        Ok(self.object(&key))
    }

    async fn list(&self, kind: &ObjectKind, namespace: &str, labels: &Labels) -> Result<Vec<Object>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .values()
            .filter(|o| o.kind() == *kind && o.namespace() == namespace)
            .filter(|o| labels.iter().all(|(k, v)| o.label(k) == Some(v.as_str())))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &Object) -> Result<Object> {
        let key = obj.key();
        self.log(FakeCall::Create(key.clone()));
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", &key));
        }
        objects.insert(key, obj.clone());
        Ok(obj.clone())
    }

    async fn update(&self, obj: &Object) -> Result<Object> {
        let key = obj.key();
        self.log(FakeCall::Update(key.clone()));
        let mut objects = self.objects.lock().unwrap();
        if !objects.contains_key(&key) {
            return Err(api_error(404, "NotFound", &key));
        }
        objects.insert(key, obj.clone());
        Ok(obj.clone())
    }

    async fn delete(&self, obj: &Object) -> Result<()> {
        let key = obj.key();
        self.log(FakeCall::Delete(key.clone()));
        match self.objects.lock().unwrap().remove(&key) {
            Some(_) => Ok(()),
            None => Err(api_error(404, "NotFound", &key)),
        }
    }

    async fn patch_status(&self, obj: &Object, patch: &Value) -> Result<()> {
        let key = obj.key();
        self.log(FakeCall::PatchStatus(key.clone()));
        let mut objects = self.objects.lock().unwrap();
        let stored = match objects.get(&key) {
            Some(o) => o,
            None => return Err(api_error(404, "NotFound", &key)),
        };
        if let Object::ConsensusSet(cs) = stored {
            let mut value = serde_json::to_value(&**cs)?;
            merge_patch(&mut value, patch);
            let patched: ConsensusSet = serde_json::from_value(value)?;
            objects.insert(key, patched.into());
        }
        Ok(())
    }
}

pub fn roles() -> Vec<ReplicaRole> {
    vec![
        ReplicaRole {
            name: "leader".into(),
            access_mode: AccessMode::ReadWrite,
            can_vote: true,
            is_leader: true,
        },
        ReplicaRole {
            name: "follower".into(),
            access_mode: AccessMode::Readonly,
            can_vote: true,
            is_leader: false,
        },
        ReplicaRole {
            name: "learner".into(),
            access_mode: AccessMode::None,
            can_vote: false,
            is_leader: false,
        },
    ]
}

fn action(image: &str, cmd: &str) -> Option<ReconfigurationAction> {
    Some(ReconfigurationAction {
        image: image.to_string(),
        command: vec![cmd.to_string()],
    })
}

pub fn members(parent: &str, count: i32) -> Vec<MemberStatus> {
    let roles = roles();
    (0..count)
        .map(|i| MemberStatus {
            pod_name: pod_name(parent, i),
            role: if i == 0 { roles[0].clone() } else { roles[1].clone() },
        })
        .collect()
}

/// A settled set: every replica is a member, ordinal 0 leads.
pub fn consensus_set(name: &str, replicas: i32) -> ConsensusSet {
    let mut cs = ConsensusSet::new(
        name,
        ConsensusSetSpec {
            replicas,
            service: Some(ServiceTemplate {
                labels: None,
                spec: ServiceSpec {
                    ports: Some(vec![ServicePort {
                        name: Some("mysql".into()),
                        port: 3306,
                        target_port: Some(IntOrString::String("mysql".into())),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
            }),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "mysql".into(),
                        image: Some("mysql:8.0".into()),
                        ports: Some(vec![ContainerPort {
                            name: Some("mysql".into()),
                            container_port: 3306,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            member_update_strategy: Some(MemberUpdateStrategy::Serial),
            roles: roles(),
            membership_reconfiguration: Some(MembershipReconfiguration {
                switchover_action: action("tools:1", "switchover"),
                member_join_action: action("tools:1", "join"),
                member_leave_action: action("tools:1", "leave"),
                log_sync_action: action("", "sync"),
                promote_action: action("", "promote"),
            }),
            termination_policy: TerminationPolicy::Delete,
            ..Default::default()
        },
    );
    cs.metadata.namespace = Some("default".into());
    cs.metadata.uid = Some("5f0c6a52-9d3e-4f7b-8a11-2c4d6e8f0a1b".into());
    cs.metadata.generation = Some(1);
    cs.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    cs.status = Some(ConsensusSetStatus {
        replicas,
        ready_replicas: Some(replicas),
        init_replicas: replicas,
        ready_init_replicas: replicas,
        members_status: members(name, replicas),
        update_revision: Some("rev-1".into()),
        current_revision: Some("rev-1".into()),
        phase: Some(Phase::Stable),
        ..Default::default()
    });
    cs
}

/// The live statefulset of `cs`, scaled to `replicas` with `ready` ready pods.
pub fn live_sts(cs: &ConsensusSet, replicas: i32, ready: i32) -> StatefulSet {
    let mut sts = build_sts(cs);
    sts.metadata.generation = Some(1);
    if let Some(spec) = sts.spec.as_mut() {
        spec.replicas = Some(replicas);
    }
    sts.status = Some(StatefulSetStatus {
        observed_generation: Some(1),
        replicas,
        ready_replicas: Some(ready),
        available_replicas: Some(ready),
        updated_replicas: Some(ready),
        current_revision: Some("rev-1".into()),
        update_revision: Some("rev-1".into()),
        ..Default::default()
    });
    sts
}

pub fn pod(parent: &str, ordinal: i32, role: Option<&str>, ready: bool) -> Pod {
    let mut labels = owned_labels(parent);
    labels.insert(REVISION_LABEL.to_string(), "rev-1".to_string());
    if let Some(role) = role {
        labels.insert(ROLE_LABEL.to_string(), role.to_string());
    }
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(parent, ordinal)),
            namespace: Some("default".into()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: if ready { "True" } else { "False" }.into(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn with_revision(mut pod: Pod, revision: &str) -> Pod {
    pod.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(REVISION_LABEL.to_string(), revision.to_string());
    pod
}

/// Role-labelled pods for the members of `cs`, leader at ordinal 0.
pub fn member_pods(cs: &ConsensusSet, count: i32) -> Vec<Pod> {
    let name = cs_name(cs);
    (0..count)
        .map(|i| pod(&name, i, Some(if i == 0 { "leader" } else { "follower" }), true))
        .collect()
}

/// Ready pods carrying the roles recorded in the members status of `cs`.
pub fn pods_of_members(cs: &ConsensusSet) -> Vec<Pod> {
    let name = cs_name(cs);
    cs.members()
        .iter()
        .filter_map(|m| {
            let ordinal = ordinal_of(&m.pod_name)?;
            Some(pod(&name, ordinal, Some(&m.role.name), true))
        })
        .collect()
}
