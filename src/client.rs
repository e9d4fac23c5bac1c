//! Cluster access used by the plan and the transformers.

use crate::crd::ConsensusSet;
use crate::errors::*;
use crate::model::{CustomKind, Object, ObjectKind};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams,
};
use kube::core::TypeMeta;
use kube::Client;
use log::trace;
use std::collections::BTreeMap;

pub type Labels = BTreeMap<String, String>;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, kind: &ObjectKind, namespace: &str, name: &str) -> Result<Option<Object>>;
    /// Objects of `kind` in `namespace` carrying every label of `labels`.
    async fn list(&self, kind: &ObjectKind, namespace: &str, labels: &Labels) -> Result<Vec<Object>>;
    async fn create(&self, obj: &Object) -> Result<Object>;
    async fn update(&self, obj: &Object) -> Result<Object>;
    async fn delete(&self, obj: &Object) -> Result<()>;
    async fn patch_status(&self, obj: &Object, patch: &serde_json::Value) -> Result<()>;
}

pub fn label_selector(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

impl CustomKind {
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(&self.group, &self.version, &self.kind))
    }

    fn type_meta(&self) -> TypeMeta {
        TypeMeta {
            api_version: self.api_version(),
            kind: self.kind.clone(),
        }
    }
}

/// Stamps the type of a custom object, which list responses may omit per item.
fn typed_as(obj: Object, kind: &ObjectKind) -> Object {
    match (obj, kind) {
        (Object::Custom(mut o), ObjectKind::Custom(ck)) => {
            o.types = Some(ck.type_meta());
            Object::Custom(o)
        }
        (obj, _) => obj,
    }
}

macro_rules! for_kind {
    ($client:expr, $kind:expr, $ns:expr, $api:ident => $body:expr) => {
        match $kind {
            ObjectKind::ConsensusSet => { let $api: Api<ConsensusSet> = Api::namespaced($client, $ns); $body }
            ObjectKind::StatefulSet => { let $api: Api<StatefulSet> = Api::namespaced($client, $ns); $body }
            ObjectKind::Service => { let $api: Api<Service> = Api::namespaced($client, $ns); $body }
            ObjectKind::ConfigMap => { let $api: Api<ConfigMap> = Api::namespaced($client, $ns); $body }
            ObjectKind::Secret => { let $api: Api<Secret> = Api::namespaced($client, $ns); $body }
            ObjectKind::Deployment => { let $api: Api<Deployment> = Api::namespaced($client, $ns); $body }
            ObjectKind::PodDisruptionBudget => { let $api: Api<PodDisruptionBudget> = Api::namespaced($client, $ns); $body }
            ObjectKind::PersistentVolumeClaim => { let $api: Api<PersistentVolumeClaim> = Api::namespaced($client, $ns); $body }
            ObjectKind::Job => { let $api: Api<Job> = Api::namespaced($client, $ns); $body }
            ObjectKind::Pod => { let $api: Api<Pod> = Api::namespaced($client, $ns); $body }
            ObjectKind::Custom(ck) => {
                let $api: Api<DynamicObject> = Api::namespaced_with($client, $ns, &ck.api_resource());
                $body
            }
        }
    };
}

macro_rules! for_object {
    ($client:expr, $obj:expr, $api:ident, $o:ident => $body:expr) => {{
        let ns = $obj.namespace();
        match $obj {
            Object::ConsensusSet($o) => { let $api: Api<ConsensusSet> = Api::namespaced($client, ns); $body }
            Object::StatefulSet($o) => { let $api: Api<StatefulSet> = Api::namespaced($client, ns); $body }
            Object::Service($o) => { let $api: Api<Service> = Api::namespaced($client, ns); $body }
            Object::ConfigMap($o) => { let $api: Api<ConfigMap> = Api::namespaced($client, ns); $body }
            Object::Secret($o) => { let $api: Api<Secret> = Api::namespaced($client, ns); $body }
            Object::Deployment($o) => { let $api: Api<Deployment> = Api::namespaced($client, ns); $body }
            Object::PodDisruptionBudget($o) => { let $api: Api<PodDisruptionBudget> = Api::namespaced($client, ns); $body }
            Object::PersistentVolumeClaim($o) => { let $api: Api<PersistentVolumeClaim> = Api::namespaced($client, ns); $body }
            Object::Job($o) => { let $api: Api<Job> = Api::namespaced($client, ns); $body }
            Object::Pod($o) => { let $api: Api<Pod> = Api::namespaced($client, ns); $body }
            Object::Custom($o) => {
                let ar = CustomKind::of_dynamic($o).api_resource();
                let $api: Api<DynamicObject> = Api::namespaced_with($client, ns, &ar);
                $body
            }
        }
    }};
}

/// [`ClusterClient`] backed by the kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        KubeClusterClient { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, kind: &ObjectKind, namespace: &str, name: &str) -> Result<Option<Object>> {
        let found = for_kind!(self.client.clone(), kind, namespace, api => {
            api.get_opt(name).await?.map(Object::from)
        });
        Ok(found.map(|o| typed_as(o, kind)))
    }

    async fn list(&self, kind: &ObjectKind, namespace: &str, labels: &Labels) -> Result<Vec<Object>> {
        let lp = ListParams::default().labels(&label_selector(labels));
        let listed: std::result::Result<Vec<Object>, kube::Error> =
            for_kind!(self.client.clone(), kind, namespace, api => {
                api.list(&lp).await.map(|l| l.items.into_iter().map(Object::from).collect())
            });
        match listed {
            Ok(items) => Ok(items.into_iter().map(|o| typed_as(o, kind)).collect()),
            // the kind's CRD is not installed
            Err(kube::Error::Api(ae)) if ae.code == 404 && matches!(kind, ObjectKind::Custom(_)) => {
                trace!("{} not served, listing nothing", kind);
                Ok(vec![])
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, obj: &Object) -> Result<Object> {
        let pp = PostParams::default();
        for_object!(self.client.clone(), obj, api, o => {
            Ok(Object::from(api.create(&pp, &**o).await?))
        })
    }

    async fn update(&self, obj: &Object) -> Result<Object> {
        let pp = PostParams::default();
        let name = obj.name();
        for_object!(self.client.clone(), obj, api, o => {
            Ok(Object::from(api.replace(name, &pp, &**o).await?))
        })
    }

    async fn delete(&self, obj: &Object) -> Result<()> {
        let dp = DeleteParams::background();
        let name = obj.name();
        for_object!(self.client.clone(), obj, api, _o => {
            api.delete(name, &dp).await?;
        });
        Ok(())
    }

    async fn patch_status(&self, obj: &Object, patch: &serde_json::Value) -> Result<()> {
        let pp = PatchParams::default();
        let name = obj.name();
        for_object!(self.client.clone(), obj, api, _o => {
            api.patch_status(name, &pp, &Patch::Merge(patch)).await?;
        });
        Ok(())
    }
}
