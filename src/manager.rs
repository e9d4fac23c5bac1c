use crate::client::{ClusterClient, KubeClusterClient};
use crate::config::OperatorConfig;
use crate::crd::ConsensusSet;
use crate::errors::*;
use crate::events::{EventRecorder, KubeEventRecorder};
use crate::plan::PlanBuilder;
use crate::transformers::default_chain;
use crate::utils::{MANAGED_BY, MANAGED_BY_LABEL, OWNER_LABEL};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::NamespaceResourceScope;
use kube::{api::Api, client::Client, Resource, ResourceExt};
use kube_runtime::{
    controller::{Action, Controller},
    reflector::ObjectRef,
    watcher,
};
use log::{debug, info, warn};
use std::sync::Arc;

const CRD_NAME: &str = "consensussets.pikach.us";

/// Shared by every reconcile.
struct Data {
    client: Arc<dyn ClusterClient>,
    recorder: Arc<dyn EventRecorder>,
    config: Arc<OperatorConfig>,
}

async fn reconcile(cs: Arc<ConsensusSet>, ctx: Arc<Data>) -> Result<Action> {
    let name = cs.name_any();
    let ns = cs.namespace().unwrap_or_default();
    debug!("reconcile consensusset {}/{}", ns, name);

    let builder = PlanBuilder::new(
        ctx.client.clone(),
        ctx.recorder.clone(),
        ctx.config.clone(),
        &ns,
        &name,
    );
    let builder = match builder.init().await {
        Ok(builder) => builder,
        // gone since the event was queued
        Err(e) if matches!(e.kind(), ErrorKind::PrimaryNotFound(_)) => {
            debug!("{}", e);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };
    default_chain(builder).build().await?.execute().await?;

    Ok(Action::requeue(ctx.config.requeue_after()))
}

fn error_policy(cs: Arc<ConsensusSet>, error: &Error, ctx: Arc<Data>) -> Action {
    warn!("reconcile of {} failed: {}", cs.name_any(), error);
    Action::requeue(ctx.config.error_requeue())
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Maps a pod back to the ConsensusSet named by its owner label.
fn pod_owner(pod: Pod) -> Option<ObjectRef<ConsensusSet>> {
    let owner = pod.labels().get(OWNER_LABEL)?.clone();
    let ns = pod.namespace()?;
    Some(ObjectRef::new(&owner).within(&ns))
}

/// Runs the ConsensusSet controller.
pub struct Manager {}

impl Manager {
    /// Fails unless the ConsensusSet CRD is installed. The returned future
    /// drives the controller and only resolves when its watches end.
    pub async fn new(client: Client, config: OperatorConfig) -> Result<(Self, BoxFuture<'static, ()>)> {
        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        crds.get(CRD_NAME)
            .await
            .chain_err(|| format!("install the {} crd first", CRD_NAME))?;

        let ns = config.namespace.clone();
        let ns = ns.as_deref();
        let context = Arc::new(Data {
            client: Arc::new(KubeClusterClient::new(client.clone())),
            recorder: Arc::new(KubeEventRecorder::new(client.clone(), &config.controller_name)),
            config: Arc::new(config),
        });

        let owned = watcher::Config::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY));
        let drainer = Controller::new(scoped::<ConsensusSet>(&client, ns), watcher::Config::default())
            .owns(scoped::<StatefulSet>(&client, ns), owned.clone())
            .owns(scoped::<Service>(&client, ns), owned.clone())
            .owns(scoped::<ConfigMap>(&client, ns), owned.clone())
            .owns(scoped::<Job>(&client, ns), owned.clone())
            .owns(scoped::<PodDisruptionBudget>(&client, ns), owned.clone())
            .watches(scoped::<Pod>(&client, ns), owned, pod_owner)
            .run(reconcile, error_policy, context)
            .for_each(|o| {
                match o {
                    Ok((obj, _)) => info!("reconciled {}", obj),
                    Err(e) => warn!("reconcile failed: {}", e),
                }
                futures::future::ready(())
            })
            .boxed();

        Ok((Self {}, drainer))
    }
}
