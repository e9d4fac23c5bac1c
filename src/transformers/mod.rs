//! The reconcile steps, each recording its intents into the plan's graph.

pub mod deletion;
pub mod fix_meta;
pub mod horizontal_scaling;
pub mod init;
pub mod member_reconfiguration;
pub mod object_generation;
pub mod status;
pub mod update_strategy;

use crate::client::Labels;
use crate::errors::*;
use crate::events::ReplicaEvent;
use crate::graph::{Dag, GraphClient, VertexId};
use crate::model::{Object, TypedObject};
use crate::plan::{PlanBuilder, TransformContext};
use crate::utils::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;

use self::deletion::DeletionTransformer;
use self::fix_meta::FixMetaTransformer;
use self::horizontal_scaling::HorizontalScalingTransformer;
use self::member_reconfiguration::MemberReconfigurationTransformer;
use self::object_generation::ObjectGenerationTransformer;
use self::status::StatusTransformer;
use self::update_strategy::UpdateStrategyTransformer;

/// Appends the full reconcile chain after the init step.
pub fn default_chain(builder: PlanBuilder) -> PlanBuilder {
    builder
        .add_transformer(DeletionTransformer)
        .add_transformer(FixMetaTransformer)
        .add_transformer(ObjectGenerationTransformer)
        .add_transformer(MemberReconfigurationTransformer)
        .add_parallel_transformer(vec![
            Box::new(HorizontalScalingTransformer),
            Box::new(UpdateStrategyTransformer),
        ])
        .add_transformer(StatusTransformer)
}

/// Live objects of kind `T` in the ConsensusSet's namespace matching `labels`.
pub(crate) async fn list_typed<T: TypedObject + Clone>(
    ctx: &TransformContext,
    labels: &Labels,
) -> Result<Vec<T>> {
    let objects = ctx
        .client
        .list(&T::object_kind(), &ctx.namespace(), labels)
        .await?;
    Ok(objects.iter().filter_map(|o| o.as_typed::<T>().cloned()).collect())
}

/// The single statefulset vertex the generation step added.
pub(crate) fn sts_vertex(dag: &Dag) -> Result<VertexId> {
    match dag.find_all::<StatefulSet>().as_slice() {
        [id] => Ok(*id),
        found => bail!(ErrorKind::WrongVertexType(format!(
            "expected one StatefulSet vertex, found {}",
            found.len()
        ))),
    }
}

/// The statefulset as read from the cluster, if it exists yet.
pub(crate) fn live_sts(dag: &Dag, id: VertexId) -> Option<StatefulSet> {
    dag.vertex(id)
        .ori_obj
        .as_ref()
        .and_then(|o| o.as_typed::<StatefulSet>())
        .cloned()
}

/// Unhandled action jobs of `scenario`, oldest name first.
pub(crate) async fn list_actions(ctx: &TransformContext, scenario: Scenario) -> Result<Vec<Job>> {
    let mut labels = Labels::new();
    labels.insert(INSTANCE_LABEL.to_string(), ctx.name());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels.insert(JOB_SCENARIO_LABEL.to_string(), scenario.as_str().to_string());
    labels.insert(JOB_HANDLED_LABEL.to_string(), "false".to_string());
    let mut jobs: Vec<Job> = list_typed::<Job>(ctx, &labels)
        .await?
        .into_iter()
        .filter(|j| j.metadata.deletion_timestamp.is_none())
        .collect();
    jobs.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    Ok(jobs)
}

pub(crate) fn job_label<'a>(job: &'a Job, key: &str) -> Option<&'a str> {
    job.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

pub(crate) fn job_type(job: &Job) -> Option<ActionType> {
    job_label(job, JOB_TYPE_LABEL).and_then(ActionType::parse)
}

pub(crate) fn job_ordinal(job: &Job) -> Option<i32> {
    job_label(job, JOB_ORDINAL_LABEL)
        .and_then(|o| o.parse().ok())
        .or_else(|| job.metadata.name.as_deref().and_then(action_ordinal))
}

pub(crate) fn job_succeeded(job: &Job) -> bool {
    job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0) > 0
}

pub(crate) fn job_failed(job: &Job) -> bool {
    job.status.as_ref().and_then(|s| s.failed).unwrap_or(0) > 0
}

/// Marks the job handled and deletes it.
pub(crate) fn retire_action(dag: &mut Dag, job: &Job) {
    let mut job = job.clone();
    job.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(JOB_HANDLED_LABEL.to_string(), "true".to_string());
    dag.delete(Object::from(job));
}

pub(crate) fn action_failed_event(job: &Job) -> ReplicaEvent {
    let reason = job_type(job).map_or_else(|| "ACTION".to_string(), |t| t.reason());
    ReplicaEvent::warning(
        &reason,
        "Reconfigure",
        format!(
            "action {} failed, manual intervention may be required",
            job.metadata.name.as_deref().unwrap_or_default()
        ),
    )
}

pub(crate) fn action_succeeded_event(job: &Job) -> ReplicaEvent {
    let reason = job_type(job).map_or_else(|| "ACTION".to_string(), |t| t.reason());
    ReplicaEvent::normal(
        &reason,
        "Reconfigure",
        format!("action {} succeeded", job.metadata.name.as_deref().unwrap_or_default()),
    )
}
