use crate::crd::{ConsensusSet, Phase};
use crate::errors::*;
use crate::events::ReplicaEvent;
use crate::graph::{Dag, GraphClient};
use crate::plan::{TransformContext, Transformer};
use crate::transformers::{list_typed, live_sts, sts_vertex};
use crate::utils::*;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use log::info;

/// Mirrors the workload into the ConsensusSet status and derives the phase.
pub struct StatusTransformer;

fn copy_sts_status(cs: &mut ConsensusSet, sts: &StatefulSet) {
    let generation = sts
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(GENERATION_LABEL))
        .and_then(|g| g.parse().ok());
    let status = cs.status_mut();
    status.current_generation = generation;
    if let Some(s) = &sts.status {
        status.replicas = s.replicas;
        status.ready_replicas = s.ready_replicas;
        status.available_replicas = s.available_replicas;
        status.updated_replicas = s.updated_replicas;
        status.current_revision = s.current_revision.clone();
        status.update_revision = s.update_revision.clone();
    }
}

fn phase_of(cs: &mut ConsensusSet, sts: Option<&StatefulSet>) -> Phase {
    if cs.spec.roles.is_empty() {
        return match sts {
            None => Phase::Initializing,
            Some(s) if is_sts_ready(s) => Phase::Stable,
            Some(_) => Phase::Reconfiguring,
        };
    }
    let leader = leader_pod_name(cs.members()).is_some();
    let ready = is_consensus_ready(cs);
    let status = cs.status_mut();
    if status.init_replicas == 0 || status.ready_init_replicas < status.init_replicas {
        Phase::Initializing
    } else if ready {
        status.message = None;
        Phase::Stable
    } else if status.message.is_some() || !leader {
        Phase::Degraded
    } else {
        Phase::Reconfiguring
    }
}

#[async_trait]
impl Transformer for StatusTransformer {
    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        if ctx.cs_orig.is_deleting() {
            return Ok(());
        }
        let live = live_sts(dag, sts_vertex(dag)?);
        if let Some(sts) = &live {
            copy_sts_status(&mut ctx.cs, sts);
        }
        let pods = list_typed::<Pod>(ctx, &selector_labels(&ctx.cs)).await?;
        set_members_status(&mut ctx.cs, &pods);

        let generation = ctx.cs.generation();
        let phase = phase_of(&mut ctx.cs, live.as_ref());
        let status = ctx.cs.status_mut();
        status.observed_generation = Some(generation);
        status.phase = Some(phase);

        let before = ctx.cs_orig.status.as_ref().and_then(|s| s.phase);
        if before != Some(phase) {
            info!("{}/{} is {:?}", ctx.namespace(), ctx.name(), phase);
            ctx.record(ReplicaEvent::normal(
                "PhaseChanged",
                "Reconcile",
                format!("phase changed from {:?} to {:?}", before, phase),
            ));
        }
        dag.status(ctx.cs_orig.clone().into(), ctx.cs.clone().into());
        Ok(())
    }
}
