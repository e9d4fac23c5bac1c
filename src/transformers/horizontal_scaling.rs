use crate::crd::TerminationPolicy;
use crate::errors::*;
use crate::events::ReplicaEvent;
use crate::graph::{Dag, GraphClient};
use crate::model::Object;
use crate::plan::{TransformContext, Transformer};
use crate::transformers::{live_sts, sts_vertex};
use crate::utils::cs_name;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use log::info;

/// Reports replica changes of the workload and drops the volumes of removed
/// ordinals when the termination policy says so.
pub struct HorizontalScalingTransformer;

fn replicas_of(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

#[async_trait]
impl Transformer for HorizontalScalingTransformer {
    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        if ctx.cs_orig.is_deleting() {
            return Ok(());
        }
        let sts_id = sts_vertex(dag)?;
        if dag.vertex(sts_id).immutable {
            return Ok(());
        }
        let live = match live_sts(dag, sts_id) {
            Some(live) => live,
            None => return Ok(()),
        };
        let desired = replicas_of(dag.typed::<StatefulSet>(sts_id)?);
        let current = replicas_of(&live);
        if desired == current {
            return Ok(());
        }
        info!("scaling {} from {} to {}", ctx.name(), current, desired);
        ctx.record(ReplicaEvent::normal(
            "HorizontalScale",
            "Scale",
            format!("start horizontal scale from {} to {}", current, desired),
        ));

        let policy = ctx.cs.spec.termination_policy;
        if desired > current || !matches!(policy, TerminationPolicy::Delete | TerminationPolicy::WipeOut) {
            return Ok(());
        }
        let sts_key = dag.vertex(sts_id).key();
        let parent = cs_name(&ctx.cs);
        for vct in &ctx.cs.spec.volume_claim_templates {
            let template = vct.metadata.name.as_deref().unwrap_or_default();
            for ordinal in desired..current {
                let pvc: Object = PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(format!("{}-{}-{}", template, parent, ordinal)),
                        namespace: ctx.cs.metadata.namespace.clone(),
                        ..Default::default()
                    },
                    ..Default::default()
                }
                .into();
                let key = pvc.key();
                dag.delete(pvc);
                dag.depend_on(&key, &[sts_key.clone()]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::graph::Action;
    use crate::model::{ObjectKey, ObjectKind};
    use crate::testing::{consensus_set, live_sts as sts_of, FakeCluster};
    use crate::transformers::init::InitTransformer;
    use crate::transformers::object_generation::ObjectGenerationTransformer;
    use std::sync::Arc;

    fn with_volume(mut cs: crate::crd::ConsensusSet) -> crate::crd::ConsensusSet {
        cs.spec.volume_claim_templates = vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".into()),
                ..Default::default()
            },
            ..Default::default()
        }];
        cs
    }

    async fn run(cs: crate::crd::ConsensusSet, live: i32, immutable: bool) -> (Dag, TransformContext) {
        let fake = FakeCluster::with(vec![cs.clone().into(), sts_of(&cs, live, live).into()]);
        let mut ctx = TransformContext::new(Arc::new(fake), Arc::new(OperatorConfig::default()), cs);
        let mut dag = Dag::new();
        InitTransformer.transform(&mut ctx, &mut dag).await.unwrap();
        ObjectGenerationTransformer.transform(&mut ctx, &mut dag).await.unwrap();
        let sts = sts_vertex(&dag).unwrap();
        dag.vertex_mut(sts).immutable = immutable;
        HorizontalScalingTransformer.transform(&mut ctx, &mut dag).await.unwrap();
        (dag, ctx)
    }

    fn pvc_key(name: &str) -> ObjectKey {
        ObjectKey {
            kind: ObjectKind::PersistentVolumeClaim,
            namespace: "default".to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn shrinking_drops_volumes_after_the_workload() {
        let (dag, ctx) = run(with_volume(consensus_set("db", 3)), 5, false).await;
        assert_eq!(ctx.events.len(), 1);
        assert_eq!(ctx.events[0].reason, "HorizontalScale");
        assert!(dag.is_action(&pvc_key("data-db-3"), Action::Delete));
        assert!(dag.is_action(&pvc_key("data-db-4"), Action::Delete));
        assert!(dag.find(&pvc_key("data-db-2")).is_none());

        let order: Vec<ObjectKey> = dag
            .reverse_topo_order()
            .unwrap()
            .into_iter()
            .map(|id| dag.vertex(id).key())
            .collect();
        let sts = order.iter().position(|k| k.kind == ObjectKind::StatefulSet).unwrap();
        let pvc = order.iter().position(|k| *k == pvc_key("data-db-3")).unwrap();
        assert!(sts < pvc);
    }

    #[tokio::test]
    async fn halted_sets_keep_their_volumes() {
        let mut cs = with_volume(consensus_set("db", 3));
        cs.spec.termination_policy = TerminationPolicy::Halt;
        let (dag, ctx) = run(cs, 5, false).await;
        assert_eq!(ctx.events.len(), 1);
        assert!(dag.find_all::<PersistentVolumeClaim>().is_empty());
    }

    #[tokio::test]
    async fn pinned_or_unchanged_workloads_are_skipped() {
        let (dag, ctx) = run(with_volume(consensus_set("db", 3)), 5, true).await;
        assert!(ctx.events.is_empty());
        assert!(dag.find_all::<PersistentVolumeClaim>().is_empty());

        let (_, ctx) = run(with_volume(consensus_set("db", 3)), 3, false).await;
        assert!(ctx.events.is_empty());
    }

    #[tokio::test]
    async fn growing_only_reports() {
        let (dag, ctx) = run(with_volume(consensus_set("db", 5)), 3, false).await;
        assert_eq!(ctx.events.len(), 1);
        assert!(dag.find_all::<PersistentVolumeClaim>().is_empty());
    }
}
