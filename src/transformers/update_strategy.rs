use crate::builders::{build_action, is_action_configured, ActionRequest};
use crate::errors::*;
use crate::graph::{Dag, GraphClient};
use crate::plan::{TransformContext, Transformer};
use crate::transformers::*;
use crate::update_plan::next_pod_to_update;
use crate::utils::*;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use log::{debug, info};

/// Recreates outdated pods of an `OnDelete` workload one at a time, moving
/// leadership away from a pod before it goes.
pub struct UpdateStrategyTransformer;

enum Switchover {
    Done,
    Pending,
}

/// Runs a pod-update switchover away from `leader` and reports whether the pod
/// may be deleted now.
async fn switchover_first(ctx: &mut TransformContext, dag: &mut Dag, leader: &Pod) -> Result<Switchover> {
    let jobs = list_actions(ctx, Scenario::PodUpdate).await?;
    let job = match jobs.into_iter().next() {
        Some(job) => job,
        None => {
            let leader_name = leader.metadata.name.clone().unwrap_or_default();
            let target = ctx
                .cs
                .members()
                .iter()
                .find(|m| !m.role.is_leader && m.pod_name != leader_name)
                .map(|m| m.pod_name.clone());
            let target = match target {
                Some(target) => target,
                None => return Ok(Switchover::Done),
            };
            let job = build_action(
                &ctx.cs,
                &ActionRequest {
                    action: ActionType::Switchover,
                    scenario: Scenario::PodUpdate,
                    ordinal: pod_ordinal(leader),
                    leader: &leader_name,
                    target: &target,
                },
                &ctx.config.default_action_image,
            );
            info!("switching leadership from {} to {} before update", leader_name, target);
            dag.create(job.into());
            return Ok(Switchover::Pending);
        }
    };

    if job_succeeded(&job) {
        ctx.record(action_succeeded_event(&job));
    } else if job_failed(&job) {
        ctx.record(action_failed_event(&job));
    } else {
        return Ok(Switchover::Pending);
    }
    retire_action(dag, &job);
    Ok(Switchover::Done)
}

#[async_trait]
impl Transformer for UpdateStrategyTransformer {
    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        let strategy = match ctx.cs.spec.member_update_strategy {
            Some(strategy) if !ctx.cs_orig.is_deleting() => strategy,
            _ => return Ok(()),
        };
        let sts_id = sts_vertex(dag)?;
        if dag.vertex(sts_id).immutable {
            return Ok(());
        }
        let live = match live_sts(dag, sts_id) {
            Some(live) => live,
            None => return Ok(()),
        };
        let revision = match live.status.as_ref().and_then(|s| s.update_revision.clone()) {
            Some(revision) => revision,
            None => return Ok(()),
        };

        let pods = list_typed::<Pod>(ctx, &selector_labels(&ctx.cs)).await?;
        let roles = ctx.cs.spec.roles.clone();
        let pod = match next_pod_to_update(&live, &pods, &roles, strategy, &revision)? {
            Some(pod) => pod,
            None => return Ok(()),
        };

        let is_leader = find_role(&roles, &role_name(&pod)).map_or(false, |r| r.is_leader);
        if is_leader && pods.len() > 1 && is_action_configured(&ctx.cs, ActionType::Switchover) {
            if let Switchover::Pending = switchover_first(ctx, dag, &pod).await? {
                return Ok(());
            }
        } else {
            // leftovers of a switchover whose pod lost leadership on its own
            for job in list_actions(ctx, Scenario::PodUpdate).await? {
                if job_succeeded(&job) || job_failed(&job) {
                    retire_action(dag, &job);
                }
            }
        }

        debug!(
            "recreating {} at revision {}",
            pod.metadata.name.as_deref().unwrap_or_default(),
            revision
        );
        let id = dag.delete(pod.into());
        dag.vertex_mut(id).is_orphan = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::crd::ConsensusSet;
    use crate::graph::Action;
    use crate::model::{ObjectKey, ObjectKind};
    use crate::testing::{consensus_set, live_sts as sts_of, member_pods, pod, with_revision, FakeCluster};
    use crate::transformers::init::InitTransformer;
    use crate::transformers::object_generation::ObjectGenerationTransformer;
    use k8s_openapi::api::batch::v1::{Job, JobStatus};
    use std::sync::Arc;

    fn key(kind: ObjectKind, name: &str) -> ObjectKey {
        ObjectKey {
            kind,
            namespace: "default".to_string(),
            name: name.to_string(),
        }
    }

    fn outdated(cs: &ConsensusSet, fresh: &[i32]) -> Vec<Pod> {
        member_pods(cs, 3)
            .into_iter()
            .enumerate()
            .map(|(i, p)| if fresh.contains(&(i as i32)) { p } else { with_revision(p, "rev-0") })
            .collect()
    }

    fn switchover_job(cs: &ConsensusSet, succeeded: i32, failed: i32) -> Job {
        let mut job = build_action(
            cs,
            &ActionRequest {
                action: ActionType::Switchover,
                scenario: Scenario::PodUpdate,
                ordinal: 0,
                leader: "db-0",
                target: "db-1",
            },
            "busybox",
        );
        job.status = Some(JobStatus {
            succeeded: Some(succeeded),
            failed: Some(failed),
            ..Default::default()
        });
        job
    }

    async fn run(cs: ConsensusSet, pods: Vec<Pod>, jobs: Vec<Job>) -> (Dag, TransformContext) {
        let fake = FakeCluster::with(vec![cs.clone().into(), sts_of(&cs, 3, 3).into()]);
        for p in pods {
            fake.insert(p.into());
        }
        for j in jobs {
            fake.insert(j.into());
        }
        let mut ctx = TransformContext::new(Arc::new(fake), Arc::new(OperatorConfig::default()), cs);
        let mut dag = Dag::new();
        InitTransformer.transform(&mut ctx, &mut dag).await.unwrap();
        ObjectGenerationTransformer.transform(&mut ctx, &mut dag).await.unwrap();
        UpdateStrategyTransformer.transform(&mut ctx, &mut dag).await.unwrap();
        (dag, ctx)
    }

    fn deleted_pods(dag: &Dag) -> Vec<String> {
        dag.find_all::<Pod>()
            .into_iter()
            .map(|id| dag.vertex(id))
            .filter(|v| v.action == Some(Action::Delete) && v.is_orphan)
            .map(|v| v.obj.name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn followers_go_first_one_per_pass() {
        let cs = consensus_set("db", 3);
        let (dag, _) = run(cs.clone(), outdated(&cs, &[]), vec![]).await;
        assert_eq!(deleted_pods(&dag), vec!["db-1"]);
    }

    #[tokio::test]
    async fn leader_is_switched_away_before_recreation() {
        let cs = consensus_set("db", 3);
        let (dag, _) = run(cs.clone(), outdated(&cs, &[1, 2]), vec![]).await;
        assert!(deleted_pods(&dag).is_empty());
        assert!(dag.is_action(&key(ObjectKind::Job, "db-1-0-switchover"), Action::Create));
        let job = dag.typed::<Job>(dag.find(&key(ObjectKind::Job, "db-1-0-switchover")).unwrap()).unwrap();
        assert_eq!(
            job.metadata.labels.as_ref().unwrap()[JOB_SCENARIO_LABEL],
            Scenario::PodUpdate.as_str()
        );
    }

    #[tokio::test]
    async fn leader_waits_for_the_running_switchover() {
        let cs = consensus_set("db", 3);
        let running = switchover_job(&cs, 0, 0);
        let (dag, _) = run(cs.clone(), outdated(&cs, &[1, 2]), vec![running]).await;
        assert!(deleted_pods(&dag).is_empty());
        assert!(dag.find_all::<Job>().is_empty());
    }

    #[tokio::test]
    async fn finished_switchover_releases_the_leader() {
        for (succeeded, failed) in [(1, 0), (0, 1)] {
            let cs = consensus_set("db", 3);
            let job = switchover_job(&cs, succeeded, failed);
            let (dag, ctx) = run(cs.clone(), outdated(&cs, &[1, 2]), vec![job]).await;
            assert_eq!(deleted_pods(&dag), vec!["db-0"]);
            assert!(dag.is_action(&key(ObjectKind::Job, "db-1-0-switchover"), Action::Delete));
            assert_eq!(ctx.events.len(), 1);
        }
    }

    #[tokio::test]
    async fn without_switchover_the_leader_goes_directly() {
        let mut cs = consensus_set("db", 3);
        if let Some(r) = cs.spec.membership_reconfiguration.as_mut() {
            r.switchover_action = None;
        }
        let (dag, _) = run(cs.clone(), outdated(&cs, &[1, 2]), vec![]).await;
        assert_eq!(deleted_pods(&dag), vec!["db-0"]);
    }

    #[tokio::test]
    async fn absent_or_unready_pods_hold_back_the_rest() {
        let cs = consensus_set("db", 3);
        let pods: Vec<Pod> = outdated(&cs, &[])
            .into_iter()
            .filter(|p| p.metadata.name.as_deref() != Some("db-1"))
            .collect();
        let (dag, _) = run(cs.clone(), pods, vec![]).await;
        assert!(deleted_pods(&dag).is_empty());

        // db-1 was recreated at the new revision but is still starting
        let mut pods = outdated(&cs, &[1]);
        pods[1] = pod("db", 1, Some("follower"), false);
        let (dag, _) = run(cs, pods, vec![]).await;
        assert!(deleted_pods(&dag).is_empty());
    }

    #[tokio::test]
    async fn up_to_date_or_unmanaged_sets_are_left_alone() {
        let cs = consensus_set("db", 3);
        let (dag, _) = run(cs.clone(), outdated(&cs, &[0, 1, 2]), vec![]).await;
        assert!(deleted_pods(&dag).is_empty());

        let mut cs = consensus_set("db", 3);
        cs.spec.member_update_strategy = None;
        let (dag, _) = run(cs.clone(), outdated(&cs, &[]), vec![]).await;
        assert!(deleted_pods(&dag).is_empty());
    }
}
