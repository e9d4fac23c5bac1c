//! Order in which pods of an `OnDelete` statefulset get recreated.

use crate::crd::{MemberUpdateStrategy, ReplicaRole};
use crate::errors::*;
use crate::graph::{Dag, ObjectVertex, VertexId, WalkControl};
use crate::model::Object;
use crate::utils::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;

/// Graph rooted at the statefulset with an edge from each pod group to the next.
pub fn build_update_dag(
    sts: &StatefulSet,
    pods: &[Pod],
    roles: &[ReplicaRole],
    strategy: MemberUpdateStrategy,
) -> Result<Dag> {
    let mut pods = pods.to_vec();
    sort_pods(&mut pods, roles);

    let mut dag = Dag::new();
    let root = dag.add_vertex(ObjectVertex::new(sts.clone().into()))?;
    dag.set_root(root);
    let mut ids = Vec::with_capacity(pods.len());
    for p in &pods {
        ids.push(dag.add_vertex(ObjectVertex::new(p.clone().into()))?);
    }

    let groups: Vec<Vec<VertexId>> = match strategy {
        MemberUpdateStrategy::Serial => ids.iter().map(|id| vec![*id]).collect(),
        MemberUpdateStrategy::Parallel => vec![ids],
        MemberUpdateStrategy::BestEffortParallel => {
            let priority = |p: &Pod| RolePriority::of_name(roles, &role_name(p));
            let low = pods.iter().take_while(|p| priority(p) <= RolePriority::Learner).count();
            let followers = pods[low..]
                .iter()
                .filter(|p| priority(p) < RolePriority::Leader)
                .count();
            let half = followers / 2;
            vec![
                ids[..low].to_vec(),
                ids[low..low + half].to_vec(),
                ids[low + half..low + followers].to_vec(),
                ids[low + followers..].to_vec(),
            ]
        }
    };

    let mut prev = vec![root];
    for group in groups.into_iter().filter(|g| !g.is_empty()) {
        for from in &prev {
            for to in &group {
                dag.connect(*from, *to);
            }
        }
        prev = group;
    }
    Ok(dag)
}

/// The next pod to delete so it comes back at `update_revision`, if any.
///
/// Nothing is released until every replica has a pod and the statefulset is
/// ready. Pods already at the revision and ready let the walk through; a
/// terminating pod or an updated one that is not ready yet holds back its
/// successors. At most one pod is returned per call.
pub fn next_pod_to_update(
    sts: &StatefulSet,
    pods: &[Pod],
    roles: &[ReplicaRole],
    strategy: MemberUpdateStrategy,
    update_revision: &str,
) -> Result<Option<Pod>> {
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1).max(0) as usize;
    if pods.len() != replicas || !is_sts_ready(sts) {
        return Ok(None);
    }
    let dag = build_update_dag(sts, pods, roles, strategy)?;
    let mut candidate = None;
    dag.walk_bfs(|v| {
        let pod = match &v.obj {
            Object::Pod(p) => p,
            _ => return Ok(WalkControl::Continue),
        };
        if is_terminating(pod) {
            return Ok(WalkControl::Wait);
        }
        if label_of(pod, REVISION_LABEL) == Some(update_revision) {
            return Ok(if is_pod_ready(pod) {
                WalkControl::Continue
            } else {
                WalkControl::Wait
            });
        }
        candidate = Some((**pod).clone());
        Ok(WalkControl::Stop)
    })?;
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{consensus_set, live_sts, pod, roles, with_revision};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn visit_order(dag: &Dag) -> Vec<String> {
        let mut seen = vec![];
        dag.walk_bfs(|v| {
            if let Object::Pod(_) = v.obj {
                seen.push(v.obj.name().to_string());
            }
            Ok(WalkControl::Continue)
        })
        .unwrap();
        seen
    }

    fn mixed_pods() -> Vec<Pod> {
        vec![
            pod("db", 0, Some("leader"), true),
            pod("db", 1, Some("follower"), true),
            pod("db", 2, Some("follower"), true),
            pod("db", 3, Some("follower"), true),
            pod("db", 4, Some("learner"), true),
            pod("db", 5, None, true),
        ]
    }

    fn sts() -> StatefulSet {
        live_sts(&consensus_set("db", 6), 6, 6)
    }

    #[test]
    fn serial_is_a_single_chain_leader_last() {
        let dag = build_update_dag(&sts(), &mixed_pods(), &roles(), MemberUpdateStrategy::Serial).unwrap();
        assert_eq!(
            visit_order(&dag),
            vec!["db-5", "db-4", "db-1", "db-2", "db-3", "db-0"]
        );
    }

    #[test]
    fn best_effort_parallel_gates_groups() {
        let dag = build_update_dag(
            &sts(),
            &mixed_pods(),
            &roles(),
            MemberUpdateStrategy::BestEffortParallel,
        )
        .unwrap();
        let order = visit_order(&dag);
        assert_eq!(order.first().map(String::as_str), Some("db-5"));
        assert_eq!(order.last().map(String::as_str), Some("db-0"));
        assert_eq!(order, vec!["db-5", "db-4", "db-1", "db-2", "db-3", "db-0"]);

        // a pending learner holds back every follower
        let mut pods = mixed_pods();
        pods[4] = with_revision(pods[4].clone(), "rev-0");
        let next = next_pod_to_update(
            &sts(),
            &pods,
            &roles(),
            MemberUpdateStrategy::BestEffortParallel,
            "rev-1",
        )
        .unwrap();
        assert_eq!(next.and_then(|p| p.metadata.name), Some("db-4".to_string()));
    }

    #[test]
    fn outdated_leader_goes_last() {
        let pods: Vec<Pod> = mixed_pods()
            .into_iter()
            .map(|p| with_revision(p, "rev-0"))
            .collect();
        let next = next_pod_to_update(&sts(), &pods, &roles(), MemberUpdateStrategy::Serial, "rev-1").unwrap();
        assert_eq!(next.and_then(|p| p.metadata.name), Some("db-5".to_string()));

        let mut pods = mixed_pods();
        pods[0] = with_revision(pods[0].clone(), "rev-0");
        let next = next_pod_to_update(&sts(), &pods, &roles(), MemberUpdateStrategy::Serial, "rev-1").unwrap();
        assert_eq!(next.and_then(|p| p.metadata.name), Some("db-0".to_string()));
    }

    #[test]
    fn terminating_or_unready_pods_block_the_chain() {
        let mut pods = mixed_pods();
        pods[0] = with_revision(pods[0].clone(), "rev-0");
        pods[5].metadata.deletion_timestamp = Some(Time(Default::default()));
        let next = next_pod_to_update(&sts(), &pods, &roles(), MemberUpdateStrategy::Serial, "rev-1").unwrap();
        assert!(next.is_none());

        let mut pods = mixed_pods();
        pods[0] = with_revision(pods[0].clone(), "rev-0");
        pods[2] = pod("db", 2, Some("follower"), false);
        let next = next_pod_to_update(&sts(), &pods, &roles(), MemberUpdateStrategy::Serial, "rev-1").unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn missing_pods_or_unready_statefulset_hold_everything() {
        let pods: Vec<Pod> = mixed_pods()
            .into_iter()
            .filter(|p| p.metadata.name.as_deref() != Some("db-1"))
            .map(|p| with_revision(p, "rev-0"))
            .collect();
        let next = next_pod_to_update(&sts(), &pods, &roles(), MemberUpdateStrategy::Parallel, "rev-1").unwrap();
        assert!(next.is_none());

        let pods: Vec<Pod> = mixed_pods()
            .into_iter()
            .map(|p| with_revision(p, "rev-0"))
            .collect();
        let catching_up = live_sts(&consensus_set("db", 6), 6, 5);
        let next = next_pod_to_update(&catching_up, &pods, &roles(), MemberUpdateStrategy::Serial, "rev-1").unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn parallel_picks_one_pod_per_call() {
        let pods: Vec<Pod> = mixed_pods()
            .into_iter()
            .map(|p| with_revision(p, "rev-0"))
            .collect();
        let dag = build_update_dag(&sts(), &pods, &roles(), MemberUpdateStrategy::Parallel).unwrap();
        assert_eq!(visit_order(&dag).len(), 6);
        let next = next_pod_to_update(&sts(), &pods, &roles(), MemberUpdateStrategy::Parallel, "rev-1").unwrap();
        assert_eq!(next.and_then(|p| p.metadata.name), Some("db-5".to_string()));
    }
}
