//! Drives scale-out and scale-in of the consensus group one action job at a time.
//!
//! Membership only changes through jobs running the configured actions. The
//! steps needed to go from the current members to `spec.replicas` are laid out
//! as a list; at most one unhandled job exists at any time and each successful
//! one is retired before the next entry of the list is started.

use crate::builders::{build_action, is_action_configured, ActionRequest};
use crate::crd::{ConsensusSet, Phase};
use crate::errors::*;
use crate::events::ReplicaEvent;
use crate::graph::{Dag, GraphClient};
use crate::plan::{TransformContext, Transformer};
use crate::transformers::*;
use crate::utils::*;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use log::{debug, info, warn};

pub struct MemberReconfigurationTransformer;

const SCALE_OUT: [ActionType; 3] = [ActionType::MemberJoin, ActionType::LogSync, ActionType::Promote];
const SCALE_IN: [ActionType; 2] = [ActionType::Switchover, ActionType::MemberLeave];

/// One entry of the action list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlannedAction {
    pub action: ActionType,
    pub ordinal: i32,
}

/// Where to continue in the action list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resume {
    Head,
    After(PlannedAction),
}

/// Actions still needed to reach `spec.replicas`, in execution order.
///
/// Scale-out walks ordinals up from the member count, scale-in walks them down
/// from the last member. A switchover is only planned for the ordinal holding
/// the leader. When resuming after a scale-out action, the list starts at that
/// action's ordinal so its remaining steps are kept once it became a member.
fn action_plan(cs: &ConsensusSet, resume: Resume) -> Vec<PlannedAction> {
    let members = cs.members().len() as i32;
    let replicas = cs.spec.replicas;
    let parent = cs_name(cs);
    let leader = leader_pod_name(cs.members()).unwrap_or_default();

    let from = match resume {
        Resume::After(p) if !p.action.is_pre_action() => members.min(p.ordinal),
        _ => members,
    };
    let mut plan = vec![];
    if from < replicas {
        for ordinal in from..replicas {
            for action in SCALE_OUT {
                if is_action_configured(cs, action) {
                    plan.push(PlannedAction { action, ordinal });
                }
            }
        }
    } else if members > replicas {
        for ordinal in (replicas..members).rev() {
            for action in SCALE_IN {
                if action == ActionType::Switchover && pod_name(&parent, ordinal) != leader {
                    continue;
                }
                if is_action_configured(cs, action) {
                    plan.push(PlannedAction { action, ordinal });
                }
            }
        }
    }
    plan
}

fn should_have_actions(cs: &ConsensusSet) -> bool {
    let members = cs.members().len() as i32;
    let candidates: &[ActionType] = match members.cmp(&cs.spec.replicas) {
        std::cmp::Ordering::Less => &SCALE_OUT,
        std::cmp::Ordering::Greater => &SCALE_IN,
        std::cmp::Ordering::Equal => &[],
    };
    candidates.iter().any(|a| is_action_configured(cs, *a))
}

/// Checks the members an action relies on: every ordinal below the target
/// (through the target for pre actions) is a member and exactly one of them leads.
pub fn abnormal_analysis(cs: &ConsensusSet, action: ActionType, ordinal: i32) -> std::result::Result<(), String> {
    let parent = cs_name(cs);
    let scope = if action.is_pre_action() { ordinal + 1 } else { ordinal };
    let mut abnormal = vec![];
    let mut leaders = vec![];
    for i in 0..scope {
        let name = pod_name(&parent, i);
        match cs.members().iter().find(|m| m.pod_name == name) {
            None => abnormal.push(name),
            Some(m) if m.role.is_leader => leaders.push(name),
            Some(_) => {}
        }
    }

    let mut problems = vec![];
    if !abnormal.is_empty() {
        problems.push(format!("abnormal pods: [{}]", abnormal.join(", ")));
    }
    match leaders.len() {
        0 => problems.push("no leader exists".to_string()),
        1 => {}
        _ => problems.push(format!("too many leaders: [{}]", leaders.join(", "))),
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join(", "))
    }
}

/// Drops the last abnormal verdict once the current members are whole again
/// and exactly one of them leads.
fn clear_healed_message(cs: &mut ConsensusSet) {
    let members = cs.members().len() as i32;
    let stale = cs.status.as_ref().map_or(false, |s| s.message.is_some());
    if stale && abnormal_analysis(cs, ActionType::MemberJoin, members).is_ok() {
        cs.status_mut().message = None;
    }
}

/// Whether the membership shows the effect a succeeded job was run for.
fn is_action_done(cs: &ConsensusSet, job: &Job) -> bool {
    let ordinal = job_ordinal(job).unwrap_or(0);
    let pod = pod_name(&cs_name(cs), ordinal);
    match job_type(job) {
        Some(ActionType::Switchover) => leader_pod_name(cs.members()) != Some(pod.as_str()),
        Some(ActionType::MemberLeave) => !is_member(cs.members(), &pod),
        Some(ActionType::MemberJoin) => is_member(cs.members(), &pod),
        // nothing to observe
        Some(ActionType::LogSync) | Some(ActionType::Promote) | None => true,
    }
}

fn planned(job: &Job) -> Option<PlannedAction> {
    Some(PlannedAction {
        action: job_type(job)?,
        ordinal: job_ordinal(job)?,
    })
}

async fn create_next_action(ctx: &mut TransformContext, dag: &mut Dag, resume: Resume) -> Result<()> {
    let plan = action_plan(&ctx.cs, resume);
    let next = match resume {
        Resume::Head => plan.first().copied(),
        Resume::After(current) => plan
            .iter()
            .position(|p| *p == current)
            .and_then(|i| plan.get(i + 1))
            .copied(),
    };
    let next = match next {
        Some(next) => next,
        None => {
            debug!("no action left for {}", ctx.name());
            return Ok(());
        }
    };

    let parent = ctx.name();
    let leader = leader_pod_name(ctx.cs.members()).unwrap_or_default().to_string();
    let target_ordinal = if next.action == ActionType::Switchover { 0 } else { next.ordinal };
    let target = pod_name(&parent, target_ordinal);
    let job = build_action(
        &ctx.cs,
        &ActionRequest {
            action: next.action,
            scenario: Scenario::MembershipReconfiguration,
            ordinal: next.ordinal,
            leader: &leader,
            target: &target,
        },
        &ctx.config.default_action_image,
    );
    let job_name = job.metadata.name.clone().unwrap_or_default();

    if let Err(msg) = abnormal_analysis(&ctx.cs, next.action, next.ordinal) {
        let err: Error = ErrorKind::Abnormal(msg).into();
        warn!("{}/{}: {}", ctx.namespace(), parent, err);
        ctx.record(ReplicaEvent::warning(
            &next.action.reason(),
            "Reconfigure",
            format!("{}, job name: {}", err, job_name),
        ));
        let status = ctx.cs.status_mut();
        status.message = Some(err.to_string());
        status.phase = Some(Phase::Degraded);
        dag.status(ctx.cs_orig.clone().into(), ctx.cs.clone().into());
        return Err(err);
    }

    info!("starting action {}", job_name);
    ctx.cs.status_mut().message = None;
    dag.create(job.into());
    // no pod churn while the job runs
    let sts_id = sts_vertex(dag)?;
    dag.vertex_mut(sts_id).immutable = true;
    Ok(())
}

/// A settled set retires whatever job finished last.
async fn clean_action(ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
    let job = match list_actions(ctx, Scenario::MembershipReconfiguration).await?.into_iter().next() {
        Some(job) => job,
        None => return Ok(()),
    };
    if job_succeeded(&job) {
        ctx.record(action_succeeded_event(&job));
        retire_action(dag, &job);
        if let Some(current) = planned(&job) {
            return create_next_action(ctx, dag, Resume::After(current)).await;
        }
    } else if job_failed(&job) {
        ctx.record(action_failed_event(&job));
    }
    Ok(())
}

#[async_trait]
impl Transformer for MemberReconfigurationTransformer {
    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        if ctx.cs_orig.is_deleting() || ctx.cs.spec.roles.is_empty() {
            return Ok(());
        }
        let sts_id = sts_vertex(dag)?;

        // the stored members may predate the last pod role changes
        let pods = list_typed::<Pod>(ctx, &selector_labels(&ctx.cs)).await?;
        set_members_status(&mut ctx.cs, &pods);
        clear_healed_message(&mut ctx.cs);

        let replicas = ctx.cs.spec.replicas;
        let members = ctx.cs.members().len() as i32;
        let status = ctx.cs.status_mut();
        if status.init_replicas == 0 {
            status.init_replicas = replicas;
            return Ok(());
        }
        if status.ready_init_replicas < status.init_replicas {
            status.ready_init_replicas = members;
        }
        if status.ready_init_replicas != status.init_replicas {
            return Ok(());
        }

        if is_consensus_ready(&ctx.cs) {
            return clean_action(ctx, dag).await;
        }
        if !should_have_actions(&ctx.cs) {
            return Ok(());
        }

        let sts = match live_sts(dag, sts_id) {
            Some(sts) => sts,
            None => return Ok(()),
        };
        let ready = sts_ready_replicas(&sts);
        // pods still missing, let the statefulset create them
        if members < replicas && ready < replicas {
            return Ok(());
        }
        dag.vertex_mut(sts_id).immutable = true;
        if ready < replicas || !is_sts_ready(&sts) {
            return Ok(());
        }

        let job = match list_actions(ctx, Scenario::MembershipReconfiguration).await?.into_iter().next() {
            Some(job) => job,
            None => return create_next_action(ctx, dag, Resume::Head).await,
        };
        let current = planned(&job);
        let is_switchover = job_type(&job) == Some(ActionType::Switchover);

        if job_succeeded(&job) {
            if !is_action_done(&ctx.cs, &job) {
                debug!("waiting for {} to take effect", job.metadata.name.as_deref().unwrap_or_default());
                return Ok(());
            }
            ctx.record(action_succeeded_event(&job));
            retire_action(dag, &job);
            let resume = match current {
                Some(current) if !is_switchover => Resume::After(current),
                _ => Resume::Head,
            };
            return create_next_action(ctx, dag, resume).await;
        }
        if job_failed(&job) {
            ctx.record(action_failed_event(&job));
            if !is_switchover {
                warn!(
                    "action {} failed, waiting for manual intervention",
                    job.metadata.name.as_deref().unwrap_or_default()
                );
                return Ok(());
            }
            retire_action(dag, &job);
            let resume = current.map_or(Resume::Head, Resume::After);
            return create_next_action(ctx, dag, resume).await;
        }
        Ok(())
    }
}
