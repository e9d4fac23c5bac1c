use crate::client::Labels;
use crate::crd::{Phase, TerminationPolicy};
use crate::errors::*;
use crate::events::ReplicaEvent;
use crate::graph::{Dag, GraphClient};
use crate::model::{CustomKind, Object, ObjectKind};
use crate::plan::{TransformContext, Transformer};
use crate::utils::*;
use async_trait::async_trait;
use log::{info, warn};

/// Tears down owned objects according to the termination policy once the
/// ConsensusSet is being deleted, then stops the chain.
pub struct DeletionTransformer;

fn deletion_kinds(ctx: &TransformContext, policy: TerminationPolicy) -> Vec<(ObjectKind, Labels)> {
    let owned = owned_labels(&ctx.name());
    let mut kinds: Vec<(ObjectKind, Labels)> = [
        ObjectKind::StatefulSet,
        ObjectKind::Service,
        ObjectKind::ConfigMap,
        ObjectKind::PodDisruptionBudget,
        ObjectKind::Job,
    ]
    .into_iter()
    .map(|k| (k, owned.clone()))
    .collect();

    if matches!(policy, TerminationPolicy::Delete | TerminationPolicy::WipeOut) {
        kinds.push((ObjectKind::PersistentVolumeClaim, owned.clone()));
    }
    if policy == TerminationPolicy::WipeOut {
        let instance = Labels::from([(INSTANCE_LABEL.to_string(), ctx.name())]);
        for kind in ["BackupPolicy", "Backup"] {
            let custom = CustomKind::new(
                &ctx.config.backup_api_group,
                &ctx.config.backup_api_version,
                kind,
            );
            kinds.push((ObjectKind::Custom(custom), instance.clone()));
        }
    }
    kinds
}

#[async_trait]
impl Transformer for DeletionTransformer {
    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        if !ctx.cs_orig.is_deleting() {
            return Ok(());
        }
        let policy = ctx.cs.spec.termination_policy;

        if policy == TerminationPolicy::DoNotTerminate {
            let msg = format!(
                "termination policy {:?} blocks deletion of {}",
                policy,
                ctx.name()
            );
            warn!("{}", msg);
            ctx.record(ReplicaEvent::warning("DeletionBlocked", "Delete", msg.clone()));
            let status = ctx.cs.status_mut();
            status.phase = Some(Phase::Deleting);
            status.message = Some(msg);
            dag.status(ctx.cs_orig.clone().into(), ctx.cs.clone().into());
            bail!(ErrorKind::PrematureStop);
        }

        let namespace = ctx.namespace();
        for (kind, labels) in deletion_kinds(ctx, policy) {
            for obj in ctx.client.list(&kind, &namespace, &labels).await? {
                dag.delete(obj);
            }
        }
        info!("deleting {}/{} with policy {:?}", namespace, ctx.name(), policy);
        dag.delete(Object::from(ctx.cs.clone()));
        bail!(ErrorKind::PrematureStop)
    }
}
