use crate::builders::*;
use crate::errors::*;
use crate::graph::{Dag, GraphClient};
use crate::model::{Object, ObjectKey, ObjectKind};
use crate::plan::{TransformContext, Transformer};
use crate::utils::owned_labels;
use async_trait::async_trait;
use log::trace;
use std::collections::{BTreeMap, BTreeSet};

/// Diffs the objects the spec asks for against the owned ones in the cluster.
pub struct ObjectGenerationTransformer;

/// Workload first, then what it depends on.
fn desired_objects(ctx: &TransformContext) -> Vec<Object> {
    let cs = &ctx.cs;
    let mut sts = build_sts(cs);
    set_ownership(cs, &mut sts.metadata);
    let mut headless = build_headless_svc(cs);
    set_ownership(cs, &mut headless.metadata);
    let mut env = build_env_config_map(cs);
    set_ownership(cs, &mut env.metadata);

    let mut objects: Vec<Object> = vec![sts.into(), headless.into(), env.into()];
    if let Some(mut svc) = build_svc(cs) {
        set_ownership(cs, &mut svc.metadata);
        objects.push(svc.into());
    }
    if let Some(mut pdb) = build_pdb(cs) {
        set_ownership(cs, &mut pdb.metadata);
        objects.push(pdb.into());
    }
    objects
}

#[async_trait]
impl Transformer for ObjectGenerationTransformer {
    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        if ctx.cs_orig.is_deleting() {
            return Ok(());
        }
        let desired = desired_objects(ctx);

        let labels = owned_labels(&ctx.name());
        let namespace = ctx.namespace();
        let mut live: BTreeMap<ObjectKey, Object> = BTreeMap::new();
        for kind in [
            ObjectKind::StatefulSet,
            ObjectKind::Service,
            ObjectKind::ConfigMap,
            ObjectKind::PodDisruptionBudget,
        ] {
            for obj in ctx.client.list(&kind, &namespace, &labels).await? {
                live.insert(obj.key(), obj);
            }
        }

        let mut wanted = BTreeSet::new();
        for obj in &desired {
            let key = obj.key();
            match live.get(&key) {
                Some(current) => dag.update(Some(current.clone()), obj.clone()),
                None => dag.create(obj.clone()),
            };
            wanted.insert(key);
        }
        for (key, obj) in live {
            if !wanted.contains(&key) {
                trace!("{} is no longer wanted", key);
                dag.delete(obj);
            }
        }

        let keys: Vec<ObjectKey> = desired.iter().map(Object::key).collect();
        if let Some((sts, deps)) = keys.split_first() {
            dag.depend_on(sts, deps);
        }
        Ok(())
    }
}
