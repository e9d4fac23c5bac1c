use crate::crd::FINALIZER;
use crate::errors::*;
use crate::graph::{Dag, GraphClient};
use crate::plan::{TransformContext, Transformer};
use async_trait::async_trait;
use log::debug;

/// Adds our finalizer to a live ConsensusSet and stops the chain so the
/// update lands before any child object is written.
pub struct FixMetaTransformer;

#[async_trait]
impl Transformer for FixMetaTransformer {
    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        if ctx.cs_orig.is_deleting() || ctx.cs_orig.has_finalizer() {
            return Ok(());
        }
        debug!("adding finalizer to {}/{}", ctx.namespace(), ctx.name());
        ctx.cs
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(FINALIZER.to_string());
        dag.update(Some(ctx.cs_orig.clone().into()), ctx.cs.clone().into());
        bail!(ErrorKind::PrematureStop)
    }
}
