use crate::errors::*;
use crate::graph::{Dag, ObjectVertex};
use crate::plan::{TransformContext, Transformer};
use async_trait::async_trait;

/// Adds the ConsensusSet itself as the root vertex.
pub struct InitTransformer;

#[async_trait]
impl Transformer for InitTransformer {
    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        let mut root = ObjectVertex::new(ctx.cs.clone().into());
        root.ori_obj = Some(ctx.cs_orig.clone().into());
        let id = dag.add_vertex(root)?;
        dag.set_root(id);
        Ok(())
    }
}
