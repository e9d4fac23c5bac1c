//! Builds the mutation graph with a transformer chain and applies it to the cluster.

use crate::client::ClusterClient;
use crate::config::OperatorConfig;
use crate::crd::{ConsensusSet, FINALIZER};
use crate::errors::*;
use crate::events::{EventRecorder, ReplicaEvent};
use crate::graph::{Action, Dag, ObjectVertex};
use crate::merge::status_patch;
use crate::model::{Object, ObjectKind};
use crate::transformers::init::InitTransformer;
use crate::utils::{BACKUP_PROTECTION_LABEL, BACKUP_RETAIN};
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use std::sync::Arc;

/// Per-reconcile state shared by the transformers.
pub struct TransformContext {
    pub client: Arc<dyn ClusterClient>,
    pub config: Arc<OperatorConfig>,
    /// as read from the cluster
    pub cs_orig: ConsensusSet,
    /// desired, transformers update its status
    pub cs: ConsensusSet,
    pub events: Vec<ReplicaEvent>,
}

impl TransformContext {
    pub fn new(client: Arc<dyn ClusterClient>, config: Arc<OperatorConfig>, cs: ConsensusSet) -> Self {
        TransformContext {
            client,
            config,
            cs_orig: cs.clone(),
            cs,
            events: vec![],
        }
    }

    pub fn record(&mut self, event: ReplicaEvent) {
        self.events.push(event);
    }

    pub fn name(&self) -> String {
        crate::utils::cs_name(&self.cs)
    }

    pub fn namespace(&self) -> String {
        crate::utils::cs_namespace(&self.cs)
    }
}

#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()>;
}

/// Transformers whose writes do not depend on each other's.
///
/// All of them run even if one fails; the first error is returned.
pub struct ParallelTransformers(pub Vec<Box<dyn Transformer>>);

#[async_trait]
impl Transformer for ParallelTransformers {
    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        let mut first = None;
        for t in &self.0 {
            if let Err(e) = t.transform(ctx, dag).await {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

pub struct TransformerChain(Vec<Box<dyn Transformer>>);

impl TransformerChain {
    pub async fn apply(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        for t in &self.0 {
            t.transform(ctx, dag).await?;
        }
        Ok(())
    }
}

pub struct PlanBuilder {
    client: Arc<dyn ClusterClient>,
    recorder: Arc<dyn EventRecorder>,
    config: Arc<OperatorConfig>,
    namespace: String,
    name: String,
    ctx: Option<TransformContext>,
    chain: Vec<Box<dyn Transformer>>,
}

impl PlanBuilder {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        recorder: Arc<dyn EventRecorder>,
        config: Arc<OperatorConfig>,
        namespace: &str,
        name: &str,
    ) -> Self {
        PlanBuilder {
            client,
            recorder,
            config,
            namespace: namespace.to_string(),
            name: name.to_string(),
            ctx: None,
            chain: vec![],
        }
    }

    /// Reads the ConsensusSet and seeds the chain with the root vertex.
    pub async fn init(mut self) -> Result<Self> {
        let cs = self
            .client
            .get(&ObjectKind::ConsensusSet, &self.namespace, &self.name)
            .await?
            .and_then(|o| o.as_typed::<ConsensusSet>().cloned())
            .ok_or_else(|| ErrorKind::PrimaryNotFound(format!("{}/{}", self.namespace, self.name)))?;
        self.ctx = Some(TransformContext::new(self.client.clone(), self.config.clone(), cs));
        self.chain.insert(0, Box::new(InitTransformer));
        Ok(self)
    }

    pub fn add_transformer<T: Transformer + 'static>(mut self, t: T) -> Self {
        self.chain.push(Box::new(t));
        self
    }

    pub fn add_parallel_transformer(mut self, ts: Vec<Box<dyn Transformer>>) -> Self {
        self.chain.push(Box::new(ParallelTransformers(ts)));
        self
    }

    /// Runs the chain. A premature stop is not an error; any other chain error
    /// is kept and returned by [`Plan::execute`] after the partial graph is applied.
    pub async fn build(self) -> Result<Plan> {
        let mut ctx = match self.ctx {
            Some(ctx) => ctx,
            None => bail!("plan builder for {}/{} not initialized", self.namespace, self.name),
        };
        let mut dag = Dag::new();
        let chain = TransformerChain(self.chain);
        let deferred = match chain.apply(&mut ctx, &mut dag).await {
            Ok(()) => None,
            Err(e) if is_premature_stop(&e) => None,
            Err(e) => Some(e),
        };

        if let Ok(root) = dag.find_root_vertex_mut() {
            root.obj = ctx.cs.clone().into();
        }
        debug!("plan for {}/{}:\n{}", self.namespace, self.name, dag);

        Ok(Plan {
            dag,
            client: self.client,
            recorder: self.recorder,
            owner: ctx.cs_orig,
            events: ctx.events,
            deferred,
        })
    }
}

pub struct Plan {
    dag: Dag,
    client: Arc<dyn ClusterClient>,
    recorder: Arc<dyn EventRecorder>,
    owner: ConsensusSet,
    events: Vec<ReplicaEvent>,
    deferred: Option<Error>,
}

impl Plan {
    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    pub fn events(&self) -> &[ReplicaEvent] {
        &self.events
    }

    /// Applies every vertex after the ones it depends on, then publishes the
    /// recorded events.
    pub async fn execute(self) -> Result<()> {
        let Plan {
            dag,
            client,
            recorder,
            owner,
            events,
            deferred,
        } = self;
        // error-chain errors are not Sync, so the walk borrows only what it needs
        let walked = Executor { dag: &dag, client }.walk().await;
        for ev in &events {
            if let Err(e) = recorder.publish(&owner, ev).await {
                warn!("unable to publish event {}: {}", ev.reason, e);
            }
        }
        walked?;
        match deferred {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct Executor<'a> {
    dag: &'a Dag,
    client: Arc<dyn ClusterClient>,
}

impl Executor<'_> {
    async fn walk(&self) -> Result<()> {
        let root = self.dag.root();
        for id in self.dag.reverse_topo_order()? {
            self.apply(self.dag.vertex(id), Some(id) == root).await?;
        }
        Ok(())
    }

    async fn apply(&self, v: &ObjectVertex, is_root: bool) -> Result<()> {
        let action = match v.action {
            Some(action) => action,
            None if is_root => return Ok(()),
            None => bail!(ErrorKind::NilAction(v.key().to_string())),
        };
        if v.immutable {
            trace!("skipping immutable {}", v.key());
            return Ok(());
        }
        debug!("{:?} {}", action, v.key());

        match action {
            Action::Create => match self.client.create(&v.obj).await {
                Err(e) if is_already_exists(&e) => Ok(()),
                Err(e) => Err(e),
                Ok(_) => {
                    info!("created {}", v.key());
                    Ok(())
                }
            },
            Action::Update => {
                let merged = match &v.ori_obj {
                    Some(ori) => {
                        let merged = v.obj.merge_into(ori)?;
                        if merged == *ori {
                            trace!("{} unchanged", v.key());
                            return Ok(());
                        }
                        merged
                    }
                    None => v.obj.clone(),
                };
                ignore_not_found(self.client.update(&merged).await.map(|_| ()))
            }
            Action::Delete => self.delete(v, is_root).await,
            Action::Status => {
                let ori = v.ori_obj.as_ref().unwrap_or(&v.obj);
                match status_patch(ori, &v.obj)? {
                    Some(patch) => ignore_not_found(self.client.patch_status(&v.obj, &patch).await),
                    None => Ok(()),
                }
            }
        }
    }

    async fn delete(&self, v: &ObjectVertex, is_root: bool) -> Result<()> {
        if v.obj.label(BACKUP_PROTECTION_LABEL) == Some(BACKUP_RETAIN) {
            debug!("{} is retained", v.key());
            return Ok(());
        }
        let mut obj: Object = v.obj.clone();
        if !v.is_orphan && obj.remove_finalizer(FINALIZER) {
            ignore_not_found(self.client.update(&obj).await.map(|_| ()))?;
        }
        if is_root {
            return Ok(());
        }
        ignore_not_found(self.client.delete(&obj).await)?;
        info!("deleted {}", v.key());
        Ok(())
    }
}

fn ignore_not_found(r: Result<()>) -> Result<()> {
    match r {
        Err(e) if is_not_found(&e) => Ok(()),
        r => r,
    }
}
