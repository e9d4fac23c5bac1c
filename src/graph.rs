//! In-memory mutation graph built by the transformer chain on every reconcile.

use crate::errors::*;
use crate::model::{Object, ObjectKey, TypedObject};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Delete,
    Status,
}

/// One pending mutation of one object.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectVertex {
    /// desired state
    pub obj: Object,
    /// observed state, if the object was read from the cluster
    pub ori_obj: Option<Object>,
    pub action: Option<Action>,
    /// set to skip the vertex at execution regardless of its action
    pub immutable: bool,
    /// set to delete without stripping our finalizer first
    pub is_orphan: bool,
}

impl ObjectVertex {
    pub fn new(obj: Object) -> Self {
        ObjectVertex {
            obj,
            ori_obj: None,
            action: None,
            immutable: false,
            is_orphan: false,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.obj.key()
    }
}

/// Returned by a [`Dag::walk_bfs`] visitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkControl {
    /// release the vertex's successors
    Continue,
    /// keep successors blocked but visit the rest of the frontier
    Wait,
    /// end the walk
    Stop,
}

/// Directed acyclic graph of object vertices.
///
/// An edge `from -> to` means `from` depends on `to`: `to` is written first.
/// Vertices are identified by their [`ObjectKey`], at most one per key.
#[derive(Clone, Debug, Default)]
pub struct Dag {
    vertices: Vec<ObjectVertex>,
    index: BTreeMap<ObjectKey, VertexId>,
    edges: Vec<(VertexId, VertexId)>,
    root: Option<VertexId>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn add_vertex(&mut self, v: ObjectVertex) -> Result<VertexId> {
        let key = v.key();
        if self.index.contains_key(&key) {
            bail!(ErrorKind::DuplicateVertex(key.to_string()));
        }
        Ok(self.insert(key, v))
    }

    fn insert(&mut self, key: ObjectKey, v: ObjectVertex) -> VertexId {
        let id = VertexId(self.vertices.len());
        self.vertices.push(v);
        self.index.insert(key, id);
        id
    }

    pub fn set_root(&mut self, id: VertexId) {
        self.root = Some(id);
    }

    pub fn root(&self) -> Option<VertexId> {
        self.root
    }

    pub fn find_root_vertex(&self) -> Result<&ObjectVertex> {
        self.root
            .map(|id| &self.vertices[id.0])
            .ok_or_else(|| ErrorKind::MissingRootVertex.into())
    }

    pub fn find_root_vertex_mut(&mut self) -> Result<&mut ObjectVertex> {
        match self.root {
            Some(id) => Ok(&mut self.vertices[id.0]),
            None => Err(ErrorKind::MissingRootVertex.into()),
        }
    }

    pub fn vertex(&self, id: VertexId) -> &ObjectVertex {
        &self.vertices[id.0]
    }

    pub fn vertex_mut(&mut self, id: VertexId) -> &mut ObjectVertex {
        &mut self.vertices[id.0]
    }

    pub fn find(&self, key: &ObjectKey) -> Option<VertexId> {
        self.index.get(key).copied()
    }

    /// Ids of every vertex holding a `T`, in key order.
    pub fn find_all<T: TypedObject>(&self) -> Vec<VertexId> {
        let kind = T::object_kind();
        self.index
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn typed<T: TypedObject>(&self, id: VertexId) -> Result<&T> {
        let v = self.vertex(id);
        T::from_object(&v.obj).ok_or_else(|| ErrorKind::WrongVertexType(v.key().to_string()).into())
    }

    pub fn typed_mut<T: TypedObject>(&mut self, id: VertexId) -> Result<&mut T> {
        let key = self.vertex(id).key();
        T::from_object_mut(&mut self.vertex_mut(id).obj)
            .ok_or_else(|| ErrorKind::WrongVertexType(key.to_string()).into())
    }

    /// Adds `from -> to`. Returns false, leaving the graph untouched, for a
    /// self edge, an unknown vertex or an edge that would close a cycle.
    pub fn connect(&mut self, from: VertexId, to: VertexId) -> bool {
        if from == to || from.0 >= self.vertices.len() || to.0 >= self.vertices.len() {
            return false;
        }
        if self.edges.contains(&(from, to)) {
            return true;
        }
        if self.reachable(to, from) {
            return false;
        }
        self.edges.push((from, to));
        true
    }

    pub fn add_connect_root(&mut self, id: VertexId) -> bool {
        match self.root {
            Some(root) => self.connect(root, id),
            None => false,
        }
    }

    fn successors(&self, id: VertexId) -> impl Iterator<Item = VertexId> + '_ {
        self.edges.iter().filter(move |e| e.0 == id).map(|e| e.1)
    }

    fn reachable(&self, from: VertexId, target: VertexId) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(v) = stack.pop() {
            if v == target {
                return true;
            }
            if seen.insert(v) {
                stack.extend(self.successors(v));
            }
        }
        false
    }

    /// Every vertex once, each after everything it depends on. Ties break by key,
    /// so the root, which depends on everything, comes last.
    pub fn reverse_topo_order(&self) -> Result<Vec<VertexId>> {
        let mut pending: Vec<usize> = vec![0; self.vertices.len()];
        for (from, _) in &self.edges {
            pending[from.0] += 1;
        }
        let mut ready: BTreeSet<(ObjectKey, VertexId)> = self
            .index
            .iter()
            .filter(|(_, id)| pending[id.0] == 0)
            .map(|(k, id)| (k.clone(), *id))
            .collect();

        let mut order = Vec::with_capacity(self.vertices.len());
        while let Some((_, id)) = ready.pop_first() {
            order.push(id);
            for (from, _) in self.edges.iter().filter(|e| e.1 == id) {
                pending[from.0] -= 1;
                if pending[from.0] == 0 {
                    ready.insert((self.vertex(*from).key(), *from));
                }
            }
        }

        if order.len() != self.vertices.len() {
            bail!(ErrorKind::CyclicGraph);
        }
        Ok(order)
    }

    pub fn walk_reverse_topo_order<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(VertexId, &ObjectVertex) -> Result<()>,
    {
        for id in self.reverse_topo_order()? {
            f(id, self.vertex(id))?;
        }
        Ok(())
    }

    /// Breadth-first walk from the root along edges. A vertex is visited once all
    /// of its predecessors returned [`WalkControl::Continue`].
    pub fn walk_bfs<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&ObjectVertex) -> Result<WalkControl>,
    {
        let root = self.root.ok_or(ErrorKind::MissingRootVertex)?;
        let mut blocked: Vec<usize> = vec![0; self.vertices.len()];
        for (_, to) in &self.edges {
            blocked[to.0] += 1;
        }

        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            match f(self.vertex(id))? {
                WalkControl::Stop => return Ok(()),
                WalkControl::Wait => {}
                WalkControl::Continue => {
                    for next in self.successors(id) {
                        blocked[next.0] -= 1;
                        if blocked[next.0] == 0 {
                            queue.push_back(next);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn edge_keys(&self) -> BTreeSet<(ObjectKey, ObjectKey)> {
        self.edges
            .iter()
            .map(|(f, t)| (self.vertex(*f).key(), self.vertex(*t).key()))
            .collect()
    }
}

impl PartialEq for Dag {
    fn eq(&self, other: &Self) -> bool {
        let root_key = |d: &Dag| d.root.map(|id| d.vertex(id).key());
        root_key(self) == root_key(other)
            && self.index.len() == other.index.len()
            && self.index.iter().all(|(k, id)| {
                other
                    .find(k)
                    .map_or(false, |oid| self.vertex(*id) == other.vertex(oid))
            })
            && self.edge_keys() == other.edge_keys()
    }
}

impl fmt::Display for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, id) in &self.index {
            let v = self.vertex(*id);
            write!(f, "{} action={:?}", key, v.action)?;
            if v.immutable {
                f.write_str(" immutable")?;
            }
            if v.is_orphan {
                f.write_str(" orphan")?;
            }
            writeln!(f)?;
            for to in self.successors(*id) {
                writeln!(f, "  -> {}", self.vertex(to).key())?;
            }
        }
        Ok(())
    }
}

/// Verbs transformers use to record intents in the graph.
pub trait GraphClient {
    fn root_object(&self) -> Result<&Object>;
    fn create(&mut self, obj: Object) -> VertexId;
    fn update(&mut self, old: Option<Object>, new: Object) -> VertexId;
    fn delete(&mut self, obj: Object) -> VertexId;
    fn status(&mut self, old: Object, new: Object) -> VertexId;
    /// Adds `obj -> dep` edges between existing vertices, ignoring unknown keys.
    fn depend_on(&mut self, obj: &ObjectKey, deps: &[ObjectKey]);
    fn is_action(&self, key: &ObjectKey, action: Action) -> bool;
}

impl Dag {
    fn write(&mut self, ori: Option<Object>, obj: Object, action: Action) -> VertexId {
        let key = obj.key();
        match self.find(&key) {
            Some(id) => {
                let v = self.vertex_mut(id);
                v.obj = obj;
                if ori.is_some() {
                    v.ori_obj = ori;
                }
                v.action = Some(action);
                id
            }
            None => {
                let mut v = ObjectVertex::new(obj);
                v.ori_obj = ori;
                v.action = Some(action);
                let id = self.insert(key, v);
                self.add_connect_root(id);
                id
            }
        }
    }
}

impl GraphClient for Dag {
    fn root_object(&self) -> Result<&Object> {
        self.find_root_vertex().map(|v| &v.obj)
    }

    fn create(&mut self, obj: Object) -> VertexId {
        self.write(None, obj, Action::Create)
    }

    fn update(&mut self, old: Option<Object>, new: Object) -> VertexId {
        self.write(old, new, Action::Update)
    }

    fn delete(&mut self, obj: Object) -> VertexId {
        self.write(None, obj, Action::Delete)
    }

    fn status(&mut self, old: Object, new: Object) -> VertexId {
        self.write(Some(old), new, Action::Status)
    }

    fn depend_on(&mut self, obj: &ObjectKey, deps: &[ObjectKey]) {
        let from = match self.find(obj) {
            Some(id) => id,
            None => return,
        };
        for dep in deps {
            if let Some(to) = self.find(dep) {
                self.connect(from, to);
            }
        }
    }

    fn is_action(&self, key: &ObjectKey, action: Action) -> bool {
        self.find(key)
            .map_or(false, |id| self.vertex(id).action == Some(action))
    }
}
