//! Engines, their composition, and incremental evaluation.
//!
//! A [`Workbench`] is an arena of engines. Every engine owns a
//! [`TaskRegistry`], a [`ResolverChain`] and a [`TraceStore`], and may be
//! composed from any number of parent engines. A task kind always belongs to
//! exactly one engine in the whole ancestry; requiring it through a child
//! routes the evaluation to the owner, which executes the task with its own
//! resolvers and keeps the trace in its own store.

mod diagnostics;
mod inflight;
mod session;
mod store;
mod trace;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::core::{ArcStr, Payload};
use crate::engine::inflight::InFlight;
use crate::error::{Error, Result};
use crate::registry::{TaskDefPtr, TaskRegistry};
use crate::resource::ResolverChain;
use crate::task::{TaskDef, TaskId};

pub use crate::engine::diagnostics::{Diagnostics, TaskExecution};
pub use crate::engine::session::{CancelHandle, ExecContext, Session};
pub use crate::engine::store::TraceStore;
pub use crate::engine::trace::{Dependency, TraceRecord};

pub(crate) struct EngineNode {
    pub(crate) name: ArcStr,
    registry: TaskRegistry,
    /// In declared order.
    parents: Vec<NodeIndex>,
    /// Every kind visible from this engine, mapped to the engine owning it.
    owners: HashMap<ArcStr, NodeIndex>,
    pub(crate) resolver: ResolverChain,
    pub(crate) store: TraceStore,
}

/// Refers to an engine inside a [`Workbench`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(pub(crate) NodeIndex);

impl EngineHandle {
    pub fn index(self) -> usize {
        self.0.index()
    }
}

/// The arena holding every engine of a build, wired together by composition.
///
/// # Example
///
/// ```rust
/// use tsumiki::{ExecContext, TaskDef, TaskRegistry, Workbench};
///
/// struct Square;
///
/// impl TaskDef for Square {
///     const KIND: &'static str = "square";
///     type Args = u64;
///     type Output = u64;
///
///     fn execute(&self, _: &mut ExecContext<'_>, x: u64) -> anyhow::Result<u64> {
///         Ok(x * x)
///     }
/// }
///
/// let mut registry = TaskRegistry::new();
/// registry.register(Square).unwrap();
///
/// let mut workbench = Workbench::new();
/// let math = workbench.engine("math").tasks(registry).build().unwrap();
///
/// assert_eq!(workbench.get::<Square>(math, &4).unwrap(), 16);
/// ```
#[derive(Default)]
pub struct Workbench {
    pub(crate) graph: Graph<EngineNode, ()>,
    pub(crate) inflight: InFlight,
}

impl Workbench {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts building a new engine.
    pub fn engine(&mut self, name: impl Into<ArcStr>) -> EngineBuilder<'_> {
        EngineBuilder {
            workbench: self,
            name: name.into(),
            parents: Vec::new(),
            registry: TaskRegistry::new(),
            resolver: ResolverChain::empty(),
            store: None,
        }
    }

    /// Creates an engine from `parents` and its own local parts.
    ///
    /// The engine's resolver consults `resolver` first and then the
    /// resolvers of each parent, in declared order. Fails with
    /// [`Error::DuplicateTaskKind`] if a kind would be owned by two
    /// different engines; reaching the same owner through two parents is
    /// fine. Composition executes nothing and never mutates the parents.
    pub fn compose(
        &mut self,
        name: impl Into<ArcStr>,
        parents: &[EngineHandle],
        registry: TaskRegistry,
        resolver: ResolverChain,
        store: TraceStore,
    ) -> Result<EngineHandle> {
        let name = name.into();

        let mut owners: HashMap<ArcStr, NodeIndex> = HashMap::new();
        let mut conflicts = Vec::new();
        let mut chains = vec![resolver];

        for &EngineHandle(parent) in parents {
            let node = self.node(parent)?;

            for (kind, &owner) in &node.owners {
                match owners.entry(kind.clone()) {
                    Entry::Occupied(entry) if *entry.get() != owner => {
                        conflicts.push(kind.to_string());
                    }
                    Entry::Occupied(_) => {}
                    Entry::Vacant(entry) => {
                        entry.insert(owner);
                    }
                }
            }

            chains.push(node.resolver.clone());
        }

        let locals: Vec<ArcStr> = registry.kinds().map(ArcStr::from).collect();
        for kind in &locals {
            if owners.contains_key(kind) {
                conflicts.push(kind.to_string());
            }
        }

        if !conflicts.is_empty() {
            return Err(Error::duplicate(conflicts));
        }

        tracing::debug!(engine = %name, parents = parents.len(), kinds = locals.len(), "composed engine");

        let parents: Vec<NodeIndex> = parents.iter().map(|handle| handle.0).collect();
        let index = self.graph.add_node(EngineNode {
            name,
            registry,
            parents: parents.clone(),
            owners,
            resolver: ResolverChain::compose(chains, []),
            store,
        });

        let node = &mut self.graph[index];
        for kind in locals {
            node.owners.insert(kind, index);
        }

        for parent in parents {
            self.graph.add_edge(parent, index, ());
        }

        Ok(EngineHandle(index))
    }

    /// Opens a new session. Each session checks every task at most once.
    pub fn session(&self, engine: EngineHandle) -> Result<Session<'_>> {
        self.node(engine.0)?;
        Ok(Session::new(self, engine.0))
    }

    /// Requires `task` in a fresh session.
    pub fn require(&self, engine: EngineHandle, task: &TaskId) -> Result<Payload> {
        self.session(engine)?.require(task)
    }

    /// Typed variant of [`require`](Self::require).
    pub fn get<D>(&self, engine: EngineHandle, args: &D::Args) -> Result<D::Output>
    where
        D: TaskDef,
    {
        self.session(engine)?.get::<D>(args)
    }

    /// The current trace of `task`, looked up in the store of whichever
    /// engine visible from `engine` owns its kind.
    pub fn trace(&self, engine: EngineHandle, task: &TaskId) -> Option<Arc<TraceRecord>> {
        let (owner, _) = self.owner_of(engine.0, task.kind()).ok()?;
        self.graph[owner].store.get(task)
    }

    /// The trace of `task` in `engine`'s own store only.
    pub fn own_trace(&self, engine: EngineHandle, task: &TaskId) -> Option<Arc<TraceRecord>> {
        self.graph.node_weight(engine.0)?.store.get(task)
    }

    pub fn name(&self, engine: EngineHandle) -> Option<&str> {
        self.graph.node_weight(engine.0).map(|node| &*node.name)
    }

    /// Direct parents, in declared order.
    pub fn parents(&self, engine: EngineHandle) -> Vec<EngineHandle> {
        self.graph
            .node_weight(engine.0)
            .map(|node| node.parents.iter().copied().map(EngineHandle).collect())
            .unwrap_or_default()
    }

    /// Every task kind visible from `engine`, sorted.
    pub fn kinds(&self, engine: EngineHandle) -> Vec<&str> {
        let mut kinds: Vec<&str> = self
            .graph
            .node_weight(engine.0)
            .map(|node| node.owners.keys().map(|kind| &**kind).collect())
            .unwrap_or_default();
        kinds.sort_unstable();
        kinds
    }

    pub fn resolver(&self, engine: EngineHandle) -> Option<&ResolverChain> {
        self.graph.node_weight(engine.0).map(|node| &node.resolver)
    }

    pub fn store(&self, engine: EngineHandle) -> Option<&TraceStore> {
        self.graph.node_weight(engine.0).map(|node| &node.store)
    }

    fn node(&self, index: NodeIndex) -> Result<&EngineNode> {
        self.graph
            .node_weight(index)
            .ok_or(Error::UnknownEngine(index.index()))
    }

    pub(crate) fn owner_of(&self, from: NodeIndex, kind: &str) -> Result<(NodeIndex, &TaskDefPtr)> {
        let unknown = || Error::UnknownTask { kind: kind.into() };

        let owner = *self.node(from)?.owners.get(kind).ok_or_else(unknown)?;
        let def = self.graph[owner].registry.lookup(kind).ok_or_else(unknown)?;

        Ok((owner, def))
    }
}

impl std::fmt::Display for Workbench {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let name = node.name.replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index())?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Workbench {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.graph.node_weights().map(|node| &node.name))
            .finish()
    }
}

/// Fluent construction of an engine, see [`Workbench::engine`].
pub struct EngineBuilder<'w> {
    workbench: &'w mut Workbench,
    name: ArcStr,
    parents: Vec<EngineHandle>,
    registry: TaskRegistry,
    resolver: ResolverChain,
    store: Option<TraceStore>,
}

impl EngineBuilder<'_> {
    /// Adds a parent. Parents are consulted in the order they were added.
    pub fn parent(mut self, parent: EngineHandle) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn parents(mut self, parents: impl IntoIterator<Item = EngineHandle>) -> Self {
        self.parents.extend(parents);
        self
    }

    /// The task definitions owned by this engine.
    pub fn tasks(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Local resolvers, consulted before the parents' resolvers.
    pub fn resolver(mut self, resolver: ResolverChain) -> Self {
        self.resolver = resolver;
        self
    }

    /// Where traces are kept. Defaults to [`TraceStore::in_memory`].
    pub fn store(mut self, store: TraceStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<EngineHandle> {
        self.workbench.compose(
            self.name,
            &self.parents,
            self.registry,
            self.resolver,
            self.store.unwrap_or_default(),
        )
    }
}
