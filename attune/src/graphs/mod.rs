//! The resource DAG: an arena of vertices plus index-pair edges.
//!
//! The graph owns its resources (`Arc<dyn Resource>`) in a vector, keeps a
//! map from identity to index, and stores edges as index pairs, so the
//! structure itself never forms reference cycles. Live per-vertex state
//! (mailboxes, semaphores, timers) lives beside the graph in the executor,
//! keyed by the same indices.
//!
//! Build-time invariants: no cycles, every edge endpoint exists, at most one
//! vertex per `(kind, name)` identity.

use std::fmt::Write as _;

use miette::Diagnostic;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::resources::{ResourceError, ResourceHandle, ResourceId};

mod autoedges;
mod autogroup;

pub use autoedges::auto_edges;
pub use autogroup::auto_group;

/// Index of a vertex inside one graph. Indices are not stable across swaps;
/// identities are.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexIndex(pub usize);

/// A directed "must be applied after" relation between two vertices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edge {
    pub from: VertexIndex,
    pub to: VertexIndex,
    pub name: String,
    /// Marks a notification relation; carried through rewrites and shown in
    /// DOT output.
    pub notify: bool,
}

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("duplicate vertex identity: {id}")]
    #[diagnostic(
        code(attune::graphs::duplicate_vertex),
        help("Each (kind, name) pair may appear at most once per graph.")
    )]
    DuplicateVertex { id: ResourceId },

    #[error("edge references unknown vertex index {index}")]
    #[diagnostic(code(attune::graphs::bad_index))]
    BadIndex { index: usize },

    #[error("graph contains a cycle")]
    #[diagnostic(
        code(attune::graphs::cycle),
        help("Resource dependencies must form a DAG.")
    )]
    Cycle,

    #[error("resource {id} failed validation")]
    #[diagnostic(code(attune::graphs::validation))]
    Validation {
        id: ResourceId,
        #[source]
        source: ResourceError,
    },
}

/// The resource dependency DAG.
#[derive(Clone, Default)]
pub struct Graph {
    vertices: Vec<ResourceHandle>,
    index: FxHashMap<ResourceId, VertexIndex>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vertices.
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Add a vertex, rejecting duplicate identities.
    pub fn add_vertex(&mut self, resource: ResourceHandle) -> Result<VertexIndex, GraphError> {
        let id = resource.id();
        if self.index.contains_key(&id) {
            return Err(GraphError::DuplicateVertex { id });
        }
        let ix = VertexIndex(self.vertices.len());
        self.vertices.push(resource);
        self.index.insert(id, ix);
        Ok(ix)
    }

    /// Add an edge between existing vertices. Acyclicity is checked by
    /// [`validate`](Self::validate) over the whole graph; use
    /// [`try_add_edge_acyclic`](Self::try_add_edge_acyclic) for incremental
    /// additions that must preserve it.
    pub fn add_edge(
        &mut self,
        from: VertexIndex,
        to: VertexIndex,
        name: impl Into<String>,
        notify: bool,
    ) -> Result<(), GraphError> {
        for ix in [from, to] {
            if ix.0 >= self.vertices.len() {
                return Err(GraphError::BadIndex { index: ix.0 });
            }
        }
        self.edges.push(Edge {
            from,
            to,
            name: name.into(),
            notify,
        });
        Ok(())
    }

    /// Add an edge only if the graph stays acyclic; returns whether it was
    /// added. An already-present `(from, to)` pair is left alone.
    pub fn try_add_edge_acyclic(
        &mut self,
        from: VertexIndex,
        to: VertexIndex,
        name: impl Into<String>,
        notify: bool,
    ) -> Result<bool, GraphError> {
        if self.has_edge(from, to) {
            return Ok(false);
        }
        self.add_edge(from, to, name, notify)?;
        if petgraph::algo::is_cyclic_directed(&self.to_petgraph()) {
            self.edges.pop();
            return Ok(false);
        }
        Ok(true)
    }

    pub fn has_edge(&self, from: VertexIndex, to: VertexIndex) -> bool {
        self.edges.iter().any(|e| e.from == from && e.to == to)
    }

    pub fn vertex(&self, ix: VertexIndex) -> &ResourceHandle {
        &self.vertices[ix.0]
    }

    pub fn index_of(&self, id: &ResourceId) -> Option<VertexIndex> {
        self.index.get(id).copied()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Vertex indices paired with handles.
    pub fn iter(&self) -> impl Iterator<Item = (VertexIndex, &ResourceHandle)> {
        self.vertices
            .iter()
            .enumerate()
            .map(|(i, r)| (VertexIndex(i), r))
    }

    /// Indices sorted by `(kind, name)`: the iteration order of every
    /// deterministic pass.
    pub fn sorted_indices(&self) -> Vec<VertexIndex> {
        let mut ixs: Vec<VertexIndex> = (0..self.vertices.len()).map(VertexIndex).collect();
        ixs.sort_by_key(|ix| self.vertices[ix.0].id());
        ixs
    }

    /// Edges pointing into `ix`.
    pub fn incoming(&self, ix: VertexIndex) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == ix)
    }

    /// Edges leaving `ix`.
    pub fn outgoing(&self, ix: VertexIndex) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == ix)
    }

    /// Swap the resource behind an index while keeping identity and edges.
    ///
    /// Used during a graph swap to let the incoming graph adopt the live
    /// resource of an identity-equal vertex. The caller guarantees the
    /// replacement carries the same identity.
    pub(crate) fn adopt_resource(&mut self, ix: VertexIndex, resource: ResourceHandle) {
        debug_assert_eq!(self.vertices[ix.0].id(), resource.id());
        self.vertices[ix.0] = resource;
    }

    /// Validate structure and resources: acyclicity plus per-resource
    /// `validate`.
    pub fn validate(&self) -> Result<(), GraphError> {
        if petgraph::algo::is_cyclic_directed(&self.to_petgraph()) {
            return Err(GraphError::Cycle);
        }
        for (_, res) in self.iter() {
            res.validate().map_err(|source| GraphError::Validation {
                id: res.id(),
                source,
            })?;
        }
        Ok(())
    }

    /// Convert to a petgraph `DiGraph` for algorithms and DOT export.
    pub fn to_petgraph(&self) -> DiGraph<ResourceId, ()> {
        let mut graph = DiGraph::new();
        let mut nodes: Vec<NodeIndex> = Vec::with_capacity(self.vertices.len());
        for res in &self.vertices {
            nodes.push(graph.add_node(res.id()));
        }
        for edge in &self.edges {
            graph.add_edge(nodes[edge.from.0], nodes[edge.to.0], ());
        }
        graph
    }

    /// Render the graph in DOT format for graphviz tooling.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        writeln!(out, "digraph {{").unwrap();
        writeln!(out, "    rankdir=TB;").unwrap();
        writeln!(out, "    node [shape=box, style=rounded];").unwrap();
        for (ix, res) in self.iter() {
            writeln!(out, "    {} [ label=\"{}\" ];", ix.0, res.id()).unwrap();
        }
        for edge in &self.edges {
            let style = if edge.notify { " [ style=bold ]" } else { "" };
            writeln!(out, "    {} -> {}{};", edge.from.0, edge.to.0, style).unwrap();
        }
        writeln!(out, "}}").unwrap();
        out
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("vertices", &self.vertices.iter().map(|r| r.id()).collect::<Vec<_>>())
            .field("edges", &self.edges)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::resources::NoopRes;

    fn noop(name: &str) -> ResourceHandle {
        Arc::new(NoopRes::new(name))
    }

    #[test]
    fn duplicate_identity_rejected() {
        let mut g = Graph::new();
        g.add_vertex(noop("a")).unwrap();
        assert!(matches!(
            g.add_vertex(noop("a")),
            Err(GraphError::DuplicateVertex { .. })
        ));
    }

    #[test]
    fn cycle_rejected_by_validate() {
        let mut g = Graph::new();
        let a = g.add_vertex(noop("a")).unwrap();
        let b = g.add_vertex(noop("b")).unwrap();
        g.add_edge(a, b, "ab", false).unwrap();
        g.add_edge(b, a, "ba", false).unwrap();
        assert!(matches!(g.validate(), Err(GraphError::Cycle)));
    }

    #[test]
    fn acyclic_addition_guard() {
        let mut g = Graph::new();
        let a = g.add_vertex(noop("a")).unwrap();
        let b = g.add_vertex(noop("b")).unwrap();
        assert!(g.try_add_edge_acyclic(a, b, "ab", false).unwrap());
        // the reverse edge would close a cycle
        assert!(!g.try_add_edge_acyclic(b, a, "ba", false).unwrap());
        assert_eq!(g.edges().len(), 1);
        // duplicates collapse
        assert!(!g.try_add_edge_acyclic(a, b, "ab2", false).unwrap());
    }

    #[test]
    fn sorted_indices_order_by_identity() {
        let mut g = Graph::new();
        g.add_vertex(noop("c")).unwrap();
        g.add_vertex(noop("a")).unwrap();
        g.add_vertex(noop("b")).unwrap();
        let names: Vec<String> = g
            .sorted_indices()
            .into_iter()
            .map(|ix| g.vertex(ix).id().name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn dot_output_mentions_every_vertex() {
        let mut g = Graph::new();
        let a = g.add_vertex(noop("a")).unwrap();
        let b = g.add_vertex(noop("b")).unwrap();
        g.add_edge(a, b, "ab", true).unwrap();
        let dot = g.to_dot();
        assert!(dot.contains("noop[a]"));
        assert!(dot.contains("noop[b]"));
        assert!(dot.contains("0 -> 1"));
    }
}
