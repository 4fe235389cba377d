//! The auto-group pass: merge compatible sibling vertices into composites.
//!
//! Vertices of the same kind carrying the same `meta.autogroup` key collapse
//! into one [`ResourceGroup`] vertex. Edges incident to any member become
//! edges incident to the composite; relations internal to a group disappear.
//! Deterministic: grouping keys are visited in sorted order and members are
//! sorted by name inside the composite.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use super::{Graph, VertexIndex};
use crate::resources::{Resource, ResourceGroup};

/// Run the pass, consuming the graph and returning the grouped one.
pub fn auto_group(graph: Graph) -> Graph {
    // collect candidate groups by (kind, key)
    let mut groups: FxHashMap<(String, String), Vec<VertexIndex>> = FxHashMap::default();
    for ix in graph.sorted_indices() {
        let res = graph.vertex(ix);
        if let Some(key) = res.meta().autogroup {
            groups
                .entry((res.id().kind, key))
                .or_default()
                .push(ix);
        }
    }
    groups.retain(|_, members| members.len() >= 2);
    if groups.is_empty() {
        return graph;
    }

    // member index -> its group key, in deterministic key order
    let mut keys: Vec<(String, String)> = groups.keys().cloned().collect();
    keys.sort();
    let mut member_of: FxHashMap<VertexIndex, usize> = FxHashMap::default();
    for (slot, key) in keys.iter().enumerate() {
        for &ix in &groups[key] {
            member_of.insert(ix, slot);
        }
    }

    let mut out = Graph::new();
    let mut remap: FxHashMap<VertexIndex, VertexIndex> = FxHashMap::default();
    let mut composite_ix: Vec<Option<VertexIndex>> = vec![None; keys.len()];

    for ix in graph.sorted_indices() {
        if let Some(&slot) = member_of.get(&ix) {
            let new_ix = match composite_ix[slot] {
                Some(new_ix) => new_ix,
                None => {
                    let members = groups[&keys[slot]]
                        .iter()
                        .map(|&m| graph.vertex(m).clone())
                        .collect();
                    let composite = Arc::new(ResourceGroup::new(members));
                    debug!(id = %composite.id(), "grouped vertices into composite");
                    let new_ix = out
                        .add_vertex(composite)
                        .expect("composite identities are unique per pass");
                    composite_ix[slot] = Some(new_ix);
                    new_ix
                }
            };
            remap.insert(ix, new_ix);
        } else {
            let new_ix = out
                .add_vertex(graph.vertex(ix).clone())
                .expect("source graph identities are unique");
            remap.insert(ix, new_ix);
        }
    }

    for edge in graph.edges() {
        let from = remap[&edge.from];
        let to = remap[&edge.to];
        if from == to {
            continue; // relation became internal to a composite
        }
        if !out.has_edge(from, to) {
            out.add_edge(from, to, edge.name.clone(), edge.notify)
                .expect("remapped endpoints exist");
        }
    }
    out
}
