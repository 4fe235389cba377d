//! The auto-edge pass: add the dependencies resources imply themselves.
//!
//! Deterministic across runs: vertices are visited in `(kind, name)` order
//! and, within a vertex, dependencies in the order the driver returns them.
//! An addition that would close a cycle is skipped rather than failing the
//! pass.

use tracing::{debug, trace};

use super::Graph;

/// Run the pass in place. Returns how many edges were added.
pub fn auto_edges(graph: &mut Graph) -> usize {
    let mut added = 0;
    for ix in graph.sorted_indices() {
        let res = graph.vertex(ix).clone();
        for dep in res.auto_edges() {
            let Some(dep_ix) = graph.index_of(&dep) else {
                trace!(vertex = %res.id(), dep = %dep, "auto-edge dependency not in graph");
                continue;
            };
            if dep_ix == ix {
                continue;
            }
            let name = format!("auto:{dep}->{}", res.id());
            match graph.try_add_edge_acyclic(dep_ix, ix, name, false) {
                Ok(true) => {
                    debug!(from = %dep, to = %res.id(), "added auto-edge");
                    added += 1;
                }
                Ok(false) => {
                    trace!(from = %dep, to = %res.id(), "auto-edge skipped (present or would cycle)");
                }
                Err(err) => {
                    debug!(from = %dep, to = %res.id(), %err, "auto-edge rejected");
                }
            }
        }
    }
    added
}
