//! ```text
//! GraphConfig ─► Graph ─► auto_edges / auto_group ─► GraphExecutor
//!                                                     │
//!                              ┌──────────────────────┼─────────────────┐
//!                              │                      │                 │
//!                         VertexWatcher ─► mailbox ─► VertexWorker ─► EdgeSemaphores
//!                                                     │
//!                                                     └─► ConvergerHandle ─► callback
//!
//! SwapCoordinator drives the loop: watch sources ─► compile ─► pause ─►
//! swap ─► activate, against the Store for cross-host records.
//! ```
//!
//! Attune is the reconciliation core of a distributed configuration
//! convergence agent: a concurrent, dynamically reloadable resource graph
//! whose vertices execute independently under dependency ordering, with a
//! global quiescence detector layered on top. Resource drivers, the graph
//! definition source, and the replicated store are consumed through the
//! interfaces in [`resources`], [`config`], and [`store`].

pub mod config;
pub mod converger;
pub mod engine;
pub mod events;
pub mod graphs;
pub mod resources;
pub mod store;
pub mod swap;
