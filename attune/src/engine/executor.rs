//! The graph executor: owns the live graph and supervises vertex tasks.
//!
//! Topology (edge semaphores, neighbor mailboxes) is rewired only while every
//! vertex is paused; between a start and the next pause, running tasks see it
//! as immutable. Pause and exit are fences: they return only after every
//! vertex has acknowledged the transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::converger::{ConvergerHandle, VertexToken};
use crate::events::{self, Event, EventKind};
use crate::graphs::{Graph, GraphError, VertexIndex};
use crate::resources::{ResourceError, ResourceId};

use super::semaphore::EdgeSemaphore;
use super::vertex::{InLink, OutLink, RetryBackoff, VertexLinks, VertexWatcher, VertexWorker};

// Converger tokens must stay unique across executors sharing one converger.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error("resource {id} failed to initialize")]
    #[diagnostic(code(attune::engine::init))]
    Init {
        id: ResourceId,
        #[source]
        source: ResourceError,
    },

    #[error("graph must be paused for this operation")]
    #[diagnostic(code(attune::engine::not_paused))]
    NotPaused,

    #[error("vertex {id} stopped responding")]
    #[diagnostic(code(attune::engine::lost_vertex))]
    LostVertex { id: ResourceId },
}

/// What a swap did to the runtime table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwapReport {
    /// Identity-equal vertices whose runtime (watcher, mailbox, converged
    /// timer) was carried over.
    pub kept: usize,
    /// Old vertices torn down.
    pub dropped: usize,
    /// New vertices that will be kicked on the next start.
    pub fresh: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExecState {
    Running,
    Paused,
}

struct VertexRuntime {
    id: ResourceId,
    mailbox_tx: flume::Sender<Event>,
    links: Arc<RwLock<VertexLinks>>,
    pause_tx: tokio::sync::watch::Sender<bool>,
    cancel: CancellationToken,
    process: JoinHandle<()>,
    watcher: JoinHandle<()>,
    token: VertexToken,
    /// Spawned since the last start; receives a Start kick.
    fresh: bool,
}

/// Supervisor for one live resource graph.
pub struct GraphExecutor {
    graph: Graph,
    runtimes: Vec<Option<VertexRuntime>>,
    edge_sems: FxHashMap<(ResourceId, ResourceId), EdgeSemaphore>,
    converger: ConvergerHandle,
    noop: bool,
    state: ExecState,
}

impl GraphExecutor {
    /// Take ownership of a validated graph. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(graph: Graph, converger: ConvergerHandle, noop: bool) -> Result<Self, EngineError> {
        graph.validate()?;
        let runtimes = (0..graph.len()).map(|_| None).collect();
        Ok(Self {
            graph,
            runtimes,
            edge_sems: FxHashMap::default(),
            converger,
            noop,
            state: ExecState::Paused,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Activate the graph. On the first start every resource is initialized
    /// and only source vertices are kicked; afterwards, paused vertices
    /// resume where they left off and fresh vertices are kicked.
    #[instrument(skip(self), err)]
    pub async fn start(&mut self, first: bool) -> Result<(), EngineError> {
        if self.state == ExecState::Running {
            return Ok(());
        }
        self.graph.validate()?;
        if first {
            for ix in self.graph.sorted_indices() {
                let res = self.graph.vertex(ix);
                res.init().await.map_err(|source| EngineError::Init {
                    id: res.id(),
                    source,
                })?;
            }
        }
        self.spawn_missing();
        self.wire_links();

        // watchers wake first so nothing observed while off goes unseen
        for rt in self.runtimes.iter().flatten() {
            let _ = rt.pause_tx.send(false);
        }

        for ix in 0..self.runtimes.len() {
            let is_source = self.graph.incoming(VertexIndex(ix)).next().is_none();
            let rt = self.runtimes[ix].as_mut().expect("runtime spawned above");
            let send_start = if first { is_source } else { true };
            rt.fresh = false;
            if send_start {
                rt.mailbox_tx
                    .send_async(Event::new(EventKind::Start))
                    .await
                    .map_err(|_| EngineError::LostVertex { id: rt.id.clone() })?;
            }
        }
        self.state = ExecState::Running;
        info!(vertices = self.graph.len(), first, "graph started");
        Ok(())
    }

    /// Fence: returns once every vertex sits in the paused state. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn pause(&mut self) -> Result<(), EngineError> {
        if self.state == ExecState::Paused {
            return Ok(());
        }
        for rt in self.runtimes.iter().flatten() {
            let _ = rt.pause_tx.send(true);
        }
        let mut waiters = Vec::new();
        for rt in self.runtimes.iter().flatten() {
            let (event, waiter) = Event::with_ack(EventKind::Pause);
            rt.mailbox_tx
                .send_async(event)
                .await
                .map_err(|_| EngineError::LostVertex { id: rt.id.clone() })?;
            waiters.push((rt.id.clone(), waiter));
        }
        for (id, waiter) in waiters {
            waiter
                .wait()
                .await
                .map_err(|_| EngineError::LostVertex { id })?;
        }
        self.state = ExecState::Paused;
        debug!("graph paused");
        Ok(())
    }

    /// Tear the whole graph down; returns when every watcher has returned.
    #[instrument(skip(self))]
    pub async fn exit(mut self) -> Result<(), EngineError> {
        let mut waiters = Vec::new();
        for rt in self.runtimes.iter().flatten() {
            rt.cancel.cancel();
            let (event, waiter) = Event::with_ack(EventKind::Exit);
            if rt.mailbox_tx.send_async(event).await.is_ok() {
                waiters.push(waiter);
            }
        }
        for waiter in waiters {
            let _ = waiter.wait().await;
        }
        for rt in self.runtimes.drain(..).flatten() {
            self.converger.unregister(rt.token);
            if let Err(err) = rt.process.await {
                warn!(vertex = %rt.id, %err, "process task join failed");
            }
            if let Err(err) = rt.watcher.await {
                warn!(vertex = %rt.id, %err, "watcher task join failed");
            }
        }
        info!("graph executor exited");
        Ok(())
    }

    /// Replace the paused graph with a new one, carrying the runtime of every
    /// identity-equal vertex across. The caller activates the result with
    /// `start(false)`.
    #[instrument(skip(self, new_graph), err)]
    pub async fn swap(&mut self, mut new_graph: Graph) -> Result<SwapReport, EngineError> {
        if self.state != ExecState::Paused {
            return Err(EngineError::NotPaused);
        }
        new_graph.validate()?;

        let mut new_runtimes: Vec<Option<VertexRuntime>> =
            (0..new_graph.len()).map(|_| None).collect();
        let mut kept = 0;
        for ix in 0..new_graph.len() {
            let new_ix = VertexIndex(ix);
            let id = new_graph.vertex(new_ix).id();
            let Some(old_ix) = self.graph.index_of(&id) else {
                continue;
            };
            let old_res = self.graph.vertex(old_ix).clone();
            if self.runtimes[old_ix.0].is_some()
                && old_res.compare(new_graph.vertex(new_ix).as_ref())
            {
                // adopt the live resource so the running watcher and the new
                // graph agree on a single instance
                new_graph.adopt_resource(new_ix, old_res);
                new_runtimes[ix] = self.runtimes[old_ix.0].take();
                kept += 1;
            }
        }

        let mut dropped = 0;
        for slot in self.runtimes.iter_mut() {
            if let Some(rt) = slot.take() {
                dropped += 1;
                Self::teardown(&self.converger, rt).await;
            }
        }

        self.graph = new_graph;
        self.runtimes = new_runtimes;
        self.prune_edge_sems();
        let fresh = self.graph.len() - kept;
        info!(kept, dropped, fresh, "graph swapped");
        Ok(SwapReport {
            kept,
            dropped,
            fresh,
        })
    }

    async fn teardown(converger: &ConvergerHandle, rt: VertexRuntime) {
        debug!(vertex = %rt.id, "tearing down vertex");
        rt.cancel.cancel();
        let (event, waiter) = Event::with_ack(EventKind::Exit);
        if rt.mailbox_tx.send_async(event).await.is_ok() {
            let _ = waiter.wait().await;
        }
        converger.unregister(rt.token);
        if let Err(err) = rt.process.await {
            warn!(vertex = %rt.id, %err, "process task join failed");
        }
        if let Err(err) = rt.watcher.await {
            warn!(vertex = %rt.id, %err, "watcher task join failed");
        }
    }

    /// Spawn watcher and process tasks for vertices without a runtime. New
    /// tasks park until their first wakeup; watchers start held.
    fn spawn_missing(&mut self) {
        for ix in 0..self.graph.len() {
            if self.runtimes[ix].is_some() {
                continue;
            }
            let res = self.graph.vertex(VertexIndex(ix)).clone();
            let id = res.id();
            let (mailbox_tx, mailbox_rx) = events::mailbox();
            let links = Arc::new(RwLock::new(VertexLinks::default()));
            let (pause_tx, pause_rx) = tokio::sync::watch::channel(true);
            let cancel = CancellationToken::new();
            let token = VertexToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
            self.converger.register(token);

            let worker = VertexWorker {
                id: id.clone(),
                res: res.clone(),
                mailbox: mailbox_rx,
                self_tx: mailbox_tx.clone(),
                links: links.clone(),
                converger: self.converger.clone(),
                token,
                noop: self.noop,
                retry: RetryBackoff::default(),
                pending_wake: false,
            };
            let watcher = VertexWatcher {
                id: id.clone(),
                res,
                mailbox: mailbox_tx.clone(),
                pause_rx,
                cancel: cancel.clone(),
            };
            debug!(vertex = %id, "spawning vertex tasks");
            self.runtimes[ix] = Some(VertexRuntime {
                id,
                mailbox_tx,
                links,
                pause_tx,
                cancel,
                process: tokio::spawn(worker.run()),
                watcher: tokio::spawn(watcher.run()),
                token,
                fresh: true,
            });
        }
    }

    /// Rebuild every vertex's neighborhood view from the current graph,
    /// reusing the semaphore (and any pending token) of surviving edges.
    fn wire_links(&mut self) {
        for ix in 0..self.graph.len() {
            let vix = VertexIndex(ix);
            let my_id = self.graph.vertex(vix).id();
            let mut incoming = Vec::new();
            for edge in self.graph.incoming(vix) {
                let from_id = self.graph.vertex(edge.from).id();
                let sem = self
                    .edge_sems
                    .entry((from_id.clone(), my_id.clone()))
                    .or_default()
                    .clone();
                let upstream = self.runtimes[edge.from.0]
                    .as_ref()
                    .expect("all runtimes spawned before wiring")
                    .mailbox_tx
                    .clone();
                incoming.push(InLink {
                    from: from_id,
                    sem,
                    upstream,
                });
            }
            let mut outgoing = Vec::new();
            for edge in self.graph.outgoing(vix) {
                let to_id = self.graph.vertex(edge.to).id();
                let sem = self
                    .edge_sems
                    .entry((my_id.clone(), to_id.clone()))
                    .or_default()
                    .clone();
                let downstream = self.runtimes[edge.to.0]
                    .as_ref()
                    .expect("all runtimes spawned before wiring")
                    .mailbox_tx
                    .clone();
                outgoing.push(OutLink {
                    to: to_id,
                    sem,
                    downstream,
                });
            }
            let rt = self.runtimes[ix].as_ref().expect("runtime exists");
            let mut links = rt.links.write();
            links.generation += 1;
            links.incoming = incoming;
            links.outgoing = outgoing;
        }
    }

    fn prune_edge_sems(&mut self) {
        let live: FxHashSet<(ResourceId, ResourceId)> = self
            .graph
            .edges()
            .iter()
            .map(|e| {
                (
                    self.graph.vertex(e.from).id(),
                    self.graph.vertex(e.to).id(),
                )
            })
            .collect();
        self.edge_sems.retain(|key, _| live.contains(key));
    }
}
