//! The graph swap coordinator: a long-running task that turns definition
//! changes into live-graph replacements.
//!
//! Triggers fan in from four places: the definition-source watch, the store
//! watch (events marked not-ready are self-echoes and are ignored), an
//! optional periodic recompile tick, and the exit event. On every trigger the
//! coordinator compiles a candidate graph; a parse or validation failure is
//! logged and the running graph is left untouched. Otherwise:
//!
//! 1. pause the convergence detector, then the running graph (skipped when
//!    nothing runs yet),
//! 2. write the cross-host coordination records in one store transaction;
//!    on failure the swap aborts and the old graph resumes,
//! 3. swap the executor's graph, carrying identity-equal vertices live,
//! 4. activate and resume convergence detection.

use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{self, GraphConfig};
use crate::converger::ConvergerHandle;
use crate::engine::{EngineError, GraphExecutor};
use crate::events::{Event, EventKind};
use crate::graphs::{self, Graph};
use crate::store::{StoreError, StoreEvent, StoreHandle, TxnOp};

/// Key prefix for everything this agent writes to the store.
pub const STORE_PREFIX: &str = "attune/";

#[derive(Debug, Error, Diagnostic)]
pub enum SwapError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),
}

/// Configuration and collaborators for the swap loop.
pub struct SwapCoordinator {
    /// Graph definition file; `None` runs an empty agent that converges
    /// vacuously.
    pub source: Option<PathBuf>,
    /// Recompile when the definition file changes.
    pub watch_source: bool,
    /// Recompile on a fixed period regardless of watches.
    pub compile_interval: Option<Duration>,
    pub store: StoreHandle,
    pub converger: ConvergerHandle,
    pub hostname: String,
    pub noop: bool,
    /// Where to render the active graph in DOT form after each activation.
    pub graphviz: Option<PathBuf>,
    /// Exit event input; acknowledged after the executor has wound down.
    pub exit_rx: flume::Receiver<Event>,
    /// Cancelled by the owner to stop the definition-source watch.
    pub watch_cancel: CancellationToken,
}

enum Trigger {
    Compile,
    Ignore,
    ConfigClosed,
    StoreClosed,
    Exit(Event),
}

impl SwapCoordinator {
    #[instrument(name = "swap_loop", skip(self))]
    pub async fn run(mut self) -> Result<(), SwapError> {
        // one kick so the initial definition compiles without any trigger
        let (kick_tx, kick_rx) = flume::bounded::<()>(1);
        let _ = kick_tx.try_send(());

        // channels for disabled inputs: the held senders keep them forever
        // pending instead of forever erroring
        let (_config_hold, parked_config) = flume::bounded::<bool>(0);
        let (_store_hold, parked_store) = flume::bounded::<StoreEvent>(0);

        let mut config_rx = match (&self.source, self.watch_source) {
            (Some(path), true) => config::config_watch(path.clone(), self.watch_cancel.clone()),
            _ => parked_config.clone(),
        };
        let mut store_rx = self.store.watch(STORE_PREFIX);

        let mut compile_ticker = tokio::time::interval(
            self.compile_interval.unwrap_or(Duration::from_secs(3600)),
        );
        compile_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        compile_ticker.reset(); // skip the immediate first tick; the kick covers it

        let mut executor: Option<GraphExecutor> = None;

        loop {
            let trigger = tokio::select! {
                _ = kick_rx.recv_async() => Trigger::Compile,
                msg = config_rx.recv_async() => match msg {
                    Ok(true) => Trigger::Compile,
                    // source not ready to be read yet
                    Ok(false) => Trigger::Ignore,
                    Err(_) => Trigger::ConfigClosed,
                },
                event = store_rx.recv_async() => match event {
                    Ok(ev) if ev.ready => {
                        debug!(key = %ev.key, "store change");
                        Trigger::Compile
                    }
                    Ok(ev) => {
                        trace!(key = %ev.key, "ignoring store self-echo");
                        Trigger::Ignore
                    }
                    Err(_) => Trigger::StoreClosed,
                },
                _ = compile_ticker.tick(), if self.compile_interval.is_some() => Trigger::Compile,
                event = self.exit_rx.recv_async() => match event {
                    Ok(event) => Trigger::Exit(event),
                    Err(_) => Trigger::Exit(Event::new(EventKind::Exit)),
                },
            };

            match trigger {
                Trigger::Ignore => continue,
                Trigger::ConfigClosed => {
                    config_rx = parked_config.clone();
                    continue;
                }
                Trigger::StoreClosed => {
                    store_rx = parked_store.clone();
                    continue;
                }
                Trigger::Exit(event) => {
                    if let Some(exec) = executor.take() {
                        exec.exit().await?;
                    }
                    event.ack();
                    info!("swap coordinator exited");
                    return Ok(());
                }
                Trigger::Compile => self.compile_and_activate(&mut executor).await,
            }
        }
    }

    /// Compile a candidate graph and, if it is sound, swap it in. Every
    /// failure path leaves the running graph running.
    async fn compile_and_activate(&mut self, executor: &mut Option<GraphExecutor>) {
        let Some(path) = self.source.clone() else {
            return;
        };
        let config = match GraphConfig::parse_file(&path) {
            Ok(config) => config,
            Err(err) => {
                warn!(%err, "definition parse failure, keeping running graph");
                return;
            }
        };
        let mut candidate = match config.into_graph() {
            Ok(graph) => graph,
            Err(err) => {
                warn!(%err, "definition rejected, keeping running graph");
                return;
            }
        };
        let added = graphs::auto_edges(&mut candidate);
        if added > 0 {
            debug!(added, "auto-edges added");
        }
        let candidate = graphs::auto_group(candidate);
        // a vertex failing validation aborts the swap before the running
        // graph is ever disturbed
        if let Err(err) = candidate.validate() {
            warn!(%err, "candidate graph failed validation, aborting swap");
            return;
        }

        match executor.as_mut() {
            Some(exec) => {
                if self.converger.pause().await.is_err() {
                    warn!("convergence detector unavailable, aborting swap");
                    return;
                }
                if let Err(err) = exec.pause().await {
                    error!(%err, "failed to pause running graph, aborting swap");
                    self.converger.resume();
                    return;
                }
                if let Err(err) = self.write_records(&candidate).await {
                    warn!(%err, "store transaction failed, resuming previous graph");
                    if let Err(err) = exec.start(false).await {
                        error!(%err, "failed to resume previous graph");
                    }
                    self.converger.resume();
                    return;
                }
                match exec.swap(candidate).await {
                    Ok(report) => {
                        debug!(
                            kept = report.kept,
                            dropped = report.dropped,
                            fresh = report.fresh,
                            "swap applied"
                        );
                    }
                    Err(err) => {
                        error!(%err, "swap failed, resuming previous graph");
                        if let Err(err) = exec.start(false).await {
                            error!(%err, "failed to resume previous graph");
                        }
                        self.converger.resume();
                        return;
                    }
                }
                if let Err(err) = exec.start(false).await {
                    error!(%err, "activation failed");
                }
                self.converger.resume();
            }
            None => {
                if let Err(err) = self.write_records(&candidate).await {
                    warn!(%err, "store transaction failed, graph not activated");
                    return;
                }
                let mut exec =
                    match GraphExecutor::new(candidate, self.converger.clone(), self.noop) {
                        Ok(exec) => exec,
                        Err(err) => {
                            warn!(%err, "graph rejected");
                            return;
                        }
                    };
                if let Err(err) = exec.start(true).await {
                    warn!(%err, "first activation failed");
                    if let Err(err) = exec.exit().await {
                        warn!(%err, "cleanup after failed activation also failed");
                    }
                    return;
                }
                *executor = Some(exec);
                // the detector is born paused; evaluation begins with the
                // first live graph
                self.converger.resume();
            }
        }

        if let (Some(out), Some(exec)) = (&self.graphviz, executor.as_ref()) {
            if let Err(err) = std::fs::write(out, exec.graph().to_dot()) {
                warn!(%err, path = %out.display(), "graphviz export failed");
            }
        }
    }

    async fn write_records(&self, graph: &Graph) -> Result<(), StoreError> {
        let ids: Vec<String> = graph
            .sorted_indices()
            .into_iter()
            .map(|ix| graph.vertex(ix).id().to_string())
            .collect();
        let base = format!("{STORE_PREFIX}hosts/{}/", self.hostname);
        self.store
            .set_txn(vec![
                TxnOp::Put {
                    key: format!("{base}resources"),
                    value: serde_json::to_string(&ids).unwrap_or_default(),
                },
                TxnOp::Put {
                    key: format!("{base}updated"),
                    value: chrono::Utc::now().to_rfc3339(),
                },
            ])
            .await
    }
}
