//! Global convergence detection: has every live vertex been quiet for T?
//!
//! Vertices report activity over one channel; the converger is the only
//! reader, so the per-vertex timestamp table needs no locking. A periodic
//! tick (at most T/4) evaluates quiescence, and the supplied callback fires
//! exactly once per state transition: `true` on entering the converged
//! state, `false` on leaving it. Pausing suspends evaluation without
//! resetting any timer.

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::events::{Event, EventError, EventKind};

/// Shortest evaluation period, so tiny timeouts do not busy-loop.
const MIN_TICK: Duration = Duration::from_millis(100);
/// Longest evaluation period.
const MAX_TICK: Duration = Duration::from_secs(1);

/// Stable handle for one live vertex, surviving graph swaps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexToken(pub(crate) u64);

/// Invoked on every convergence transition. Errors are logged, never fatal.
pub type ConvergedCallback =
    Box<dyn FnMut(bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send>;

enum Msg {
    Register(VertexToken),
    Unregister(VertexToken),
    Activity(VertexToken),
    Pause(Event),
    Resume,
    Exit(Event),
}

/// Cheap, cloneable front to the converger task.
#[derive(Clone)]
pub struct ConvergerHandle {
    tx: flume::Sender<Msg>,
}

impl ConvergerHandle {
    /// Spawn the converger task. `timeout = None` disables quiescence
    /// detection entirely (a negative timeout at the operational surface).
    ///
    /// The task starts paused so an empty table does not converge vacuously
    /// before the first graph registers its vertices; whoever activates a
    /// graph calls [`resume`](Self::resume).
    pub fn spawn(timeout: Option<Duration>, callback: ConvergedCallback) -> Self {
        let (tx, rx) = flume::unbounded();
        tokio::spawn(converger_loop(rx, timeout, callback));
        Self { tx }
    }

    /// Begin tracking a vertex. Registration counts as activity.
    pub fn register(&self, token: VertexToken) {
        let _ = self.tx.send(Msg::Register(token));
    }

    /// Stop tracking a vertex (teardown or swap drop).
    pub fn unregister(&self, token: VertexToken) {
        let _ = self.tx.send(Msg::Unregister(token));
    }

    /// Report activity for a vertex. Fire-and-forget; safe from any task.
    pub fn activity(&self, token: VertexToken) {
        let _ = self.tx.send(Msg::Activity(token));
    }

    /// Suspend evaluation; returns once the converger has acknowledged.
    pub async fn pause(&self) -> Result<(), EventError> {
        self.fence(|event| Msg::Pause(event)).await
    }

    /// Resume evaluation.
    pub fn resume(&self) {
        let _ = self.tx.send(Msg::Resume);
    }

    /// Stop the converger task; returns once it has wound down.
    pub async fn exit(&self) -> Result<(), EventError> {
        self.fence(|event| Msg::Exit(event)).await
    }

    async fn fence(&self, wrap: impl FnOnce(Event) -> Msg) -> Result<(), EventError> {
        let (event, waiter) = Event::with_ack(EventKind::Pause);
        self.tx
            .send(wrap(event))
            .map_err(|_| EventError::MailboxClosed)?;
        waiter.wait().await
    }
}

fn tick_period(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(t) => (t / 4).clamp(MIN_TICK, MAX_TICK),
        None => MAX_TICK,
    }
}

async fn converger_loop(
    rx: flume::Receiver<Msg>,
    timeout: Option<Duration>,
    mut callback: ConvergedCallback,
) {
    let mut table: FxHashMap<VertexToken, Instant> = FxHashMap::default();
    let mut converged = false;
    let mut paused = true;
    let mut ticker = tokio::time::interval(tick_period(timeout));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut transition = |to: bool, cb: &mut ConvergedCallback| {
        debug!(converged = to, "convergence transition");
        if let Err(err) = cb(to) {
            warn!(%err, "converged callback failed");
        }
    };

    loop {
        tokio::select! {
            msg = rx.recv_async() => {
                let Ok(msg) = msg else { return };
                match msg {
                    Msg::Register(token) => {
                        table.insert(token, Instant::now());
                        if converged && !paused {
                            converged = false;
                            transition(false, &mut callback);
                        }
                    }
                    Msg::Unregister(token) => {
                        table.remove(&token);
                    }
                    Msg::Activity(token) => {
                        trace!(?token, "activity");
                        if let Some(at) = table.get_mut(&token) {
                            *at = Instant::now();
                        }
                        if converged && !paused {
                            converged = false;
                            transition(false, &mut callback);
                        }
                    }
                    Msg::Pause(event) => {
                        paused = true;
                        event.ack();
                    }
                    Msg::Resume => {
                        paused = false;
                    }
                    Msg::Exit(event) => {
                        event.ack();
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                let Some(t) = timeout else { continue };
                if paused {
                    continue;
                }
                let quiet = table.values().all(|at| at.elapsed() >= t);
                if quiet != converged {
                    converged = quiet;
                    transition(quiet, &mut callback);
                }
            }
        }
    }
}
