//! Per-vertex runtime: the watcher task and the reconciliation state machine.
//!
//! Each live vertex runs two cooperating tasks. The *watcher* executes the
//! resource's `watch`, translating driver signals into `External` events on
//! the vertex's own mailbox (holding them while paused, with one synthetic
//! event on resume if anything was missed). The *process* consumes the
//! mailbox and drives reconciliation:
//!
//! ```text
//! Idle ──wakeup──► AwaitingUpstream ──tokens──► Applying ──► PokingDownstream ──► Idle
//!   │                    │
//!   └──Pause──► Paused ◄─┘   (partially drained tokens are held across a pause)
//! ```
//!
//! Wakeups (Start, Poke, BackPoke, External) coalesce: everything queued when
//! a cycle begins, and everything arriving while it runs, is absorbed into
//! that cycle. The level-triggered state lives in the edge semaphores, so
//! absorbing a wakeup never loses information. When a drain finds an empty
//! edge, the vertex back-pokes that predecessor once and then blocks; the
//! predecessor re-verifies and re-offers its token, which also heals any
//! token lost across a topology swap.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::converger::{ConvergerHandle, VertexToken};
use crate::events::{Event, EventKind};
use crate::resources::{ResourceHandle, ResourceId, WatchContext};

use super::semaphore::EdgeSemaphore;

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_MAX: Duration = Duration::from_secs(30);
/// Consecutive watch failures before a vertex is quarantined.
const WATCH_FAILURE_THRESHOLD: u32 = 5;

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Default)]
pub(crate) struct RetryBackoff {
    failures: u32,
}

impl RetryBackoff {
    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = self.failures.min(6);
        self.failures = self.failures.saturating_add(1);
        (RETRY_BASE * 2u32.pow(exp)).min(RETRY_MAX)
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
    }
}

/// A vertex's view of its neighborhood. Written by the executor only while
/// the vertex is paused (or before it starts); the generation bumps on every
/// rewrite so a resumed drain can tell the topology moved under it.
#[derive(Default)]
pub(crate) struct VertexLinks {
    pub generation: u64,
    pub incoming: Vec<InLink>,
    pub outgoing: Vec<OutLink>,
}

#[derive(Clone)]
pub(crate) struct InLink {
    pub from: ResourceId,
    pub sem: EdgeSemaphore,
    pub upstream: flume::Sender<Event>,
}

#[derive(Clone)]
pub(crate) struct OutLink {
    pub to: ResourceId,
    pub sem: EdgeSemaphore,
    pub downstream: flume::Sender<Event>,
}

enum CycleOutcome {
    Continue,
    Exit,
}

enum WaitOutcome {
    Resume,
    Exit,
}

enum ParkedOutcome {
    Kick,
    Exit,
}

enum DrainOutcome {
    Token,
    Resumed,
    Exit,
}

/// The process task for one vertex.
pub(crate) struct VertexWorker {
    pub id: ResourceId,
    pub res: ResourceHandle,
    pub mailbox: flume::Receiver<Event>,
    pub self_tx: flume::Sender<Event>,
    pub links: Arc<RwLock<VertexLinks>>,
    pub converger: ConvergerHandle,
    pub token: VertexToken,
    pub noop: bool,
    pub retry: RetryBackoff,
    pub pending_wake: bool,
}

impl VertexWorker {
    pub(crate) async fn run(mut self) {
        // parked until the executor injects the first wakeup
        match self.parked_wait().await {
            ParkedOutcome::Exit => return self.shutdown().await,
            ParkedOutcome::Kick => {
                if matches!(self.reconcile_cycle().await, CycleOutcome::Exit) {
                    return self.shutdown().await;
                }
            }
        }
        loop {
            let Ok(event) = self.mailbox.recv_async().await else {
                return self.shutdown().await;
            };
            match event.kind {
                EventKind::Exit => {
                    event.ack();
                    return self.shutdown().await;
                }
                EventKind::Pause => {
                    event.ack();
                    match self.paused_wait().await {
                        WaitOutcome::Exit => return self.shutdown().await,
                        WaitOutcome::Resume => {
                            if std::mem::take(&mut self.pending_wake)
                                && matches!(self.reconcile_cycle().await, CycleOutcome::Exit)
                            {
                                return self.shutdown().await;
                            }
                        }
                    }
                }
                EventKind::Start
                | EventKind::Poke
                | EventKind::BackPoke
                | EventKind::External => {
                    if event.activity {
                        self.converger.activity(self.token);
                    }
                    event.ack();
                    if matches!(self.reconcile_cycle().await, CycleOutcome::Exit) {
                        return self.shutdown().await;
                    }
                }
            }
        }
    }

    /// Wait for the first wakeup. A vertex that has never run treats any
    /// wakeup, including Start, as a reason to reconcile.
    async fn parked_wait(&mut self) -> ParkedOutcome {
        loop {
            let Ok(event) = self.mailbox.recv_async().await else {
                return ParkedOutcome::Exit;
            };
            match event.kind {
                EventKind::Exit => {
                    event.ack();
                    return ParkedOutcome::Exit;
                }
                EventKind::Pause => event.ack(),
                _ => {
                    if event.activity {
                        self.converger.activity(self.token);
                    }
                    event.ack();
                    return ParkedOutcome::Kick;
                }
            }
        }
    }

    /// Paused: absorb wakeups (remembering that one arrived) until Start
    /// resumes us or Exit tears us down.
    async fn paused_wait(&mut self) -> WaitOutcome {
        loop {
            let Ok(event) = self.mailbox.recv_async().await else {
                return WaitOutcome::Exit;
            };
            match event.kind {
                EventKind::Start => {
                    event.ack();
                    return WaitOutcome::Resume;
                }
                EventKind::Exit => {
                    event.ack();
                    return WaitOutcome::Exit;
                }
                EventKind::Pause => event.ack(),
                _ => {
                    if event.activity {
                        self.converger.activity(self.token);
                    }
                    event.ack();
                    self.pending_wake = true;
                }
            }
        }
    }

    /// One full pass: drain a token per incoming edge, check/apply, then
    /// push tokens and pokes downstream.
    async fn reconcile_cycle(&mut self) -> CycleOutcome {
        // fold queued wakeups into this cycle
        loop {
            match self.mailbox.try_recv() {
                Ok(event) => match event.kind {
                    EventKind::Exit => {
                        event.ack();
                        return CycleOutcome::Exit;
                    }
                    EventKind::Pause => {
                        event.ack();
                        match self.paused_wait().await {
                            WaitOutcome::Exit => return CycleOutcome::Exit,
                            WaitOutcome::Resume => {
                                self.pending_wake = false;
                            }
                        }
                    }
                    _ => {
                        if event.activity {
                            self.converger.activity(self.token);
                        }
                        event.ack();
                    }
                },
                Err(_) => break,
            }
        }

        // Awaiting-Upstream
        'drain: loop {
            let (generation, incoming) = {
                let links = self.links.read();
                (links.generation, links.incoming.clone())
            };
            let mut drained = vec![false; incoming.len()];
            for (slot, link) in incoming.iter().enumerate() {
                if link.sem.try_drain() {
                    drained[slot] = true;
                }
            }
            // ask unready predecessors to re-verify, once per edge per pass
            for (slot, link) in incoming.iter().enumerate() {
                if !drained[slot] {
                    trace!(vertex = %self.id, upstream = %link.from, "back-poking unready predecessor");
                    let _ = link.upstream.try_send(Event::new(EventKind::BackPoke));
                }
            }
            let mut slot = 0;
            while slot < incoming.len() {
                if drained[slot] {
                    slot += 1;
                    continue;
                }
                match self.drain_edge(&incoming[slot].sem).await {
                    DrainOutcome::Token => {
                        drained[slot] = true;
                        slot += 1;
                    }
                    DrainOutcome::Exit => return CycleOutcome::Exit,
                    DrainOutcome::Resumed => {
                        if self.links.read().generation != generation {
                            // topology moved while we were paused; restart
                            // against the new edge set (tokens lost here are
                            // recovered through back-pokes)
                            continue 'drain;
                        }
                    }
                }
            }
            break;
        }

        // Applying
        let apply = !self.noop && !self.res.meta().noop;
        let state_ok = match self.res.check_apply(apply).await {
            Err(err) => {
                warn!(vertex = %self.id, %err, "check/apply failed, scheduling retry");
                self.schedule_retry();
                return CycleOutcome::Continue;
            }
            Ok(ok) => ok,
        };
        self.retry.reset();
        // a completed pass counts as activity
        self.converger.activity(self.token);
        let changed = !state_ok;
        if changed {
            debug!(vertex = %self.id, applied = apply, "converged vertex state");
        } else {
            trace!(vertex = %self.id, "state already satisfied");
        }

        // Poking-Downstream
        let outgoing = self.links.read().outgoing.clone();
        for link in &outgoing {
            link.sem.offer();
            let _ = link.downstream.try_send(Event::poke(changed));
        }
        CycleOutcome::Continue
    }

    /// Block on one edge while servicing the mailbox: pokes absorb into the
    /// running cycle, Pause parks us holding what we already drained.
    async fn drain_edge(&mut self, sem: &EdgeSemaphore) -> DrainOutcome {
        let sem = sem.clone();
        let mailbox = self.mailbox.clone();
        loop {
            enum Step {
                Token(bool),
                Mail(Option<Event>),
            }
            let step = tokio::select! {
                token = sem.drain() => Step::Token(token.is_ok()),
                event = mailbox.recv_async() => Step::Mail(event.ok()),
            };
            match step {
                Step::Token(true) => return DrainOutcome::Token,
                Step::Token(false) | Step::Mail(None) => return DrainOutcome::Exit,
                Step::Mail(Some(event)) => match event.kind {
                    EventKind::Exit => {
                        event.ack();
                        return DrainOutcome::Exit;
                    }
                    EventKind::Pause => {
                        event.ack();
                        match self.paused_wait().await {
                            WaitOutcome::Exit => return DrainOutcome::Exit,
                            WaitOutcome::Resume => {
                                self.pending_wake = false;
                                return DrainOutcome::Resumed;
                            }
                        }
                    }
                    _ => {
                        if event.activity {
                            self.converger.activity(self.token);
                        }
                        event.ack();
                    }
                },
            }
        }
    }

    fn schedule_retry(&mut self) {
        let delay = self.retry.next_delay();
        let tx = self.self_tx.clone();
        trace!(vertex = %self.id, ?delay, "retry scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send_async(Event::new(EventKind::Poke)).await;
        });
    }

    async fn shutdown(self) {
        if let Err(err) = self.res.close().await {
            warn!(vertex = %self.id, %err, "resource close failed");
        }
        debug!(vertex = %self.id, "vertex exited");
    }
}

/// The watcher task for one vertex.
pub(crate) struct VertexWatcher {
    pub id: ResourceId,
    pub res: ResourceHandle,
    pub mailbox: flume::Sender<Event>,
    pub pause_rx: tokio::sync::watch::Receiver<bool>,
    pub cancel: CancellationToken,
}

enum WatchOutcome {
    Cancelled,
    Ended,
    Failed(crate::resources::ResourceError),
}

impl VertexWatcher {
    pub(crate) async fn run(mut self) {
        let mut failures = 0u32;
        let mut backoff = RetryBackoff::default();
        loop {
            let (sig_tx, sig_rx) = flume::bounded(4);
            let ctx = WatchContext {
                signals: sig_tx,
                cancel: self.cancel.child_token(),
            };
            let res = self.res.clone();
            let mut watch_fut = Box::pin(async move { res.watch(ctx).await });
            let cancel = self.cancel.clone();
            let mailbox = self.mailbox.clone();
            let mut missed = false;
            let mut signals_open = true;

            enum Sel {
                Cancelled,
                WatchDone(Result<(), crate::resources::ResourceError>),
                Signal(Result<(), flume::RecvError>),
                PauseFlip,
            }
            let outcome = loop {
                let sel = tokio::select! {
                    _ = cancel.cancelled() => Sel::Cancelled,
                    result = &mut watch_fut => Sel::WatchDone(result),
                    sig = sig_rx.recv_async(), if signals_open => Sel::Signal(sig),
                    changed = self.pause_rx.changed() => {
                        if changed.is_err() {
                            Sel::Cancelled
                        } else {
                            Sel::PauseFlip
                        }
                    }
                };
                match sel {
                    Sel::Cancelled => break WatchOutcome::Cancelled,
                    Sel::WatchDone(Ok(())) => break WatchOutcome::Ended,
                    Sel::WatchDone(Err(err)) => break WatchOutcome::Failed(err),
                    Sel::Signal(Err(_)) => signals_open = false,
                    Sel::Signal(Ok(())) => {
                        if *self.pause_rx.borrow() {
                            missed = true;
                        } else {
                            let _ = mailbox.try_send(Event::new(EventKind::External));
                        }
                    }
                    Sel::PauseFlip => {
                        if !*self.pause_rx.borrow() && missed {
                            // resume: surface whatever was held back as one
                            // synthetic event
                            missed = false;
                            let _ = mailbox.try_send(Event::new(EventKind::External));
                        }
                    }
                }
            };

            match outcome {
                WatchOutcome::Cancelled => return,
                WatchOutcome::Ended => {
                    debug!(vertex = %self.id, "watch ended");
                    return;
                }
                WatchOutcome::Failed(err) => {
                    failures += 1;
                    if failures >= WATCH_FAILURE_THRESHOLD {
                        error!(vertex = %self.id, %err, "watcher failed repeatedly, quarantining vertex");
                        let _ = self.mailbox.try_send(Event::new(EventKind::Pause));
                        return;
                    }
                    warn!(vertex = %self.id, %err, attempt = failures, "watch failed, restarting");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff.next_delay()) => {}
                    }
                }
            }
        }
    }
}
