//! Typed, acknowledgeable events between the executor and vertex tasks.
//!
//! Every live vertex owns one bounded mailbox, consumed only by its process
//! task. Senders that need a fence attach a responder: [`Event::ack`] fires
//! once the recipient has fully processed the event, and the paired
//! [`AckWaiter::wait`] returns then. Control events (Pause, Exit) always
//! travel with a responder; pokes never do.
//!
//! The `activity` flag separates real external activity (which resets the
//! convergence timer) from pure control traffic (which must not).

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::oneshot;

/// Mailbox depth per vertex. Wakeups coalesce on the consumer side, so a
/// small bound suffices; inter-vertex sends drop rather than block when a
/// peer is saturated.
pub const MAILBOX_CAPACITY: usize = 8;

#[derive(Debug, Error, Diagnostic)]
pub enum EventError {
    /// The recipient dropped the event without acknowledging it.
    #[error("event was dropped before acknowledgement")]
    #[diagnostic(code(attune::events::ack_dropped))]
    AckDropped,

    /// The recipient's mailbox is gone.
    #[error("mailbox closed")]
    #[diagnostic(code(attune::events::mailbox_closed))]
    MailboxClosed,
}

/// What an event asks of its recipient.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Begin (or resume) running.
    Start,
    /// Suspend after the current apply, if any.
    Pause,
    /// Stop for good: stop the watcher, close the resource.
    Exit,
    /// A predecessor completed an apply; re-evaluate.
    Poke,
    /// A successor could not make progress; re-verify and push tokens.
    BackPoke,
    /// The watcher observed possible drift in the external world.
    External,
}

/// A single mailbox message.
#[derive(Debug)]
pub struct Event {
    pub kind: EventKind,
    /// True when this event represents real external activity and should
    /// reset the convergence timer.
    pub activity: bool,
    responder: Option<oneshot::Sender<()>>,
}

impl Event {
    /// A control event with the conventional activity flag for its kind:
    /// only [`EventKind::External`] counts as activity by default.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            activity: matches!(kind, EventKind::External),
            responder: None,
        }
    }

    /// A poke carrying an explicit activity marker ("changed" vs "no-change").
    pub fn poke(activity: bool) -> Self {
        Self {
            kind: EventKind::Poke,
            activity,
            responder: None,
        }
    }

    /// An event whose sender will block until the recipient acknowledges.
    pub fn with_ack(kind: EventKind) -> (Self, AckWaiter) {
        let (tx, rx) = oneshot::channel();
        let event = Self {
            kind,
            activity: false,
            responder: Some(tx),
        };
        (event, AckWaiter(rx))
    }

    /// Acknowledge this event as fully processed. A no-op for events sent
    /// without a responder.
    pub fn ack(mut self) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(());
        }
    }
}

/// The sender half of an acknowledge handshake.
#[derive(Debug)]
pub struct AckWaiter(oneshot::Receiver<()>);

impl AckWaiter {
    /// Suspend until the recipient acknowledges the paired event.
    pub async fn wait(self) -> Result<(), EventError> {
        self.0.await.map_err(|_| EventError::AckDropped)
    }
}

/// Build a fresh vertex mailbox.
pub fn mailbox() -> (flume::Sender<Event>, flume::Receiver<Event>) {
    flume::bounded(MAILBOX_CAPACITY)
}
