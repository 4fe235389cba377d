//! Single-slot token channels gating dependency order across an edge.
//!
//! The upstream vertex offers a token after every successful apply; the
//! downstream vertex drains one token per incoming edge before its own
//! apply may run. The single slot is what collapses multiple upstream
//! applies between two downstream applies into one: offering into a full
//! slot is a no-op.

use crate::events::EventError;

/// The token channel for one edge. Cloning shares the slot.
#[derive(Clone, Debug)]
pub struct EdgeSemaphore {
    tx: flume::Sender<()>,
    rx: flume::Receiver<()>,
}

impl EdgeSemaphore {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self { tx, rx }
    }

    /// Make a token available downstream. Collapses with any token already
    /// pending.
    pub fn offer(&self) {
        let _ = self.tx.try_send(());
    }

    /// Take a pending token without waiting.
    pub fn try_drain(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Wait for a token.
    pub async fn drain(&self) -> Result<(), EventError> {
        self.rx
            .recv_async()
            .await
            .map_err(|_| EventError::MailboxClosed)
    }

    /// True when a token is waiting.
    pub fn has_token(&self) -> bool {
        !self.rx.is_empty()
    }
}

impl Default for EdgeSemaphore {
    fn default() -> Self {
        Self::new()
    }
}
