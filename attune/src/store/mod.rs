//! Interface to the replicated key-value store used for peer discovery and
//! cross-host data exchange.
//!
//! The engine treats the store as an external collaborator: it only needs the
//! lifecycle, a prefix watch, atomic multi-key writes for the swap protocol,
//! and the local client URLs used by remote bootstrapping. [`MemStore`] is an
//! in-process implementation for tests and single-host runs.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

mod mem;

pub use mem::MemStore;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("store startup failed: {0}")]
    #[diagnostic(code(attune::store::startup))]
    Startup(String),

    #[error("transaction failed: {0}")]
    #[diagnostic(code(attune::store::txn))]
    Txn(String),

    #[error("store is not available")]
    #[diagnostic(code(attune::store::unavailable))]
    Unavailable,
}

/// One key-value pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// One operation inside an atomic transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOp {
    Put { key: String, value: String },
    Delete { key: String },
}

/// A watch notification for a key under a watched prefix.
///
/// `ready = false` marks a suppressed self-echo: the watching agent observing
/// its own transaction. Consumers treat those as "ignore" and do not
/// recompile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreEvent {
    pub key: String,
    pub ready: bool,
}

/// The store capability set consumed by the engine.
#[async_trait]
pub trait Store: Send + Sync {
    async fn startup(&self) -> Result<(), StoreError>;

    /// Shut the store down; called last during teardown.
    async fn destroy(&self) -> Result<(), StoreError>;

    /// Subscribe to changes under a key prefix. The channel closes when the
    /// store is destroyed.
    fn watch(&self, prefix: &str) -> flume::Receiver<StoreEvent>;

    /// Read every key-value pair under a prefix.
    async fn get(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    /// Apply all operations atomically, or none of them.
    async fn set_txn(&self, ops: Vec<TxnOp>) -> Result<(), StoreError>;

    /// Client endpoints of the local store member.
    fn local_client_urls(&self) -> Vec<String>;
}

pub type StoreHandle = Arc<dyn Store>;
