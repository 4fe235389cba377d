use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use super::{KeyValue, Store, StoreError, StoreEvent, TxnOp};

struct Watcher {
    prefix: String,
    session: u64,
    tx: flume::Sender<StoreEvent>,
}

struct Shared {
    data: Mutex<FxHashMap<String, String>>,
    watchers: Mutex<Vec<Watcher>>,
    next_session: AtomicU64,
    destroyed: AtomicBool,
}

/// An in-process store: one shared map with watch fan-out.
///
/// Each handle carries a session id. Watch events caused by a handle's own
/// transaction are delivered to that handle with `ready = false`, so a
/// consumer can ignore the echo of its own writes; other handles see
/// `ready = true`. [`attach`](Self::attach) creates a second handle on the
/// same map, which is how tests model a peer agent.
pub struct MemStore {
    shared: Arc<Shared>,
    session: u64,
}

impl MemStore {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            data: Mutex::new(FxHashMap::default()),
            watchers: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(2),
            destroyed: AtomicBool::new(false),
        });
        Self { shared, session: 1 }
    }

    /// A new handle onto the same map, with its own watch session.
    pub fn attach(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            session: self.shared.next_session.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn notify(&self, keys: &[String]) {
        let mut watchers = self.shared.watchers.lock();
        watchers.retain(|w| !w.tx.is_disconnected());
        for watcher in watchers.iter() {
            for key in keys {
                if key.starts_with(&watcher.prefix) {
                    let _ = watcher.tx.send(StoreEvent {
                        key: key.clone(),
                        ready: watcher.session != self.session,
                    });
                }
            }
        }
    }

    fn check_alive(&self) -> Result<(), StoreError> {
        if self.shared.destroyed.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn startup(&self) -> Result<(), StoreError> {
        self.check_alive()?;
        debug!(session = self.session, "memory store up");
        Ok(())
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        self.shared.destroyed.store(true, Ordering::Relaxed);
        // dropping the senders closes every watch channel
        self.shared.watchers.lock().clear();
        debug!("memory store destroyed");
        Ok(())
    }

    fn watch(&self, prefix: &str) -> flume::Receiver<StoreEvent> {
        let (tx, rx) = flume::unbounded();
        self.shared.watchers.lock().push(Watcher {
            prefix: prefix.to_string(),
            session: self.session,
            tx,
        });
        rx
    }

    async fn get(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        self.check_alive()?;
        let data = self.shared.data.lock();
        let mut out: Vec<KeyValue> = data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn set_txn(&self, ops: Vec<TxnOp>) -> Result<(), StoreError> {
        self.check_alive()?;
        let mut touched = Vec::with_capacity(ops.len());
        {
            let mut data = self.shared.data.lock();
            for op in ops {
                match op {
                    TxnOp::Put { key, value } => {
                        data.insert(key.clone(), value);
                        touched.push(key);
                    }
                    TxnOp::Delete { key } => {
                        data.remove(&key);
                        touched.push(key);
                    }
                }
            }
        }
        self.notify(&touched);
        Ok(())
    }

    fn local_client_urls(&self) -> Vec<String> {
        vec![format!("mem://localhost/{}", self.session)]
    }
}
