//! A scripted resource for driving the engine from tests: records every
//! `check_apply`, can fail a configured number of times, simulates slow
//! applies, and exposes a drift trigger wired to its watcher.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use attune::resources::{Resource, ResourceError, ResourceId, ResourceMeta, WatchContext};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyRecord {
    pub id: ResourceId,
    pub apply: bool,
    pub changed: bool,
}

/// Shared, totally ordered record of every `check_apply` across a graph.
#[derive(Clone, Default)]
pub struct ApplyLog(Arc<Mutex<Vec<ApplyRecord>>>);

impl ApplyLog {
    pub fn push(&self, record: ApplyRecord) {
        self.0.lock().push(record);
    }

    pub fn records(&self) -> Vec<ApplyRecord> {
        self.0.lock().clone()
    }

    /// Names of changed applies, in completion order.
    pub fn changed_order(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|r| r.changed && r.apply)
            .map(|r| r.id.name.clone())
            .collect()
    }

    /// How many times `name` actually changed state.
    pub fn changed_count(&self, name: &str) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|r| r.id.name == name && r.changed && r.apply)
            .count()
    }

    /// How many times `name` was checked at all.
    pub fn check_count(&self, name: &str) -> usize {
        self.0.lock().iter().filter(|r| r.id.name == name).count()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// The scripted resource. Starts unsatisfied unless told otherwise; a
/// successful apply satisfies it until [`drift`](Self::drift).
pub struct Scripted {
    id: ResourceId,
    log: ApplyLog,
    satisfied: AtomicBool,
    fail_remaining: AtomicU32,
    delay: Duration,
    version: u32,
    autogroup: Option<String>,
    drift_tx: flume::Sender<()>,
    drift_rx: flume::Receiver<()>,
    in_flight: AtomicBool,
    closed: AtomicBool,
}

impl Scripted {
    pub fn new(name: &str, log: ApplyLog) -> Self {
        let (drift_tx, drift_rx) = flume::unbounded();
        Self {
            id: ResourceId::new("test", name),
            log,
            satisfied: AtomicBool::new(false),
            fail_remaining: AtomicU32::new(0),
            delay: Duration::ZERO,
            version: 0,
            autogroup: None,
            drift_tx,
            drift_rx,
            in_flight: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn satisfied(mut self, yes: bool) -> Self {
        self.satisfied = AtomicBool::new(yes);
        self
    }

    /// Fail the next `n` check_apply calls.
    pub fn failures(mut self, n: u32) -> Self {
        self.fail_remaining = AtomicU32::new(n);
        self
    }

    /// Sleep this long inside every check_apply.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Change the compare discriminator, making this resource swap-unequal
    /// to an otherwise identical one.
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn autogroup(mut self, key: &str) -> Self {
        self.autogroup = Some(key.to_string());
        self
    }

    /// Simulate external drift: the state is no longer satisfied and the
    /// watcher is woken.
    pub fn drift(&self) {
        self.satisfied.store(false, Ordering::SeqCst);
        let _ = self.drift_tx.send(());
    }

    pub fn is_satisfied(&self) -> bool {
        self.satisfied.load(Ordering::SeqCst)
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resource for Scripted {
    fn id(&self) -> ResourceId {
        self.id.clone()
    }

    fn meta(&self) -> ResourceMeta {
        ResourceMeta {
            autogroup: self.autogroup.clone(),
            ..Default::default()
        }
    }

    async fn watch(&self, ctx: WatchContext) -> Result<(), ResourceError> {
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                sig = self.drift_rx.recv_async() => {
                    if sig.is_err() || !ctx.notify() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn check_apply(&self, apply: bool) -> Result<bool, ResourceError> {
        // the engine must never run two check_apply calls concurrently
        assert!(
            !self.in_flight.swap(true, Ordering::SeqCst),
            "concurrent check_apply on {}",
            self.id
        );
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(ResourceError::Apply(format!("{}: scripted failure", self.id)))
        } else {
            let was = self.satisfied.load(Ordering::SeqCst);
            if apply && !was {
                self.satisfied.store(true, Ordering::SeqCst);
            }
            self.log.push(ApplyRecord {
                id: self.id.clone(),
                apply,
                changed: !was,
            });
            Ok(was)
        };
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    fn compare(&self, other: &dyn Resource) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|o| o.id == self.id && o.version == self.version)
    }

    async fn close(&self) -> Result<(), ResourceError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
