//! Graph swap scenarios: identity preservation across swaps, teardown of
//! dropped vertices, and the coordinator's abort paths.

mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use attune::engine::GraphExecutor;
use attune::events::{Event, EventKind};
use attune::graphs::Graph;
use attune::store::{KeyValue, MemStore, Store, StoreError, StoreEvent, StoreHandle, TxnOp};
use attune::swap::SwapCoordinator;

use common::resources::{ApplyLog, Scripted};
use common::{quiet_converger, wait_until};

const WAIT: Duration = Duration::from_secs(10);

/// Swapping {A->B} for {A->B->C} with A and B compare-equal keeps their
/// runtimes live (no re-apply, watchers intact) and applies C exactly once.
#[tokio::test(flavor = "multi_thread")]
async fn swap_preserves_identity_equal_vertices() {
    let log = ApplyLog::default();
    let a1 = Arc::new(Scripted::new("a", log.clone()));
    let b1 = Arc::new(Scripted::new("b", log.clone()));

    let mut g1 = Graph::new();
    let ia = g1.add_vertex(a1.clone()).unwrap();
    let ib = g1.add_vertex(b1.clone()).unwrap();
    g1.add_edge(ia, ib, "a-b", false).unwrap();

    let converger = quiet_converger();
    let mut exec = GraphExecutor::new(g1, converger.clone(), false).unwrap();
    exec.start(true).await.unwrap();
    assert!(wait_until(WAIT, || log.changed_count("b") == 1).await);

    // new definition: compare-equal a and b, plus a fresh c
    let a2 = Arc::new(Scripted::new("a", log.clone()));
    let b2 = Arc::new(Scripted::new("b", log.clone()));
    let c2 = Arc::new(Scripted::new("c", log.clone()));
    let mut g2 = Graph::new();
    let ia = g2.add_vertex(a2).unwrap();
    let ib = g2.add_vertex(b2).unwrap();
    let ic = g2.add_vertex(c2).unwrap();
    g2.add_edge(ia, ib, "a-b", false).unwrap();
    g2.add_edge(ib, ic, "b-c", false).unwrap();

    exec.pause().await.unwrap();
    let report = exec.swap(g2).await.unwrap();
    assert_eq!(report.kept, 2);
    assert_eq!(report.dropped, 0);
    assert_eq!(report.fresh, 1);
    exec.start(false).await.unwrap();

    assert!(wait_until(WAIT, || log.changed_count("c") == 1).await);
    // a and b were re-verified at most, never re-applied
    assert_eq!(log.changed_count("a"), 1);
    assert_eq!(log.changed_count("b"), 1);

    // the original watcher of a still drives the migrated vertex
    a1.drift();
    assert!(
        wait_until(WAIT, || log.changed_count("a") == 2).await,
        "a's original watcher is no longer wired up"
    );

    exec.exit().await.unwrap();
    converger.exit().await.unwrap();
}

/// A vertex that disappears from the definition is torn down and its
/// resource closed; a compare-unequal replacement is treated as new.
#[tokio::test(flavor = "multi_thread")]
async fn swap_tears_down_dropped_and_changed_vertices() {
    let log = ApplyLog::default();
    let a1 = Arc::new(Scripted::new("a", log.clone()));
    let b1 = Arc::new(Scripted::new("b", log.clone()));

    let mut g1 = Graph::new();
    let ia = g1.add_vertex(a1.clone()).unwrap();
    let ib = g1.add_vertex(b1.clone()).unwrap();
    g1.add_edge(ia, ib, "a-b", false).unwrap();

    let converger = quiet_converger();
    let mut exec = GraphExecutor::new(g1, converger.clone(), false).unwrap();
    exec.start(true).await.unwrap();
    assert!(wait_until(WAIT, || log.changed_count("b") == 1).await);

    // a changes parameters (compare-unequal); b disappears
    let a2 = Arc::new(Scripted::new("a", log.clone()).version(1));
    let mut g2 = Graph::new();
    g2.add_vertex(a2).unwrap();

    exec.pause().await.unwrap();
    let report = exec.swap(g2).await.unwrap();
    assert_eq!(report.kept, 0);
    assert_eq!(report.dropped, 2);
    assert_eq!(report.fresh, 1);
    assert!(a1.was_closed());
    assert!(b1.was_closed());

    exec.start(false).await.unwrap();
    assert!(
        wait_until(WAIT, || log.changed_count("a") == 2).await,
        "the replacement vertex never applied"
    );

    exec.exit().await.unwrap();
    converger.exit().await.unwrap();
}

/// A store whose transactions fail a configured number of times before
/// delegating to a real MemStore.
struct FlakyStore {
    inner: MemStore,
    failures_left: AtomicU32,
}

#[async_trait]
impl Store for FlakyStore {
    async fn startup(&self) -> Result<(), StoreError> {
        self.inner.startup().await
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        self.inner.destroy().await
    }

    fn watch(&self, prefix: &str) -> flume::Receiver<StoreEvent> {
        self.inner.watch(prefix)
    }

    async fn get(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        self.inner.get(prefix).await
    }

    async fn set_txn(&self, ops: Vec<TxnOp>) -> Result<(), StoreError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Txn("injected failure".into()));
        }
        self.inner.set_txn(ops).await
    }

    fn local_client_urls(&self) -> Vec<String> {
        self.inner.local_client_urls()
    }
}

fn write_definition(path: &PathBuf, body: &str) {
    std::fs::write(path, body).unwrap();
}

fn sample_definition(dir: &std::path::Path) -> String {
    format!(
        r#"{{
            "graph": "swap-test",
            "resources": {{
                "file": [
                    {{ "name": "out", "path": "{}", "content": "managed\n" }}
                ]
            }}
        }}"#,
        dir.join("out").display()
    )
}

/// End to end through the coordinator: a broken definition never disturbs
/// anything, a store transaction failure aborts the activation, and once
/// both recover the definition is applied for real.
#[tokio::test(flavor = "multi_thread")]
async fn coordinator_aborts_on_parse_and_txn_failures() {
    let dir = tempfile::tempdir().unwrap();
    let def_path = dir.path().join("graph.json");
    let out_path = dir.path().join("out");
    write_definition(&def_path, "this is not json");

    let store: StoreHandle = Arc::new(FlakyStore {
        inner: MemStore::new(),
        failures_left: AtomicU32::new(1),
    });
    let converger = quiet_converger();
    let watch_cancel = CancellationToken::new();
    let (exit_tx, exit_rx) = flume::bounded::<Event>(1);

    let coordinator = SwapCoordinator {
        source: Some(def_path.clone()),
        watch_source: true,
        compile_interval: None,
        store: store.clone(),
        converger: converger.clone(),
        hostname: "testhost".into(),
        noop: false,
        graphviz: None,
        exit_rx,
        watch_cancel: watch_cancel.clone(),
    };
    let task = tokio::spawn(coordinator.run());

    // parse failure: nothing happens
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!out_path.exists());

    // valid definition, but the first store transaction fails: the file
    // watch fires within a poll interval, the attempt aborts, nothing runs
    write_definition(&def_path, &sample_definition(dir.path()));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!out_path.exists(), "activation went through a failed txn");

    write_definition(&def_path, &sample_definition(dir.path()));
    assert!(
        wait_until(Duration::from_secs(10), || out_path.exists()).await,
        "definition was never applied after recovery"
    );

    watch_cancel.cancel();
    let (exit_event, ack) = Event::with_ack(EventKind::Exit);
    exit_tx.send_async(exit_event).await.unwrap();
    ack.wait().await.unwrap();
    task.await.unwrap().unwrap();
    converger.exit().await.unwrap();
}
