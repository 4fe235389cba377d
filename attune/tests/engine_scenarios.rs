//! End-to-end scenarios for the reconciliation engine: apply ordering,
//! drift, retries, pause fences, noop purity, and exit mid-apply.

mod common;

use std::sync::Arc;
use std::time::Duration;

use attune::engine::GraphExecutor;
use attune::graphs::Graph;

use common::resources::{ApplyLog, Scripted};
use common::{quiet_converger, recording_converger, wait_until};

const WAIT: Duration = Duration::from_secs(10);

fn pos(order: &[String], name: &str) -> usize {
    order
        .iter()
        .position(|n| n == name)
        .unwrap_or_else(|| panic!("{name} not in changed order {order:?}"))
}

/// A -> B -> C, all initially unsatisfied. Applies run in order, exactly
/// once each, and convergence fires after the quiet period.
#[tokio::test(flavor = "multi_thread")]
async fn linear_chain_applies_in_order_then_converges() {
    let log = ApplyLog::default();
    let a = Arc::new(Scripted::new("a", log.clone()));
    let b = Arc::new(Scripted::new("b", log.clone()));
    let c = Arc::new(Scripted::new("c", log.clone()));

    let mut graph = Graph::new();
    let ia = graph.add_vertex(a.clone()).unwrap();
    let ib = graph.add_vertex(b.clone()).unwrap();
    let ic = graph.add_vertex(c.clone()).unwrap();
    graph.add_edge(ia, ib, "a-b", false).unwrap();
    graph.add_edge(ib, ic, "b-c", false).unwrap();

    let (converger, flips) = recording_converger(Duration::from_millis(400));
    let mut exec = GraphExecutor::new(graph, converger.clone(), false).unwrap();
    exec.start(true).await.unwrap();
    converger.resume();

    assert!(
        wait_until(WAIT, || log.changed_order() == ["a", "b", "c"]).await,
        "expected a,b,c to change in order, got {:?}",
        log.changed_order()
    );
    assert!(
        wait_until(WAIT, || flips.lock().first() == Some(&true)).await,
        "convergence never fired"
    );
    for name in ["a", "b", "c"] {
        assert_eq!(log.changed_count(name), 1, "{name} changed more than once");
    }

    exec.exit().await.unwrap();
    converger.exit().await.unwrap();
}

/// Diamond A -> {B, C} -> D. B and C in either order, both after A and
/// before D; every vertex changes exactly once.
#[tokio::test(flavor = "multi_thread")]
async fn diamond_respects_partial_order() {
    let log = ApplyLog::default();
    let a = Arc::new(Scripted::new("a", log.clone()));
    let b = Arc::new(Scripted::new("b", log.clone()));
    let c = Arc::new(Scripted::new("c", log.clone()));
    let d = Arc::new(Scripted::new("d", log.clone()));

    let mut graph = Graph::new();
    let ia = graph.add_vertex(a).unwrap();
    let ib = graph.add_vertex(b).unwrap();
    let ic = graph.add_vertex(c).unwrap();
    let id = graph.add_vertex(d).unwrap();
    graph.add_edge(ia, ib, "a-b", false).unwrap();
    graph.add_edge(ia, ic, "a-c", false).unwrap();
    graph.add_edge(ib, id, "b-d", false).unwrap();
    graph.add_edge(ic, id, "c-d", false).unwrap();

    let converger = quiet_converger();
    let mut exec = GraphExecutor::new(graph, converger.clone(), false).unwrap();
    exec.start(true).await.unwrap();

    assert!(
        wait_until(WAIT, || {
            ["a", "b", "c", "d"].iter().all(|n| log.changed_count(n) == 1)
        })
        .await,
        "not every vertex changed exactly once: {:?}",
        log.records()
    );
    let order = log.changed_order();
    assert!(pos(&order, "a") < pos(&order, "b"));
    assert!(pos(&order, "a") < pos(&order, "c"));
    assert!(pos(&order, "b") < pos(&order, "d"));
    assert!(pos(&order, "c") < pos(&order, "d"));

    exec.exit().await.unwrap();
    converger.exit().await.unwrap();
}

/// After the chain settles, drift on B re-applies B, re-checks C, leaves
/// A's apply count alone, and flips convergence false -> true around the
/// event.
#[tokio::test(flavor = "multi_thread")]
async fn drift_redrives_only_the_affected_suffix() {
    let log = ApplyLog::default();
    let a = Arc::new(Scripted::new("a", log.clone()));
    let b = Arc::new(Scripted::new("b", log.clone()));
    let c = Arc::new(Scripted::new("c", log.clone()));

    let mut graph = Graph::new();
    let ia = graph.add_vertex(a.clone()).unwrap();
    let ib = graph.add_vertex(b.clone()).unwrap();
    let ic = graph.add_vertex(c.clone()).unwrap();
    graph.add_edge(ia, ib, "a-b", false).unwrap();
    graph.add_edge(ib, ic, "b-c", false).unwrap();

    let (converger, flips) = recording_converger(Duration::from_millis(300));
    let mut exec = GraphExecutor::new(graph, converger.clone(), false).unwrap();
    exec.start(true).await.unwrap();
    converger.resume();

    assert!(wait_until(WAIT, || *flips.lock() == vec![true]).await);
    let c_checks_before = log.check_count("c");

    b.drift();

    assert!(
        wait_until(WAIT, || log.changed_count("b") == 2).await,
        "b never re-applied after drift"
    );
    assert!(
        wait_until(WAIT, || log.check_count("c") > c_checks_before).await,
        "c was never re-checked after b's apply"
    );
    assert!(
        wait_until(WAIT, || *flips.lock() == vec![true, false, true]).await,
        "convergence did not flip around the drift: {:?}",
        flips.lock()
    );
    assert_eq!(log.changed_count("a"), 1);
    assert_eq!(log.changed_count("c"), 1, "c's state never drifted");

    exec.exit().await.unwrap();
    converger.exit().await.unwrap();
}

/// B fails three times, then succeeds; C applies exactly once, after B's
/// success.
#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_retry_with_backoff() {
    let log = ApplyLog::default();
    let a = Arc::new(Scripted::new("a", log.clone()));
    let b = Arc::new(Scripted::new("b", log.clone()).failures(3));
    let c = Arc::new(Scripted::new("c", log.clone()));

    let mut graph = Graph::new();
    let ia = graph.add_vertex(a).unwrap();
    let ib = graph.add_vertex(b).unwrap();
    let ic = graph.add_vertex(c).unwrap();
    graph.add_edge(ia, ib, "a-b", false).unwrap();
    graph.add_edge(ib, ic, "b-c", false).unwrap();

    let converger = quiet_converger();
    let mut exec = GraphExecutor::new(graph, converger.clone(), false).unwrap();
    exec.start(true).await.unwrap();

    // three failures cost roughly 500ms + 1s + 2s of backoff
    assert!(
        wait_until(Duration::from_secs(20), || log.changed_count("c") == 1).await,
        "c never applied after b recovered"
    );
    assert_eq!(log.changed_count("b"), 1);
    let order = log.changed_order();
    assert!(pos(&order, "b") < pos(&order, "c"));

    exec.exit().await.unwrap();
    converger.exit().await.unwrap();
}

/// Exit lands while B sits inside check_apply. The apply finishes, the engine
/// winds down cleanly, and C (whose wakeup arrives after the exit broadcast)
/// never runs.
#[tokio::test(flavor = "multi_thread")]
async fn exit_waits_for_inflight_apply() {
    let log = ApplyLog::default();
    let a = Arc::new(Scripted::new("a", log.clone()));
    let b = Arc::new(Scripted::new("b", log.clone()).delay(Duration::from_millis(400)));
    let c = Arc::new(Scripted::new("c", log.clone()));

    let mut graph = Graph::new();
    let ia = graph.add_vertex(a).unwrap();
    let ib = graph.add_vertex(b.clone()).unwrap();
    let ic = graph.add_vertex(c.clone()).unwrap();
    graph.add_edge(ia, ib, "a-b", false).unwrap();
    graph.add_edge(ib, ic, "b-c", false).unwrap();

    let converger = quiet_converger();
    let mut exec = GraphExecutor::new(graph, converger.clone(), false).unwrap();
    exec.start(true).await.unwrap();

    assert!(wait_until(WAIT, || log.changed_count("a") == 1).await);
    // b is now inside its slow apply
    tokio::time::sleep(Duration::from_millis(150)).await;
    exec.exit().await.unwrap();

    assert_eq!(log.changed_count("b"), 1, "b's in-flight apply must finish");
    assert_eq!(log.check_count("c"), 0, "c must not start after exit");
    assert!(b.was_closed());
    assert!(c.was_closed());

    converger.exit().await.unwrap();
}

/// With global noop set, no check_apply ever runs with
/// apply=true and no state mutates.
#[tokio::test(flavor = "multi_thread")]
async fn noop_never_applies() {
    let log = ApplyLog::default();
    let a = Arc::new(Scripted::new("a", log.clone()));
    let b = Arc::new(Scripted::new("b", log.clone()));

    let mut graph = Graph::new();
    let ia = graph.add_vertex(a.clone()).unwrap();
    let ib = graph.add_vertex(b.clone()).unwrap();
    graph.add_edge(ia, ib, "a-b", false).unwrap();

    let converger = quiet_converger();
    let mut exec = GraphExecutor::new(graph, converger.clone(), true).unwrap();
    exec.start(true).await.unwrap();

    assert!(
        wait_until(WAIT, || {
            log.check_count("a") >= 1 && log.check_count("b") >= 1
        })
        .await
    );
    assert!(
        log.records().iter().all(|r| !r.apply),
        "noop mode ran an apply: {:?}",
        log.records()
    );
    assert!(!a.is_satisfied());
    assert!(!b.is_satisfied());

    exec.exit().await.unwrap();
    converger.exit().await.unwrap();
}

/// After pause returns, nothing applies until resume, even when
/// drift arrives mid-pause; the missed drift surfaces on resume.
#[tokio::test(flavor = "multi_thread")]
async fn pause_is_a_fence() {
    let log = ApplyLog::default();
    let a = Arc::new(Scripted::new("a", log.clone()));
    let b = Arc::new(Scripted::new("b", log.clone()));

    let mut graph = Graph::new();
    let ia = graph.add_vertex(a).unwrap();
    let ib = graph.add_vertex(b.clone()).unwrap();
    graph.add_edge(ia, ib, "a-b", false).unwrap();

    let converger = quiet_converger();
    let mut exec = GraphExecutor::new(graph, converger.clone(), false).unwrap();
    exec.start(true).await.unwrap();
    assert!(wait_until(WAIT, || log.changed_count("b") == 1).await);

    exec.pause().await.unwrap();
    // pause is idempotent
    exec.pause().await.unwrap();
    let frozen = log.len();
    b.drift();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(log.len(), frozen, "check_apply ran while paused");

    exec.start(false).await.unwrap();
    assert!(
        wait_until(WAIT, || log.changed_count("b") == 2).await,
        "the drift missed during the pause never surfaced"
    );

    exec.exit().await.unwrap();
    converger.exit().await.unwrap();
}

/// When everything is already satisfied, one observation pass
/// runs, nothing applies, and the graph goes quiet.
#[tokio::test(flavor = "multi_thread")]
async fn steady_state_is_idempotent() {
    let log = ApplyLog::default();
    let a = Arc::new(Scripted::new("a", log.clone()).satisfied(true));
    let b = Arc::new(Scripted::new("b", log.clone()).satisfied(true));
    let c = Arc::new(Scripted::new("c", log.clone()).satisfied(true));

    let mut graph = Graph::new();
    let ia = graph.add_vertex(a).unwrap();
    let ib = graph.add_vertex(b).unwrap();
    let ic = graph.add_vertex(c).unwrap();
    graph.add_edge(ia, ib, "a-b", false).unwrap();
    graph.add_edge(ib, ic, "b-c", false).unwrap();

    let (converger, flips) = recording_converger(Duration::from_millis(300));
    let mut exec = GraphExecutor::new(graph, converger.clone(), false).unwrap();
    exec.start(true).await.unwrap();
    converger.resume();

    assert!(wait_until(WAIT, || *flips.lock() == vec![true]).await);
    assert!(log.changed_order().is_empty(), "steady state applied something");
    let settled = log.len();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(log.len(), settled, "checks kept running after convergence");

    exec.exit().await.unwrap();
    converger.exit().await.unwrap();
}
