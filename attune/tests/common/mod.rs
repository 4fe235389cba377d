#![allow(dead_code)]

pub mod resources;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use attune::converger::{ConvergedCallback, ConvergerHandle};

/// Poll `cond` until it holds or `deadline` passes.
pub async fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if cond() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A converger whose transitions are recorded for assertions.
pub fn recording_converger(timeout: Duration) -> (ConvergerHandle, Arc<Mutex<Vec<bool>>>) {
    let flips: Arc<Mutex<Vec<bool>>> = Arc::default();
    let sink = flips.clone();
    let callback: ConvergedCallback = Box::new(move |converged| {
        sink.lock().push(converged);
        Ok(())
    });
    (ConvergerHandle::spawn(Some(timeout), callback), flips)
}

/// A converger that never evaluates; for tests that only exercise the engine.
pub fn quiet_converger() -> ConvergerHandle {
    ConvergerHandle::spawn(None, Box::new(|_| Ok(())))
}
