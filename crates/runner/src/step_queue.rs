//! Per-browser step ordering
//!
//! Each (test, browser) pair finalizes its check steps in call order even
//! though renders complete out of order. A step awaits its predecessor's
//! completion signal before finalizing; the signal fires on drop, so a
//! failed or skipped step never wedges its successors.

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Default)]
pub struct StepQueue {
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

/// A step's place in the queue: the predecessor to await and the guard
/// that releases the successor.
pub struct StepTicket {
    predecessor: Option<oneshot::Receiver<()>>,
    _guard: StepGuard,
}

struct StepGuard {
    done: Option<oneshot::Sender<()>>,
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl StepQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next position. Must be called in submission order; the
    /// returned ticket is awaited (and dropped) whenever the step actually
    /// finishes.
    pub fn begin_step(&self) -> StepTicket {
        let (done, next) = oneshot::channel();
        let predecessor = self.tail.lock().replace(next);
        StepTicket {
            predecessor,
            _guard: StepGuard { done: Some(done) },
        }
    }
}

impl StepTicket {
    /// Wait until every earlier step has finished. A dropped predecessor
    /// counts as finished.
    pub async fn wait_for_predecessor(&mut self) {
        if let Some(predecessor) = self.predecessor.take() {
            let _ = predecessor.await;
        }
    }
}
