//! Shared run bookkeeping
//!
//! A `TestController` tracks failure state for the sibling sessions of one
//! logical test (one per browser). A fatal error stops every sibling; a
//! local error stops only its own index. `GlobalState` holds the few pieces
//! of cross-test state a runner owns, always passed in explicitly.

use ocular_common::Error;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct TestController {
    errors: Mutex<Vec<Option<Arc<Error>>>>,
    fatal: Mutex<Option<Arc<Error>>>,
    render_ids: Mutex<Vec<Vec<String>>>,
    skip_abort: Mutex<Vec<bool>>,
    aborted_by_user: AtomicBool,
    fatal_token: CancellationToken,
    index_tokens: Vec<CancellationToken>,
}

impl TestController {
    pub fn new(browser_count: usize) -> Self {
        let fatal_token = CancellationToken::new();
        let index_tokens = (0..browser_count)
            .map(|_| fatal_token.child_token())
            .collect();
        Self {
            errors: Mutex::new(vec![None; browser_count]),
            fatal: Mutex::new(None),
            render_ids: Mutex::new(vec![Vec::new(); browser_count]),
            skip_abort: Mutex::new(vec![false; browser_count]),
            aborted_by_user: AtomicBool::new(false),
            fatal_token,
            index_tokens,
        }
    }

    pub fn browser_count(&self) -> usize {
        self.index_tokens.len()
    }

    /// Record an error local to one browser index. The first error for an
    /// index wins; later ones are logged and dropped.
    pub fn set_error(&self, index: usize, error: Error) {
        let mut errors = self.errors.lock();
        match errors.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(Arc::new(error));
                if let Some(token) = self.index_tokens.get(index) {
                    token.cancel();
                }
            }
            Some(_) => warn!(index, %error, "error after index already failed"),
            None => warn!(index, %error, "error for unknown browser index"),
        }
    }

    /// Record a fatal error: terminal for every index. Set-once; cancelling
    /// the fatal token cancels every per-index token.
    pub fn set_fatal(&self, error: Error) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(Arc::new(error));
            self.fatal_token.cancel();
        } else {
            warn!(%error, "fatal error after run already failed");
        }
    }

    /// The error that applies to this index, fatal taking precedence.
    pub fn error_for(&self, index: usize) -> Option<Arc<Error>> {
        if let Some(fatal) = self.fatal.lock().clone() {
            return Some(fatal);
        }
        self.errors.lock().get(index).cloned().flatten()
    }

    pub fn should_stop_test(&self, index: usize) -> bool {
        self.error_for(index).is_some()
    }

    pub fn should_stop_all(&self) -> bool {
        self.fatal.lock().is_some()
    }

    /// Cancellation token scoped to one browser index.
    pub fn token(&self, index: usize) -> CancellationToken {
        self.index_tokens
            .get(index)
            .cloned()
            .unwrap_or_else(|| self.fatal_token.child_token())
    }

    pub fn add_render_id(&self, index: usize, render_id: String) {
        let mut ids = self.render_ids.lock();
        if let Some(list) = ids.get_mut(index) {
            list.push(render_id);
        }
    }

    pub fn render_ids(&self, index: usize) -> Vec<String> {
        self.render_ids.lock().get(index).cloned().unwrap_or_default()
    }

    pub fn set_skip_abort(&self, index: usize) {
        if let Some(flag) = self.skip_abort.lock().get_mut(index) {
            *flag = true;
        }
    }

    pub fn should_skip_abort(&self, index: usize) -> bool {
        self.skip_abort.lock().get(index).copied().unwrap_or(false)
    }

    pub fn set_aborted_by_user(&self) {
        self.aborted_by_user.store(true, Ordering::SeqCst);
        self.fatal_token.cancel();
    }

    pub fn is_aborted_by_user(&self) -> bool {
        self.aborted_by_user.load(Ordering::SeqCst)
    }
}

/// Cross-test state owned by one runner: batches awaiting close and the
/// count of renders waiting for a throat permit.
#[derive(Default)]
pub struct GlobalState {
    batches_pending_close: Mutex<HashSet<String>>,
    queued_renders: Arc<AtomicUsize>,
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a batch id for end-of-run close. Returns false when the
    /// batch was already registered.
    pub fn note_batch(&self, batch_id: &str) -> bool {
        self.batches_pending_close.lock().insert(batch_id.to_string())
    }

    /// Drain the pending batch set for closing; each id is handed out once.
    pub fn take_batches(&self) -> Vec<String> {
        self.batches_pending_close.lock().drain().collect()
    }

    pub fn queued_renders(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.queued_renders)
    }

    pub fn queued_render_count(&self) -> usize {
        self.queued_renders.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.batches_pending_close.lock().clear();
        self.queued_renders.store(0, Ordering::SeqCst);
    }
}
