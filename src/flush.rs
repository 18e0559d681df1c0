//! Replay-position-ordered post-op queue.
//!
//! Flushes may run concurrently, but their *post* steps (where the
//! commitlog is told to discard segments below the flushed position) must
//! run in strict replay-position order, or a crash between an early discard
//! and a late flush would lose acknowledged writes.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::{StoreError, StoreResult};
use crate::position::ReplayPosition;

type PostOp = Box<dyn FnOnce() + Send>;

struct QueueEntry {
    rp: ReplayPosition,
    task_done: oneshot::Receiver<bool>,
    post: PostOp,
    finished: oneshot::Sender<()>,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<ReplayPosition>,
    highest: ReplayPosition,
    closed: bool,
}

/// Ordered post-op queue keyed by replay position.
///
/// `run_with_ordered_post_op(rp, task, post)` runs `task` immediately
/// (concurrently with other tasks); `post` runs only after `task` succeeded
/// and every earlier-position post has completed. Posts execute in strict
/// submission order, which equals position order because sealing submits
/// positions monotonically and empty positions are coerced onto the highest
/// queued key.
pub struct FlushQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<QueueEntry>>>,
    state: Arc<Mutex<QueueState>>,
    post_done: Arc<Notify>,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

impl FlushQueue {
    /// Must be called from within a runtime; the drain loop is spawned
    /// immediately.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<QueueEntry>();
        let state = Arc::new(Mutex::new(QueueState::default()));
        let post_done = Arc::new(Notify::new());
        let drainer = tokio::spawn(Self::drain(rx, state.clone(), post_done.clone()));
        Self {
            tx: Mutex::new(Some(tx)),
            state,
            post_done,
            drainer: Mutex::new(Some(drainer)),
        }
    }

    async fn drain(
        mut rx: mpsc::UnboundedReceiver<QueueEntry>,
        state: Arc<Mutex<QueueState>>,
        post_done: Arc<Notify>,
    ) {
        while let Some(entry) = rx.recv().await {
            let ok = entry.task_done.await.unwrap_or(false);
            if ok {
                (entry.post)();
                trace!(rp = %entry.rp, "post-op executed");
            } else {
                warn!(rp = %entry.rp, "task failed, skipping its post-op");
            }
            {
                let mut state = state.lock();
                if let Some(idx) = state.pending.iter().position(|p| *p == entry.rp) {
                    state.pending.remove(idx);
                }
            }
            post_done.notify_waiters();
            let _ = entry.finished.send(());
        }
    }

    /// Number of entries whose post has not yet executed.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Highest position ever queued.
    pub fn highest_key(&self) -> ReplayPosition {
        self.state.lock().highest
    }

    /// Run `task` now; run `post` after `task` succeeds and all
    /// earlier-position posts have run. Resolves once the post step has
    /// executed (or been skipped on task failure).
    pub async fn run_with_ordered_post_op<T, F>(
        &self,
        rp: ReplayPosition,
        task: F,
        post: impl FnOnce() + Send + 'static,
    ) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let (task_done_tx, task_done_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::Shutdown);
            }
            // Sealed memtables with data but no logged position queue after
            // everything already in flight.
            let rp = if rp.is_zero() && !state.pending.is_empty() {
                state.highest
            } else {
                rp
            };
            if rp > state.highest {
                state.highest = rp;
            }
            state.pending.push(rp);
            let entry = QueueEntry {
                rp,
                task_done: task_done_rx,
                post: Box::new(post),
                finished: finished_tx,
            };
            let tx = self.tx.lock();
            let sender = tx.as_ref().ok_or(StoreError::Shutdown)?;
            sender
                .send(entry)
                .map_err(|_| StoreError::Shutdown)?;
        }

        let result = task.await;
        let _ = task_done_tx.send(result.is_ok());
        let _ = finished_rx.await;
        result
    }

    /// Wait until every post with position at or below `rp` has executed.
    pub async fn wait_for_pending(&self, rp: ReplayPosition) {
        loop {
            let notified = self.post_done.notified();
            if !self.state.lock().pending.iter().any(|p| *p <= rp) {
                return;
            }
            notified.await;
        }
    }

    /// Drain outstanding posts and refuse future submissions.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
        }
        loop {
            let notified = self.post_done.notified();
            if self.state.lock().pending.is_empty() {
                break;
            }
            notified.await;
        }
        let tx = self.tx.lock().take();
        drop(tx);
        let handle = self.drainer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
