//! Failure-injection hooks and in-process collaborators for tests.

use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};

use crate::config::{Generation, TableId};
use crate::error::StoreResult;
use crate::mutation::{FrozenMutation, TokenRange};
use crate::position::ReplayPosition;
use crate::schema::Endpoint;
use crate::sstable::Sstable;
use crate::streaming::{Messaging, StreamPlanId};
use crate::wal::{CommitLog, FlushHandler};

/// Context passed to sstable-write failure injection hooks.
#[derive(Debug, Clone)]
pub struct SstableWriteContext {
    pub ks: String,
    pub cf: String,
    pub generation: Generation,
}

/// Hook signature for sstable write overrides.
pub type SstableWriteHook =
    dyn Fn(&SstableWriteContext) -> Option<StoreResult<()>> + Send + Sync + 'static;

#[cfg(debug_assertions)]
fn write_hook_slot() -> &'static RwLock<Option<Arc<SstableWriteHook>>> {
    static SLOT: OnceLock<RwLock<Option<Arc<SstableWriteHook>>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

/// Query the installed sstable-write hook, if any.
pub fn sstable_write_override(ctx: &SstableWriteContext) -> Option<StoreResult<()>> {
    #[cfg(debug_assertions)]
    {
        write_hook_slot().read().as_ref().and_then(|hook| hook(ctx))
    }

    #[cfg(not(debug_assertions))]
    {
        let _ = ctx;
        None
    }
}

/// Guard that restores the previous sstable-write hook when dropped.
pub struct SstableWriteHookGuard {
    #[cfg(debug_assertions)]
    previous: Option<Arc<SstableWriteHook>>,
}

impl Drop for SstableWriteHookGuard {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let mut slot = write_hook_slot().write();
            *slot = self.previous.take();
        }
    }
}

/// Install an sstable-write hook, returning a guard that reverts to the
/// previous hook when dropped.
#[cfg(debug_assertions)]
pub fn install_sstable_write_hook<F>(hook: F) -> SstableWriteHookGuard
where
    F: Fn(&SstableWriteContext) -> Option<StoreResult<()>> + Send + Sync + 'static,
{
    let mut slot = write_hook_slot().write();
    let previous = std::mem::replace(&mut *slot, Some(Arc::new(hook)));
    SstableWriteHookGuard { previous }
}

/// Install an sstable-write hook (no-op without failure injection support).
#[cfg(not(debug_assertions))]
pub fn install_sstable_write_hook<F>(_hook: F) -> SstableWriteHookGuard
where
    F: Fn(&SstableWriteContext) -> Option<StoreResult<()>> + Send + Sync + 'static,
{
    SstableWriteHookGuard {}
}

/// Clear any registered sstable-write hook.
pub fn clear_sstable_write_hook() {
    #[cfg(debug_assertions)]
    {
        let mut slot = write_hook_slot().write();
        *slot = None;
    }
}

/// Hook signature for atomic-deletion overrides.
pub type SstableDeleteHook =
    dyn Fn(&[Arc<Sstable>]) -> Option<StoreResult<()>> + Send + Sync + 'static;

#[cfg(debug_assertions)]
fn delete_hook_slot() -> &'static RwLock<Option<Arc<SstableDeleteHook>>> {
    static SLOT: OnceLock<RwLock<Option<Arc<SstableDeleteHook>>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

/// Query the installed atomic-deletion hook, if any.
pub fn sstable_delete_override(sstables: &[Arc<Sstable>]) -> Option<StoreResult<()>> {
    #[cfg(debug_assertions)]
    {
        delete_hook_slot()
            .read()
            .as_ref()
            .and_then(|hook| hook(sstables))
    }

    #[cfg(not(debug_assertions))]
    {
        let _ = sstables;
        None
    }
}

/// Guard that restores the previous atomic-deletion hook when dropped.
pub struct SstableDeleteHookGuard {
    #[cfg(debug_assertions)]
    previous: Option<Arc<SstableDeleteHook>>,
}

impl Drop for SstableDeleteHookGuard {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let mut slot = delete_hook_slot().write();
            *slot = self.previous.take();
        }
    }
}

/// Install an atomic-deletion hook for tests.
#[cfg(debug_assertions)]
pub fn install_sstable_delete_hook<F>(hook: F) -> SstableDeleteHookGuard
where
    F: Fn(&[Arc<Sstable>]) -> Option<StoreResult<()>> + Send + Sync + 'static,
{
    let mut slot = delete_hook_slot().write();
    let previous = std::mem::replace(&mut *slot, Some(Arc::new(hook)));
    SstableDeleteHookGuard { previous }
}

/// Install an atomic-deletion hook (no-op without failure injection support).
#[cfg(not(debug_assertions))]
pub fn install_sstable_delete_hook<F>(_hook: F) -> SstableDeleteHookGuard
where
    F: Fn(&[Arc<Sstable>]) -> Option<StoreResult<()>> + Send + Sync + 'static,
{
    SstableDeleteHookGuard {}
}

/// Clear any registered atomic-deletion hook.
pub fn clear_sstable_delete_hook() {
    #[cfg(debug_assertions)]
    {
        let mut slot = delete_hook_slot().write();
        *slot = None;
    }
}

/// Segment capacity of the in-memory commitlog, in appended bytes.
const MEMORY_SEGMENT_BYTES: u64 = 1 << 20;

/// In-memory commitlog: strictly monotone position assignment, recorded
/// discards, no durability. The default collaborator in tests.
#[derive(Default)]
pub struct MemoryCommitLog {
    state: Mutex<MemoryLogState>,
    handlers: Mutex<Vec<FlushHandler>>,
}

#[derive(Default)]
struct MemoryLogState {
    segment: u64,
    offset: u32,
    discards: Vec<(TableId, ReplayPosition)>,
    shut_down: bool,
}

impl MemoryCommitLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Discard calls observed so far, in call order.
    pub fn discards(&self) -> Vec<(TableId, ReplayPosition)> {
        self.state.lock().discards.clone()
    }

    /// Drive the registered flush handlers, as the real log does under
    /// segment pressure.
    pub fn request_flush(&self, table: TableId, rp: ReplayPosition) {
        let handlers: Vec<FlushHandler> = self.handlers.lock().clone();
        for handler in handlers {
            handler(table, rp);
        }
    }
}

impl CommitLog for MemoryCommitLog {
    fn append(
        &self,
        _table: TableId,
        mutation: &FrozenMutation,
    ) -> BoxFuture<'static, StoreResult<ReplayPosition>> {
        let size = mutation
            .representation()
            .map(|bytes| bytes.len() as u32)
            .unwrap_or(64);
        let mut state = self.state.lock();
        if state.shut_down {
            return async { Err(crate::error::StoreError::Shutdown) }.boxed();
        }
        if state.segment == 0 {
            state.segment = 1;
        }
        state.offset += size.max(1);
        if state.offset as u64 > MEMORY_SEGMENT_BYTES {
            state.segment += 1;
            state.offset = size.max(1);
        }
        let rp = ReplayPosition::new(state.segment, state.offset);
        async move { Ok(rp) }.boxed()
    }

    fn discard_completed_segments(&self, table: TableId, rp: ReplayPosition) {
        self.state.lock().discards.push((table, rp));
    }

    fn add_flush_handler(&self, handler: FlushHandler) {
        self.handlers.lock().push(handler);
    }

    fn shutdown(&self) -> BoxFuture<'static, StoreResult<()>> {
        self.state.lock().shut_down = true;
        async { Ok(()) }.boxed()
    }
}

/// Record of one outbound stream message, for assertions.
#[derive(Clone, Debug)]
pub enum SentMessage {
    Mutation {
        to: Endpoint,
        plan: StreamPlanId,
        table: TableId,
        fragmented: bool,
        bytes: usize,
    },
    Done {
        to: Endpoint,
        plan: StreamPlanId,
        table: TableId,
        ranges: usize,
    },
}

/// Messaging implementation that records sends and optionally applies them
/// to a local receiver database.
#[derive(Default)]
pub struct LoopbackMessaging {
    sent: Mutex<Vec<SentMessage>>,
    receiver: Mutex<Option<Arc<crate::database::Database>>>,
}

impl LoopbackMessaging {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver future stream mutations into `db` as a receiving peer would.
    pub fn set_receiver(&self, db: Arc<crate::database::Database>) {
        *self.receiver.lock() = Some(db);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }
}

impl Messaging for LoopbackMessaging {
    fn send_stream_mutation(
        &self,
        to: Endpoint,
        plan: StreamPlanId,
        mutation: FrozenMutation,
        fragmented: bool,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let bytes = mutation
            .representation()
            .map(|b| b.len())
            .unwrap_or_default();
        self.sent.lock().push(SentMessage::Mutation {
            to,
            plan,
            table: mutation.table_id,
            fragmented,
            bytes,
        });
        let receiver = self.receiver.lock().clone();
        async move {
            if let Some(db) = receiver {
                let schema = db.find_schema_by_id(mutation.table_id)?;
                db.apply_streaming(schema, plan, mutation, fragmented).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn send_stream_mutation_done(
        &self,
        to: Endpoint,
        plan: StreamPlanId,
        ranges: Vec<TokenRange>,
        table: TableId,
    ) -> BoxFuture<'static, StoreResult<()>> {
        self.sent.lock().push(SentMessage::Done {
            to,
            plan,
            table,
            ranges: ranges.len(),
        });
        let receiver = self.receiver.lock().clone();
        async move {
            if let Some(db) = receiver {
                db.flush_streaming(table, plan, ranges).await?;
            }
            Ok(())
        }
        .boxed()
    }
}
