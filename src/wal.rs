use std::sync::Arc;

use futures::future::BoxFuture;

use crate::config::TableId;
use crate::error::StoreResult;
use crate::mutation::FrozenMutation;
use crate::position::ReplayPosition;

/// Callback the commitlog invokes when it wants memory back: asks the owning
/// table to flush everything at or below the given position.
pub type FlushHandler = Arc<dyn Fn(TableId, ReplayPosition) + Send + Sync>;

/// Write-ahead log collaborator seam.
///
/// The engine never looks inside the log; it appends entries, learns replay
/// positions, and tells the log which segments became reclaimable after a
/// flush. Position assignment must be strictly monotone per shard.
pub trait CommitLog: Send + Sync {
    /// Durably append one mutation, returning its replay position.
    fn append(
        &self,
        table: TableId,
        mutation: &FrozenMutation,
    ) -> BoxFuture<'static, StoreResult<ReplayPosition>>;

    /// All entries for `table` at or below `rp` are flushed; segments
    /// containing only such entries may be recycled.
    fn discard_completed_segments(&self, table: TableId, rp: ReplayPosition);

    /// Register the memory-pressure flush handler. The log may call it at
    /// any time after registration.
    fn add_flush_handler(&self, handler: FlushHandler);

    /// Flush internal buffers and refuse further appends.
    fn shutdown(&self) -> BoxFuture<'static, StoreResult<()>>;
}
