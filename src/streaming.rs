//! Outbound stream transfer: walks a table's data over a set of token
//! ranges and ships it to a peer as stream mutations, finishing with a
//! done message that carries the transferred ranges.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::debug;
use uuid::Uuid;

use crate::config::TableId;
use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::mutation::{FrozenMutation, PartitionRange, TokenRange};
use crate::schema::Endpoint;

/// Identifier of one streaming session plan.
pub type StreamPlanId = Uuid;

/// Default concurrent in-flight stream mutations per shard.
const DEFAULT_MUTATION_SEND_SLOTS: usize = 16;

/// Transport seam for streaming. The engine never opens sockets; it hands
/// frozen mutations to whatever implements this.
pub trait Messaging: Send + Sync {
    fn send_stream_mutation(
        &self,
        to: Endpoint,
        plan: StreamPlanId,
        mutation: FrozenMutation,
        fragmented: bool,
    ) -> BoxFuture<'static, StoreResult<()>>;

    fn send_stream_mutation_done(
        &self,
        to: Endpoint,
        plan: StreamPlanId,
        ranges: Vec<TokenRange>,
        table: TableId,
    ) -> BoxFuture<'static, StoreResult<()>>;
}

/// Bounds how many stream mutations may be in flight at once.
pub fn mutation_send_limiter() -> Arc<Semaphore> {
    Arc::new(Semaphore::new(DEFAULT_MUTATION_SEND_SLOTS))
}

/// One table's share of a stream plan: send everything in `ranges` to the
/// destination, then signal completion.
pub struct StreamTransferTask {
    db: Arc<Database>,
    plan: StreamPlanId,
    table: TableId,
    ranges: Vec<TokenRange>,
    to: Endpoint,
    messaging: Arc<dyn Messaging>,
    limiter: Arc<Semaphore>,
}

impl StreamTransferTask {
    pub fn new(
        db: Arc<Database>,
        plan: StreamPlanId,
        table: TableId,
        ranges: Vec<TokenRange>,
        to: Endpoint,
        messaging: Arc<dyn Messaging>,
        limiter: Arc<Semaphore>,
    ) -> Self {
        Self {
            db,
            plan,
            table,
            ranges,
            to,
            messaging,
            limiter,
        }
    }

    /// Stream every mutation in the task's ranges; returns how many were
    /// sent. The streaming reader merges memtables with sstables, so the
    /// peer receives everything the shard currently holds.
    pub async fn execute(&self) -> StoreResult<usize> {
        let cf = self.db.find_column_family_by_id(self.table)?;
        let mut sent = 0usize;
        for range in &self.ranges {
            let mut reader = cf.make_streaming_reader(PartitionRange::Tokens(range.clone()));
            while let Some(mutation) = reader.next_mutation().await? {
                let permit = self
                    .limiter
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| StoreError::Shutdown)?;
                let frozen = mutation.freeze();
                debug!(plan = %self.plan, to = %self.to, table = %self.table,
                       "sending stream mutation");
                let send = self.messaging.send_stream_mutation(
                    self.to.clone(),
                    self.plan,
                    frozen,
                    false,
                );
                let result = send.await;
                drop(permit);
                result?;
                sent += 1;
            }
        }
        debug!(plan = %self.plan, to = %self.to, sent, "stream transfer complete");
        self.messaging
            .send_stream_mutation_done(
                self.to.clone(),
                self.plan,
                self.ranges.clone(),
                self.table,
            )
            .await?;
        Ok(sent)
    }
}
