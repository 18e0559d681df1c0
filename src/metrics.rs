use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Point-in-time copy of one table's counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct TableMetricsSnapshot {
    pub writes: u64,
    pub reads: u64,
    pub pending_flushes: i64,
    pub pending_flush_bytes: i64,
    pub memtable_switch_count: u64,
    pub live_disk_space_used: i64,
    pub live_sstable_count: i64,
    pub clustering_filter_count: u64,
    pub sstables_checked_by_clustering_filter: u64,
    pub clustering_filter_fast_path_count: u64,
    pub surviving_sstables_after_clustering_filter: u64,
}

/// Per-table counters. Lock-free; snapshots are taken with relaxed loads
/// since they feed monitoring, not control flow.
#[derive(Debug, Default)]
pub struct TableMetrics {
    writes: AtomicU64,
    reads: AtomicU64,
    pending_flushes: AtomicI64,
    pending_flush_bytes: AtomicI64,
    memtable_switch_count: AtomicU64,
    live_disk_space_used: AtomicI64,
    live_sstable_count: AtomicI64,
    clustering_filter_count: AtomicU64,
    sstables_checked_by_clustering_filter: AtomicU64,
    clustering_filter_fast_path_count: AtomicU64,
    surviving_sstables_after_clustering_filter: AtomicU64,
}

impl TableMetrics {
    #[inline]
    pub fn incr_writes(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_reads(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush_started(&self, bytes: u64) {
        self.pending_flushes.fetch_add(1, Ordering::Relaxed);
        self.pending_flush_bytes
            .fetch_add(bytes as i64, Ordering::Relaxed);
    }

    pub fn flush_finished(&self, bytes: u64) {
        self.pending_flushes.fetch_sub(1, Ordering::Relaxed);
        self.pending_flush_bytes
            .fetch_sub(bytes as i64, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_memtable_switch(&self) {
        self.memtable_switch_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_live_sstable(&self, disk_bytes: u64) {
        self.live_disk_space_used
            .fetch_add(disk_bytes as i64, Ordering::Relaxed);
        self.live_sstable_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_live_sstables(&self) {
        self.live_disk_space_used.store(0, Ordering::Relaxed);
        self.live_sstable_count.store(0, Ordering::Relaxed);
    }

    pub fn record_clustering_filter_run(&self, candidates: usize) {
        self.clustering_filter_count.fetch_add(1, Ordering::Relaxed);
        self.sstables_checked_by_clustering_filter
            .fetch_add(candidates as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_clustering_filter_fast_path(&self) {
        self.clustering_filter_fast_path_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_clustering_filter_survivors(&self, survivors: usize) {
        self.surviving_sstables_after_clustering_filter
            .fetch_add(survivors as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TableMetricsSnapshot {
        TableMetricsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            pending_flushes: self.pending_flushes.load(Ordering::Relaxed),
            pending_flush_bytes: self.pending_flush_bytes.load(Ordering::Relaxed),
            memtable_switch_count: self.memtable_switch_count.load(Ordering::Relaxed),
            live_disk_space_used: self.live_disk_space_used.load(Ordering::Relaxed),
            live_sstable_count: self.live_sstable_count.load(Ordering::Relaxed),
            clustering_filter_count: self.clustering_filter_count.load(Ordering::Relaxed),
            sstables_checked_by_clustering_filter: self
                .sstables_checked_by_clustering_filter
                .load(Ordering::Relaxed),
            clustering_filter_fast_path_count: self
                .clustering_filter_fast_path_count
                .load(Ordering::Relaxed),
            surviving_sstables_after_clustering_filter: self
                .surviving_sstables_after_clustering_filter
                .load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the database-wide counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct DbMetricsSnapshot {
    pub total_writes: u64,
    pub total_reads: u64,
    pub read_queue_overloads: u64,
    pub requests_blocked_memory: u64,
    pub oversized_batch_warnings: u64,
}

/// Database-wide counters.
#[derive(Debug, Default)]
pub struct DbMetrics {
    total_writes: AtomicU64,
    total_reads: AtomicU64,
    read_queue_overloads: AtomicU64,
    requests_blocked_memory: AtomicU64,
    oversized_batch_warnings: AtomicU64,
}

impl DbMetrics {
    #[inline]
    pub fn incr_total_writes(&self) {
        self.total_writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_total_reads(&self) {
        self.total_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_read_queue_overloads(&self) {
        self.read_queue_overloads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_requests_blocked_memory(&self) {
        self.requests_blocked_memory.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_oversized_batch_warnings(&self) {
        self.oversized_batch_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DbMetricsSnapshot {
        DbMetricsSnapshot {
            total_writes: self.total_writes.load(Ordering::Relaxed),
            total_reads: self.total_reads.load(Ordering::Relaxed),
            read_queue_overloads: self.read_queue_overloads.load(Ordering::Relaxed),
            requests_blocked_memory: self.requests_blocked_memory.load(Ordering::Relaxed),
            oversized_batch_warnings: self.oversized_batch_warnings.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_snapshot_reflects_counters() {
        let metrics = TableMetrics::default();
        metrics.incr_writes();
        metrics.incr_writes();
        metrics.flush_started(512);
        metrics.record_clustering_filter_run(4);
        metrics.add_clustering_filter_survivors(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.writes, 2);
        assert_eq!(snapshot.pending_flushes, 1);
        assert_eq!(snapshot.pending_flush_bytes, 512);
        assert_eq!(snapshot.sstables_checked_by_clustering_filter, 4);
        assert_eq!(snapshot.surviving_sstables_after_clustering_filter, 2);

        metrics.flush_finished(512);
        assert_eq!(metrics.snapshot().pending_flushes, 0);
    }
}
