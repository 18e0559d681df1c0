use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::{StoreError, StoreResult};
use crate::memtable::{FlushBehavior, MemtableList};

/// Hierarchical dirty-byte counter.
///
/// Accounts two quantities for the subtree rooted here:
///
/// - **real** dirty: bytes physically resident in memtables
/// - **virtual** dirty: real minus bytes already streamed out by an
///   in-progress flush (flushes pre-release memory as they emit output)
///
/// Both propagate to every ancestor. Admission decisions look at virtual
/// dirty against the group's limit; the soft trigger fires at half the
/// limit. Invariant: `real >= virtual >= 0` at quiescence.
pub struct RegionGroup {
    name: String,
    limit: u64,
    parent: Option<Arc<RegionGroup>>,
    real: AtomicU64,
    virt: AtomicU64,
    /// Root's release event, shared by the whole hierarchy so a release
    /// anywhere can unblock waiters anywhere.
    release_event: Arc<Notify>,
    /// FIFO tickets of blocked submitters on this group.
    waiters: Mutex<VecDeque<u64>>,
    next_ticket: AtomicU64,
    blocked_now: AtomicU64,
    blocked_total: AtomicU64,
    /// Signalled when the subtree crosses its soft limit.
    soft_event: Notify,
    /// Selection permits of in-flight flushes, keyed by region id. An
    /// entry exists from the moment a region is chosen for flushing until
    /// the flush stops needing its memory.
    flush_permits: Mutex<HashMap<u64, OwnedSemaphorePermit>>,
}

impl RegionGroup {
    pub fn new(name: impl Into<String>, limit: u64, parent: Option<Arc<RegionGroup>>) -> Arc<Self> {
        let release_event = parent
            .as_ref()
            .map(|p| p.release_event.clone())
            .unwrap_or_default();
        Arc::new(Self {
            name: name.into(),
            limit,
            parent,
            real: AtomicU64::new(0),
            virt: AtomicU64::new(0),
            release_event,
            waiters: Mutex::new(VecDeque::new()),
            next_ticket: AtomicU64::new(0),
            blocked_now: AtomicU64::new(0),
            blocked_total: AtomicU64::new(0),
            soft_event: Notify::new(),
            flush_permits: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn real_dirty(&self) -> u64 {
        self.real.load(Ordering::Acquire)
    }

    pub fn virtual_dirty(&self) -> u64 {
        self.virt.load(Ordering::Acquire)
    }

    pub fn blocked_requests(&self) -> u64 {
        self.blocked_now.load(Ordering::Relaxed)
    }

    pub fn blocked_requests_counter(&self) -> u64 {
        self.blocked_total.load(Ordering::Relaxed)
    }

    pub fn over_soft_limit(&self) -> bool {
        self.virtual_dirty() > self.limit / 2
    }

    pub(crate) fn add_flush_permit(&self, region_id: u64, permit: OwnedSemaphorePermit) {
        self.flush_permits.lock().insert(region_id, permit);
    }

    pub(crate) fn remove_flush_permit(&self, region_id: u64) {
        self.flush_permits.lock().remove(&region_id);
    }

    fn chain(self: &Arc<Self>) -> Vec<Arc<RegionGroup>> {
        let mut groups = vec![self.clone()];
        let mut current = self.parent.clone();
        while let Some(g) = current {
            current = g.parent.clone();
            groups.push(g);
        }
        groups
    }

    /// True when neither this group nor any ancestor is at its limit.
    pub fn under_limits(self: &Arc<Self>) -> bool {
        self.chain()
            .iter()
            .all(|g| g.virtual_dirty() < g.limit)
    }

    pub(crate) fn add(self: &Arc<Self>, bytes: u64) {
        for g in self.chain() {
            g.real.fetch_add(bytes, Ordering::AcqRel);
            g.virt.fetch_add(bytes, Ordering::AcqRel);
            if g.over_soft_limit() {
                g.soft_event.notify_one();
            }
        }
    }

    pub(crate) fn sub_real(self: &Arc<Self>, bytes: u64) {
        for g in self.chain() {
            sub_saturating(&g.real, bytes);
        }
        self.release_event.notify_waiters();
    }

    pub(crate) fn sub_virtual(self: &Arc<Self>, bytes: u64) {
        for g in self.chain() {
            sub_saturating(&g.virt, bytes);
        }
        self.release_event.notify_waiters();
    }

    /// Run `f` once the group (and every ancestor) is under its hard limit.
    /// Blocked submitters run in FIFO order. Fails with `Shutdown` if the
    /// token fires while waiting.
    pub async fn run_when_memory_available<T>(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
        f: impl FnOnce() -> T,
    ) -> StoreResult<T> {
        let fast_path = {
            let waiters = self.waiters.lock();
            waiters.is_empty() && self.under_limits()
        };
        if !fast_path {
            let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            self.waiters.lock().push_back(ticket);
            self.blocked_now.fetch_add(1, Ordering::Relaxed);
            self.blocked_total.fetch_add(1, Ordering::Relaxed);
            trace!(group = %self.name, ticket, "write blocked on dirty memory");
            loop {
                let notified = self.release_event.notified();
                {
                    let mut waiters = self.waiters.lock();
                    if waiters.front() == Some(&ticket) && self.under_limits() {
                        waiters.pop_front();
                        break;
                    }
                }
                if shutdown.is_cancelled() {
                    self.waiters.lock().retain(|t| *t != ticket);
                    self.blocked_now.fetch_sub(1, Ordering::Relaxed);
                    return Err(StoreError::Shutdown);
                }
                tokio::select! {
                    _ = notified => {}
                    _ = shutdown.cancelled() => {}
                }
            }
            self.blocked_now.fetch_sub(1, Ordering::Relaxed);
            // Let the next queued submitter re-check the limits.
            self.release_event.notify_waiters();
        }
        Ok(f())
    }
}

fn sub_saturating(cell: &AtomicU64, bytes: u64) {
    let mut current = cell.load(Ordering::Acquire);
    loop {
        let next = current.saturating_sub(bytes);
        match cell.compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// One memtable's slice of a region group.
///
/// Bytes added here propagate up the hierarchy. `release_virtual` is called
/// once when a flush has streamed the memtable out; the remaining real bytes
/// are released when the region drops with the retired memtable.
pub struct MemoryRegion {
    id: u64,
    group: Arc<RegionGroup>,
    bytes: AtomicU64,
    virtual_released: AtomicBool,
}

impl MemoryRegion {
    pub fn new(group: Arc<RegionGroup>) -> Self {
        Self {
            id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed),
            group,
            bytes: AtomicU64::new(0),
            virtual_released: AtomicBool::new(false),
        }
    }

    /// Identity of this region within the flush-manager bookkeeping.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn group(&self) -> &Arc<RegionGroup> {
        &self.group
    }

    pub fn occupancy(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
        self.group.add(bytes);
    }

    /// Pretend this memtable's memory is already free. Called after the
    /// sstable write completes so queued writes stop waiting on memory the
    /// flush no longer needs, while the memtable itself stays readable
    /// until the cache transfer finishes.
    pub fn release_virtual(&self) {
        if !self.virtual_released.swap(true, Ordering::AcqRel) {
            self.group.sub_virtual(self.occupancy());
        }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        let bytes = self.occupancy();
        if bytes > 0 {
            if !self.virtual_released.load(Ordering::Acquire) {
                self.group.sub_virtual(bytes);
            }
            self.group.sub_real(bytes);
        }
    }
}

/// Execution concurrency bound: how many selected flushes may be writing
/// at once per manager.
const MAX_BACKGROUND_FLUSHES: usize = 4;

/// Owns a region group and drives memory-pressure flushing for the memtable
/// lists registered with it.
///
/// Two semaphores with different jobs: the single-slot selection permit
/// serializes *choosing* what to flush, so at most one memory-driven flush
/// is selected at a time and explicit flush requests (user flush, truncate,
/// commitlog pressure) can pre-empt the selector. The permit is handed to
/// the flush manager with the chosen region and frees as soon as the flush
/// stops needing the memory, not when the flush completes. Execution runs
/// under a separate `background_work` bound, so several flushes can be
/// writing while the next one is being selected.
pub struct DirtyMemoryManager {
    group: Arc<RegionGroup>,
    flush_serializer: Arc<Semaphore>,
    explicit_waiters: AtomicUsize,
    background_work: Arc<Semaphore>,
    registry: Mutex<Vec<Weak<MemtableList>>>,
    shutdown: CancellationToken,
    reclaim_task: Mutex<Option<JoinHandle<()>>>,
}

impl DirtyMemoryManager {
    pub fn new(
        name: impl Into<String>,
        limit: u64,
        parent: Option<&Arc<DirtyMemoryManager>>,
    ) -> Arc<Self> {
        let group = RegionGroup::new(name, limit, parent.map(|p| p.group.clone()));
        Arc::new(Self {
            group,
            flush_serializer: Arc::new(Semaphore::new(1)),
            explicit_waiters: AtomicUsize::new(0),
            background_work: Arc::new(Semaphore::new(MAX_BACKGROUND_FLUSHES)),
            registry: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            reclaim_task: Mutex::new(None),
        })
    }

    pub fn group(&self) -> &Arc<RegionGroup> {
        &self.group
    }

    pub fn real_dirty_memory(&self) -> u64 {
        self.group.real_dirty()
    }

    pub fn virtual_dirty_memory(&self) -> u64 {
        self.group.virtual_dirty()
    }

    /// Gate a submitter on memory availability in this manager's group.
    pub async fn run_when_memory_available<T>(
        self: &Arc<Self>,
        f: impl FnOnce() -> T,
    ) -> StoreResult<T> {
        self.group.run_when_memory_available(&self.shutdown, f).await
    }

    /// Track a memtable list so the memory-driven selector can see it.
    pub fn register_memtable_list(&self, list: &Arc<MemtableList>) {
        self.registry.lock().push(Arc::downgrade(list));
    }

    /// Acquire the selection permit with explicit-request priority.
    pub async fn get_flush_permit(&self) -> StoreResult<OwnedSemaphorePermit> {
        // Guarded so a caller abandoning the wait (timeout, shutdown)
        // still decrements; a stuck count would make the memory-driven
        // selector yield forever.
        struct WaiterGuard<'a>(&'a AtomicUsize);
        impl Drop for WaiterGuard<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::AcqRel);
            }
        }
        self.explicit_waiters.fetch_add(1, Ordering::AcqRel);
        let _guard = WaiterGuard(&self.explicit_waiters);
        let permit = self.flush_serializer.clone().acquire_owned().await;
        permit.map_err(|_| StoreError::Shutdown)
    }

    /// Hand a selection permit to the flush manager, keyed by the region
    /// being flushed. The selected region may sit in a group below this
    /// manager's; routing through the region lands the bookkeeping on the
    /// right group either way.
    pub fn add_to_flush_manager(&self, region: &MemoryRegion, permit: OwnedSemaphorePermit) {
        region.group().add_flush_permit(region.id(), permit);
    }

    /// Reconcile the in-flight bookkeeping for `region`, releasing its
    /// selection permit. The flush owner calls this once the write stops
    /// needing the memory; a no-op when nothing is registered.
    pub fn remove_from_flush_manager(&self, region: &MemoryRegion) {
        region.group().remove_flush_permit(region.id());
    }

    /// Seal and flush the active memtable of `list`. The selection permit
    /// is handed to the flush manager immediately; execution runs under
    /// the separate background bound so the next selection does not wait
    /// for this write to finish.
    pub async fn flush_one(
        self: &Arc<Self>,
        list: Arc<MemtableList>,
        permit: OwnedSemaphorePermit,
    ) -> StoreResult<()> {
        let active = list.active();
        if active.is_empty() {
            return Ok(());
        }
        self.add_to_flush_manager(active.region(), permit);
        let background = match self.background_work.clone().acquire_owned().await {
            Ok(units) => units,
            Err(_) => return Err(StoreError::Shutdown),
        };
        let result = list.seal(FlushBehavior::Immediate).await;
        // Two cases can leave the permit dangling: the seal failed at some
        // point, or a memory-only list never reached the write path. Either
        // way it has to go now.
        self.remove_from_flush_manager(active.region());
        drop(background);
        if let Err(err) = &result {
            error!(group = %self.group.name, error = %err, "failed to flush memtable");
        }
        result
    }

    /// Start the background loop that flushes the largest region whenever
    /// the group is over its soft limit.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.flush_when_needed().await });
        *self.reclaim_task.lock() = Some(handle);
    }

    async fn flush_when_needed(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.group.soft_event.notified() => {}
            }
            while self.group.over_soft_limit() && !self.shutdown.is_cancelled() {
                let permit = match self.flush_serializer.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                // Explicit flushes have strict priority.
                if self.explicit_waiters.load(Ordering::Acquire) > 0 {
                    drop(permit);
                    tokio::task::yield_now().await;
                    continue;
                }
                // Condition may have abated while we waited for the permit.
                if !self.group.over_soft_limit() {
                    break;
                }
                let Some(list) = self.pick_largest_list() else {
                    break;
                };
                debug!(group = %self.group.name,
                       virtual_dirty = self.group.virtual_dirty(),
                       "memory-driven flush of largest region");
                let manager = self.clone();
                // Do not wait: the permit guards selection only, and we
                // want to pick again as soon as the flush hands it back.
                tokio::spawn(async move {
                    let _ = manager.flush_one(list, permit).await;
                });
                tokio::task::yield_now().await;
            }
        }
    }

    /// The list owning the largest memtable in this group. During pressure
    /// this is objectively the flush that releases the most memory.
    fn pick_largest_list(&self) -> Option<Arc<MemtableList>> {
        let mut registry = self.registry.lock();
        registry.retain(|weak| weak.strong_count() > 0);
        let mut best: Option<(u64, Arc<MemtableList>)> = None;
        for weak in registry.iter() {
            if let Some(list) = weak.upgrade() {
                let occupancy = list.active_occupancy();
                if occupancy > 0 && best.as_ref().map(|(b, _)| occupancy > *b).unwrap_or(true) {
                    best = Some((occupancy, list));
                }
            }
        }
        best.map(|(_, list)| list)
    }

    /// Stop the reclaim loop and wait out in-flight background flushes.
    /// Acquiring the full background capacity proves nothing is still
    /// writing when this returns.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutdown.cancel();
        self.group.soft_event.notify_one();
        self.group.release_event.notify_waiters();
        if let Some(handle) = self.reclaim_task.lock().take() {
            let _ = handle.await;
        }
        let _ = self
            .background_work
            .acquire_many(MAX_BACKGROUND_FLUSHES as u32)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::{SchemaSource, SealFn};
    use crate::mutation::{Cell, Mutation};
    use crate::position::ReplayPosition;
    use crate::schema::Schema;
    use futures::FutureExt;
    use std::time::Duration;

    #[test]
    fn accounting_propagates_to_ancestors() {
        let root = RegionGroup::new("system", 1000, None);
        let child = RegionGroup::new("regular", 500, Some(root.clone()));

        child.add(100);
        assert_eq!(child.real_dirty(), 100);
        assert_eq!(child.virtual_dirty(), 100);
        assert_eq!(root.real_dirty(), 100);

        child.sub_virtual(40);
        assert_eq!(child.virtual_dirty(), 60);
        assert_eq!(child.real_dirty(), 100);
        assert_eq!(root.virtual_dirty(), 60);

        child.sub_real(100);
        child.sub_virtual(60);
        assert_eq!(root.real_dirty(), 0);
        assert_eq!(root.virtual_dirty(), 0);
    }

    #[test]
    fn soft_limit_is_half_capacity() {
        let group = RegionGroup::new("g", 100, None);
        group.add(50);
        assert!(!group.over_soft_limit());
        group.add(1);
        assert!(group.over_soft_limit());
    }

    #[tokio::test]
    async fn memory_region_releases_on_drop() {
        let group = RegionGroup::new("g", 1000, None);
        {
            let region = MemoryRegion::new(group.clone());
            region.add(300);
            assert_eq!(group.real_dirty(), 300);
            region.release_virtual();
            assert_eq!(group.virtual_dirty(), 0);
            assert_eq!(group.real_dirty(), 300);
            // Double release is a no-op.
            region.release_virtual();
            assert_eq!(group.virtual_dirty(), 0);
        }
        assert_eq!(group.real_dirty(), 0);
        assert_eq!(group.virtual_dirty(), 0);
    }

    #[tokio::test]
    async fn run_when_memory_available_blocks_until_release() {
        let group = RegionGroup::new("g", 100, None);
        let shutdown = CancellationToken::new();
        group.add(100); // at the hard limit

        let ran = Arc::new(AtomicUsize::new(0));
        let g2 = group.clone();
        let token2 = shutdown.clone();
        let ran2 = ran.clone();
        let waiter = tokio::spawn(async move {
            g2.run_when_memory_available(&token2, move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(group.blocked_requests(), 1);

        group.sub_virtual(100);
        waiter.await.expect("join").expect("run");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(group.blocked_requests(), 0);
        assert_eq!(group.blocked_requests_counter(), 1);
    }

    #[tokio::test]
    async fn blocked_submitters_run_in_fifo_order() {
        let group = RegionGroup::new("g", 100, None);
        let shutdown = CancellationToken::new();
        group.add(100);

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let g = group.clone();
            let token = shutdown.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                g.run_when_memory_available(&token, move || order.lock().push(i))
                    .await
            }));
            // Give each submitter time to enqueue before the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        group.sub_virtual(100);
        for handle in handles {
            handle.await.expect("join").expect("run");
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn remove_from_flush_manager_releases_the_selection_slot() {
        let manager = DirtyMemoryManager::new("m", 1 << 20, None);
        let region = MemoryRegion::new(manager.group().clone());

        let permit = manager.get_flush_permit().await.expect("permit");
        manager.add_to_flush_manager(&region, permit);

        // The slot is spoken for while the flush is in flight.
        let blocked =
            tokio::time::timeout(Duration::from_millis(20), manager.get_flush_permit()).await;
        assert!(blocked.is_err());

        manager.remove_from_flush_manager(&region);
        let freed =
            tokio::time::timeout(Duration::from_millis(200), manager.get_flush_permit()).await;
        freed.expect("slot freed").expect("permit");

        // Removing again is a no-op.
        manager.remove_from_flush_manager(&region);
    }

    fn hand_back_list(
        manager: &Arc<DirtyMemoryManager>,
        running: &Arc<AtomicUsize>,
    ) -> Arc<MemtableList> {
        let slot: Arc<Mutex<Option<Arc<MemtableList>>>> = Arc::new(Mutex::new(None));
        let seal_slot = slot.clone();
        let seal_manager = manager.clone();
        let seal_running = running.clone();
        let seal: SealFn = Arc::new(move |_behavior| {
            let slot = seal_slot.clone();
            let manager = seal_manager.clone();
            let running = seal_running.clone();
            async move {
                let list = slot.lock().clone().expect("list registered");
                let active = list.active();
                // The write path hands the permit back as soon as it stops
                // needing the memory; emulate that point.
                manager.remove_from_flush_manager(active.region());
                running.fetch_add(1, Ordering::SeqCst);
                // Completing requires both seals to be in flight at once.
                let mut spins = 0;
                while running.load(Ordering::SeqCst) < 2 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    spins += 1;
                    if spins > 400 {
                        return Err(StoreError::FlushFailed(
                            "seals never overlapped".to_string(),
                        ));
                    }
                }
                Ok(())
            }
            .boxed()
        });
        let schema = Arc::new(Schema::for_tests("ks", "cf"));
        let source: SchemaSource = Arc::new(move || schema.clone());
        let list = MemtableList::new(seal, source, manager.clone());
        *slot.lock() = Some(list.clone());
        list
    }

    fn write_one(list: &Arc<MemtableList>) {
        let mut m = Mutation::new(list.active().schema(), b"pk".to_vec());
        m.set_cell(vec![b"ck".to_vec()], "v", Cell::live(1, b"x".to_vec()));
        list.active().apply(&m, ReplayPosition::ZERO);
    }

    #[tokio::test]
    async fn flushes_execute_concurrently_once_selection_is_released() {
        let manager = DirtyMemoryManager::new("m", 1 << 20, None);
        let running = Arc::new(AtomicUsize::new(0));
        let list1 = hand_back_list(&manager, &running);
        let list2 = hand_back_list(&manager, &running);
        write_one(&list1);
        write_one(&list2);

        let permit1 = manager.get_flush_permit().await.expect("permit 1");
        let m1 = manager.clone();
        let l1 = list1.clone();
        let first = tokio::spawn(async move { m1.flush_one(l1, permit1).await });

        // The first seal hands its permit back mid-flight, so the second
        // selection must go through while it is still executing.
        let permit2 =
            tokio::time::timeout(Duration::from_secs(2), manager.get_flush_permit())
                .await
                .expect("selection slot freed while first flush runs")
                .expect("permit 2");
        let m2 = manager.clone();
        let l2 = list2.clone();
        let second = tokio::spawn(async move { m2.flush_one(l2, permit2).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            first.await.expect("join").expect("first flush");
            second.await.expect("join").expect("second flush");
        })
        .await
        .expect("both flushes completed");
    }

    #[tokio::test]
    async fn shutdown_fails_waiters() {
        let group = RegionGroup::new("g", 100, None);
        let shutdown = CancellationToken::new();
        group.add(100);

        let g2 = group.clone();
        let token2 = shutdown.clone();
        let waiter =
            tokio::spawn(async move { g2.run_when_memory_available(&token2, || ()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();
        group.release_event.notify_waiters();
        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(StoreError::Shutdown)));
    }
}
