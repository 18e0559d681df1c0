use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::ops::Bound;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::TableId;
use crate::error::{StoreError, StoreResult};
use crate::schema::Schema;

/// Position of a partition key on the hash ring.
///
/// Tokens order partitions on disk and decide shard ownership. The token
/// function must be stable across restarts because sstable metadata persists
/// first/last tokens.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Token(pub u64);

impl Token {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Token of a raw partition key. FNV-1a, the same primitive the bloom
    /// filter hashes with, so the ring is cheap and deterministic.
    pub fn of(key: &[u8]) -> Self {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut hash = FNV_OFFSET;
        for &byte in key {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        Self(hash)
    }

    /// Shard owning this token.
    #[inline]
    pub fn shard_of(self, shard_count: u32) -> u32 {
        (self.0 % shard_count.max(1) as u64) as u32
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// (token, partition key): the primary sort key of every partition-ordered
/// structure in the engine.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecoratedKey {
    pub token: Token,
    pub key: Vec<u8>,
}

impl DecoratedKey {
    pub fn from_key(key: Vec<u8>) -> Self {
        let token = Token::of(&key);
        Self { token, key }
    }

    pub fn new(token: Token, key: Vec<u8>) -> Self {
        Self { token, key }
    }
}

impl Ord for DecoratedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for DecoratedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Composite clustering key: one opaque component per clustering column.
/// Components compare lexicographically, prefix-ordered.
pub type ClusteringKey = Vec<Vec<u8>>;

/// Deletion marker: deletes everything written at or before `timestamp`.
/// `deletion_time` is the wall-clock second the delete happened, used for
/// tombstone expiry decisions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub timestamp: i64,
    pub deletion_time: i64,
}

impl Tombstone {
    pub fn new(timestamp: i64, deletion_time: i64) -> Self {
        Self {
            timestamp,
            deletion_time,
        }
    }

    /// True when a cell written at `timestamp` is shadowed by this marker.
    #[inline]
    pub fn shadows(&self, timestamp: i64) -> bool {
        timestamp <= self.timestamp
    }

    /// The stronger of two markers.
    pub fn merged(a: Option<Tombstone>, b: Option<Tombstone>) -> Option<Tombstone> {
        match (a, b) {
            (Some(x), Some(y)) => Some(if (y.timestamp, y.deletion_time) > (x.timestamp, x.deletion_time) { y } else { x }),
            (x, None) => x,
            (None, y) => y,
        }
    }
}

/// Payload of one cell: a live value with optional expiry, or a deletion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellValue {
    Live {
        value: Vec<u8>,
        /// Expiry second for TTL'd cells.
        expiry: Option<i64>,
    },
    Dead {
        deletion_time: i64,
    },
}

/// One column value, reconciled against concurrent writers by
/// (timestamp, liveness, value, expiry / deletion-time).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub timestamp: i64,
    pub value: CellValue,
}

impl Cell {
    pub fn live(timestamp: i64, value: Vec<u8>) -> Self {
        Self {
            timestamp,
            value: CellValue::Live {
                value,
                expiry: None,
            },
        }
    }

    pub fn expiring(timestamp: i64, value: Vec<u8>, expiry: i64) -> Self {
        Self {
            timestamp,
            value: CellValue::Live {
                value,
                expiry: Some(expiry),
            },
        }
    }

    pub fn dead(timestamp: i64, deletion_time: i64) -> Self {
        Self {
            timestamp,
            value: CellValue::Dead { deletion_time },
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        matches!(self.value, CellValue::Live { .. })
    }

    pub fn value_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            CellValue::Live { value, .. } => Some(value),
            CellValue::Dead { .. } => None,
        }
    }

    /// Total order deciding which of two versions of a cell survives a
    /// merge. Greater wins. Ties on timestamp prefer the deletion, then the
    /// larger value, then the later expiry / deletion time, so reconciliation
    /// is commutative and idempotent.
    pub fn compare_for_merge(&self, other: &Cell) -> Ordering {
        if self.timestamp != other.timestamp {
            return self.timestamp.cmp(&other.timestamp);
        }
        match (&self.value, &other.value) {
            (CellValue::Live { .. }, CellValue::Dead { .. }) => Ordering::Less,
            (CellValue::Dead { .. }, CellValue::Live { .. }) => Ordering::Greater,
            (
                CellValue::Live {
                    value: lv,
                    expiry: le,
                },
                CellValue::Live {
                    value: rv,
                    expiry: re,
                },
            ) => lv.cmp(rv).then_with(|| le.cmp(re)),
            (CellValue::Dead { deletion_time: ld }, CellValue::Dead { deletion_time: rd }) => {
                (*ld as u32).cmp(&(*rd as u32))
            }
        }
    }

    /// Reconcile in place, keeping the winner.
    pub fn reconcile(&mut self, other: Cell) {
        if self.compare_for_merge(&other) == Ordering::Less {
            *self = other;
        }
    }
}

/// A clustering (or static) row: per-row deletion marker plus named cells.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub tombstone: Option<Tombstone>,
    pub cells: BTreeMap<String, Cell>,
}

impl Row {
    pub fn is_empty(&self) -> bool {
        self.tombstone.is_none() && self.cells.is_empty()
    }

    pub fn set_cell(&mut self, column: impl Into<String>, cell: Cell) {
        self.cells.insert(column.into(), cell);
    }

    pub fn apply(&mut self, other: Row) {
        self.tombstone = Tombstone::merged(self.tombstone, other.tombstone);
        for (column, cell) in other.cells {
            match self.cells.get_mut(&column) {
                Some(existing) => existing.reconcile(cell),
                None => {
                    self.cells.insert(column, cell);
                }
            }
        }
    }

    /// Cells that survive this row's own tombstone and `covering`.
    pub fn live_cells(&self, covering: Option<Tombstone>) -> impl Iterator<Item = (&str, &Cell)> {
        let shadow = Tombstone::merged(self.tombstone, covering);
        self.cells.iter().filter_map(move |(name, cell)| {
            if !cell.is_live() {
                return None;
            }
            if let Some(t) = shadow {
                if t.shadows(cell.timestamp) {
                    return None;
                }
            }
            Some((name.as_str(), cell))
        })
    }
}

/// Deletion covering a contiguous clustering range, bounds inclusive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeTombstone {
    pub start: ClusteringKey,
    pub end: ClusteringKey,
    pub tombstone: Tombstone,
}

impl RangeTombstone {
    pub fn covers(&self, ck: &ClusteringKey) -> bool {
        *ck >= self.start && *ck <= self.end
    }
}

/// The body of one partition: partition tombstone, static row, ordered
/// clustering rows and range tombstones.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionData {
    pub tombstone: Option<Tombstone>,
    pub static_row: Row,
    pub rows: BTreeMap<ClusteringKey, Row>,
    pub range_tombstones: Vec<RangeTombstone>,
}

impl PartitionData {
    pub fn is_empty(&self) -> bool {
        self.tombstone.is_none()
            && self.static_row.is_empty()
            && self.rows.is_empty()
            && self.range_tombstones.is_empty()
    }

    /// Merge `other` into this partition, reconciling cell by cell.
    pub fn apply(&mut self, other: PartitionData) {
        self.tombstone = Tombstone::merged(self.tombstone, other.tombstone);
        self.static_row.apply(other.static_row);
        for (ck, row) in other.rows {
            match self.rows.get_mut(&ck) {
                Some(existing) => existing.apply(row),
                None => {
                    self.rows.insert(ck, row);
                }
            }
        }
        self.range_tombstones.extend(other.range_tombstones);
    }

    /// The strongest deletion covering `ck` in this partition.
    pub fn covering_tombstone(&self, ck: &ClusteringKey) -> Option<Tombstone> {
        let mut shadow = self.tombstone;
        for rt in &self.range_tombstones {
            if rt.covers(ck) {
                shadow = Tombstone::merged(shadow, Some(rt.tombstone));
            }
        }
        shadow
    }

    /// Number of rows with at least one live cell after deletions apply.
    /// A non-empty static row counts as one row when no clustering row
    /// survives, matching result-building rules.
    pub fn live_row_count(&self) -> usize {
        let mut count = 0;
        for (ck, row) in &self.rows {
            if row.live_cells(self.covering_tombstone(ck)).next().is_some() {
                count += 1;
            }
        }
        if count == 0 && self.static_row.live_cells(self.tombstone).next().is_some() {
            count = 1;
        }
        count
    }

    /// Rows surviving deletions, in clustering order.
    pub fn live_rows(&self) -> Vec<(ClusteringKey, Vec<(String, Cell)>)> {
        let mut out = Vec::new();
        for (ck, row) in &self.rows {
            let covering = self.covering_tombstone(ck);
            let cells: Vec<(String, Cell)> = row
                .live_cells(covering)
                .map(|(name, cell)| (name.to_string(), cell.clone()))
                .collect();
            if !cells.is_empty() {
                out.push((ck.clone(), cells));
            }
        }
        out
    }

    /// Rough bytes held by this partition; memtable occupancy accounting.
    pub fn memory_size(&self) -> u64 {
        const ROW_OVERHEAD: u64 = 48;
        const CELL_OVERHEAD: u64 = 40;
        let mut size = 64;
        let row_size = |row: &Row| -> u64 {
            ROW_OVERHEAD
                + row
                    .cells
                    .iter()
                    .map(|(name, cell)| {
                        CELL_OVERHEAD
                            + name.len() as u64
                            + cell.value_bytes().map(|v| v.len() as u64).unwrap_or(0)
                    })
                    .sum::<u64>()
        };
        size += row_size(&self.static_row);
        for (ck, row) in &self.rows {
            size += ck.iter().map(|c| c.len() as u64).sum::<u64>();
            size += row_size(row);
        }
        size += self.range_tombstones.len() as u64 * ROW_OVERHEAD;
        size
    }

    /// Smallest write timestamp present, for sstable metadata.
    pub fn min_timestamp(&self) -> Option<i64> {
        self.timestamps().min()
    }

    /// Largest write timestamp present, for sstable metadata.
    pub fn max_timestamp(&self) -> Option<i64> {
        self.timestamps().max()
    }

    /// Number of deletion markers of any kind, for the tombstone histogram.
    pub fn tombstone_count(&self) -> u64 {
        let mut count = self.tombstone.is_some() as u64 + self.range_tombstones.len() as u64;
        count += self.static_row.tombstone.is_some() as u64;
        count += self
            .static_row
            .cells
            .values()
            .filter(|c| !c.is_live())
            .count() as u64;
        for row in self.rows.values() {
            count += row.tombstone.is_some() as u64;
            count += row.cells.values().filter(|c| !c.is_live()).count() as u64;
        }
        count
    }

    fn timestamps(&self) -> impl Iterator<Item = i64> + '_ {
        let partition = self.tombstone.iter().map(|t| t.timestamp);
        let ranges = self.range_tombstones.iter().map(|rt| rt.tombstone.timestamp);
        let rows = std::iter::once(&self.static_row)
            .chain(self.rows.values())
            .flat_map(|row| {
                row.tombstone
                    .iter()
                    .map(|t| t.timestamp)
                    .chain(row.cells.values().map(|c| c.timestamp))
                    .collect::<Vec<_>>()
            });
        partition.chain(ranges).chain(rows)
    }
}

/// Half-open/closed interval of tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: Bound<Token>,
    pub end: Bound<Token>,
}

impl TokenRange {
    pub fn full() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// The `(start, end]` convention used for ownership ranges.
    pub fn open_closed(start: Token, end: Token) -> Self {
        Self {
            start: Bound::Excluded(start),
            end: Bound::Included(end),
        }
    }

    pub fn contains(&self, token: Token) -> bool {
        let lower_ok = match self.start {
            Bound::Unbounded => true,
            Bound::Included(s) => token >= s,
            Bound::Excluded(s) => token > s,
        };
        let upper_ok = match self.end {
            Bound::Unbounded => true,
            Bound::Included(e) => token <= e,
            Bound::Excluded(e) => token < e,
        };
        lower_ok && upper_ok
    }

    /// Whether `[first, last]` intersects this range.
    pub fn overlaps(&self, first: Token, last: Token) -> bool {
        let above_start = match self.start {
            Bound::Unbounded => true,
            Bound::Included(s) => last >= s,
            Bound::Excluded(s) => last > s,
        };
        let below_end = match self.end {
            Bound::Unbounded => true,
            Bound::Included(e) => first <= e,
            Bound::Excluded(e) => first < e,
        };
        above_start && below_end
    }
}

/// The partition extent of a read: a single known key or a token span.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionRange {
    Singular(DecoratedKey),
    Tokens(TokenRange),
}

impl PartitionRange {
    pub fn singular(key: DecoratedKey) -> Self {
        Self::Singular(key)
    }

    pub fn full() -> Self {
        Self::Tokens(TokenRange::full())
    }

    pub fn is_singular(&self) -> bool {
        matches!(self, Self::Singular(_))
    }

    pub fn contains(&self, key: &DecoratedKey) -> bool {
        match self {
            Self::Singular(k) => k == key,
            Self::Tokens(r) => r.contains(key.token),
        }
    }

    /// Whether an sstable spanning `[first, last]` may hold keys in range.
    pub fn overlaps(&self, first: &DecoratedKey, last: &DecoratedKey) -> bool {
        match self {
            Self::Singular(k) => *k >= *first && *k <= *last,
            Self::Tokens(r) => r.overlaps(first.token, last.token),
        }
    }
}

/// Interval of clustering keys, used by slices and the clustering filter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringRange {
    pub start: Bound<ClusteringKey>,
    pub end: Bound<ClusteringKey>,
}

impl ClusteringRange {
    pub fn full() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    pub fn singular(ck: ClusteringKey) -> Self {
        Self {
            start: Bound::Included(ck.clone()),
            end: Bound::Included(ck),
        }
    }

    pub fn is_full(&self) -> bool {
        matches!((&self.start, &self.end), (Bound::Unbounded, Bound::Unbounded))
    }

    pub fn contains(&self, ck: &ClusteringKey) -> bool {
        let above_start = match &self.start {
            Bound::Unbounded => true,
            Bound::Included(s) => ck >= s,
            Bound::Excluded(s) => ck > s,
        };
        let below_end = match &self.end {
            Bound::Unbounded => true,
            Bound::Included(e) => ck <= e,
            Bound::Excluded(e) => ck < e,
        };
        above_start && below_end
    }
}

/// Which clustering rows a read wants. The default slice selects everything.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySlice {
    pub clustering_ranges: Vec<ClusteringRange>,
}

impl QuerySlice {
    pub fn full() -> Self {
        Self {
            clustering_ranges: vec![ClusteringRange::full()],
        }
    }

    pub fn for_key(ck: ClusteringKey) -> Self {
        Self {
            clustering_ranges: vec![ClusteringRange::singular(ck)],
        }
    }

    /// True when the slice selects the whole partition.
    pub fn selects_all(&self) -> bool {
        self.clustering_ranges.len() == 1 && self.clustering_ranges[0].is_full()
    }
}

impl Default for QuerySlice {
    fn default() -> Self {
        Self::full()
    }
}

/// One write against one partition of one table.
#[derive(Clone, Debug)]
pub struct Mutation {
    pub schema: Arc<Schema>,
    pub key: DecoratedKey,
    pub partition: PartitionData,
}

impl Mutation {
    pub fn new(schema: Arc<Schema>, key: Vec<u8>) -> Self {
        Self {
            schema,
            key: DecoratedKey::from_key(key),
            partition: PartitionData::default(),
        }
    }

    pub fn set_cell(&mut self, ck: ClusteringKey, column: impl Into<String>, cell: Cell) {
        self.partition
            .rows
            .entry(ck)
            .or_default()
            .set_cell(column, cell);
    }

    pub fn partition_delete(&mut self, tombstone: Tombstone) {
        self.partition.tombstone = Tombstone::merged(self.partition.tombstone, Some(tombstone));
    }

    pub fn range_delete(&mut self, start: ClusteringKey, end: ClusteringKey, tombstone: Tombstone) {
        self.partition.range_tombstones.push(RangeTombstone {
            start,
            end,
            tombstone,
        });
    }

    pub fn freeze(&self) -> FrozenMutation {
        FrozenMutation {
            table_id: self.schema.id,
            key: self.key.key.clone(),
            partition: self.partition.clone(),
        }
    }
}

/// Serialized form of a mutation, carrying its own table id so it can be
/// routed without a schema in hand.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrozenMutation {
    pub table_id: TableId,
    pub key: Vec<u8>,
    pub partition: PartitionData,
}

impl FrozenMutation {
    pub fn decorated_key(&self) -> DecoratedKey {
        DecoratedKey::from_key(self.key.clone())
    }

    pub fn token(&self) -> Token {
        Token::of(&self.key)
    }

    /// Wire representation, used for transfer sizing and the batch warning.
    pub fn representation(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(StoreError::serialization)
    }

    pub fn from_representation(bytes: &[u8]) -> StoreResult<Self> {
        bincode::deserialize(bytes).map_err(StoreError::serialization)
    }

    pub fn unfreeze(&self, schema: Arc<Schema>) -> Mutation {
        Mutation {
            schema,
            key: self.decorated_key(),
            partition: self.partition.clone(),
        }
    }
}

/// Capability set for traversing a partition body without materializing
/// intermediate structures. One traversal function serves every visitor;
/// the visitor is known at compile time so there is no dynamic dispatch.
pub trait MutationWalker {
    fn partition_tombstone(&mut self, _tombstone: Tombstone) {}
    fn static_cell(&mut self, _column: &str, _cell: &Cell) {}
    fn row(&mut self, _ck: &ClusteringKey) {}
    fn row_tombstone(&mut self, _ck: &ClusteringKey, _tombstone: Tombstone) {}
    fn row_cell(&mut self, _ck: &ClusteringKey, _column: &str, _cell: &Cell) {}
    fn range_tombstone(&mut self, _rt: &RangeTombstone) {}
}

/// Drive a walker over every element of a partition body.
pub fn walk<W: MutationWalker>(partition: &PartitionData, walker: &mut W) {
    if let Some(t) = partition.tombstone {
        walker.partition_tombstone(t);
    }
    for (column, cell) in &partition.static_row.cells {
        walker.static_cell(column, cell);
    }
    for rt in &partition.range_tombstones {
        walker.range_tombstone(rt);
    }
    for (ck, row) in &partition.rows {
        walker.row(ck);
        if let Some(t) = row.tombstone {
            walker.row_tombstone(ck, t);
        }
        for (column, cell) in &row.cells {
            walker.row_cell(ck, column, cell);
        }
    }
}

/// Walker accumulating the data size of a partition body; backs the
/// oversized-batch warning.
#[derive(Default)]
pub struct DataSizeWalker {
    pub bytes: u64,
}

impl MutationWalker for DataSizeWalker {
    fn partition_tombstone(&mut self, _tombstone: Tombstone) {
        self.bytes += 16;
    }

    fn static_cell(&mut self, column: &str, cell: &Cell) {
        self.bytes += column.len() as u64
            + cell.value_bytes().map(|v| v.len() as u64).unwrap_or(8);
    }

    fn row(&mut self, ck: &ClusteringKey) {
        self.bytes += ck.iter().map(|c| c.len() as u64).sum::<u64>();
    }

    fn row_tombstone(&mut self, _ck: &ClusteringKey, _tombstone: Tombstone) {
        self.bytes += 16;
    }

    fn row_cell(&mut self, _ck: &ClusteringKey, column: &str, cell: &Cell) {
        self.bytes += column.len() as u64
            + cell.value_bytes().map(|v| v.len() as u64).unwrap_or(8);
    }

    fn range_tombstone(&mut self, rt: &RangeTombstone) {
        self.bytes += 16
            + rt.start.iter().map(|c| c.len() as u64).sum::<u64>()
            + rt.end.iter().map(|c| c.len() as u64).sum::<u64>();
    }
}

/// Data size of a frozen mutation's partition body.
pub fn frozen_mutation_data_size(m: &FrozenMutation) -> u64 {
    let mut walker = DataSizeWalker::default();
    walk(&m.partition, &mut walker);
    walker.bytes + m.key.len() as u64
}
