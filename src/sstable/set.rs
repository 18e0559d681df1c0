use std::sync::Arc;

use crate::config::Generation;
use crate::mutation::PartitionRange;
use crate::sstable::Sstable;

/// Selectable set of sstable references, ordered by generation.
///
/// The owning table never mutates its set in place: every change clones the
/// set, edits the clone, and swaps the pointer, so readers constructed
/// earlier keep iterating a stable snapshot. `select` narrows by first/last
/// key overlap; a compaction strategy with tighter indexes can narrow
/// further behind the same interface.
#[derive(Clone, Default)]
pub struct SstableSet {
    sstables: Vec<Arc<Sstable>>,
}

impl SstableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sstable: Arc<Sstable>) {
        let generation = sstable.generation();
        let idx = self
            .sstables
            .partition_point(|s| s.generation() < generation);
        self.sstables.insert(idx, sstable);
    }

    /// The subset possibly overlapping `range`, in generation order.
    pub fn select(&self, range: &PartitionRange) -> Vec<Arc<Sstable>> {
        self.sstables
            .iter()
            .filter(|sst| range.overlaps(&sst.meta.first_key, &sst.meta.last_key))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> &[Arc<Sstable>] {
        &self.sstables
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Sstable>> {
        self.sstables.iter()
    }

    pub fn len(&self) -> usize {
        self.sstables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sstables.is_empty()
    }

    pub fn contains_generation(&self, generation: Generation) -> bool {
        self.sstables
            .iter()
            .any(|s| s.generation() == generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Generation;
    use crate::mutation::{DecoratedKey, Token, TokenRange};
    use crate::position::ReplayPosition;
    use crate::sstable::{BloomFilter, SstableMetadata};
    use std::path::PathBuf;

    fn sstable(generation: u64, first: u64, last: u64) -> Arc<Sstable> {
        let meta = SstableMetadata {
            ks: "ks".to_string(),
            cf: "cf".to_string(),
            version: "rs1".to_string(),
            generation: Generation::new(generation),
            min_timestamp: 0,
            max_timestamp: 0,
            tombstone_count: 0,
            clustering_components: Vec::new(),
            first_key: DecoratedKey::new(Token::new(first), b"first".to_vec()),
            last_key: DecoratedKey::new(Token::new(last), b"last".to_vec()),
            partition_count: 1,
            data_size: 0,
            data_checksum: 0,
            max_data_age: 0,
            replay_position: ReplayPosition::ZERO,
        };
        Sstable::from_parts(meta, BloomFilter::with_capacity(1, 0.01), PathBuf::new())
    }

    #[test]
    fn insert_keeps_generation_order() {
        let mut set = SstableSet::new();
        set.insert(sstable(3, 0, 10));
        set.insert(sstable(1, 0, 10));
        set.insert(sstable(2, 0, 10));
        let generations: Vec<u64> = set.iter().map(|s| s.generation().as_u64()).collect();
        assert_eq!(generations, vec![1, 2, 3]);
    }

    #[test]
    fn select_narrows_by_token_overlap() {
        let mut set = SstableSet::new();
        set.insert(sstable(1, 0, 100));
        set.insert(sstable(2, 200, 300));

        let range = PartitionRange::Tokens(TokenRange::open_closed(
            Token::new(150),
            Token::new(250),
        ));
        let selected = set.select(&range);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].generation(), Generation::new(2));

        let all = set.select(&PartitionRange::full());
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn clone_gives_readers_a_stable_snapshot() {
        let mut set = SstableSet::new();
        set.insert(sstable(1, 0, 10));
        let snapshot = set.clone();
        set.insert(sstable(2, 0, 10));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(set.len(), 2);
    }
}
