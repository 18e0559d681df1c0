use std::ops::Bound;
use std::sync::Arc;

use crate::metrics::TableMetrics;
use crate::mutation::{ClusteringRange, DecoratedKey, QuerySlice};
use crate::schema::Schema;
use crate::sstable::{ClusteringComponentRange, Sstable};

/// Query interval for a single clustering component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ComponentRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
}

impl ComponentRange {
    fn full() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    fn singular(value: Vec<u8>) -> Self {
        Self {
            start: Bound::Included(value.clone()),
            end: Bound::Included(value),
        }
    }

    pub fn is_full(&self) -> bool {
        matches!((&self.start, &self.end), (Bound::Unbounded, Bound::Unbounded))
    }

    /// Whether this interval intersects the stored `[min, max]`.
    pub fn overlaps(&self, stored: &ClusteringComponentRange) -> bool {
        let above_start = match &self.start {
            Bound::Unbounded => true,
            Bound::Included(s) => stored.max >= *s,
            Bound::Excluded(s) => stored.max > *s,
        };
        let below_end = match &self.end {
            Bound::Unbounded => true,
            Bound::Included(e) => stored.min <= *e,
            Bound::Excluded(e) => stored.min < *e,
        };
        above_start && below_end
    }
}

/// Split each clustering range into one interval per key component.
///
/// Only the longest prefix of singular components is split: with bounds
/// `[v1, v1], [v2, v2], ..., {vl, vr}, ...` we emit the singular prefixes,
/// then one interval for the first non-singular component keeping the
/// original inclusivity, and ignore everything after it. Overlap can then
/// be tested per component against the sstable's stored min/max.
pub(crate) fn ranges_for_clustering_filter(
    clustering_ranges: &[ClusteringRange],
) -> Vec<Vec<ComponentRange>> {
    let mut all = Vec::with_capacity(clustering_ranges.len());
    for range in clustering_ranges {
        if range.is_full() {
            all.push(vec![ComponentRange::full()]);
            continue;
        }
        let (start_components, start_inclusive) = match &range.start {
            Bound::Included(k) => (k.as_slice(), true),
            Bound::Excluded(k) => (k.as_slice(), false),
            Bound::Unbounded => (&[][..], true),
        };
        let (end_components, end_inclusive) = match &range.end {
            Bound::Included(k) => (k.as_slice(), true),
            Bound::Excluded(k) => (k.as_slice(), false),
            Bound::Unbounded => (&[][..], true),
        };

        let mut components = Vec::new();
        let mut i = 0;
        while i < start_components.len()
            && i < end_components.len()
            && start_components[i] == end_components[i]
        {
            components.push(ComponentRange::singular(start_components[i].clone()));
            i += 1;
        }
        // One non-singular tail element, if present.
        if i < start_components.len() && i < end_components.len() {
            components.push(ComponentRange {
                start: bound_of(start_components[i].clone(), start_inclusive),
                end: bound_of(end_components[i].clone(), end_inclusive),
            });
        } else if i < start_components.len() {
            components.push(ComponentRange {
                start: bound_of(start_components[i].clone(), start_inclusive),
                end: Bound::Unbounded,
            });
        } else if i < end_components.len() {
            components.push(ComponentRange {
                start: Bound::Unbounded,
                end: bound_of(end_components[i].clone(), end_inclusive),
            });
        }
        all.push(components);
    }
    all
}

fn bound_of(value: Vec<u8>, inclusive: bool) -> Bound<Vec<u8>> {
    if inclusive {
        Bound::Included(value)
    } else {
        Bound::Excluded(value)
    }
}

/// True when the sstable possibly stores clustering rows selected by any of
/// the per-component range lists.
fn contains_rows(sstable: &Sstable, ranges: &[Vec<ComponentRange>]) -> bool {
    let stored = &sstable.meta.clustering_components;
    if stored.is_empty() {
        return true;
    }
    ranges.iter().any(|components| {
        let checked = components.len().min(stored.len());
        (0..checked).all(|i| components[i].is_full() || components[i].overlaps(&stored[i]))
    })
}

/// The single-partition filter pipeline.
///
/// 1. Drop sstables whose bloom filter reports the key absent.
/// 2. If the strategy opts in and the slice names clustering ranges, drop
///    sstables whose stored per-component min/max cannot overlap.
/// 3. Tombstone salvage: re-admit a dropped sstable whose `max_timestamp`
///    exceeds the minimum `min_timestamp` of the survivors and which holds
///    tombstones; a dropped deletion could otherwise fail to mask a live
///    row in a kept sstable.
///
/// Kept elements come out in their original order.
pub fn filter_for_single_key(
    mut candidates: Vec<Arc<Sstable>>,
    schema: &Schema,
    key: &DecoratedKey,
    slice: &QuerySlice,
    metrics: &TableMetrics,
) -> Vec<Arc<Sstable>> {
    candidates.retain(|sst| sst.filter_has_key(key));

    if schema.clustering_key_size == 0 || !schema.use_clustering_filter {
        return candidates;
    }
    metrics.record_clustering_filter_run(candidates.len());

    // Common case: the query names only a partition key.
    if slice.selects_all() {
        metrics.incr_clustering_filter_fast_path();
        metrics.add_clustering_filter_survivors(candidates.len());
        return candidates;
    }
    let ranges = ranges_for_clustering_filter(&slice.clustering_ranges);
    if ranges.is_empty() {
        return Vec::new();
    }

    let keeps: Vec<bool> = candidates
        .iter()
        .map(|sst| contains_rows(sst, &ranges))
        .collect();
    let min_surviving_timestamp = candidates
        .iter()
        .zip(&keeps)
        .filter(|(_, keep)| **keep)
        .map(|(sst, _)| sst.meta.min_timestamp)
        .min()
        .unwrap_or(i64::MAX);

    let filtered: Vec<Arc<Sstable>> = candidates
        .into_iter()
        .zip(keeps)
        .filter(|(sst, keep)| {
            *keep
                || (sst.meta.max_timestamp > min_surviving_timestamp
                    && sst.meta.tombstone_count > 0)
        })
        .map(|(sst, _)| sst)
        .collect();
    metrics.add_clustering_filter_survivors(filtered.len());
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Generation;
    use crate::mutation::{ClusteringKey, Token};
    use crate::position::ReplayPosition;
    use crate::sstable::{BloomFilter, SstableMetadata};
    use std::path::PathBuf;

    fn ck(s: &str) -> ClusteringKey {
        vec![s.as_bytes().to_vec()]
    }

    struct TableSpec {
        generation: u64,
        keys: Vec<&'static [u8]>,
        min_ts: i64,
        max_ts: i64,
        tombstones: u64,
        ck_min: &'static str,
        ck_max: &'static str,
    }

    fn build(spec: TableSpec) -> Arc<Sstable> {
        let mut bloom = BloomFilter::with_capacity(spec.keys.len().max(1), 0.01);
        for key in &spec.keys {
            bloom.insert(key);
        }
        let meta = SstableMetadata {
            ks: "ks".to_string(),
            cf: "cf".to_string(),
            version: "rs1".to_string(),
            generation: Generation::new(spec.generation),
            min_timestamp: spec.min_ts,
            max_timestamp: spec.max_ts,
            tombstone_count: spec.tombstones,
            clustering_components: vec![ClusteringComponentRange {
                min: spec.ck_min.as_bytes().to_vec(),
                max: spec.ck_max.as_bytes().to_vec(),
            }],
            first_key: DecoratedKey::new(Token::new(0), b"a".to_vec()),
            last_key: DecoratedKey::new(Token::new(u64::MAX), b"z".to_vec()),
            partition_count: spec.keys.len() as u64,
            data_size: 0,
            data_checksum: 0,
            max_data_age: 0,
            replay_position: ReplayPosition::ZERO,
        };
        Sstable::from_parts(meta, bloom, PathBuf::new())
    }

    fn schema() -> Schema {
        Schema::for_tests("ks", "cf")
    }

    #[test]
    fn bloom_prunes_absent_keys() {
        let schema = schema();
        let metrics = TableMetrics::default();
        let with_key = build(TableSpec {
            generation: 1,
            keys: vec![b"foo"],
            min_ts: 0,
            max_ts: 10,
            tombstones: 0,
            ck_min: "a",
            ck_max: "z",
        });
        let without_key = build(TableSpec {
            generation: 2,
            keys: vec![b"other"],
            min_ts: 0,
            max_ts: 10,
            tombstones: 0,
            ck_min: "a",
            ck_max: "z",
        });
        let key = DecoratedKey::from_key(b"foo".to_vec());
        let kept = filter_for_single_key(
            vec![with_key, without_key],
            &schema,
            &key,
            &QuerySlice::full(),
            &metrics,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].generation(), Generation::new(1));
    }

    #[test]
    fn clustering_filter_drops_non_overlapping_tables() {
        let schema = schema();
        let metrics = TableMetrics::default();
        let low = build(TableSpec {
            generation: 1,
            keys: vec![b"foo"],
            min_ts: 0,
            max_ts: 5,
            tombstones: 0,
            ck_min: "a",
            ck_max: "c",
        });
        let high = build(TableSpec {
            generation: 2,
            keys: vec![b"foo"],
            min_ts: 0,
            max_ts: 5,
            tombstones: 0,
            ck_min: "x",
            ck_max: "z",
        });
        let key = DecoratedKey::from_key(b"foo".to_vec());
        let kept = filter_for_single_key(
            vec![low, high],
            &schema,
            &key,
            &QuerySlice::for_key(ck("b")),
            &metrics,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].generation(), Generation::new(1));
        assert_eq!(metrics.snapshot().clustering_filter_count, 1);
    }

    #[test]
    fn tombstone_salvage_readmits_newer_deletions() {
        let schema = schema();
        let metrics = TableMetrics::default();
        // Table A holds the row at ck "a" written at ts 5.
        let a = build(TableSpec {
            generation: 1,
            keys: vec![b"foo"],
            min_ts: 5,
            max_ts: 5,
            tombstones: 0,
            ck_min: "a",
            ck_max: "a",
        });
        // Table B holds only a newer range tombstone over [m, z]: its
        // clustering bounds miss "a", but its deletion may mask A's row.
        let b = build(TableSpec {
            generation: 2,
            keys: vec![b"foo"],
            min_ts: 10,
            max_ts: 10,
            tombstones: 1,
            ck_min: "m",
            ck_max: "z",
        });
        let key = DecoratedKey::from_key(b"foo".to_vec());
        let kept = filter_for_single_key(
            vec![a, b],
            &schema,
            &key,
            &QuerySlice::for_key(ck("a")),
            &metrics,
        );
        let generations: Vec<u64> = kept.iter().map(|s| s.generation().as_u64()).collect();
        assert_eq!(generations, vec![1, 2]);
    }

    #[test]
    fn dropped_table_without_tombstones_stays_dropped() {
        let schema = schema();
        let metrics = TableMetrics::default();
        let a = build(TableSpec {
            generation: 1,
            keys: vec![b"foo"],
            min_ts: 5,
            max_ts: 5,
            tombstones: 0,
            ck_min: "a",
            ck_max: "a",
        });
        let b = build(TableSpec {
            generation: 2,
            keys: vec![b"foo"],
            min_ts: 10,
            max_ts: 10,
            tombstones: 0,
            ck_min: "m",
            ck_max: "z",
        });
        let key = DecoratedKey::from_key(b"foo".to_vec());
        let kept = filter_for_single_key(
            vec![a, b],
            &schema,
            &key,
            &QuerySlice::for_key(ck("a")),
            &metrics,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].generation(), Generation::new(1));
    }

    #[test]
    fn full_slice_takes_the_fast_path() {
        let schema = schema();
        let metrics = TableMetrics::default();
        let a = build(TableSpec {
            generation: 1,
            keys: vec![b"foo"],
            min_ts: 0,
            max_ts: 5,
            tombstones: 0,
            ck_min: "a",
            ck_max: "c",
        });
        let key = DecoratedKey::from_key(b"foo".to_vec());
        let kept =
            filter_for_single_key(vec![a], &schema, &key, &QuerySlice::full(), &metrics);
        assert_eq!(kept.len(), 1);
        assert_eq!(metrics.snapshot().clustering_filter_fast_path_count, 1);
    }

    #[test]
    fn singular_prefix_split_keeps_tail_inclusivity() {
        let range = ClusteringRange {
            start: Bound::Included(vec![b"a".to_vec(), b"1".to_vec()]),
            end: Bound::Excluded(vec![b"a".to_vec(), b"9".to_vec()]),
        };
        let split = ranges_for_clustering_filter(&[range]);
        assert_eq!(split.len(), 1);
        let components = &split[0];
        assert_eq!(components.len(), 2);
        assert_eq!(components[0], ComponentRange::singular(b"a".to_vec()));
        assert_eq!(components[1].start, Bound::Included(b"1".to_vec()));
        assert_eq!(components[1].end, Bound::Excluded(b"9".to_vec()));
    }
}
