//! src/sharder.rs
//!
//! Equal division of the sample space across global workers.
//!
//! Every rank runs the same pure computation over the shared shard listing,
//! so all ranks agree on ownership without coordination. Global worker `g`
//! of `W` owns the half-open span `[total * g / W, total * (g + 1) / W)` of
//! the concatenated sample space. Spans are cut at shard boundaries and the
//! cuts are chunked so no slice exceeds `max_samples_per_sequence`, which
//! bounds how many consecutive records a shuffle treats as one unit.

use crate::shard::{ShardInfo, ShardSlice};
use crate::worker::WorkerConfig;
use anyhow::{ensure, Result};
use tracing::info;

/// Parallel per-source slices covering one chunk of one shard group. All
/// members share offset and count; only the shard names differ.
pub(crate) type SliceGroup = Vec<ShardSlice>;

fn span_bound(total: u64, worker: usize, global_workers: usize) -> u64 {
    (total as u128 * worker as u128 / global_workers as u128) as u64
}

/// Computes the slice groups owned by each of this rank's workers.
///
/// `shard_groups[i]` holds the i-th shard of every source, zipped; members
/// of a group must have equal lengths so one set of offsets addresses all
/// of them.
pub(crate) fn assign_slices(
    shard_groups: &[Vec<ShardInfo>],
    worker_config: &WorkerConfig,
    max_samples_per_sequence: Option<u64>,
) -> Result<Vec<Vec<SliceGroup>>> {
    for group in shard_groups {
        ensure!(!group.is_empty(), "shard group without members");
        ensure!(
            group.iter().all(|shard| shard.count == group[0].count),
            "parallel shards must have equal lengths, got {}",
            group
                .iter()
                .map(|shard| format!("{}({})", shard.name, shard.count))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    let total: u64 = shard_groups.iter().map(|group| group[0].count).sum();
    let global_workers = worker_config.global_workers();

    let mut assignments = Vec::with_capacity(worker_config.num_workers());
    for worker in 0..worker_config.num_workers() {
        let global = worker_config.global_worker_index(worker);
        let begin = span_bound(total, global, global_workers);
        let end = span_bound(total, global + 1, global_workers);
        assignments.push(slice_span(shard_groups, begin, end, max_samples_per_sequence));
    }
    Ok(assignments)
}

/// Cuts `[begin, end)` of the concatenated sample space at shard boundaries,
/// then chunks each cut.
fn slice_span(
    shard_groups: &[Vec<ShardInfo>],
    begin: u64,
    end: u64,
    max_samples_per_sequence: Option<u64>,
) -> Vec<SliceGroup> {
    let mut groups = Vec::new();
    let mut base = 0u64;
    for group in shard_groups {
        let count = group[0].count;
        let lo = begin.max(base);
        let hi = end.min(base + count);
        if lo < hi {
            for (offset, chunk) in chunk_bounds(lo - base, hi - base, max_samples_per_sequence) {
                groups.push(
                    group
                        .iter()
                        .map(|shard| ShardSlice::new(shard.name.clone(), offset, chunk))
                        .collect(),
                );
            }
        }
        base += count;
        if base >= end {
            break;
        }
    }
    groups
}

/// Balanced split of `[lo, hi)` into the fewest parts of at most `max`
/// records each.
fn chunk_bounds(lo: u64, hi: u64, max: Option<u64>) -> Vec<(u64, u64)> {
    let len = hi - lo;
    let parts = match max {
        Some(max) if max < len => len.div_ceil(max),
        _ => 1,
    };
    (0..parts)
        .map(|part| {
            let a = lo + (len as u128 * part as u128 / parts as u128) as u64;
            let b = lo + (len as u128 * (part + 1) as u128 / parts as u128) as u64;
            (a, b - a)
        })
        .collect()
}

/// Logs each worker's slice ranges, eliding long lists.
pub(crate) fn log_worker_ranges(
    source: &str,
    worker_config: &WorkerConfig,
    assignments: &[Vec<SliceGroup>],
) {
    for (worker, groups) in assignments.iter().enumerate() {
        let count: u64 = groups.iter().map(|group| group[0].count).sum();
        let spans: Vec<String> = groups
            .iter()
            .map(|group| {
                let slice = &group[0];
                format!("{}[{}, {})", slice.name, slice.offset, slice.end())
            })
            .collect();
        let shown = if spans.len() > 6 {
            format!(
                "{}, .., {}",
                spans[..3].join(", "),
                spans[spans.len() - 3..].join(", ")
            )
        } else {
            spans.join(", ")
        };
        info!(
            source,
            rank = worker_config.rank(),
            worker,
            count,
            "assigned slices: [{shown}]"
        );
    }
}

/// ============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn single(counts: &[u64]) -> Vec<Vec<ShardInfo>> {
        counts
            .iter()
            .enumerate()
            .map(|(i, &count)| vec![ShardInfo::new(format!("shard_{i}"), count)])
            .collect()
    }

    /// All ranks' assignments, flattened in global worker order.
    fn all_ranks(
        groups: &[Vec<ShardInfo>],
        world_size: usize,
        num_workers: usize,
        max: Option<u64>,
    ) -> Vec<Vec<SliceGroup>> {
        let mut all = Vec::new();
        for rank in 0..world_size {
            let config = WorkerConfig::new(rank, world_size, num_workers).unwrap();
            all.extend(assign_slices(groups, &config, max).unwrap());
        }
        all
    }

    #[test]
    fn spans_tile_the_sample_space_exactly() {
        let groups = single(&[10, 7, 5]);
        let all = all_ranks(&groups, 2, 2, None);
        assert_eq!(all.len(), 4);

        // Balanced: 22 samples over 4 workers is 5 or 6 each.
        for worker in &all {
            let count: u64 = worker.iter().map(|g| g[0].count).sum();
            assert!((5..=6).contains(&count), "unbalanced worker: {count}");
        }

        // Concatenated slices cover each shard exactly once, in order.
        let mut flat: Vec<ShardSlice> =
            all.into_iter().flatten().map(|mut g| g.remove(0)).collect();
        let mut cursor: Option<ShardSlice> = None;
        for slice in flat.drain(..) {
            match &cursor {
                Some(prev) if prev.name == slice.name => {
                    assert_eq!(slice.offset, prev.end(), "gap or overlap inside a shard")
                }
                Some(prev) => {
                    let full = groups
                        .iter()
                        .find(|g| g[0].name == prev.name)
                        .map(|g| g[0].count)
                        .unwrap();
                    assert_eq!(prev.end(), full, "shard left partially covered");
                    assert_eq!(slice.offset, 0, "new shard must start at zero");
                }
                None => assert_eq!(slice.offset, 0),
            }
            cursor = Some(slice);
        }
        assert_eq!(cursor.unwrap().end(), 5, "last shard fully covered");
    }

    #[test]
    fn chunking_caps_slice_lengths() {
        let groups = single(&[64]);
        let all = all_ranks(&groups, 1, 2, Some(10));
        let counts: Vec<u64> = all
            .iter()
            .flatten()
            .map(|group| group[0].count)
            .collect();
        assert!(counts.iter().all(|&c| c <= 10 && c > 0), "bad chunks: {counts:?}");
        assert_eq!(counts.iter().sum::<u64>(), 64);
        // 32 per worker, capped at 10, is 4 chunks of 8 each.
        assert_eq!(counts, vec![8, 8, 8, 8, 8, 8, 8, 8]);
    }

    #[test]
    fn parallel_groups_stay_aligned() {
        let groups = vec![
            vec![ShardInfo::new("a_0", 6), ShardInfo::new("b_0", 6)],
            vec![ShardInfo::new("a_1", 4), ShardInfo::new("b_1", 4)],
        ];
        let config = WorkerConfig::local(2).unwrap();
        let assignments = assign_slices(&groups, &config, None).unwrap();
        for group in assignments.iter().flatten() {
            assert_eq!(group.len(), 2);
            assert_eq!(group[0].offset, group[1].offset);
            assert_eq!(group[0].count, group[1].count);
            assert_eq!(group[0].name.replace("a_", "b_"), group[1].name);
        }
    }

    #[test]
    fn small_sources_leave_some_workers_empty() {
        let groups = single(&[3]);
        let all = all_ranks(&groups, 2, 2, None);
        let empty = all.iter().filter(|w| w.is_empty()).count();
        assert_eq!(empty, 1);
        let covered: u64 = all.iter().flatten().map(|g| g[0].count).sum();
        assert_eq!(covered, 3);
    }

    #[test]
    fn unequal_parallel_shards_are_rejected() {
        let groups = vec![vec![ShardInfo::new("a_0", 6), ShardInfo::new("b_0", 5)]];
        let config = WorkerConfig::local(1).unwrap();
        assert!(assign_slices(&groups, &config, None).is_err());
    }
}
