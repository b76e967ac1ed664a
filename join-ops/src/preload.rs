/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Inner relation preloading.
//!
//! All inner relations are ingested before the first task runs. Rows are
//! pulled round-robin across the depths so that the device budget is split
//! fairly; the first time the accounted total crosses the budget, every
//! depth's chunk byte limit is frozen at its current size. Relations that
//! outgrow their limit are partitioned into multiple chunks, and the
//! scheduler later enumerates all chunk combinations.
//!
//! Partitioning depends on the join strategy and type:
//!
//! - Hash inner joins split greedily; every chunk covers the full hash
//!   range, and a probe row simply finds no partner in chunks that do not
//!   hold its key.
//! - Hash joins that null-extend one side split strictly by hash range, so
//!   that exactly one chunk is responsible for any key. Otherwise a row
//!   could be null-extended once per chunk.
//! - Nested-loop joins have no hash to partition by. Inner and right outer
//!   variants split greedily; left and full outer variants must fit into a
//!   single chunk and are rejected otherwise.

use std::sync::Arc;

use log::warn;
use rand::seq::SliceRandom;

use crate::chunk::{hash_row_cost, key_hash, row_cost, HashChunk, InnerChunk, RowChunk};
use crate::config::{ExecConfig, PRELOAD_HEADROOM_BYTES};
use crate::error::{ErrorKind, Result};
use crate::inner_buffer::DepthFlags;
use crate::plan::{DepthSpec, JoinPlan, JoinValue};
use crate::{CHUNK_HEAD_BYTES, HASH_HISTOGRAM_BUCKETS, HASH_HISTOGRAM_SHIFT};

/// A stream of inner relation rows, pulled once per preload pass.
pub trait InnerSource<T>: Send {
    /// Returns the next `(key, payload)` row, or `None` when exhausted.
    fn next_row(&mut self) -> Result<Option<(T, T)>>;

    /// Restarts the stream from the first row.
    fn rescan(&mut self) -> Result<()>;
}

/// In-memory table columns serving as an inner source.
pub struct TableInnerSource<T> {
    keys: Vec<T>,
    payloads: Vec<T>,
    position: usize,
}

impl<T: JoinValue> TableInnerSource<T> {
    pub fn new(keys: Vec<T>, payloads: Vec<T>) -> Result<Self> {
        if keys.len() != payloads.len() {
            Err(ErrorKind::InvalidArgument(
                "Key and payload columns must have equal length".to_string(),
            ))?;
        }
        Ok(Self {
            keys,
            payloads,
            position: 0,
        })
    }
}

impl<T: JoinValue> InnerSource<T> for TableInnerSource<T> {
    fn next_row(&mut self) -> Result<Option<(T, T)>> {
        if self.position >= self.keys.len() {
            return Ok(None);
        }
        let row = (self.keys[self.position], self.payloads[self.position]);
        self.position += 1;
        Ok(Some(row))
    }

    fn rescan(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }
}

/// One preloaded inner relation.
pub struct PreloadedDepth<T> {
    pub chunks: Vec<Arc<InnerChunk<T>>>,
    pub flags: DepthFlags,
    /// Frozen chunk byte limit for this depth.
    pub chunk_limit: usize,
    /// Chunk count the planner predicted.
    pub planned_batches: usize,
}

impl<T: JoinValue> PreloadedDepth<T> {
    pub fn item_count(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.len()).sum()
    }
}

/// All preloaded inner relations of a join.
pub struct PreloadedInner<T> {
    pub depths: Vec<PreloadedDepth<T>>,
    pub total_bytes: usize,
    /// An empty inner relation below inner-join-only depths proves the
    /// result empty without scanning the outer relation.
    pub empty_shortcircuit: bool,
}

fn depth_flags<T>(spec: &DepthSpec<T>) -> DepthFlags {
    let mut flags = DepthFlags::empty();
    if !spec.strategy.is_hash() {
        flags |= DepthFlags::NESTED_LOOP;
    }
    if spec.join_type.fills_left() {
        flags |= DepthFlags::FILLS_LEFT;
    }
    if spec.join_type.fills_right() {
        flags |= DepthFlags::FILLS_RIGHT;
    }
    flags
}

/// Ingests all inner relations and partitions them into chunks.
///
/// Sources are left exhausted; callers reload through [`InnerSource::rescan`].
pub fn preload_inner<T: JoinValue>(
    config: &ExecConfig,
    plan: &JoinPlan<T>,
    sources: &mut [Box<dyn InnerSource<T>>],
) -> Result<PreloadedInner<T>> {
    let num_rels = plan.num_rels();
    if sources.len() != num_rels {
        Err(ErrorKind::InvalidArgument(format!(
            "Expected {} inner sources, got {}",
            num_rels,
            sources.len()
        )))?;
    }

    let budget = config.inner_buffer_budget(num_rels);
    let costs: Vec<usize> = plan
        .depths
        .iter()
        .map(|spec| {
            if spec.strategy.is_hash() {
                hash_row_cost::<T>()
            } else {
                row_cost::<T>()
            }
        })
        .collect();
    let keep_null_keys: Vec<bool> = plan
        .depths
        .iter()
        .map(|spec| spec.join_type.fills_right())
        .collect();

    // Round-robin ingest, one row per live depth and pass.
    let mut rows: Vec<Vec<(T, T)>> = (0..num_rels).map(|_| Vec::new()).collect();
    let mut exhausted = vec![false; num_rels];
    let mut accounted = vec![CHUNK_HEAD_BYTES; num_rels];
    let mut total: usize = accounted.iter().sum();
    let mut limits: Option<Vec<usize>> = None;

    while exhausted.iter().any(|&done| !done) {
        for depth in 0..num_rels {
            if exhausted[depth] {
                continue;
            }
            match sources[depth].next_row()? {
                None => exhausted[depth] = true,
                Some((key, payload)) => {
                    if key.is_null() && !keep_null_keys[depth] {
                        // A null key can never match and is not swept.
                        continue;
                    }
                    rows[depth].push((key, payload));
                    accounted[depth] += costs[depth];
                    total += costs[depth];
                    if limits.is_none() && total > budget {
                        limits = Some(freeze_limits(&accounted));
                    }
                }
            }
        }
    }
    let limits = limits.unwrap_or_else(|| freeze_limits(&accounted));

    if config.shuffle_inner {
        let mut rng = rand::thread_rng();
        for depth_rows in rows.iter_mut() {
            depth_rows.shuffle(&mut rng);
        }
    }

    let mut depths = Vec::with_capacity(num_rels);
    for (depth_idx, depth_rows) in rows.into_iter().enumerate() {
        let spec = &plan.depths[depth_idx];
        let chunks = partition_depth(depth_idx + 1, spec, depth_rows, limits[depth_idx])?;
        depths.push(PreloadedDepth {
            chunks,
            flags: depth_flags(spec),
            chunk_limit: limits[depth_idx],
            planned_batches: spec.planned_batches,
        });
    }

    let total_bytes = depths
        .iter()
        .flat_map(|depth| depth.chunks.iter())
        .map(|chunk| chunk.accounted_bytes())
        .sum();
    let empty_shortcircuit = empty_result_proven(plan, &depths);

    Ok(PreloadedInner {
        depths,
        total_bytes,
        empty_shortcircuit,
    })
}

fn freeze_limits(accounted: &[usize]) -> Vec<usize> {
    accounted
        .iter()
        .map(|&bytes| bytes.max(PRELOAD_HEADROOM_BYTES))
        .collect()
}

/// Walks the depths bottom-up; an empty relation forces an empty result as
/// long as no deeper depth can null-extend rows back into existence.
fn empty_result_proven<T: JoinValue>(plan: &JoinPlan<T>, depths: &[PreloadedDepth<T>]) -> bool {
    for depth in (1..=plan.num_rels()).rev() {
        let spec = &plan.depths[depth - 1];
        if spec.join_type != crate::plan::JoinType::Inner {
            return false;
        }
        if depths[depth - 1].item_count() == 0 {
            return true;
        }
    }
    false
}

fn partition_depth<T: JoinValue>(
    depth: usize,
    spec: &DepthSpec<T>,
    rows: Vec<(T, T)>,
    limit: usize,
) -> Result<Vec<Arc<InnerChunk<T>>>> {
    let chunks = if spec.strategy.is_hash() {
        let cost = hash_row_cost::<T>();
        let fits = CHUNK_HEAD_BYTES + rows.len() * cost <= limit;
        if rows.is_empty() || fits {
            vec![InnerChunk::Hash(HashChunk::build(rows, 0, u32::MAX))]
        } else if spec.join_type.fills_left() || spec.join_type.fills_right() {
            hash_range_partition(depth, rows, limit)
        } else {
            let rows_per_chunk = ((limit - CHUNK_HEAD_BYTES) / cost).max(1);
            rows.chunks(rows_per_chunk)
                .map(|part| InnerChunk::Hash(HashChunk::build(part.to_vec(), 0, u32::MAX)))
                .collect()
        }
    } else {
        let cost = row_cost::<T>();
        let fits = CHUNK_HEAD_BYTES + rows.len() * cost <= limit;
        if rows.is_empty() || fits {
            vec![InnerChunk::Row(RowChunk::from_rows(rows))]
        } else if spec.join_type.fills_left() {
            // Splitting would null-extend unmatched probe rows once per
            // chunk. There is no hash range to partition a heap by.
            Err(ErrorKind::InvalidArgument(format!(
                "Nested-loop depth {} with left outer semantics exceeds the \
                 chunk limit of {} bytes and cannot be split",
                depth, limit
            )))?
        } else {
            let rows_per_chunk = ((limit - CHUNK_HEAD_BYTES) / cost).max(1);
            rows.chunks(rows_per_chunk)
                .map(|part| InnerChunk::Row(RowChunk::from_rows(part.to_vec())))
                .collect()
        }
    };

    Ok(chunks.into_iter().map(Arc::new).collect())
}

/// Splits hash rows at bucket granularity so the chunk ranges tile the full
/// hash space and any key falls into exactly one chunk.
fn hash_range_partition<T: JoinValue>(
    depth: usize,
    rows: Vec<(T, T)>,
    limit: usize,
) -> Vec<InnerChunk<T>> {
    let cost = hash_row_cost::<T>();
    let rows_per_chunk = ((limit - CHUNK_HEAD_BYTES) / cost).max(1);

    let mut histogram = vec![0_usize; HASH_HISTOGRAM_BUCKETS];
    for &(key, _) in &rows {
        histogram[(key_hash(key) >> HASH_HISTOGRAM_SHIFT) as usize] += 1;
    }

    // Greedily pack buckets into chunk ranges.
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    let mut start = 0_usize;
    let mut pending = 0_usize;
    for bucket in 0..HASH_HISTOGRAM_BUCKETS {
        if pending > 0 && pending + histogram[bucket] > rows_per_chunk {
            ranges.push(bucket_range(start, bucket));
            start = bucket;
            pending = 0;
        }
        pending += histogram[bucket];
        if pending > rows_per_chunk {
            // A single bucket outgrows the limit and becomes its own chunk.
            warn!(
                "Hash bucket {} at depth {} holds {} rows and exceeds the chunk limit",
                bucket, depth, histogram[bucket]
            );
            ranges.push(bucket_range(start, bucket + 1));
            start = bucket + 1;
            pending = 0;
        }
    }
    if start < HASH_HISTOGRAM_BUCKETS {
        ranges.push(bucket_range(start, HASH_HISTOGRAM_BUCKETS));
    }

    let mut parts: Vec<Vec<(T, T)>> = (0..ranges.len()).map(|_| Vec::new()).collect();
    for row in rows {
        let hash = key_hash(row.0);
        let slot = ranges
            .iter()
            .position(|&(lo, hi)| lo <= hash && hash <= hi)
            .expect("Chunk hash ranges must tile the full hash space");
        parts[slot].push(row);
    }

    parts
        .into_iter()
        .zip(ranges)
        .map(|(part, (lo, hi))| InnerChunk::Hash(HashChunk::build(part, lo, hi)))
        .collect()
}

/// Inclusive hash range covered by buckets `[start, end)`.
fn bucket_range(start: usize, end: usize) -> (u32, u32) {
    let lo = (start as u32) << HASH_HISTOGRAM_SHIFT;
    let hi = if end >= HASH_HISTOGRAM_BUCKETS {
        u32::MAX
    } else {
        ((end as u32) << HASH_HISTOGRAM_SHIFT) - 1
    };
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{JoinStrategy, JoinType, ProbeKey};
    use datagen::relation::KeyAttribute;

    fn depth_spec(join_type: JoinType, hash: bool) -> DepthSpec<i32> {
        let strategy = if hash {
            JoinStrategy::Hash {
                probe_key: ProbeKey::OuterKey,
                join_predicate: None,
            }
        } else {
            JoinStrategy::NestedLoop {
                join_predicate: std::sync::Arc::new(|_, _| true),
            }
        };
        DepthSpec::new(join_type, strategy)
    }

    fn table(rows: usize) -> Box<dyn InnerSource<i32>> {
        let keys: Vec<i32> = (0..rows as i32).collect();
        let payloads: Vec<i32> = (0..rows as i32).map(|k| k * 10).collect();
        Box::new(TableInnerSource::new(keys, payloads).unwrap())
    }

    fn tight_config() -> ExecConfig {
        // Budget of 40 KiB for a single depth.
        ExecConfig {
            max_device_allocation: 96 * 1024,
            ..ExecConfig::default()
        }
    }

    #[test]
    fn mismatched_columns_are_rejected() {
        assert!(TableInnerSource::new(vec![1, 2, 3], vec![1]).is_err());
    }

    #[test]
    fn small_relations_load_as_single_chunks() {
        let config = ExecConfig::default();
        let plan = JoinPlan::new(vec![
            depth_spec(JoinType::Inner, true),
            depth_spec(JoinType::Inner, false),
        ]);
        let preloaded = preload_inner(&config, &plan, &mut [table(100), table(50)]).unwrap();

        assert_eq!(preloaded.depths.len(), 2);
        assert_eq!(preloaded.depths[0].chunks.len(), 1);
        assert_eq!(preloaded.depths[1].chunks.len(), 1);
        assert_eq!(preloaded.depths[0].item_count(), 100);
        assert_eq!(preloaded.depths[1].item_count(), 50);
        assert!(!preloaded.empty_shortcircuit);
        assert!(preloaded.total_bytes > 0);
        assert!(!preloaded.depths[0].flags.contains(DepthFlags::NESTED_LOOP));
        assert!(preloaded.depths[1].flags.contains(DepthFlags::NESTED_LOOP));
    }

    #[test]
    fn null_keys_drop_unless_the_depth_sweeps() {
        let config = ExecConfig::default();
        let plan = JoinPlan::new(vec![
            depth_spec(JoinType::Inner, true),
            depth_spec(JoinType::Right, true),
        ]);
        let keys = vec![1, i32::null_key(), 3];
        let payloads = vec![10, 20, 30];
        let mut sources: Vec<Box<dyn InnerSource<i32>>> = vec![
            Box::new(TableInnerSource::new(keys.clone(), payloads.clone()).unwrap()),
            Box::new(TableInnerSource::new(keys, payloads).unwrap()),
        ];
        let preloaded = preload_inner(&config, &plan, &mut sources).unwrap();

        assert_eq!(preloaded.depths[0].item_count(), 2);
        assert_eq!(preloaded.depths[1].item_count(), 3);
    }

    #[test]
    fn oversized_inner_hash_depth_splits_greedily() {
        let config = tight_config();
        let plan = JoinPlan::new(vec![depth_spec(JoinType::Inner, true)]);
        let preloaded = preload_inner(&config, &plan, &mut [table(4000)]).unwrap();

        let depth = &preloaded.depths[0];
        assert!(depth.chunks.len() > 1);
        assert_eq!(depth.item_count(), 4000);
        for chunk in &depth.chunks {
            assert!(chunk.accounted_bytes() <= depth.chunk_limit);
            let hash = chunk.as_hash().unwrap();
            assert_eq!(hash.hash_range(), (0, u32::MAX));
        }
    }

    #[test]
    fn outer_hash_depth_splits_by_hash_range() {
        let config = tight_config();
        let plan = JoinPlan::new(vec![depth_spec(JoinType::Right, true)]);
        let preloaded = preload_inner(&config, &plan, &mut [table(4000)]).unwrap();

        let depth = &preloaded.depths[0];
        assert!(depth.chunks.len() > 1);
        assert_eq!(depth.item_count(), 4000);

        // Ranges tile the hash space without gaps or overlap.
        let mut next_lo = 0_u64;
        for chunk in &depth.chunks {
            let hash = chunk.as_hash().unwrap();
            let (lo, hi) = hash.hash_range();
            assert_eq!(lo as u64, next_lo);
            next_lo = hi as u64 + 1;
            for row in 0..hash.len() as u32 {
                let row_hash = hash.hash(row);
                assert!(lo <= row_hash && row_hash <= hi);
            }
        }
        assert_eq!(next_lo, u32::MAX as u64 + 1);
    }

    #[test]
    fn oversized_nested_loop_left_join_is_rejected() {
        let config = tight_config();
        let plan = JoinPlan::new(vec![depth_spec(JoinType::Left, false)]);
        assert!(preload_inner(&config, &plan, &mut [table(40_000)]).is_err());
    }

    #[test]
    fn oversized_nested_loop_inner_join_splits() {
        let config = tight_config();
        let plan = JoinPlan::new(vec![depth_spec(JoinType::Inner, false)]);
        let preloaded = preload_inner(&config, &plan, &mut [table(4000)]).unwrap();
        assert!(preloaded.depths[0].chunks.len() > 1);
        assert_eq!(preloaded.depths[0].item_count(), 4000);
    }

    #[test]
    fn empty_inner_depth_proves_the_result_empty() {
        let config = ExecConfig::default();
        let plan = JoinPlan::new(vec![
            depth_spec(JoinType::Left, true),
            depth_spec(JoinType::Inner, true),
        ]);
        let preloaded = preload_inner(&config, &plan, &mut [table(10), table(0)]).unwrap();

        assert_eq!(preloaded.depths[1].chunks.len(), 1);
        assert_eq!(preloaded.depths[1].item_count(), 0);
        assert!(preloaded.empty_shortcircuit);
    }

    #[test]
    fn right_join_depth_blocks_the_empty_shortcircuit() {
        let config = ExecConfig::default();
        let plan = JoinPlan::new(vec![
            depth_spec(JoinType::Inner, true),
            depth_spec(JoinType::Right, true),
        ]);
        let preloaded = preload_inner(&config, &plan, &mut [table(0), table(10)]).unwrap();
        assert!(!preloaded.empty_shortcircuit);
    }
}
