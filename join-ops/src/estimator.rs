/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Task size estimation.
//!
//! Before a task is submitted, the estimator predicts the row count of every
//! join depth and grants buffer budgets. Estimates blend the planner figures
//! with observed execution figures, weighted by a merge ratio that grows as
//! the join consumes the outer relation. When a predicted buffer exceeds its
//! limit, the estimator narrows the window of a shrink target depth and the
//! caller re-estimates, up to [`MAX_SIZING_ROUNDS`] times.

use crate::config::ExecConfig;
use crate::plan::{JoinPlan, JoinValue};
use crate::scale::DepthScale;
use crate::stats::StatsSnapshot;
use crate::task::TaskBudget;
use crate::{CHUNK_HEAD_BYTES, INDEX_ENTRY_BYTES, RESULT_HEAD_BYTES, TUPLE_OVERHEAD_BYTES};

/// Upper bound on estimate-shrink-re-estimate rounds per task.
pub const MAX_SIZING_ROUNDS: usize = 64;

/// Outcome of one sizing pass.
#[derive(Debug, PartialEq)]
pub enum SizeOutcome {
    /// Budgets granted for the candidate windows.
    Accepted(TaskBudget),
    /// Narrow the window at `depth` to `size` rows and re-estimate.
    Shrink { depth: usize, size: usize },
    /// No window assignment fits the buffer limits.
    Reject(String),
}

pub struct Estimator<'a, T> {
    config: &'a ExecConfig,
    plan: &'a JoinPlan<T>,
}

impl<'a, T: JoinValue> Estimator<'a, T> {
    pub fn new(config: &'a ExecConfig, plan: &'a JoinPlan<T>) -> Self {
        Self { config, plan }
    }

    /// Weight of the execution figures against the planner figures.
    ///
    /// Execution figures take over once 20 tasks completed or 30% of the
    /// planned outer rows were consumed, whichever comes first.
    pub fn merge_ratio(&self, snapshot: &StatsSnapshot) -> f64 {
        let progress = if self.plan.planned_outer_rows > 0.0 {
            snapshot.source_rows as f64 / (0.30 * self.plan.planned_outer_rows)
        } else {
            0.0
        };
        (snapshot.source_tasks as f64 / 20.0).max(progress).min(1.0)
    }

    /// Runs one sizing pass over the candidate windows.
    ///
    /// `item_counts` holds the chunk row counts per depth, with the outer
    /// chunk at index 0. `prev` is the scale vector of the finished
    /// predecessor when sizing a continuation task.
    pub fn size_task(
        &self,
        snapshot: &StatsSnapshot,
        scales: &[DepthScale],
        item_counts: &[usize],
        has_outer: bool,
        prev: Option<&[DepthScale]>,
    ) -> SizeOutcome {
        let num_rels = self.plan.num_rels();
        debug_assert_eq!(scales.len(), num_rels + 1);
        debug_assert_eq!(item_counts.len(), num_rels + 1);

        let merge = self.merge_ratio(snapshot);
        let ntuples = self.estimate_rows(snapshot, scales, item_counts, has_outer, prev, merge);

        // Intermediate index buffers, deepest stages last. Two buffers of
        // `chunk_size` ping-pong between consecutive depths.
        let mut max_items = 0_usize;
        for depth in 1..=num_rels {
            let stage_items =
                ((depth + 1) as f64 * ntuples[depth] * self.config.chunk_size_margin).ceil()
                    as usize;
            let index_bytes = 2 * (RESULT_HEAD_BYTES + INDEX_ENTRY_BYTES * stage_items);
            if index_bytes > 2 * self.config.chunk_size {
                let divisor = index_bytes / (2 * self.config.chunk_size) + 1;
                return self.shrink(snapshot, scales, &ntuples, has_outer, |size| {
                    size / divisor
                });
            }
            max_items = max_items.max(stage_items);
        }

        // Never grant less than a quarter chunk of index space, so small
        // estimates do not starve a task that outgrows them slightly.
        let min_index_bytes = self.config.chunk_size / 4;
        if 2 * (RESULT_HEAD_BYTES + INDEX_ENTRY_BYTES * max_items) < min_index_bytes {
            max_items = (min_index_bytes / 2 - RESULT_HEAD_BYTES) / INDEX_ENTRY_BYTES;
        }

        // Destination buffer.
        let width = self.result_width(snapshot, merge);
        let tuple_bytes = TUPLE_OVERHEAD_BYTES + width.ceil() as usize;
        let mut nrooms = (ntuples[num_rels] * self.config.chunk_size_margin).ceil() as usize;
        let mut dst_bytes = CHUNK_HEAD_BYTES + (INDEX_ENTRY_BYTES + tuple_bytes) * nrooms;

        if dst_bytes < self.config.chunk_size / 2 {
            // Batch small results up to the half-chunk floor.
            dst_bytes = self.config.chunk_size / 2;
            nrooms = (dst_bytes - CHUNK_HEAD_BYTES) / (INDEX_ENTRY_BYTES + tuple_bytes);
        } else if dst_bytes > self.config.chunk_size_limit {
            let small_rooms = (self.config.chunk_size_limit - CHUNK_HEAD_BYTES)
                / (INDEX_ENTRY_BYTES + tuple_bytes);
            if small_rooms == 0 {
                return SizeOutcome::Reject(
                    "A single result row exceeds the chunk size limit".to_string(),
                );
            }
            let nsplit = nrooms / small_rooms + 1;
            return self.shrink(snapshot, scales, &ntuples, has_outer, |size| {
                size / nsplit + 1
            });
        }

        SizeOutcome::Accepted(TaskBudget {
            max_index_items: max_items,
            result_rooms: nrooms,
            result_bytes: dst_bytes,
        })
    }

    /// Expected result width in bytes, blending planner and execution
    /// figures.
    fn result_width(&self, snapshot: &StatsSnapshot, merge: f64) -> f64 {
        let plan_width = self.plan.planned_result_width as f64;
        match snapshot.exec_result_width() {
            None => plan_width,
            Some(exec) if merge < 1.0 => plan_width * (1.0 - merge) + exec * merge,
            Some(exec) => exec,
        }
    }

    /// Expected rows leaving each depth for the candidate windows.
    fn estimate_rows(
        &self,
        snapshot: &StatsSnapshot,
        scales: &[DepthScale],
        item_counts: &[usize],
        has_outer: bool,
        prev: Option<&[DepthScale]>,
        merge: f64,
    ) -> Vec<f64> {
        let num_rels = self.plan.num_rels();
        let mut ntuples = vec![0.0_f64; num_rels + 1];

        ntuples[0] = if !has_outer {
            0.0
        } else if let Some(prev_scales) = prev {
            let consumed = prev_scales[0].window.consumed();
            if consumed > 0 {
                scales[0].window.size as f64 * prev_scales[0].inner_rows as f64 / consumed as f64
            } else {
                scales[0].window.size as f64
            }
        } else if self.plan.outer_filter.is_none() {
            scales[0].window.size as f64
        } else if snapshot.source_rows == 0 {
            self.plan.planned_outer_ratio * scales[0].window.size as f64
        } else {
            let exec = snapshot.emitted(0) as f64 / snapshot.source_rows as f64;
            let ratio = exec * merge + self.plan.planned_outer_ratio * (1.0 - merge);
            ratio * scales[0].window.size as f64
        };

        for depth in 1..=num_rels {
            let spec = &self.plan.depths[depth - 1];
            let window = scales[depth].window;
            let nitems = item_counts[depth];
            let ntuples_in = ntuples[depth - 1];

            let mut out = 0.0;
            if ntuples_in > 0.0 {
                let replayed = prev.and_then(|prev_scales| {
                    let prev_in = prev_scales[depth - 1].emitted();
                    let consumed = prev_scales[depth].window.consumed();
                    if prev_in > 0 && consumed > 0 {
                        let pass = prev_scales[depth].inner_rows as f64 / prev_in as f64;
                        Some(ntuples_in * pass * (window.size as f64 / consumed as f64))
                    } else {
                        None
                    }
                });
                out = replayed.unwrap_or_else(|| {
                    if nitems == 0 {
                        0.0
                    } else {
                        let exec_in = snapshot.emitted(depth - 1);
                        let exec_ratio = if exec_in > 0 {
                            snapshot.inner_rows[depth] as f64 / exec_in as f64
                        } else {
                            0.0
                        };
                        let ratio = exec_ratio * merge + spec.planned_rows_ratio * (1.0 - merge);
                        ntuples_in * ratio * (window.size as f64 / nitems as f64)
                    }
                });
            }

            // The unmatched-inner sweep adds rows only to the residual task,
            // and only once every shallower sweep window reached its chunk
            // end, mirroring when the device actually runs the sweep.
            if !has_outer && window.size > 0 && spec.join_type.fills_right() {
                let upstream_done = |vector: &[DepthScale]| {
                    (1..depth).all(|shallower| {
                        !self.plan.depths[shallower - 1].join_type.fills_right()
                            || vector[shallower].window.end() >= item_counts[shallower]
                    })
                };
                if upstream_done(scales) {
                    let replayed = prev.and_then(|prev_scales| {
                        let consumed = prev_scales[depth].window.consumed();
                        if consumed > 0 && upstream_done(prev_scales) {
                            Some(
                                prev_scales[depth].right_rows as f64
                                    * (window.size as f64 / consumed as f64),
                            )
                        } else {
                            None
                        }
                    });
                    out += replayed.unwrap_or_else(|| {
                        if nitems == 0 {
                            window.size as f64
                        } else {
                            let matched = snapshot.emitted(depth) as f64 / nitems as f64;
                            let ratio = (1.0 - matched.sqrt().min(1.0)).max(0.05);
                            ratio * window.size as f64
                        }
                    });
                }
            }

            ntuples[depth] = out;
        }

        ntuples
    }

    /// Narrows the shrink target's window with `narrow` and reports the
    /// outcome.
    fn shrink<F>(
        &self,
        snapshot: &StatsSnapshot,
        scales: &[DepthScale],
        ntuples: &[f64],
        has_outer: bool,
        narrow: F,
    ) -> SizeOutcome
    where
        F: Fn(usize) -> usize,
    {
        let target = match self.shrink_target(snapshot, scales, ntuples, has_outer) {
            Some(target) => target,
            None => {
                return SizeOutcome::Reject(
                    "No depth window can be narrowed safely".to_string(),
                )
            }
        };

        let current = scales[target].window.size;
        let size = narrow(current);
        if size < 1 || size >= current {
            // Narrowing must make progress, or sizing cannot converge.
            return SizeOutcome::Reject(
                "Result growth leaves no window assignment within the chunk limits".to_string(),
            );
        }
        SizeOutcome::Shrink {
            depth: target,
            size,
        }
    }

    /// Picks the depth whose window the next shrink narrows.
    ///
    /// On a residual task only the depth whose sweep currently runs may
    /// narrow. Deeper windows must stay whole, because swept rows still
    /// probe them, and narrowing the active depth also keeps deeper sweeps
    /// held back until the active depth finishes its chunk.
    ///
    /// On outer tasks, prefers the depth with the highest observed match
    /// skew; without skew feedback, the depth with the largest estimated
    /// growth step. Depths that null-extend unmatched composite rows must
    /// not split their windows, because a row can only be recognized as
    /// unmatched within a whole window; such targets redirect to the outer
    /// window.
    fn shrink_target(
        &self,
        snapshot: &StatsSnapshot,
        scales: &[DepthScale],
        ntuples: &[f64],
        has_outer: bool,
    ) -> Option<usize> {
        let num_rels = self.plan.num_rels();

        if !has_outer {
            return (1..=num_rels).find(|&depth| {
                self.plan.depths[depth - 1].join_type.fills_right()
                    && scales[depth].window.size > 0
            });
        }

        let target = if snapshot.dist_score_valid {
            let mut target = 0;
            for depth in 1..=num_rels {
                if snapshot.dist_scores[depth] > snapshot.dist_scores[target] {
                    target = depth;
                }
            }
            target
        } else {
            let mut target = 1;
            let mut best = ntuples[1] - ntuples[0];
            for depth in 2..=num_rels {
                let delta = ntuples[depth] - ntuples[depth - 1];
                if delta > best {
                    best = delta;
                    target = depth;
                }
            }
            target
        };

        if target == 0 || !self.plan.depths[target - 1].join_type.fills_left() {
            return Some(target);
        }
        Some(0)
    }
}
