/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! The in-process accelerator.
//!
//! [`SoftwareDevice`] evaluates a task depth-first, one outer row at a time.
//! Each outer row forms a unit of work that either commits completely or not
//! at all; when a unit would overflow the task budget, the run stops and the
//! depth-0 window shrinks to the committed row prefix, which the scheduler
//! turns into a continuation task. The first unit always commits, so every
//! run makes progress.
//!
//! A task whose rows reach a candidate matching a recheck predicate reports
//! [`RunStatus::Recheck`] and leaves the task, the result buffer, and the
//! match bitmaps untouched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::accel::{Accelerator, RunOutput, RunStatus};
use crate::chunk::{key_hash, NULL_KEY_HASH};
use crate::error::Result;
use crate::inner_buffer::{DepthFlags, InnerBuffer};
use crate::plan::{Composite, EvalContext, JoinPlan, JoinStrategy, JoinValue};
use crate::scale::DepthScale;
use crate::task::{JoinTask, ResultChunk, TaskBudget};

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Recheck,
}

/// Output of one evaluation unit, merged into the task on commit.
struct UnitState<T: JoinValue> {
    results: ResultChunk<T>,
    marks: HashSet<(usize, u32)>,
    emit_inner: Vec<u64>,
    emit_right: Vec<u64>,
    matched_rows: Vec<(usize, u32)>,
}

impl<T: JoinValue> UnitState<T> {
    fn new(num_rels: usize) -> Self {
        Self {
            results: ResultChunk::new(),
            marks: HashSet::new(),
            emit_inner: vec![0; num_rels + 1],
            emit_right: vec![0; num_rels + 1],
            matched_rows: Vec::new(),
        }
    }
}

/// Committed task state. Applied to the task only when the whole run
/// succeeds.
struct CommitState<T: JoinValue> {
    results: ResultChunk<T>,
    marks: HashSet<(usize, u32)>,
    emit_inner: Vec<u64>,
    emit_right: Vec<u64>,
    freq: Vec<HashMap<u32, u64>>,
}

impl<T: JoinValue> CommitState<T> {
    fn new(num_rels: usize) -> Self {
        Self {
            results: ResultChunk::new(),
            marks: HashSet::new(),
            emit_inner: vec![0; num_rels + 1],
            emit_right: vec![0; num_rels + 1],
            freq: (0..=num_rels).map(|_| HashMap::new()).collect(),
        }
    }

    fn absorb(&mut self, unit: UnitState<T>) {
        for row in unit.results.into_rows() {
            self.results.push(row.columns);
        }
        self.marks.extend(unit.marks);
        for depth in 0..self.emit_inner.len() {
            self.emit_inner[depth] += unit.emit_inner[depth];
            self.emit_right[depth] += unit.emit_right[depth];
        }
        for (depth, row) in unit.matched_rows {
            *self.freq[depth].entry(row).or_insert(0) += 1;
        }
    }
}

fn budget_exceeded<T: JoinValue>(
    budget: &TaskBudget,
    committed: &CommitState<T>,
    unit: &UnitState<T>,
    num_rels: usize,
) -> bool {
    for depth in 1..=num_rels {
        let emitted = committed.emit_inner[depth]
            + committed.emit_right[depth]
            + unit.emit_inner[depth]
            + unit.emit_right[depth];
        if (depth as u64 + 1) * emitted > budget.max_index_items as u64 {
            return true;
        }
    }
    committed.results.len() + unit.results.len() > budget.result_rooms
        || committed.results.used_bytes() + unit.results.used_bytes() > budget.result_bytes
}

/// Skew of the matched-inner-row frequencies: `max / mean - 1`, or zero for
/// empty or uniform distributions.
fn dist_score(freq: &HashMap<u32, u64>) -> f64 {
    if freq.is_empty() {
        return 0.0;
    }
    let total: u64 = freq.values().sum();
    let max = freq.values().copied().max().unwrap_or(0);
    let mean = total as f64 / freq.len() as f64;
    if mean > 0.0 {
        (max as f64 / mean - 1.0).max(0.0)
    } else {
        0.0
    }
}

/// A host-side device with accelerator execution semantics.
pub struct SoftwareDevice<T> {
    plan: Arc<JoinPlan<T>>,
}

impl<T: JoinValue> SoftwareDevice<T> {
    pub fn new(plan: Arc<JoinPlan<T>>) -> Self {
        Self { plan }
    }

    fn run_rows(
        &self,
        ctx: &EvalContext<'_, T>,
        buffer: &InnerBuffer<T>,
        scales: &[DepthScale],
        budget: TaskBudget,
        committed: &mut CommitState<T>,
    ) -> (usize, bool) {
        let num_rels = scales.len() - 1;
        let window = scales[0].window;
        let mut consumed = 0;

        for row in window.base..window.end() {
            let mut unit = UnitState::new(num_rels);
            let mut composite = Composite::with_outer(Some(row as u32));

            let passes = self
                .plan
                .outer_filter
                .as_ref()
                .map_or(true, |filter| filter(ctx, &composite));
            if passes {
                unit.emit_inner[0] = 1;
                if self.eval_depth(ctx, buffer, scales, &mut composite, 1, &mut unit)
                    == Flow::Recheck
                {
                    return (0, true);
                }
            }

            let overflow = budget_exceeded(&budget, committed, &unit, num_rels);
            if overflow && consumed > 0 {
                break;
            }
            committed.absorb(unit);
            consumed += 1;
            if overflow {
                break;
            }
        }

        (consumed, false)
    }

    /// Sweeps the unmatched inner rows of every null-extending depth,
    /// shallowest first, so that rows matched by a swept composite are not
    /// swept again at a deeper depth. A depth sweeps only once the windows
    /// of every shallower sweep depth reach their chunk ends, because a
    /// shallower sweep that still has rows left could probe into this depth
    /// and mark rows after the sweep read their match bits.
    fn run_residual(
        &self,
        ctx: &EvalContext<'_, T>,
        buffer: &InnerBuffer<T>,
        scales: &[DepthScale],
        committed: &mut CommitState<T>,
    ) -> bool {
        let num_rels = scales.len() - 1;
        let mut unit = UnitState::new(num_rels);

        for depth in 1..=num_rels {
            if !buffer.depth_flags(depth).contains(DepthFlags::FILLS_RIGHT)
                || !buffer.sweep_allowed(depth)
            {
                continue;
            }
            let upstream_done = (1..depth).all(|shallower| {
                !buffer
                    .depth_flags(shallower)
                    .contains(DepthFlags::FILLS_RIGHT)
                    || scales[shallower].window.end() >= buffer.item_count(shallower)
            });
            if !upstream_done {
                continue;
            }
            let window = scales[depth].window;
            for index in window.base..window.end() {
                let row = index as u32;
                if buffer.device_match(depth, row) || unit.marks.contains(&(depth, row)) {
                    continue;
                }
                let mut composite = Composite::with_outer(None);
                composite.set_inner(depth, Some(row));
                unit.emit_right[depth] += 1;
                if self.eval_depth(ctx, buffer, scales, &mut composite, depth + 1, &mut unit)
                    == Flow::Recheck
                {
                    return true;
                }
            }
        }

        committed.absorb(unit);
        false
    }

    fn eval_depth(
        &self,
        ctx: &EvalContext<'_, T>,
        buffer: &InnerBuffer<T>,
        scales: &[DepthScale],
        composite: &mut Composite,
        depth: usize,
        unit: &mut UnitState<T>,
    ) -> Flow {
        let num_rels = scales.len() - 1;
        if depth > num_rels {
            unit.results.push(ctx.project(composite, num_rels));
            return Flow::Continue;
        }

        let spec = self.plan.depth(depth);
        let flags = buffer.depth_flags(depth);
        let window = scales[depth].window;
        let mut matched = false;

        match &spec.strategy {
            JoinStrategy::Hash {
                probe_key,
                join_predicate,
            } => {
                let chunk = buffer
                    .chunk(depth)
                    .as_hash()
                    .expect("Hash strategy requires a hash chunk");
                let probe = ctx.probe_key(*probe_key, composite);
                let hash = probe.map_or(NULL_KEY_HASH, key_hash);
                if !chunk.covers(hash) {
                    // The chunk covering the hash owns the match and any
                    // null extension.
                    composite.clear_from(depth);
                    return Flow::Continue;
                }
                if let Some(key) = probe {
                    let mut cursor = chunk.first_in_bucket(hash);
                    while let Some(row) = cursor {
                        cursor = chunk.next_in_chain(row);
                        let index = row as usize;
                        if index < window.base || index >= window.end() {
                            continue;
                        }
                        if chunk.hash(row) != hash || chunk.key(row) != key {
                            continue;
                        }
                        composite.set_inner(depth, Some(row));
                        if let Some(recheck) = &spec.recheck_predicate {
                            if recheck(ctx, composite) {
                                return Flow::Recheck;
                            }
                        }
                        if let Some(pred) = join_predicate {
                            if !pred(ctx, composite) {
                                continue;
                            }
                        }
                        matched = true;
                        unit.matched_rows.push((depth, row));
                        if flags.contains(DepthFlags::FILLS_RIGHT) {
                            unit.marks.insert((depth, row));
                        }
                        if let Some(other) = &spec.other_predicate {
                            if !other(ctx, composite) {
                                continue;
                            }
                        }
                        unit.emit_inner[depth] += 1;
                        if self.eval_depth(ctx, buffer, scales, composite, depth + 1, unit)
                            == Flow::Recheck
                        {
                            return Flow::Recheck;
                        }
                    }
                }
            }
            JoinStrategy::NestedLoop { join_predicate } => {
                for index in window.base..window.end() {
                    let row = index as u32;
                    composite.set_inner(depth, Some(row));
                    if let Some(recheck) = &spec.recheck_predicate {
                        if recheck(ctx, composite) {
                            return Flow::Recheck;
                        }
                    }
                    if !join_predicate(ctx, composite) {
                        continue;
                    }
                    matched = true;
                    unit.matched_rows.push((depth, row));
                    if flags.contains(DepthFlags::FILLS_RIGHT) {
                        unit.marks.insert((depth, row));
                    }
                    if let Some(other) = &spec.other_predicate {
                        if !other(ctx, composite) {
                            continue;
                        }
                    }
                    unit.emit_inner[depth] += 1;
                    if self.eval_depth(ctx, buffer, scales, composite, depth + 1, unit)
                        == Flow::Recheck
                    {
                        return Flow::Recheck;
                    }
                }
            }
        }

        if !matched && flags.contains(DepthFlags::FILLS_LEFT) {
            composite.set_inner(depth, None);
            unit.emit_inner[depth] += 1;
            let flow = self.eval_depth(ctx, buffer, scales, composite, depth + 1, unit);
            composite.clear_from(depth);
            return flow;
        }

        composite.clear_from(depth);
        Flow::Continue
    }
}

impl<T: JoinValue> Accelerator<T> for SoftwareDevice<T> {
    fn stage_inner(&self, _buffer: &InnerBuffer<T>) -> Result<()> {
        // Chunks are shared host memory; residency is purely accounting.
        Ok(())
    }

    fn unstage_inner(&self, _buffer: &InnerBuffer<T>) {}

    fn colocate_match_bits_to_host(&self, buffer: &InnerBuffer<T>) -> Result<()> {
        buffer.merge_device_bits_into_host();
        Ok(())
    }

    fn colocate_match_bits_to_device(&self, buffer: &InnerBuffer<T>) -> Result<()> {
        buffer.merge_host_bits_into_device();
        Ok(())
    }

    fn run(&self, task: &mut JoinTask<T>) -> Result<RunOutput<T>> {
        let num_rels = task.num_rels();
        let buffer = Arc::clone(&task.buffer);
        let budget = task.budget;

        let mut committed = CommitState::new(num_rels);
        let (consumed, recheck) = {
            let ctx = EvalContext::new(task.outer.as_ref(), buffer.chunks());
            if task.outer.is_some() {
                self.run_rows(&ctx, &buffer, &task.scales, budget, &mut committed)
            } else {
                let recheck = self.run_residual(&ctx, &buffer, &task.scales, &mut committed);
                (0, recheck)
            }
        };

        if recheck {
            return Ok(RunOutput {
                status: RunStatus::Recheck,
                results: ResultChunk::new(),
            });
        }

        if task.outer.is_some() {
            task.scales[0].window.size = consumed;
        }
        task.scales[0].inner_rows = committed.emit_inner[0];
        for depth in 1..=num_rels {
            let scale = &mut task.scales[depth];
            scale.inner_rows = committed.emit_inner[depth];
            scale.right_rows = committed.emit_right[depth];
            scale.dist_score = dist_score(&committed.freq[depth]);
        }
        for (depth, row) in committed.marks {
            buffer.set_device_match(depth, row);
        }

        Ok(RunOutput {
            status: RunStatus::Success,
            results: committed.results,
        })
    }
}
