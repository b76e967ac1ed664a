/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! CPU replay of join tasks.
//!
//! Tasks whose device run reports a recheck, and residual sweeps of
//! combinations that saw a fallback, are replayed on the host. The replay
//! walks the same windows as the device with an explicit cursor per depth
//! instead of recursion: each cursor remembers its scan or hash chain
//! position, whether its depth matched, and whether the unmatched-inner
//! sweep has moved past it. The whole task drains into one result chunk on
//! the calling thread.
//!
//! Recheck predicates exist because a device cannot evaluate some candidate
//! filters; the replay evaluates every predicate exactly and does not
//! consult them.

use std::sync::Arc;

use crate::chunk::{key_hash, NULL_KEY_HASH};
use crate::inner_buffer::{DepthFlags, InnerBuffer};
use crate::plan::{Composite, EvalContext, JoinPlan, JoinStrategy, JoinValue};
use crate::scale::DepthScale;
use crate::task::{JoinTask, ResultChunk};

/// Replays join tasks on the host.
pub struct FallbackScan<'a, T> {
    plan: &'a JoinPlan<T>,
}

impl<'a, T: JoinValue> FallbackScan<'a, T> {
    pub fn new(plan: &'a JoinPlan<T>) -> Self {
        Self { plan }
    }

    /// Drains `task` into one result chunk and fills in its row counters.
    pub fn replay(&self, task: &mut JoinTask<T>) -> ResultChunk<T> {
        let buffer = Arc::clone(&task.buffer);
        let num_rels = task.num_rels();

        let residual = task.is_residual();

        let (results, emit_inner, emit_right) = {
            let ctx = EvalContext::new(task.outer.as_ref(), buffer.chunks());
            let mut machine = Machine::new(self.plan, &buffer, &task.scales, ctx);
            let results = machine.drain(residual);
            (results, machine.emit_inner, machine.emit_right)
        };

        task.scales[0].inner_rows = emit_inner[0];
        for depth in 1..=num_rels {
            let scale = &mut task.scales[depth];
            scale.inner_rows = emit_inner[depth];
            scale.right_rows = emit_right[depth];
        }
        results
    }
}

#[derive(Clone, Copy)]
enum CursorPos {
    /// The depth has not fetched a candidate for the current composite.
    Reload,
    /// Last candidate row delivered; the scan resumes behind it.
    At(u32),
    /// No further candidates.
    Exhausted,
}

struct DepthCursor {
    pos: CursorPos,
    /// Probe hash, valid while walking a bucket chain.
    hash: u32,
    /// The current composite matched at this depth.
    matched: bool,
    /// The unmatched-inner sweep moved past this depth.
    right_outer: bool,
}

impl Default for DepthCursor {
    fn default() -> Self {
        Self {
            pos: CursorPos::Reload,
            hash: 0,
            matched: false,
            right_outer: false,
        }
    }
}

/// A candidate delivered by one depth for the current composite.
enum Candidate {
    /// A matching inner row.
    Row(u32),
    /// An unmatched inner row delivered by the sweep.
    SweepRow(u32),
    /// The null extension of an unmatched composite.
    HalfNull,
    /// Null binding that carries the sweep into the next depth.
    Cascade,
    Exhausted,
}

struct Machine<'a, T: JoinValue> {
    plan: &'a JoinPlan<T>,
    buffer: &'a InnerBuffer<T>,
    scales: &'a [DepthScale],
    ctx: EvalContext<'a, T>,
    cursors: Vec<DepthCursor>,
    composite: Composite,
    emit_inner: Vec<u64>,
    emit_right: Vec<u64>,
}

impl<'a, T: JoinValue> Machine<'a, T> {
    fn new(
        plan: &'a JoinPlan<T>,
        buffer: &'a InnerBuffer<T>,
        scales: &'a [DepthScale],
        ctx: EvalContext<'a, T>,
    ) -> Self {
        let depths = scales.len();
        Self {
            plan,
            buffer,
            scales,
            ctx,
            cursors: (0..depths).map(|_| DepthCursor::default()).collect(),
            composite: Composite::with_outer(None),
            emit_inner: vec![0; depths],
            emit_right: vec![0; depths],
        }
    }

    fn drain(&mut self, residual: bool) -> ResultChunk<T> {
        let num_rels = self.scales.len() - 1;
        let mut results = ResultChunk::new();
        let mut depth = if residual { 1 } else { 0 };

        loop {
            if depth == 0 {
                match self.next_outer_row() {
                    Some(row) => {
                        self.composite = Composite::with_outer(Some(row));
                        self.emit_inner[0] += 1;
                        self.rewind(1);
                        depth = 1;
                    }
                    None => break,
                }
                continue;
            }

            match self.next_candidate(depth, residual) {
                Candidate::Exhausted => {
                    if depth == 1 {
                        if residual {
                            break;
                        }
                        depth = 0;
                    } else {
                        depth -= 1;
                    }
                }
                Candidate::Row(row) => {
                    self.composite.set_inner(depth, Some(row));
                    if !self.passes_other(depth) {
                        continue;
                    }
                    self.emit_inner[depth] += 1;
                    if depth == num_rels {
                        results.push(self.ctx.project(&self.composite, num_rels));
                    } else {
                        self.rewind(depth + 1);
                        depth += 1;
                    }
                }
                Candidate::SweepRow(row) => {
                    self.composite.set_inner(depth, Some(row));
                    self.emit_right[depth] += 1;
                    if depth == num_rels {
                        results.push(self.ctx.project(&self.composite, num_rels));
                    } else {
                        self.rewind(depth + 1);
                        depth += 1;
                    }
                }
                Candidate::HalfNull => {
                    self.composite.set_inner(depth, None);
                    self.emit_inner[depth] += 1;
                    if depth == num_rels {
                        results.push(self.ctx.project(&self.composite, num_rels));
                    } else {
                        self.rewind(depth + 1);
                        depth += 1;
                    }
                }
                Candidate::Cascade => {
                    self.composite.set_inner(depth, None);
                    debug_assert!(depth < num_rels);
                    self.rewind(depth + 1);
                    depth += 1;
                }
            }
        }

        results
    }

    /// Next outer row passing the filter, within the depth-0 window.
    fn next_outer_row(&mut self) -> Option<u32> {
        let window = self.scales[0].window;
        let start = match self.cursors[0].pos {
            CursorPos::Reload => window.origin,
            CursorPos::At(last) => last as usize + 1,
            CursorPos::Exhausted => return None,
        };

        for index in start..window.end() {
            let row = index as u32;
            let composite = Composite::with_outer(Some(row));
            let passes = self
                .plan
                .outer_filter
                .as_ref()
                .map_or(true, |filter| filter(&self.ctx, &composite));
            if passes {
                self.cursors[0].pos = CursorPos::At(row);
                return Some(row);
            }
        }
        self.cursors[0].pos = CursorPos::Exhausted;
        None
    }

    fn passes_other(&self, depth: usize) -> bool {
        self.plan
            .depth(depth)
            .other_predicate
            .as_ref()
            .map_or(true, |other| other(&self.ctx, &self.composite))
    }

    fn rewind(&mut self, from: usize) {
        for cursor in self.cursors[from..].iter_mut() {
            *cursor = DepthCursor::default();
        }
    }

    fn next_candidate(&mut self, depth: usize, residual: bool) -> Candidate {
        let right_mode = if depth == 1 {
            residual
        } else {
            self.cursors[depth - 1].right_outer
        };
        if right_mode {
            return self.next_sweep_candidate(depth);
        }

        match &self.plan.depth(depth).strategy {
            JoinStrategy::NestedLoop { join_predicate } => {
                let window = self.scales[depth].window;
                let flags = self.buffer.depth_flags(depth);
                let start = match self.cursors[depth].pos {
                    CursorPos::Reload => window.origin,
                    CursorPos::At(last) => last as usize + 1,
                    CursorPos::Exhausted => return Candidate::Exhausted,
                };

                for index in start..window.end() {
                    let row = index as u32;
                    self.composite.set_inner(depth, Some(row));
                    if !join_predicate(&self.ctx, &self.composite) {
                        continue;
                    }
                    if flags.contains(DepthFlags::FILLS_RIGHT) {
                        self.buffer.set_host_match(depth, row);
                    }
                    self.cursors[depth].matched = true;
                    self.cursors[depth].pos = CursorPos::At(row);
                    return Candidate::Row(row);
                }
                self.cursors[depth].pos = CursorPos::Exhausted;
                self.half_null_or_exhausted(depth)
            }
            JoinStrategy::Hash {
                probe_key,
                join_predicate,
            } => {
                let window = self.scales[depth].window;
                let flags = self.buffer.depth_flags(depth);
                let chunk = self
                    .buffer
                    .chunk(depth)
                    .as_hash()
                    .expect("Hash strategy requires a hash chunk");

                let probe = self.ctx.probe_key(*probe_key, &self.composite);
                let mut cursor = match self.cursors[depth].pos {
                    CursorPos::Reload => {
                        let hash = probe.map_or(NULL_KEY_HASH, key_hash);
                        self.cursors[depth].hash = hash;
                        if !chunk.covers(hash) {
                            // The chunk covering the hash owns the match and
                            // any null extension.
                            self.cursors[depth].pos = CursorPos::Exhausted;
                            return Candidate::Exhausted;
                        }
                        if probe.is_none() {
                            // An absent key has no candidates; the common
                            // tail decides on the null extension.
                            self.cursors[depth].pos = CursorPos::Exhausted;
                            return self.half_null_or_exhausted(depth);
                        }
                        chunk.first_in_bucket(hash)
                    }
                    CursorPos::At(row) => chunk.next_in_chain(row),
                    CursorPos::Exhausted => return Candidate::Exhausted,
                };

                let hash = self.cursors[depth].hash;
                let key = match probe {
                    Some(key) => key,
                    // A resumed chain always has a concrete key.
                    None => return Candidate::Exhausted,
                };

                while let Some(row) = cursor {
                    cursor = chunk.next_in_chain(row);
                    let index = row as usize;
                    if index < window.origin || index >= window.end() {
                        continue;
                    }
                    if chunk.hash(row) != hash || chunk.key(row) != key {
                        continue;
                    }
                    self.composite.set_inner(depth, Some(row));
                    if let Some(pred) = join_predicate {
                        if !pred(&self.ctx, &self.composite) {
                            continue;
                        }
                    }
                    if flags.contains(DepthFlags::FILLS_RIGHT) {
                        self.buffer.set_host_match(depth, row);
                    }
                    self.cursors[depth].matched = true;
                    self.cursors[depth].pos = CursorPos::At(row);
                    return Candidate::Row(row);
                }
                self.cursors[depth].pos = CursorPos::Exhausted;
                self.half_null_or_exhausted(depth)
            }
        }
    }

    /// Sweep candidates of a depth the unmatched-inner sweep has reached.
    fn next_sweep_candidate(&mut self, depth: usize) -> Candidate {
        let num_rels = self.scales.len() - 1;
        if let CursorPos::Exhausted = self.cursors[depth].pos {
            return Candidate::Exhausted;
        }

        if self
            .buffer
            .depth_flags(depth)
            .contains(DepthFlags::FILLS_RIGHT)
            && self.buffer.sweep_allowed(depth)
        {
            let window = self.scales[depth].window;
            let start = match self.cursors[depth].pos {
                CursorPos::Reload => window.origin,
                CursorPos::At(last) => last as usize + 1,
                CursorPos::Exhausted => unreachable!(),
            };
            for index in start..window.end() {
                let row = index as u32;
                if !self.buffer.host_match(depth, row) {
                    self.cursors[depth].pos = CursorPos::At(row);
                    return Candidate::SweepRow(row);
                }
            }
        }

        // Sweep finished, or the depth has nothing to sweep. Pass the sweep
        // to the next depth exactly once.
        self.cursors[depth].pos = CursorPos::Exhausted;
        if depth == num_rels {
            return Candidate::Exhausted;
        }
        self.cursors[depth].right_outer = true;
        Candidate::Cascade
    }

    fn half_null_or_exhausted(&mut self, depth: usize) -> Candidate {
        if !self.cursors[depth].matched
            && self
                .buffer
                .depth_flags(depth)
                .contains(DepthFlags::FILLS_LEFT)
        {
            return Candidate::HalfNull;
        }
        Candidate::Exhausted
    }
}
