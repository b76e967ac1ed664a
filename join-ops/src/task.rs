/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Join tasks and their results.
//!
//! A task joins one outer chunk (or, for the unmatched-inner sweep, no outer
//! chunk) against a window into every inner relation. A task that leaves
//! window rows unconsumed hands its outer chunk to a continuation task that
//! picks up at the deepest unfinished depth.

use crate::inner_buffer::{DepthFlags, InnerBuffer};
use crate::outer::OuterChunk;
use crate::plan::JoinValue;
use crate::scale::{DepthScale, Window};
use crate::{INDEX_ENTRY_BYTES, TUPLE_OVERHEAD_BYTES};
use std::mem::size_of;
use std::sync::Arc;

/// Buffer capacities granted to one task by the size estimator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TaskBudget {
    /// Largest index entry count any depth stage may populate.
    pub max_index_items: usize,

    /// Result row capacity.
    pub result_rooms: usize,

    /// Accounted result byte capacity.
    pub result_bytes: usize,
}

impl Default for TaskBudget {
    fn default() -> Self {
        Self {
            max_index_items: usize::MAX,
            result_rooms: usize::MAX,
            result_bytes: usize::MAX,
        }
    }
}

/// One unit of join work.
pub struct JoinTask<T: JoinValue> {
    pub seq: u64,
    pub outer: Option<OuterChunk<T>>,
    /// Per-depth windows and row counters. Index 0 is the outer relation.
    pub scales: Vec<DepthScale>,
    pub buffer: Arc<InnerBuffer<T>>,
    pub budget: TaskBudget,
}

impl<T: JoinValue> JoinTask<T> {
    pub fn num_rels(&self) -> usize {
        self.scales.len() - 1
    }

    /// True for the unmatched-inner sweep task, which has no outer chunk.
    pub fn is_residual(&self) -> bool {
        self.outer.is_none()
    }

    /// Number of rows of the chunk at `depth`. Depth 0 is the outer chunk.
    pub fn item_count(&self, depth: usize) -> usize {
        if depth == 0 {
            self.outer.as_ref().map_or(0, |chunk| chunk.len())
        } else {
            self.buffer.item_count(depth)
        }
    }

    /// Deepest depth whose window does not reach the end of its chunk.
    pub fn unfinished_depth(&self) -> Option<usize> {
        (0..self.scales.len())
            .rev()
            .find(|&depth| self.scales[depth].window.end() < self.item_count(depth))
    }

    /// Extends every inner window to the remainder of its chunk. Used when
    /// the unmatched-inner sweep moves to the CPU, which finishes the sweep
    /// in one pass.
    pub fn extend_inner_windows(&mut self) {
        for depth in 1..self.scales.len() {
            let nitems = self.buffer.item_count(depth);
            let window = &mut self.scales[depth].window;
            window.size = nitems - window.base;
        }
    }
}

/// Derives the windows of a continuation task from the scale vector of its
/// finished predecessor.
///
/// The deepest unfinished depth advances past its consumed rows, reusing the
/// consumed row count as the size hint. Deeper depths rewind to the chunk
/// start and keep their size; shallower depths keep their window unchanged.
/// Returns `None` when every window reached the end of its chunk.
pub fn continuation_windows(
    prev: &[DepthScale],
    item_counts: &[usize],
) -> Option<Vec<Window>> {
    debug_assert_eq!(prev.len(), item_counts.len());

    let advance = (0..prev.len())
        .rev()
        .find(|&depth| prev[depth].window.end() < item_counts[depth])?;

    let windows = prev
        .iter()
        .zip(item_counts.iter())
        .enumerate()
        .map(|(depth, (scale, &nitems))| {
            let old = scale.window;
            if depth < advance {
                Window {
                    base: old.base,
                    size: old.size,
                    origin: old.base,
                }
            } else if depth == advance {
                let base = old.end();
                let hint = old.consumed();
                debug_assert!(hint > 0);
                Window {
                    base,
                    size: hint.min(nitems - base),
                    origin: base,
                }
            } else {
                Window {
                    base: 0,
                    size: old.size,
                    origin: 0,
                }
            }
        })
        .collect();

    Some(windows)
}

/// Derives the windows of a continuation of the unmatched-inner sweep.
///
/// Sweep depths advance one at a time, shallowest first. The next link
/// resumes the shallowest right-filling depth that has not reached its chunk
/// end; sweep depths above it carry an empty window at the chunk end, which
/// keeps their rows out of the pass. Every other depth keeps a whole window,
/// because rows swept at shallower depths still probe it. Returns `None`
/// once every sweep depth reached the end of its chunk.
pub fn residual_continuation_windows(
    prev: &[DepthScale],
    item_counts: &[usize],
    flags: &[DepthFlags],
) -> Option<Vec<Window>> {
    debug_assert_eq!(prev.len(), item_counts.len());
    debug_assert_eq!(flags.len() + 1, prev.len());

    let active = (1..prev.len()).find(|&depth| {
        flags[depth - 1].contains(DepthFlags::FILLS_RIGHT)
            && prev[depth].window.end() < item_counts[depth]
    })?;

    let windows = prev
        .iter()
        .zip(item_counts.iter())
        .enumerate()
        .map(|(depth, (scale, &nitems))| {
            if depth == 0 {
                Window::default()
            } else if depth == active {
                let old = scale.window;
                let base = old.end();
                Window {
                    base,
                    size: old.size.min(nitems - base),
                    origin: base,
                }
            } else if depth < active && flags[depth - 1].contains(DepthFlags::FILLS_RIGHT) {
                Window {
                    base: nitems,
                    size: 0,
                    origin: nitems,
                }
            } else {
                Window::full(nitems)
            }
        })
        .collect();

    Some(windows)
}

/// One projected result row: the outer payload followed by one payload per
/// depth. `None` marks a null-extended column.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResultRow<T> {
    pub columns: Vec<Option<T>>,
}

/// A batch of result rows with accounted byte usage.
#[derive(Debug)]
pub struct ResultChunk<T> {
    rows: Vec<ResultRow<T>>,
    used_bytes: usize,
}

impl<T: JoinValue> ResultChunk<T> {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            used_bytes: 0,
        }
    }

    pub fn push(&mut self, columns: Vec<Option<T>>) {
        let data_bytes: usize = columns
            .iter()
            .map(|c| c.map_or(0, |_| size_of::<T>()))
            .sum();
        self.used_bytes += TUPLE_OVERHEAD_BYTES + INDEX_ENTRY_BYTES + data_bytes;
        self.rows.push(ResultRow { columns });
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn rows(&self) -> &[ResultRow<T>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<ResultRow<T>> {
        self.rows
    }
}

impl<T: JoinValue> Default for ResultChunk<T> {
    fn default() -> Self {
        Self::new()
    }
}
