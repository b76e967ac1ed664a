/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Execution windows and per-task scale entries.

/// Half-open execution window into a chunk: rows `[base, base + size)`.
///
/// `origin` marks where the current task chain link started; the CPU
/// fallback replays the rows `[origin, base + size)` and the row accounting
/// charges them to this task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Window {
    pub base: usize,
    pub size: usize,
    pub origin: usize,
}

impl Window {
    /// Window covering all `nitems` rows of a chunk.
    pub fn full(nitems: usize) -> Self {
        Self {
            base: 0,
            size: nitems,
            origin: 0,
        }
    }

    /// One-past-the-end row of the window.
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Rows consumed since the task's origin.
    pub fn consumed(&self) -> usize {
        debug_assert!(self.origin <= self.end());
        self.end() - self.origin
    }
}

/// Execution scale of one join depth within a task: the window it covers and
/// the row counts it produced.
///
/// Index 0 of a scale vector describes the outer relation; `inner_rows` of
/// index 0 counts the outer rows that passed the outer filter.
#[derive(Clone, Copy, Debug, Default)]
pub struct DepthScale {
    pub window: Window,

    /// Rows emitted by normal matching at this depth.
    pub inner_rows: u64,

    /// Rows emitted for unmatched inner rows at this depth.
    pub right_rows: u64,

    /// Skew score of the match distribution over this depth's inner rows.
    pub dist_score: f64,
}

impl DepthScale {
    pub fn with_window(window: Window) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    /// Total rows this depth emitted.
    pub fn emitted(&self) -> u64 {
        self.inner_rows + self.right_rows
    }
}

/// Scale vector with full windows over the given per-depth item counts.
/// Index 0 is the outer relation.
pub fn full_scales(item_counts: &[usize]) -> Vec<DepthScale> {
    item_counts
        .iter()
        .map(|&nitems| DepthScale::with_window(Window::full(nitems)))
        .collect()
}
