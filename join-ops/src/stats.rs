/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Runtime statistics shared between the scheduler and the size estimator.
//!
//! Every completed task merges its scale vector and result counters here.
//! The estimator blends these execution figures with the planner figures,
//! weighted by how much of the outer relation has been consumed.

use crate::scale::DepthScale;
use std::sync::Mutex;

/// A point-in-time copy of the runtime statistics.
#[derive(Clone, Debug)]
pub struct StatsSnapshot {
    /// Completed tasks that consumed outer rows.
    pub source_tasks: u64,

    /// Outer relation rows consumed so far.
    pub source_rows: u64,

    /// Result rows produced so far.
    pub result_rows: u64,

    /// Accounted bytes of the result rows produced so far.
    pub result_bytes: u64,

    /// Rows emitted by normal matching, per depth. Index 0 counts outer rows
    /// that passed the outer filter.
    pub inner_rows: Vec<u64>,

    /// Rows emitted for unmatched inner rows, per depth.
    pub right_rows: Vec<u64>,

    /// Accumulated match skew scores, per depth.
    pub dist_scores: Vec<f64>,

    /// True once any task reported a positive skew score.
    pub dist_score_valid: bool,

    /// Inner buffer loads onto the device.
    pub inner_loads: u64,

    /// Accounted bytes transferred by inner buffer loads.
    pub inner_load_bytes: u64,

    /// Tasks replayed on the CPU.
    pub fallback_tasks: u64,

    /// Result rows produced by the CPU fallback.
    pub fallback_rows: u64,
}

impl StatsSnapshot {
    fn new(num_rels: usize) -> Self {
        Self {
            source_tasks: 0,
            source_rows: 0,
            result_rows: 0,
            result_bytes: 0,
            inner_rows: vec![0; num_rels + 1],
            right_rows: vec![0; num_rels + 1],
            dist_scores: vec![0.0; num_rels + 1],
            dist_score_valid: false,
            inner_loads: 0,
            inner_load_bytes: 0,
            fallback_tasks: 0,
            fallback_rows: 0,
        }
    }

    /// Total rows emitted at `depth` so far.
    pub fn emitted(&self, depth: usize) -> u64 {
        self.inner_rows[depth] + self.right_rows[depth]
    }

    /// Mean accounted width of a result row, or `None` before the first
    /// result row.
    pub fn exec_result_width(&self) -> Option<f64> {
        if self.result_rows == 0 {
            None
        } else {
            Some(self.result_bytes as f64 / self.result_rows as f64)
        }
    }
}

/// Mutable runtime statistics of one join execution.
#[derive(Debug)]
pub struct RuntimeStats {
    inner: Mutex<StatsSnapshot>,
}

impl RuntimeStats {
    pub fn new(num_rels: usize) -> Self {
        Self {
            inner: Mutex::new(StatsSnapshot::new(num_rels)),
        }
    }

    /// Merges a completed task's scale vector and result counters.
    pub fn merge_task(&self, scales: &[DepthScale], result_rows: u64, result_bytes: u64) {
        let mut stats = self.inner.lock().expect("Runtime statistics lock poisoned");

        stats.source_tasks += 1;
        stats.source_rows += scales[0].window.consumed() as u64;
        for (depth, scale) in scales.iter().enumerate() {
            stats.inner_rows[depth] += scale.inner_rows;
            stats.right_rows[depth] += scale.right_rows;
            if scale.dist_score > 0.0 {
                stats.dist_scores[depth] += scale.dist_score;
                stats.dist_score_valid = true;
            }
        }
        stats.result_rows += result_rows;
        stats.result_bytes += result_bytes;
    }

    pub fn record_inner_load(&self, bytes: u64) {
        let mut stats = self.inner.lock().expect("Runtime statistics lock poisoned");
        stats.inner_loads += 1;
        stats.inner_load_bytes += bytes;
    }

    pub fn record_fallback(&self, rows: u64) {
        let mut stats = self.inner.lock().expect("Runtime statistics lock poisoned");
        stats.fallback_tasks += 1;
        stats.fallback_rows += rows;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner
            .lock()
            .expect("Runtime statistics lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale::{DepthScale, Window};

    fn scales_with(consumed: usize, inner: &[u64]) -> Vec<DepthScale> {
        inner
            .iter()
            .map(|&rows| DepthScale {
                window: Window {
                    base: 0,
                    size: consumed,
                    origin: 0,
                },
                inner_rows: rows,
                right_rows: 0,
                dist_score: 0.0,
            })
            .collect()
    }

    #[test]
    fn merge_accumulates_counters() {
        let stats = RuntimeStats::new(2);
        stats.merge_task(&scales_with(100, &[90, 50, 25]), 25, 800);
        stats.merge_task(&scales_with(60, &[60, 30, 15]), 15, 480);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.source_tasks, 2);
        assert_eq!(snapshot.source_rows, 160);
        assert_eq!(snapshot.inner_rows, vec![150, 80, 40]);
        assert_eq!(snapshot.result_rows, 40);
        assert_eq!(snapshot.result_bytes, 1280);
    }

    #[test]
    fn dist_score_validity_requires_positive_score() {
        let stats = RuntimeStats::new(1);
        stats.merge_task(&scales_with(10, &[10, 5]), 5, 100);
        assert!(!stats.snapshot().dist_score_valid);

        let mut scales = scales_with(10, &[10, 5]);
        scales[1].dist_score = 1.5;
        stats.merge_task(&scales, 5, 100);

        let snapshot = stats.snapshot();
        assert!(snapshot.dist_score_valid);
        assert!(snapshot.dist_scores[1] > 1.0);
    }

    #[test]
    fn snapshot_is_detached_from_later_merges() {
        let stats = RuntimeStats::new(1);
        stats.merge_task(&scales_with(10, &[10, 10]), 10, 100);
        let snapshot = stats.snapshot();

        stats.merge_task(&scales_with(10, &[10, 10]), 10, 100);
        assert_eq!(snapshot.source_rows, 10);
        assert_eq!(stats.snapshot().source_rows, 20);
    }

    #[test]
    fn exec_width_is_mean_of_result_bytes() {
        let stats = RuntimeStats::new(1);
        assert!(stats.snapshot().exec_result_width().is_none());

        stats.merge_task(&scales_with(10, &[10, 4]), 4, 128);
        let width = stats
            .snapshot()
            .exec_result_width()
            .expect("Width must be available after results");
        assert!((width - 32.0).abs() < f64::EPSILON);
    }
}
