/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! The join task scheduler.
//!
//! [`JoinExecutor`] drives a multi-way join to completion: it pulls chunks
//! from the outer relation, sizes their execution windows, and runs the
//! resulting tasks on the accelerator through a worker pipeline. Tasks that
//! leave window rows unconsumed spawn continuation tasks, null-extending
//! depths end each chunk combination with an unmatched-inner sweep, and
//! tasks that touch a predicate the accelerator cannot evaluate are
//! replayed on the CPU.
//!
//! Inner relations that were split into several chunks are joined one chunk
//! combination at a time, iterating like an odometer with the deepest
//! relation as the least significant digit. The outer relation is rescanned
//! for every combination. Combinations run strictly one after another, and
//! the unmatched-inner sweep of a depth is held back until every shallower
//! depth stands on its final chunk, at which point the depth's shared match
//! map has seen all probes that can reach it.

use crate::accel::{Accelerator, RunOutput, RunStatus};
use crate::chunk::row_cost;
use crate::config::ExecConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::estimator::{Estimator, SizeOutcome, MAX_SIZING_ROUNDS};
use crate::fallback::FallbackScan;
use crate::inner_buffer::{
    DepthFlags, DetachOutcome, DeviceGetOutcome, InnerBuffer, MatchMap,
};
use crate::outer::{OuterChunk, OuterSource};
use crate::plan::{JoinPlan, JoinValue};
use crate::preload::{preload_inner, InnerSource, PreloadedInner};
use crate::scale::{full_scales, DepthScale};
use crate::stats::{RuntimeStats, StatsSnapshot};
use crate::task::{
    continuation_windows, residual_continuation_windows, JoinTask, ResultChunk, ResultRow,
    TaskBudget,
};
use accel_runtime::runtime::dispatcher::TaskPipeline;
use accel_runtime::runtime::memory::DeviceArena;
use log::debug;
use std::collections::VecDeque;
use std::sync::Arc;

/// Progress of the current inner chunk combination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ComboPhase {
    /// No combination is active; the next task advances the odometer.
    Idle,
    /// The outer relation is being scanned against the current combination.
    Scanning,
    /// The outer scan ended; tasks of this combination are still running.
    Draining,
}

/// Outcome of one worker execution, delivered through the pipeline.
enum WorkerVerdict<T: JoinValue> {
    /// The device ran the task.
    Done {
        task: JoinTask<T>,
        output: RunOutput<T>,
    },
    /// Device memory was occupied by other holders; the task retries after
    /// a completion frees it.
    DeviceBusy(JoinTask<T>),
    /// The worker failed and the join aborts.
    Failed(Error),
}

/// Chunking and row figures of one inner relation depth.
#[derive(Clone, Copy, Debug)]
pub struct DepthDiagnostics {
    /// Chunk count the planner predicted.
    pub planned_batches: usize,
    /// Chunk count the preloader produced.
    pub exec_batches: usize,
    /// Rows emitted by normal matching at this depth.
    pub inner_rows: u64,
    /// Rows emitted for unmatched inner rows at this depth.
    pub right_rows: u64,
}

/// Execution figures of a join, combining the runtime statistics with the
/// per-depth chunking figures.
#[derive(Clone, Debug)]
pub struct Diagnostics {
    pub snapshot: StatsSnapshot,
    pub depths: Vec<DepthDiagnostics>,
    /// High-water mark of reserved device memory in bytes.
    pub device_peak_bytes: usize,
}

/// Executes a multi-way join plan against an accelerator.
///
/// The executor is a pull-based pump: [`next_results`](Self::next_results)
/// returns result chunks until the join is exhausted. Internally it keeps
/// up to `pipeline_depth` tasks in flight and handles their completions in
/// finish order.
pub struct JoinExecutor<T: JoinValue> {
    config: ExecConfig,
    plan: Arc<JoinPlan<T>>,
    accel: Arc<dyn Accelerator<T>>,
    arena: DeviceArena,
    stats: Arc<RuntimeStats>,
    pipeline: TaskPipeline<WorkerVerdict<T>>,
    outer: Box<dyn OuterSource<T>>,
    inner_sources: Vec<Box<dyn InnerSource<T>>>,
    preloaded: PreloadedInner<T>,
    /// Match maps keyed by depth and chunk index, shared by all chunk
    /// combinations that include the chunk.
    match_maps: Vec<Vec<Option<Arc<MatchMap>>>>,
    /// Odometer over the per-depth chunk lists.
    combo_indices: Vec<usize>,
    combo_started: bool,
    combos_built: usize,
    phase: ComboPhase,
    current: Option<Arc<InnerBuffer<T>>>,
    /// Tasks bounced by device memory pressure.
    retry: VecDeque<JoinTask<T>>,
    ready: VecDeque<ResultChunk<T>>,
    seq: u64,
    finished: bool,
}

impl<T: JoinValue> JoinExecutor<T> {
    /// Validates the plan against the configuration, ingests the inner
    /// relations, and prepares the worker pipeline.
    pub fn new(
        config: ExecConfig,
        plan: Arc<JoinPlan<T>>,
        accel: Arc<dyn Accelerator<T>>,
        outer: Box<dyn OuterSource<T>>,
        mut inner_sources: Vec<Box<dyn InnerSource<T>>>,
    ) -> Result<Self> {
        config.validate()?;
        plan.validate()?;
        for (index, spec) in plan.depths.iter().enumerate() {
            if spec.strategy.is_hash() && !config.enable_hash_join {
                Err(ErrorKind::InvalidArgument(format!(
                    "Depth {} is a hash join, but hash joins are disabled",
                    index + 1
                )))?;
            }
            if !spec.strategy.is_hash() && !config.enable_nested_loop {
                Err(ErrorKind::InvalidArgument(format!(
                    "Depth {} is a nested loop join, but nested loops are disabled",
                    index + 1
                )))?;
            }
        }

        let num_rels = plan.num_rels();
        let preloaded = preload_inner(&config, &plan, &mut inner_sources)?;
        let match_maps = build_match_maps(&preloaded);
        let pipeline = TaskPipeline::new(config.worker_threads, config.pipeline_depth)?;
        let arena = DeviceArena::new(config.max_device_allocation);
        let finished = preloaded.empty_shortcircuit;
        if finished {
            debug!("an empty inner relation proves the join result empty");
        }

        Ok(Self {
            config,
            plan,
            accel,
            arena,
            stats: Arc::new(RuntimeStats::new(num_rels)),
            pipeline,
            outer,
            inner_sources,
            preloaded,
            match_maps,
            combo_indices: vec![0; num_rels],
            combo_started: false,
            combos_built: 0,
            phase: ComboPhase::Idle,
            current: None,
            retry: VecDeque::new(),
            ready: VecDeque::new(),
            seq: 0,
            finished,
        })
    }

    /// Returns the next batch of result rows, or `None` when the join is
    /// exhausted.
    ///
    /// Batches arrive in task finish order, which is not the outer relation
    /// order.
    pub fn next_results(&mut self) -> Result<Option<ResultChunk<T>>> {
        loop {
            if let Some(results) = self.ready.pop_front() {
                return Ok(Some(results));
            }

            while self.pipeline.has_capacity() {
                match self.next_task()? {
                    Some(task) => self.dispatch(task),
                    None => break,
                }
            }
            if !self.ready.is_empty() {
                // A task was replayed inline and produced rows.
                continue;
            }
            if self.pipeline.in_flight() == 0 {
                return Ok(None);
            }

            let verdict = self.pipeline.recv()?;
            self.ready_task(verdict)?;
        }
    }

    /// Runs the join to completion and returns all result rows.
    pub fn collect_rows(&mut self) -> Result<Vec<ResultRow<T>>> {
        let mut rows = Vec::new();
        while let Some(results) = self.next_results()? {
            rows.extend(results.into_rows());
        }
        Ok(rows)
    }

    /// Restarts the join from the first outer row.
    ///
    /// Outstanding tasks are drained and their results discarded. With
    /// `invalidate_inner`, the inner relations are read again and
    /// re-chunked; otherwise the preloaded chunks are reused. The match
    /// maps restart empty either way, because a rescan may produce
    /// different outer rows.
    pub fn rescan(&mut self, invalidate_inner: bool) -> Result<()> {
        while self.pipeline.in_flight() > 0 {
            match self.pipeline.recv()? {
                WorkerVerdict::Done { task, .. } | WorkerVerdict::DeviceBusy(task) => {
                    task.buffer.detach(false);
                }
                WorkerVerdict::Failed(e) => return Err(e),
            }
        }
        for task in self.retry.drain(..) {
            task.buffer.detach(false);
        }
        self.ready.clear();
        if self.phase == ComboPhase::Scanning {
            self.current_buffer().detach(false);
        }
        self.current = None;
        self.phase = ComboPhase::Idle;
        self.combo_started = false;
        for index in self.combo_indices.iter_mut() {
            *index = 0;
        }
        self.outer.rescan()?;

        if invalidate_inner {
            for source in self.inner_sources.iter_mut() {
                source.rescan()?;
            }
            self.preloaded = preload_inner(&self.config, &self.plan, &mut self.inner_sources)?;
        }
        self.match_maps = build_match_maps(&self.preloaded);
        self.finished = self.preloaded.empty_shortcircuit;
        Ok(())
    }

    /// Per-depth execution figures of the join so far.
    pub fn diagnostics(&self) -> Diagnostics {
        let snapshot = self.stats.snapshot();
        let depths = self
            .preloaded
            .depths
            .iter()
            .enumerate()
            .map(|(index, depth)| DepthDiagnostics {
                planned_batches: depth.planned_batches,
                exec_batches: depth.chunks.len(),
                inner_rows: snapshot.inner_rows[index + 1],
                right_rows: snapshot.right_rows[index + 1],
            })
            .collect();
        Diagnostics {
            snapshot,
            depths,
            device_peak_bytes: self.arena.peak(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn current_buffer(&self) -> Arc<InnerBuffer<T>> {
        let buffer = self
            .current
            .as_ref()
            .expect("Scan phase without an inner chunk combination");
        Arc::clone(buffer)
    }

    /// Produces the next dispatchable task, advancing the outer scan and
    /// the combination odometer as needed.
    fn next_task(&mut self) -> Result<Option<JoinTask<T>>> {
        if let Some(task) = self.retry.pop_front() {
            return Ok(Some(task));
        }

        loop {
            match self.phase {
                ComboPhase::Idle => {
                    if self.finished || !self.advance_combo()? {
                        self.finished = true;
                        return Ok(None);
                    }
                }
                ComboPhase::Scanning => {
                    let max_rows = (self.config.chunk_size / row_cost::<T>()).max(1);
                    if let Some(outer) = self.outer.next_chunk(max_rows)? {
                        return Ok(Some(self.outer_task(outer)?));
                    }
                    self.finish_scan()?;
                }
                ComboPhase::Draining => return Ok(None),
            }
        }
    }

    /// Moves the odometer to the next inner chunk combination and snapshots
    /// it into a fresh buffer. Returns `false` when all combinations were
    /// visited.
    fn advance_combo(&mut self) -> Result<bool> {
        let num_rels = self.plan.num_rels();
        if self.combo_started {
            let mut advanced = false;
            for index in (0..num_rels).rev() {
                if self.combo_indices[index] + 1 < self.preloaded.depths[index].chunks.len() {
                    self.combo_indices[index] += 1;
                    for deeper in self.combo_indices[index + 1..].iter_mut() {
                        *deeper = 0;
                    }
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                return Ok(false);
            }
            self.outer.rescan()?;
        }
        self.combo_started = true;

        let depths: Vec<_> = self
            .preloaded
            .depths
            .iter()
            .zip(self.combo_indices.iter())
            .map(|(depth, &index)| (Arc::clone(&depth.chunks[index]), depth.flags))
            .collect();
        let maps: Vec<_> = self
            .match_maps
            .iter()
            .zip(self.combo_indices.iter())
            .map(|(chunks, &index)| chunks[index].clone())
            .collect();
        let mut buffer = InnerBuffer::with_match_maps(self.combos_built, depths, maps);
        self.combos_built += 1;

        // A depth is swept only once every shallower depth sits on its
        // final chunk; until then its shared map still gains matches from
        // combinations yet to come.
        let mut shallower_final = true;
        for depth in 1..=num_rels {
            if !shallower_final && buffer.depth_flags(depth).contains(DepthFlags::FILLS_RIGHT) {
                buffer.defer_sweep(depth);
            }
            shallower_final &= self.combo_indices[depth - 1] + 1
                == self.preloaded.depths[depth - 1].chunks.len();
        }

        debug!("scanning inner chunk combination {:?}", self.combo_indices);
        self.current = Some(Arc::new(buffer));
        self.phase = ComboPhase::Scanning;
        Ok(true)
    }

    /// Builds a task joining one outer chunk against the current
    /// combination.
    fn outer_task(&mut self, outer: OuterChunk<T>) -> Result<JoinTask<T>> {
        let buffer = self.current_buffer();
        let mut counts = vec![outer.len()];
        for depth in 1..=buffer.num_rels() {
            counts.push(buffer.item_count(depth));
        }
        let mut scales = full_scales(&counts);
        let budget = self.size_windows(&mut scales, &counts, true, None)?;

        buffer.attach();
        Ok(JoinTask {
            seq: self.next_seq(),
            outer: Some(outer),
            scales,
            buffer,
            budget,
        })
    }

    /// Ends the outer scan of the current combination and releases the
    /// scheduler's buffer attachment.
    fn finish_scan(&mut self) -> Result<()> {
        let buffer = self.current_buffer();
        self.phase = ComboPhase::Draining;
        match buffer.detach(true) {
            DetachOutcome::Alive => Ok(()),
            DetachOutcome::ResidualNeeded => self.spawn_residual(buffer),
            DetachOutcome::Destroyed => {
                self.phase = ComboPhase::Idle;
                self.current = None;
                Ok(())
            }
        }
    }

    /// Narrows the candidate windows until the estimator grants buffers
    /// within the chunk limits.
    fn size_windows(
        &self,
        scales: &mut [DepthScale],
        item_counts: &[usize],
        has_outer: bool,
        prev: Option<&[DepthScale]>,
    ) -> Result<TaskBudget> {
        let estimator = Estimator::new(&self.config, &self.plan);
        let snapshot = self.stats.snapshot();

        for _ in 0..MAX_SIZING_ROUNDS {
            match estimator.size_task(&snapshot, scales, item_counts, has_outer, prev) {
                SizeOutcome::Accepted(budget) => return Ok(budget),
                SizeOutcome::Shrink { depth, size } => {
                    debug!("narrowing the depth {} window to {} rows", depth, size);
                    scales[depth].window.size = size;
                }
                SizeOutcome::Reject(reason) => Err(ErrorKind::EstimationOverflow(reason))?,
            }
        }
        Err(ErrorKind::EstimationOverflow(
            "Window sizing did not converge within the round limit".to_string(),
        )
        .into())
    }

    /// Submits a task to the worker pipeline.
    fn dispatch(&self, mut task: JoinTask<T>) {
        let accel = Arc::clone(&self.accel);
        let arena = self.arena.clone();
        let stats = Arc::clone(&self.stats);

        self.pipeline.submit(move || {
            let buffer = Arc::clone(&task.buffer);
            match buffer.device_get(&arena, accel.as_ref(), &stats) {
                Ok(DeviceGetOutcome::Ready) => (),
                Ok(DeviceGetOutcome::Busy) => return WorkerVerdict::DeviceBusy(task),
                Err(e) => return WorkerVerdict::Failed(e),
            }

            // CPU-replayed tasks record matches in the host bitmap only;
            // the device bitmap must hold the union before the run.
            let outcome = if buffer.has_match_bits() {
                accel.colocate_match_bits_to_device(&buffer)
            } else {
                Ok(())
            }
            .and_then(|()| accel.run(&mut task));
            buffer.device_put(accel.as_ref());

            match outcome {
                Ok(output) => WorkerVerdict::Done { task, output },
                Err(e) => WorkerVerdict::Failed(e),
            }
        });
    }

    /// Handles one worker completion.
    fn ready_task(&mut self, verdict: WorkerVerdict<T>) -> Result<()> {
        match verdict {
            WorkerVerdict::Failed(e) => Err(e),
            WorkerVerdict::DeviceBusy(task) => {
                if self.pipeline.in_flight() == 0 {
                    // Nothing in flight can release device memory anymore;
                    // retry only if the buffer fits into what is free now.
                    let free = self.arena.capacity() - self.arena.used();
                    let needed = task.buffer.device_bytes_needed();
                    if needed > free {
                        Err(ErrorKind::RuntimeError(format!(
                            "Inner relation chunks of {} bytes exceed the free \
                             device memory of {} bytes",
                            needed, free
                        )))?;
                    }
                }
                debug!("task {} waits for device memory", task.seq);
                self.retry.push_back(task);
                Ok(())
            }
            WorkerVerdict::Done { task, output } => match output.status {
                RunStatus::Recheck => self.replay_on_host(task),
                RunStatus::Success => {
                    self.stats.merge_task(
                        &task.scales,
                        output.results.len() as u64,
                        output.results.used_bytes() as u64,
                    );
                    if !output.results.is_empty() {
                        self.ready.push_back(output.results);
                    }
                    self.advance_task(task)
                }
            },
        }
    }

    /// Retires a merged task: spawns its continuation if windows remain,
    /// otherwise releases its attachment and reacts to the outcome.
    fn advance_task(&mut self, mut task: JoinTask<T>) -> Result<()> {
        let mut counts = Vec::with_capacity(task.scales.len());
        for depth in 0..task.scales.len() {
            counts.push(task.item_count(depth));
        }

        let windows = if task.is_residual() {
            let flags: Vec<DepthFlags> = (1..=task.buffer.num_rels())
                .map(|depth| task.buffer.depth_flags(depth))
                .collect();
            residual_continuation_windows(&task.scales, &counts, &flags)
        } else {
            continuation_windows(&task.scales, &counts)
        };

        if let Some(windows) = windows {
            let mut scales: Vec<DepthScale> =
                windows.into_iter().map(DepthScale::with_window).collect();
            let has_outer = task.outer.is_some();
            let budget = self.size_windows(&mut scales, &counts, has_outer, Some(&task.scales))?;

            // The continuation holds its own attachment before the
            // finished task releases one.
            task.buffer.attach();
            let next = JoinTask {
                seq: self.next_seq(),
                outer: task.outer.take(),
                scales,
                buffer: Arc::clone(&task.buffer),
                budget,
            };
            task.buffer.detach(false);
            self.dispatch(next);
            return Ok(());
        }

        match task.buffer.detach(true) {
            DetachOutcome::Alive => Ok(()),
            DetachOutcome::ResidualNeeded => {
                let buffer = Arc::clone(&task.buffer);
                self.spawn_residual(buffer)
            }
            DetachOutcome::Destroyed => {
                debug_assert_eq!(self.phase, ComboPhase::Draining);
                self.phase = ComboPhase::Idle;
                self.current = None;
                Ok(())
            }
        }
    }

    /// Builds the unmatched-inner sweep task of the current combination.
    /// The caller's buffer attachment transfers to the sweep.
    fn spawn_residual(&mut self, buffer: Arc<InnerBuffer<T>>) -> Result<()> {
        let mut counts = vec![0];
        for depth in 1..=buffer.num_rels() {
            counts.push(buffer.item_count(depth));
        }
        let mut scales = full_scales(&counts);
        let budget = self.size_windows(&mut scales, &counts, false, None)?;
        let task = JoinTask {
            seq: self.next_seq(),
            outer: None,
            scales,
            buffer,
            budget,
        };
        debug!("task {} sweeps the unmatched inner rows", task.seq);

        if task.buffer.fallback_seen() {
            // CPU-replayed tasks recorded matches the device never saw;
            // the sweep reads the union from the host bitmap in one pass.
            self.replay_on_host(task)
        } else {
            self.dispatch(task);
            Ok(())
        }
    }

    /// Replays a task on the CPU and merges its results.
    fn replay_on_host(&mut self, mut task: JoinTask<T>) -> Result<()> {
        if !self.config.cpu_fallback {
            Err(ErrorKind::RuntimeError(
                "A predicate requires CPU evaluation, but the CPU fallback is disabled"
                    .to_string(),
            ))?;
        }
        task.buffer.mark_fallback();
        if task.is_residual() {
            if task.buffer.has_match_bits() {
                self.accel.colocate_match_bits_to_host(&task.buffer)?;
            }
            task.extend_inner_windows();
        }

        let results = FallbackScan::new(&self.plan).replay(&mut task);
        debug!("task {} replayed on the CPU: {} rows", task.seq, results.len());
        self.stats.record_fallback(results.len() as u64);
        self.stats
            .merge_task(&task.scales, results.len() as u64, results.used_bytes() as u64);
        if !results.is_empty() {
            self.ready.push_back(results);
        }
        self.advance_task(task)
    }
}

/// One match map per RIGHT/FULL depth and chunk, shared by every chunk
/// combination that includes the chunk.
fn build_match_maps<T: JoinValue>(
    preloaded: &PreloadedInner<T>,
) -> Vec<Vec<Option<Arc<MatchMap>>>> {
    preloaded
        .depths
        .iter()
        .map(|depth| {
            depth
                .chunks
                .iter()
                .map(|chunk| {
                    if depth.flags.contains(DepthFlags::FILLS_RIGHT) {
                        Some(Arc::new(MatchMap::new(chunk.len())))
                    } else {
                        None
                    }
                })
                .collect()
        })
        .collect()
}
