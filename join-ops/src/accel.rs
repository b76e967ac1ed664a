/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! The accelerator seam.
//!
//! The scheduler drives join tasks through the [`Accelerator`] trait and
//! never touches a device API directly. [`software::SoftwareDevice`] is the
//! in-process implementation; it evaluates tasks with the same windowed
//! semantics, budget checks, and match bitmap protocol a device kernel
//! follows.

pub mod software;

use crate::error::Result;
use crate::inner_buffer::InnerBuffer;
use crate::plan::JoinValue;
use crate::task::{JoinTask, ResultChunk};

/// How a task run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// The task ran to completion. Its depth-0 window covers exactly the
    /// consumed outer rows.
    Success,
    /// A predicate requires host-side evaluation. No rows were emitted and
    /// no state was changed; the caller replays the task on the CPU.
    Recheck,
}

/// Output of one task run.
#[derive(Debug)]
pub struct RunOutput<T> {
    pub status: RunStatus,
    pub results: ResultChunk<T>,
}

/// A device that evaluates join tasks.
///
/// Staging and colocation calls pair with the reference counting in
/// [`InnerBuffer`]: the buffer decides when to load, the accelerator moves
/// the bytes.
pub trait Accelerator<T: JoinValue>: Send + Sync {
    /// Copies the buffer's chunks into device memory.
    fn stage_inner(&self, buffer: &InnerBuffer<T>) -> Result<()>;

    /// Drops the device copy of the buffer's chunks.
    fn unstage_inner(&self, buffer: &InnerBuffer<T>);

    /// OR-merges the device match bits into the host bitmap.
    fn colocate_match_bits_to_host(&self, buffer: &InnerBuffer<T>) -> Result<()>;

    /// OR-merges the host match bits into the device bitmap.
    fn colocate_match_bits_to_device(&self, buffer: &InnerBuffer<T>) -> Result<()>;

    /// Runs one task.
    ///
    /// On success the task's scale vector carries the per-depth row counts
    /// and the possibly reduced depth-0 window. A task that overflows its
    /// budget consumes a row prefix and reports success; the scheduler
    /// issues continuations for the remainder.
    fn run(&self, task: &mut JoinTask<T>) -> Result<RunOutput<T>>;
}
