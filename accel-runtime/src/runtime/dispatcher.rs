/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

//! A worker pipeline for asynchronous task execution.
//!
//! The pipeline owns a thread pool and a completion channel. Tasks are
//! submitted as closures and run on the pool; their outcomes arrive on the
//! channel in finish order, which generally differs from submission order.
//!
//! The pipeline depth bounds how many tasks may be outstanding. The caller
//! checks `has_capacity` before submitting, and drains completions with
//! `recv` or `try_recv`. Submission and completion handling are meant to be
//! driven from a single coordinating thread, while the task bodies
//! themselves execute concurrently on the pool.

use crate::error::{ErrorKind, Result};
use crate::utils::CachePadded;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};

pub struct TaskPipeline<T> {
    thread_pool: ThreadPool,
    completion_tx: Sender<T>,
    completion_rx: Receiver<T>,
    in_flight: CachePadded<AtomicUsize>,
    pipeline_depth: usize,
}

impl<T: Send + 'static> TaskPipeline<T> {
    /// Creates a pipeline with `threads` workers and room for
    /// `pipeline_depth` outstanding tasks.
    pub fn new(threads: usize, pipeline_depth: usize) -> Result<Self> {
        if threads == 0 || pipeline_depth == 0 {
            Err(ErrorKind::InvalidArgument(
                "Worker threads and pipeline depth must be at least 1".to_string(),
            ))?;
        }

        let thread_pool = ThreadPoolBuilder::new().num_threads(threads).build()?;
        let (completion_tx, completion_rx) = channel();

        Ok(Self {
            thread_pool,
            completion_tx,
            completion_rx,
            in_flight: CachePadded::new(AtomicUsize::new(0)),
            pipeline_depth,
        })
    }

    pub fn pipeline_depth(&self) -> usize {
        self.pipeline_depth
    }

    /// Number of submitted tasks without a received completion.
    pub fn in_flight(&self) -> usize {
        self.in_flight.value.load(Ordering::SeqCst)
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight() < self.pipeline_depth
    }

    /// Schedules a task on the worker pool.
    ///
    /// The task's return value is delivered through `recv`/`try_recv`.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.in_flight.value.fetch_add(1, Ordering::SeqCst);

        let tx = self.completion_tx.clone();
        self.thread_pool.spawn(move || {
            let outcome = task();
            // The receiver lives as long as the pipeline; a send failure
            // means the pipeline was dropped and the outcome is moot.
            let _ = tx.send(outcome);
        });
    }

    /// Waits for the next task completion.
    pub fn recv(&self) -> Result<T> {
        if self.in_flight() == 0 {
            Err(ErrorKind::LogicError(
                "Tried to receive from an empty pipeline".to_string(),
            ))?;
        }

        let outcome = self.completion_rx.recv().map_err(|_| {
            ErrorKind::RuntimeError("Worker pipeline disconnected".to_string())
        })?;
        self.in_flight.value.fetch_sub(1, Ordering::SeqCst);

        Ok(outcome)
    }

    /// Receives a task completion if one is ready.
    pub fn try_recv(&self) -> Option<T> {
        self.completion_rx.try_recv().ok().map(|outcome| {
            self.in_flight.value.fetch_sub(1, Ordering::SeqCst);
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_arrive_for_all_submissions() -> Result<()> {
        let pipeline = TaskPipeline::new(2, 4)?;

        for i in 0..4_usize {
            pipeline.submit(move || i * i);
        }
        assert!(!pipeline.has_capacity());

        let mut outcomes = (0..4)
            .map(|_| pipeline.recv())
            .collect::<Result<Vec<_>>>()?;
        outcomes.sort();

        assert_eq!(outcomes, vec![0, 1, 4, 9]);
        assert_eq!(pipeline.in_flight(), 0);

        Ok(())
    }

    #[test]
    fn recv_on_empty_pipeline_fails() -> Result<()> {
        let pipeline: TaskPipeline<()> = TaskPipeline::new(1, 1)?;
        assert!(pipeline.recv().is_err());

        Ok(())
    }

    #[test]
    fn zero_threads_is_invalid() {
        assert!(TaskPipeline::<()>::new(0, 1).is_err());
        assert!(TaskPipeline::<()>::new(1, 0).is_err());
    }
}
