/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Execution configuration.

use crate::error::{ErrorKind, Result};

/// Accounted bytes reserved per inner relation for chunk headers and the
/// match bitmap when computing the preload budget.
pub const PRELOAD_HEADROOM_BYTES: usize = 8192;

/// Tunable execution parameters of a join.
///
/// Sizes are accounted bytes, not allocator bytes. `chunk_size` is the
/// granularity that relation chunks and intermediate buffers are sized
/// towards; `chunk_size_limit` caps a single result buffer.
#[derive(Clone, Debug)]
pub struct ExecConfig {
    /// Nominal accounted size of one buffer chunk in bytes.
    pub chunk_size: usize,

    /// Upper bound on the accounted size of one result buffer in bytes.
    pub chunk_size_limit: usize,

    /// Safety factor applied to estimated row counts.
    pub chunk_size_margin: f64,

    /// Capacity of the device memory arena in bytes.
    pub max_device_allocation: usize,

    /// Number of join tasks kept in flight.
    pub pipeline_depth: usize,

    /// Number of worker threads executing tasks.
    pub worker_threads: usize,

    /// Permit nested loop depths.
    pub enable_nested_loop: bool,

    /// Permit hash join depths.
    pub enable_hash_join: bool,

    /// Replay recheck-failed tasks on the CPU instead of aborting.
    pub cpu_fallback: bool,

    /// Shuffle inner relation rows before chunking to spread skewed inputs
    /// over chunks.
    pub shuffle_inner: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1 << 20,
            chunk_size_limit: 4 << 20,
            chunk_size_margin: 1.25,
            max_device_allocation: 64 << 20,
            pipeline_depth: 4,
            worker_threads: 2,
            enable_nested_loop: true,
            enable_hash_join: true,
            cpu_fallback: true,
            shuffle_inner: false,
        }
    }
}

impl ExecConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size < 4096 {
            Err(ErrorKind::InvalidArgument(
                "Chunk size must be at least 4 KiB".to_string(),
            ))?;
        }
        if self.chunk_size_limit < self.chunk_size {
            Err(ErrorKind::InvalidArgument(
                "Chunk size limit must not be smaller than the chunk size".to_string(),
            ))?;
        }
        if self.chunk_size_margin < 1.0 {
            Err(ErrorKind::InvalidArgument(
                "Chunk size margin must be at least 1.0".to_string(),
            ))?;
        }
        if self.max_device_allocation < 2 * self.chunk_size {
            Err(ErrorKind::InvalidArgument(
                "Device allocation cap must hold at least two chunks".to_string(),
            ))?;
        }
        if self.pipeline_depth == 0 {
            Err(ErrorKind::InvalidArgument(
                "Pipeline depth must be at least 1".to_string(),
            ))?;
        }
        if self.worker_threads == 0 {
            Err(ErrorKind::InvalidArgument(
                "Worker thread count must be at least 1".to_string(),
            ))?;
        }
        if !self.enable_nested_loop && !self.enable_hash_join {
            Err(ErrorKind::InvalidArgument(
                "All join strategies are disabled".to_string(),
            ))?;
        }
        Ok(())
    }

    /// Accounted byte budget for preloading all inner relations.
    ///
    /// Half the device arena is left free for result buffers and the match
    /// bitmap staging areas of concurrent tasks.
    pub fn inner_buffer_budget(&self, num_rels: usize) -> usize {
        (self.max_device_allocation / 2).saturating_sub(num_rels * PRELOAD_HEADROOM_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ExecConfig::default()
            .validate()
            .expect("Default configuration must validate");
    }

    #[test]
    fn undersized_margin_is_rejected() {
        let config = ExecConfig {
            chunk_size_margin: 0.5,
            ..ExecConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn limit_below_chunk_size_is_rejected() {
        let config = ExecConfig {
            chunk_size: 1 << 20,
            chunk_size_limit: 1 << 19,
            ..ExecConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn preload_budget_reserves_headroom() {
        let config = ExecConfig {
            max_device_allocation: 1 << 20,
            ..ExecConfig::default()
        };
        let budget = config.inner_buffer_budget(4);
        assert_eq!(budget, (1 << 19) - 4 * PRELOAD_HEADROOM_BYTES);
    }
}
