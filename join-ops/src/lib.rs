// Copyright 2019-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # The Accelerated Join Operator Library
//!
//! `join-ops` evaluates multi-way relational joins on a memory-constrained
//! accelerator. It includes:
//!
//! - Inner relation preloading into chunked hash tables and heaps
//! - A feedback-driven size estimator that narrows execution windows
//! - A reference-counted inner relation buffer shared by concurrent tasks
//! - A task scheduler with accelerator offload and a CPU fallback path
//!
//! The unit of work is a join task: one chunk of the outer relation joined
//! against a window into every inner relation. A task that would overrun its
//! result buffers is narrowed by the estimator and finished by continuation
//! tasks. A task that touches an expression the accelerator cannot evaluate
//! is replayed row-by-row on the CPU.
//!
//! # Tuning parameters
//!
//! Buffer sizing works on accounted bytes rather than allocator bytes, so
//! that the estimator, the preloader, and the device memory arena agree on
//! sizes independently of the host allocator. The accounting constants are
//! exported below.
//!
//! ## Chunk head bytes
//!
//! `CHUNK_HEAD_BYTES` is the fixed header cost accounted for every relation
//! chunk and result buffer.
//!
//! ## Tuple overhead bytes
//!
//! `TUPLE_OVERHEAD_BYTES` is the per-tuple cost accounted on top of the
//! column data, covering the tuple header and the row directory entry.
//!
//! ## Result head and index entry bytes
//!
//! `RESULT_HEAD_BYTES` and `INDEX_ENTRY_BYTES` describe the intermediate
//! index buffers that hold composite rows between join depths. A composite
//! row at depth `d` occupies `d + 1` index entries.
//!
//! ## Hash histogram
//!
//! The preloader summarizes the hash distribution of each inner relation in
//! a histogram of `HASH_HISTOGRAM_BUCKETS` buckets, indexed by the upper
//! hash bits (`hash >> HASH_HISTOGRAM_SHIFT`). The histogram drives the
//! hash-range partitioning of relations that exceed their chunk limit.

pub mod accel;
pub mod chunk;
pub mod config;
pub mod error;
pub mod estimator;
pub mod fallback;
pub mod inner_buffer;
pub mod outer;
pub mod plan;
pub mod preload;
pub mod scale;
pub mod scheduler;
pub mod stats;
pub mod task;

/// Accounted header size of a relation chunk in bytes.
pub const CHUNK_HEAD_BYTES: usize = 96;

/// Accounted per-tuple overhead in bytes.
pub const TUPLE_OVERHEAD_BYTES: usize = 24;

/// Accounted header size of an intermediate result index buffer in bytes.
pub const RESULT_HEAD_BYTES: usize = 64;

/// Accounted size of one result index entry in bytes.
pub const INDEX_ENTRY_BYTES: usize = 4;

/// Number of buckets in the preloader's hash histogram.
pub const HASH_HISTOGRAM_BUCKETS: usize = 1024;

/// Right shift that maps a 32-bit hash to its histogram bucket.
pub const HASH_HISTOGRAM_SHIFT: u32 = 22;

/// Upper bound on the number of inner relations in a join plan.
pub const MAX_JOIN_DEPTH: usize = 8;
