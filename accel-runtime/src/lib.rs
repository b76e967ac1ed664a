// Copyright 2018-2022 Clemens Lutz
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

//! # The accelerator runtime library
//!
//! `accel-runtime` provides the runtime services that accelerator-offloaded
//! query operators are built on:
//!
//! - Device memory accounting with retry-aware reservations
//! - A worker pipeline that executes tasks concurrently and hands back
//!   completions in finish order
//! - One-shot events for single-producer, multi-consumer load barriers
//!
//! The library is device-agnostic. Operators describe their device work
//! against these services, and a device backend maps reservations and task
//! executions onto the actual hardware.

pub mod error;
pub mod runtime;
pub mod utils;
