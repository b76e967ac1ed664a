/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019 German Research Center for Artificial Intelligence (DFKI)
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

//! # The relation generator library
//!
//! `datagen` generates synthetic database relations for join benchmarks and
//! tests. Key attributes can be generated with a uniform or Zipf
//! distribution, with foreign-key relationships, and with NULL values for
//! outer join workloads.

pub mod error;
pub mod relation;
