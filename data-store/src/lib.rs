/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019-2021, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

//! # Data stores for SQL operators
//!
//! `data-store` materializes the relations of a join query in memory. The
//! relations are either synthesized with a data generator or loaded from
//! delimited text files.

pub mod error;
pub mod join_data;
