/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2021-2022, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

use super::data_point::DataPoint;
use super::join_bench::MultiwayJoinPoint;
use crate::error::Result;
use std::path::PathBuf;

/// Repeats the benchmark function and writes one CSV record per run.
///
/// The first run is marked as the warm-up run. Relation initialization times
/// are attached to the warm-up record only.
pub fn measure(
    _name: &str,
    repeat: u32,
    out_file_name: Option<PathBuf>,
    template: DataPoint,
    mut func: Box<dyn FnMut() -> Result<MultiwayJoinPoint>>,
) -> Result<()> {
    let measurements = (0..repeat)
        .zip(std::iter::once(true).chain(std::iter::repeat(false)))
        .map(|(_, warm_up)| {
            func().map(|p| DataPoint {
                warm_up: Some(warm_up),
                relation_malloc_ns: if warm_up {
                    template.relation_malloc_ns
                } else {
                    None
                },
                relation_gen_ns: if warm_up {
                    template.relation_gen_ns
                } else {
                    None
                },
                preload_ns: p.preload_ns,
                join_ns: p.join_ns,
                result_rows: p.result_rows,
                result_bytes: p.result_bytes,
                source_tasks: p.source_tasks,
                fallback_tasks: p.fallback_tasks,
                inner_loads: p.inner_loads,
                inner_load_bytes: p.inner_load_bytes,
                device_peak_bytes: p.device_peak_bytes,
                ..template.clone()
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if let Some(ofn) = out_file_name {
        let csv_file = std::fs::File::create(ofn)?;
        let mut csv = csv::Writer::from_writer(csv_file);
        measurements.iter().try_for_each(|row| csv.serialize(row))?;
    }

    Ok(())
}
