/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2021-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

use crate::error::Result;
use crate::types::*;
use data_store::join_data::MultiwayJoinData;
use join_ops::config::ExecConfig;
use serde::Serializer;
use serde_derive::Serialize;
use std::mem::size_of;
use std::string::ToString;
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize)]
pub struct DataPoint {
    pub data_set: Option<String>,
    pub hostname: String,
    pub plan_shape: Option<ArgPlanShape>,
    #[serde(serialize_with = "serialize_vec")]
    pub join_types: Option<Vec<ArgJoinType>>,
    pub threads: Option<usize>,
    pub pipeline_depth: Option<usize>,
    pub chunk_bytes: Option<usize>,
    pub chunk_limit_bytes: Option<usize>,
    pub device_mem_bytes: Option<usize>,
    pub cpu_fallback: Option<bool>,
    pub shuffle_inner: Option<bool>,
    pub tuple_bytes: Option<ArgTupleBytes>,
    pub outer_tuples: Option<usize>,
    pub outer_bytes: Option<usize>,
    #[serde(serialize_with = "serialize_vec")]
    pub inner_tuples: Option<Vec<usize>>,
    pub inner_bytes: Option<usize>,
    pub data_distribution: Option<ArgDataDistribution>,
    pub zipf_exponent: Option<f64>,
    pub join_selectivity: Option<f64>,
    pub null_key_fraction: Option<f64>,
    pub warm_up: Option<bool>,
    pub result_rows: Option<u64>,
    pub result_bytes: Option<u64>,
    pub source_tasks: Option<u64>,
    pub fallback_tasks: Option<u64>,
    pub inner_loads: Option<u64>,
    pub inner_load_bytes: Option<u64>,
    pub device_peak_bytes: Option<usize>,
    pub preload_ns: Option<f64>,
    pub join_ns: Option<f64>,
    pub relation_malloc_ns: Option<f64>,
    pub relation_gen_ns: Option<f64>,
}

impl DataPoint {
    pub fn new() -> Result<DataPoint> {
        let hostname = hostname::get_hostname().ok_or_else(|| "Couldn't get hostname")?;

        let dp = DataPoint {
            hostname,
            ..DataPoint::default()
        };

        Ok(dp)
    }

    pub fn fill_from_exec_config(&self, config: &ExecConfig) -> DataPoint {
        DataPoint {
            threads: Some(config.worker_threads),
            pipeline_depth: Some(config.pipeline_depth),
            chunk_bytes: Some(config.chunk_size),
            chunk_limit_bytes: Some(config.chunk_size_limit),
            device_mem_bytes: Some(config.max_device_allocation),
            cpu_fallback: Some(config.cpu_fallback),
            shuffle_inner: Some(config.shuffle_inner),
            ..self.clone()
        }
    }

    pub fn fill_from_join_data<T>(&self, join_data: &MultiwayJoinData<T>) -> DataPoint {
        DataPoint {
            outer_tuples: Some(join_data.outer.key.len()),
            outer_bytes: Some(
                (join_data.outer.key.len() + join_data.outer.payload.len()) * size_of::<T>(),
            ),
            inner_tuples: Some(
                join_data
                    .inners
                    .iter()
                    .map(|relation| relation.key.len())
                    .collect(),
            ),
            inner_bytes: Some(
                join_data
                    .inners
                    .iter()
                    .map(|relation| (relation.key.len() + relation.payload.len()) * size_of::<T>())
                    .sum(),
            ),
            ..self.clone()
        }
    }

    pub fn set_init_time(&self, malloc: Duration, data_gen: Duration) -> DataPoint {
        DataPoint {
            relation_malloc_ns: Some(malloc.as_nanos() as f64),
            relation_gen_ns: Some(data_gen.as_nanos() as f64),
            ..self.clone()
        }
    }
}

/// Serialize `Option<Vec<T>>` by converting it into a `String`.
///
/// This is necessary because the `csv` crate does not support nesting `Vec`
/// instead of flattening it.
fn serialize_vec<S, T>(option: &Option<Vec<T>>, ser: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
    T: ToString,
{
    if let Some(vec) = option {
        let record = vec
            .iter()
            .enumerate()
            .map(|(i, e)| {
                if i == 0 {
                    e.to_string()
                } else {
                    ",".to_owned() + &e.to_string()
                }
            })
            .collect::<String>();
        ser.serialize_str(&record)
    } else {
        ser.serialize_none()
    }
}
