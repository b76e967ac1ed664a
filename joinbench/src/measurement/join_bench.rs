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
use crate::types::ArgPlanShape;
use data_store::join_data::MultiwayJoinData;
use join_ops::accel::software::SoftwareDevice;
use join_ops::accel::Accelerator;
use join_ops::config::ExecConfig;
use join_ops::outer::{OuterSource, TableOuterSource};
use join_ops::plan::{DepthSpec, JoinPlan, JoinStrategy, JoinType, JoinValue, ProbeKey};
use join_ops::preload::{InnerSource, TableInnerSource};
use join_ops::scheduler::JoinExecutor;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Default)]
pub struct MultiwayJoinPoint {
    pub preload_ns: Option<f64>,
    pub join_ns: Option<f64>,
    pub result_rows: Option<u64>,
    pub result_bytes: Option<u64>,
    pub source_tasks: Option<u64>,
    pub fallback_tasks: Option<u64>,
    pub inner_loads: Option<u64>,
    pub inner_load_bytes: Option<u64>,
    pub device_peak_bytes: Option<usize>,
}

pub struct MultiwayJoinBench<T: JoinValue> {
    pub plan: Arc<JoinPlan<T>>,
    pub config: ExecConfig,
    pub data: MultiwayJoinData<T>,
}

/// Assembles a hash join plan over the given join types.
///
/// Every depth of a star plan probes with the outer key. A chain plan probes
/// depth 1 with the outer key and each deeper depth with the payload matched
/// at the previous depth.
pub fn build_plan<T: JoinValue>(
    plan_shape: ArgPlanShape,
    join_types: &[JoinType],
    planned_outer_rows: f64,
) -> JoinPlan<T> {
    let depths = join_types
        .iter()
        .enumerate()
        .map(|(index, &join_type)| {
            let probe_key = match plan_shape {
                ArgPlanShape::Star => ProbeKey::OuterKey,
                ArgPlanShape::Chain if index == 0 => ProbeKey::OuterKey,
                ArgPlanShape::Chain => ProbeKey::InnerPayload(index),
            };
            DepthSpec::new(
                join_type,
                JoinStrategy::Hash {
                    probe_key,
                    join_predicate: None,
                },
            )
        })
        .collect();

    let mut plan = JoinPlan::new(depths);
    plan.planned_outer_rows = planned_outer_rows;
    plan
}

impl<T: JoinValue> MultiwayJoinBench<T> {
    /// Runs the join once and reports timings and execution counters.
    ///
    /// The preload time covers the executor construction, which ingests the
    /// inner relations. The join time covers draining the result stream.
    pub fn multiway_join(&mut self) -> Result<MultiwayJoinPoint> {
        let accel: Arc<dyn Accelerator<T>> = Arc::new(SoftwareDevice::new(Arc::clone(&self.plan)));
        let outer: Box<dyn OuterSource<T>> = Box::new(TableOuterSource::new(
            self.data.outer.key.clone(),
            self.data.outer.payload.clone(),
        )?);
        let inner_sources = self
            .data
            .inners
            .iter()
            .map(|relation| -> Result<Box<dyn InnerSource<T>>> {
                Ok(Box::new(TableInnerSource::new(
                    relation.key.clone(),
                    relation.payload.clone(),
                )?))
            })
            .collect::<Result<Vec<_>>>()?;

        let preload_timer = Instant::now();
        let mut executor = JoinExecutor::new(
            self.config.clone(),
            Arc::clone(&self.plan),
            accel,
            outer,
            inner_sources,
        )?;
        let preload_time = preload_timer.elapsed();

        let join_timer = Instant::now();
        let mut result_rows = 0_u64;
        while let Some(results) = executor.next_results()? {
            result_rows += results.len() as u64;
        }
        let join_time = join_timer.elapsed();

        let diagnostics = executor.diagnostics();

        Ok(MultiwayJoinPoint {
            preload_ns: Some(preload_time.as_nanos() as f64),
            join_ns: Some(join_time.as_nanos() as f64),
            result_rows: Some(result_rows),
            result_bytes: Some(diagnostics.snapshot.result_bytes),
            source_tasks: Some(diagnostics.snapshot.source_tasks),
            fallback_tasks: Some(diagnostics.snapshot.fallback_tasks),
            inner_loads: Some(diagnostics.snapshot.inner_loads),
            inner_load_bytes: Some(diagnostics.snapshot.inner_load_bytes),
            device_peak_bytes: Some(diagnostics.device_peak_bytes),
        })
    }
}
