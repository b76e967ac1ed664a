/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2021 Clemens Lutz, German Research Center for Artificial
 * Intelligence
 * Author: Clemens Lutz, DFKI GmbH <clemens.lutz@dfki.de>
 */

pub mod multiway;

use datagen::relation::UniformRelation;
use join_ops::accel::software::SoftwareDevice;
use join_ops::accel::Accelerator;
use join_ops::config::ExecConfig;
use join_ops::outer::TableOuterSource;
use join_ops::plan::{
    Composite, DepthSpec, EvalContext, JoinPlan, JoinStrategy, JoinType, ProbeKey,
};
use join_ops::preload::{InnerSource, TableInnerSource};
use join_ops::scheduler::JoinExecutor;
use multiway::{
    key_within_band, outer_key_equals, payload_equals, reference_join, verify_rows, OracleDepth,
    Slots,
};
use std::error::Error;
use std::ops::RangeInclusive;
use std::result::Result;
use std::sync::Arc;

/// Probe side of one test depth, mapped onto both the executor plan and the
/// reference join.
enum Probe {
    /// Hash join on the outer key column.
    OuterKey,
    /// Hash join on the payload column bound at a shallower depth.
    InnerPayload(usize),
    /// Nested loop join on |outer key - inner key| <= band.
    Band(i32),
}

#[derive(Default)]
struct CaseOptions {
    /// Keep only outer rows with an even payload.
    outer_filter: bool,
    /// Divert tasks that probe a payload divisible by five at this depth to
    /// the CPU.
    recheck_depth: Option<usize>,
    /// Drop matched composites whose payload at this depth is divisible by
    /// three.
    other_depth: Option<usize>,
    /// Re-run the join twice through both rescan modes.
    rescan: bool,
}

fn gen_table(
    tuples: usize,
    value_range: RangeInclusive<usize>,
    null_key_percent: u32,
) -> Result<(Vec<i32>, Vec<i32>), Box<dyn Error>> {
    let mut keys = vec![0_i32; tuples];
    let mut payloads = vec![0_i32; tuples];
    UniformRelation::gen_attr(&mut keys, value_range.clone())?;
    UniformRelation::gen_attr(&mut payloads, value_range)?;
    if null_key_percent > 0 {
        UniformRelation::set_null_fraction(&mut keys, null_key_percent)?;
    }
    Ok((keys, payloads))
}

fn plan_depth(depth: usize, join_type: JoinType, probe: &Probe) -> DepthSpec<i32> {
    match *probe {
        Probe::OuterKey => DepthSpec::new(
            join_type,
            JoinStrategy::Hash {
                probe_key: ProbeKey::OuterKey,
                join_predicate: None,
            },
        ),
        Probe::InnerPayload(source) => DepthSpec::new(
            join_type,
            JoinStrategy::Hash {
                probe_key: ProbeKey::InnerPayload(source),
                join_predicate: None,
            },
        ),
        Probe::Band(band) => DepthSpec::new(
            join_type,
            JoinStrategy::NestedLoop {
                join_predicate: Arc::new(move |ctx: &EvalContext<'_, i32>, row: &Composite| {
                    match (ctx.key(0, row), ctx.key(depth, row)) {
                        (Some(outer), Some(inner)) => (outer - inner).abs() <= band,
                        _ => false,
                    }
                }),
            },
        ),
    }
}

fn oracle_depth(join_type: JoinType, probe: &Probe) -> OracleDepth {
    let key_match = match *probe {
        Probe::OuterKey => outer_key_equals(),
        Probe::InnerPayload(source) => payload_equals(source),
        Probe::Band(band) => key_within_band(band),
    };
    OracleDepth {
        join_type,
        key_match,
        other: None,
    }
}

/// Generates the relations, runs the executor against the software device,
/// and compares the produced rows against the reference join.
fn run_join(
    outer_tuples: usize,
    inner_tuples: &[usize],
    depths: Vec<(JoinType, Probe)>,
    value_range: RangeInclusive<usize>,
    null_key_percent: u32,
    config: ExecConfig,
    options: CaseOptions,
) -> Result<(), Box<dyn Error>> {
    let (outer_keys, outer_payloads) = gen_table(outer_tuples, value_range.clone(), null_key_percent)?;
    let outer: Vec<(i32, i32)> = outer_keys
        .iter()
        .copied()
        .zip(outer_payloads.iter().copied())
        .collect();

    let mut inners: Vec<Vec<(i32, i32)>> = Vec::new();
    let mut sources: Vec<Box<dyn InnerSource<i32>>> = Vec::new();
    for &tuples in inner_tuples {
        let (keys, payloads) = gen_table(tuples, value_range.clone(), null_key_percent)?;
        inners.push(keys.iter().copied().zip(payloads.iter().copied()).collect());
        sources.push(Box::new(TableInnerSource::new(keys, payloads)?));
    }

    let mut specs = Vec::new();
    let mut oracle = Vec::new();
    for (index, (join_type, probe)) in depths.iter().enumerate() {
        let depth = index + 1;
        let mut spec = plan_depth(depth, *join_type, probe);
        let mut reference = oracle_depth(*join_type, probe);
        if options.recheck_depth == Some(depth) {
            spec.recheck_predicate = Some(Arc::new(move |ctx, row| {
                ctx.payload(depth, row)
                    .map_or(false, |payload| payload % 5 == 0)
            }));
        }
        if options.other_depth == Some(depth) {
            spec.other_predicate = Some(Arc::new(move |ctx, row| {
                ctx.payload(depth, row)
                    .map_or(true, |payload| payload % 3 != 0)
            }));
            reference.other = Some(Box::new(|_: &Slots, (_, payload): (i32, i32)| {
                payload % 3 != 0
            }));
        }
        specs.push(spec);
        oracle.push(reference);
    }

    let mut plan = JoinPlan::new(specs);
    plan.planned_outer_rows = outer_tuples as f64;
    if options.outer_filter {
        plan.outer_filter = Some(Arc::new(|ctx, row| {
            ctx.payload(0, row).map_or(false, |payload| payload % 2 == 0)
        }));
    }
    let plan = Arc::new(plan);

    let accel: Arc<dyn Accelerator<i32>> = Arc::new(SoftwareDevice::new(Arc::clone(&plan)));
    let mut executor = JoinExecutor::new(
        config,
        Arc::clone(&plan),
        accel,
        Box::new(TableOuterSource::new(outer_keys, outer_payloads)?),
        sources,
    )?;

    let filter = |(_, payload): (i32, i32)| payload % 2 == 0;
    let expected = reference_join(
        &outer,
        &inners,
        &oracle,
        if options.outer_filter {
            Some(&filter)
        } else {
            None
        },
    );

    let rows = executor.collect_rows()?;
    let actual: Vec<Vec<Option<i32>>> = rows.into_iter().map(|row| row.columns).collect();
    verify_rows(actual, expected.clone())?;

    if options.recheck_depth.is_some() && executor.diagnostics().snapshot.fallback_tasks == 0 {
        Err("The recheck predicate never diverted a task to the CPU")?;
    }

    if options.rescan {
        executor.rescan(false)?;
        let rows = executor.collect_rows()?;
        verify_rows(
            rows.into_iter().map(|row| row.columns).collect(),
            expected.clone(),
        )?;

        executor.rescan(true)?;
        let rows = executor.collect_rows()?;
        verify_rows(rows.into_iter().map(|row| row.columns).collect(), expected)?;
    }

    Ok(())
}

/// Narrow chunks and a small device budget force inner chunk combinations,
/// window continuations, and deferred unmatched-inner sweeps.
fn tiled_config() -> ExecConfig {
    ExecConfig {
        chunk_size: 4096,
        chunk_size_limit: 16384,
        max_device_allocation: 64 << 10,
        ..ExecConfig::default()
    }
}

#[test]
fn join_inner_two_depths_small() -> Result<(), Box<dyn Error>> {
    run_join(
        200,
        &[50, 40],
        vec![
            (JoinType::Inner, Probe::OuterKey),
            (JoinType::Inner, Probe::InnerPayload(1)),
        ],
        1..=8,
        0,
        ExecConfig::default(),
        CaseOptions::default(),
    )
}

#[test]
fn join_inner_two_depths_duplicate_heavy() -> Result<(), Box<dyn Error>> {
    run_join(
        300,
        &[80, 60],
        vec![
            (JoinType::Inner, Probe::OuterKey),
            (JoinType::Inner, Probe::InnerPayload(1)),
        ],
        1..=4,
        0,
        ExecConfig::default(),
        CaseOptions::default(),
    )
}

#[test]
fn join_left_with_null_keys() -> Result<(), Box<dyn Error>> {
    run_join(
        400,
        &[120],
        vec![(JoinType::Left, Probe::OuterKey)],
        1..=16,
        10,
        ExecConfig::default(),
        CaseOptions::default(),
    )
}

#[test]
fn join_right_with_null_keys() -> Result<(), Box<dyn Error>> {
    run_join(
        400,
        &[150],
        vec![(JoinType::Right, Probe::OuterKey)],
        1..=16,
        10,
        ExecConfig::default(),
        CaseOptions::default(),
    )
}

#[test]
fn join_full_single_depth() -> Result<(), Box<dyn Error>> {
    run_join(
        300,
        &[130],
        vec![(JoinType::Full, Probe::OuterKey)],
        1..=12,
        5,
        ExecConfig::default(),
        CaseOptions::default(),
    )
}

#[test]
fn join_full_two_depths_tiled() -> Result<(), Box<dyn Error>> {
    run_join(
        400,
        &[220, 160],
        vec![
            (JoinType::Full, Probe::OuterKey),
            (JoinType::Full, Probe::InnerPayload(1)),
        ],
        1..=32,
        5,
        tiled_config(),
        CaseOptions::default(),
    )
}

#[test]
fn join_right_tiled_many_chunks() -> Result<(), Box<dyn Error>> {
    run_join(
        300,
        &[600],
        vec![(JoinType::Right, Probe::OuterKey)],
        1..=64,
        5,
        tiled_config(),
        CaseOptions::default(),
    )
}

#[test]
fn join_right_inner_full_mix() -> Result<(), Box<dyn Error>> {
    run_join(
        500,
        &[200, 90, 70],
        vec![
            (JoinType::Right, Probe::OuterKey),
            (JoinType::Inner, Probe::InnerPayload(1)),
            (JoinType::Full, Probe::InnerPayload(2)),
        ],
        1..=16,
        10,
        ExecConfig::default(),
        CaseOptions::default(),
    )
}

#[test]
fn join_nested_loop_band() -> Result<(), Box<dyn Error>> {
    run_join(
        200,
        &[80],
        vec![(JoinType::Inner, Probe::Band(1))],
        1..=32,
        0,
        ExecConfig::default(),
        CaseOptions::default(),
    )
}

#[test]
fn join_nested_loop_left_band() -> Result<(), Box<dyn Error>> {
    run_join(
        200,
        &[60],
        vec![(JoinType::Left, Probe::Band(0))],
        1..=32,
        10,
        ExecConfig::default(),
        CaseOptions::default(),
    )
}

#[test]
fn join_recheck_replays_on_cpu() -> Result<(), Box<dyn Error>> {
    run_join(
        300,
        &[100, 80],
        vec![
            (JoinType::Inner, Probe::OuterKey),
            (JoinType::Right, Probe::InnerPayload(1)),
        ],
        1..=10,
        5,
        ExecConfig::default(),
        CaseOptions {
            recheck_depth: Some(2),
            ..CaseOptions::default()
        },
    )
}

#[test]
fn join_recheck_replays_tiled_sweeps_on_cpu() -> Result<(), Box<dyn Error>> {
    run_join(
        400,
        &[220, 160],
        vec![
            (JoinType::Full, Probe::OuterKey),
            (JoinType::Full, Probe::InnerPayload(1)),
        ],
        1..=32,
        5,
        tiled_config(),
        CaseOptions {
            recheck_depth: Some(1),
            ..CaseOptions::default()
        },
    )
}

#[test]
fn join_outer_filter_and_other_predicate() -> Result<(), Box<dyn Error>> {
    run_join(
        300,
        &[100],
        vec![(JoinType::Left, Probe::OuterKey)],
        1..=8,
        5,
        ExecConfig::default(),
        CaseOptions {
            outer_filter: true,
            other_depth: Some(1),
            ..CaseOptions::default()
        },
    )
}

#[test]
fn join_rescan_reproduces_results() -> Result<(), Box<dyn Error>> {
    run_join(
        250,
        &[90, 70],
        vec![
            (JoinType::Inner, Probe::OuterKey),
            (JoinType::Right, Probe::InnerPayload(1)),
        ],
        1..=8,
        5,
        ExecConfig::default(),
        CaseOptions {
            rescan: true,
            ..CaseOptions::default()
        },
    )
}
