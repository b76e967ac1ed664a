/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2021-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

use data_store::join_data::{MultiwayJoinDataBuilder, RelationGenFn};
use datagen::relation::{KeyAttribute, UniformRelation, ZipfRelation};
use join_ops::config::ExecConfig;
use join_ops::plan::{JoinType, JoinValue};
use joinbench::error::{ErrorKind, Result};
use joinbench::measurement::data_point::DataPoint;
use joinbench::measurement::harness;
use joinbench::measurement::join_bench::{build_plan, MultiwayJoinBench, MultiwayJoinPoint};
use joinbench::types::*;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

fn main() -> Result<()> {
    env_logger::init();

    // Parse commandline arguments
    let cmd = CmdOpt::from_args();

    match cmd.tuple_bytes {
        ArgTupleBytes::Bytes8 => {
            let (bench_fn, dp) = args_to_bench::<i32>(&cmd)?;
            harness::measure("multiway_join", cmd.repeat, cmd.csv, dp, bench_fn)?;
        }
        ArgTupleBytes::Bytes16 => {
            let (bench_fn, dp) = args_to_bench::<i64>(&cmd)?;
            harness::measure("multiway_join", cmd.repeat, cmd.csv, dp, bench_fn)?;
        }
    };

    Ok(())
}

#[derive(StructOpt)]
#[structopt(
    name = "joinbench",
    about = "A multi-way join benchmark for accelerators with constrained memory"
)]
struct CmdOpt {
    /// Number of times to repeat benchmark
    #[structopt(short = "r", long = "repeat", default_value = "30")]
    repeat: u32,

    /// Output filename for measurement CSV file
    #[structopt(long = "csv", parse(from_os_str))]
    csv: Option<PathBuf>,

    /// Use a pre-defined or custom data set.
    //   test: A small data set for testing on the laptop
    //   custom: Sizes given by --outer-rel-tuples and --inner-rel-tuples
    #[structopt(
        short = "s",
        long = "data-set",
        default_value = "Test",
        possible_values = &ArgDataSet::variants(),
        case_insensitive = true
    )]
    data_set: ArgDataSet,

    /// Join type of each depth (e.g.: Inner,Right,Full)
    #[structopt(
        long = "join-types",
        default_value = "Inner",
        possible_values = &ArgJoinType::variants(),
        case_insensitive = true,
        require_delimiter = true
    )]
    join_types: Vec<ArgJoinType>,

    /// Probe with the outer key at every depth (star) or with the payload matched at the previous depth (chain)
    #[structopt(
        long = "plan-shape",
        default_value = "Star",
        possible_values = &ArgPlanShape::variants(),
        case_insensitive = true
    )]
    plan_shape: ArgPlanShape,

    /// Outer relation's data distribution
    #[structopt(
        long = "data-distribution",
        default_value = "Uniform",
        possible_values = &ArgDataDistribution::variants(),
        case_insensitive = true
    )]
    data_distribution: ArgDataDistribution,

    /// Zipf exponent for Zipf-sampled outer relations
    #[structopt(long = "zipf-exponent", required_if("data-distribution", "Zipf"))]
    zipf_exponent: Option<f64>,

    /// Selectivity of each join depth, in percent
    #[structopt(
        long = "selectivity",
        default_value = "100",
        validator = is_percent
    )]
    selectivity: u32,

    /// Fraction of outer keys set to NULL, in percent
    #[structopt(
        long = "null-keys",
        default_value = "0",
        validator = is_percent
    )]
    null_keys: u32,

    /// Load the outer relation from a TSV file with "key value" pairs and automatic gzip decompression
    #[structopt(
        long = "outer-rel-file",
        parse(from_os_str),
        conflicts_with = "data_set",
        requires = "inner_rel_files"
    )]
    outer_rel_file: Option<PathBuf>,

    /// Load the inner relations from TSV files with "key value" pairs and automatic gzip decompression
    #[structopt(
        long = "inner-rel-files",
        parse(from_os_str),
        conflicts_with = "data_set",
        requires = "outer_rel_file",
        require_delimiter = true
    )]
    inner_rel_files: Vec<PathBuf>,

    /// Set the tuple size (bytes)
    #[structopt(
        long = "tuple-bytes",
        default_value = "Bytes8",
        possible_values = &ArgTupleBytes::variants(),
        case_insensitive = true
    )]
    tuple_bytes: ArgTupleBytes,

    /// Set the outer relation size (tuples); required for `--data-set Custom`
    #[structopt(long = "outer-rel-tuples", required_if("data_set", "Custom"))]
    outer_rel_tuples: Option<usize>,

    /// Set the inner relation sizes (tuples, e.g.: 8192,1024); required for `--data-set Custom`
    #[structopt(
        long = "inner-rel-tuples",
        require_delimiter = true,
        required_if("data_set", "Custom")
    )]
    inner_rel_tuples: Vec<usize>,

    /// Nominal size of relation chunks and result buffers (in KiB)
    #[structopt(long = "chunk-size", default_value = "1024")]
    chunk_size: usize,

    /// Upper limit of a single result buffer (in KiB)
    #[structopt(long = "chunk-size-limit", default_value = "4096")]
    chunk_size_limit: usize,

    /// Device memory capacity available to the join (in KiB)
    #[structopt(long = "device-mem-size", default_value = "65536")]
    device_mem_size: usize,

    /// Number of join tasks kept in flight
    #[structopt(long = "pipeline-depth", default_value = "4")]
    pipeline_depth: usize,

    /// Number of worker threads; 0 selects all physical cores
    #[structopt(short = "t", long = "threads", default_value = "0")]
    threads: usize,

    /// Shuffle the inner relations before chunking them
    #[structopt(long = "shuffle-inner")]
    shuffle_inner: bool,

    /// Abort when the accelerator rejects a task instead of replaying it on the CPU
    #[structopt(long = "no-cpu-fallback")]
    no_cpu_fallback: bool,
}

fn is_percent(x: String) -> std::result::Result<(), String> {
    x.parse::<i32>()
        .map_err(|_| {
            String::from(
                "Failed to parse integer. The value must be a percentage between [0, 100].",
            )
        })
        .and_then(|x| {
            if 0 <= x && x <= 100 {
                Ok(())
            } else {
                Err(String::from(
                    "The value must be a percentage between [0, 100].",
                ))
            }
        })
}

fn args_to_bench<T>(
    cmd: &CmdOpt,
) -> Result<(Box<dyn FnMut() -> Result<MultiwayJoinPoint>>, DataPoint)>
where
    T: JoinValue + num_traits::FromPrimitive + DeserializeOwned,
{
    assert!(
        !cmd.join_types.is_empty(),
        "Invalid arguments: Expected at least one join type."
    );

    let threads = if cmd.threads == 0 {
        num_cpus::get_physical()
    } else {
        cmd.threads
    };

    let config = ExecConfig {
        chunk_size: cmd.chunk_size * 1024, // convert KiB to bytes
        chunk_size_limit: cmd.chunk_size_limit * 1024,
        max_device_allocation: cmd.device_mem_size * 1024,
        pipeline_depth: cmd.pipeline_depth,
        worker_threads: threads,
        cpu_fallback: !cmd.no_cpu_fallback,
        shuffle_inner: cmd.shuffle_inner,
        ..ExecConfig::default()
    };

    // Load files or generate data set
    let mut data_builder = MultiwayJoinDataBuilder::default();
    let (data, malloc_time, data_gen_time) = if let Some(outer_rel_path) =
        cmd.outer_rel_file.as_ref().and_then(|p| p.to_str())
    {
        let inner_rel_paths: Vec<&str> = cmd
            .inner_rel_files
            .iter()
            .map(|path| {
                path.to_str().ok_or_else(|| {
                    ErrorKind::InvalidArgument(
                        "Relation file paths must be valid UTF-8".to_string(),
                    )
                })
            })
            .collect::<std::result::Result<_, _>>()?;

        data_builder.build_with_files::<T>(outer_rel_path, &inner_rel_paths)?
    } else {
        let data_distribution = match cmd.data_distribution {
            ArgDataDistribution::Uniform => DataDistribution::Uniform,
            ArgDataDistribution::Zipf => DataDistribution::Zipf(
                cmd.zipf_exponent
                    .expect("Couldn't find the Zipf exponent. Did you specify --zipf-exponent?"),
            ),
        };

        let (outer_relation_len, inner_relation_lens, outer_gen, inner_gens) = data_gen_fns::<T>(
            cmd.data_set,
            cmd.plan_shape,
            cmd.join_types.len(),
            cmd.outer_rel_tuples,
            &cmd.inner_rel_tuples,
            data_distribution,
            Some(cmd.selectivity),
            cmd.null_keys,
        );

        data_builder
            .outer_len(outer_relation_len)
            .inner_lens(&inner_relation_lens)
            .build_with_data_gen(outer_gen, inner_gens)?
    };

    assert_eq!(
        cmd.join_types.len(),
        data.inners.len(),
        "Invalid arguments: Expected one join type per inner relation."
    );

    // Construct data point template for CSV
    let dp = DataPoint::new()?
        .fill_from_cmd_options(cmd)
        .fill_from_exec_config(&config)
        .fill_from_join_data(&data)
        .set_init_time(malloc_time, data_gen_time);

    let join_types: Vec<JoinType> = cmd.join_types.iter().map(|&jt| jt.into()).collect();
    let plan = Arc::new(build_plan::<T>(
        cmd.plan_shape,
        &join_types,
        data.outer.key.len() as f64,
    ));

    let mut bench = MultiwayJoinBench { plan, config, data };

    // Create closure that wraps the join benchmark function
    let bench_fn: Box<dyn FnMut() -> Result<MultiwayJoinPoint>> =
        Box::new(move || bench.multiway_join());

    Ok((bench_fn, dp))
}

fn data_gen_fns<T>(
    description: ArgDataSet,
    plan_shape: ArgPlanShape,
    num_depths: usize,
    outer_rel_tuples: Option<usize>,
    inner_rel_tuples: &[usize],
    data_distribution: DataDistribution,
    selectivity: Option<u32>,
    null_keys: u32,
) -> (usize, Vec<usize>, RelationGenFn<T>, Vec<RelationGenFn<T>>)
where
    T: Copy + Send + KeyAttribute + num_traits::FromPrimitive,
{
    let (outer_len, inner_lens) = match description {
        ArgDataSet::Test => (1000, vec![1000; num_depths]),
        ArgDataSet::Custom => {
            assert_eq!(
                inner_rel_tuples.len(),
                num_depths,
                "Invalid arguments: Expected one inner relation size per join type."
            );

            (
                outer_rel_tuples.expect(
                    "Couldn't find outer relation size. Did you specify --outer-rel-tuples?",
                ),
                inner_rel_tuples.to_vec(),
            )
        }
    };

    // Outer keys are sampled from the key domain of the first inner relation.
    let key_domain = inner_lens[0];
    let uniform_gen: RelationGenFn<T> = Box::new(move |keys: &mut [_], _: &mut [_]| {
        UniformRelation::gen_attr_par(keys, 1..=key_domain)?;
        if null_keys > 0 {
            UniformRelation::set_null_fraction(keys, null_keys)?;
        }
        Ok(())
    });

    let outer_gen: RelationGenFn<T> = match data_distribution {
        DataDistribution::Uniform => uniform_gen,
        DataDistribution::Zipf(exp) if !(exp > 0.0) => uniform_gen,
        DataDistribution::Zipf(exp) => Box::new(move |keys: &mut [_], _: &mut [_]| {
            ZipfRelation::gen_attr_par(keys, key_domain, exp)?;
            if null_keys > 0 {
                UniformRelation::set_null_fraction(keys, null_keys)?;
            }
            Ok(())
        }),
    };

    // Chain plans probe each depth with the payload matched at the previous
    // depth, so inner payloads are sampled from the key domain of the next
    // inner relation.
    let inner_gens = inner_lens
        .iter()
        .enumerate()
        .map(|(index, _)| {
            let next_len = match plan_shape {
                ArgPlanShape::Chain => inner_lens.get(index + 1).copied(),
                ArgPlanShape::Star => None,
            };

            let gen: RelationGenFn<T> = Box::new(move |keys: &mut [_], payloads: &mut [_]| {
                UniformRelation::gen_primary_key_par(keys, selectivity)?;
                if let Some(next_len) = next_len {
                    UniformRelation::gen_attr_par(payloads, 1..=next_len)?;
                }
                Ok(())
            });
            gen
        })
        .collect();

    (outer_len, inner_lens, outer_gen, inner_gens)
}

trait CmdOptToDataPoint {
    fn fill_from_cmd_options(&self, cmd: &CmdOpt) -> DataPoint;
}

impl CmdOptToDataPoint for DataPoint {
    fn fill_from_cmd_options(&self, cmd: &CmdOpt) -> DataPoint {
        DataPoint {
            data_set: Some(cmd.data_set.to_string()),
            plan_shape: Some(cmd.plan_shape),
            join_types: Some(cmd.join_types.clone()),
            tuple_bytes: Some(cmd.tuple_bytes),
            data_distribution: Some(cmd.data_distribution),
            zipf_exponent: if cmd.data_distribution == ArgDataDistribution::Zipf {
                cmd.zipf_exponent
            } else {
                None
            },
            join_selectivity: Some(cmd.selectivity as f64 / 100.0),
            null_key_fraction: Some(cmd.null_keys as f64 / 100.0),
            ..self.clone()
        }
    }
}
