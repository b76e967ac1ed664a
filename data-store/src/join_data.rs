/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019-2021, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use crate::error::{ErrorKind, Result};
use csv::{ByteRecord, ReaderBuilder};
use flate2::read::GzDecoder;
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::Read;
use std::time::{Duration, Instant};

pub type RelationGenFn<T> = Box<dyn FnMut(&mut [T], &mut [T]) -> Result<()>>;

pub struct JoinRelation<T> {
    pub key: Vec<T>,
    pub payload: Vec<T>,
}

pub struct MultiwayJoinData<T> {
    pub outer: JoinRelation<T>,
    pub inners: Vec<JoinRelation<T>>,
}

pub struct MultiwayJoinDataBuilder {
    outer_len: usize,
    inner_lens: Vec<usize>,
}

impl Default for MultiwayJoinDataBuilder {
    fn default() -> MultiwayJoinDataBuilder {
        MultiwayJoinDataBuilder {
            outer_len: 1,
            inner_lens: vec![1],
        }
    }
}

fn open_reader(spec: &ReaderBuilder, path: &str) -> Result<csv::Reader<Box<dyn Read>>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if path.ends_with("gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(spec.from_reader(reader))
}

impl MultiwayJoinDataBuilder {
    pub fn outer_len(&mut self, outer_len: usize) -> &mut Self {
        self.outer_len = outer_len;
        self
    }

    pub fn inner_lens(&mut self, inner_lens: &[usize]) -> &mut Self {
        self.inner_lens = inner_lens.to_vec();
        self
    }

    fn allocate_relations<T>(&self) -> (JoinRelation<T>, Vec<JoinRelation<T>>, Duration)
    where
        T: Clone + Default,
    {
        // Allocate memory for data sets
        let malloc_timer = Instant::now();
        let outer = JoinRelation {
            key: vec![T::default(); self.outer_len],
            payload: vec![T::default(); self.outer_len],
        };
        let inners = self
            .inner_lens
            .iter()
            .map(|&len| JoinRelation {
                key: vec![T::default(); len],
                payload: vec![T::default(); len],
            })
            .collect();
        let malloc_time = malloc_timer.elapsed();

        (outer, inners, malloc_time)
    }

    pub fn build_with_data_gen<T>(
        &mut self,
        mut outer_gen: RelationGenFn<T>,
        inner_gens: Vec<RelationGenFn<T>>,
    ) -> Result<(MultiwayJoinData<T>, Duration, Duration)>
    where
        T: Copy + Default,
    {
        if inner_gens.len() != self.inner_lens.len() {
            Err(ErrorKind::InvalidArgument(
                "Expected one generator per inner relation".to_string(),
            ))?;
        }

        let (mut outer, mut inners, malloc_time) = self.allocate_relations();

        // Generate dataset
        let gen_timer = Instant::now();
        outer_gen(&mut outer.key, &mut outer.payload)?;
        for (mut gen_fn, relation) in inner_gens.into_iter().zip(inners.iter_mut()) {
            gen_fn(&mut relation.key, &mut relation.payload)?;
        }
        let gen_time = gen_timer.elapsed();

        Ok((MultiwayJoinData { outer, inners }, malloc_time, gen_time))
    }

    pub fn build_with_files<T: DeserializeOwned>(
        &mut self,
        outer_relation_path: &str,
        inner_relation_paths: &[&str],
    ) -> Result<(MultiwayJoinData<T>, Duration, Duration)>
    where
        T: Copy + Default + Send,
    {
        let mut reader_spec = ReaderBuilder::new();
        reader_spec
            .delimiter(b' ')
            .has_headers(true)
            .quoting(false)
            .double_quote(false);

        let paths: Vec<&str> = std::iter::once(outer_relation_path)
            .chain(inner_relation_paths.iter().copied())
            .collect();

        let io_timer = Instant::now();

        // Count the number of tuples
        let counts: Vec<usize> = paths
            .par_iter()
            .map(|path| -> Result<usize> {
                let mut reader = open_reader(&reader_spec, path)?;
                let mut record = ByteRecord::new();
                let mut len = 0;
                while reader.read_byte_record(&mut record)? {
                    len += 1;
                }
                Ok(len)
            })
            .collect::<Result<_>>()?;

        self.outer_len = counts[0];
        self.inner_lens = counts[1..].to_vec();

        let io_count_time = io_timer.elapsed();

        let (mut outer, mut inners, malloc_time) = self.allocate_relations();

        let io_timer = Instant::now();

        // Read in the tuples
        let mut relations: Vec<&mut JoinRelation<T>> = std::iter::once(&mut outer)
            .chain(inners.iter_mut())
            .collect();

        paths
            .par_iter()
            .zip(relations.par_iter_mut())
            .try_for_each(|(path, relation)| -> Result<()> {
                let mut reader = open_reader(&reader_spec, path)?;
                let mut record = ByteRecord::new();

                let mut key_iter = relation.key.iter_mut();
                let mut payload_iter = relation.payload.iter_mut();
                while reader.read_byte_record(&mut record)? {
                    let (key, value): (T, T) = record.deserialize(None)?;
                    *key_iter.next().expect("Allocated length is too short") = key;
                    *payload_iter
                        .next()
                        .expect("Allocated length is too short") = value;
                }

                Ok(())
            })?;

        let io_read_time = io_timer.elapsed();

        Ok((
            MultiwayJoinData { outer, inners },
            malloc_time,
            io_count_time + io_read_time,
        ))
    }
}
