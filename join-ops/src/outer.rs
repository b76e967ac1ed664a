/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Outer relation sources.
//!
//! The scheduler pulls the outer relation chunk by chunk. A chunk is handed
//! to exactly one task chain: the task that consumes a prefix of the chunk
//! passes it on to its continuation task.

use crate::error::{ErrorKind, Result};
use crate::plan::JoinValue;

/// One chunk of outer relation rows.
#[derive(Debug)]
pub struct OuterChunk<T> {
    keys: Vec<T>,
    payloads: Vec<T>,
}

impl<T: JoinValue> OuterChunk<T> {
    pub fn from_rows(rows: Vec<(T, T)>) -> Self {
        let mut keys = Vec::with_capacity(rows.len());
        let mut payloads = Vec::with_capacity(rows.len());
        for (key, payload) in rows {
            keys.push(key);
            payloads.push(payload);
        }
        Self { keys, payloads }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key(&self, row: u32) -> T {
        self.keys[row as usize]
    }

    pub fn payload(&self, row: u32) -> T {
        self.payloads[row as usize]
    }
}

/// A rescannable stream of outer relation chunks.
pub trait OuterSource<T>: Send {
    /// Next chunk of at most `max_rows` rows, or `None` at the end of the
    /// scan.
    fn next_chunk(&mut self, max_rows: usize) -> Result<Option<OuterChunk<T>>>;

    /// Restarts the scan from the first row.
    fn rescan(&mut self) -> Result<()>;
}

/// Outer source over in-memory key and payload columns.
#[derive(Debug)]
pub struct TableOuterSource<T> {
    keys: Vec<T>,
    payloads: Vec<T>,
    position: usize,
}

impl<T: JoinValue> TableOuterSource<T> {
    pub fn new(keys: Vec<T>, payloads: Vec<T>) -> Result<Self> {
        if keys.len() != payloads.len() {
            Err(ErrorKind::InvalidArgument(
                "Outer key and payload columns differ in length".to_string(),
            ))?;
        }
        Ok(Self {
            keys,
            payloads,
            position: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

impl<T: JoinValue> OuterSource<T> for TableOuterSource<T> {
    fn next_chunk(&mut self, max_rows: usize) -> Result<Option<OuterChunk<T>>> {
        if max_rows == 0 {
            Err(ErrorKind::InvalidArgument(
                "Outer chunk capacity must be positive".to_string(),
            ))?;
        }
        if self.position >= self.keys.len() {
            return Ok(None);
        }

        let take = max_rows.min(self.keys.len() - self.position);
        let range = self.position..self.position + take;
        let chunk = OuterChunk {
            keys: self.keys[range.clone()].to_vec(),
            payloads: self.payloads[range].to_vec(),
        };
        self.position += take;
        Ok(Some(chunk))
    }

    fn rescan(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    #[test]
    fn chunks_tile_the_table() -> Result<()> {
        let keys: Vec<i32> = (0..10).collect();
        let payloads: Vec<i32> = (0..10).map(|k| 10 * k).collect();
        let mut source = TableOuterSource::new(keys, payloads)?;

        let mut seen = Vec::new();
        while let Some(chunk) = source.next_chunk(4)? {
            for row in 0..chunk.len() as u32 {
                seen.push(chunk.key(row));
            }
        }

        assert_eq!(seen, (0..10).collect::<Vec<i32>>());
        Ok(())
    }

    #[test]
    fn rescan_restarts_the_stream() -> Result<()> {
        let mut source = TableOuterSource::new(vec![1_i32, 2, 3], vec![10, 20, 30])?;

        let first = source.next_chunk(8)?.expect("First scan yields a chunk");
        assert_eq!(first.len(), 3);
        assert!(source.next_chunk(8)?.is_none());

        source.rescan()?;
        let again = source.next_chunk(8)?.expect("Rescan yields the chunk again");
        assert_eq!(again.len(), 3);
        assert_eq!(again.payload(2), 30);
        Ok(())
    }

    #[test]
    fn mismatched_columns_are_rejected() {
        assert!(TableOuterSource::new(vec![1_i32, 2], vec![10]).is_err());
    }

    #[test]
    fn zero_capacity_request_fails() -> Result<()> {
        let mut source = TableOuterSource::new(vec![1_i32], vec![10])?;
        assert!(source.next_chunk(0).is_err());
        Ok(())
    }
}
