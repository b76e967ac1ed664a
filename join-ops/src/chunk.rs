/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Inner relation chunks.
//!
//! An inner relation is preloaded into one or more chunks. Nested loop
//! depths use plain row chunks; hash depths use chunks with a bucket-chained
//! hash table built over the rows. Every chunk accounts its size in bytes so
//! that the preloader and the device memory arena agree on budgets.

use crate::plan::JoinValue;
use crate::{CHUNK_HEAD_BYTES, TUPLE_OVERHEAD_BYTES};
use once_cell::sync::Lazy;
use std::mem::size_of;

/// Sentinel for an empty hash bucket or chain end.
const EMPTY_SLOT: u32 = u32::MAX;

/// Accounted per-row overhead of the hash table: hash value, chain link, and
/// the amortized bucket slot.
const HASH_ENTRY_BYTES: usize = 12;

static CRC32_TABLE: Lazy<[u32; 256]> = Lazy::new(|| {
    let mut table = [0_u32; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let mut crc = i as u32;
        for _ in 0..8 {
            crc = if crc & 1 == 1 {
                0xEDB8_8320 ^ (crc >> 1)
            } else {
                crc >> 1
            };
        }
        *entry = crc;
    }
    table
});

/// CRC32 hash of a join key.
pub fn key_hash<T: JoinValue>(key: T) -> u32 {
    let mut crc = u32::MAX;
    for byte in key.key_bytes().iter() {
        let index = ((crc ^ u32::from(*byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

/// Hash assigned to an absent probe key: the CRC of no bytes.
///
/// An absent key matches nothing, but the chunk whose hash range covers
/// this value owns the null extension when the depth fills left.
pub const NULL_KEY_HASH: u32 = 0;

/// Accounted bytes of one row in a plain row chunk.
pub fn row_cost<T>() -> usize {
    TUPLE_OVERHEAD_BYTES + 2 * size_of::<T>()
}

/// Accounted bytes of one row in a hash chunk.
pub fn hash_row_cost<T>() -> usize {
    row_cost::<T>() + HASH_ENTRY_BYTES
}

/// A plain chunk of inner relation rows, scanned by nested loop depths.
#[derive(Debug)]
pub struct RowChunk<T> {
    keys: Vec<T>,
    payloads: Vec<T>,
}

impl<T: JoinValue> RowChunk<T> {
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

    pub fn accounted_bytes(&self) -> usize {
        CHUNK_HEAD_BYTES + self.len() * row_cost::<T>()
    }
}

/// A chunk of inner relation rows with a bucket-chained hash table.
///
/// The chunk covers the inclusive hash range `[hash_min, hash_max]`. Hash
/// ranges of the chunks of one relation tile the full 32-bit space, so that
/// exactly one chunk is responsible for any probe hash. Unsplit relations
/// cover the full range.
#[derive(Debug)]
pub struct HashChunk<T> {
    keys: Vec<T>,
    payloads: Vec<T>,
    hashes: Vec<u32>,
    buckets: Vec<u32>,
    next: Vec<u32>,
    hash_min: u32,
    hash_max: u32,
}

impl<T: JoinValue> HashChunk<T> {
    pub fn build(rows: Vec<(T, T)>, hash_min: u32, hash_max: u32) -> Self {
        debug_assert!(hash_min <= hash_max);
        let nitems = rows.len();
        let nslots = nitems.next_power_of_two().max(16);

        let mut keys = Vec::with_capacity(nitems);
        let mut payloads = Vec::with_capacity(nitems);
        let mut hashes = Vec::with_capacity(nitems);
        let mut buckets = vec![EMPTY_SLOT; nslots];
        let mut next = vec![EMPTY_SLOT; nitems];

        for (i, (key, payload)) in rows.into_iter().enumerate() {
            let hash = key_hash(key);
            debug_assert!(hash >= hash_min && hash <= hash_max);
            let bucket = (hash as usize) & (nslots - 1);
            next[i] = buckets[bucket];
            buckets[bucket] = i as u32;
            keys.push(key);
            payloads.push(payload);
            hashes.push(hash);
        }

        Self {
            keys,
            payloads,
            hashes,
            buckets,
            next,
            hash_min,
            hash_max,
        }
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

    pub fn hash(&self, row: u32) -> u32 {
        self.hashes[row as usize]
    }

    pub fn hash_range(&self) -> (u32, u32) {
        (self.hash_min, self.hash_max)
    }

    pub fn covers(&self, hash: u32) -> bool {
        hash >= self.hash_min && hash <= self.hash_max
    }

    /// First row of the bucket chain for `hash`.
    pub fn first_in_bucket(&self, hash: u32) -> Option<u32> {
        let bucket = (hash as usize) & (self.buckets.len() - 1);
        match self.buckets[bucket] {
            EMPTY_SLOT => None,
            row => Some(row),
        }
    }

    /// Successor of `row` in its bucket chain.
    pub fn next_in_chain(&self, row: u32) -> Option<u32> {
        match self.next[row as usize] {
            EMPTY_SLOT => None,
            next => Some(next),
        }
    }

    pub fn accounted_bytes(&self) -> usize {
        CHUNK_HEAD_BYTES + self.len() * hash_row_cost::<T>()
    }
}

/// A chunk of one inner relation, in the representation its join strategy
/// needs.
#[derive(Debug)]
pub enum InnerChunk<T> {
    Row(RowChunk<T>),
    Hash(HashChunk<T>),
}

impl<T: JoinValue> InnerChunk<T> {
    pub fn len(&self) -> usize {
        match self {
            InnerChunk::Row(chunk) => chunk.len(),
            InnerChunk::Hash(chunk) => chunk.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn key(&self, row: u32) -> T {
        match self {
            InnerChunk::Row(chunk) => chunk.key(row),
            InnerChunk::Hash(chunk) => chunk.key(row),
        }
    }

    pub fn payload(&self, row: u32) -> T {
        match self {
            InnerChunk::Row(chunk) => chunk.payload(row),
            InnerChunk::Hash(chunk) => chunk.payload(row),
        }
    }

    pub fn accounted_bytes(&self) -> usize {
        match self {
            InnerChunk::Row(chunk) => chunk.accounted_bytes(),
            InnerChunk::Hash(chunk) => chunk.accounted_bytes(),
        }
    }

    pub fn as_hash(&self) -> Option<&HashChunk<T>> {
        match self {
            InnerChunk::Row(_) => None,
            InnerChunk::Hash(chunk) => Some(chunk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_hash_equally() {
        assert_eq!(key_hash(42_i32), key_hash(42_i32));
        assert_eq!(key_hash(42_i64), key_hash(42_i64));
        assert_ne!(key_hash(1_i32), key_hash(2_i32));
    }

    #[test]
    fn bucket_chain_yields_all_duplicates() {
        let rows: Vec<(i32, i32)> = vec![(7, 0), (3, 1), (7, 2), (11, 3), (7, 4)];
        let chunk = HashChunk::build(rows, 0, u32::MAX);

        let hash = key_hash(7_i32);
        let mut matches = Vec::new();
        let mut cursor = chunk.first_in_bucket(hash);
        while let Some(row) = cursor {
            if chunk.hash(row) == hash && chunk.key(row) == 7 {
                matches.push(chunk.payload(row));
            }
            cursor = chunk.next_in_chain(row);
        }

        matches.sort();
        assert_eq!(matches, vec![0, 2, 4]);
    }

    #[test]
    fn probe_misses_absent_key() {
        let rows: Vec<(i32, i32)> = (0..64).map(|k| (2 * k, k)).collect();
        let chunk = HashChunk::build(rows, 0, u32::MAX);

        let hash = key_hash(999_i32);
        let mut cursor = chunk.first_in_bucket(hash);
        let mut found = false;
        while let Some(row) = cursor {
            if chunk.hash(row) == hash && chunk.key(row) == 999 {
                found = true;
            }
            cursor = chunk.next_in_chain(row);
        }
        assert!(!found);
    }

    #[test]
    fn accounted_bytes_grow_with_rows() {
        let small = RowChunk::<i64>::from_rows((0..10).map(|k| (k, k)).collect());
        let large = RowChunk::<i64>::from_rows((0..100).map(|k| (k, k)).collect());
        assert!(small.accounted_bytes() < large.accounted_bytes());
        assert_eq!(
            small.accounted_bytes(),
            CHUNK_HEAD_BYTES + 10 * row_cost::<i64>()
        );
    }

    #[test]
    fn empty_hash_chunk_covers_its_range() {
        let chunk = HashChunk::<i32>::build(Vec::new(), 0, u32::MAX);
        assert!(chunk.is_empty());
        assert!(chunk.covers(0));
        assert!(chunk.covers(u32::MAX));
        assert_eq!(chunk.first_in_bucket(key_hash(1_i32)), None);
    }

    #[test]
    fn row_lookup_preserves_order() {
        let chunk = RowChunk::<i32>::from_rows(vec![(5, 50), (6, 60), (7, 70)]);
        assert_eq!(chunk.key(1), 6);
        assert_eq!(chunk.payload(2), 70);
        assert_eq!(chunk.len(), 3);
    }
}
