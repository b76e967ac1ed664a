/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2018 German Research Center for Artificial Intelligence (DFKI)
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

//! Device memory accounting.
//!
//! Accelerators have a bounded memory capacity that is shared by all
//! concurrently executing tasks. `DeviceArena` tracks how much of that
//! capacity is reserved. Operators reserve bytes before staging buffers on
//! the device, and release the reservation when the buffers are freed.
//!
//! The arena distinguishes between a reservation that cannot be satisfied
//! *right now*, because concurrent tasks hold memory, and one that can
//! *never* be satisfied. The former is a retryable condition, the latter is
//! an error.

use crate::error::{ErrorKind, Result};
use std::sync::{Arc, Mutex};

/// Outcome of a reservation attempt.
///
/// `Busy` means that concurrent reservations currently occupy the arena.
/// The caller should release resources or wait for other tasks to finish,
/// and then retry.
#[derive(Debug)]
pub enum Reservation {
    Granted(DeviceGrant),
    Busy,
}

#[derive(Debug)]
struct ArenaInner {
    capacity: usize,
    used: usize,
    peak: usize,
}

/// Byte-granular accounting of a device memory budget.
///
/// Cloning the arena yields a handle onto the same budget.
#[derive(Clone, Debug)]
pub struct DeviceArena {
    inner: Arc<Mutex<ArenaInner>>,
}

/// An active reservation of device memory.
///
/// The reserved bytes are returned to the arena when the grant is dropped.
#[derive(Debug)]
pub struct DeviceGrant {
    inner: Arc<Mutex<ArenaInner>>,
    bytes: usize,
}

impl DeviceArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ArenaInner {
                capacity,
                used: 0,
                peak: 0,
            })),
        }
    }

    /// Tries to reserve `bytes` of device memory.
    ///
    /// Returns `Reservation::Busy` when the remaining capacity is too small
    /// but other reservations are still active. Fails with
    /// `DeviceMemoryExhausted` when the request exceeds the capacity of an
    /// empty arena, as retrying cannot succeed in that case.
    pub fn try_reserve(&self, bytes: usize) -> Result<Reservation> {
        let mut inner = self.inner.lock().expect("Device arena lock poisoned");

        if bytes > inner.capacity {
            Err(ErrorKind::DeviceMemoryExhausted(format!(
                "Requested {} bytes, device capacity is {} bytes",
                bytes, inner.capacity
            )))?;
        }

        if inner.used + bytes > inner.capacity {
            return Ok(Reservation::Busy);
        }

        inner.used += bytes;
        if inner.used > inner.peak {
            inner.peak = inner.used;
        }

        Ok(Reservation::Granted(DeviceGrant {
            inner: Arc::clone(&self.inner),
            bytes,
        }))
    }

    pub fn capacity(&self) -> usize {
        self.inner
            .lock()
            .expect("Device arena lock poisoned")
            .capacity
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> usize {
        self.inner.lock().expect("Device arena lock poisoned").used
    }

    /// High-water mark of reserved bytes.
    pub fn peak(&self) -> usize {
        self.inner.lock().expect("Device arena lock poisoned").peak
    }
}

impl DeviceGrant {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for DeviceGrant {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().expect("Device arena lock poisoned");
        debug_assert!(inner.used >= self.bytes);
        inner.used -= self.bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_and_release() -> Result<()> {
        let arena = DeviceArena::new(1024);

        let grant = match arena.try_reserve(1000)? {
            Reservation::Granted(g) => g,
            Reservation::Busy => panic!("Arena should have capacity"),
        };
        assert_eq!(arena.used(), 1000);
        assert_eq!(grant.bytes(), 1000);

        match arena.try_reserve(100)? {
            Reservation::Busy => {}
            Reservation::Granted(_) => panic!("Arena should be busy"),
        }

        drop(grant);
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.peak(), 1000);

        Ok(())
    }

    #[test]
    fn oversized_request_fails() {
        let arena = DeviceArena::new(1024);
        assert!(arena.try_reserve(1025).is_err());
    }

    #[test]
    fn shared_budget_across_clones() -> Result<()> {
        let arena = DeviceArena::new(100);
        let other = arena.clone();

        let _grant = match arena.try_reserve(60)? {
            Reservation::Granted(g) => g,
            Reservation::Busy => panic!("Arena should have capacity"),
        };

        match other.try_reserve(60)? {
            Reservation::Busy => {}
            Reservation::Granted(_) => panic!("Clones must share the budget"),
        }

        Ok(())
    }
}
