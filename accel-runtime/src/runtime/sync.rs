/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

//! Synchronization primitives for device loading.

use std::sync::{Condvar, Mutex};

/// A one-shot event for single-producer, multi-consumer barriers.
///
/// One thread performs a load and signals the event once; any number of
/// threads wait for the signal before depending on the loaded state. Waiting
/// on an already-signaled event returns immediately. The event stays
/// signaled forever, mirroring the completion semantics of a device transfer.
#[derive(Debug, Default)]
pub struct OneshotEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl OneshotEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().expect("Event lock poisoned");
        *signaled = true;
        self.condvar.notify_all();
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().expect("Event lock poisoned");
        while !*signaled {
            signaled = self
                .condvar
                .wait(signaled)
                .expect("Event lock poisoned");
        }
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock().expect("Event lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn waiters_observe_signal() {
        let event = Arc::new(OneshotEvent::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let event = Arc::clone(&event);
                thread::spawn(move || event.wait())
            })
            .collect();

        event.signal();
        for waiter in waiters {
            waiter.join().expect("Waiter panicked");
        }

        assert!(event.is_signaled());
    }

    #[test]
    fn wait_after_signal_returns_immediately() {
        let event = OneshotEvent::new();
        event.signal();
        event.wait();
    }
}
