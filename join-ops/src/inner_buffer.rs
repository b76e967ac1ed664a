/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! The shared inner relation buffer.
//!
//! One buffer snapshots one chunk combination: one chunk per inner relation.
//! All concurrent tasks of the combination attach to the same buffer. Device
//! residency is reference counted separately from attachment, so the chunks
//! can be unloaded between bursts of tasks while the host keeps the buffer
//! alive.
//!
//! RIGHT and FULL depths carry a match bitmap with one bit per inner row.
//! Device runs mark the device copy, the CPU fallback marks the host copy,
//! and colocation OR-merges one side into the other. Bits are only ever set,
//! so the merge direction order does not lose matches.
//!
//! Match state belongs to the chunk, not to the buffer: when a chunk recurs
//! across combinations, every buffer holding it shares one [`MatchMap`], and
//! the unmatched-inner sweep of a depth is deferred until the combination
//! where all shallower chunk lists stand at their last chunk. Rows probe a
//! depth only through composites of the shallower relations, so at that
//! point the map is final.

use crate::accel::Accelerator;
use crate::chunk::InnerChunk;
use crate::error::{ErrorKind, Result};
use crate::plan::JoinValue;
use crate::stats::RuntimeStats;
use accel_runtime::runtime::memory::{DeviceArena, DeviceGrant, Reservation};
use accel_runtime::runtime::sync::OneshotEvent;
use bitflags::bitflags;
use log::trace;
use std::sync::{Arc, Mutex};

bitflags! {
    /// Properties of one preloaded inner relation depth.
    pub struct DepthFlags: u32 {
        /// Depth is scanned by nested loop instead of hash probing.
        const NESTED_LOOP = 0b0001;
        /// Unmatched composite rows are null-extended (LEFT or FULL).
        const FILLS_LEFT = 0b0010;
        /// Unmatched inner rows are null-extended (RIGHT or FULL).
        const FILLS_RIGHT = 0b0100;
    }
}

/// Outcome of requesting device residency.
#[derive(Debug, PartialEq, Eq)]
pub enum DeviceGetOutcome {
    /// The buffer is resident and the caller holds a device reference.
    Ready,
    /// Device memory is exhausted by other holders. Retry after a task
    /// completes.
    Busy,
}

/// Outcome of releasing an attachment.
#[derive(Debug, PartialEq, Eq)]
pub enum DetachOutcome {
    /// Other tasks remain attached.
    Alive,
    /// The caller must schedule the unmatched-inner sweep. The caller's
    /// attachment transfers to the sweep task.
    ResidualNeeded,
    /// The last attachment was released and all resources were freed.
    Destroyed,
}

struct HostMatchBits {
    live: Vec<bool>,
    /// Staging area that receives the device bits before the OR-merge.
    recv: Vec<bool>,
}

/// Match bitmap of one chunk at one RIGHT or FULL depth.
///
/// Shared by every buffer combination that holds the chunk; bits therefore
/// survive buffer teardown until the last combination sweeps the depth.
pub struct MatchMap {
    len: usize,
    host: Mutex<HostMatchBits>,
    device: Mutex<Vec<bool>>,
}

impl MatchMap {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            host: Mutex::new(HostMatchBits {
                live: vec![false; len],
                recv: vec![false; len],
            }),
            device: Mutex::new(vec![false; len]),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn host_match(&self, row: u32) -> bool {
        self.host.lock().expect("Host match bitmap lock poisoned").live[row as usize]
    }

    fn set_host_match(&self, row: u32) {
        self.host.lock().expect("Host match bitmap lock poisoned").live[row as usize] = true;
    }

    fn device_match(&self, row: u32) -> bool {
        self.device.lock().expect("Device match bitmap lock poisoned")[row as usize]
    }

    fn set_device_match(&self, row: u32) {
        self.device.lock().expect("Device match bitmap lock poisoned")[row as usize] = true;
    }

    fn merge_device_into_host(&self) {
        let mut host = self.host.lock().expect("Host match bitmap lock poisoned");
        {
            let device = self.device.lock().expect("Device match bitmap lock poisoned");
            host.recv.copy_from_slice(&device);
        }
        let HostMatchBits { live, recv } = &mut *host;
        for (live_bit, recv_bit) in live.iter_mut().zip(recv.iter()) {
            *live_bit |= *recv_bit;
        }
    }

    fn merge_host_into_device(&self) {
        let host = self.host.lock().expect("Host match bitmap lock poisoned");
        let mut device = self.device.lock().expect("Device match bitmap lock poisoned");
        for (device_bit, host_bit) in device.iter_mut().zip(host.live.iter()) {
            *device_bit |= *host_bit;
        }
    }
}

struct Residency {
    grant: DeviceGrant,
    loaded: Arc<OneshotEvent>,
}

struct BufferState {
    attached: usize,
    device_refs: usize,
    residency: Option<Residency>,
    /// Device allocation of the match bitmap. Allocated by the first load
    /// and kept across load cycles, because the device bits accumulate over
    /// the whole combination.
    bitmap_grant: Option<DeviceGrant>,
    needs_residual: bool,
    fallback_seen: bool,
}

/// Snapshot of one chunk combination, shared by all its tasks.
pub struct InnerBuffer<T> {
    chunks: Vec<Arc<InnerChunk<T>>>,
    flags: Vec<DepthFlags>,
    maps: Vec<Option<Arc<MatchMap>>>,
    map_len: usize,
    sweepable: Vec<bool>,
    state: Mutex<BufferState>,
    combo_id: usize,
}

impl<T: JoinValue> InnerBuffer<T> {
    /// Creates the buffer with one attachment held by the caller and a
    /// fresh match map per RIGHT/FULL depth.
    pub fn new(combo_id: usize, depths: Vec<(Arc<InnerChunk<T>>, DepthFlags)>) -> Self {
        let maps = depths
            .iter()
            .map(|(chunk, flags)| {
                if flags.contains(DepthFlags::FILLS_RIGHT) {
                    Some(Arc::new(MatchMap::new(chunk.len())))
                } else {
                    None
                }
            })
            .collect();
        Self::with_match_maps(combo_id, depths, maps)
    }

    /// Creates the buffer around match maps shared with other combinations.
    pub fn with_match_maps(
        combo_id: usize,
        depths: Vec<(Arc<InnerChunk<T>>, DepthFlags)>,
        maps: Vec<Option<Arc<MatchMap>>>,
    ) -> Self {
        debug_assert_eq!(depths.len(), maps.len());
        let mut map_len = 0;
        let mut sweepable = Vec::with_capacity(depths.len());
        for ((chunk, flags), map) in depths.iter().zip(maps.iter()) {
            match map {
                Some(map) => {
                    debug_assert!(flags.contains(DepthFlags::FILLS_RIGHT));
                    debug_assert_eq!(map.len(), chunk.len());
                    map_len += map.len();
                    sweepable.push(true);
                }
                None => {
                    debug_assert!(!flags.contains(DepthFlags::FILLS_RIGHT));
                    sweepable.push(false);
                }
            }
        }
        let needs_residual = map_len > 0;

        let (chunks, flags): (Vec<_>, Vec<_>) = depths.into_iter().unzip();

        Self {
            chunks,
            flags,
            maps,
            map_len,
            sweepable,
            state: Mutex::new(BufferState {
                attached: 1,
                device_refs: 0,
                residency: None,
                bitmap_grant: None,
                needs_residual,
                fallback_seen: false,
            }),
            combo_id,
        }
    }

    /// Withholds the unmatched-inner sweep of `depth` from this combination.
    ///
    /// Used while shallower chunk lists still have combinations to visit;
    /// the depth's shared map keeps accumulating matches and the last
    /// combination sweeps it.
    pub fn defer_sweep(&mut self, depth: usize) {
        debug_assert!(self.flags[depth - 1].contains(DepthFlags::FILLS_RIGHT));
        self.sweepable[depth - 1] = false;
        let owes = self.sweepable.iter().any(|&s| s);
        self.state
            .lock()
            .expect("Inner buffer state lock poisoned")
            .needs_residual = owes;
    }

    /// True when this combination's residual task may sweep `depth`.
    pub fn sweep_allowed(&self, depth: usize) -> bool {
        self.sweepable[depth - 1]
    }

    pub fn num_rels(&self) -> usize {
        self.chunks.len()
    }

    pub fn combo_id(&self) -> usize {
        self.combo_id
    }

    /// Chunk of the inner relation at `depth`, 1-based.
    pub fn chunk(&self, depth: usize) -> &Arc<InnerChunk<T>> {
        &self.chunks[depth - 1]
    }

    pub fn chunks(&self) -> &[Arc<InnerChunk<T>>] {
        &self.chunks
    }

    pub fn depth_flags(&self, depth: usize) -> DepthFlags {
        self.flags[depth - 1]
    }

    pub fn item_count(&self, depth: usize) -> usize {
        self.chunks[depth - 1].len()
    }

    /// Accounted bytes of the relation chunks.
    pub fn chunk_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.accounted_bytes()).sum()
    }

    /// Accounted device bytes the next residency request must still reserve.
    pub fn device_bytes_needed(&self) -> usize {
        let state = self.state.lock().expect("Inner buffer state lock poisoned");
        let bitmap_bytes = if state.bitmap_grant.is_some() {
            0
        } else {
            2 * self.map_len
        };
        self.chunk_bytes() + bitmap_bytes
    }

    pub fn has_match_bits(&self) -> bool {
        self.map_len > 0
    }

    pub fn needs_residual(&self) -> bool {
        self.state
            .lock()
            .expect("Inner buffer state lock poisoned")
            .needs_residual
    }

    pub fn mark_fallback(&self) {
        self.state
            .lock()
            .expect("Inner buffer state lock poisoned")
            .fallback_seen = true;
    }

    pub fn fallback_seen(&self) -> bool {
        self.state
            .lock()
            .expect("Inner buffer state lock poisoned")
            .fallback_seen
    }

    /// Registers one more task on the buffer.
    pub fn attach(&self) {
        let mut state = self.state.lock().expect("Inner buffer state lock poisoned");
        debug_assert!(state.attached > 0);
        state.attached += 1;
    }

    /// Releases one attachment.
    ///
    /// With `may_kick`, the last detach of a buffer that still owes the
    /// unmatched-inner sweep reports [`DetachOutcome::ResidualNeeded`] and
    /// keeps the attachment for the sweep task.
    pub fn detach(&self, may_kick: bool) -> DetachOutcome {
        let mut state = self.state.lock().expect("Inner buffer state lock poisoned");
        debug_assert!(state.attached > 0);

        if may_kick && state.attached == 1 && state.needs_residual {
            state.needs_residual = false;
            return DetachOutcome::ResidualNeeded;
        }

        state.attached -= 1;
        if state.attached == 0 {
            debug_assert_eq!(state.device_refs, 0);
            state.residency = None;
            state.bitmap_grant = None;
            DetachOutcome::Destroyed
        } else {
            DetachOutcome::Alive
        }
    }

    /// Acquires device residency for the caller.
    ///
    /// The first caller becomes the loader: it reserves arena memory and
    /// stages the chunks through the accelerator. Concurrent callers wait on
    /// the load event. When the arena cannot hold the buffer next to other
    /// holders, the request reports [`DeviceGetOutcome::Busy`] and the
    /// caller retries later; a buffer that cannot fit on an idle device is
    /// an error.
    pub fn device_get(
        &self,
        arena: &DeviceArena,
        accel: &dyn Accelerator<T>,
        stats: &RuntimeStats,
    ) -> Result<DeviceGetOutcome> {
        let event = {
            let mut state = self.state.lock().expect("Inner buffer state lock poisoned");
            let resident = state.residency.as_ref().map(|r| r.loaded.clone());
            match resident {
                Some(event) => {
                    state.device_refs += 1;
                    event
                }
                None if state.device_refs == 0 => {
                    if self.map_len > 0 && state.bitmap_grant.is_none() {
                        // Live bits plus the staging area.
                        match arena.try_reserve(2 * self.map_len)? {
                            Reservation::Granted(grant) => state.bitmap_grant = Some(grant),
                            Reservation::Busy => return Ok(DeviceGetOutcome::Busy),
                        }
                    }
                    let chunk_bytes = self.chunk_bytes();
                    let grant = match arena.try_reserve(chunk_bytes)? {
                        Reservation::Granted(grant) => grant,
                        Reservation::Busy => return Ok(DeviceGetOutcome::Busy),
                    };
                    let loaded = Arc::new(OneshotEvent::default());
                    state.residency = Some(Residency {
                        grant,
                        loaded: loaded.clone(),
                    });
                    state.device_refs = 1;
                    drop(state);
                    trace!("staging {} inner bytes to the device", chunk_bytes);

                    return match accel.stage_inner(self) {
                        Ok(()) => {
                            stats.record_inner_load(chunk_bytes as u64);
                            loaded.signal();
                            Ok(DeviceGetOutcome::Ready)
                        }
                        Err(e) => {
                            let mut state =
                                self.state.lock().expect("Inner buffer state lock poisoned");
                            state.device_refs -= 1;
                            state.residency = None;
                            drop(state);
                            loaded.signal();
                            Err(e)
                        }
                    };
                }
                None => {
                    // A failed load is draining its waiters; the join is
                    // already aborting.
                    return Err(ErrorKind::RuntimeError(
                        "Inner relation staging failed on a concurrent task".to_string(),
                    )
                    .into());
                }
            }
        };

        event.wait();

        let mut state = self.state.lock().expect("Inner buffer state lock poisoned");
        if state.residency.is_some() {
            Ok(DeviceGetOutcome::Ready)
        } else {
            state.device_refs -= 1;
            Err(ErrorKind::RuntimeError(
                "Inner relation staging failed on a concurrent task".to_string(),
            )
            .into())
        }
    }

    /// Releases one device reference. The last release unstages the chunks
    /// and frees their arena reservation; the bitmap reservation persists.
    pub fn device_put(&self, accel: &dyn Accelerator<T>) {
        let mut state = self.state.lock().expect("Inner buffer state lock poisoned");
        debug_assert!(state.device_refs > 0);
        state.device_refs -= 1;
        if state.device_refs == 0 {
            accel.unstage_inner(self);
            state.residency = None;
        }
    }

    fn map(&self, depth: usize) -> &MatchMap {
        let map = self.maps[depth - 1]
            .as_deref()
            .expect("Match bitmap access on a depth without unmatched-inner tracking");
        debug_assert_eq!(map.len(), self.chunks[depth - 1].len());
        map
    }

    pub fn host_match(&self, depth: usize, row: u32) -> bool {
        self.map(depth).host_match(row)
    }

    pub fn set_host_match(&self, depth: usize, row: u32) {
        self.map(depth).set_host_match(row)
    }

    pub fn device_match(&self, depth: usize, row: u32) -> bool {
        self.map(depth).device_match(row)
    }

    pub fn set_device_match(&self, depth: usize, row: u32) {
        self.map(depth).set_device_match(row)
    }

    /// OR-merges the device bits into the host bits through the staging
    /// area.
    pub fn merge_device_bits_into_host(&self) {
        for map in self.maps.iter().flatten() {
            map.merge_device_into_host();
        }
    }

    /// OR-merges the host bits into the device bits.
    pub fn merge_host_bits_into_device(&self) {
        for map in self.maps.iter().flatten() {
            map.merge_host_into_device();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{Accelerator, RunOutput};
    use crate::chunk::RowChunk;
    use crate::error::Result;
    use crate::task::JoinTask;

    struct NoopAccel;

    impl Accelerator<i32> for NoopAccel {
        fn stage_inner(&self, _buffer: &InnerBuffer<i32>) -> Result<()> {
            Ok(())
        }

        fn unstage_inner(&self, _buffer: &InnerBuffer<i32>) {}

        fn colocate_match_bits_to_host(&self, buffer: &InnerBuffer<i32>) -> Result<()> {
            buffer.merge_device_bits_into_host();
            Ok(())
        }

        fn colocate_match_bits_to_device(&self, buffer: &InnerBuffer<i32>) -> Result<()> {
            buffer.merge_host_bits_into_device();
            Ok(())
        }

        fn run(&self, _task: &mut JoinTask<i32>) -> Result<RunOutput<i32>> {
            unreachable!("Lifecycle tests never run tasks")
        }
    }

    fn row_chunk(n: i32) -> Arc<InnerChunk<i32>> {
        Arc::new(InnerChunk::Row(RowChunk::from_rows(
            (0..n).map(|k| (k, k)).collect(),
        )))
    }

    fn buffer_with_right_depth() -> InnerBuffer<i32> {
        InnerBuffer::new(
            0,
            vec![
                (row_chunk(8), DepthFlags::NESTED_LOOP),
                (
                    row_chunk(16),
                    DepthFlags::NESTED_LOOP | DepthFlags::FILLS_RIGHT,
                ),
            ],
        )
    }

    #[test]
    fn detach_kicks_residual_exactly_once() {
        let buffer = buffer_with_right_depth();
        buffer.attach();

        assert_eq!(buffer.detach(true), DetachOutcome::Alive);
        // Last detach owes the sweep and keeps the attachment for it.
        assert_eq!(buffer.detach(true), DetachOutcome::ResidualNeeded);
        // The sweep task's detach destroys the buffer.
        assert_eq!(buffer.detach(true), DetachOutcome::Destroyed);
    }

    #[test]
    fn detach_without_kick_skips_residual() {
        let buffer = buffer_with_right_depth();
        assert_eq!(buffer.detach(false), DetachOutcome::Destroyed);
    }

    #[test]
    fn inner_only_buffer_never_owes_residual() {
        let buffer = InnerBuffer::new(0, vec![(row_chunk(8), DepthFlags::empty())]);
        assert!(!buffer.needs_residual());
        assert_eq!(buffer.detach(true), DetachOutcome::Destroyed);
    }

    #[test]
    fn deferred_sweep_waives_the_residual() {
        let mut buffer = buffer_with_right_depth();
        buffer.defer_sweep(2);
        assert!(!buffer.sweep_allowed(2));
        assert!(!buffer.needs_residual());
        assert_eq!(buffer.detach(true), DetachOutcome::Destroyed);
    }

    #[test]
    fn shared_map_carries_matches_across_combinations() {
        let chunk = row_chunk(4);
        let map = Arc::new(MatchMap::new(4));

        let first = InnerBuffer::with_match_maps(
            0,
            vec![(Arc::clone(&chunk), DepthFlags::FILLS_RIGHT)],
            vec![Some(Arc::clone(&map))],
        );
        first.set_host_match(1, 2);
        assert_eq!(first.detach(false), DetachOutcome::Destroyed);

        let second = InnerBuffer::with_match_maps(
            1,
            vec![(chunk, DepthFlags::FILLS_RIGHT)],
            vec![Some(map)],
        );
        assert!(second.host_match(1, 2));
        assert!(!second.host_match(1, 3));
    }

    #[test]
    fn device_refcount_drives_load_and_unload() -> Result<()> {
        let buffer = buffer_with_right_depth();
        let arena = DeviceArena::new(1 << 20);
        let stats = RuntimeStats::new(2);
        let accel = NoopAccel;

        assert_eq!(
            buffer.device_get(&arena, &accel, &stats)?,
            DeviceGetOutcome::Ready
        );
        let after_load = arena.used();
        assert!(after_load > 0);

        // Second holder rides the existing residency without a new load.
        assert_eq!(
            buffer.device_get(&arena, &accel, &stats)?,
            DeviceGetOutcome::Ready
        );
        assert_eq!(arena.used(), after_load);
        assert_eq!(stats.snapshot().inner_loads, 1);

        buffer.device_put(&accel);
        assert_eq!(arena.used(), after_load);
        buffer.device_put(&accel);

        // Chunks unloaded, bitmap reservation persists.
        assert_eq!(arena.used(), 2 * 16);
        Ok(())
    }

    #[test]
    fn concurrent_holders_share_one_load() -> Result<()> {
        let buffer = buffer_with_right_depth();
        let arena = DeviceArena::new(1 << 20);
        let stats = RuntimeStats::new(2);
        let accel = NoopAccel;
        // No holder releases before every holder acquired, so the buffer
        // must stay resident across all four acquisitions.
        let all_holding = std::sync::Barrier::new(4);

        crossbeam_utils::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let buffer = &buffer;
                    let arena = &arena;
                    let stats = &stats;
                    let accel = &accel;
                    let all_holding = &all_holding;
                    scope.spawn(move |_| {
                        let outcome = buffer.device_get(arena, accel, stats)?;
                        assert_eq!(outcome, DeviceGetOutcome::Ready);
                        all_holding.wait();
                        buffer.device_put(accel);
                        Ok(())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("Holder thread panicked"))
                .collect::<Result<Vec<()>>>()
        })
        .expect("Thread scope panicked")?;

        assert_eq!(stats.snapshot().inner_loads, 1);
        // All holders released; only the bitmap reservation remains.
        assert_eq!(arena.used(), 2 * 16);
        Ok(())
    }

    #[test]
    fn busy_arena_defers_the_load() -> Result<()> {
        let buffer = buffer_with_right_depth();
        let arena = DeviceArena::new(1 << 20);
        let stats = RuntimeStats::new(2);
        let accel = NoopAccel;

        let hold = match arena.try_reserve((1 << 20) - 64) {
            Ok(Reservation::Granted(grant)) => grant,
            _ => panic!("Reservation must succeed on an idle arena"),
        };

        assert_eq!(
            buffer.device_get(&arena, &accel, &stats)?,
            DeviceGetOutcome::Busy
        );

        drop(hold);
        assert_eq!(
            buffer.device_get(&arena, &accel, &stats)?,
            DeviceGetOutcome::Ready
        );
        buffer.device_put(&accel);
        Ok(())
    }

    #[test]
    fn match_bits_merge_both_ways() {
        let buffer = buffer_with_right_depth();

        buffer.set_device_match(2, 3);
        buffer.set_host_match(2, 5);

        buffer.merge_device_bits_into_host();
        assert!(buffer.host_match(2, 3));
        assert!(buffer.host_match(2, 5));
        assert!(!buffer.host_match(2, 4));

        buffer.merge_host_bits_into_device();
        assert!(buffer.device_match(2, 5));
        assert!(buffer.device_match(2, 3));
    }
}
