/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Join plan definitions.
//!
//! A plan lists the inner relations joined onto the outer relation as a
//! sequence of depths. Depth 0 is the outer relation itself; depth `d >= 1`
//! joins the `d`-th inner relation onto the composite rows produced by depth
//! `d - 1`.

use crate::chunk::InnerChunk;
use crate::error::{ErrorKind, Result};
use crate::outer::OuterChunk;
use crate::{MAX_JOIN_DEPTH, TUPLE_OVERHEAD_BYTES};
use datagen::relation::KeyAttribute;
use std::mem::size_of;
use std::sync::Arc;

/// Join key and payload value type.
///
/// Relations store keys and payloads as a fixed-width machine type. The null
/// value is encoded in-band as [`KeyAttribute::null_key`].
pub trait JoinValue: KeyAttribute + Copy + Default + PartialEq + Send + Sync + 'static {
    /// Little-endian byte representation fed to the hash function.
    fn key_bytes(self) -> [u8; 8];

    /// True if the value is the in-band null marker.
    fn is_null(self) -> bool {
        self == Self::null_key()
    }
}

impl JoinValue for i32 {
    fn key_bytes(self) -> [u8; 8] {
        (self as i64).to_le_bytes()
    }
}

impl JoinValue for i64 {
    fn key_bytes(self) -> [u8; 8] {
        self.to_le_bytes()
    }
}

/// Join type of one depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    /// True if unmatched composite rows are emitted with null inner columns.
    pub fn fills_left(self) -> bool {
        match self {
            JoinType::Left | JoinType::Full => true,
            JoinType::Inner | JoinType::Right => false,
        }
    }

    /// True if unmatched inner rows are emitted with null outer columns.
    pub fn fills_right(self) -> bool {
        match self {
            JoinType::Right | JoinType::Full => true,
            JoinType::Inner | JoinType::Left => false,
        }
    }
}

/// Source of the key value that a depth probes or scans with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeKey {
    /// Key column of the outer chunk.
    OuterKey,
    /// Payload column of the inner row matched at the given depth.
    InnerPayload(usize),
}

/// A predicate over a composite row.
///
/// Predicates resolve column values through the [`EvalContext`] and must not
/// panic on null-extended sides.
pub type Predicate<T> = Arc<dyn Fn(&EvalContext<'_, T>, &Composite) -> bool + Send + Sync>;

/// Match strategy of one join depth.
#[derive(Clone)]
pub enum JoinStrategy<T> {
    /// Probe a chunked hash table with the probe key of the composite row.
    Hash {
        probe_key: ProbeKey,
        /// Residual predicate checked after key equality.
        join_predicate: Option<Predicate<T>>,
    },
    /// Scan the chunk window and test every candidate row.
    NestedLoop { join_predicate: Predicate<T> },
}

impl<T> JoinStrategy<T> {
    pub fn is_hash(&self) -> bool {
        match self {
            JoinStrategy::Hash { .. } => true,
            JoinStrategy::NestedLoop { .. } => false,
        }
    }
}

/// Specification of one join depth.
#[derive(Clone)]
pub struct DepthSpec<T> {
    pub join_type: JoinType,
    pub strategy: JoinStrategy<T>,

    /// Predicate applied after a candidate matched. Failing it drops the
    /// composite row but keeps the match bookkeeping of the outer join fill
    /// rules.
    pub other_predicate: Option<Predicate<T>>,

    /// Candidate filter that the accelerator cannot evaluate. A device task
    /// whose rows reach a matching candidate is replayed on the CPU.
    pub recheck_predicate: Option<Predicate<T>>,

    /// Planned ratio of rows leaving this depth over rows entering it.
    pub planned_rows_ratio: f64,

    /// Planned number of chunks of this inner relation.
    pub planned_batches: usize,
}

impl<T> DepthSpec<T> {
    pub fn new(join_type: JoinType, strategy: JoinStrategy<T>) -> Self {
        Self {
            join_type,
            strategy,
            other_predicate: None,
            recheck_predicate: None,
            planned_rows_ratio: 1.0,
            planned_batches: 1,
        }
    }
}

/// A multi-way join plan.
#[derive(Clone)]
pub struct JoinPlan<T> {
    /// Inner relations in join order. `depths[0]` is depth 1.
    pub depths: Vec<DepthSpec<T>>,

    /// Filter on outer rows, evaluated before any join depth.
    pub outer_filter: Option<Predicate<T>>,

    /// Planned number of outer relation rows.
    pub planned_outer_rows: f64,

    /// Planned selectivity of the outer filter.
    pub planned_outer_ratio: f64,

    /// Planned width in bytes of one result tuple.
    pub planned_result_width: usize,
}

impl<T: JoinValue> JoinPlan<T> {
    pub fn new(depths: Vec<DepthSpec<T>>) -> Self {
        let width = TUPLE_OVERHEAD_BYTES + (depths.len() + 1) * size_of::<T>();
        Self {
            depths,
            outer_filter: None,
            planned_outer_rows: 0.0,
            planned_outer_ratio: 1.0,
            planned_result_width: width,
        }
    }

    /// Number of inner relations.
    pub fn num_rels(&self) -> usize {
        self.depths.len()
    }

    pub fn depth(&self, depth: usize) -> &DepthSpec<T> {
        &self.depths[depth - 1]
    }

    pub fn validate(&self) -> Result<()> {
        if self.depths.is_empty() {
            Err(ErrorKind::InvalidArgument(
                "Join plan must have at least one inner relation".to_string(),
            ))?;
        }
        if self.depths.len() > MAX_JOIN_DEPTH {
            Err(ErrorKind::InvalidArgument(format!(
                "Join plan exceeds the maximum depth of {}",
                MAX_JOIN_DEPTH
            )))?;
        }
        for (i, spec) in self.depths.iter().enumerate() {
            let depth = i + 1;
            if let JoinStrategy::Hash { probe_key, .. } = &spec.strategy {
                if let ProbeKey::InnerPayload(d) = probe_key {
                    if *d == 0 || *d >= depth {
                        Err(ErrorKind::InvalidArgument(format!(
                            "Depth {} probes the payload of depth {}, which is not above it",
                            depth, d
                        )))?;
                    }
                }
            }
            if spec.planned_rows_ratio < 0.0 {
                Err(ErrorKind::InvalidArgument(format!(
                    "Depth {} has a negative planned rows ratio",
                    depth
                )))?;
            }
            if spec.planned_batches == 0 {
                Err(ErrorKind::InvalidArgument(format!(
                    "Depth {} plans zero chunks",
                    depth
                )))?;
            }
        }
        if self.planned_outer_rows < 0.0 {
            Err(ErrorKind::InvalidArgument(
                "Negative planned outer row count".to_string(),
            ))?;
        }
        if self.planned_outer_ratio < 0.0 || self.planned_outer_ratio > 1.0 {
            Err(ErrorKind::InvalidArgument(
                "Planned outer filter selectivity must be in [0, 1]".to_string(),
            ))?;
        }
        Ok(())
    }
}

/// A composite row under construction: the outer row and the inner row
/// matched at each depth. `None` marks a null-extended side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Composite {
    pub outer: Option<u32>,
    inner: [Option<u32>; MAX_JOIN_DEPTH],
}

impl Composite {
    pub fn with_outer(outer: Option<u32>) -> Self {
        Self {
            outer,
            inner: [None; MAX_JOIN_DEPTH],
        }
    }

    /// Inner row bound at `depth`, 1-based.
    pub fn inner(&self, depth: usize) -> Option<u32> {
        debug_assert!(depth >= 1 && depth <= MAX_JOIN_DEPTH);
        self.inner[depth - 1]
    }

    pub fn set_inner(&mut self, depth: usize, row: Option<u32>) {
        debug_assert!(depth >= 1 && depth <= MAX_JOIN_DEPTH);
        self.inner[depth - 1] = row;
    }

    /// Clears the bindings of `depth` and all deeper depths.
    pub fn clear_from(&mut self, depth: usize) {
        debug_assert!(depth >= 1);
        for slot in self.inner[depth - 1..].iter_mut() {
            *slot = None;
        }
    }
}

/// Resolves composite row references to column values during predicate
/// evaluation and result projection.
///
/// Depth 0 addresses the outer chunk; depth `d >= 1` addresses the inner
/// chunk joined at that depth. Null-extended sides resolve to `None`.
pub struct EvalContext<'a, T> {
    outer: Option<&'a OuterChunk<T>>,
    inners: &'a [Arc<InnerChunk<T>>],
}

impl<'a, T: JoinValue> EvalContext<'a, T> {
    pub fn new(outer: Option<&'a OuterChunk<T>>, inners: &'a [Arc<InnerChunk<T>>]) -> Self {
        Self { outer, inners }
    }

    /// Key column value at `depth`, or `None` when the side is null-extended
    /// or stores the null marker.
    pub fn key(&self, depth: usize, row: &Composite) -> Option<T> {
        let key = if depth == 0 {
            let id = row.outer?;
            self.outer?.key(id)
        } else {
            let id = row.inner(depth)?;
            self.inners[depth - 1].key(id)
        };
        if key.is_null() {
            None
        } else {
            Some(key)
        }
    }

    /// Payload column value at `depth`, or `None` when the side is
    /// null-extended.
    pub fn payload(&self, depth: usize, row: &Composite) -> Option<T> {
        if depth == 0 {
            let id = row.outer?;
            Some(self.outer?.payload(id))
        } else {
            let id = row.inner(depth)?;
            Some(self.inners[depth - 1].payload(id))
        }
    }

    /// Value of a probe key expression for `row`.
    pub fn probe_key(&self, probe: ProbeKey, row: &Composite) -> Option<T> {
        match probe {
            ProbeKey::OuterKey => self.key(0, row),
            ProbeKey::InnerPayload(d) => {
                let value = self.payload(d, row)?;
                if value.is_null() {
                    None
                } else {
                    Some(value)
                }
            }
        }
    }

    /// Payload projection of a finished composite row.
    pub fn project(&self, row: &Composite, num_rels: usize) -> Vec<Option<T>> {
        let mut columns = Vec::with_capacity(num_rels + 1);
        columns.push(self.payload(0, row));
        for depth in 1..=num_rels {
            columns.push(self.payload(depth, row));
        }
        columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    fn nl_predicate() -> Predicate<i32> {
        Arc::new(|_, _| true)
    }

    fn hash_depth(join_type: JoinType, probe_key: ProbeKey) -> DepthSpec<i32> {
        DepthSpec::new(
            join_type,
            JoinStrategy::Hash {
                probe_key,
                join_predicate: None,
            },
        )
    }

    #[test]
    fn valid_plan_passes_validation() -> Result<()> {
        let plan = JoinPlan::new(vec![
            hash_depth(JoinType::Inner, ProbeKey::OuterKey),
            hash_depth(JoinType::Left, ProbeKey::InnerPayload(1)),
            DepthSpec::new(
                JoinType::Inner,
                JoinStrategy::NestedLoop {
                    join_predicate: nl_predicate(),
                },
            ),
        ]);

        plan.validate()
    }

    #[test]
    fn empty_plan_fails_validation() {
        let plan: JoinPlan<i32> = JoinPlan::new(Vec::new());
        assert!(plan.validate().is_err());
    }

    #[test]
    fn forward_probe_key_reference_fails_validation() {
        let plan = JoinPlan::new(vec![
            hash_depth(JoinType::Inner, ProbeKey::InnerPayload(1)),
            hash_depth(JoinType::Inner, ProbeKey::OuterKey),
        ]);

        assert!(plan.validate().is_err());
    }

    #[test]
    fn composite_clears_deeper_bindings() {
        let mut row = Composite::with_outer(Some(7));
        row.set_inner(1, Some(1));
        row.set_inner(2, Some(2));
        row.set_inner(3, Some(3));

        row.clear_from(2);

        assert_eq!(row.inner(1), Some(1));
        assert_eq!(row.inner(2), None);
        assert_eq!(row.inner(3), None);
    }

    #[test]
    fn join_type_fill_rules() {
        assert!(!JoinType::Inner.fills_left());
        assert!(JoinType::Left.fills_left());
        assert!(JoinType::Full.fills_left());
        assert!(JoinType::Right.fills_right());
        assert!(JoinType::Full.fills_right());
        assert!(!JoinType::Left.fills_right());
    }

    #[test]
    fn null_marker_is_detected() {
        assert!(i32::null_key().is_null());
        assert!(!42_i32.is_null());
        assert!(i64::null_key().is_null());
    }
}
