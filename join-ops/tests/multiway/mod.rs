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

use join_ops::plan::{JoinType, JoinValue};
use std::error::Error;
use std::result::Result;

/// Composite row under construction. Slot 0 holds the outer row, slot `d`
/// the row bound at depth `d`. `None` is a null-extended or unbound slot.
pub type Slots = Vec<Option<(i32, i32)>>;

/// Match predicate over the composite built so far and one candidate row.
pub type MatchFn = Box<dyn Fn(&Slots, (i32, i32)) -> bool>;

pub struct OracleDepth {
    pub join_type: JoinType,
    pub key_match: MatchFn,
    pub other: Option<MatchFn>,
}

/// Joins the relations row by row with the same match and null semantics as
/// the executor: a key match claims the inner row even when the residual
/// predicate drops the composite, unmatched composites null-extend on
/// LEFT/FULL depths, and unmatched inner rows of RIGHT/FULL depths are
/// emitted once after all probes finished, shallowest depth first.
pub fn reference_join(
    outer: &[(i32, i32)],
    inners: &[Vec<(i32, i32)>],
    depths: &[OracleDepth],
    outer_filter: Option<&dyn Fn((i32, i32)) -> bool>,
) -> Vec<Vec<Option<i32>>> {
    let num_rels = depths.len();
    let mut matched: Vec<Vec<bool>> = inners.iter().map(|rows| vec![false; rows.len()]).collect();
    let mut results = Vec::new();

    for &row in outer {
        if !outer_filter.map_or(true, |filter| filter(row)) {
            continue;
        }
        let mut slots: Slots = vec![None; num_rels + 1];
        slots[0] = Some(row);
        descend(1, &mut slots, inners, depths, &mut matched, &mut results);
    }

    for depth in 1..=num_rels {
        if !depths[depth - 1].join_type.fills_right() {
            continue;
        }
        for index in 0..inners[depth - 1].len() {
            if matched[depth - 1][index] {
                continue;
            }
            let mut slots: Slots = vec![None; num_rels + 1];
            slots[depth] = Some(inners[depth - 1][index]);
            descend(
                depth + 1,
                &mut slots,
                inners,
                depths,
                &mut matched,
                &mut results,
            );
        }
    }

    results
}

fn descend(
    depth: usize,
    slots: &mut Slots,
    inners: &[Vec<(i32, i32)>],
    depths: &[OracleDepth],
    matched: &mut [Vec<bool>],
    results: &mut Vec<Vec<Option<i32>>>,
) {
    if depth > depths.len() {
        results.push(slots.iter().map(|slot| slot.map(|(_, p)| p)).collect());
        return;
    }

    let spec = &depths[depth - 1];
    let mut any = false;
    for index in 0..inners[depth - 1].len() {
        let candidate = inners[depth - 1][index];
        if !(spec.key_match)(slots, candidate) {
            continue;
        }
        any = true;
        matched[depth - 1][index] = true;
        if spec
            .other
            .as_ref()
            .map_or(true, |other| other(slots, candidate))
        {
            slots[depth] = Some(candidate);
            descend(depth + 1, slots, inners, depths, matched, results);
            slots[depth] = None;
        }
    }

    if !any && spec.join_type.fills_left() {
        descend(depth + 1, slots, inners, depths, matched, results);
    }
}

/// Equality on the outer key column. Null keys never match.
pub fn outer_key_equals() -> MatchFn {
    Box::new(|slots: &Slots, (key, _): (i32, i32)| match slots[0] {
        Some((outer_key, _)) => !outer_key.is_null() && !key.is_null() && outer_key == key,
        None => false,
    })
}

/// Equality on the payload column bound at `depth`. Null payloads and
/// null-extended slots never match.
pub fn payload_equals(depth: usize) -> MatchFn {
    Box::new(move |slots: &Slots, (key, _): (i32, i32)| match slots[depth] {
        Some((_, payload)) => !payload.is_null() && !key.is_null() && payload == key,
        None => false,
    })
}

/// Band predicate on the outer and candidate key columns.
pub fn key_within_band(band: i32) -> MatchFn {
    Box::new(move |slots: &Slots, (key, _): (i32, i32)| match slots[0] {
        Some((outer_key, _)) => {
            !outer_key.is_null() && !key.is_null() && (outer_key - key).abs() <= band
        }
        None => false,
    })
}

/// Compares executor rows against the reference, independent of order.
pub fn verify_rows(
    mut actual: Vec<Vec<Option<i32>>>,
    mut expected: Vec<Vec<Option<i32>>>,
) -> Result<(), Box<dyn Error>> {
    actual.sort();
    expected.sort();

    if actual.len() != expected.len() {
        Err(format!(
            "Expected {} result rows, got {}",
            expected.len(),
            actual.len()
        ))?;
    }
    for (row, (act, exp)) in actual.iter().zip(expected.iter()).enumerate() {
        if act != exp {
            Err(format!(
                "Row {} differs from the reference: expected {:?}, got {:?}",
                row, exp, act
            ))?;
        }
    }

    Ok(())
}
