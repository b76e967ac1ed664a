/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2021-2022, Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

use join_ops::plan::JoinType;
use serde_derive::Serialize;
use serde_repr::Serialize_repr;
use structopt::clap::arg_enum;

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq)]
    pub enum ArgDataSet {
        Test,
        Custom,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgDataDistribution {
        Uniform,
        Zipf,
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DataDistribution {
    Uniform,
    Zipf(f64),
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgPlanShape {
        Star,
        Chain,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgJoinType {
        Inner,
        Left,
        Right,
        Full,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize_repr)]
    #[repr(usize)]
    pub enum ArgTupleBytes {
        Bytes8 = 8,
        Bytes16 = 16,
    }
}

impl From<ArgJoinType> for JoinType {
    fn from(ajt: ArgJoinType) -> Self {
        match ajt {
            ArgJoinType::Inner => JoinType::Inner,
            ArgJoinType::Left => JoinType::Left,
            ArgJoinType::Right => JoinType::Right,
            ArgJoinType::Full => JoinType::Full,
        }
    }
}
