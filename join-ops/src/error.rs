/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2018-2019 Clemens Lutz, German Research Center for Artificial Intelligence
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use std::convert::From;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum ErrorKind {
    AccelRuntimeError(accel_runtime::error::Error),
    DatagenError(datagen::error::Error),
    EstimationOverflow(String),
    IntegerOverflow(String),
    InvalidArgument(String),
    LogicError(String),
    RuntimeError(String),
    Msg(String),
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl std::error::Error for Error {
    fn description(&self) -> &str {
        match self.kind {
            ErrorKind::AccelRuntimeError(ref e) => e.description(),
            ErrorKind::DatagenError(ref e) => e.description(),
            ErrorKind::EstimationOverflow(ref s) => s.as_str(),
            ErrorKind::IntegerOverflow(ref s) => s.as_str(),
            ErrorKind::InvalidArgument(ref s) => s.as_str(),
            ErrorKind::LogicError(ref s) => s.as_str(),
            ErrorKind::RuntimeError(ref s) => s.as_str(),
            ErrorKind::Msg(ref s) => s.as_str(),
        }
    }

    fn cause(&self) -> Option<&dyn std::error::Error> {
        None
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.kind, f)
    }
}

impl From<accel_runtime::error::Error> for Error {
    fn from(error: accel_runtime::error::Error) -> Self {
        Self {
            kind: ErrorKind::AccelRuntimeError(error),
        }
    }
}

impl From<datagen::error::Error> for Error {
    fn from(error: datagen::error::Error) -> Self {
        Self {
            kind: ErrorKind::DatagenError(error),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::AccelRuntimeError(ref e) => e.fmt(f),
            ErrorKind::DatagenError(ref e) => e.fmt(f),
            ErrorKind::EstimationOverflow(ref s) => write!(f, "EstimationOverflow: {}", s),
            ErrorKind::IntegerOverflow(ref s) => write!(f, "IntegerOverflow: {}", s),
            ErrorKind::InvalidArgument(ref s) => write!(f, "InvalidArgument: {}", s),
            ErrorKind::LogicError(ref s) => write!(f, "LogicError: {}", s),
            ErrorKind::RuntimeError(ref s) => write!(f, "RuntimeError: {}", s),
            ErrorKind::Msg(ref s) => write!(f, "Msg: {}", s),
        }
    }
}

impl From<String> for ErrorKind {
    fn from(s: String) -> Self {
        ErrorKind::Msg(s)
    }
}

impl<'a> From<&'a str> for ErrorKind {
    fn from(s: &'a str) -> Self {
        ErrorKind::Msg(s.to_string())
    }
}
