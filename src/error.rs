// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Error kinds shared by every component of the core, per the error-handling
//! design: a small enum of *kinds* (not types), each convertible to and from
//! `std::io::Error` so the gateway/transport layers can keep using the
//! `io::Result` idiom the rest of the core already speaks.

use std::io;

#[derive(thiserror::Error, Debug)]
pub enum MuscleError {
    #[error("malformed input: {0}")]
    MalformedInput(&'static str),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    #[error("transport failed: {0}")]
    TransportFailed(#[from] io::Error),

    #[error("timed out: {0}")]
    TimedOut(&'static str),

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

pub type MuscleResult<T> = Result<T, MuscleError>;

impl MuscleError {
    /// Maps onto the PR_RESULT_ERROR* reply family the storage-reflect
    /// logic sends back to a client for a malformed or rejected command.
    pub fn reply_what_code(&self) -> u32 {
        use crate::message::what;
        match self {
            MuscleError::MalformedInput(_) => what::PR_RESULT_ERRORUNIMPLEMENTED,
            MuscleError::ResourceExhausted(_) => what::PR_RESULT_ERROR_OUT_OF_MEMORY,
            MuscleError::PermissionDenied(_) => what::PR_RESULT_ERROR_BAD_ARGUMENT,
            MuscleError::TransportFailed(_) => what::PR_RESULT_ERRORUNIMPLEMENTED,
            MuscleError::TimedOut(_) => what::PR_RESULT_ERRORUNIMPLEMENTED,
            MuscleError::NotFound(_) => what::PR_RESULT_ERROR_BAD_ARGUMENT,
            MuscleError::InvalidState(_) => what::PR_RESULT_ERRORUNIMPLEMENTED,
        }
    }
}

impl From<MuscleError> for io::Error {
    fn from(err: MuscleError) -> io::Error {
        match err {
            MuscleError::TransportFailed(e) => e,
            MuscleError::TimedOut(msg) => io::Error::new(io::ErrorKind::TimedOut, msg),
            MuscleError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            MuscleError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

pub fn malformed(msg: &'static str) -> MuscleError {
    MuscleError::MalformedInput(msg)
}

pub fn resource_exhausted(msg: &'static str) -> MuscleError {
    MuscleError::ResourceExhausted(msg)
}

pub fn permission_denied(msg: &'static str) -> MuscleError {
    MuscleError::PermissionDenied(msg)
}

pub fn not_found(msg: &'static str) -> MuscleError {
    MuscleError::NotFound(msg)
}

pub fn invalid_state(msg: &'static str) -> MuscleError {
    MuscleError::InvalidState(msg)
}
