// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Construction-time errors.
//!
//! The hot-path operations (`allocate`, `peek`) stay `Option`-returning, matching the
//! null-vs-value contract producers and consumers see on every call. Misconfiguration
//! that is cheap to reject at construction gets a named, `std::error::Error`
//! variant instead, the way `hdds`'s `ShmError` rejects an invalid ring capacity.

use std::fmt;

/// Errors raised while creating a [`crate::pool::SharedPool`].
#[derive(Debug)]
pub enum PoolError {
    /// `granularity` was zero; the round-up formula cannot bucket allocations.
    InvalidGranularity,
    /// The platform allocator failed to provide the pool's header allocation.
    OutOfMemory,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidGranularity => write!(f, "pool granularity must be non-zero"),
            Self::OutOfMemory => write!(f, "allocation of pool header failed"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Errors raised while creating a [`crate::pipe::Pipe`].
#[derive(Debug)]
pub enum PipeError {
    /// Allocation of the pipe's own header failed.
    OutOfMemory,
    /// Allocation of the initial sentinel stub failed.
    StubAllocationFailed,
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "allocation of pipe header failed"),
            Self::StubAllocationFailed => write!(f, "allocation of initial sentinel stub failed"),
        }
    }
}

impl std::error::Error for PipeError {}
