// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-free MPMC message pipe for in-process thread communication.
//!
//! An unbounded FIFO queue of variable-sized messages, backed by a recycling free
//! pool, for handing work from any number of producer threads to any number of
//! consumer threads without a lock on the hot path.
//!
//! # Architecture
//!
//! ```text
//! producers                 SharedPool                  consumers
//!    |                   (Treiber stack,                   |
//!    | allocate()         ABA-tagged top)                   |
//!    v                         ^  |                         |
//! MessageHandle ---submit()--->Pipe<---peek()--- MessageHandle
//!                        (Michael-Scott queue,
//!                         head/tail atomics,
//!                         threshold + activate)
//! ```
//!
//! A producer calls [`SharedPool::allocate`] for a [`MessageHandle`], writes its
//! payload, and hands it to [`Pipe::submit`]. A consumer calls [`Pipe::peek`] for
//! the oldest user message and, once processed, drops the handle (or calls
//! [`crate::message::MessageHandle`]'s implicit release) to return the buffer to
//! the pool. Zero-length stub messages flow through the same queue to keep it
//! structurally non-empty, but are never handed back by `peek`.
//!
//! # Quick start
//!
//! ```
//! use flowpipe::{Pipe, SharedPool};
//!
//! let pool = SharedPool::new(64).unwrap();
//! let pipe = Pipe::new(&pool, /* threshold */ 4).unwrap();
//!
//! let mut msg = pool.allocate(5).unwrap();
//! msg.data_mut()[..5].copy_from_slice(b"hello");
//! msg.set_len(5);
//! pipe.submit(msg);
//!
//! let received = pipe.peek().unwrap();
//! assert_eq!(received.data(), b"hello");
//! ```
//!
//! # What this crate does not do
//!
//! It does not wake sleeping consumers — that is the caller's activation
//! transport (an eventfd, a semaphore, a condvar; see `demos/producer_consumer.rs`
//! for one such wiring). It does not preserve FIFO order across producers, bound
//! queue capacity, or guarantee consumer fairness.

pub mod error;
mod message;
mod pipe;
mod pool;

pub use error::{PipeError, PoolError};
pub use message::MessageHandle;
pub use pipe::{ActivateFn, Pipe};
pub use pool::SharedPool;
