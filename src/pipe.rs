// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-free Michael-Scott queue of messages, with threshold-driven consumer
//! activation and trailing-stub maintenance.
//!
//! The queue is never structurally empty: construction installs a zero-length
//! sentinel stub as both head and tail, and `peek` re-inserts one whenever the
//! backlog drops to or below `threshold`, guaranteeing the node about to be
//! unlinked always has a published successor.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

use crate::error::PipeError;
use crate::message::{MessageHandle, MessageHeader};
use crate::pool::{self, SharedPool};

/// An activation callback, invoked when the enqueued non-stub count crosses from
/// `<= threshold` to above it. Must be reentrant, non-blocking, and tolerant of
/// concurrent calls from multiple producers.
pub type ActivateFn = dyn Fn(&Pipe) + Send + Sync;

struct PipeInner {
    head: AtomicPtr<MessageHeader>,
    tail: AtomicPtr<MessageHeader>,
    pool: SharedPool,
    length: AtomicIsize,
    refcount: AtomicUsize,
    threshold: u32,
    activate: Option<Box<ActivateFn>>,
}

// SAFETY: PipeInner is shared across threads only through the documented atomics
// (head/tail exchange, length fetch-add/sub, refcount fetch-add/sub); `activate` is
// Send + Sync by construction (bounded by `with_activation`'s `F: Send + Sync`).
unsafe impl Send for PipeInner {}
unsafe impl Sync for PipeInner {}

/// A reference-counted, lock-free MPMC queue of messages, backed by a
/// [`SharedPool`] for stub allocation.
///
/// Cloning a `Pipe` increments its refcount; dropping it decrements it. At the final
/// drop, any messages still queued are released back to the pool rather than
/// leaked.
pub struct Pipe {
    inner: NonNull<PipeInner>,
}

// SAFETY: PipeInner is Send + Sync; Pipe only ever reads/writes it through
// PipeInner's own Sync interior.
unsafe impl Send for Pipe {}
unsafe impl Sync for Pipe {}

impl Pipe {
    /// Creates a pipe with no activation callback.
    pub fn new(pool: &SharedPool, threshold: u32) -> Result<Self, PipeError> {
        Self::with_activation(pool, threshold, None::<fn(&Pipe)>)
    }

    /// Creates a pipe whose `activate` callback fires on threshold crossings.
    pub fn with_activation<F>(
        pool: &SharedPool,
        threshold: u32,
        activate: Option<F>,
    ) -> Result<Self, PipeError>
    where
        F: Fn(&Pipe) + Send + Sync + 'static,
    {
        let held_pool = pool.clone();
        let stub = held_pool
            .allocate(0)
            .ok_or(PipeError::StubAllocationFailed)?;
        let stub_ptr = stub.into_raw();

        let layout = std::alloc::Layout::new::<PipeInner>();
        // SAFETY: layout is non-zero-sized and well-formed.
        let raw = unsafe { std::alloc::alloc(layout) }.cast::<PipeInner>();
        let inner = match NonNull::new(raw) {
            Some(inner) => inner,
            None => {
                // SAFETY: stub_ptr was just produced by `into_raw` and is not
                // reachable from anywhere else yet.
                unsafe {
                    pool::release_message(stub_ptr);
                }
                return Err(PipeError::OutOfMemory);
            }
        };
        // SAFETY: raw was just allocated with PipeInner's layout and is
        // uninitialized.
        unsafe {
            ptr::write(
                inner.as_ptr(),
                PipeInner {
                    head: AtomicPtr::new(stub_ptr),
                    tail: AtomicPtr::new(stub_ptr),
                    pool: held_pool,
                    length: AtomicIsize::new(0),
                    refcount: AtomicUsize::new(1),
                    threshold,
                    activate: activate.map(|f| Box::new(f) as Box<ActivateFn>),
                },
            );
        }
        log::debug!("pipe created, threshold={threshold}");
        Ok(Self { inner })
    }

    fn inner(&self) -> &PipeInner {
        // SAFETY: `inner` is valid for as long as this handle (or any clone) exists.
        unsafe { self.inner.as_ref() }
    }

    /// The pool backing this pipe's stub allocations.
    #[must_use]
    pub fn pool(&self) -> &SharedPool {
        &self.inner().pool
    }

    /// Hands off ownership of `message` to the queue. The caller must not touch the
    /// handle afterward (it is consumed).
    pub fn submit(&self, message: MessageHandle) {
        let inner = self.inner();
        let is_stub = message.is_empty();
        let msg_ptr = message.into_raw();

        // Exchange head, obtaining the previous head, then publish the link.
        let prev_ptr = inner.head.swap(msg_ptr, Ordering::Acquire);
        // SAFETY: prev_ptr was the head and remains valid memory (it is released
        // only once unlinked by a consumer, which cannot happen until this store
        // publishes its successor).
        unsafe {
            (*prev_ptr).next.store(msg_ptr, Ordering::Release);
        }

        if !is_stub {
            let pre = inner.length.fetch_add(1, Ordering::Relaxed);
            if pre <= inner.threshold as isize {
                if let Some(activate) = &inner.activate {
                    log::trace!("pipe activation fired at length={pre}");
                    activate(self);
                }
            }
        }
    }

    /// Takes ownership of the oldest user message, or `None` if none is immediately
    /// available. Proceeds in four phases: speculatively claim a slot by
    /// decrementing the advisory length, top up the trailing stub if the backlog ran
    /// shallow, exclusively acquire the tail, then validate and unlink.
    pub fn peek(&self) -> Option<MessageHandle> {
        let inner = self.inner();

        // Phase 1: speculatively claim a slot.
        let pre = inner.length.fetch_sub(1, Ordering::Relaxed);
        if pre <= 0 {
            inner.length.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // Phase 2: ensure a trailing stub while the backlog is shallow.
        if pre <= inner.threshold as isize {
            if let Some(stub) = inner.pool.allocate(0) {
                self.submit(stub);
            }
        }

        let backoff = Backoff::new();
        loop {
            // Phase 3: exclusive-acquire the tail.
            let mut node = inner.tail.swap(ptr::null_mut(), Ordering::Acquire);
            while node.is_null() {
                backoff.spin();
                node = inner.tail.swap(ptr::null_mut(), Ordering::Acquire);
            }

            // Phase 4: validate and advance.
            // SAFETY: node was the tail; it stays valid memory until unlinked.
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if next.is_null() {
                inner.tail.store(node, Ordering::Relaxed);
                inner.length.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            inner.tail.store(next, Ordering::Relaxed);

            // SAFETY: node has just been unlinked; this thread now exclusively
            // owns it.
            let is_stub = unsafe { *(*node).length.get() == 0 };
            if is_stub {
                // Release the stub back to the pool via the handle's own Drop,
                // then retry phase 3 for the real node behind it.
                drop(unsafe { MessageHandle::from_raw(node) });
                backoff.reset();
                continue;
            }

            // SAFETY: node is exclusively ours now; clearing its link is cosmetic
            // (no list traverses through it anymore).
            unsafe {
                (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
            }
            return Some(unsafe { MessageHandle::from_raw(node) });
        }
    }

    /// Non-authoritative count of enqueued user (non-stub) messages.
    #[must_use]
    pub fn count(&self) -> isize {
        self.inner().length.load(Ordering::Relaxed)
    }
}

impl Clone for Pipe {
    fn clone(&self) -> Self {
        self.inner().refcount.fetch_add(1, Ordering::Relaxed);
        Self { inner: self.inner }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        let ptr = self.inner.as_ptr();
        // SAFETY: `inner` is valid for the duration of this call.
        let inner = unsafe { &*ptr };
        if inner.refcount.fetch_sub(1, Ordering::Release) == 1 {
            atomic::fence(Ordering::Acquire);
            // Walk from tail, releasing every remaining node (including the
            // residual sentinel) back to the pool.
            let mut node = inner.tail.load(Ordering::Relaxed);
            while !node.is_null() {
                // SAFETY: no other thread can observe this pipe anymore; walking
                // and releasing its remaining chain is exclusive to this thread.
                let next = unsafe { (*node).next.load(Ordering::Relaxed) };
                drop(unsafe { MessageHandle::from_raw(node) });
                node = next;
            }
            log::debug!("pipe destroyed, draining remaining queue");
            // SAFETY: ptr was allocated by `with_activation` with PipeInner's
            // layout and nothing else references it now.
            unsafe {
                ptr::drop_in_place(ptr);
                std::alloc::dealloc(
                    ptr.cast::<u8>(),
                    std::alloc::Layout::new::<PipeInner>(),
                );
            }
        }
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("count", &self.count())
            .field("threshold", &self.inner().threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_submit_peek_single_message() {
        let pool = SharedPool::new(64).unwrap();
        let pipe = Pipe::new(&pool, 2).unwrap();

        let mut msg = pool.allocate(5).unwrap();
        msg.data_mut()[..5].copy_from_slice(b"hello");
        msg.set_len(5);
        pipe.submit(msg);

        let received = pipe.peek().unwrap();
        assert_eq!(received.data(), b"hello");
        assert_eq!(pipe.count(), 0);
        assert!(pipe.peek().is_none());
    }

    #[test]
    fn test_stub_never_observed_by_peek() {
        let pool = SharedPool::new(64).unwrap();
        let pipe = Pipe::new(&pool, 0).unwrap();

        let msg = pool.allocate(3).unwrap();
        pipe.submit(msg);

        let received = pipe.peek().unwrap();
        assert!(!received.is_empty());
        assert!(pipe.peek().is_none());
    }

    #[test]
    fn test_fifo_order_single_producer() {
        let pool = SharedPool::new(64).unwrap();
        let pipe = Pipe::new(&pool, 4).unwrap();

        for i in 0..100u8 {
            let mut msg = pool.allocate(1).unwrap();
            msg.data_mut()[0] = i;
            msg.set_len(1);
            pipe.submit(msg);
        }

        for i in 0..100u8 {
            let received = pipe.peek().unwrap();
            assert_eq!(received.data()[0], i);
        }
        assert!(pipe.peek().is_none());
    }

    #[test]
    fn test_count_returns_to_zero() {
        let pool = SharedPool::new(64).unwrap();
        let pipe = Pipe::new(&pool, 2).unwrap();
        for _ in 0..10 {
            pipe.submit(pool.allocate(1).unwrap());
        }
        while pipe.peek().is_some() {}
        assert_eq!(pipe.count(), 0);
    }

    #[test]
    fn test_activation_fires_on_threshold_crossing() {
        let pool = SharedPool::new(64).unwrap();
        let fired = Arc::new(StdAtomicUsize::new(0));
        let fired_clone = fired.clone();
        let pipe = Pipe::with_activation(
            &pool,
            1,
            Some(move |_: &Pipe| {
                fired_clone.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();

        pipe.submit(pool.allocate(1).unwrap());
        pipe.submit(pool.allocate(1).unwrap());
        pipe.submit(pool.allocate(1).unwrap());

        assert!(fired.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_drop_with_messages_still_queued_does_not_leak() {
        let pool = SharedPool::new(64).unwrap();
        let pipe = Pipe::new(&pool, 2).unwrap();
        for _ in 0..50 {
            pipe.submit(pool.allocate(16).unwrap());
        }
        // Intentionally do not drain; Drop must release the remaining chain.
        drop(pipe);
        drop(pool);
    }

    #[test]
    fn test_clone_keeps_pipe_alive() {
        let pool = SharedPool::new(64).unwrap();
        let pipe = Pipe::new(&pool, 2).unwrap();
        let held = pipe.clone();
        drop(pipe);

        held.submit(pool.allocate(4).unwrap());
        assert!(held.peek().is_some());
    }
}
