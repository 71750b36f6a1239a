// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-free recycling pool for message buffers.
//!
//! A [`SharedPool`] is a Treiber stack of free messages, bucketed by a single
//! allocation granularity, with an atomic reference count. `allocate` pops a
//! reusable buffer when one of sufficient capacity is available, otherwise mints a
//! fresh one; `release` (driven by `MessageHandle`'s `Drop`) pushes a message back.
//!
//! # ABA avoidance
//!
//! Every message is 64-byte aligned, so the low 6 bits of its address are always
//! zero. The stack's top-of-stack atomic packs a 6-bit tag into those bits,
//! incremented on every release, so the same address reappearing at the top after
//! intervening pop/push activity almost always presents a different tag. Six bits
//! bounds the protection to 64 releases of the same node between a thread's read
//! and its retry; a wider tag would need spare address bits this allocator does
//! not have.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicUsize, Ordering};

use crate::error::PoolError;
use crate::message::{self, MessageHandle, MessageHeader};

const TAG_BITS: usize = 6;
const TAG_MASK: usize = (1 << TAG_BITS) - 1;
const ADDR_MASK: usize = !TAG_MASK;

pub(crate) struct PoolInner {
    /// Tagged top-of-stack: `(address & ADDR_MASK) | (tag & TAG_MASK)`.
    stack: AtomicUsize,
    refcount: AtomicUsize,
    granularity: u32,
}

// SAFETY: PoolInner is shared across threads only through the documented atomics
// (stack CAS loop, refcount fetch-add/sub); every message reachable from the stack
// is itself Send + Sync for the same reason (see message.rs).
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

fn tagged(addr: usize, tag: u32) -> usize {
    (addr & ADDR_MASK) | ((tag as usize) & TAG_MASK)
}

/// Pops the most-recently-pushed node off the free stack, or `None` if it is empty.
fn pop(inner: &PoolInner) -> Option<NonNull<MessageHeader>> {
    loop {
        let top = inner.stack.load(Ordering::Acquire);
        let addr = top & ADDR_MASK;
        if addr == 0 {
            return None;
        }
        // SAFETY: addr came from a tagged pointer previously pushed by `push`, which
        // only ever stores addresses of live, 64-byte-aligned messages.
        let node = unsafe { &*(addr as *const MessageHeader) };
        let next = node.next.load(Ordering::Relaxed) as usize;
        if inner
            .stack
            .compare_exchange_weak(top, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return NonNull::new(addr as *mut MessageHeader);
        }
    }
}

/// Pushes `node` onto the free stack, tagging it with its freshly-bumped ABA
/// counter.
///
/// # Safety
/// `node` must not be reachable from any other list.
unsafe fn push(inner: &PoolInner, node: *mut MessageHeader) {
    let new_tag = (*node).tag.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    loop {
        let top = inner.stack.load(Ordering::Relaxed);
        (*node).next.store((top & ADDR_MASK) as *mut MessageHeader, Ordering::Relaxed);
        let new_top = tagged(node as usize, new_tag);
        if inner
            .stack
            .compare_exchange_weak(top, new_top, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

/// Decrements `inner`'s refcount, tearing it down on the transition to zero.
///
/// # Safety
/// `ptr` must point at a `PoolInner` previously produced by `SharedPool::new`, not
/// yet freed.
pub(crate) unsafe fn pool_release_raw(ptr: *mut PoolInner) {
    let inner = &*ptr;
    // The decrement itself only needs to publish this thread's writes if it turns
    // out to be the final one; pairing that with the Acquire fence below on the
    // winning thread is the standard Arc-drop pattern.
    if inner.refcount.fetch_sub(1, Ordering::Release) == 1 {
        atomic::fence(Ordering::Acquire);
        drain_and_free(ptr);
    }
}

/// Frees every message left on the stack, then the pool header itself.
///
/// # Safety
/// `ptr`'s refcount must have just reached zero; no other thread may still be
/// referencing it.
unsafe fn drain_and_free(ptr: *mut PoolInner) {
    let inner = &*ptr;
    let mut addr = inner.stack.load(Ordering::Acquire) & ADDR_MASK;
    while addr != 0 {
        let node = addr as *mut MessageHeader;
        let next = (*node).next.load(Ordering::Relaxed);
        message::dealloc_message(node);
        addr = next as usize & ADDR_MASK;
    }
    ptr::drop_in_place(ptr);
    std::alloc::dealloc(ptr.cast::<u8>(), std::alloc::Layout::new::<PoolInner>());
}

/// Releases a message back to its owning pool, and counters the refcount pin that
/// was taken when it was allocated. Called from `MessageHandle::drop`.
///
/// # Safety
/// `ptr` must point at a message this caller exclusively owns and is retiring.
pub(crate) unsafe fn release_message(ptr: *mut MessageHeader) {
    let pool_ptr = (*ptr).pool as *mut PoolInner;
    push(&*pool_ptr, ptr);
    pool_release_raw(pool_ptr);
}

/// A reference-counted, lock-free pool of recyclable message buffers.
///
/// Cloning a `SharedPool` increments the refcount (relaxed); dropping it decrements
/// it, tearing the pool down on the transition to zero. Every live `MessageHandle`
/// allocated from a pool independently pins the same refcount for as long as it
/// exists, since a message outlives the handle that returned it but must not outlive
/// the pool it will eventually recycle into.
pub struct SharedPool {
    inner: NonNull<PoolInner>,
}

// SAFETY: PoolInner is Send + Sync (see above); SharedPool only ever reads/writes it
// through PoolInner's own Sync interior.
unsafe impl Send for SharedPool {}
unsafe impl Sync for SharedPool {}

impl SharedPool {
    /// Creates a pool that rounds every allocation up to a multiple of `granularity`.
    pub fn new(granularity: u32) -> Result<Self, PoolError> {
        if granularity == 0 {
            return Err(PoolError::InvalidGranularity);
        }
        let layout = std::alloc::Layout::new::<PoolInner>();
        // SAFETY: layout is non-zero-sized and well-formed.
        let raw = unsafe { std::alloc::alloc(layout) }.cast::<PoolInner>();
        let inner = NonNull::new(raw).ok_or(PoolError::OutOfMemory)?;
        // SAFETY: raw was just allocated with the layout of PoolInner and is
        // uninitialized; writing into it is the correct way to initialize it.
        unsafe {
            ptr::write(
                inner.as_ptr(),
                PoolInner {
                    stack: AtomicUsize::new(0),
                    refcount: AtomicUsize::new(1),
                    granularity,
                },
            );
        }
        log::debug!("pool created, granularity={granularity}");
        Ok(Self { inner })
    }

    fn inner(&self) -> &PoolInner {
        // SAFETY: `inner` is valid for as long as this handle (or any clone, or any
        // live message it pinned) exists.
        unsafe { self.inner.as_ref() }
    }

    pub(crate) fn inner_ptr(&self) -> *const PoolInner {
        self.inner.as_ptr()
    }

    /// Allocates a message with the given payload length (0 for a stub).
    ///
    /// Reuses a free buffer of sufficient capacity if the stack has one; otherwise
    /// mints a fresh buffer rounded up to the pool's granularity. Returns `None` on
    /// allocator failure, rolling back the pin it had speculatively taken.
    pub fn allocate(&self, length: usize) -> Option<MessageHandle> {
        let inner = self.inner();
        // Every live message pins the pool; this is undone either here (on
        // failure) or by `release_message` when the handle is eventually dropped.
        inner.refcount.fetch_add(1, Ordering::Relaxed);

        let mut seed_tag = 0u32;
        if let Some(node) = pop(inner) {
            // SAFETY: just popped, exclusively ours until we either reuse or free it.
            let header = unsafe { node.as_ref() };
            if length <= header.size {
                // SAFETY: just popped, exclusively ours.
                unsafe {
                    *header.length.get() = length;
                }
                header.next.store(ptr::null_mut(), Ordering::Release);
                log::trace!("pool allocate: reused buffer len={length} cap={}", header.size);
                return Some(unsafe { MessageHandle::from_raw(node.as_ptr()) });
            }
            seed_tag = header.tag.load(Ordering::Relaxed);
            // SAFETY: this node is reachable from nowhere else; we just popped it.
            unsafe {
                message::dealloc_message(node.as_ptr());
            }
        }

        let capacity = message::rounded_size(length, inner.granularity);
        // SAFETY: the refcount fetch_add above pins `inner` for the duration of
        // this allocation.
        match unsafe { message::alloc_message(self.inner.as_ptr(), seed_tag, length, capacity) } {
            Some(node) => {
                log::trace!("pool allocate: minted buffer len={length} cap={capacity}");
                Some(unsafe { MessageHandle::from_raw(node.as_ptr()) })
            }
            None => {
                // SAFETY: undoes the pin taken above; mirrors `release_message`
                // without pushing a (nonexistent) node onto the stack.
                unsafe {
                    pool_release_raw(self.inner.as_ptr());
                }
                log::debug!("pool allocate failed: out of memory (requested {length} bytes)");
                None
            }
        }
    }
}

impl Clone for SharedPool {
    fn clone(&self) -> Self {
        self.inner().refcount.fetch_add(1, Ordering::Relaxed);
        Self { inner: self.inner }
    }
}

impl Drop for SharedPool {
    fn drop(&mut self) {
        // SAFETY: this handle held one refcount; it is being retired.
        unsafe {
            pool_release_raw(self.inner.as_ptr());
        }
    }
}

impl fmt::Debug for SharedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPool")
            .field("granularity", &self.inner().granularity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_release_reuses_buffer() {
        let pool = SharedPool::new(128).unwrap();
        let first = pool.allocate(200).unwrap();
        let cap = first.capacity();
        assert!(cap >= 256);
        let first_tag = first.tag();
        drop(first);

        let second = pool.allocate(50).unwrap();
        assert!(second.capacity() >= 256);
        assert!(second.tag() >= first_tag);
    }

    #[test]
    fn test_allocate_undersized_reuse_discarded() {
        let pool = SharedPool::new(128).unwrap();
        let first = pool.allocate(200).unwrap();
        let first_tag = first.tag();
        drop(first);

        let second = pool.allocate(10_000).unwrap();
        assert!(second.capacity() >= 10_000);
        assert_eq!(second.tag(), first_tag + 1);
    }

    #[test]
    fn test_stub_reserves_one_granularity_block() {
        let pool = SharedPool::new(64).unwrap();
        let stub = pool.allocate(0).unwrap();
        assert_eq!(stub.len(), 0);
        assert_eq!(stub.capacity(), 64);
    }

    #[test]
    fn test_invalid_granularity_rejected() {
        assert!(matches!(
            SharedPool::new(0),
            Err(PoolError::InvalidGranularity)
        ));
    }

    #[test]
    fn test_pool_drops_cleanly_with_outstanding_free_buffers() {
        let pool = SharedPool::new(64).unwrap();
        for _ in 0..16 {
            let msg = pool.allocate(8).unwrap();
            drop(msg);
        }
        drop(pool);
    }

    #[test]
    fn test_clone_holds_pool_alive_past_original_drop() {
        let pool = SharedPool::new(64).unwrap();
        let held = pool.clone();
        drop(pool);
        let msg = held.allocate(8).unwrap();
        drop(msg);
        drop(held);
    }
}
