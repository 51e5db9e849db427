// # Slab Allocator
//
// Per-instance bump allocator layered over a shared [`PagePool`].
//
// ## Design Overview
//
// Each thread that allocates through an instance gets its own *active*
// page and bump-allocates from it; when the page no longer fits a
// request, the thread releases its reference and activates a fresh one.
//
// Every allocation is prefixed with a small header that points back to
// the page it was carved from, so deallocation works from any thread:
// it decrements the page's reference count and the last holder returns
// the page to the pool. A page's lifetime is "longest holder": the
// owning thread's active slot and every outstanding allocation each
// count as one reference.
//
// Instances share the page pool but never share active pages, which
// keeps the allocation fast path free of cross-thread traffic.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KernelError, Result};
use crate::memory::page_pool::{aligned_size, PagePool, MAX_ALIGN};

const SLAB_HEADER_BYTES: usize = aligned_size(std::mem::size_of::<SlabHeader>());
const SLAB_PAGE_BYTES: usize = aligned_size(std::mem::size_of::<SlabPage>());

/// Prefix of every allocation; routes a deallocation back to the page
/// that satisfied it.
#[repr(C)]
struct SlabHeader {
    page: *mut SlabPage,
}

/// Bookkeeping at the start of each pool page used by the slab layer.
#[repr(C)]
struct SlabPage {
    /// One reference for the owning thread's active slot plus one per
    /// outstanding allocation.
    refs: AtomicUsize,
    /// Next free byte. Only the owning thread advances it.
    free: *mut u8,
    /// One past the last usable byte.
    end: *mut u8,
}

/// A thread's current active page, if any.
struct ThreadSlab {
    active: *mut SlabPage,
}

// Safety: the raw page pointer is dereferenced only by the owning
// thread (bump path) or with exclusive access (retire / Drop); the
// refcount it leads to is atomic.
unsafe impl Send for ThreadSlab {}
unsafe impl Sync for ThreadSlab {}

/// Point-in-time counters for a [`SlabAllocator`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlabAllocatorStats {
    pub allocations: u64,
    pub deallocations: u64,
    /// Allocations not yet deallocated.
    pub outstanding: u64,
}

/// Thread-aware bump allocator over [`PagePool`] pages.
///
/// Allocation happens on the caller's own active page; deallocation may
/// come from any thread.
pub struct SlabAllocator {
    pool: PagePool,
    slabs: DashMap<ThreadId, ThreadSlab>,
    allocator_id: Uuid,
    allocations: AtomicU64,
    deallocations: AtomicU64,
}

impl SlabAllocator {
    pub fn new(pool: &PagePool) -> Self {
        assert!(
            pool.payload_bytes() > SLAB_PAGE_BYTES + SLAB_HEADER_BYTES,
            "pool pages too small for slab bookkeeping"
        );
        let allocator = Self {
            pool: pool.clone(),
            slabs: DashMap::new(),
            allocator_id: Uuid::new_v4(),
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
        };
        tracing::debug!(allocator = %allocator.allocator_id, "slab allocator created");
        allocator
    }

    /// Largest request this allocator can satisfy.
    pub fn max_request_bytes(&self) -> usize {
        self.usable_bytes() - SLAB_HEADER_BYTES
    }

    /// Bytes a fresh page offers to the bump pointer.
    fn usable_bytes(&self) -> usize {
        self.pool.payload_bytes() - SLAB_PAGE_BYTES
    }

    /// Returns `bytes` bytes aligned to [`MAX_ALIGN`].
    ///
    /// The pointer stays valid until passed to
    /// [`SlabAllocator::deallocate`], independent of what the
    /// allocating thread does afterwards.
    pub fn allocate(&self, bytes: usize) -> Result<NonNull<u8>> {
        assert!(bytes > 0, "zero-byte slab allocation");

        let need = SLAB_HEADER_BYTES + bytes;
        if need > self.usable_bytes() {
            return Err(KernelError::RequestTooLarge {
                requested: bytes,
                available: self.max_request_bytes(),
            });
        }

        let mut slab = self
            .slabs
            .entry(thread::current().id())
            .or_insert_with(|| ThreadSlab {
                active: ptr::null_mut(),
            });

        // Safety: `slab.active` is this thread's page (or null); the
        // bump path is single-threaded by construction.
        unsafe {
            if slab.active.is_null() {
                slab.active = self.new_slab_page()?;
            }

            let start = match Self::bump(slab.active, need) {
                Some(start) => start,
                None => {
                    // The active page is full: drop our reference and
                    // activate a fresh one.
                    Self::release_page(slab.active);
                    slab.active = ptr::null_mut();
                    slab.active = self.new_slab_page()?;
                    Self::bump(slab.active, need)
                        .expect("validated request must fit a fresh page")
                }
            };

            ptr::write(
                start.as_ptr().cast::<SlabHeader>(),
                SlabHeader { page: slab.active },
            );
            self.allocations.fetch_add(1, Ordering::Relaxed);
            Ok(NonNull::new_unchecked(
                start.as_ptr().add(SLAB_HEADER_BYTES),
            ))
        }
    }

    /// Releases an allocation. May be called from any thread.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`SlabAllocator::allocate`] on an
    /// allocator sharing this pool, and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let header = ptr.as_ptr().sub(SLAB_HEADER_BYTES).cast::<SlabHeader>();
        let page = (*header).page;
        self.deallocations.fetch_add(1, Ordering::Relaxed);
        Self::release_page(page);
    }

    /// Releases the calling thread's active page. Call before a thread
    /// that used this allocator exits; outstanding allocations made by
    /// the thread stay valid.
    pub fn retire_current_thread(&self) {
        if let Some((_, slab)) = self.slabs.remove(&thread::current().id()) {
            if !slab.active.is_null() {
                // Safety: the entry is removed, nothing else references
                // this thread's active slot.
                unsafe { Self::release_page(slab.active) };
            }
        }
    }

    pub fn stats(&self) -> SlabAllocatorStats {
        let allocations = self.allocations.load(Ordering::Relaxed);
        let deallocations = self.deallocations.load(Ordering::Relaxed);
        SlabAllocatorStats {
            allocations,
            deallocations,
            outstanding: allocations.saturating_sub(deallocations),
        }
    }

    /// Obtains a pool page and lays out the slab bookkeeping in it.
    fn new_slab_page(&self) -> Result<*mut SlabPage> {
        let payload = self.pool.allocate()?;
        let page = payload.as_ptr().cast::<SlabPage>();
        // Safety: the payload is large enough for the bookkeeping plus
        // at least one allocation (checked at construction) and is
        // MAX_ALIGN-aligned.
        unsafe {
            let end = payload.as_ptr().add(self.pool.payload_bytes());
            ptr::write(
                page,
                SlabPage {
                    refs: AtomicUsize::new(1),
                    free: align_up(page.add(1).cast::<u8>()),
                    end,
                },
            );
        }
        Ok(page)
    }

    /// Attempts a bump allocation of `need` bytes; on success the page
    /// gains one reference and the returned pointer is aligned.
    ///
    /// # Safety
    ///
    /// Caller must be the thread owning `page` as its active slot.
    unsafe fn bump(page: *mut SlabPage, need: usize) -> Option<NonNull<u8>> {
        let start = align_up((*page).free);
        if (start as usize) + need <= (*page).end as usize {
            (*page).free = start.add(need);
            (*page).refs.fetch_add(1, Ordering::Relaxed);
            Some(NonNull::new_unchecked(start))
        } else {
            None
        }
    }

    /// Drops one reference; the last holder returns the page to its
    /// pool.
    ///
    /// # Safety
    ///
    /// `page` must be a live slab page with at least one reference.
    unsafe fn release_page(page: *mut SlabPage) {
        debug_assert!((*page).refs.load(Ordering::Relaxed) > 0);
        if (*page).refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            PagePool::deallocate(NonNull::new_unchecked(page.cast::<u8>()));
        }
    }
}

impl Drop for SlabAllocator {
    fn drop(&mut self) {
        // Exclusive access: no thread can be allocating through us.
        for mut entry in self.slabs.iter_mut() {
            let page = std::mem::replace(&mut entry.active, ptr::null_mut());
            if !page.is_null() {
                // Safety: the active slot is released exactly once.
                unsafe { Self::release_page(page) };
            }
        }
        self.slabs.clear();
        tracing::debug!(allocator = %self.allocator_id, "slab allocator dropped");
    }
}

fn align_up(ptr: *mut u8) -> *mut u8 {
    (((ptr as usize) + MAX_ALIGN - 1) & !(MAX_ALIGN - 1)) as *mut u8
}
