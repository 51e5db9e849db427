// # Page Pool
//
// Process-wide source of fixed-size raw pages with deferred, epoch-style
// reclamation and a hard cap on physical footprint.
//
// ## Design Overview
//
// The pool keeps two halves, *hot* and *cold*, each a pair of intrusive
// lock-free LIFO stacks `(fresh, garbage)`:
//
// - `allocate` pops from the hot fresh stack, falling back to the system
//   allocator while the hard cap has headroom.
// - `deallocate` pushes onto the hot garbage stack.
// - Once per second the reclamation tick frees one page from the cold
//   garbage stack, swaps the cold fresh/garbage stacks, and flips the
//   hot/cold roles.
//
// A recycled page therefore spends at least one full cycle in the cold
// half before it can be handed out again, which is what makes the plain
// compare-and-swap stacks safe against ABA. At most one page is freed
// per tick, so physical footprint decays monotonically under idle load.
//
// Every page begins with a header carrying a back-reference to its
// owning pool, so deallocation routes correctly even when the caller no
// longer knows which pool produced the page.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::utils::CachePadded;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::concurrent::Backoff;
use crate::error::{KernelError, Result};
use crate::ticker::{Ticker, TickerRegistration};

/// Minimum alignment of page payloads and of everything carved from
/// them: covers pointers and the largest scalar types.
pub const MAX_ALIGN: usize = 16;

/// Rounds `bytes` up to the next multiple of [`MAX_ALIGN`].
pub const fn aligned_size(bytes: usize) -> usize {
    (bytes + MAX_ALIGN - 1) & !(MAX_ALIGN - 1)
}

const HEADER_BYTES: usize = aligned_size(std::mem::size_of::<PageHeader>());

const DEFAULT_PAGE_BYTES: usize = 4096;
const DEFAULT_MAX_TOTAL_BYTES: usize = 1024 * 1024 * 1024;

/// Prefix of every page while it is owned by or transiting through a
/// pool. The payload handed to callers starts `HEADER_BYTES` past it.
#[repr(C)]
struct PageHeader {
    /// Intrusive link for the fresh/garbage stacks. Written by the
    /// thread that owns the page during a push, published by the CAS.
    next: *mut PageHeader,
    /// Owning pool, so deallocation can route without a pool handle.
    pool: *const PagePoolInner,
}

/// Intrusive Treiber stack over page headers.
///
/// Plain CAS without reclamation guards: nodes are pages, pages are only
/// freed by the single-threaded reclamation tick, and a recycled page
/// cannot reappear at the same stack head within one cycle.
struct PageStack {
    head: AtomicPtr<PageHeader>,
}

impl PageStack {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, page: NonNull<PageHeader>) {
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            // Safety: the page is owned by this thread until the CAS
            // below publishes it.
            unsafe {
                (*page.as_ptr()).next = head;
            }
            if self
                .head
                .compare_exchange_weak(head, page.as_ptr(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    fn pop(&self) -> Option<NonNull<PageHeader>> {
        let mut backoff = Backoff::new();
        loop {
            let head = NonNull::new(self.head.load(Ordering::Acquire))?;
            // Safety: pages in the stack are live; the header is intact
            // even if another thread pops `head` first (the CAS below
            // then fails and we retry).
            let next = unsafe { (*head.as_ptr()).next };
            if self
                .head
                .compare_exchange_weak(head.as_ptr(), next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(head);
            }
            backoff.spin();
        }
    }

    /// Detaches the whole chain.
    fn take(&self) -> *mut PageHeader {
        self.head.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    /// Pushes a detached chain, preserving any pages pushed
    /// concurrently by stale readers of the hot/cold roles.
    fn prepend(&self, chain: *mut PageHeader) {
        let Some(chain) = NonNull::new(chain) else {
            return;
        };

        // Safety: the chain is detached, so this thread owns every link.
        let mut tail = chain;
        unsafe {
            while let Some(next) = NonNull::new((*tail.as_ptr()).next) {
                tail = next;
            }
        }

        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe {
                (*tail.as_ptr()).next = head;
            }
            if self
                .head
                .compare_exchange_weak(head, chain.as_ptr(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }
}

/// One half of the reclamation scheme.
struct Pool {
    fresh: PageStack,
    garbage: PageStack,
}

impl Pool {
    const fn new() -> Self {
        Self {
            fresh: PageStack::new(),
            garbage: PageStack::new(),
        }
    }
}

/// Construction parameters for a [`PagePool`].
#[derive(Debug, Clone)]
pub struct PagePoolConfig {
    /// Size of every page, header included.
    pub page_bytes: usize,
    /// Hard cap on the pool's physical footprint. The page limit is
    /// `max_total_bytes / page_bytes`.
    pub max_total_bytes: usize,
    /// Register with the global [`Ticker`] so reclamation runs once per
    /// second. Disable to drive [`PagePool::tick`] manually.
    pub auto_reclaim: bool,
}

impl Default for PagePoolConfig {
    fn default() -> Self {
        Self {
            page_bytes: DEFAULT_PAGE_BYTES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            auto_reclaim: true,
        }
    }
}

/// Point-in-time counters for a [`PagePool`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PagePoolStats {
    /// Pages obtained from the system allocator over the pool's life.
    pub pages_created: u64,
    /// Pages physically returned to the system by the reclamation tick.
    pub pages_freed: u64,
    /// Pages currently handed out to callers.
    pub outstanding: usize,
    /// Completed reclamation cycles.
    pub reclaim_cycles: u64,
}

struct PagePoolInner {
    page_bytes: usize,
    page_limit: usize,
    pools: [CachePadded<Pool>; 2],
    /// Index of the hot pool; the other is cold.
    hot: CachePadded<AtomicUsize>,
    /// Remaining headroom under the hard cap, in pages.
    pages_remaining: CachePadded<AtomicUsize>,
    outstanding: AtomicUsize,
    pages_created: AtomicUsize,
    pages_freed: AtomicUsize,
    reclaim_cycles: AtomicUsize,
    registration: OnceCell<TickerRegistration>,
}

/// Process-wide source of fixed-size raw pages.
///
/// Cheap to clone; clones share the same pool. Payload pointers stay
/// valid until passed back to [`PagePool::deallocate`]; the pool must
/// outlive every page it has handed out.
#[derive(Clone)]
pub struct PagePool {
    inner: Arc<PagePoolInner>,
}

impl PagePool {
    /// A pool of `page_bytes`-sized pages with the default hard cap,
    /// reclaimed by the global ticker.
    pub fn new(page_bytes: usize) -> Self {
        Self::with_config(PagePoolConfig {
            page_bytes,
            ..PagePoolConfig::default()
        })
    }

    pub fn with_config(config: PagePoolConfig) -> Self {
        let auto_reclaim = config.auto_reclaim;
        let pool = Self::build(config);
        if auto_reclaim {
            pool.register_with(Ticker::global());
        }
        pool
    }

    /// Like [`PagePool::with_config`], but reclaimed by the given
    /// ticker instead of the global one.
    pub fn with_ticker(config: PagePoolConfig, ticker: &Ticker) -> Self {
        let pool = Self::build(config);
        pool.register_with(ticker);
        pool
    }

    fn build(config: PagePoolConfig) -> Self {
        assert!(
            config.page_bytes > HEADER_BYTES + MAX_ALIGN,
            "page_bytes {} leaves no payload",
            config.page_bytes
        );
        let page_limit = config.max_total_bytes / config.page_bytes;
        assert!(page_limit > 0, "hard cap below a single page");

        Self {
            inner: Arc::new(PagePoolInner {
                page_bytes: config.page_bytes,
                page_limit,
                pools: [CachePadded::new(Pool::new()), CachePadded::new(Pool::new())],
                hot: CachePadded::new(AtomicUsize::new(0)),
                pages_remaining: CachePadded::new(AtomicUsize::new(page_limit)),
                outstanding: AtomicUsize::new(0),
                pages_created: AtomicUsize::new(0),
                pages_freed: AtomicUsize::new(0),
                reclaim_cycles: AtomicUsize::new(0),
                registration: OnceCell::new(),
            }),
        }
    }

    fn register_with(&self, ticker: &Ticker) {
        let weak: Weak<PagePoolInner> = Arc::downgrade(&self.inner);
        let registration = ticker.register(move || {
            if let Some(inner) = weak.upgrade() {
                inner.tick();
            }
        });
        let _ = self.inner.registration.set(registration);
    }

    /// Returns a pointer to a page payload of [`PagePool::payload_bytes`]
    /// bytes, aligned to [`MAX_ALIGN`].
    pub fn allocate(&self) -> Result<NonNull<u8>> {
        let inner = &*self.inner;
        let page = match inner.hot_pool().fresh.pop() {
            Some(page) => page,
            None => inner.new_page()?,
        };
        inner.outstanding.fetch_add(1, Ordering::Relaxed);
        // Safety: `page` is a live header created by this pool.
        Ok(unsafe { PagePoolInner::payload_of(page) })
    }

    /// Returns a page to its owning pool.
    ///
    /// Routes through the page's back-reference, so it does not need a
    /// pool handle and is correct even when several pools coexist.
    ///
    /// # Safety
    ///
    /// `payload` must have come from [`PagePool::allocate`] on a pool
    /// that is still alive, and must not be used afterwards.
    pub unsafe fn deallocate(payload: NonNull<u8>) {
        let page = PagePoolInner::header_of(payload);
        let pool = &*(*page.as_ptr()).pool;
        pool.hot_pool().garbage.push(page);
        pool.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    /// Usable bytes per page: `page_bytes` minus the aligned header.
    pub fn payload_bytes(&self) -> usize {
        self.inner.page_bytes - HEADER_BYTES
    }

    pub fn page_bytes(&self) -> usize {
        self.inner.page_bytes
    }

    /// Runs one reclamation cycle: frees one aged garbage page, rotates
    /// the cold half, and flips the hot/cold roles. Normally driven by
    /// the ticker.
    pub fn tick(&self) {
        self.inner.tick();
    }

    pub fn stats(&self) -> PagePoolStats {
        let inner = &*self.inner;
        PagePoolStats {
            pages_created: inner.pages_created.load(Ordering::Relaxed) as u64,
            pages_freed: inner.pages_freed.load(Ordering::Relaxed) as u64,
            outstanding: inner.outstanding.load(Ordering::Relaxed),
            reclaim_cycles: inner.reclaim_cycles.load(Ordering::Relaxed) as u64,
        }
    }
}

impl PagePoolInner {
    fn hot_pool(&self) -> &Pool {
        &self.pools[self.hot.load(Ordering::Acquire)]
    }

    fn cold_pool(&self) -> &Pool {
        &self.pools[1 - self.hot.load(Ordering::Acquire)]
    }

    fn page_layout(&self) -> Layout {
        // Safety-adjacent invariant: checked at construction.
        Layout::from_size_align(self.page_bytes, MAX_ALIGN).expect("invalid page layout")
    }

    /// Reserves a slot under the hard cap and creates a raw page.
    fn new_page(&self) -> Result<NonNull<PageHeader>> {
        let mut remaining = self.pages_remaining.load(Ordering::Relaxed);
        loop {
            if remaining == 0 {
                return Err(KernelError::Exhausted {
                    limit: self.page_limit,
                });
            }
            match self.pages_remaining.compare_exchange_weak(
                remaining,
                remaining - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => remaining = observed,
            }
        }

        // Safety: layout has non-zero size.
        let raw = unsafe { alloc(self.page_layout()) };
        let Some(raw) = NonNull::new(raw) else {
            self.pages_remaining.fetch_add(1, Ordering::Relaxed);
            return Err(KernelError::OutOfMemory {
                bytes: self.page_bytes,
            });
        };

        let page = raw.cast::<PageHeader>();
        // Safety: the allocation is at least `HEADER_BYTES` and aligned
        // for `PageHeader`.
        unsafe {
            ptr::write(
                page.as_ptr(),
                PageHeader {
                    next: ptr::null_mut(),
                    pool: self as *const PagePoolInner,
                },
            );
        }
        self.pages_created.fetch_add(1, Ordering::Relaxed);
        Ok(page)
    }

    fn tick(&self) {
        let cold = self.cold_pool();

        // One page per cycle goes back to the system; its slot returns
        // to the hard-cap headroom.
        if let Some(page) = cold.garbage.pop() {
            // Safety: the page came off the cold garbage stack, which
            // only the single-threaded tick pops.
            unsafe { self.free_page(page) };
        }

        // Yesterday's garbage becomes today's reserve.
        let fresh = cold.fresh.take();
        let garbage = cold.garbage.take();
        cold.fresh.prepend(garbage);
        cold.garbage.prepend(fresh);

        // Flip the roles. Stale readers land in a consistent half
        // either way.
        self.hot.fetch_xor(1, Ordering::AcqRel);
        let cycles = self.reclaim_cycles.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(
            cycles,
            outstanding = self.outstanding.load(Ordering::Relaxed),
            "page pool reclamation cycle"
        );
    }

    /// # Safety
    ///
    /// `page` must be detached from every list and unreachable by other
    /// threads.
    unsafe fn free_page(&self, page: NonNull<PageHeader>) {
        dealloc(page.as_ptr().cast::<u8>(), self.page_layout());
        self.pages_freed.fetch_add(1, Ordering::Relaxed);
        self.pages_remaining.fetch_add(1, Ordering::Release);
    }

    /// # Safety
    ///
    /// `page` must be a live page header.
    unsafe fn payload_of(page: NonNull<PageHeader>) -> NonNull<u8> {
        NonNull::new_unchecked(page.as_ptr().cast::<u8>().add(HEADER_BYTES))
    }

    /// # Safety
    ///
    /// `payload` must have been produced by [`PagePoolInner::payload_of`].
    unsafe fn header_of(payload: NonNull<u8>) -> NonNull<PageHeader> {
        NonNull::new_unchecked(payload.as_ptr().sub(HEADER_BYTES).cast::<PageHeader>())
    }
}

impl Drop for PagePoolInner {
    fn drop(&mut self) {
        let outstanding = self.outstanding.load(Ordering::Relaxed);
        if outstanding != 0 {
            // Handed-out pages cannot be freed safely; they are leaked.
            tracing::warn!(outstanding, "page pool dropped with pages still handed out");
        }

        for pool in &self.pools {
            for stack in [&pool.fresh, &pool.garbage] {
                let mut page = stack.take();
                while let Some(current) = NonNull::new(page) {
                    // Safety: teardown is exclusive; every page in the
                    // lists belongs to this pool.
                    unsafe {
                        page = (*current.as_ptr()).next;
                        dealloc(current.as_ptr().cast::<u8>(), self.page_layout());
                    }
                }
            }
        }
    }
}

// Safety: the raw pointers inside are either atomically published list
// links or the stable back-reference to the Arc-pinned inner; all
// shared mutation goes through atomics.
unsafe impl Send for PagePoolInner {}
unsafe impl Sync for PagePoolInner {}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_pool(page_bytes: usize, max_total_bytes: usize) -> PagePool {
        PagePool::with_config(PagePoolConfig {
            page_bytes,
            max_total_bytes,
            auto_reclaim: false,
        })
    }

    #[test]
    fn test_payload_arithmetic() {
        let pool = manual_pool(4096, 1 << 20);
        assert_eq!(pool.payload_bytes(), 4096 - HEADER_BYTES);
        assert_eq!(pool.payload_bytes() % MAX_ALIGN, 0);
    }

    #[test]
    fn test_allocate_roundtrip() {
        let pool = manual_pool(4096, 1 << 20);
        let payload = pool.allocate().unwrap();
        assert_eq!(payload.as_ptr() as usize % MAX_ALIGN, 0);

        // The payload is writable over its full extent.
        unsafe {
            ptr::write_bytes(payload.as_ptr(), 0xa5, pool.payload_bytes());
            PagePool::deallocate(payload);
        }

        let stats = pool.stats();
        assert_eq!(stats.pages_created, 1);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn test_hard_cap_exhaustion() {
        let pool = manual_pool(4096, 2 * 4096);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();

        match pool.allocate() {
            Err(KernelError::Exhausted { limit }) => assert_eq!(limit, 2),
            other => panic!("expected exhaustion, got {other:?}"),
        }

        unsafe {
            PagePool::deallocate(a);
            PagePool::deallocate(b);
        }
    }

    #[test]
    fn test_recycled_page_ages_one_full_cycle() {
        let pool = manual_pool(4096, 1 << 20);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        unsafe {
            PagePool::deallocate(a);
            PagePool::deallocate(b);
        }

        // One cycle is not enough for a recycled page to resurface.
        pool.tick();
        let c = pool.allocate().unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);

        // After the second cycle one of the two is freed and the other
        // is fresh again.
        pool.tick();
        let d = pool.allocate().unwrap();
        assert!(d == a || d == b);
        assert_eq!(pool.stats().pages_freed, 1);

        unsafe {
            PagePool::deallocate(c);
            PagePool::deallocate(d);
        }
    }

    #[test]
    fn test_freed_page_returns_cap_headroom() {
        let pool = manual_pool(4096, 4096);
        let a = pool.allocate().unwrap();
        assert!(pool.allocate().is_err());

        unsafe { PagePool::deallocate(a) };
        pool.tick();
        assert!(pool.allocate().is_err(), "page must age before its slot frees");
        pool.tick();

        let b = pool.allocate().unwrap();
        unsafe { PagePool::deallocate(b) };
    }

    #[test]
    fn test_page_stack_prepend_preserves_concurrent_pushes() {
        let pool = manual_pool(512, 1 << 20);
        let inner = &*pool.inner;

        let a = inner.new_page().unwrap();
        let b = inner.new_page().unwrap();
        let c = inner.new_page().unwrap();

        let stack = PageStack::new();
        stack.push(a);
        stack.push(b);
        let chain = stack.take();

        stack.push(c);
        stack.prepend(chain);

        let mut popped = Vec::new();
        while let Some(page) = stack.pop() {
            popped.push(page);
        }
        assert_eq!(popped.len(), 3);

        for page in popped {
            unsafe { inner.free_page(page) };
        }
    }
}
