//! A fixed-arena, kernel-style allocator: a power-of-two buddy block engine
//! with a slab allocator layered on top for per-type object caches, plus a
//! general-purpose size-class router for untyped `malloc`/`free`.
//!
//! This is the kind of allocator a small operating-system kernel hands its
//! subsystems: the caller supplies one contiguous arena up front (this
//! crate never asks the OS for memory itself), and everything else — cache
//! metadata, slab headers, bufctls — is carved out of that same arena via
//! placement construction.
//!
//! # Example
//!
//! ```
//! use kmem_alloc::Allocator;
//!
//! let arena: &'static mut [u8] = Box::leak(vec![0u8; 64 * 4096].into_boxed_slice());
//! let allocator = Allocator::new(arena).unwrap();
//!
//! let cache = allocator.create_cache("widgets", 64, None, None).unwrap();
//! let obj = cache.alloc().unwrap();
//! assert!(cache.free(obj));
//! ```

mod buddy;
mod cache;
mod consts;
mod error;
mod slab;

pub use consts::{
    BLOCK_SIZE, CACHE_L1_LINE_SIZE, MAX_N_OPTIMAL, MIN_SIZE_POWER_OF_2_BYTES, NAME_LENGTH, N,
    SIZES,
};
pub use error::{ErrorCode, InitError};
pub use slab::{Constructor, Destructor};

pub use cache::CacheInfo;

use buddy::Buddy;
use cache::CacheInner;
use core::mem::size_of;
use core::ptr::NonNull;
use spin::Mutex;

/// Allocator-wide state: the buddy engine, the cache registry, the
/// bootstrap caches, and the size-class table. Protected by one lock
/// covering both the buddy engine and the size-class table.
pub(crate) struct GlobalState {
    pub(crate) buddy: Buddy,
    registry_head: Option<NonNull<CacheInner>>,
    cache_for_caches: Option<NonNull<CacheInner>>,
    cache_for_handles: Option<NonNull<CacheInner>>,
    sizes: [Option<NonNull<CacheInner>>; SIZES],
}

// SAFETY: every raw pointer in `GlobalState` either points into the arena
// (owned exclusively by the `Allocator` that created this `GlobalState`) or
// at a `CacheInner`, which is itself `Send + Sync`. All mutation happens
// under `Allocator::global`'s lock.
unsafe impl Send for GlobalState {}

/// The allocator root: owns the arena and the global lock, and is the
/// factory for caches and the generic `malloc`/`free` router.
///
/// There is deliberately no process-wide singleton here — tests and
/// multiple independent subsystems can each own their own `Allocator` over
/// their own arena.
pub struct Allocator {
    global: Mutex<GlobalState>,
    // Held only to keep the arena borrow alive for as long as the
    // allocator exists; never read again after construction.
    #[allow(dead_code)]
    arena: &'static mut [u8],
}

// SAFETY: `arena` is never read after construction except through the raw
// pointer captured by `Buddy`, which is itself `Send` and exclusively
// guarded by `global`.
unsafe impl Sync for Allocator {}

impl Allocator {
    /// Builds a new allocator over `arena`, using as many whole
    /// `BLOCK_SIZE` blocks as fit.
    pub fn new(arena: &'static mut [u8]) -> Result<Self, InitError> {
        let block_num = arena.len() / BLOCK_SIZE;
        Self::with_block_count(arena, block_num)
    }

    /// Builds a new allocator over exactly `block_num` blocks of `arena`.
    ///
    /// `block_num` must be less than `2^N`; `arena` must hold at least
    /// `block_num * BLOCK_SIZE` bytes.
    pub fn with_block_count(arena: &'static mut [u8], block_num: usize) -> Result<Self, InitError> {
        if block_num >= (1 << N) {
            return Err(InitError::BlockCountExceeded {
                block_num,
                max_order: N as u32,
            });
        }
        assert!(
            arena.len() >= block_num * BLOCK_SIZE,
            "arena too small for {block_num} blocks"
        );

        let base = NonNull::new(arena.as_mut_ptr()).expect("arena pointer is never null");
        let mut buddy = Buddy::new(base, block_num)?;
        log::info!("buddy engine initialized over {block_num} blocks ({} bytes)", block_num * BLOCK_SIZE);

        // Bootstrap: the cache-for-caches is placed directly via the buddy
        // engine (the only placement-new that doesn't go through a cache's
        // own `alloc`), then the cache-for-handles is allocated *through*
        // the cache-for-caches.
        let cache_for_caches_size = size_of::<CacheInner>();
        let blk = buddy
            .alloc_by_bytes(cache_for_caches_size)
            .ok_or(InitError::CacheForCachesFailed)?;
        let addr = buddy.addr_of(blk).ok_or(InitError::CacheForCachesFailed)?;
        let cache_for_caches =
            unsafe { CacheInner::init_at(addr, "CACHE FOR CACHES", cache_for_caches_size, None, None) };

        let global = GlobalState {
            buddy,
            registry_head: Some(cache_for_caches),
            cache_for_caches: Some(cache_for_caches),
            cache_for_handles: None,
            sizes: [None; SIZES],
        };

        let allocator = Allocator {
            global: Mutex::new(global),
            arena,
        };

        let handle_cache_space = unsafe { cache_for_caches.as_ref() }
            .alloc(&allocator.global)
            .ok_or(InitError::CacheForHandlesFailed)?;
        let cache_for_handles = unsafe {
            CacheInner::init_at(
                handle_cache_space,
                "CACHE FOR HANDLES",
                size_of::<HandleInner>(),
                None,
                None,
            )
        };

        {
            let mut g = allocator.global.lock();
            unsafe {
                cache_for_handles.as_ptr().as_mut().unwrap().registry_next = g.registry_head;
            }
            g.registry_head = Some(cache_for_handles);
            g.cache_for_handles = Some(cache_for_handles);
        }

        log::info!("allocator bootstrap complete");
        Ok(allocator)
    }

    /// Allocates and links a fresh `CacheInner` into the registry, using
    /// the cache-for-caches. Shared by [`Allocator::create_cache`] and the
    /// lazy size-class creation in [`Allocator::malloc`].
    fn alloc_cache_inner(
        &self,
        name: &str,
        size: usize,
        ctor: Option<Constructor>,
        dtor: Option<Destructor>,
    ) -> Option<NonNull<CacheInner>> {
        let cache_for_caches = self.global.lock().cache_for_caches?;
        let space = unsafe { cache_for_caches.as_ref() }.alloc(&self.global)?;
        let cache_inner = unsafe { CacheInner::init_at(space, name, size, ctor, dtor) };

        let mut g = self.global.lock();
        unsafe {
            cache_inner.as_ptr().as_mut().unwrap().registry_next = g.registry_head;
        }
        g.registry_head = Some(cache_inner);
        Some(cache_inner)
    }

    /// Unlinks and returns a cache's own storage, without touching its
    /// slabs. Used when a lazily-created size-class cache loses a creation
    /// race (see [`Allocator::size_class_cache`]).
    fn discard_unused_cache(&self, cache_ptr: NonNull<CacheInner>) {
        let mut g = self.global.lock();
        unlink_cache(&mut g.registry_head, cache_ptr);
        let cache_for_caches = g.cache_for_caches.expect("bootstrap invariant");
        drop(g);
        unsafe { cache_for_caches.as_ref() }.free(cache_ptr.cast());
    }

    /// Creates a cache for objects of `size` bytes, with optional
    /// constructor/destructor.
    ///
    /// Returns `None` on OOM. `name` longer than [`NAME_LENGTH`] - 1 bytes
    /// is silently truncated.
    pub fn create_cache(
        &self,
        name: &str,
        size: usize,
        ctor: Option<Constructor>,
        dtor: Option<Destructor>,
    ) -> Option<CacheHandle<'_>> {
        if size == 0 {
            return None;
        }
        let cache_inner = self.alloc_cache_inner(name, size, ctor, dtor)?;

        let cache_for_handles = self.global.lock().cache_for_handles?;
        let handle_space = unsafe { cache_for_handles.as_ref() }.alloc(&self.global)?;
        let handle_ptr = handle_space.cast::<HandleInner>();
        unsafe {
            handle_ptr.as_ptr().write(HandleInner {
                cache: Some(cache_inner),
            });
        }
        log::info!("created cache \"{name}\" (slot_size={size})");

        Some(CacheHandle {
            handle: handle_ptr,
            allocator: self,
        })
    }

    /// Destroys a cache: every slab is torn down (running destructors),
    /// the cache is unlinked from the registry, and both the cache's own
    /// storage and its handle are returned to their respective bootstrap
    /// caches.
    ///
    /// Consuming `handle` by value, and nulling its `cache` field *before*
    /// the handle's storage is freed, closes a possible
    /// free-then-write-through-freed-pointer window.
    pub fn destroy_cache(&self, handle: CacheHandle<'_>) {
        let cache_ptr = unsafe { handle.handle.as_ref() }
            .cache
            .expect("double destroy of cache handle");

        unsafe { cache_ptr.as_ref() }.destroy_all_slabs(&self.global);

        {
            let mut g = self.global.lock();
            unlink_cache(&mut g.registry_head, cache_ptr);
            let cache_for_caches = g.cache_for_caches.expect("bootstrap invariant");
            drop(g);
            unsafe { cache_for_caches.as_ref() }.free(cache_ptr.cast());
        }

        unsafe {
            handle.handle.as_ptr().as_mut().unwrap().cache = None;
        }

        {
            let g = self.global.lock();
            let cache_for_handles = g.cache_for_handles.expect("bootstrap invariant");
            drop(g);
            unsafe { cache_for_handles.as_ref() }.free(handle.handle.cast());
        }

        log::info!("destroyed cache");
    }

    /// Returns the cache backing size-class `i` (upper bound `upper`
    /// bytes), creating it lazily on first use.
    ///
    /// If two threads race to create the same size-class, the loser's
    /// cache is unlinked and returned to `cache_for_caches` rather than
    /// published — see [`Allocator::discard_unused_cache`]. The size-class
    /// table lives under the same global lock as the buddy engine, so no
    /// caller ever observes a half-built cache there.
    fn size_class_cache(&self, i: usize, upper: usize) -> Option<NonNull<CacheInner>> {
        if let Some(c) = self.global.lock().sizes[i] {
            return Some(c);
        }
        let name = format!("size-{upper}");
        let created = self.alloc_cache_inner(&name, upper, None, None)?;

        let mut g = self.global.lock();
        match g.sizes[i] {
            Some(existing) => {
                drop(g);
                self.discard_unused_cache(created);
                Some(existing)
            }
            None => {
                g.sizes[i] = Some(created);
                Some(created)
            }
        }
    }

    /// Generic allocation, routed to the smallest size-class whose upper
    /// bound is at least `size`. `None` above the largest size-class or on
    /// OOM.
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let mut lower = 0usize;
        let mut upper = MIN_SIZE_POWER_OF_2_BYTES;
        for i in 0..SIZES {
            if size > lower && size <= upper {
                let cache_ptr = self.size_class_cache(i, upper)?;
                return unsafe { cache_ptr.as_ref() }.alloc(&self.global);
            }
            lower = upper;
            upper *= 2;
        }
        None
    }

    /// Generic free: scans the size-class table for the cache that owns
    /// `ptr`, frees it there, and immediately shrinks that size-class.
    /// Silent no-op if no size-class claims the pointer.
    pub fn free(&self, ptr: NonNull<u8>) {
        let sizes = self.global.lock().sizes;
        for slot in sizes {
            if let Some(c) = slot {
                let cache_ref = unsafe { c.as_ref() };
                if cache_ref.free(ptr) {
                    cache_ref.shrink(&self.global);
                    return;
                }
            }
        }
    }

    /// Structured diagnostic snapshot of size-class `index`. `None` if
    /// `index` is out of range or that size-class hasn't been created yet.
    pub fn sizes_info(&self, index: usize) -> Option<CacheInfo> {
        if index >= SIZES {
            return None;
        }
        let c = self.global.lock().sizes[index]?;
        Some(unsafe { c.as_ref() }.info())
    }

    /// Last error code recorded by size-class `index`.
    pub fn sizes_error(&self, index: usize) -> Option<ErrorCode> {
        if index >= SIZES {
            return None;
        }
        let c = self.global.lock().sizes[index]?;
        Some(unsafe { c.as_ref() }.error_code())
    }
}

/// Unlinks `target` from the singly linked registry rooted at `head`.
fn unlink_cache(head: &mut Option<NonNull<CacheInner>>, target: NonNull<CacheInner>) {
    let mut prev: Option<NonNull<CacheInner>> = None;
    let mut cur = *head;
    while let Some(c) = cur {
        let next = unsafe { c.as_ref() }.registry_next;
        if c == target {
            match prev {
                Some(mut p) => unsafe { p.as_mut().registry_next = next },
                None => *head = next,
            }
            return;
        }
        prev = cur;
        cur = next;
    }
}

/// Indirection object a user holds for a cache. Allocated out of the
/// cache-for-handles; the real [`CacheInner`] lives in the
/// cache-for-caches.
struct HandleInner {
    cache: Option<NonNull<CacheInner>>,
}

/// A user-facing reference to a cache. Borrows the [`Allocator`] that
/// created it, so a `CacheHandle` can never outlive its allocator.
pub struct CacheHandle<'a> {
    handle: NonNull<HandleInner>,
    allocator: &'a Allocator,
}

// SAFETY: all access to the pointee is mediated by the cache's own lock
// (via `CacheInner`'s methods) or, for the handle's own `cache` field, by
// construction (only ever written once at creation and once, under
// `Allocator::destroy_cache`, at destruction).
unsafe impl Send for CacheHandle<'_> {}
unsafe impl Sync for CacheHandle<'_> {}

impl<'a> CacheHandle<'a> {
    fn cache(&self) -> &CacheInner {
        let cache_ptr = unsafe { self.handle.as_ref() }
            .cache
            .expect("cache handle used after its cache was destroyed");
        unsafe { cache_ptr.as_ref() }
    }

    /// Allocates one object from this cache, running the constructor if
    /// the slot wasn't already initialized.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        self.cache().alloc(&self.allocator.global)
    }

    /// Frees an object previously returned by [`CacheHandle::alloc`] on
    /// this same handle. Returns `false` (and records
    /// [`ErrorCode::FreeingObject`]) if `ptr` doesn't belong to this cache.
    pub fn free(&self, ptr: NonNull<u8>) -> bool {
        self.cache().free(ptr)
    }

    /// Returns every slab on the free list to the buddy engine, unless a
    /// slab has grown the cache since the last successful shrink. Returns
    /// the number of blocks freed.
    pub fn shrink(&self) -> usize {
        self.cache().shrink(&self.allocator.global)
    }

    /// Structured diagnostic snapshot of this cache.
    pub fn info(&self) -> CacheInfo {
        self.cache().info()
    }

    /// The last error recorded for this cache.
    pub fn error_code(&self) -> ErrorCode {
        self.cache().error_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn arena(blocks: usize) -> &'static mut [u8] {
        let _ = env_logger::builder().is_test(true).try_init();
        Box::leak(vec![0u8; blocks * BLOCK_SIZE].into_boxed_slice())
    }

    #[test]
    fn create_alloc_free_shrink_empties_cache() {
        let a = Allocator::new(arena(64)).unwrap();
        let cache = a.create_cache("T", 64, None, None).unwrap();

        let mut objs = Vec::new();
        for _ in 0..1000 {
            objs.push(cache.alloc().expect("arena sized generously enough"));
        }
        for o in objs {
            assert!(cache.free(o));
        }
        let freed = cache.shrink();
        assert!(freed > 0);
        let info = cache.info();
        assert_eq!(info.num_slabs, 0);
    }

    #[test]
    fn malloc_routes_to_smallest_fitting_size_class_and_free_is_silent_on_garbage() {
        let a = Allocator::new(arena(256)).unwrap();

        let p40 = a.malloc(40).unwrap();
        let p100 = a.malloc(100).unwrap();
        a.free(p40);
        a.free(p100);

        let garbage = NonNull::new(0x1234 as *mut u8).unwrap();
        a.free(garbage); // must not panic
    }

    #[test]
    fn malloc_above_largest_size_class_returns_none() {
        let a = Allocator::new(arena(64)).unwrap();
        let largest = MIN_SIZE_POWER_OF_2_BYTES << (SIZES - 1);
        assert!(a.malloc(largest + 1).is_none());
    }

    #[test]
    fn shrink_blocked_by_hysteresis_returns_zero_and_records_error() {
        let a = Allocator::new(arena(64)).unwrap();
        let cache = a.create_cache("H", 64, None, None).unwrap();
        let obj = cache.alloc().unwrap(); // creates a slab: grew_since_last_shrink-ish state
        assert!(cache.free(obj)); // slab becomes free, but it just grew
        assert_eq!(cache.shrink(), 0);
        assert_eq!(cache.error_code(), ErrorCode::ShrinkingAvoided);
    }

    #[test]
    fn shrink_hysteresis_anomaly_permits_one_immediate_re_shrink() {
        // A shrink followed by exactly one grow leaves both flags false,
        // allowing an immediate further shrink. Documented, not "fixed" —
        // an artifact of the hysteresis flag bookkeeping.
        let a = Allocator::new(arena(64)).unwrap();
        let cache = a.create_cache("A", 4000, None, None).unwrap(); // 1 slot/slab
        let o1 = cache.alloc().unwrap();
        assert!(cache.free(o1));
        assert_eq!(cache.shrink(), 0); // nothing grew yet, free list was empty before alloc
        let o2 = cache.alloc().unwrap(); // grows again (new slab)
        assert!(cache.free(o2));
        // A single grow since the last shrink-with-effect normally blocks
        // a further shrink, but the flag bookkeeping resets after exactly
        // one grow following a shrink, so this succeeds.
        assert!(cache.shrink() > 0);
    }

    #[test]
    fn single_slot_per_slab_cache_goes_straight_free_to_full() {
        let a = Allocator::new(arena(64)).unwrap();
        let huge = BLOCK_SIZE - 256;
        let cache = a.create_cache("huge", huge, None, None).unwrap();
        let o = cache.alloc().unwrap();
        let info = cache.info();
        assert_eq!(info.optimal_slots_per_slab, 1);
        assert!(cache.free(o));
    }

    #[test]
    fn destroying_cache_runs_destructor_for_every_initialized_slot() {
        static DTOR_CALLS: AtomicUsize = AtomicUsize::new(0);
        fn dtor(_p: NonNull<u8>) {
            DTOR_CALLS.fetch_add(1, Ordering::SeqCst);
        }

        let a = Allocator::new(arena(64)).unwrap();
        let cache = a.create_cache("D", 128, None, Some(dtor)).unwrap();
        let o1 = cache.alloc().unwrap();
        let _o2 = cache.alloc().unwrap();
        assert!(cache.free(o1));

        a.destroy_cache(cache);
        assert!(DTOR_CALLS.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn creating_many_caches_and_destroying_them_restores_buddy_state() {
        let a = Allocator::new(arena(256)).unwrap();
        let before_blocks = { a.global.lock().buddy.block_num() };

        let mut handles = Vec::new();
        for i in 0..8 {
            handles.push(a.create_cache(&format!("c{i}"), 48, None, None).unwrap());
        }
        for h in handles {
            a.destroy_cache(h);
        }

        let after_blocks = { a.global.lock().buddy.block_num() };
        assert_eq!(before_blocks, after_blocks);
    }

    #[test]
    fn block_count_at_or_above_2_pow_n_is_rejected() {
        let err = Allocator::with_block_count(arena(1), 1 << N).unwrap_err();
        matches!(err, InitError::BlockCountExceeded { .. });
    }

    #[test]
    fn create_alloc_free_concurrently_from_many_threads() {
        let a = Allocator::new(arena(1023)).unwrap();
        let cache_a = a.create_cache("A", 64, None, None).unwrap();
        let cache_b = a.create_cache("B", 128, None, None).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        if let Some(o) = cache_a.alloc() {
                            assert!(cache_a.free(o));
                        }
                        if let Some(o) = cache_b.alloc() {
                            assert!(cache_b.free(o));
                        }
                    }
                });
            }
        });

        assert!(cache_a.shrink() > 0 || cache_a.info().num_slabs == 0);
        assert!(cache_b.shrink() > 0 || cache_b.info().num_slabs == 0);
    }
}
