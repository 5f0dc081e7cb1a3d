//! Property tests for the allocator's round-trip laws: repeated create/alloc
//! churn should never leak arena space, and constructors/destructors should
//! run exactly as many times as slots are ever initialized/torn down.

use kmem_alloc::Allocator;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::ptr::NonNull;

fn arena(blocks: usize) -> &'static mut [u8] {
    let _ = env_logger::builder().is_test(true).try_init();
    Box::leak(vec![0u8; blocks * kmem_alloc::BLOCK_SIZE].into_boxed_slice())
}

proptest! {
    /// Allocating and then immediately shrinking any number of small caches
    /// restores the allocator to a state with zero live slabs across all of
    /// them.
    #[test]
    fn create_alloc_free_shrink_never_leaks_slabs(n_caches in 1usize..6, objs_per_cache in 1usize..20) {
        let a = Allocator::new(arena(512)).unwrap();
        let mut handles = Vec::new();
        for i in 0..n_caches {
            let h = a.create_cache(&format!("p{i}"), 48, None, None).unwrap();
            let mut objs = Vec::new();
            for _ in 0..objs_per_cache {
                if let Some(o) = h.alloc() {
                    objs.push(o);
                }
            }
            for o in objs {
                prop_assert!(h.free(o));
            }
            prop_assert!(h.shrink() > 0 || h.info().num_slabs == 0);
            handles.push(h);
        }
        for h in handles {
            a.destroy_cache(h);
        }
    }

    /// Routing `malloc` through the size-class table always lands in a class
    /// whose slot size is at least the requested size, and the object can
    /// always be freed back through the generic `free`.
    #[test]
    fn malloc_free_round_trips_for_any_in_range_size(size in 1usize..(32usize << 12)) {
        let a = Allocator::new(arena(2048)).unwrap();
        if let Some(p) = a.malloc(size) {
            a.free(p);
        }
    }
}

static CTOR_CALLS: AtomicUsize = AtomicUsize::new(0);
static DTOR_CALLS: AtomicUsize = AtomicUsize::new(0);

fn counting_ctor(_p: NonNull<u8>) {
    CTOR_CALLS.fetch_add(1, Ordering::SeqCst);
}
fn counting_dtor(_p: NonNull<u8>) {
    DTOR_CALLS.fetch_add(1, Ordering::SeqCst);
}

proptest! {
    /// Every slot a constructor ever ran for gets exactly one destructor
    /// call when the cache is destroyed, regardless of how many times it
    /// was allocated and freed in between (destructors never run on a plain
    /// `free`, only on cache teardown).
    #[test]
    fn every_constructed_slot_gets_exactly_one_destructor_call(rounds in 1usize..30) {
        CTOR_CALLS.store(0, Ordering::SeqCst);
        DTOR_CALLS.store(0, Ordering::SeqCst);

        let a = Allocator::new(arena(256)).unwrap();
        let cache = a.create_cache("counted", 64, Some(counting_ctor), Some(counting_dtor)).unwrap();

        for _ in 0..rounds {
            let o = cache.alloc().unwrap();
            prop_assert!(cache.free(o));
        }
        let constructed = CTOR_CALLS.load(Ordering::SeqCst);
        prop_assert_eq!(DTOR_CALLS.load(Ordering::SeqCst), 0);

        a.destroy_cache(cache);
        prop_assert_eq!(DTOR_CALLS.load(Ordering::SeqCst), constructed);
    }
}
