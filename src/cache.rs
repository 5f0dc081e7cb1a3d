//! The cache layer: a collection of slabs serving one object size +
//! constructor + destructor, with full/partial/free slab lists, colouring,
//! and shrink hysteresis.
//!
//! Public entry points take the cache's own lock exactly once and call
//! private, non-locking helpers for the "recursive" steps (`shrink` tearing
//! down slabs, `destroy` tearing down slabs), since `spin::Mutex` is not
//! reentrant.

use crate::consts::{CACHE_L1_LINE_SIZE, NAME_LENGTH};
use crate::error::ErrorCode;
use crate::slab::{
    self, unused_space_with_optimal_slots, Constructor, Destructor, SlabHeader,
};
use crate::GlobalState;
use core::ptr::NonNull;
use spin::Mutex;

/// Mutable state protected by a cache's own lock.
struct CacheState {
    slabs_full: Option<NonNull<SlabHeader>>,
    slabs_partial: Option<NonNull<SlabHeader>>,
    slabs_free: Option<NonNull<SlabHeader>>,
    num_slabs: usize,
    /// Set once a slab has been created since the last successful shrink;
    /// a shrink is skipped while this is set.
    grew_since_last_shrink: bool,
    shrink_done: bool,
    current_alignment: usize,
    error_code: ErrorCode,
}

/// A cache: collection of slabs for one object size, constructor, and
/// destructor. Placed in the arena via [`CacheInner::init_at`] — see
/// `Allocator::alloc_cache_inner`.
pub(crate) struct CacheInner {
    name: [u8; NAME_LENGTH],
    slot_size: usize,
    optimal_slots_per_slab: usize,
    ctor: Option<Constructor>,
    dtor: Option<Destructor>,
    alignments: usize,
    state: Mutex<CacheState>,
    /// Registry link. Mutated only while the allocator's global lock is
    /// held.
    pub(crate) registry_next: Option<NonNull<CacheInner>>,
}

// SAFETY: access to the raw pointers embedded in `CacheInner` and the slabs
// it owns is always mediated by `state` (a `spin::Mutex`) or by the
// allocator's global lock for `registry_next`.
unsafe impl Send for CacheInner {}
unsafe impl Sync for CacheInner {}

impl CacheInner {
    /// Writes a freshly-initialized `CacheInner` at `ptr` via placement
    /// construction.
    ///
    /// # Safety
    /// `ptr` must point to at least `size_of::<CacheInner>()` writable,
    /// properly aligned bytes that this call takes ownership of.
    pub(crate) unsafe fn init_at(
        ptr: NonNull<u8>,
        name: &str,
        slot_size: usize,
        ctor: Option<Constructor>,
        dtor: Option<Destructor>,
    ) -> NonNull<CacheInner> {
        let mut name_buf = [0u8; NAME_LENGTH];
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_LENGTH - 1);
        name_buf[..n].copy_from_slice(&bytes[..n]);

        let optimal_slots_per_slab = slab::optimal_slots_per_slab(slot_size);
        let alignments = unused_space_with_optimal_slots(slot_size) / CACHE_L1_LINE_SIZE;

        let inner = CacheInner {
            name: name_buf,
            slot_size,
            optimal_slots_per_slab,
            ctor,
            dtor,
            alignments,
            state: Mutex::new(CacheState {
                slabs_full: None,
                slabs_partial: None,
                slabs_free: None,
                num_slabs: 0,
                grew_since_last_shrink: false,
                shrink_done: false,
                current_alignment: 0,
                error_code: ErrorCode::None,
            }),
            registry_next: None,
        };

        let cache_ptr = ptr.as_ptr().cast::<CacheInner>();
        cache_ptr.write(inner);
        NonNull::new_unchecked(cache_ptr)
    }

    pub(crate) fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).unwrap_or("<invalid-name>")
    }

    pub(crate) fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub(crate) fn error_code(&self) -> ErrorCode {
        self.state.lock().error_code
    }

    /// Allocates one object: partial list first, then free list, then a
    /// freshly-created slab.
    pub(crate) fn alloc(&self, global: &Mutex<GlobalState>) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();

        if let Some(mut s) = state.slabs_partial {
            let slab = unsafe { s.as_mut() };
            let ret = slab.alloc(self.ctor);
            if slab.is_full() {
                state.slabs_partial = slab.next;
                slab.next = state.slabs_full;
                state.slabs_full = Some(s);
            }
            return ret;
        }

        if let Some(mut s) = state.slabs_free {
            let slab = unsafe { s.as_mut() };
            let ret = slab.alloc(self.ctor);
            state.slabs_free = slab.next;
            if slab.is_full() {
                slab.next = state.slabs_full;
                state.slabs_full = Some(s);
            } else {
                slab.next = state.slabs_partial;
                state.slabs_partial = Some(s);
            }
            return ret;
        }

        // Create a new slab. Lock ordering: cache.lock is already held,
        // taking the global (buddy) lock now is the only permitted order.
        let created = {
            let mut g = global.lock();
            SlabHeader::create(
                &mut g.buddy,
                self.optimal_slots_per_slab,
                self.slot_size,
                self.ctor,
                state.current_alignment,
            )
        };

        let mut s = match created {
            Some(s) => s,
            None => {
                state.error_code = ErrorCode::NoMemory;
                log::debug!("cache \"{}\" out of memory growing for a new slab", self.name());
                return None;
            }
        };
        log::debug!("cache \"{}\" grew a new slab ({} slots)", self.name(), self.optimal_slots_per_slab);

        let slab = unsafe { s.as_mut() };
        let ret = slab.alloc(self.ctor);
        state.num_slabs += 1;
        if self.alignments != 0 {
            state.current_alignment = (state.current_alignment + 1) % self.alignments;
        }
        if slab.is_full() {
            slab.next = state.slabs_full;
            state.slabs_full = Some(s);
        } else {
            slab.next = state.slabs_partial;
            state.slabs_partial = Some(s);
        }

        if state.shrink_done {
            state.grew_since_last_shrink = true;
            state.shrink_done = false;
        } else if state.grew_since_last_shrink {
            state.shrink_done = false;
            state.grew_since_last_shrink = false;
        }

        ret
    }

    /// Routes a free by address: full list first, then partial.
    pub(crate) fn free(&self, objp: NonNull<u8>) -> bool {
        let mut state = self.state.lock();

        let mut prev: Option<NonNull<SlabHeader>> = None;
        let mut cur = state.slabs_full;
        while let Some(mut s) = cur {
            let slab = unsafe { s.as_mut() };
            if slab.free(objp) {
                match prev {
                    Some(mut p) => unsafe { p.as_mut().next = slab.next },
                    None => state.slabs_full = slab.next,
                }
                if slab.is_empty() {
                    slab.next = state.slabs_free;
                    state.slabs_free = Some(s);
                } else {
                    slab.next = state.slabs_partial;
                    state.slabs_partial = Some(s);
                }
                return true;
            }
            prev = cur;
            cur = slab.next;
        }

        let mut prev: Option<NonNull<SlabHeader>> = None;
        let mut cur = state.slabs_partial;
        while let Some(mut s) = cur {
            let slab = unsafe { s.as_mut() };
            if slab.free(objp) {
                if slab.is_empty() {
                    match prev {
                        Some(mut p) => unsafe { p.as_mut().next = slab.next },
                        None => state.slabs_partial = slab.next,
                    }
                    slab.next = state.slabs_free;
                    state.slabs_free = Some(s);
                }
                return true;
            }
            prev = cur;
            cur = slab.next;
        }

        state.error_code = ErrorCode::FreeingObject;
        false
    }

    /// Destroys a single slab: runs destructors, returns its blocks to the
    /// buddy engine.
    fn destroy_slab(
        &self,
        state: &mut CacheState,
        global: &Mutex<GlobalState>,
        mut slab_ptr: NonNull<SlabHeader>,
    ) -> Result<(), ()> {
        let slab = unsafe { slab_ptr.as_mut() };
        slab.destroy_objects(self.dtor);
        let space = slab.space();
        let order = slab.num_blocks().trailing_zeros() as usize;

        let mut g = global.lock();
        let n = g.buddy.block_index_of(space);
        let res = g.buddy.free(n, order);
        drop(g);

        if res.is_err() {
            state.error_code = ErrorCode::DeletingSlab;
        }
        res
    }

    /// Destroys every slab on the free list and returns their blocks,
    /// unless a slab has grown the cache since the last shrink. Returns
    /// the number of blocks freed.
    pub(crate) fn shrink(&self, global: &Mutex<GlobalState>) -> usize {
        let mut state = self.state.lock();

        if state.grew_since_last_shrink {
            state.error_code = ErrorCode::ShrinkingAvoided;
            log::debug!("shrink of cache \"{}\" avoided, cache grew since last shrink", self.name());
            return 0;
        }
        if state.slabs_free.is_none() {
            return 0;
        }

        let mut blocks_freed = 0usize;
        let mut cur = state.slabs_free;
        while let Some(s) = cur {
            let next = unsafe { (*s.as_ptr()).next };
            state.slabs_free = next;
            let blocks = unsafe { (*s.as_ptr()).num_blocks() };
            if self.destroy_slab(&mut state, global, s).is_ok() {
                blocks_freed += blocks;
            }
            state.num_slabs -= 1;
            cur = next;
        }
        state.shrink_done = true;
        log::debug!("shrunk cache \"{}\", freed {blocks_freed} blocks", self.name());
        blocks_freed
    }

    /// Destroys every slab in all three lists.
    /// Registry unlinking is the caller's responsibility (it needs the
    /// global lock and the registry head, neither of which a `CacheInner`
    /// owns).
    pub(crate) fn destroy_all_slabs(&self, global: &Mutex<GlobalState>) {
        let mut state = self.state.lock();

        let mut cur = state.slabs_free;
        while let Some(s) = cur {
            let next = unsafe { (*s.as_ptr()).next };
            state.slabs_free = next;
            let _ = self.destroy_slab(&mut state, global, s);
            cur = next;
        }

        let mut cur = state.slabs_partial;
        while let Some(s) = cur {
            let next = unsafe { (*s.as_ptr()).next };
            state.slabs_partial = next;
            let _ = self.destroy_slab(&mut state, global, s);
            cur = next;
        }

        let mut cur = state.slabs_full;
        while let Some(s) = cur {
            let next = unsafe { (*s.as_ptr()).next };
            state.slabs_full = next;
            let _ = self.destroy_slab(&mut state, global, s);
            cur = next;
        }
    }

    pub(crate) fn info(&self) -> CacheInfo {
        let state = self.state.lock();
        let mut slots_occupied = 0usize;
        let mut total_slots = 0usize;
        let mut cur = state.slabs_full;
        while let Some(s) = cur {
            let slab = unsafe { s.as_ref() };
            slots_occupied += slab.slots_occupied();
            total_slots += slab.num_slots();
            cur = slab.next;
        }
        let mut cur = state.slabs_partial;
        while let Some(s) = cur {
            let slab = unsafe { s.as_ref() };
            slots_occupied += slab.slots_occupied();
            total_slots += slab.num_slots();
            cur = slab.next;
        }
        let mut cur = state.slabs_free;
        while let Some(s) = cur {
            let slab = unsafe { s.as_ref() };
            total_slots += slab.num_slots();
            cur = slab.next;
        }

        let percent_full = if total_slots != 0 && state.num_slabs != 0 {
            Some(slots_occupied as f32 / (state.num_slabs * self.optimal_slots_per_slab) as f32 * 100.0)
        } else {
            None
        };

        CacheInfo {
            name: self.name().to_string(),
            slot_size: self.slot_size,
            num_slabs: state.num_slabs,
            blocks: state.num_slabs * crate::slab::blocks_occupied(self.slot_size),
            optimal_slots_per_slab: self.optimal_slots_per_slab,
            percent_full,
        }
    }
}

/// Structured diagnostic snapshot of a cache's slab occupancy. Callers log
/// this via the `log` facade instead of printing it directly.
#[derive(Debug, Clone)]
pub struct CacheInfo {
    pub name: String,
    pub slot_size: usize,
    pub num_slabs: usize,
    pub blocks: usize,
    pub optimal_slots_per_slab: usize,
    pub percent_full: Option<f32>,
}
