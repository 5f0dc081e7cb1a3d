//! The slab allocator.
//!
//! A slab is one buddy-allocated chunk carved into a header, an array of
//! per-slot control words (bufctls), a cache-line colour offset, and the
//! object slots themselves.

use crate::buddy::{blocks_rounded, Buddy};
use crate::consts::{BLOCK_SIZE, CACHE_L1_LINE_SIZE, MAX_N_OPTIMAL, N};
use core::mem::size_of;
use core::ptr::NonNull;

/// A caller-supplied object constructor or destructor, running over an
/// opaque pointer into a slot. Invoked under the owning cache's lock.
pub type Constructor = fn(NonNull<u8>);
pub type Destructor = fn(NonNull<u8>);

/// Per-slot control word: a free-list link plus the "has this slot ever
/// been constructed" flag.
#[repr(C)]
struct Bufctl {
    next: Option<NonNull<Bufctl>>,
    initialized: bool,
}

/// Slab header, placed at offset 0 of a buddy-allocated chunk. Bufctls
/// follow immediately after the header; the object area
/// starts `colour_offset * CACHE_L1_LINE_SIZE` bytes after the bufctls.
#[repr(C)]
pub(crate) struct SlabHeader {
    space: NonNull<u8>,
    object_space: NonNull<u8>,
    num_slots: usize,
    slots_occupied: usize,
    slot_size: usize,
    blocks: usize,
    free_slot: Option<NonNull<Bufctl>>,
    pub(crate) next: Option<NonNull<SlabHeader>>,
}

impl SlabHeader {
    /// Carves a new slab for `num_slots` objects of `slot_size` bytes out
    /// of the buddy engine, running `ctor` once per slot if provided.
    pub(crate) fn create(
        buddy: &mut Buddy,
        num_slots: usize,
        slot_size: usize,
        ctor: Option<Constructor>,
        colour_offset: usize,
    ) -> Option<NonNull<SlabHeader>> {
        let space_req = num_slots * (slot_size + size_of::<Bufctl>()) + size_of::<SlabHeader>();
        let block_idx = buddy.alloc_by_bytes(space_req)?;
        let space = buddy.addr_of(block_idx)?;
        let blocks = blocks_rounded(space_req);

        let bufctl_base = unsafe { space.as_ptr().add(size_of::<SlabHeader>()) } as *mut Bufctl;
        let bufctls_end = unsafe { bufctl_base.add(num_slots) } as *mut u8;
        let object_space = unsafe {
            NonNull::new_unchecked(bufctls_end.add(colour_offset * CACHE_L1_LINE_SIZE))
        };

        // Thread the bufctl free list in index order and run the
        // constructor on every slot. Every bufctl is stamped `initialized =
        // true` here unconditionally, regardless of whether a constructor
        // was supplied; the `initialized == false` branch in `alloc` below
        // is a defensive path this makes unreachable in practice.
        for i in 0..num_slots {
            let bufctl_ptr = unsafe { bufctl_base.add(i) };
            let next = if i == num_slots - 1 {
                None
            } else {
                NonNull::new(unsafe { bufctl_base.add(i + 1) })
            };
            unsafe {
                bufctl_ptr.write(Bufctl {
                    next,
                    initialized: true,
                });
            }
            if let Some(c) = ctor {
                let obj = unsafe { NonNull::new_unchecked(object_space.as_ptr().add(i * slot_size)) };
                c(obj);
            }
        }

        let header = SlabHeader {
            space,
            object_space,
            num_slots,
            slots_occupied: 0,
            slot_size,
            blocks,
            free_slot: NonNull::new(bufctl_base),
            next: None,
        };

        unsafe {
            space.as_ptr().cast::<SlabHeader>().write(header);
            Some(NonNull::new_unchecked(space.as_ptr().cast::<SlabHeader>()))
        }
    }

    pub(crate) fn space(&self) -> NonNull<u8> {
        self.space
    }

    pub(crate) fn num_blocks(&self) -> usize {
        self.blocks
    }

    pub(crate) fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub(crate) fn slots_occupied(&self) -> usize {
        self.slots_occupied
    }

    pub(crate) fn is_full(&self) -> bool {
        self.num_slots == self.slots_occupied
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots_occupied == 0
    }

    fn bufctl_at(&self, index: usize) -> *mut Bufctl {
        debug_assert!(index <= self.num_slots);
        let base = unsafe { self.space.as_ptr().add(size_of::<SlabHeader>()) } as *mut Bufctl;
        unsafe { base.add(index) }
    }

    fn index_of(&self, b: NonNull<Bufctl>) -> usize {
        let first = self.space.as_ptr().wrapping_add(size_of::<SlabHeader>()) as *mut Bufctl;
        unsafe { b.as_ptr().offset_from(first) as usize }
    }

    fn object_at(&self, index: usize) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.object_space.as_ptr().add(index * self.slot_size)) }
    }

    /// Pops a free slot, running the constructor if the slot's bufctl is
    /// (defensively) uninitialized, and returns the object pointer.
    pub(crate) fn alloc(&mut self, ctor: Option<Constructor>) -> Option<NonNull<u8>> {
        let free = self.free_slot?;
        let index = self.index_of(free);
        let objp = self.object_at(index);

        // SAFETY: free points at a live bufctl inside this slab.
        let bufctl = unsafe { &mut *free.as_ptr() };
        if !bufctl.initialized {
            if let Some(c) = ctor {
                c(objp);
            }
            bufctl.initialized = true;
        }
        self.free_slot = bufctl.next;
        self.slots_occupied += 1;
        Some(objp)
    }

    pub(crate) fn object_belongs_to_slab(&self, objp: NonNull<u8>) -> bool {
        let start = self.object_space.as_ptr() as usize;
        let end = start + self.num_slots * self.slot_size;
        let p = objp.as_ptr() as usize;
        p >= start && p < end
    }

    /// Returns a slot to the free list. Does **not** run the destructor —
    /// that only happens when the whole slab is torn down. This is a
    /// deliberate caching optimisation: a freed object keeps its
    /// constructed state so a later `alloc` can skip re-running the
    /// constructor.
    pub(crate) fn free(&mut self, objp: NonNull<u8>) -> bool {
        if !self.object_belongs_to_slab(objp) {
            return false;
        }
        let index = (objp.as_ptr() as usize - self.object_space.as_ptr() as usize) / self.slot_size;
        let bufctl_ptr = self.bufctl_at(index);
        // SAFETY: index is within [0, num_slots) since objp belongs to the slab.
        let bufctl = unsafe { &mut *bufctl_ptr };
        if !bufctl.initialized {
            // No object has ever been allocated/initialized in this slot.
            return false;
        }
        bufctl.next = self.free_slot;
        self.free_slot = NonNull::new(bufctl_ptr);
        self.slots_occupied -= 1;
        true
    }

    /// Runs `dtor` over every slot that was ever initialized. Called once,
    /// right before the slab's blocks are returned to the buddy engine.
    pub(crate) fn destroy_objects(&mut self, dtor: Option<Destructor>) {
        let Some(dtor) = dtor else { return };
        for i in 0..self.num_slots {
            // SAFETY: i is in range.
            let bufctl = unsafe { &*self.bufctl_at(i) };
            if bufctl.initialized {
                dtor(self.object_at(i));
            }
        }
    }
}

/// For each order in `[0, min(N, MAX_N_OPTIMAL + 1))`, computes how many
/// slots of `slot_size` fit and how much space is wasted; accepts
/// immediately once waste is at most 1/8 of the chunk, otherwise tracks the
/// order with the best ratio seen.
pub(crate) fn optimal_slots_per_slab(slot_size: usize) -> usize {
    let mut optimal = 0usize;
    let mut max_ratio = 0f64;
    let mut blocks = 1usize;
    let limit = N.min(MAX_N_OPTIMAL + 1);

    for i in 0..limit {
        let bytes_available = blocks * BLOCK_SIZE;
        let per_slot = slot_size + size_of::<Bufctl>();
        let slots = (bytes_available.saturating_sub(size_of::<SlabHeader>())) / per_slot;
        let bytes_remaining =
            bytes_available - slots * per_slot - size_of::<SlabHeader>();
        let ratio = if bytes_remaining == 0 {
            f64::INFINITY
        } else {
            bytes_available as f64 / bytes_remaining as f64
        };

        if ratio >= 8.0 {
            return slots;
        }
        if ratio > max_ratio {
            max_ratio = ratio;
            optimal = slots;
        }
        if i >= MAX_N_OPTIMAL && slots > 0 {
            return optimal;
        }
        blocks *= 2;
    }
    optimal
}

/// The smallest slot count with a nonzero fit, walking orders upward.
/// Kept available for completeness but not wired into `Cache::alloc`'s
/// fallback path; see DESIGN.md.
#[allow(dead_code)]
pub(crate) fn minimal_slots_per_slab(slot_size: usize) -> Option<usize> {
    let mut blocks = 1usize;
    for _ in 0..N {
        let per_slot = slot_size + size_of::<Bufctl>();
        let slots = (blocks * BLOCK_SIZE).saturating_sub(size_of::<SlabHeader>()) / per_slot;
        if slots > 0 {
            return Some(slots);
        }
        blocks *= 2;
    }
    None
}

/// Bytes left over in a slab built with `optimal_slots_per_slab(slot_size)`
/// slots, divided by the cache line size — the number of distinct colour
/// offsets available.
pub(crate) fn unused_space_with_optimal_slots(slot_size: usize) -> usize {
    let slots = optimal_slots_per_slab(slot_size);
    let bytes_required = slots * (slot_size + size_of::<Bufctl>()) + size_of::<SlabHeader>();
    blocks_rounded(bytes_required) * BLOCK_SIZE - bytes_required
}

/// Number of buddy blocks a slab with the optimal slot count for
/// `slot_size` occupies.
pub(crate) fn blocks_occupied(slot_size: usize) -> usize {
    let slots = optimal_slots_per_slab(slot_size);
    let bytes_required = slots * (slot_size + size_of::<Bufctl>()) + size_of::<SlabHeader>();
    blocks_rounded(bytes_required)
}
