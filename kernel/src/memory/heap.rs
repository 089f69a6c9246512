// SPDX-License-Identifier: GPL-2.0

//! Byte-granular kernel heap (component C, continued).
//!
//! [`kalloc`](super::kalloc) hands out whole pages; everything else in the
//! kernel (`Box`, `Vec`, `Arc`, ...) wants byte granularity, which this
//! module provides as the crate's `#[global_allocator]`. It is a pool of
//! [`linked_list_allocator::Heap`] arenas rather than one contiguous heap,
//! because [`kalloc::allocate_unbacked`] only promises a monotonic
//! watermark, not that two calls return adjacent ranges -- appending a new,
//! independent arena sidesteps that instead of relying on contiguity.
//!
//! Arena bookkeeping lives in a fixed-size array, not a `Vec`: the very
//! first arena is created before any heap exists at all, so nothing
//! involved in creating it is allowed to itself allocate.
//!
//! `dealloc` hands the freed block back to whichever arena's range it falls
//! in. This frees for real; the allocator never silently leaks like the
//! bump allocator it replaced.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use linked_list_allocator::Heap;

use crate::error::{Error, Result};
use crate::memory::kalloc;
use crate::memory::phys;
use crate::memory::vas::{kernel_vas, PageFlags};
use crate::sync::Spinlock;
use crate::types::{VirtAddr, PAGE_SIZE};

const INITIAL_PAGES: usize = 64; // 256 KiB
const GROWTH_PAGES: usize = 64;
const MAX_ARENAS: usize = 64;

struct Arena {
	base: VirtAddr,
	pages: usize,
	heap: Heap,
}

struct KernelHeap {
	arenas: Spinlock<[Option<Arena>; MAX_ARENAS]>,
}

unsafe impl GlobalAlloc for KernelHeap {
	unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
		if let Some(ptr) = self.try_alloc(layout) {
			return ptr;
		}
		let pages = pages_for(layout).max(GROWTH_PAGES);
		if add_arena(pages).is_err() {
			return core::ptr::null_mut();
		}
		self.try_alloc(layout).unwrap_or(core::ptr::null_mut())
	}

	unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
		let mut arenas = self.arenas.lock();
		let addr = ptr as usize;
		for slot in arenas.iter_mut() {
			if let Some(arena) = slot {
				let start = arena.base.as_usize();
				if addr >= start && addr < start + arena.pages * PAGE_SIZE {
					arena.heap.deallocate(NonNull::new_unchecked(ptr), layout);
					return;
				}
			}
		}
		panic!("dealloc of {:#x} outside any kernel heap arena", addr);
	}
}

impl KernelHeap {
	fn try_alloc(&self, layout: Layout) -> Option<*mut u8> {
		let mut arenas = self.arenas.lock();
		for slot in arenas.iter_mut() {
			if let Some(arena) = slot {
				if let Ok(ptr) = arena.heap.allocate_first_fit(layout) {
					return Some(ptr.as_ptr());
				}
			}
		}
		None
	}
}

fn pages_for(layout: Layout) -> usize {
	(layout.size() + PAGE_SIZE - 1) / PAGE_SIZE + 1
}

/// Map `pages` fresh pages of kernel virtual memory and register them as a
/// new arena. Nothing here touches the global allocator: the arena table is
/// a fixed array and the frame list is held on the stack one page at a
/// time, so this is safe to call before the heap has a single byte of
/// capacity (as [`init`] does).
fn add_arena(pages: usize) -> Result<()> {
	let kvas = kernel_vas();
	let base = kalloc::allocate_unbacked(pages * PAGE_SIZE);
	for i in 0..pages {
		let virt = base + i * PAGE_SIZE;
		let frame = phys::allocate()?;
		if let Err(e) = kvas.map(virt, frame, PageFlags::WRITABLE | PageFlags::PRESENT) {
			phys::free(frame);
			return Err(e);
		}
	}

	let mut heap = Heap::empty();
	unsafe { heap.init(base.as_mut_ptr::<u8>(), pages * PAGE_SIZE) };

	let mut arenas = ALLOCATOR.arenas.lock();
	let slot = arenas.iter_mut().find(|s| s.is_none()).ok_or(Error::OutOfMemory)?;
	*slot = Some(Arena { base, pages, heap });
	Ok(())
}

const NO_ARENA: Option<Arena> = None;

#[global_allocator]
static ALLOCATOR: KernelHeap = KernelHeap {
	arenas: Spinlock::new([NO_ARENA; MAX_ARENAS]),
};

/// Bring up the kernel heap with one initial arena. Must run after
/// [`phys::init`](super::phys::init) and before anything else in the
/// kernel reaches for `Box`/`Vec`/`Arc`.
pub fn init() -> Result<()> {
	add_arena(INITIAL_PAGES)
}

#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
	panic!("kernel heap exhausted allocating {} bytes", layout.size());
}
