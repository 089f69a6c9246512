// SPDX-License-Identifier: GPL-2.0

//! Physical frame allocator (component A).
//!
//! A bitmap over every frame the bootloader reported, plus a rotating
//! cursor so a freshly freed frame is not immediately handed back out --
//! that tends to mask use-after-free bugs rather than catch them.
//!
//! When the bitmap is full, [`allocate`] calls into the page replacer
//! (`super::pagefault`) to evict a victim page and free its frame before
//! retrying. That is a recursive call into a higher layer and the lock
//! discipline in `docs/DESIGN.md`'s lock-order note applies: this module's
//! lock must not be held across the call into the replacer.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::sync::Spinlock;
use crate::types::{PhysAddr, PAGE_SIZE};

struct FrameBitmap {
	bits: Vec<u64>,
	base: PhysAddr,
	frame_count: usize,
	cursor: usize,
	free_count: usize,
	/// Frames mapped from more than one address space (copy-on-write).
	/// Absent means "not shared" (refcount of 1, the implicit default).
	shared: BTreeMap<usize, u32>,
}

impl FrameBitmap {
	fn new(base: PhysAddr, frame_count: usize) -> Self {
		let words = (frame_count + 63) / 64;
		Self {
			bits: vec![0u64; words],
			base,
			frame_count,
			cursor: 0,
			free_count: frame_count,
			shared: BTreeMap::new(),
		}
	}

	fn is_free(&self, idx: usize) -> bool {
		self.bits[idx / 64] & (1 << (idx % 64)) == 0
	}

	fn set_used(&mut self, idx: usize) {
		self.bits[idx / 64] |= 1 << (idx % 64);
	}

	fn set_free(&mut self, idx: usize) {
		self.bits[idx / 64] &= !(1 << (idx % 64));
	}

	fn frame_to_addr(&self, idx: usize) -> PhysAddr {
		PhysAddr::new(self.base.as_usize() + idx * PAGE_SIZE)
	}

	fn addr_to_frame(&self, addr: PhysAddr) -> Option<usize> {
		let off = addr.as_usize().checked_sub(self.base.as_usize())?;
		if off % PAGE_SIZE != 0 {
			return None;
		}
		let idx = off / PAGE_SIZE;
		if idx < self.frame_count {
			Some(idx)
		} else {
			None
		}
	}

	/// Find and claim one free frame without evicting. None if the bitmap is full.
	fn try_claim(&mut self) -> Option<PhysAddr> {
		if self.free_count == 0 {
			return None;
		}
		for step in 0..self.frame_count {
			let idx = (self.cursor + step) % self.frame_count;
			if self.is_free(idx) {
				self.set_used(idx);
				self.free_count -= 1;
				self.cursor = (idx + 1) % self.frame_count;
				return Some(self.frame_to_addr(idx));
			}
		}
		None
	}

	fn release(&mut self, addr: PhysAddr) -> Result<()> {
		let idx = self.addr_to_frame(addr).ok_or(Error::InvalidArgument)?;
		if self.is_free(idx) {
			panic!("double free of physical frame {:?}", addr);
		}
		self.set_free(idx);
		self.free_count += 1;
		Ok(())
	}
}

static FRAMES: Spinlock<Option<FrameBitmap>> = Spinlock::new(None);

/// Initialise the allocator over `[base, base + frame_count * PAGE_SIZE)`.
///
/// Called once during early boot with the usable-memory range the
/// bootloader reported; any frame outside this range is considered
/// nonexistent for the lifetime of the kernel.
pub fn init(base: PhysAddr, frame_count: usize) {
	let mut guard = FRAMES.lock();
	*guard = Some(FrameBitmap::new(base, frame_count));
	crate::info!(
		"phys: {} frames available starting at {:#x}",
		frame_count,
		base.as_usize()
	);
}

/// Claim one physical frame, evicting a page via the replacer if necessary.
pub fn allocate() -> Result<PhysAddr> {
	{
		let mut guard = FRAMES.lock();
		let bitmap = guard.as_mut().expect("phys allocator not initialised");
		if let Some(addr) = bitmap.try_claim() {
			return Ok(addr);
		}
	}

	// Bitmap is full: ask the replacer to evict a page and retry exactly once.
	crate::memory::pagefault::evict_one_page()?;

	let mut guard = FRAMES.lock();
	let bitmap = guard.as_mut().expect("phys allocator not initialised");
	bitmap.try_claim().ok_or(Error::OutOfMemory)
}

/// Claim a frame without ever falling back to eviction (used while the
/// replacer itself is evicting, to avoid unbounded recursion).
pub fn allocate_no_evict() -> Result<PhysAddr> {
	let mut guard = FRAMES.lock();
	let bitmap = guard.as_mut().expect("phys allocator not initialised");
	bitmap.try_claim().ok_or(Error::OutOfMemory)
}

/// Return a frame to the free pool. Freeing an already-free frame is fatal.
pub fn free(addr: PhysAddr) {
	let mut guard = FRAMES.lock();
	let bitmap = guard.as_mut().expect("phys allocator not initialised");
	bitmap.release(addr).expect("free of frame outside managed range");
}

/// Total number of frames under management (test/diagnostic use).
pub fn frame_count() -> usize {
	FRAMES.lock().as_ref().map(|b| b.frame_count).unwrap_or(0)
}

/// Number of frames currently free (test/diagnostic use).
pub fn free_count() -> usize {
	FRAMES.lock().as_ref().map(|b| b.free_count).unwrap_or(0)
}

/// Mark a frame as shared by one more address space (copy-on-write fork).
pub fn share(addr: PhysAddr) {
	let mut guard = FRAMES.lock();
	let bitmap = guard.as_mut().expect("phys allocator not initialised");
	let idx = bitmap.addr_to_frame(addr).expect("share of frame outside managed range");
	let count = bitmap.shared.entry(idx).or_insert(1);
	*count += 1;
}

/// Number of address spaces currently mapping this frame (1 if unshared).
pub fn share_count(addr: PhysAddr) -> u32 {
	let guard = FRAMES.lock();
	let bitmap = guard.as_ref().expect("phys allocator not initialised");
	bitmap
		.addr_to_frame(addr)
		.and_then(|idx| bitmap.shared.get(&idx).copied())
		.unwrap_or(1)
}

/// Record that one address space has dropped its reference to a shared
/// frame. Returns the number of *other* address spaces still mapping it --
/// zero if the caller was the sole (or last) owner. The caller must not
/// free the frame unless this returns zero; a nonzero result means at
/// least one other VAS still maps it and freeing would be a use-after-free.
pub fn unshare(addr: PhysAddr) -> u32 {
	let mut guard = FRAMES.lock();
	let bitmap = guard.as_mut().expect("phys allocator not initialised");
	let idx = bitmap.addr_to_frame(addr).expect("unshare of frame outside managed range");
	match bitmap.shared.get_mut(&idx) {
		Some(count) => {
			*count -= 1;
			let remaining = *count;
			if remaining <= 1 {
				bitmap.shared.remove(&idx);
			}
			remaining
		}
		None => 0,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fresh(frames: usize) {
		init(PhysAddr::new(0x10_0000), frames);
	}

	#[test_case]
	fn allocate_and_free_round_trip() {
		fresh(16);
		let a = allocate().unwrap();
		let b = allocate().unwrap();
		assert_ne!(a, b);
		assert_eq!(free_count(), 14);
		free(a);
		assert_eq!(free_count(), 15);
	}

	#[test_case]
	fn exhaustion_without_replacer_is_out_of_memory() {
		fresh(2);
		allocate_no_evict().unwrap();
		allocate_no_evict().unwrap();
		assert_eq!(allocate_no_evict().unwrap_err(), Error::OutOfMemory);
	}

	#[test_case]
	#[should_panic]
	fn double_free_is_fatal() {
		fresh(4);
		let a = allocate().unwrap();
		free(a);
		free(a);
	}
}
