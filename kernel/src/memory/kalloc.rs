// SPDX-License-Identifier: GPL-2.0

//! Virtual kernel allocator (component C).
//!
//! Two layers: [`allocate_unbacked`] hands out kernel virtual ranges from a
//! monotonic watermark and never reclaims them (by design -- see
//! `SPEC_FULL.md` §4.C); [`allocate_backed`]/[`free_backed`] additionally
//! allocate and map physical frames behind the range. The byte-granular
//! heap itself (`alloc`/`dealloc` for the rest of the kernel) is the global
//! allocator in [`super::heap`], which is backed by a range carved out
//! here with `allocate_backed` and does real, not no-op, frees.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::Result;
use crate::memory::phys;
use crate::memory::vas::{PageFlags, Vas};
use crate::sync::Spinlock;
use crate::types::{VirtAddr, PAGE_SIZE};

/// Start of the kernel's unbacked virtual watermark range. Chosen well
/// above the identity-mapped low memory and the recursive page-table
/// window so it cannot collide with either.
const UNBACKED_BASE: usize = 0xFFFF_9000_0000_0000;

static WATERMARK: Spinlock<usize> = Spinlock::new(UNBACKED_BASE);

fn align_up(value: usize, align: usize) -> usize {
	(value + align - 1) & !(align - 1)
}

/// Reserve `bytes` (rounded up to a page) of kernel virtual address space.
/// The range is never mapped to anything by this call and is never
/// reclaimed -- callers that need backing should use [`allocate_backed`].
pub fn allocate_unbacked(bytes: usize) -> VirtAddr {
	let size = align_up(bytes.max(1), PAGE_SIZE);
	let mut mark = WATERMARK.lock();
	let addr = *mark;
	*mark += size;
	VirtAddr::new(addr)
}

/// A range of kernel virtual memory backed by real physical frames, as
/// returned by [`allocate_backed`]. Dropping it does not free anything;
/// call [`free_backed`] explicitly.
pub struct Backed {
	pub base: VirtAddr,
	pub pages: usize,
}

/// Reserve `pages` pages of virtual space and back every page with a
/// freshly allocated, mapped physical frame.
pub fn allocate_backed(kernel_vas: &Arc<Vas>, pages: usize, flags: PageFlags) -> Result<Backed> {
	let base = allocate_unbacked(pages * PAGE_SIZE);
	let mut mapped = Vec::with_capacity(pages);
	for i in 0..pages {
		let virt = base + i * PAGE_SIZE;
		match phys::allocate() {
			Ok(frame) => {
				if let Err(e) = kernel_vas.map(virt, frame, flags | PageFlags::PRESENT) {
					phys::free(frame);
					unwind(kernel_vas, base, &mapped);
					return Err(e);
				}
				mapped.push(virt);
			}
			Err(e) => {
				unwind(kernel_vas, base, &mapped);
				return Err(e);
			}
		}
	}
	Ok(Backed { base, pages })
}

fn unwind(kernel_vas: &Arc<Vas>, _base: VirtAddr, mapped: &[VirtAddr]) {
	for &virt in mapped {
		if let Ok(frame) = kernel_vas.unmap(virt) {
			phys::free(frame);
		}
	}
}

/// Unmap and free every frame backing `[virt, virt + pages*PAGE_SIZE)`.
/// The virtual range itself is not returned to the watermark.
pub fn free_backed(kernel_vas: &Arc<Vas>, virt: VirtAddr, pages: usize) {
	for i in 0..pages {
		let page = virt + i * PAGE_SIZE;
		if let Ok(frame) = kernel_vas.unmap(page) {
			phys::free(frame);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test_case]
	fn watermark_never_overlaps() {
		let a = allocate_unbacked(100);
		let b = allocate_unbacked(1);
		assert!(b.as_usize() >= a.as_usize() + PAGE_SIZE);
	}
}
