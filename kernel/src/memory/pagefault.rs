// SPDX-License-Identifier: GPL-2.0

//! Page-fault handler and page replacer (component G).
//!
//! [`handle_fault`] dispatches on what the faulting entry says: allocate a
//! frame for an `allocate-on-access` page, copy on write, or read a page
//! back in from swap. [`evict_one_page`] is the other half -- the physical
//! allocator calls it when the frame bitmap is full.
//!
//! Both run under the faulting address space's lock, reentered rather than
//! reacquired if the fault interrupts code that already holds it (see
//! `Vas::enter_for_fault`); this is the one place in the kernel allowed to
//! rely on that.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::memory::page_table::PageTableFlags;
use crate::memory::phys;
use crate::memory::swap;
use crate::memory::vas::Vas;
use crate::sync::Spinlock;
use crate::types::{PhysAddr, VirtAddr, PAGE_SIZE};

static CURRENT_VAS: Spinlock<Option<Arc<Vas>>> = Spinlock::new(None);

/// Record which VAS is loaded on the (single) CPU. The scheduler calls this
/// on every context switch; the fault handler and the replacer both only
/// ever operate on whatever VAS is current.
pub fn set_current_vas(vas: Arc<Vas>) {
	*CURRENT_VAS.lock() = Some(vas);
}

pub fn current_vas() -> Option<Arc<Vas>> {
	CURRENT_VAS.lock().clone()
}

fn slot_to_addr(slot: usize) -> PhysAddr {
	PhysAddr::new((slot + 1) * PAGE_SIZE)
}

fn addr_to_slot(addr: PhysAddr) -> usize {
	addr.as_usize() / PAGE_SIZE - 1
}

fn page_align(addr: VirtAddr) -> VirtAddr {
	VirtAddr::new(addr.as_usize() & !(PAGE_SIZE - 1))
}

fn zero_page(virt: VirtAddr) {
	unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
}

fn copy_from_page(virt: VirtAddr, buf: &mut [u8; PAGE_SIZE]) {
	unsafe { core::ptr::copy_nonoverlapping(virt.as_ptr::<u8>(), buf.as_mut_ptr(), PAGE_SIZE) };
}

fn copy_to_page(virt: VirtAddr, buf: &[u8; PAGE_SIZE]) {
	unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), virt.as_mut_ptr::<u8>(), PAGE_SIZE) };
}

/// Handle a fault at `addr` in the currently loaded address space. `write`
/// is true if the faulting access was a store.
pub fn handle_fault(addr: VirtAddr, write: bool) -> Result<()> {
	let vas = current_vas().expect("page fault with no current address space");
	let page = page_align(addr);
	let mut guard = vas.enter_for_fault();

	let (phys_addr, flags) = guard.get_entry(page).ok_or(Error::BadAddress)?;

	// Allocate-on-access: first touch of a demand-allocated page.
	if flags.contains(PageTableFlags::ALLOCATE_ON_ACCESS) && !flags.contains(PageTableFlags::PRESENT) {
		let frame = phys::allocate()?;
		let final_flags = flags.without(PageTableFlags::ALLOCATE_ON_ACCESS) | PageTableFlags::PRESENT;
		guard.map(page, frame, final_flags)?;
		drop(guard);
		zero_page(page);
		return Ok(());
	}

	// Copy-on-write: a write to a page shared since fork.
	if flags.contains(PageTableFlags::PRESENT) && flags.contains(PageTableFlags::COPY_ON_WRITE) && write {
		let mut buf = [0u8; PAGE_SIZE];
		copy_from_page(page, &mut buf);

		let new_frame = phys::allocate()?;
		let final_flags = flags.without(PageTableFlags::COPY_ON_WRITE) | PageTableFlags::WRITABLE;
		guard.map(page, new_frame, final_flags)?;
		drop(guard);
		copy_to_page(page, &buf);

		// `unshare` reports how many *other* address spaces still map the
		// old frame. Exactly one means a single ancestor now holds the last
		// reference and can be promoted back to plain writable; zero means
		// there was nothing else sharing it and there is nothing to promote.
		if phys::unshare(phys_addr) == 1 {
			vas.promote_origin_chain(page, phys_addr);
		}
		return Ok(());
	}

	// A locked, non-resident entry should never exist; the allocator must
	// never evict a locked page and allocate-on-access pages are handled above.
	if flags.contains(PageTableFlags::LOCKED) && !flags.contains(PageTableFlags::PRESENT) {
		panic!("page fault on locked, non-resident page at {}", page);
	}

	// Otherwise this is a page the replacer swapped out: read it back in.
	if !flags.contains(PageTableFlags::PRESENT) && flags.contains(PageTableFlags::SWAPPED) {
		drop(guard);
		return swap_in(&vas, page, phys_addr, flags);
	}

	Err(Error::BadAddress)
}

/// Read a swapped-out page back into a freshly allocated frame and remap
/// it present, clearing the transient `locked` it carries while the read
/// is in flight. Shared by [`handle_fault`] (faulting the current address
/// space) and [`Vas::copy`](super::vas::Vas::copy) (forcing every evicted
/// page of a soon-to-be-cloned VAS resident first, since a COW clone can
/// only duplicate a mapping it can see).
fn swap_in(vas: &Arc<Vas>, page: VirtAddr, phys_addr: PhysAddr, flags: PageTableFlags) -> Result<()> {
	let slot = addr_to_slot(phys_addr);
	let frame = phys::allocate()?;
	let temp_flags = flags.without(PageTableFlags::SWAPPED) | PageTableFlags::PRESENT | PageTableFlags::LOCKED;
	vas.enter_for_fault().map(page, frame, temp_flags)?;

	let mut buf = [0u8; PAGE_SIZE];
	if let Err(e) = swap::read(&mut buf, slot) {
		let mut guard = vas.enter_for_fault();
		let _ = guard.unmap(page);
		phys::free(frame);
		return Err(e);
	}
	copy_to_page(page, &buf);

	let final_flags = temp_flags.without(PageTableFlags::LOCKED);
	vas.enter_for_fault().reflag(page, final_flags)?;
	Ok(())
}

/// Bring every currently swapped-out user page of `vas` back into
/// residence. Called before [`Vas::copy`](super::vas::Vas::copy) clones a
/// VAS, since the copy only ever sees present mappings.
pub fn swap_in_all(vas: &Arc<Vas>) -> Result<()> {
	loop {
		let virt = {
			let mut guard = vas.enter_for_fault();
			match guard.collect_swapped_virts().into_iter().next() {
				Some(v) => v,
				None => return Ok(()),
			}
		};
		let (phys_addr, flags) = vas.enter_for_fault().get_entry(virt).ok_or(Error::BadAddress)?;
		swap_in(vas, virt, phys_addr, flags)?;
	}
}

static REPLACER_CURSOR: AtomicUsize = AtomicUsize::new(0);

/// Evict one page from the current address space to free a physical frame.
/// Called by the physical allocator when the frame bitmap is full.
///
/// Picks among present, unlocked, non-shared user mappings with a cursor
/// carried across calls so the scan does not restart from address zero
/// every time (a classical second-chance/clock discipline); skipping
/// `copy-on-write` pages avoids evicting a frame another address space is
/// still relying on being present.
pub fn evict_one_page() -> Result<()> {
	let vas = current_vas().ok_or(Error::OutOfMemory)?;

	let mut candidates = {
		let mut guard = vas.enter_for_fault();
		guard.collect_user_entries()
	};
	candidates.retain(|(_, _, flags)| {
		flags.contains(PageTableFlags::PRESENT)
			&& !flags.contains(PageTableFlags::LOCKED)
			&& !flags.contains(PageTableFlags::COPY_ON_WRITE)
	});
	if candidates.is_empty() {
		return Err(Error::OutOfMemory);
	}
	candidates.sort_by_key(|(virt, _, _)| virt.as_usize());

	let cursor = REPLACER_CURSOR.load(Ordering::Relaxed);
	let victim = candidates
		.iter()
		.copied()
		.find(|(virt, _, _)| virt.as_usize() >= cursor)
		.unwrap_or(candidates[0]);
	REPLACER_CURSOR.store(victim.0.as_usize() + PAGE_SIZE, Ordering::Relaxed);

	let (virt, frame, flags) = victim;
	let mut buf = [0u8; PAGE_SIZE];
	copy_from_page(virt, &mut buf);
	let slot = swap::write(&mut buf)?;

	let swapped_flags = flags
		.without(PageTableFlags::PRESENT)
		.without(PageTableFlags::LOCKED)
		| PageTableFlags::SWAPPED;
	vas.enter_for_fault().map(virt, slot_to_addr(slot), swapped_flags)?;

	phys::free(frame);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::vas::PageFlags;

	fn fresh_phys(frames: usize) {
		phys::init(PhysAddr::new(0x10_0000), frames);
	}

	#[test_case]
	fn cow_fork_writes_diverge_to_distinct_frames() {
		fresh_phys(16);
		let parent = Vas::new().unwrap();
		let frame = phys::allocate().unwrap();
		let virt = VirtAddr::new(0x10_0000_0000);
		parent
			.map(virt, frame, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER)
			.unwrap();

		parent.load();
		unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0xAA, PAGE_SIZE) };

		let child = parent.copy().unwrap();

		let (parent_frame, parent_flags) = parent.get_entry(virt).unwrap();
		let (child_frame, child_flags) = child.get_entry(virt).unwrap();
		assert_eq!(parent_frame, frame);
		assert_eq!(child_frame, frame);
		assert!(parent_flags.contains(PageFlags::COPY_ON_WRITE));
		assert!(child_flags.contains(PageFlags::COPY_ON_WRITE));
		assert!(!parent_flags.contains(PageFlags::WRITABLE));
		assert!(!child_flags.contains(PageFlags::WRITABLE));

		set_current_vas(child.clone());
		child.load();
		handle_fault(virt, true).unwrap();
		unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0xBB, PAGE_SIZE) };

		let (child_frame_after, child_flags_after) = child.get_entry(virt).unwrap();
		assert_ne!(child_frame_after, frame);
		assert!(child_flags_after.contains(PageFlags::WRITABLE));
		assert!(!child_flags_after.contains(PageFlags::COPY_ON_WRITE));

		parent.load();
		let mut check = [0u8; PAGE_SIZE];
		copy_from_page(virt, &mut check);
		assert!(check.iter().all(|&b| b == 0xAA));
	}

	#[test_case]
	fn eviction_and_swap_in_round_trip() {
		fresh_phys(16);
		let device = crate::device::test_support::make_test_device(2, 8);
		swap::init(device, 0, 8).unwrap();

		let vas = Vas::new().unwrap();
		let frame = phys::allocate().unwrap();
		let virt = VirtAddr::new(0x20_0000_0000);
		vas.map(virt, frame, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER)
			.unwrap();

		vas.load();
		unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0x42, PAGE_SIZE) };

		set_current_vas(vas.clone());
		evict_one_page().unwrap();
		let (_, flags) = vas.get_entry(virt).unwrap();
		assert!(!flags.contains(PageFlags::PRESENT));

		handle_fault(virt, false).unwrap();
		let (_, flags_after) = vas.get_entry(virt).unwrap();
		assert!(flags_after.contains(PageFlags::PRESENT));

		let mut check = [0u8; PAGE_SIZE];
		copy_from_page(virt, &mut check);
		assert!(check.iter().all(|&b| b == 0x42));
	}
}
