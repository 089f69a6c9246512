// SPDX-License-Identifier: GPL-2.0

//! Address-space manager (component B).
//!
//! Each process owns a [`Vas`]. The kernel half of every VAS's top-level
//! table is installed by reference from [`kernel_root`] so that kernel
//! mappings are identical across every address space without needing to be
//! kept in sync by hand.
//!
//! The VAS lock is the one reentrant lock in the kernel, and only the
//! page-fault handler is allowed to rely on that (see [`enter_for_fault`]).
//! Every other caller must take the lock at most once per call chain.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::memory::page_table::{PageTableFlags, PageTableManager};
use crate::memory::phys;
use crate::sync::Spinlock;
use crate::types::{PhysAddr, VirtAddr};

bitflags::bitflags! {
	/// Software-visible page flags, the closed set the rest of the kernel reasons about.
	#[derive(Clone, Copy, PartialEq, Eq)]
	pub struct PageFlags: u32 {
		const PRESENT             = 1 << 0;
		const WRITABLE            = 1 << 1;
		const EXECUTABLE          = 1 << 2;
		const USER                = 1 << 3;
		const COPY_ON_WRITE       = 1 << 4;
		const LOCKED              = 1 << 5;
		const ALLOCATE_ON_ACCESS  = 1 << 6;
	}
}

impl PageFlags {
	fn to_hw(self) -> PageTableFlags {
		let mut hw = PageTableFlags::empty();
		if self.contains(PageFlags::PRESENT) {
			hw |= PageTableFlags::PRESENT;
		}
		if self.contains(PageFlags::WRITABLE) {
			hw |= PageTableFlags::WRITABLE;
		}
		if self.contains(PageFlags::USER) {
			hw |= PageTableFlags::USER_ACCESSIBLE;
		}
		if self.contains(PageFlags::COPY_ON_WRITE) {
			hw |= PageTableFlags::COPY_ON_WRITE;
		}
		if self.contains(PageFlags::LOCKED) {
			hw |= PageTableFlags::LOCKED;
		}
		if self.contains(PageFlags::ALLOCATE_ON_ACCESS) {
			hw |= PageTableFlags::ALLOCATE_ON_ACCESS;
		}
		if !self.contains(PageFlags::EXECUTABLE) {
			hw |= PageTableFlags::NO_EXECUTE;
		}
		hw
	}

	fn from_hw(hw: PageTableFlags) -> Self {
		let mut flags = PageFlags::empty();
		flags.set(PageFlags::PRESENT, hw.contains(PageTableFlags::PRESENT));
		flags.set(PageFlags::WRITABLE, hw.contains(PageTableFlags::WRITABLE));
		flags.set(PageFlags::USER, hw.contains(PageTableFlags::USER_ACCESSIBLE));
		flags.set(PageFlags::COPY_ON_WRITE, hw.contains(PageTableFlags::COPY_ON_WRITE));
		flags.set(PageFlags::LOCKED, hw.contains(PageTableFlags::LOCKED));
		flags.set(
			PageFlags::ALLOCATE_ON_ACCESS,
			hw.contains(PageTableFlags::ALLOCATE_ON_ACCESS),
		);
		flags.set(PageFlags::EXECUTABLE, !hw.contains(PageTableFlags::NO_EXECUTE));
		flags
	}
}

/// Index of the first PML4 slot belonging to the shared kernel half.
/// Entries [KERNEL_PML4_START, 512) are copied by reference into every VAS.
const KERNEL_PML4_START: usize = 256;

static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);
static KERNEL_VAS: Spinlock<Option<Arc<Vas>>> = Spinlock::new(None);

/// Record the kernel's own root table so [`Vas::new`] can share its upper half.
pub fn set_kernel_root(root: PhysAddr) {
	KERNEL_ROOT.store(root.as_usize() as u64, Ordering::Release);
}

fn kernel_root() -> PhysAddr {
	PhysAddr::new(KERNEL_ROOT.load(Ordering::Acquire) as usize)
}

/// Record the kernel's own VAS, so freestanding kernel threads (the idle
/// thread, the cleaner) have something to run under.
pub fn set_kernel_vas(vas: Arc<Vas>) {
	*KERNEL_VAS.lock() = Some(vas);
}

pub fn kernel_vas() -> Arc<Vas> {
	KERNEL_VAS.lock().clone().expect("kernel VAS not yet installed")
}

/// An address space. Guarded by its own lock; the lock is reentrant only for
/// the page-fault handler, via [`enter_for_fault`].
pub struct Vas {
	table: core::cell::UnsafeCell<PageTableManager>,
	locked: AtomicBool,
	/// The VAS this one was copy-on-write cloned from, if any. Consulted by
	/// [`promote_origin_chain`](Vas::promote_origin_chain) after a cow fault
	/// to find the ancestor that can be promoted back to sole ownership.
	origin: Spinlock<Option<Arc<Vas>>>,
}

unsafe impl Sync for Vas {}
unsafe impl Send for Vas {}

pub struct VasGuard<'a> {
	vas: &'a Vas,
	/// Whether drop should release the lock. False for a nested page-fault
	/// reentry that found the lock already held by an outer frame.
	owns_lock: bool,
}

impl<'a> core::ops::Deref for VasGuard<'a> {
	type Target = PageTableManager;
	fn deref(&self) -> &PageTableManager {
		unsafe { &*self.vas.table.get() }
	}
}

impl<'a> core::ops::DerefMut for VasGuard<'a> {
	fn deref_mut(&mut self) -> &mut PageTableManager {
		unsafe { &mut *self.vas.table.get() }
	}
}

impl<'a> Drop for VasGuard<'a> {
	fn drop(&mut self) {
		if self.owns_lock {
			self.vas.locked.store(false, Ordering::Release);
		}
	}
}

impl Vas {
	/// Create a fresh VAS with the kernel half installed by reference.
	pub fn new() -> Result<Arc<Self>> {
		let table = PageTableManager::new()?;
		let vas = Arc::new(Self {
			table: core::cell::UnsafeCell::new(table),
			locked: AtomicBool::new(false),
			origin: Spinlock::new(None),
		});
		vas.install_kernel_half();
		Ok(vas)
	}

	/// Wrap the kernel's own root table as a VAS (used for `kernel_main`'s boot context).
	pub fn new_kernel(root: PhysAddr) -> Arc<Self> {
		Arc::new(Self {
			table: core::cell::UnsafeCell::new(PageTableManager::from_root(root)),
			locked: AtomicBool::new(false),
			origin: Spinlock::new(None),
		})
	}

	fn install_kernel_half(&self) {
		let krn = kernel_root();
		if krn.as_usize() == 0 {
			return; // not yet initialised (kernel VAS itself is being created)
		}
		unsafe {
			let ours = &mut *self.table.get();
			ours.share_upper_half_from(krn, KERNEL_PML4_START);
		}
	}

	pub fn lock(&self) -> VasGuard<'_> {
		while self
			.locked
			.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_err()
		{
			while self.locked.load(Ordering::Relaxed) {
				core::hint::spin_loop();
			}
		}
		VasGuard { vas: self, owns_lock: true }
	}

	/// Acquire for the page-fault handler: if the lock is already held (by
	/// an outer frame of the *same* fault-handling call chain) proceed
	/// without re-locking instead of deadlocking. This is only sound
	/// because the only caller that can observe "already held" here is the
	/// page-fault handler re-entering itself via the allocator's eviction
	/// path, never an unrelated thread on another CPU.
	pub fn enter_for_fault(&self) -> VasGuard<'_> {
		if self
			.locked
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
		{
			VasGuard { vas: self, owns_lock: true }
		} else {
			VasGuard { vas: self, owns_lock: false }
		}
	}

	pub fn root(&self) -> PhysAddr {
		unsafe { (&*self.table.get()).root() }
	}

	pub fn load(&self) {
		unsafe { (&*self.table.get()).switch_to() };
	}

	pub fn map(&self, virt: VirtAddr, phys: PhysAddr, flags: PageFlags) -> Result<()> {
		self.lock().map(virt, phys, flags.to_hw())
	}

	pub fn reflag(&self, virt: VirtAddr, flags: PageFlags) -> Result<()> {
		self.lock().reflag(virt, flags.to_hw())
	}

	pub fn unmap(&self, virt: VirtAddr) -> Result<PhysAddr> {
		self.lock().unmap(virt)
	}

	pub fn virt_to_phys(&self, virt: VirtAddr) -> Result<PhysAddr> {
		self.get_entry(virt)
			.filter(|(_, flags)| flags.contains(PageFlags::PRESENT))
			.map(|(phys, _)| phys)
			.ok_or(Error::InvalidArgument)
	}

	pub fn get_entry(&self, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
		unsafe { (&*self.table.get()).get_entry(virt) }.map(|(p, f)| (p, PageFlags::from_hw(f)))
	}

	/// Destroy this VAS, freeing every user frame and page table it owns,
	/// including the swap slots backing any page this VAS had evicted.
	/// Never call this on the currently-loaded VAS.
	pub fn destroy(&self) {
		let mut guard = self.lock();
		let swapped = guard.collect_swapped_slots();
		guard.free_user_half(|addr| {
			if phys::unshare(addr) == 0 {
				phys::free(addr);
			}
		});
		drop(guard);
		for slot in swapped {
			crate::memory::swap::discard(slot);
		}
	}

	/// Clone this VAS with copy-on-write semantics: every present,
	/// user-writable page in both spaces is demoted to read-only +
	/// copy-on-write, and the frame's share count is bumped so the
	/// page-fault handler can tell a last-reference promotion from a real
	/// copy (§4.G).
	///
	/// Any page of `self` currently evicted to swap is faulted back in
	/// first: the duplication below only ever sees present mappings, so a
	/// page left swapped out would otherwise vanish from the child's
	/// address space entirely instead of being shared copy-on-write.
	pub fn copy(self: &Arc<Self>) -> Result<Arc<Self>> {
		crate::memory::pagefault::swap_in_all(self)?;
		let child = Vas::new()?;
		*child.origin.lock() = Some(self.clone());
		let mappings = {
			let mut src = self.lock();
			src.collect_user_entries()
		};

		for (virt, phys_addr, hw_flags) in mappings {
			let mut child_flags = PageFlags::from_hw(hw_flags);
			if child_flags.contains(PageFlags::WRITABLE) {
				child_flags.remove(PageFlags::WRITABLE);
				child_flags.insert(PageFlags::COPY_ON_WRITE);
				self.reflag(virt, child_flags)?;
				phys::share(phys_addr);
			}
			child.map(virt, phys_addr, child_flags)?;
		}
		Ok(child)
	}

	/// After a copy-on-write fault has given the faulting side its own
	/// private frame and dropped `frame`'s share count, walk this VAS's
	/// origin chain looking for the ancestor still mapping `frame` at
	/// `virt`. If `frame` now has a single remaining owner, that ancestor's
	/// mapping is promoted back to plain writable so it does not pay for
	/// another copy the next time it writes.
	///
	/// Only the direct ancestry is searched, not sibling VASes copied from
	/// the same origin: if one of those still holds a share, promotion is
	/// skipped and the mapping stays copy-on-write until its own fault
	/// resolves the sharing. That is a missed optimisation, not a
	/// correctness gap -- a cow fault always produces a correct private
	/// copy regardless of whether an earlier promotion happened.
	pub fn promote_origin_chain(&self, virt: VirtAddr, frame: PhysAddr) {
		let mut current = self.origin.lock().clone();
		while let Some(ancestor) = current {
			let mut guard = ancestor.lock();
			if let Some((addr, flags)) = guard.get_entry(virt) {
				if addr == frame && flags.contains(PageTableFlags::COPY_ON_WRITE) && phys::share_count(frame) <= 1 {
					let promoted = flags.without(PageTableFlags::COPY_ON_WRITE) | PageTableFlags::WRITABLE;
					let _ = guard.reflag(virt, promoted);
					break;
				}
			}
			drop(guard);
			current = ancestor.origin.lock().clone();
		}
	}
}
