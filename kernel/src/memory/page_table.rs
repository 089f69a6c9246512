// SPDX-License-Identifier: GPL-2.0

//! x86_64 four-level page table walking.
//!
//! This is pure architecture plumbing: PML4/PDP/PD/PT indices, TLB
//! invalidation, entry bit layout. The policy that decides *what* to map
//! where lives in [`super::vas`]; this module only knows how to make a
//! virtual address point at a physical one.

use core::arch::asm;

use crate::error::{Error, Result};
use crate::memory::phys;
use crate::types::{PhysAddr, VirtAddr, PAGE_SIZE};

/// Page table entry flags.
///
/// Hardware bits occupy 0..8 and 63; bits 9-11 are ignored by the MMU and
/// are repurposed here to track the three software-only flags the address
/// space manager needs to remember across a fault: copy-on-write, locked
/// (never evict), and allocate-on-access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableFlags(pub u64);

impl PageTableFlags {
	pub const PRESENT: Self = Self(1 << 0);
	pub const WRITABLE: Self = Self(1 << 1);
	pub const USER_ACCESSIBLE: Self = Self(1 << 2);
	pub const ACCESSED: Self = Self(1 << 5);
	pub const DIRTY: Self = Self(1 << 6);
	pub const COPY_ON_WRITE: Self = Self(1 << 9);
	pub const LOCKED: Self = Self(1 << 10);
	pub const ALLOCATE_ON_ACCESS: Self = Self(1 << 11);
	/// Entry does not hold a physical frame at all: the address field is a
	/// swap slot id (offset by one, so slot 0 is distinguishable from a
	/// plain never-mapped zero entry). Set only while `PRESENT` is clear.
	pub const SWAPPED: Self = Self(1 << 8);
	pub const NO_EXECUTE: Self = Self(1 << 63);

	pub const SOFTWARE_MASK: u64 =
		Self::COPY_ON_WRITE.0 | Self::LOCKED.0 | Self::ALLOCATE_ON_ACCESS.0 | Self::SWAPPED.0;

	pub fn empty() -> Self {
		Self(0)
	}

	pub fn kernel_rw() -> Self {
		Self::PRESENT | Self::WRITABLE
	}

	pub fn contains(self, flag: Self) -> bool {
		self.0 & flag.0 == flag.0
	}
}

impl core::ops::BitOr for PageTableFlags {
	type Output = Self;
	fn bitor(self, rhs: Self) -> Self::Output {
		Self(self.0 | rhs.0)
	}
}

impl core::ops::BitOrAssign for PageTableFlags {
	fn bitor_assign(&mut self, rhs: Self) {
		self.0 |= rhs.0;
	}
}

impl PageTableFlags {
	pub fn without(self, flag: Self) -> Self {
		Self(self.0 & !flag.0)
	}
}

/// A single page table entry.
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
pub struct PageTableEntry(pub u64);

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

impl PageTableEntry {
	pub fn new() -> Self {
		Self(0)
	}

	pub fn is_present(self) -> bool {
		self.0 & PageTableFlags::PRESENT.0 != 0
	}

	pub fn set(self, addr: PhysAddr, flags: PageTableFlags) -> Self {
		Self((addr.as_usize() as u64 & ADDR_MASK) | (flags.0 & !ADDR_MASK))
	}

	pub fn addr(self) -> PhysAddr {
		PhysAddr::new((self.0 & ADDR_MASK) as usize)
	}

	pub fn flags(self) -> PageTableFlags {
		PageTableFlags(self.0 & !ADDR_MASK)
	}
}

/// A page table: 512 eight-byte entries, page-aligned.
#[repr(align(4096))]
pub struct PageTable {
	entries: [PageTableEntry; 512],
}

impl PageTable {
	pub fn zero(&mut self) {
		for entry in &mut self.entries {
			*entry = PageTableEntry::new();
		}
	}

	pub fn entry(&mut self, index: usize) -> &mut PageTableEntry {
		&mut self.entries[index]
	}

	pub fn entry_ref(&self, index: usize) -> &PageTableEntry {
		&self.entries[index]
	}
}

struct Indices {
	pml4: usize,
	pdp: usize,
	pd: usize,
	pt: usize,
}

fn split(virt: VirtAddr) -> Indices {
	let page = virt.as_usize() / PAGE_SIZE;
	Indices {
		pml4: (page >> 27) & 0x1ff,
		pdp: (page >> 18) & 0x1ff,
		pd: (page >> 9) & 0x1ff,
		pt: page & 0x1ff,
	}
}

fn table_at(addr: PhysAddr) -> &'static mut PageTable {
	unsafe { &mut *(addr.as_usize() as *mut PageTable) }
}

fn invalidate(virt: VirtAddr) {
	unsafe {
		asm!("invlpg [{}]", in(reg) virt.as_usize(), options(nostack, preserves_flags));
	}
}

/// Manages one process's (or the kernel's) four-level page table tree.
pub struct PageTableManager {
	root: PhysAddr,
}

impl PageTableManager {
	/// Allocate a fresh, zeroed root table.
	pub fn new() -> Result<Self> {
		let root = phys::allocate()?;
		table_at(root).zero();
		Ok(Self { root })
	}

	/// Wrap an already-allocated root table (used when sharing the kernel half).
	pub fn from_root(root: PhysAddr) -> Self {
		Self { root }
	}

	pub fn root(&self) -> PhysAddr {
		self.root
	}

	fn walk_or_create(&mut self, idx: &Indices) -> Result<&'static mut PageTable> {
		let pml4 = table_at(self.root);

		let pdp_addr = if pml4.entry_ref(idx.pml4).is_present() {
			pml4.entry_ref(idx.pml4).addr()
		} else {
			let addr = phys::allocate()?;
			table_at(addr).zero();
			*pml4.entry(idx.pml4) = PageTableEntry::new().set(addr, PageTableFlags::kernel_rw());
			addr
		};

		let pdp = table_at(pdp_addr);
		let pd_addr = if pdp.entry_ref(idx.pdp).is_present() {
			pdp.entry_ref(idx.pdp).addr()
		} else {
			let addr = phys::allocate()?;
			table_at(addr).zero();
			*pdp.entry(idx.pdp) = PageTableEntry::new().set(addr, PageTableFlags::kernel_rw());
			addr
		};

		let pd = table_at(pd_addr);
		let pt_addr = if pd.entry_ref(idx.pd).is_present() {
			pd.entry_ref(idx.pd).addr()
		} else {
			let addr = phys::allocate()?;
			table_at(addr).zero();
			*pd.entry(idx.pd) = PageTableEntry::new().set(addr, PageTableFlags::kernel_rw());
			addr
		};

		Ok(table_at(pt_addr))
	}

	fn walk(&self, idx: &Indices) -> Option<&'static mut PageTable> {
		let pml4 = table_at(self.root);
		if !pml4.entry_ref(idx.pml4).is_present() {
			return None;
		}
		let pdp = table_at(pml4.entry_ref(idx.pml4).addr());
		if !pdp.entry_ref(idx.pdp).is_present() {
			return None;
		}
		let pd = table_at(pdp.entry_ref(idx.pdp).addr());
		if !pd.entry_ref(idx.pd).is_present() {
			return None;
		}
		Some(table_at(pd.entry_ref(idx.pd).addr()))
	}

	/// Install a mapping, creating intermediate tables as needed.
	pub fn map(&mut self, virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<()> {
		let idx = split(virt);
		let pt = self.walk_or_create(&idx)?;
		*pt.entry(idx.pt) = PageTableEntry::new().set(phys, flags);
		invalidate(virt);
		Ok(())
	}

	/// Change the flags of an existing entry without touching its address.
	pub fn reflag(&mut self, virt: VirtAddr, flags: PageTableFlags) -> Result<()> {
		let idx = split(virt);
		let pt = self.walk(&idx).ok_or(Error::InvalidArgument)?;
		let addr = pt.entry_ref(idx.pt).addr();
		*pt.entry(idx.pt) = PageTableEntry::new().set(addr, flags);
		invalidate(virt);
		Ok(())
	}

	/// Remove a mapping, returning the physical address it pointed at.
	///
	/// The previous address is read out *before* the entry is overwritten;
	/// doing this the other way around silently reports the wrong frame to
	/// the caller, which then fails to free it.
	pub fn unmap(&mut self, virt: VirtAddr) -> Result<PhysAddr> {
		let idx = split(virt);
		let pt = self.walk(&idx).ok_or(Error::InvalidArgument)?;
		let entry = pt.entry_ref(idx.pt);
		if !entry.is_present() {
			return Err(Error::InvalidArgument);
		}
		let old = entry.addr();
		*pt.entry(idx.pt) = PageTableEntry::new();
		invalidate(virt);
		Ok(old)
	}

	/// Look up the current mapping without modifying it.
	pub fn get_entry(&self, virt: VirtAddr) -> Option<(PhysAddr, PageTableFlags)> {
		let idx = split(virt);
		let pt = self.walk(&idx)?;
		let entry = pt.entry_ref(idx.pt);
		Some((entry.addr(), entry.flags()))
	}

	pub fn switch_to(&self) {
		unsafe {
			asm!("mov cr3, {}", in(reg) self.root.as_usize(), options(nostack, preserves_flags));
		}
	}

	/// Copy PML4 entries `[start, 512)` by reference from `other`'s root,
	/// so both tables share the same kernel-half sub-trees.
	pub fn share_upper_half_from(&mut self, other: PhysAddr, start: usize) {
		let other_pml4 = table_at(other);
		let pml4 = table_at(self.root);
		for i in start..512 {
			*pml4.entry(i) = *other_pml4.entry_ref(i);
		}
	}

	fn each_user_leaf<F: FnMut(VirtAddr, &mut PageTable, usize)>(&mut self, mut f: F) {
		let pml4 = table_at(self.root);
		for pml4_i in 0..256 {
			if !pml4.entry_ref(pml4_i).is_present() {
				continue;
			}
			let pdp = table_at(pml4.entry_ref(pml4_i).addr());
			for pdp_i in 0..512 {
				if !pdp.entry_ref(pdp_i).is_present() {
					continue;
				}
				let pd = table_at(pdp.entry_ref(pdp_i).addr());
				for pd_i in 0..512 {
					if !pd.entry_ref(pd_i).is_present() {
						continue;
					}
					let pt = table_at(pd.entry_ref(pd_i).addr());
					for pt_i in 0..512 {
						if !pt.entry_ref(pt_i).is_present() {
							continue;
						}
						let page = (pml4_i << 27) | (pdp_i << 18) | (pd_i << 9) | pt_i;
						f(VirtAddr::new(page * PAGE_SIZE), pt, pt_i);
					}
				}
			}
		}
	}

	/// Snapshot every present user-half mapping as `(virt, phys, flags)`.
	pub fn collect_user_entries(&mut self) -> alloc::vec::Vec<(VirtAddr, PhysAddr, PageTableFlags)> {
		let mut out = alloc::vec::Vec::new();
		self.each_user_leaf(|virt, pt, idx| {
			let entry = pt.entry_ref(idx);
			out.push((virt, entry.addr(), entry.flags()));
		});
		out
	}

	/// Every user-half leaf entry that holds a swap slot rather than a
	/// present frame, as `(virt, slot-tagged address, flags)`. Walked
	/// separately from [`collect_user_entries`] because [`each_user_leaf`]
	/// only visits present entries and a swapped-out page is, by
	/// definition, not present.
	fn each_swapped_leaf<F: FnMut(&mut PageTable, usize)>(&mut self, mut f: F) {
		let pml4 = table_at(self.root);
		for pml4_i in 0..256 {
			if !pml4.entry_ref(pml4_i).is_present() {
				continue;
			}
			let pdp = table_at(pml4.entry_ref(pml4_i).addr());
			for pdp_i in 0..512 {
				if !pdp.entry_ref(pdp_i).is_present() {
					continue;
				}
				let pd = table_at(pdp.entry_ref(pdp_i).addr());
				for pd_i in 0..512 {
					if !pd.entry_ref(pd_i).is_present() {
						continue;
					}
					let pt = table_at(pd.entry_ref(pd_i).addr());
					for pt_i in 0..512 {
						let entry = pt.entry_ref(pt_i);
						if !entry.is_present() && entry.flags().contains(PageTableFlags::SWAPPED) {
							f(pt, pt_i);
						}
					}
				}
			}
		}
	}

	/// Every swap slot id still occupied by one of this table's user-half
	/// entries. Destroying a VAS must free these, or a process that exits
	/// with pages evicted would leak their slots forever.
	pub fn collect_swapped_slots(&mut self) -> alloc::vec::Vec<usize> {
		let mut out = alloc::vec::Vec::new();
		self.each_swapped_leaf(|pt, idx| {
			out.push(pt.entry_ref(idx).addr().as_usize() / PAGE_SIZE - 1);
		});
		out
	}

	/// The virtual address of every user-half entry currently swapped out.
	/// Used by `Vas::copy` to bring every page resident before duplicating
	/// -- a COW clone can only share frames it can see.
	pub fn collect_swapped_virts(&mut self) -> alloc::vec::Vec<VirtAddr> {
		let mut out = alloc::vec::Vec::new();
		let pml4 = table_at(self.root);
		for pml4_i in 0..256 {
			if !pml4.entry_ref(pml4_i).is_present() {
				continue;
			}
			let pdp = table_at(pml4.entry_ref(pml4_i).addr());
			for pdp_i in 0..512 {
				if !pdp.entry_ref(pdp_i).is_present() {
					continue;
				}
				let pd = table_at(pdp.entry_ref(pdp_i).addr());
				for pd_i in 0..512 {
					if !pd.entry_ref(pd_i).is_present() {
						continue;
					}
					let pt = table_at(pd.entry_ref(pd_i).addr());
					for pt_i in 0..512 {
						let entry = pt.entry_ref(pt_i);
						if !entry.is_present() && entry.flags().contains(PageTableFlags::SWAPPED) {
							let page = (pml4_i << 27) | (pdp_i << 18) | (pd_i << 9) | pt_i;
							out.push(VirtAddr::new(page * PAGE_SIZE));
						}
					}
				}
			}
		}
		out
	}

	/// Free every user-half leaf frame (via `on_frame`) and every
	/// intermediate page-table page, then clear the user half of the root.
	/// Entries holding a swap slot rather than a frame are cleared too, but
	/// the caller must free the slot itself via [`collect_swapped_slots`]
	/// first -- this module has no notion of the swap manager.
	pub fn free_user_half<F: FnMut(PhysAddr)>(&mut self, mut on_frame: F) {
		self.each_user_leaf(|_, pt, idx| {
			on_frame(pt.entry_ref(idx).addr());
			*pt.entry(idx) = PageTableEntry::new();
		});
		self.each_swapped_leaf(|pt, idx| {
			*pt.entry(idx) = PageTableEntry::new();
		});

		let pml4 = table_at(self.root);
		for pml4_i in 0..256 {
			if !pml4.entry_ref(pml4_i).is_present() {
				continue;
			}
			let pdp_addr = pml4.entry_ref(pml4_i).addr();
			let pdp = table_at(pdp_addr);
			for pdp_i in 0..512 {
				if !pdp.entry_ref(pdp_i).is_present() {
					continue;
				}
				let pd_addr = pdp.entry_ref(pdp_i).addr();
				let pd = table_at(pd_addr);
				for pd_i in 0..512 {
					if pd.entry_ref(pd_i).is_present() {
						crate::memory::phys::free(pd.entry_ref(pd_i).addr());
					}
				}
				crate::memory::phys::free(pd_addr);
			}
			crate::memory::phys::free(pdp_addr);
			*pml4.entry(pml4_i) = PageTableEntry::new();
		}
	}
}
