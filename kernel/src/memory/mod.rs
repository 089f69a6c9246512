// SPDX-License-Identifier: GPL-2.0

//! Memory management subsystem.
//!
//! Five pieces, each its own module, wired together the way §2 describes:
//! a physical frame allocator ([`phys`]) backs a per-process address space
//! manager ([`vas`], built on the raw [`page_table`] plumbing), which in
//! turn backs the kernel's own unbacked/backed virtual allocator
//! ([`kalloc`]) and the byte-granular kernel heap ([`heap`]). [`swap`]
//! gives the physical allocator somewhere to send pages under pressure,
//! and [`pagefault`] is the glue that makes all of it demand-driven.

pub mod heap;
pub mod kalloc;
pub mod page_table;
pub mod pagefault;
pub mod phys;
pub mod swap;
pub mod vas;

pub use crate::types::{Pfn, PhysAddr, VirtAddr};
use crate::error::Result;

/// Bring up the memory subsystem in dependency order: physical frames
/// first, then the kernel's own address space, then the byte-granular
/// heap layered over it. Swap and the page-fault replacer need no
/// explicit init beyond [`swap::init`], which is called once a backing
/// device is known (see `init::init_subsystems`).
pub fn init(kernel_root: PhysAddr, usable_base: PhysAddr, usable_frames: usize) -> Result<()> {
	phys::init(usable_base, usable_frames);
	vas::set_kernel_root(kernel_root);
	let kvas = vas::Vas::new_kernel(kernel_root);
	vas::set_kernel_vas(kvas.clone());
	pagefault::set_current_vas(kvas);
	heap::init()?;
	crate::info!("memory management initialised");
	Ok(())
}
