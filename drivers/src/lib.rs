// SPDX-License-Identifier: GPL-2.0

//! Kernel drivers library
//!
//! This crate contains various kernel drivers for the Rust kernel.

#![no_std]

extern crate alloc;

pub mod keyboard; // Keyboard driver
pub mod mem;
pub mod ramdisk;
pub mod serial; // Serial driver

/// Register every built-in device and wire its interrupt, if it has one.
/// Called once by the kernel binary before `kernel::kernel_main` runs;
/// `kernel::drivers_init::init_drivers` then mounts whatever landed in
/// the registry under its own name.
pub fn register_all() -> kernel::error::Result<()> {
	keyboard::register()?;
	serial::register()?;
	mem::register_all()?;
	ramdisk::register(ramdisk::DEFAULT_SIZE)?;
	Ok(())
}
