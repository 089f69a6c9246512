// SPDX-License-Identifier: GPL-2.0

//! Kernel main entry point

#![no_std]
#![no_main]

extern crate kernel;

use core::arch::global_asm;

// Include boot assembly
#[cfg(target_arch = "x86_64")]
global_asm!(include_str!("arch/x86_64/boot.s"), options(att_syntax));

/// Entry point called by boot.s assembly code.
///
/// Registers the concrete drivers this binary is linked against (the
/// `kernel` library itself only knows the [`kernel::device::DeviceOps`]
/// trait, not any implementation of it) before handing off to the library's
/// multiboot entry point. `rust_main` exists at all only so something in
/// this binary crate references `kernel`, keeping the library linked in.
#[no_mangle]
pub extern "C" fn rust_main(multiboot_magic: u32, multiboot_addr: u32) -> ! {
	if let Err(e) = drivers::register_all() {
		panic!("driver registration failed: {:?}", e);
	}
	kernel::kernel_main_multiboot(multiboot_magic, multiboot_addr)
}

// Panic handler is defined in the kernel library
