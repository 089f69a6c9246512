// SPDX-License-Identifier: GPL-2.0

//! Boot process and hardware initialization

use alloc::string::ToString;

use crate::error::Result;
use crate::{error, info};

/// Boot stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
	EarlyInit,
	MemoryInit,
	DeviceInit,
	SchedulerInit,
	FileSystemInit,
	NetworkInit,
	UserSpaceInit,
	Complete,
}

/// Boot information structure
#[derive(Debug)]
pub struct BootInfo {
	pub memory_size: usize,
	pub available_memory: usize,
	pub cpu_count: usize,
	pub boot_time: u64,
	pub command_line: Option<alloc::string::String>,
	pub initrd_start: Option<usize>,
	pub initrd_size: Option<usize>,
	pub multiboot_addr: Option<usize>,
}

impl BootInfo {
	pub fn new() -> Self {
		Self {
			memory_size: 0,
			available_memory: 0,
			cpu_count: 1,
			boot_time: 0,
			command_line: None,
			initrd_start: None,
			initrd_size: None,
			multiboot_addr: None,
		}
	}
}

/// Global boot information
pub static mut BOOT_INFO: BootInfo = BootInfo {
	memory_size: 0,
	available_memory: 0,
	cpu_count: 1,
	boot_time: 0,
	command_line: None,
	initrd_start: None,
	initrd_size: None,
	multiboot_addr: None,
};

/// Set multiboot information address
pub fn set_multiboot_info(addr: usize) {
	unsafe {
		BOOT_INFO.multiboot_addr = Some(addr);
	}
}

/// Get boot information
pub fn get_boot_info() -> &'static BootInfo {
	unsafe { &BOOT_INFO }
}

/// Update boot information
pub unsafe fn update_boot_info<F>(f: F)
where
	F: FnOnce(&mut BootInfo),
{
	f(&mut BOOT_INFO);
}

/// Read the PML4 physical address the boot assembly already installed in
/// CR3. Paging is live by the time `kernel_main` runs (the assembly stub
/// sets up an identity-mapped bootstrap PML4 before jumping to Rust), so
/// this is the kernel's own root table, not a bootloader-supplied one.
pub fn current_root() -> crate::types::PhysAddr {
	let cr3: u64;
	unsafe {
		core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
	}
	crate::types::PhysAddr::new((cr3 & !0xFFF) as usize)
}

/// Usable physical memory above the kernel image, derived from the
/// CMOS-reported total minus the low 1MB reserved for BIOS/boot
/// structures and the identity-mapped kernel image itself.
pub fn usable_memory() -> (crate::types::PhysAddr, usize) {
	const KERNEL_RESERVED: usize = 4 * 1024 * 1024; // kernel image + early structures
	let total = detect_memory_size();
	let base = crate::types::PhysAddr::new(KERNEL_RESERVED);
	let frames = (total.saturating_sub(KERNEL_RESERVED)) / crate::types::PAGE_SIZE;
	(base, frames)
}

/// Early boot setup before memory allocation is available
pub fn early_boot_setup() -> Result<()> {
	info!("Early boot setup");

	// Basic hardware initialization
	// This is done before memory allocators are available

	Ok(())
}

/// Boot stage management
static mut CURRENT_BOOT_STAGE: BootStage = BootStage::EarlyInit;

/// Get current boot stage
pub fn get_boot_stage() -> BootStage {
	unsafe { CURRENT_BOOT_STAGE }
}

/// Set boot stage
pub fn set_boot_stage(stage: BootStage) {
	unsafe {
		CURRENT_BOOT_STAGE = stage;
	}
	info!("Boot stage: {:?}", stage);
}

/// Complete boot process
pub fn complete_boot() -> Result<()> {
	set_boot_stage(BootStage::Complete);
	info!("Boot process completed successfully");
	Ok(())
}

/// Initialize multiboot information
/// This should be called at the very beginning of kernel execution
pub fn multiboot_init() {
	// Parse multiboot information from bootloader
	// For now, we'll use a combination of detection and defaults

	let detected_memory = detect_memory_size();
	let cpu_count = detect_cpu_count();

	unsafe {
		BOOT_INFO = BootInfo {
			memory_size: detected_memory,
			available_memory: (detected_memory * 95) / 100, // 95% available
			cpu_count,
			boot_time: read_tsc(),
			command_line: None,
			initrd_start: None,
			initrd_size: None,
			multiboot_addr: None,
		};
	}

	info!("Multiboot information initialized");
	info!("  Memory size: {} MB", detected_memory / (1024 * 1024));
	info!(
		"  Available memory: {} MB",
		get_boot_info().available_memory / (1024 * 1024)
	);
	info!("  CPU count: {}", cpu_count);
}

/// Detect total system memory
fn detect_memory_size() -> usize {
	// Use CMOS to get basic memory information
	unsafe {
		// Read extended memory from CMOS (simplified)
		crate::arch::x86_64::port::outb(0x70, 0x17);
		let low = crate::arch::x86_64::port::inb(0x71) as usize;
		crate::arch::x86_64::port::outb(0x70, 0x18);
		let high = crate::arch::x86_64::port::inb(0x71) as usize;

		let extended_mem = (high << 8) | low; // in KB
		let total_mem = 1024 * 1024 + (extended_mem * 1024); // Base 1MB + extended

		// Reasonable bounds checking
		if total_mem < 16 * 1024 * 1024 {
			// Default to 64MB if detection seems wrong
			64 * 1024 * 1024
		} else if total_mem > 8 * 1024 * 1024 * 1024 {
			// Cap at 8GB for safety
			8 * 1024 * 1024 * 1024
		} else {
			total_mem
		}
	}
}

/// Detect CPU count (simplified)
fn detect_cpu_count() -> usize {
	// For now, assume single CPU
	// In a real implementation, this would parse ACPI tables or use CPUID
	1
}

/// Read Time Stamp Counter
fn read_tsc() -> u64 {
	unsafe {
		let low: u32;
		let high: u32;
		core::arch::asm!(
		    "rdtsc",
		    out("eax") low,
		    out("edx") high,
		    options(nomem, nostack, preserves_flags)
		);
		((high as u64) << 32) | (low as u64)
	}
}
