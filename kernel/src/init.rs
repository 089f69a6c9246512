// SPDX-License-Identifier: GPL-2.0

//! Subsystem bring-up, in the dependency order §2 lays out: physical
//! frames, the kernel's own address space, the heap, swap, the scheduler
//! and its cleaner thread, interrupts and the syscall entry point, the
//! mounted filesystem namespace, and finally the first thread.

use crate::error::Result;
use crate::fs::demofs::DirBuilder;
use crate::{info, warn};

/// Bring up every subsystem `kernel_main` depends on before entering the
/// scheduler. The console is already up (`lib.rs::early_kernel_init`), so
/// failures here can still be reported.
pub fn init_subsystems() -> Result<()> {
	let kernel_root = crate::boot::current_root();
	let (usable_base, usable_frames) = crate::boot::usable_memory();
	crate::memory::init(kernel_root, usable_base, usable_frames)?;

	if let Some(ram) = crate::device::find("ram0") {
		let slot_count = (ram.block_count() as usize).min(4096);
		if let Err(e) = crate::memory::swap::init(ram, 0, slot_count) {
			warn!("swap area unavailable: {}", e);
		}
	} else {
		warn!("no ram0 device registered, running without swap");
	}

	crate::scheduler::init()?;

	crate::interrupt::init()?;
	crate::timer::init_timer()?;
	crate::syscalls::init_syscalls()?;

	crate::device::init()?;
	mount_demo_root()?;
	crate::drivers_init::init_drivers()?;

	spawn_init_thread()?;

	info!("all subsystems initialised");
	Ok(())
}

/// Mount a small read-only demo tree under `hd0:`, giving the end-to-end
/// scenarios in §8 and the first init thread somewhere to open from.
fn mount_demo_root() -> Result<()> {
	let root = DirBuilder::new()
		.file("motd", b"Welcome.\n")
		.dir("etc", DirBuilder::new().file("hostname", b"rustkernel\n").build())
		.build();
	crate::fs::mount_root("hd0", root)
}

/// Spawn the first thread (§3, §10). With no loaded executable image to
/// jump into, it is a plain kernel thread rather than a process's user
/// thread; it exists so the scheduler always has at least one non-idle,
/// non-cleaner thread to hand the CPU to.
fn spawn_init_thread() -> Result<()> {
	crate::scheduler::spawn_kernel_thread("init", init_main, 0, 128)?;
	Ok(())
}

fn init_main(_arg: usize) {
	info!("init thread running");
	loop {
		crate::scheduler::yield_now();
	}
}

/// Enter the scheduler from the boot context. Never returns.
pub fn main_kernel_loop() -> ! {
	crate::scheduler::start()
}
