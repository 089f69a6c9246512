// SPDX-License-Identifier: GPL-2.0

//! Timer interrupt handler for preemptive scheduling.
//!
//! Programs the PIT to fire at [`crate::time::HZ`] and wires its IRQ to
//! [`crate::time::timer_interrupt`], which advances jiffies and drives
//! [`crate::scheduler::scheduler_tick`]. All scheduling policy lives in
//! `scheduler.rs`; this module is just the hardware plumbing that calls
//! into it once per tick.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupt counter, exposed for diagnostics.
static TIMER_INTERRUPTS: AtomicU64 = AtomicU64::new(0);

pub fn get_timer_interrupts() -> u64 {
	TIMER_INTERRUPTS.load(Ordering::Relaxed)
}

/// Initialize timer for preemptive scheduling.
pub fn init_timer() -> crate::error::Result<()> {
	init_pit(crate::time::HZ)?;
	crate::arch::x86_64::idt::register_timer_handler(timer_interrupt_handler);
	crate::info!(
		"Timer initialized for preemptive scheduling ({}Hz)",
		crate::time::HZ
	);
	Ok(())
}

/// Timer interrupt handler (called from the IDT).
pub extern "C" fn timer_interrupt_handler() {
	TIMER_INTERRUPTS.fetch_add(1, Ordering::Relaxed);
	crate::time::timer_interrupt();

	unsafe {
		crate::arch::x86_64::pic::send_eoi(0); // Timer is IRQ 0
	}
}

/// Initialize the Programmable Interval Timer (PIT) to `frequency` Hz.
fn init_pit(frequency: u64) -> crate::error::Result<()> {
	use crate::arch::x86_64::port::Port;

	const PIT_FREQUENCY: u64 = 1193182;

	let divisor = PIT_FREQUENCY / frequency;
	if divisor > 65535 {
		return Err(crate::error::Error::InvalidArgument);
	}

	unsafe {
		let mut cmd_port = Port::new(0x43);
		let mut data_port = Port::new(0x40);

		// Channel 0, access mode lobyte/hibyte, mode 2 (rate generator)
		cmd_port.write(0x34u32);
		data_port.write((divisor & 0xFF) as u32);
		data_port.write((divisor >> 8) as u32);
	}

	Ok(())
}
