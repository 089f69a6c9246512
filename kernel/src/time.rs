// SPDX-License-Identifier: GPL-2.0

//! Jiffies: the tick counter the PIT interrupt (`timer.rs`) advances and
//! the sleeping queue (`scheduler.rs`, §4.E) compares wake-times against.
//! There is no wall-clock or timer-wheel facility here -- nothing in this
//! kernel's scope needs one, and sleeping is driven directly off the
//! scheduler's own sleeping queue rather than a separate timer service.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::types::Jiffies;

/// Timer ticks per second the PIT is programmed for (`timer.rs`).
pub const HZ: u64 = 1000;

static JIFFIES_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Ticks elapsed since boot.
pub fn get_jiffies() -> Jiffies {
	Jiffies(JIFFIES_COUNTER.load(Ordering::Relaxed))
}

fn update_jiffies() {
	JIFFIES_COUNTER.fetch_add(1, Ordering::Relaxed);
}

/// Called from the PIT interrupt handler (`timer.rs`) on every tick:
/// advance jiffies, then let the scheduler check timeslice expiry and
/// wake anything whose sleep has elapsed.
pub fn timer_interrupt() {
	update_jiffies();
	crate::scheduler::scheduler_tick();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test_case]
	fn jiffies_advance_by_one_per_tick() {
		let before = get_jiffies();
		update_jiffies();
		assert_eq!(get_jiffies() - before, Jiffies(1));
	}
}
