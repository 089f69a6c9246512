// SPDX-License-Identifier: GPL-2.0

//! The non-blocking synchronisation primitive (component E, §3, §4.E).
//!
//! [`Spinlock`] is what everything else in the kernel, including the
//! scheduler's own run queues, is built on: it never gives up the CPU,
//! so it is the only lock safe to take from code that must not sleep --
//! interrupt handlers, and the scheduler itself while it is deciding
//! what to switch to. Blocking primitives ([`crate::scheduler::Semaphore`],
//! [`crate::scheduler::RwLock`], [`crate::scheduler::Mutex`]) live in
//! `scheduler.rs` instead of here, since they are built directly on the
//! scheduler's postponed-switch bracket and waiter queues rather than on
//! this type.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A non-blocking spinlock. Safe to use anywhere, including inside the
/// scheduler itself and interrupt handlers, because it never calls back
/// into the scheduler.
pub struct Spinlock<T> {
	locked: AtomicBool,
	data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
	pub const fn new(data: T) -> Self {
		Self {
			locked: AtomicBool::new(false),
			data: UnsafeCell::new(data),
		}
	}

	pub fn lock(&self) -> SpinlockGuard<'_, T> {
		while self
			.locked
			.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_err()
		{
			while self.locked.load(Ordering::Relaxed) {
				core::hint::spin_loop();
			}
		}
		SpinlockGuard { lock: self }
	}

	pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
		if self
			.locked
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
		{
			Some(SpinlockGuard { lock: self })
		} else {
			None
		}
	}

	/// Raw pointer to the protected data, bypassing the lock entirely.
	///
	/// # Safety
	///
	/// Callers must independently guarantee exclusivity (typically by
	/// already holding `self.lock()` when computing the pointer, or by
	/// relying on the scheduler's postponed-switch bracket to rule out
	/// concurrent access on this single-CPU kernel). Used by the
	/// scheduler to read/write a thread's saved context across a context
	/// switch, where holding a live guard would outlive the switch.
	pub unsafe fn as_mut_ptr(&self) -> *mut T {
		self.data.get()
	}
}

pub struct SpinlockGuard<'a, T> {
	lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
	type Target = T;
	fn deref(&self) -> &T {
		unsafe { &*self.lock.data.get() }
	}
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.lock.data.get() }
	}
}

impl<T> Drop for SpinlockGuard<'_, T> {
	fn drop(&mut self) {
		self.lock.locked.store(false, Ordering::Release);
	}
}
