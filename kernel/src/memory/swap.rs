// SPDX-License-Identifier: GPL-2.0

//! Swap manager (component D).
//!
//! Owns a fixed span of a block device and a bitmap of page-sized slots
//! within it. Unlike the source this was distilled from, the swap lock is
//! released before the underlying block I/O and only briefly reacquired
//! afterwards to flip the slot's bit -- holding a lock across a
//! potentially-suspending disk operation is the kind of thing that starves
//! every other thread waiting on the same lock for no good reason.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::sync::Spinlock;
use crate::types::PAGE_SIZE;

struct SlotBitmap {
	bits: Vec<u64>,
	slot_count: usize,
	cursor: usize,
}

impl SlotBitmap {
	fn new(slot_count: usize) -> Self {
		Self {
			bits: vec![0u64; (slot_count + 63) / 64],
			slot_count,
			cursor: 0,
		}
	}

	fn claim(&mut self) -> Option<usize> {
		for step in 0..self.slot_count {
			let idx = (self.cursor + step) % self.slot_count;
			if self.bits[idx / 64] & (1 << (idx % 64)) == 0 {
				self.bits[idx / 64] |= 1 << (idx % 64);
				self.cursor = (idx + 1) % self.slot_count;
				return Some(idx);
			}
		}
		None
	}

	fn release(&mut self, slot: usize) {
		self.bits[slot / 64] &= !(1 << (slot % 64));
	}
}

struct SwapArea {
	device: Arc<Device>,
	start_block: u64,
	slots: SlotBitmap,
}

static SWAP: Spinlock<Option<SwapArea>> = Spinlock::new(None);

/// Bring up the swap area: `slot_count` page-sized slots starting at
/// `start_block` on `device`. The device's block size must be `PAGE_SIZE`
/// or an integral divisor of it.
pub fn init(device: Arc<Device>, start_block: u64, slot_count: usize) -> Result<()> {
	if PAGE_SIZE % device.block_size().max(1) != 0 {
		return Err(Error::InvalidArgument);
	}
	let mut guard = SWAP.lock();
	*guard = Some(SwapArea {
		device,
		start_block,
		slots: SlotBitmap::new(slot_count),
	});
	crate::info!("swap: {} slots available", slot_count);
	Ok(())
}

fn blocks_per_page(area: &SwapArea) -> u64 {
	(PAGE_SIZE / area.device.block_size().max(1)) as u64
}

/// Write a page-sized buffer to a freshly claimed slot, clear the source
/// buffer (§4.D: the caller's copy must not go on holding evicted page
/// contents once they are safely on disk), and return the slot's id.
pub fn write(buf: &mut [u8; PAGE_SIZE]) -> Result<usize> {
	let (device, block) = {
		let mut guard = SWAP.lock();
		let area = guard.as_mut().ok_or(Error::NoSuchDevice)?;
		let slot = area.slots.claim().ok_or(Error::OutOfMemory)?;
		let block = area.start_block + slot as u64 * blocks_per_page(area);
		(area.device.clone(), (slot, block))
	};
	let (slot, block_num) = block;

	if let Err(e) = device.write_blocks(block_num, buf) {
		let mut guard = SWAP.lock();
		if let Some(area) = guard.as_mut() {
			area.slots.release(slot);
		}
		return Err(e);
	}

	buf.fill(0);
	Ok(slot)
}

/// Read a slot's contents back into `buf` and free the slot.
pub fn read(buf: &mut [u8; PAGE_SIZE], slot: usize) -> Result<()> {
	let (device, block) = {
		let guard = SWAP.lock();
		let area = guard.as_ref().ok_or(Error::NoSuchDevice)?;
		if slot >= area.slots.slot_count {
			return Err(Error::Range);
		}
		let block = area.start_block + slot as u64 * blocks_per_page(area);
		(area.device.clone(), block)
	};

	device.read_blocks(block, buf)?;

	let mut guard = SWAP.lock();
	if let Some(area) = guard.as_mut() {
		area.slots.release(slot);
	}
	Ok(())
}

/// Free a slot without reading its contents back, for a VAS being torn
/// down with pages still evicted: nothing will ever read this data again.
pub fn discard(slot: usize) {
	let mut guard = SWAP.lock();
	if let Some(area) = guard.as_mut() {
		if slot < area.slots.slot_count {
			area.slots.release(slot);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test_case]
	fn bitmap_cursor_avoids_immediate_reuse() {
		let mut bm = SlotBitmap::new(4);
		let a = bm.claim().unwrap();
		bm.release(a);
		let b = bm.claim().unwrap();
		assert_ne!(a, b);
	}

	#[test_case]
	fn bitmap_exhaustion_returns_none() {
		let mut bm = SlotBitmap::new(2);
		bm.claim().unwrap();
		bm.claim().unwrap();
		assert!(bm.claim().is_none());
	}

	#[test_case]
	fn write_then_read_round_trip() {
		use crate::device::test_support::make_test_device;

		let device = make_test_device(1, 4);
		init(device, 0, 4).unwrap();

		let mut out = [0xABu8; PAGE_SIZE];
		let slot = write(&mut out).unwrap();
		// §4.D: the source buffer must not go on holding the evicted
		// contents once they are safely written to the device.
		assert_eq!(out, [0u8; PAGE_SIZE]);

		let mut back = [0u8; PAGE_SIZE];
		read(&mut back, slot).unwrap();
		assert_eq!(back, [0xABu8; PAGE_SIZE]);

		// The slot was released by `read`, so another write can still claim one.
		let mut second = [0x11u8; PAGE_SIZE];
		let reused = write(&mut second).unwrap();
		assert!(reused < 4);
	}
}
