// SPDX-License-Identifier: GPL-2.0

//! A RAM-backed block device: `PAGE_SIZE`-blocked storage held entirely in
//! a heap buffer, registered under `ram0` for the swap backend and any
//! filesystem that wants a writable block store without real disk
//! hardware.

#![no_std]

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use kernel::device::{DeviceOps, IoDirection};
use kernel::error::{Error, Result};
use kernel::sync::Spinlock;
use kernel::types::PAGE_SIZE;

/// Default ramdisk size: 16MiB, four thousand `PAGE_SIZE` blocks.
pub const DEFAULT_SIZE: usize = 16 * 1024 * 1024;

struct RamDisk {
	blocks: Spinlock<Vec<u8>>,
	block_count: u64,
}

impl RamDisk {
	fn new(size: usize) -> Self {
		let block_count = (size / PAGE_SIZE) as u64;
		Self {
			blocks: Spinlock::new(vec![0u8; block_count as usize * PAGE_SIZE]),
			block_count,
		}
	}
}

impl DeviceOps for RamDisk {
	fn block_size(&self) -> usize {
		PAGE_SIZE
	}

	fn block_count(&self) -> u64 {
		self.block_count
	}

	fn io(&self, dir: IoDirection, block: u64, buf: &mut [u8]) -> Result<usize> {
		if block >= self.block_count {
			return Err(Error::InvalidArgument);
		}
		let offset = block as usize * PAGE_SIZE;
		let size = core::cmp::min(buf.len(), PAGE_SIZE);
		let mut data = self.blocks.lock();
		match dir {
			IoDirection::Read => {
				buf[..size].copy_from_slice(&data[offset..offset + size]);
			}
			IoDirection::Write => {
				data[offset..offset + size].copy_from_slice(&buf[..size]);
			}
		}
		Ok(size)
	}
}

/// Register a `size`-byte ramdisk under `ram0`.
pub fn register(size: usize) -> Result<()> {
	kernel::device::register(String::from("ram0"), Arc::new(RamDisk::new(size)))?;
	Ok(())
}
