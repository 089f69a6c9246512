// SPDX-License-Identifier: GPL-2.0

//! Null, zero, and full devices: the three pure in-memory character
//! devices every mounted device tree carries, each a direct translation
//! of the classic Unix semantics onto [`DeviceOps::io`].

#![no_std]

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;

use kernel::device::{DeviceOps, IoDirection};
use kernel::error::{Error, Result};

/// `/dev/null`: reads return EOF, writes discard everything.
struct NullDevice;

impl DeviceOps for NullDevice {
	fn block_size(&self) -> usize {
		0
	}

	fn block_count(&self) -> u64 {
		0
	}

	fn io(&self, dir: IoDirection, _offset: u64, buf: &mut [u8]) -> Result<usize> {
		match dir {
			IoDirection::Read => Ok(0),
			IoDirection::Write => Ok(buf.len()),
		}
	}
}

/// `/dev/zero`: reads fill the buffer with zeros, writes discard everything.
struct ZeroDevice;

impl DeviceOps for ZeroDevice {
	fn block_size(&self) -> usize {
		0
	}

	fn block_count(&self) -> u64 {
		0
	}

	fn io(&self, dir: IoDirection, _offset: u64, buf: &mut [u8]) -> Result<usize> {
		match dir {
			IoDirection::Read => {
				buf.fill(0);
				Ok(buf.len())
			}
			IoDirection::Write => Ok(buf.len()),
		}
	}
}

/// `/dev/full`: reads fill with zeros, writes always fail as out of space.
struct FullDevice;

impl DeviceOps for FullDevice {
	fn block_size(&self) -> usize {
		0
	}

	fn block_count(&self) -> u64 {
		0
	}

	fn io(&self, dir: IoDirection, _offset: u64, buf: &mut [u8]) -> Result<usize> {
		match dir {
			IoDirection::Read => {
				buf.fill(0);
				Ok(buf.len())
			}
			IoDirection::Write => Err(Error::OutOfMemory),
		}
	}
}

/// Register `null`, `zero`, and `full` with the device registry.
pub fn register_all() -> Result<()> {
	kernel::device::register(String::from("null"), Arc::new(NullDevice))?;
	kernel::device::register(String::from("zero"), Arc::new(ZeroDevice))?;
	kernel::device::register(String::from("full"), Arc::new(FullDevice))?;
	Ok(())
}
