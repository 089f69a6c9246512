// SPDX-License-Identifier: GPL-2.0

//! Device interface (§6).
//!
//! A device is a registry record handed to the VFS's device bridge
//! (`fs::devfs`): a block size (zero for a character device), a block
//! count, an optional termios (its presence marks the device a tty), and
//! three callbacks a concrete driver fills in -- `check_open`, `ioctl`,
//! and `io`. Everything Linux-specific the earlier version of this file
//! carried (PCI/platform matching, power states, NUMA nodes) does not
//! apply to this kernel's scope and is gone.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;

use crate::error::{Error, Result};
use crate::fs::OpenFlags;
use crate::sync::Spinlock;
use crate::types::{DeviceId, PAGE_SIZE};

/// Terminal attributes, the subset `tcgetattr`/`tcsetattr` (§6) need.
#[derive(Debug, Clone, Copy, Default)]
pub struct Termios {
	pub input_flags: u32,
	pub output_flags: u32,
	pub control_flags: u32,
	pub local_flags: u32,
}

/// Direction of an `io` transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
	Read,
	Write,
}

/// The operations a concrete driver supplies for one device.
pub trait DeviceOps: Send + Sync {
	/// 0 for a character device; otherwise the device's block size in bytes.
	fn block_size(&self) -> usize;
	/// Total number of blocks (ignored for character devices).
	fn block_count(&self) -> u64;
	/// `Some` marks this device a tty.
	fn termios(&self) -> Option<Termios> {
		None
	}
	fn set_termios(&self, _termios: Termios) -> Result<()> {
		Err(Error::NotTty)
	}
	/// Called by the VFS before handing back an open file on this device.
	fn check_open(&self, _flags: OpenFlags) -> Result<()> {
		Ok(())
	}
	fn ioctl(&self, cmd: u32, arg: usize) -> Result<usize> {
		let _ = (cmd, arg);
		Err(Error::NotImplemented)
	}
	/// `offset` is a block index for block devices and ignored for
	/// character devices. Returns the number of bytes transferred.
	fn io(&self, dir: IoDirection, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// A registered device: a name plus its operations table.
pub struct Device {
	pub id: DeviceId,
	pub name: String,
	ops: Arc<dyn DeviceOps>,
}

impl Device {
	pub fn new(id: DeviceId, name: String, ops: Arc<dyn DeviceOps>) -> Self {
		Self { id, name, ops }
	}

	pub fn block_size(&self) -> usize {
		self.ops.block_size()
	}

	pub fn block_count(&self) -> u64 {
		self.ops.block_count()
	}

	pub fn is_character(&self) -> bool {
		self.block_size() == 0
	}

	pub fn is_tty(&self) -> bool {
		self.ops.termios().is_some()
	}

	pub fn termios(&self) -> Option<Termios> {
		self.ops.termios()
	}

	pub fn set_termios(&self, t: Termios) -> Result<()> {
		self.ops.set_termios(t)
	}

	pub fn check_open(&self, flags: OpenFlags) -> Result<()> {
		self.ops.check_open(flags)
	}

	pub fn ioctl(&self, cmd: u32, arg: usize) -> Result<usize> {
		self.ops.ioctl(cmd, arg)
	}

	pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
		self.ops.io(IoDirection::Read, offset, buf)
	}

	pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
		// io() takes &mut, so round-trip through a local copy for writes.
		let mut scratch = alloc::vec::Vec::from(buf);
		self.ops.io(IoDirection::Write, offset, &mut scratch)
	}

	/// Read exactly one block-sized (or `PAGE_SIZE`-sized) page at `block`.
	pub fn read_blocks(&self, block: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
		let n = self.read(block, buf)?;
		if n != PAGE_SIZE {
			return Err(Error::Io);
		}
		Ok(())
	}

	pub fn write_blocks(&self, block: u64, buf: &[u8; PAGE_SIZE]) -> Result<()> {
		let n = self.write(block, buf)?;
		if n != PAGE_SIZE {
			return Err(Error::Io);
		}
		Ok(())
	}
}

struct Registry {
	devices: BTreeMap<String, Arc<Device>>,
	next_id: u32,
}

static DEVICES: Spinlock<Registry> = Spinlock::new(Registry {
	devices: BTreeMap::new(),
	next_id: 1,
});

/// Register a device under `name`. Names must be unique.
pub fn register(name: String, ops: Arc<dyn DeviceOps>) -> Result<Arc<Device>> {
	let mut reg = DEVICES.lock();
	if reg.devices.contains_key(&name) {
		return Err(Error::AlreadyRegistered);
	}
	let id = DeviceId(reg.next_id);
	reg.next_id += 1;
	let device = Arc::new(Device::new(id, name.clone(), ops));
	reg.devices.insert(name, device.clone());
	Ok(device)
}

pub fn find(name: &str) -> Option<Arc<Device>> {
	DEVICES.lock().devices.get(name).cloned()
}

pub fn init() -> Result<()> {
	crate::info!("device: registry ready");
	Ok(())
}

/// An in-memory block device for tests that need to exercise real I/O
/// (swap writes/reads, page-fault eviction) without the global registry
/// or a bootloader-provided disk. Modeled on `drivers::ramdisk::RamDisk`.
#[cfg(test)]
pub(crate) mod test_support {
	use alloc::vec;
	use alloc::vec::Vec;

	use super::*;

	struct MemoryDisk {
		blocks: Spinlock<Vec<u8>>,
		block_count: u64,
	}

	impl MemoryDisk {
		fn new(block_count: u64) -> Self {
			Self {
				blocks: Spinlock::new(vec![0u8; block_count as usize * PAGE_SIZE]),
				block_count,
			}
		}
	}

	impl DeviceOps for MemoryDisk {
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
				IoDirection::Read => buf[..size].copy_from_slice(&data[offset..offset + size]),
				IoDirection::Write => data[offset..offset + size].copy_from_slice(&buf[..size]),
			}
			Ok(size)
		}
	}

	/// An unregistered, standalone block device, not inserted into the
	/// global registry so concurrent tests never collide over a name.
	pub(crate) fn make_test_device(id: u32, block_count: u64) -> Arc<Device> {
		Arc::new(Device::new(
			DeviceId(id),
			String::from("test-disk"),
			Arc::new(MemoryDisk::new(block_count)),
		))
	}
}
