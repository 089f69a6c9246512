// SPDX-License-Identifier: GPL-2.0

//! Device vnode bridge (§4.F "Device vnodes"): a thin `VnodeOps`
//! implementation that maps read/write onto a device's unified `io`
//! callback. Block devices (nonzero block size) report seekable;
//! character devices with a termios attached report `is_tty`.

use alloc::sync::Arc;

use crate::device::Device;
use crate::error::Result;
use crate::fs::openfile::OpenFlags;
use crate::fs::vnode::{DirEntry, DirentType, Stat, Vnode, VnodeOps};

pub struct DeviceVnode {
	device: Arc<Device>,
}

impl DeviceVnode {
	pub fn new(device: Arc<Device>) -> Vnode {
		Arc::new(Self { device })
	}
}

impl VnodeOps for DeviceVnode {
	fn check_open(&self, flags: OpenFlags) -> Result<()> {
		self.device.check_open(flags)
	}

	fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
		self.device.read(offset, buf)
	}

	fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
		self.device.write(offset, buf)
	}

	fn readdir(&self, _index: usize) -> Result<Option<DirEntry>> {
		Err(crate::error::Error::NotDirectory)
	}

	fn ioctl(&self, cmd: u32, arg: usize) -> Result<usize> {
		self.device.ioctl(cmd, arg)
	}

	fn termios(&self) -> Result<crate::device::Termios> {
		self.device.termios().ok_or(crate::error::Error::NotTty)
	}

	fn set_termios(&self, termios: crate::device::Termios) -> Result<()> {
		self.device.set_termios(termios)
	}

	fn is_seekable(&self) -> bool {
		self.device.block_size() > 0
	}

	fn is_tty(&self) -> bool {
		self.device.is_tty()
	}

	fn dirent_type(&self) -> DirentType {
		if self.device.is_character() {
			DirentType::CharDevice
		} else {
			DirentType::BlockDevice
		}
	}

	fn follow(&self, _name: &str) -> Result<Vnode> {
		Err(crate::error::Error::NotDirectory)
	}

	fn stat(&self) -> Result<Stat> {
		Ok(Stat {
			size: self.device.block_count() * self.device.block_size().max(1) as u64,
			is_directory: false,
		})
	}
}
