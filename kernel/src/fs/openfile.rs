// SPDX-License-Identifier: GPL-2.0

//! Open files (§3, §4.F): a reference-counted object layered over a
//! vnode, carrying the file status flags and the seek position. Multiple
//! descriptors may share one open file (`dup`); two descriptors sharing
//! one open file race on its seek position by design, matching `dup`'s
//! well-known contract (§5).

use alloc::sync::Arc;

use crate::error::{Error, Result};
use crate::fs::mount::MOUNTS;
use crate::fs::path::{resolve, resolve_parent};
use crate::fs::vnode::{DirentType, Vnode};
use crate::sync::Spinlock;

bitflags::bitflags! {
	/// Open-time flags (§3, §4.F, §6). `ACCESS_MASK` picks out the
	/// mutually-exclusive access-mode bits.
	#[derive(Clone, Copy, PartialEq, Eq)]
	pub struct OpenFlags: u32 {
		const RDONLY    = 0;
		const WRONLY    = 1 << 0;
		const RDWR      = 1 << 1;
		const CREATE    = 1 << 2;
		const EXCLUSIVE = 1 << 3;
		const TRUNCATE  = 1 << 4;
		const APPEND    = 1 << 5;
		const CLOEXEC   = 1 << 6;
		const NONBLOCK  = 1 << 7;
	}
}

impl OpenFlags {
	const ACCESS_MASK: OpenFlags = OpenFlags::WRONLY.union(OpenFlags::RDWR);

	pub fn can_read(self) -> bool {
		!self.contains(OpenFlags::WRONLY) || self.contains(OpenFlags::RDWR)
	}

	pub fn can_write(self) -> bool {
		self.intersects(Self::ACCESS_MASK)
	}
}

/// The capability and mode bits an open file carries once created,
/// distinct from the raw `OpenFlags` used only at `open` time.
#[derive(Clone, Copy)]
pub struct FileStatus {
	pub readable: bool,
	pub writable: bool,
	pub append: bool,
	pub nonblock: bool,
}

pub struct OpenFile {
	vnode: Vnode,
	status: FileStatus,
	pos: Spinlock<u64>,
}

impl OpenFile {
	/// Wrap a vnode as a read-only open file directly, bypassing path
	/// resolution. Used to mount a filesystem or raw device's root vnode
	/// into the mount table (§3's `(name, open file)` pair).
	pub fn for_root(vnode: Vnode) -> Self {
		Self {
			vnode,
			status: FileStatus {
				readable: true,
				writable: false,
				append: false,
				nonblock: false,
			},
			pos: Spinlock::new(0),
		}
	}

	pub fn vnode(&self) -> Vnode {
		self.vnode.clone()
	}

	pub fn status(&self) -> FileStatus {
		self.status
	}

	pub fn pos(&self) -> u64 {
		*self.pos.lock()
	}

	pub fn set_pos(&self, pos: u64) {
		*self.pos.lock() = pos;
	}

	pub fn seek_to_end(&self) -> Result<u64> {
		let size = self.vnode.stat()?.size;
		*self.pos.lock() = size;
		Ok(size)
	}

	pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
		if !self.status.readable {
			return Err(Error::BadDescriptor);
		}
		let mut pos = self.pos.lock();
		let n = self.vnode.read(*pos, buf)?;
		*pos += n as u64;
		Ok(n)
	}

	pub fn write(&self, buf: &[u8]) -> Result<usize> {
		if !self.status.writable {
			return Err(Error::BadDescriptor);
		}
		if self.vnode.is_directory() {
			return Err(Error::IsDirectory);
		}
		let mut pos = self.pos.lock();
		if self.status.append {
			*pos = self.vnode.stat()?.size;
		}
		let n = self.vnode.write(*pos, buf)?;
		*pos += n as u64;
		Ok(n)
	}

	pub fn readdir(&self, index: usize) -> Result<Option<crate::fs::vnode::DirEntry>> {
		if !self.vnode.is_directory() {
			return Err(Error::NotDirectory);
		}
		self.vnode.readdir(index)
	}
}

fn capability(flags: OpenFlags) -> (bool, bool) {
	if flags.contains(OpenFlags::RDWR) {
		(true, true)
	} else if flags.contains(OpenFlags::WRONLY) {
		(false, true)
	} else {
		(true, false)
	}
}

/// Resolve `path` and build an open file over it (§4.F "Open").
pub fn open(path: &str, flags: OpenFlags, mode: u32) -> Result<Arc<OpenFile>> {
	let vnode = match resolve(&MOUNTS, path) {
		Ok(v) => {
			if flags.contains(OpenFlags::CREATE) && flags.contains(OpenFlags::EXCLUSIVE) {
				return Err(Error::Exists);
			}
			v
		}
		Err(Error::NoSuchEntry) if flags.contains(OpenFlags::CREATE) => {
			let (parent, name) = resolve_parent(&MOUNTS, path)?;
			if !parent.is_directory() {
				return Err(Error::NotDirectory);
			}
			parent.create(&name, mode)?
		}
		Err(e) => return Err(e),
	};

	vnode.check_open(flags)?;

	if vnode.is_directory() && flags.can_write() {
		return Err(Error::IsDirectory);
	}

	if flags.contains(OpenFlags::TRUNCATE) && flags.can_write() && !vnode.is_directory() {
		vnode.truncate(0)?;
	}

	let (readable, writable) = capability(flags);
	let file = Arc::new(OpenFile {
		vnode,
		status: FileStatus {
			readable,
			writable,
			append: flags.contains(OpenFlags::APPEND),
			nonblock: flags.contains(OpenFlags::NONBLOCK),
		},
		pos: Spinlock::new(0),
	});

	if flags.contains(OpenFlags::APPEND) {
		file.seek_to_end()?;
	}

	Ok(file)
}

pub fn dirent_type_for(file: &OpenFile) -> DirentType {
	file.vnode.dirent_type()
}
