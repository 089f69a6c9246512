// SPDX-License-Identifier: GPL-2.0

//! The vnode: a reference-counted, polymorphic file-or-directory object
//! (component F, §3, §4.F).
//!
//! Every backend -- the demo filesystem, the device bridge -- implements
//! [`VnodeOps`] on its own concrete type and holds whatever per-instance
//! state it needs directly (the inode number, the byte buffer, the
//! `Arc<Device>`). A vnode handed around the kernel is simply
//! `Arc<dyn VnodeOps>`: cloning it is "increment the refcount" and letting
//! the last clone drop is "dereference". Rust's `Arc` already makes
//! double-drops and negative counts impossible, so unlike the source this
//! was distilled from there is no separate manual counter to get wrong;
//! `close` is simply each backend's `Drop` impl, run automatically when the
//! strong count reaches zero.

use alloc::string::String;
use alloc::sync::Arc;

use crate::error::{Error, Result};
use crate::fs::OpenFlags;

/// The small, closed set of file types the VFS distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirentType {
	Regular,
	Directory,
	CharDevice,
	BlockDevice,
	Fifo,
	Socket,
	Symlink,
}

/// One entry yielded by [`VnodeOps::readdir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
	pub name: String,
	pub kind: DirentType,
}

/// The subset of `stat(2)` fields the core cares about.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
	pub size: u64,
	pub is_directory: bool,
}

/// The vnode operations table (§3, §9). Represented as a trait object
/// rather than a tagged enum since backends are added independently
/// (demo filesystem, device bridge) rather than forming one closed set.
pub trait VnodeOps: Send + Sync {
	/// Called by `open` before a capability-bearing open file is built.
	/// May reject on name shape, read-only filesystem, directory-ness, etc.
	fn check_open(&self, _flags: OpenFlags) -> Result<()> {
		Ok(())
	}

	fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

	fn write(&self, offset: u64, buf: &[u8]) -> Result<usize>;

	/// Yield the `index`-th directory entry, or `None` past the end.
	fn readdir(&self, index: usize) -> Result<Option<DirEntry>> {
		let _ = index;
		Err(Error::NotDirectory)
	}

	fn ioctl(&self, cmd: u32, arg: usize) -> Result<usize> {
		let _ = (cmd, arg);
		Err(Error::NotImplemented)
	}

	/// Current terminal attributes (`tcgetattr`, §6). Only a tty-backed
	/// vnode (the device bridge over a device whose `termios` is `Some`)
	/// overrides this.
	fn termios(&self) -> Result<crate::device::Termios> {
		Err(Error::NotTty)
	}

	/// Install new terminal attributes (`tcsetattr`, §6).
	fn set_termios(&self, _termios: crate::device::Termios) -> Result<()> {
		Err(Error::NotTty)
	}

	fn is_seekable(&self) -> bool {
		true
	}

	fn is_tty(&self) -> bool {
		false
	}

	fn truncate(&self, _len: u64) -> Result<()> {
		Err(Error::ReadOnly)
	}

	/// Create `name` as a child of this (directory) vnode and return it,
	/// incremented. The read-only demo filesystem and the device bridge
	/// both refuse this; a real writable filesystem backend would not.
	fn create(&self, _name: &str, _mode: u32) -> Result<Vnode> {
		Err(Error::ReadOnly)
	}

	/// Resolve one path component below this (directory) vnode. The
	/// returned vnode is handed to the caller already incremented.
	fn follow(&self, name: &str) -> Result<Vnode>;

	fn dirent_type(&self) -> DirentType;

	fn stat(&self) -> Result<Stat>;

	fn is_directory(&self) -> bool {
		self.dirent_type() == DirentType::Directory
	}
}

/// A reference to a vnode. Cloning increments the refcount; dropping the
/// last clone decrements it to zero and runs the backend's `Drop` impl.
pub type Vnode = Arc<dyn VnodeOps>;
