// SPDX-License-Identifier: GPL-2.0

//! Mount table (§3, §4.F): a process-wide list of `(name, open file)`
//! pairs. Path resolution matches the `device:` prefix of a path against
//! this list to find the device's root vnode.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::fs::openfile::OpenFile;
use crate::fs::vnode::Vnode;
use crate::sync::Spinlock;

struct Mount {
	name: String,
	file: Arc<OpenFile>,
}

/// A process-wide mount table. The kernel keeps one as its own, process
/// mount tables would be copies of this at `fork` in a full multi-process
/// build; see `DESIGN.md` for why a single global table is sufficient here.
pub struct MountTable {
	mounts: Spinlock<Vec<Mount>>,
}

impl MountTable {
	pub const fn new() -> Self {
		Self {
			mounts: Spinlock::new(Vec::new()),
		}
	}

	/// Mount `root`'s vnode under `name`. `raw_device` is the open file
	/// backing the mount (conventionally `raw-<fsname>` for a filesystem,
	/// or the open file itself for a bare device mount).
	pub fn mount(&self, name: &str, file: Arc<OpenFile>) -> Result<()> {
		if name.contains('/') || name.contains(':') || name.contains('\\') {
			return Err(Error::InvalidArgument);
		}
		let mut mounts = self.mounts.lock();
		if mounts.iter().any(|m| m.name == name) {
			return Err(Error::AlreadyRegistered);
		}
		mounts.push(Mount {
			name: name.into(),
			file,
		});
		Ok(())
	}

	pub fn unmount(&self, name: &str) -> Result<()> {
		let mut mounts = self.mounts.lock();
		let len_before = mounts.len();
		mounts.retain(|m| m.name != name);
		if mounts.len() == len_before {
			return Err(Error::NoSuchEntry);
		}
		Ok(())
	}

	/// Look up `name`'s root vnode, incrementing its refcount.
	pub fn root(&self, name: &str) -> Result<Vnode> {
		let mounts = self.mounts.lock();
		mounts
			.iter()
			.find(|m| m.name == name)
			.map(|m| m.file.vnode())
			.ok_or(Error::NoSuchDevice)
	}

	pub fn is_mounted(&self, name: &str) -> bool {
		self.mounts.lock().iter().any(|m| m.name == name)
	}
}

/// The kernel's single process-wide mount table.
pub static MOUNTS: MountTable = MountTable::new();
