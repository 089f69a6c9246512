// SPDX-License-Identifier: GPL-2.0

//! A small in-memory, read-only filesystem used to mount the end-to-end
//! scenarios of §8 and to exercise the vnode contract in tests. The real
//! kernel's on-disk demo filesystem format is out of scope (§1); this
//! supplies the same vnode-level behaviour -- including `readdir`, which
//! the distilled core's own "new" vnode layer left `ENOSYS` (§9 Open
//! Questions) -- without depending on any concrete disk layout.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::fs::openfile::OpenFlags;
use crate::fs::vnode::{DirEntry, DirentType, Stat, Vnode, VnodeOps};
use crate::sync::Spinlock;

struct FileNode {
	content: Spinlock<Vec<u8>>,
}

impl VnodeOps for FileNode {
	fn check_open(&self, flags: OpenFlags) -> Result<()> {
		if flags.can_write() {
			return Err(Error::ReadOnly);
		}
		Ok(())
	}

	fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
		let content = self.content.lock();
		let offset = offset as usize;
		if offset >= content.len() {
			return Ok(0);
		}
		let n = core::cmp::min(buf.len(), content.len() - offset);
		buf[..n].copy_from_slice(&content[offset..offset + n]);
		Ok(n)
	}

	fn write(&self, _offset: u64, _buf: &[u8]) -> Result<usize> {
		Err(Error::ReadOnly)
	}

	fn is_seekable(&self) -> bool {
		true
	}

	fn dirent_type(&self) -> DirentType {
		DirentType::Regular
	}

	fn follow(&self, _name: &str) -> Result<Vnode> {
		Err(Error::NotDirectory)
	}

	fn stat(&self) -> Result<Stat> {
		Ok(Stat {
			size: self.content.lock().len() as u64,
			is_directory: false,
		})
	}
}

struct DirNode {
	entries: Spinlock<Vec<(String, Vnode)>>,
}

impl VnodeOps for DirNode {
	fn check_open(&self, flags: OpenFlags) -> Result<()> {
		if flags.can_write() {
			return Err(Error::IsDirectory);
		}
		Ok(())
	}

	fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
		Err(Error::IsDirectory)
	}

	fn write(&self, _offset: u64, _buf: &[u8]) -> Result<usize> {
		Err(Error::IsDirectory)
	}

	fn readdir(&self, index: usize) -> Result<Option<DirEntry>> {
		let entries = self.entries.lock();
		Ok(entries.get(index).map(|(name, vnode)| DirEntry {
			name: name.clone(),
			kind: vnode.dirent_type(),
		}))
	}

	fn dirent_type(&self) -> DirentType {
		DirentType::Directory
	}

	fn follow(&self, name: &str) -> Result<Vnode> {
		self.entries
			.lock()
			.iter()
			.find(|(n, _)| n == name)
			.map(|(_, v)| v.clone())
			.ok_or(Error::NoSuchEntry)
	}

	fn stat(&self) -> Result<Stat> {
		Ok(Stat {
			size: 0,
			is_directory: true,
		})
	}
}

/// A directory under construction, before it is sealed into a [`Vnode`].
pub struct DirBuilder {
	entries: Vec<(String, Vnode)>,
}

impl DirBuilder {
	pub fn new() -> Self {
		Self { entries: Vec::new() }
	}

	pub fn file(mut self, name: &str, content: &[u8]) -> Self {
		let node: Vnode = Arc::new(FileNode {
			content: Spinlock::new(content.to_vec()),
		});
		self.entries.push((name.to_string(), node));
		self
	}

	pub fn dir(mut self, name: &str, subdir: Vnode) -> Self {
		self.entries.push((name.to_string(), subdir));
		self
	}

	pub fn build(self) -> Vnode {
		Arc::new(DirNode {
			entries: Spinlock::new(self.entries),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fs::mount::MountTable;
	use crate::fs::openfile;
	use crate::fs::path::resolve;

	fn demo_root() -> Vnode {
		let subdir = DirBuilder::new().build();
		DirBuilder::new()
			.dir("test", DirBuilder::new().file("root file.txt", b"ROOT FILE").dir("subdir", subdir).build())
			.build()
	}

	fn mount(mounts: &MountTable, name: &str, root: Vnode) {
		// Wrap the root in a trivial open file so MountTable's (name, open
		// file) pair (§3) is satisfied without a real backing device.
		let file = Arc::new(openfile::OpenFile::for_root(root));
		mounts.mount(name, file).unwrap();
	}

	#[test_case]
	fn read_file_scenario() {
		let mounts = MountTable::new();
		mount(&mounts, "hd0", demo_root());
		let vnode = resolve(&mounts, "hd0:/test/root file.txt").unwrap();
		let mut buf = [0u8; 9];
		let n = vnode.read(0, &mut buf).unwrap();
		assert_eq!(n, 9);
		assert_eq!(&buf, b"ROOT FILE");
	}

	#[test_case]
	fn read_past_end_scenario() {
		let mounts = MountTable::new();
		mount(&mounts, "hd0", demo_root());
		let vnode = resolve(&mounts, "hd0:/test/root file.txt").unwrap();
		let mut buf = [0u8; 20];
		let n = vnode.read(5, &mut buf).unwrap();
		assert_eq!(n, 4);
		assert_eq!(&buf[..4], b"FILE");
	}

	#[test_case]
	fn backtrack_past_root_scenario() {
		let mounts = MountTable::new();
		mount(&mounts, "hd0", demo_root());
		let vnode = resolve(&mounts, "hd0:/test/subdir/../../../../../..").unwrap();
		assert!(vnode.is_directory());
	}

	#[test_case]
	fn readdir_is_wired_through() {
		let mounts = MountTable::new();
		mount(&mounts, "hd0", demo_root());
		let vnode = resolve(&mounts, "hd0:/test").unwrap();
		let first = vnode.readdir(0).unwrap();
		assert!(first.is_some());
	}
}
