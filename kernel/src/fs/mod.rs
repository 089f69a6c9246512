// SPDX-License-Identifier: GPL-2.0

//! Virtual filesystem layer (component F, §3, §4.F).
//!
//! Uniformly exposes block devices, character devices, and on-disk
//! filesystems through a path-addressed name tree: the mount table maps a
//! `device:` prefix to a vnode, path resolution walks `follow()` calls
//! across that vnode's tree, and an open file layers a seek position and
//! status flags over the vnode the path resolved to.

pub mod demofs;
pub mod devfs;
pub mod mount;
pub mod openfile;
pub mod path;
pub mod vnode;

pub use mount::MOUNTS;
pub use openfile::{open, OpenFile, OpenFlags};
pub use vnode::{DirEntry, DirentType, Stat, Vnode, VnodeOps};

use alloc::sync::Arc;

use crate::device::Device;
use crate::error::Result;

/// Register `device` as a mount point in its own right (bare device
/// mounts, ttys, `raw-<fsname>` devices backing a filesystem).
pub fn mount_device(name: &str, device: Arc<Device>) -> Result<()> {
	let vnode = devfs::DeviceVnode::new(device);
	let file = Arc::new(OpenFile::for_root(vnode));
	MOUNTS.mount(name, file)
}

/// Mount an in-memory filesystem's root vnode under `name`.
pub fn mount_root(name: &str, root: Vnode) -> Result<()> {
	let file = Arc::new(OpenFile::for_root(root));
	MOUNTS.mount(name, file)
}
