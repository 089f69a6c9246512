// SPDX-License-Identifier: GPL-2.0

//! Path syntax and resolution (§4.F).
//!
//! Paths take the absolute form `<device>:<path>`. Components are
//! separated by `/`; repeated and trailing slashes collapse; `.` means
//! stay, `..` means pop (never above the device root, silently, matching
//! Linux). Filenames may contain neither `/`, `\`, nor `:`.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::fs::mount::MountTable;
use crate::fs::vnode::Vnode;

pub const MAX_COMPONENT_LEN: usize = 256;
pub const MAX_PATH_LEN: usize = 2000;

enum Component<'a> {
	CurDir,
	ParentDir,
	Normal(&'a str),
}

fn split_device(path: &str) -> Result<(&str, &str)> {
	if path.len() > MAX_PATH_LEN {
		return Err(Error::NameTooLong);
	}
	let idx = path.find(':').ok_or(Error::InvalidArgument)?;
	Ok((&path[..idx], &path[idx + 1..]))
}

fn components(rest: &str) -> Result<Vec<Component<'_>>> {
	let mut out = Vec::new();
	for piece in rest.split('/') {
		if piece.is_empty() {
			continue; // collapses repeated and trailing slashes
		}
		if piece.len() > MAX_COMPONENT_LEN {
			return Err(Error::NameTooLong);
		}
		if piece.contains('\\') || piece.contains(':') {
			return Err(Error::InvalidArgument);
		}
		out.push(match piece {
			"." => Component::CurDir,
			".." => Component::ParentDir,
			name => Component::Normal(name),
		});
	}
	Ok(out)
}

/// Resolve `path` against `mounts`, returning the final vnode with one
/// increment. Every parent vnode visited along the way is decremented
/// exactly once when the resolution's scratch stack drops.
pub fn resolve(mounts: &MountTable, path: &str) -> Result<Vnode> {
	let (device, rest) = split_device(path)?;
	let mut current = mounts.root(device)?;
	let mut stack: Vec<Vnode> = Vec::new();

	for comp in components(rest)? {
		match comp {
			Component::CurDir => {}
			Component::ParentDir => {
				if let Some(parent) = stack.pop() {
					current = parent;
				}
				// `..` above the device root is a silent no-op.
			}
			Component::Normal(name) => {
				if !current.is_directory() {
					return Err(Error::NotDirectory);
				}
				let next = current.follow(name)?;
				stack.push(current);
				current = next;
			}
		}
	}
	Ok(current)
}

/// Resolve `path` one component short of the leaf, for `open(..., O_CREAT)`
/// against a name that does not exist yet. Returns the parent directory
/// vnode and the leaf's name.
pub fn resolve_parent<'a>(mounts: &MountTable, path: &'a str) -> Result<(Vnode, String)> {
	let (device, rest) = split_device(path)?;
	let mut current = mounts.root(device)?;
	let mut stack: Vec<Vnode> = Vec::new();
	let comps = components(rest)?;

	let mut leaf: Option<&str> = None;
	for (i, comp) in comps.iter().enumerate() {
		let is_last = i == comps.len() - 1;
		match comp {
			Component::CurDir => {}
			Component::ParentDir => {
				if let Some(parent) = stack.pop() {
					current = parent;
				}
			}
			Component::Normal(name) => {
				if is_last {
					leaf = Some(name);
					break;
				}
				if !current.is_directory() {
					return Err(Error::NotDirectory);
				}
				let next = current.follow(name)?;
				stack.push(current);
				current = next;
			}
		}
	}

	let leaf = leaf.ok_or(Error::InvalidArgument)?;
	Ok((current, leaf.to_string()))
}

/// Canonicalise a path the way resolution implicitly does: collapse
/// repeated/trailing slashes, drop `.`, resolve `..` against the path
/// itself (not the mount table) so `canonicalise(p)` is a pure string
/// transform whose resolution is equal to resolving `p` (§8).
pub fn canonicalise(path: &str) -> Result<String> {
	let (device, rest) = split_device(path)?;
	let mut stack: Vec<&str> = Vec::new();
	for comp in components(rest)? {
		match comp {
			Component::CurDir => {}
			Component::ParentDir => {
				stack.pop();
			}
			Component::Normal(name) => stack.push(name),
		}
	}
	let mut out = String::new();
	out.push_str(device);
	out.push(':');
	out.push('/');
	for (i, part) in stack.iter().enumerate() {
		if i > 0 {
			out.push('/');
		}
		out.push_str(part);
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test_case]
	fn canonicalise_collapses_slashes_and_dots() {
		assert_eq!(
			canonicalise("hd0://a//./b/../c/").unwrap(),
			"hd0:/a/c".to_string()
		);
	}

	#[test_case]
	fn canonicalise_parent_above_root_is_noop() {
		assert_eq!(canonicalise("hd0:/a/../../../..").unwrap(), "hd0:/".to_string());
	}

	#[test_case]
	fn rejects_overlong_component() {
		let long = "a".repeat(MAX_COMPONENT_LEN + 1);
		let path = alloc::format!("hd0:/{}", long);
		assert_eq!(components(&path[4..]).unwrap_err(), Error::NameTooLong);
	}
}
