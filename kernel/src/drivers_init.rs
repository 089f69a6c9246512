// SPDX-License-Identifier: GPL-2.0

//! Wires already-registered devices into the mounted filesystem namespace.
//!
//! The kernel crate cannot depend on the concrete `drivers` crate (that
//! crate depends on this one, to implement [`crate::device::DeviceOps`]),
//! so built-in drivers register themselves with [`crate::device::register`]
//! from the final kernel binary before [`crate::kernel_main`] runs. This
//! module's only job is to mount whatever ended up in the device registry
//! under its own name, so `open("kbd:")`, `open("ttyS0:")`, and so on work
//! the moment userspace starts.

use crate::error::Result;
use crate::{info, warn};

/// Well-known built-in device names, mounted if present in the registry.
const KNOWN_DEVICES: &[&str] = &["kbd", "ttyS0", "null", "zero", "full", "ram0"];

/// Mount every registered built-in device under its own name.
pub fn init_drivers() -> Result<()> {
	for name in KNOWN_DEVICES {
		match crate::device::find(name) {
			Some(device) => {
				crate::fs::mount_device(name, device)?;
				info!("mounted device '{}'", name);
			}
			None => warn!("built-in device '{}' not registered, skipping", name),
		}
	}
	Ok(())
}
