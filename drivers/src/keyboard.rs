// SPDX-License-Identifier: GPL-2.0

//! PS/2 keyboard driver: a character device fed by the IRQ1 handler, which
//! converts scancodes to ASCII and buffers them for `read`.

#![no_std]

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;

use kernel::device::{DeviceOps, IoDirection};
use kernel::error::{Error, Result};
use kernel::interrupt::{IrqReturn, request_irq};
use kernel::sync::Spinlock;

struct KeyboardState {
	buffer: VecDeque<u8>,
	shift: bool,
	ctrl: bool,
	alt: bool,
	caps_lock: bool,
}

impl KeyboardState {
	const fn new() -> Self {
		Self {
			buffer: VecDeque::new(),
			shift: false,
			ctrl: false,
			alt: false,
			caps_lock: false,
		}
	}
}

static STATE: Spinlock<KeyboardState> = Spinlock::new(KeyboardState::new());

struct KeyboardDevice;

impl DeviceOps for KeyboardDevice {
	fn block_size(&self) -> usize {
		0
	}

	fn block_count(&self) -> u64 {
		0
	}

	fn io(&self, dir: IoDirection, _offset: u64, buf: &mut [u8]) -> Result<usize> {
		if dir == IoDirection::Write {
			return Err(Error::NotImplemented);
		}
		let mut state = STATE.lock();
		let mut n = 0;
		while n < buf.len() {
			match state.buffer.pop_front() {
				Some(byte) => {
					buf[n] = byte;
					n += 1;
				}
				None => break,
			}
		}
		Ok(n)
	}
}

/// Register the PS/2 keyboard device and wire its IRQ1 handler.
pub fn register() -> Result<()> {
	kernel::device::register(String::from("kbd"), Arc::new(KeyboardDevice))?;
	request_irq(1, keyboard_irq, 0, "keyboard", core::ptr::null_mut())?;
	Ok(())
}

fn keyboard_irq(_irq: u32, _dev_id: *mut u8) -> IrqReturn {
	let scancode = unsafe { kernel::arch::x86_64::port::inb(0x60) };
	let mut state = STATE.lock();
	process_scancode(&mut state, scancode);
	IrqReturn::Handled
}

const RELEASED_MASK: u8 = 0x80;
const LEFT_SHIFT: u8 = 42;
const RIGHT_SHIFT: u8 = 54;
const CTRL: u8 = 29;
const ALT: u8 = 56;
const CAPS_LOCK: u8 = 58;

fn process_scancode(state: &mut KeyboardState, scancode: u8) {
	let released = scancode & RELEASED_MASK != 0;
	let code = scancode & !RELEASED_MASK;

	match code {
		LEFT_SHIFT | RIGHT_SHIFT => {
			state.shift = !released;
			return;
		}
		CTRL => {
			state.ctrl = !released;
			return;
		}
		ALT => {
			state.alt = !released;
			return;
		}
		CAPS_LOCK if !released => {
			state.caps_lock = !state.caps_lock;
			return;
		}
		_ => {}
	}

	if released {
		return;
	}

	if let Some(ascii) = scancode_to_ascii(code, state.shift, state.caps_lock) {
		if state.ctrl && ascii.is_ascii_alphabetic() {
			state.buffer.push_back(ascii.to_ascii_uppercase() - b'@');
		} else {
			state.buffer.push_back(ascii);
		}
	}
}

fn scancode_to_ascii(code: u8, shift: bool, caps_lock: bool) -> Option<u8> {
	if code as usize >= SCANCODE_TO_ASCII.len() {
		return None;
	}
	let (lower, upper) = SCANCODE_TO_ASCII[code as usize];
	if lower == 0 {
		return None;
	}
	let use_upper = shift ^ (caps_lock && lower.is_ascii_alphabetic());
	Some(if use_upper { upper } else { lower })
}

/// `(lowercase/unshifted, uppercase/shifted)` ASCII for each PS/2 set-1 scancode.
const SCANCODE_TO_ASCII: [(u8, u8); 59] = [
	(0, 0),
	(27, 27),
	(b'1', b'!'),
	(b'2', b'@'),
	(b'3', b'#'),
	(b'4', b'$'),
	(b'5', b'%'),
	(b'6', b'^'),
	(b'7', b'&'),
	(b'8', b'*'),
	(b'9', b'('),
	(b'0', b')'),
	(b'-', b'_'),
	(b'=', b'+'),
	(8, 8),
	(b'\t', b'\t'),
	(b'q', b'Q'),
	(b'w', b'W'),
	(b'e', b'E'),
	(b'r', b'R'),
	(b't', b'T'),
	(b'y', b'Y'),
	(b'u', b'U'),
	(b'i', b'I'),
	(b'o', b'O'),
	(b'p', b'P'),
	(b'[', b'{'),
	(b']', b'}'),
	(b'\n', b'\n'),
	(0, 0), // 29 ctrl, handled separately
	(b'a', b'A'),
	(b's', b'S'),
	(b'd', b'D'),
	(b'f', b'F'),
	(b'g', b'G'),
	(b'h', b'H'),
	(b'j', b'J'),
	(b'k', b'K'),
	(b'l', b'L'),
	(b';', b':'),
	(b'\'', b'"'),
	(b'`', b'~'),
	(0, 0), // 42 left shift
	(b'\\', b'|'),
	(b'z', b'Z'),
	(b'x', b'X'),
	(b'c', b'C'),
	(b'v', b'V'),
	(b'b', b'B'),
	(b'n', b'N'),
	(b'm', b'M'),
	(b',', b'<'),
	(b'.', b'>'),
	(b'/', b'?'),
	(0, 0), // 54 right shift
	(b'*', b'*'),
	(0, 0), // 56 alt
	(b' ', b' '),
];
