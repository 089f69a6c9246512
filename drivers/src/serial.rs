// SPDX-License-Identifier: GPL-2.0

//! Serial tty driver (16550 UART on COM2).
//!
//! The raw console sink in `kernel::console` already bit-bangs COM1 for
//! early boot output and panic messages; this driver owns COM2 instead so
//! a user-facing tty device can exist without contending with the kernel's
//! own log port.

#![no_std]

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;

use kernel::arch::x86_64::port::{inb, outb};
use kernel::device::{DeviceOps, IoDirection, Termios};
use kernel::error::Result;
use kernel::interrupt::{IrqReturn, request_irq};
use kernel::sync::Spinlock;

const COM2_BASE: u16 = 0x2F8;

const UART_DATA: u16 = 0;
const UART_IER: u16 = 1;
const UART_FCR: u16 = 2;
const UART_LCR: u16 = 3;
const UART_MCR: u16 = 4;
const UART_LSR: u16 = 5;

const LSR_DATA_READY: u8 = 0x01;
const LSR_THR_EMPTY: u8 = 0x20;

fn port_init() {
	unsafe {
		outb(COM2_BASE + UART_IER, 0x00); // disable interrupts during setup
		outb(COM2_BASE + UART_LCR, 0x80); // enable divisor latch
		outb(COM2_BASE + UART_DATA, 0x01); // divisor low byte: 115200 baud
		outb(COM2_BASE + UART_IER, 0x00); // divisor high byte
		outb(COM2_BASE + UART_LCR, 0x03); // 8 bits, no parity, one stop bit
		outb(COM2_BASE + UART_FCR, 0xC7); // enable + clear FIFOs, 14-byte threshold
		outb(COM2_BASE + UART_MCR, 0x0B); // DTR, RTS, OUT2 (enables IRQs on real hardware)
		outb(COM2_BASE + UART_IER, 0x01); // enable receive-data-available interrupt
	}
}

fn is_receive_ready() -> bool {
	unsafe { inb(COM2_BASE + UART_LSR) & LSR_DATA_READY != 0 }
}

fn is_transmit_ready() -> bool {
	unsafe { inb(COM2_BASE + UART_LSR) & LSR_THR_EMPTY != 0 }
}

fn read_byte() -> u8 {
	unsafe { inb(COM2_BASE + UART_DATA) }
}

fn write_byte(byte: u8) {
	while !is_transmit_ready() {
		core::hint::spin_loop();
	}
	unsafe { outb(COM2_BASE + UART_DATA, byte) };
}

struct SerialState {
	rx: VecDeque<u8>,
	termios: Termios,
}

static STATE: Spinlock<SerialState> = Spinlock::new(SerialState {
	rx: VecDeque::new(),
	termios: Termios {
		input_flags: 0,
		output_flags: 0,
		control_flags: 0,
		local_flags: 0,
	},
});

struct SerialDevice;

impl DeviceOps for SerialDevice {
	fn block_size(&self) -> usize {
		0
	}

	fn block_count(&self) -> u64 {
		0
	}

	fn termios(&self) -> Option<Termios> {
		Some(STATE.lock().termios)
	}

	fn set_termios(&self, termios: Termios) -> Result<()> {
		STATE.lock().termios = termios;
		Ok(())
	}

	fn io(&self, dir: IoDirection, _offset: u64, buf: &mut [u8]) -> Result<usize> {
		match dir {
			IoDirection::Read => {
				let mut state = STATE.lock();
				let mut n = 0;
				while n < buf.len() {
					match state.rx.pop_front() {
						Some(byte) => {
							buf[n] = byte;
							n += 1;
						}
						None => break,
					}
				}
				Ok(n)
			}
			IoDirection::Write => {
				for &byte in buf.iter() {
					write_byte(byte);
				}
				Ok(buf.len())
			}
		}
	}
}

/// Register the COM2 serial tty and wire its IRQ3 handler.
pub fn register() -> Result<()> {
	port_init();
	kernel::device::register(String::from("ttyS0"), Arc::new(SerialDevice))?;
	request_irq(3, serial_irq, 0, "serial", core::ptr::null_mut())?;
	Ok(())
}

fn serial_irq(_irq: u32, _dev_id: *mut u8) -> IrqReturn {
	let mut state = STATE.lock();
	while is_receive_ready() {
		state.rx.push_back(read_byte());
	}
	IrqReturn::Handled
}
