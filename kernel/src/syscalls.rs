// SPDX-License-Identifier: GPL-2.0

//! The system-call surface (§6): 14 synchronous calls, numbered 0-13,
//! reached through `syscall`/`sysret` on x86_64. Every pointer-bearing
//! argument is validated against the calling process's own address space
//! before the kernel dereferences it -- a user cannot hand the kernel a
//! kernel address, an unmapped address, or (for an out-parameter) a
//! read-only one and have it silently succeed.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::device::Termios;
use crate::error::{Error, Result};
use crate::fs::openfile::OpenFlags;
use crate::fs::OpenFile;
use crate::memory::vas::{PageFlags, Vas};
use crate::process::Process;
use crate::types::{VirtAddr, PAGE_SIZE};

/// Call numbers (§6). The surface is closed: anything outside 0..=13 is
/// `NotImplemented`, not a Linux-compatible passthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
	Yield = 0,
	Terminate = 1,
	Open = 2,
	Read = 3,
	Write = 4,
	Close = 5,
	Lseek = 6,
	Sbrk = 7,
	Isatty = 8,
	Dup = 9,
	Dup2 = 10,
	Dup3 = 11,
	Tcgetattr = 12,
	Tcsetattr = 13,
}

/// The six general-purpose argument registers `syscall_entry` is handed.
#[derive(Debug)]
pub struct SyscallArgs {
	pub syscall_num: u64,
	pub arg0: u64,
	pub arg1: u64,
	pub arg2: u64,
	pub arg3: u64,
	pub arg4: u64,
	pub arg5: u64,
}

/// Upper bound of the canonical lower half, where [`KERNEL_PML4_START`]
/// (§4.B) begins the shared kernel mappings. No user pointer may resolve
/// to an address at or above this.
///
/// [`KERNEL_PML4_START`]: crate::memory::vas
const USER_SPACE_END: usize = 0x0000_8000_0000_0000;

/// Longest path `open` accepts from a user pointer before giving up.
const PATH_MAX: usize = 256;

/// The process owning the currently running thread, or `NoSuchProcess`
/// for a syscall reached from a freestanding kernel thread (cannot
/// happen on the real syscall path, but keeps this total).
fn current_process() -> Result<Arc<Process>> {
	crate::scheduler::current_thread()
		.and_then(|t| t.process.clone())
		.ok_or(Error::NoSuchProcess)
}

/// Confirm every page backing `[addr, addr+len)` lies in the user half,
/// is mapped with `USER` and either `PRESENT` or `ALLOCATE_ON_ACCESS`,
/// and -- when `write` is set -- is writable (plain `WRITABLE` or a
/// copy-on-write page the fault handler will duplicate on the actual
/// write). `len == 0` trivially validates.
fn check_user_range(vas: &Vas, addr: VirtAddr, len: usize, write: bool) -> Result<()> {
	if len == 0 {
		return Ok(());
	}
	let start = addr.as_usize();
	let end = start.checked_add(len).ok_or(Error::BadAddress)?;
	if end > USER_SPACE_END {
		return Err(Error::BadAddress);
	}

	let first_page = start & !(PAGE_SIZE - 1);
	let last_page = (end - 1) & !(PAGE_SIZE - 1);
	let mut page = first_page;
	loop {
		let (_, flags) = vas.get_entry(VirtAddr::new(page)).ok_or(Error::BadAddress)?;
		if !flags.contains(PageFlags::USER) {
			return Err(Error::BadAddress);
		}
		if !(flags.contains(PageFlags::PRESENT) || flags.contains(PageFlags::ALLOCATE_ON_ACCESS)) {
			return Err(Error::BadAddress);
		}
		if write && !(flags.contains(PageFlags::WRITABLE) || flags.contains(PageFlags::COPY_ON_WRITE)) {
			return Err(Error::BadAddress);
		}
		if page == last_page {
			break;
		}
		page += PAGE_SIZE;
	}
	Ok(())
}

/// Copy `len` bytes out of the calling process's address space.
fn copy_from_user(process: &Process, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
	check_user_range(&process.vas, addr, len, false)?;
	let mut buf = vec![0u8; len];
	unsafe {
		core::ptr::copy_nonoverlapping(addr.as_ptr::<u8>(), buf.as_mut_ptr(), len);
	}
	Ok(buf)
}

/// Copy `data` into the calling process's address space.
fn copy_to_user(process: &Process, addr: VirtAddr, data: &[u8]) -> Result<()> {
	check_user_range(&process.vas, addr, data.len(), true)?;
	unsafe {
		core::ptr::copy_nonoverlapping(data.as_ptr(), addr.as_mut_ptr::<u8>(), data.len());
	}
	Ok(())
}

/// Copy a NUL-terminated path string out of user space, one byte (and
/// one validation) at a time so a path shorter than a page never forces
/// validating memory past its end.
fn copy_path_from_user(process: &Process, addr: VirtAddr) -> Result<String> {
	let mut bytes = Vec::new();
	let mut cursor = addr.as_usize();
	while bytes.len() < PATH_MAX {
		let byte_addr = VirtAddr::new(cursor);
		check_user_range(&process.vas, byte_addr, 1, false)?;
		let byte = unsafe { *byte_addr.as_ptr::<u8>() };
		if byte == 0 {
			return String::from_utf8(bytes).map_err(|_| Error::InvalidArgument);
		}
		bytes.push(byte);
		cursor += 1;
	}
	Err(Error::NameTooLong)
}

fn termios_to_bytes(t: Termios) -> [u8; 16] {
	let mut out = [0u8; 16];
	out[0..4].copy_from_slice(&t.input_flags.to_ne_bytes());
	out[4..8].copy_from_slice(&t.output_flags.to_ne_bytes());
	out[8..12].copy_from_slice(&t.control_flags.to_ne_bytes());
	out[12..16].copy_from_slice(&t.local_flags.to_ne_bytes());
	out
}

fn termios_from_bytes(raw: &[u8]) -> Termios {
	let word = |i: usize| u32::from_ne_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
	Termios {
		input_flags: word(0),
		output_flags: word(4),
		control_flags: word(8),
		local_flags: word(12),
	}
}

/// Dispatch one syscall and reduce its `Result` into the raw return
/// value `syscall_entry` hands back to user space: the value itself on
/// success, or the negated errno on failure (§7).
pub fn handle_syscall(args: SyscallArgs) -> u64 {
	let result = match args.syscall_num {
		0 => sys_yield(),
		1 => crate::scheduler::terminate_current(),
		2 => sys_open(args.arg0, args.arg1, args.arg2, args.arg3),
		3 => sys_read(args.arg0, args.arg1, args.arg2, args.arg3),
		4 => sys_write(args.arg0, args.arg1, args.arg2, args.arg3),
		5 => sys_close(args.arg0),
		6 => sys_lseek(args.arg0, args.arg1, args.arg2),
		7 => sys_sbrk(args.arg0, args.arg1, args.arg2, args.arg3),
		8 => sys_isatty(args.arg0),
		9 => sys_dup(args.arg0),
		10 => sys_dup2(args.arg0, args.arg1),
		11 => sys_dup3(args.arg0, args.arg1, args.arg2),
		12 => sys_tcgetattr(args.arg0, args.arg1),
		13 => sys_tcsetattr(args.arg0, args.arg1, args.arg2),
		_ => Err(Error::NotImplemented),
	};

	match result {
		Ok(value) => value,
		Err(error) => (-error.to_errno()) as u64,
	}
}

fn sys_yield() -> Result<u64> {
	crate::scheduler::yield_now();
	Ok(0)
}

fn sys_open(path_ptr: u64, flags: u64, mode: u64, out_fd_ptr: u64) -> Result<u64> {
	let process = current_process()?;
	let path = copy_path_from_user(&process, VirtAddr::new(path_ptr as usize))?;
	let flags = OpenFlags::from_bits_truncate(flags as u32);

	let file = crate::fs::open(&path, flags, mode as u32)?;
	let close_on_exec = flags.contains(OpenFlags::CLOEXEC);
	let fd = process.fds().install_fd(file, close_on_exec)?;

	copy_to_user(&process, VirtAddr::new(out_fd_ptr as usize), &fd.to_ne_bytes())?;
	Ok(0)
}

fn sys_read(buf_ptr: u64, len: u64, fd: u64, out_bytes_ptr: u64) -> Result<u64> {
	let process = current_process()?;
	let file = process.fds().get_fd(fd as i32)?;
	let len = len as usize;

	let mut kernel_buf = vec![0u8; len];
	let n = file.read(&mut kernel_buf)?;
	copy_to_user(&process, VirtAddr::new(buf_ptr as usize), &kernel_buf[..n])?;
	copy_to_user(&process, VirtAddr::new(out_bytes_ptr as usize), &(n as u64).to_ne_bytes())?;
	Ok(0)
}

fn sys_write(buf_ptr: u64, len: u64, fd: u64, out_bytes_ptr: u64) -> Result<u64> {
	let process = current_process()?;
	let kernel_buf = copy_from_user(&process, VirtAddr::new(buf_ptr as usize), len as usize)?;

	let file = process.fds().get_fd(fd as i32)?;
	let n = file.write(&kernel_buf)?;
	copy_to_user(&process, VirtAddr::new(out_bytes_ptr as usize), &(n as u64).to_ne_bytes())?;
	Ok(0)
}

fn sys_close(fd: u64) -> Result<u64> {
	let process = current_process()?;
	process.fds().close_fd(fd as i32)?;
	Ok(0)
}

/// `whence` values understood by `lseek` (§6): SET, CUR, END.
const SEEK_SET: u64 = 0;
const SEEK_CUR: u64 = 1;
const SEEK_END: u64 = 2;

fn sys_lseek(fd: u64, offset_ptr: u64, whence: u64) -> Result<u64> {
	let process = current_process()?;
	let offset_addr = VirtAddr::new(offset_ptr as usize);
	let raw = copy_from_user(&process, offset_addr, 8)?;
	let mut bytes = [0u8; 8];
	bytes.copy_from_slice(&raw);
	let offset = i64::from_ne_bytes(bytes);

	let file = process.fds().get_fd(fd as i32)?;
	let base: i64 = match whence {
		SEEK_SET => 0,
		SEEK_CUR => file.pos() as i64,
		SEEK_END => file.vnode().stat()?.size as i64,
		_ => return Err(Error::InvalidArgument),
	};
	let new_pos = base.checked_add(offset).ok_or(Error::InvalidArgument)?;
	if new_pos < 0 {
		return Err(Error::InvalidArgument);
	}
	file.set_pos(new_pos as u64);

	copy_to_user(&process, offset_addr, &new_pos.to_ne_bytes())?;
	Ok(0)
}

fn sys_sbrk(delta_bytes: u64, sign: u64, out_prev_ptr: u64, out_new_ptr: u64) -> Result<u64> {
	let process = current_process()?;
	let magnitude = delta_bytes as isize;
	let increment = if sign == 0 { magnitude } else { -magnitude };

	let prev = process.sbrk(increment)?;
	let new = if increment >= 0 {
		prev.checked_add(increment as usize)
	} else {
		prev.checked_sub((-increment) as usize)
	}
	.ok_or(Error::OutOfMemory)?;

	copy_to_user(&process, VirtAddr::new(out_prev_ptr as usize), &(prev as u64).to_ne_bytes())?;
	copy_to_user(&process, VirtAddr::new(out_new_ptr as usize), &(new as u64).to_ne_bytes())?;
	Ok(0)
}

fn sys_isatty(fd: u64) -> Result<u64> {
	let process = current_process()?;
	let file = process.fds().get_fd(fd as i32)?;
	if file.vnode().is_tty() {
		Ok(0)
	} else {
		Err(Error::NotTty)
	}
}

fn sys_dup(oldfd: u64) -> Result<u64> {
	let process = current_process()?;
	let mut fds = process.fds();
	let file = fds.get_fd(oldfd as i32)?;
	let newfd = fds.install_fd(file, false)?;
	Ok(newfd as u64)
}

fn sys_dup2(oldfd: u64, newfd: u64) -> Result<u64> {
	let process = current_process()?;
	let mut fds = process.fds();
	let oldfd = oldfd as i32;
	let newfd_i = newfd as i32;
	if oldfd == newfd_i {
		fds.get_fd(oldfd)?; // still validates oldfd is open
		return Ok(newfd);
	}
	let file = fds.get_fd(oldfd)?;
	let _ = fds.close_fd(newfd_i);
	fds.install_fd_at(newfd_i, file, false)?;
	Ok(newfd)
}

fn sys_dup3(oldfd: u64, newfd: u64, flags: u64) -> Result<u64> {
	let process = current_process()?;
	let mut fds = process.fds();
	let oldfd = oldfd as i32;
	let newfd_i = newfd as i32;
	if oldfd == newfd_i {
		return Err(Error::InvalidArgument);
	}
	let file = fds.get_fd(oldfd)?;
	let close_on_exec = (flags & OpenFlags::CLOEXEC.bits() as u64) != 0;
	let _ = fds.close_fd(newfd_i);
	fds.install_fd_at(newfd_i, file, close_on_exec)?;
	Ok(newfd)
}

/// Only `TCSANOW` (apply immediately, no draining semantics to model) is accepted.
const TCSANOW: u64 = 0;

fn sys_tcgetattr(fd: u64, termios_ptr: u64) -> Result<u64> {
	let process = current_process()?;
	let file = process.fds().get_fd(fd as i32)?;
	let termios = file.vnode().termios()?;
	copy_to_user(&process, VirtAddr::new(termios_ptr as usize), &termios_to_bytes(termios))?;
	Ok(0)
}

fn sys_tcsetattr(fd: u64, termios_ptr: u64, action: u64) -> Result<u64> {
	if action != TCSANOW {
		return Err(Error::InvalidArgument);
	}
	let process = current_process()?;
	let file = process.fds().get_fd(fd as i32)?;
	let raw = copy_from_user(&process, VirtAddr::new(termios_ptr as usize), 16)?;
	file.vnode().set_termios(termios_from_bytes(&raw))?;
	Ok(0)
}

/// Architecture-specific syscall entry point.
#[cfg(target_arch = "x86_64")]
pub mod arch {
	use super::*;

	/// Landed here directly by the `syscall` instruction's trampoline in
	/// `interrupt.rs`; never called from Rust except by `init_syscalls`
	/// installing its address in `LSTAR`.
	#[no_mangle]
	pub extern "C" fn syscall_entry(syscall_num: u64, arg0: u64, arg1: u64, arg2: u64, arg3: u64, arg4: u64, arg5: u64) -> u64 {
		let args = SyscallArgs {
			syscall_num,
			arg0,
			arg1,
			arg2,
			arg3,
			arg4,
			arg5,
		};

		handle_syscall(args)
	}
}

/// Program the `SYSCALL`/`SYSRET` MSRs: `STAR`'s segment selectors,
/// `LSTAR`'s entry point, `SFMASK`'s flag mask, and `EFER`'s enable bit.
pub fn init_syscalls() -> Result<()> {
	#[cfg(target_arch = "x86_64")]
	unsafe {
		let star_msr = 0xC0000081u32;
		let lstar_msr = 0xC0000082u32;
		let sfmask_msr = 0xC0000084u32;

		// [63:48] user CS (with RPL 3, SYSRET adds 16 for SS), [47:32] kernel CS.
		let star_value = (0x1Bu64 << 48) | (0x08u64 << 32);
		core::arch::asm!(
		    "wrmsr",
		    in("ecx") star_msr,
		    in("eax") (star_value & 0xFFFFFFFF) as u32,
		    in("edx") (star_value >> 32) as u32,
		    options(nostack, preserves_flags)
		);

		let entry_addr = arch::syscall_entry as *const () as u64;
		core::arch::asm!(
		    "wrmsr",
		    in("ecx") lstar_msr,
		    in("eax") (entry_addr & 0xFFFFFFFF) as u32,
		    in("edx") (entry_addr >> 32) as u32,
		    options(nostack, preserves_flags)
		);

		core::arch::asm!(
		    "wrmsr",
		    in("ecx") sfmask_msr,
		    in("eax") 0x200u32, // mask IF during syscall
		    in("edx") 0u32,
		    options(nostack, preserves_flags)
		);

		let efer_msr = 0xC0000080u32;
		let mut efer_low: u32;
		let efer_high: u32;
		core::arch::asm!(
		    "rdmsr",
		    in("ecx") efer_msr,
		    out("eax") efer_low,
		    out("edx") efer_high,
		    options(nostack, preserves_flags)
		);
		efer_low |= 1; // SCE
		core::arch::asm!(
		    "wrmsr",
		    in("ecx") efer_msr,
		    in("eax") efer_low,
		    in("edx") efer_high,
		    options(nostack, preserves_flags)
		);
	}

	crate::info!("syscall entry point installed");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test_case]
	fn user_space_end_is_below_kernel_half() {
		// KERNEL_PML4_START = 256 means PML4 entries [256, 512) are kernel;
		// 256 entries at 512 GiB each is exactly the canonical-lower-half boundary.
		assert_eq!(USER_SPACE_END, 256usize * (1 << 39));
	}

	#[test_case]
	fn zero_length_range_always_validates() {
		// A zero-byte transfer must not dereference anything, so it must
		// validate even for a pointer that would otherwise be rejected.
		let vas = Vas::new_kernel(crate::types::PhysAddr::new(0));
		assert!(check_user_range(&vas, VirtAddr::new(0), 0, false).is_ok());
	}

	#[test_case]
	fn range_past_user_space_end_is_rejected() {
		let vas = Vas::new_kernel(crate::types::PhysAddr::new(0));
		assert!(check_user_range(&vas, VirtAddr::new(USER_SPACE_END - 1), 2, false).is_err());
	}

	#[test_case]
	fn termios_round_trips_through_byte_encoding() {
		let t = Termios {
			input_flags: 1,
			output_flags: 2,
			control_flags: 3,
			local_flags: 4,
		};
		let bytes = termios_to_bytes(t);
		let back = termios_from_bytes(&bytes);
		assert_eq!(back.input_flags, 1);
		assert_eq!(back.output_flags, 2);
		assert_eq!(back.control_flags, 3);
		assert_eq!(back.local_flags, 4);
	}
}
