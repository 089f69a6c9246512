// SPDX-License-Identifier: GPL-2.0

//! Processes, threads, and the per-process file-descriptor table (§3).
//!
//! Thread queue membership and the thread-state machine itself belong to
//! [`crate::scheduler`], which owns the one big scheduler lock (§4.E,
//! §5). This module owns the data each thread carries and the process it
//! may belong to: the address space, the sbrk watermark, and the
//! fixed-size file-descriptor table that `fork` copies by value (§3).

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::fs::OpenFile;
use crate::memory::vas::Vas;
use crate::sync::Spinlock;
use crate::types::{Pid, Tid};

/// Starting capacity of a fresh process's file-descriptor table; doubles
/// on demand rather than capping out, up to [`OPEN_MAX`] (§3, §10).
const INITIAL_FD_CAPACITY: usize = 16;

/// Hard ceiling a table will never grow past, mirroring a conventional
/// `RLIMIT_NOFILE`-style bound.
pub const OPEN_MAX: usize = 4096;

#[derive(Clone)]
struct FdSlot {
	file: Arc<OpenFile>,
	close_on_exec: bool,
}

/// A `fd -> (open file, close-on-exec)` mapping (§3) that starts small
/// and doubles its capacity when exhausted rather than panicking or
/// refusing new descriptors outright. Copied by value on `fork`, which
/// for an `Arc<OpenFile>` means every descriptor the parent had open the
/// child now shares -- exactly the fork(2) contract.
#[derive(Clone)]
pub struct FdTable {
	slots: Vec<Option<FdSlot>>,
}

impl FdTable {
	pub fn new() -> Self {
		let mut slots = Vec::new();
		slots.resize_with(INITIAL_FD_CAPACITY, || None);
		Self { slots }
	}

	/// Double the table's capacity, up to [`OPEN_MAX`].
	fn grow(&mut self) -> Result<()> {
		if self.slots.len() >= OPEN_MAX {
			return Err(Error::TooManyOpenFiles);
		}
		let new_len = (self.slots.len() * 2).min(OPEN_MAX);
		self.slots.resize_with(new_len, || None);
		Ok(())
	}

	/// Install `file` in the lowest-numbered free slot (POSIX `open`/`dup` semantics).
	pub fn install(&mut self, file: Arc<OpenFile>, close_on_exec: bool) -> Result<i32> {
		loop {
			if let Some(slot) = self.slots.iter_mut().position(|s| s.is_none()) {
				self.slots[slot] = Some(FdSlot { file, close_on_exec });
				return Ok(slot as i32);
			}
			self.grow()?;
		}
	}

	/// Install `file` at exactly `fd`, closing whatever was already there (`dup2`/`dup3`).
	pub fn install_at(&mut self, fd: i32, file: Arc<OpenFile>, close_on_exec: bool) -> Result<()> {
		while fd as usize >= self.slots.len() {
			self.grow()?;
		}
		let slot = self.index(fd)?;
		self.slots[slot] = Some(FdSlot { file, close_on_exec });
		Ok(())
	}

	pub fn get(&self, fd: i32) -> Result<Arc<OpenFile>> {
		let slot = self.index(fd)?;
		self.slots[slot]
			.as_ref()
			.map(|s| s.file.clone())
			.ok_or(Error::BadDescriptor)
	}

	pub fn close(&mut self, fd: i32) -> Result<()> {
		let slot = self.index(fd)?;
		if self.slots[slot].take().is_none() {
			return Err(Error::BadDescriptor);
		}
		Ok(())
	}

	fn index(&self, fd: i32) -> Result<usize> {
		if fd < 0 || fd as usize >= self.slots.len() {
			return Err(Error::BadDescriptor);
		}
		Ok(fd as usize)
	}
}

/// Current lifecycle state of a [`Process`]; distinct from any one of its
/// threads' scheduler states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
	Running,
	Zombie,
}

pub struct ProcessInner {
	state: ProcessState,
	exit_code: i32,
	fds: FdTable,
	/// Watermark of the process's break (brk) region, advanced by `sbrk`.
	brk: usize,
	threads: Vec<Arc<crate::scheduler::Thread>>,
}

/// A container aggregating a VAS, a file-descriptor table, an sbrk
/// watermark, and a list of threads (§3).
pub struct Process {
	pub pid: Pid,
	pub parent: Option<Pid>,
	pub vas: Arc<Vas>,
	inner: Spinlock<ProcessInner>,
}

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

pub fn allocate_pid() -> Pid {
	Pid(NEXT_PID.fetch_add(1, Ordering::SeqCst))
}

impl Process {
	pub fn new(parent: Option<Pid>, vas: Arc<Vas>, brk: usize) -> Arc<Self> {
		Arc::new(Self {
			pid: allocate_pid(),
			parent,
			vas,
			inner: Spinlock::new(ProcessInner {
				state: ProcessState::Running,
				exit_code: 0,
				fds: FdTable::new(),
				brk,
				threads: Vec::new(),
			}),
		})
	}

	pub fn add_thread(&self, thread: Arc<crate::scheduler::Thread>) {
		self.inner.lock().threads.push(thread);
	}

	/// Drop `thread` from this process's thread list; returns true if it was the last one.
	pub fn remove_thread(&self, tid: Tid) -> bool {
		let mut inner = self.inner.lock();
		inner.threads.retain(|t| t.id != tid);
		inner.threads.is_empty()
	}

	pub fn thread_count(&self) -> usize {
		self.inner.lock().threads.len()
	}

	pub fn fds(&self) -> crate::sync::SpinlockGuard<'_, ProcessInner> {
		self.inner.lock()
	}

	pub fn exit(&self, exit_code: i32) {
		let mut inner = self.inner.lock();
		inner.state = ProcessState::Zombie;
		inner.exit_code = exit_code;
	}

	pub fn state(&self) -> ProcessState {
		self.inner.lock().state
	}

	pub fn exit_code(&self) -> i32 {
		self.inner.lock().exit_code
	}

	/// Advance (or, for a negative increment, retreat) the break watermark
	/// by `increment` bytes and return the break's value *before* the
	/// change, matching the traditional `sbrk(2)` return convention.
	pub fn sbrk(&self, increment: isize) -> Result<usize> {
		let mut inner = self.inner.lock();
		let old = inner.brk;
		let new = if increment >= 0 {
			old.checked_add(increment as usize)
		} else {
			old.checked_sub((-increment) as usize)
		}
		.ok_or(Error::OutOfMemory)?;
		inner.brk = new;
		Ok(old)
	}

	/// Duplicate this process's fd table by value for a forked child.
	fn clone_fds(&self) -> FdTable {
		self.inner.lock().fds.clone()
	}
}

impl ProcessInner {
	pub fn install_fd(&mut self, file: Arc<OpenFile>, close_on_exec: bool) -> Result<i32> {
		self.fds.install(file, close_on_exec)
	}

	pub fn install_fd_at(&mut self, fd: i32, file: Arc<OpenFile>, close_on_exec: bool) -> Result<()> {
		self.fds.install_at(fd, file, close_on_exec)
	}

	pub fn get_fd(&self, fd: i32) -> Result<Arc<OpenFile>> {
		self.fds.get(fd)
	}

	pub fn close_fd(&mut self, fd: i32) -> Result<()> {
		self.fds.close(fd)
	}
}

/// Global process table, keyed by pid. Threads are reachable from their
/// process; this table exists for `waitpid`/`kill`-style lookups by pid.
static PROCESSES: Spinlock<Vec<Arc<Process>>> = Spinlock::new(Vec::new());

pub fn register(process: Arc<Process>) {
	PROCESSES.lock().push(process);
}

pub fn find(pid: Pid) -> Option<Arc<Process>> {
	PROCESSES.lock().iter().find(|p| p.pid == pid).cloned()
}

pub fn reap(pid: Pid) {
	PROCESSES.lock().retain(|p| p.pid != pid);
}

/// Fork `parent`: copy-on-write duplicate its VAS (§4.B `Vas::copy`) and
/// its fd table by value (§3), with a fresh pid and the same brk.
/// Does not create the child's thread; the scheduler does that so it can
/// arrange the dual-return trampoline (§4.E "Fork").
pub fn fork(parent: &Arc<Process>) -> Result<Arc<Process>> {
	let child_vas = parent.vas.copy()?;
	let brk = parent.inner.lock().brk;
	let child = Process::new(Some(parent.pid), child_vas, brk);
	child.inner.lock().fds = parent.clone_fds();
	register(child.clone());
	Ok(child)
}

/// Helper exposed for [`crate::logging`]: the pid of the process owning
/// the currently running thread, if any (kernel threads have none).
pub fn current_process_pid() -> Option<Pid> {
	crate::scheduler::current_thread().and_then(|t| t.process.clone()).map(|p| p.pid)
}

/// The kernel String type re-export used by a few callers constructing names.
pub type Name = String;
