// SPDX-License-Identifier: GPL-2.0

//! Error handling types and utilities

use core::fmt;

/// Kernel error type.
///
/// Covers the closed set of conditions the core can report: resource
/// exhaustion, bad arguments at a trust boundary, and I/O failure from an
/// underlying device or filesystem. Programmer errors (corruption, invariant
/// violations) are not represented here and use `panic!`/`assert!` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// Operation not implemented
	NotImplemented,
	/// Out of memory
	OutOfMemory,
	/// No such device
	NoSuchDevice,
	/// A name is already registered (mount name, device name, ...)
	AlreadyRegistered,
	/// Invalid argument
	InvalidArgument,
	/// Resource already exists
	Exists,
	/// No such entry (path component, fd, swap slot, ...)
	NoSuchEntry,
	/// I/O error from a device or filesystem backend
	Io,
	/// A path component exceeded the maximum length
	NameTooLong,
	/// Expected a directory, found something else
	NotDirectory,
	/// Expected a non-directory, found a directory
	IsDirectory,
	/// Filesystem or device is read-only
	ReadOnly,
	/// Operation would block and non-blocking mode was requested
	WouldBlock,
	/// A user-supplied pointer was outside the user area or unmapped
	BadAddress,
	/// An invalid file descriptor was supplied
	BadDescriptor,
	/// ioctl/tcgetattr on a descriptor that is not a tty
	NotTty,
	/// Process file-descriptor table is full
	TooManyOpenFiles,
	/// Value out of the representable/allowed range
	Range,
	/// Operation interrupted by a signal
	Interrupted,
	/// No such process
	NoSuchProcess,
	/// No child process
	NoChild,
	/// Directory not empty
	NotEmpty,
}

impl Error {
	/// Convert error to a negative errno value, Linux-compatible where one exists.
	pub fn to_errno(self) -> i32 {
		match self {
			Error::NotImplemented => -38,    // ENOSYS
			Error::OutOfMemory => -12,       // ENOMEM
			Error::NoSuchDevice => -19,      // ENODEV
			Error::AlreadyRegistered => -17, // EEXIST
			Error::InvalidArgument => -22,   // EINVAL
			Error::Exists => -17,            // EEXIST
			Error::NoSuchEntry => -2,        // ENOENT
			Error::Io => -5,                 // EIO
			Error::NameTooLong => -36,       // ENAMETOOLONG
			Error::NotDirectory => -20,      // ENOTDIR
			Error::IsDirectory => -21,       // EISDIR
			Error::ReadOnly => -30,          // EROFS
			Error::WouldBlock => -11,        // EAGAIN
			Error::BadAddress => -14,        // EFAULT
			Error::BadDescriptor => -9,      // EBADF
			Error::NotTty => -25,            // ENOTTY
			Error::TooManyOpenFiles => -24,  // EMFILE
			Error::Range => -34,             // ERANGE
			Error::Interrupted => -4,        // EINTR
			Error::NoSuchProcess => -3,      // ESRCH
			Error::NoChild => -10,           // ECHILD
			Error::NotEmpty => -39,          // ENOTEMPTY
		}
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::NotImplemented => write!(f, "operation not implemented"),
			Error::OutOfMemory => write!(f, "out of memory"),
			Error::NoSuchDevice => write!(f, "no such device"),
			Error::AlreadyRegistered => write!(f, "name already registered"),
			Error::InvalidArgument => write!(f, "invalid argument"),
			Error::Exists => write!(f, "already exists"),
			Error::NoSuchEntry => write!(f, "no such entry"),
			Error::Io => write!(f, "I/O error"),
			Error::NameTooLong => write!(f, "name too long"),
			Error::NotDirectory => write!(f, "not a directory"),
			Error::IsDirectory => write!(f, "is a directory"),
			Error::ReadOnly => write!(f, "read-only filesystem"),
			Error::WouldBlock => write!(f, "operation would block"),
			Error::BadAddress => write!(f, "bad address"),
			Error::BadDescriptor => write!(f, "bad file descriptor"),
			Error::NotTty => write!(f, "not a tty"),
			Error::TooManyOpenFiles => write!(f, "too many open files"),
			Error::Range => write!(f, "value out of range"),
			Error::Interrupted => write!(f, "interrupted"),
			Error::NoSuchProcess => write!(f, "no such process"),
			Error::NoChild => write!(f, "no child process"),
			Error::NotEmpty => write!(f, "directory not empty"),
		}
	}
}

/// Kernel result type
pub type Result<T> = core::result::Result<T, Error>;

impl From<core::alloc::AllocError> for Error {
	fn from(_: core::alloc::AllocError) -> Self {
		Error::OutOfMemory
	}
}
