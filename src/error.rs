//! The error type shared by every fallible operation in this crate.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A single error type covering every way a storage operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// The caller passed a malformed argument: an empty path, a path not starting with `/`, a
	/// name longer than the configured limit, or a value too large to fit in one block.
	#[error("bad input: {0}")]
	BadInput(String),

	/// The requested path does not resolve to an existing entry.
	#[error("not found: {0}")]
	NotFound(String),

	/// `add_child` was called with a name already present under the parent.
	#[error("duplicate child {name:?} under inode {parent}")]
	DuplicateChild {
		/// The parent inode id.
		parent: u64,
		/// The name that already exists.
		name: String,
	},

	/// An operation would violate a structural invariant, e.g. removing a directory that still
	/// has children.
	#[error("constraint violated: {0}")]
	ConstraintViolated(String),

	/// No free inode or data block is available and no meta-group could be grown.
	#[error("capacity exhausted: {0}")]
	Capacity(String),

	/// The underlying positional I/O failed.
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),

	/// An on-disk record failed a size, tag, or length check.
	#[error("on-disk corruption: {0}")]
	Corruption(String),
}

impl Error {
	/// Shorthand for [`Error::BadInput`].
	pub fn bad_input(msg: impl Into<String>) -> Self {
		Self::BadInput(msg.into())
	}

	/// Shorthand for [`Error::NotFound`].
	pub fn not_found(msg: impl Into<String>) -> Self {
		Self::NotFound(msg.into())
	}

	/// Shorthand for [`Error::ConstraintViolated`].
	pub fn constraint(msg: impl Into<String>) -> Self {
		Self::ConstraintViolated(msg.into())
	}

	/// Shorthand for [`Error::Capacity`].
	pub fn capacity(msg: impl Into<String>) -> Self {
		Self::Capacity(msg.into())
	}

	/// Shorthand for [`Error::Corruption`].
	pub fn corruption(msg: impl Into<String>) -> Self {
		Self::Corruption(msg.into())
	}
}
