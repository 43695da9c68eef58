//! Positional access to a backing on-disk file.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// A file accessed purely through positional reads/writes, with no implicit cursor.
///
/// True unbuffered (`O_DIRECT`) I/O is a platform/alignment concern external to the volume
/// format's logic; this wraps a plain [`File`] via [`FileExt::read_at`]/[`FileExt::write_at`],
/// which gives the same positional-access contract the rest of the crate relies on.
#[derive(Debug)]
pub struct DirectFile {
	file: File,
}

impl DirectFile {
	/// Opens `path` for read/write, creating it if it does not exist.
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(path)?;
		Ok(Self { file })
	}

	/// Reads exactly `buf.len()` bytes starting at `offset`.
	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		self.file.read_exact_at(buf, offset)?;
		Ok(())
	}

	/// Writes exactly `buf` starting at `offset`.
	pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
		self.file.write_all_at(buf, offset)?;
		Ok(())
	}

	/// Returns the file's current size in bytes.
	pub fn size(&self) -> Result<u64> {
		Ok(self.file.metadata()?.len())
	}

	/// Truncates or extends the file to exactly `len` bytes. Extension is zero-filled by the
	/// host filesystem (a sparse hole until written).
	pub fn set_len(&self, len: u64) -> Result<()> {
		self.file.set_len(len)?;
		Ok(())
	}

	/// Flushes any host-level buffering to stable storage.
	pub fn sync(&self) -> Result<()> {
		self.file.sync_all()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn write_then_read_back() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("f");
		let f = DirectFile::open(&path).unwrap();
		f.set_len(4096).unwrap();
		f.write_at(b"hello", 10).unwrap();
		let mut buf = [0u8; 5];
		f.read_at(&mut buf, 10).unwrap();
		assert_eq!(&buf, b"hello");
		assert_eq!(f.size().unwrap(), 4096);
	}
}
