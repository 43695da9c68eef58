//! Views a [`DirectFile`] as an array of equal-sized blocks.

use crate::error::Result;
use crate::io::direct_file::DirectFile;

/// A [`DirectFile`] viewed as a sequence of fixed-size blocks.
pub struct BlockFile {
	file: DirectFile,
	block_size: u32,
}

impl BlockFile {
	/// Wraps `file`, treating it as a sequence of `block_size`-byte blocks.
	pub fn new(file: DirectFile, block_size: u32) -> Self {
		Self { file, block_size }
	}

	/// The fixed block size.
	pub fn block_size(&self) -> u32 {
		self.block_size
	}

	/// Number of whole blocks currently backing this file.
	pub fn block_count(&self) -> Result<u64> {
		Ok(self.file.size()? / self.block_size as u64)
	}

	/// Grows or shrinks the file to exactly `count` blocks.
	pub fn set_block_count(&self, count: u64) -> Result<()> {
		self.file.set_len(count * self.block_size as u64)
	}

	/// Reads block `index` into `buf`, which must be exactly `block_size` bytes.
	pub fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
		debug_assert_eq!(buf.len(), self.block_size as usize);
		self.file.read_at(buf, index * self.block_size as u64)
	}

	/// Writes `buf`, which must be exactly `block_size` bytes, to block `index`.
	pub fn write_block(&self, index: u64, buf: &[u8]) -> Result<()> {
		debug_assert_eq!(buf.len(), self.block_size as usize);
		self.file.write_at(buf, index * self.block_size as u64)
	}

	/// Flushes to stable storage.
	pub fn sync(&self) -> Result<()> {
		self.file.sync()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn grow_then_roundtrip_block() {
		let dir = tempdir().unwrap();
		let df = DirectFile::open(dir.path().join("bf")).unwrap();
		let bf = BlockFile::new(df, 512);
		bf.set_block_count(4).unwrap();
		assert_eq!(bf.block_count().unwrap(), 4);
		let mut data = [0u8; 512];
		data[0] = 42;
		bf.write_block(2, &data).unwrap();
		let mut out = [0u8; 512];
		bf.read_block(2, &mut out).unwrap();
		assert_eq!(out[0], 42);
	}
}
