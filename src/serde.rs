//! Little-endian, fixed-layout (de)serialization of on-disk records.
//!
//! Mirrors the role of a `Serialize`/`Deserialize` pair over a byte cursor: every on-disk record
//! in this crate writes and reads its fields in a fixed order through a [`Writer`]/[`Reader`].
//! In debug builds, [`Writer::finish`] and [`Reader::finish`] assert that exactly the declared
//! number of bytes were produced/consumed, catching a record whose (de)serialization drifted from
//! its [`OnDiskSize`].

use crate::error::{Error, Result};

/// A type with a fixed, known on-disk size in bytes.
pub trait OnDiskSize {
	/// Size in bytes this type always occupies on disk.
	const ON_DISK_SIZE: usize;
}

/// A cursor over a mutable byte slice used to serialize fixed-layout records.
pub struct Writer<'b> {
	buf: &'b mut [u8],
	pos: usize,
}

impl<'b> Writer<'b> {
	/// Creates a writer over `buf`.
	pub fn new(buf: &'b mut [u8]) -> Self {
		Self { buf, pos: 0 }
	}

	fn take(&mut self, n: usize) -> &mut [u8] {
		let slice = &mut self.buf[self.pos..self.pos + n];
		self.pos += n;
		slice
	}

	/// Writes a `u8`.
	pub fn u8(&mut self, v: u8) {
		self.take(1)[0] = v;
	}

	/// Writes a `u16` in little-endian order.
	pub fn u16(&mut self, v: u16) {
		self.take(2).copy_from_slice(&v.to_le_bytes());
	}

	/// Writes a `u32` in little-endian order.
	pub fn u32(&mut self, v: u32) {
		self.take(4).copy_from_slice(&v.to_le_bytes());
	}

	/// Writes a `u64` in little-endian order.
	pub fn u64(&mut self, v: u64) {
		self.take(8).copy_from_slice(&v.to_le_bytes());
	}

	/// Writes an `i32` in little-endian order.
	pub fn i32(&mut self, v: i32) {
		self.take(4).copy_from_slice(&v.to_le_bytes());
	}

	/// Writes an `i64` in little-endian order.
	pub fn i64(&mut self, v: i64) {
		self.take(8).copy_from_slice(&v.to_le_bytes());
	}

	/// Writes an `f32` in little-endian order, bit-preserved.
	pub fn f32(&mut self, v: f32) {
		self.take(4).copy_from_slice(&v.to_bits().to_le_bytes());
	}

	/// Writes an `f64` in little-endian order, bit-preserved.
	pub fn f64(&mut self, v: f64) {
		self.take(8).copy_from_slice(&v.to_bits().to_le_bytes());
	}

	/// Writes a `bool` as a single byte.
	pub fn bool(&mut self, v: bool) {
		self.u8(v as u8);
	}

	/// Writes raw bytes verbatim.
	pub fn bytes(&mut self, data: &[u8]) {
		self.take(data.len()).copy_from_slice(data);
	}

	/// Writes `n` zero bytes, used for reserved/padding regions.
	pub fn skip(&mut self, n: usize) {
		self.take(n).fill(0);
	}

	/// Returns how many bytes have been written so far.
	pub fn position(&self) -> usize {
		self.pos
	}

	/// In debug builds, asserts exactly `expected` bytes were written. No-op in release builds.
	pub fn finish(self, expected: usize) {
		debug_assert_eq!(
			self.pos, expected,
			"serialized record wrote {} bytes, expected {}",
			self.pos, expected
		);
	}
}

/// A cursor over an immutable byte slice used to deserialize fixed-layout records.
pub struct Reader<'b> {
	buf: &'b [u8],
	pos: usize,
}

impl<'b> Reader<'b> {
	/// Creates a reader over `buf`.
	pub fn new(buf: &'b [u8]) -> Self {
		Self { buf, pos: 0 }
	}

	fn take(&mut self, n: usize) -> Result<&'b [u8]> {
		if self.pos + n > self.buf.len() {
			return Err(Error::corruption("record read past end of buffer"));
		}
		let slice = &self.buf[self.pos..self.pos + n];
		self.pos += n;
		Ok(slice)
	}

	/// Reads a `u8`.
	pub fn u8(&mut self) -> Result<u8> {
		Ok(self.take(1)?[0])
	}

	/// Reads a `u16` in little-endian order.
	pub fn u16(&mut self) -> Result<u16> {
		let b = self.take(2)?;
		Ok(u16::from_le_bytes(b.try_into().unwrap()))
	}

	/// Reads a `u32` in little-endian order.
	pub fn u32(&mut self) -> Result<u32> {
		let b = self.take(4)?;
		Ok(u32::from_le_bytes(b.try_into().unwrap()))
	}

	/// Reads a `u64` in little-endian order.
	pub fn u64(&mut self) -> Result<u64> {
		let b = self.take(8)?;
		Ok(u64::from_le_bytes(b.try_into().unwrap()))
	}

	/// Reads an `i32` in little-endian order.
	pub fn i32(&mut self) -> Result<i32> {
		let b = self.take(4)?;
		Ok(i32::from_le_bytes(b.try_into().unwrap()))
	}

	/// Reads an `i64` in little-endian order.
	pub fn i64(&mut self) -> Result<i64> {
		let b = self.take(8)?;
		Ok(i64::from_le_bytes(b.try_into().unwrap()))
	}

	/// Reads an `f32` in little-endian order, bit-preserved.
	pub fn f32(&mut self) -> Result<f32> {
		let b = self.take(4)?;
		Ok(f32::from_bits(u32::from_le_bytes(b.try_into().unwrap())))
	}

	/// Reads an `f64` in little-endian order, bit-preserved.
	pub fn f64(&mut self) -> Result<f64> {
		let b = self.take(8)?;
		Ok(f64::from_bits(u64::from_le_bytes(b.try_into().unwrap())))
	}

	/// Reads a `bool` from a single byte.
	pub fn bool(&mut self) -> Result<bool> {
		Ok(self.u8()? != 0)
	}

	/// Reads `n` raw bytes verbatim.
	pub fn bytes(&mut self, n: usize) -> Result<&'b [u8]> {
		self.take(n)
	}

	/// Skips `n` bytes without interpreting them.
	pub fn skip(&mut self, n: usize) -> Result<()> {
		self.take(n)?;
		Ok(())
	}

	/// Returns how many bytes have been read so far.
	pub fn position(&self) -> usize {
		self.pos
	}

	/// In debug builds, asserts exactly `expected` bytes were read. No-op in release builds.
	pub fn finish(self, expected: usize) {
		debug_assert_eq!(
			self.pos, expected,
			"deserialized record read {} bytes, expected {}",
			self.pos, expected
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundtrip_primitives() {
		let mut buf = [0u8; 32];
		let mut w = Writer::new(&mut buf);
		w.u32(0xdead_beef);
		w.i64(-12345);
		w.f32(1.5);
		w.bool(true);
		w.finish(17);

		let mut r = Reader::new(&buf);
		assert_eq!(r.u32().unwrap(), 0xdead_beef);
		assert_eq!(r.i64().unwrap(), -12345);
		assert_eq!(r.f32().unwrap(), 1.5);
		assert!(r.bool().unwrap());
	}

	#[test]
	fn read_past_end_is_corruption() {
		let buf = [0u8; 2];
		let mut r = Reader::new(&buf);
		assert!(r.u32().is_err());
	}
}
