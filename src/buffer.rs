//! A block-aligned, owned byte buffer.

/// An owned buffer of exactly `len` bytes, used as the backing storage for cached pages and
/// on-disk records.
///
/// Move-only: cloning a multi-kilobyte page buffer implicitly is rarely what a caller wants, so
/// [`FixedBuffer`] does not implement [`Clone`] and must be duplicated explicitly via
/// [`FixedBuffer::try_clone`].
#[derive(Debug)]
pub struct FixedBuffer {
	data: Box<[u8]>,
}

impl FixedBuffer {
	/// Creates a zero-filled buffer of `len` bytes.
	pub fn zeroed(len: usize) -> Self {
		Self {
			data: vec![0u8; len].into_boxed_slice(),
		}
	}

	/// Creates a buffer from existing bytes.
	pub fn from_vec(data: Vec<u8>) -> Self {
		Self {
			data: data.into_boxed_slice(),
		}
	}

	/// Returns the buffer's length in bytes.
	pub fn len(&self) -> usize {
		self.data.len()
	}

	/// Returns whether the buffer is empty.
	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	/// Returns the buffer's contents as a slice.
	pub fn as_slice(&self) -> &[u8] {
		&self.data
	}

	/// Returns the buffer's contents as a mutable slice.
	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		&mut self.data
	}

	/// Fills the whole buffer with zeroes.
	pub fn clear(&mut self) {
		self.data.fill(0);
	}

	/// Returns a byte-for-byte copy of this buffer.
	pub fn try_clone(&self) -> Self {
		Self {
			data: self.data.clone(),
		}
	}
}

impl std::ops::Deref for FixedBuffer {
	type Target = [u8];

	fn deref(&self) -> &[u8] {
		&self.data
	}
}

impl std::ops::DerefMut for FixedBuffer {
	fn deref_mut(&mut self) -> &mut [u8] {
		&mut self.data
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zeroed_is_all_zero() {
		let buf = FixedBuffer::zeroed(64);
		assert_eq!(buf.len(), 64);
		assert!(buf.as_slice().iter().all(|&b| b == 0));
	}

	#[test]
	fn clear_resets_contents() {
		let mut buf = FixedBuffer::zeroed(8);
		buf.as_mut_slice()[0] = 0xff;
		buf.clear();
		assert!(buf.as_slice().iter().all(|&b| b == 0));
	}
}
