//! The tagged scalar value stored at a path.

use crate::error::{Error, Result};
use crate::serde::{Reader, Writer};
use crate::volume::inode::ValueTag;

/// A value stored at a path: either nothing, or one of a fixed set of scalar types.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	/// No value; equivalent to the key not existing as far as `get` is concerned.
	None,
	/// Boolean.
	Bool(bool),
	/// Signed 32-bit integer.
	I32(i32),
	/// Unsigned 32-bit integer.
	U32(u32),
	/// Signed 64-bit integer.
	I64(i64),
	/// Unsigned 64-bit integer.
	U64(u64),
	/// 32-bit float.
	F32(f32),
	/// 64-bit float.
	F64(f64),
	/// UTF-8 string.
	String(String),
	/// Opaque byte blob.
	Blob(Vec<u8>),
}

impl Value {
	/// This value's on-disk tag.
	pub fn tag(&self) -> ValueTag {
		match self {
			Self::None => ValueTag::Undefined,
			Self::Bool(_) => ValueTag::Bool,
			Self::I32(_) => ValueTag::I32,
			Self::U32(_) => ValueTag::U32,
			Self::I64(_) => ValueTag::I64,
			Self::U64(_) => ValueTag::U64,
			Self::F32(_) => ValueTag::F32,
			Self::F64(_) => ValueTag::F64,
			Self::String(_) => ValueTag::String,
			Self::Blob(_) => ValueTag::Blob,
		}
	}

	/// Whether this is the none-variant.
	pub fn is_none(&self) -> bool {
		matches!(self, Self::None)
	}

	/// Encodes the value into `buf` (sized to one data block), returning the number of bytes
	/// written. Fails with [`Error::BadInput`] if a string/blob would not fit.
	pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
		match self {
			Self::None => Ok(0),
			Self::Bool(v) => {
				let mut w = Writer::new(&mut buf[..1]);
				w.bool(*v);
				Ok(1)
			}
			Self::I32(v) => {
				let mut w = Writer::new(&mut buf[..4]);
				w.i32(*v);
				Ok(4)
			}
			Self::U32(v) => {
				let mut w = Writer::new(&mut buf[..4]);
				w.u32(*v);
				Ok(4)
			}
			Self::I64(v) => {
				let mut w = Writer::new(&mut buf[..8]);
				w.i64(*v);
				Ok(8)
			}
			Self::U64(v) => {
				let mut w = Writer::new(&mut buf[..8]);
				w.u64(*v);
				Ok(8)
			}
			Self::F32(v) => {
				let mut w = Writer::new(&mut buf[..4]);
				w.f32(*v);
				Ok(4)
			}
			Self::F64(v) => {
				let mut w = Writer::new(&mut buf[..8]);
				w.f64(*v);
				Ok(8)
			}
			Self::String(s) => Self::encode_bytes(s.as_bytes(), buf),
			Self::Blob(b) => Self::encode_bytes(b, buf),
		}
	}

	fn encode_bytes(data: &[u8], buf: &mut [u8]) -> Result<usize> {
		if data.len() > buf.len().saturating_sub(2) || data.len() > u16::MAX as usize {
			return Err(Error::bad_input("value too large to fit in one block"));
		}
		let mut w = Writer::new(&mut buf[..2 + data.len()]);
		w.u16(data.len() as u16);
		w.bytes(data);
		Ok(2 + data.len())
	}

	/// Decodes a value of type `tag` from `buf`.
	pub fn decode(tag: ValueTag, buf: &[u8]) -> Result<Self> {
		Ok(match tag {
			ValueTag::Undefined => Self::None,
			ValueTag::Bool => Self::Bool(Reader::new(&buf[..1]).bool()?),
			ValueTag::I32 => Self::I32(Reader::new(&buf[..4]).i32()?),
			ValueTag::U32 => Self::U32(Reader::new(&buf[..4]).u32()?),
			ValueTag::I64 => Self::I64(Reader::new(&buf[..8]).i64()?),
			ValueTag::U64 => Self::U64(Reader::new(&buf[..8]).u64()?),
			ValueTag::F32 => Self::F32(Reader::new(&buf[..4]).f32()?),
			ValueTag::F64 => Self::F64(Reader::new(&buf[..8]).f64()?),
			ValueTag::String => {
				let mut r = Reader::new(buf);
				let len = r.u16()? as usize;
				let bytes = r.bytes(len)?;
				Self::String(
					String::from_utf8(bytes.to_vec())
						.map_err(|_| Error::corruption("stored string is not valid UTF-8"))?,
				)
			}
			ValueTag::Blob => {
				let mut r = Reader::new(buf);
				let len = r.u16()? as usize;
				Self::Blob(r.bytes(len)?.to_vec())
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundtrip_each_variant() {
		let mut buf = [0u8; 256];
		for v in [
			Value::Bool(true),
			Value::I32(-7),
			Value::U32(777),
			Value::I64(-1234567890123),
			Value::U64(9999999999),
			Value::F32(1.46),
			Value::F64(3.14159),
			Value::String("Handsome".to_string()),
			Value::Blob(vec![1, 2, 3, 4]),
		] {
			let n = v.encode(&mut buf).unwrap();
			let back = Value::decode(v.tag(), &buf[..n]).unwrap();
			assert_eq!(back, v);
		}
	}

	#[test]
	fn oversized_string_is_bad_input() {
		let mut buf = [0u8; 8];
		let v = Value::String("way too long for this buffer".to_string());
		assert!(v.encode(&mut buf).is_err());
	}
}
