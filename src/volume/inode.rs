//! The fixed 64-byte on-disk inode record.

use crate::error::Result;
use crate::serde::{OnDiskSize, Reader, Writer};

/// Tag byte identifying a value's type. The mapping is part of the on-disk format and must
/// never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueTag {
	/// No value stored.
	Undefined = 0,
	/// `bool`.
	Bool = 1,
	/// `i32`.
	I32 = 2,
	/// `u32`.
	U32 = 3,
	/// `i64`.
	I64 = 4,
	/// `u64`.
	U64 = 5,
	/// `f32`.
	F32 = 6,
	/// `f64`.
	F64 = 7,
	/// UTF-8 string, length-prefixed.
	String = 8,
	/// Opaque byte blob, length-prefixed.
	Blob = 9,
}

impl ValueTag {
	/// Recovers a tag from its on-disk byte, failing on unknown values.
	pub fn from_u8(v: u8) -> Result<Self> {
		Ok(match v {
			0 => Self::Undefined,
			1 => Self::Bool,
			2 => Self::I32,
			3 => Self::U32,
			4 => Self::I64,
			5 => Self::U64,
			6 => Self::F32,
			7 => Self::F64,
			8 => Self::String,
			9 => Self::Blob,
			other => {
				return Err(crate::error::Error::corruption(format!(
					"unknown value tag byte {other}"
				)))
			}
		})
	}
}

/// The value half of an inode: a type tag plus where its (at most one) data block lives.
#[derive(Debug, Clone, Copy)]
pub struct ValueSlot {
	/// The stored value's type, or [`ValueTag::Undefined`] if none.
	pub tag: ValueTag,
	/// Number of data blocks holding the value: 0 or 1.
	pub block_count: u16,
	/// Local data-block index holding the value, valid only when `block_count == 1`.
	pub first_block_id: u32,
	/// Optional expiry, in whatever time unit the embedder chooses; 0 means no deadline.
	pub deadline: u32,
}

impl Default for ValueSlot {
	fn default() -> Self {
		Self {
			tag: ValueTag::Undefined,
			block_count: 0,
			first_block_id: 0,
			deadline: 0,
		}
	}
}

/// The directory half of an inode: whether it has children and where their single data block
/// lives.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirSlot {
	/// Whether this inode currently has at least one child.
	pub has_children: bool,
	/// Number of data blocks holding the directory entries: 0 or 1.
	pub block_count: u16,
	/// Local data-block index holding the directory entries, valid only when `has_children`.
	pub first_block_id: u32,
}

/// A 64-byte inode record.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inode {
	/// Creation timestamp.
	pub creation_time: u32,
	/// Last-modification timestamp.
	pub mod_time: u32,
	/// The stored scalar value, if any.
	pub value: ValueSlot,
	/// The directory-entry state, if any.
	pub dir: DirSlot,
}

impl OnDiskSize for Inode {
	const ON_DISK_SIZE: usize = 64;
}

impl Inode {
	/// An inode with no value and no children, stamped with the current time.
	pub fn empty() -> Self {
		let now = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_secs() as u32)
			.unwrap_or(0);
		Self {
			creation_time: now,
			mod_time: now,
			value: ValueSlot::default(),
			dir: DirSlot::default(),
		}
	}

	/// Serializes the inode into exactly 64 bytes.
	pub fn write_to(&self, buf: &mut [u8]) {
		let mut w = Writer::new(&mut buf[..Self::ON_DISK_SIZE]);
		w.u32(self.creation_time);
		w.u32(self.mod_time);
		w.u8(self.value.tag as u8);
		w.u16(self.value.block_count);
		w.u32(self.value.first_block_id);
		w.u32(self.value.deadline);
		w.bool(self.dir.has_children);
		w.u16(self.dir.block_count);
		w.u32(self.dir.first_block_id);
		w.skip(38);
		w.finish(Self::ON_DISK_SIZE);
	}

	/// Deserializes an inode from its 64-byte on-disk record.
	pub fn read_from(buf: &[u8]) -> Result<Self> {
		let mut r = Reader::new(&buf[..Self::ON_DISK_SIZE]);
		let creation_time = r.u32()?;
		let mod_time = r.u32()?;
		let tag = ValueTag::from_u8(r.u8()?)?;
		let value = ValueSlot {
			tag,
			block_count: r.u16()?,
			first_block_id: r.u32()?,
			deadline: r.u32()?,
		};
		let dir = DirSlot {
			has_children: r.bool()?,
			block_count: r.u16()?,
			first_block_id: r.u32()?,
		};
		r.skip(38)?;
		r.finish(Self::ON_DISK_SIZE);
		Ok(Self {
			creation_time,
			mod_time,
			value,
			dir,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundtrip_empty_inode() {
		let inode = Inode::empty();
		let mut buf = [0u8; 64];
		inode.write_to(&mut buf);
		let back = Inode::read_from(&buf).unwrap();
		assert_eq!(back.creation_time, inode.creation_time);
		assert_eq!(back.value.tag, ValueTag::Undefined);
		assert!(!back.dir.has_children);
	}

	#[test]
	fn unknown_tag_is_corruption() {
		let mut buf = [0u8; 64];
		buf[8] = 0xaa;
		assert!(Inode::read_from(&buf).is_err());
	}
}
