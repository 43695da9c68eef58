//! The per-volume superblock: immutable layout parameters derived from the volume's settings,
//! plus the two growth counters (`block_group_count`, `meta_group_count`) persisted alongside
//! them so a reopened volume does not need to probe the directory to know how far it has grown.

use crate::error::{Error, Result};
use crate::serde::{OnDiskSize, Reader, Writer};

/// On-disk size of one [`BlockGroupDescriptor`](super::block_group::BlockGroupDescriptor), used
/// by the descriptor-area sizing formulas below.
pub const DESCRIPTOR_SIZE: u32 = 16;

/// On-disk size of one [`Inode`](super::inode::Inode).
pub const INODE_SIZE: u32 = 64;

/// Parameters an embedder chooses when creating a new volume.
#[derive(Debug, Clone, Copy)]
pub struct VolumeSettings {
	/// Size in bytes of one block; also the size of the superblock file itself.
	pub block_size: u32,
	/// Soft cap on a volume's total size in bytes, used to derive `max_block_groups`.
	pub max_file_size: u64,
	/// Maximum length in bytes of a single path component.
	pub name_max_len: u8,
}

impl Default for VolumeSettings {
	fn default() -> Self {
		Self {
			block_size: 4096,
			max_file_size: 2 * 1024 * 1024 * 1024,
			name_max_len: 32,
		}
	}
}

/// The volume's fixed layout parameters plus its two growth counters.
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
	/// Size in bytes of one block.
	pub block_size: u32,
	/// Number of block-groups currently allocated across every meta-group.
	pub block_group_count: u32,
	/// Maximum number of block-groups a single meta-group file can hold.
	pub max_block_groups: u32,
	/// Size in bytes of one block-group slab.
	pub block_group_size: u32,
	/// Number of blocks occupied by a meta-group's descriptor area.
	pub descr_blocks: u32,
	/// Number of meta-group files currently in use.
	pub meta_group_count: u32,
	/// The `max_file_size` setting this volume was created with.
	pub max_file_size: u32,
	/// Byte offset of the first block-group within a meta-group file.
	pub zero_bg_offset: u32,
	/// Number of inodes a single block-group holds.
	pub bg_inode_count: u32,
	/// Number of data blocks a single block-group holds.
	pub bg_datablock_count: u32,
	/// Number of inodes a single meta-group holds (`bg_inode_count * max_block_groups`).
	pub mg_inode_count: u32,
	/// Number of data blocks a single meta-group holds.
	pub mg_datablock_count: u32,
}

impl OnDiskSize for Superblock {
	const ON_DISK_SIZE: usize = 48;
}

impl Superblock {
	/// Derives a fresh superblock (with zero live groups) from `settings`, following the layout
	/// formulas: each block-group holds two bitmap blocks (inode, data), an inode table sized to
	/// address `block_size * 8` inodes, and a data area of the same cardinality; `max_block_groups`
	/// is however many block-groups plus their descriptor fit in `max_file_size`.
	pub fn derive(settings: &VolumeSettings) -> Self {
		let b = settings.block_size as u64;
		let t = INODE_SIZE as u64;
		let d = DESCRIPTOR_SIZE as u64;

		let bg_inode_count = b * 8;
		let bg_datablock_count = b * 8;
		let block_group_size = b * (2 + 8 * t + 8 * b);
		let max_block_groups = settings.max_file_size / (d + block_group_size);
		let descr_blocks = (max_block_groups * d).div_ceil(b);
		let zero_bg_offset = descr_blocks * b;
		let mg_inode_count = bg_inode_count * max_block_groups;
		let mg_datablock_count = bg_datablock_count * max_block_groups;

		Self {
			block_size: settings.block_size,
			block_group_count: 0,
			max_block_groups: max_block_groups as u32,
			block_group_size: block_group_size as u32,
			descr_blocks: descr_blocks as u32,
			meta_group_count: 0,
			max_file_size: settings.max_file_size as u32,
			zero_bg_offset: zero_bg_offset as u32,
			bg_inode_count: bg_inode_count as u32,
			bg_datablock_count: bg_datablock_count as u32,
			mg_inode_count: mg_inode_count as u32,
			mg_datablock_count: mg_datablock_count as u32,
		}
	}

	/// Serializes the superblock into exactly `Self::ON_DISK_SIZE` bytes (the rest of the
	/// `block_size`-sized superblock file stays zeroed).
	pub fn write_to(&self, buf: &mut [u8]) {
		let mut w = Writer::new(&mut buf[..Self::ON_DISK_SIZE]);
		w.u32(self.block_size);
		w.u32(self.block_group_count);
		w.u32(self.max_block_groups);
		w.u32(self.block_group_size);
		w.u32(self.descr_blocks);
		w.u32(self.meta_group_count);
		w.u32(self.max_file_size);
		w.u32(self.zero_bg_offset);
		w.u32(self.bg_inode_count);
		w.u32(self.bg_datablock_count);
		w.u32(self.mg_inode_count);
		w.u32(self.mg_datablock_count);
		w.finish(Self::ON_DISK_SIZE);
	}

	/// Deserializes a superblock from its on-disk record.
	pub fn read_from(buf: &[u8]) -> Result<Self> {
		if buf.len() < Self::ON_DISK_SIZE {
			return Err(Error::corruption("superblock buffer too small"));
		}
		let mut r = Reader::new(&buf[..Self::ON_DISK_SIZE]);
		let sb = Self {
			block_size: r.u32()?,
			block_group_count: r.u32()?,
			max_block_groups: r.u32()?,
			block_group_size: r.u32()?,
			descr_blocks: r.u32()?,
			meta_group_count: r.u32()?,
			max_file_size: r.u32()?,
			zero_bg_offset: r.u32()?,
			bg_inode_count: r.u32()?,
			bg_datablock_count: r.u32()?,
			mg_inode_count: r.u32()?,
			mg_datablock_count: r.u32()?,
		};
		r.finish(Self::ON_DISK_SIZE);
		if sb.block_size == 0 || sb.max_block_groups == 0 {
			return Err(Error::corruption("superblock has zero-sized layout parameter"));
		}
		Ok(sb)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_settings_match_reference_derivation() {
		let sb = Superblock::derive(&VolumeSettings::default());
		assert_eq!(
			sb.block_group_size as u64,
			4096 + 4096 + 2 * 1024 * 1024 + 128 * 1024 * 1024
		);
		assert_eq!(sb.max_block_groups, 15);
		assert_eq!(sb.descr_blocks, 1);
		assert_eq!(sb.zero_bg_offset, 4096);
		assert_eq!(sb.bg_inode_count, 32768);
		assert_eq!(sb.mg_inode_count, 491520);
	}

	#[test]
	fn roundtrip_through_bytes() {
		let sb = Superblock::derive(&VolumeSettings::default());
		let mut buf = [0u8; 4096];
		sb.write_to(&mut buf);
		let sb2 = Superblock::read_from(&buf).unwrap();
		assert_eq!(sb2.block_size, sb.block_size);
		assert_eq!(sb2.mg_inode_count, sb.mg_inode_count);
	}
}
