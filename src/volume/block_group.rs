//! A block-group: a fixed-size slab of one meta-group file holding an inode bitmap, a
//! data-block bitmap, an inode table, and a data area.
//!
//! A [`BlockGroup`] holds only its addressing parameters and live counters; it does not own the
//! [`BlockCache`] it is a region of (that belongs to the owning meta-group), so every accessor
//! takes the cache as an explicit argument rather than storing a borrow of it.

use crate::bitmap::BitmapAllocator;
use crate::cache::{BlockCache, ReadPage, WritePage};
use crate::error::{Error, Result};
use crate::serde::{OnDiskSize, Reader, Writer};
use crate::volume::inode::Inode;
use crate::volume::superblock::INODE_SIZE;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_secs() -> u32 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as u32)
		.unwrap_or(0)
}

/// The persisted descriptor for one potential block-group slot.
///
/// A `creation_time` of zero marks the slot as never having been grown into; this is how a
/// meta-group tells live slots apart from unused ones without a separate bitmap.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockGroupDescriptor {
	/// Unix timestamp the block-group was created at; zero means the slot is unused.
	pub creation_time: u32,
	/// Cached free-inode count, refreshed from the live [`BlockGroup`] on flush.
	pub free_inodes: u32,
	/// Cached free-data-block count, refreshed from the live [`BlockGroup`] on flush.
	pub free_data_blocks: u32,
	/// Number of directory inodes currently live in this block-group.
	pub directory_count: u32,
}

impl OnDiskSize for BlockGroupDescriptor {
	const ON_DISK_SIZE: usize = 16;
}

impl BlockGroupDescriptor {
	/// Whether this slot has been grown into.
	pub fn is_live(&self) -> bool {
		self.creation_time != 0
	}

	/// Serializes the descriptor into exactly 16 bytes.
	pub fn write_to(&self, buf: &mut [u8]) {
		let mut w = Writer::new(&mut buf[..Self::ON_DISK_SIZE]);
		w.u32(self.creation_time);
		w.u32(self.free_inodes);
		w.u32(self.free_data_blocks);
		w.u32(self.directory_count);
		w.finish(Self::ON_DISK_SIZE);
	}

	/// Deserializes a descriptor from its 16-byte on-disk record.
	pub fn read_from(buf: &[u8]) -> Result<Self> {
		let mut r = Reader::new(&buf[..Self::ON_DISK_SIZE]);
		let descr = Self {
			creation_time: r.u32()?,
			free_inodes: r.u32()?,
			free_data_blocks: r.u32()?,
			directory_count: r.u32()?,
		};
		r.finish(Self::ON_DISK_SIZE);
		Ok(descr)
	}
}

/// A live block-group: two bitmap blocks, an inode table, and a data area, addressed as an
/// offset region of a meta-group's shared [`BlockCache`].
pub struct BlockGroup {
	base_block: u64,
	creation_time: u32,
	inode_table_blocks: u32,
	inode_count: u32,
	datablock_count: u32,
	free_inodes: AtomicU32,
	free_data_blocks: AtomicU32,
	directory_count: AtomicU32,
}

impl BlockGroup {
	fn inode_table_blocks(inode_count: u32, block_size: u32) -> u32 {
		(inode_count as u64 * INODE_SIZE as u64).div_ceil(block_size as u64) as u32
	}

	/// Initializes a brand-new, empty block-group at `base_block` (both bitmaps cleared, full
	/// free counts) and returns its fresh descriptor.
	pub fn create(
		cache: &BlockCache,
		base_block: u64,
		inode_count: u32,
		datablock_count: u32,
	) -> Result<(Self, BlockGroupDescriptor)> {
		let block_size = cache.block_size();
		{
			let page = cache.get_mutable_block(base_block)?;
			page.with_mut(|buf| buf.fill(0));
		}
		{
			let page = cache.get_mutable_block(base_block + 1)?;
			page.with_mut(|buf| buf.fill(0));
		}
		let creation_time = now_secs();
		let descr = BlockGroupDescriptor {
			creation_time,
			free_inodes: inode_count,
			free_data_blocks: datablock_count,
			directory_count: 0,
		};
		let bg = Self {
			base_block,
			creation_time,
			inode_table_blocks: Self::inode_table_blocks(inode_count, block_size),
			inode_count,
			datablock_count,
			free_inodes: AtomicU32::new(inode_count),
			free_data_blocks: AtomicU32::new(datablock_count),
			directory_count: AtomicU32::new(0),
		};
		Ok((bg, descr))
	}

	/// Attaches to an already-live block-group described by `descr`.
	pub fn load(
		block_size: u32,
		base_block: u64,
		inode_count: u32,
		datablock_count: u32,
		descr: &BlockGroupDescriptor,
	) -> Self {
		Self {
			base_block,
			creation_time: descr.creation_time,
			inode_table_blocks: Self::inode_table_blocks(inode_count, block_size),
			inode_count,
			datablock_count,
			free_inodes: AtomicU32::new(descr.free_inodes),
			free_data_blocks: AtomicU32::new(descr.free_data_blocks),
			directory_count: AtomicU32::new(descr.directory_count),
		}
	}

	/// Current free-inode count.
	pub fn free_inodes(&self) -> u32 {
		self.free_inodes.load(Ordering::Acquire)
	}

	/// Current free-data-block count.
	pub fn free_data_blocks(&self) -> u32 {
		self.free_data_blocks.load(Ordering::Acquire)
	}

	fn data_area_base(&self) -> u64 {
		self.base_block + 2 + self.inode_table_blocks as u64
	}

	/// Attempts to allocate a local inode index; returns `None` when this group is full.
	pub fn try_allocate_inode(&self, cache: &BlockCache) -> Result<Option<u32>> {
		if self.free_inodes() == 0 {
			return Ok(None);
		}
		let page = cache.get_mutable_block(self.base_block)?;
		let idx = page.with_mut(|buf| {
			let mut alloc = BitmapAllocator::new(buf, self.inode_count as usize, usize::MAX);
			alloc.try_allocate()
		});
		let Some(idx) = idx else {
			return Ok(None);
		};
		self.free_inodes.fetch_sub(1, Ordering::AcqRel);
		self.write_inode(cache, idx as u32, &Inode::empty())?;
		Ok(Some(idx as u32))
	}

	/// Frees local inode index `idx`. Panics if it was not allocated (in-memory corruption).
	pub fn free_inode(&self, cache: &BlockCache, idx: u32) -> Result<()> {
		let page = cache.get_mutable_block(self.base_block)?;
		page.with_mut(|buf| {
			let mut alloc = BitmapAllocator::new(buf, self.inode_count as usize, usize::MAX);
			alloc.free(idx as usize);
		});
		self.free_inodes.fetch_add(1, Ordering::AcqRel);
		Ok(())
	}

	/// Attempts to allocate a local data-block index; returns `None` when this group is full.
	pub fn try_allocate_data_block(&self, cache: &BlockCache) -> Result<Option<u32>> {
		if self.free_data_blocks() == 0 {
			return Ok(None);
		}
		let page = cache.get_mutable_block(self.base_block + 1)?;
		let idx = page.with_mut(|buf| {
			let mut alloc = BitmapAllocator::new(buf, self.datablock_count as usize, usize::MAX);
			alloc.try_allocate()
		});
		let Some(idx) = idx else {
			return Ok(None);
		};
		self.free_data_blocks.fetch_sub(1, Ordering::AcqRel);
		Ok(Some(idx as u32))
	}

	/// Frees local data-block index `idx`.
	pub fn free_data_block(&self, cache: &BlockCache, idx: u32) -> Result<()> {
		let page = cache.get_mutable_block(self.base_block + 1)?;
		page.with_mut(|buf| {
			let mut alloc = BitmapAllocator::new(buf, self.datablock_count as usize, usize::MAX);
			alloc.free(idx as usize);
		});
		self.free_data_blocks.fetch_add(1, Ordering::AcqRel);
		Ok(())
	}

	fn inode_location(&self, cache: &BlockCache, idx: u32) -> Result<(u64, usize)> {
		if idx >= self.inode_count {
			return Err(Error::corruption("inode index out of block-group range"));
		}
		let block_size = cache.block_size() as u64;
		let byte_off = idx as u64 * INODE_SIZE as u64;
		let block = self.base_block + 2 + byte_off / block_size;
		let in_block = (byte_off % block_size) as usize;
		Ok((block, in_block))
	}

	/// Reads the inode at local index `idx`.
	pub fn read_inode(&self, cache: &BlockCache, idx: u32) -> Result<Inode> {
		let (block, off) = self.inode_location(cache, idx)?;
		let page = cache.get_block(block)?;
		page.with(|buf| Inode::read_from(&buf[off..off + Inode::ON_DISK_SIZE]))
	}

	/// Writes `inode` at local index `idx`.
	pub fn write_inode(&self, cache: &BlockCache, idx: u32, inode: &Inode) -> Result<()> {
		let (block, off) = self.inode_location(cache, idx)?;
		let page = cache.get_mutable_block(block)?;
		page.with_mut(|buf| inode.write_to(&mut buf[off..off + Inode::ON_DISK_SIZE]));
		Ok(())
	}

	/// Returns a read-only handle on local data block `idx`.
	pub fn get_data_block(&self, cache: &BlockCache, idx: u32) -> Result<ReadPage> {
		if idx >= self.datablock_count {
			return Err(Error::corruption("data block index out of block-group range"));
		}
		cache.get_block(self.data_area_base() + idx as u64)
	}

	/// Returns a mutable handle on local data block `idx`.
	pub fn get_mutable_data_block(&self, cache: &BlockCache, idx: u32) -> Result<WritePage> {
		if idx >= self.datablock_count {
			return Err(Error::corruption("data block index out of block-group range"));
		}
		cache.get_mutable_block(self.data_area_base() + idx as u64)
	}

	/// Increments the live directory-inode counter (for the descriptor's `directory_count`).
	pub fn inc_directory_count(&self) {
		self.directory_count.fetch_add(1, Ordering::AcqRel);
	}

	/// Decrements the live directory-inode counter.
	pub fn dec_directory_count(&self) {
		self.directory_count.fetch_sub(1, Ordering::AcqRel);
	}

	/// Produces a refreshed descriptor reflecting this block-group's current counters, to be
	/// persisted by the owning meta-group. `creation_time` is preserved from when the
	/// block-group was first grown into, not reset on every flush.
	pub fn to_descriptor(&self) -> BlockGroupDescriptor {
		BlockGroupDescriptor {
			creation_time: self.creation_time,
			free_inodes: self.free_inodes(),
			free_data_blocks: self.free_data_blocks(),
			directory_count: self.directory_count.load(Ordering::Acquire),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::io::{BlockFile, DirectFile};
	use tempfile::tempdir;

	#[test]
	fn allocate_inode_and_roundtrip() {
		let dir = tempdir().unwrap();
		let df = DirectFile::open(dir.path().join("bg")).unwrap();
		let bf = BlockFile::new(df, 256);
		// 2 bitmap blocks + inode table (8 inodes * 64B / 256B = 2 blocks) + 8 data blocks.
		bf.set_block_count(2 + 2 + 8).unwrap();
		let cache = BlockCache::new(bf);
		let (bg, descr) = BlockGroup::create(&cache, 0, 8, 8).unwrap();
		assert_eq!(descr.free_inodes, 8);
		let id = bg.try_allocate_inode(&cache).unwrap().unwrap();
		assert_eq!(id, 0);
		let mut inode = bg.read_inode(&cache, id).unwrap();
		inode.creation_time = 42;
		bg.write_inode(&cache, id, &inode).unwrap();
		let reread = bg.read_inode(&cache, id).unwrap();
		assert_eq!(reread.creation_time, 42);
		assert_eq!(bg.free_inodes(), 7);
	}

	#[test]
	fn exhaustion_returns_none() {
		let dir = tempdir().unwrap();
		let df = DirectFile::open(dir.path().join("bg2")).unwrap();
		let bf = BlockFile::new(df, 256);
		bf.set_block_count(2 + 2 + 4).unwrap();
		let cache = BlockCache::new(bf);
		let (bg, _) = BlockGroup::create(&cache, 0, 8, 4).unwrap();
		for _ in 0..4 {
			assert!(bg.try_allocate_data_block(&cache).unwrap().is_some());
		}
		assert!(bg.try_allocate_data_block(&cache).unwrap().is_none());
	}
}
