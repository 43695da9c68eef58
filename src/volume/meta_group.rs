//! A meta-group: one backing file holding a descriptor area followed by up to
//! `max_block_groups` block-group slabs.

use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::io::{BlockFile, DirectFile};
use crate::serde::OnDiskSize;
use crate::volume::block_group::{BlockGroup, BlockGroupDescriptor};
use crate::volume::superblock::Superblock;
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

fn try_sub_u64(counter: &AtomicU64) -> bool {
	counter
		.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
			if v == 0 {
				None
			} else {
				Some(v - 1)
			}
		})
		.is_ok()
}

fn try_sub_u32(counter: &AtomicU32) -> bool {
	counter
		.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
			if v == 0 {
				None
			} else {
				Some(v - 1)
			}
		})
		.is_ok()
}

/// One backing file of block-groups plus its descriptor table.
pub struct MetaGroup {
	index: u32,
	cache: BlockCache,
	descr_area_blocks: u32,
	max_block_groups: u32,
	block_group_size_blocks: u64,
	bg_inode_count: u32,
	bg_datablock_count: u32,
	alive: AtomicU32,
	groups: RwLock<Vec<Option<BlockGroup>>>,
	grow_lock: Mutex<()>,
	total_free_inodes: AtomicU64,
	existing_free_inodes: AtomicU32,
	total_free_data_blocks: AtomicU64,
	existing_free_data_blocks: AtomicU32,
}

impl MetaGroup {
	fn descriptor_bytes(index: usize, buf: &[u8]) -> Result<BlockGroupDescriptor> {
		let off = index * BlockGroupDescriptor::ON_DISK_SIZE;
		BlockGroupDescriptor::read_from(&buf[off..off + BlockGroupDescriptor::ON_DISK_SIZE])
	}

	/// Creates a brand-new, empty meta-group file at `path`.
	pub fn create(path: impl AsRef<Path>, index: u32, sb: &Superblock) -> Result<Self> {
		let file = DirectFile::open(path)?;
		let block_file = BlockFile::new(file, sb.block_size);
		block_file.set_block_count(sb.zero_bg_offset as u64 / sb.block_size as u64)?;
		let cache = BlockCache::new(block_file);
		let mg = Self {
			index,
			cache,
			descr_area_blocks: sb.descr_blocks,
			max_block_groups: sb.max_block_groups,
			block_group_size_blocks: sb.block_group_size as u64 / sb.block_size as u64,
			bg_inode_count: sb.bg_inode_count,
			bg_datablock_count: sb.bg_datablock_count,
			alive: AtomicU32::new(0),
			groups: RwLock::new((0..sb.max_block_groups).map(|_| None).collect()),
			grow_lock: Mutex::new(()),
			total_free_inodes: AtomicU64::new(sb.mg_inode_count as u64),
			existing_free_inodes: AtomicU32::new(0),
			total_free_data_blocks: AtomicU64::new(sb.mg_datablock_count as u64),
			existing_free_data_blocks: AtomicU32::new(0),
		};
		log::debug!("created meta-group {index}");
		Ok(mg)
	}

	/// Opens an existing meta-group file at `path`, reading its descriptor area and lazily
	/// attaching every live block-group.
	pub fn load(path: impl AsRef<Path>, index: u32, sb: &Superblock) -> Result<Self> {
		let file = DirectFile::open(path)?;
		let block_file = BlockFile::new(file, sb.block_size);
		let cache = BlockCache::new(block_file);

		let mut descr_bytes = vec![0u8; (sb.descr_blocks * sb.block_size) as usize];
		for b in 0..sb.descr_blocks as u64 {
			let page = cache.get_block(b)?;
			page.with(|buf| {
				let off = (b * sb.block_size as u64) as usize;
				descr_bytes[off..off + sb.block_size as usize].copy_from_slice(buf);
			});
		}

		let mut groups = Vec::with_capacity(sb.max_block_groups as usize);
		let mut alive = 0u32;
		let mut existing_free_inodes = 0u32;
		let mut existing_free_data_blocks = 0u32;
		for i in 0..sb.max_block_groups as usize {
			let descr = Self::descriptor_bytes(i, &descr_bytes)?;
			if descr.is_live() {
				let base = sb.zero_bg_offset as u64 / sb.block_size as u64
					+ i as u64 * (sb.block_group_size as u64 / sb.block_size as u64);
				let bg = BlockGroup::load(
					sb.block_size,
					base,
					sb.bg_inode_count,
					sb.bg_datablock_count,
					&descr,
				);
				existing_free_inodes += bg.free_inodes();
				existing_free_data_blocks += bg.free_data_blocks();
				groups.push(Some(bg));
				alive += 1;
			} else {
				groups.push(None);
			}
		}

		let used_inodes = (alive as u64 * sb.bg_inode_count as u64) - existing_free_inodes as u64;
		let used_blocks =
			(alive as u64 * sb.bg_datablock_count as u64) - existing_free_data_blocks as u64;
		let total_free_inodes = sb.mg_inode_count as u64 - used_inodes;
		let total_free_data_blocks = sb.mg_datablock_count as u64 - used_blocks;

		log::debug!(
			"loaded meta-group {index}: {alive} live block-groups, {existing_free_inodes} free inodes"
		);

		Ok(Self {
			index,
			cache,
			descr_area_blocks: sb.descr_blocks,
			max_block_groups: sb.max_block_groups,
			block_group_size_blocks: sb.block_group_size as u64 / sb.block_size as u64,
			bg_inode_count: sb.bg_inode_count,
			bg_datablock_count: sb.bg_datablock_count,
			alive: AtomicU32::new(alive),
			groups: RwLock::new(groups),
			grow_lock: Mutex::new(()),
			total_free_inodes: AtomicU64::new(total_free_inodes),
			existing_free_inodes: AtomicU32::new(existing_free_inodes),
			total_free_data_blocks: AtomicU64::new(total_free_data_blocks),
			existing_free_data_blocks: AtomicU32::new(existing_free_data_blocks),
		})
	}

	/// This meta-group's index within the volume.
	pub fn index(&self) -> u32 {
		self.index
	}

	/// Number of currently-live block-groups.
	pub fn alive(&self) -> u32 {
		self.alive.load(Ordering::Acquire)
	}

	/// Whether this meta-group has room to grow at least one more block-group.
	pub fn can_grow(&self) -> bool {
		self.alive() < self.max_block_groups
	}

	fn base_block_for(&self, bg_index: u32) -> u64 {
		self.descr_area_blocks as u64 + bg_index as u64 * self.block_group_size_blocks
	}

	fn grow(&self) -> Result<()> {
		let alive = self.alive.load(Ordering::Acquire);
		if alive >= self.max_block_groups {
			return Err(Error::capacity("meta-group has no more block-group slots"));
		}
		let new_len_blocks =
			self.descr_area_blocks as u64 + (alive as u64 + 1) * self.block_group_size_blocks;
		self.cache.set_block_count(new_len_blocks)?;
		let base = self.base_block_for(alive);
		let (bg, _descr) =
			BlockGroup::create(&self.cache, base, self.bg_inode_count, self.bg_datablock_count)?;
		self.groups.write()[alive as usize] = Some(bg);
		self.existing_free_inodes
			.fetch_add(self.bg_inode_count, Ordering::AcqRel);
		self.existing_free_data_blocks
			.fetch_add(self.bg_datablock_count, Ordering::AcqRel);
		self.alive.fetch_add(1, Ordering::AcqRel);
		log::info!("meta-group {} grew to {} block-groups", self.index, alive + 1);
		Ok(())
	}

	/// Allocates a local inode, returning `(block_group_index, local_inode_index)`.
	pub fn allocate_inode(&self) -> Result<Option<(u32, u32)>> {
		if !try_sub_u64(&self.total_free_inodes) {
			return Ok(None);
		}
		loop {
			if try_sub_u32(&self.existing_free_inodes) {
				break;
			}
			let _guard = self.grow_lock.lock();
			if self.existing_free_inodes.load(Ordering::Acquire) == 0 {
				self.grow()?;
			}
		}
		let groups = self.groups.read();
		let alive = self.alive.load(Ordering::Acquire);
		for bg_index in (0..alive).rev() {
			if let Some(bg) = &groups[bg_index as usize] {
				if let Some(local) = bg.try_allocate_inode(&self.cache)? {
					return Ok(Some((bg_index, local)));
				}
			}
		}
		Err(Error::corruption(
			"meta-group counters indicated a free inode but no block-group had one",
		))
	}

	/// Allocates a local data block, preferring `locality_hint` (the block-group owning the
	/// requesting inode, if any) so directory/value blocks land near their inode.
	pub fn allocate_data_block(&self, locality_hint: Option<u32>) -> Result<Option<(u32, u32)>> {
		if !try_sub_u64(&self.total_free_data_blocks) {
			return Ok(None);
		}
		loop {
			if try_sub_u32(&self.existing_free_data_blocks) {
				break;
			}
			let _guard = self.grow_lock.lock();
			if self.existing_free_data_blocks.load(Ordering::Acquire) == 0 {
				self.grow()?;
			}
		}
		let groups = self.groups.read();
		let alive = self.alive.load(Ordering::Acquire);
		if let Some(hint) = locality_hint {
			if hint < alive {
				if let Some(bg) = &groups[hint as usize] {
					if let Some(local) = bg.try_allocate_data_block(&self.cache)? {
						return Ok(Some((hint, local)));
					}
				}
			}
		}
		for bg_index in (0..alive).rev() {
			if let Some(bg) = &groups[bg_index as usize] {
				if let Some(local) = bg.try_allocate_data_block(&self.cache)? {
					return Ok(Some((bg_index, local)));
				}
			}
		}
		Err(Error::corruption(
			"meta-group counters indicated a free data block but no block-group had one",
		))
	}

	/// Frees the inode at `(bg_index, local)`.
	pub fn free_inode(&self, bg_index: u32, local: u32) -> Result<()> {
		let groups = self.groups.read();
		let bg = groups[bg_index as usize]
			.as_ref()
			.ok_or_else(|| Error::corruption("free on non-live block-group"))?;
		bg.free_inode(&self.cache, local)?;
		self.existing_free_inodes.fetch_add(1, Ordering::AcqRel);
		self.total_free_inodes.fetch_add(1, Ordering::AcqRel);
		Ok(())
	}

	/// Frees the data block at `(bg_index, local)`.
	pub fn free_data_block(&self, bg_index: u32, local: u32) -> Result<()> {
		let groups = self.groups.read();
		let bg = groups[bg_index as usize]
			.as_ref()
			.ok_or_else(|| Error::corruption("free on non-live block-group"))?;
		bg.free_data_block(&self.cache, local)?;
		self.existing_free_data_blocks.fetch_add(1, Ordering::AcqRel);
		self.total_free_data_blocks.fetch_add(1, Ordering::AcqRel);
		Ok(())
	}

	/// Reads the inode at `(bg_index, local)`.
	pub fn read_inode(&self, bg_index: u32, local: u32) -> Result<crate::volume::inode::Inode> {
		let groups = self.groups.read();
		let bg = groups[bg_index as usize]
			.as_ref()
			.ok_or_else(|| Error::corruption("read on non-live block-group"))?;
		bg.read_inode(&self.cache, local)
	}

	/// Writes `inode` at `(bg_index, local)`.
	pub fn write_inode(
		&self,
		bg_index: u32,
		local: u32,
		inode: &crate::volume::inode::Inode,
	) -> Result<()> {
		let groups = self.groups.read();
		let bg = groups[bg_index as usize]
			.as_ref()
			.ok_or_else(|| Error::corruption("write on non-live block-group"))?;
		bg.write_inode(&self.cache, local, inode)
	}

	/// Increments the directory-inode counter of block-group `bg_index`.
	pub fn inc_directory_count(&self, bg_index: u32) -> Result<()> {
		let groups = self.groups.read();
		let bg = groups[bg_index as usize]
			.as_ref()
			.ok_or_else(|| Error::corruption("directory_count update on non-live block-group"))?;
		bg.inc_directory_count();
		Ok(())
	}

	/// Decrements the directory-inode counter of block-group `bg_index`.
	pub fn dec_directory_count(&self, bg_index: u32) -> Result<()> {
		let groups = self.groups.read();
		let bg = groups[bg_index as usize]
			.as_ref()
			.ok_or_else(|| Error::corruption("directory_count update on non-live block-group"))?;
		bg.dec_directory_count();
		Ok(())
	}

	/// Returns a read-only handle on data block `(bg_index, local)`.
	pub fn get_data_block(&self, bg_index: u32, local: u32) -> Result<crate::cache::ReadPage> {
		let groups = self.groups.read();
		let bg = groups[bg_index as usize]
			.as_ref()
			.ok_or_else(|| Error::corruption("read on non-live block-group"))?;
		bg.get_data_block(&self.cache, local)
	}

	/// Returns a mutable handle on data block `(bg_index, local)`.
	pub fn get_mutable_data_block(
		&self,
		bg_index: u32,
		local: u32,
	) -> Result<crate::cache::WritePage> {
		let groups = self.groups.read();
		let bg = groups[bg_index as usize]
			.as_ref()
			.ok_or_else(|| Error::corruption("write on non-live block-group"))?;
		bg.get_mutable_data_block(&self.cache, local)
	}

	/// Flushes bitmaps/inode table pages and the descriptor area back to disk.
	pub fn flush(&self) -> Result<()> {
		let groups = self.groups.read();
		let mut descr_bytes = vec![0u8; (self.descr_area_blocks * self.cache.block_size()) as usize];
		for (i, bg) in groups.iter().enumerate() {
			if let Some(bg) = bg {
				let descr = bg.to_descriptor();
				let off = i * BlockGroupDescriptor::ON_DISK_SIZE;
				descr.write_to(&mut descr_bytes[off..off + BlockGroupDescriptor::ON_DISK_SIZE]);
			}
		}
		let block_size = self.cache.block_size() as u64;
		for b in 0..self.descr_area_blocks as u64 {
			let page = self.cache.get_mutable_block(b)?;
			let off = (b * block_size) as usize;
			page.with_mut(|buf| buf.copy_from_slice(&descr_bytes[off..off + block_size as usize]));
		}
		self.cache.flush()
	}
}

impl Drop for MetaGroup {
	fn drop(&mut self) {
		if let Err(err) = self.flush() {
			log::error!("meta-group {} flush on drop failed: {err}", self.index);
		}
	}
}
