//! A volume: a directory holding one superblock file and an ordered set of meta-group files.

pub mod block_group;
pub mod inode;
pub mod meta_group;
pub mod superblock;

use crate::error::{Error, Result};
use crate::io::DirectFile;
use crate::volume::inode::Inode;
use crate::volume::meta_group::MetaGroup;
pub use crate::volume::superblock::VolumeSettings;
use crate::volume::superblock::Superblock;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};

/// A globally-unique inode id within one volume, encoding `(meta_group, block_group, local)`.
///
/// Fixed at 32 bits: directory entries serialize `child_inode_id` as a `u32` on disk, so this
/// width is part of the on-disk format, not just an in-memory convenience.
pub type InodeId = u32;

/// A globally-unique data-block id within one volume, encoding `(meta_group, block_group, local)`.
///
/// Never itself serialized: inodes only ever store a *local* (within their own block-group) data
/// block index in their 32-bit `first_block_id` field, so this can stay 64 bits in memory without
/// affecting the on-disk format.
pub type DataBlockId = u64;

/// Well-known id of a volume's root inode, valid only for volumes opened with `ensure_root`.
pub const ROOT_INODE_ID: InodeId = 0;

fn meta_group_file_name(index: u32) -> String {
	format!("meta_group_{index:06}")
}

/// A directory-backed container of meta-groups implementing the on-disk volume format.
pub struct Volume {
	path: PathBuf,
	sb: RwLock<Superblock>,
	meta_groups: RwLock<Vec<MetaGroup>>,
	grow_lock: Mutex<()>,
	name_max_len: u32,
}

impl Volume {
	/// Opens the volume directory at `path`, creating it (and a fresh superblock) if absent.
	///
	/// When `ensure_root` is set and the volume has no meta-groups yet, a root inode
	/// ([`ROOT_INODE_ID`]) is allocated immediately.
	pub fn open(path: impl AsRef<Path>, settings: VolumeSettings, ensure_root: bool) -> Result<Self> {
		let path = path.as_ref().to_path_buf();
		std::fs::create_dir_all(&path)?;
		let sb_path = path.join("super_block");
		let sb = if sb_path.exists() {
			let file = DirectFile::open(&sb_path)?;
			let mut buf = vec![0u8; settings.block_size as usize];
			file.read_at(&mut buf, 0)?;
			Superblock::read_from(&buf)?
		} else {
			let sb = Superblock::derive(&settings);
			let file = DirectFile::open(&sb_path)?;
			file.set_len(settings.block_size as u64)?;
			let mut buf = vec![0u8; settings.block_size as usize];
			sb.write_to(&mut buf);
			file.write_at(&buf, 0)?;
			log::info!("created volume at {} ({} bytes/block)", path.display(), sb.block_size);
			sb
		};

		let mut meta_groups = Vec::with_capacity(sb.meta_group_count as usize);
		for i in 0..sb.meta_group_count {
			let mg_path = path.join(meta_group_file_name(i));
			meta_groups.push(MetaGroup::load(&mg_path, i, &sb)?);
		}

		let volume = Self {
			path,
			sb: RwLock::new(sb),
			meta_groups: RwLock::new(meta_groups),
			grow_lock: Mutex::new(()),
			name_max_len: settings.name_max_len,
		};

		if ensure_root && volume.meta_groups.read().is_empty() {
			let id = volume.allocate_inode()?;
			debug_assert_eq!(id, ROOT_INODE_ID, "first inode allocated on an empty volume must be id 0");
			log::debug!("initialized root inode for volume at {}", volume.path.display());
		}

		Ok(volume)
	}

	fn global_inode_id(&self, mg: u32, bg: u32, local: u32) -> Result<InodeId> {
		let sb = self.sb.read();
		let id = mg as u64 * sb.mg_inode_count as u64 + bg as u64 * sb.bg_inode_count as u64 + local as u64;
		u32::try_from(id).map_err(|_| Error::capacity("inode id space exhausted (32-bit on-disk limit)"))
	}

	fn decode_inode_id(&self, id: InodeId) -> (u32, u32, u32) {
		let sb = self.sb.read();
		let id = id as u64;
		let mg = id / sb.mg_inode_count as u64;
		let rem = id % sb.mg_inode_count as u64;
		let bg = rem / sb.bg_inode_count as u64;
		let local = rem % sb.bg_inode_count as u64;
		(mg as u32, bg as u32, local as u32)
	}

	/// The `(meta_group, block_group)` an inode lives in, for callers that need to allocate
	/// block-group-local resources (directory/value data blocks) alongside it.
	pub fn inode_block_group(&self, id: InodeId) -> (u32, u32) {
		let (mg, bg, _) = self.decode_inode_id(id);
		(mg, bg)
	}

	/// Resolves a data block that is known to live in the same block-group as `owner`, given only
	/// its local (block-group-relative) index, the form inodes store on disk in their 32-bit
	/// `first_block_id` fields.
	pub fn data_block_id_in_inode_group(&self, owner: InodeId, local: u32) -> DataBlockId {
		let (mg, bg) = self.inode_block_group(owner);
		self.global_data_block_id(mg, bg, local)
	}

	/// Allocates a data block in the same block-group as `owner`, returning both its global id
	/// (for immediate use) and its block-group-local index (for persisting in the owning inode).
	pub fn allocate_data_block_for(&self, owner: InodeId) -> Result<(DataBlockId, u32)> {
		let id = self.allocate_data_block(Some(owner))?;
		let (_, _, local) = self.decode_data_block_id(id);
		Ok((id, local))
	}

	/// This volume's fixed block size.
	pub fn block_size(&self) -> u32 {
		self.sb.read().block_size
	}

	/// The maximum byte length of one path component's name.
	pub fn name_max_len(&self) -> u32 {
		self.name_max_len
	}

	fn global_data_block_id(&self, mg: u32, bg: u32, local: u32) -> DataBlockId {
		let sb = self.sb.read();
		mg as u64 * sb.mg_datablock_count as u64
			+ bg as u64 * sb.bg_datablock_count as u64
			+ local as u64
	}

	fn decode_data_block_id(&self, id: DataBlockId) -> (u32, u32, u32) {
		let sb = self.sb.read();
		let mg = id / sb.mg_datablock_count as u64;
		let rem = id % sb.mg_datablock_count as u64;
		let bg = rem / sb.bg_datablock_count as u64;
		let local = rem % sb.bg_datablock_count as u64;
		(mg as u32, bg as u32, local as u32)
	}

	fn grow_meta_groups(&self) -> Result<()> {
		let _guard = self.grow_lock.lock();
		let mut sb = self.sb.write();
		let mut meta_groups = self.meta_groups.write();
		// Re-check under lock: another thread may have already grown while we waited.
		if let Some(last) = meta_groups.last() {
			if last.can_grow() {
				return Ok(());
			}
		}
		let index = meta_groups.len() as u32;
		let mg_path = self.path.join(meta_group_file_name(index));
		let mg = MetaGroup::create(&mg_path, index, &sb)?;
		meta_groups.push(mg);
		sb.meta_group_count += 1;
		log::info!("volume at {} grew to {} meta-groups", self.path.display(), sb.meta_group_count);
		Ok(())
	}

	/// Allocates a fresh inode, returning its global id.
	pub fn allocate_inode(&self) -> Result<InodeId> {
		loop {
			{
				let meta_groups = self.meta_groups.read();
				for mg in meta_groups.iter().rev() {
					if let Some((bg, local)) = mg.allocate_inode()? {
						return self.global_inode_id(mg.index(), bg, local);
					}
				}
			}
			self.grow_meta_groups()?;
		}
	}

	/// Frees inode `id`.
	pub fn deallocate_inode(&self, id: InodeId) -> Result<()> {
		let (mg, bg, local) = self.decode_inode_id(id);
		let meta_groups = self.meta_groups.read();
		let mg = meta_groups
			.get(mg as usize)
			.ok_or_else(|| Error::corruption("inode id refers to a non-existent meta-group"))?;
		mg.free_inode(bg, local)
	}

	/// Reads inode `id`.
	pub fn read_inode(&self, id: InodeId) -> Result<Inode> {
		let (mg, bg, local) = self.decode_inode_id(id);
		let meta_groups = self.meta_groups.read();
		let mg = meta_groups
			.get(mg as usize)
			.ok_or_else(|| Error::corruption("inode id refers to a non-existent meta-group"))?;
		mg.read_inode(bg, local)
	}

	/// Writes inode `id`.
	pub fn write_inode(&self, id: InodeId, inode: &Inode) -> Result<()> {
		let (mg, bg, local) = self.decode_inode_id(id);
		let meta_groups = self.meta_groups.read();
		let mg = meta_groups
			.get(mg as usize)
			.ok_or_else(|| Error::corruption("inode id refers to a non-existent meta-group"))?;
		mg.write_inode(bg, local, inode)
	}

	/// Marks the block-group owning `id` as having gained one more live directory inode.
	pub fn inc_directory_count(&self, id: InodeId) -> Result<()> {
		let (mg, bg) = self.inode_block_group(id);
		let meta_groups = self.meta_groups.read();
		let mg_ref = meta_groups
			.get(mg as usize)
			.ok_or_else(|| Error::corruption("inode id refers to a non-existent meta-group"))?;
		mg_ref.inc_directory_count(bg)
	}

	/// Marks the block-group owning `id` as having lost one live directory inode.
	pub fn dec_directory_count(&self, id: InodeId) -> Result<()> {
		let (mg, bg) = self.inode_block_group(id);
		let meta_groups = self.meta_groups.read();
		let mg_ref = meta_groups
			.get(mg as usize)
			.ok_or_else(|| Error::corruption("inode id refers to a non-existent meta-group"))?;
		mg_ref.dec_directory_count(bg)
	}

	/// Allocates a fresh data block, preferring to land in the same block-group as `owner`
	/// (if given) for locality.
	pub fn allocate_data_block(&self, owner: Option<InodeId>) -> Result<DataBlockId> {
		let owner_loc = owner.map(|id| self.decode_inode_id(id));
		loop {
			{
				let meta_groups = self.meta_groups.read();
				for mg in meta_groups.iter().rev() {
					let hint = owner_loc
						.filter(|(owner_mg, _, _)| *owner_mg == mg.index())
						.map(|(_, bg, _)| bg);
					if let Some((bg, local)) = mg.allocate_data_block(hint)? {
						return Ok(self.global_data_block_id(mg.index(), bg, local));
					}
				}
			}
			self.grow_meta_groups()?;
		}
	}

	/// Frees data block `id`.
	pub fn deallocate_data_block(&self, id: DataBlockId) -> Result<()> {
		let (mg, bg, local) = self.decode_data_block_id(id);
		let meta_groups = self.meta_groups.read();
		let mg = meta_groups
			.get(mg as usize)
			.ok_or_else(|| Error::corruption("data block id refers to a non-existent meta-group"))?;
		mg.free_data_block(bg, local)
	}

	/// Returns a read-only handle on data block `id`.
	pub fn get_data_block(&self, id: DataBlockId) -> Result<crate::cache::ReadPage> {
		let (mg, bg, local) = self.decode_data_block_id(id);
		let meta_groups = self.meta_groups.read();
		let mg_ref = meta_groups
			.get(mg as usize)
			.ok_or_else(|| Error::corruption("data block id refers to a non-existent meta-group"))?;
		mg_ref.get_data_block(bg, local)
	}

	/// Returns a mutable handle on data block `id`.
	pub fn get_mutable_data_block(&self, id: DataBlockId) -> Result<crate::cache::WritePage> {
		let (mg, bg, local) = self.decode_data_block_id(id);
		let meta_groups = self.meta_groups.read();
		let mg_ref = meta_groups
			.get(mg as usize)
			.ok_or_else(|| Error::corruption("data block id refers to a non-existent meta-group"))?;
		mg_ref.get_mutable_data_block(bg, local)
	}

	/// Flushes every meta-group and the superblock to disk.
	pub fn flush(&self) -> Result<()> {
		for mg in self.meta_groups.read().iter() {
			mg.flush()?;
		}
		let sb = self.sb.read();
		let sb_path = self.path.join("super_block");
		let file = DirectFile::open(&sb_path)?;
		let mut buf = vec![0u8; sb.block_size as usize];
		sb.write_to(&mut buf);
		file.write_at(&buf, 0)?;
		Ok(())
	}

	/// The directory this volume is backed by.
	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for Volume {
	fn drop(&mut self) {
		if let Err(err) = self.flush() {
			log::error!("volume at {} flush on drop failed: {err}", self.path.display());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	fn open(dir: &Path) -> Volume {
		Volume::open(dir, VolumeSettings::default(), true).unwrap()
	}

	#[test]
	fn inode_ids_are_sequential_and_survive_reopen_then_reuse_freed_id() {
		let dir = tempdir().unwrap();
		let first_ids: Vec<_> = {
			let vol = open(dir.path());
			let ids: Vec<_> = (0..10u32)
				.map(|i| {
					let id = vol.allocate_inode().unwrap();
					let mut inode = vol.read_inode(id).unwrap();
					inode.creation_time = i;
					vol.write_inode(id, &inode).unwrap();
					id
				})
				.collect();
			ids
		};
		assert_eq!(first_ids, (0..10).collect::<Vec<_>>());

		let vol = open(dir.path());
		for i in 0..10u32 {
			assert_eq!(vol.read_inode(i).unwrap().creation_time, i);
		}
		let second_ids: Vec<_> = (0..10u32).map(|_| vol.allocate_inode().unwrap()).collect();
		assert_eq!(second_ids, (10..20).collect::<Vec<_>>());

		vol.deallocate_inode(7).unwrap();
		assert_eq!(vol.allocate_inode().unwrap(), 7);
	}

	#[test]
	fn data_block_roundtrips_and_frees() {
		let dir = tempdir().unwrap();
		let vol = open(dir.path());
		let owner = vol.allocate_inode().unwrap();
		let id = vol.allocate_data_block(Some(owner)).unwrap();
		{
			let page = vol.get_mutable_data_block(id).unwrap();
			page.with_mut(|buf| buf[..4].copy_from_slice(&42u32.to_le_bytes()));
		}
		let page = vol.get_data_block(id).unwrap();
		let read_back = page.with(|buf| u32::from_le_bytes(buf[..4].try_into().unwrap()));
		assert_eq!(read_back, 42);
		vol.deallocate_data_block(id).unwrap();
	}
}
