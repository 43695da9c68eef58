//! Directory-entry and typed-value operations layered on top of a [`Volume`]'s raw inodes and
//! data blocks.
//!
//! An [`InodeDataOps`] does not own any state of its own: it is a thin, stateless façade over a
//! borrowed [`Volume`] that knows how to encode/decode the two things an inode's data blocks ever
//! hold (a directory-entry list, or a single typed [`Value`]) and the allocate/free bookkeeping
//! that goes with each.

use crate::error::{Error, Result};
use crate::value::Value;
use crate::volume::inode::{DirSlot, Inode, ValueSlot, ValueTag};
use crate::volume::{InodeId, Volume};
use std::fmt::Write as _;

/// One decoded directory entry: a child's inode id and its name.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
	/// The child inode's id.
	pub inode: InodeId,
	/// The child's name within its parent.
	pub name: String,
}

fn encode_dir_block(entries: &[DirEntry], buf: &mut [u8]) -> Result<usize> {
	if entries.len() > u16::MAX as usize {
		return Err(Error::capacity("too many directory entries for one block"));
	}
	let mut pos = 2;
	for e in entries {
		let name_bytes = e.name.as_bytes();
		if name_bytes.len() > u8::MAX as usize {
			return Err(Error::bad_input("name longer than 255 bytes"));
		}
		let needed = pos + 4 + 1 + name_bytes.len();
		if needed > buf.len() {
			return Err(Error::capacity("directory block full"));
		}
		buf[pos..pos + 4].copy_from_slice(&e.inode.to_le_bytes());
		pos += 4;
		buf[pos] = name_bytes.len() as u8;
		pos += 1;
		buf[pos..pos + name_bytes.len()].copy_from_slice(name_bytes);
		pos += name_bytes.len();
	}
	buf[..2].copy_from_slice(&(entries.len() as u16).to_le_bytes());
	Ok(pos)
}

fn decode_dir_block(buf: &[u8]) -> Result<Vec<DirEntry>> {
	let count = u16::from_le_bytes(buf[0..2].try_into().unwrap()) as usize;
	let mut pos = 2;
	let mut entries = Vec::with_capacity(count);
	for _ in 0..count {
		if pos + 5 > buf.len() {
			return Err(Error::corruption("directory block truncated"));
		}
		let inode = InodeId::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
		pos += 4;
		let name_len = buf[pos] as usize;
		pos += 1;
		if pos + name_len > buf.len() {
			return Err(Error::corruption("directory entry name runs past block end"));
		}
		let name = String::from_utf8(buf[pos..pos + name_len].to_vec())
			.map_err(|_| Error::corruption("directory entry name is not valid UTF-8"))?;
		pos += name_len;
		entries.push(DirEntry { inode, name });
	}
	Ok(entries)
}

/// Directory-entry and typed-value operations over a [`Volume`]'s inodes.
pub struct InodeDataOps<'v> {
	volume: &'v Volume,
}

impl<'v> InodeDataOps<'v> {
	/// Borrows `volume` for directory and value operations.
	pub fn new(volume: &'v Volume) -> Self {
		Self { volume }
	}

	fn check_name(&self, name: &str) -> Result<()> {
		if name.is_empty() {
			return Err(Error::bad_input("empty name"));
		}
		if name.len() > self.volume.name_max_len() as usize {
			return Err(Error::bad_input(format!(
				"name {name:?} exceeds the {}-byte limit",
				self.volume.name_max_len()
			)));
		}
		Ok(())
	}

	/// Looks up `name` under `parent`, returning its inode if present.
	pub fn lookup_child(&self, parent: InodeId, name: &str) -> Result<Option<(InodeId, Inode)>> {
		self.check_name(name)?;
		let parent_inode = self.volume.read_inode(parent)?;
		let entries = self.read_dir_block_owned(parent, &parent_inode)?;
		match entries.into_iter().find(|e| e.name == name) {
			Some(e) => Ok(Some((e.inode, self.volume.read_inode(e.inode)?))),
			None => Ok(None),
		}
	}

	// A directory's data block holds a block-group-local index in `dir.first_block_id`, so
	// resolving it to a global id needs the owning (parent) inode for locality, not the block
	// id alone.
	fn read_dir_block_owned(&self, parent_id: InodeId, parent_inode: &Inode) -> Result<Vec<DirEntry>> {
		if !parent_inode.dir.has_children {
			return Ok(Vec::new());
		}
		let block_id = self
			.volume
			.data_block_id_in_inode_group(parent_id, parent_inode.dir.first_block_id);
		let page = self.volume.get_data_block(block_id)?;
		page.with(decode_dir_block)
	}

	/// Lists every child of `parent` in insertion order.
	pub fn list_children(&self, parent: InodeId) -> Result<Vec<DirEntry>> {
		let parent_inode = self.volume.read_inode(parent)?;
		self.read_dir_block_owned(parent, &parent_inode)
	}

	/// Adds a fresh child inode named `name` under `parent`. Fails with
	/// [`Error::DuplicateChild`] if the name already exists.
	pub fn add_child(&self, parent: InodeId, name: &str) -> Result<InodeId> {
		self.check_name(name)?;
		let mut parent_inode = self.volume.read_inode(parent)?;
		let mut entries = self.read_dir_block_owned(parent, &parent_inode)?;
		if entries.iter().any(|e| e.name == name) {
			return Err(Error::DuplicateChild {
				parent: parent as u64,
				name: name.to_string(),
			});
		}
		let child_id = self.volume.allocate_inode()?;
		let child_inode = Inode::empty();
		if let Err(err) = self.volume.write_inode(child_id, &child_inode) {
			let _ = self.volume.deallocate_inode(child_id);
			return Err(err);
		}
		entries.push(DirEntry {
			inode: child_id,
			name: name.to_string(),
		});

		let block_size = self.volume.block_size() as usize;
		let mut buf = vec![0u8; block_size];
		if let Err(err) = encode_dir_block(&entries, &mut buf) {
			let _ = self.volume.deallocate_inode(child_id);
			return Err(err);
		}

		if parent_inode.dir.has_children {
			let block_id = self
				.volume
				.data_block_id_in_inode_group(parent, parent_inode.dir.first_block_id);
			let page = self.volume.get_mutable_data_block(block_id)?;
			page.with_mut(|dst| dst.copy_from_slice(&buf));
		} else {
			let (block_id, local) = self.volume.allocate_data_block_for(parent)?;
			let page = self.volume.get_mutable_data_block(block_id)?;
			page.with_mut(|dst| dst.copy_from_slice(&buf));
			parent_inode.dir = DirSlot {
				has_children: true,
				block_count: 1,
				first_block_id: local,
			};
			self.volume.inc_directory_count(parent)?;
		}
		parent_inode.dir.block_count = 1;
		self.volume.write_inode(parent, &parent_inode)?;
		Ok(child_id)
	}

	/// Looks up `name` under `parent`, creating it if absent. Idempotent: repeated calls return
	/// the same inode id.
	pub fn ensure_child(&self, parent: InodeId, name: &str) -> Result<InodeId> {
		if let Some((id, _)) = self.lookup_child(parent, name)? {
			return Ok(id);
		}
		match self.add_child(parent, name) {
			Ok(id) => Ok(id),
			Err(Error::DuplicateChild { .. }) => {
				// Lost a race with a concurrent `add_child` of the same name; the winner's
				// entry is authoritative.
				let (id, _) = self
					.lookup_child(parent, name)?
					.ok_or_else(|| Error::corruption("duplicate child vanished after race"))?;
				Ok(id)
			}
			Err(err) => Err(err),
		}
	}

	/// Removes `name` from `parent`. Fails with [`Error::ConstraintViolated`] if the child still
	/// has children of its own.
	pub fn remove_child(&self, parent: InodeId, name: &str) -> Result<()> {
		self.check_name(name)?;
		let mut parent_inode = self.volume.read_inode(parent)?;
		let mut entries = self.read_dir_block_owned(parent, &parent_inode)?;
		let pos = entries
			.iter()
			.position(|e| e.name == name)
			.ok_or_else(|| Error::not_found(format!("no child named {name:?}")))?;
		let child_id = entries[pos].inode;
		let child_inode = self.volume.read_inode(child_id)?;
		if child_inode.dir.has_children {
			return Err(Error::constraint(format!(
				"cannot remove {name:?}: it still has children"
			)));
		}
		if child_inode.value.block_count != 0 {
			self.unset_value(child_id)?;
		}
		self.volume.deallocate_inode(child_id)?;
		entries.remove(pos);

		if entries.is_empty() {
			let block_id = self
				.volume
				.data_block_id_in_inode_group(parent, parent_inode.dir.first_block_id);
			self.volume.deallocate_data_block(block_id)?;
			parent_inode.dir = DirSlot::default();
			self.volume.dec_directory_count(parent)?;
		} else {
			let block_size = self.volume.block_size() as usize;
			let mut buf = vec![0u8; block_size];
			encode_dir_block(&entries, &mut buf)?;
			let block_id = self
				.volume
				.data_block_id_in_inode_group(parent, parent_inode.dir.first_block_id);
			let page = self.volume.get_mutable_data_block(block_id)?;
			page.with_mut(|dst| dst.copy_from_slice(&buf));
		}
		self.volume.write_inode(parent, &parent_inode)?;
		Ok(())
	}

	/// Sets `inode`'s value, allocating a data block on first write. Setting
	/// [`Value::None`] is equivalent to [`InodeDataOps::unset_value`].
	pub fn set_value(&self, inode: InodeId, value: &Value, deadline: u32) -> Result<()> {
		if value.is_none() {
			return self.unset_value(inode);
		}
		let mut rec = self.volume.read_inode(inode)?;
		let block_size = self.volume.block_size() as usize;
		let mut buf = vec![0u8; block_size];
		let len = value.encode(&mut buf)?;

		let block_id = if rec.value.block_count == 0 {
			let (block_id, local) = self.volume.allocate_data_block_for(inode)?;
			rec.value.first_block_id = local;
			block_id
		} else {
			self.volume
				.data_block_id_in_inode_group(inode, rec.value.first_block_id)
		};
		let page = self.volume.get_mutable_data_block(block_id)?;
		page.with_mut(|dst| dst[..len].copy_from_slice(&buf[..len]));

		rec.value.tag = value.tag();
		rec.value.block_count = 1;
		rec.value.deadline = deadline;
		self.volume.write_inode(inode, &rec)?;
		Ok(())
	}

	/// Reads `inode`'s current value, or [`Value::None`] if unset.
	pub fn get_value(&self, inode: InodeId) -> Result<Value> {
		let rec = self.volume.read_inode(inode)?;
		if rec.value.tag == ValueTag::Undefined || rec.value.block_count == 0 {
			return Ok(Value::None);
		}
		let block_id = self
			.volume
			.data_block_id_in_inode_group(inode, rec.value.first_block_id);
		let page = self.volume.get_data_block(block_id)?;
		page.with(|buf| Value::decode(rec.value.tag, buf))
	}

	/// Clears `inode`'s value, freeing its data block. No-op if already unset.
	pub fn unset_value(&self, inode: InodeId) -> Result<()> {
		let mut rec = self.volume.read_inode(inode)?;
		if rec.value.block_count == 0 {
			return Ok(());
		}
		let block_id = self
			.volume
			.data_block_id_in_inode_group(inode, rec.value.first_block_id);
		self.volume.deallocate_data_block(block_id)?;
		rec.value = ValueSlot::default();
		self.volume.write_inode(inode, &rec)?;
		Ok(())
	}

	/// Produces a deterministic, ASCII-sorted pretty-print of the tree rooted at `root` (inode 0
	/// on a volume opened with `ensure_root`), one line per entry, children indented two spaces
	/// per level. Intended for golden-style tests, not for machine parsing.
	pub fn dump_tree(&self, root: InodeId) -> Result<String> {
		let mut out = String::new();
		self.dump_tree_at(root, 0, &mut out)?;
		Ok(out)
	}

	fn dump_tree_at(&self, inode_id: InodeId, depth: usize, out: &mut String) -> Result<()> {
		let mut entries = self.list_children(inode_id)?;
		entries.sort_by(|a, b| a.name.cmp(&b.name));
		for entry in entries {
			let inode = self.volume.read_inode(entry.inode)?;
			let value = self.get_value(entry.inode)?;
			writeln!(
				out,
				"{}{} (#{}) = {:?}",
				"  ".repeat(depth),
				entry.name,
				entry.inode,
				value
			)
			.expect("writing to a String cannot fail");
			if inode.dir.has_children {
				self.dump_tree_at(entry.inode, depth + 1, out)?;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::volume::superblock::VolumeSettings;
	use crate::volume::{Volume, ROOT_INODE_ID};
	use tempfile::tempdir;

	fn open_volume(dir: &std::path::Path) -> Volume {
		Volume::open(dir, VolumeSettings::default(), true).unwrap()
	}

	#[test]
	fn directory_insertion_order_and_ids() {
		let dir = tempdir().unwrap();
		let vol = open_volume(dir.path());
		let ops = InodeDataOps::new(&vol);
		let names = ["bin", "sbin", "root", "home", "etc"];
		let ids: Vec<_> = names
			.iter()
			.map(|n| ops.add_child(ROOT_INODE_ID, n).unwrap())
			.collect();
		assert_eq!(ids, vec![1, 2, 3, 4, 5]);
		let listed = ops.list_children(ROOT_INODE_ID).unwrap();
		let expect: Vec<_> = names
			.iter()
			.zip(ids.iter())
			.map(|(n, i)| DirEntry {
				inode: *i,
				name: n.to_string(),
			})
			.collect();
		assert_eq!(listed, expect);
	}

	#[test]
	fn duplicate_add_is_rejected_but_ensure_is_idempotent() {
		let dir = tempdir().unwrap();
		let vol = open_volume(dir.path());
		let ops = InodeDataOps::new(&vol);
		let id = ops.add_child(ROOT_INODE_ID, "bin").unwrap();
		assert!(matches!(
			ops.add_child(ROOT_INODE_ID, "bin"),
			Err(Error::DuplicateChild { .. })
		));
		assert_eq!(ops.ensure_child(ROOT_INODE_ID, "bin").unwrap(), id);
	}

	#[test]
	fn typed_values_roundtrip_and_overwrite() {
		let dir = tempdir().unwrap();
		let vol = open_volume(dir.path());
		let ops = InodeDataOps::new(&vol);
		let sbin = ops.add_child(ROOT_INODE_ID, "sbin").unwrap();
		ops.set_value(sbin, &Value::U32(777), 0).unwrap();
		assert_eq!(ops.get_value(sbin).unwrap(), Value::U32(777));

		let trofimenkov = ops.add_child(ROOT_INODE_ID, "trofimenkov").unwrap();
		ops.set_value(trofimenkov, &Value::String("Handsome".to_string()), 0)
			.unwrap();
		ops.set_value(trofimenkov, &Value::F32(1.46), 0).unwrap();
		assert_eq!(ops.get_value(trofimenkov).unwrap(), Value::F32(1.46));

		ops.unset_value(trofimenkov).unwrap();
		assert_eq!(ops.get_value(trofimenkov).unwrap(), Value::None);
		ops.set_value(trofimenkov, &Value::U32(1987), 0).unwrap();
	}

	#[test]
	fn value_survives_close_reopen() {
		let dir = tempdir().unwrap();
		let trofimenkov_id;
		{
			let vol = open_volume(dir.path());
			let ops = InodeDataOps::new(&vol);
			trofimenkov_id = ops.add_child(ROOT_INODE_ID, "trofimenkov").unwrap();
			ops.set_value(trofimenkov_id, &Value::U32(1987), 0).unwrap();
		}
		let vol = open_volume(dir.path());
		let ops = InodeDataOps::new(&vol);
		assert_eq!(ops.get_value(trofimenkov_id).unwrap(), Value::U32(1987));
	}

	#[test]
	fn remove_child_frees_inode_for_reuse() {
		let dir = tempdir().unwrap();
		let vol = open_volume(dir.path());
		let ops = InodeDataOps::new(&vol);
		for n in ["a", "b", "c"] {
			ops.add_child(ROOT_INODE_ID, n).unwrap();
		}
		ops.remove_child(ROOT_INODE_ID, "b").unwrap();
		assert!(ops.lookup_child(ROOT_INODE_ID, "b").unwrap().is_none());
		let d = ops.add_child(ROOT_INODE_ID, "d").unwrap();
		assert_eq!(d, 2, "freed inode id 2 (b's) should be reused");
	}

	#[test]
	fn remove_child_with_children_is_rejected() {
		let dir = tempdir().unwrap();
		let vol = open_volume(dir.path());
		let ops = InodeDataOps::new(&vol);
		let parent = ops.add_child(ROOT_INODE_ID, "parent").unwrap();
		ops.add_child(parent, "child").unwrap();
		assert!(matches!(
			ops.remove_child(ROOT_INODE_ID, "parent"),
			Err(Error::ConstraintViolated(_))
		));
	}

	#[test]
	fn dump_tree_is_ascii_sorted_and_stable_across_reopen() {
		let dir = tempdir().unwrap();
		let before;
		{
			let vol = open_volume(dir.path());
			let ops = InodeDataOps::new(&vol);
			for n in ["zeta", "alpha", "mid"] {
				let id = ops.add_child(ROOT_INODE_ID, n).unwrap();
				ops.set_value(id, &Value::Bool(true), 0).unwrap();
			}
			before = ops.dump_tree(ROOT_INODE_ID).unwrap();
		}
		let vol = open_volume(dir.path());
		let ops = InodeDataOps::new(&vol);
		let after = ops.dump_tree(ROOT_INODE_ID).unwrap();
		assert_eq!(before, after);
		let lines: Vec<_> = before.lines().collect();
		assert!(lines[0].starts_with("alpha"));
		assert!(lines[1].starts_with("mid"));
		assert!(lines[2].starts_with("zeta"));
	}
}
