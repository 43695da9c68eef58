//! The public façade: [`StorageBuilder`] assembles a root volume plus its mounts into one
//! [`Storage`], which then exposes `get`/`set`/`erase` over the combined namespace.

use crate::error::{Error, Result};
use crate::ops::InodeDataOps;
use crate::value::Value;
use crate::vfs::dentry::{release, step_path};
use crate::vfs::{Dentry, DentryCache, Mount, MountTable};
use crate::volume::{InodeId, Volume};
use std::sync::Arc;

fn validate_absolute(path: &str) -> Result<()> {
	if path.is_empty() || !path.starts_with('/') {
		return Err(Error::bad_input(format!("path {path:?} must be absolute (start with '/')")));
	}
	Ok(())
}

/// Splits an absolute path into its directory prefix (with trailing separator kept) and final
/// component. `/a/b/c` becomes `("/a/b/", "c")`; `/a` becomes `("/", "a")`.
fn split_path(path: &str) -> Result<(String, String)> {
	validate_absolute(path)?;
	let trimmed = path.trim_end_matches('/');
	if trimmed.is_empty() {
		return Err(Error::bad_input("path has no final component"));
	}
	let sep = trimmed.rfind('/').expect("validated path starts with '/'");
	Ok((trimmed[..=sep].to_string(), trimmed[sep + 1..].to_string()))
}

/// One resolved hop, kept around only long enough to release its `prevent_removal` hold once the
/// resolution that acquired it is done with it.
type Handle = (Arc<Volume>, InodeId, Arc<Dentry>);

/// The final position `resolve` lands on: the volume it lives in, its parent's inode id (to
/// release the cache hold through), and its dentry (to gate `get_value`/`set_value` through).
struct Resolved {
	volume: Arc<Volume>,
	parent_id: InodeId,
	dentry: Arc<Dentry>,
}

impl Resolved {
	fn id(&self) -> InodeId {
		self.dentry.inode_id().expect("resolved dentry must carry an inode id")
	}
}

/// Builds a [`Storage`] from a root volume plus zero or more mounts.
pub struct StorageBuilder {
	root_volume: Arc<Volume>,
	mounts: Vec<(String, Arc<Volume>, Option<String>)>,
}

impl StorageBuilder {
	fn new(root_volume: Arc<Volume>) -> Self {
		Self {
			root_volume,
			mounts: Vec::new(),
		}
	}

	/// Queues mounting `volume` at `mount_point` (creating intermediate directories as needed).
	/// When `src_subdir` is given, the subtree exposed is `volume`'s `src_subdir` rather than its
	/// root. Mounts are installed in the order queued; the most recently queued mount at a given
	/// point is the one reads prefer.
	pub fn mount(mut self, mount_point: impl Into<String>, volume: Arc<Volume>, src_subdir: Option<&str>) -> Self {
		self.mounts.push((mount_point.into(), volume, src_subdir.map(str::to_string)));
		self
	}

	/// Assembles the queued mounts into a [`Storage`].
	pub fn build(self) -> Result<Storage> {
		let storage = Storage {
			cache: DentryCache::new(),
			mount_table: MountTable::new(),
			root: Mount {
				dentry: Dentry::root(self.root_volume.clone()),
				volume: self.root_volume,
			},
		};
		for (mount_point, volume, src_subdir) in self.mounts {
			storage.mount(&mount_point, volume, src_subdir.as_deref())?;
		}
		Ok(storage)
	}
}

/// An embeddable hierarchical key-attribute store combining a root volume with overlay mounts.
///
/// Every method may be called concurrently from any number of threads: the dentry cache and
/// underlying block cache carry their own locking (see [`crate::vfs`] and [`crate::cache`]).
pub struct Storage {
	cache: DentryCache,
	mount_table: MountTable,
	root: Mount,
}

impl Storage {
	/// Starts building a [`Storage`] rooted at `root_volume`.
	pub fn builder(root_volume: Arc<Volume>) -> StorageBuilder {
		StorageBuilder::new(root_volume)
	}

	/// Installs `volume` as a mount at `mount_point`, exposing `volume`'s `src_subdir` (or its
	/// root, if `None`) there. Intermediate directories on `mount_point` are created as plain
	/// directories in whichever volume currently owns that path. Two calls naming the same
	/// `(volume, src_subdir)` pair share one canonical mounted dentry.
	pub fn mount(&self, mount_point: &str, volume: Arc<Volume>, src_subdir: Option<&str>) -> Result<()> {
		validate_absolute(mount_point)?;
		let mut handles = Vec::new();
		let target = self.walk_dirs(self.root.clone(), &mount_point[1..], true, &mut handles)?;
		self.release_all(&handles);
		let target = target.expect("create=true walk always yields a position or propagates an error");

		let mounted_dentry = self.mount_table.resolve(&self.cache, &volume, src_subdir.unwrap_or(""))?;
		target.dentry.push_mount(Mount {
			dentry: mounted_dentry,
			volume: volume.clone(),
		});
		log::info!(
			"mounted volume at {mount_point} (src_subdir={})",
			src_subdir.unwrap_or("/")
		);
		Ok(())
	}

	/// Walks each non-empty `/`-separated component of `dirs`, following the current position's
	/// newest mount overlay (if any) at every step. Returns `None` only when `create = false` and
	/// some component doesn't resolve; with `create = true` every component is materialized and
	/// this always returns `Some(_)` or propagates an error.
	fn walk_dirs(&self, start: Mount, dirs: &str, create: bool, handles: &mut Vec<Handle>) -> Result<Option<Mount>> {
		let mut cur = start;
		for comp in dirs.split('/').filter(|s| !s.is_empty()) {
			let base = cur.dentry.mount_stack_snapshot().last().cloned().unwrap_or_else(|| cur.clone());
			let parent_id = base
				.dentry
				.inode_id()
				.ok_or_else(|| Error::corruption("walking through a non-existent directory dentry"))?;
			match step_path(&self.cache, &base, comp, create)? {
				Some(d) => {
					handles.push((base.volume.clone(), parent_id, d.clone()));
					cur = Mount {
						volume: base.volume,
						dentry: d,
					};
				}
				None => return Ok(None),
			}
		}
		Ok(Some(cur))
	}

	fn release_all(&self, handles: &[Handle]) {
		for (volume, parent_id, dentry) in handles {
			release(&self.cache, volume, *parent_id, dentry);
		}
	}

	/// Resolves `path` to its final component's dentry, holding a `prevent_removal` lease on it
	/// until the caller releases it.
	///
	/// The final component is always looked up across every mount newest to oldest first (the
	/// first one that already has it wins, which is what lets `set("/home/leva", ...)` update an
	/// existing entry in an older mount in place rather than shadowing it with a fresh one in the
	/// newest). With `create = false`, a miss across the whole stack resolves to `Ok(None)` and
	/// nothing is created. With `create = true`, a miss across the whole stack falls back to
	/// creating the entry in the newest mount.
	///
	/// Intermediate directories (everything but the final component) never get this fallback
	/// scan: each step simply follows the current position's newest mount.
	fn resolve(&self, path: &str, create: bool) -> Result<Option<Resolved>> {
		let (dirs, key) = split_path(path)?;
		let mut handles = Vec::new();
		let dir_mount = match self.walk_dirs(self.root.clone(), &dirs, create, &mut handles)? {
			Some(m) => m,
			None => {
				self.release_all(&handles);
				return Ok(None);
			}
		};

		let stack = dir_mount.dentry.mount_stack_snapshot();
		let mut found: Option<Handle> = None;
		if !stack.is_empty() {
			for m in stack.iter().rev() {
				let parent_id = match m.dentry.inode_id() {
					Some(id) => id,
					None => continue,
				};
				if let Some(d) = step_path(&self.cache, m, &key, false)? {
					found = Some((m.volume.clone(), parent_id, d));
					break;
				}
			}
			if found.is_none() && create {
				let newest = stack.last().expect("checked non-empty").clone();
				let parent_id = newest
					.dentry
					.inode_id()
					.ok_or_else(|| Error::corruption("mount target dentry has no inode"))?;
				let d = step_path(&self.cache, &newest, &key, true)?
					.expect("create=true always yields a dentry or propagates an error");
				found = Some((newest.volume, parent_id, d));
			}
		} else {
			let parent_id = dir_mount
				.dentry
				.inode_id()
				.ok_or_else(|| Error::corruption("resolved directory dentry has no inode"))?;
			if let Some(d) = step_path(&self.cache, &dir_mount, &key, create)? {
				found = Some((dir_mount.volume.clone(), parent_id, d));
			}
		}

		self.release_all(&handles);
		Ok(found.map(|(volume, parent_id, dentry)| Resolved { volume, parent_id, dentry }))
	}

	/// Reads the value stored at `path`, or [`Value::None`] if `path` does not resolve. Never
	/// creates anything.
	pub fn get(&self, path: &str) -> Result<Value> {
		match self.resolve(path, false)? {
			Some(r) => {
				let _value_guard = r.dentry.value_read();
				let result = InodeDataOps::new(&r.volume).get_value(r.id());
				drop(_value_guard);
				release(&self.cache, &r.volume, r.parent_id, &r.dentry);
				result
			}
			None => Ok(Value::None),
		}
	}

	/// Sets the value at `path`, creating intermediate directories (and the final entry itself,
	/// as a plain directory with no value) as needed in the appropriate volume, then writing
	/// `value` there with the given `deadline`.
	pub fn set(&self, path: &str, value: Value, deadline: u32) -> Result<()> {
		let r = self
			.resolve(path, true)?
			.ok_or_else(|| Error::corruption("create=true resolution returned no position"))?;
		let _value_guard = r.dentry.value_write();
		let result = InodeDataOps::new(&r.volume).set_value(r.id(), &value, deadline);
		drop(_value_guard);
		release(&self.cache, &r.volume, r.parent_id, &r.dentry);
		result
	}

	/// Clears the value at `path`. Fails with [`Error::NotFound`] if `path` does not resolve; has
	/// no side effects in that case. Does not remove the entry or its intermediate directories.
	pub fn erase(&self, path: &str) -> Result<()> {
		let r = self
			.resolve(path, false)?
			.ok_or_else(|| Error::not_found(path.to_string()))?;
		let _value_guard = r.dentry.value_write();
		let result = InodeDataOps::new(&r.volume).unset_value(r.id());
		drop(_value_guard);
		release(&self.cache, &r.volume, r.parent_id, &r.dentry);
		result
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::volume::superblock::VolumeSettings;
	use tempfile::tempdir;

	fn open(dir: &std::path::Path, name: &str) -> Arc<Volume> {
		Arc::new(Volume::open(dir.join(name), VolumeSettings::default(), true).unwrap())
	}

	#[test]
	fn set_then_get_roundtrips() {
		let dir = tempdir().unwrap();
		let root = open(dir.path(), "root");
		let storage = Storage::builder(root).build().unwrap();
		storage.set("/a/b/c", Value::U32(42), 0).unwrap();
		assert_eq!(storage.get("/a/b/c").unwrap(), Value::U32(42));
	}

	#[test]
	fn get_on_missing_path_is_none() {
		let dir = tempdir().unwrap();
		let root = open(dir.path(), "root");
		let storage = Storage::builder(root).build().unwrap();
		assert_eq!(storage.get("/nope").unwrap(), Value::None);
	}

	#[test]
	fn erase_on_missing_path_is_not_found() {
		let dir = tempdir().unwrap();
		let root = open(dir.path(), "root");
		let storage = Storage::builder(root).build().unwrap();
		assert!(matches!(storage.erase("/nope"), Err(Error::NotFound(_))));
	}

	#[test]
	fn set_none_is_equivalent_to_erase() {
		let dir = tempdir().unwrap();
		let root = open(dir.path(), "root");
		let storage = Storage::builder(root).build().unwrap();
		storage.set("/k", Value::U32(5), 0).unwrap();
		storage.set("/k", Value::None, 0).unwrap();
		assert_eq!(storage.get("/k").unwrap(), Value::None);
	}

	#[test]
	fn newest_mount_wins_on_read_and_absorbs_writes() {
		let dir = tempdir().unwrap();
		let root = open(dir.path(), "root");
		let home_v0 = open(dir.path(), "home_v0");
		let home_v1 = open(dir.path(), "home_v1");
		let home_v2 = open(dir.path(), "home_v2");

		{
			let ops = InodeDataOps::new(&home_v0);
			let lazy = ops.add_child(crate::volume::ROOT_INODE_ID, "lazy").unwrap();
			ops.set_value(lazy, &Value::String("old-lazy-attr".to_string()), 0).unwrap();
		}
		{
			let ops = InodeDataOps::new(&home_v1);
			let leva = ops.add_child(crate::volume::ROOT_INODE_ID, "leva").unwrap();
			ops.set_value(leva, &Value::U32(40), 0).unwrap();
		}
		{
			let ops = InodeDataOps::new(&home_v2);
			let lazy = ops.add_child(crate::volume::ROOT_INODE_ID, "lazy").unwrap();
			ops.set_value(lazy, &Value::String("new-lazy-attr".to_string()), 0).unwrap();
		}

		let storage = Storage::builder(root)
			.mount("/home", home_v0, None)
			.mount("/home", home_v1, None)
			.mount("/home", home_v2, None)
			.build()
			.unwrap();

		assert_eq!(
			storage.get("/home/lazy").unwrap(),
			Value::String("new-lazy-attr".to_string())
		);
		assert_eq!(storage.get("/home/leva").unwrap(), Value::U32(40));

		storage.set("/home/leva", Value::U32(42), 0).unwrap();
		assert_eq!(storage.get("/home/leva").unwrap(), Value::U32(42));

		storage.set("/home/alex-sh/philosophy/fromm", Value::String("Erich Fromm".to_string()), 0).unwrap();
		assert_eq!(
			storage.get("/home/alex-sh/philosophy/fromm").unwrap(),
			Value::String("Erich Fromm".to_string())
		);
	}

	#[test]
	fn subdir_mount_exposes_nested_tree_without_aliasing_target() {
		let dir = tempdir().unwrap();
		let root_new = open(dir.path(), "root_new");
		let root_old = open(dir.path(), "root_old");
		{
			let ops = InodeDataOps::new(&root_old);
			let bin = ops.add_child(crate::volume::ROOT_INODE_ID, "bin").unwrap();
			let du = ops.add_child(bin, "du").unwrap();
			ops.set_value(du, &Value::U32(111), 0).unwrap();
		}

		let storage = Storage::builder(root_new).mount("/bin", root_old, Some("/bin")).build().unwrap();
		assert_eq!(storage.get("/bin/du").unwrap(), Value::U32(111));
	}

	#[test]
	fn concurrent_set_on_same_key_leaves_one_of_the_two_values() {
		use std::sync::Arc as StdArc;
		let dir = tempdir().unwrap();
		let root = open(dir.path(), "root");
		let storage = StdArc::new(Storage::builder(root).build().unwrap());
		storage.set("/k", Value::U32(0), 0).unwrap();
		let s1 = storage.clone();
		let s2 = storage.clone();
		let v1 = Value::String("Handsome".to_string());
		let v2 = Value::U32(777);
		let expect1 = v1.clone();
		let expect2 = v2.clone();
		let t1 = std::thread::spawn(move || s1.set("/k", v1, 0));
		let t2 = std::thread::spawn(move || s2.set("/k", v2, 0));
		t1.join().unwrap().unwrap();
		t2.join().unwrap().unwrap();
		let got = storage.get("/k").unwrap();
		assert!(got == expect1 || got == expect2, "torn write produced {got:?}");
	}

	#[test]
	fn concurrent_sets_on_disjoint_keys_do_not_interfere() {
		let _ = env_logger::builder().is_test(true).try_init();
		use std::sync::Arc as StdArc;
		let dir = tempdir().unwrap();
		let root = open(dir.path(), "root");
		let storage = StdArc::new(Storage::builder(root).build().unwrap());
		let mut handles = Vec::new();
		for i in 0..8u32 {
			let s = storage.clone();
			handles.push(std::thread::spawn(move || {
				s.set(&format!("/counter-{i}"), Value::U32(i), 0).unwrap();
			}));
		}
		for h in handles {
			h.join().unwrap();
		}
		for i in 0..8u32 {
			assert_eq!(storage.get(&format!("/counter-{i}")).unwrap(), Value::U32(i));
		}
	}

	/// Each thread repeatedly does `incr(k) := get(k); set(k, get+1)` on its own disjoint key;
	/// since nothing else touches that key concurrently, the final count must match exactly,
	/// the stress scenario backing the "no cross-key interference" concurrency property.
	#[test]
	fn disjoint_key_counters_survive_concurrent_increment_storms() {
		let _ = env_logger::builder().is_test(true).try_init();
		use rand::Rng;
		use std::sync::Arc as StdArc;

		let dir = tempdir().unwrap();
		let root = open(dir.path(), "root");
		let storage = StdArc::new(Storage::builder(root).build().unwrap());
		const THREADS: u32 = 6;
		const INCREMENTS: u32 = 40;

		let mut handles = Vec::new();
		for t in 0..THREADS {
			let s = storage.clone();
			handles.push(std::thread::spawn(move || {
				let mut rng = rand::thread_rng();
				let key = format!("/stress/counter-{t}");
				s.set(&key, Value::U32(0), 0).unwrap();
				for _ in 0..INCREMENTS {
					let current = match s.get(&key).unwrap() {
						Value::U32(v) => v,
						other => panic!("expected U32, got {other:?}"),
					};
					// A small random sleep widens the window for a racing thread to touch an
					// unrelated key, without ever touching this thread's own key.
					if rng.gen_bool(0.1) {
						std::thread::yield_now();
					}
					s.set(&key, Value::U32(current + 1), 0).unwrap();
				}
			}));
		}
		for h in handles {
			h.join().unwrap();
		}
		for t in 0..THREADS {
			let key = format!("/stress/counter-{t}");
			assert_eq!(storage.get(&key).unwrap(), Value::U32(INCREMENTS));
		}
	}
}
