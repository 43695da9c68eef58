//! A cached "child *name* under *parent*" resolution, and the mount stack it may carry.

use crate::concurrent_map::ConcurrentMap;
use crate::error::{Error, Result};
use crate::ops::InodeDataOps;
use crate::sync_prim::GenCondvar;
use crate::volume::{InodeId, Volume, ROOT_INODE_ID};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Where a dentry's resolution against its parent's inode currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DentryState {
	/// Not yet resolved; a waiter must block on the initialization condvar.
	Uninitialized,
	/// Resolved to a live child inode.
	Exists(InodeId),
	/// Resolved; no such child exists (yet).
	NotExists,
}

/// One overlay in a mount stack: a volume plus the dentry inside it exposed at the mount point.
/// Mounts never own the dentry they point at: it is also reachable through the normal dentry
/// cache or through [`crate::vfs::MountTable`]'s canonical-dentry bookkeeping.
#[derive(Clone)]
pub struct Mount {
	/// The mounted volume.
	pub volume: Arc<Volume>,
	/// The dentry inside `volume` exposed at this mount point.
	pub dentry: Arc<Dentry>,
}

/// A cached resolution of one `(parent, name)` pair, plus whatever mount stack has been
/// installed on top of it (if it is itself a mount point).
pub struct Dentry {
	volume: Arc<Volume>,
	name: String,
	state: Mutex<DentryState>,
	init_cv: GenCondvar,
	create_serialize: Mutex<()>,
	dir_lock: RwLock<()>,
	value_lock: RwLock<()>,
	mount_stack: Mutex<Vec<Mount>>,
	prevent_removal: AtomicUsize,
	busy_children: Mutex<HashSet<String>>,
	busy_cv: GenCondvar,
}

impl Dentry {
	fn new(volume: Arc<Volume>, name: String, state: DentryState) -> Self {
		Self {
			volume,
			name,
			state: Mutex::new(state),
			init_cv: GenCondvar::new(),
			create_serialize: Mutex::new(()),
			dir_lock: RwLock::new(()),
			value_lock: RwLock::new(()),
			mount_stack: Mutex::new(Vec::new()),
			prevent_removal: AtomicUsize::new(0),
			busy_children: Mutex::new(HashSet::new()),
			busy_cv: GenCondvar::new(),
		}
	}

	/// A dentry standing for `volume`'s own root inode. Never goes through the cache: there is
	/// no parent to key it under, so every caller that needs "the root of this volume" builds
	/// (or is handed) one of these directly.
	pub fn root(volume: Arc<Volume>) -> Arc<Self> {
		Arc::new(Self::new(volume, String::new(), DentryState::Exists(ROOT_INODE_ID)))
	}

	/// The name this dentry is cached under within its parent.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// The current resolution state.
	pub fn state(&self) -> DentryState {
		*self.state.lock()
	}

	/// The resolved inode id, if this dentry is in state [`DentryState::Exists`].
	pub fn inode_id(&self) -> Option<InodeId> {
		match *self.state.lock() {
			DentryState::Exists(id) => Some(id),
			_ => None,
		}
	}

	fn set_exists(&self, id: InodeId) {
		*self.state.lock() = DentryState::Exists(id);
	}

	fn set_not_exists(&self) {
		*self.state.lock() = DentryState::NotExists;
	}

	fn notify_init(&self) {
		self.init_cv.notify_all();
	}

	fn wait_initialized(&self) -> DentryState {
		loop {
			let gen = self.init_cv.generation();
			let state = self.state();
			if state != DentryState::Uninitialized {
				return state;
			}
			self.init_cv.wait_for_change(gen);
		}
	}

	/// A snapshot of the currently installed mount stack, oldest first.
	pub fn mount_stack_snapshot(&self) -> Vec<Mount> {
		self.mount_stack.lock().clone()
	}

	/// Installs `mount` as the new newest overlay on top of this dentry.
	pub fn push_mount(&self, mount: Mount) {
		self.mount_stack.lock().push(mount);
	}

	/// Marks this dentry as in-use by one more traversal, keeping it alive even if its refcount
	/// would otherwise allow eviction.
	pub fn acquire_prevent_removal(&self) {
		self.prevent_removal.fetch_add(1, Ordering::SeqCst);
	}

	/// Releases one traversal's hold acquired via [`Dentry::acquire_prevent_removal`].
	pub fn release_prevent_removal(&self) {
		self.prevent_removal.fetch_sub(1, Ordering::SeqCst);
	}

	/// Whether no traversal currently holds this dentry, i.e. it is a candidate for eviction.
	pub fn is_removable(&self) -> bool {
		self.prevent_removal.load(Ordering::SeqCst) == 0
	}

	/// Acquires a shared gate on this dentry's directory-entry block.
	pub fn dir_read(&self) -> RwLockReadGuard<'_, ()> {
		self.dir_lock.read()
	}

	/// Acquires an exclusive gate on this dentry's directory-entry block.
	pub fn dir_write(&self) -> RwLockWriteGuard<'_, ()> {
		self.dir_lock.write()
	}

	/// Acquires a shared gate on this dentry's value block.
	pub fn value_read(&self) -> RwLockReadGuard<'_, ()> {
		self.value_lock.read()
	}

	/// Acquires an exclusive gate on this dentry's value block.
	pub fn value_write(&self) -> RwLockWriteGuard<'_, ()> {
		self.value_lock.write()
	}

	fn lock_name(&self, name: &str) {
		loop {
			let gen = self.busy_cv.generation();
			let mut busy = self.busy_children.lock();
			if !busy.contains(name) {
				busy.insert(name.to_string());
				return;
			}
			drop(busy);
			self.busy_cv.wait_for_change(gen);
		}
	}

	fn unlock_name(&self, name: &str) {
		self.busy_children.lock().remove(name);
		self.busy_cv.notify_all();
	}
}

struct NameLockGuard<'d> {
	dentry: &'d Dentry,
	name: String,
}

impl<'d> NameLockGuard<'d> {
	fn acquire(dentry: &'d Dentry, name: &str) -> Self {
		dentry.lock_name(name);
		Self {
			dentry,
			name: name.to_string(),
		}
	}
}

impl Drop for NameLockGuard<'_> {
	fn drop(&mut self) {
		self.dentry.unlock_name(&self.name);
	}
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct DentryKey {
	volume: usize,
	parent: InodeId,
	name: String,
}

fn volume_identity(volume: &Arc<Volume>) -> usize {
	Arc::as_ptr(volume) as usize
}

/// The cache of `(parent, name)` dentries, shared across every volume a [`crate::storage::Storage`]
/// touches. Keyed on volume identity so the same `(inode id, name)` pair in two different
/// volumes never collides.
#[derive(Default)]
pub struct DentryCache {
	map: ConcurrentMap<DentryKey, Arc<Dentry>>,
}

impl DentryCache {
	/// Creates an empty cache.
	pub fn new() -> Self {
		Self { map: ConcurrentMap::new() }
	}

	/// Number of dentries currently cached, across every volume. Diagnostic only.
	pub fn len(&self) -> usize {
		self.map.len()
	}
}

/// Steps from `parent` to its child named `name`, looking it up in the cache or resolving it
/// against `parent`'s volume inode on first access.
///
/// With `create = false`: returns `Ok(None)` if no such child exists, never creates anything.
/// With `create = true`: always returns `Ok(Some(_))` or propagates an error; the child is
/// created if absent.
pub fn step_path(cache: &DentryCache, parent: &Mount, name: &str, create: bool) -> Result<Option<Arc<Dentry>>> {
	let _name_guard = NameLockGuard::acquire(&parent.dentry, name);
	let parent_id = parent
		.dentry
		.inode_id()
		.ok_or_else(|| Error::corruption("stepping into a non-existent parent dentry"))?;
	let key = DentryKey {
		volume: volume_identity(&parent.volume),
		parent: parent_id,
		name: name.to_string(),
	};
	let (entry, created) = cache
		.map
		.emplace(key, || Arc::new(Dentry::new(parent.volume.clone(), name.to_string(), DentryState::Uninitialized)));
	let dentry = entry.value().clone();

	if created {
		let ops = InodeDataOps::new(&parent.volume);
		let outcome = if create {
			let _g = parent.dentry.dir_write();
			ops.ensure_child(parent_id, name).map(Some)
		} else {
			let _g = parent.dentry.dir_read();
			ops.lookup_child(parent_id, name).map(|found| found.map(|(id, _)| id))
		};
		return match outcome {
			Ok(Some(id)) => {
				dentry.set_exists(id);
				dentry.notify_init();
				dentry.acquire_prevent_removal();
				Ok(Some(dentry))
			}
			Ok(None) => {
				dentry.set_not_exists();
				dentry.notify_init();
				Ok(None)
			}
			Err(err) => {
				// Wake whoever is already waiting on this entry's initialization instead of
				// leaving it stuck `Uninitialized`, then drop the entry so a later attempt
				// starts fresh rather than replaying a transient failure as a cached `NotExists`.
				dentry.set_not_exists();
				dentry.notify_init();
				cache.map.remove(entry.key());
				Err(err)
			}
		};
	}

	match dentry.wait_initialized() {
		DentryState::Exists(_) => {
			dentry.acquire_prevent_removal();
			Ok(Some(dentry))
		}
		DentryState::NotExists => {
			if !create {
				return Ok(None);
			}
			let _serialize = dentry.create_serialize.lock();
			if dentry.state() == DentryState::NotExists {
				let ops = InodeDataOps::new(&parent.volume);
				let _g = parent.dentry.dir_write();
				let id = ops.ensure_child(parent_id, name)?;
				dentry.set_exists(id);
				dentry.notify_init();
			}
			match dentry.state() {
				DentryState::Exists(_) => {
					dentry.acquire_prevent_removal();
					Ok(Some(dentry))
				}
				other => Err(Error::corruption(format!(
					"dentry failed to settle on Exists after create-upgrade, got {other:?}"
				))),
			}
		}
		DentryState::Uninitialized => unreachable!("wait_initialized never returns Uninitialized"),
	}
}

/// Releases a handle acquired by [`step_path`], and opportunistically evicts the underlying
/// cache entry if nothing else references it. Safe to call multiple times' worth of handles
/// independently; each call releases exactly one `prevent_removal` hold.
pub fn release(cache: &DentryCache, volume: &Arc<Volume>, parent: InodeId, dentry: &Arc<Dentry>) {
	dentry.release_prevent_removal();
	if dentry.is_removable() {
		let key = DentryKey {
			volume: volume_identity(volume),
			parent,
			name: dentry.name().to_string(),
		};
		cache.map.evict_unused(&key);
	}
}
