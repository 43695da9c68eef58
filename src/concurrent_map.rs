//! A sharded, refcounted concurrent hash table.
//!
//! Backs both the block cache (keyed by block index) and the dentry cache (keyed by
//! `(parent id, child name)`). Lookups take the table's resize lock in shared mode; growth
//! (triggered once the load factor exceeds 1.0) takes it exclusively and rehashes every entry
//! into a larger bucket vector. Entries are reference-counted (`Arc`) so a handle returned by a
//! lookup remains valid across a concurrent resize: the `Arc` is cloned out of the old bucket
//! before the bucket itself is discarded.

use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Bucket counts form a small prime ladder, mirroring a classic chained hash table's growth
/// schedule: each step roughly doubles capacity while staying prime to spread hash collisions.
const BUCKET_SIZES: &[usize] = &[
	17, 37, 79, 163, 331, 673, 1361, 2729, 5471, 10949, 21911, 43853, 87719, 175447, 350899,
];

fn next_bucket_size(min: usize) -> usize {
	BUCKET_SIZES
		.iter()
		.copied()
		.find(|&n| n > min)
		.unwrap_or_else(|| BUCKET_SIZES.last().copied().unwrap() * 2)
}

fn hash_of<K: Hash>(key: &K) -> u64 {
	let mut hasher = DefaultHasher::new();
	key.hash(&mut hasher);
	hasher.finish()
}

/// One entry of the map: an immutable key plus the caller-owned value. Internal mutability of
/// `V`, if needed, is the caller's responsibility (the dentry cache's values carry their own
/// locks).
pub struct Entry<K, V> {
	key: K,
	value: V,
}

impl<K, V> Entry<K, V> {
	/// The entry's key.
	pub fn key(&self) -> &K {
		&self.key
	}

	/// The entry's value.
	pub fn value(&self) -> &V {
		&self.value
	}
}

struct Table<K, V> {
	buckets: Vec<Mutex<Vec<Arc<Entry<K, V>>>>>,
}

impl<K, V> Table<K, V> {
	fn with_buckets(n: usize) -> Self {
		let mut buckets = Vec::with_capacity(n);
		buckets.resize_with(n, || Mutex::new(Vec::new()));
		Self { buckets }
	}
}

/// A concurrent map from `K` to reference-counted `Entry<K, V>` handles.
pub struct ConcurrentMap<K, V> {
	table: RwLock<Table<K, V>>,
	// Exact live-entry count, tracked independently of the table's write lock so the load-factor
	// check in `emplace` (taken under the table's *read* lock, alongside every other lookup) sees
	// an up-to-date count rather than one only refreshed on the last `grow`.
	len: AtomicUsize,
}

impl<K, V> Default for ConcurrentMap<K, V> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K, V> ConcurrentMap<K, V>
where
	K: Hash + Eq + Clone,
{
	/// Creates an empty map.
	pub fn new() -> Self {
		Self {
			table: RwLock::new(Table::with_buckets(BUCKET_SIZES[0])),
			len: AtomicUsize::new(0),
		}
	}

	/// Looks up `key`, returning its entry if present.
	pub fn get(&self, key: &K) -> Option<Arc<Entry<K, V>>> {
		let table = self.table.read();
		let idx = (hash_of(key) as usize) % table.buckets.len();
		let bucket = table.buckets[idx].lock();
		bucket.iter().find(|e| &e.key == key).cloned()
	}

	/// Looks up `key`, inserting a fresh entry built by `make` if absent.
	///
	/// Returns the entry and whether it was newly created. The caller is responsible for any
	/// further initialization a freshly created entry needs (the map itself only guarantees the
	/// slot exists and is visible to concurrent lookups).
	pub fn emplace(&self, key: K, make: impl FnOnce() -> V) -> (Arc<Entry<K, V>>, bool) {
		{
			let table = self.table.read();
			let idx = (hash_of(&key) as usize) % table.buckets.len();
			let mut bucket = table.buckets[idx].lock();
			if let Some(existing) = bucket.iter().find(|e| e.key == key) {
				return (existing.clone(), false);
			}
			let entry = Arc::new(Entry {
				key: key.clone(),
				value: make(),
			});
			bucket.push(entry.clone());
			drop(bucket);
			let len = self.len.fetch_add(1, Ordering::AcqRel) + 1;
			let should_grow = len > table.buckets.len();
			drop(table);
			if should_grow {
				self.grow();
			}
			return (entry, true);
		}
	}

	/// Removes `key` if present and its entry is held only by the table itself (no external
	/// clone survives), returning whether removal happened.
	pub fn evict_unused(&self, key: &K) -> bool {
		let table = self.table.read();
		let idx = (hash_of(key) as usize) % table.buckets.len();
		let mut bucket = table.buckets[idx].lock();
		if let Some(pos) = bucket.iter().position(|e| &e.key == key) {
			if Arc::strong_count(&bucket[pos]) == 1 {
				bucket.remove(pos);
				self.len.fetch_sub(1, Ordering::AcqRel);
				return true;
			}
		}
		false
	}

	/// Forcibly removes `key` regardless of outstanding references.
	pub fn remove(&self, key: &K) -> Option<Arc<Entry<K, V>>> {
		let table = self.table.read();
		let idx = (hash_of(key) as usize) % table.buckets.len();
		let mut bucket = table.buckets[idx].lock();
		let pos = bucket.iter().position(|e| &e.key == key)?;
		let entry = bucket.remove(pos);
		self.len.fetch_sub(1, Ordering::AcqRel);
		Some(entry)
	}

	fn grow(&self) {
		let mut table = self.table.write();
		let new_size = next_bucket_size(table.buckets.len());
		if new_size <= table.buckets.len() {
			return;
		}
		let mut new_buckets = Vec::with_capacity(new_size);
		new_buckets.resize_with(new_size, || Mutex::new(Vec::new()));
		for old_bucket in table.buckets.drain(..) {
			for entry in old_bucket.into_inner() {
				let idx = (hash_of(&entry.key) as usize) % new_size;
				new_buckets[idx].lock().push(entry);
			}
		}
		table.buckets = new_buckets;
	}

	/// Applies `f` to every currently-held `(key, value)` pair, stopping at the first error.
	///
	/// Used by the block cache's whole-cache flush; holds each bucket's lock only while reading
	/// the small `Vec` of `Arc` clones out of it, so `f` itself never runs under a bucket lock.
	pub fn for_each<E>(&self, mut f: impl FnMut(&K, &V) -> Result<(), E>) -> Result<(), E> {
		let table = self.table.read();
		for bucket in &table.buckets {
			let entries: Vec<_> = bucket.lock().clone();
			for entry in entries {
				f(&entry.key, &entry.value)?;
			}
		}
		Ok(())
	}

	/// Number of live entries (used by tests and diagnostics, not the hot path).
	pub fn len(&self) -> usize {
		self.len.load(Ordering::Acquire)
	}

	/// Returns whether the map currently has no entries.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Current bucket-vector capacity. Diagnostic only.
	pub fn bucket_count(&self) -> usize {
		self.table.read().buckets.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn emplace_then_get() {
		let map: ConcurrentMap<u32, String> = ConcurrentMap::new();
		let (entry, created) = map.emplace(1, || "one".to_string());
		assert!(created);
		assert_eq!(entry.value(), "one");
		let (entry2, created2) = map.emplace(1, || "uno".to_string());
		assert!(!created2);
		assert_eq!(entry2.value(), "one");
	}

	#[test]
	fn grows_past_initial_capacity() {
		let map: ConcurrentMap<u32, u32> = ConcurrentMap::new();
		let initial_buckets = map.bucket_count();
		for i in 0..100 {
			map.emplace(i, || i);
		}
		assert_eq!(map.len(), 100);
		assert!(
			map.bucket_count() > initial_buckets,
			"load factor exceeded 1.0 well before 100 entries; table should have grown"
		);
		for i in 0..100 {
			assert_eq!(*map.get(&i).unwrap().value(), i);
		}
	}

	#[test]
	fn evict_unused_removes_only_when_sole_owner() {
		let map: ConcurrentMap<u32, u32> = ConcurrentMap::new();
		let (entry, _) = map.emplace(7, || 7);
		assert!(!map.evict_unused(&7));
		drop(entry);
		assert!(map.evict_unused(&7));
		assert!(map.get(&7).is_none());
	}
}
