//! A page-granular, reference-counted, write-back block cache.
//!
//! Every block of the underlying [`BlockFile`] is cached in at most one [`Page`], looked up
//! through the same [`ConcurrentMap`] used by the dentry cache. A page tracks whether its buffer
//! has been loaded from disk, whether it is dirty, and whether it is currently being flushed;
//! acquiring a write handle on a page that is mid-flush blocks until the flush completes, while a
//! read handle never blocks on a dirty (but not flushing) page.

use crate::buffer::FixedBuffer;
use crate::concurrent_map::ConcurrentMap;
use crate::error::Result;
use crate::io::BlockFile;
use crate::sync_prim::{GenCondvar, SpinLock};

struct PageInner {
	buffer: Option<FixedBuffer>,
	data_loaded: bool,
	dirty: bool,
	flushing: bool,
	in_modify: u32,
}

/// The cached state of one block.
struct Page {
	inner: SpinLock<PageInner>,
	flush_cv: GenCondvar,
}

impl Page {
	fn empty() -> Self {
		Self {
			inner: SpinLock::new(PageInner {
				buffer: None,
				data_loaded: false,
				dirty: false,
				flushing: false,
				in_modify: 0,
			}),
			flush_cv: GenCondvar::new(),
		}
	}
}

/// A page-granular write-back cache over a [`BlockFile`].
pub struct BlockCache {
	block_file: BlockFile,
	pages: ConcurrentMap<u64, Page>,
}

impl BlockCache {
	/// Wraps `block_file` with an empty cache.
	pub fn new(block_file: BlockFile) -> Self {
		Self {
			block_file,
			pages: ConcurrentMap::new(),
		}
	}

	/// The wrapped block file's fixed block size.
	pub fn block_size(&self) -> u32 {
		self.block_file.block_size()
	}

	/// Grows or shrinks the underlying block file to exactly `count` blocks. Cached pages for
	/// blocks beyond the new count are left dangling in the map (never looked up again by a
	/// well-behaved caller) rather than evicted eagerly.
	pub fn set_block_count(&self, count: u64) -> Result<()> {
		self.block_file.set_block_count(count)
	}

	/// Current block count of the underlying block file.
	pub fn block_count(&self) -> Result<u64> {
		self.block_file.block_count()
	}

	fn ensure_loaded(&self, index: u64, inner: &mut PageInner) -> Result<()> {
		if inner.buffer.is_none() {
			inner.buffer = Some(FixedBuffer::zeroed(self.block_size() as usize));
		}
		if !inner.data_loaded {
			self.block_file
				.read_block(index, inner.buffer.as_mut().unwrap().as_mut_slice())?;
			inner.data_loaded = true;
		}
		Ok(())
	}

	/// Acquires a read-only handle on block `index`, loading it from disk on first access.
	pub fn get_block(&self, index: u64) -> Result<ReadPage> {
		let (entry, _) = self.pages.emplace(index, Page::empty);
		{
			let mut inner = entry.value().inner.lock();
			self.ensure_loaded(index, &mut inner)?;
		}
		Ok(ReadPage { index, entry })
	}

	/// Acquires a mutable handle on block `index`, blocking while the page is mid-flush.
	pub fn get_mutable_block(&self, index: u64) -> Result<WritePage> {
		let (entry, _) = self.pages.emplace(index, Page::empty);
		loop {
			let gen = entry.value().flush_cv.generation();
			let mut inner = entry.value().inner.lock();
			if inner.flushing {
				drop(inner);
				entry.value().flush_cv.wait_for_change(gen);
				continue;
			}
			self.ensure_loaded(index, &mut inner)?;
			inner.dirty = true;
			inner.in_modify += 1;
			break;
		}
		Ok(WritePage { index, entry })
	}

	/// Writes every dirty page back to the underlying block file.
	pub fn flush(&self) -> Result<()> {
		self.pages.for_each(|index, page| {
			let mut inner = page.inner.lock();
			if !inner.dirty {
				return Ok(());
			}
			inner.flushing = true;
			let snapshot = inner.buffer.as_ref().unwrap().try_clone();
			drop(inner);
			let result = self.block_file.write_block(*index, snapshot.as_slice());
			let mut inner = page.inner.lock();
			inner.flushing = false;
			if result.is_ok() {
				inner.dirty = false;
			}
			drop(inner);
			page.flush_cv.notify_all();
			result
		})
	}

}

impl Drop for BlockCache {
	fn drop(&mut self) {
		if let Err(err) = self.flush() {
			log::error!("block cache flush on drop failed: {err}");
		}
	}
}

/// A scoped read-only view of a cached block.
///
/// Holds its own `Arc` on the page entry, so it owns everything it needs and carries no
/// lifetime tied to the [`BlockCache`] it came from; it can be returned across lock guards
/// freely.
pub struct ReadPage {
	index: u64,
	entry: std::sync::Arc<crate::concurrent_map::Entry<u64, Page>>,
}

impl ReadPage {
	/// Runs `f` with the page's bytes. The lock is held only for the duration of `f`.
	pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
		let inner = self.entry.value().inner.lock();
		f(inner.buffer.as_ref().unwrap().as_slice())
	}

	/// The block index this page represents.
	pub fn index(&self) -> u64 {
		self.index
	}
}

/// A scoped mutable view of a cached block. Marks the page dirty for the duration of its
/// lifetime; dropping it releases the writer count and wakes any pending flush waiter. Like
/// [`ReadPage`], it owns an `Arc` on the page entry and carries no lifetime.
pub struct WritePage {
	index: u64,
	entry: std::sync::Arc<crate::concurrent_map::Entry<u64, Page>>,
}

impl WritePage {
	/// Runs `f` with the page's bytes, mutably. The lock is held only for the duration of `f`.
	pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
		let mut inner = self.entry.value().inner.lock();
		f(inner.buffer.as_mut().unwrap().as_mut_slice())
	}

	/// Runs `f` with the page's bytes, read-only.
	pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
		let inner = self.entry.value().inner.lock();
		f(inner.buffer.as_ref().unwrap().as_slice())
	}

	/// The block index this page represents.
	pub fn index(&self) -> u64 {
		self.index
	}
}

impl Drop for WritePage {
	fn drop(&mut self) {
		let mut inner = self.entry.value().inner.lock();
		inner.in_modify = inner.in_modify.saturating_sub(1);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::io::{BlockFile, DirectFile};
	use tempfile::tempdir;

	fn make_cache(dir: &std::path::Path) -> BlockCache {
		let df = DirectFile::open(dir.join("cache")).unwrap();
		let bf = BlockFile::new(df, 256);
		bf.set_block_count(8).unwrap();
		BlockCache::new(bf)
	}

	#[test]
	fn write_then_read_without_flush() {
		let dir = tempdir().unwrap();
		let cache = make_cache(dir.path());
		{
			let page = cache.get_mutable_block(3).unwrap();
			page.with_mut(|buf| buf[0] = 99);
		}
		let page = cache.get_block(3).unwrap();
		page.with(|buf| assert_eq!(buf[0], 99));
	}

	#[test]
	fn flush_persists_to_block_file() {
		let dir = tempdir().unwrap();
		let path = dir.path().to_path_buf();
		{
			let cache = make_cache(&path);
			let page = cache.get_mutable_block(1).unwrap();
			page.with_mut(|buf| buf[5] = 7);
			drop(page);
			cache.flush().unwrap();
		}
		let df = DirectFile::open(path.join("cache")).unwrap();
		let bf = BlockFile::new(df, 256);
		let mut buf = [0u8; 256];
		bf.read_block(1, &mut buf).unwrap();
		assert_eq!(buf[5], 7);
	}
}
