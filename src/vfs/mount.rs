//! The canonical mounted-dentry table: de-duplicates repeated [`crate::storage::Storage::mount`]
//! calls that target the same `(volume, subdir)` pair.

use crate::error::Result;
use crate::vfs::dentry::{step_path, Dentry, DentryCache, Mount};
use crate::volume::Volume;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

fn volume_identity(volume: &Arc<Volume>) -> usize {
	Arc::as_ptr(volume) as usize
}

/// Strips leading/trailing separators and collapses repeats, so `"/bin"`, `"bin"`, and `"bin//"`
/// all normalize to the same canonical-table key.
pub fn normalize_subpath(path: &str) -> String {
	path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("/")
}

/// Maps `(volume identity, normalized subdir)` to the dentry that canonically represents "that
/// subdirectory of that volume", so two [`crate::storage::Storage::mount`] calls naming the same
/// target share one mount-stack entry instead of each resolving (and caching) their own.
#[derive(Default)]
pub struct MountTable {
	entries: Mutex<HashMap<(usize, String), Arc<Dentry>>>,
}

impl MountTable {
	/// Creates an empty table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the canonical dentry for `(volume, subdir)`, resolving (and creating intermediate
	/// directories for) it against `volume`'s own root the first time this exact pair is seen.
	pub fn resolve(&self, cache: &DentryCache, volume: &Arc<Volume>, subdir: &str) -> Result<Arc<Dentry>> {
		let normalized = normalize_subpath(subdir);
		let key = (volume_identity(volume), normalized.clone());
		if let Some(existing) = self.entries.lock().get(&key).cloned() {
			return Ok(existing);
		}
		let mut cur = Mount {
			volume: volume.clone(),
			dentry: Dentry::root(volume.clone()),
		};
		for comp in normalized.split('/').filter(|s| !s.is_empty()) {
			let next = step_path(cache, &cur, comp, true)?
				.expect("create=true always yields a dentry or propagates an error");
			cur = Mount {
				volume: cur.volume.clone(),
				dentry: next,
			};
		}
		let mut entries = self.entries.lock();
		// Another thread may have raced us to the same key; keep whichever landed first so every
		// caller observes one canonical dentry.
		Ok(entries.entry(key).or_insert(cur.dentry).clone())
	}
}
