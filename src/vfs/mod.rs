//! In-memory name resolution: the dentry cache, mount overlays, and the path-walking algorithm
//! that ties them to [`crate::volume::Volume`]/[`crate::ops::InodeDataOps`].
//!
//! This layer has no on-disk footprint of its own: a cached [`dentry::Dentry`] and a
//! [`dentry::Mount`] are purely in-process bookkeeping that make repeated lookups of the same
//! path cheap and let several volumes be stitched into one namespace.

pub mod dentry;
pub mod mount;

pub use dentry::{release, step_path, Dentry, DentryCache, DentryState, Mount};
pub use mount::MountTable;
