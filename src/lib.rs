//! An embeddable hierarchical key-attribute store built on a custom on-disk volume format.
//!
//! Keys are slash-separated paths (`/a/b/c`); values are small tagged scalars (see [`Value`])
//! optionally carrying a deadline. A [`Volume`] is a self-contained on-disk container; a
//! [`Storage`] combines a root volume with any number of mounted overlay volumes into one logical
//! namespace, in the spirit of Unix mount semantics.
//!
//! ```no_run
//! use maestro_store::{Storage, Value, Volume, VolumeSettings};
//! use std::sync::Arc;
//!
//! # fn main() -> maestro_store::Result<()> {
//! let root = Arc::new(Volume::open("/tmp/example-root", VolumeSettings::default(), true)?);
//! let storage = Storage::builder(root).build()?;
//! storage.set("/etc/hostname", Value::String("box".to_string()), 0)?;
//! assert_eq!(storage.get("/etc/hostname")?, Value::String("box".to_string()));
//! # Ok(())
//! # }
//! ```

pub mod bitmap;
pub mod buffer;
pub mod cache;
pub mod concurrent_map;
pub mod error;
pub mod io;
pub mod ops;
pub mod serde;
pub mod storage;
pub mod sync_prim;
pub mod value;
pub mod vfs;
pub mod volume;

pub use error::{Error, Result};
pub use ops::InodeDataOps;
pub use storage::{Storage, StorageBuilder};
pub use value::Value;
pub use volume::{Volume, VolumeSettings};
