//! Direct-I/O file access and its block-granular view.

pub mod block_file;
pub mod direct_file;

pub use block_file::BlockFile;
pub use direct_file::DirectFile;
