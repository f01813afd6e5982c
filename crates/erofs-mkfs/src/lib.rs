//! Build EROFS-format read-only filesystem images.
//!
//! Given a source directory tree, [`builder::build`] emits a single
//! bit-exact image: a superblock at offset 1024, a metadata region of
//! inodes and directory blocks, data regions with optionally compressed
//! file payload, and an optional packed inode holding deduplicated file
//! tails.  Every byte position in the image is managed by the buffer
//! allocator in [`buffer`]; the on-disk records themselves live in
//! [`format`].

pub mod buffer;
pub mod builder;
pub mod checksum;
pub mod compress;
pub mod device;
pub mod dirent;
pub mod error;
pub mod format;
pub mod fragments;
pub mod inode;
pub mod source;
pub mod xattr;

pub use builder::{block_size_bits, build, BuildSummary, Config};
pub use compress::CompressorOption;
pub use error::{Error, Result};
