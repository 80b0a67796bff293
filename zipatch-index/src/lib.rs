//! Byte-provenance index for ZiPatch chains
//!
//! This crate models an entire patched game installation as a set of target
//! files, each tiled by part locators that record where every byte comes
//! from: a range of a patch file (possibly deflate-compressed), synthetic
//! zeros, an empty-block placeholder, or nowhere at all. It includes:
//!
//! - Building an index by replaying parsed patch operations in chain order
//! - A checksum pass that makes every part independently verifiable
//! - Per-part verification and reconstruction primitives
//! - A compact deflate-compressed container format
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use zipatch_index::PatchIndex;
//!
//! # fn example() -> zipatch_index::Result<()> {
//! let index = PatchIndex::load(File::open("game.patch.index")?)?;
//! for target in index.targets() {
//!     println!("{}: {} bytes", target.relative_path(), target.file_size());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod error;
mod index;
mod part;
mod target_file;

pub use error::{Error, Result};
pub use index::{
    normalize_path, DataBlock, HeaderKind, PatchIndex, PatchOperation, EXPANSION_BASE_GAME,
    EXPANSION_BOOT, INDEX_MAGIC, INDEX_VERSION,
};
pub use part::{
    PartLocator, PartSource, VerifyResult, DEFLATED_BLOCK_CAP, MAX_TARGET_SIZE, PART_RECORD_LEN,
    PLACEHOLDER_UNIT, SOURCE_INDEX_EMPTY_BLOCK, SOURCE_INDEX_MAX_VALID, SOURCE_INDEX_UNAVAILABLE,
    SOURCE_INDEX_ZEROS,
};
pub use target_file::TargetFile;
