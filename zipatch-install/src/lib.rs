//! Verify and repair a patched installation from its byte-provenance index
//!
//! Given a [`zipatch_index::PatchIndex`], this crate checks every part of
//! every target file on disk and rewrites exactly the parts that fail, using
//! source bytes read from local patch files or fetched as HTTP ranges. It
//! includes:
//!
//! - A bounded-concurrency verify pass producing missing-part working sets
//! - Repair job queueing per source patch file, local or HTTP
//! - An install loop with per-job retry and aggregate failure reporting
//! - Synthetic-part rewriting, oversize truncation and version marker files
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> zipatch_install::Result<()> {
//! let cancel = CancellationToken::new();
//! zipatch_install::repair_from_url(
//!     Path::new("game.patch.index"),
//!     Path::new("/opt/game"),
//!     "https://patch.example.com/game",
//!     None,
//!     8,
//!     &cancel,
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod error;
mod installer;
mod workflows;

pub use error::{Error, Result};
pub use installer::{
    CorruptionFn, InstallProgressFn, Installer, VerifyProgressFn, DEFAULT_PROGRESS_INTERVAL,
};
pub use workflows::{repair_from_local_patches, repair_from_url, verify_from_index};
