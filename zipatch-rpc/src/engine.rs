//! The engine trait both transports implement
//!
//! [`PatchEngine`] mirrors the installer API one-to-one so a frontend can
//! drive verification and repair the same way whether the work happens in
//! this process or in a spawned worker.

use std::path::Path;

use async_trait::async_trait;

use crate::Result;

/// A progress notification from a running verify or install pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Verify progress: current target file, bytes checked, bytes total
    Verify {
        /// Index of the target being checked
        file: usize,
        /// Bytes verified so far
        done: u64,
        /// Bytes to verify in total
        total: u64,
    },
    /// Install progress: displayed source number, bytes written, bytes total
    Install {
        /// One-based source patch number, for display
        source: usize,
        /// Bytes repaired so far
        done: u64,
        /// Bytes to repair in total
        total: u64,
    },
}

/// Handler invoked for every accepted progress event
pub type ProgressHandler = dyn Fn(ProgressEvent) + Send + Sync;

/// Driver interface over a patch installer, local or remote
///
/// Every method takes `&self`: a long-running `verify_files` or `install`
/// call must not hold an exclusive borrow, or [`cancel_task`] could never
/// reach it while it is in flight.
///
/// [`cancel_task`]: PatchEngine::cancel_task
#[async_trait]
pub trait PatchEngine: Send + Sync {
    /// Load an index file and construct the installer.
    async fn construct(&self, index_path: &Path) -> Result<()>;

    /// Attach every target read-only under an installation root.
    async fn set_targets_read_only(&self, root: &Path) -> Result<()>;

    /// Re-attach damaged targets read-write under an installation root.
    async fn set_targets_read_write(&self, root: &Path) -> Result<()>;

    /// Mark every part of one target as missing.
    async fn mark_file_missing(&self, target_index: usize) -> Result<()>;

    /// Run a verify pass under the given cancellation token id.
    async fn verify_files(&self, token_id: i32, refine: bool, concurrency: usize) -> Result<()>;

    /// Rewrite synthetic parts of writable targets.
    async fn repair_non_patch_data(&self, token_id: i32) -> Result<()>;

    /// Queue repair jobs reading a local patch file.
    async fn queue_install_from_local_file(&self, source_index: u8, path: &Path, split: usize) -> Result<()>;

    /// Queue repair jobs fetching HTTP ranges from a patch URL.
    async fn queue_install_from_url(
        &self,
        source_index: u8,
        url: &str,
        session_token: Option<&str>,
        split: usize,
    ) -> Result<()>;

    /// Run every queued job under the given cancellation token id.
    async fn install(&self, token_id: i32, concurrency: usize) -> Result<()>;

    /// Write the version marker files under a root.
    async fn write_version_files(&self, root: &Path) -> Result<()>;

    /// Missing parts as `(target_index, part_index)`, grouped per source
    async fn missing_part_indices_per_patch(&self) -> Result<Vec<Vec<(u32, u32)>>>;

    /// Missing part indices grouped per target file
    async fn missing_part_indices_per_target_file(&self) -> Result<Vec<Vec<u32>>>;

    /// Targets longer on disk than the index says
    async fn size_mismatch_target_file_indices(&self) -> Result<Vec<u32>>;

    /// Cancel whatever runs under a token id.
    async fn cancel_task(&self, token_id: i32) -> Result<()>;

    /// Tear the engine down.
    async fn dispose(&self) -> Result<()>;
}
