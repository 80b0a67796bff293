//! High-level verify and repair flows
//!
//! Convenience entry points tying the pieces together: load the index,
//! attach the installation's files, verify, queue repair jobs per source and
//! run them. Progress is surfaced through tracing; callers wanting richer
//! reporting drive [`Installer`] directly.

use std::fs::File;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use zipatch_index::PatchIndex;

use crate::{Installer, Result};

/// Load an index and verify an installation against it read-only.
///
/// Returns the installer with its missing-part sets populated, ready for
/// repair queueing.
pub async fn verify_from_index(
    index_path: &Path,
    game_root: &Path,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Installer> {
    let index = PatchIndex::load(File::open(index_path)?)?;
    info!(
        index = %index_path.display(),
        targets = index.targets().len(),
        sources = index.sources().len(),
        "verifying installation"
    );

    let mut installer = Installer::new(index);
    installer.set_verify_progress_callback(|file, done, total| {
        debug!(file, done, total, "verify progress");
    });
    installer.set_targets_read_only(game_root)?;
    installer.verify_files(false, concurrency, cancel).await?;
    Ok(installer)
}

/// Verify and repair an installation from patch files on disk.
pub async fn repair_from_local_patches(
    index_path: &Path,
    game_root: &Path,
    patch_dir: &Path,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut installer = verify_from_index(index_path, game_root, concurrency, cancel).await?;
    installer.set_targets_read_write(game_root)?;

    let sources: Vec<String> = installer.index().sources().to_vec();
    for (si, name) in sources.iter().enumerate() {
        installer.queue_install_local(si as u8, &patch_dir.join(name), concurrency);
    }
    run_repair(&mut installer, game_root, concurrency, cancel).await
}

/// Verify and repair an installation by range-fetching patch bytes from a
/// patch server. `base_url` is the directory URL the patch files live under.
pub async fn repair_from_url(
    index_path: &Path,
    game_root: &Path,
    base_url: &str,
    session_token: Option<&str>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut installer = verify_from_index(index_path, game_root, concurrency, cancel).await?;
    installer.set_targets_read_write(game_root)?;

    let base = base_url.trim_end_matches('/');
    let sources: Vec<String> = installer.index().sources().to_vec();
    for (si, name) in sources.iter().enumerate() {
        let url = format!("{base}/{name}");
        installer.queue_install_http(si as u8, &url, session_token, concurrency);
    }
    run_repair(&mut installer, game_root, concurrency, cancel).await
}

async fn run_repair(
    installer: &mut Installer,
    game_root: &Path,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    let jobs = installer.queued_jobs();
    installer.set_install_progress_callback(|source, done, total| {
        debug!(source, done, total, "install progress");
    });
    installer.install(concurrency, cancel).await?;
    installer.write_version_files(game_root)?;
    info!(jobs, "repair complete");
    Ok(())
}
