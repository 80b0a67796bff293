//! In-process engine: the trait methods call straight into the installer
//!
//! The installer sits behind an async lock so calls serialize, while the
//! token map has its own lock; `cancel_task` therefore lands even while a
//! verify or install call holds the installer.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use zipatch_index::PatchIndex;
use zipatch_install::Installer;

use crate::engine::{PatchEngine, ProgressEvent, ProgressHandler};
use crate::{Error, Result};

/// [`PatchEngine`] implementation that owns the installer directly
#[derive(Default)]
pub struct LocalPatchEngine {
    installer: tokio::sync::Mutex<Option<Installer>>,
    tokens: Mutex<HashMap<i32, CancellationToken>>,
    progress: Mutex<Option<Arc<ProgressHandler>>>,
}

impl LocalPatchEngine {
    /// Create an engine with nothing constructed yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a progress handler. Must be set before [`PatchEngine::construct`]
    /// for progress events to be wired through.
    pub fn set_progress_handler<F>(&self, f: F)
    where
        F: Fn(ProgressEvent) + Send + Sync + 'static,
    {
        *self.progress.lock() = Some(Arc::new(f));
    }

    /// Fetch or create the token registered under `token_id`; negative ids
    /// get a throwaway token nothing can cancel.
    fn token(&self, token_id: i32) -> CancellationToken {
        if token_id < 0 {
            return CancellationToken::new();
        }
        self.tokens
            .lock()
            .entry(token_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn release_token(&self, token_id: i32) {
        if token_id >= 0 {
            self.tokens.lock().remove(&token_id);
        }
    }
}

fn convert(e: zipatch_install::Error) -> Error {
    match e {
        zipatch_install::Error::Cancelled => Error::Cancelled,
        other => Error::Install(other),
    }
}

#[async_trait]
impl PatchEngine for LocalPatchEngine {
    async fn construct(&self, index_path: &Path) -> Result<()> {
        let index = PatchIndex::load(File::open(index_path)?)?;
        debug!(index = %index_path.display(), targets = index.targets().len(), "constructing installer");
        let mut installer = Installer::new(index);
        if let Some(handler) = self.progress.lock().clone() {
            let verify = Arc::clone(&handler);
            installer.set_verify_progress_callback(move |file, done, total| {
                verify(ProgressEvent::Verify { file, done, total });
            });
            let install = handler;
            installer.set_install_progress_callback(move |source, done, total| {
                install(ProgressEvent::Install { source, done, total });
            });
        }
        *self.installer.lock().await = Some(installer);
        Ok(())
    }

    async fn set_targets_read_only(&self, root: &Path) -> Result<()> {
        let mut guard = self.installer.lock().await;
        let installer = guard.as_mut().ok_or(Error::NotConstructed)?;
        installer.set_targets_read_only(root).map_err(convert)
    }

    async fn set_targets_read_write(&self, root: &Path) -> Result<()> {
        let mut guard = self.installer.lock().await;
        let installer = guard.as_mut().ok_or(Error::NotConstructed)?;
        installer.set_targets_read_write(root).map_err(convert)
    }

    async fn mark_file_missing(&self, target_index: usize) -> Result<()> {
        let mut guard = self.installer.lock().await;
        let installer = guard.as_mut().ok_or(Error::NotConstructed)?;
        installer.mark_file_missing(target_index);
        Ok(())
    }

    async fn verify_files(&self, token_id: i32, refine: bool, concurrency: usize) -> Result<()> {
        let cancel = self.token(token_id);
        let mut guard = self.installer.lock().await;
        let installer = guard.as_mut().ok_or(Error::NotConstructed)?;
        let result = installer
            .verify_files(refine, concurrency, &cancel)
            .await
            .map_err(convert);
        self.release_token(token_id);
        result
    }

    async fn repair_non_patch_data(&self, token_id: i32) -> Result<()> {
        let cancel = self.token(token_id);
        let mut guard = self.installer.lock().await;
        let installer = guard.as_mut().ok_or(Error::NotConstructed)?;
        let result = installer.repair_non_patch_data(&cancel).map_err(convert);
        self.release_token(token_id);
        result
    }

    async fn queue_install_from_local_file(&self, source_index: u8, path: &Path, split: usize) -> Result<()> {
        let mut guard = self.installer.lock().await;
        let installer = guard.as_mut().ok_or(Error::NotConstructed)?;
        installer.queue_install_local(source_index, path, split);
        Ok(())
    }

    async fn queue_install_from_url(
        &self,
        source_index: u8,
        url: &str,
        session_token: Option<&str>,
        split: usize,
    ) -> Result<()> {
        let mut guard = self.installer.lock().await;
        let installer = guard.as_mut().ok_or(Error::NotConstructed)?;
        installer.queue_install_http(source_index, url, session_token, split);
        Ok(())
    }

    async fn install(&self, token_id: i32, concurrency: usize) -> Result<()> {
        let cancel = self.token(token_id);
        let mut guard = self.installer.lock().await;
        let installer = guard.as_mut().ok_or(Error::NotConstructed)?;
        let result = installer.install(concurrency, &cancel).await.map_err(convert);
        self.release_token(token_id);
        result
    }

    async fn write_version_files(&self, root: &Path) -> Result<()> {
        let mut guard = self.installer.lock().await;
        let installer = guard.as_mut().ok_or(Error::NotConstructed)?;
        installer.write_version_files(root).map_err(convert)
    }

    async fn missing_part_indices_per_patch(&self) -> Result<Vec<Vec<(u32, u32)>>> {
        let guard = self.installer.lock().await;
        let installer = guard.as_ref().ok_or(Error::NotConstructed)?;
        Ok(installer
            .missing_part_indices_per_source()
            .into_iter()
            .map(|parts| parts.into_iter().map(|(t, p)| (t as u32, p as u32)).collect())
            .collect())
    }

    async fn missing_part_indices_per_target_file(&self) -> Result<Vec<Vec<u32>>> {
        let guard = self.installer.lock().await;
        let installer = guard.as_ref().ok_or(Error::NotConstructed)?;
        Ok(installer
            .missing_part_indices_per_target()
            .into_iter()
            .map(|parts| parts.into_iter().map(|p| p as u32).collect())
            .collect())
    }

    async fn size_mismatch_target_file_indices(&self) -> Result<Vec<u32>> {
        let guard = self.installer.lock().await;
        let installer = guard.as_ref().ok_or(Error::NotConstructed)?;
        Ok(installer
            .size_mismatch_targets()
            .into_iter()
            .map(|t| t as u32)
            .collect())
    }

    async fn cancel_task(&self, token_id: i32) -> Result<()> {
        if let Some(token) = self.tokens.lock().get(&token_id) {
            token.cancel();
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        *self.installer.lock().await = None;
        self.tokens.lock().clear();
        Ok(())
    }
}
