//! Worker-side session: serves framed requests over a byte stream
//!
//! One [`WorkerSession`] owns one installer and one cancellation-token map;
//! nothing outlives the session. Requests run as spawned tasks serialized on
//! the installer lock, so `CancelTask` frames are handled the moment they
//! arrive even while a verify or install call is in flight. The session ends
//! on `DisposeAndExit` or when the request stream hits end of file, which is
//! what a vanished caller looks like.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use zipatch_index::PatchIndex;
use zipatch_install::Installer;

use crate::protocol::{
    read_frame, write_frame, Opcode, PayloadReader, PayloadWriter, PushOpcode, ResultCode,
    PUSH_REQUEST_ID,
};
use crate::{Error, Result};

struct Shared {
    installer: tokio::sync::Mutex<Option<Installer>>,
    tokens: parking_lot::Mutex<HashMap<i32, CancellationToken>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    seq: Arc<AtomicI64>,
}

impl Shared {
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

/// Serves one caller over a framed byte stream
pub struct WorkerSession;

impl WorkerSession {
    /// Run the session until `DisposeAndExit` or end of stream.
    pub async fn run<R, W>(mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write_frame(&mut writer, &frame).await.is_err() {
                    break;
                }
            }
        });

        let shared = Arc::new(Shared {
            installer: tokio::sync::Mutex::new(None),
            tokens: parking_lot::Mutex::new(HashMap::new()),
            tx,
            seq: Arc::new(AtomicI64::new(0)),
        });

        while let Some(frame) = read_frame(&mut reader).await? {
            let mut header = PayloadReader::new(&frame);
            let request_id = header.get_u32()?;
            let token_id = header.get_i32()?;
            let raw_opcode = header.get_i32()?;
            let body = header.remaining().to_vec();

            let opcode = match Opcode::try_from(raw_opcode) {
                Ok(opcode) => opcode,
                Err(e) => {
                    // Unknown opcode fails the call, not the session
                    warn!(raw_opcode, "rejecting unknown opcode");
                    send_error(&shared, request_id, &e);
                    continue;
                }
            };

            match opcode {
                Opcode::CancelTask => {
                    // Handled inline so a long-running call can be cancelled
                    let result = (|| {
                        let target = PayloadReader::new(&body).get_i32()?;
                        if let Some(token) = shared.tokens.lock().get(&target) {
                            debug!(target, "cancelling task");
                            token.cancel();
                        }
                        Ok(Vec::new())
                    })();
                    send_result(&shared, request_id, result);
                }
                Opcode::DisposeAndExit => {
                    *shared.installer.lock().await = None;
                    shared.tokens.lock().clear();
                    send_result(&shared, request_id, Ok(Vec::new()));
                    break;
                }
                _ => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        let result = dispatch(&shared, token_id, opcode, &body).await;
                        send_result(&shared, request_id, result);
                    });
                }
            }
        }

        // Stream over: cancel anything still running so in-flight tasks
        // wind down and release their channel senders
        for token in shared.tokens.lock().values() {
            token.cancel();
        }
        drop(shared);
        let _ = writer_task.await;
        Ok(())
    }
}

fn send_result(shared: &Shared, request_id: u32, result: Result<Vec<u8>>) {
    let mut frame = PayloadWriter::new();
    frame.put_u32(request_id);
    match result {
        Ok(body) => {
            frame.put_i32(ResultCode::Pass as i32).put_raw(&body);
        }
        Err(Error::Cancelled) => {
            frame.put_i32(ResultCode::Cancelled as i32);
        }
        Err(e) => {
            frame.put_i32(ResultCode::Error as i32).put_str(&e.to_string());
        }
    }
    let _ = shared.tx.send(frame.into_inner());
}

fn send_error(shared: &Shared, request_id: u32, e: &Error) {
    let mut frame = PayloadWriter::new();
    frame
        .put_u32(request_id)
        .put_i32(ResultCode::Error as i32)
        .put_str(&e.to_string());
    let _ = shared.tx.send(frame.into_inner());
}

fn convert(e: zipatch_install::Error) -> Error {
    match e {
        zipatch_install::Error::Cancelled => Error::Cancelled,
        other => Error::Install(other),
    }
}

async fn dispatch(shared: &Arc<Shared>, token_id: i32, opcode: Opcode, body: &[u8]) -> Result<Vec<u8>> {
    let mut r = PayloadReader::new(body);
    match opcode {
        Opcode::Construct => {
            let path = PathBuf::from(r.get_str()?);
            let installer = construct_installer(shared, &path)?;
            *shared.installer.lock().await = Some(installer);
            Ok(Vec::new())
        }
        Opcode::SetTargetStreamsReadOnly => {
            let root = PathBuf::from(r.get_str()?);
            with_installer(shared, |i| i.set_targets_read_only(&root).map_err(convert)).await?;
            Ok(Vec::new())
        }
        Opcode::SetTargetStreamsReadWrite => {
            let root = PathBuf::from(r.get_str()?);
            with_installer(shared, |i| i.set_targets_read_write(&root).map_err(convert)).await?;
            Ok(Vec::new())
        }
        Opcode::MarkFileAsMissing => {
            let target = r.get_u32()? as usize;
            with_installer(shared, |i| {
                i.mark_file_missing(target);
                Ok(())
            })
            .await?;
            Ok(Vec::new())
        }
        Opcode::VerifyFiles => {
            let refine = r.get_bool()?;
            let concurrency = r.get_u32()? as usize;
            let cancel = shared.token(token_id);
            let mut guard = shared.installer.lock().await;
            let installer = guard.as_mut().ok_or(Error::NotConstructed)?;
            let result = installer
                .verify_files(refine, concurrency, &cancel)
                .await
                .map_err(convert);
            shared.release_token(token_id);
            result.map(|()| Vec::new())
        }
        Opcode::RepairNonPatchData => {
            let cancel = shared.token(token_id);
            let result = with_installer(shared, |i| i.repair_non_patch_data(&cancel).map_err(convert)).await;
            shared.release_token(token_id);
            result.map(|()| Vec::new())
        }
        Opcode::WriteVersionFiles => {
            let root = PathBuf::from(r.get_str()?);
            with_installer(shared, |i| i.write_version_files(&root).map_err(convert)).await?;
            Ok(Vec::new())
        }
        Opcode::QueueInstallFromUrl => {
            let source = r.get_u8()?;
            let url = r.get_str()?;
            let session_token = r.get_opt_str()?;
            let split = r.get_u32()? as usize;
            with_installer(shared, |i| {
                i.queue_install_http(source, &url, session_token.as_deref(), split);
                Ok(())
            })
            .await?;
            Ok(Vec::new())
        }
        Opcode::QueueInstallFromLocalFile => {
            let source = r.get_u8()?;
            let path = PathBuf::from(r.get_str()?);
            let split = r.get_u32()? as usize;
            with_installer(shared, |i| {
                i.queue_install_local(source, &path, split);
                Ok(())
            })
            .await?;
            Ok(Vec::new())
        }
        Opcode::Install => {
            let concurrency = r.get_u32()? as usize;
            let cancel = shared.token(token_id);
            let mut guard = shared.installer.lock().await;
            let installer = guard.as_mut().ok_or(Error::NotConstructed)?;
            let result = installer.install(concurrency, &cancel).await.map_err(convert);
            shared.release_token(token_id);
            result.map(|()| Vec::new())
        }
        Opcode::GetMissingPartIndicesPerPatch => {
            let groups = with_installer(shared, |i| Ok(i.missing_part_indices_per_source())).await?;
            let mut w = PayloadWriter::new();
            w.put_u32(groups.len() as u32);
            for group in groups {
                w.put_u32(group.len() as u32);
                for (ti, pi) in group {
                    w.put_u32(ti as u32).put_u32(pi as u32);
                }
            }
            Ok(w.into_inner())
        }
        Opcode::GetMissingPartIndicesPerTargetFile => {
            let groups = with_installer(shared, |i| Ok(i.missing_part_indices_per_target())).await?;
            let mut w = PayloadWriter::new();
            w.put_u32(groups.len() as u32);
            for group in groups {
                w.put_u32(group.len() as u32);
                for pi in group {
                    w.put_u32(pi as u32);
                }
            }
            Ok(w.into_inner())
        }
        Opcode::GetSizeMismatchTargetFileIndices => {
            let targets = with_installer(shared, |i| Ok(i.size_mismatch_targets())).await?;
            let mut w = PayloadWriter::new();
            w.put_u32(targets.len() as u32);
            for ti in targets {
                w.put_u32(ti as u32);
            }
            Ok(w.into_inner())
        }
        Opcode::CancelTask | Opcode::DisposeAndExit => {
            // Handled in the read loop
            Err(Error::protocol("opcode must be handled inline"))
        }
    }
}

async fn with_installer<T>(shared: &Arc<Shared>, f: impl FnOnce(&mut Installer) -> Result<T>) -> Result<T> {
    let mut guard = shared.installer.lock().await;
    let installer = guard.as_mut().ok_or(Error::NotConstructed)?;
    f(installer)
}

fn construct_installer(shared: &Arc<Shared>, index_path: &Path) -> Result<Installer> {
    let index = PatchIndex::load(File::open(index_path)?)?;
    debug!(index = %index_path.display(), targets = index.targets().len(), "constructing installer");
    let mut installer = Installer::new(index);

    let tx = shared.tx.clone();
    let seq = Arc::clone(&shared.seq);
    installer.set_verify_progress_callback(move |file, done, total| {
        push_progress(&tx, &seq, PushOpcode::VerifyProgress, file, done, total);
    });
    let tx = shared.tx.clone();
    let seq = Arc::clone(&shared.seq);
    installer.set_install_progress_callback(move |source, done, total| {
        push_progress(&tx, &seq, PushOpcode::InstallProgress, source, done, total);
    });
    Ok(installer)
}

fn push_progress(
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    seq: &AtomicI64,
    opcode: PushOpcode,
    subject: usize,
    done: u64,
    total: u64,
) {
    let sequence = seq.fetch_add(1, Ordering::Relaxed) + 1;
    let mut w = PayloadWriter::new();
    w.put_u32(PUSH_REQUEST_ID)
        .put_i32(opcode as i32)
        .put_i64(sequence)
        .put_u32(subject as u32)
        .put_u64(done)
        .put_u64(total);
    let _ = tx.send(w.into_inner());
}
