//! Caller-side engine speaking the framed protocol
//!
//! A [`RemotePatchEngine`] drives a worker session over any framed byte
//! stream: the stdio of a spawned `zipatch-worker` child process, or an
//! in-process duplex pipe running [`WorkerSession`] on a task. Responses are
//! correlated by request id; progress pushes are filtered by their monotonic
//! sequence so a late frame never rolls a progress display backwards.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::engine::{PatchEngine, ProgressEvent, ProgressHandler};
use crate::protocol::{
    read_frame, write_frame, Opcode, PayloadReader, PayloadWriter, PushOpcode, ResultCode,
    PUSH_REQUEST_ID,
};
use crate::worker::WorkerSession;
use crate::{Error, Result};

type PendingMap = Arc<parking_lot::Mutex<HashMap<u32, oneshot::Sender<(ResultCode, Vec<u8>)>>>>;
type SharedHandler = Arc<parking_lot::Mutex<Option<Arc<ProgressHandler>>>>;

/// [`PatchEngine`] implementation over a framed transport
pub struct RemotePatchEngine {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingMap,
    handler: SharedHandler,
    next_id: AtomicU32,
    reader_task: tokio::task::JoinHandle<()>,
    child: parking_lot::Mutex<Option<tokio::process::Child>>,
}

impl RemotePatchEngine {
    /// Drive a worker over an arbitrary framed transport.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::default();
        let handler: SharedHandler = Arc::default();
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&pending), Arc::clone(&handler)));
        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            handler,
            next_id: AtomicU32::new(1),
            reader_task,
            child: parking_lot::Mutex::new(None),
        }
    }

    /// Spawn a worker child process and drive it over its stdio.
    pub fn spawn_worker(program: &Path) -> Result<Self> {
        let mut child = tokio::process::Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().ok_or(Error::WorkerGone)?;
        let stdout = child.stdout.take().ok_or(Error::WorkerGone)?;
        let engine = Self::new(stdout, stdin);
        *engine.child.lock() = Some(child);
        Ok(engine)
    }

    /// Run a worker session on an in-process pipe. Same protocol, no child
    /// process; useful when privilege separation is not needed.
    pub fn in_process() -> Self {
        let (caller_io, worker_io) = tokio::io::duplex(256 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_io);
        tokio::spawn(async move {
            if let Err(e) = WorkerSession::run(worker_read, worker_write).await {
                warn!(error = %e, "in-process worker session ended with an error");
            }
        });
        let (caller_read, caller_write) = tokio::io::split(caller_io);
        Self::new(caller_read, caller_write)
    }

    /// Install a handler for progress pushes.
    pub fn set_progress_handler<F>(&self, f: F)
    where
        F: Fn(ProgressEvent) + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Arc::new(f));
    }

    async fn call(&self, token_id: i32, opcode: Opcode, body: &[u8]) -> Result<Vec<u8>> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        let mut frame = PayloadWriter::new();
        frame
            .put_u32(request_id)
            .put_i32(token_id)
            .put_i32(opcode as i32)
            .put_raw(body);

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, &frame.into_inner()).await {
                self.pending.lock().remove(&request_id);
                return Err(e);
            }
        }

        let (code, body) = rx.await.map_err(|_| Error::WorkerGone)?;
        match code {
            ResultCode::Pass => Ok(body),
            ResultCode::Cancelled => Err(Error::Cancelled),
            ResultCode::Error => {
                let message = PayloadReader::new(&body)
                    .get_str()
                    .unwrap_or_else(|_| "worker reported an unreadable error".to_string());
                Err(Error::Remote(message))
            }
        }
    }
}

impl Drop for RemotePatchEngine {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop<R>(mut reader: R, pending: PendingMap, handler: SharedHandler)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut last_seq: i64 = 0;
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "transport read failed");
                break;
            }
        };

        let mut r = PayloadReader::new(&frame);
        let Ok(request_id) = r.get_u32() else { continue };

        if request_id == PUSH_REQUEST_ID {
            if let Err(e) = handle_push(&mut r, &mut last_seq, &handler) {
                trace!(error = %e, "discarding malformed push");
            }
            continue;
        }

        let Ok(code) = r.get_i32().and_then(ResultCode::try_from) else {
            warn!(request_id, "discarding response with a bad result code");
            continue;
        };
        if let Some(tx) = pending.lock().remove(&request_id) {
            let _ = tx.send((code, r.remaining().to_vec()));
        }
    }

    // Transport gone: fail everything still waiting
    pending.lock().clear();
}

fn handle_push(r: &mut PayloadReader<'_>, last_seq: &mut i64, handler: &SharedHandler) -> Result<()> {
    let opcode = PushOpcode::try_from(r.get_i32()?)?;
    let sequence = r.get_i64()?;
    if sequence <= *last_seq {
        // Stale push, a newer one already arrived
        return Ok(());
    }
    *last_seq = sequence;

    let subject = r.get_u32()? as usize;
    let done = r.get_u64()?;
    let total = r.get_u64()?;
    let event = match opcode {
        PushOpcode::VerifyProgress => ProgressEvent::Verify { file: subject, done, total },
        PushOpcode::InstallProgress => ProgressEvent::Install { source: subject, done, total },
    };

    let handler = handler.lock().clone();
    if let Some(handler) = handler {
        handler(event);
    }
    Ok(())
}

#[async_trait]
impl PatchEngine for RemotePatchEngine {
    async fn construct(&self, index_path: &Path) -> Result<()> {
        let mut w = PayloadWriter::new();
        w.put_str(&index_path.to_string_lossy());
        self.call(-1, Opcode::Construct, &w.into_inner()).await.map(|_| ())
    }

    async fn set_targets_read_only(&self, root: &Path) -> Result<()> {
        let mut w = PayloadWriter::new();
        w.put_str(&root.to_string_lossy());
        self.call(-1, Opcode::SetTargetStreamsReadOnly, &w.into_inner())
            .await
            .map(|_| ())
    }

    async fn set_targets_read_write(&self, root: &Path) -> Result<()> {
        let mut w = PayloadWriter::new();
        w.put_str(&root.to_string_lossy());
        self.call(-1, Opcode::SetTargetStreamsReadWrite, &w.into_inner())
            .await
            .map(|_| ())
    }

    async fn mark_file_missing(&self, target_index: usize) -> Result<()> {
        let mut w = PayloadWriter::new();
        w.put_u32(target_index as u32);
        self.call(-1, Opcode::MarkFileAsMissing, &w.into_inner()).await.map(|_| ())
    }

    async fn verify_files(&self, token_id: i32, refine: bool, concurrency: usize) -> Result<()> {
        let mut w = PayloadWriter::new();
        w.put_bool(refine).put_u32(concurrency as u32);
        self.call(token_id, Opcode::VerifyFiles, &w.into_inner()).await.map(|_| ())
    }

    async fn repair_non_patch_data(&self, token_id: i32) -> Result<()> {
        self.call(token_id, Opcode::RepairNonPatchData, &[]).await.map(|_| ())
    }

    async fn queue_install_from_local_file(&self, source_index: u8, path: &Path, split: usize) -> Result<()> {
        let mut w = PayloadWriter::new();
        w.put_u8(source_index)
            .put_str(&path.to_string_lossy())
            .put_u32(split as u32);
        self.call(-1, Opcode::QueueInstallFromLocalFile, &w.into_inner())
            .await
            .map(|_| ())
    }

    async fn queue_install_from_url(
        &self,
        source_index: u8,
        url: &str,
        session_token: Option<&str>,
        split: usize,
    ) -> Result<()> {
        let mut w = PayloadWriter::new();
        w.put_u8(source_index)
            .put_str(url)
            .put_opt_str(session_token)
            .put_u32(split as u32);
        self.call(-1, Opcode::QueueInstallFromUrl, &w.into_inner()).await.map(|_| ())
    }

    async fn install(&self, token_id: i32, concurrency: usize) -> Result<()> {
        let mut w = PayloadWriter::new();
        w.put_u32(concurrency as u32);
        self.call(token_id, Opcode::Install, &w.into_inner()).await.map(|_| ())
    }

    async fn write_version_files(&self, root: &Path) -> Result<()> {
        let mut w = PayloadWriter::new();
        w.put_str(&root.to_string_lossy());
        self.call(-1, Opcode::WriteVersionFiles, &w.into_inner()).await.map(|_| ())
    }

    async fn missing_part_indices_per_patch(&self) -> Result<Vec<Vec<(u32, u32)>>> {
        let body = self.call(-1, Opcode::GetMissingPartIndicesPerPatch, &[]).await?;
        let mut r = PayloadReader::new(&body);
        let groups = r.get_u32()? as usize;
        let mut out = Vec::with_capacity(groups);
        for _ in 0..groups {
            let count = r.get_u32()? as usize;
            let mut group = Vec::with_capacity(count);
            for _ in 0..count {
                let ti = r.get_u32()?;
                let pi = r.get_u32()?;
                group.push((ti, pi));
            }
            out.push(group);
        }
        Ok(out)
    }

    async fn missing_part_indices_per_target_file(&self) -> Result<Vec<Vec<u32>>> {
        let body = self
            .call(-1, Opcode::GetMissingPartIndicesPerTargetFile, &[])
            .await?;
        let mut r = PayloadReader::new(&body);
        let groups = r.get_u32()? as usize;
        let mut out = Vec::with_capacity(groups);
        for _ in 0..groups {
            let count = r.get_u32()? as usize;
            let mut group = Vec::with_capacity(count);
            for _ in 0..count {
                group.push(r.get_u32()?);
            }
            out.push(group);
        }
        Ok(out)
    }

    async fn size_mismatch_target_file_indices(&self) -> Result<Vec<u32>> {
        let body = self
            .call(-1, Opcode::GetSizeMismatchTargetFileIndices, &[])
            .await?;
        let mut r = PayloadReader::new(&body);
        let count = r.get_u32()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(r.get_u32()?);
        }
        Ok(out)
    }

    async fn cancel_task(&self, token_id: i32) -> Result<()> {
        let mut w = PayloadWriter::new();
        w.put_i32(token_id);
        self.call(-1, Opcode::CancelTask, &w.into_inner()).await.map(|_| ())
    }

    async fn dispose(&self) -> Result<()> {
        self.call(-1, Opcode::DisposeAndExit, &[]).await.map(|_| ())?;
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            let _ = child.wait().await;
        }
        Ok(())
    }
}
