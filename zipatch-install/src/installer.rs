//! Verify and repair engine driven by a byte-provenance index
//!
//! The [`Installer`] owns the index, the attached target file streams and the
//! transient working sets a verify pass produces: which parts are missing
//! (grouped per target and per source) and which files on disk are longer
//! than they should be. Install consumes those sets by fetching the needed
//! source ranges, locally or over HTTP, and rewriting exactly the bad parts.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zipatch_fetch::{merge_ranges, ByteRange, RangeChunk, RangeClient, DEFAULT_MERGE_GAP};
use zipatch_index::{PatchIndex, VerifyResult};

use crate::{Error, Result};

/// Default wall-clock spacing of progress callbacks
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Source bytes one HTTP job may cover
const HTTP_JOB_SOURCE_BYTE_CAP: u64 = 256 << 20;
/// Attempts per install job before its leftovers become a failure
const INSTALL_JOB_ATTEMPTS: u32 = 8;
/// Chunk size for streaming writes of synthetic part content
const SYNTH_WRITE_CHUNK: usize = 64 * 1024;

/// Verify progress: `(current_target_index, bytes_done, bytes_total)`
pub type VerifyProgressFn = dyn Fn(usize, u64, u64) + Send + Sync;
/// Install progress: `(source_index_display, bytes_done, bytes_total)`
pub type InstallProgressFn = dyn Fn(usize, u64, u64) + Send + Sync;
/// Corruption report: `(target_index, part_index, result)`
pub type CorruptionFn = dyn Fn(usize, usize, VerifyResult) + Send + Sync;

#[derive(Clone)]
struct TargetStream {
    file: Arc<Mutex<File>>,
    writable: bool,
}

#[derive(Debug, Clone)]
enum JobSource {
    Local { path: PathBuf },
    Http { url: String, session_token: Option<String> },
}

struct InstallJob {
    source_index: u8,
    source: JobSource,
    /// `(target_index, part_index)`, sorted by source offset
    parts: Vec<(usize, usize)>,
}

/// Verify/repair engine over one patch index
pub struct Installer {
    index: Arc<PatchIndex>,
    streams: Vec<Option<TargetStream>>,
    missing_per_target: Vec<BTreeSet<usize>>,
    oversized: BTreeSet<usize>,
    jobs: Vec<InstallJob>,
    progress_interval: Duration,
    on_verify_progress: Option<Arc<VerifyProgressFn>>,
    on_install_progress: Option<Arc<InstallProgressFn>>,
    on_corruption: Option<Arc<CorruptionFn>>,
}

impl Installer {
    /// Create an installer over an index; no streams attached, nothing
    /// marked missing yet.
    pub fn new(index: PatchIndex) -> Self {
        let targets = index.targets().len();
        Self {
            index: Arc::new(index),
            streams: vec![None; targets],
            missing_per_target: vec![BTreeSet::new(); targets],
            oversized: BTreeSet::new(),
            jobs: Vec::new(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            on_verify_progress: None,
            on_install_progress: None,
            on_corruption: None,
        }
    }

    /// The index this installer operates on
    pub fn index(&self) -> &PatchIndex {
        &self.index
    }

    /// Override the progress callback interval.
    pub fn set_progress_interval(&mut self, interval: Duration) {
        self.progress_interval = interval;
    }

    /// Install a verify progress callback.
    pub fn set_verify_progress_callback<F>(&mut self, f: F)
    where
        F: Fn(usize, u64, u64) + Send + Sync + 'static,
    {
        self.on_verify_progress = Some(Arc::new(f));
    }

    /// Install an install progress callback.
    pub fn set_install_progress_callback<F>(&mut self, f: F)
    where
        F: Fn(usize, u64, u64) + Send + Sync + 'static,
    {
        self.on_install_progress = Some(Arc::new(f));
    }

    /// Install a per-part corruption callback, invoked for every failed part
    /// a verify pass finds.
    pub fn set_corruption_callback<F>(&mut self, f: F)
    where
        F: Fn(usize, usize, VerifyResult) + Send + Sync + 'static,
    {
        self.on_corruption = Some(Arc::new(f));
    }

    /// Missing part indices, grouped per target file
    pub fn missing_part_indices_per_target(&self) -> Vec<Vec<usize>> {
        self.missing_per_target
            .iter()
            .map(|set| set.iter().copied().collect())
            .collect()
    }

    /// Missing parts as `(target_index, part_index)`, grouped per source
    /// patch file and sorted by source offset
    pub fn missing_part_indices_per_source(&self) -> Vec<Vec<(usize, usize)>> {
        (0..self.index.sources().len())
            .map(|si| self.missing_parts_for_source(si as u8))
            .collect()
    }

    /// Targets whose on-disk size exceeds the indexed size
    pub fn size_mismatch_targets(&self) -> Vec<usize> {
        self.oversized.iter().copied().collect()
    }

    /// Mark every part of a target as missing.
    pub fn mark_file_missing(&mut self, target_index: usize) {
        let parts = self.index.targets()[target_index].parts().len();
        self.missing_per_target[target_index] = (0..parts).collect();
    }

    fn attach(&mut self, target_index: usize, file: File, writable: bool) {
        self.streams[target_index] = Some(TargetStream {
            file: Arc::new(Mutex::new(file)),
            writable,
        });
    }

    /// Attach one target read-only from an explicit path.
    pub fn set_target_read_only(&mut self, target_index: usize, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        self.attach(target_index, file, false);
        Ok(())
    }

    /// Attach one target read-write from an explicit path, creating it and
    /// pre-sizing it to the indexed size if it is shorter.
    pub fn set_target_read_write(&mut self, target_index: usize, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let indexed = self.index.targets()[target_index].file_size();
        if file.metadata()?.len() < indexed {
            file.set_len(indexed)?;
        }
        self.attach(target_index, file, true);
        Ok(())
    }

    /// Attach every target read-only under an installation root; targets
    /// missing from disk are marked fully missing.
    pub fn set_targets_read_only(&mut self, root: &Path) -> Result<()> {
        for ti in 0..self.index.targets().len() {
            let path = root.join(self.index.targets()[ti].relative_path());
            match File::open(&path) {
                Ok(file) => self.attach(ti, file, false),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = %path.display(), "target absent, marking all parts missing");
                    self.streams[ti] = None;
                    self.mark_file_missing(ti);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Re-attach read-write every target that a verify pass found damaged
    /// (missing parts or oversized).
    pub fn set_targets_read_write(&mut self, root: &Path) -> Result<()> {
        for ti in 0..self.index.targets().len() {
            if self.missing_per_target[ti].is_empty() && !self.oversized.contains(&ti) {
                continue;
            }
            let path = root.join(self.index.targets()[ti].relative_path());
            self.set_target_read_write(ti, &path)?;
        }
        Ok(())
    }

    /// Verify attached targets against the index, rebuilding the missing-part
    /// working sets.
    ///
    /// With `refine` only previously-missing parts are re-checked; otherwise
    /// the sets are rebuilt from scratch. One worker handles one target file;
    /// `concurrency` bounds the pool.
    pub async fn verify_files(&mut self, refine: bool, concurrency: usize, cancel: &CancellationToken) -> Result<()> {
        let mut work: Vec<(usize, Vec<usize>)> = Vec::new();
        for ti in 0..self.index.targets().len() {
            let candidates: Vec<usize> = if refine {
                self.missing_per_target[ti].iter().copied().collect()
            } else {
                (0..self.index.targets()[ti].parts().len()).collect()
            };
            if !refine {
                self.missing_per_target[ti].clear();
            }
            work.push((ti, candidates));
        }

        let total: u64 = work
            .iter()
            .flat_map(|(ti, c)| {
                let target = &self.index.targets()[*ti];
                c.iter().map(move |&pi| u64::from(target.parts()[pi].target_size()))
            })
            .sum();
        let done = Arc::new(AtomicU64::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let ticker = self.spawn_ticker(self.on_verify_progress.clone(), &done, &current, total);

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut join_set: JoinSet<(usize, Result<Vec<(usize, VerifyResult)>>)> = JoinSet::new();

        for (ti, candidates) in work {
            if candidates.is_empty() {
                continue;
            }
            let Some(stream) = self.streams[ti].clone() else {
                // No stream: every candidate part stays missing
                let target = &self.index.targets()[ti];
                let bytes: u64 = candidates.iter().map(|&pi| u64::from(target.parts()[pi].target_size())).sum();
                done.fetch_add(bytes, Ordering::Relaxed);
                self.missing_per_target[ti].extend(candidates);
                continue;
            };

            // Size check up front; the oversized tail is invisible to
            // per-part verification
            let disk_len = stream.file.lock().metadata()?.len();
            if disk_len > self.index.targets()[ti].file_size() {
                self.oversized.insert(ti);
            } else {
                self.oversized.remove(&ti);
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Task(e.to_string()))?;
            let index = Arc::clone(&self.index);
            let cancel = cancel.clone();
            let done = Arc::clone(&done);
            let current = Arc::clone(&current);

            join_set.spawn(async move {
                let _permit = permit;
                let result = tokio::task::spawn_blocking(move || {
                    current.store(ti, Ordering::Relaxed);
                    let mut results = Vec::with_capacity(candidates.len());
                    for pi in candidates {
                        if cancel.is_cancelled() {
                            return Err(Error::Cancelled);
                        }
                        let part = index.targets()[ti].parts()[pi];
                        let outcome = {
                            let mut file = stream.file.lock();
                            part.verify_stream(&mut *file)?
                        };
                        done.fetch_add(u64::from(part.target_size()), Ordering::Relaxed);
                        results.push((pi, outcome));
                    }
                    Ok(results)
                })
                .await
                .map_err(|e| Error::Task(e.to_string()))
                .and_then(|r| r);
                (ti, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            let (ti, result) = joined.map_err(|e| Error::Task(e.to_string()))?;
            match result {
                Ok(results) => {
                    for (pi, outcome) in results {
                        match outcome {
                            VerifyResult::Pass => {
                                self.missing_per_target[ti].remove(&pi);
                            }
                            VerifyResult::FailUnverifiable => {
                                // The checksum pass guarantees verifiability;
                                // this index was built wrong
                                first_error.get_or_insert(Error::UnverifiablePart {
                                    path: self.index.targets()[ti].relative_path().to_string(),
                                    target_offset: self.index.targets()[ti].parts()[pi].target_offset(),
                                });
                            }
                            VerifyResult::FailNotEnoughData | VerifyResult::FailBadData => {
                                self.missing_per_target[ti].insert(pi);
                                if let Some(cb) = &self.on_corruption {
                                    cb(ti, pi, outcome);
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(handle) = ticker {
            handle.abort();
        }
        if let Some(cb) = &self.on_verify_progress {
            cb(current.load(Ordering::Relaxed), done.load(Ordering::Relaxed), total);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(
                    missing = self.missing_per_target.iter().map(BTreeSet::len).sum::<usize>(),
                    oversized = self.oversized.len(),
                    "verify pass complete"
                );
                Ok(())
            }
        }
    }

    fn missing_parts_for_source(&self, source_index: u8) -> Vec<(usize, usize)> {
        let mut parts: Vec<(usize, usize)> = Vec::new();
        for (ti, set) in self.missing_per_target.iter().enumerate() {
            for &pi in set {
                if self.index.targets()[ti].parts()[pi].source_index() == Some(source_index) {
                    parts.push((ti, pi));
                }
            }
        }
        parts.sort_by_key(|&(ti, pi)| self.index.targets()[ti].parts()[pi].source_offset());
        parts
    }

    /// Queue repair jobs reading source bytes from a local patch file.
    pub fn queue_install_local(&mut self, source_index: u8, path: &Path, split: usize) {
        let parts = self.missing_parts_for_source(source_index);
        for group in partition(parts, split.max(1)) {
            self.jobs.push(InstallJob {
                source_index,
                source: JobSource::Local { path: path.to_path_buf() },
                parts: group,
            });
        }
    }

    /// Queue repair jobs fetching source bytes over HTTP ranges.
    pub fn queue_install_http(&mut self, source_index: u8, url: &str, session_token: Option<&str>, split: usize) {
        let parts = self.missing_parts_for_source(source_index);
        for group in partition(parts, split.max(1)) {
            for capped in cap_by_source_bytes(&self.index, group, HTTP_JOB_SOURCE_BYTE_CAP) {
                self.jobs.push(InstallJob {
                    source_index,
                    source: JobSource::Http {
                        url: url.to_string(),
                        session_token: session_token.map(str::to_string),
                    },
                    parts: capped,
                });
            }
        }
    }

    /// Number of queued install jobs
    pub fn queued_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Run every queued job, then rewrite synthetic parts and truncate
    /// oversized targets.
    ///
    /// Jobs run under a bounded pool; a failing job does not stop the others,
    /// and all failures are raised together afterwards. Parts written before
    /// a cancellation stay written.
    pub async fn install(&mut self, concurrency: usize, cancel: &CancellationToken) -> Result<()> {
        let jobs = std::mem::take(&mut self.jobs);
        let total: u64 = jobs
            .iter()
            .flat_map(|job| job.parts.iter())
            .map(|&(ti, pi)| u64::from(self.index.targets()[ti].parts()[pi].target_size()))
            .sum();
        let done = Arc::new(AtomicU64::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let ticker = self.spawn_ticker(self.on_install_progress.clone(), &done, &current, total);

        let streams = Arc::new(self.streams.clone());
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut join_set: JoinSet<Result<Vec<(usize, usize)>>> = JoinSet::new();

        for job in jobs {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Task(e.to_string()))?;
            let index = Arc::clone(&self.index);
            let streams = Arc::clone(&streams);
            let cancel = cancel.clone();
            let done = Arc::clone(&done);
            let current = Arc::clone(&current);

            join_set.spawn(async move {
                let _permit = permit;
                let InstallJob {
                    source_index,
                    source,
                    parts,
                } = job;
                current.store(usize::from(source_index) + 1, Ordering::Relaxed);
                let satisfied = parts.clone();
                match source {
                    JobSource::Local { path } => {
                        let result = tokio::task::spawn_blocking(move || {
                            run_local_job(&index, &streams, &path, &parts, &cancel, &done)
                        })
                        .await
                        .map_err(|e| Error::Task(e.to_string()))
                        .and_then(|r| r);
                        result.map(|()| satisfied)
                    }
                    JobSource::Http { url, session_token } => run_http_job(
                        &index,
                        &streams,
                        source_index,
                        &url,
                        session_token.as_deref(),
                        &parts,
                        &cancel,
                        &done,
                    )
                    .await
                    .map(|()| satisfied),
                }
            });
        }

        let mut failures = Vec::new();
        let mut cancelled = false;
        while let Some(joined) = join_set.join_next().await {
            match joined.map_err(|e| Error::Task(e.to_string()))? {
                Ok(satisfied) => {
                    for (ti, pi) in satisfied {
                        self.missing_per_target[ti].remove(&pi);
                    }
                }
                Err(Error::Cancelled) => cancelled = true,
                Err(e) => failures.push(e),
            }
        }

        if let Some(handle) = ticker {
            handle.abort();
        }
        if let Some(cb) = &self.on_install_progress {
            cb(current.load(Ordering::Relaxed), done.load(Ordering::Relaxed), total);
        }

        if cancelled {
            return Err(Error::Cancelled);
        }

        self.repair_non_patch_data(cancel)?;
        self.truncate_oversized()?;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::jobs_failed(failures))
        }
    }

    /// Rewrite every synthetic (zero-fill and placeholder) part of every
    /// writable target. Cheap relative to patch data, so no verify gating.
    pub fn repair_non_patch_data(&mut self, cancel: &CancellationToken) -> Result<()> {
        for ti in 0..self.index.targets().len() {
            let Some(stream) = &self.streams[ti] else { continue };
            if !stream.writable {
                continue;
            }
            for (pi, part) in self.index.targets()[ti].parts().iter().enumerate() {
                if part.is_from_patch() || part.source() == zipatch_index::PartSource::Unavailable {
                    continue;
                }
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let mut file = stream.file.lock();
                file.seek(SeekFrom::Start(part.target_offset()))?;
                let mut written: u64 = 0;
                let size = u64::from(part.target_size());
                let mut chunk = vec![0u8; SYNTH_WRITE_CHUNK.min(size as usize)];
                while written < size {
                    let take = ((size - written).min(chunk.len() as u64)) as usize;
                    part.reconstruct_without_source(&mut chunk[..take], written)?;
                    file.write_all(&chunk[..take])?;
                    written += take as u64;
                }
                drop(file);
                self.missing_per_target[ti].remove(&pi);
            }
        }
        Ok(())
    }

    /// Truncate writable targets that are longer on disk than the index says.
    pub fn truncate_oversized(&mut self) -> Result<()> {
        let oversized: Vec<usize> = self.oversized.iter().copied().collect();
        for ti in oversized {
            let Some(stream) = &self.streams[ti] else { continue };
            if !stream.writable {
                continue;
            }
            stream.file.lock().set_len(self.index.targets()[ti].file_size())?;
            self.oversized.remove(&ti);
        }
        Ok(())
    }

    /// Write the chain's version string to its `.ver` and `.bck` marker
    /// files under `root`. Both are always rewritten together.
    pub fn write_version_files(&self, root: &Path) -> Result<()> {
        let version = self.index.version_name().ok_or(Error::NoVersionName)?;
        for rel in [self.index.version_file_ver(), self.index.version_file_bck()] {
            let path = root.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, version)?;
        }
        Ok(())
    }

    fn spawn_ticker(
        &self,
        callback: Option<Arc<dyn Fn(usize, u64, u64) + Send + Sync>>,
        done: &Arc<AtomicU64>,
        current: &Arc<AtomicUsize>,
        total: u64,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let cb = callback?;
        let done = Arc::clone(done);
        let current = Arc::clone(current);
        let interval = self.progress_interval;
        Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                timer.tick().await;
                cb(current.load(Ordering::Relaxed), done.load(Ordering::Relaxed), total);
            }
        }))
    }
}

/// Split into `split` consecutive groups of roughly equal length.
fn partition(parts: Vec<(usize, usize)>, split: usize) -> Vec<Vec<(usize, usize)>> {
    if parts.is_empty() {
        return Vec::new();
    }
    let per_group = parts.len().div_ceil(split);
    parts.chunks(per_group).map(<[_]>::to_vec).collect()
}

/// Split a group further so no job covers more than `cap` source bytes.
fn cap_by_source_bytes(index: &PatchIndex, parts: Vec<(usize, usize)>, cap: u64) -> Vec<Vec<(usize, usize)>> {
    let mut groups = Vec::new();
    let mut group: Vec<(usize, usize)> = Vec::new();
    let mut bytes: u64 = 0;
    for (ti, pi) in parts {
        let size = index.targets()[ti].parts()[pi].max_source_size();
        if !group.is_empty() && bytes + size > cap {
            groups.push(std::mem::take(&mut group));
            bytes = 0;
        }
        bytes += size;
        group.push((ti, pi));
    }
    if !group.is_empty() {
        groups.push(group);
    }
    groups
}

fn write_part(
    index: &PatchIndex,
    streams: &[Option<TargetStream>],
    ti: usize,
    buf: &[u8],
    target_offset: u64,
) -> Result<()> {
    let target = &index.targets()[ti];
    let stream = streams[ti].as_ref().ok_or_else(|| Error::StreamNotAttached {
        path: target.relative_path().to_string(),
    })?;
    if !stream.writable {
        return Err(Error::NotWritable {
            path: target.relative_path().to_string(),
        });
    }
    let mut file = stream.file.lock();
    file.seek(SeekFrom::Start(target_offset))?;
    file.write_all(buf)?;
    Ok(())
}

fn run_local_job(
    index: &PatchIndex,
    streams: &[Option<TargetStream>],
    path: &Path,
    parts: &[(usize, usize)],
    cancel: &CancellationToken,
    done: &AtomicU64,
) -> Result<()> {
    let mut source = File::open(path)?;
    for &(ti, pi) in parts {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let part = index.targets()[ti].parts()[pi];
        let mut buf = vec![0u8; part.target_size() as usize];
        part.reconstruct_from_reader(&mut source, &mut buf, 0, true)?;
        write_part(index, streams, ti, &buf, part.target_offset())?;
        done.fetch_add(u64::from(part.target_size()), Ordering::Relaxed);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_http_job(
    index: &PatchIndex,
    streams: &[Option<TargetStream>],
    source_index: u8,
    url: &str,
    session_token: Option<&str>,
    parts: &[(usize, usize)],
    cancel: &CancellationToken,
    done: &AtomicU64,
) -> Result<()> {
    let mut builder = RangeClient::builder();
    if let Some(token) = session_token {
        builder = builder.session_token(token);
    }
    let client = builder.build().map_err(Error::Fetch)?;

    let high_water = index
        .source_high_water(usize::from(source_index))
        .unwrap_or(u64::MAX);
    let mut remaining: Vec<(usize, usize)> = parts.to_vec();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let ranges: Vec<ByteRange> = remaining
            .iter()
            .filter_map(|&(ti, pi)| {
                let part = index.targets()[ti].parts()[pi];
                let offset = part.source_offset()?;
                let end = part.max_source_end()?.min(high_water).max(offset + 1);
                Some(ByteRange::new(offset, end - offset))
            })
            .collect();
        let merged = merge_ranges(ranges, DEFAULT_MERGE_GAP);
        let chunks = client.fetch_ranges(url, &merged).await?;

        let mut leftovers = Vec::new();
        for &(ti, pi) in &remaining {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let part = index.targets()[ti].parts()[pi];
            let Some(offset) = part.source_offset() else {
                leftovers.push((ti, pi));
                continue;
            };
            let Some(segment) = chunk_segment(&chunks, offset) else {
                leftovers.push((ti, pi));
                continue;
            };

            let mut buf = vec![0u8; part.target_size() as usize];
            match part.reconstruct_from_segment(segment, &mut buf, 0, true) {
                Ok(()) => {
                    write_part(index, streams, ti, &buf, part.target_offset())?;
                    done.fetch_add(u64::from(part.target_size()), Ordering::Relaxed);
                }
                Err(zipatch_index::Error::ShortSourceData { .. }) => {
                    // Server delivered less than asked; try again
                    leftovers.push((ti, pi));
                }
                Err(e) => return Err(e.into()),
            }
        }

        if leftovers.is_empty() {
            return Ok(());
        }
        if attempt >= INSTALL_JOB_ATTEMPTS {
            let (ti, pi) = leftovers[0];
            return Err(Error::MissingTargetPart {
                path: index.targets()[ti].relative_path().to_string(),
                target_offset: index.targets()[ti].parts()[pi].target_offset(),
            });
        }
        warn!(
            url,
            attempt,
            leftovers = leftovers.len(),
            "source ranges not fully delivered, refetching"
        );
        tokio::time::sleep(job_backoff(attempt)).await;
        remaining = leftovers;
    }
}

/// Bytes of the chunk covering `offset`, from `offset` to the chunk's end
fn chunk_segment(chunks: &[RangeChunk], offset: u64) -> Option<&[u8]> {
    chunks.iter().find_map(|chunk| {
        let end = chunk.offset + chunk.data.len() as u64;
        (chunk.offset <= offset && offset < end).then(|| &chunk.data[(offset - chunk.offset) as usize..])
    })
}

fn job_backoff(completed: u32) -> Duration {
    if completed <= 1 {
        return Duration::ZERO;
    }
    Duration::from_secs(2u64 << (completed - 2).min(4)).min(Duration::from_secs(32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use zipatch_index::{DataBlock, PatchOperation, EXPANSION_BASE_GAME};

    fn tiny_index() -> PatchIndex {
        let cancel = CancellationToken::new();
        let mut index = PatchIndex::new(EXPANSION_BASE_GAME);
        index
            .apply_operations(
                "D2025.01.01.0000.0000.patch",
                &[PatchOperation::AddFileBlocks {
                    path: "a.dat".into(),
                    file_offset: 0,
                    blocks: vec![
                        DataBlock { source_offset: 0, decompressed_size: 100, compressed_size: None },
                        DataBlock { source_offset: 100, decompressed_size: 100, compressed_size: None },
                        DataBlock { source_offset: 200, decompressed_size: 100, compressed_size: None },
                    ],
                }],
                &cancel,
            )
            .unwrap();
        index
    }

    #[test]
    fn test_partition_consecutive_groups() {
        let parts: Vec<(usize, usize)> = (0..7).map(|i| (0, i)).collect();
        let groups = partition(parts, 3);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[2], vec![(0, 6)]);
    }

    #[test]
    fn test_cap_by_source_bytes() {
        let index = tiny_index();
        let parts = vec![(0, 0), (0, 1), (0, 2)];
        let groups = cap_by_source_bytes(&index, parts, 150);
        assert_eq!(groups.len(), 3);
        let groups = cap_by_source_bytes(&index, vec![(0, 0), (0, 1), (0, 2)], 250);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn test_job_backoff_caps() {
        assert_eq!(job_backoff(1), Duration::ZERO);
        assert_eq!(job_backoff(2), Duration::from_secs(2));
        assert_eq!(job_backoff(3), Duration::from_secs(4));
        assert_eq!(job_backoff(10), Duration::from_secs(32));
    }

    #[test]
    fn test_mark_file_missing_covers_all_parts() {
        let mut installer = Installer::new(tiny_index());
        installer.mark_file_missing(0);
        assert_eq!(installer.missing_part_indices_per_target()[0], vec![0, 1, 2]);
        assert_eq!(installer.missing_part_indices_per_source()[0].len(), 3);
    }

    #[test]
    fn test_chunk_segment_lookup() {
        let chunks = vec![
            RangeChunk { offset: 100, data: vec![1; 50] },
            RangeChunk { offset: 500, data: vec![2; 10] },
        ];
        assert_eq!(chunk_segment(&chunks, 120).unwrap().len(), 30);
        assert_eq!(chunk_segment(&chunks, 505).unwrap(), &[2u8; 5][..]);
        assert!(chunk_segment(&chunks, 99).is_none());
        assert!(chunk_segment(&chunks, 510).is_none());
    }
}
