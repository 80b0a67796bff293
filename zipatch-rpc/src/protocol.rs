//! Framed wire protocol between caller and worker
//!
//! Every frame on the wire is `[len:u32]` followed by `len` payload bytes,
//! all integers little-endian. Request payloads are
//! `[request_id:u32][cancel_token_id:i32][opcode:i32][body]` with a non-zero
//! request id. Worker-to-caller payloads start with the request id they
//! answer; id zero marks an out-of-band progress push
//! `[0:u32][push_opcode:i32][sequence:i64][body]` whose monotonic sequence
//! lets the caller discard stale progress.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Upper bound on a single frame
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Request id value reserved for progress pushes
pub const PUSH_REQUEST_ID: u32 = 0;

/// Request opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Opcode {
    /// Cancel the task running under a token id
    CancelTask = 0,
    /// Load an index and construct the session's installer
    Construct = 1,
    /// Tear the session down and exit
    DisposeAndExit = 2,
    /// Run a verify pass
    VerifyFiles = 3,
    /// Mark every part of one target as missing
    MarkFileAsMissing = 4,
    /// Attach all targets read-only under a root
    SetTargetStreamsReadOnly = 5,
    /// Attach damaged targets read-write under a root
    SetTargetStreamsReadWrite = 6,
    /// Rewrite synthetic parts of writable targets
    RepairNonPatchData = 7,
    /// Write the version marker files
    WriteVersionFiles = 8,
    /// Queue repair jobs fetching over HTTP
    QueueInstallFromUrl = 9,
    /// Queue repair jobs reading a local patch file
    QueueInstallFromLocalFile = 10,
    /// Run all queued jobs
    Install = 11,
    /// Missing parts grouped per source patch file
    GetMissingPartIndicesPerPatch = 12,
    /// Missing part indices grouped per target file
    GetMissingPartIndicesPerTargetFile = 13,
    /// Targets longer on disk than indexed
    GetSizeMismatchTargetFileIndices = 14,
}

impl TryFrom<i32> for Opcode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => Self::CancelTask,
            1 => Self::Construct,
            2 => Self::DisposeAndExit,
            3 => Self::VerifyFiles,
            4 => Self::MarkFileAsMissing,
            5 => Self::SetTargetStreamsReadOnly,
            6 => Self::SetTargetStreamsReadWrite,
            7 => Self::RepairNonPatchData,
            8 => Self::WriteVersionFiles,
            9 => Self::QueueInstallFromUrl,
            10 => Self::QueueInstallFromLocalFile,
            11 => Self::Install,
            12 => Self::GetMissingPartIndicesPerPatch,
            13 => Self::GetMissingPartIndicesPerTargetFile,
            14 => Self::GetSizeMismatchTargetFileIndices,
            other => return Err(Error::UnknownOpcode(other)),
        })
    }
}

/// Out-of-band push opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PushOpcode {
    /// Verify progress `[file:u32][done:u64][total:u64]`
    VerifyProgress = 100,
    /// Install progress `[source_display:u32][done:u64][total:u64]`
    InstallProgress = 101,
}

impl TryFrom<i32> for PushOpcode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            100 => Ok(Self::VerifyProgress),
            101 => Ok(Self::InstallProgress),
            other => Err(Error::UnknownOpcode(other)),
        }
    }
}

/// Result code of a completed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    /// The call succeeded; the body is its result
    Pass = 0,
    /// The call was cancelled
    Cancelled = 1,
    /// The call failed; the body is an error message
    Error = 2,
}

impl TryFrom<i32> for ResultCode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Pass),
            1 => Ok(Self::Cancelled),
            2 => Ok(Self::Error),
            other => Err(Error::protocol(format!("unknown result code {other}"))),
        }
    }
}

/// Little-endian payload builder
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    /// Start an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// The finished payload
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Append a u8.
    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    /// Append a bool as one byte.
    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.put_u8(u8::from(v))
    }

    /// Append a little-endian u32.
    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Append a little-endian i32.
    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Append a little-endian u64.
    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Append a little-endian i64.
    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    /// Append raw bytes with no length prefix.
    pub fn put_raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Append an optional string as a presence byte plus the string.
    pub fn put_opt_str(&mut self, v: Option<&str>) -> &mut Self {
        match v {
            Some(s) => {
                self.put_bool(true);
                self.put_str(s)
            }
            None => self.put_bool(false),
        }
    }
}

/// Little-endian payload cursor
#[derive(Debug)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Read from the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(Error::protocol("payload truncated"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read a u8.
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a one-byte bool.
    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Read a little-endian u32.
    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a little-endian i32.
    pub fn get_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a little-endian u64.
    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Read a little-endian i64.
    pub fn get_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::protocol("string is not valid UTF-8"))
    }

    /// Read an optional string written by [`PayloadWriter::put_opt_str`].
    pub fn get_opt_str(&mut self) -> Result<Option<String>> {
        if self.get_bool()? {
            Ok(Some(self.get_str()?))
        } else {
            Ok(None)
        }
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::protocol(format!("frame of {} bytes exceeds the limit", payload.len())));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::protocol(format!("frame of {len} bytes exceeds the limit")));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
