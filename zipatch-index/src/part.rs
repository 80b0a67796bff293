//! Part locators: one contiguous target byte range and where its bytes come from
//!
//! A [`PartLocator`] is the atomic unit of the patch index. Millions of them
//! may be held in memory for a large installation, so the in-memory form is a
//! compact value type; the serializer packs it into a fixed 24-byte record.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::DeflateDecoder;

use crate::{Error, Result};

/// Source index sentinel: synthetic all-zero bytes
pub const SOURCE_INDEX_ZEROS: u8 = u8::MAX;
/// Source index sentinel: empty-block placeholder header plus zero fill
pub const SOURCE_INDEX_EMPTY_BLOCK: u8 = u8::MAX - 1;
/// Source index sentinel: no byte provenance recorded
pub const SOURCE_INDEX_UNAVAILABLE: u8 = u8::MAX - 2;
/// Largest source index denoting an actual patch file
pub const SOURCE_INDEX_MAX_VALID: u8 = u8::MAX - 3;

/// Maximum target size storable in the 30-bit packed size field
pub const MAX_TARGET_SIZE: u32 = (1 << 30) - 1;

/// Inflated size cap for a deflated source block
pub const DEFLATED_BLOCK_CAP: usize = 16 * 1024;

/// Size in bytes of one placeholder unit
pub const PLACEHOLDER_UNIT: u64 = 1 << 7;

/// Length of the structural placeholder header prefix
const PLACEHOLDER_HEADER_LEN: usize = 24;

/// Serialized size of one part record
pub const PART_RECORD_LEN: usize = 24;

const FLAG_DEFLATED: u32 = 0x8000_0000;
const FLAG_VALID_CRC32: u32 = 0x4000_0000;
const TARGET_SIZE_MASK: u32 = 0x3FFF_FFFF;

/// Where the bytes of one target range come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartSource {
    /// Copied (and possibly inflated) from a patch file
    Patch {
        /// Which source patch file
        index: u8,
        /// Byte offset into that patch file
        offset: u32,
        /// Whether the source bytes are a deflate-compressed block
        deflated: bool,
        /// Offset within the inflated block where this part's data begins;
        /// non-zero only after a deflated part has been split
        split_from: u16,
    },
    /// Synthetic zero fill, no source I/O
    Zeros,
    /// Structural placeholder header followed by zero fill
    EmptyBlock {
        /// Unit count stored in the placeholder header
        units: u32,
        /// Offset into the synthetic pattern where this part begins;
        /// non-zero only after a placeholder part has been split
        skip: u16,
    },
    /// No provenance exists; must never be reconstructed
    Unavailable,
}

/// Outcome of verifying a part against target bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    /// Target bytes match the record
    Pass,
    /// The part carries neither a checksum nor synthesizable content
    FailUnverifiable,
    /// The target ended before the part's range
    FailNotEnoughData,
    /// Target bytes differ from the record
    FailBadData,
}

/// One contiguous byte range of a target file plus its byte provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartLocator {
    target_offset: u64,
    target_size: u32,
    target_index: u8,
    source: PartSource,
    crc32: Option<u32>,
}

impl PartLocator {
    /// Create a part locator, rejecting values too large for the packed
    /// on-disk fields.
    pub fn new(target_offset: u64, target_size: u32, target_index: u8, source: PartSource) -> Result<Self> {
        if target_size == 0 || target_size > MAX_TARGET_SIZE {
            return Err(Error::FieldOverflow {
                field: "target_size",
                value: u64::from(target_size),
            });
        }

        if let PartSource::Patch {
            index,
            deflated,
            split_from,
            ..
        } = source
        {
            if index > SOURCE_INDEX_MAX_VALID {
                return Err(Error::FieldOverflow {
                    field: "source_index",
                    value: u64::from(index),
                });
            }
            if !deflated && split_from != 0 {
                return Err(Error::SplitOnNonDeflated { target_offset });
            }
        }

        Ok(Self {
            target_offset,
            target_size,
            target_index,
            source,
            crc32: None,
        })
    }

    /// Attach a known CRC32 of the target bytes.
    pub fn with_crc32(mut self, crc32: u32) -> Self {
        self.crc32 = Some(crc32);
        self
    }

    /// First byte of the target range
    pub fn target_offset(&self) -> u64 {
        self.target_offset
    }

    /// Length of the target range
    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    /// One past the last byte of the target range
    pub fn target_end(&self) -> u64 {
        self.target_offset + u64::from(self.target_size)
    }

    /// Index of the target file this part belongs to
    pub fn target_index(&self) -> u8 {
        self.target_index
    }

    pub(crate) fn set_target_index(&mut self, target_index: u8) {
        self.target_index = target_index;
    }

    /// Byte provenance
    pub fn source(&self) -> PartSource {
        self.source
    }

    /// Verified CRC32 of the target bytes, if one has been computed
    pub fn crc32(&self) -> Option<u32> {
        self.crc32
    }

    /// Whether this part's bytes come from a patch file
    pub fn is_from_patch(&self) -> bool {
        matches!(self.source, PartSource::Patch { .. })
    }

    /// Patch file index, if sourced from one
    pub fn source_index(&self) -> Option<u8> {
        match self.source {
            PartSource::Patch { index, .. } => Some(index),
            _ => None,
        }
    }

    /// Byte offset into the source patch file, if sourced from one
    pub fn source_offset(&self) -> Option<u64> {
        match self.source {
            PartSource::Patch { offset, .. } => Some(u64::from(offset)),
            _ => None,
        }
    }

    /// Upper bound on source bytes this part consumes: the 16 KiB block cap
    /// when deflated, the target size otherwise.
    pub fn max_source_size(&self) -> u64 {
        match self.source {
            PartSource::Patch { deflated: true, .. } => DEFLATED_BLOCK_CAP as u64,
            _ => u64::from(self.target_size),
        }
    }

    /// One past the furthest source byte this part may read
    pub fn max_source_end(&self) -> Option<u64> {
        self.source_offset().map(|o| o + self.max_source_size())
    }

    /// Verify exactly the part's range of target bytes.
    ///
    /// `buf` must hold the full range; a shorter slice is reported as
    /// [`VerifyResult::FailNotEnoughData`].
    pub fn verify_slice(&self, buf: &[u8]) -> VerifyResult {
        if buf.len() != self.target_size as usize {
            return VerifyResult::FailNotEnoughData;
        }

        if let Some(expected) = self.crc32 {
            return if crc32fast::hash(buf) == expected {
                VerifyResult::Pass
            } else {
                VerifyResult::FailBadData
            };
        }

        match self.source {
            PartSource::Zeros => {
                if buf.iter().all(|&b| b == 0) {
                    VerifyResult::Pass
                } else {
                    VerifyResult::FailBadData
                }
            }
            PartSource::EmptyBlock { units, skip } => {
                let mut expected = vec![0u8; buf.len()];
                placeholder_pattern(units, u64::from(skip), &mut expected);
                if buf == expected.as_slice() {
                    VerifyResult::Pass
                } else {
                    VerifyResult::FailBadData
                }
            }
            PartSource::Patch { .. } | PartSource::Unavailable => VerifyResult::FailUnverifiable,
        }
    }

    /// Verify the part against a seekable stream of the target file.
    pub fn verify_stream<R: Read + Seek>(&self, stream: &mut R) -> Result<VerifyResult> {
        stream.seek(SeekFrom::Start(self.target_offset))?;

        if self.crc32.is_none() && matches!(self.source, PartSource::Patch { .. } | PartSource::Unavailable) {
            return Ok(VerifyResult::FailUnverifiable);
        }

        let mut hasher = self.crc32.map(|_| crc32fast::Hasher::new());
        let mut chunk = [0u8; 64 * 1024];
        let mut pattern = Vec::new();
        let mut done: u64 = 0;
        let total = u64::from(self.target_size);

        while done < total {
            let want = ((total - done).min(chunk.len() as u64)) as usize;
            let buf = &mut chunk[..want];
            if read_fully(stream, buf)? < want {
                return Ok(VerifyResult::FailNotEnoughData);
            }

            if let Some(hasher) = hasher.as_mut() {
                hasher.update(buf);
            } else {
                match self.source {
                    PartSource::Zeros => {
                        if !buf.iter().all(|&b| b == 0) {
                            return Ok(VerifyResult::FailBadData);
                        }
                    }
                    PartSource::EmptyBlock { units, skip } => {
                        pattern.resize(want, 0);
                        placeholder_pattern(units, u64::from(skip) + done, &mut pattern);
                        if buf != pattern.as_slice() {
                            return Ok(VerifyResult::FailBadData);
                        }
                    }
                    PartSource::Patch { .. } | PartSource::Unavailable => unreachable!(),
                }
            }

            done += want as u64;
        }

        if let Some(hasher) = hasher {
            if hasher.finalize() != self.crc32.unwrap_or_default() {
                return Ok(VerifyResult::FailBadData);
            }
        }

        Ok(VerifyResult::Pass)
    }

    /// Synthesize bytes for a sourceless part into `out`, starting
    /// `relative_offset` bytes into the part's range.
    pub fn reconstruct_without_source(&self, out: &mut [u8], relative_offset: u64) -> Result<()> {
        match self.source {
            PartSource::Zeros => {
                out.fill(0);
                Ok(())
            }
            PartSource::EmptyBlock { units, skip } => {
                placeholder_pattern(units, u64::from(skip) + relative_offset, out);
                Ok(())
            }
            PartSource::Unavailable => Err(Error::UnavailablePart {
                target_offset: self.target_offset,
            }),
            PartSource::Patch { .. } => Err(Error::SourceDataRequired {
                target_offset: self.target_offset,
            }),
        }
    }

    /// Reconstruct target bytes from an already-fetched source segment that
    /// begins at this part's source offset.
    ///
    /// Deflated blocks are inflated and the result is re-verified against the
    /// part's own checksum before slicing, guarding against corrupt source
    /// data making it to disk.
    pub fn reconstruct_from_segment(&self, segment: &[u8], out: &mut [u8], relative_offset: u64, verify: bool) -> Result<()> {
        let PartSource::Patch {
            deflated, split_from, ..
        } = self.source
        else {
            return self.reconstruct_without_source(out, relative_offset);
        };

        let split_from = usize::from(split_from);
        let size = self.target_size as usize;

        let decoded_storage;
        let decoded: &[u8] = if deflated {
            let mut inflated = Vec::with_capacity(DEFLATED_BLOCK_CAP);
            let mut decoder = DeflateDecoder::new(segment).take(DEFLATED_BLOCK_CAP as u64);
            decoder
                .read_to_end(&mut inflated)
                .map_err(|_| Error::SourceDataCorrupt {
                    target_offset: self.target_offset,
                })?;
            decoded_storage = inflated;
            &decoded_storage
        } else {
            segment
        };

        if decoded.len() < split_from + size {
            return Err(Error::ShortSourceData {
                expected: (split_from + size) as u64,
                got: decoded.len() as u64,
            });
        }

        let slice = &decoded[split_from..split_from + size];
        if verify {
            match self.verify_slice(slice) {
                VerifyResult::Pass => {}
                VerifyResult::FailUnverifiable => {
                    return Err(Error::Unverifiable {
                        target_offset: self.target_offset,
                    });
                }
                _ => {
                    return Err(Error::SourceDataCorrupt {
                        target_offset: self.target_offset,
                    });
                }
            }
        }

        let relative_offset = relative_offset as usize;
        out.copy_from_slice(&slice[relative_offset..relative_offset + out.len()]);
        Ok(())
    }

    /// Reconstruct target bytes by reading the part's source range from a
    /// seekable patch file stream.
    pub fn reconstruct_from_reader<R: Read + Seek>(&self, source: &mut R, out: &mut [u8], relative_offset: u64, verify: bool) -> Result<()> {
        let Some(offset) = self.source_offset() else {
            return self.reconstruct_without_source(out, relative_offset);
        };

        source.seek(SeekFrom::Start(offset))?;
        let mut segment = vec![0u8; self.max_source_size() as usize];
        let got = read_fully(source, &mut segment)?;
        segment.truncate(got);
        self.reconstruct_from_segment(&segment, out, relative_offset, verify)
    }

    /// Compute and store the CRC32 of this part's target bytes by
    /// reconstructing them from the given source stream.
    ///
    /// No-op for parts that already carry a checksum or do not come from a
    /// patch file (the placeholder unit count shares the checksum field on
    /// disk and must not be clobbered).
    pub fn calculate_crc32<R: Read + Seek>(&mut self, source: &mut R) -> Result<()> {
        if self.crc32.is_some() || !self.is_from_patch() {
            return Ok(());
        }

        let mut buf = vec![0u8; self.target_size as usize];
        self.reconstruct_from_reader(source, &mut buf, 0, false)?;
        self.crc32 = Some(crc32fast::hash(&buf));
        Ok(())
    }

    /// Serialize the fixed 24-byte part record.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let (source_offset, split, source_byte, deflated) = match self.source {
            PartSource::Patch {
                index,
                offset,
                deflated,
                split_from,
            } => (offset, split_from, index, deflated),
            PartSource::Zeros => (0, 0, SOURCE_INDEX_ZEROS, false),
            PartSource::EmptyBlock { skip, .. } => (0, skip, SOURCE_INDEX_EMPTY_BLOCK, false),
            PartSource::Unavailable => (0, 0, SOURCE_INDEX_UNAVAILABLE, false),
        };

        let crc_or_units = match self.source {
            PartSource::EmptyBlock { units, .. } => units,
            _ => self.crc32.unwrap_or(0),
        };

        let mut size_and_flags = self.target_size & TARGET_SIZE_MASK;
        if deflated {
            size_and_flags |= FLAG_DEFLATED;
        }
        if self.crc32.is_some() {
            size_and_flags |= FLAG_VALID_CRC32;
        }

        writer.write_i64::<LittleEndian>(self.target_offset as i64)?;
        writer.write_u32::<LittleEndian>(source_offset)?;
        writer.write_u32::<LittleEndian>(size_and_flags)?;
        writer.write_u32::<LittleEndian>(crc_or_units)?;
        writer.write_u16::<LittleEndian>(split)?;
        writer.write_u8(self.target_index)?;
        writer.write_u8(source_byte)?;
        Ok(())
    }

    /// Deserialize a part record written by [`PartLocator::write_to`].
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let target_offset = reader.read_i64::<LittleEndian>()?;
        let source_offset = reader.read_u32::<LittleEndian>()?;
        let size_and_flags = reader.read_u32::<LittleEndian>()?;
        let crc_or_units = reader.read_u32::<LittleEndian>()?;
        let split = reader.read_u16::<LittleEndian>()?;
        let target_index = reader.read_u8()?;
        let source_byte = reader.read_u8()?;

        if target_offset < 0 {
            return Err(Error::InvalidIndexFormat(format!(
                "negative target offset {target_offset}"
            )));
        }

        let deflated = size_and_flags & FLAG_DEFLATED != 0;
        let has_crc = size_and_flags & FLAG_VALID_CRC32 != 0;
        let target_size = size_and_flags & TARGET_SIZE_MASK;

        let source = match source_byte {
            SOURCE_INDEX_ZEROS => PartSource::Zeros,
            SOURCE_INDEX_EMPTY_BLOCK => {
                if has_crc {
                    return Err(Error::InvalidIndexFormat(
                        "placeholder part with checksum flag set".into(),
                    ));
                }
                PartSource::EmptyBlock {
                    units: crc_or_units,
                    skip: split,
                }
            }
            SOURCE_INDEX_UNAVAILABLE => PartSource::Unavailable,
            index => PartSource::Patch {
                index,
                offset: source_offset,
                deflated,
                split_from: if deflated { split } else { 0 },
            },
        };

        if deflated && !matches!(source, PartSource::Patch { .. }) {
            return Err(Error::InvalidIndexFormat(
                "deflated flag set on a sourceless part".into(),
            ));
        }

        let mut part = Self::new(target_offset as u64, target_size, target_index, source)?;
        if has_crc {
            part = part.with_crc32(crc_or_units);
        }
        Ok(part)
    }
}

/// Fill `out` with the synthetic placeholder pattern, starting `skip` bytes
/// into it: a 24-byte little-endian header of six words
/// `[128, 0, 0, units, 0, 0]`, zero fill after.
fn placeholder_pattern(units: u32, skip: u64, out: &mut [u8]) {
    out.fill(0);

    if skip >= PLACEHOLDER_HEADER_LEN as u64 {
        return;
    }

    let mut header = [0u8; PLACEHOLDER_HEADER_LEN];
    header[0..4].copy_from_slice(&(PLACEHOLDER_UNIT as u32).to_le_bytes());
    header[12..16].copy_from_slice(&units.to_le_bytes());

    let skip = skip as usize;
    let n = (PLACEHOLDER_HEADER_LEN - skip).min(out.len());
    out[..n].copy_from_slice(&header[skip..skip + n]);
}

/// Read until `buf` is full or the stream ends; returns bytes read.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = reader.read(&mut buf[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}
