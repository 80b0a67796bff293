//! Patch index: per-installation byte provenance across a chain of patches
//!
//! A [`PatchIndex`] is built by replaying the parsed operations of each patch
//! file in chain order, then running a checksum pass over the concrete patch
//! files. The result describes every byte of every target file and can be
//! serialized into a compact deflate-compressed container.

use std::io::{Read, Seek, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::part::{PartLocator, PartSource, SOURCE_INDEX_MAX_VALID};
use crate::target_file::TargetFile;
use crate::{Error, Result};

/// Container magic, "ZIDX" little-endian
pub const INDEX_MAGIC: u32 = 0x5844_495A;
/// Current container format version
pub const INDEX_VERSION: u32 = 1;

/// Expansion id of the boot chain
pub const EXPANSION_BOOT: i32 = -1;
/// Expansion id of the base game chain
pub const EXPANSION_BASE_GAME: i32 = 0;

/// Size of the fixed-size file header rewritten by header operations
const FILE_HEADER_SIZE: u32 = 1024;
/// Size of one expandable data block
const DATA_BLOCK_SIZE: u64 = 128;

/// Which fixed-size header a [`PatchOperation::HeaderRewrite`] targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// Version header at file offset 0
    Version,
    /// Index segment header at the second kilobyte
    Index,
    /// Data segment header at the second kilobyte
    Data,
}

impl HeaderKind {
    fn target_offset(self) -> u64 {
        match self {
            Self::Version => 0,
            Self::Index | Self::Data => u64::from(FILE_HEADER_SIZE),
        }
    }
}

/// One contiguous run of file content within a patch file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlock {
    /// Offset of the block's payload within the patch file
    pub source_offset: u32,
    /// Size of the block's content once written to the target
    pub decompressed_size: u32,
    /// Stored size when the payload is deflate-compressed
    pub compressed_size: Option<u32>,
}

/// Parsed patch operations, replayed against the index in patch order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOperation {
    /// Remove every target under a directory
    DeleteDirectory {
        /// Directory path, install-relative
        path: String,
    },
    /// Remove an expansion's sqpack and movie trees
    RemoveExpansion {
        /// Expansion number; 0 is the base game
        expansion_id: u16,
    },
    /// Remove a single target file
    DeleteFile {
        /// File path, install-relative
        path: String,
    },
    /// Write a run of content blocks into a target file
    AddFileBlocks {
        /// File path, install-relative
        path: String,
        /// Target offset of the first block; offset zero replaces the file
        file_offset: u64,
        /// Blocks in target order
        blocks: Vec<DataBlock>,
    },
    /// Grow a block range into placeholder padding
    ExpandData {
        /// File path, install-relative
        path: String,
        /// Target offset of the first affected block
        block_offset: u64,
        /// Number of 128-byte blocks
        block_count: u32,
    },
    /// Turn a block range into placeholder padding
    DeleteData {
        /// File path, install-relative
        path: String,
        /// Target offset of the first affected block
        block_offset: u64,
        /// Number of 128-byte blocks
        block_count: u32,
    },
    /// Overwrite a fixed-size file header from patch data
    HeaderRewrite {
        /// File path, install-relative
        path: String,
        /// Which header, deciding the fixed target offset
        kind: HeaderKind,
        /// Offset of the header bytes within the patch file
        source_offset: u32,
    },
}

/// Byte-provenance index over a chain of patch files
#[derive(Debug, Clone)]
pub struct PatchIndex {
    expansion: i32,
    sources: Vec<String>,
    source_high_water: Vec<u64>,
    targets: Vec<TargetFile>,
}

impl PatchIndex {
    /// Create an empty index for one expansion's patch chain.
    pub fn new(expansion: i32) -> Self {
        Self {
            expansion,
            sources: Vec::new(),
            source_high_water: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// Expansion this chain belongs to
    pub fn expansion(&self) -> i32 {
        self.expansion
    }

    /// Patch file names, in chain order
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Target files, in index order
    pub fn targets(&self) -> &[TargetFile] {
        &self.targets
    }

    /// One past the furthest byte ever referenced in source `index`
    pub fn source_high_water(&self, index: usize) -> Option<u64> {
        self.source_high_water.get(index).copied()
    }

    /// Index of the target with the given install-relative path
    pub fn target_index_by_path(&self, path: &str) -> Option<usize> {
        let wanted = normalize_path(path);
        self.targets
            .iter()
            .position(|t| t.relative_path().eq_ignore_ascii_case(&wanted))
    }

    /// Replay one patch file's parsed operations against the index.
    ///
    /// `patch_name` is appended to the source list; every part recorded during
    /// the replay references it by index.
    pub fn apply_operations(&mut self, patch_name: &str, operations: &[PatchOperation], cancel: &CancellationToken) -> Result<()> {
        if self.sources.len() > usize::from(SOURCE_INDEX_MAX_VALID) {
            return Err(Error::FieldOverflow {
                field: "source_index",
                value: self.sources.len() as u64,
            });
        }
        let source_index = self.sources.len() as u8;
        self.sources.push(patch_name.to_string());
        self.source_high_water.push(0);

        debug!(
            patch = patch_name,
            operations = operations.len(),
            "replaying patch operations"
        );

        for op in operations {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.apply_one(source_index, op)?;
        }
        Ok(())
    }

    fn apply_one(&mut self, source_index: u8, op: &PatchOperation) -> Result<()> {
        match op {
            PatchOperation::DeleteDirectory { path } => {
                let mut prefix = normalize_path(path);
                if !prefix.ends_with('/') {
                    prefix.push('/');
                }
                self.remove_targets(|p| starts_with_ignore_case(p, &prefix))
            }
            PatchOperation::RemoveExpansion { expansion_id } => {
                let folder = if *expansion_id == 0 {
                    "ffxiv".to_string()
                } else {
                    format!("ex{expansion_id}")
                };
                let sqpack = format!("sqpack/{folder}/");
                let movie = format!("movie/{folder}/");
                self.remove_targets(|p| starts_with_ignore_case(p, &sqpack) || starts_with_ignore_case(p, &movie))
            }
            PatchOperation::DeleteFile { path } => {
                let wanted = normalize_path(path);
                self.remove_targets(|p| p.eq_ignore_ascii_case(&wanted))
            }
            PatchOperation::AddFileBlocks {
                path,
                file_offset,
                blocks,
            } => {
                let ti = self.get_or_create_target(path)?;
                if *file_offset == 0 {
                    self.targets[ti].clear();
                }
                let mut offset = *file_offset;
                for block in blocks {
                    let part = PartLocator::new(
                        offset,
                        block.decompressed_size,
                        ti as u8,
                        PartSource::Patch {
                            index: source_index,
                            offset: block.source_offset,
                            deflated: block.compressed_size.is_some(),
                            split_from: 0,
                        },
                    )?;
                    self.targets[ti].update(part)?;
                    let consumed = block.compressed_size.unwrap_or(block.decompressed_size);
                    self.raise_high_water(source_index, u64::from(block.source_offset) + u64::from(consumed));
                    offset += u64::from(block.decompressed_size);
                }
                Ok(())
            }
            PatchOperation::ExpandData {
                path,
                block_offset,
                block_count,
            }
            | PatchOperation::DeleteData {
                path,
                block_offset,
                block_count,
            } => {
                if *block_count == 0 {
                    return Ok(());
                }
                let ti = self.get_or_create_target(path)?;
                let placeholder = PartLocator::new(
                    *block_offset,
                    DATA_BLOCK_SIZE as u32,
                    ti as u8,
                    PartSource::EmptyBlock {
                        units: block_count - 1,
                        skip: 0,
                    },
                )?;
                self.targets[ti].update(placeholder)?;
                if *block_count > 1 {
                    let zeros = PartLocator::new(
                        block_offset + DATA_BLOCK_SIZE,
                        (u64::from(block_count - 1) * DATA_BLOCK_SIZE) as u32,
                        ti as u8,
                        PartSource::Zeros,
                    )?;
                    self.targets[ti].update(zeros)?;
                }
                Ok(())
            }
            PatchOperation::HeaderRewrite {
                path,
                kind,
                source_offset,
            } => {
                let ti = self.get_or_create_target(path)?;
                let part = PartLocator::new(
                    kind.target_offset(),
                    FILE_HEADER_SIZE,
                    ti as u8,
                    PartSource::Patch {
                        index: source_index,
                        offset: *source_offset,
                        deflated: false,
                        split_from: 0,
                    },
                )?;
                self.targets[ti].update(part)?;
                self.raise_high_water(source_index, u64::from(*source_offset) + u64::from(FILE_HEADER_SIZE));
                Ok(())
            }
        }
    }

    fn raise_high_water(&mut self, source_index: u8, end: u64) {
        let slot = &mut self.source_high_water[usize::from(source_index)];
        if end > *slot {
            *slot = end;
        }
    }

    fn remove_targets(&mut self, mut predicate: impl FnMut(&str) -> bool) -> Result<()> {
        let before = self.targets.len();
        self.targets.retain(|t| !predicate(t.relative_path()));
        if self.targets.len() != before {
            self.reassign_target_indices()?;
        }
        Ok(())
    }

    fn get_or_create_target(&mut self, path: &str) -> Result<usize> {
        if let Some(i) = self.target_index_by_path(path) {
            return Ok(i);
        }
        if self.targets.len() > usize::from(u8::MAX) {
            return Err(Error::FieldOverflow {
                field: "target_index",
                value: self.targets.len() as u64,
            });
        }
        self.targets.push(TargetFile::new(normalize_path(path)));
        Ok(self.targets.len() - 1)
    }

    fn reassign_target_indices(&mut self) -> Result<()> {
        if self.targets.len() > usize::from(u8::MAX) + 1 {
            return Err(Error::FieldOverflow {
                field: "target_index",
                value: self.targets.len() as u64,
            });
        }
        for (i, target) in self.targets.iter_mut().enumerate() {
            target.set_target_index(i as u8);
        }
        Ok(())
    }

    /// Compute checksums for every patch-sourced part that lacks one.
    ///
    /// `sources` are the concrete patch file streams, in chain order. After
    /// this pass every part is verifiable without the patch files at hand.
    pub fn calculate_crc32<R: Read + Seek>(&mut self, sources: &mut [R], cancel: &CancellationToken) -> Result<()> {
        for target in &mut self.targets {
            target.calculate_crc32(sources, cancel)?;
        }
        Ok(())
    }

    /// Every part sourced from patch file `source_index`, sorted by source
    /// offset. Recomputed on each call.
    pub fn source_parts(&self, source_index: u8) -> Vec<PartLocator> {
        let mut parts: Vec<PartLocator> = self
            .targets
            .iter()
            .flat_map(|t| t.parts())
            .filter(|p| p.source_index() == Some(source_index))
            .copied()
            .collect();
        parts.sort_by_key(|p| p.source_offset());
        parts
    }

    /// Version string of the chain: the terminal patch name without its
    /// leading marker character and ".patch" suffix.
    pub fn version_name(&self) -> Option<&str> {
        let last = self.sources.last()?;
        let stem = last.strip_suffix(".patch")?;
        let mut chars = stem.chars();
        chars.next()?;
        Some(chars.as_str())
    }

    fn version_file_base(&self) -> String {
        match self.expansion {
            EXPANSION_BOOT => "ffxivboot".to_string(),
            EXPANSION_BASE_GAME => "ffxivgame".to_string(),
            n => format!("sqpack/ex{n}/ex{n}"),
        }
    }

    /// Install-relative path of the version marker file
    pub fn version_file_ver(&self) -> String {
        self.version_file_base() + ".ver"
    }

    /// Install-relative path of the version marker backup
    pub fn version_file_bck(&self) -> String {
        self.version_file_base() + ".bck"
    }

    /// Serialize the uncompressed container layout.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(INDEX_MAGIC)?;
        writer.write_u32::<LittleEndian>(INDEX_VERSION)?;
        writer.write_i32::<LittleEndian>(self.expansion)?;

        writer.write_u32::<LittleEndian>(checked_u32("source_count", self.sources.len() as u64)?)?;
        for name in &self.sources {
            let bytes = name.as_bytes();
            writer.write_u32::<LittleEndian>(checked_u32("source_name_len", bytes.len() as u64)?)?;
            writer.write_all(bytes)?;
        }
        for &high_water in &self.source_high_water {
            let value = i32::try_from(high_water).map_err(|_| Error::FieldOverflow {
                field: "source_high_water",
                value: high_water,
            })?;
            writer.write_i32::<LittleEndian>(value)?;
        }

        writer.write_u32::<LittleEndian>(checked_u32("target_count", self.targets.len() as u64)?)?;
        for target in &self.targets {
            target.write_to(writer)?;
        }
        Ok(())
    }

    /// Deserialize the uncompressed container layout.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != INDEX_MAGIC {
            return Err(Error::InvalidIndexFormat(format!(
                "bad magic {magic:#010x}, expected {INDEX_MAGIC:#010x}"
            )));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != INDEX_VERSION {
            return Err(Error::InvalidIndexFormat(format!(
                "unsupported container version {version}"
            )));
        }
        let expansion = reader.read_i32::<LittleEndian>()?;

        let source_count = reader.read_u32::<LittleEndian>()? as usize;
        let mut sources = Vec::with_capacity(source_count);
        for _ in 0..source_count {
            let len = reader.read_u32::<LittleEndian>()? as usize;
            let mut bytes = vec![0u8; len];
            reader.read_exact(&mut bytes)?;
            sources.push(
                String::from_utf8(bytes)
                    .map_err(|_| Error::InvalidIndexFormat("source name is not valid UTF-8".into()))?,
            );
        }
        let mut source_high_water = Vec::with_capacity(source_count);
        for _ in 0..source_count {
            let value = reader.read_i32::<LittleEndian>()?;
            if value < 0 {
                return Err(Error::InvalidIndexFormat(format!(
                    "negative source high-water mark {value}"
                )));
            }
            source_high_water.push(value as u64);
        }

        let target_count = reader.read_u32::<LittleEndian>()? as usize;
        if target_count > usize::from(u8::MAX) + 1 {
            return Err(Error::InvalidIndexFormat(format!(
                "target count {target_count} exceeds the index limit"
            )));
        }
        let mut targets = Vec::with_capacity(target_count);
        for i in 0..target_count {
            let target = TargetFile::read_from(reader)?;
            if target.parts().iter().any(|p| usize::from(p.target_index()) != i) {
                return Err(Error::InvalidIndexFormat(format!(
                    "target {i} contains parts with a mismatched target index"
                )));
            }
            for part in target.parts() {
                if let Some(si) = part.source_index() {
                    if usize::from(si) >= source_count {
                        return Err(Error::InvalidIndexFormat(format!(
                            "part references source {si} but only {source_count} sources exist"
                        )));
                    }
                }
            }
            targets.push(target);
        }

        Ok(Self {
            expansion,
            sources,
            source_high_water,
            targets,
        })
    }

    /// Write the deflate-compressed container.
    pub fn save<W: Write>(&self, writer: W) -> Result<()> {
        let mut encoder = DeflateEncoder::new(writer, Compression::default());
        self.write_to(&mut encoder)?;
        encoder.finish()?;
        Ok(())
    }

    /// Read a deflate-compressed container.
    pub fn load<R: Read>(reader: R) -> Result<Self> {
        let mut decoder = DeflateDecoder::new(reader);
        Self::read_from(&mut decoder)
    }
}

/// Normalize an install-relative path: forward slashes, no leading slash.
pub fn normalize_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized.trim_start_matches('/').to_string()
}

// Byte-wise so a prefix boundary inside a multibyte character cannot panic
fn starts_with_ignore_case(haystack: &str, prefix: &str) -> bool {
    haystack.len() >= prefix.len()
        && haystack.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn checked_u32(field: &'static str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::FieldOverflow { field, value })
}
