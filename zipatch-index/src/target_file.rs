//! One target file as an ordered run of part locators
//!
//! The parts of a [`TargetFile`] tile the file: sorted by target offset,
//! contiguous and non-overlapping from offset zero to the file size. All
//! mutation goes through [`TargetFile::split_at`] and [`TargetFile::update`],
//! which preserve that tiling.

use std::io::{Read, Seek, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tokio_util::sync::CancellationToken;

use crate::part::{PartLocator, PartSource};
use crate::{Error, Result};

/// A single target file: its install-relative path and the ordered parts
/// that produce its bytes.
#[derive(Debug, Clone, Default)]
pub struct TargetFile {
    relative_path: String,
    parts: Vec<PartLocator>,
}

impl TargetFile {
    /// Create an empty target file with the given install-relative path.
    pub fn new(relative_path: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            parts: Vec::new(),
        }
    }

    /// Install-relative path, forward slashes
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// The ordered parts tiling this file
    pub fn parts(&self) -> &[PartLocator] {
        &self.parts
    }

    /// Total size of the reconstructed file
    pub fn file_size(&self) -> u64 {
        self.parts.last().map_or(0, PartLocator::target_end)
    }

    /// Drop all parts, making the file empty.
    pub fn clear(&mut self) {
        self.parts.clear();
    }

    /// Index of the part whose range contains `offset`, if any.
    pub fn part_covering(&self, offset: u64) -> Option<usize> {
        match self.parts.binary_search_by_key(&offset, PartLocator::target_offset) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => (offset < self.parts[i - 1].target_end()).then_some(i - 1),
        }
    }

    pub(crate) fn set_target_index(&mut self, target_index: u8) {
        for part in &mut self.parts {
            part.set_target_index(target_index);
        }
    }

    /// Ensure a part boundary exists at `offset`.
    ///
    /// If `offset` falls inside an existing part, that part is split in two;
    /// both halves lose any cached checksum since it covered the whole range.
    /// If `offset` lies past the end of the file, the gap is backfilled with
    /// a zero-fill part.
    pub fn split_at(&mut self, offset: u64, target_index: u8) -> Result<()> {
        let i = match self.parts.binary_search_by_key(&offset, PartLocator::target_offset) {
            Ok(_) => return Ok(()),
            Err(i) => i,
        };

        // At or past EOF there is no part to split; backfill any gap with
        // zeros up to the requested boundary. An offset inside the last part
        // also searches to Err(parts.len()) and must fall through to the split.
        let end = self.file_size();
        if offset >= end {
            let mut gap_offset = end;
            while gap_offset < offset {
                let size = (offset - gap_offset).min(u64::from(crate::part::MAX_TARGET_SIZE)) as u32;
                self.parts
                    .push(PartLocator::new(gap_offset, size, target_index, PartSource::Zeros)?);
                gap_offset += u64::from(size);
            }
            return Ok(());
        }

        debug_assert!(i > 0, "offset {offset} below file end {end} with no preceding part");

        let old = self.parts[i - 1];
        let delta = offset - old.target_offset();
        let left_size = delta as u32;
        let right_size = old.target_size() - left_size;

        let right_source = match old.source() {
            PartSource::Zeros => PartSource::Zeros,
            PartSource::Unavailable => PartSource::Unavailable,
            PartSource::EmptyBlock { units, skip } => PartSource::EmptyBlock {
                units,
                skip: checked_u16("empty_block_skip", u64::from(skip) + delta)?,
            },
            PartSource::Patch {
                index,
                offset: source_offset,
                deflated: true,
                split_from,
            } => PartSource::Patch {
                index,
                offset: source_offset,
                deflated: true,
                split_from: checked_u16("split_from", u64::from(split_from) + delta)?,
            },
            PartSource::Patch {
                index,
                offset: source_offset,
                deflated: false,
                split_from: _,
            } => PartSource::Patch {
                index,
                offset: source_offset
                    .checked_add(left_size)
                    .ok_or(Error::FieldOverflow {
                        field: "source_offset",
                        value: u64::from(source_offset) + delta,
                    })?,
                deflated: false,
                split_from: 0,
            },
        };

        let left = PartLocator::new(old.target_offset(), left_size, old.target_index(), old.source())?;
        let right = PartLocator::new(offset, right_size, old.target_index(), right_source)?;
        self.parts[i - 1] = left;
        self.parts.insert(i, right);
        Ok(())
    }

    /// Replace the parts covering `part`'s range with `part` itself.
    ///
    /// Boundaries are first materialized at both ends, then every part whose
    /// range falls inside the new one is dropped.
    pub fn update(&mut self, part: PartLocator) -> Result<()> {
        self.split_at(part.target_offset(), part.target_index())?;
        self.split_at(part.target_end(), part.target_index())?;

        let left = self
            .parts
            .binary_search_by_key(&part.target_offset(), PartLocator::target_offset)
            .unwrap_or_else(|i| i);
        if left == self.parts.len() {
            self.parts.push(part);
            return Ok(());
        }

        let right = self
            .parts
            .binary_search_by_key(&part.target_end(), PartLocator::target_offset)
            .unwrap_or_else(|i| i);
        self.parts[left] = part;
        if right > left + 1 {
            self.parts.drain(left + 1..right);
        }
        Ok(())
    }

    /// Compute checksums for every patch-sourced part that lacks one, reading
    /// from the given source patch files (indexed by source index).
    pub fn calculate_crc32<R: Read + Seek>(&mut self, sources: &mut [R], cancel: &CancellationToken) -> Result<()> {
        for part in &mut self.parts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(index) = part.source_index() {
                let attached = sources.len();
                let source = sources.get_mut(usize::from(index)).ok_or_else(|| {
                    Error::InvalidIndexFormat(format!(
                        "part references source {index} but only {attached} sources are attached"
                    ))
                })?;
                part.calculate_crc32(source)?;
            }
        }
        Ok(())
    }

    /// Serialize: path length and bytes, part count, then the fixed records.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let path = self.relative_path.as_bytes();
        writer.write_u32::<LittleEndian>(checked_u32("path_len", path.len() as u64)?)?;
        writer.write_all(path)?;
        writer.write_u32::<LittleEndian>(checked_u32("part_count", self.parts.len() as u64)?)?;
        for part in &self.parts {
            part.write_to(writer)?;
        }
        Ok(())
    }

    /// Deserialize a target file written by [`TargetFile::write_to`].
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let path_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut path = vec![0u8; path_len];
        reader.read_exact(&mut path)?;
        let relative_path = String::from_utf8(path)
            .map_err(|_| Error::InvalidIndexFormat("target path is not valid UTF-8".into()))?;

        let part_count = reader.read_u32::<LittleEndian>()? as usize;
        let mut parts = Vec::with_capacity(part_count);
        let mut expected_offset = 0u64;
        for _ in 0..part_count {
            let part = PartLocator::read_from(reader)?;
            if part.target_offset() != expected_offset {
                return Err(Error::InvalidIndexFormat(format!(
                    "parts of {relative_path} are not contiguous at offset {expected_offset}"
                )));
            }
            expected_offset = part.target_end();
            parts.push(part);
        }

        Ok(Self { relative_path, parts })
    }
}

fn checked_u16(field: &'static str, value: u64) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::FieldOverflow { field, value })
}

fn checked_u32(field: &'static str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::FieldOverflow { field, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn patch_part(target_offset: u64, size: u32, source_offset: u32) -> PartLocator {
        PartLocator::new(
            target_offset,
            size,
            0,
            PartSource::Patch {
                index: 0,
                offset: source_offset,
                deflated: false,
                split_from: 0,
            },
        )
        .unwrap()
    }

    fn assert_tiled(file: &TargetFile) {
        let mut expected = 0u64;
        for part in file.parts() {
            assert_eq!(part.target_offset(), expected);
            expected = part.target_end();
        }
    }

    #[test]
    fn test_split_backfills_gap_with_zeros() {
        let mut file = TargetFile::new("a/b.dat");
        file.update(patch_part(0, 100, 0)).unwrap();
        file.split_at(300, 0).unwrap();

        assert_eq!(file.parts().len(), 2);
        assert_eq!(file.parts()[1].source(), PartSource::Zeros);
        assert_eq!(file.parts()[1].target_offset(), 100);
        assert_eq!(file.parts()[1].target_size(), 200);
        assert_tiled(&file);
        assert_eq!(file.file_size(), 300);
    }

    #[test]
    fn test_split_inside_plain_patch_part() {
        let mut file = TargetFile::new("a");
        file.update(patch_part(0, 100, 5000)).unwrap();
        file.split_at(40, 0).unwrap();

        assert_eq!(file.parts().len(), 2);
        assert_eq!(file.parts()[0].target_size(), 40);
        assert_eq!(file.parts()[1].target_size(), 60);
        assert_eq!(file.parts()[1].source_offset(), Some(5040));
        assert_tiled(&file);
    }

    #[test]
    fn test_split_drops_checksums() {
        let mut file = TargetFile::new("a");
        file.update(patch_part(0, 100, 0).with_crc32(0x1234)).unwrap();
        file.split_at(50, 0).unwrap();
        assert!(file.parts().iter().all(|p| p.crc32().is_none()));
    }

    #[test]
    fn test_split_inside_deflated_part_moves_split_from() {
        let part = PartLocator::new(
            0,
            1000,
            0,
            PartSource::Patch {
                index: 1,
                offset: 64,
                deflated: true,
                split_from: 16,
            },
        )
        .unwrap();
        let mut file = TargetFile::new("a");
        file.update(part).unwrap();
        file.split_at(300, 0).unwrap();

        let right = file.parts()[1];
        assert_eq!(right.source_offset(), Some(64));
        match right.source() {
            PartSource::Patch { split_from, deflated, .. } => {
                assert!(deflated);
                assert_eq!(split_from, 316);
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_split_inside_placeholder_moves_skip() {
        let part = PartLocator::new(0, 128, 0, PartSource::EmptyBlock { units: 2, skip: 0 }).unwrap();
        let mut file = TargetFile::new("a");
        file.update(part).unwrap();
        file.split_at(24, 0).unwrap();

        assert_eq!(
            file.parts()[1].source(),
            PartSource::EmptyBlock { units: 2, skip: 24 }
        );
        assert_tiled(&file);
    }

    #[test]
    fn test_update_replaces_covered_parts() {
        let mut file = TargetFile::new("a");
        file.update(patch_part(0, 100, 0)).unwrap();
        file.update(patch_part(100, 100, 100)).unwrap();
        file.update(patch_part(200, 100, 200)).unwrap();

        // Overwrite the middle of the file, straddling part boundaries
        file.update(patch_part(50, 200, 9000)).unwrap();

        assert_eq!(file.parts().len(), 3);
        assert_eq!(file.parts()[1].target_offset(), 50);
        assert_eq!(file.parts()[1].target_size(), 200);
        assert_eq!(file.parts()[1].source_offset(), Some(9000));
        assert_eq!(file.parts()[2].source_offset(), Some(250));
        assert_tiled(&file);
        assert_eq!(file.file_size(), 300);
    }

    #[test]
    fn test_update_subrange_of_last_part() {
        let mut file = TargetFile::new("a");
        file.update(patch_part(0, 100, 0)).unwrap();

        // Both boundaries fall inside the final part
        file.update(patch_part(40, 20, 7000)).unwrap();

        assert_eq!(file.parts().len(), 3);
        assert_eq!(file.parts()[0].target_size(), 40);
        assert_eq!(file.parts()[1].source_offset(), Some(7000));
        assert_eq!(file.parts()[2].target_offset(), 60);
        assert_eq!(file.parts()[2].source_offset(), Some(60));
        assert_tiled(&file);
        assert_eq!(file.file_size(), 100);
    }

    #[test]
    fn test_update_past_eof_appends_zero_gap() {
        let mut file = TargetFile::new("a");
        file.update(patch_part(0, 100, 0)).unwrap();
        file.update(patch_part(500, 50, 0)).unwrap();

        assert_eq!(file.parts().len(), 3);
        assert_eq!(file.parts()[1].source(), PartSource::Zeros);
        assert_eq!(file.parts()[1].target_size(), 400);
        assert_tiled(&file);
        assert_eq!(file.file_size(), 550);
    }

    #[test]
    fn test_part_covering() {
        let mut file = TargetFile::new("a");
        file.update(patch_part(0, 100, 0)).unwrap();
        file.update(patch_part(100, 100, 0)).unwrap();

        assert_eq!(file.part_covering(0), Some(0));
        assert_eq!(file.part_covering(99), Some(0));
        assert_eq!(file.part_covering(100), Some(1));
        assert_eq!(file.part_covering(199), Some(1));
        assert_eq!(file.part_covering(200), None);
    }

    #[test]
    fn test_round_trip() {
        let mut file = TargetFile::new("sqpack/ffxiv/0a0000.win32.dat0");
        file.update(patch_part(0, 100, 0).with_crc32(7)).unwrap();
        file.update(
            PartLocator::new(100, 128, 0, PartSource::EmptyBlock { units: 1, skip: 0 }).unwrap(),
        )
        .unwrap();

        let mut buf = Vec::new();
        file.write_to(&mut buf).unwrap();
        let back = TargetFile::read_from(&mut Cursor::new(&buf)).unwrap();

        assert_eq!(back.relative_path(), file.relative_path());
        assert_eq!(back.parts(), file.parts());
    }

    #[test]
    fn test_read_rejects_non_contiguous() {
        let mut file = TargetFile::new("a");
        file.update(patch_part(0, 100, 0)).unwrap();
        let mut buf = Vec::new();
        file.write_to(&mut buf).unwrap();

        // Corrupt the first record's target offset
        let path_len = 4 + file.relative_path().len() + 4;
        buf[path_len] = 1;
        assert!(TargetFile::read_from(&mut Cursor::new(&buf)).is_err());
    }
}
