//! Byte ranges and gap coalescing

/// Gap below which adjacent ranges are fetched as one
pub const DEFAULT_MERGE_GAP: u64 = 4096;

/// A half-open byte range of a remote or local source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteRange {
    /// First byte of the range
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
}

impl ByteRange {
    /// Create a range from its first byte and length.
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// One past the last byte
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// The inclusive `first-last` fragment used in a Range header
    pub fn header_fragment(&self) -> String {
        format!("{}-{}", self.offset, self.end() - 1)
    }
}

/// Coalesce ranges separated by less than `max_gap` bytes.
///
/// Fetching a small gap along with its neighbors costs less than another
/// round trip or another part in a multipart response. Input order does not
/// matter; the result is sorted and non-overlapping.
pub fn merge_ranges(mut ranges: Vec<ByteRange>, max_gap: u64) -> Vec<ByteRange> {
    ranges.retain(|r| r.length > 0);
    ranges.sort_by_key(|r| r.offset);

    let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            // Overlapping and adjacent ranges always fold together, whatever
            // the gap allowance
            Some(last) if range.offset <= last.end() || range.offset - last.end() < max_gap => {
                let end = last.end().max(range.end());
                last.length = end - last.offset;
            }
            _ => merged.push(range),
        }
    }
    merged
}
