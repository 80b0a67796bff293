//! Incremental `multipart/byteranges` demultiplexer
//!
//! Feeds arbitrarily-sized pieces of a 206 response body through a small
//! state machine and emits one [`RangeChunk`] per completed part, so a large
//! multi-range response never needs to be buffered whole alongside its
//! decoded chunks.

use crate::{Error, Result};

/// One contiguous run of source bytes returned by a range request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeChunk {
    /// Offset of the first byte within the source
    pub offset: u64,
    /// The bytes themselves
    pub data: Vec<u8>,
}

enum State {
    /// Searching for the next dash-boundary delimiter
    Delimiter,
    /// Collecting part headers up to the blank line
    Headers,
    /// Collecting part body bytes
    Body { offset: u64, remaining: usize, data: Vec<u8> },
    /// Final delimiter seen; trailing bytes are ignored
    Epilogue,
}

/// Pull parser for a `multipart/byteranges` body
pub struct MultipartParser {
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
    state: State,
}

impl MultipartParser {
    /// Create a parser for the boundary announced in the Content-Type header.
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            delimiter,
            buffer: Vec::new(),
            state: State::Delimiter,
        }
    }

    /// Feed the next piece of the body; returns any parts completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<RangeChunk>> {
        self.buffer.extend_from_slice(bytes);
        let mut chunks = Vec::new();

        loop {
            match &mut self.state {
                State::Delimiter => {
                    let Some(at) = find(&self.buffer, &self.delimiter) else {
                        // Keep a tail in case the delimiter straddles feeds
                        let keep = self.delimiter.len().min(self.buffer.len());
                        self.buffer.drain(..self.buffer.len() - keep);
                        return Ok(chunks);
                    };
                    let after = at + self.delimiter.len();
                    if self.buffer.len() < after + 2 {
                        return Ok(chunks);
                    }
                    if &self.buffer[after..after + 2] == b"--" {
                        self.buffer.clear();
                        self.state = State::Epilogue;
                        return Ok(chunks);
                    }
                    if &self.buffer[after..after + 2] != b"\r\n" {
                        return Err(Error::transfer_failure("malformed multipart delimiter"));
                    }
                    self.buffer.drain(..after + 2);
                    self.state = State::Headers;
                }
                State::Headers => {
                    let Some(at) = find(&self.buffer, b"\r\n\r\n") else {
                        return Ok(chunks);
                    };
                    let headers = self.buffer[..at].to_vec();
                    self.buffer.drain(..at + 4);
                    let (offset, length) = parse_part_headers(&headers)?;
                    self.state = State::Body {
                        offset,
                        remaining: length,
                        data: Vec::with_capacity(length),
                    };
                }
                State::Body { offset, remaining, data } => {
                    let take = (*remaining).min(self.buffer.len());
                    data.extend_from_slice(&self.buffer[..take]);
                    self.buffer.drain(..take);
                    *remaining -= take;
                    if *remaining > 0 {
                        return Ok(chunks);
                    }
                    chunks.push(RangeChunk {
                        offset: *offset,
                        data: std::mem::take(data),
                    });
                    self.state = State::Delimiter;
                }
                State::Epilogue => return Ok(chunks),
            }
        }
    }

    /// Check that the body ended cleanly at the closing delimiter.
    pub fn finish(self) -> Result<()> {
        match self.state {
            State::Epilogue => Ok(()),
            _ => Err(Error::transfer_failure(
                "multipart body ended before the closing delimiter",
            )),
        }
    }
}

/// Parse a `Content-Range: bytes first-last/total` header value into
/// `(offset, length)`.
pub fn parse_content_range(value: &str) -> Result<(u64, usize)> {
    let rest = value
        .trim()
        .strip_prefix("bytes ")
        .ok_or_else(|| Error::transfer_failure(format!("unsupported Content-Range: {value}")))?;
    let range = rest
        .split('/')
        .next()
        .ok_or_else(|| Error::transfer_failure(format!("malformed Content-Range: {value}")))?;
    let (first, last) = range
        .split_once('-')
        .ok_or_else(|| Error::transfer_failure(format!("malformed Content-Range: {value}")))?;
    let first: u64 = first
        .parse()
        .map_err(|_| Error::transfer_failure(format!("malformed Content-Range: {value}")))?;
    let last: u64 = last
        .parse()
        .map_err(|_| Error::transfer_failure(format!("malformed Content-Range: {value}")))?;
    if last < first {
        return Err(Error::transfer_failure(format!(
            "inverted Content-Range: {value}"
        )));
    }
    Ok((first, (last - first + 1) as usize))
}

/// Extract the boundary parameter from a `multipart/byteranges` Content-Type.
pub fn boundary_from_content_type(value: &str) -> Option<&str> {
    value.split(';').find_map(|param| {
        let (key, val) = param.trim().split_once('=')?;
        key.eq_ignore_ascii_case("boundary")
            .then(|| val.trim_matches('"'))
    })
}

fn parse_part_headers(headers: &[u8]) -> Result<(u64, usize)> {
    let text = std::str::from_utf8(headers)
        .map_err(|_| Error::transfer_failure("part headers are not valid UTF-8"))?;
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-range") {
                return parse_content_range(value);
            }
        }
    }
    Err(Error::transfer_failure("part headers lack Content-Range"))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BOUNDARY: &str = "3d6b6a416f9b5";

    fn body(parts: &[(u64, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (offset, data) in parts {
            out.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            out.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
            out.extend_from_slice(
                format!(
                    "Content-Range: bytes {}-{}/10000\r\n\r\n",
                    offset,
                    offset + data.len() as u64 - 1
                )
                .as_bytes(),
            );
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        out
    }

    #[test]
    fn test_parses_whole_body_at_once() {
        let mut parser = MultipartParser::new(BOUNDARY);
        let chunks = parser.feed(&body(&[(100, b"hello"), (500, b"world!")])).unwrap();
        parser.finish().unwrap();

        assert_eq!(
            chunks,
            vec![
                RangeChunk { offset: 100, data: b"hello".to_vec() },
                RangeChunk { offset: 500, data: b"world!".to_vec() },
            ]
        );
    }

    #[test]
    fn test_parses_byte_at_a_time() {
        let raw = body(&[(0, b"abc"), (9000, &[0xFF; 300])]);
        let mut parser = MultipartParser::new(BOUNDARY);
        let mut chunks = Vec::new();
        for byte in &raw {
            chunks.extend(parser.feed(std::slice::from_ref(byte)).unwrap());
        }
        parser.finish().unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].data, b"abc");
        assert_eq!(chunks[1].offset, 9000);
        assert_eq!(chunks[1].data.len(), 300);
    }

    #[test]
    fn test_truncated_body_fails_finish() {
        let raw = body(&[(0, b"abcdef")]);
        let mut parser = MultipartParser::new(BOUNDARY);
        parser.feed(&raw[..raw.len() / 2]).unwrap();
        assert!(parser.finish().is_err());
    }

    #[test]
    fn test_missing_content_range_is_an_error() {
        let raw = format!("--{BOUNDARY}\r\nContent-Type: text/plain\r\n\r\nxx\r\n--{BOUNDARY}--\r\n");
        let mut parser = MultipartParser::new(BOUNDARY);
        assert!(parser.feed(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 5-14/100").unwrap(), (5, 10));
        assert!(parse_content_range("bytes 9-5/100").is_err());
        assert!(parse_content_range("items 0-1/2").is_err());
    }

    #[test]
    fn test_boundary_from_content_type() {
        assert_eq!(
            boundary_from_content_type("multipart/byteranges; boundary=3d6b6a416f9b5"),
            Some("3d6b6a416f9b5")
        );
        assert_eq!(
            boundary_from_content_type("multipart/byteranges; charset=x; boundary=\"ab\""),
            Some("ab")
        );
        assert_eq!(boundary_from_content_type("application/octet-stream"), None);
    }
}
