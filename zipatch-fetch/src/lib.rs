//! HTTP range downloader for patch repair
//!
//! This crate fetches the exact byte ranges of a remote patch file that a
//! repair pass still needs. It includes:
//!
//! - Multi-range GET requests with an optional session token header
//! - Demultiplexing of `200`, single-range `206` and `multipart/byteranges`
//!   responses
//! - Automatic retry with exponential backoff for transient failures
//! - Gap coalescing so nearby ranges are fetched in one request
//!
//! # Example
//!
//! ```no_run
//! use zipatch_fetch::{merge_ranges, ByteRange, RangeClient, DEFAULT_MERGE_GAP};
//!
//! # async fn example() -> zipatch_fetch::Result<()> {
//! let client = RangeClient::builder().session_token("sid").build()?;
//! let ranges = merge_ranges(
//!     vec![ByteRange::new(0, 1024), ByteRange::new(2048, 512)],
//!     DEFAULT_MERGE_GAP,
//! );
//! let chunks = client
//!     .fetch_ranges("https://patch.example.com/D2025.01.01.0000.0000.patch", &ranges)
//!     .await?;
//! for chunk in chunks {
//!     println!("{} bytes at offset {}", chunk.data.len(), chunk.offset);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod client;
mod error;
mod multipart;
mod range;

pub use client::{RangeClient, RangeClientBuilder, SESSION_TOKEN_HEADER};
pub use error::{Error, Result};
pub use multipart::{boundary_from_content_type, parse_content_range, MultipartParser, RangeChunk};
pub use range::{merge_ranges, ByteRange, DEFAULT_MERGE_GAP};
