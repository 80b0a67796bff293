//! HTTP range client with retry and backoff

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Client, ClientBuilder, Response, StatusCode};
use tracing::{debug, trace, warn};
use url::Url;

use crate::multipart::{boundary_from_content_type, parse_content_range, MultipartParser, RangeChunk};
use crate::range::ByteRange;
use crate::{Error, Result};

/// Session token header (`X-Patch-Unique-Id`) attached to every request when
/// authentication is on
pub const SESSION_TOKEN_HEADER: &str = "x-patch-unique-id";

const DEFAULT_USER_AGENT: &str = "FFXIV PATCH CLIENT";
const DEFAULT_MAX_ATTEMPTS: u32 = 8;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(32);

/// HTTP client for multi-range patch downloads
#[derive(Debug, Clone)]
pub struct RangeClient {
    client: Client,
    max_attempts: u32,
    session_token: Option<HeaderValue>,
}

/// Builder for [`RangeClient`]
#[derive(Debug, Default)]
pub struct RangeClientBuilder {
    max_attempts: Option<u32>,
    session_token: Option<String>,
    user_agent: Option<String>,
    connect_timeout: Option<Duration>,
}

impl RangeClientBuilder {
    /// Total attempts per fetch, including the first
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Session token sent with every request
    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Override the User-Agent string
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<RangeClient> {
        let mut builder = ClientBuilder::new()
            .user_agent(self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT));
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        let session_token = self
            .session_token
            .map(|token| {
                HeaderValue::from_str(&token)
                    .map_err(|_| Error::transfer_failure("session token is not a valid header value"))
            })
            .transpose()?;

        Ok(RangeClient {
            client: builder.build()?,
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            session_token,
        })
    }
}

impl RangeClient {
    /// Create a client with default configuration.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Create a builder for custom configuration.
    pub fn builder() -> RangeClientBuilder {
        RangeClientBuilder::default()
    }

    /// Fetch the given source byte ranges in one GET, retrying transient
    /// failures with exponential backoff.
    ///
    /// Returned chunks are whatever the server grouped them into; callers
    /// must be prepared for a single chunk covering everything (a `200`
    /// response) as well as one chunk per requested range.
    pub async fn fetch_ranges(&self, url: &str, ranges: &[ByteRange]) -> Result<Vec<RangeChunk>> {
        if ranges.is_empty() {
            return Ok(Vec::new());
        }
        let url = Url::parse(url)?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.fetch_ranges_once(&url, ranges).await {
                Ok(chunks) => return Ok(chunks),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let wait = calculate_backoff(attempt);
                    warn!(url = %url, attempt, ?wait, error = %e, "range fetch failed, retrying");
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
                Err(e) if attempt > 1 => {
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_ranges_once(&self, url: &Url, ranges: &[ByteRange]) -> Result<Vec<RangeChunk>> {
        let fragments: Vec<String> = ranges.iter().map(ByteRange::header_fragment).collect();
        let range_value = format!("bytes={}", fragments.join(","));
        trace!(url = %url, range = %range_value, "requesting ranges");

        let mut headers = HeaderMap::new();
        headers.insert(
            RANGE,
            HeaderValue::from_str(&range_value)
                .map_err(|_| Error::transfer_failure("range list is not a valid header value"))?,
        );
        if let Some(token) = &self.session_token {
            headers.insert(HeaderName::from_static(SESSION_TOKEN_HEADER), token.clone());
        }

        let response = self.client.get(url.clone()).headers(headers).send().await?;
        let status = response.status();

        match status {
            StatusCode::OK => {
                // Server ignored the Range header; the body is the whole source
                let data = collect_body(response).await?;
                debug!(url = %url, bytes = data.len(), "server returned the full body");
                Ok(vec![RangeChunk { offset: 0, data }])
            }
            StatusCode::PARTIAL_CONTENT => self.demux_partial(response).await,
            _ => Err(Error::UnexpectedStatus {
                status: status.as_u16(),
            }),
        }
    }

    async fn demux_partial(&self, response: Response) -> Result<Vec<RangeChunk>> {
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if let Some(boundary) = boundary_from_content_type(&content_type) {
            let mut parser = MultipartParser::new(boundary);
            let mut chunks = Vec::new();
            let mut stream = response.bytes_stream();
            while let Some(piece) = stream.next().await {
                chunks.extend(parser.feed(&piece?)?);
            }
            parser.finish()?;
            return Ok(chunks);
        }

        // Single-range 206: Content-Range locates the body
        let (offset, length) = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(parse_content_range)
            .transpose()?
            .ok_or_else(|| Error::transfer_failure("206 response lacks Content-Range"))?;

        let data = collect_body(response).await?;
        if data.len() != length {
            return Err(Error::transfer_failure(format!(
                "range body ended prematurely: expected {length} bytes, got {}",
                data.len()
            )));
        }
        Ok(vec![RangeChunk { offset, data }])
    }
}

async fn collect_body(response: Response) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(piece) = stream.next().await {
        data.extend_from_slice(&piece?);
    }
    Ok(data)
}

/// Backoff before the attempt after `completed` failed attempts: the first
/// retry is immediate, then delays double from two seconds up to the cap.
fn calculate_backoff(completed: u32) -> Duration {
    if completed <= 1 {
        return Duration::ZERO;
    }
    let doubled = BACKOFF_BASE.saturating_mul(1 << (completed - 2).min(31));
    doubled.min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(calculate_backoff(1), Duration::ZERO);
        assert_eq!(calculate_backoff(2), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3), Duration::from_secs(4));
        assert_eq!(calculate_backoff(6), Duration::from_secs(32));
        assert_eq!(calculate_backoff(7), Duration::from_secs(32));
        assert_eq!(calculate_backoff(31), Duration::from_secs(32));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let client = RangeClient::new().unwrap();
        let err = client
            .fetch_ranges("not a url", &[ByteRange::new(0, 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_full_body_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/patch/a.patch"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 64]))
            .mount(&server)
            .await;

        let client = RangeClient::new().unwrap();
        let chunks = client
            .fetch_ranges(
                &format!("{}/patch/a.patch", server.uri()),
                &[ByteRange::new(0, 64)],
            )
            .await
            .unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].data, vec![7u8; 64]);
    }

    #[tokio::test]
    async fn test_single_range_206() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/patch/a.patch"))
            .and(header("range", "bytes=100-149"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 100-149/1000")
                    .set_body_bytes(vec![9u8; 50]),
            )
            .mount(&server)
            .await;

        let client = RangeClient::new().unwrap();
        let chunks = client
            .fetch_ranges(
                &format!("{}/patch/a.patch", server.uri()),
                &[ByteRange::new(100, 50)],
            )
            .await
            .unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 100);
        assert_eq!(chunks[0].data.len(), 50);
    }

    #[tokio::test]
    async fn test_multipart_206() {
        let boundary = "bd9f9df0a1";
        let mut body = Vec::new();
        for (offset, data) in [(0u64, vec![1u8; 10]), (500, vec![2u8; 20])] {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            body.extend_from_slice(
                format!(
                    "Content-Range: bytes {}-{}/1000\r\n\r\n",
                    offset,
                    offset + data.len() as u64 - 1
                )
                .as_bytes(),
            );
            body.extend_from_slice(&data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header(
                        "content-type",
                        format!("multipart/byteranges; boundary={boundary}").as_str(),
                    )
                    .set_body_bytes(body),
            )
            .mount(&server)
            .await;

        let client = RangeClient::new().unwrap();
        let chunks = client
            .fetch_ranges(
                &format!("{}/p", server.uri()),
                &[ByteRange::new(0, 10), ByteRange::new(500, 20)],
            )
            .await
            .unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[1].offset, 500);
        assert_eq!(chunks[1].data, vec![2u8; 20]);
    }

    #[tokio::test]
    async fn test_session_token_is_attached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("x-patch-unique-id", "sid123"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let client = RangeClient::builder().session_token("sid123").build().unwrap();
        let chunks = client
            .fetch_ranges(&format!("{}/p", server.uri()), &[ByteRange::new(0, 2)])
            .await
            .unwrap();
        assert_eq!(chunks[0].data, b"ok");
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"later".to_vec()))
            .mount(&server)
            .await;

        let client = RangeClient::builder().max_attempts(3).build().unwrap();
        let chunks = client
            .fetch_ranges(&format!("{}/p", server.uri()), &[ByteRange::new(0, 5)])
            .await
            .unwrap();
        assert_eq!(chunks[0].data, b"later");
    }

    #[tokio::test]
    async fn test_404_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = RangeClient::builder().max_attempts(5).build().unwrap();
        let err = client
            .fetch_ranges(&format!("{}/p", server.uri()), &[ByteRange::new(0, 5)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedStatus { status: 404 }));
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = RangeClient::builder().max_attempts(2).build().unwrap();
        let err = client
            .fetch_ranges(&format!("{}/p", server.uri()), &[ByteRange::new(0, 5)])
            .await
            .unwrap_err();
        match err {
            Error::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, Error::UnexpectedStatus { status: 500 }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
