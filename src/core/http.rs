//! HTTP probing and range fetching
//!
//! Provides the metadata probe (HEAD) and the per-chunk range fetcher with
//! retry and exponential backoff. Both are cancellation-aware: pending
//! backoff delays and in-flight transfers abort as soon as the caller's
//! token fires.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, ETAG, LAST_MODIFIED, RANGE};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::core::chunk::ChunkSpec;
use crate::core::error::{Error, Result};

static FILENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"filename="?([^";\r\n]+)"?"#).expect("valid filename regex"));

static FILENAME_UTF8_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"filename\*=UTF-8''([^;\r\n]+)").expect("valid filename* regex"));

/// Retry behavior for probe and chunk requests.
///
/// Delays grow exponentially from `base_delay`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts beyond the first try
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << (attempt - 1).min(16));
        std::cmp::min(exp, self.max_delay)
    }

    /// Sleep for the given retry attempt, aborting early on cancellation
    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(self.delay_for(attempt)) => Ok(()),
        }
    }
}

/// Metadata for a resolved direct URL, produced once per download attempt
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub url: String,
    pub filename: Option<String>,
    /// Size in bytes, 0 when the server did not report one
    pub size: u64,
    pub supports_range: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Probe a direct URL for size, range support and a filename hint.
///
/// Network-level failures are retried under `policy`; an unexpected status
/// is a terminal probe error.
pub async fn probe(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<FileInfo> {
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = probe_once(client, url, headers) => res,
        };

        match result {
            Ok(info) => return Ok(info),
            Err(Error::Network(msg)) if attempt < policy.max_retries => {
                attempt += 1;
                log::warn!(
                    "Probe network error (attempt {attempt}/{}): {msg}, retrying",
                    policy.max_retries
                );
                policy.backoff(attempt, cancel).await?;
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(Error::Network(msg)) | Err(Error::Http(msg)) => return Err(Error::Probe(msg)),
            Err(e) => return Err(e),
        }
    }
}

async fn probe_once(client: &Client, url: &str, headers: &HeaderMap) -> Result<FileInfo> {
    let response = client.head(url).headers(headers.clone()).send().await?;

    let status = response.status();
    if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
        return Err(Error::Http(format!("unexpected probe status: {status}")));
    }

    let resp_headers = response.headers();

    let size = resp_headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let supports_range = resp_headers
        .get(ACCEPT_RANGES)
        .is_some_and(|v| v.to_str().unwrap_or("") == "bytes");

    let mut filename = resp_headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_filename);

    if filename.is_none() {
        filename = filename_from_url(url);
    }

    let etag = resp_headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string());

    let last_modified = resp_headers
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok(FileInfo {
        url: url.to_string(),
        filename,
        size,
        supports_range,
        etag,
        last_modified,
    })
}

/// Fetch one byte range, reporting cumulative chunk bytes via `on_progress`.
///
/// Every failure mode consumes a retry attempt: request errors, bad status
/// codes, and bodies whose length differs from the chunk size (a corrupted
/// response, not a success). Exhausting retries surfaces the last error
/// tagged with the chunk's range.
pub async fn fetch_range<F>(
    client: &Client,
    url: &str,
    chunk: &ChunkSpec,
    headers: &HeaderMap,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    on_progress: F,
) -> Result<Bytes>
where
    F: Fn(u64),
{
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            log::warn!(
                "Retrying range {}-{} (attempt {attempt}/{})",
                chunk.start,
                chunk.end,
                policy.max_retries
            );
            policy.backoff(attempt, cancel).await?;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = fetch_range_once(client, url, chunk, headers, &on_progress) => res,
        };

        match result {
            Ok(bytes) => return Ok(bytes),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => last_err = Some(e),
        }
    }

    let cause = last_err.expect("at least one attempt was made");
    Err(Error::ChunkFetch(format!(
        "range {}-{} failed after {} attempts: {cause}",
        chunk.start,
        chunk.end,
        policy.max_retries + 1
    )))
}

async fn fetch_range_once<F>(
    client: &Client,
    url: &str,
    chunk: &ChunkSpec,
    headers: &HeaderMap,
    on_progress: &F,
) -> Result<Bytes>
where
    F: Fn(u64),
{
    let response = client
        .get(url)
        .headers(headers.clone())
        .header(RANGE, chunk.range_header())
        .send()
        .await?;

    let status = response.status();
    if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
        return Err(Error::Http(format!("unexpected range status: {status}")));
    }

    let mut body = BytesMut::with_capacity(chunk.size() as usize);
    let mut stream = response.bytes_stream();

    while let Some(frame) = stream.next().await {
        let frame = frame?;
        body.extend_from_slice(&frame);
        on_progress(body.len() as u64);
    }

    if body.len() as u64 != chunk.size() {
        return Err(Error::Http(format!(
            "received {} bytes, expected {}",
            body.len(),
            chunk.size()
        )));
    }

    Ok(body.freeze())
}

/// Pull a filename out of a Content-Disposition header value
fn extract_filename(content_disposition: &str) -> Option<String> {
    // RFC 5987 filename* takes precedence when both forms are present
    if let Some(captures) = FILENAME_UTF8_RE.captures(content_disposition) {
        let raw = captures.get(1)?.as_str();
        if let Ok(decoded) = percent_decode_str(raw).decode_utf8() {
            return Some(decoded.into_owned());
        }
        return Some(raw.to_string());
    }

    FILENAME_RE
        .captures(content_disposition)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Last path segment of the URL, as a filename fallback
fn filename_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let decoded = percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_filename_quoted() {
        assert_eq!(
            extract_filename(r#"attachment; filename="report.pdf""#),
            Some("report.pdf".to_string())
        );
    }

    #[test]
    fn test_extract_filename_unquoted() {
        assert_eq!(
            extract_filename("attachment; filename=data.tar.gz"),
            Some("data.tar.gz".to_string())
        );
    }

    #[test]
    fn test_extract_filename_utf8() {
        assert_eq!(
            extract_filename("attachment; filename*=UTF-8''r%C3%A9sum%C3%A9.zip"),
            Some("résumé.zip".to_string())
        );
    }

    #[test]
    fn test_extract_filename_missing() {
        assert_eq!(extract_filename("inline"), None);
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://example.com/files/archive.zip?dl=1"),
            Some("archive.zip".to_string())
        );
        assert_eq!(filename_from_url("https://example.com/"), None);
    }

    #[test]
    fn test_retry_delay_growth() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        // Capped at max_delay
        assert_eq!(policy.delay_for(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_backoff_aborts_on_cancellation() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = std::time::Instant::now();
        let result = policy.backoff(1, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
