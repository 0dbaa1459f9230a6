//! End-to-end download tests against a local mock server
//!
//! Exercises the engine's strategies (chunked, single-stream, resumed), its
//! verification paths and its failure handling without touching the real
//! network.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempfile::tempdir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sharedl::{
    standard_resolvers, DownloadRequest, Downloader, DownloaderOptions, Error, ResumeRecord,
    ResumeStore, RetryPolicy,
};

#[ctor::ctor]
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// sha256("hello world")
const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    }
}

fn downloader_for(output_dir: &Path, chunk_size: u64) -> Downloader {
    let options = DownloaderOptions {
        chunk_size,
        output_dir: output_dir.to_path_buf(),
        resume_dir: Some(output_dir.join("resume")),
        retry: fast_retry(),
        ..Default::default()
    };
    Downloader::new(options, standard_resolvers()).unwrap()
}

async fn mount_head(server: &MockServer, size: usize, ranges: bool) {
    let mut template = ResponseTemplate::new(200)
        .insert_header("content-length", size.to_string().as_str());
    if ranges {
        template = template.insert_header("accept-ranges", "bytes");
    }
    Mock::given(method("HEAD"))
        .and(path("/file.bin"))
        .respond_with(template)
        .mount(server)
        .await;
}

/// Mount one GET mock per byte range, each expected exactly once
async fn mount_ranges(server: &MockServer, body: &[u8], chunk_size: usize, expected: &[(usize, usize)]) {
    let mut start = 0;
    while start < body.len() {
        let end = std::cmp::min(start + chunk_size - 1, body.len() - 1);
        let expect = expected.iter().any(|&(s, e)| s == start && e == end) as u64;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("Range", format!("bytes={start}-{end}").as_str()))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_raw(body[start..=end].to_vec(), "application/octet-stream"),
            )
            .expect(expect)
            .mount(server)
            .await;
        start = end + 1;
    }
}

#[tokio::test]
async fn test_chunked_download_reassembles_exactly() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let body = test_body(103);

    // 103 bytes in 25-byte chunks: five ranges, all fetched once
    mount_head(&server, body.len(), true).await;
    let all: Vec<(usize, usize)> = vec![(0, 24), (25, 49), (50, 74), (75, 99), (100, 102)];
    mount_ranges(&server, &body, 25, &all).await;

    let downloader = downloader_for(dir.path(), 25);
    let result = downloader
        .download(&DownloadRequest::new(format!("{}/file.bin", server.uri())))
        .await
        .unwrap();

    assert_eq!(result.size, 103);
    assert_eq!(result.chunks_used, 5);
    assert!(!result.resumed);
    assert!(result.speed_bps >= 0.0);

    let written = std::fs::read(&result.file_path).unwrap();
    assert_eq!(written, body);
}

#[tokio::test]
async fn test_progress_callback_reaches_total() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let body = test_body(100);

    mount_head(&server, body.len(), true).await;
    let all: Vec<(usize, usize)> = vec![(0, 24), (25, 49), (50, 74), (75, 99)];
    mount_ranges(&server, &body, 25, &all).await;

    let seen = Arc::new(std::sync::Mutex::new(Vec::<(u64, u64)>::new()));
    let seen_cb = Arc::clone(&seen);

    let downloader = downloader_for(dir.path(), 25);
    let mut request = DownloadRequest::new(format!("{}/file.bin", server.uri()));
    request.progress = Some(Arc::new(move |downloaded, total| {
        seen_cb.lock().unwrap().push((downloaded, total));
    }));

    downloader.download(&request).await.unwrap();

    let updates = seen.lock().unwrap();
    assert!(!updates.is_empty());
    // Monotonically non-decreasing aggregate, ending at the full size
    let mut last = 0;
    for &(downloaded, total) in updates.iter() {
        assert_eq!(total, 100);
        assert!(downloaded >= last);
        last = downloaded;
    }
    assert_eq!(last, 100);
}

#[tokio::test]
async fn test_hash_verification_success() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let body = b"hello world".to_vec();

    mount_head(&server, body.len(), true).await;
    mount_ranges(&server, &body, 1024, &[(0, 10)]).await;

    let downloader = downloader_for(dir.path(), 1024);
    let mut request = DownloadRequest::new(format!("{}/file.bin", server.uri()));
    // Uppercase input exercises case-insensitive comparison
    request.verify_hash = Some(HELLO_SHA256.to_uppercase());

    let result = downloader.download(&request).await.unwrap();
    assert_eq!(result.hash.as_deref(), Some(HELLO_SHA256));
}

#[tokio::test]
async fn test_hash_mismatch_fails_but_keeps_file() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let body = b"hello world".to_vec();

    mount_head(&server, body.len(), true).await;
    mount_ranges(&server, &body, 1024, &[(0, 10)]).await;

    let downloader = downloader_for(dir.path(), 1024);
    let mut request = DownloadRequest::new(format!("{}/file.bin", server.uri()));
    request.verify_hash = Some("0".repeat(64));

    let err = downloader.download(&request).await.unwrap_err();
    assert!(matches!(err, Error::HashMismatch { .. }));

    // The transfer itself succeeded, so the file stays for inspection
    let retained = dir.path().join("file.bin");
    assert_eq!(std::fs::read(retained).unwrap(), body);
}

#[tokio::test]
async fn test_existing_file_short_circuit() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let body = test_body(103);

    mount_head(&server, body.len(), true).await;
    // Any transfer request would be a failure
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let output = dir.path().join("file.bin");
    std::fs::write(&output, &body).unwrap();

    let downloader = downloader_for(dir.path(), 25);
    let result = downloader
        .download(&DownloadRequest::new(format!("{}/file.bin", server.uri())))
        .await
        .unwrap();

    assert_eq!(result.size, 103);
    assert_eq!(result.speed_bps, 0.0);
    assert!(!result.resumed);
    assert_eq!(result.chunks_used, 0);
}

#[tokio::test]
async fn test_cancellation_yields_cancelled_error() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();

    mount_head(&server, 103, true).await;

    let downloader = downloader_for(dir.path(), 25);
    downloader.cancel();

    let err = downloader
        .download(&DownloadRequest::new(format!("{}/file.bin", server.uri())))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    // Nothing on disk claims completion
    assert!(!dir.path().join("file.bin").exists());
}

#[tokio::test]
async fn test_single_stream_fallback_without_range_support() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let body = test_body(103);

    // No Accept-Ranges header: the engine must not send Range requests
    mount_head(&server, body.len(), false).await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(body.clone(), "application/octet-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let downloader = downloader_for(dir.path(), 25);
    let result = downloader
        .download(&DownloadRequest::new(format!("{}/file.bin", server.uri())))
        .await
        .unwrap();

    assert_eq!(result.size, 103);
    assert_eq!(result.chunks_used, 0);
    assert_eq!(std::fs::read(&result.file_path).unwrap(), body);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let body = test_body(64);

    mount_head(&server, body.len(), true).await;

    // First attempt fails, the retry serves the range
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    let body_clone = body.clone();
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(move |_: &wiremock::Request| {
            if calls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(500)
            } else {
                ResponseTemplate::new(206)
                    .set_body_raw(body_clone.clone(), "application/octet-stream")
            }
        })
        .mount(&server)
        .await;

    let downloader = downloader_for(dir.path(), 1024);
    let result = downloader
        .download(&DownloadRequest::new(format!("{}/file.bin", server.uri())))
        .await
        .unwrap();

    assert_eq!(result.size, 64);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(std::fs::read(&result.file_path).unwrap(), body);
}

#[tokio::test]
async fn test_exhausted_retries_remove_partial_file() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();

    mount_head(&server, 64, true).await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let downloader = downloader_for(dir.path(), 1024);
    let err = downloader
        .download(&DownloadRequest::new(format!("{}/file.bin", server.uri())))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ChunkFetch(_)));
    assert!(!dir.path().join("file.bin").exists());
}

#[tokio::test]
async fn test_resume_skips_completed_prefix() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let body = test_body(100);

    mount_head(&server, body.len(), true).await;
    // Only the two chunks past the resume point may be requested
    mount_ranges(&server, &body, 25, &[(50, 74), (75, 99)]).await;

    let output = dir.path().join("file.bin");
    std::fs::write(&output, &body[..50]).unwrap();

    let resume_dir = dir.path().join("resume");
    let url = format!("{}/file.bin", server.uri());
    let store = ResumeStore::new(Some(resume_dir.clone()));
    store
        .save(
            &url,
            &ResumeRecord {
                url: url.clone(),
                file_path: output.clone(),
                total_size: 100,
                downloaded: 50,
                chunk_size: 25,
                last_modified: SystemTime::now(),
                hash: None,
            },
        )
        .await
        .unwrap();

    let downloader = downloader_for(dir.path(), 25);
    let mut request = DownloadRequest::new(url.clone());
    request.output_path = Some(output.clone());

    let result = downloader.download(&request).await.unwrap();

    assert!(result.resumed);
    assert_eq!(result.chunks_used, 2);
    assert_eq!(result.size, 100);
    assert_eq!(std::fs::read(&output).unwrap(), body);

    // The record is cleared on completion
    assert!(store.load(&url).await.is_none());
}

#[tokio::test]
async fn test_stale_resume_record_starts_fresh() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let body = test_body(100);

    mount_head(&server, body.len(), true).await;
    // File size no longer matches the record, so all four chunks re-download
    let all: Vec<(usize, usize)> = vec![(0, 24), (25, 49), (50, 74), (75, 99)];
    mount_ranges(&server, &body, 25, &all).await;

    let output = dir.path().join("file.bin");
    std::fs::write(&output, &body[..30]).unwrap();

    let resume_dir = dir.path().join("resume");
    let url = format!("{}/file.bin", server.uri());
    let store = ResumeStore::new(Some(resume_dir.clone()));
    store
        .save(
            &url,
            &ResumeRecord {
                url: url.clone(),
                file_path: output.clone(),
                total_size: 100,
                downloaded: 50,
                chunk_size: 25,
                last_modified: SystemTime::now(),
                hash: None,
            },
        )
        .await
        .unwrap();

    let downloader = downloader_for(dir.path(), 25);
    let mut request = DownloadRequest::new(url);
    request.output_path = Some(output.clone());

    let result = downloader.download(&request).await.unwrap();
    assert!(!result.resumed);
    assert_eq!(result.chunks_used, 4);
    assert_eq!(std::fs::read(&output).unwrap(), body);
}

#[tokio::test]
async fn test_size_mismatch_detected_after_transfer() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();

    // Probe claims 100 bytes but the stream only delivers 90
    mount_head(&server, 100, false).await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(test_body(90), "application/octet-stream"),
        )
        .mount(&server)
        .await;

    let downloader = downloader_for(dir.path(), 1024);
    let err = downloader
        .download(&DownloadRequest::new(format!("{}/file.bin", server.uri())))
        .await
        .unwrap_err();

    match err {
        Error::SizeMismatch { expected, actual } => {
            assert_eq!(expected, 100);
            assert_eq!(actual, 90);
        }
        other => panic!("expected SizeMismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unsupported_url_is_resolution_error() {
    let dir = tempdir().unwrap();
    let downloader = downloader_for(dir.path(), 1024);

    let err = downloader
        .download(&DownloadRequest::new("ftp://example.com/file.bin"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Resolution(_)));
}

#[tokio::test]
async fn test_probe_failure_is_terminal() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();

    Mock::given(method("HEAD"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let downloader = downloader_for(dir.path(), 1024);
    let err = downloader
        .download(&DownloadRequest::new(format!("{}/file.bin", server.uri())))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Probe(_)));
}
