//! Core download engine
//!
//! Orchestrates a single download attempt: resolve the share URL, probe the
//! target, pick a strategy, fan out range fetches over a bounded worker
//! pool, reassemble chunks at their byte offsets, persist resume state, and
//! verify the result.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Client, ClientBuilder, StatusCode};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::core::chunk::{self, ChunkSpec};
use crate::core::error::{Error, Result};
use crate::core::hash::{self, HashAlgorithm};
use crate::core::http::{self, FileInfo, RetryPolicy};
use crate::core::progress::ProgressTracker;
use crate::core::resolver::{resolve_share_url, Resolver};
use crate::core::resume::{ResumeRecord, ResumeStore};

/// Minimum delay between periodic resume-record writes during a transfer
const RESUME_SAVE_INTERVAL: Duration = Duration::from_secs(2);

/// Progress callback function type: `(downloaded, total)`
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Configuration for a download engine
#[derive(Clone)]
pub struct DownloaderOptions {
    /// Upper bound on concurrent chunk connections
    pub max_connections: usize,

    /// Byte-range size for chunked transfers
    pub chunk_size: u64,

    /// Overall per-request timeout
    pub timeout: Duration,

    pub connect_timeout: Duration,

    /// Directory joined with derived filenames when no explicit path is given
    pub output_dir: PathBuf,

    /// Whether to persist and honor resume records
    pub resume: bool,

    /// Resume record directory; defaults to a temp-dir location
    pub resume_dir: Option<PathBuf>,

    pub retry: RetryPolicy,

    /// Digest algorithm for verification; detected from the expected hash
    /// length when unset
    pub hash_algorithm: Option<HashAlgorithm>,

    pub user_agent: String,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            chunk_size: 2 * 1024 * 1024,
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            output_dir: PathBuf::from("."),
            resume: true,
            resume_dir: None,
            retry: RetryPolicy::default(),
            hash_algorithm: None,
            user_agent: format!("sharedl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// A single download request
pub struct DownloadRequest {
    /// Share URL (or direct URL, handled by the passthrough resolver)
    pub url: String,

    /// Explicit output file path; overrides filename derivation entirely
    pub output_path: Option<PathBuf>,

    /// Filename override, joined with the configured output directory
    pub custom_filename: Option<String>,

    /// Expected hex digest; verification runs only when set
    pub verify_hash: Option<String>,

    /// Extra request headers for probe and transfer
    pub headers: HeaderMap,

    pub progress: Option<ProgressCallback>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            output_path: None,
            custom_filename: None,
            verify_hash: None,
            headers: HeaderMap::new(),
            progress: None,
        }
    }
}

/// Terminal record for a completed download
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub file_path: PathBuf,
    pub size: u64,
    pub duration: Duration,
    /// Average transfer speed in bytes per second; 0 when no bytes moved
    pub speed_bps: f64,
    /// Computed digest, present only when verification was requested
    pub hash: Option<String>,
    pub resumed: bool,
    /// Chunks fetched during this attempt (0 for single-stream transfers)
    pub chunks_used: usize,
}

/// High-level download engine. One instance owns one download attempt's
/// client, resolver list, resume store and cancellation token.
pub struct Downloader {
    client: Client,
    options: DownloaderOptions,
    resolvers: Vec<Box<dyn Resolver>>,
    resume_store: ResumeStore,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(options: DownloaderOptions, resolvers: Vec<Box<dyn Resolver>>) -> Result<Self> {
        let client = ClientBuilder::new()
            .tcp_keepalive(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout)
            .user_agent(options.user_agent.clone())
            .build()?;

        let resume_store = ResumeStore::new(options.resume_dir.clone());

        Ok(Self {
            client,
            options,
            resolvers,
            resume_store,
            cancel: CancellationToken::new(),
        })
    }

    /// Token observed by every in-flight fetch and pending backoff delay
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replace the engine's cancellation token, e.g. with a child of a
    /// process-wide shutdown token
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Abort the download; in-flight work stops at the next suspension point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Access to the engine's resume store, e.g. for record garbage
    /// collection
    pub fn resume_store(&self) -> &ResumeStore {
        &self.resume_store
    }

    /// Execute a download request to completion
    pub async fn download(&self, req: &DownloadRequest) -> Result<DownloadResult> {
        let started = Instant::now();

        let resolved = resolve_share_url(&self.resolvers, &self.client, &req.url).await?;
        let info = http::probe(
            &self.client,
            &resolved.direct_url,
            &req.headers,
            &self.options.retry,
            &self.cancel,
        )
        .await?;

        let output_path = self
            .determine_output_path(req, resolved.filename.as_deref(), info.filename.as_deref())
            .await?;

        // Pre-existing complete file: accept without touching the network
        if info.size > 0 {
            if let Ok(metadata) = tokio::fs::metadata(&output_path).await {
                if metadata.is_file() && metadata.len() == info.size {
                    log::info!(
                        "File already exists and is complete: {}",
                        output_path.display()
                    );
                    return Ok(DownloadResult {
                        file_path: output_path,
                        size: info.size,
                        duration: started.elapsed(),
                        speed_bps: 0.0,
                        hash: None,
                        resumed: false,
                        chunks_used: 0,
                    });
                }
            }
        }

        let display_name = output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());

        log::info!("Starting download: {} -> {}", info.url, output_path.display());

        let chunked = info.size > 0 && info.supports_range;
        if info.size > 0 && !info.supports_range {
            log::warn!("Server does not support range requests, using a single stream");
        }

        let (tracker, resumed, chunks_used) = if chunked {
            self.download_chunked(req, &info, &output_path, &display_name)
                .await?
        } else {
            self.download_single(req, &info, &output_path, &display_name)
                .await?
        };

        // The on-disk size must match the probe exactly, even though every
        // chunk reported success individually
        let final_len = tokio::fs::metadata(&output_path).await?.len();
        if info.size > 0 && final_len != info.size {
            tracker.fail("size mismatch after transfer");
            return Err(Error::SizeMismatch {
                expected: info.size,
                actual: final_len,
            });
        }

        let hash_value = match &req.verify_hash {
            Some(expected) => {
                let algorithm = self
                    .options
                    .hash_algorithm
                    .or_else(|| HashAlgorithm::detect(expected))
                    .unwrap_or(HashAlgorithm::Sha256);
                log::info!("Verifying {} hash", algorithm.as_str());
                // On mismatch the file is kept for inspection
                Some(hash::verify_file(&output_path, expected, algorithm).await?)
            }
            None => None,
        };

        if let Err(e) = self.resume_store.clear(&req.url).await {
            log::warn!("Could not clear resume record: {e}");
        }
        tracker.complete();

        let duration = started.elapsed();
        let speed_bps = if duration.as_secs_f64() > 0.0 {
            final_len as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Ok(DownloadResult {
            file_path: output_path,
            size: final_len,
            duration,
            speed_bps,
            hash: hash_value,
            resumed,
            chunks_used,
        })
    }

    /// Output path precedence: explicit path > custom filename > resolver
    /// suggestion > probed filename > generic default
    async fn determine_output_path(
        &self,
        req: &DownloadRequest,
        resolver_filename: Option<&str>,
        probed_filename: Option<&str>,
    ) -> Result<PathBuf> {
        let path = if let Some(explicit) = &req.output_path {
            explicit.clone()
        } else {
            let filename = req
                .custom_filename
                .clone()
                .or_else(|| resolver_filename.map(str::to_string))
                .or_else(|| probed_filename.map(str::to_string))
                .unwrap_or_else(|| "download".to_string());
            self.options.output_dir.join(filename)
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        Ok(path)
    }

    fn make_record(
        &self,
        req: &DownloadRequest,
        output_path: &Path,
        total: u64,
        chunk_size: u64,
        downloaded: u64,
    ) -> ResumeRecord {
        ResumeRecord {
            url: req.url.clone(),
            file_path: output_path.to_path_buf(),
            total_size: total,
            downloaded,
            chunk_size,
            last_modified: SystemTime::now(),
            hash: req.verify_hash.clone(),
        }
    }

    /// Chunked transfer over a bounded worker pool with positioned writes
    async fn download_chunked(
        &self,
        req: &DownloadRequest,
        info: &FileInfo,
        output_path: &Path,
        display_name: &str,
    ) -> Result<(Arc<ProgressTracker>, bool, usize)> {
        let total = info.size;

        let mut record = None;
        if self.options.resume {
            if let Some(found) = self.resume_store.is_resumable(&req.url, output_path).await {
                // The record must describe the same remote file and stop at
                // a chunk boundary, or the plan would not line up
                let aligned = found.chunk_size > 0
                    && (found.downloaded == found.total_size
                        || found.downloaded % found.chunk_size == 0);
                if found.total_size == total && aligned {
                    record = Some(found);
                } else {
                    log::info!("Resume record no longer matches the remote file, starting fresh");
                }
            }
        }

        let chunk_size = record
            .as_ref()
            .map(|r| r.chunk_size)
            .unwrap_or(self.options.chunk_size)
            .max(1);
        let chunks = chunk::plan(total, chunk_size);
        let already = record.as_ref().map(|r| r.downloaded).unwrap_or(0);
        let resumed = already > 0;

        if resumed {
            log::info!(
                "Resuming download at {} of {} bytes",
                already,
                total
            );
        }

        let pending: Vec<ChunkSpec> = chunks
            .iter()
            .copied()
            .filter(|c| c.end >= already)
            .collect();

        let tracker = Arc::new(ProgressTracker::new(display_name, total));
        if already > 0 {
            tracker.seed(already);
            if let Some(cb) = &req.progress {
                cb(already, total);
            }
        }

        // Resumed files are opened for random-offset writes, never truncated
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(!resumed)
            .open(output_path)
            .await?;

        if self.options.resume {
            let initial = self.make_record(req, output_path, total, chunk_size, already);
            if let Err(e) = self.resume_store.save(&req.url, &initial).await {
                log::warn!("Could not write resume record: {e}");
            }
        }

        let connections = effective_connections(total, self.options.max_connections);
        log::debug!(
            "Transferring {} pending chunks over {} connections",
            pending.len(),
            connections
        );

        let worker_client = self.client.clone();
        let worker_url = info.url.clone();
        let worker_headers = req.headers.clone();
        let worker_retry = self.options.retry.clone();
        let worker_cancel = self.cancel.clone();
        let worker_tracker = Arc::clone(&tracker);
        let worker_progress = req.progress.clone();

        let fetches = futures::stream::iter(pending)
            .map(move |spec| {
                let client = worker_client.clone();
                let url = worker_url.clone();
                let headers = worker_headers.clone();
                let retry = worker_retry.clone();
                let cancel = worker_cancel.clone();
                let tracker = Arc::clone(&worker_tracker);
                let progress_cb = worker_progress.clone();

                async move {
                    let data =
                        http::fetch_range(&client, &url, &spec, &headers, &retry, &cancel, |bytes| {
                            let aggregate = tracker.record_chunk(spec.index, bytes);
                            if let Some(cb) = &progress_cb {
                                cb(aggregate, tracker.total());
                            }
                        })
                        .await?;
                    Ok::<(ChunkSpec, Bytes), Error>((spec, data))
                }
            })
            .buffer_unordered(connections);
        tokio::pin!(fetches);

        // Single writer: completions arrive in any order and land at their
        // absolute offsets; `prefix` tracks contiguous confirmed bytes for
        // the resume record
        let mut done = vec![false; chunks.len()];
        for c in &chunks {
            if c.end < already {
                done[c.index] = true;
            }
        }
        let mut next_undone = done.iter().position(|d| !d).unwrap_or(chunks.len());
        let mut prefix = already;
        let mut last_save = Instant::now();
        let mut fetched = 0usize;

        let outcome: Result<()> = loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => break Err(Error::Cancelled),
                item = fetches.next() => item,
            };
            let Some(result) = item else {
                break Ok(());
            };

            match result {
                Ok((spec, data)) => {
                    if let Err(e) = write_chunk_at(&mut file, &spec, &data).await {
                        break Err(e);
                    }
                    fetched += 1;
                    done[spec.index] = true;
                    tracker.record_chunk(spec.index, spec.size());
                    while next_undone < chunks.len() && done[next_undone] {
                        prefix = chunks[next_undone].end + 1;
                        next_undone += 1;
                    }

                    if self.options.resume
                        && prefix > already
                        && last_save.elapsed() >= RESUME_SAVE_INTERVAL
                    {
                        let snapshot =
                            self.make_record(req, output_path, total, chunk_size, prefix);
                        if let Err(e) = self.resume_store.save(&req.url, &snapshot).await {
                            log::warn!("Could not update resume record: {e}");
                        }
                        last_save = Instant::now();
                    }
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(()) => {
                file.flush().await?;
                Ok((tracker, resumed, fetched))
            }
            Err(Error::Cancelled) => {
                tracker.fail("cancelled");
                let _ = file.flush().await;
                if self.options.resume && prefix > 0 {
                    // Keep only confirmed contiguous bytes so the record and
                    // the file agree for a later resumption
                    let _ = file.set_len(prefix).await;
                    let snapshot = self.make_record(req, output_path, total, chunk_size, prefix);
                    if let Err(e) = self.resume_store.save(&req.url, &snapshot).await {
                        log::warn!("Could not save resume record: {e}");
                    }
                } else {
                    drop(file);
                    let _ = tokio::fs::remove_file(output_path).await;
                    let _ = self.resume_store.clear(&req.url).await;
                }
                Err(Error::Cancelled)
            }
            Err(e) => {
                // A chunk exhausted its retries: the partial file is not
                // trustworthy, so remove it along with the record
                tracker.fail(&e.to_string());
                drop(file);
                let _ = tokio::fs::remove_file(output_path).await;
                let _ = self.resume_store.clear(&req.url).await;
                Err(e)
            }
        }
    }

    /// Unchunked fallback: one GET streamed sequentially to the file
    async fn download_single(
        &self,
        req: &DownloadRequest,
        info: &FileInfo,
        output_path: &Path,
        display_name: &str,
    ) -> Result<(Arc<ProgressTracker>, bool, usize)> {
        let tracker = Arc::new(ProgressTracker::new(display_name, info.size));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(output_path)
            .await?;

        let result = self
            .stream_to_file(req, info, &mut file, &tracker)
            .await;

        match result {
            Ok(()) => {
                file.flush().await?;
                Ok((tracker, false, 0))
            }
            Err(e) => {
                tracker.fail(&e.to_string());
                drop(file);
                let _ = tokio::fs::remove_file(output_path).await;
                Err(e)
            }
        }
    }

    async fn stream_to_file(
        &self,
        req: &DownloadRequest,
        info: &FileInfo,
        file: &mut tokio::fs::File,
        tracker: &ProgressTracker,
    ) -> Result<()> {
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            res = self.client.get(&info.url).headers(req.headers.clone()).send() => res?,
        };

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::Http(format!("unexpected download status: {status}")));
        }

        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                frame = stream.next() => frame,
            };
            let Some(frame) = frame else {
                break;
            };
            let frame = frame?;

            file.write_all(&frame).await?;
            downloaded += frame.len() as u64;

            let aggregate = tracker.record_chunk(0, downloaded);
            if let Some(cb) = &req.progress {
                cb(aggregate, tracker.total());
            }
        }

        Ok(())
    }
}

async fn write_chunk_at(file: &mut tokio::fs::File, spec: &ChunkSpec, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(spec.start)).await?;
    file.write_all(data).await?;
    Ok(())
}

/// Cap the worker pool by file size and host resources; small files behave
/// like a plain sequential fetch
fn effective_connections(file_size: u64, max_connections: usize) -> usize {
    const MB: u64 = 1024 * 1024;
    let base = match file_size {
        s if s <= MB => 1,
        s if s <= 10 * MB => 2,
        s if s <= 100 * MB => 4,
        s if s <= 512 * MB => 8,
        s if s <= 1024 * MB => 12,
        _ => 16,
    };

    base.min(max_connections).min(num_cpus::get() * 2).max(1)
}
