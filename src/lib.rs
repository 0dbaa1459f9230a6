//! # sharedl
//!
//! Resumable chunked downloader for cloud file-sharing links.
//!
//! Converts share URLs (Dropbox, Google Drive, WeTransfer, or plain direct
//! URLs) into direct download URLs and fetches them with bounded-concurrency
//! range requests, retry with exponential backoff, persisted resume state
//! and optional hash verification.
//!
//! ```no_run
//! use sharedl::{DownloadRequest, Downloader, DownloaderOptions, standard_resolvers};
//!
//! # async fn run() -> sharedl::Result<()> {
//! let downloader = Downloader::new(DownloaderOptions::default(), standard_resolvers())?;
//! let result = downloader
//!     .download(&DownloadRequest::new("https://www.dropbox.com/s/abc123/big.iso?dl=0"))
//!     .await?;
//! println!("saved {} bytes to {}", result.size, result.file_path.display());
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use core::chunk::{plan, ChunkSpec};
pub use core::downloader::{
    DownloadRequest, DownloadResult, Downloader, DownloaderOptions, ProgressCallback,
};
pub use core::error::{Error, Result};
pub use core::hash::{file_digest, verify_file, HashAlgorithm};
pub use core::http::{FileInfo, RetryPolicy};
pub use core::progress::{ProgressTracker, TransferProgress};
pub use core::resolver::{standard_resolvers, Resolved, Resolver};
pub use core::resume::{ResumeRecord, ResumeStore};

/// Download a share URL with default options, deriving the output filename
pub async fn fetch(share_url: &str) -> Result<DownloadResult> {
    fetch_with_options(DownloadRequest::new(share_url), DownloaderOptions::default()).await
}

/// Download with explicit request and engine options
pub async fn fetch_with_options(
    request: DownloadRequest,
    options: DownloaderOptions,
) -> Result<DownloadResult> {
    let downloader = Downloader::new(options, standard_resolvers())?;
    downloader.download(&request).await
}
