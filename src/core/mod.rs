//! Core library modules for sharedl
//!
//! This module contains the internal implementation details of the sharedl
//! library.

pub mod chunk;
pub mod downloader;
pub mod error;
pub mod hash;
pub mod http;
pub mod progress;
pub mod resolver;
pub mod resume;

// Re-export main types for internal use
pub use downloader::{DownloadRequest, DownloadResult, Downloader, DownloaderOptions};
pub use error::{Error, Result};
