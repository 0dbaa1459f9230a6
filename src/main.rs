//! # sharedl CLI
//!
//! Command-line interface for the sharedl library. Downloads one or more
//! share links (Dropbox, Google Drive, WeTransfer, or direct URLs) with
//! chunked transfers, resume support and optional hash verification.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use sharedl::{
    standard_resolvers, DownloadRequest, Downloader, DownloaderOptions, Error, HashAlgorithm,
    ProgressCallback, Result,
};

mod cli;

/// Command-line interface for sharedl
#[derive(Parser)]
#[command(name = "sharedl")]
#[command(about = "Download files behind cloud share links (Dropbox, Google Drive, WeTransfer)")]
#[command(long_about = "Downloads files behind cloud share links efficiently:
  sharedl \"https://www.dropbox.com/s/abc123/file.zip?dl=0\"
  sharedl \"https://we.tl/t-abc123\" --chunk-size 5MB --connections 16
  sharedl --url-file urls.txt --output-dir ./downloads

Share URLs are converted to direct download links automatically; plain
direct URLs work as-is. Large files are fetched in parallel byte-range
chunks and interrupted transfers resume where they left off.")]
#[command(version)]
struct Cli {
    /// Share URLs or direct URLs to download
    #[arg(required_unless_present = "url_file")]
    urls: Vec<String>,

    /// File containing URLs to download, one per line ('#' starts a comment)
    #[arg(long)]
    url_file: Option<PathBuf>,

    /// Output directory for downloads
    #[arg(short = 'd', long, default_value = ".")]
    output_dir: PathBuf,

    /// Explicit output file path (single URL only)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Custom filename (single URL only)
    #[arg(long)]
    filename: Option<String>,

    /// Maximum concurrent connections per download
    #[arg(short = 'c', long, default_value_t = 8)]
    connections: usize,

    /// Chunk size for parallel transfers (e.g. 2MB, 512KB)
    #[arg(long, default_value = "2MB")]
    chunk_size: String,

    /// Download timeout in seconds
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Disable resuming of interrupted downloads
    #[arg(long)]
    no_resume: bool,

    /// Expected hex digest; the download fails if the file does not match
    #[arg(long)]
    verify_hash: Option<String>,

    /// Hash algorithm (md5, sha1, sha256, sha512); inferred from the hash
    /// length when omitted
    #[arg(long)]
    hash_algorithm: Option<String>,

    /// Directory for resume records (defaults to the system temp dir)
    #[arg(long)]
    resume_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(0) => {}
        Ok(_) => std::process::exit(1),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}

/// Run all requested downloads; returns the number of failures
async fn run() -> Result<usize> {
    let args = Cli::parse();

    let level = if args.quiet {
        log::LevelFilter::Error
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .target(env_logger::Target::Stderr)
        .init();

    let urls = collect_urls(&args)?;
    if urls.is_empty() {
        return Err(Error::InvalidInput("no URLs provided".to_string()));
    }
    if urls.len() > 1 && (args.output.is_some() || args.filename.is_some()) {
        return Err(Error::InvalidInput(
            "--output and --filename only apply to a single URL".to_string(),
        ));
    }

    let chunk_size = cli::parse_size(&args.chunk_size).map_err(Error::InvalidInput)?;
    let hash_algorithm = args
        .hash_algorithm
        .as_deref()
        .map(str::parse::<HashAlgorithm>)
        .transpose()?;

    let options = DownloaderOptions {
        max_connections: args.connections,
        chunk_size,
        timeout: Duration::from_secs(args.timeout),
        output_dir: args.output_dir.clone(),
        resume: !args.no_resume,
        resume_dir: args.resume_dir.clone(),
        hash_algorithm,
        ..Default::default()
    };

    // One shutdown token shared by every download, fired on Ctrl-C
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupt received, cancelling...");
                shutdown.cancel();
            }
        });
    }

    let batch_started = Instant::now();
    let mut total_bytes = 0u64;
    let mut succeeded = 0usize;
    let mut failed = 0usize;

    for (i, url) in urls.iter().enumerate() {
        info!("Downloading {}/{}: {}", i + 1, urls.len(), url);

        let downloader = Downloader::new(options.clone(), standard_resolvers())?
            .with_cancellation_token(shutdown.child_token());

        let mut request = DownloadRequest::new(url.clone());
        request.output_path = args.output.clone();
        request.custom_filename = args.filename.clone();
        request.verify_hash = args.verify_hash.clone();

        let progress = if args.quiet {
            None
        } else {
            Some(cli::ProgressManager::new(0, &format!("Downloading {url}")))
        };
        if let Some(manager) = &progress {
            let pb = manager.pb.clone();
            let callback: ProgressCallback = Arc::new(move |downloaded, total| {
                if pb.length().unwrap_or(0) != total {
                    pb.set_length(total);
                }
                pb.set_position(downloaded);
            });
            request.progress = Some(callback);
        }

        let result = downloader.download(&request).await;
        if let Some(manager) = &progress {
            if !manager.pb.is_finished() {
                manager.pb.finish_and_clear();
            }
        }

        match result {
            Ok(result) => {
                info!("File: {}", result.file_path.display());
                info!("Size: {}", cli::format_bytes(result.size));
                info!("Time: {:.1} seconds", result.duration.as_secs_f64());
                info!("Speed: {}/s", cli::format_bytes(result.speed_bps as u64));
                if result.resumed {
                    info!("Resumed from a previous attempt ({} chunks fetched)", result.chunks_used);
                }
                if let Some(hash) = &result.hash {
                    info!("Hash: {hash}");
                }
                total_bytes += result.size;
                succeeded += 1;
            }
            Err(Error::Cancelled) => {
                error!("Download cancelled: {url}");
                failed += 1;
                break;
            }
            Err(e) => {
                error!("Download failed: {e}");
                failed += 1;
            }
        }
    }

    let elapsed = batch_started.elapsed();
    let overall_speed = if elapsed.as_secs_f64() > 0.0 {
        total_bytes as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };

    info!("=== Download Summary ===");
    info!("Total URLs: {}", urls.len());
    info!("Successful: {succeeded}");
    info!("Failed: {failed}");
    info!("Total size: {}", cli::format_bytes(total_bytes));
    info!("Total time: {:.1} seconds", elapsed.as_secs_f64());
    info!("Overall speed: {}/s", cli::format_bytes(overall_speed as u64));

    Ok(failed)
}

/// Gather URLs from positional arguments and an optional URL file
fn collect_urls(args: &Cli) -> Result<Vec<String>> {
    let mut urls = args.urls.clone();

    if let Some(path) = &args.url_file {
        let content = std::fs::read_to_string(path)?;
        for line in content.lines() {
            let line = line.trim();
            if !line.is_empty() && !line.starts_with('#') {
                urls.push(line.to_string());
            }
        }
    }

    Ok(urls)
}
