//! Share-URL resolution
//!
//! Converts human-facing share links into direct, byte-addressable download
//! URLs. Each provider implements the [`Resolver`] capability trait; the
//! engine is handed an explicit list at construction time and dispatches to
//! the first resolver that claims the URL.

use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// Outcome of resolving a share URL
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub direct_url: String,
    /// Filename suggested by the provider, if it knows one
    pub filename: Option<String>,
}

/// One provider's ability to turn share links into direct URLs.
///
/// Resolution may perform a small number of HTTP calls with the supplied
/// client; it must not mutate any shared state.
pub trait Resolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this resolver understands the given URL
    fn is_supported(&self, url: &str) -> bool;

    fn resolve<'a>(&'a self, client: &'a Client, url: &'a str) -> BoxFuture<'a, Result<Resolved>>;
}

/// Dispatch a URL to the first resolver that supports it
pub async fn resolve_share_url(
    resolvers: &[Box<dyn Resolver>],
    client: &Client,
    url: &str,
) -> Result<Resolved> {
    for resolver in resolvers {
        if resolver.is_supported(url) {
            log::info!("Using resolver: {}", resolver.name());
            return resolver.resolve(client, url).await;
        }
    }
    Err(Error::Resolution(format!("no resolver supports URL: {url}")))
}

/// The built-in resolver set, in dispatch order. `Direct` comes last so
/// plain direct URLs keep working without provider involvement.
pub fn standard_resolvers() -> Vec<Box<dyn Resolver>> {
    vec![
        Box::new(Dropbox),
        Box::new(GoogleDrive),
        Box::new(WeTransfer),
        Box::new(Direct),
    ]
}

/// Dropbox share links: flips the `dl` parameter so the link serves bytes
pub struct Dropbox;

impl Dropbox {
    fn direct_url(url: &str) -> Result<String> {
        if !url.contains("/s/") && !url.contains("/scl/fi/") {
            return Err(Error::Resolution(format!(
                "unsupported Dropbox URL format: {url}"
            )));
        }

        if url.contains("dl=0") {
            Ok(url.replacen("dl=0", "dl=1", 1))
        } else if url.contains('?') {
            Ok(format!("{url}&dl=1"))
        } else {
            Ok(format!("{url}?dl=1"))
        }
    }

    fn filename(url: &str) -> Option<String> {
        let parsed = reqwest::Url::parse(url).ok()?;
        let path = percent_decode_str(parsed.path())
            .decode_utf8()
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| parsed.path().to_string());

        if path.contains("/s/") {
            // Legacy format: /s/<hash>/<filename>
            return path
                .rsplit('/')
                .find(|part| !part.is_empty())
                .map(str::to_string);
        }
        if path.contains("/scl/fi/") {
            // New format: the filename is the last dotted path segment
            return path
                .rsplit('/')
                .find(|part| !part.is_empty() && part.contains('.'))
                .map(str::to_string);
        }
        None
    }
}

impl Resolver for Dropbox {
    fn name(&self) -> &'static str {
        "Dropbox"
    }

    fn is_supported(&self, url: &str) -> bool {
        url.contains("dropbox.com")
    }

    fn resolve<'a>(&'a self, _client: &'a Client, url: &'a str) -> BoxFuture<'a, Result<Resolved>> {
        async move {
            Ok(Resolved {
                direct_url: Self::direct_url(url)?,
                filename: Self::filename(url),
            })
        }
        .boxed()
    }
}

static GDRIVE_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"/file/d/([a-zA-Z0-9_-]+)",
        r"[?&]id=([a-zA-Z0-9_-]+)",
        r"/open\?id=([a-zA-Z0-9_-]+)",
        r"/d/([a-zA-Z0-9_-]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid gdrive pattern"))
    .collect()
});

/// Google Drive share links: extracts the file id and builds the
/// export-download URL (with the large-file confirm parameter)
pub struct GoogleDrive;

impl GoogleDrive {
    fn extract_file_id(url: &str) -> Result<String> {
        for pattern in GDRIVE_ID_PATTERNS.iter() {
            if let Some(captures) = pattern.captures(url) {
                if let Some(id) = captures.get(1) {
                    return Ok(id.as_str().to_string());
                }
            }
        }
        Err(Error::Resolution(format!(
            "no file id found in Google Drive URL: {url}"
        )))
    }
}

impl Resolver for GoogleDrive {
    fn name(&self) -> &'static str {
        "Google Drive"
    }

    fn is_supported(&self, url: &str) -> bool {
        url.contains("drive.google.com") || url.contains("docs.google.com")
    }

    fn resolve<'a>(&'a self, _client: &'a Client, url: &'a str) -> BoxFuture<'a, Result<Resolved>> {
        async move {
            let id = Self::extract_file_id(url)?;
            Ok(Resolved {
                direct_url: format!(
                    "https://drive.google.com/uc?export=download&id={id}&confirm=t"
                ),
                filename: None,
            })
        }
        .boxed()
    }
}

static WETRANSFER_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"we\.tl/([a-zA-Z0-9]+)", r"wetransfer\.com/downloads/([a-zA-Z0-9]+)"]
        .iter()
        .map(|p| Regex::new(p).expect("valid wetransfer pattern"))
        .collect()
});

#[derive(Debug, Deserialize)]
struct TransferFile {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TransferInfo {
    files: Vec<TransferFile>,
    security_hash: String,
}

#[derive(Debug, Serialize)]
struct DirectLinkRequest<'a> {
    intent: &'a str,
    security_hash: &'a str,
}

#[derive(Debug, Deserialize)]
struct DirectLinkResponse {
    direct_link: String,
}

/// WeTransfer share links: two API calls (transfer info, then a download
/// request carrying the security hash) yield the direct link
pub struct WeTransfer;

impl WeTransfer {
    fn extract_transfer_id(url: &str) -> Result<String> {
        for pattern in WETRANSFER_ID_PATTERNS.iter() {
            if let Some(captures) = pattern.captures(url) {
                if let Some(id) = captures.get(1) {
                    return Ok(id.as_str().to_string());
                }
            }
        }
        Err(Error::Resolution(format!(
            "no transfer id found in WeTransfer URL: {url}"
        )))
    }

    async fn lookup(client: &Client, url: &str) -> Result<Resolved> {
        let transfer_id = Self::extract_transfer_id(url)?;
        log::debug!("Extracted WeTransfer id: {transfer_id}");

        let info_url = format!("https://wetransfer.com/api/v4/transfers/{transfer_id}");
        let response = client
            .get(&info_url)
            .header("Accept", "application/json")
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await
            .map_err(|e| Error::Resolution(format!("transfer info request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Resolution(format!(
                "transfer info returned status {}",
                response.status()
            )));
        }

        let info: TransferInfo = response
            .json()
            .await
            .map_err(|e| Error::Resolution(format!("malformed transfer info: {e}")))?;

        let first_file = info
            .files
            .first()
            .ok_or_else(|| Error::Resolution("no files found in transfer".to_string()))?;

        let link_url = format!("https://wetransfer.com/api/v4/transfers/{transfer_id}/download");
        let response = client
            .post(&link_url)
            .header("Accept", "application/json")
            .header("X-Requested-With", "XMLHttpRequest")
            .json(&DirectLinkRequest {
                intent: "entire_transfer",
                security_hash: &info.security_hash,
            })
            .send()
            .await
            .map_err(|e| Error::Resolution(format!("download link request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Resolution(format!(
                "download link request returned status {}",
                response.status()
            )));
        }

        let link: DirectLinkResponse = response
            .json()
            .await
            .map_err(|e| Error::Resolution(format!("malformed download link response: {e}")))?;

        if link.direct_link.is_empty() {
            return Err(Error::Resolution(
                "no direct download link received".to_string(),
            ));
        }

        Ok(Resolved {
            direct_url: link.direct_link,
            filename: Some(first_file.name.clone()),
        })
    }
}

impl Resolver for WeTransfer {
    fn name(&self) -> &'static str {
        "WeTransfer"
    }

    fn is_supported(&self, url: &str) -> bool {
        url.contains("wetransfer.com") || url.contains("we.tl")
    }

    fn resolve<'a>(&'a self, client: &'a Client, url: &'a str) -> BoxFuture<'a, Result<Resolved>> {
        Self::lookup(client, url).boxed()
    }
}

/// Passthrough for URLs that already serve bytes directly
pub struct Direct;

impl Resolver for Direct {
    fn name(&self) -> &'static str {
        "Direct"
    }

    fn is_supported(&self, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }

    fn resolve<'a>(&'a self, _client: &'a Client, url: &'a str) -> BoxFuture<'a, Result<Resolved>> {
        async move {
            Ok(Resolved {
                direct_url: url.to_string(),
                filename: None,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropbox_rewrites_dl_zero() {
        let url = "https://www.dropbox.com/s/abc123/file.zip?dl=0";
        assert_eq!(
            Dropbox::direct_url(url).unwrap(),
            "https://www.dropbox.com/s/abc123/file.zip?dl=1"
        );
    }

    #[test]
    fn test_dropbox_appends_dl_with_query() {
        let url = "https://www.dropbox.com/scl/fi/abc123/file.zip?rlkey=xyz";
        assert_eq!(
            Dropbox::direct_url(url).unwrap(),
            "https://www.dropbox.com/scl/fi/abc123/file.zip?rlkey=xyz&dl=1"
        );
    }

    #[test]
    fn test_dropbox_appends_dl_without_query() {
        let url = "https://www.dropbox.com/s/abc123/file.zip";
        assert_eq!(
            Dropbox::direct_url(url).unwrap(),
            "https://www.dropbox.com/s/abc123/file.zip?dl=1"
        );
    }

    #[test]
    fn test_dropbox_rejects_other_paths() {
        assert!(Dropbox::direct_url("https://www.dropbox.com/home").is_err());
    }

    #[test]
    fn test_dropbox_filename_legacy() {
        assert_eq!(
            Dropbox::filename("https://www.dropbox.com/s/abc123/report.pdf?dl=0"),
            Some("report.pdf".to_string())
        );
    }

    #[test]
    fn test_dropbox_filename_scl() {
        assert_eq!(
            Dropbox::filename("https://www.dropbox.com/scl/fi/abc123/data.tar.gz?rlkey=x"),
            Some("data.tar.gz".to_string())
        );
    }

    #[test]
    fn test_gdrive_id_patterns() {
        for url in [
            "https://drive.google.com/file/d/1AbC_d-9/view?usp=sharing",
            "https://drive.google.com/uc?id=1AbC_d-9&export=download",
            "https://drive.google.com/open?id=1AbC_d-9",
            "https://drive.google.com/d/1AbC_d-9",
        ] {
            assert_eq!(GoogleDrive::extract_file_id(url).unwrap(), "1AbC_d-9", "url: {url}");
        }
    }

    #[test]
    fn test_gdrive_no_id() {
        assert!(GoogleDrive::extract_file_id("https://drive.google.com/drive/my-drive").is_err());
    }

    #[test]
    fn test_wetransfer_id_patterns() {
        assert_eq!(
            WeTransfer::extract_transfer_id("https://we.tl/t123abc").unwrap(),
            "t123abc"
        );
        assert_eq!(
            WeTransfer::extract_transfer_id("https://wetransfer.com/downloads/deadbeef42").unwrap(),
            "deadbeef42"
        );
        assert!(WeTransfer::extract_transfer_id("https://wetransfer.com/about").is_err());
    }

    #[test]
    fn test_dispatch_order() {
        let resolvers = standard_resolvers();
        let dropbox = "https://www.dropbox.com/s/abc/file.zip";
        let plain = "https://example.com/file.zip";

        let first_match = |url: &str| {
            resolvers
                .iter()
                .find(|r| r.is_supported(url))
                .map(|r| r.name())
        };

        assert_eq!(first_match(dropbox), Some("Dropbox"));
        assert_eq!(first_match(plain), Some("Direct"));
        assert_eq!(first_match("ftp://example.com/file"), None);
    }

    #[tokio::test]
    async fn test_dispatch_no_match_is_resolution_error() {
        let resolvers = standard_resolvers();
        let client = Client::new();
        let err = resolve_share_url(&resolvers, &client, "ftp://example.com/file")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[tokio::test]
    async fn test_direct_passthrough() {
        let client = Client::new();
        let resolved = Direct
            .resolve(&client, "https://example.com/big.iso")
            .await
            .unwrap();
        assert_eq!(resolved.direct_url, "https://example.com/big.iso");
        assert_eq!(resolved.filename, None);
    }
}
