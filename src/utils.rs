//! Utility functions for URLs, destination paths and partial files

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Check that `url` is an absolute http(s) URL
pub fn validate_url(url: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(url).map_err(|e| Error::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(Error::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {other:?}"),
        }),
    }
}

/// Derive a file name from the last path segment of an enclosure URL
///
/// The segment is percent-decoded. Returns `None` when the URL has no usable
/// final segment (e.g. `https://example.com/`).
///
/// # Examples
///
/// ```
/// use podcast_dl::utils::filename_from_url;
///
/// assert_eq!(
///     filename_from_url("https://cdn.example.com/show/Episode%2012.mp3?token=abc"),
///     Some("Episode 12.mp3".to_string())
/// );
/// assert_eq!(filename_from_url("https://example.com/"), None);
/// ```
#[must_use]
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    let decoded = urlencoding::decode(segment).ok()?;
    let name = decoded.trim();

    // Decoded separators would escape the download directory
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return None;
    }
    Some(name.to_string())
}

/// Resolve a destination against the download directory
///
/// Relative destinations are joined to `download_dir`, then the result is made
/// absolute and `.`/`..` components are folded lexically, so two spellings of
/// one path compare equal. Symlinks are not followed.
pub fn resolve_destination(download_dir: &Path, destination: &Path) -> std::io::Result<PathBuf> {
    let joined = if destination.is_absolute() {
        destination.to_path_buf()
    } else {
        download_dir.join(destination)
    };
    Ok(normalize_lexically(&std::path::absolute(joined)?))
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Size of the file at `path`, or 0 when it does not exist
pub async fn file_len(path: &Path) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => 0,
    }
}

/// Remove a partially downloaded file
///
/// A missing file is not an error.
pub async fn remove_partial(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
