//! Filename sanitization and collision-safe path resolution.

use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};

use url::Url;

/// Replaces characters that are invalid in filenames with `_`.
///
/// Names that would be interpreted as path components (`.`, `..`) have
/// their dots rewritten so the result always stays inside its directory.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

/// What [`claim_unique_path`] creates at the chosen name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// An empty file.
    File,
    /// An empty directory.
    Dir,
}

/// Atomically claims a name in `dir` that did not exist before.
///
/// `book.epub`, then `book_1.epub`, `book_2.epub`, ... The first candidate
/// created with `create_new` (or `create_dir`) wins, so concurrent callers
/// never receive the same path.
///
/// # Errors
///
/// Returns the I/O error of the first failure other than `AlreadyExists`.
pub async fn claim_unique_path(dir: &Path, filename: &str, claim: Claim) -> io::Result<PathBuf> {
    for candidate in unique_candidates(filename) {
        let path = dir.join(candidate);
        let created = match claim {
            Claim::File => tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
                .map(drop),
            Claim::Dir => tokio::fs::create_dir(&path).await,
        };
        match created {
            Ok(()) => return Ok(path),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free name for {filename} in {}", dir.display()),
    ))
}

fn unique_candidates(filename: &str) -> impl Iterator<Item = String> {
    let filename = {
        let sanitized = sanitize_filename(filename);
        if sanitized.trim_matches('_').is_empty() {
            "download.bin".to_string()
        } else {
            sanitized
        }
    };
    let (stem, ext) = match filename.rfind('.') {
        Some(pos) if pos > 0 => (filename[..pos].to_string(), filename[pos..].to_string()),
        _ => (filename.clone(), String::new()),
    };
    let numbered = (1..1000).map({
        let (stem, ext) = (stem.clone(), ext.clone());
        move |i| format!("{stem}_{i}{ext}")
    });
    let stamped = std::iter::once_with(move || {
        format!("{stem}_{}{ext}", crate::model::now_ms())
    });
    std::iter::once(filename).chain(numbered).chain(stamped)
}

/// Filename from the last URL path segment, or `download_<ms>.bin`.
#[must_use]
pub fn filename_from_url(url: &Url) -> String {
    if let Some(mut segments) = url.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
    {
        let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
        return sanitize_filename(&decoded);
    }
    format!("download_{}.bin", crate::model::now_ms())
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
