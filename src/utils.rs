use std::path::{Path, PathBuf};

use url::Url;

/// Last non-empty path segment of `url`, or a generated name when the URL
/// has none.
pub fn get_filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(sanitize_filename)
        .unwrap_or_else(|| format!("download_{}", uuid::Uuid::new_v4()))
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// Where a download of `url` lands inside `dir`.
pub fn output_path_for(dir: &Path, url: &Url) -> PathBuf {
    dir.join(get_filename_from_url(url))
}
