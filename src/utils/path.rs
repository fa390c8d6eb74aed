//! Path normalization utilities.

use std::path::{Path, PathBuf};

/// Normalize a user-supplied path.
/// - Expands ~ to home directory
/// - Resolves to canonical path if possible
pub fn normalize_path(path: &Path) -> PathBuf {
    let expanded = expand_home(&path.display().to_string());

    // Try to canonicalize (resolves symlinks)
    match std::fs::canonicalize(&expanded) {
        Ok(canonical) => canonical,
        Err(_) => PathBuf::from(expanded),
    }
}

/// Expand ~ to the home directory.
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}/{}", home.display(), rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.display().to_string();
        }
    }
    path.to_string()
}
