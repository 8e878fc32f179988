//! Local filesystem scanner
//!
//! Enumerates tracked files under the sync root and captures the
//! modification timestamps the sync engine compares against remote
//! metadata. Hidden entries (leading dot) are always skipped, which also
//! keeps the configuration directory out of the regular sync set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Snapshot of one local file at scan time.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFileState {
    pub path: PathBuf,
    /// Path relative to the scan root, forward slashes.
    pub rel_path: String,
    /// UTC seconds since epoch, float precision.
    pub modified_at_utc: f64,
    pub size_bytes: u64,
}

/// Scanner for tracked files under one root directory.
pub struct LocalScanner {
    root: PathBuf,
    /// Tracked extension without the dot, lowercase.
    extension: String,
    recursive: bool,
}

impl LocalScanner {
    pub fn new(root: &Path, extension: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            extension: extension.trim_start_matches('.').to_lowercase(),
            recursive: false,
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Enumerate tracked files, keyed by relative path.
    ///
    /// Unreadable entries are logged and skipped rather than failing the
    /// whole scan; a sync pass should survive one bad file.
    pub fn scan(&self) -> BTreeMap<String, LocalFileState> {
        let mut files = BTreeMap::new();
        if !self.root.is_dir() {
            warn!("scan root '{}' is not a directory", self.root.display());
            return files;
        }

        let mut walker = WalkDir::new(&self.root).min_depth(1).follow_links(false);
        if !self.recursive {
            walker = walker.max_depth(1);
        }

        for entry in walker
            .into_iter()
            .filter_entry(|e| !is_hidden(e.file_name().to_string_lossy().as_ref()))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.tracks(entry.path()) {
                continue;
            }
            let rel_path = match relative_key(&self.root, entry.path()) {
                Some(rel) => rel,
                None => continue,
            };
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("skipping '{}': {}", entry.path().display(), e);
                    continue;
                }
            };
            let modified_at_utc = match metadata.modified() {
                Ok(t) => t
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0),
                Err(e) => {
                    warn!("skipping '{}': no mtime ({})", entry.path().display(), e);
                    continue;
                }
            };
            files.insert(
                rel_path.clone(),
                LocalFileState {
                    path: entry.path().to_path_buf(),
                    rel_path,
                    modified_at_utc,
                    size_bytes: metadata.len(),
                },
            );
        }
        debug!("scanned {} tracked files under '{}'", files.len(), self.root.display());
        files
    }

    fn tracks(&self, path: &Path) -> bool {
        path.extension()
            .map(|e| e.to_string_lossy().to_lowercase() == self.extension)
            .unwrap_or(false)
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Relative path with forward slashes, suitable as a sync key.
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_scan_tracked_extension_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.md"), "alpha").unwrap();
        fs::write(dir.path().join("b.txt"), "beta").unwrap();
        fs::write(dir.path().join("c.MD"), "gamma").unwrap();

        let files = LocalScanner::new(dir.path(), "md").scan();
        assert_eq!(files.len(), 2);
        assert!(files.contains_key("a.md"));
        assert!(files.contains_key("c.MD"));
        assert_eq!(files["a.md"].size_bytes, 5);
    }

    #[test]
    fn test_scan_skips_hidden_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".hidden.md"), "x").unwrap();
        fs::create_dir(dir.path().join(".purse_config")).unwrap();
        fs::write(dir.path().join(".purse_config/settings.yml"), "x").unwrap();
        fs::write(dir.path().join("visible.md"), "x").unwrap();

        let files = LocalScanner::new(dir.path(), "md").recursive(true).scan();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key("visible.md"));
    }

    #[test]
    fn test_non_recursive_ignores_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("top.md"), "x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/deep.md"), "x").unwrap();

        let flat = LocalScanner::new(dir.path(), "md").scan();
        assert_eq!(flat.len(), 1);
        assert!(flat.contains_key("top.md"));

        let deep = LocalScanner::new(dir.path(), "md").recursive(true).scan();
        assert_eq!(deep.len(), 2);
        assert!(deep.contains_key("sub/deep.md"));
    }

    #[test]
    fn test_missing_root_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        assert!(LocalScanner::new(&gone, "md").scan().is_empty());
    }

    #[test]
    fn test_mtime_captured() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.md"), "alpha").unwrap();
        let files = LocalScanner::new(dir.path(), "md").scan();
        let now = std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        let mtime = files["a.md"].modified_at_utc;
        assert!(mtime > 0.0);
        assert!((now - mtime).abs() < 60.0);
    }
}
