//! Shared types for cloud storage providers
//!
//! Provider-agnostic metadata, per-provider settings, and the error
//! taxonomy used across every backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default application root folder in the user's cloud storage.
pub const DEFAULT_APP_ROOT: &str = "/Apps/Purse";

/// Supported cloud storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Dropbox (path-addressable, OAuth2)
    Dropbox,
    /// Google Drive (ID-addressable, OAuth2)
    GoogleDrive,
    /// Microsoft OneDrive (path-addressable via Graph, OAuth2)
    OneDrive,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Dropbox => write!(f, "Dropbox"),
            ProviderKind::GoogleDrive => write!(f, "Google Drive"),
            ProviderKind::OneDrive => write!(f, "OneDrive"),
        }
    }
}

impl ProviderKind {
    /// Stable lowercase key used for credential-store lookups.
    pub fn key(&self) -> &'static str {
        match self {
            ProviderKind::Dropbox => "dropbox",
            ProviderKind::GoogleDrive => "google_drive",
            ProviderKind::OneDrive => "onedrive",
        }
    }
}

/// Configuration for one provider instance
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    /// OAuth2 client id (app key). Empty means not configured.
    pub client_id: String,
    /// OAuth2 client secret; optional for pure-PKCE public clients.
    pub client_secret: Option<String>,
    /// Redirect URI registered with the provider.
    pub redirect_uri: String,
    /// Credential-store account key for this user.
    pub user: String,
    /// Application root folder, absolute from the provider's true root.
    pub app_root: String,
}

impl ProviderSettings {
    pub fn new(kind: ProviderKind, client_id: &str, redirect_uri: &str, user: &str) -> Self {
        Self {
            kind,
            client_id: client_id.to_string(),
            client_secret: None,
            redirect_uri: redirect_uri.to_string(),
            user: user.to_string(),
            app_root: DEFAULT_APP_ROOT.to_string(),
        }
    }

    pub fn with_client_secret(mut self, secret: &str) -> Self {
        self.client_secret = Some(secret.to_string());
        self
    }

    pub fn with_app_root(mut self, root: &str) -> Self {
        let trimmed = root.trim();
        self.app_root = if trimmed.is_empty() {
            DEFAULT_APP_ROOT.to_string()
        } else if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        };
        self
    }
}

/// Provider-agnostic descriptor of one remote entry.
///
/// `rel_path` is always relative to the application root folder, uses
/// forward slashes and never begins with `/`; the root itself is `""`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudFileMetadata {
    /// Provider-native identifier
    pub id: String,
    pub name: String,
    pub rel_path: String,
    /// Opaque revision string, display/debugging only
    pub revision: String,
    pub size_bytes: u64,
    /// UTC seconds since epoch, float precision
    pub modified_at_utc: f64,
    pub is_folder: bool,
    pub is_deleted: bool,
}

/// Normalize a path relative to the app root: forward slashes, no
/// leading or trailing `/`, root is the empty string.
pub fn normalize_rel(path: &str) -> String {
    path.trim().trim_matches('/').to_string()
}

/// Join a relative folder path and an entry name into a relative path.
pub fn join_rel(folder: &str, name: &str) -> String {
    let folder = normalize_rel(folder);
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", folder, name)
    }
}

/// Strip `prefix` from the front of `s`, ignoring case, walking char by
/// char so multi-byte characters whose lowercase form has a different
/// byte length cannot break the split point.
pub fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let mut rest = s;
    for expected in prefix.chars() {
        let mut chars = rest.chars();
        match chars.next() {
            Some(actual) if actual.to_lowercase().eq(expected.to_lowercase()) => {
                rest = chars.as_str();
            }
            _ => return None,
        }
    }
    Some(rest)
}

/// Parent folder of a relative path (`""` for top-level entries).
pub fn parent_rel(rel: &str) -> String {
    match normalize_rel(rel).rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

/// Cloud provider error taxonomy
#[derive(Error, Debug)]
pub enum CloudError {
    /// Missing or invalid OAuth client configuration. Fatal for the
    /// provider, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Token invalid, expired or revoked and not silently refreshable.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Network failure or 5xx/429 from the service; eligible for retry.
    #[error("transient service error: {0}")]
    Transient(String),

    /// Remote path exists with an incompatible type.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl CloudError {
    /// Whether a caller-level retry with backoff makes sense.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CloudError::Transient(_))
    }

    /// Classify a non-success HTTP response into the error taxonomy,
    /// logging enough context to reconstruct the failure.
    pub fn from_status(op: &str, path: &str, status: u16, body: &str) -> Self {
        tracing::error!("{} failed for '{}': HTTP {} - {}", op, path, status, body);
        match status {
            401 | 403 => CloudError::Auth(format!("{} rejected (HTTP {})", op, status)),
            404 => CloudError::NotFound(path.to_string()),
            409 => CloudError::Conflict(format!("{}: '{}'", op, path)),
            429 | 500..=599 => {
                CloudError::Transient(format!("{} returned HTTP {} for '{}'", op, status, path))
            }
            _ => CloudError::Other(format!("{} failed for '{}': HTTP {}", op, path, status)),
        }
    }

    /// Map a reqwest transport failure. Connect/timeout problems are
    /// transient; anything else is opaque.
    pub fn from_http(op: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            CloudError::Transient(format!("{}: {}", op, err))
        } else {
            CloudError::Other(format!("{}: {}", op, err))
        }
    }
}

/// Parse an RFC 3339 timestamp into UTC seconds since epoch.
pub fn parse_rfc3339_utc(value: &str) -> Option<f64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_rel() {
        assert_eq!(normalize_rel(""), "");
        assert_eq!(normalize_rel("/"), "");
        assert_eq!(normalize_rel("/a/b/"), "a/b");
        assert_eq!(normalize_rel("a/b.md"), "a/b.md");
    }

    #[test]
    fn test_join_and_parent() {
        assert_eq!(join_rel("", "a.md"), "a.md");
        assert_eq!(join_rel("sub", "a.md"), "sub/a.md");
        assert_eq!(parent_rel("a.md"), "");
        assert_eq!(parent_rel("sub/deep/a.md"), "sub/deep");
    }

    #[test]
    fn test_strip_prefix_ignore_case() {
        assert_eq!(
            strip_prefix_ignore_case("/Apps/Purse/a.md", "/apps/purse"),
            Some("/a.md")
        );
        assert_eq!(strip_prefix_ignore_case("/Apps/Purse", "/apps/purse"), Some(""));
        assert_eq!(strip_prefix_ignore_case("/Other/a.md", "/apps"), None);
        // Multi-byte characters whose lowercase form differs in length
        assert_eq!(
            strip_prefix_ignore_case("/İNotlar/a.md", "/İnotlar"),
            Some("/a.md")
        );
        assert_eq!(strip_prefix_ignore_case("/Ärzte/a.md", "/ärzte"), Some("/a.md"));
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            CloudError::from_status("list", "x", 404, ""),
            CloudError::NotFound(_)
        ));
        assert!(CloudError::from_status("list", "x", 503, "").is_recoverable());
        assert!(!CloudError::from_status("list", "x", 400, "").is_recoverable());
        assert!(matches!(
            CloudError::from_status("upload", "x", 401, ""),
            CloudError::Auth(_)
        ));
    }

    #[test]
    fn test_parse_rfc3339_utc() {
        let ts = parse_rfc3339_utc("2024-05-01T12:00:00Z").unwrap();
        assert_eq!(ts, 1714564800.0);
        assert!(parse_rfc3339_utc("garbage").is_none());
    }

    #[test]
    fn test_app_root_normalized() {
        let s = ProviderSettings::new(ProviderKind::Dropbox, "id", "http://localhost/cb", "u")
            .with_app_root("Notes/Purse");
        assert_eq!(s.app_root, "/Notes/Purse");
        let s = s.with_app_root("  ");
        assert_eq!(s.app_root, DEFAULT_APP_ROOT);
    }
}
