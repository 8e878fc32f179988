//! Dropbox backend
//!
//! Path-addressable implementation of [`CloudProvider`] over the Dropbox
//! API v2. RPC calls go to `api.dropboxapi.com`, file content moves
//! through `content.dropboxapi.com` with the JSON argument carried in
//! the `Dropbox-API-Arg` header. Uploads always use `mode=overwrite`;
//! sync correctness depends on replace semantics, never autorename.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::credential_store::CredentialStore;

use super::http_retry::{send_with_retry, RetryPolicy};
use super::oauth2::{AuthState, CredentialRecord, OAuthConfig, TokenSession};
use super::types::{
    join_rel, normalize_rel, parse_rfc3339_utc, strip_prefix_ignore_case, CloudError,
    CloudFileMetadata, ProviderKind, ProviderSettings,
};
use super::{list_folder_recursive, CloudProvider};

const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";

#[derive(Debug, Deserialize)]
struct DropboxEntry {
    #[serde(rename = ".tag", default)]
    tag: String,
    name: String,
    path_display: Option<String>,
    path_lower: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    rev: Option<String>,
    server_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListFolderPage {
    entries: Vec<DropboxEntry>,
    cursor: String,
    has_more: bool,
}

/// Dropbox implementation of the provider contract.
pub struct DropboxProvider {
    settings: ProviderSettings,
    session: TokenSession,
    client: reqwest::Client,
    /// Separate client without a total timeout; uploads may run long.
    upload_client: reqwest::Client,
    retry: RetryPolicy,
    api_base: String,
    content_base: String,
}

impl DropboxProvider {
    pub fn new(settings: ProviderSettings, store: Arc<dyn CredentialStore>) -> Self {
        let config = OAuthConfig::dropbox(
            &settings.client_id,
            settings.client_secret.as_deref(),
            &settings.redirect_uri,
        );
        let session = TokenSession::new(config, store, &settings.user);
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        let upload_client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            settings,
            session,
            client,
            upload_client,
            retry: RetryPolicy::default(),
            api_base: API_BASE.to_string(),
            content_base: CONTENT_BASE.to_string(),
        }
    }

    /// Point the provider at alternate endpoints (tests).
    pub fn with_api_base(mut self, api_base: &str, content_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.content_base = content_base.trim_end_matches('/').to_string();
        self
    }

    /// Configured app root as a Dropbox path. Dropbox addresses its true
    /// root as `""`.
    fn root_prefix(&self) -> String {
        let root = self.settings.app_root.trim_end_matches('/');
        if root.is_empty() || root == "/" {
            String::new()
        } else if root.starts_with('/') {
            root.to_string()
        } else {
            format!("/{}", root)
        }
    }

    /// Absolute Dropbox path for a path relative to the app root.
    fn full_path(&self, rel: &str) -> String {
        let root = self.root_prefix();
        let rel = normalize_rel(rel);
        if rel.is_empty() {
            root
        } else if root.is_empty() {
            format!("/{}", rel)
        } else {
            format!("{}/{}", root, rel)
        }
    }

    /// Relative path (app-root space) from a provider-reported absolute
    /// path. Dropbox paths are case-insensitive, so the prefix match is.
    fn rel_from_full(&self, full: &str) -> String {
        let root = self.root_prefix();
        if root.is_empty() {
            return normalize_rel(full);
        }
        match strip_prefix_ignore_case(full, &root) {
            Some(rest) => normalize_rel(rest),
            None => normalize_rel(full),
        }
    }

    fn to_metadata(&self, entry: &DropboxEntry) -> CloudFileMetadata {
        let full = entry
            .path_display
            .clone()
            .or_else(|| entry.path_lower.clone())
            .unwrap_or_default();
        CloudFileMetadata {
            id: entry.id.clone().unwrap_or_default(),
            name: entry.name.clone(),
            rel_path: self.rel_from_full(&full),
            revision: entry.rev.clone().unwrap_or_default(),
            size_bytes: entry.size,
            modified_at_utc: entry
                .server_modified
                .as_deref()
                .and_then(parse_rfc3339_utc)
                .unwrap_or(0.0),
            is_folder: entry.tag == "folder",
            is_deleted: entry.tag == "deleted",
        }
    }

    async fn auth_header(&self) -> Result<String, CloudError> {
        let token = self.session.bearer().await?;
        Ok(format!("Bearer {}", token.expose_secret()))
    }

    /// RPC-style endpoint call with one silent-refresh retry on 401.
    async fn rpc(
        &self,
        endpoint: &str,
        body: serde_json::Value,
        op: &str,
    ) -> Result<reqwest::Response, CloudError> {
        let url = format!("{}/{}", self.api_base, endpoint);
        let mut refreshed = false;
        loop {
            let request = self
                .client
                .post(&url)
                .header(AUTHORIZATION, self.auth_header().await?)
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string())
                .build()
                .map_err(|e| CloudError::Other(format!("{}: {}", op, e)))?;
            let response = send_with_retry(&self.client, request, &self.retry, op)
                .await
                .map_err(|e| CloudError::from_http(op, e))?;
            if response.status().as_u16() == 401 && !refreshed {
                refreshed = true;
                if self.session.refresh().await?.is_some() {
                    continue;
                }
            }
            return Ok(response);
        }
    }

    async fn rpc_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
        op: &str,
        path: &str,
    ) -> Result<T, CloudError> {
        let response = self.rpc(endpoint, body, op).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            if text.contains("not_found") {
                return Err(CloudError::NotFound(path.to_string()));
            }
            return Err(CloudError::from_status(op, path, status, &text));
        }
        response
            .json()
            .await
            .map_err(|e| CloudError::Parse(format!("{}: {}", op, e)))
    }

    /// Content-endpoint call (upload/download style) with the JSON
    /// argument in the `Dropbox-API-Arg` header.
    async fn content_call(
        &self,
        endpoint: &str,
        arg: serde_json::Value,
        body: Option<Vec<u8>>,
        op: &str,
    ) -> Result<reqwest::Response, CloudError> {
        let url = format!("{}/{}", self.content_base, endpoint);
        let client = if body.is_some() {
            &self.upload_client
        } else {
            &self.client
        };
        let mut refreshed = false;
        loop {
            let mut builder = client
                .post(&url)
                .header(AUTHORIZATION, self.auth_header().await?)
                .header("Dropbox-API-Arg", arg.to_string())
                .header(CONTENT_TYPE, "application/octet-stream");
            if let Some(ref bytes) = body {
                builder = builder.body(bytes.clone());
            }
            let request = builder
                .build()
                .map_err(|e| CloudError::Other(format!("{}: {}", op, e)))?;
            let response = send_with_retry(client, request, &self.retry, op)
                .await
                .map_err(|e| CloudError::from_http(op, e))?;
            if response.status().as_u16() == 401 && !refreshed {
                refreshed = true;
                if self.session.refresh().await?.is_some() {
                    continue;
                }
            }
            return Ok(response);
        }
    }

    /// Create one folder at an absolute Dropbox path. Existing folder is
    /// success; existing file is a conflict.
    async fn mkdir_abs(&self, abs_path: &str) -> Result<(), CloudError> {
        let body = serde_json::json!({ "path": abs_path, "autorename": false });
        let response = self
            .rpc("files/create_folder_v2", body, "create_folder")
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        if text.contains("conflict") {
            // Conflict can mean the folder already exists (fine) or a
            // file occupies the path (fatal for sync).
            let body = serde_json::json!({ "path": abs_path });
            let existing: DropboxEntry = self
                .rpc_json("files/get_metadata", body, "get_metadata", abs_path)
                .await?;
            if existing.tag == "folder" {
                return Ok(());
            }
            return Err(CloudError::Conflict(format!(
                "'{}' exists and is not a folder",
                abs_path
            )));
        }
        Err(CloudError::from_status("create_folder", abs_path, status, &text))
    }

    /// Create every missing segment of an absolute path, one at a time.
    async fn mkdir_segments(&self, abs_path: &str) -> Result<(), CloudError> {
        let mut current = String::new();
        for segment in abs_path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            self.mkdir_abs(&current).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for DropboxProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Dropbox
    }

    async fn authenticate_url(&self, state: &str) -> Result<(String, String), CloudError> {
        self.session.authorize_url(state)
    }

    async fn exchange_code_for_token(
        &self,
        code: &str,
        verifier: &str,
    ) -> Result<CredentialRecord, CloudError> {
        self.session.exchange_code(code, verifier).await
    }

    async fn refresh_access_token(&self) -> Result<Option<String>, CloudError> {
        self.session.refresh().await
    }

    async fn auth_state(&self) -> AuthState {
        self.session.auth_state().await
    }

    async fn list_folder(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<CloudFileMetadata>, CloudError> {
        if recursive {
            return list_folder_recursive(self, path).await;
        }
        let full = self.full_path(path);
        let body = serde_json::json!({
            "path": full,
            "recursive": false,
            "include_deleted": false,
            "include_mounted_folders": true,
        });
        let mut page: ListFolderPage = self
            .rpc_json("files/list_folder", body, "list_folder", path)
            .await?;
        let mut entries: Vec<CloudFileMetadata> =
            page.entries.iter().map(|e| self.to_metadata(e)).collect();

        while page.has_more {
            let body = serde_json::json!({ "cursor": page.cursor });
            page = self
                .rpc_json("files/list_folder/continue", body, "list_folder", path)
                .await?;
            entries.extend(page.entries.iter().map(|e| self.to_metadata(e)));
        }
        Ok(entries)
    }

    async fn get_file_metadata(
        &self,
        path: &str,
    ) -> Result<Option<CloudFileMetadata>, CloudError> {
        let full = self.full_path(path);
        if full.is_empty() {
            // The true root always exists and has no metadata entry.
            return Ok(Some(CloudFileMetadata {
                id: String::new(),
                name: String::new(),
                rel_path: String::new(),
                revision: String::new(),
                size_bytes: 0,
                modified_at_utc: 0.0,
                is_folder: true,
                is_deleted: false,
            }));
        }
        let body = serde_json::json!({ "path": full });
        match self
            .rpc_json::<DropboxEntry>("files/get_metadata", body, "get_metadata", path)
            .await
        {
            Ok(entry) => Ok(Some(self.to_metadata(&entry))),
            Err(CloudError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_folder(&self, path: &str) -> Result<(), CloudError> {
        let rel = normalize_rel(path);
        if rel.is_empty() {
            return Ok(());
        }
        self.mkdir_segments(&self.full_path(&rel)).await
    }

    async fn ensure_app_root_exists(&self) -> Result<bool, CloudError> {
        let root = self.root_prefix();
        if root.is_empty() {
            info!("Dropbox: app root is the storage root, assuming it exists");
            return Ok(true);
        }
        self.mkdir_segments(&root).await?;
        Ok(true)
    }

    async fn upload_bytes(
        &self,
        bytes: Vec<u8>,
        target_folder: &str,
        file_name: &str,
    ) -> Result<CloudFileMetadata, CloudError> {
        let rel = join_rel(target_folder, file_name);
        let full = self.full_path(&rel);
        let arg = serde_json::json!({
            "path": full,
            "mode": "overwrite",
            "autorename": false,
            "mute": true,
        });
        let response = self
            .content_call("files/upload", arg, Some(bytes), "upload")
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(CloudError::from_status("upload", &rel, status, &text));
        }
        let entry: DropboxEntry = response
            .json()
            .await
            .map_err(|e| CloudError::Parse(format!("upload: {}", e)))?;
        info!("Dropbox: uploaded '{}'", rel);
        Ok(self.to_metadata(&entry))
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>, CloudError> {
        let full = self.full_path(path);
        let arg = serde_json::json!({ "path": full });
        let response = self
            .content_call("files/download", arg, None, "download")
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            if text.contains("not_found") {
                return Err(CloudError::NotFound(path.to_string()));
            }
            return Err(CloudError::from_status("download", path, status, &text));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CloudError::from_http("download", e))?;
        info!("Dropbox: downloaded '{}' ({} bytes)", path, bytes.len());
        Ok(bytes.to_vec())
    }

    async fn delete_file(&self, path: &str) -> Result<(), CloudError> {
        let full = self.full_path(path);
        let body = serde_json::json!({ "path": full });
        match self
            .rpc_json::<serde_json::Value>("files/delete_v2", body, "delete", path)
            .await
        {
            Ok(_) => {
                info!("Dropbox: deleted '{}'", path);
                Ok(())
            }
            // Idempotent: already gone is success
            Err(CloudError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_store::MemoryStore;

    fn provider_with_root(root: &str) -> DropboxProvider {
        let settings =
            ProviderSettings::new(ProviderKind::Dropbox, "id", "http://127.0.0.1/cb", "u")
                .with_app_root(root);
        DropboxProvider::new(settings, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_full_path_mapping() {
        let p = provider_with_root("/Apps/Purse");
        assert_eq!(p.full_path(""), "/Apps/Purse");
        assert_eq!(p.full_path("a.md"), "/Apps/Purse/a.md");
        assert_eq!(p.full_path("sub/a.md"), "/Apps/Purse/sub/a.md");

        let p = provider_with_root("/");
        assert_eq!(p.full_path(""), "");
        assert_eq!(p.full_path("a.md"), "/a.md");
    }

    #[test]
    fn test_rel_from_full_is_case_insensitive() {
        let p = provider_with_root("/Apps/Purse");
        assert_eq!(p.rel_from_full("/apps/purse/Note.md"), "Note.md");
        assert_eq!(p.rel_from_full("/Apps/Purse/sub/Note.md"), "sub/Note.md");
        assert_eq!(p.rel_from_full("/Apps/Purse"), "");
    }

    #[test]
    fn test_rel_from_full_with_multibyte_root() {
        // Case folding can change byte lengths; the prefix strip must
        // stay on char boundaries.
        let p = provider_with_root("/Ärzte/İNotlar");
        assert_eq!(p.rel_from_full("/ärzte/İnotlar/Note.md"), "Note.md");
        assert_eq!(p.rel_from_full("/Ärzte/İNotlar"), "");
    }

    #[test]
    fn test_entry_mapping() {
        let p = provider_with_root("/Apps/Purse");
        let entry = DropboxEntry {
            tag: "file".to_string(),
            name: "note.md".to_string(),
            path_display: Some("/Apps/Purse/note.md".to_string()),
            path_lower: Some("/apps/purse/note.md".to_string()),
            id: Some("id:abc".to_string()),
            size: 42,
            rev: Some("015".to_string()),
            server_modified: Some("2024-05-01T12:00:00Z".to_string()),
        };
        let meta = p.to_metadata(&entry);
        assert_eq!(meta.rel_path, "note.md");
        assert_eq!(meta.size_bytes, 42);
        assert_eq!(meta.modified_at_utc, 1714564800.0);
        assert!(!meta.is_folder);
        assert!(!meta.is_deleted);
    }
}
