//! Google Drive backend
//!
//! Drive is ID-addressable: every call needs a file ID, so the relative
//! paths of the provider contract are translated by walking path
//! segments with name queries from the Drive root. Resolved folder IDs
//! are cached per instance to keep a sync pass from re-walking the same
//! chain for every file.
//!
//! Uploads use `uploadType=media` (PATCH) when the file already exists
//! and a manually assembled `multipart/related` body (POST) when it does
//! not; reqwest's multipart support only produces `multipart/form-data`,
//! which Drive rejects for this endpoint.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::credential_store::CredentialStore;

use super::http_retry::{send_with_retry, RetryPolicy};
use super::oauth2::{AuthState, CredentialRecord, OAuthConfig, TokenSession};
use super::types::{
    join_rel, normalize_rel, parse_rfc3339_utc, CloudError, CloudFileMetadata, ProviderKind,
    ProviderSettings,
};
use super::{list_folder_recursive, CloudProvider};

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,modifiedTime,size,version";
const MULTIPART_BOUNDARY: &str = "purse_sync_related_boundary";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: Option<String>,
    modified_time: Option<String>,
    /// Drive reports sizes as decimal strings.
    size: Option<String>,
    version: Option<String>,
}

impl DriveFile {
    fn is_folder(&self) -> bool {
        self.mime_type.as_deref() == Some(FOLDER_MIME)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListPage {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

/// Google Drive implementation of the provider contract.
pub struct GoogleDriveProvider {
    settings: ProviderSettings,
    session: TokenSession,
    client: reqwest::Client,
    upload_client: reqwest::Client,
    retry: RetryPolicy,
    api_base: String,
    upload_base: String,
    /// Relative folder path (app-root space, `""` = app root) -> file ID.
    folder_cache: RwLock<HashMap<String, String>>,
}

impl GoogleDriveProvider {
    pub fn new(settings: ProviderSettings, store: Arc<dyn CredentialStore>) -> Self {
        let config = OAuthConfig::google(
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
            upload_base: UPLOAD_BASE.to_string(),
            folder_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Point the provider at alternate endpoints (tests).
    pub fn with_api_base(mut self, api_base: &str, upload_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.upload_base = upload_base.trim_end_matches('/').to_string();
        self
    }

    async fn auth_header(&self) -> Result<String, CloudError> {
        let token = self.session.bearer().await?;
        Ok(format!("Bearer {}", token.expose_secret()))
    }

    /// One HTTP call with transient-retry and a single silent-refresh
    /// retry on 401.
    async fn send(
        &self,
        client: &reqwest::Client,
        method: Method,
        url: &str,
        content_type: Option<&str>,
        body: Option<Vec<u8>>,
        op: &str,
    ) -> Result<reqwest::Response, CloudError> {
        let mut refreshed = false;
        loop {
            let mut builder = client
                .request(method.clone(), url)
                .header(AUTHORIZATION, self.auth_header().await?);
            if let Some(ct) = content_type {
                builder = builder.header(CONTENT_TYPE, ct);
            }
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

    async fn expect_json<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        op: &str,
        path: &str,
    ) -> Result<T, CloudError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(CloudError::from_status(op, path, status, &text));
        }
        response
            .json()
            .await
            .map_err(|e| CloudError::Parse(format!("{}: {}", op, e)))
    }

    /// Find a child entry by name under a parent folder ID.
    async fn find_child(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<DriveFile>, CloudError> {
        // Drive query strings escape backslash and single quote
        let escaped = name.replace('\\', "\\\\").replace('\'', "\\'");
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escaped, parent_id
        );
        let url = format!(
            "{}/files?q={}&fields={}&pageSize=10",
            self.api_base,
            urlencoding::encode(&query),
            urlencoding::encode(&format!("files({})", FILE_FIELDS)),
        );
        let response = self
            .send(&self.client, Method::GET, &url, None, None, "find_child")
            .await?;
        let page: FileListPage = self.expect_json(response, "find_child", name).await?;
        Ok(page.files.into_iter().next())
    }

    async fn create_child_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<DriveFile, CloudError> {
        let body = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME,
            "parents": [parent_id],
        });
        let url = format!(
            "{}/files?fields={}",
            self.api_base,
            urlencoding::encode(FILE_FIELDS)
        );
        let response = self
            .send(
                &self.client,
                Method::POST,
                &url,
                Some("application/json"),
                Some(body.to_string().into_bytes()),
                "create_folder",
            )
            .await?;
        self.expect_json(response, "create_folder", name).await
    }

    /// Resolve a relative folder path to its Drive ID by walking
    /// segments from the Drive root through the app root.
    ///
    /// With `create` set, missing segments are created and the result is
    /// always `Some`. Without it, a missing segment yields `Ok(None)`.
    async fn resolve_folder_id(
        &self,
        rel: &str,
        create: bool,
    ) -> Result<Option<String>, CloudError> {
        let rel = normalize_rel(rel);
        if let Some(id) = self.folder_cache.read().await.get(&rel) {
            return Ok(Some(id.clone()));
        }

        // App root first: walk its absolute segments from the Drive root.
        let root_id = match self.folder_cache.read().await.get("") {
            Some(id) => Some(id.clone()),
            None => None,
        };
        let mut parent_id = match root_id {
            Some(id) => id,
            None => {
                let mut current = "root".to_string();
                for segment in self.settings.app_root.split('/').filter(|s| !s.is_empty()) {
                    match self.walk_segment(&current, segment, create).await? {
                        Some(id) => current = id,
                        None => return Ok(None),
                    }
                }
                self.folder_cache
                    .write()
                    .await
                    .insert(String::new(), current.clone());
                current
            }
        };
        if rel.is_empty() {
            return Ok(Some(parent_id));
        }

        let mut walked = String::new();
        for segment in rel.split('/') {
            walked = join_rel(&walked, segment);
            let cached = self.folder_cache.read().await.get(&walked).cloned();
            parent_id = match cached {
                Some(id) => id,
                None => match self.walk_segment(&parent_id, segment, create).await? {
                    Some(id) => {
                        self.folder_cache
                            .write()
                            .await
                            .insert(walked.clone(), id.clone());
                        id
                    }
                    None => return Ok(None),
                },
            };
        }
        Ok(Some(parent_id))
    }

    /// One step of the segment walk: find (or create) `name` under
    /// `parent_id` and return its folder ID.
    async fn walk_segment(
        &self,
        parent_id: &str,
        name: &str,
        create: bool,
    ) -> Result<Option<String>, CloudError> {
        match self.find_child(parent_id, name).await? {
            Some(entry) if entry.is_folder() => Ok(Some(entry.id)),
            Some(_) if create => Err(CloudError::Conflict(format!(
                "'{}' exists and is not a folder",
                name
            ))),
            Some(_) => Ok(None),
            None if create => {
                let created = self.create_child_folder(parent_id, name).await?;
                info!("Google Drive: created folder '{}'", name);
                Ok(Some(created.id))
            }
            None => Ok(None),
        }
    }

    fn to_metadata(&self, file: &DriveFile, rel_path: &str) -> CloudFileMetadata {
        CloudFileMetadata {
            id: file.id.clone(),
            name: file.name.clone(),
            rel_path: rel_path.to_string(),
            revision: file.version.clone().unwrap_or_default(),
            size_bytes: file
                .size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            modified_at_utc: file
                .modified_time
                .as_deref()
                .and_then(parse_rfc3339_utc)
                .unwrap_or(0.0),
            is_folder: file.is_folder(),
            is_deleted: false,
        }
    }

    /// Locate a file (or folder) entry by relative path without creating
    /// anything.
    async fn find_entry(&self, path: &str) -> Result<Option<DriveFile>, CloudError> {
        let rel = normalize_rel(path);
        let Some((parent_rel, name)) = split_parent(&rel) else {
            return Ok(None);
        };
        let Some(parent_id) = self.resolve_folder_id(&parent_rel, false).await? else {
            return Ok(None);
        };
        self.find_child(&parent_id, &name).await
    }

    /// `multipart/related` body for a metadata + content upload.
    fn multipart_related_body(metadata: &serde_json::Value, bytes: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(bytes.len() + 512);
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{}\r\n",
                MULTIPART_BOUNDARY, metadata
            )
            .as_bytes(),
        );
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Type: application/octet-stream\r\n\r\n",
                MULTIPART_BOUNDARY
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());
        body
    }
}

/// Split a non-root relative path into (parent, name).
fn split_parent(rel: &str) -> Option<(String, String)> {
    if rel.is_empty() {
        return None;
    }
    match rel.rsplit_once('/') {
        Some((parent, name)) => Some((parent.to_string(), name.to_string())),
        None => Some((String::new(), rel.to_string())),
    }
}

#[async_trait]
impl CloudProvider for GoogleDriveProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleDrive
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
        let rel = normalize_rel(path);
        let Some(folder_id) = self.resolve_folder_id(&rel, false).await? else {
            return Err(CloudError::NotFound(rel));
        };

        let query = format!("'{}' in parents and trashed = false", folder_id);
        let mut page_token: Option<String> = None;
        let mut entries = Vec::new();
        loop {
            let mut url = format!(
                "{}/files?q={}&fields={}&pageSize=1000",
                self.api_base,
                urlencoding::encode(&query),
                urlencoding::encode(&format!("nextPageToken,files({})", FILE_FIELDS)),
            );
            if let Some(ref token) = page_token {
                url.push_str("&pageToken=");
                url.push_str(&urlencoding::encode(token));
            }
            let response = self
                .send(&self.client, Method::GET, &url, None, None, "list_folder")
                .await?;
            let page: FileListPage = self.expect_json(response, "list_folder", &rel).await?;
            for file in &page.files {
                let child_rel = join_rel(&rel, &file.name);
                if file.is_folder() {
                    self.folder_cache
                        .write()
                        .await
                        .insert(child_rel.clone(), file.id.clone());
                }
                entries.push(self.to_metadata(file, &child_rel));
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn get_file_metadata(
        &self,
        path: &str,
    ) -> Result<Option<CloudFileMetadata>, CloudError> {
        let rel = normalize_rel(path);
        if rel.is_empty() {
            return match self.resolve_folder_id("", false).await? {
                Some(id) => Ok(Some(CloudFileMetadata {
                    id,
                    name: self
                        .settings
                        .app_root
                        .rsplit('/')
                        .find(|s| !s.is_empty())
                        .unwrap_or_default()
                        .to_string(),
                    rel_path: String::new(),
                    revision: String::new(),
                    size_bytes: 0,
                    modified_at_utc: 0.0,
                    is_folder: true,
                    is_deleted: false,
                })),
                None => Ok(None),
            };
        }
        match self.find_entry(&rel).await? {
            Some(file) => Ok(Some(self.to_metadata(&file, &rel))),
            None => Ok(None),
        }
    }

    async fn create_folder(&self, path: &str) -> Result<(), CloudError> {
        self.resolve_folder_id(path, true).await?;
        Ok(())
    }

    async fn ensure_app_root_exists(&self) -> Result<bool, CloudError> {
        self.resolve_folder_id("", true).await?;
        Ok(true)
    }

    async fn upload_bytes(
        &self,
        bytes: Vec<u8>,
        target_folder: &str,
        file_name: &str,
    ) -> Result<CloudFileMetadata, CloudError> {
        let rel = join_rel(target_folder, file_name);
        let folder_id = self
            .resolve_folder_id(target_folder, true)
            .await?
            .ok_or_else(|| CloudError::Other(format!("could not resolve '{}'", target_folder)))?;

        let file = match self.find_child(&folder_id, file_name).await? {
            Some(existing) => {
                // Replace content in place, keeping the file ID stable
                let url = format!(
                    "{}/files/{}?uploadType=media&fields={}",
                    self.upload_base,
                    existing.id,
                    urlencoding::encode(FILE_FIELDS),
                );
                let response = self
                    .send(
                        &self.upload_client,
                        Method::PATCH,
                        &url,
                        Some("application/octet-stream"),
                        Some(bytes),
                        "upload",
                    )
                    .await?;
                self.expect_json::<DriveFile>(response, "upload", &rel).await?
            }
            None => {
                let metadata = serde_json::json!({
                    "name": file_name,
                    "parents": [folder_id],
                });
                let body = Self::multipart_related_body(&metadata, &bytes);
                let url = format!(
                    "{}/files?uploadType=multipart&fields={}",
                    self.upload_base,
                    urlencoding::encode(FILE_FIELDS),
                );
                let content_type =
                    format!("multipart/related; boundary={}", MULTIPART_BOUNDARY);
                let response = self
                    .send(
                        &self.upload_client,
                        Method::POST,
                        &url,
                        Some(&content_type),
                        Some(body),
                        "upload",
                    )
                    .await?;
                self.expect_json::<DriveFile>(response, "upload", &rel).await?
            }
        };
        info!("Google Drive: uploaded '{}'", rel);
        Ok(self.to_metadata(&file, &rel))
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>, CloudError> {
        let rel = normalize_rel(path);
        let file = self
            .find_entry(&rel)
            .await?
            .ok_or_else(|| CloudError::NotFound(rel.clone()))?;
        let url = format!("{}/files/{}?alt=media", self.api_base, file.id);
        let response = self
            .send(&self.client, Method::GET, &url, None, None, "download")
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(CloudError::from_status("download", &rel, status, &text));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CloudError::from_http("download", e))?;
        info!("Google Drive: downloaded '{}' ({} bytes)", rel, bytes.len());
        Ok(bytes.to_vec())
    }

    async fn delete_file(&self, path: &str) -> Result<(), CloudError> {
        let rel = normalize_rel(path);
        let Some(file) = self.find_entry(&rel).await? else {
            // Idempotent: already gone is success
            return Ok(());
        };
        let url = format!("{}/files/{}", self.api_base, file.id);
        let response = self
            .send(&self.client, Method::DELETE, &url, None, None, "delete")
            .await?;
        if response.status().is_success() || response.status().as_u16() == 404 {
            info!("Google Drive: deleted '{}'", rel);
            return Ok(());
        }
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        Err(CloudError::from_status("delete", &rel, status, &text))
    }
}
