//! OneDrive backend
//!
//! Path-addressable implementation over the Microsoft Graph drive API,
//! using the `root:/path:` addressing form with URL-encoded segments.
//! Uploads request `@microsoft.graph.conflictBehavior=replace`; folder
//! creation requests `fail` and resolves the resulting 409 by checking
//! what actually occupies the path.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
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

const API_BASE: &str = "https://graph.microsoft.com/v1.0";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    name: String,
    #[serde(default)]
    size: u64,
    last_modified_date_time: Option<String>,
    e_tag: Option<String>,
    folder: Option<serde_json::Value>,
    #[serde(default)]
    deleted: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChildrenPage {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// OneDrive implementation of the provider contract.
pub struct OneDriveProvider {
    settings: ProviderSettings,
    session: TokenSession,
    client: reqwest::Client,
    upload_client: reqwest::Client,
    retry: RetryPolicy,
    api_base: String,
}

impl OneDriveProvider {
    pub fn new(settings: ProviderSettings, store: Arc<dyn CredentialStore>) -> Self {
        let config = OAuthConfig::onedrive(
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
        }
    }

    /// Point the provider at an alternate endpoint (tests).
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// Absolute drive path (app root + rel), no leading or trailing `/`.
    /// Empty means the drive root itself.
    fn abs_path(&self, rel: &str) -> String {
        let root = normalize_rel(&self.settings.app_root);
        join_rel(&root, &normalize_rel(rel))
            .trim_matches('/')
            .to_string()
    }

    fn encode_path(path: &str) -> String {
        path.split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Graph URL addressing one item, with an optional `:/suffix` such as
    /// `children` or `content`.
    fn item_url(&self, abs_path: &str, suffix: Option<&str>) -> String {
        let encoded = Self::encode_path(abs_path);
        match (encoded.is_empty(), suffix) {
            (true, None) => format!("{}/me/drive/root", self.api_base),
            (true, Some(s)) => format!("{}/me/drive/root/{}", self.api_base, s),
            (false, None) => format!("{}/me/drive/root:/{}", self.api_base, encoded),
            (false, Some(s)) => format!("{}/me/drive/root:/{}:/{}", self.api_base, encoded, s),
        }
    }

    fn rel_from_abs(&self, abs: &str) -> String {
        let root = normalize_rel(&self.settings.app_root);
        if root.is_empty() {
            return normalize_rel(abs);
        }
        let abs = normalize_rel(abs);
        match strip_prefix_ignore_case(&abs, &root) {
            Some(rest) => normalize_rel(rest),
            None => abs,
        }
    }

    fn to_metadata(&self, item: &DriveItem, rel_path: &str) -> CloudFileMetadata {
        CloudFileMetadata {
            id: item.id.clone(),
            name: item.name.clone(),
            rel_path: rel_path.to_string(),
            revision: item.e_tag.clone().unwrap_or_default(),
            size_bytes: item.size,
            modified_at_utc: item
                .last_modified_date_time
                .as_deref()
                .and_then(parse_rfc3339_utc)
                .unwrap_or(0.0),
            is_folder: item.folder.is_some(),
            is_deleted: item.deleted.is_some(),
        }
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

    async fn item_at(&self, abs_path: &str) -> Result<Option<DriveItem>, CloudError> {
        let url = self.item_url(abs_path, None);
        let response = self
            .send(&self.client, Method::GET, &url, None, None, "get_metadata")
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        self.expect_json(response, "get_metadata", abs_path)
            .await
            .map(Some)
    }

    /// Create one folder named `name` inside `parent_abs`. An existing
    /// folder is success; an existing file is a conflict.
    async fn mkdir_one(&self, parent_abs: &str, name: &str) -> Result<(), CloudError> {
        let url = self.item_url(parent_abs, Some("children"));
        let body = serde_json::json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });
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
        if response.status().is_success() {
            info!("OneDrive: created folder '{}/{}'", parent_abs, name);
            return Ok(());
        }
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        if status == 409 {
            let child_abs = join_rel(parent_abs, name);
            if let Some(existing) = self.item_at(&child_abs).await? {
                if existing.folder.is_some() {
                    return Ok(());
                }
                return Err(CloudError::Conflict(format!(
                    "'{}' exists and is not a folder",
                    child_abs
                )));
            }
        }
        Err(CloudError::from_status("create_folder", name, status, &text))
    }

    /// Create every missing segment of an absolute path, one at a time.
    async fn mkdir_segments(&self, abs_path: &str) -> Result<(), CloudError> {
        let mut current = String::new();
        for segment in abs_path.split('/').filter(|s| !s.is_empty()) {
            self.mkdir_one(&current, segment).await?;
            current = join_rel(&current, segment);
        }
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for OneDriveProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OneDrive
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
        let abs = self.abs_path(&rel);
        let mut url = self.item_url(&abs, Some("children"));
        let mut entries = Vec::new();
        loop {
            let response = self
                .send(&self.client, Method::GET, &url, None, None, "list_folder")
                .await?;
            let page: ChildrenPage = self.expect_json(response, "list_folder", &rel).await?;
            for item in &page.value {
                let child_rel = join_rel(&rel, &item.name);
                entries.push(self.to_metadata(item, &child_rel));
            }
            match page.next_link {
                Some(next) => url = next,
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
        let abs = self.abs_path(&rel);
        match self.item_at(&abs).await? {
            Some(item) => {
                let rel = self.rel_from_abs(&abs);
                Ok(Some(self.to_metadata(&item, &rel)))
            }
            None => Ok(None),
        }
    }

    async fn create_folder(&self, path: &str) -> Result<(), CloudError> {
        let rel = normalize_rel(path);
        if rel.is_empty() {
            return Ok(());
        }
        let root = normalize_rel(&self.settings.app_root);
        let mut current = root;
        for segment in rel.split('/') {
            self.mkdir_one(&current, segment).await?;
            current = join_rel(&current, segment);
        }
        Ok(())
    }

    async fn ensure_app_root_exists(&self) -> Result<bool, CloudError> {
        let root = normalize_rel(&self.settings.app_root);
        if root.is_empty() {
            info!("OneDrive: app root is the drive root, assuming it exists");
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
        let abs = self.abs_path(&rel);
        let url = format!(
            "{}?@microsoft.graph.conflictBehavior=replace",
            self.item_url(&abs, Some("content"))
        );
        let response = self
            .send(
                &self.upload_client,
                Method::PUT,
                &url,
                Some("application/octet-stream"),
                Some(bytes),
                "upload",
            )
            .await?;
        let item: DriveItem = self.expect_json(response, "upload", &rel).await?;
        info!("OneDrive: uploaded '{}'", rel);
        Ok(self.to_metadata(&item, &rel))
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>, CloudError> {
        let rel = normalize_rel(path);
        let abs = self.abs_path(&rel);
        let url = self.item_url(&abs, Some("content"));
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
        info!("OneDrive: downloaded '{}' ({} bytes)", rel, bytes.len());
        Ok(bytes.to_vec())
    }

    async fn delete_file(&self, path: &str) -> Result<(), CloudError> {
        let rel = normalize_rel(path);
        let abs = self.abs_path(&rel);
        let url = self.item_url(&abs, None);
        let response = self
            .send(&self.client, Method::DELETE, &url, None, None, "delete")
            .await?;
        // Idempotent: already gone is success
        if response.status().is_success() || response.status().as_u16() == 404 {
            info!("OneDrive: deleted '{}'", rel);
            return Ok(());
        }
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        Err(CloudError::from_status("delete", &rel, status, &text))
    }
}
