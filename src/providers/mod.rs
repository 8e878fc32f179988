//! Cloud storage providers
//!
//! One identical contract regardless of backend quirks: path-addressable
//! (Dropbox, OneDrive) and ID-addressable (Google Drive) filesystems are
//! normalized behind the `CloudProvider` trait. All path arguments are
//! relative to the provider's configured application root folder; `""`
//! denotes that root itself.

pub mod dropbox;
pub mod google_drive;
pub mod http_retry;
pub mod oauth2;
pub mod onedrive;
pub mod types;

pub use dropbox::DropboxProvider;
pub use google_drive::GoogleDriveProvider;
pub use oauth2::{AuthState, CredentialRecord, OAuthConfig, TokenSession};
pub use onedrive::OneDriveProvider;
pub use types::{
    join_rel, normalize_rel, parent_rel, CloudError, CloudFileMetadata, ProviderKind,
    ProviderSettings,
};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use crate::credential_store::CredentialStore;

/// Unified cloud storage contract.
///
/// Implementations own exactly one live credential session and must be
/// its sole mutator. Every state-reading or state-mutating call obtains
/// its bearer token through that session, which refreshes silently when
/// near expiry.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn display_name(&self) -> String {
        self.kind().to_string()
    }

    /// Build the OAuth2 Authorization-Code+PKCE URL. Returns the URL and
    /// the code verifier the caller must retain until code exchange.
    async fn authenticate_url(&self, state: &str) -> Result<(String, String), CloudError>;

    /// Complete the OAuth2 flow; the result is persisted to the
    /// credential store before being returned.
    async fn exchange_code_for_token(
        &self,
        code: &str,
        verifier: &str,
    ) -> Result<CredentialRecord, CloudError>;

    /// Attempt one silent refresh. `Ok(None)` means the refresh grant was
    /// permanently rejected (stored credentials have been purged) or no
    /// refresh mechanism exists; callers must stop retrying that session.
    async fn refresh_access_token(&self) -> Result<Option<String>, CloudError>;

    async fn auth_state(&self) -> AuthState;

    /// List a folder. Pagination is fully drained by the implementation.
    /// Recursive listing is a depth-first expansion built from repeated
    /// non-recursive calls, never an API-native recursive mode.
    async fn list_folder(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<CloudFileMetadata>, CloudError>;

    /// `Ok(None)` when the path does not exist; errors only for actual
    /// API failures.
    async fn get_file_metadata(&self, path: &str)
        -> Result<Option<CloudFileMetadata>, CloudError>;

    /// Create a folder, including missing intermediate segments one at a
    /// time. "Already exists as folder" is success; "exists as file" is
    /// `CloudError::Conflict`.
    async fn create_folder(&self, path: &str) -> Result<(), CloudError>;

    /// Idempotently create the full configured app root path. A root of
    /// `/` (the provider's true root) always exists.
    async fn ensure_app_root_exists(&self) -> Result<bool, CloudError>;

    /// Upload with strict overwrite semantics (replace-on-conflict).
    async fn upload_bytes(
        &self,
        bytes: Vec<u8>,
        target_folder: &str,
        file_name: &str,
    ) -> Result<CloudFileMetadata, CloudError>;

    /// Upload a local file; composition over [`upload_bytes`].
    async fn upload_file(
        &self,
        local_path: &Path,
        target_folder: &str,
        file_name: &str,
    ) -> Result<CloudFileMetadata, CloudError> {
        let bytes = tokio::fs::read(local_path).await?;
        self.upload_bytes(bytes, target_folder, file_name).await
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>, CloudError>;

    /// Download to a local path, creating parent directories as needed.
    async fn download_file_to(&self, path: &str, target: &Path) -> Result<(), CloudError> {
        let bytes = self.download_file(path).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, &bytes).await?;
        Ok(())
    }

    /// Idempotent delete: an already-absent path is success.
    async fn delete_file(&self, path: &str) -> Result<(), CloudError>;
}

/// Depth-first recursive expansion composed from non-recursive listings.
///
/// Backends call this from `list_folder(_, recursive=true)`; it only ever
/// issues `recursive=false` calls back into the provider.
pub async fn list_folder_recursive(
    provider: &dyn CloudProvider,
    path: &str,
) -> Result<Vec<CloudFileMetadata>, CloudError> {
    let mut entries = Vec::new();
    let mut pending = VecDeque::new();
    pending.push_back(normalize_rel(path));

    while let Some(folder) = pending.pop_front() {
        for entry in provider.list_folder(&folder, false).await? {
            if entry.is_folder && !entry.is_deleted {
                pending.push_back(entry.rel_path.clone());
            }
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Create a provider instance for the configured backend.
pub fn create_provider(
    settings: ProviderSettings,
    store: Arc<dyn CredentialStore>,
) -> Arc<dyn CloudProvider> {
    match settings.kind {
        ProviderKind::Dropbox => Arc::new(DropboxProvider::new(settings, store)),
        ProviderKind::GoogleDrive => Arc::new(GoogleDriveProvider::new(settings, store)),
        ProviderKind::OneDrive => Arc::new(OneDriveProvider::new(settings, store)),
    }
}
