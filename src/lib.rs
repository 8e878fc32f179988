//! Cloud synchronization for a local folder of tracked files.
//!
//! Three cloud storage backends (Dropbox, Google Drive, OneDrive) behind
//! one [`CloudProvider`] contract, OAuth2 Authorization-Code + PKCE
//! token handling with OS-keyring persistence, and a last-write-wins
//! [`SyncEngine`] that reconciles a local directory with the provider's
//! application root folder.
//!
//! ```no_run
//! use std::sync::Arc;
//! use purse_sync::{
//!     create_provider, KeyringStore, ProviderKind, ProviderSettings, SyncEngine, SyncOptions,
//!     APP_ID,
//! };
//!
//! # async fn run() -> Result<(), purse_sync::CloudError> {
//! let settings = ProviderSettings::new(
//!     ProviderKind::Dropbox,
//!     "app-key",
//!     "http://127.0.0.1:53682/callback",
//!     "default",
//! );
//! let provider = create_provider(settings, Arc::new(KeyringStore::new(APP_ID)));
//! let engine = SyncEngine::new(provider, SyncOptions::new("/home/me/notes".as_ref()))?;
//! let outcome = engine.synchronize().await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod conflict_log;
pub mod credential_store;
pub mod providers;
pub mod scanner;
pub mod sync;

pub use conflict_log::{ConflictLog, CONFLICT_LOG_FILENAME};
pub use credential_store::{CredentialError, CredentialStore, KeyringStore, MemoryStore};
pub use providers::{
    create_provider, AuthState, CloudError, CloudFileMetadata, CloudProvider, CredentialRecord,
    DropboxProvider, GoogleDriveProvider, OneDriveProvider, ProviderKind, ProviderSettings,
    TokenSession,
};
pub use scanner::{LocalFileState, LocalScanner};
pub use sync::{SyncEngine, SyncOptions, SyncOutcome, SyncRunSummary};

/// Application identifier; prefixes keyring service names.
pub const APP_ID: &str = "com.christopherspenn.purse";
