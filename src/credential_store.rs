//! Secure credential storage
//!
//! Opaque per-provider credential blobs keyed by (application, provider,
//! user), backed by the OS secret store. "No entry" is a normal,
//! non-error condition. The store never interprets the blob.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Key-value secret storage contract used by token sessions.
pub trait CredentialStore: Send + Sync {
    fn get(&self, provider: &str, user: &str) -> Result<Option<String>, CredentialError>;
    fn set(&self, provider: &str, user: &str, blob: &str) -> Result<(), CredentialError>;
    fn delete(&self, provider: &str, user: &str) -> Result<(), CredentialError>;
}

/// OS-keyring-backed store. Service name is `{app_id}_{provider}` so
/// different applications (and providers) never collide.
pub struct KeyringStore {
    app_id: String,
}

impl KeyringStore {
    pub fn new(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
        }
    }

    fn service_name(&self, provider: &str) -> String {
        format!("{}_{}", self.app_id, provider)
    }

    fn entry(&self, provider: &str, user: &str) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(&self.service_name(provider), user)
            .map_err(|e| CredentialError::Keyring(e.to_string()))
    }

    /// Probe whether the OS keyring is usable at all.
    pub fn is_available(app_id: &str) -> bool {
        let service = format!("{}_probe", app_id);
        let entry = match keyring::Entry::new(&service, "__probe__") {
            Ok(e) => e,
            Err(_) => return false,
        };
        matches!(entry.get_password(), Ok(_) | Err(keyring::Error::NoEntry))
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, provider: &str, user: &str) -> Result<Option<String>, CredentialError> {
        match self.entry(provider, user)?.get_password() {
            Ok(blob) => Ok(Some(blob)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CredentialError::Keyring(e.to_string())),
        }
    }

    fn set(&self, provider: &str, user: &str, blob: &str) -> Result<(), CredentialError> {
        self.entry(provider, user)?
            .set_password(blob)
            .map_err(|e| CredentialError::Keyring(e.to_string()))?;
        info!("credentials stored for {}/{}", provider, user);
        Ok(())
    }

    fn delete(&self, provider: &str, user: &str) -> Result<(), CredentialError> {
        match self.entry(provider, user)?.delete_credential() {
            Ok(()) => {
                info!("credentials deleted for {}/{}", provider, user);
                Ok(())
            }
            // Idempotent: deleting an absent entry is fine
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CredentialError::Keyring(e.to_string())),
        }
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, provider: &str, user: &str) -> Result<Option<String>, CredentialError> {
        let entries = self.entries.lock().expect("store lock poisoned");
        Ok(entries.get(&(provider.to_string(), user.to_string())).cloned())
    }

    fn set(&self, provider: &str, user: &str, blob: &str) -> Result<(), CredentialError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.insert((provider.to_string(), user.to_string()), blob.to_string());
        Ok(())
    }

    fn delete(&self, provider: &str, user: &str) -> Result<(), CredentialError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.remove(&(provider.to_string(), user.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("dropbox", "alice").unwrap(), None);
        store.set("dropbox", "alice", "{\"token\":\"x\"}").unwrap();
        assert_eq!(
            store.get("dropbox", "alice").unwrap().as_deref(),
            Some("{\"token\":\"x\"}")
        );
        store.delete("dropbox", "alice").unwrap();
        assert_eq!(store.get("dropbox", "alice").unwrap(), None);
    }

    #[test]
    fn test_memory_store_delete_absent_is_ok() {
        let store = MemoryStore::new();
        assert!(store.delete("dropbox", "nobody").is_ok());
    }

    #[test]
    fn test_keys_do_not_collide() {
        let store = MemoryStore::new();
        store.set("dropbox", "alice", "a").unwrap();
        store.set("dropbox", "bob", "b").unwrap();
        store.set("onedrive", "alice", "c").unwrap();
        assert_eq!(store.get("dropbox", "alice").unwrap().as_deref(), Some("a"));
        assert_eq!(store.get("dropbox", "bob").unwrap().as_deref(), Some("b"));
        assert_eq!(store.get("onedrive", "alice").unwrap().as_deref(), Some("c"));
    }
}
