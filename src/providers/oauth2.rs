//! OAuth2 token lifecycle
//!
//! Authorization-Code + PKCE flow for the cloud backends, plus the
//! `TokenSession` that owns the live credential for one provider
//! instance. The session is the single source of truth for the current
//! bearer token: providers never hold a token string themselves, they
//! ask the session per request.

use oauth2::basic::{BasicClient, BasicErrorResponseType};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    HttpClientError, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken,
    RequestTokenError, Scope, StandardErrorResponse, TokenResponse, TokenUrl,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::credential_store::CredentialStore;

use super::types::{CloudError, ProviderKind};

/// Configured OAuth2 client with auth and token endpoints set (v5 typestates)
type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

type TokenRequestError =
    RequestTokenError<HttpClientError<reqwest::Error>, StandardErrorResponse<BasicErrorResponseType>>;

/// Early-expiry margin: treat tokens this close to expiry as expired.
const EXPIRY_MARGIN_SECS: i64 = 300;

/// OAuth2 endpoint configuration for one provider
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub provider: ProviderKind,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    /// Extra query parameters for the authorization URL
    /// (e.g. token_access_type=offline for Dropbox)
    pub extra_auth_params: Vec<(String, String)>,
}

impl OAuthConfig {
    pub fn dropbox(client_id: &str, client_secret: Option<&str>, redirect_uri: &str) -> Self {
        Self {
            provider: ProviderKind::Dropbox,
            client_id: client_id.to_string(),
            client_secret: client_secret.map(str::to_string),
            auth_url: "https://www.dropbox.com/oauth2/authorize".to_string(),
            token_url: "https://api.dropboxapi.com/oauth2/token".to_string(),
            scopes: vec![
                "account_info.read".to_string(),
                "files.metadata.read".to_string(),
                "files.metadata.write".to_string(),
                "files.content.read".to_string(),
                "files.content.write".to_string(),
            ],
            redirect_uri: redirect_uri.to_string(),
            extra_auth_params: vec![("token_access_type".to_string(), "offline".to_string())],
        }
    }

    pub fn google(client_id: &str, client_secret: Option<&str>, redirect_uri: &str) -> Self {
        Self {
            provider: ProviderKind::GoogleDrive,
            client_id: client_id.to_string(),
            client_secret: client_secret.map(str::to_string),
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scopes: vec!["https://www.googleapis.com/auth/drive.file".to_string()],
            redirect_uri: redirect_uri.to_string(),
            extra_auth_params: vec![
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
        }
    }

    pub fn onedrive(client_id: &str, client_secret: Option<&str>, redirect_uri: &str) -> Self {
        Self {
            provider: ProviderKind::OneDrive,
            client_id: client_id.to_string(),
            client_secret: client_secret.map(str::to_string),
            auth_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize".to_string(),
            token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string(),
            scopes: vec![
                "Files.ReadWrite".to_string(),
                "offline_access".to_string(),
            ],
            redirect_uri: redirect_uri.to_string(),
            extra_auth_params: vec![],
        }
    }
}

/// Normalized token material persisted to the credential store.
///
/// Some providers rotate the refresh token on every grant; `refresh_token`
/// always holds the latest one we were handed.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp; None means the provider reported no expiry.
    pub expires_at_utc: Option<i64>,
    pub account_id: Option<String>,
}

impl CredentialRecord {
    /// Expired or close enough to expiry that a refresh is due.
    pub fn is_expired(&self) -> bool {
        match self.expires_at_utc {
            Some(expires_at) => expires_at <= chrono::Utc::now().timestamp() + EXPIRY_MARGIN_SECS,
            None => false,
        }
    }
}

// Token material never appears in logs.
impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("access_token", &"***")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("expires_at_utc", &self.expires_at_utc)
            .field("account_id", &self.account_id)
            .finish()
    }
}

/// Which credential parts are currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthState {
    pub has_access_token: bool,
    pub has_refresh_token: bool,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        self.has_access_token || self.has_refresh_token
    }
}

/// Live credential/session object for one provider instance.
///
/// Exactly one session exists per provider instance and it is the sole
/// mutator of the stored credential. Refresh is serialized behind a
/// mutex so a provider never issues two concurrent refreshes.
pub struct TokenSession {
    config: OAuthConfig,
    store: Arc<dyn CredentialStore>,
    user: String,
    current: RwLock<Option<CredentialRecord>>,
    refresh_gate: Mutex<()>,
    http: reqwest::Client,
}

impl TokenSession {
    /// Create a session, loading any previously persisted credential.
    pub fn new(config: OAuthConfig, store: Arc<dyn CredentialStore>, user: &str) -> Self {
        let loaded = store
            .get(config.provider.key(), user)
            .ok()
            .flatten()
            .and_then(|blob| serde_json::from_str::<CredentialRecord>(&blob).ok());
        if loaded.is_some() {
            info!("{}: credential loaded from store for '{}'", config.provider, user);
        }
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            config,
            store,
            user: user.to_string(),
            current: RwLock::new(loaded),
            refresh_gate: Mutex::new(()),
            http,
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.config.provider
    }

    /// Build the authorization URL for the PKCE flow. Returns the URL and
    /// the code verifier the caller must retain until code exchange.
    pub fn authorize_url(&self, state: &str) -> Result<(String, String), CloudError> {
        let client = self.configured_client()?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let state = state.to_string();

        let mut builder = client
            .authorize_url(move || CsrfToken::new(state))
            .set_pkce_challenge(pkce_challenge);
        for scope in &self.config.scopes {
            builder = builder.add_scope(Scope::new(scope.clone()));
        }
        for (key, value) in &self.config.extra_auth_params {
            builder = builder.add_extra_param(key, value);
        }
        let (url, _csrf) = builder.url();

        info!("{}: authorization URL generated", self.config.provider);
        Ok((url.to_string(), pkce_verifier.secret().clone()))
    }

    /// Complete the flow: exchange the authorization code, persist the
    /// result, and return the normalized record.
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
    ) -> Result<CredentialRecord, CloudError> {
        let client = self.configured_client()?;
        let token = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(verifier.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| CloudError::Auth(format!("token exchange failed: {}", e)))?;

        let record = CredentialRecord {
            access_token: token.access_token().secret().clone(),
            refresh_token: token.refresh_token().map(|t| t.secret().clone()),
            expires_at_utc: token
                .expires_in()
                .map(|d| chrono::Utc::now().timestamp() + d.as_secs() as i64),
            account_id: None,
        };
        self.persist(&record)?;
        *self.current.write().await = Some(record.clone());
        info!("{}: tokens obtained for '{}'", self.config.provider, self.user);
        Ok(record)
    }

    /// Attempt one silent refresh.
    ///
    /// Returns the new access token on success. Returns `Ok(None)` when
    /// no refresh mechanism exists or when the refresh grant was
    /// permanently rejected; in the rejection case the stored credential
    /// is deleted so callers stop retrying that session. Transient
    /// network failures do not touch stored state.
    pub async fn refresh(&self) -> Result<Option<String>, CloudError> {
        let _gate = self.refresh_gate.lock().await;

        // A racing call may have refreshed while we waited for the gate.
        let refresh_token = {
            let current = self.current.read().await;
            match current.as_ref() {
                Some(rec) if !rec.is_expired() && !rec.access_token.is_empty() => {
                    return Ok(Some(rec.access_token.clone()));
                }
                Some(rec) => rec.refresh_token.clone(),
                None => None,
            }
        };
        let Some(refresh_token) = refresh_token else {
            return Ok(None);
        };

        let client = self.configured_client()?;
        match client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .request_async(&self.http)
            .await
        {
            Ok(token) => {
                let previous_account = {
                    let current = self.current.read().await;
                    current.as_ref().and_then(|r| r.account_id.clone())
                };
                let record = CredentialRecord {
                    access_token: token.access_token().secret().clone(),
                    refresh_token: token
                        .refresh_token()
                        .map(|t| t.secret().clone())
                        .or(Some(refresh_token)),
                    expires_at_utc: token
                        .expires_in()
                        .map(|d| chrono::Utc::now().timestamp() + d.as_secs() as i64),
                    account_id: previous_account,
                };
                // Persist before the triggering call proceeds
                self.persist(&record)?;
                let access = record.access_token.clone();
                *self.current.write().await = Some(record);
                info!("{}: access token refreshed", self.config.provider);
                Ok(Some(access))
            }
            Err(err) if is_permanent_rejection(&err) => {
                warn!(
                    "{}: refresh grant rejected ({}); purging stored credentials",
                    self.config.provider, err
                );
                self.purge().await;
                Ok(None)
            }
            Err(RequestTokenError::Request(e)) => {
                Err(CloudError::Transient(format!("token refresh: {}", e)))
            }
            Err(RequestTokenError::Parse(e, _)) => {
                Err(CloudError::Transient(format!("token refresh: {}", e)))
            }
            Err(e) => Err(CloudError::Auth(format!("token refresh failed: {}", e))),
        }
    }

    /// Current valid bearer token, refreshing once if near expiry.
    pub async fn bearer(&self) -> Result<SecretString, CloudError> {
        {
            let current = self.current.read().await;
            match current.as_ref() {
                Some(rec) if !rec.is_expired() => {
                    return Ok(SecretString::from(rec.access_token.clone()));
                }
                Some(_) => {}
                None => return Err(CloudError::Auth("not authenticated".to_string())),
            }
        }
        match self.refresh().await? {
            Some(token) => Ok(SecretString::from(token)),
            None => Err(CloudError::Auth(
                "authentication required (stored credentials rejected)".to_string(),
            )),
        }
    }

    pub async fn auth_state(&self) -> AuthState {
        let current = self.current.read().await;
        match current.as_ref() {
            Some(rec) => AuthState {
                has_access_token: !rec.access_token.is_empty(),
                has_refresh_token: rec.refresh_token.is_some(),
            },
            None => AuthState {
                has_access_token: false,
                has_refresh_token: false,
            },
        }
    }

    /// Record a provider-native account id against the stored credential.
    pub async fn set_account_id(&self, account_id: &str) -> Result<(), CloudError> {
        let mut current = self.current.write().await;
        if let Some(rec) = current.as_mut() {
            rec.account_id = Some(account_id.to_string());
            self.persist(rec)?;
        }
        Ok(())
    }

    /// Explicit logout: delete stored and in-memory credentials.
    pub async fn logout(&self) -> Result<(), CloudError> {
        self.purge().await;
        Ok(())
    }

    async fn purge(&self) {
        if let Err(e) = self.store.delete(self.config.provider.key(), &self.user) {
            warn!("{}: could not delete stored credentials: {}", self.config.provider, e);
        }
        *self.current.write().await = None;
    }

    fn persist(&self, record: &CredentialRecord) -> Result<(), CloudError> {
        let blob = serde_json::to_string(record)
            .map_err(|e| CloudError::Parse(format!("credential serialization: {}", e)))?;
        self.store
            .set(self.config.provider.key(), &self.user, &blob)
            .map_err(|e| CloudError::Other(format!("credential store: {}", e)))
    }

    fn configured_client(&self) -> Result<ConfiguredClient, CloudError> {
        if self.config.client_id.trim().is_empty() {
            return Err(CloudError::Configuration(format!(
                "{}: OAuth client id is not configured",
                self.config.provider
            )));
        }
        let auth_url = AuthUrl::new(self.config.auth_url.clone())
            .map_err(|e| CloudError::Configuration(format!("invalid auth URL: {}", e)))?;
        let token_url = TokenUrl::new(self.config.token_url.clone())
            .map_err(|e| CloudError::Configuration(format!("invalid token URL: {}", e)))?;
        let redirect_url = RedirectUrl::new(self.config.redirect_uri.clone())
            .map_err(|e| CloudError::Configuration(format!("invalid redirect URL: {}", e)))?;

        let mut client = BasicClient::new(ClientId::new(self.config.client_id.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url);
        if let Some(ref secret) = self.config.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret.clone()));
        }
        Ok(client)
    }
}

/// A refresh-grant rejection that will never succeed on retry
/// (revoked/expired refresh token, re-consent required).
fn is_permanent_rejection(err: &TokenRequestError) -> bool {
    match err {
        RequestTokenError::ServerResponse(resp) => {
            if matches!(resp.error(), BasicErrorResponseType::InvalidGrant) {
                return true;
            }
            let description = resp
                .error_description()
                .map(|d| d.to_lowercase())
                .unwrap_or_default();
            description.contains("invalid_grant")
                || description.contains("interaction_required")
                || description.contains("aadsts700082")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_store::MemoryStore;

    fn record(expires_in: Option<i64>) -> CredentialRecord {
        CredentialRecord {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_at_utc: expires_in.map(|d| chrono::Utc::now().timestamp() + d),
            account_id: None,
        }
    }

    #[test]
    fn test_expiry_margin() {
        assert!(!record(None).is_expired());
        assert!(!record(Some(3600)).is_expired());
        // Inside the 300s margin counts as expired
        assert!(record(Some(60)).is_expired());
        assert!(record(Some(-10)).is_expired());
    }

    #[test]
    fn test_debug_masks_tokens() {
        let dbg = format!("{:?}", record(Some(3600)));
        assert!(!dbg.contains("at"));
        assert!(!dbg.contains("rt"));
        assert!(dbg.contains("***"));
    }

    #[tokio::test]
    async fn test_session_loads_persisted_record() {
        let store = Arc::new(MemoryStore::new());
        let blob = serde_json::to_string(&record(Some(3600))).unwrap();
        store.set("dropbox", "alice", &blob).unwrap();

        let config = OAuthConfig::dropbox("client", None, "http://127.0.0.1/cb");
        let session = TokenSession::new(config, store, "alice");
        let state = session.auth_state().await;
        assert!(state.has_access_token);
        assert!(state.has_refresh_token);
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_is_none() {
        let store = Arc::new(MemoryStore::new());
        let mut rec = record(Some(-10));
        rec.refresh_token = None;
        store
            .set("dropbox", "alice", &serde_json::to_string(&rec).unwrap())
            .unwrap();

        let config = OAuthConfig::dropbox("client", None, "http://127.0.0.1/cb");
        let session = TokenSession::new(config, store, "alice");
        assert!(session.refresh().await.unwrap().is_none());
    }

    #[test]
    fn test_authorize_url_requires_client_id() {
        let store = Arc::new(MemoryStore::new());
        let config = OAuthConfig::dropbox("", None, "http://127.0.0.1/cb");
        let session = TokenSession::new(config, store, "alice");
        assert!(matches!(
            session.authorize_url("state"),
            Err(CloudError::Configuration(_))
        ));
    }

    #[test]
    fn test_authorize_url_carries_pkce_and_offline_access() {
        let store = Arc::new(MemoryStore::new());
        let config = OAuthConfig::dropbox("client", None, "http://127.0.0.1/cb");
        let session = TokenSession::new(config, store, "alice");
        let (url, verifier) = session.authorize_url("xyzzy").unwrap();
        assert!(url.contains("code_challenge="));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("state=xyzzy"));
        assert!(url.contains("token_access_type=offline"));
        assert!(!verifier.is_empty());
    }
}
