//! Access-token lifecycle: proactive expiry checks, single-flight refresh and
//! the auth-error signal raised when the refresh token itself is rejected.

use crate::auth::CredentialStore;
use crate::config::OAuthConfig;
use crate::error::ApiError;
use crate::http::{HttpRequest, HttpTransport};
use crate::models::{CredentialRecord, TokenGrant};
use crate::store::IntegrationStore;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Notifications for observers of the credential state (driver, UI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    AuthError {
        user_id: Option<String>,
        message: String,
        at: DateTime<Utc>,
    },
    ReauthSuccess {
        user_id: Option<String>,
    },
}

/// Sending half of the auth event channel.
#[derive(Clone)]
pub struct AuthSignals {
    tx: mpsc::UnboundedSender<AuthEvent>,
}

impl AuthSignals {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AuthEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn auth_error(&self, user_id: Option<&str>, message: &str) {
        self.emit(AuthEvent::AuthError {
            user_id: user_id.map(str::to_string),
            message: message.to_string(),
            at: Utc::now(),
        });
    }

    pub fn reauth_success(&self, user_id: Option<&str>) {
        self.emit(AuthEvent::ReauthSuccess {
            user_id: user_id.map(str::to_string),
        });
    }

    fn emit(&self, event: AuthEvent) {
        if self.tx.send(event).is_err() {
            debug!("No listener for auth events");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
    /// The refresh token was rejected. Terminal for this manager.
    Failed,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

enum RefreshFailure {
    Revoked(String),
    Transient(ApiError),
}

/// Hands out access tokens for one mailbox client and renews them on demand.
///
/// Only one refresh runs at a time; callers that hit a 401 while a refresh is
/// in flight wait for it and reuse its result, including a transient failure.
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn HttpTransport>,
    oauth: OAuthConfig,
    signals: AuthSignals,
    user_id: Option<String>,
    integrations: Option<Arc<dyn IntegrationStore>>,
    current: RwLock<Option<CredentialRecord>>,
    flight: Mutex<()>,
    /// Completed exchanges, so waiters can tell one finished while they queued.
    attempts: AtomicU64,
    last_transient: std::sync::Mutex<Option<ApiError>>,
    state: std::sync::Mutex<RefreshState>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn HttpTransport>,
        oauth: OAuthConfig,
        signals: AuthSignals,
    ) -> Self {
        Self {
            store,
            transport,
            oauth,
            signals,
            user_id: None,
            integrations: None,
            current: RwLock::new(None),
            flight: Mutex::new(()),
            attempts: AtomicU64::new(0),
            last_transient: std::sync::Mutex::new(None),
            state: std::sync::Mutex::new(RefreshState::Idle),
        }
    }

    /// Refreshed tokens are also written to this user's integration record.
    pub fn for_user(mut self, user_id: &str, integrations: Arc<dyn IntegrationStore>) -> Self {
        self.user_id = Some(user_id.to_string());
        self.integrations = Some(integrations);
        self
    }

    pub fn state(&self) -> RefreshState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: RefreshState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn revoked_error(message: &str) -> ApiError {
        ApiError::Auth {
            message: message.to_string(),
            notified: true,
        }
    }

    /// Current access token, loading it from the store on first use and
    /// renewing it first when it is already past its expiry.
    pub async fn access_token(&self) -> Result<String, ApiError> {
        if self.state() == RefreshState::Failed {
            return Err(Self::revoked_error("mailbox credentials were revoked"));
        }

        let cached = self.current.read().await.clone();
        let record = match cached {
            Some(record) => record,
            None => {
                let loaded = self
                    .store
                    .load()
                    .await
                    .map_err(|e| ApiError::Other(format!("Failed to load credentials: {}", e)))?;
                let Some(record) = loaded else {
                    return Err(ApiError::auth("mailbox is not connected"));
                };
                *self.current.write().await = Some(record.clone());
                record
            }
        };

        if record.is_expired(Utc::now(), EXPIRY_SKEW_SECS) && record.is_renewable() {
            debug!("Stored access token expired, refreshing before use");
            return self.refresh(&record.access_token).await;
        }
        Ok(record.access_token)
    }

    /// Exchanges the refresh token for a new access token.
    ///
    /// `stale` is the token the caller saw rejected; if another caller has
    /// already replaced it, the replacement is returned without a new exchange.
    pub async fn refresh(&self, stale: &str) -> Result<String, ApiError> {
        let queued_at = self.attempts.load(Ordering::Acquire);
        let _flight = self.flight.lock().await;

        if self.state() == RefreshState::Failed {
            return Err(Self::revoked_error("mailbox credentials were revoked"));
        }

        if self.attempts.load(Ordering::Acquire) != queued_at {
            let shared = self
                .last_transient
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(err) = shared {
                debug!(error = %err, "Refresh finished while queued, sharing its failure");
                return Err(err);
            }
        }

        if let Some(current) = self.current.read().await.as_ref() {
            if current.access_token != stale && !current.is_expired(Utc::now(), EXPIRY_SKEW_SECS) {
                debug!("Token already refreshed by a concurrent caller");
                return Ok(current.access_token.clone());
            }
        }

        let record = self
            .store
            .load()
            .await
            .map_err(|e| ApiError::Other(format!("Failed to load credentials: {}", e)))?;
        let Some(refresh_token) = record
            .and_then(|r| r.refresh_token)
            .filter(|t| !t.is_empty())
        else {
            return Err(self.fail_terminal("stored credentials cannot be renewed").await);
        };

        self.set_state(RefreshState::Refreshing);
        let exchanged = self.exchange(&refresh_token).await;
        *self.last_transient.lock().unwrap_or_else(|e| e.into_inner()) = match &exchanged {
            Err(RefreshFailure::Transient(err)) => Some(err.clone()),
            _ => None,
        };
        self.attempts.fetch_add(1, Ordering::AcqRel);

        match exchanged {
            Ok(grant) => match self.commit(&grant, &refresh_token).await {
                Ok(token) => {
                    self.set_state(RefreshState::Idle);
                    info!("Access token refreshed");
                    Ok(token)
                }
                Err(e) => {
                    self.set_state(RefreshState::Idle);
                    Err(e)
                }
            },
            Err(RefreshFailure::Revoked(message)) => Err(self.fail_terminal(&message).await),
            Err(RefreshFailure::Transient(err)) => {
                warn!(error = %err, "Token refresh failed, credentials kept");
                self.set_state(RefreshState::Idle);
                Err(err)
            }
        }
    }

    async fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, RefreshFailure> {
        let request = HttpRequest::post(self.oauth.token_url.as_str()).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
        ]);

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| RefreshFailure::Transient(e.into()))?;

        if response.is_success() {
            return response.json::<TokenGrant>().map_err(RefreshFailure::Transient);
        }

        let body = response.text();
        let parsed: Option<OAuthErrorBody> = serde_json::from_str(&body).ok();
        let code = parsed.as_ref().and_then(|p| p.error.clone()).unwrap_or_default();
        let description = parsed
            .and_then(|p| p.error_description)
            .unwrap_or_else(|| body.clone());

        match response.status {
            _ if code == "invalid_grant" => Err(RefreshFailure::Revoked(format!(
                "refresh token rejected: {}",
                description
            ))),
            401 => Err(RefreshFailure::Revoked(format!("OAuth client rejected: {}", description))),
            status if status >= 500 || status == 429 => {
                Err(RefreshFailure::Transient(ApiError::Network { status: Some(status), body }))
            }
            status => Err(RefreshFailure::Transient(ApiError::Request { status, body })),
        }
    }

    async fn commit(&self, grant: &TokenGrant, refresh_token: &str) -> Result<String, ApiError> {
        let record = CredentialRecord::from_grant(grant, Some(refresh_token), Utc::now());
        self.store
            .save(&record.access_token, record.refresh_token.as_deref(), grant.expires_in)
            .await
            .map_err(|e| ApiError::Other(format!("Failed to save refreshed token: {}", e)))?;
        *self.current.write().await = Some(record.clone());

        if let (Some(user_id), Some(integrations)) = (&self.user_id, &self.integrations) {
            if let Err(e) = integrations
                .update_integration_token(
                    user_id,
                    &record.access_token,
                    record.refresh_token.as_deref(),
                    record.expires_at,
                )
                .await
            {
                warn!(error = %e, "Failed to propagate refreshed token to integration record");
            }
        }
        Ok(record.access_token)
    }

    async fn fail_terminal(&self, message: &str) -> ApiError {
        warn!(reason = message, "Refresh token unusable, clearing stored credentials");
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "Failed to clear credentials");
        }
        *self.current.write().await = None;
        self.set_state(RefreshState::Failed);
        self.signals.auth_error(self.user_id.as_deref(), message);
        Self::revoked_error(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;
    use crate::http::Method;
    use crate::testing::ScriptedTransport;
    use serde_json::json;

    const TOKEN_URL: &str = "https://oauth.test/token";

    fn oauth() -> OAuthConfig {
        OAuthConfig {
            token_url: TOKEN_URL.to_string(),
            client_id: "cid".into(),
            client_secret: "secret".into(),
            ..OAuthConfig::default()
        }
    }

    fn expired_record() -> CredentialRecord {
        CredentialRecord {
            access_token: "stale".into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: Utc::now().timestamp() - 10,
        }
    }

    fn manager(
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryCredentialStore>,
    ) -> (TokenManager, mpsc::UnboundedReceiver<AuthEvent>) {
        let (signals, rx) = AuthSignals::channel();
        (TokenManager::new(store, transport, oauth(), signals), rx)
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_exchange() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_always(
            Method::POST,
            TOKEN_URL,
            200,
            json!({"access_token": "fresh", "expires_in": 3600}),
        );
        let store = Arc::new(MemoryCredentialStore::with_record(expired_record()));
        let (manager, _rx) = manager(transport.clone(), store.clone());
        let manager = Arc::new(manager);

        let (a, b, c) = tokio::join!(
            manager.refresh("stale"),
            manager.refresh("stale"),
            manager.refresh("stale")
        );
        assert_eq!(a.unwrap(), "fresh");
        assert_eq!(b.unwrap(), "fresh");
        assert_eq!(c.unwrap(), "fresh");
        assert_eq!(transport.count(Method::POST, TOKEN_URL), 1);

        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "fresh");
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(manager.state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_before_first_use() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            Method::POST,
            TOKEN_URL,
            200,
            json!({"access_token": "fresh", "expires_in": 3600, "refresh_token": "refresh-2"}),
        );
        let store = Arc::new(MemoryCredentialStore::with_record(expired_record()));
        let (manager, _rx) = manager(transport.clone(), store.clone());

        assert_eq!(manager.access_token().await.unwrap(), "fresh");
        assert_eq!(manager.access_token().await.unwrap(), "fresh");
        assert_eq!(transport.count(Method::POST, TOKEN_URL), 1);
        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn invalid_grant_clears_credentials_and_signals() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            Method::POST,
            TOKEN_URL,
            400,
            json!({"error": "invalid_grant", "error_description": "Token has been expired or revoked."}),
        );
        let store = Arc::new(MemoryCredentialStore::with_record(expired_record()));
        let (manager, mut rx) = manager(transport.clone(), store.clone());

        let err = manager.refresh("stale").await.unwrap_err();
        assert!(matches!(err, ApiError::Auth { notified: true, .. }));
        assert!(store.load().await.unwrap().is_none());
        assert_eq!(manager.state(), RefreshState::Failed);
        assert!(matches!(rx.try_recv(), Ok(AuthEvent::AuthError { .. })));

        // Terminal: no further exchanges are attempted.
        assert!(manager.refresh("stale").await.unwrap_err().is_auth());
        assert!(manager.access_token().await.unwrap_err().is_auth());
        assert_eq!(transport.count(Method::POST, TOKEN_URL), 1);
    }

    #[tokio::test]
    async fn server_error_keeps_credentials() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(Method::POST, TOKEN_URL, 503, json!({"error": "backend"}));
        let store = Arc::new(MemoryCredentialStore::with_record(expired_record()));
        let (manager, mut rx) = manager(transport, store.clone());

        let err = manager.refresh("stale").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.status(), Some(503));
        assert!(store.load().await.unwrap().is_some());
        assert_eq!(manager.state(), RefreshState::Idle);
        assert!(rx.try_recv().is_err());
    }

    struct Delayed(Arc<ScriptedTransport>);

    #[async_trait::async_trait]
    impl HttpTransport for Delayed {
        async fn send(
            &self,
            request: HttpRequest,
        ) -> Result<crate::http::HttpResponse, crate::error::TransportError> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.0.send(request).await
        }
    }

    #[tokio::test]
    async fn queued_callers_share_a_transient_failure() {
        let scripted = Arc::new(ScriptedTransport::new());
        scripted.respond_always(Method::POST, TOKEN_URL, 503, json!({"error": "backend"}));
        let store = Arc::new(MemoryCredentialStore::with_record(expired_record()));
        let (signals, _rx) = AuthSignals::channel();
        let manager = TokenManager::new(store.clone(), Arc::new(Delayed(scripted.clone())), oauth(), signals);

        let (a, b, c) = tokio::join!(
            manager.refresh("stale"),
            manager.refresh("stale"),
            manager.refresh("stale")
        );
        for result in [a, b, c] {
            assert_eq!(result.unwrap_err().status(), Some(503));
        }
        assert_eq!(scripted.count(Method::POST, TOKEN_URL), 1);
        assert!(store.load().await.unwrap().is_some());

        // A later caller makes a fresh attempt.
        assert!(manager.refresh("stale").await.is_err());
        assert_eq!(scripted.count(Method::POST, TOKEN_URL), 2);
    }

    #[tokio::test]
    async fn missing_refresh_token_is_terminal() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryCredentialStore::with_record(CredentialRecord {
            refresh_token: None,
            ..expired_record()
        }));
        let (manager, mut rx) = manager(transport.clone(), store.clone());

        assert!(manager.refresh("stale").await.unwrap_err().is_auth());
        assert!(store.load().await.unwrap().is_none());
        assert!(matches!(rx.try_recv(), Ok(AuthEvent::AuthError { .. })));
        assert!(transport.calls().is_empty());
    }
}
