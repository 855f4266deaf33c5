//! Mailbox API client with bounded retry and transparent token refresh.

use crate::category::LabelColor;
use crate::config::RetryConfig;
use crate::error::{ApiError, TransportError};
use crate::gmail::api;
use crate::http::{Connectivity, HttpRequest, HttpResponse, HttpTransport, Method};
use crate::models::Label;
use crate::refresh::TokenManager;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on draft pages walked when resolving a draft by id.
const MAX_DRAFT_PAGES: usize = 5;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            factor: config.factor.max(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * self.factor.saturating_pow(attempt.saturating_sub(1))
    }
}

pub struct MailboxClient {
    transport: Arc<dyn HttpTransport>,
    connectivity: Arc<dyn Connectivity>,
    tokens: Arc<TokenManager>,
    base_url: String,
    retry: RetryPolicy,
}

fn check_status(response: HttpResponse) -> Result<HttpResponse, ApiError> {
    match response.status {
        s if (200..300).contains(&s) => Ok(response),
        401 => Err(ApiError::auth("access token rejected")),
        s if (400..500).contains(&s) => Err(ApiError::Request {
            status: s,
            body: response.text(),
        }),
        s => Err(ApiError::Other(format!("unexpected status {}: {}", s, response.text()))),
    }
}

impl MailboxClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        connectivity: Arc<dyn Connectivity>,
        tokens: Arc<TokenManager>,
        base_url: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            connectivity,
            tokens,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        }
    }

    fn url(&self, path: &str, params: &[(&str, &str)]) -> Result<String, ApiError> {
        let base = format!("{}/{}", self.base_url, path);
        if params.is_empty() {
            return Ok(base);
        }
        url::Url::parse_with_params(&base, params)
            .map(|u| u.to_string())
            .map_err(|e| ApiError::Other(format!("Invalid request URL {}: {}", base, e)))
    }

    /// Runs one API call: offline short-circuit, retry on transient failures,
    /// and a single refresh-and-replay when the token is rejected.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        if !self.connectivity.is_online().await {
            return Err(ApiError::offline());
        }

        let token = self.tokens.access_token().await?;
        let response = self.send_with_retry(&request.with_bearer(&token)).await?;
        if response.status != 401 {
            return check_status(response);
        }

        debug!(url = %request.url, "Request unauthorized, refreshing access token");
        let fresh = self.tokens.refresh(&token).await?;
        let replayed = self.send_with_retry(&request.with_bearer(&fresh)).await?;
        if replayed.status == 401 {
            return Err(ApiError::auth("access token rejected after refresh"));
        }
        check_status(replayed)
    }

    async fn send_with_retry(&self, request: &HttpRequest) -> Result<HttpResponse, ApiError> {
        let mut attempt = 1;
        loop {
            let failure = match self.transport.send(request.clone()).await {
                Ok(response) if response.status < 500 => return Ok(response),
                Ok(response) => ApiError::Network {
                    status: Some(response.status),
                    body: response.text(),
                },
                Err(TransportError::Invalid(msg)) => return Err(ApiError::Other(msg)),
                Err(e) => e.into(),
            };

            if attempt >= self.retry.max_attempts {
                warn!(url = %request.url, attempts = attempt, error = %failure, "Mailbox request failed");
                return Err(failure);
            }
            let delay = self.retry.delay_for(attempt);
            debug!(url = %request.url, attempt, ?delay, error = %failure, "Retrying mailbox request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub async fn get_profile(&self) -> Result<api::Profile, ApiError> {
        let url = self.url("profile", &[])?;
        self.execute(HttpRequest::get(url)).await?.json()
    }

    /// Unread inbox message references, newest first, at most `max_results`.
    pub async fn list_unread(&self, max_results: u32) -> Result<Vec<api::MessageRef>, ApiError> {
        let max = max_results.clamp(1, 500).to_string();
        let url = self.url("messages", &[("q", "is:unread in:inbox"), ("maxResults", &max)])?;
        let list: api::ListMessagesResponse = self.execute(HttpRequest::get(url)).await?.json()?;
        Ok(list.messages.unwrap_or_default())
    }

    pub async fn get_message(&self, id: &str) -> Result<api::GmailMessage, ApiError> {
        let url = self.url(&format!("messages/{}", id), &[("format", "full")])?;
        self.execute(HttpRequest::get(url)).await?.json()
    }

    pub async fn get_thread(&self, id: &str) -> Result<api::Thread, ApiError> {
        let url = self.url(
            &format!("threads/{}", id),
            &[
                ("format", "metadata"),
                ("metadataHeaders", "Message-ID"),
                ("metadataHeaders", "References"),
            ],
        )?;
        self.execute(HttpRequest::get(url)).await?.json()
    }

    pub async fn list_labels(&self) -> Result<Vec<Label>, ApiError> {
        let url = self.url("labels", &[])?;
        let list: api::ListLabelsResponse = self.execute(HttpRequest::get(url)).await?.json()?;
        Ok(list
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(Label::from)
            .collect())
    }

    pub async fn create_label(&self, name: &str, color: Option<LabelColor>) -> Result<Label, ApiError> {
        let mut body = json!({
            "name": name,
            "labelListVisibility": "labelShow",
            "messageListVisibility": "show",
        });
        if let Some(color) = color {
            body["color"] = json!({
                "backgroundColor": color.background,
                "textColor": color.text,
            });
        }
        let url = self.url("labels", &[])?;
        let created: api::LabelResource = self
            .execute(HttpRequest::post(url).json(&body)?)
            .await?
            .json()?;
        Ok(created.into())
    }

    pub async fn modify_labels(&self, message_id: &str, add: &[&str], remove: &[&str]) -> Result<(), ApiError> {
        let url = self.url(&format!("messages/{}/modify", message_id), &[])?;
        let body = json!({ "addLabelIds": add, "removeLabelIds": remove });
        self.execute(HttpRequest::post(url).json(&body)?).await?;
        Ok(())
    }

    pub async fn apply_label(&self, message_id: &str, label_id: &str) -> Result<(), ApiError> {
        self.modify_labels(message_id, &[label_id], &[]).await
    }

    pub async fn mark_read(&self, message_id: &str) -> Result<(), ApiError> {
        self.modify_labels(message_id, &[], &["UNREAD"]).await
    }

    /// Creates a draft from a base64url RFC 5322 message, threaded when `thread_id` is set.
    pub async fn create_draft(&self, raw: &str, thread_id: Option<&str>) -> Result<api::Draft, ApiError> {
        let mut message = json!({ "raw": raw });
        if let Some(thread_id) = thread_id {
            message["threadId"] = json!(thread_id);
        }
        let url = self.url("drafts", &[])?;
        self.execute(HttpRequest::post(url).json(&json!({ "message": message }))?)
            .await?
            .json()
    }

    pub async fn send_draft(&self, draft_id: &str) -> Result<api::MessageRef, ApiError> {
        let url = self.url("drafts/send", &[])?;
        self.execute(HttpRequest::post(url).json(&json!({ "id": draft_id }))?)
            .await?
            .json()
    }

    pub async fn list_drafts(&self) -> Result<Vec<api::Draft>, ApiError> {
        let mut drafts = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_DRAFT_PAGES {
            let mut params = vec![("maxResults", "100")];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let url = self.url("drafts", &params)?;
            let page: api::ListDraftsResponse = self
                .execute(HttpRequest::new(Method::GET, url))
                .await?
                .json()?;
            drafts.extend(page.drafts.unwrap_or_default());
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(drafts)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::{CredentialStore, MemoryCredentialStore};
    use crate::config::OAuthConfig;
    use crate::models::CredentialRecord;
    use crate::refresh::{AuthEvent, AuthSignals};
    use crate::testing::ScriptedTransport;
    use crate::http::AlwaysOnline;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::mpsc;

    pub(crate) const API: &str = "https://gmail.test/gmail/v1/users/me";
    pub(crate) const TOKEN_URL: &str = "https://oauth.test/token";

    struct Offline;

    #[async_trait]
    impl Connectivity for Offline {
        async fn is_online(&self) -> bool {
            false
        }
    }

    pub(crate) fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            factor: 2,
        }
    }

    pub(crate) fn client_with(
        transport: Arc<ScriptedTransport>,
        connectivity: Arc<dyn Connectivity>,
    ) -> (MailboxClient, Arc<MemoryCredentialStore>, mpsc::UnboundedReceiver<AuthEvent>) {
        let store = Arc::new(MemoryCredentialStore::with_record(CredentialRecord {
            access_token: "valid".into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: Utc::now().timestamp() + 3600,
        }));
        let (signals, rx) = AuthSignals::channel();
        let oauth = OAuthConfig {
            token_url: TOKEN_URL.into(),
            ..OAuthConfig::default()
        };
        let tokens = Arc::new(TokenManager::new(store.clone(), transport.clone(), oauth, signals));
        let client = MailboxClient::new(transport, connectivity, tokens, API, fast_retry());
        (client, store, rx)
    }

    pub(crate) fn client(
        transport: Arc<ScriptedTransport>,
    ) -> (MailboxClient, Arc<MemoryCredentialStore>, mpsc::UnboundedReceiver<AuthEvent>) {
        client_with(transport, Arc::new(AlwaysOnline))
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn server_errors_are_retried_up_to_the_cap() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_always(Method::GET, "/labels", 503, json!({"error": "unavailable"}));
        let (client, _, _) = client(transport.clone());

        let err = client.list_labels().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.status(), Some(503));
        assert_eq!(transport.count(Method::GET, "/labels"), 3);
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail(Method::GET, "/labels", TransportError::Timeout);
        transport.respond(Method::GET, "/labels", 200, json!({"labels": [{"id": "L1", "name": "📦 Delivery"}]}));
        let (client, _, _) = client(transport.clone());

        let labels = client.list_labels().await.unwrap();
        assert_eq!(labels[0].id, "L1");
        assert_eq!(transport.count(Method::GET, "/labels"), 2);
    }

    #[tokio::test]
    async fn client_errors_fail_immediately() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_always(Method::GET, "/messages/gone", 404, json!({"error": "not found"}));
        let (client, _, _) = client(transport.clone());

        let err = client.get_message("gone").await.unwrap_err();
        assert!(matches!(err, ApiError::Request { status: 404, .. }));
        assert_eq!(transport.count(Method::GET, "/messages/gone"), 1);
    }

    #[tokio::test]
    async fn unauthorized_triggers_one_refresh_and_replay() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(Method::GET, "/labels", 401, json!({"error": "unauthorized"}));
        transport.respond(Method::GET, "/labels", 200, json!({"labels": []}));
        transport.respond(Method::POST, TOKEN_URL, 200, json!({"access_token": "fresh", "expires_in": 3600}));
        let (client, store, mut rx) = client(transport.clone());

        assert!(client.list_labels().await.unwrap().is_empty());
        assert_eq!(transport.count(Method::POST, TOKEN_URL), 1);
        let last = transport.calls().into_iter().last().unwrap();
        assert!(last.headers.iter().any(|(_, v)| v == "Bearer fresh"));
        assert_eq!(store.load().await.unwrap().unwrap().access_token, "fresh");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_refresh_surfaces_auth_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_always(Method::GET, "/labels", 401, json!({"error": "unauthorized"}));
        transport.respond(Method::POST, TOKEN_URL, 400, json!({"error": "invalid_grant"}));
        let (client, store, mut rx) = client(transport.clone());

        let err = client.list_labels().await.unwrap_err();
        assert!(err.is_auth());
        assert!(store.load().await.unwrap().is_none());
        assert!(matches!(rx.try_recv(), Ok(AuthEvent::AuthError { .. })));
        assert_eq!(transport.count(Method::GET, "/labels"), 1);
    }

    #[tokio::test]
    async fn second_unauthorized_after_refresh_is_not_refreshed_again() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_always(Method::GET, "/labels", 401, json!({"error": "unauthorized"}));
        transport.respond_always(Method::POST, TOKEN_URL, 200, json!({"access_token": "fresh", "expires_in": 3600}));
        let (client, _, _) = client(transport.clone());

        assert!(client.list_labels().await.unwrap_err().is_auth());
        assert_eq!(transport.count(Method::POST, TOKEN_URL), 1);
        assert_eq!(transport.count(Method::GET, "/labels"), 2);
    }

    #[tokio::test]
    async fn offline_short_circuits_without_calls() {
        let transport = Arc::new(ScriptedTransport::new());
        let (client, _, _) = client_with(transport.clone(), Arc::new(Offline));

        let err = client.list_unread(10).await.unwrap_err();
        assert!(matches!(err, ApiError::Network { status: None, .. }));
        assert!(transport.calls().is_empty());
    }
}
