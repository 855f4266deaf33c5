//! Classification and draft-generation collaborators.
//!
//! Both are best effort: transport failures, timeouts and unreadable payloads
//! degrade to the default category or a canned reply instead of erroring.

use crate::category::Category;
use crate::config::ServicesConfig;
use crate::http::{HttpRequest, HttpTransport};
use crate::models::ShopContext;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, subject: &str, body: &str) -> Category;
}

#[derive(Debug, Clone)]
pub struct DraftRequest<'a> {
    pub subject: &'a str,
    pub body: &'a str,
    pub category: Category,
    pub sender: &'a str,
    pub signature: Option<&'a str>,
    pub email_address: Option<&'a str>,
    pub shop: Option<&'a ShopContext>,
}

#[async_trait]
pub trait DraftGenerator: Send + Sync {
    async fn generate(&self, request: &DraftRequest<'_>) -> String;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DraftPayload<'a> {
    subject: &'a str,
    body: &'a str,
    category: &'a str,
    sender: &'a str,
    signature: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email_address: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shop_domain: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shop_access_token: Option<&'a str>,
}

/// First non-empty string among `keys` in a JSON object.
fn pick_text(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

async fn post_json(
    transport: &dyn HttpTransport,
    endpoint: &str,
    payload: &impl Serialize,
    timeout: Duration,
) -> Option<Value> {
    let request = HttpRequest::post(endpoint).json(payload).ok()?;
    let response = match tokio::time::timeout(timeout, transport.send(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(endpoint, error = %e, "Service request failed");
            return None;
        }
        Err(_) => {
            warn!(endpoint, ?timeout, "Service request timed out");
            return None;
        }
    };
    if !response.is_success() {
        warn!(endpoint, status = response.status, "Service returned an error");
        return None;
    }
    response.json::<Value>().ok()
}

pub struct HttpClassifier {
    transport: Arc<dyn HttpTransport>,
    endpoint: String,
    timeout: Duration,
}

impl HttpClassifier {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &ServicesConfig) -> Self {
        Self {
            transport,
            endpoint: config.classify_endpoint.clone(),
            timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, subject: &str, body: &str) -> Category {
        if self.endpoint.is_empty() {
            debug!("No classification endpoint configured");
            return Category::Other;
        }
        let payload = serde_json::json!({ "subject": subject, "body": body });
        let raw = post_json(self.transport.as_ref(), &self.endpoint, &payload, self.timeout)
            .await
            .and_then(|v| pick_text(&v, &["category", "output"]));
        match raw {
            Some(raw) => Category::normalize(&raw),
            None => Category::Other,
        }
    }
}

/// Reply used when the generator is unreachable or returns nothing usable.
pub fn fallback_reply(language: &str, signature: Option<&str>) -> String {
    let mut reply = if language.eq_ignore_ascii_case("fr") {
        "Bonjour,\n\nMerci pour votre message. Nous avons bien reçu votre demande \
         et reviendrons vers vous dans les plus brefs délais.\n\nCordialement"
            .to_string()
    } else {
        "Hello,\n\nThank you for your message. We have received your request \
         and will get back to you as soon as possible.\n\nBest regards"
            .to_string()
    };
    if let Some(signature) = signature.map(str::trim).filter(|s| !s.is_empty()) {
        reply.push_str("\n\n");
        reply.push_str(signature);
    }
    reply
}

pub struct HttpDraftGenerator {
    transport: Arc<dyn HttpTransport>,
    endpoint: String,
    timeout: Duration,
    language: String,
}

impl HttpDraftGenerator {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &ServicesConfig) -> Self {
        Self {
            transport,
            endpoint: config.draft_endpoint.clone(),
            timeout: config.timeout(),
            language: config.language.clone(),
        }
    }
}

#[async_trait]
impl DraftGenerator for HttpDraftGenerator {
    async fn generate(&self, request: &DraftRequest<'_>) -> String {
        if self.endpoint.is_empty() {
            return fallback_reply(&self.language, request.signature);
        }
        let payload = DraftPayload {
            subject: request.subject,
            body: request.body,
            category: request.category.display_name(),
            sender: request.sender,
            signature: request.signature.unwrap_or_default(),
            email_address: request.email_address,
            shop_domain: request.shop.map(|s| s.shop_domain.as_str()),
            shop_access_token: request.shop.map(|s| s.access_token.as_str()),
        };
        post_json(self.transport.as_ref(), &self.endpoint, &payload, self.timeout)
            .await
            .and_then(|v| pick_text(&v, &["draftReply", "message", "draft", "output"]))
            .unwrap_or_else(|| {
                debug!("Using fallback draft reply");
                fallback_reply(&self.language, request.signature)
            })
    }
}
