use crate::category::{Category, FALLBACK_COLOR, LabelColor};
use crate::client::MailboxClient;
use crate::error::ApiError;
use crate::models::Label;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Default)]
struct LabelState {
    loaded: bool,
    ids: HashMap<Category, String>,
}

/// Category to provider label id mapping for one mailbox client.
///
/// The lock is held across lookups and creates so two messages of the same
/// category never race into creating two labels.
pub struct LabelCache {
    client: Arc<MailboxClient>,
    state: Mutex<LabelState>,
}

fn find_label(labels: &[Label], category: Category) -> Option<&Label> {
    let name = category.display_name();
    labels
        .iter()
        .find(|l| l.name == name)
        .or_else(|| labels.iter().find(|l| l.name.eq_ignore_ascii_case(&name)))
        .or_else(|| {
            labels
                .iter()
                .find(|l| l.name.eq_ignore_ascii_case(category.key()))
        })
}

fn is_conflict(err: &ApiError) -> bool {
    match err {
        ApiError::Request { status: 409, .. } => true,
        ApiError::Request { body, .. } => body.to_lowercase().contains("exists"),
        _ => false,
    }
}

fn is_color_rejected(err: &ApiError) -> bool {
    matches!(err, ApiError::Request { status: 400, body } if body.to_lowercase().contains("color"))
}

impl LabelCache {
    pub fn new(client: Arc<MailboxClient>) -> Self {
        Self {
            client,
            state: Mutex::new(LabelState::default()),
        }
    }

    /// Loads existing labels once; later calls are no-ops.
    pub async fn ensure_loaded(&self) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        if state.loaded {
            return Ok(());
        }
        let labels = self.client.list_labels().await?;
        for category in Category::ALL {
            if let Some(label) = find_label(&labels, category) {
                state.ids.insert(category, label.id.clone());
            }
        }
        state.loaded = true;
        debug!(mapped = state.ids.len(), total = labels.len(), "Label cache loaded");
        Ok(())
    }

    #[cfg(test)]
    pub async fn cached(&self, category: Category) -> Option<String> {
        self.state.lock().await.ids.get(&category).cloned()
    }

    pub async fn get_or_create(&self, category: Category) -> Result<String, ApiError> {
        let mut state = self.state.lock().await;
        if let Some(id) = state.ids.get(&category) {
            return Ok(id.clone());
        }

        let labels = self.client.list_labels().await?;
        let id = match find_label(&labels, category) {
            Some(label) => label.id.clone(),
            None => self.create(category).await?,
        };
        state.ids.insert(category, id.clone());
        Ok(id)
    }

    async fn create(&self, category: Category) -> Result<String, ApiError> {
        let name = category.display_name();
        let colors: [Option<LabelColor>; 3] = [Some(category.color()), Some(FALLBACK_COLOR), None];
        let mut last_error = None;

        for color in colors {
            match self.client.create_label(&name, color).await {
                Ok(label) => {
                    info!(label = %name, id = %label.id, "Created label");
                    return Ok(label.id);
                }
                Err(e) if is_conflict(&e) => {
                    debug!(label = %name, "Label already exists, re-fetching");
                    let labels = self.client.list_labels().await?;
                    return find_label(&labels, category)
                        .map(|l| l.id.clone())
                        .ok_or(e);
                }
                Err(e) if is_color_rejected(&e) => {
                    warn!(label = %name, ?color, "Label colour rejected");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| ApiError::Other(format!("could not create label {}", name))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::client;
    use crate::http::Method;
    use crate::testing::ScriptedTransport;
    use serde_json::{Value, json};

    fn cache(transport: &Arc<ScriptedTransport>) -> LabelCache {
        let (client, _, _) = client(transport.clone());
        LabelCache::new(Arc::new(client))
    }

    fn created_bodies(transport: &ScriptedTransport) -> Vec<Value> {
        transport
            .calls()
            .into_iter()
            .filter(|c| c.method == Method::POST && c.url.ends_with("/labels"))
            .filter_map(|c| c.body.and_then(|b| serde_json::from_slice(&b).ok()))
            .collect()
    }

    #[tokio::test]
    async fn loads_once_and_matches_names_case_insensitively() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_always(
            Method::GET,
            "/labels",
            200,
            json!({"labels": [
                {"id": "L1", "name": Category::Delivery.display_name().to_uppercase()},
                {"id": "L2", "name": "refund"},
                {"id": "INBOX", "name": "INBOX"}
            ]}),
        );
        let cache = cache(&transport);

        cache.ensure_loaded().await.unwrap();
        cache.ensure_loaded().await.unwrap();
        assert_eq!(transport.count(Method::GET, "/labels"), 1);
        assert_eq!(cache.cached(Category::Delivery).await.as_deref(), Some("L1"));
        assert_eq!(cache.cached(Category::Refund).await.as_deref(), Some("L2"));
        assert_eq!(cache.get_or_create(Category::Delivery).await.unwrap(), "L1");
        assert_eq!(transport.count(Method::GET, "/labels"), 1);
    }

    #[tokio::test]
    async fn missing_label_is_created_with_category_colour() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_always(Method::GET, "/labels", 200, json!({"labels": []}));
        transport.respond(
            Method::POST,
            "/labels",
            200,
            json!({"id": "L7", "name": Category::Presale.display_name()}),
        );
        let cache = cache(&transport);

        assert_eq!(cache.get_or_create(Category::Presale).await.unwrap(), "L7");
        assert_eq!(cache.get_or_create(Category::Presale).await.unwrap(), "L7");

        let bodies = created_bodies(&transport);
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["name"], json!(Category::Presale.display_name()));
        assert_eq!(bodies[0]["color"]["backgroundColor"], json!(Category::Presale.color().background));
    }

    #[tokio::test]
    async fn conflict_resolves_to_existing_label() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(Method::GET, "/labels", 200, json!({"labels": []}));
        transport.respond(
            Method::GET,
            "/labels",
            200,
            json!({"labels": [{"id": "L9", "name": Category::Refund.display_name()}]}),
        );
        transport.respond(Method::POST, "/labels", 409, json!({"error": {"message": "Label name exists or conflicts"}}));
        let cache = cache(&transport);

        assert_eq!(cache.get_or_create(Category::Refund).await.unwrap(), "L9");
        assert_eq!(created_bodies(&transport).len(), 1);
    }

    #[tokio::test]
    async fn rejected_colours_fall_back_then_drop_colour() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_always(Method::GET, "/labels", 200, json!({"labels": []}));
        let rejected = json!({"error": {"message": "Invalid label color specified"}});
        transport.respond(Method::POST, "/labels", 400, rejected.clone());
        transport.respond(Method::POST, "/labels", 400, rejected);
        transport.respond(Method::POST, "/labels", 200, json!({"id": "L3", "name": Category::Other.display_name()}));
        let cache = cache(&transport);

        assert_eq!(cache.get_or_create(Category::Other).await.unwrap(), "L3");
        let bodies = created_bodies(&transport);
        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[1]["color"]["backgroundColor"], json!(FALLBACK_COLOR.background));
        assert!(bodies[2].get("color").is_none());
    }

    #[tokio::test]
    async fn other_client_errors_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_always(Method::GET, "/labels", 200, json!({"labels": []}));
        transport.respond(Method::POST, "/labels", 403, json!({"error": "forbidden"}));
        let cache = cache(&transport);

        assert!(cache.get_or_create(Category::Spam).await.is_err());
        assert_eq!(created_bodies(&transport).len(), 1);
        assert!(cache.cached(Category::Spam).await.is_none());
    }
}
