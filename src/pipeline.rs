//! One polling cycle for one mailbox: fetch unread, classify, label, persist,
//! draft and hand drafts to the auto-send scheduler.

use crate::autosend::{AutoSendScheduler, ScheduleOutcome};
use crate::category::Category;
use crate::client::MailboxClient;
use crate::dedup::{Admission, DedupTracker};
use crate::error::{ApiError, PipelineError};
use crate::gmail::{self, api};
use crate::labels::LabelCache;
use crate::models::{ActivityRecord, MessageEnvelope, NewActivity, Preferences, ShopContext};
use crate::services::{Classifier, DraftGenerator, DraftRequest};
use crate::store::{ActivityStore, PreferenceStore};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The account a run acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxUser {
    pub user_id: String,
    pub email_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub listed: usize,
    pub duplicates: usize,
    pub classified: usize,
    pub drafted: usize,
    pub sent: usize,
    pub failed: usize,
    /// Set when the user has automatic classification turned off.
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MessageOutcome {
    Duplicate,
    Classified,
    Drafted { sent: bool },
}

/// Logs a recoverable stage failure. Auth failures are handed back so the
/// caller can abort the batch.
fn tolerate(stage: &str, message_id: &str, err: ApiError) -> Result<(), PipelineError> {
    if err.is_auth() {
        return Err(err.into());
    }
    warn!(stage, message_id, error = %err, "Stage failed, continuing");
    Ok(())
}

pub struct IngestionPipeline {
    client: Arc<MailboxClient>,
    labels: Arc<LabelCache>,
    dedup: Arc<DedupTracker>,
    activities: Arc<dyn ActivityStore>,
    preferences: Arc<dyn PreferenceStore>,
    classifier: Arc<dyn Classifier>,
    drafts: Arc<dyn DraftGenerator>,
    scheduler: Arc<AutoSendScheduler>,
    page_size: u32,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<MailboxClient>,
        labels: Arc<LabelCache>,
        dedup: Arc<DedupTracker>,
        activities: Arc<dyn ActivityStore>,
        preferences: Arc<dyn PreferenceStore>,
        classifier: Arc<dyn Classifier>,
        drafts: Arc<dyn DraftGenerator>,
        scheduler: Arc<AutoSendScheduler>,
        page_size: u32,
    ) -> Self {
        Self {
            client,
            labels,
            dedup,
            activities,
            preferences,
            classifier,
            drafts,
            scheduler,
            page_size,
        }
    }

    async fn load_preferences(&self, user_id: &str) -> Preferences {
        match self.preferences.preferences(user_id).await {
            Ok(prefs) => prefs.unwrap_or_default(),
            Err(e) => {
                warn!(user_id, error = %e, "Could not read preferences, using defaults");
                Preferences::default()
            }
        }
    }

    async fn load_shop(&self, user_id: &str) -> Option<ShopContext> {
        self.preferences
            .shop_context(user_id)
            .await
            .unwrap_or_else(|e| {
                debug!(user_id, error = %e, "No shop context");
                None
            })
    }

    /// Runs one cycle. Errors returned here abort the batch: the unread list
    /// could not be fetched, or credentials stopped working mid-run.
    pub async fn run(&self, user: &MailboxUser) -> Result<IngestReport, PipelineError> {
        let mut report = IngestReport::default();
        let prefs = self.load_preferences(&user.user_id).await;
        if !prefs.auto_classify {
            info!(user_id = %user.user_id, "Automatic classification disabled, skipping ingestion");
            report.disabled = true;
            return Ok(report);
        }

        if let Err(e) = self.labels.ensure_loaded().await {
            tolerate("load_labels", "-", e)?;
        }

        let refs = self.client.list_unread(self.page_size).await?;
        report.listed = refs.len();
        let fresh: Vec<api::MessageRef> = refs
            .into_iter()
            .filter(|r| {
                let seen = self.dedup.seen(&user.user_id, &r.id);
                if seen {
                    report.duplicates += 1;
                }
                !seen
            })
            .collect();
        if fresh.is_empty() {
            debug!(user_id = %user.user_id, listed = report.listed, "No new unread messages");
            return Ok(report);
        }

        let details = join_all(fresh.iter().map(|r| self.client.get_message(&r.id))).await;
        let mut envelopes = Vec::with_capacity(details.len());
        for (message_ref, detail) in fresh.iter().zip(details) {
            match detail {
                Ok(message) => envelopes.push(gmail::normalize_message(message)),
                Err(e) => {
                    tolerate("fetch_detail", &message_ref.id, e)?;
                    report.failed += 1;
                }
            }
        }

        let shop = if prefs.auto_draft {
            self.load_shop(&user.user_id).await
        } else {
            None
        };

        for envelope in &envelopes {
            match self.process(user, &prefs, shop.as_ref(), envelope).await {
                Ok(MessageOutcome::Duplicate) => report.duplicates += 1,
                Ok(MessageOutcome::Classified) => report.classified += 1,
                Ok(MessageOutcome::Drafted { sent }) => {
                    report.classified += 1;
                    report.drafted += 1;
                    if sent {
                        report.sent += 1;
                    }
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(message_id = %envelope.id, error = %e, "Message processing failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            user_id = %user.user_id,
            listed = report.listed,
            classified = report.classified,
            drafted = report.drafted,
            duplicates = report.duplicates,
            failed = report.failed,
            "Ingestion cycle finished"
        );
        Ok(report)
    }

    async fn process(
        &self,
        user: &MailboxUser,
        prefs: &Preferences,
        shop: Option<&ShopContext>,
        envelope: &MessageEnvelope,
    ) -> Result<MessageOutcome, PipelineError> {
        let admission = self
            .dedup
            .admit(self.activities.as_ref(), &user.user_id, envelope)
            .await?;
        if let Admission::Duplicate(reason) = admission {
            debug!(message_id = %envelope.id, ?reason, "Skipping duplicate message");
            return Ok(MessageOutcome::Duplicate);
        }

        let category = self
            .classifier
            .classify(&envelope.subject, envelope.content())
            .await;
        debug!(message_id = %envelope.id, %category, "Message classified");

        let label_id = match self.labels.get_or_create(category).await {
            Ok(id) => Some(id),
            Err(e) => {
                tolerate("resolve_label", &envelope.id, e)?;
                None
            }
        };
        if let Some(label_id) = &label_id {
            if let Err(e) = self.client.apply_label(&envelope.id, label_id).await {
                tolerate("apply_label", &envelope.id, e)?;
            }
        }
        if let Err(e) = self.client.mark_read(&envelope.id).await {
            tolerate("mark_read", &envelope.id, e)?;
        }

        let (record, created) = self
            .activities
            .record_classified(&NewActivity {
                user_id: user.user_id.clone(),
                subject: envelope.subject.clone(),
                sender: envelope.sender.clone(),
                timestamp: envelope.received_at(),
                category,
                body: envelope.body.clone(),
                message_id: Some(envelope.id.clone()),
                thread_id: Some(envelope.thread_id.clone()).filter(|t| !t.is_empty()),
            })
            .await?;
        if !created {
            debug!(message_id = %envelope.id, "Activity recorded by another worker");
            return Ok(MessageOutcome::Duplicate);
        }

        if category == Category::Spam || !prefs.auto_draft {
            return Ok(MessageOutcome::Classified);
        }
        if label_id.is_none() {
            warn!(message_id = %envelope.id, "No label for message, skipping draft");
            return Ok(MessageOutcome::Classified);
        }

        match self.draft(user, prefs, shop, envelope, &record).await {
            Ok(Some(sent)) => Ok(MessageOutcome::Drafted { sent }),
            Ok(None) => Ok(MessageOutcome::Classified),
            Err(e) if e.is_auth() => Err(e),
            Err(e) => {
                warn!(stage = "draft", message_id = %envelope.id, error = %e, "Draft creation failed");
                Ok(MessageOutcome::Classified)
            }
        }
    }

    /// Returns whether the draft was sent right away, or None when the draft
    /// slot was already taken.
    async fn draft(
        &self,
        user: &MailboxUser,
        prefs: &Preferences,
        shop: Option<&ShopContext>,
        envelope: &MessageEnvelope,
        record: &ActivityRecord,
    ) -> Result<Option<bool>, PipelineError> {
        let recipient = envelope.reply_recipient();
        if !self
            .dedup
            .claim_draft(&user.user_id, &envelope.id, recipient, &envelope.subject)
        {
            debug!(message_id = %envelope.id, "Draft already exists for message");
            return Ok(None);
        }

        let reply = self
            .drafts
            .generate(&DraftRequest {
                subject: &envelope.subject,
                body: envelope.content(),
                category: record.category,
                sender: &envelope.sender,
                signature: prefs.signature.as_deref(),
                email_address: Some(user.email_address.as_str()).filter(|e| !e.is_empty()),
                shop,
            })
            .await;

        let thread_id = Some(envelope.thread_id.as_str()).filter(|t| !t.is_empty());
        let thread = match thread_id {
            Some(id) => match self.client.get_thread(id).await {
                Ok(thread) => Some(thread),
                Err(e) => {
                    tolerate("fetch_thread", &envelope.id, e)?;
                    None
                }
            },
            None => None,
        };
        let headers = gmail::reply_headers(thread.as_ref(), envelope);
        let raw = gmail::compose_reply(recipient, &envelope.subject, &reply, &headers);

        let draft = self.client.create_draft(&raw, thread_id).await?;
        let ui_id = draft
            .message
            .as_ref()
            .map(|m| m.id.as_str())
            .filter(|id| !id.is_empty())
            .unwrap_or(draft.id.as_str());
        let link = gmail::draft_link(ui_id);
        self.dedup.record_draft(&user.user_id, &envelope.id, &draft.id);
        self.activities
            .mark_draft_created(&record.id, &draft.id, &link)
            .await?;
        info!(message_id = %envelope.id, draft_id = %draft.id, "Draft created");

        let sent = match self
            .scheduler
            .schedule(&user.user_id, &draft.id, &record.id)
            .await
        {
            Ok(ScheduleOutcome::Sent { .. }) => true,
            Ok(_) => false,
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => {
                warn!(stage = "schedule_send", message_id = %envelope.id, error = %e, "Auto-send scheduling failed");
                false
            }
        };
        Ok(Some(sent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::client;
    use crate::db::Database;
    use crate::http::Method;
    use crate::models::ActivityStatus;
    use crate::testing::ScriptedTransport;
    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde_json::{Value, json};

    struct Fixed(Category);

    #[async_trait]
    impl Classifier for Fixed {
        async fn classify(&self, _subject: &str, _body: &str) -> Category {
            self.0
        }
    }

    struct Canned;

    #[async_trait]
    impl DraftGenerator for Canned {
        async fn generate(&self, request: &DraftRequest<'_>) -> String {
            format!("Thanks for your {} message.", request.category.key())
        }
    }

    fn message(id: &str, subject: &str) -> Value {
        json!({
            "id": id,
            "threadId": format!("t-{}", id),
            "snippet": "Hi, where is my parcel?",
            "internalDate": "1700000000000",
            "payload": {
                "mimeType": "text/plain",
                "headers": [
                    {"name": "Subject", "value": subject},
                    {"name": "From", "value": "Jane <jane@example.com>"},
                    {"name": "Message-ID", "value": format!("<{}@mail.example.com>", id)}
                ],
                "body": {"data": URL_SAFE_NO_PAD.encode("Hi, where is my parcel?")}
            }
        })
    }

    fn script_mailbox(transport: &ScriptedTransport) {
        transport.respond_always(
            Method::GET,
            "/labels",
            200,
            json!({"labels": [{"id": "L-del", "name": Category::Delivery.display_name()}]}),
        );
        transport.respond_always(Method::POST, "/modify", 200, json!({"id": "m1"}));
        transport.respond_always(Method::GET, "/threads/", 200, json!({"id": "t-m1", "messages": []}));
        transport.respond_always(
            Method::POST,
            "/drafts",
            200,
            json!({"id": "r-1", "message": {"id": "ui-1", "threadId": "t-m1"}}),
        );
    }

    async fn pipeline(
        transport: &Arc<ScriptedTransport>,
        db: &Database,
        dedup: Arc<DedupTracker>,
        category: Category,
    ) -> IngestionPipeline {
        let (client, _, _) = client(transport.clone());
        let client = Arc::new(client);
        let store = Arc::new(db.clone());
        let scheduler = Arc::new(AutoSendScheduler::new(client.clone(), store.clone(), store.clone()));
        IngestionPipeline::new(
            client.clone(),
            Arc::new(LabelCache::new(client)),
            dedup,
            store.clone(),
            store,
            Arc::new(Fixed(category)),
            Arc::new(Canned),
            scheduler,
            20,
        )
    }

    fn user() -> MailboxUser {
        MailboxUser {
            user_id: "u1".into(),
            email_address: "support@shop.test".into(),
        }
    }

    async fn no_auto_send(db: &Database) {
        db.upsert_preferences(
            "u1",
            &Preferences {
                auto_send_drafts: false,
                ..Preferences::default()
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn new_message_is_classified_labelled_and_drafted() {
        let transport = Arc::new(ScriptedTransport::new());
        script_mailbox(&transport);
        transport.respond(Method::GET, "/messages?", 200, json!({"messages": [{"id": "m1", "threadId": "t-m1"}]}));
        transport.respond(Method::GET, "/messages/m1", 200, message("m1", "Where is my order?"));
        let db = Database::in_memory().await.unwrap();
        no_auto_send(&db).await;
        let pipeline = pipeline(&transport, &db, Arc::new(DedupTracker::new()), Category::Delivery).await;

        let report = pipeline.run(&user()).await.unwrap();
        assert_eq!(report.classified, 1);
        assert_eq!(report.drafted, 1);
        assert_eq!(report.sent, 0);

        let record = db.find_by_message_id("u1", "m1").await.unwrap().unwrap();
        assert_eq!(record.category, Category::Delivery);
        assert_eq!(record.status, ActivityStatus::DraftCreated);
        assert_eq!(record.draft_id.as_deref(), Some("r-1"));
        assert!(record.draft_url.unwrap().ends_with("compose=ui-1"));

        let modify: Vec<Value> = transport
            .calls()
            .into_iter()
            .filter(|c| c.url.ends_with("/messages/m1/modify"))
            .filter_map(|c| c.body.and_then(|b| serde_json::from_slice(&b).ok()))
            .collect();
        assert!(modify.iter().any(|b| b["addLabelIds"] == json!(["L-del"])));
        assert!(modify.iter().any(|b| b["removeLabelIds"] == json!(["UNREAD"])));
    }

    #[tokio::test]
    async fn refetched_message_creates_nothing_new() {
        let transport = Arc::new(ScriptedTransport::new());
        script_mailbox(&transport);
        transport.respond_always(Method::GET, "/messages?", 200, json!({"messages": [{"id": "m1"}]}));
        transport.respond_always(Method::GET, "/messages/m1", 200, message("m1", "Where is my order?"));
        let db = Database::in_memory().await.unwrap();
        no_auto_send(&db).await;

        let first = pipeline(&transport, &db, Arc::new(DedupTracker::new()), Category::Delivery).await;
        first.run(&user()).await.unwrap();
        let second = first.run(&user()).await.unwrap();
        assert_eq!(second.duplicates, 1);

        // A fresh tracker stands in for a restarted process.
        let restarted = pipeline(&transport, &db, Arc::new(DedupTracker::new()), Category::Delivery).await;
        let third = restarted.run(&user()).await.unwrap();
        assert_eq!(third.duplicates, 1);

        assert_eq!(db.count_activities("u1").await.unwrap(), 1);
        assert_eq!(transport.count(Method::POST, "/drafts"), 1);
    }

    #[tokio::test]
    async fn spam_is_recorded_without_draft() {
        let transport = Arc::new(ScriptedTransport::new());
        script_mailbox(&transport);
        transport.respond_always(Method::POST, "/labels", 200, json!({"id": "L-spam", "name": Category::Spam.display_name()}));
        transport.respond(Method::GET, "/messages?", 200, json!({"messages": [{"id": "m2"}]}));
        transport.respond(Method::GET, "/messages/m2", 200, message("m2", "You won a prize"));
        let db = Database::in_memory().await.unwrap();
        let pipeline = pipeline(&transport, &db, Arc::new(DedupTracker::new()), Category::Spam).await;

        let report = pipeline.run(&user()).await.unwrap();
        assert_eq!(report.classified, 1);
        assert_eq!(report.drafted, 0);
        let record = db.find_by_message_id("u1", "m2").await.unwrap().unwrap();
        assert_eq!(record.status, ActivityStatus::Classified);
    }

    #[tokio::test]
    async fn label_failure_keeps_activity_but_skips_draft() {
        let transport = Arc::new(ScriptedTransport::new());
        script_mailbox(&transport);
        transport.respond_always(Method::POST, "/labels", 403, json!({"error": "forbidden"}));
        transport.respond(Method::GET, "/messages?", 200, json!({"messages": [{"id": "m3"}]}));
        transport.respond(Method::GET, "/messages/m3", 200, message("m3", "Cancel my order"));
        let db = Database::in_memory().await.unwrap();
        let pipeline = pipeline(&transport, &db, Arc::new(DedupTracker::new()), Category::Cancellation).await;

        let report = pipeline.run(&user()).await.unwrap();
        assert_eq!(report.classified, 1);
        assert_eq!(report.drafted, 0);
        let record = db.find_by_message_id("u1", "m3").await.unwrap().unwrap();
        assert_eq!(record.status, ActivityStatus::Classified);
        assert_eq!(transport.count(Method::POST, "/drafts"), 0);
        // Mark-read still happens.
        assert_eq!(transport.count(Method::POST, "/messages/m3/modify"), 1);
    }

    #[tokio::test]
    async fn detail_failure_does_not_abort_the_batch() {
        let transport = Arc::new(ScriptedTransport::new());
        script_mailbox(&transport);
        transport.respond(
            Method::GET,
            "/messages?",
            200,
            json!({"messages": [{"id": "gone"}, {"id": "m4"}]}),
        );
        transport.respond(Method::GET, "/messages/m4", 200, message("m4", "Where is my order?"));
        let db = Database::in_memory().await.unwrap();
        no_auto_send(&db).await;
        let pipeline = pipeline(&transport, &db, Arc::new(DedupTracker::new()), Category::Delivery).await;

        let report = pipeline.run(&user()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.drafted, 1);
    }

    #[tokio::test]
    async fn auto_send_with_zero_delay_sends_the_new_draft() {
        let transport = Arc::new(ScriptedTransport::new());
        script_mailbox(&transport);
        transport.respond(Method::POST, "/drafts/send", 200, json!({"id": "sent-1"}));
        transport.respond(Method::GET, "/messages?", 200, json!({"messages": [{"id": "m5"}]}));
        transport.respond(Method::GET, "/messages/m5", 200, message("m5", "Where is my order?"));
        let db = Database::in_memory().await.unwrap();
        let pipeline = pipeline(&transport, &db, Arc::new(DedupTracker::new()), Category::Delivery).await;

        let report = pipeline.run(&user()).await.unwrap();
        assert_eq!(report.sent, 1);
        let record = db.find_by_message_id("u1", "m5").await.unwrap().unwrap();
        assert_eq!(record.status, ActivityStatus::DraftSent);
    }

    #[tokio::test]
    async fn list_failure_aborts_the_run() {
        let transport = Arc::new(ScriptedTransport::new());
        script_mailbox(&transport);
        transport.respond_always(Method::GET, "/messages?", 503, json!({"error": "unavailable"}));
        let db = Database::in_memory().await.unwrap();
        let pipeline = pipeline(&transport, &db, Arc::new(DedupTracker::new()), Category::Delivery).await;

        let err = pipeline.run(&user()).await.unwrap_err();
        assert!(!err.is_auth());
        assert_eq!(db.count_activities("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disabled_classification_skips_ingestion() {
        let transport = Arc::new(ScriptedTransport::new());
        let db = Database::in_memory().await.unwrap();
        db.upsert_preferences(
            "u1",
            &Preferences {
                auto_classify: false,
                ..Preferences::default()
            },
        )
        .await
        .unwrap();
        let pipeline = pipeline(&transport, &db, Arc::new(DedupTracker::new()), Category::Delivery).await;

        assert!(pipeline.run(&user()).await.unwrap().disabled);
        assert!(transport.calls().is_empty());
    }
}
