//! Layered duplicate suppression for ingested messages and generated drafts.
//!
//! Memory sets cover the current process; the activity store's unique
//! `(user_id, message_id)` index covers restarts and other workers.

use crate::error::StoreError;
use crate::models::MessageEnvelope;
use crate::store::ActivityStore;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplicate {
    /// Message id already handled by this process.
    SeenId,
    /// Same subject and timestamp already handled under another id.
    SeenContent,
    /// An activity record already exists for this message.
    Persisted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    New,
    Duplicate(Duplicate),
}

#[derive(Default)]
struct Sets {
    ids: HashSet<(String, String)>,
    content: HashSet<(String, String, i64)>,
    draft_keys: HashSet<(String, String, String)>,
    drafts: HashMap<(String, String), String>,
}

/// Owned by the driver and shared across runs; all keys are scoped by user.
#[derive(Default)]
pub struct DedupTracker {
    sets: Mutex<Sets>,
}

fn content_key(user_id: &str, envelope: &MessageEnvelope) -> (String, String, i64) {
    (
        user_id.to_string(),
        envelope.subject.trim().to_lowercase(),
        envelope.internal_date,
    )
}

impl DedupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn sets(&self) -> std::sync::MutexGuard<'_, Sets> {
        self.sets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cheap pre-check used before fetching message detail.
    pub fn seen(&self, user_id: &str, message_id: &str) -> bool {
        self.sets()
            .ids
            .contains(&(user_id.to_string(), message_id.to_string()))
    }

    /// Decides whether `envelope` may be processed, reserving it in memory
    /// before the durable lookup so no later side effect can run twice.
    pub async fn admit(
        &self,
        store: &dyn ActivityStore,
        user_id: &str,
        envelope: &MessageEnvelope,
    ) -> Result<Admission, StoreError> {
        let id_key = (user_id.to_string(), envelope.id.clone());
        let content = content_key(user_id, envelope);
        {
            let mut sets = self.sets();
            if sets.ids.contains(&id_key) {
                return Ok(Admission::Duplicate(Duplicate::SeenId));
            }
            if sets.content.contains(&content) {
                sets.ids.insert(id_key);
                return Ok(Admission::Duplicate(Duplicate::SeenContent));
            }
            sets.ids.insert(id_key);
            sets.content.insert(content);
        }

        if store.find_by_message_id(user_id, &envelope.id).await?.is_some() {
            debug!(message_id = %envelope.id, "Activity already recorded");
            return Ok(Admission::Duplicate(Duplicate::Persisted));
        }
        Ok(Admission::New)
    }

    /// Reserves the draft slot for a message. False when the message already
    /// has a draft or the same recipient and subject were already answered.
    pub fn claim_draft(&self, user_id: &str, message_id: &str, recipient: &str, subject: &str) -> bool {
        let mut sets = self.sets();
        if sets
            .drafts
            .contains_key(&(user_id.to_string(), message_id.to_string()))
        {
            return false;
        }
        sets.draft_keys.insert((
            user_id.to_string(),
            recipient.trim().to_lowercase(),
            subject.trim().to_lowercase(),
        ))
    }

    pub fn record_draft(&self, user_id: &str, message_id: &str, draft_id: &str) {
        self.sets().drafts.insert(
            (user_id.to_string(), message_id.to_string()),
            draft_id.to_string(),
        );
    }

    #[cfg(test)]
    pub fn draft_for(&self, user_id: &str, message_id: &str) -> Option<String> {
        self.sets()
            .drafts
            .get(&(user_id.to_string(), message_id.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::Category;
    use crate::db::Database;
    use crate::models::NewActivity;
    use chrono::Utc;

    fn envelope(id: &str, subject: &str, internal_date: i64) -> MessageEnvelope {
        MessageEnvelope {
            id: id.into(),
            thread_id: format!("t-{}", id),
            subject: subject.into(),
            sender: "customer@example.com".into(),
            internal_date,
            ..MessageEnvelope::default()
        }
    }

    #[tokio::test]
    async fn memory_checks_run_before_store() {
        let db = Database::in_memory().await.unwrap();
        let tracker = DedupTracker::new();
        let m1 = envelope("m1", "Where is my order?", 1_700_000_000_000);

        assert_eq!(tracker.admit(&db, "u1", &m1).await.unwrap(), Admission::New);
        assert!(tracker.seen("u1", "m1"));
        assert_eq!(
            tracker.admit(&db, "u1", &m1).await.unwrap(),
            Admission::Duplicate(Duplicate::SeenId)
        );

        let redelivered = envelope("m1-b", "Where is my order?", 1_700_000_000_000);
        assert_eq!(
            tracker.admit(&db, "u1", &redelivered).await.unwrap(),
            Admission::Duplicate(Duplicate::SeenContent)
        );

        // Keys are per user.
        assert_eq!(tracker.admit(&db, "u2", &m1).await.unwrap(), Admission::New);
    }

    #[tokio::test]
    async fn persisted_activity_is_a_duplicate_for_a_fresh_process() {
        let db = Database::in_memory().await.unwrap();
        db.record_classified(&NewActivity {
            user_id: "u1".into(),
            subject: "Refund please".into(),
            sender: "customer@example.com".into(),
            timestamp: Utc::now(),
            category: Category::Refund,
            body: None,
            message_id: Some("m7".into()),
            thread_id: None,
        })
        .await
        .unwrap();

        let tracker = DedupTracker::new();
        let m7 = envelope("m7", "Refund please", 1);
        assert_eq!(
            tracker.admit(&db, "u1", &m7).await.unwrap(),
            Admission::Duplicate(Duplicate::Persisted)
        );
        assert!(tracker.seen("u1", "m7"));
    }

    #[test]
    fn draft_claims_are_single_use() {
        let tracker = DedupTracker::new();
        assert!(tracker.claim_draft("u1", "m1", "a@example.com", "Where is my order?"));
        assert!(!tracker.claim_draft("u1", "m2", "A@example.com ", "where is my order?"));

        tracker.record_draft("u1", "m3", "r-1");
        assert!(!tracker.claim_draft("u1", "m3", "b@example.com", "Other"));
        assert_eq!(tracker.draft_for("u1", "m3").as_deref(), Some("r-1"));
    }
}
