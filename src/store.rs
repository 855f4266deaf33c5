//! Persistence collaborators used by the pipeline, scheduler and driver.

use crate::error::StoreError;
use crate::models::{
    ActivityRecord, ActivityStatus, Integration, NewActivity, Preferences, SessionRecord,
    ShopContext,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Creates the record unless one already exists for the same user and
    /// message. Returns the stored record and whether this call created it.
    async fn record_classified(
        &self,
        activity: &NewActivity,
    ) -> Result<(ActivityRecord, bool), StoreError>;

    async fn find_by_message_id(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<ActivityRecord>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<ActivityRecord>, StoreError>;

    async fn list_by_status(
        &self,
        user_id: &str,
        status: ActivityStatus,
    ) -> Result<Vec<ActivityRecord>, StoreError>;

    async fn mark_draft_created(
        &self,
        id: &str,
        draft_id: &str,
        draft_url: &str,
    ) -> Result<(), StoreError>;

    async fn set_scheduled_send(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn mark_sent(
        &self,
        id: &str,
        sent_at: DateTime<Utc>,
        message_id_after_send: Option<&str>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Most recently active session, regardless of age.
    async fn active_session(&self) -> Result<Option<SessionRecord>, StoreError>;
    async fn upsert_session(&self, session: &SessionRecord) -> Result<(), StoreError>;
    async fn touch_session(&self, subject_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn integration(&self, user_id: &str) -> Result<Option<Integration>, StoreError>;
    async fn upsert_integration(&self, integration: &Integration) -> Result<(), StoreError>;
    async fn update_integration_token(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: i64,
    ) -> Result<(), StoreError>;
}

/// Read-only view of the user profile.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn preferences(&self, user_id: &str) -> Result<Option<Preferences>, StoreError>;
    async fn shop_context(&self, user_id: &str) -> Result<Option<ShopContext>, StoreError>;
}
