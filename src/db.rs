use crate::category::Category;
use crate::error::StoreError;
use crate::models::{
    ActivityRecord, ActivityStatus, Integration, NewActivity, Preferences, SessionRecord,
    ShopContext,
};
use crate::store::{ActivityStore, IntegrationStore, PreferenceStore, SessionStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

const ACTIVITY_COLUMNS: &str = "id, user_id, subject, sender, timestamp, category, status, body, \
     message_id, thread_id, draft_id, draft_url, scheduled_send_time, sent_at, message_id_after_send";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database. One long-lived connection keeps the data alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn upsert_preferences(
        &self,
        user_id: &str,
        prefs: &Preferences,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_preferences (user_id, auto_classify, auto_draft, signature, auto_send_drafts, auto_send_delay)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET auto_classify=excluded.auto_classify, auto_draft=excluded.auto_draft,
             signature=excluded.signature, auto_send_drafts=excluded.auto_send_drafts, auto_send_delay=excluded.auto_send_delay",
        )
        .bind(user_id)
        .bind(prefs.auto_classify)
        .bind(prefs.auto_draft)
        .bind(&prefs.signature)
        .bind(prefs.auto_send_drafts)
        .bind(prefs.auto_send_delay_minutes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_activities(&self, user_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) FROM activities WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }

    async fn find_by_fallback_key(
        &self,
        user_id: &str,
        subject: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<ActivityRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities
             WHERE user_id = ? AND message_id IS NULL AND subject = ? AND timestamp = ?"
        ))
        .bind(user_id)
        .bind(subject)
        .bind(timestamp.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| activity_from_row(&r)).transpose()
    }
}

/// Parses RFC 3339, SQLite `YYYY-MM-DD HH:MM:SS`, epoch seconds or epoch milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(n) = raw.parse::<i64>() {
        // Anything past year 2286 in seconds is treated as milliseconds.
        return if n.abs() >= 10_000_000_000 {
            Utc.timestamp_millis_opt(n).single()
        } else {
            Utc.timestamp_opt(n, 0).single()
        };
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn timestamp_column(row: &SqliteRow, column: &str) -> Option<DateTime<Utc>> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .and_then(|raw| parse_timestamp(&raw))
        .or_else(|| {
            row.try_get::<Option<i64>, _>(column)
                .ok()
                .flatten()
                .and_then(|n| parse_timestamp(&n.to_string()))
        })
}

fn activity_from_row(row: &SqliteRow) -> Result<ActivityRecord, StoreError> {
    let status: String = row.get("status");
    let status = ActivityStatus::from_str(&status).map_err(StoreError::Invalid)?;
    let category: String = row.get("category");
    let id: String = row.get("id");
    let timestamp = timestamp_column(row, "timestamp")
        .ok_or_else(|| StoreError::Invalid(format!("activity {} has no readable timestamp", id)))?;

    Ok(ActivityRecord {
        id,
        user_id: row.get("user_id"),
        subject: row.get("subject"),
        sender: row.get("sender"),
        timestamp,
        category: Category::normalize(&category),
        status,
        body: row.get("body"),
        message_id: row.get("message_id"),
        thread_id: row.get("thread_id"),
        draft_id: row.get("draft_id"),
        draft_url: row.get("draft_url"),
        scheduled_send_time: timestamp_column(row, "scheduled_send_time"),
        sent_at: timestamp_column(row, "sent_at"),
        message_id_after_send: row.get("message_id_after_send"),
    })
}

/// SQLite reports write/permission failures as plain database errors.
fn classify_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        let message = db_err.message().to_lowercase();
        if message.contains("readonly") || message.contains("not authorized") || message.contains("permission") {
            return StoreError::PermissionDenied(db_err.message().to_string());
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl ActivityStore for Database {
    async fn record_classified(
        &self,
        activity: &NewActivity,
    ) -> Result<(ActivityRecord, bool), StoreError> {
        if activity.message_id.is_none() {
            if let Some(existing) = self
                .find_by_fallback_key(&activity.user_id, &activity.subject, activity.timestamp)
                .await?
            {
                return Ok((existing, false));
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let result = sqlx::query(
            "INSERT INTO activities (id, user_id, subject, sender, timestamp, category, status, body, message_id, thread_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, message_id) DO NOTHING",
        )
        .bind(&id)
        .bind(&activity.user_id)
        .bind(&activity.subject)
        .bind(&activity.sender)
        .bind(activity.timestamp.to_rfc3339())
        .bind(activity.category.display_name())
        .bind(ActivityStatus::Classified.as_str())
        .bind(&activity.body)
        .bind(&activity.message_id)
        .bind(&activity.thread_id)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        let stored = match (&activity.message_id, created) {
            (Some(message_id), false) => {
                self.find_by_message_id(&activity.user_id, message_id).await?
            }
            _ => self.get(&id).await?,
        };
        let stored = stored.ok_or_else(|| {
            StoreError::Invalid(format!("activity for {:?} vanished after insert", activity.message_id))
        })?;
        Ok((stored, created))
    }

    async fn find_by_message_id(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<ActivityRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE user_id = ? AND message_id = ?"
        ))
        .bind(user_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| activity_from_row(&r)).transpose()
    }

    async fn get(&self, id: &str) -> Result<Option<ActivityRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| activity_from_row(&r)).transpose()
    }

    async fn list_by_status(
        &self,
        user_id: &str,
        status: ActivityStatus,
    ) -> Result<Vec<ActivityRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE user_id = ? AND status = ? ORDER BY timestamp ASC"
        ))
        .bind(user_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(activity_from_row).collect()
    }

    async fn mark_draft_created(
        &self,
        id: &str,
        draft_id: &str,
        draft_url: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE activities SET status = ?, draft_id = ?, draft_url = ? WHERE id = ?")
            .bind(ActivityStatus::DraftCreated.as_str())
            .bind(draft_id)
            .bind(draft_url)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_scheduled_send(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE activities SET scheduled_send_time = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_sent(
        &self,
        id: &str,
        sent_at: DateTime<Utc>,
        message_id_after_send: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE activities SET status = ?, sent_at = ?, message_id_after_send = ? WHERE id = ?",
        )
        .bind(ActivityStatus::DraftSent.as_str())
        .bind(sent_at.to_rfc3339())
        .bind(message_id_after_send)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for Database {
    async fn active_session(&self) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT subject_id, subject_contact, last_active_at FROM sessions ORDER BY last_active_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| {
            let last_active_at = timestamp_column(&r, "last_active_at")?;
            Some(SessionRecord {
                subject_id: r.get("subject_id"),
                subject_contact: r.get("subject_contact"),
                last_active_at,
            })
        }))
    }

    async fn upsert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sessions (subject_id, subject_contact, last_active_at) VALUES (?, ?, ?)
             ON CONFLICT(subject_id) DO UPDATE SET subject_contact=excluded.subject_contact, last_active_at=excluded.last_active_at",
        )
        .bind(&session.subject_id)
        .bind(&session.subject_contact)
        .bind(session.last_active_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_session(&self, subject_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET last_active_at = ? WHERE subject_id = ?")
            .bind(at.to_rfc3339())
            .bind(subject_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IntegrationStore for Database {
    async fn integration(&self, user_id: &str) -> Result<Option<Integration>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, email_address, provider, access_token, refresh_token, expires_at
             FROM integrations WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_error)?;

        Ok(row.map(|r| Integration {
            user_id: r.get("user_id"),
            email_address: r.get("email_address"),
            provider: r.get("provider"),
            access_token: r.get("access_token"),
            refresh_token: r.get("refresh_token"),
            expires_at: r.get("expires_at"),
        }))
    }

    async fn upsert_integration(&self, integration: &Integration) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO integrations (user_id, email_address, provider, access_token, refresh_token, expires_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET email_address=excluded.email_address, provider=excluded.provider,
             access_token=excluded.access_token, refresh_token=excluded.refresh_token, expires_at=excluded.expires_at",
        )
        .bind(&integration.user_id)
        .bind(&integration.email_address)
        .bind(&integration.provider)
        .bind(&integration.access_token)
        .bind(&integration.refresh_token)
        .bind(integration.expires_at)
        .execute(&self.pool)
        .await
        .map_err(classify_error)?;
        Ok(())
    }

    async fn update_integration_token(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE integrations SET access_token = ?, refresh_token = COALESCE(?, refresh_token), expires_at = ?
             WHERE user_id = ?",
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(classify_error)?;
        Ok(())
    }
}

#[async_trait]
impl PreferenceStore for Database {
    async fn preferences(&self, user_id: &str) -> Result<Option<Preferences>, StoreError> {
        let row = sqlx::query(
            "SELECT auto_classify, auto_draft, signature, auto_send_drafts, auto_send_delay
             FROM user_preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let defaults = Preferences::default();
        Ok(row.map(|r| Preferences {
            auto_classify: r.get("auto_classify"),
            auto_draft: r.get("auto_draft"),
            signature: r.get("signature"),
            auto_send_drafts: r
                .get::<Option<bool>, _>("auto_send_drafts")
                .unwrap_or(defaults.auto_send_drafts),
            auto_send_delay_minutes: r
                .get::<Option<i64>, _>("auto_send_delay")
                .map(|d| d.max(0))
                .unwrap_or(defaults.auto_send_delay_minutes),
        }))
    }

    async fn shop_context(&self, user_id: &str) -> Result<Option<ShopContext>, StoreError> {
        let row = sqlx::query("SELECT shop_domain, access_token FROM shop_connections WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ShopContext {
            shop_domain: r.get("shop_domain"),
            access_token: r.get("access_token"),
        }))
    }
}
