use crate::category::Category;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sessions older than this are not used for background processing.
pub const SESSION_TTL_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    pub color_foreground: Option<String>,
    pub color_background: Option<String>,
}

/// An inbound message as seen by the pipeline, normalized from the provider payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub sender: String,
    pub reply_to: Option<String>,
    pub snippet: String,
    /// Provider receive time, epoch milliseconds.
    pub internal_date: i64,
    pub body: Option<String>,
    /// RFC 5322 `Message-ID` header, used for reply threading.
    pub rfc_message_id: Option<String>,
    pub references: Option<String>,
}

impl MessageEnvelope {
    pub fn received_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.internal_date)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Address a reply should go to: `Reply-To` when present, otherwise the sender.
    pub fn reply_recipient(&self) -> &str {
        self.reply_to.as_deref().unwrap_or(&self.sender)
    }

    /// Text handed to the classifier and draft generator.
    pub fn content(&self) -> &str {
        self.body
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or(&self.snippet)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Classified,
    DraftCreated,
    DraftSent,
}

impl ActivityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityStatus::Classified => "classified",
            ActivityStatus::DraftCreated => "draft_created",
            ActivityStatus::DraftSent => "draft_sent",
        }
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classified" => Ok(ActivityStatus::Classified),
            "draft_created" => Ok(ActivityStatus::DraftCreated),
            "draft_sent" => Ok(ActivityStatus::DraftSent),
            other => Err(format!("unknown activity status: {other}")),
        }
    }
}

/// Durable log entry tracking one inbound message through classify, draft and send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: String,
    pub user_id: String,
    pub subject: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub category: Category,
    pub status: ActivityStatus,
    pub body: Option<String>,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub draft_id: Option<String>,
    pub draft_url: Option<String>,
    pub scheduled_send_time: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub message_id_after_send: Option<String>,
}

/// Fields known at classification time.
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub user_id: String,
    pub subject: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub category: Category,
    pub body: Option<String>,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
}

/// Stored mailbox OAuth token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Epoch seconds, derived from the most recent grant.
    pub expires_at: i64,
}

impl CredentialRecord {
    pub fn from_grant(grant: &TokenGrant, previous_refresh: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            access_token: grant.access_token.clone(),
            refresh_token: grant
                .refresh_token
                .clone()
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at: (now + Duration::seconds(grant.expires_in)).timestamp(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, skew_secs: i64) -> bool {
        self.expires_at <= now.timestamp() + skew_secs
    }

    pub fn is_renewable(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Token endpoint response body.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    pub refresh_token: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

/// Who background processing runs for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub subject_id: String,
    pub subject_contact: String,
    pub last_active_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn is_valid(&self, now: DateTime<Utc>, ttl_days: i64) -> bool {
        now - self.last_active_at < Duration::days(ttl_days)
    }
}

/// Durable record that a user has a connected mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integration {
    pub user_id: String,
    pub email_address: String,
    pub provider: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

/// User profile settings read by the pipeline and scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub auto_classify: bool,
    pub auto_draft: bool,
    pub signature: Option<String>,
    pub auto_send_drafts: bool,
    pub auto_send_delay_minutes: i64,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            auto_classify: true,
            auto_draft: true,
            signature: None,
            auto_send_drafts: true,
            auto_send_delay_minutes: 0,
        }
    }
}

/// Linked store credentials passed through to draft generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopContext {
    pub shop_domain: String,
    pub access_token: String,
}
