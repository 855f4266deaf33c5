use crate::client::MailboxClient;
use crate::error::{ApiError, PipelineError, StoreError};
use crate::gmail::{DraftRef, DraftRefKind, api};
use crate::models::ActivityStatus;
use crate::store::{ActivityStore, PreferenceStore};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoSendPreferences {
    pub enabled: bool,
    pub delay_minutes: i64,
}

impl Default for AutoSendPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    NotScheduled,
    Deferred(DateTime<Utc>),
    Sent { message_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Drafts this process has already sent, keyed by activity id, with the id of
/// the sent message. A send is never repeated for an activity in here, even
/// when recording it as sent failed.
#[derive(Default)]
pub struct SentLedger {
    sent: Mutex<HashMap<String, String>>,
}

impl SentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, activity_id: &str, message_id: &str) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(activity_id.to_string(), message_id.to_string());
    }

    fn sent_as(&self, activity_id: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(activity_id)
            .cloned()
    }

    fn forget(&self, activity_id: &str) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).remove(activity_id);
    }
}

/// Sends generated drafts once their per-user delay has elapsed.
pub struct AutoSendScheduler {
    client: Arc<MailboxClient>,
    activities: Arc<dyn ActivityStore>,
    preferences: Arc<dyn PreferenceStore>,
    ledger: Arc<SentLedger>,
}

impl AutoSendScheduler {
    pub fn new(
        client: Arc<MailboxClient>,
        activities: Arc<dyn ActivityStore>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        Self {
            client,
            activities,
            preferences,
            ledger: Arc::new(SentLedger::new()),
        }
    }

    /// Shares a ledger that outlives this scheduler, e.g. across client rebuilds.
    pub fn with_ledger(mut self, ledger: Arc<SentLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub async fn get_preferences(&self, user_id: &str) -> AutoSendPreferences {
        match self.preferences.preferences(user_id).await {
            Ok(Some(prefs)) => AutoSendPreferences {
                enabled: prefs.auto_send_drafts,
                delay_minutes: prefs.auto_send_delay_minutes.max(0),
            },
            Ok(None) => AutoSendPreferences::default(),
            Err(e) => {
                warn!(user_id, error = %e, "Could not read auto-send preferences, using defaults");
                AutoSendPreferences::default()
            }
        }
    }

    pub async fn schedule(
        &self,
        user_id: &str,
        draft_id: &str,
        activity_id: &str,
    ) -> Result<ScheduleOutcome, PipelineError> {
        self.schedule_at(user_id, draft_id, activity_id, Utc::now())
            .await
    }

    pub async fn schedule_at(
        &self,
        user_id: &str,
        draft_id: &str,
        activity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, PipelineError> {
        let prefs = self.get_preferences(user_id).await;
        if !prefs.enabled {
            debug!(activity_id, "Auto-send disabled");
            return Ok(ScheduleOutcome::NotScheduled);
        }

        let due = now + Duration::minutes(prefs.delay_minutes);
        self.activities.set_scheduled_send(activity_id, due).await?;
        if prefs.delay_minutes > 0 {
            info!(activity_id, due = %due, "Draft scheduled for sending");
            return Ok(ScheduleOutcome::Deferred(due));
        }

        if let Some(message_id) = self.ledger.sent_as(activity_id) {
            self.confirm_sent(activity_id, &message_id, Utc::now()).await?;
            return Ok(ScheduleOutcome::Sent { message_id });
        }
        let sent = self.send_draft(draft_id).await?;
        self.ledger.record(activity_id, &sent.id);
        self.confirm_sent(activity_id, &sent.id, Utc::now()).await?;
        info!(activity_id, message_id = %sent.id, "Draft sent immediately");
        Ok(ScheduleOutcome::Sent { message_id: sent.id })
    }

    pub async fn tick(&self, user_id: &str) -> Result<TickReport, PipelineError> {
        self.tick_at(user_id, Utc::now()).await
    }

    /// Sends every `draft_created` activity whose scheduled time has passed.
    /// Only an auth failure stops the sweep early.
    pub async fn tick_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<TickReport, PipelineError> {
        let mut report = TickReport::default();
        let pending = self
            .activities
            .list_by_status(user_id, ActivityStatus::DraftCreated)
            .await?;

        for activity in pending {
            let Some(draft_id) = activity.draft_id.as_deref().filter(|d| !d.is_empty()) else {
                warn!(activity_id = %activity.id, "Activity has no draft id, skipping");
                report.skipped += 1;
                continue;
            };
            match activity.scheduled_send_time {
                Some(at) if at <= now => {}
                _ => continue,
            }

            report.due += 1;
            if let Some(message_id) = self.ledger.sent_as(&activity.id) {
                debug!(activity_id = %activity.id, "Draft already sent, recording it");
                match self.confirm_sent(&activity.id, &message_id, now).await {
                    Ok(()) => report.sent += 1,
                    Err(e) => {
                        warn!(activity_id = %activity.id, error = %e, "Failed to record sent draft");
                        report.failed += 1;
                    }
                }
                continue;
            }

            match self.send_draft(draft_id).await {
                Ok(sent) => {
                    self.ledger.record(&activity.id, &sent.id);
                    match self.confirm_sent(&activity.id, &sent.id, now).await {
                        Ok(()) => {
                            info!(activity_id = %activity.id, message_id = %sent.id, "Scheduled draft sent");
                            report.sent += 1;
                        }
                        Err(e) => {
                            warn!(activity_id = %activity.id, error = %e, "Draft sent but not recorded");
                            report.failed += 1;
                        }
                    }
                }
                Err(e) if e.is_auth() => return Err(e.into()),
                Err(e) => {
                    warn!(activity_id = %activity.id, error = %e, "Failed to send scheduled draft");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn confirm_sent(
        &self,
        activity_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.activities
            .mark_sent(activity_id, at, Some(message_id))
            .await?;
        self.ledger.forget(activity_id);
        Ok(())
    }

    /// Sends a draft given as an API id, a UI id or a draft link.
    pub async fn send_draft(&self, raw: &str) -> Result<api::MessageRef, ApiError> {
        let draft_ref = DraftRef::parse(raw)
            .ok_or_else(|| ApiError::Other("empty draft reference".to_string()))?;

        if draft_ref.kind == DraftRefKind::DraftId {
            match self.client.send_draft(&draft_ref.id).await {
                Ok(sent) => return Ok(sent),
                Err(e) if e.is_auth() || e.is_retryable() => return Err(e),
                Err(e) => debug!(draft = %draft_ref.id, error = %e, "Direct send failed, resolving via draft list"),
            }
        }

        let resolved = self.resolve(&draft_ref).await?;
        self.client.send_draft(&resolved).await
    }

    async fn resolve(&self, draft_ref: &DraftRef) -> Result<String, ApiError> {
        let drafts = self.client.list_drafts().await?;
        let id = draft_ref.id.as_str();
        let message_id = |d: &api::Draft| d.message.as_ref().map(|m| m.id.clone()).unwrap_or_default();

        drafts
            .iter()
            .find(|d| d.id == id || message_id(d) == id)
            .or_else(|| {
                drafts.iter().find(|d| {
                    let mid = message_id(d);
                    d.id.contains(id) || id.contains(&d.id) || (!mid.is_empty() && (mid.contains(id) || id.contains(&mid)))
                })
            })
            .map(|d| d.id.clone())
            .ok_or_else(|| ApiError::Other(format!("draft {} not found", id)))
    }
}
