//! Timer-driven runner: at most one ingestion + auto-send cycle at a time,
//! with back-off after repeated authentication failures.

use crate::auth::CredentialStore;
use crate::autosend::{AutoSendScheduler, SentLedger, TickReport};
use crate::client::{MailboxClient, RetryPolicy};
use crate::config::Config;
use crate::db::Database;
use crate::dedup::DedupTracker;
use crate::error::{ApiError, PipelineError, StoreError};
use crate::http::{Connectivity, HttpTransport};
use crate::labels::LabelCache;
use crate::models::{CredentialRecord, Integration, SessionRecord};
use crate::pipeline::{IngestReport, IngestionPipeline, MailboxUser};
use crate::refresh::{AuthEvent, AuthSignals, TokenManager};
use crate::services::{Classifier, DraftGenerator, HttpClassifier, HttpDraftGenerator};
use crate::store::{ActivityStore, IntegrationStore, PreferenceStore, SessionStore};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Everything the driver talks to.
#[derive(Clone)]
pub struct DriverDeps {
    pub sessions: Arc<dyn SessionStore>,
    pub integrations: Arc<dyn IntegrationStore>,
    pub activities: Arc<dyn ActivityStore>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub transport: Arc<dyn HttpTransport>,
    pub connectivity: Arc<dyn Connectivity>,
    pub classifier: Arc<dyn Classifier>,
    pub drafts: Arc<dyn DraftGenerator>,
}

impl DriverDeps {
    /// Wires every store to one database and the services to their HTTP endpoints.
    pub fn from_database(
        db: Database,
        credentials: Arc<dyn CredentialStore>,
        transport: Arc<dyn HttpTransport>,
        connectivity: Arc<dyn Connectivity>,
        config: &Config,
    ) -> Self {
        let db = Arc::new(db);
        Self {
            sessions: db.clone(),
            integrations: db.clone(),
            activities: db.clone(),
            preferences: db,
            credentials,
            classifier: Arc::new(HttpClassifier::new(transport.clone(), &config.services)),
            drafts: Arc::new(HttpDraftGenerator::new(transport.clone(), &config.services)),
            transport,
            connectivity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
    NoSession,
    AuthBackoff,
    NoIntegration,
}

/// Results of one cycle. Ingestion and the auto-send sweep run independently,
/// so either may have failed while the other made progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub ingest: IngestReport,
    pub sends: TickReport,
    pub ingest_error: Option<String>,
    pub send_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Completed(CycleReport),
    Failed { auth: bool, message: String },
}

/// Holds the `running` flag for the duration of one cycle.
pub struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    pub fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Per-user client stack, rebuilt after auth failures and re-authentication.
struct RunContext {
    user_id: String,
    pipeline: IngestionPipeline,
    scheduler: Arc<AutoSendScheduler>,
}

pub struct Driver {
    deps: DriverDeps,
    config: Config,
    signals: AuthSignals,
    dedup: Arc<DedupTracker>,
    sent: Arc<SentLedger>,
    running: AtomicBool,
    foreground: AtomicBool,
    auth_failures: AtomicU32,
    /// Credentials stored when the last auth failure was recorded; `None`
    /// when the store was empty. Backoff ends once the store differs.
    failed_credentials: std::sync::Mutex<Option<CredentialFingerprint>>,
    context: Mutex<Option<Arc<RunContext>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CredentialFingerprint {
    access_token: String,
    expires_at: i64,
}

impl From<&CredentialRecord> for CredentialFingerprint {
    fn from(record: &CredentialRecord) -> Self {
        Self {
            access_token: record.access_token.clone(),
            expires_at: record.expires_at,
        }
    }
}

/// Background timer and event tasks; aborted on drop.
pub struct DriverHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Driver {
    pub fn new(deps: DriverDeps, config: Config, signals: AuthSignals) -> Self {
        Self {
            deps,
            config,
            signals,
            dedup: Arc::new(DedupTracker::new()),
            sent: Arc::new(SentLedger::new()),
            running: AtomicBool::new(false),
            foreground: AtomicBool::new(false),
            auth_failures: AtomicU32::new(0),
            failed_credentials: std::sync::Mutex::new(None),
            context: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn auth_failures(&self) -> u32 {
        self.auth_failures.load(Ordering::Acquire)
    }

    /// Enables the fast timer while an interactive user is present.
    pub fn set_foreground(&self, present: bool) {
        self.foreground.store(present, Ordering::Release);
    }

    /// One guarded cycle. Safe to call from any number of timers at once.
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!("Previous cycle still running, skipping tick");
            return TickOutcome::Skipped(SkipReason::AlreadyRunning);
        };

        if !self.deps.connectivity.is_online().await {
            debug!("Offline, skipping tick");
            return TickOutcome::Skipped(SkipReason::Offline);
        }

        let Some(session) = self.valid_session().await else {
            return TickOutcome::Skipped(SkipReason::NoSession);
        };

        let threshold = self.config.scheduler.auth_failure_threshold.max(1);
        if self.auth_failures() >= threshold {
            if !self.credentials_replaced().await {
                debug!(failures = self.auth_failures(), "Backing off after auth failures");
                return TickOutcome::Skipped(SkipReason::AuthBackoff);
            }
            info!("New mailbox credentials found, resuming");
            self.reset_auth().await;
            self.signals.reauth_success(Some(&session.subject_id));
        }

        let Some(integration) = self.resolve_integration(&session).await else {
            debug!(user_id = %session.subject_id, "No mailbox integration for session");
            return TickOutcome::Skipped(SkipReason::NoIntegration);
        };
        let user = MailboxUser {
            user_id: session.subject_id.clone(),
            email_address: integration.email_address,
        };

        match self.run_cycle(&user).await {
            Ok(report) => {
                self.auth_failures.store(0, Ordering::Release);
                if let Err(e) = self.deps.sessions.touch_session(&user.user_id, Utc::now()).await {
                    warn!(error = %e, "Failed to refresh session activity");
                }
                TickOutcome::Completed(report)
            }
            Err(e) if e.is_auth() => {
                self.record_auth_failure(&user, &e).await;
                TickOutcome::Failed {
                    auth: true,
                    message: e.to_string(),
                }
            }
            Err(e) => {
                error!(user_id = %user.user_id, error = %e, "Cycle aborted");
                TickOutcome::Failed {
                    auth: false,
                    message: e.to_string(),
                }
            }
        }
    }

    async fn valid_session(&self) -> Option<SessionRecord> {
        match self.deps.sessions.active_session().await {
            Ok(Some(session)) if session.is_valid(Utc::now(), self.config.scheduler.session_ttl_days) => {
                Some(session)
            }
            Ok(Some(session)) => {
                debug!(user_id = %session.subject_id, "Session expired");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to load session");
                None
            }
        }
    }

    /// Looks up the session's mailbox integration, touching the session and
    /// retrying once when the store refuses access.
    async fn resolve_integration(&self, session: &SessionRecord) -> Option<Integration> {
        let user_id = session.subject_id.as_str();
        match self.deps.integrations.integration(user_id).await {
            Ok(found) => found,
            Err(StoreError::PermissionDenied(reason)) => {
                debug!(user_id, reason = %reason, "Integration lookup denied, refreshing session");
                if let Err(e) = self.deps.sessions.touch_session(user_id, Utc::now()).await {
                    warn!(error = %e, "Failed to refresh session");
                }
                self.deps
                    .integrations
                    .integration(user_id)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(user_id, error = %e, "Integration lookup failed");
                        None
                    })
            }
            Err(e) => {
                warn!(user_id, error = %e, "Integration lookup failed");
                None
            }
        }
    }

    /// Ingests new mail, then sweeps due drafts. A non-auth ingestion failure
    /// does not hold back the sweep; an auth failure ends the cycle.
    async fn run_cycle(&self, user: &MailboxUser) -> Result<CycleReport, PipelineError> {
        let context = self.context_for(user).await;
        let mut report = CycleReport::default();

        let ingest_failure = match context.pipeline.run(user).await {
            Ok(ingest) => {
                report.ingest = ingest;
                None
            }
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => {
                error!(user_id = %user.user_id, error = %e, "Ingestion failed");
                report.ingest_error = Some(e.to_string());
                Some(e)
            }
        };

        match context.scheduler.tick(&user.user_id).await {
            Ok(sends) => report.sends = sends,
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => {
                error!(user_id = %user.user_id, error = %e, "Auto-send sweep failed");
                if let Some(ingest) = ingest_failure {
                    return Err(ingest);
                }
                report.send_error = Some(e.to_string());
            }
        }
        Ok(report)
    }

    async fn context_for(&self, user: &MailboxUser) -> Arc<RunContext> {
        let mut slot = self.context.lock().await;
        if let Some(context) = slot.as_ref().filter(|c| c.user_id == user.user_id) {
            return context.clone();
        }

        let deps = &self.deps;
        let tokens = Arc::new(
            TokenManager::new(
                deps.credentials.clone(),
                deps.transport.clone(),
                self.config.oauth.clone(),
                self.signals.clone(),
            )
            .for_user(&user.user_id, deps.integrations.clone()),
        );
        let client = Arc::new(MailboxClient::new(
            deps.transport.clone(),
            deps.connectivity.clone(),
            tokens,
            self.config.mailbox.api_base.clone(),
            RetryPolicy::from(&self.config.retry),
        ));
        let scheduler = Arc::new(
            AutoSendScheduler::new(client.clone(), deps.activities.clone(), deps.preferences.clone())
                .with_ledger(self.sent.clone()),
        );
        let pipeline = IngestionPipeline::new(
            client.clone(),
            Arc::new(LabelCache::new(client)),
            self.dedup.clone(),
            deps.activities.clone(),
            deps.preferences.clone(),
            deps.classifier.clone(),
            deps.drafts.clone(),
            scheduler.clone(),
            self.config.mailbox.page_size,
        );

        let context = Arc::new(RunContext {
            user_id: user.user_id.clone(),
            pipeline,
            scheduler,
        });
        *slot = Some(context.clone());
        context
    }

    async fn record_auth_failure(&self, user: &MailboxUser, err: &PipelineError) {
        let failures = self.auth_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(user_id = %user.user_id, failures, error = %err, "Mailbox authentication failed");

        if let PipelineError::Api(ApiError::Auth {
            message,
            notified: false,
        }) = err
        {
            self.signals.auth_error(Some(&user.user_id), message);
        }
        *self.context.lock().await = None;
        let stored = self.stored_credentials().await;
        *self.failed_credentials.lock().unwrap_or_else(|e| e.into_inner()) = stored;
    }

    async fn stored_credentials(&self) -> Option<CredentialFingerprint> {
        match self.deps.credentials.load().await {
            Ok(record) => record.as_ref().map(CredentialFingerprint::from),
            Err(e) => {
                warn!(error = %e, "Failed to read stored credentials");
                None
            }
        }
    }

    /// True once the credential store holds something other than what was
    /// there at the last auth failure, i.e. the user connected again.
    async fn credentials_replaced(&self) -> bool {
        let Some(current) = self.stored_credentials().await else {
            return false;
        };
        let failed = self.failed_credentials.lock().unwrap_or_else(|e| e.into_inner());
        failed.as_ref() != Some(&current)
    }

    /// Clears the failure counter and drops the cached client stack.
    pub async fn reset_auth(&self) {
        self.auth_failures.store(0, Ordering::Release);
        *self.failed_credentials.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.context.lock().await = None;
    }

    pub async fn handle_event(&self, event: AuthEvent) {
        match event {
            AuthEvent::AuthError { user_id, message, at } => {
                warn!(?user_id, %at, %message, "Mailbox needs to be reconnected: run `mailpilot login`");
            }
            AuthEvent::ReauthSuccess { user_id } => {
                info!(?user_id, "Mailbox re-authenticated, resuming");
                self.reset_auth().await;
                self.tick().await;
            }
        }
    }

    /// Starts the foreground timer, the background timer and the auth event
    /// listener. All three funnel into [`Driver::tick`].
    pub fn spawn(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<AuthEvent>) -> DriverHandle {
        let scheduler = &self.config.scheduler;
        let foreground_every = Duration::from_secs(scheduler.foreground_interval_secs.max(1));
        let background_every = Duration::from_secs(scheduler.background_interval_secs.max(1));

        let foreground = {
            let driver = self.clone();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(foreground_every);
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    timer.tick().await;
                    if driver.foreground.load(Ordering::Acquire) {
                        driver.tick().await;
                    }
                }
            })
        };

        let background = {
            let driver = self.clone();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(background_every);
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    timer.tick().await;
                    driver.tick().await;
                }
            })
        };

        let listener = {
            let driver = self.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    driver.handle_event(event).await;
                }
            })
        };

        DriverHandle {
            tasks: vec![foreground, background, listener],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;
    use crate::category::Category;
    use crate::http::AlwaysOnline;
    use crate::services::DraftRequest;
    use crate::testing::ScriptedTransport;
    use async_trait::async_trait;

    struct SlowOnline;

    #[async_trait]
    impl Connectivity for SlowOnline {
        async fn is_online(&self) -> bool {
            tokio::time::sleep(Duration::from_millis(50)).await;
            true
        }
    }

    struct Offline;

    #[async_trait]
    impl Connectivity for Offline {
        async fn is_online(&self) -> bool {
            false
        }
    }

    struct Other;

    #[async_trait]
    impl Classifier for Other {
        async fn classify(&self, _: &str, _: &str) -> Category {
            Category::Other
        }
    }

    #[async_trait]
    impl DraftGenerator for Other {
        async fn generate(&self, _: &DraftRequest<'_>) -> String {
            "ok".into()
        }
    }

    async fn driver(connectivity: Arc<dyn Connectivity>) -> Driver {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let deps = DriverDeps {
            sessions: db.clone(),
            integrations: db.clone(),
            activities: db.clone(),
            preferences: db,
            credentials: Arc::new(MemoryCredentialStore::default()),
            transport: Arc::new(ScriptedTransport::new()),
            connectivity,
            classifier: Arc::new(Other),
            drafts: Arc::new(Other),
        };
        let (signals, _rx) = AuthSignals::channel();
        Driver::new(deps, Config::default(), signals)
    }

    #[test]
    fn run_guard_is_exclusive_and_released_on_drop() {
        let flag = AtomicBool::new(false);
        let first = RunGuard::acquire(&flag);
        assert!(first.is_some());
        assert!(RunGuard::acquire(&flag).is_none());
        drop(first);
        assert!(!flag.load(Ordering::Acquire));
        assert!(RunGuard::acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn concurrent_ticks_never_both_run() {
        let driver = driver(Arc::new(SlowOnline)).await;

        let (a, b) = tokio::join!(driver.tick(), driver.tick());
        let skipped = [a, b]
            .iter()
            .filter(|o| **o == TickOutcome::Skipped(SkipReason::AlreadyRunning))
            .count();
        assert_eq!(skipped, 1);
        assert!(!driver.is_running());
    }

    #[tokio::test]
    async fn offline_and_missing_session_skip() {
        let offline = driver(Arc::new(Offline)).await;
        assert_eq!(offline.tick().await, TickOutcome::Skipped(SkipReason::Offline));

        let online = driver(Arc::new(AlwaysOnline)).await;
        assert_eq!(online.tick().await, TickOutcome::Skipped(SkipReason::NoSession));
        assert!(!online.is_running());
    }
}
