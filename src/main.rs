use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use mailpilot::auth::{self, CredentialStore, KeyringCredentialStore};
use mailpilot::client::{MailboxClient, RetryPolicy};
use mailpilot::config::{Config, DEFAULT_CONFIG_PATH};
use mailpilot::db::Database;
use mailpilot::driver::{Driver, DriverDeps, TickOutcome};
use mailpilot::http::{Connectivity, HttpTransport, HyperTransport, TcpProbe};
use mailpilot::models::{ActivityStatus, Integration, SessionRecord};
use mailpilot::refresh::{AuthSignals, TokenManager};
use mailpilot::store::{ActivityStore, IntegrationStore, SessionStore};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "mailpilot", version, about = "Classifies customer mail and drafts replies")]
struct Cli {
    /// Verbose logging (RUST_LOG still takes precedence)
    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Poll on both timers until interrupted (default)
    Run,
    /// Run a single guarded cycle and exit
    Once,
    /// Connect a mailbox through the browser consent flow
    Login,
    /// Forget stored mailbox credentials; the session record is kept
    Logout,
    /// Show session, credential and activity state
    Status,
}

fn init_tracing(debug: bool) {
    let default = if debug { "mailpilot=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

struct App {
    config: Config,
    db: Database,
    credentials: Arc<dyn CredentialStore>,
    transport: Arc<dyn HttpTransport>,
    connectivity: Arc<dyn Connectivity>,
}

impl App {
    fn driver(&self) -> (Arc<Driver>, tokio::sync::mpsc::UnboundedReceiver<mailpilot::refresh::AuthEvent>) {
        let (signals, events) = AuthSignals::channel();
        let deps = DriverDeps::from_database(
            self.db.clone(),
            self.credentials.clone(),
            self.transport.clone(),
            self.connectivity.clone(),
            &self.config,
        );
        (Arc::new(Driver::new(deps, self.config.clone(), signals)), events)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let mut config = Config::load_from(&cli.config)?;
    auth::fill_client_from_secret(&mut config.oauth).await?;

    let db = Database::new(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    db.run_migrations()
        .await
        .context("Failed to apply database schema")?;

    let app = App {
        transport: Arc::new(HyperTransport::new(config.mailbox.request_timeout())?),
        connectivity: Arc::new(TcpProbe::new(
            config.mailbox.connectivity_probe.clone(),
            PROBE_TIMEOUT,
        )),
        credentials: Arc::new(KeyringCredentialStore::default()),
        config,
        db,
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&app).await,
        Command::Once => once(&app).await,
        Command::Login => login(&app).await,
        Command::Logout => {
            app.credentials
                .clear()
                .await
                .context("Failed to clear credentials")?;
            println!("Mailbox credentials removed. Background processing stops until the next login.");
            Ok(())
        }
        Command::Status => status(&app).await,
    }
}

async fn run(app: &App) -> Result<()> {
    let (driver, events) = app.driver();
    driver.set_foreground(std::io::stdout().is_terminal());
    let handle = driver.spawn(events);
    info!(
        foreground_secs = app.config.scheduler.foreground_interval_secs,
        background_secs = app.config.scheduler.background_interval_secs,
        "mailpilot running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down");
    drop(handle);
    Ok(())
}

async fn once(app: &App) -> Result<()> {
    let (driver, _events) = app.driver();
    match driver.tick().await {
        TickOutcome::Completed(report) => {
            println!(
                "Listed {} unread, classified {}, drafted {}, sent {} ({} scheduled sends due, {} sent)",
                report.ingest.listed,
                report.ingest.classified,
                report.ingest.drafted,
                report.ingest.sent,
                report.sends.due,
                report.sends.sent,
            );
            if let Some(e) = &report.ingest_error {
                println!("Ingestion failed: {}", e);
            }
            if let Some(e) = &report.send_error {
                println!("Auto-send failed: {}", e);
            }
            Ok(())
        }
        TickOutcome::Skipped(reason) => {
            println!("Cycle skipped: {:?}", reason);
            Ok(())
        }
        TickOutcome::Failed { auth: true, message } => {
            anyhow::bail!("Mailbox authentication failed ({}). Run `mailpilot login`.", message)
        }
        TickOutcome::Failed { message, .. } => anyhow::bail!("Cycle failed: {}", message),
    }
}

async fn login(app: &App) -> Result<()> {
    auth::interactive_login(&app.config.oauth.secret_path, app.credentials.clone()).await?;

    let (signals, _events) = AuthSignals::channel();
    let tokens = Arc::new(TokenManager::new(
        app.credentials.clone(),
        app.transport.clone(),
        app.config.oauth.clone(),
        signals,
    ));
    let client = MailboxClient::new(
        app.transport.clone(),
        app.connectivity.clone(),
        tokens,
        app.config.mailbox.api_base.clone(),
        RetryPolicy::from(&app.config.retry),
    );
    let profile = client
        .get_profile()
        .await
        .context("Failed to read mailbox profile")?;

    let record = app
        .credentials
        .load()
        .await?
        .context("Credentials missing right after login")?;
    app.db
        .upsert_session(&SessionRecord {
            subject_id: profile.email_address.clone(),
            subject_contact: profile.email_address.clone(),
            last_active_at: Utc::now(),
        })
        .await?;
    app.db
        .upsert_integration(&Integration {
            user_id: profile.email_address.clone(),
            email_address: profile.email_address.clone(),
            provider: "gmail".to_string(),
            access_token: Some(record.access_token),
            refresh_token: record.refresh_token,
            expires_at: Some(record.expires_at),
        })
        .await?;

    println!("Connected {}.", profile.email_address);
    Ok(())
}

async fn status(app: &App) -> Result<()> {
    let now = Utc::now();
    let session = app.db.active_session().await?;
    match &session {
        Some(s) => println!(
            "Session:     {} (last active {}, {})",
            s.subject_contact,
            s.last_active_at.format("%Y-%m-%d %H:%M"),
            if s.is_valid(now, app.config.scheduler.session_ttl_days) {
                "valid"
            } else {
                "expired"
            }
        ),
        None => println!("Session:     none"),
    }

    match app.credentials.load().await {
        Ok(Some(record)) if record.is_expired(now, 0) => println!(
            "Credentials: stored, access token expired{}",
            if record.is_renewable() { " (renewable)" } else { "" }
        ),
        Ok(Some(_)) => println!("Credentials: stored"),
        Ok(None) => println!("Credentials: none, run `mailpilot login`"),
        Err(e) => println!("Credentials: unreadable ({})", e),
    }

    let Some(session) = session else {
        return Ok(());
    };
    if let Some(integration) = app.db.integration(&session.subject_id).await? {
        println!("Mailbox:     {} via {}", integration.email_address, integration.provider);
    }
    for status in [
        ActivityStatus::Classified,
        ActivityStatus::DraftCreated,
        ActivityStatus::DraftSent,
    ] {
        let count = app.db.list_by_status(&session.subject_id, status).await?.len();
        println!("{:<13}{}", format!("{}:", status), count);
    }
    Ok(())
}
