use clap::Parser;
use mailpilot::config::{Config, DEFAULT_CONFIG_PATH};
use sqlx::Row;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "inspect_db", about = "Show recent activities for a sender or subject")]
struct Args {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Matched against sender and subject
    query: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let query = &args.query;
    let search_term = format!("%{}%", query);

    let config = Config::load_from(&args.config)?;
    let pool = SqlitePoolOptions::new()
        .connect(&config.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    let rows = sqlx::query(
        "SELECT id, user_id, sender, subject, timestamp, category, status, message_id, thread_id,
                draft_id, draft_url, scheduled_send_time, sent_at, message_id_after_send, body
         FROM activities
         WHERE sender LIKE ? OR subject LIKE ?
         ORDER BY timestamp DESC
         LIMIT 5",
    )
    .bind(&search_term)
    .bind(&search_term)
    .fetch_all(&pool)
    .await?;

    if rows.is_empty() {
        println!("No activities found matching '{}'", query);
        return Ok(());
    }

    let separator = "-".repeat(80);
    for row in rows {
        let optional = |column: &str| -> String {
            row.get::<Option<String>, _>(column)
                .unwrap_or_else(|| "(none)".to_string())
        };

        println!("Activity {}", row.get::<String, _>("id"));
        println!("User:      {}", row.get::<String, _>("user_id"));
        println!("From:      {}", row.get::<String, _>("sender"));
        println!("Subject:   {}", row.get::<String, _>("subject"));
        println!("Received:  {}", row.get::<String, _>("timestamp"));
        println!("Category:  {}", row.get::<String, _>("category"));
        println!("Status:    {}", row.get::<String, _>("status"));
        println!("Message:   {} (thread {})", optional("message_id"), optional("thread_id"));
        println!("Draft:     {} {}", optional("draft_id"), optional("draft_url"));
        println!("Send at:   {}", optional("scheduled_send_time"));
        println!("Sent:      {} as {}", optional("sent_at"), optional("message_id_after_send"));
        println!("{}", separator);
        match row.get::<Option<String>, _>("body") {
            Some(body) => println!("{}", body),
            None => println!("(no body)"),
        }
        println!("{}", separator);
    }

    Ok(())
}
