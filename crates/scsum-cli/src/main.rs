use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use scsum_core::{Record, TicketReport};
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scsum")]
#[command(about = "Summarize Shortcut tickets into a Notion report table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch tickets updated since the last synced report and save one report each.
    Sync {
        /// Fetch from this RFC3339 timestamp instead of the stored watermark.
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,
    },
    /// Create the destination table if it does not exist yet.
    InitTable,
    /// Print the timestamp of the most recently synced ticket.
    Watermark,
    /// Print the destination table schema.
    Schema,
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| format!("expected an RFC3339 timestamp: {err}"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { since: None }) {
        Commands::Sync { since } => {
            let summary = scsum_sync::run_sync_once_from_env(since).await?;
            println!(
                "sync complete: run_id={} team_id={} since={} ({:?}) reports={} swallowed_read_failures={}",
                summary.run_id,
                summary.team_id,
                summary.watermark.to_rfc3339(),
                summary.watermark_source,
                summary.reports_saved,
                summary.swallowed_read_failures
            );
        }
        Commands::InitTable => {
            let target = scsum_sync::ensure_table_from_env().await?;
            info!(store = %target.store_name, table = %target.table_name, "destination table ready");
            println!("table `{}` ready under `{}`", target.table_name, target.store_name);
        }
        Commands::Watermark => match scsum_sync::watermark_from_env().await? {
            Some(at) => println!("{}", at.to_rfc3339()),
            None => println!("no data yet"),
        },
        Commands::Schema => {
            let schema = serde_json::to_string_pretty(&TicketReport::schema().to_schema())
                .context("rendering schema")?;
            println!("{schema}");
        }
    }

    Ok(())
}
