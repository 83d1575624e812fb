//! Sync orchestration: source → summarizer → report store, one ticket at a time.

pub mod pipeline;
pub mod summarizer;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use scsum_core::{Record, ReportStore, Summarizer, TicketReport, TicketSource};
use scsum_http::{HttpClientConfig, HttpFetcher, ReadFailurePolicy, ReadFailures, TokenBucketConfig};
use scsum_notion::NotionStore;
use scsum_shortcut::ShortcutClient;
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub use pipeline::{
    drain_into, map_stream, FetchTickets, PublishReport, SinkStep, Step, SummarizeTicket,
    TableRef, Watermark, WatermarkSource,
};
pub use summarizer::RuleSummarizer;

pub const CRATE_NAME: &str = "scsum-sync";

pub const DEFAULT_DATABASE_NAME: &str = "Ticket Reports";

/// Upper bound for `SCSUM_DEFAULT_LOOKBACK_DAYS`.
pub const MAX_LOOKBACK_DAYS: i64 = 3650;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub shortcut_api_url: String,
    pub shortcut_api_token: String,
    pub notion_api_url: String,
    pub notion_api_token: String,
    pub notion_page_name: String,
    pub notion_database_name: String,
    pub team_name: String,
    pub read_failure_policy: ReadFailurePolicy,
    pub default_lookback_days: i64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub notion_requests_per_second: u32,
    pub rules_path: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable lookup; blank values count
    /// as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &str| {
            get(name).with_context(|| format!("missing required environment variable {name}"))
        };

        Ok(Self {
            shortcut_api_url: get("SHORTCUT_API_URL")
                .unwrap_or_else(|| scsum_shortcut::DEFAULT_API_URL.to_string()),
            shortcut_api_token: required("SHORTCUT_API_TOKEN")?,
            notion_api_url: get("NOTION_API_URL")
                .unwrap_or_else(|| scsum_notion::DEFAULT_API_URL.to_string()),
            notion_api_token: required("NOTION_API_TOKEN")?,
            notion_page_name: required("NOTION_PAGE_NAME")?,
            notion_database_name: get("NOTION_DATABASE_NAME")
                .unwrap_or_else(|| DEFAULT_DATABASE_NAME.to_string()),
            team_name: required("SHORTCUT_TEAM_NAME")?,
            read_failure_policy: parse_or("SCSUM_READ_FAILURE_POLICY", get, ReadFailurePolicy::default())?,
            default_lookback_days: lookback_days(parse_or("SCSUM_DEFAULT_LOOKBACK_DAYS", get, 30)?)?,
            http_timeout_secs: parse_or("SCSUM_HTTP_TIMEOUT_SECS", get, 20)?,
            user_agent: get("SCSUM_USER_AGENT").unwrap_or_else(|| "scsum/0.1".to_string()),
            notion_requests_per_second: parse_or("SCSUM_NOTION_REQUESTS_PER_SECOND", get, 3)?,
            rules_path: get("SCSUM_RULES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rules/summarizer.yaml")),
        })
    }

    pub fn target(&self) -> TableRef {
        TableRef {
            store_name: self.notion_page_name.clone(),
            table_name: self.notion_database_name.clone(),
        }
    }

    fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

fn parse_or<T>(name: &str, get: impl Fn(&str) -> Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid value `{raw}` for {name}: {err}")),
        None => Ok(default),
    }
}

fn lookback_days(days: i64) -> Result<i64> {
    if !(0..=MAX_LOOKBACK_DAYS).contains(&days) {
        bail!("invalid value `{days}` for SCSUM_DEFAULT_LOOKBACK_DAYS: expected 0..={MAX_LOOKBACK_DAYS}");
    }
    Ok(days)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub team_id: String,
    pub watermark: DateTime<Utc>,
    pub watermark_source: WatermarkSource,
    pub reports_saved: usize,
    pub swallowed_read_failures: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct SyncPipeline {
    target: TableRef,
    store: Arc<dyn ReportStore>,
    fetch: FetchTickets,
    summarize: SummarizeTicket,
    publish: PublishReport,
    read_failures: Arc<ReadFailures>,
}

impl SyncPipeline {
    pub fn new(
        team_name: impl Into<String>,
        target: TableRef,
        source: Arc<dyn TicketSource>,
        store: Arc<dyn ReportStore>,
        summarizer: Arc<dyn Summarizer>,
        default_lookback: chrono::Duration,
    ) -> Self {
        Self {
            fetch: FetchTickets::new(team_name, target.clone(), source, store.clone(), default_lookback),
            summarize: SummarizeTicket::new(summarizer),
            publish: PublishReport::new(target.clone(), store.clone()),
            target,
            store,
            read_failures: Arc::new(ReadFailures::default()),
        }
    }

    /// Counter shared with the source and store clients, reported per run.
    pub fn with_read_failures(mut self, read_failures: Arc<ReadFailures>) -> Self {
        self.read_failures = read_failures;
        self
    }

    pub fn with_since_override(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.fetch = self.fetch.with_since_override(since);
        self
    }

    pub fn target(&self) -> &TableRef {
        &self.target
    }

    pub async fn ensure_table(&self) -> Result<()> {
        let ready = self
            .store
            .ensure_table(
                &self.target.store_name,
                &self.target.table_name,
                TicketReport::schema(),
            )
            .await
            .context("ensuring destination table")?;
        if !ready {
            bail!(
                "destination table `{}` under `{}` is not available",
                self.target.table_name,
                self.target.store_name
            );
        }
        Ok(())
    }

    pub async fn watermark(&self) -> Result<Watermark> {
        self.fetch.watermark().await
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let swallowed_before = self.read_failures.swallowed();

        self.ensure_table().await?;
        let team_id = self.fetch.team_id().await?.to_string();
        let (watermark, tickets) = self.fetch.open().await?;

        let mut reports = map_stream(tickets, &self.summarize);
        let reports_saved = drain_into(&mut reports, &self.publish).await?;

        let finished_at = Utc::now();
        let swallowed_read_failures = self.read_failures.swallowed() - swallowed_before;
        info!(
            team_id = %team_id,
            reports_saved,
            swallowed_read_failures,
            "sync run finished"
        );

        Ok(SyncRunSummary {
            run_id,
            team_id,
            watermark: watermark.at,
            watermark_source: watermark.source,
            reports_saved,
            swallowed_read_failures,
            started_at,
            finished_at,
        })
    }
}

fn notion_store(config: &SyncConfig, read_failures: Arc<ReadFailures>) -> Result<NotionStore> {
    let http = HttpFetcher::new(HttpClientConfig {
        token_bucket: TokenBucketConfig::per_second(config.notion_requests_per_second),
        ..config.http_config()
    })?;
    Ok(NotionStore::new(
        Arc::new(http),
        &config.notion_api_url,
        &config.notion_api_token,
        read_failures,
    ))
}

fn shortcut_client(config: &SyncConfig, read_failures: Arc<ReadFailures>) -> Result<ShortcutClient> {
    let http = HttpFetcher::new(config.http_config())?;
    Ok(ShortcutClient::new(
        Arc::new(http),
        &config.shortcut_api_url,
        &config.shortcut_api_token,
        read_failures,
    ))
}

/// Wires the HTTP clients, the rule summarizer and the pipeline from `config`.
pub fn pipeline_from_config(config: &SyncConfig) -> Result<SyncPipeline> {
    let read_failures = Arc::new(ReadFailures::new(config.read_failure_policy));
    let source = shortcut_client(config, read_failures.clone())?;
    let store = notion_store(config, read_failures.clone())?;
    let summarizer = RuleSummarizer::from_path(&config.rules_path)?;
    let default_lookback = TimeDelta::try_days(config.default_lookback_days)
        .with_context(|| format!("lookback of {} days is out of range", config.default_lookback_days))?;

    Ok(SyncPipeline::new(
        &config.team_name,
        config.target(),
        Arc::new(source),
        Arc::new(store),
        Arc::new(summarizer),
        default_lookback,
    )
    .with_read_failures(read_failures))
}

pub async fn run_sync_once_from_env(since: Option<DateTime<Utc>>) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = pipeline_from_config(&config)?.with_since_override(since);
    pipeline.run_once().await
}

pub async fn ensure_table_from_env() -> Result<TableRef> {
    let config = SyncConfig::from_env()?;
    let read_failures = Arc::new(ReadFailures::new(config.read_failure_policy));
    let store = notion_store(&config, read_failures)?;
    let target = config.target();
    let ready = store
        .ensure_table(&target.store_name, &target.table_name, TicketReport::schema())
        .await?;
    if !ready {
        bail!(
            "destination table `{}` under `{}` is not available",
            target.table_name,
            target.store_name
        );
    }
    Ok(target)
}

/// Last synced timestamp of the configured table, `None` when it holds no rows.
pub async fn watermark_from_env() -> Result<Option<DateTime<Utc>>> {
    let config = SyncConfig::from_env()?;
    let read_failures = Arc::new(ReadFailures::new(config.read_failure_policy));
    let store = notion_store(&config, read_failures)?;
    let target = config.target();
    Ok(store
        .last_synced_at(&target.store_name, &target.table_name, TicketReport::schema())
        .await?)
}
