//! Pipeline steps: a ticket producer, a ticket → report transform and a report
//! sink, composed as pull streams so that draining the sink drives the chain
//! one ticket at a time.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scsum_core::{
    PullStream, Record, ReportStore, Summarizer, Ticket, TicketReport, TicketSource,
};
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Transform step.
#[async_trait]
pub trait Step<I: Send + 'static, O: Send + 'static>: Send + Sync {
    async fn apply(&self, input: I) -> Result<O>;
}

/// Terminal step.
#[async_trait]
pub trait SinkStep<T: Send + 'static>: Send + Sync {
    async fn consume(&self, input: T) -> Result<()>;
}

/// Lazily applies `step` to every element pulled from `inner`.
pub struct Mapped<'a, I: Send + 'static, O: Send + 'static> {
    inner: Box<dyn PullStream<I> + 'a>,
    step: &'a dyn Step<I, O>,
}

pub fn map_stream<'a, I, O>(
    inner: Box<dyn PullStream<I> + 'a>,
    step: &'a dyn Step<I, O>,
) -> Mapped<'a, I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    Mapped { inner, step }
}

#[async_trait]
impl<'a, I, O> PullStream<O> for Mapped<'a, I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    async fn next_item(&mut self) -> Result<Option<O>> {
        match self.inner.next_item().await? {
            Some(input) => Ok(Some(self.step.apply(input).await?)),
            None => Ok(None),
        }
    }
}

/// Pulls `stream` to exhaustion, handing each element to `sink` before the
/// next one is pulled. Returns the number of elements consumed.
pub async fn drain_into<T: Send + 'static>(
    stream: &mut (dyn PullStream<T> + '_),
    sink: &dyn SinkStep<T>,
) -> Result<usize> {
    let mut consumed = 0;
    while let Some(item) = stream.next_item().await? {
        sink.consume(item).await?;
        consumed += 1;
    }
    Ok(consumed)
}

/// Destination table of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRef {
    pub store_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkSource {
    /// Latest stored report.
    Store,
    /// Store had no data yet; now minus the default lookback.
    Fallback,
    /// Supplied by the caller.
    Override,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub at: DateTime<Utc>,
    pub source: WatermarkSource,
}

/// Producer step: resolves the team once per run and opens the ticket stream
/// from the store's watermark.
pub struct FetchTickets {
    team_name: String,
    target: TableRef,
    source: Arc<dyn TicketSource>,
    store: Arc<dyn ReportStore>,
    default_lookback: Duration,
    since_override: Option<DateTime<Utc>>,
    team_id: OnceCell<String>,
}

impl FetchTickets {
    pub fn new(
        team_name: impl Into<String>,
        target: TableRef,
        source: Arc<dyn TicketSource>,
        store: Arc<dyn ReportStore>,
        default_lookback: Duration,
    ) -> Self {
        Self {
            team_name: team_name.into(),
            target,
            source,
            store,
            default_lookback,
            since_override: None,
            team_id: OnceCell::new(),
        }
    }

    pub fn with_since_override(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.since_override = since;
        self
    }

    /// Resolved on first use, then reused for the rest of the run.
    pub async fn team_id(&self) -> Result<&str> {
        let team_id = self
            .team_id
            .get_or_try_init(|| async {
                self.source
                    .resolve_team(&self.team_name)
                    .await
                    .with_context(|| format!("resolving team `{}`", self.team_name))
            })
            .await?;
        Ok(team_id.as_str())
    }

    pub async fn watermark(&self) -> Result<Watermark> {
        if let Some(at) = self.since_override {
            return Ok(Watermark {
                at,
                source: WatermarkSource::Override,
            });
        }

        let stored = self
            .store
            .last_synced_at(
                &self.target.store_name,
                &self.target.table_name,
                TicketReport::schema(),
            )
            .await
            .context("reading last synced timestamp")?;

        Ok(match stored {
            Some(at) => Watermark {
                at,
                source: WatermarkSource::Store,
            },
            None => Watermark {
                at: Utc::now()
                    .checked_sub_signed(self.default_lookback)
                    .context("fallback watermark is out of range")?,
                source: WatermarkSource::Fallback,
            },
        })
    }

    pub async fn open(&self) -> Result<(Watermark, Box<dyn PullStream<Ticket> + '_>)> {
        let team_id = self.team_id().await?;
        let watermark = self.watermark().await?;
        info!(team_id, since = %watermark.at, source = ?watermark.source, "opening ticket stream");
        Ok((watermark, self.source.fetch_since(team_id, watermark.at)))
    }
}

/// Transform step: one summarizer call per ticket.
pub struct SummarizeTicket {
    summarizer: Arc<dyn Summarizer>,
}

impl SummarizeTicket {
    pub fn new(summarizer: Arc<dyn Summarizer>) -> Self {
        Self { summarizer }
    }
}

#[async_trait]
impl Step<Ticket, TicketReport> for SummarizeTicket {
    async fn apply(&self, ticket: Ticket) -> Result<TicketReport> {
        let analysis = self
            .summarizer
            .analyze(&ticket)
            .await
            .with_context(|| format!("summarizing ticket {}", ticket.id))?;
        debug!(ticket_id = %ticket.id, domain = analysis.domain.as_str(), "summarized ticket");
        Ok(TicketReport::from_ticket(ticket, analysis, Utc::now())?)
    }
}

/// Sink step: persists each report as it arrives.
pub struct PublishReport {
    target: TableRef,
    store: Arc<dyn ReportStore>,
}

impl PublishReport {
    pub fn new(target: TableRef, store: Arc<dyn ReportStore>) -> Self {
        Self { target, store }
    }
}

#[async_trait]
impl SinkStep<TicketReport> for PublishReport {
    async fn consume(&self, report: TicketReport) -> Result<()> {
        self.store
            .save(&self.target.store_name, &self.target.table_name, &report)
            .await
            .with_context(|| format!("saving report for ticket {}", report.id))
    }
}
