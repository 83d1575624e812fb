//! Core domain model and pipeline ports for scsum.

pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use schema::{
    encode_record, iso8601, FieldDescriptor, FieldKind, FieldValue, Record, RecordSchema,
    SchemaError,
};

pub const CRATE_NAME: &str = "scsum-core";

/// A comment as fetched from the ticket source. Owned by exactly one [`Ticket`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A fully assembled ticket; `comments` are in fetch (pagination) order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub name: String,
    pub description: String,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub comments: Vec<Comment>,
}

impl Ticket {
    /// Author of the first comment.
    pub fn actor(&self) -> Option<&str> {
        self.comments.first().map(|c| c.author.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Search,
    Authentication,
    Billing,
    Notifications,
    Infrastructure,
    Other,
}

impl Domain {
    pub const ALL: [Domain; 6] = [
        Domain::Search,
        Domain::Authentication,
        Domain::Billing,
        Domain::Notifications,
        Domain::Infrastructure,
        Domain::Other,
    ];

    pub const LABELS: &'static [&'static str] = &[
        "search",
        "authentication",
        "billing",
        "notifications",
        "infrastructure",
        "other",
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Search => "search",
            Domain::Authentication => "authentication",
            Domain::Billing => "billing",
            Domain::Notifications => "notifications",
            Domain::Infrastructure => "infrastructure",
            Domain::Other => "other",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Bug,
    FeatureRequest,
    Question,
    Incident,
    Other,
}

impl IssueType {
    pub const ALL: [IssueType; 5] = [
        IssueType::Bug,
        IssueType::FeatureRequest,
        IssueType::Question,
        IssueType::Incident,
        IssueType::Other,
    ];

    pub const LABELS: &'static [&'static str] =
        &["bug", "feature request", "question", "incident", "other"];

    pub fn as_str(self) -> &'static str {
        match self {
            IssueType::Bug => "bug",
            IssueType::FeatureRequest => "feature request",
            IssueType::Question => "question",
            IssueType::Incident => "incident",
            IssueType::Other => "other",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == label)
    }
}

/// Summarizer output for one ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketAnalysis {
    pub domain: Domain,
    pub issue_type: IssueType,
    pub summary: String,
    pub solution: String,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("ticket {0} has no comments, so the report actor is undefined")]
    NoComments(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketReport {
    pub name: String,
    pub id: String,
    pub actor: String,
    pub domain: Domain,
    pub issue_type: IssueType,
    pub summary: String,
    pub solution: String,
    pub ticket_url: Option<String>,
    pub ticket_created_at: DateTime<Utc>,
    pub ticket_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TicketReport {
    pub const WATERMARK_FIELD: &'static str = "ticket_updated_at";

    pub fn from_ticket(
        ticket: Ticket,
        analysis: TicketAnalysis,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ReportError> {
        let actor = ticket
            .actor()
            .ok_or_else(|| ReportError::NoComments(ticket.id.clone()))?
            .to_string();
        Ok(Self {
            name: ticket.name,
            id: ticket.id,
            actor,
            domain: analysis.domain,
            issue_type: analysis.issue_type,
            summary: analysis.summary,
            solution: analysis.solution,
            ticket_url: ticket.url,
            ticket_created_at: ticket.created_at,
            ticket_updated_at: ticket.updated_at,
            created_at,
        })
    }
}

static TICKET_REPORT_SCHEMA: Lazy<RecordSchema> = Lazy::new(|| {
    RecordSchema::new("TicketReport", FieldDescriptor::new("name", FieldKind::Text))
        .field(FieldDescriptor::new("id", FieldKind::Text))
        .field(FieldDescriptor::new("actor", FieldKind::Text))
        .field(FieldDescriptor::new(
            "domain",
            FieldKind::Enumeration(Domain::LABELS),
        ))
        .field(FieldDescriptor::new(
            "issue_type",
            FieldKind::Enumeration(IssueType::LABELS),
        ))
        .field(FieldDescriptor::new("summary", FieldKind::Text))
        .field(FieldDescriptor::new("solution", FieldKind::Text))
        .field(FieldDescriptor::new("ticket_url", FieldKind::Text))
        .field(FieldDescriptor::new("ticket_created_at", FieldKind::Timestamp))
        .field(FieldDescriptor::new("ticket_updated_at", FieldKind::Timestamp))
        .field(FieldDescriptor::new("created_at", FieldKind::Timestamp))
        .watermark(TicketReport::WATERMARK_FIELD)
});

impl Record for TicketReport {
    fn schema() -> &'static RecordSchema {
        &TICKET_REPORT_SCHEMA
    }

    fn values(&self) -> Vec<FieldValue> {
        vec![
            FieldValue::Text(self.name.clone()),
            FieldValue::Text(self.id.clone()),
            FieldValue::Text(self.actor.clone()),
            FieldValue::Label(self.domain.as_str().to_string()),
            FieldValue::Label(self.issue_type.as_str().to_string()),
            FieldValue::Text(self.summary.clone()),
            FieldValue::Text(self.solution.clone()),
            self.ticket_url
                .clone()
                .map_or(FieldValue::Empty, FieldValue::Text),
            FieldValue::Timestamp(self.ticket_created_at),
            FieldValue::Timestamp(self.ticket_updated_at),
            FieldValue::Timestamp(self.created_at),
        ]
    }
}

/// Pull-driven lazy sequence. Each call produces at most one element; `None`
/// means the sequence is exhausted and it is not restartable.
#[async_trait]
pub trait PullStream<T: Send>: Send {
    async fn next_item(&mut self) -> anyhow::Result<Option<T>>;
}

#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn resolve_team(&self, team_name: &str) -> anyhow::Result<String>;

    fn fetch_since<'a>(
        &'a self,
        team_id: &str,
        watermark: DateTime<Utc>,
    ) -> Box<dyn PullStream<Ticket> + 'a>;
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn ensure_table(
        &self,
        store_name: &str,
        table_name: &str,
        schema: &RecordSchema,
    ) -> anyhow::Result<bool>;

    async fn last_synced_at(
        &self,
        store_name: &str,
        table_name: &str,
        schema: &RecordSchema,
    ) -> anyhow::Result<Option<DateTime<Utc>>>;

    async fn save(
        &self,
        store_name: &str,
        table_name: &str,
        report: &TicketReport,
    ) -> anyhow::Result<()>;
}

/// Text-analysis collaborator producing classification and summaries.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn analyze(&self, ticket: &Ticket) -> anyhow::Result<TicketAnalysis>;
}
