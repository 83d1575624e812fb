//! Ticket source backed by the Shortcut REST API (v3).
//!
//! Tickets are fetched with two nested cursor-paginated loops: a story search
//! scoped to `team:<id> updated-after:<watermark>`, then, for every story, its
//! comments. The story loop is lazy (one ticket per pull) while each ticket's
//! comment loop is drained before the ticket is handed out.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use scsum_core::{Comment, PullStream, Ticket, TicketSource};
use scsum_http::{HttpError, JsonRequest, JsonTransport, ReadFailures};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "scsum-shortcut";

pub const DEFAULT_API_URL: &str = "https://api.app.shortcut.com/api/v3";
pub const PAGE_SIZE: usize = 100;
pub const TOKEN_HEADER: &str = "Shortcut-Token";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("no team named `{0}`")]
    TeamNotFound(String),
    #[error("expected {expected} for `{field}`, got {found}")]
    MalformedField {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("`{field}` is not an ISO-8601 timestamp: `{value}`")]
    InvalidTimestamp {
        field: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("unexpected {what} payload: {reason}")]
    UnexpectedPayload { what: &'static str, reason: String },
}

fn json_type_name(value: Option<&JsonValue>) -> &'static str {
    match value {
        None => "nothing",
        Some(JsonValue::Null) => "null",
        Some(JsonValue::Bool(_)) => "a boolean",
        Some(JsonValue::Number(_)) => "a number",
        Some(JsonValue::String(_)) => "a string",
        Some(JsonValue::Array(_)) => "an array",
        Some(JsonValue::Object(_)) => "an object",
    }
}

/// Required string field.
pub fn extract_str(payload: &JsonValue, key: &str) -> Result<String, SourceError> {
    match payload.get(key) {
        Some(JsonValue::String(s)) => Ok(s.clone()),
        other => Err(SourceError::MalformedField {
            field: key.to_string(),
            expected: "a string",
            found: json_type_name(other),
        }),
    }
}

/// Optional string field: absent or null is `None`, anything else must be a string.
pub fn extract_optional_str(payload: &JsonValue, key: &str) -> Result<Option<String>, SourceError> {
    match payload.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(_) => extract_str(payload, key).map(Some),
    }
}

/// Required ISO-8601 timestamp field.
pub fn extract_datetime(payload: &JsonValue, key: &str) -> Result<DateTime<Utc>, SourceError> {
    let raw = match payload.get(key) {
        Some(JsonValue::String(s)) => s,
        other => {
            return Err(SourceError::MalformedField {
                field: key.to_string(),
                expected: "an ISO-8601 string",
                found: json_type_name(other),
            })
        }
    };
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| SourceError::InvalidTimestamp {
            field: key.to_string(),
            value: raw.clone(),
            source,
        })
}

fn is_truthy(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::String(s)) => !s.is_empty(),
        Some(JsonValue::Number(n)) => n.as_f64() != Some(0.0),
        Some(JsonValue::Array(a)) => !a.is_empty(),
        Some(JsonValue::Object(o)) => !o.is_empty(),
    }
}

/// Continuation token of a page; empty or absent means the last page.
fn next_cursor(page: &JsonValue) -> Option<String> {
    let next = page.get("next");
    if !is_truthy(next) {
        return None;
    }
    match next {
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn page_items(what: &'static str, page: &JsonValue) -> Result<Vec<JsonValue>, SourceError> {
    match page.get("data") {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::Array(items)) => Ok(items.clone()),
        other => Err(SourceError::UnexpectedPayload {
            what,
            reason: format!("`data` is {}", json_type_name(other)),
        }),
    }
}

pub fn to_comment(payload: &JsonValue) -> Result<Comment, SourceError> {
    Ok(Comment {
        id: extract_str(payload, "id")?,
        author: extract_str(payload, "author")?,
        text: extract_str(payload, "text")?,
        created_at: extract_datetime(payload, "created_at")?,
    })
}

pub fn to_ticket(payload: &JsonValue, comments: Vec<Comment>) -> Result<Ticket, SourceError> {
    Ok(Ticket {
        id: extract_str(payload, "id")?,
        name: extract_str(payload, "name")?,
        description: extract_str(payload, "description")?,
        url: extract_optional_str(payload, "app_url")?,
        created_at: extract_datetime(payload, "created_at")?,
        updated_at: extract_datetime(payload, "updated_at")?,
        comments,
    })
}

pub fn search_query(team_id: &str, watermark: DateTime<Utc>) -> String {
    format!(
        "team:{team_id} updated-after:{}",
        watermark.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    )
}

pub struct ShortcutClient {
    transport: Arc<dyn JsonTransport>,
    api_url: String,
    api_token: String,
    read_failures: Arc<ReadFailures>,
}

impl ShortcutClient {
    pub fn new(
        transport: Arc<dyn JsonTransport>,
        api_url: impl Into<String>,
        api_token: impl Into<String>,
        read_failures: Arc<ReadFailures>,
    ) -> Self {
        Self {
            transport,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
            read_failures,
        }
    }

    fn request(&self, path: &str) -> JsonRequest {
        JsonRequest::get(format!("{}/{path}", self.api_url)).header(TOKEN_HEADER, &self.api_token)
    }

    /// `None` when a non-success status was swallowed by the read policy.
    async fn read(&self, what: &str, request: JsonRequest) -> Result<Option<JsonValue>, SourceError> {
        let response = self.transport.send(request).await?;
        if response.is_success() {
            return Ok(Some(response.body));
        }
        self.read_failures.on_failed_read(what, &response)?;
        Ok(None)
    }

    /// Identifier of the first team whose name equals `team_name`.
    pub async fn resolve_team(&self, team_name: &str) -> Result<String, SourceError> {
        let listing = self
            .read("team listing", self.request("groups"))
            .await?
            .unwrap_or(JsonValue::Null);
        let teams = match listing {
            JsonValue::Array(teams) => teams,
            JsonValue::Null => Vec::new(),
            other => {
                return Err(SourceError::UnexpectedPayload {
                    what: "team listing",
                    reason: format!("expected an array, got {}", json_type_name(Some(&other))),
                })
            }
        };

        let team = teams
            .iter()
            .find(|team| team.get("name").and_then(JsonValue::as_str) == Some(team_name))
            .ok_or_else(|| SourceError::TeamNotFound(team_name.to_string()))?;
        let team_id = extract_str(team, "id")?;
        info!(team_name, team_id = %team_id, "resolved team");
        Ok(team_id)
    }

    /// Lazy sequence of tickets of `team_id` updated after `watermark`.
    pub fn tickets_since(&self, team_id: &str, watermark: DateTime<Utc>) -> TicketStream<'_> {
        info!(team_id, %watermark, "fetching tickets");
        TicketStream {
            client: self,
            query: search_query(team_id, watermark),
            page: VecDeque::new(),
            cursor: Cursor::Start,
        }
    }

    /// Drains every comment page of one ticket, in page order.
    pub async fn ticket_comments(&self, ticket_id: &str) -> Result<Vec<Comment>, SourceError> {
        debug!(ticket_id, "fetching comments");
        let mut comments = Vec::new();
        let mut next: Option<String> = None;

        loop {
            let mut request = self
                .request(&format!("stories/{ticket_id}/comments"))
                .query("page_size", PAGE_SIZE);
            if let Some(token) = next.take() {
                request = request.query("next", token);
            }

            let Some(page) = self.read("comment page", request).await? else {
                break;
            };
            for item in page_items("comment page", &page)? {
                comments.push(to_comment(&item)?);
            }
            next = next_cursor(&page);
            if next.is_none() {
                break;
            }
        }

        Ok(comments)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Pull-based ticket sequence. Holds at most one search page in memory.
pub struct TicketStream<'a> {
    client: &'a ShortcutClient,
    query: String,
    page: VecDeque<JsonValue>,
    cursor: Cursor,
}

impl TicketStream<'_> {
    pub async fn next_ticket(&mut self) -> Result<Option<Ticket>, SourceError> {
        loop {
            if let Some(raw) = self.page.pop_front() {
                if !is_truthy(raw.get("id")) {
                    debug!("dropping ticket entry without an id");
                    continue;
                }
                let ticket_id = extract_str(&raw, "id")?;
                let comments = self.client.ticket_comments(&ticket_id).await?;
                let ticket = to_ticket(&raw, comments)?;
                info!(
                    ticket_id = %ticket.id,
                    comments = ticket.comments.len(),
                    "fetched ticket"
                );
                return Ok(Some(ticket));
            }

            let token = match std::mem::replace(&mut self.cursor, Cursor::Done) {
                Cursor::Done => return Ok(None),
                Cursor::Start => None,
                Cursor::Next(token) => Some(token),
            };
            self.load_page(token).await?;
        }
    }

    async fn load_page(&mut self, token: Option<String>) -> Result<(), SourceError> {
        let mut request = self
            .client
            .request("search/stories")
            .query("query", &self.query)
            .query("page_size", PAGE_SIZE);
        if let Some(token) = token {
            request = request.query("next", token);
        }

        if let Some(page) = self.client.read("ticket search page", request).await? {
            self.page.extend(page_items("ticket search page", &page)?);
            if let Some(next) = next_cursor(&page) {
                self.cursor = Cursor::Next(next);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<'a> PullStream<Ticket> for TicketStream<'a> {
    async fn next_item(&mut self) -> anyhow::Result<Option<Ticket>> {
        Ok(self.next_ticket().await?)
    }
}

#[async_trait]
impl TicketSource for ShortcutClient {
    async fn resolve_team(&self, team_name: &str) -> anyhow::Result<String> {
        Ok(ShortcutClient::resolve_team(self, team_name).await?)
    }

    fn fetch_since<'a>(
        &'a self,
        team_id: &str,
        watermark: DateTime<Utc>,
    ) -> Box<dyn PullStream<Ticket> + 'a> {
        Box::new(self.tickets_since(team_id, watermark))
    }
}
