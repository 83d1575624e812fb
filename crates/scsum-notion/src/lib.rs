//! Report store backed by the Notion API.
//!
//! Containers are pages, tables are databases and entries are database rows.
//! Every operation looks its page and database up by name; identifiers are not
//! cached between calls.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scsum_core::{encode_record, FieldValue, Record, RecordSchema, ReportStore, SchemaError, TicketReport};
use scsum_http::{HttpError, JsonRequest, JsonTransport, ReadFailures};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "scsum-notion";

pub const DEFAULT_API_URL: &str = "https://api.notion.com/v1";
pub const NOTION_VERSION: &str = "2022-06-28";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Page,
    Database,
}

impl ContainerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerKind::Page => "page",
            ContainerKind::Database => "database",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("no {kind} named `{name}`")]
    NotFound { kind: ContainerKind, name: String },
    #[error("{0} declares no watermark field")]
    NoWatermarkField(&'static str),
    #[error("{what} failed with status {status}: {body}")]
    WriteFailed {
        what: &'static str,
        status: u16,
        body: String,
    },
}

/// Page and database identifiers of one destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLocation {
    pub page_id: String,
    pub database_id: String,
}

pub fn create_database_payload(page_id: &str, table_name: &str, schema: &RecordSchema) -> JsonValue {
    json!({
        "parent": { "type": "page_id", "page_id": page_id },
        "title": [{ "type": "text", "text": { "content": table_name } }],
        "properties": schema.to_schema(),
    })
}

pub fn latest_entry_query(property: &str) -> JsonValue {
    json!({
        "sorts": [{ "property": property, "direction": "descending" }],
        "page_size": 1,
    })
}

pub struct NotionStore {
    transport: Arc<dyn JsonTransport>,
    api_url: String,
    api_token: String,
    read_failures: Arc<ReadFailures>,
}

impl NotionStore {
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

    fn post(&self, path: &str, body: JsonValue) -> JsonRequest {
        JsonRequest::post(format!("{}/{path}", self.api_url), body)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Notion-Version", NOTION_VERSION)
    }

    async fn read(&self, what: &str, request: JsonRequest) -> Result<Option<JsonValue>, StoreError> {
        let response = self.transport.send(request).await?;
        if response.is_success() {
            return Ok(Some(response.body));
        }
        self.read_failures.on_failed_read(what, &response)?;
        Ok(None)
    }

    /// Identifier of the first search result of `kind` for `name`.
    pub async fn find(&self, kind: ContainerKind, name: &str) -> Result<Option<String>, StoreError> {
        let request = self.post(
            "search",
            json!({
                "query": name,
                "filter": { "property": "object", "value": kind.as_str() },
            }),
        );
        let Some(body) = self.read("search", request).await? else {
            return Ok(None);
        };
        Ok(body
            .pointer("/results/0/id")
            .and_then(JsonValue::as_str)
            .map(str::to_string))
    }

    async fn require(&self, kind: ContainerKind, name: &str) -> Result<String, StoreError> {
        self.find(kind, name).await?.ok_or_else(|| StoreError::NotFound {
            kind,
            name: name.to_string(),
        })
    }

    pub async fn locate_table(&self, store_name: &str, table_name: &str) -> Result<TableLocation, StoreError> {
        let page_id = self.require(ContainerKind::Page, store_name).await?;
        let database_id = self.require(ContainerKind::Database, table_name).await?;
        Ok(TableLocation { page_id, database_id })
    }

    /// Creates `table_name` under `store_name` unless it already exists.
    /// `false` when the container is missing or creation was refused.
    pub async fn ensure_table(
        &self,
        store_name: &str,
        table_name: &str,
        schema: &RecordSchema,
    ) -> Result<bool, StoreError> {
        let Some(page_id) = self.find(ContainerKind::Page, store_name).await? else {
            warn!(store_name, "destination page not found");
            return Ok(false);
        };

        if self.find(ContainerKind::Database, table_name).await?.is_some() {
            info!(table_name, "destination table already exists");
            return Ok(true);
        }

        let request = self.post("databases", create_database_payload(&page_id, table_name, schema));
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            error!(
                table_name,
                status = response.status,
                body = %response.body,
                "creating destination table failed"
            );
            return Ok(false);
        }
        info!(table_name, record = schema.record_name(), "created destination table");
        Ok(true)
    }

    /// Watermark value of the most recent row, or `None` when there is none yet.
    pub async fn last_synced_at(
        &self,
        store_name: &str,
        table_name: &str,
        schema: &RecordSchema,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let field = schema
            .watermark_field()
            .ok_or(StoreError::NoWatermarkField(schema.record_name()))?;
        let location = self.locate_table(store_name, table_name).await?;

        let request = self.post(
            &format!("databases/{}/query", location.database_id),
            latest_entry_query(field.name),
        );
        let Some(body) = self.read("latest entry query", request).await? else {
            return Ok(None);
        };
        let Some(property) = body.pointer("/results/0/properties").and_then(|p| p.get(field.name)) else {
            info!(table_name, "no synced entries yet");
            return Ok(None);
        };

        match schema.decode(field.name, property)? {
            FieldValue::Timestamp(ts) => Ok(Some(ts)),
            _ => Ok(None),
        }
    }

    /// Appends one encoded row. The page and database must already exist.
    pub async fn save<R: Record>(&self, store_name: &str, table_name: &str, record: &R) -> Result<(), StoreError> {
        let location = self.locate_table(store_name, table_name).await?;
        let properties = encode_record(record)?;

        let request = self.post(
            "pages",
            json!({
                "parent": { "database_id": location.database_id },
                "properties": properties,
            }),
        );
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(StoreError::WriteFailed {
                what: "row creation",
                status: response.status,
                body: response.body.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReportStore for NotionStore {
    async fn ensure_table(
        &self,
        store_name: &str,
        table_name: &str,
        schema: &RecordSchema,
    ) -> anyhow::Result<bool> {
        Ok(NotionStore::ensure_table(self, store_name, table_name, schema).await?)
    }

    async fn last_synced_at(
        &self,
        store_name: &str,
        table_name: &str,
        schema: &RecordSchema,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(NotionStore::last_synced_at(self, store_name, table_name, schema).await?)
    }

    async fn save(&self, store_name: &str, table_name: &str, report: &TicketReport) -> anyhow::Result<()> {
        NotionStore::save(self, store_name, table_name, report).await?;
        info!(ticket_id = %report.id, table_name, "saved report");
        Ok(())
    }
}
