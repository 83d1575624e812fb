use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scsum_core::{
    Comment, Domain, IssueType, PullStream, RecordSchema, ReportError, ReportStore, Summarizer,
    Ticket, TicketAnalysis, TicketReport, TicketSource,
};
use scsum_http::testing::ScriptedTransport;
use scsum_http::{ReadFailurePolicy, ReadFailures};
use scsum_notion::NotionStore;
use scsum_shortcut::ShortcutClient;
use scsum_sync::{SyncPipeline, TableRef, WatermarkSource};
use serde_json::json;

type Log = Arc<Mutex<Vec<String>>>;

fn ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("ts")
        .with_timezone(&Utc)
}

fn target() -> TableRef {
    TableRef {
        store_name: "Support".to_string(),
        table_name: "Ticket Reports".to_string(),
    }
}

fn ticket(id: &str, authors: &[&str]) -> Ticket {
    Ticket {
        id: id.to_string(),
        name: format!("Ticket {id}"),
        description: "Something broke.".to_string(),
        url: None,
        created_at: ts("2025-01-02T00:00:00Z"),
        updated_at: ts("2025-01-04T00:00:00Z"),
        comments: authors
            .iter()
            .enumerate()
            .map(|(i, author)| Comment {
                id: format!("{id}-c{i}"),
                author: author.to_string(),
                text: format!("comment {i}"),
                created_at: ts("2025-01-03T00:00:00Z"),
            })
            .collect(),
    }
}

struct FakeStream {
    tickets: VecDeque<Ticket>,
    log: Log,
}

#[async_trait]
impl PullStream<Ticket> for FakeStream {
    async fn next_item(&mut self) -> Result<Option<Ticket>> {
        let next = self.tickets.pop_front();
        if let Some(ticket) = &next {
            self.log.lock().expect("log").push(format!("fetch {}", ticket.id));
        }
        Ok(next)
    }
}

struct FakeSource {
    tickets: Vec<Ticket>,
    log: Log,
    resolve_calls: AtomicUsize,
    fetched_since: Mutex<Option<DateTime<Utc>>>,
}

impl FakeSource {
    fn new(tickets: Vec<Ticket>, log: &Log) -> Self {
        Self {
            tickets,
            log: log.clone(),
            resolve_calls: AtomicUsize::new(0),
            fetched_since: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TicketSource for FakeSource {
    async fn resolve_team(&self, team_name: &str) -> Result<String> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().expect("log").push("resolve".to_string());
        Ok(format!("id-of-{team_name}"))
    }

    fn fetch_since<'a>(
        &'a self,
        _team_id: &str,
        watermark: DateTime<Utc>,
    ) -> Box<dyn PullStream<Ticket> + 'a> {
        *self.fetched_since.lock().expect("since") = Some(watermark);
        Box::new(FakeStream {
            tickets: self.tickets.iter().cloned().collect(),
            log: self.log.clone(),
        })
    }
}

struct FakeStore {
    log: Log,
    table_ready: bool,
    watermark: Option<DateTime<Utc>>,
    saved: Mutex<Vec<TicketReport>>,
}

impl FakeStore {
    fn new(log: &Log) -> Self {
        Self {
            log: log.clone(),
            table_ready: true,
            watermark: None,
            saved: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ReportStore for FakeStore {
    async fn ensure_table(&self, _: &str, _: &str, _: &RecordSchema) -> Result<bool> {
        self.log.lock().expect("log").push("ensure".to_string());
        Ok(self.table_ready)
    }

    async fn last_synced_at(
        &self,
        _: &str,
        _: &str,
        _: &RecordSchema,
    ) -> Result<Option<DateTime<Utc>>> {
        self.log.lock().expect("log").push("watermark".to_string());
        Ok(self.watermark)
    }

    async fn save(&self, _: &str, _: &str, report: &TicketReport) -> Result<()> {
        self.log.lock().expect("log").push(format!("save {}", report.id));
        self.saved.lock().expect("saved").push(report.clone());
        Ok(())
    }
}

struct FakeSummarizer {
    log: Log,
    seen_comments: Mutex<Vec<Vec<String>>>,
}

impl FakeSummarizer {
    fn new(log: &Log) -> Self {
        Self {
            log: log.clone(),
            seen_comments: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Summarizer for FakeSummarizer {
    async fn analyze(&self, ticket: &Ticket) -> Result<TicketAnalysis> {
        self.log.lock().expect("log").push(format!("summarize {}", ticket.id));
        self.seen_comments
            .lock()
            .expect("seen")
            .push(ticket.comments.iter().map(|c| c.id.clone()).collect());
        Ok(TicketAnalysis {
            domain: Domain::Search,
            issue_type: IssueType::Bug,
            summary: "summary".to_string(),
            solution: "solution".to_string(),
        })
    }
}

fn pipeline(
    source: &Arc<FakeSource>,
    store: &Arc<FakeStore>,
    summarizer: &Arc<FakeSummarizer>,
) -> SyncPipeline {
    SyncPipeline::new(
        "strike-tickets",
        target(),
        source.clone(),
        store.clone(),
        summarizer.clone(),
        Duration::days(30),
    )
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().expect("log").clone()
}

#[tokio::test]
async fn tickets_flow_one_at_a_time_through_summarize_and_save() {
    let log = Log::default();
    let source = Arc::new(FakeSource::new(
        vec![ticket("t1", &["Ann"]), ticket("t2", &["Bob"])],
        &log,
    ));
    let store = Arc::new(FakeStore::new(&log));
    let summarizer = Arc::new(FakeSummarizer::new(&log));

    let summary = pipeline(&source, &store, &summarizer)
        .run_once()
        .await
        .expect("run");

    assert_eq!(
        entries(&log),
        [
            "ensure",
            "resolve",
            "watermark",
            "fetch t1",
            "summarize t1",
            "save t1",
            "fetch t2",
            "summarize t2",
            "save t2",
        ]
    );
    assert_eq!(summary.reports_saved, 2);
    assert_eq!(summary.team_id, "id-of-strike-tickets");
    assert_eq!(summary.swallowed_read_failures, 0);
    assert_eq!(source.resolve_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stored_watermark_bounds_the_fetch() {
    let log = Log::default();
    let source = Arc::new(FakeSource::new(Vec::new(), &log));
    let mut store = FakeStore::new(&log);
    store.watermark = Some(ts("2025-01-05T10:30:00Z"));
    let store = Arc::new(store);
    let summarizer = Arc::new(FakeSummarizer::new(&log));

    let summary = pipeline(&source, &store, &summarizer)
        .run_once()
        .await
        .expect("run");

    assert_eq!(summary.watermark, ts("2025-01-05T10:30:00Z"));
    assert_eq!(summary.watermark_source, WatermarkSource::Store);
    assert_eq!(
        *source.fetched_since.lock().expect("since"),
        Some(ts("2025-01-05T10:30:00Z"))
    );
    assert_eq!(summary.reports_saved, 0);
}

#[tokio::test]
async fn empty_store_falls_back_to_lookback_window() {
    let log = Log::default();
    let source = Arc::new(FakeSource::new(Vec::new(), &log));
    let store = Arc::new(FakeStore::new(&log));
    let summarizer = Arc::new(FakeSummarizer::new(&log));

    let before = Utc::now() - Duration::days(30);
    let summary = pipeline(&source, &store, &summarizer)
        .run_once()
        .await
        .expect("run");
    let after = Utc::now() - Duration::days(30);

    assert_eq!(summary.watermark_source, WatermarkSource::Fallback);
    assert!(summary.watermark >= before && summary.watermark <= after);
}

#[tokio::test]
async fn lookback_beyond_calendar_range_fails_the_run() {
    let log = Log::default();
    let source = Arc::new(FakeSource::new(vec![ticket("t1", &["Ann"])], &log));
    let store = Arc::new(FakeStore::new(&log));
    let summarizer = Arc::new(FakeSummarizer::new(&log));

    let err = SyncPipeline::new(
        "strike-tickets",
        target(),
        source.clone(),
        store.clone(),
        summarizer.clone(),
        Duration::MAX,
    )
    .run_once()
    .await
    .expect_err("out of range");

    assert!(format!("{err:#}").contains("out of range"), "{err:#}");
    assert!(!entries(&log).iter().any(|entry| entry.starts_with("fetch")));
}

#[tokio::test]
async fn since_override_skips_the_store_watermark() {
    let log = Log::default();
    let source = Arc::new(FakeSource::new(Vec::new(), &log));
    let mut store = FakeStore::new(&log);
    store.watermark = Some(ts("2025-01-05T10:30:00Z"));
    let store = Arc::new(store);
    let summarizer = Arc::new(FakeSummarizer::new(&log));

    let summary = pipeline(&source, &store, &summarizer)
        .with_since_override(Some(ts("2024-12-01T00:00:00Z")))
        .run_once()
        .await
        .expect("run");

    assert_eq!(summary.watermark_source, WatermarkSource::Override);
    assert_eq!(summary.watermark, ts("2024-12-01T00:00:00Z"));
    assert!(!entries(&log).contains(&"watermark".to_string()));
}

#[tokio::test]
async fn team_is_resolved_once_across_runs() {
    let log = Log::default();
    let source = Arc::new(FakeSource::new(vec![ticket("t1", &["Ann"])], &log));
    let store = Arc::new(FakeStore::new(&log));
    let summarizer = Arc::new(FakeSummarizer::new(&log));
    let pipeline = pipeline(&source, &store, &summarizer);

    pipeline.run_once().await.expect("first");
    pipeline.run_once().await.expect("second");

    assert_eq!(source.resolve_calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.saved.lock().expect("saved").len(), 2);
}

#[tokio::test]
async fn unavailable_table_aborts_before_fetching() {
    let log = Log::default();
    let source = Arc::new(FakeSource::new(vec![ticket("t1", &["Ann"])], &log));
    let mut store = FakeStore::new(&log);
    store.table_ready = false;
    let store = Arc::new(store);
    let summarizer = Arc::new(FakeSummarizer::new(&log));

    let err = pipeline(&source, &store, &summarizer)
        .run_once()
        .await
        .expect_err("table missing");

    assert!(err.to_string().contains("Ticket Reports"));
    assert_eq!(entries(&log), ["ensure"]);
}

#[tokio::test]
async fn ticket_without_comments_aborts_after_earlier_saves() {
    let log = Log::default();
    let source = Arc::new(FakeSource::new(
        vec![ticket("t1", &["Ann"]), ticket("t2", &[]), ticket("t3", &["Cid"])],
        &log,
    ));
    let store = Arc::new(FakeStore::new(&log));
    let summarizer = Arc::new(FakeSummarizer::new(&log));

    let err = pipeline(&source, &store, &summarizer)
        .run_once()
        .await
        .expect_err("no comments");

    assert!(matches!(
        err.downcast_ref::<ReportError>(),
        Some(ReportError::NoComments(id)) if id == "t2"
    ));
    let saved: Vec<_> = store
        .saved
        .lock()
        .expect("saved")
        .iter()
        .map(|r| r.id.clone())
        .collect();
    assert_eq!(saved, ["t1"]);
    assert!(!entries(&log).contains(&"fetch t3".to_string()));
}

#[tokio::test]
async fn single_ticket_end_to_end_over_scripted_http() {
    let shortcut = Arc::new(ScriptedTransport::new());
    shortcut
        .ok(json!([
            { "id": "team-id-1", "name": "other-team" },
            { "id": "team-id-2", "name": "strike-tickets" },
        ]))
        .ok(json!({
            "data": [{
                "id": "ticket-id-1",
                "name": "Ticket One",
                "description": "This is a ticket description",
                "created_at": "2025-01-02T00:00:00Z",
                "updated_at": "2025-01-04T00:00:00Z",
                "app_url": "https://app.shortcut.com/acme/story/1",
            }],
            "next": null,
        }))
        .ok(json!({
            "data": [{
                "id": "comment-1",
                "text": "foo bar baz",
                "author": "DarK Vador",
                "created_at": "2025-01-03T00:00:00Z",
            }],
            "next": "foo",
        }))
        .ok(json!({
            "data": [{
                "id": "comment-2",
                "text": "platypus",
                "author": "Not so Dark Vador",
                "created_at": "2025-01-03T01:00:00Z",
            }],
            "next": null,
        }));

    let notion = Arc::new(ScriptedTransport::new());
    let found = |id: &str| json!({ "results": [{ "id": id }] });
    notion
        .ok(found("page-1"))
        .ok(found("db-1"))
        .ok(found("page-1"))
        .ok(found("db-1"))
        .ok(json!({ "object": "page", "id": "row-1" }));

    let failures = Arc::new(ReadFailures::new(ReadFailurePolicy::EndOfData));
    let source = ShortcutClient::new(
        shortcut.clone(),
        "https://api.shortcut.test/api/v3",
        "fake-api-key",
        failures.clone(),
    );
    let store = NotionStore::new(notion.clone(), "https://api.notion.test/v1", "secret", failures.clone());
    let log = Log::default();
    let summarizer = Arc::new(FakeSummarizer::new(&log));

    let summary = SyncPipeline::new(
        "strike-tickets",
        target(),
        Arc::new(source),
        Arc::new(store),
        summarizer.clone(),
        Duration::days(30),
    )
    .with_read_failures(failures)
    .with_since_override(Some(ts("2025-01-01T00:00:00Z")))
    .run_once()
    .await
    .expect("run");

    assert_eq!(summary.team_id, "team-id-2");
    assert_eq!(summary.reports_saved, 1);
    assert_eq!(shortcut.remaining(), 0);
    assert_eq!(notion.remaining(), 0);
    assert_eq!(
        shortcut.requests()[1].query_value("query"),
        Some("team:team-id-2 updated-after:2025-01-01T00:00:00Z")
    );
    assert_eq!(
        *summarizer.seen_comments.lock().expect("seen"),
        vec![vec!["comment-1".to_string(), "comment-2".to_string()]]
    );

    let row = notion.requests()[4].body.clone().expect("row body");
    assert_eq!(
        row["properties"]["actor"]["rich_text"][0]["text"]["content"],
        "DarK Vador"
    );
    assert_eq!(row["properties"]["id"]["rich_text"][0]["text"]["content"], "ticket-id-1");
    assert_eq!(
        row["properties"]["ticket_updated_at"],
        json!({ "date": { "start": "2025-01-04T00:00:00Z" } })
    );
}
