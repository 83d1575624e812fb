//! JSON-over-HTTP transport shared by the ticket source and the report store.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "scsum-http";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<JsonValue>,
}

impl JsonRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonResponse {
    pub status: u16,
    pub url: String,
    /// Parsed body; `Null` when empty, a JSON string holding the raw text when
    /// a non-success body is not JSON.
    pub body: JsonValue,
}

impl JsonResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid JSON body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn send(&self, request: JsonRequest) -> Result<JsonResponse, HttpError>;
}

/// What a read does when the remote answers with a non-success status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ReadFailurePolicy {
    /// Log, count, and treat the read as "no more data".
    #[default]
    EndOfData,
    /// Raise [`HttpError::Status`].
    Fail,
}

impl FromStr for ReadFailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "end-of-data" | "end_of_data" => Ok(ReadFailurePolicy::EndOfData),
            "fail" => Ok(ReadFailurePolicy::Fail),
            other => anyhow::bail!("unknown read failure policy `{other}` (expected end-of-data or fail)"),
        }
    }
}

/// Applies a [`ReadFailurePolicy`] and counts the failures it swallowed.
#[derive(Debug, Default)]
pub struct ReadFailures {
    policy: ReadFailurePolicy,
    swallowed: AtomicUsize,
}

impl ReadFailures {
    pub fn new(policy: ReadFailurePolicy) -> Self {
        Self {
            policy,
            swallowed: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> ReadFailurePolicy {
        self.policy
    }

    pub fn swallowed(&self) -> usize {
        self.swallowed.load(Ordering::Relaxed)
    }

    /// `Ok(())` means the caller treats the read as exhausted.
    pub fn on_failed_read(&self, what: &str, response: &JsonResponse) -> Result<(), HttpError> {
        error!(
            what,
            status = response.status,
            url = %response.url,
            body = %excerpt(&response.body),
            policy = ?self.policy,
            "read returned a non-success status"
        );
        match self.policy {
            ReadFailurePolicy::EndOfData => {
                self.swallowed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            ReadFailurePolicy::Fail => Err(HttpError::Status {
                status: response.status,
                url: response.url.clone(),
            }),
        }
    }
}

fn excerpt(body: &JsonValue) -> String {
    let text = match body {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.chars().take(200).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

pub const MIN_REFILL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket allowing roughly `per_second` requests each second; `None` for 0.
    /// The refill interval never drops below [`MIN_REFILL_INTERVAL`].
    pub fn per_second(per_second: u32) -> Option<Self> {
        (per_second > 0).then(|| Self {
            capacity: per_second,
            refill_every: (Duration::from_secs(1) / per_second).max(MIN_REFILL_INTERVAL),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every: refill_every.max(MIN_REFILL_INTERVAL),
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = u32::try_from(elapsed.as_nanos() / self.refill_every.as_nanos())
                    .unwrap_or(u32::MAX);
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// reqwest-backed [`JsonTransport`] with retry on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            token_bucket,
            backoff: config.backoff,
        })
    }

    fn build(&self, request: &JsonRequest) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }

    async fn read_response(resp: reqwest::Response) -> Result<JsonResponse, HttpError> {
        let status = resp.status();
        let url = resp.url().to_string();
        let bytes = resp.bytes().await?;

        let body = if bytes.is_empty() {
            JsonValue::Null
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(source) if status.is_success() => {
                    return Err(HttpError::Decode { url, source });
                }
                Err(_) => JsonValue::String(String::from_utf8_lossy(&bytes).into_owned()),
            }
        };

        Ok(JsonResponse {
            status: status.as_u16(),
            url,
            body,
        })
    }

    async fn send_with_retries(&self, request: &JsonRequest) -> Result<JsonResponse, HttpError> {
        let mut attempt = 0;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            match self.build(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success()
                        && classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying after transient status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Self::read_response(resp).await;
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl JsonTransport for HttpFetcher {
    async fn send(&self, request: JsonRequest) -> Result<JsonResponse, HttpError> {
        let span = info_span!("http_request", method = request.method.as_str(), url = %request.url);
        self.send_with_retries(&request).instrument(span).await
    }
}

/// In-memory transport replaying scripted responses and recording requests.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value as JsonValue;

    use super::{HttpError, JsonRequest, JsonResponse, JsonTransport};

    #[derive(Debug, Default)]
    pub struct ScriptedTransport {
        responses: Mutex<VecDeque<(u16, JsonValue)>>,
        requests: Mutex<Vec<JsonRequest>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, status: u16, body: JsonValue) -> &Self {
            self.responses
                .lock()
                .expect("responses lock")
                .push_back((status, body));
            self
        }

        pub fn ok(&self, body: JsonValue) -> &Self {
            self.respond(200, body)
        }

        pub fn requests(&self) -> Vec<JsonRequest> {
            self.requests.lock().expect("requests lock").clone()
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().expect("requests lock").len()
        }

        pub fn remaining(&self) -> usize {
            self.responses.lock().expect("responses lock").len()
        }
    }

    #[async_trait]
    impl JsonTransport for ScriptedTransport {
        async fn send(&self, request: JsonRequest) -> Result<JsonResponse, HttpError> {
            let url = request.url.clone();
            self.requests.lock().expect("requests lock").push(request);
            let (status, body) = self
                .responses
                .lock()
                .expect("responses lock")
                .pop_front()
                .unwrap_or_else(|| panic!("no scripted response left for {url}"));
            Ok(JsonResponse { status, url, body })
        }
    }
}
