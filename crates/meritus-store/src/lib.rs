//! Generic collection store contract + HTTP fetch utilities for Meritus.
//!
//! The sync core depends only on the [`Store`] shape, never on a specific
//! store product. Two implementations live here: an in-memory store used by
//! tests and embedded setups, and a PostgREST-conventions HTTP store for the
//! hosted backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "meritus-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row {id} not found in {collection}")]
    NotFound { collection: String, id: String },
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned status {status} for {url}")]
    Status { status: u16, url: String },
}

/// Conjunction of field equality constraints. The only filter shape the
/// store contract requires; every implementation must honor it exactly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    fields: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.push((field.to_string(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether a row satisfies every constraint. Missing fields never match.
    pub fn matches(&self, row: &Value) -> bool {
        self.fields
            .iter()
            .all(|(field, expected)| row.get(field) == Some(expected))
    }

    /// PostgREST-style query pairs (`field` -> `eq.value`).
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .map(|(field, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (field.clone(), format!("eq.{rendered}"))
            })
            .collect()
    }
}

/// Generic CRUD over named collections. Rows travel as JSON objects; typed
/// conversion is the caller's concern. Each call is individually atomic at
/// the single-row level; there are no cross-call transactions.
#[async_trait]
pub trait Store: Send + Sync {
    async fn select(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StoreError>;

    /// Insert one row, assigning a fresh `id` when the row carries none.
    /// Returns the row as stored.
    async fn insert(&self, collection: &str, row: Value) -> Result<Value, StoreError>;

    /// Shallow-merge `patch` into the row with the given `id`.
    async fn update(&self, collection: &str, id: &str, patch: Value)
        -> Result<Value, StoreError>;

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<(), StoreError>;
}

/// In-memory store with deterministic insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }
}

fn ensure_row_id(row: &mut Value) {
    let needs_id = match row.get("id") {
        None | Some(Value::Null) => true,
        _ => false,
    };
    if needs_id {
        if let Some(obj) = row.as_object_mut() {
            obj.insert("id".to_string(), json!(Uuid::new_v4().to_string()));
        }
    }
}

fn row_id_matches(row: &Value, id: &str) -> bool {
    row.get("id").and_then(Value::as_str) == Some(id)
}

#[async_trait]
impl Store for MemoryStore {
    async fn select(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, collection: &str, mut row: Value) -> Result<Value, StoreError> {
        if !row.is_object() {
            return Err(StoreError::Backend(format!(
                "insert into {collection} requires a JSON object"
            )));
        }
        ensure_row_id(&mut row);
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
    ) -> Result<Value, StoreError> {
        let mut collections = self.collections.write().await;
        let rows = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        let row = rows
            .iter_mut()
            .find(|r| row_id_matches(r, id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        if let (Some(target), Some(source)) = (row.as_object_mut(), patch.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        Ok(row.clone())
    }

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        if let Some(rows) = collections.get_mut(collection) {
            rows.retain(|r| !filter.matches(r));
        }
        Ok(())
    }
}

/// PostgREST-conventions client for a hosted row store (the contract the
/// Supabase-style backend exposes).
#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building rest store client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, collection)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn read_rows(&self, resp: reqwest::Response) -> Result<Vec<Value>, StoreError> {
        let status = resp.status();
        let url = resp.url().to_string();
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                url,
            });
        }
        let body: Value = resp.json().await?;
        match body {
            Value::Array(rows) => Ok(rows),
            other => Ok(vec![other]),
        }
    }
}

#[async_trait]
impl Store for RestStore {
    async fn select(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let req = self
            .client
            .get(self.collection_url(collection))
            .query(&filter.to_query_pairs());
        let resp = self.authed(req).send().await?;
        self.read_rows(resp).await
    }

    async fn insert(&self, collection: &str, row: Value) -> Result<Value, StoreError> {
        let req = self
            .client
            .post(self.collection_url(collection))
            .header("Prefer", "return=representation")
            .json(&row);
        let resp = self.authed(req).send().await?;
        let mut rows = self.read_rows(resp).await?;
        rows.pop().ok_or_else(|| {
            StoreError::Backend(format!("insert into {collection} returned no representation"))
        })
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
    ) -> Result<Value, StoreError> {
        let req = self
            .client
            .patch(self.collection_url(collection))
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(&patch);
        let resp = self.authed(req).send().await?;
        let mut rows = self.read_rows(resp).await?;
        rows.pop().ok_or_else(|| StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })
    }

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<(), StoreError> {
        let req = self
            .client
            .delete(self.collection_url(collection))
            .query(&filter.to_query_pairs());
        let resp = self.authed(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(())
    }
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
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            // Single-digit timeout keeps worst-case pass duration bounded,
            // which is what makes stop() promptly effective.
            timeout: Duration::from_secs(8),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
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
            refill_every,
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
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
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

/// Retry-aware HTTP client used by source adapters. One semaphore bounds the
/// process, one bounds each source, so a slow tribunal cannot starve others.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// POST a JSON body with retries, backoff, rate limiting, and the
    /// concurrency bounds above. Court search endpoints are POST-only, so
    /// this is the one request shape sources need.
    pub async fn post_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        body: &Value,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.post(url).json(body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let bytes = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body: bytes,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_on_scalar_equality_conjunction() {
        let filter = Filter::new()
            .eq("case_id", "c1")
            .eq("date", "2024-06-01");
        assert!(filter.matches(&json!({
            "case_id": "c1",
            "date": "2024-06-01",
            "extra": 42
        })));
        assert!(!filter.matches(&json!({"case_id": "c1", "date": "2024-06-02"})));
        assert!(!filter.matches(&json!({"case_id": "c1"})));
    }

    #[test]
    fn filter_renders_postgrest_query_pairs() {
        let filter = Filter::new().eq("active", true).eq("tribunal", "02");
        assert_eq!(
            filter.to_query_pairs(),
            vec![
                ("active".to_string(), "eq.true".to_string()),
                ("tribunal".to_string(), "eq.02".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn memory_store_assigns_ids_and_filters() {
        let store = MemoryStore::new();
        let inserted = store
            .insert("cases", json!({"title": "Caso A", "active": true}))
            .await
            .unwrap();
        assert!(inserted["id"].is_string());

        store
            .insert("cases", json!({"title": "Caso B", "active": false}))
            .await
            .unwrap();

        let active = store
            .select("cases", &Filter::new().eq("active", true))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0]["title"], "Caso A");
    }

    #[tokio::test]
    async fn memory_store_update_is_shallow_merge() {
        let store = MemoryStore::new();
        let row = store
            .insert("cases", json!({"title": "Caso", "status": "active"}))
            .await
            .unwrap();
        let id = row["id"].as_str().unwrap().to_string();

        let updated = store
            .update("cases", &id, json!({"status": "closed"}))
            .await
            .unwrap();
        assert_eq!(updated["status"], "closed");
        assert_eq!(updated["title"], "Caso");

        let missing = store.update("cases", "nope", json!({})).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn memory_store_delete_removes_only_matches() {
        let store = MemoryStore::new();
        store
            .insert("tasks", json!({"case_id": "c1", "done": true}))
            .await
            .unwrap();
        store
            .insert("tasks", json!({"case_id": "c1", "done": false}))
            .await
            .unwrap();

        store
            .delete("tasks", &Filter::new().eq("done", true))
            .await
            .unwrap();
        assert_eq!(store.len("tasks").await, 1);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn token_bucket_throttles_once_capacity_is_spent() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_millis(40));

        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(start.elapsed() < Duration::from_millis(30), "burst within capacity must not wait");

        bucket.take().await;
        assert!(
            start.elapsed() >= Duration::from_millis(35),
            "third take must wait for a refill, waited {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn retry_classification_matches_transport_reality() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }
}
