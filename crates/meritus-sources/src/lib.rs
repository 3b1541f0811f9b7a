//! External update sources: the court search API and the mirror store.
//!
//! A source turns one tracked case into a finite batch of normalized
//! [`CourtUpdate`]s. Retrieval problems surface as `Err` so the runner can
//! count a pass-level failure; unusable local keys and unmapped tribunal
//! codes are data-quality skips and yield an empty batch instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use meritus_core::{CourtUpdate, TrackedCase, UpdateKind};
use meritus_store::{FetchError, Filter, HttpFetcher, Store, StoreError};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "meritus-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unreachable: {0}")]
    Unreachable(#[from] FetchError),
    #[error("malformed source response: {0}")]
    Malformed(String),
    #[error("mirror store error: {0}")]
    Store(#[from] StoreError),
}

/// Correlation context for one sync pass.
#[derive(Debug, Clone, Copy)]
pub struct FetchContext {
    pub run_id: Uuid,
}

impl FetchContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
        }
    }
}

impl Default for FetchContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One external call per tracked case, so a slow or erroring source never
/// blocks unrelated cases.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_updates(
        &self,
        ctx: &FetchContext,
        case: &TrackedCase,
    ) -> Result<Vec<CourtUpdate>, SourceError>;
}

/// Classify a raw movement name into a closed kind, once, at the boundary.
pub fn classify_movement(name: &str) -> UpdateKind {
    let lower = name.to_lowercase();
    if lower.contains("audiência") || lower.contains("audiencia") {
        UpdateKind::Hearing
    } else if lower.contains("arquiv") || lower.contains("baixa definitiva") {
        UpdateKind::CaseClosed
    } else if lower.contains("sentença")
        || lower.contains("sentenca")
        || lower.contains("acórdão")
        || lower.contains("acordao")
        || lower.contains("julgad")
    {
        UpdateKind::Ruling
    } else {
        UpdateKind::Movement
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TribunalEntry {
    code: String,
    endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TribunalRegistryFile {
    tribunals: Vec<TribunalEntry>,
}

/// Two-digit tribunal code -> search endpoint. Unmapped codes mean "nothing
/// to poll", not an error.
#[derive(Debug, Clone)]
pub struct TribunalRegistry {
    endpoints: HashMap<String, String>,
}

impl TribunalRegistry {
    /// Labor-court defaults: TRT-1 through TRT-24 on the public search API.
    pub fn labor_courts() -> Self {
        let mut endpoints = HashMap::new();
        for n in 1..=24u32 {
            endpoints.insert(
                format!("{n:02}"),
                format!("https://api-publica.datajus.jus.br/api_publica_trt{n}/_search"),
            );
        }
        Self { endpoints }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, SourceError> {
        let file: TribunalRegistryFile = serde_yaml::from_str(text)
            .map_err(|e| SourceError::Malformed(format!("tribunal registry: {e}")))?;
        let endpoints = file
            .tribunals
            .into_iter()
            .map(|t| (t.code, t.endpoint))
            .collect();
        Ok(Self { endpoints })
    }

    pub fn endpoint_for(&self, code: &str) -> Option<&str> {
        self.endpoints.get(code).map(String::as_str)
    }
}

/// Search-API source: POSTs a must-match query on the normalized process
/// number and flattens the hit movement lists into updates.
pub struct CourtApiSource {
    http: Arc<HttpFetcher>,
    registry: TribunalRegistry,
    page_size: usize,
}

pub const COURT_API_SOURCE: &str = "datajus";

impl CourtApiSource {
    pub fn new(http: Arc<HttpFetcher>, registry: TribunalRegistry) -> Self {
        Self {
            http,
            registry,
            page_size: 50,
        }
    }
}

#[async_trait]
impl UpdateSource for CourtApiSource {
    fn name(&self) -> &'static str {
        COURT_API_SOURCE
    }

    async fn fetch_updates(
        &self,
        ctx: &FetchContext,
        case: &TrackedCase,
    ) -> Result<Vec<CourtUpdate>, SourceError> {
        let key = case.normalized_key();
        if key.is_empty() {
            debug!(case_id = %case.id, "case has no usable process number; skipping");
            return Ok(Vec::new());
        }
        let Some(endpoint) = self.registry.endpoint_for(&case.tribunal) else {
            debug!(case_id = %case.id, tribunal = %case.tribunal, "unmapped tribunal code; skipping");
            return Ok(Vec::new());
        };

        let query = json!({
            "size": self.page_size,
            "query": { "match": { "numeroProcesso": key } }
        });
        let response = self
            .http
            .post_json(ctx.run_id, COURT_API_SOURCE, endpoint, &query)
            .await?;

        parse_search_response(&key, &response.body)
    }
}

/// Flatten an Elasticsearch-style search response into updates. Hits carry
/// the process under `_source`, with a `movimentos` list per process.
pub fn parse_search_response(case_key: &str, body: &[u8]) -> Result<Vec<CourtUpdate>, SourceError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| SourceError::Malformed(format!("search response: {e}")))?;

    let hits = value["hits"]["hits"]
        .as_array()
        .ok_or_else(|| SourceError::Malformed("search response missing hits".to_string()))?;

    let mut updates = Vec::new();
    for hit in hits {
        let source = &hit["_source"];
        let Some(movements) = source["movimentos"].as_array() else {
            continue;
        };
        for movement in movements {
            let Some(name) = movement["nome"].as_str() else {
                continue;
            };
            let Some(date) = movement["dataHora"]
                .as_str()
                .and_then(|ts| ts.get(..10))
                .and_then(|d| d.parse::<NaiveDate>().ok())
            else {
                continue;
            };
            let complement = movement["complemento"].as_str();
            let description = match complement {
                Some(extra) if !extra.trim().is_empty() => format!("{name} - {extra}"),
                _ => name.to_string(),
            };
            updates.push(CourtUpdate {
                source: COURT_API_SOURCE.to_string(),
                case_key: case_key.to_string(),
                title: name.to_string(),
                description,
                date,
                kind: classify_movement(name),
                client_name: None,
                client_document: None,
                case_title: None,
            });
        }
    }
    Ok(updates)
}

pub const MIRROR_SOURCE: &str = "mirror";

/// Secondary-store source: reads a named collection from another project's
/// store. Rows may carry the cascade payload (client name/document, case
/// title).
///
/// Every pass re-reads the case's full row set; the content dedup step
/// downstream makes re-reads idempotent. Keeping the fetch stateless is what
/// lets a record whose write failed reappear on the next pass.
pub struct MirrorStoreSource {
    mirror: Arc<dyn Store>,
    collection: String,
}

impl MirrorStoreSource {
    pub fn new(mirror: Arc<dyn Store>, collection: impl Into<String>) -> Self {
        Self {
            mirror,
            collection: collection.into(),
        }
    }
}

fn parse_mirror_kind(raw: Option<&str>) -> UpdateKind {
    match raw.map(str::trim).map(str::to_lowercase).as_deref() {
        Some("hearing") | Some("audiencia") => UpdateKind::Hearing,
        Some("ruling") | Some("sentenca") => UpdateKind::Ruling,
        Some("case_closed") | Some("arquivado") => UpdateKind::CaseClosed,
        _ => UpdateKind::Movement,
    }
}

fn parse_mirror_row(case_key: &str, row: &Value) -> Option<CourtUpdate> {
    let description = row["description"].as_str()?;
    let date = row["date"].as_str()?.parse::<NaiveDate>().ok()?;
    let title = row["title"].as_str().unwrap_or(description);

    Some(CourtUpdate {
        source: MIRROR_SOURCE.to_string(),
        case_key: case_key.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        date,
        kind: parse_mirror_kind(row["kind"].as_str()),
        client_name: row["client_name"].as_str().map(str::to_string),
        client_document: row["client_document"]
            .as_str()
            .map(|d| d.chars().filter(|c| c.is_ascii_digit()).collect()),
        case_title: row["case_title"].as_str().map(str::to_string),
    })
}

#[async_trait]
impl UpdateSource for MirrorStoreSource {
    fn name(&self) -> &'static str {
        MIRROR_SOURCE
    }

    async fn fetch_updates(
        &self,
        _ctx: &FetchContext,
        case: &TrackedCase,
    ) -> Result<Vec<CourtUpdate>, SourceError> {
        let key = case.normalized_key();
        if key.is_empty() {
            debug!(case_id = %case.id, "case has no usable process number; skipping");
            return Ok(Vec::new());
        }

        let rows = self
            .mirror
            .select(&self.collection, &Filter::new().eq("case_key", key.clone()))
            .await?;

        let mut updates = Vec::new();
        for row in &rows {
            let Some(update) = parse_mirror_row(&key, row) else {
                debug!(case_id = %case.id, "unparseable mirror row; skipping");
                continue;
            };
            updates.push(update);
        }
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meritus_core::CaseStatus;
    use meritus_store::MemoryStore;

    fn case(external_key: &str, tribunal: &str) -> TrackedCase {
        TrackedCase {
            id: Uuid::new_v4(),
            client_id: None,
            external_key: external_key.to_string(),
            tribunal: tribunal.to_string(),
            title: "Reclamação trabalhista".to_string(),
            status: CaseStatus::Active,
            active: true,
        }
    }

    #[test]
    fn registry_defaults_cover_labor_courts() {
        let registry = TribunalRegistry::labor_courts();
        assert_eq!(
            registry.endpoint_for("02"),
            Some("https://api-publica.datajus.jus.br/api_publica_trt2/_search")
        );
        assert_eq!(
            registry.endpoint_for("15"),
            Some("https://api-publica.datajus.jus.br/api_publica_trt15/_search")
        );
        assert_eq!(registry.endpoint_for("99"), None);
    }

    #[test]
    fn registry_loads_from_yaml() {
        let registry = TribunalRegistry::from_yaml_str(
            "tribunals:\n  - code: \"26\"\n    endpoint: \"https://example.test/_search\"\n",
        )
        .unwrap();
        assert_eq!(registry.endpoint_for("26"), Some("https://example.test/_search"));
        assert_eq!(registry.endpoint_for("02"), None);
    }

    #[test]
    fn movement_classification_is_boundary_only() {
        assert_eq!(classify_movement("Audiência designada"), UpdateKind::Hearing);
        assert_eq!(classify_movement("Arquivado definitivamente"), UpdateKind::CaseClosed);
        assert_eq!(classify_movement("Baixa Definitiva"), UpdateKind::CaseClosed);
        assert_eq!(classify_movement("Sentença publicada"), UpdateKind::Ruling);
        assert_eq!(classify_movement("Juntada de petição"), UpdateKind::Movement);
    }

    #[test]
    fn search_response_flattens_movements() {
        let body = serde_json::to_vec(&json!({
            "hits": {
                "total": {"value": 1},
                "hits": [{
                    "_source": {
                        "numeroProcesso": "00012345620245020001",
                        "movimentos": [
                            {"nome": "Audiência designada", "dataHora": "2024-06-01T10:00:00.000Z"},
                            {"nome": "Conclusos", "dataHora": "2024-05-20T08:30:00.000Z", "complemento": "para despacho"},
                            {"nome": "sem data"}
                        ]
                    }
                }]
            }
        }))
        .unwrap();

        let updates = parse_search_response("00012345620245020001", &body).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].kind, UpdateKind::Hearing);
        assert_eq!(updates[0].date, "2024-06-01".parse::<NaiveDate>().unwrap());
        assert_eq!(updates[1].description, "Conclusos - para despacho");
    }

    #[test]
    fn search_response_without_hits_is_malformed() {
        let err = parse_search_response("1", b"{\"error\":\"index_not_found\"}").unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[tokio::test]
    async fn mirror_source_rereads_full_row_set_every_pass() {
        let mirror = Arc::new(MemoryStore::new());
        let tracked = case("0001234-56.2024.5.02.0001", "02");
        let key = tracked.normalized_key();

        mirror
            .insert(
                "case_updates",
                json!({
                    "case_key": key,
                    "description": "Audiência designada",
                    "date": "2024-06-01",
                    "kind": "hearing",
                    "created_at": "2024-06-01T12:00:00Z"
                }),
            )
            .await
            .unwrap();

        let source = MirrorStoreSource::new(mirror.clone(), "case_updates");
        let ctx = FetchContext::new();

        let first = source.fetch_updates(&ctx, &tracked).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, UpdateKind::Hearing);

        // The fetch is stateless: re-reading yields the same rows, and the
        // runner's dedup decides what is new.
        let second = source.fetch_updates(&ctx, &tracked).await.unwrap();
        assert_eq!(second.len(), 1);

        mirror
            .insert(
                "case_updates",
                json!({
                    "case_key": tracked.normalized_key(),
                    "description": "Sentença publicada",
                    "date": "2024-07-15",
                    "kind": "ruling",
                    "created_at": "2024-07-15T09:00:00Z",
                    "client_name": "Maria Souza",
                    "client_document": "123.456.789-00"
                }),
            )
            .await
            .unwrap();

        let third = source.fetch_updates(&ctx, &tracked).await.unwrap();
        assert_eq!(third.len(), 2);
        let ruling = third
            .iter()
            .find(|u| u.kind == UpdateKind::Ruling)
            .expect("new ruling row fetched");
        assert_eq!(ruling.client_document.as_deref(), Some("12345678900"));
    }

    #[tokio::test]
    async fn mirror_source_skips_cases_without_key() {
        let mirror = Arc::new(MemoryStore::new());
        let source = MirrorStoreSource::new(mirror, "case_updates");
        let tracked = case("sem numero", "02");

        let updates = source
            .fetch_updates(&FetchContext::new(), &tracked)
            .await
            .unwrap();
        assert!(updates.is_empty());
    }
}
