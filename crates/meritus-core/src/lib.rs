//! Core domain model for the Meritus external-sync subsystem.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "meritus-core";

/// Store collection names shared by every component that touches rows.
pub mod collections {
    pub const CLIENTS: &str = "clients";
    pub const CASES: &str = "cases";
    pub const CASE_EVENTS: &str = "case_events";
    pub const TASKS: &str = "tasks";
}

/// Lifecycle status of a tracked case, normalized once at the store boundary.
///
/// Raw store rows arrive with free-form Portuguese status strings in mixed
/// casing and inflection ("Arquivado", "arquivada", ...). Business logic only
/// ever sees this enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Active,
    Suspended,
    Archived,
    Closed,
}

impl CaseStatus {
    /// Parse a raw status string from the store. Unknown values map to
    /// `Active` so a typo in the surrounding application never makes a case
    /// invisible to sync.
    pub fn parse(raw: &str) -> Self {
        let lower = raw.trim().to_lowercase();
        match lower.as_str() {
            "suspenso" | "suspensa" | "suspended" => CaseStatus::Suspended,
            "arquivado" | "arquivada" | "archived" => CaseStatus::Archived,
            "encerrado" | "encerrada" | "baixado" | "baixada" | "closed" => CaseStatus::Closed,
            _ => CaseStatus::Active,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Active => "active",
            CaseStatus::Suspended => "suspended",
            CaseStatus::Archived => "archived",
            CaseStatus::Closed => "closed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CaseStatus::Active | CaseStatus::Suspended)
    }
}

/// A locally tracked case that scopes what the sync job polls for.
///
/// Owned by the surrounding application; the sync job only reads it, except
/// for status flips when a source reports the case closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedCase {
    pub id: Uuid,
    #[serde(default)]
    pub client_id: Option<Uuid>,
    /// CNJ process number as entered by the user (punctuation preserved).
    pub external_key: String,
    /// Two-digit tribunal routing code, e.g. "02" for TRT-2.
    pub tribunal: String,
    pub title: String,
    pub status: CaseStatus,
    pub active: bool,
}

impl TrackedCase {
    /// Read a raw store row, normalizing the free-form status string into
    /// the closed enumeration. Rows without a parseable id or external key
    /// are unusable and yield `None`.
    pub fn from_store_row(row: &serde_json::Value) -> Option<Self> {
        Some(Self {
            id: row.get("id")?.as_str()?.parse().ok()?,
            client_id: row
                .get("client_id")
                .and_then(serde_json::Value::as_str)
                .and_then(|s| s.parse().ok()),
            external_key: row.get("external_key")?.as_str()?.to_string(),
            tribunal: row
                .get("tribunal")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
            title: row
                .get("title")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status: CaseStatus::parse(
                row.get("status")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or(""),
            ),
            active: row
                .get("active")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(true),
        })
    }

    /// Digits-only form of the CNJ number, used as the search identifier.
    /// Empty output means the local key is unusable (a data-quality issue,
    /// not a sync failure).
    pub fn normalized_key(&self) -> String {
        normalize_process_key(&self.external_key)
    }
}

/// Strip everything but digits from a CNJ process number.
pub fn normalize_process_key(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// What kind of court movement an update represents, classified once by the
/// source adapter from the raw movement text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Movement,
    Hearing,
    Ruling,
    CaseClosed,
}

/// One external update found for a tracked case, before it is turned into
/// local data. Produced fresh on every fetch, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourtUpdate {
    /// Provenance tag of the source that produced this update.
    pub source: String,
    /// Normalized key of the owning case as seen by the source.
    pub case_key: String,
    pub title: String,
    pub description: String,
    pub date: NaiveDate,
    pub kind: UpdateKind,
    /// Cascade payload: present when the source knows the owning client,
    /// so missing local entities can be created in dependency order.
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_document: Option<String>,
    #[serde(default)]
    pub case_title: Option<String>,
}

impl CourtUpdate {
    /// Content fingerprint over the dedup-relevant fields. The external
    /// source gives no stable id across calls, so identity is content-based.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.description.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.date.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Deterministic id for the event derived from this update: the same
    /// (owner, content) pair always maps to the same id.
    pub fn derived_event_id(&self, case_id: Uuid) -> Uuid {
        let seed = format!("{}:{}", case_id, self.fingerprint());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes())
    }
}

/// A local record created as a side effect of processing a `CourtUpdate`.
/// Invariant: at most one event exists per (case, fingerprint) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseEvent {
    pub id: Uuid,
    pub case_id: Uuid,
    pub title: String,
    pub description: String,
    pub date: NaiveDate,
    pub read: bool,
    pub source: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl CaseEvent {
    /// Build the unread event implied by an update, tied to its owner.
    pub fn from_update(case_id: Uuid, update: &CourtUpdate) -> Self {
        Self {
            id: update.derived_event_id(case_id),
            case_id,
            title: update.title.clone(),
            description: update.description.clone(),
            date: update.date,
            read: false,
            source: update.source.clone(),
            fingerprint: update.fingerprint(),
            created_at: Utc::now(),
        }
    }
}

/// A client of the practice; head of the cascade chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    /// CPF/CNPJ, digits only; the lookup key for cascade creation.
    pub document: String,
}

/// A task created for the responsible lawyer, e.g. when a hearing is
/// scheduled by a court movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseTask {
    pub id: Uuid,
    pub case_id: Uuid,
    pub title: String,
    pub due_date: NaiveDate,
    pub done: bool,
    pub source: String,
}

/// Serialize a typed record into the row shape the generic store speaks.
pub fn to_row<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Deserialize a store row back into a typed record, `None` on shape drift.
pub fn from_row<T: serde::de::DeserializeOwned>(row: &serde_json::Value) -> Option<T> {
    serde_json::from_value(row.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(description: &str, date: &str) -> CourtUpdate {
        CourtUpdate {
            source: "datajus".to_string(),
            case_key: "00012345620245020001".to_string(),
            title: "Movimento".to_string(),
            description: description.to_string(),
            date: date.parse().unwrap(),
            kind: UpdateKind::Movement,
            client_name: None,
            client_document: None,
            case_title: None,
        }
    }

    #[test]
    fn process_key_normalization_strips_punctuation() {
        assert_eq!(
            normalize_process_key("0001234-56.2024.5.02.0001"),
            "00012345620245020001"
        );
        assert_eq!(normalize_process_key("sem numero"), "");
        assert_eq!(normalize_process_key(""), "");
    }

    #[test]
    fn status_parsing_absorbs_casing_and_inflection() {
        assert_eq!(CaseStatus::parse("Arquivado"), CaseStatus::Archived);
        assert_eq!(CaseStatus::parse("arquivada"), CaseStatus::Archived);
        assert_eq!(CaseStatus::parse("ENCERRADA"), CaseStatus::Closed);
        assert_eq!(CaseStatus::parse("baixado"), CaseStatus::Closed);
        assert_eq!(CaseStatus::parse("suspenso"), CaseStatus::Suspended);
        assert_eq!(CaseStatus::parse("em andamento"), CaseStatus::Active);
    }

    #[test]
    fn fingerprint_depends_only_on_description_and_date() {
        let a = update("Audiência designada", "2024-06-01");
        let mut b = update("Audiência designada", "2024-06-01");
        b.title = "Outro título".to_string();
        b.source = "mirror".to_string();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = update("Audiência designada", "2024-06-02");
        assert_ne!(a.fingerprint(), c.fingerprint());
        let d = update("Audiência cancelada", "2024-06-01");
        assert_ne!(a.fingerprint(), d.fingerprint());
    }

    #[test]
    fn derived_event_id_is_deterministic_per_owner() {
        let a = update("Conclusos para despacho", "2024-05-10");
        let case_a = Uuid::new_v4();
        let case_b = Uuid::new_v4();
        assert_eq!(a.derived_event_id(case_a), a.derived_event_id(case_a));
        assert_ne!(a.derived_event_id(case_a), a.derived_event_id(case_b));
    }

    #[test]
    fn event_from_update_starts_unread() {
        let u = update("Sentença publicada", "2024-07-15");
        let case_id = Uuid::new_v4();
        let event = CaseEvent::from_update(case_id, &u);
        assert!(!event.read);
        assert_eq!(event.case_id, case_id);
        assert_eq!(event.fingerprint, u.fingerprint());
        assert_eq!(event.id, u.derived_event_id(case_id));
    }

    #[test]
    fn store_row_parsing_normalizes_raw_status() {
        let id = Uuid::new_v4();
        let row = serde_json::json!({
            "id": id.to_string(),
            "external_key": "0001234-56.2024.5.02.0001",
            "tribunal": "02",
            "title": "Reclamação",
            "status": "Arquivada",
            "active": true
        });
        let case = TrackedCase::from_store_row(&row).unwrap();
        assert_eq!(case.id, id);
        assert_eq!(case.status, CaseStatus::Archived);
        assert!(case.client_id.is_none());

        let bad = serde_json::json!({"title": "sem id"});
        assert!(TrackedCase::from_store_row(&bad).is_none());
    }

    #[test]
    fn row_round_trip_preserves_typed_shape() {
        let case = TrackedCase {
            id: Uuid::new_v4(),
            client_id: None,
            external_key: "0001234-56.2024.5.02.0001".to_string(),
            tribunal: "02".to_string(),
            title: "Reclamação trabalhista".to_string(),
            status: CaseStatus::Active,
            active: true,
        };
        let row = to_row(&case);
        assert_eq!(row["tribunal"], "02");
        let back: TrackedCase = from_row(&row).unwrap();
        assert_eq!(back, case);
    }
}
