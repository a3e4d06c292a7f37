// 🔗 Audit Log - Per-company hash chain over every state-changing decision
//
// payload_hash = SHA256(payload)
// hash         = SHA256(prev_hash ++ payload_hash)
// prev_hash of a company's first event is "".
//
// The previous hash is always read back from the store inside the writer's
// transaction; nothing about the chain is kept in memory between appends.

use crate::db;
use crate::error::{ReconError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: i64,
    pub event_id: String,
    pub company_id: String,
    pub actor_id: String,
    pub verb: String,
    pub entity_type: String,
    pub entity_id: String,

    /// Canonical JSON text exactly as hashed
    pub payload: String,

    pub payload_hash: String,
    pub hash: String,
    pub prev_hash: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn payload_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

// ============================================================================
// HASHING
// ============================================================================

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Canonical text for a payload. Object keys come out sorted, so equal
/// payloads always hash the same.
pub fn canonical_payload(payload: &serde_json::Value) -> Result<String> {
    Ok(serde_json::to_string(payload)?)
}

pub fn chain_hash(prev_hash: &str, payload_hash: &str) -> String {
    sha256_hex(&format!("{}{}", prev_hash, payload_hash))
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_audit_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            company_id TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            verb TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            payload_hash TEXT NOT NULL,
            hash TEXT NOT NULL,
            prev_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_company ON audit_events(company_id, seq)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// APPEND
// ============================================================================

/// Hash of the company's latest event, "" for an empty chain
pub fn last_hash(conn: &Connection, company_id: &str) -> Result<String> {
    let hash = conn
        .query_row(
            "SELECT hash FROM audit_events WHERE company_id = ?1 ORDER BY seq DESC LIMIT 1",
            params![company_id],
            |row| row.get(0),
        )
        .optional()?;

    Ok(hash.unwrap_or_default())
}

/// Append an event inside the caller's write transaction
pub fn append(
    conn: &Connection,
    company_id: &str,
    actor_id: &str,
    verb: &str,
    entity_type: &str,
    entity_id: &str,
    payload: &serde_json::Value,
) -> Result<AuditEvent> {
    let payload = canonical_payload(payload)?;
    let payload_hash = sha256_hex(&payload);
    let prev_hash = last_hash(conn, company_id)?;
    let hash = chain_hash(&prev_hash, &payload_hash);
    let event_id = uuid::Uuid::new_v4().to_string();
    let created_at = Utc::now();

    conn.execute(
        "INSERT INTO audit_events (
            event_id, company_id, actor_id, verb, entity_type, entity_id,
            payload, payload_hash, hash, prev_hash, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            event_id,
            company_id,
            actor_id,
            verb,
            entity_type,
            entity_id,
            payload,
            payload_hash,
            hash,
            prev_hash,
            db::timestamp(&created_at),
        ],
    )?;

    debug!(company_id = %company_id, verb = %verb, entity_id = %entity_id, "Audit event appended");

    Ok(AuditEvent {
        seq: conn.last_insert_rowid(),
        event_id,
        company_id: company_id.to_string(),
        actor_id: actor_id.to_string(),
        verb: verb.to_string(),
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        payload,
        payload_hash,
        hash,
        prev_hash,
        created_at,
    })
}

/// Append a standalone event in its own transaction; returns the event id
pub fn log_event(
    conn: &Connection,
    company_id: &str,
    actor_id: &str,
    verb: &str,
    entity_type: &str,
    entity_id: &str,
    payload: &serde_json::Value,
) -> Result<String> {
    let tx = db::begin_immediate(conn)?;
    let event = append(&tx, company_id, actor_id, verb, entity_type, entity_id, payload)?;
    tx.commit()?;
    Ok(event.event_id)
}

// ============================================================================
// QUERIES
// ============================================================================

const EVENT_COLUMNS: &str = "seq, event_id, company_id, actor_id, verb, entity_type, entity_id,
    payload, payload_hash, hash, prev_hash, created_at";

fn event_from_row(row: &Row) -> rusqlite::Result<AuditEvent> {
    Ok(AuditEvent {
        seq: row.get(0)?,
        event_id: row.get(1)?,
        company_id: row.get(2)?,
        actor_id: row.get(3)?,
        verb: row.get(4)?,
        entity_type: row.get(5)?,
        entity_id: row.get(6)?,
        payload: row.get(7)?,
        payload_hash: row.get(8)?,
        hash: row.get(9)?,
        prev_hash: row.get(10)?,
        created_at: db::timestamp_column(row, 11)?,
    })
}

/// Inclusive time range; open ends are unbounded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventRange {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl EventRange {
    pub fn all() -> Self {
        EventRange::default()
    }

    pub fn contains(&self, at: &DateTime<Utc>) -> bool {
        self.since.map(|s| *at >= s).unwrap_or(true) && self.until.map(|u| *at <= u).unwrap_or(true)
    }
}

/// Company events in chain order, restricted to `range`
pub fn get_events(conn: &Connection, company_id: &str, range: &EventRange) -> Result<Vec<AuditEvent>> {
    let sql = format!(
        "SELECT {} FROM audit_events WHERE company_id = ?1 ORDER BY seq",
        EVENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;

    let events = stmt
        .query_map(params![company_id], event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events.into_iter().filter(|e| range.contains(&e.created_at)).collect())
}

pub fn get_events_for_entity(conn: &Connection, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEvent>> {
    let sql = format!(
        "SELECT {} FROM audit_events WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY seq",
        EVENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;

    let events = stmt
        .query_map(params![entity_type, entity_id], event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// INTEGRITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityFailure {
    pub event_id: String,
    pub seq: i64,
    pub reason: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub company_id: String,
    pub valid: bool,
    pub checked: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<IntegrityFailure>,
}

impl IntegrityReport {
    /// `Integrity` error carrying the first divergence, if any
    pub fn into_result(self) -> Result<IntegrityReport> {
        match &self.first_failure {
            Some(failure) => Err(ReconError::Integrity {
                event_id: failure.event_id.clone(),
                expected: failure.expected.clone(),
                actual: failure.actual.clone(),
            }),
            None => Ok(self),
        }
    }
}

fn check_event(event: &AuditEvent, expected_prev: &str) -> Option<IntegrityFailure> {
    let failure = |reason: &str, expected: String, actual: &str| IntegrityFailure {
        event_id: event.event_id.clone(),
        seq: event.seq,
        reason: reason.to_string(),
        expected,
        actual: actual.to_string(),
    };

    let payload_hash = sha256_hex(&event.payload);
    if payload_hash != event.payload_hash {
        return Some(failure("payload_hash mismatch", payload_hash, &event.payload_hash));
    }

    if event.prev_hash != expected_prev {
        return Some(failure("prev_hash mismatch", expected_prev.to_string(), &event.prev_hash));
    }

    let hash = chain_hash(&event.prev_hash, &payload_hash);
    if hash != event.hash {
        return Some(failure("hash mismatch", hash, &event.hash));
    }

    None
}

/// Replay the company chain and report the first event that does not hold up
pub fn verify_integrity(conn: &Connection, company_id: &str) -> Result<IntegrityReport> {
    let events = get_events(conn, company_id, &EventRange::all())?;
    let mut expected_prev = String::new();
    let mut checked = 0;

    for event in &events {
        checked += 1;

        if let Some(failure) = check_event(event, &expected_prev) {
            error!(
                company_id = %company_id,
                event_id = %failure.event_id,
                seq = failure.seq,
                reason = %failure.reason,
                "Audit chain integrity failure"
            );
            return Ok(IntegrityReport {
                company_id: company_id.to_string(),
                valid: false,
                checked,
                first_failure: Some(failure),
            });
        }

        expected_prev = event.hash.clone();
    }

    Ok(IntegrityReport {
        company_id: company_id.to_string(),
        valid: true,
        checked,
        first_failure: None,
    })
}

// ============================================================================
// EXPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Field-complete JSON array
    Json,

    /// Flat table with one row per event
    Csv,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => f.write_str("json"),
            ExportFormat::Csv => f.write_str("csv"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(ReconError::Validation(format!("unknown export format {:?}", other))),
        }
    }
}

/// Serialize the chain for `range`. Read-only: exporting is not itself audited.
pub fn export_audit_trail(
    conn: &Connection,
    company_id: &str,
    format: ExportFormat,
    range: &EventRange,
) -> Result<String> {
    let events = get_events(conn, company_id, range)?;

    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(&events)?),
        ExportFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(Vec::new());
            for event in &events {
                wtr.serialize(event)?;
            }
            let bytes = wtr
                .into_inner()
                .map_err(|e| ReconError::Serialization(e.to_string()))?;
            String::from_utf8(bytes).map_err(|e| ReconError::Serialization(e.to_string()))
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_chain(conn: &Connection, company_id: &str, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| {
                log_event(
                    conn,
                    company_id,
                    "system",
                    "match_created",
                    "match",
                    &format!("m_{}", i),
                    &serde_json::json!({ "n": i, "confidence": 1.0 }),
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_chain_links() {
        let conn = db::open_in_memory().unwrap();
        create_test_chain(&conn, "co_1", 3);

        let events = get_events(&conn, "co_1", &EventRange::all()).unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].prev_hash, "");
        assert_eq!(events[1].prev_hash, events[0].hash);
        assert_eq!(events[2].prev_hash, events[1].hash);
        assert_eq!(events[0].hash, chain_hash("", &sha256_hex(&events[0].payload)));
        assert_eq!(last_hash(&conn, "co_1").unwrap(), events[2].hash);
    }

    #[test]
    fn test_chains_are_per_company() {
        let conn = db::open_in_memory().unwrap();
        create_test_chain(&conn, "co_1", 2);
        create_test_chain(&conn, "co_2", 1);

        let other = get_events(&conn, "co_2", &EventRange::all()).unwrap();

        assert_eq!(other[0].prev_hash, "");
        assert!(verify_integrity(&conn, "co_1").unwrap().valid);
        assert!(verify_integrity(&conn, "co_2").unwrap().valid);
    }

    #[test]
    fn test_payload_is_canonical() {
        let a = canonical_payload(&serde_json::json!({ "b": 1, "a": 2 })).unwrap();
        let b = canonical_payload(&serde_json::json!({ "a": 2, "b": 1 })).unwrap();

        assert_eq!(a, b);
        assert_eq!(sha256_hex("").len(), 64);
    }

    #[test]
    fn test_verify_untouched_chain() {
        let conn = db::open_in_memory().unwrap();
        create_test_chain(&conn, "co_1", 5);

        let report = verify_integrity(&conn, "co_1").unwrap();

        assert!(report.valid);
        assert_eq!(report.checked, 5);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_verify_detects_tampered_payload() {
        let conn = db::open_in_memory().unwrap();
        let ids = create_test_chain(&conn, "co_1", 5);

        conn.execute(
            "UPDATE audit_events SET payload = ?1 WHERE event_id = ?2",
            params![r#"{"confidence":0.5,"n":2}"#, ids[2]],
        )
        .unwrap();

        let report = verify_integrity(&conn, "co_1").unwrap();
        let failure = report.first_failure.clone().unwrap();

        assert!(!report.valid);
        assert_eq!(failure.event_id, ids[2]);
        assert_eq!(failure.reason, "payload_hash mismatch");
        assert!(matches!(
            report.into_result(),
            Err(ReconError::Integrity { event_id, .. }) if event_id == ids[2]
        ));
    }

    #[test]
    fn test_verify_detects_rewritten_hashes() {
        let conn = db::open_in_memory().unwrap();
        let ids = create_test_chain(&conn, "co_1", 4);

        // Rewrite event 1 consistently with itself; event 2's prev_hash no longer agrees
        let forged_payload = r#"{"confidence":1.0,"n":99}"#;
        let forged_payload_hash = sha256_hex(forged_payload);
        let events = get_events(&conn, "co_1", &EventRange::all()).unwrap();
        let forged_hash = chain_hash(&events[1].prev_hash, &forged_payload_hash);
        conn.execute(
            "UPDATE audit_events SET payload = ?1, payload_hash = ?2, hash = ?3 WHERE event_id = ?4",
            params![forged_payload, forged_payload_hash, forged_hash, ids[1]],
        )
        .unwrap();

        let report = verify_integrity(&conn, "co_1").unwrap();

        assert_eq!(report.first_failure.unwrap().event_id, ids[2]);
    }

    #[test]
    fn test_export_is_read_only_and_deterministic() {
        let conn = db::open_in_memory().unwrap();
        create_test_chain(&conn, "co_1", 3);

        let json_a = export_audit_trail(&conn, "co_1", ExportFormat::Json, &EventRange::all()).unwrap();
        let json_b = export_audit_trail(&conn, "co_1", ExportFormat::Json, &EventRange::all()).unwrap();
        let csv = export_audit_trail(&conn, "co_1", ExportFormat::Csv, &EventRange::all()).unwrap();

        assert_eq!(json_a, json_b);
        let parsed: Vec<AuditEvent> = serde_json::from_str(&json_a).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(csv.lines().count(), 4);
        assert!(csv.starts_with("seq,event_id,company_id"));
        assert_eq!(get_events(&conn, "co_1", &EventRange::all()).unwrap().len(), 3);
    }

    #[test]
    fn test_export_range_filters() {
        let conn = db::open_in_memory().unwrap();
        create_test_chain(&conn, "co_1", 2);
        let future = EventRange {
            since: Some(Utc::now() + chrono::Duration::days(1)),
            until: None,
        };

        let json = export_audit_trail(&conn, "co_1", ExportFormat::Json, &future).unwrap();

        assert_eq!(json, "[]");
    }
}
