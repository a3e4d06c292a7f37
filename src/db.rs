// 🗄️ Reconciliation Store - SQLite persistence for records, matches,
// exceptions and ledger links
//
// Every mutation runs inside an IMMEDIATE transaction. SQLite allows one
// writer at a time, so the write lock doubles as the per-company lock that
// keeps match/exception writes and the audit chain serialized.

use crate::audit;
use crate::error::{ReconError, Result};
use crate::exceptions::{Exception, ExceptionOrigin, ExceptionStatus};
use crate::matcher::Match;
use crate::records::{RawRecord, RecordKey, SourceKind};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

// ============================================================================
// CONNECTION & SCHEMA
// ============================================================================

/// Open (or create) the database file and make sure the schema exists
pub fn open(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    setup_database(&conn)?;
    Ok(conn)
}

/// In-memory store, used by tests and dry runs
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    // ==========================================================================
    // Source records (raw, immutable once ingested)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS source_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            company_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            source_ref TEXT NOT NULL,
            raw_json TEXT NOT NULL,
            ingested_at TEXT NOT NULL,
            UNIQUE (company_id, kind, source_ref)
        )",
        [],
    )?;

    // ==========================================================================
    // Matches
    // A record is matched at most once per counterpart kind.
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS matches (
            match_id TEXT PRIMARY KEY,
            company_id TEXT NOT NULL,
            left_ref TEXT NOT NULL,
            left_type TEXT NOT NULL,
            right_ref TEXT NOT NULL,
            right_type TEXT NOT NULL,
            strategy TEXT NOT NULL,
            confidence REAL NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (company_id, left_ref, right_ref)
        )",
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_matches_left
         ON matches(company_id, left_type, left_ref, right_type)",
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_matches_right
         ON matches(company_id, right_type, right_ref, left_type)",
        [],
    )?;

    // ==========================================================================
    // Exceptions
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exceptions (
            exception_id TEXT PRIMARY KEY,
            company_id TEXT NOT NULL,
            exception_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            status TEXT NOT NULL,
            entity_refs TEXT NOT NULL,
            evidence TEXT NOT NULL,
            proposed_action TEXT NOT NULL,
            confidence REAL NOT NULL,
            origin TEXT NOT NULL,
            created_at TEXT NOT NULL,
            resolved_at TEXT,
            resolved_by TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exceptions_status ON exceptions(company_id, status)",
        [],
    )?;

    // ==========================================================================
    // Ledger links (external_ref → ledger object)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_links (
            company_id TEXT NOT NULL,
            external_ref TEXT NOT NULL,
            ledger_ref TEXT NOT NULL,
            linked_at TEXT NOT NULL,
            PRIMARY KEY (company_id, external_ref)
        )",
        [],
    )?;

    audit::setup_audit_table(conn)?;

    Ok(())
}

/// Start a write transaction that takes the SQLite write lock up front.
///
/// Works on a shared `&Connection` so callers can hold the connection behind
/// an `Arc<Mutex<_>>`. Nested use is an error reported by SQLite.
pub fn begin_immediate(conn: &Connection) -> Result<Transaction<'_>> {
    Ok(Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?)
}

// ============================================================================
// ROW HELPERS
// ============================================================================

pub(crate) fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn optional_timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

/// Enum stored as its serde string form
fn enum_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_value(serde_json::Value::String(text)).map_err(|e| conversion_error(idx, e))
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn enum_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(ReconError::Serialization(format!(
            "expected string enum, got {}",
            other
        ))),
    }
}

// ============================================================================
// SOURCE RECORDS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct IngestSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Store raw records for a company. Re-ingesting the same `(kind, source_ref)`
/// is a no-op counted as a duplicate.
pub fn ingest_records(conn: &Connection, company_id: &str, records: &[RawRecord]) -> Result<IngestSummary> {
    let tx = begin_immediate(conn)?;
    let mut summary = IngestSummary::default();
    let now = timestamp(&Utc::now());

    for record in records {
        let raw_json = serde_json::to_string(record)?;

        let result = tx.execute(
            "INSERT INTO source_records (company_id, kind, source_ref, raw_json, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![company_id, record.kind.as_str(), record.source_ref, raw_json, now],
        );

        match result {
            Ok(_) => summary.inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                summary.duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if summary.inserted > 0 {
        audit::append(
            &tx,
            company_id,
            "ingestion",
            "records_ingested",
            "company",
            company_id,
            &serde_json::json!({
                "inserted": summary.inserted,
                "duplicates": summary.duplicates,
            }),
        )?;
    }

    tx.commit()?;

    info!(
        company_id = %company_id,
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        "Ingested records"
    );

    Ok(summary)
}

/// All raw records of one kind, ordered by reference
pub fn get_records(conn: &Connection, company_id: &str, kind: SourceKind) -> Result<Vec<RawRecord>> {
    let mut stmt = conn.prepare(
        "SELECT raw_json FROM source_records
         WHERE company_id = ?1 AND kind = ?2
         ORDER BY source_ref",
    )?;

    let records = stmt
        .query_map(params![company_id, kind.as_str()], |row| json_column(row, 0))?
        .collect::<std::result::Result<Vec<RawRecord>, _>>()?;

    Ok(records)
}

pub fn get_record(conn: &Connection, company_id: &str, key: &RecordKey) -> Result<Option<RawRecord>> {
    let record = conn
        .query_row(
            "SELECT raw_json FROM source_records
             WHERE company_id = ?1 AND kind = ?2 AND source_ref = ?3",
            params![company_id, key.kind.as_str(), key.source_ref],
            |row| json_column(row, 0),
        )
        .optional()?;

    Ok(record)
}

/// Record count per kind for a company
pub fn record_counts(conn: &Connection, company_id: &str) -> Result<BTreeMap<SourceKind, i64>> {
    let mut counts = BTreeMap::new();

    for kind in SourceKind::all() {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM source_records WHERE company_id = ?1 AND kind = ?2",
            params![company_id, kind.as_str()],
            |row| row.get(0),
        )?;
        counts.insert(kind, count);
    }

    Ok(counts)
}

// ============================================================================
// MATCHES
// ============================================================================

/// Insert a Match; false when a uniqueness constraint already covers it
pub fn insert_match(conn: &Connection, m: &Match) -> Result<bool> {
    let changed = conn.execute(
        "INSERT INTO matches (
            match_id, company_id, left_ref, left_type, right_ref, right_type,
            strategy, confidence, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT DO NOTHING",
        params![
            m.id,
            m.company_id,
            m.left_ref,
            m.left_type.as_str(),
            m.right_ref,
            m.right_type.as_str(),
            m.strategy,
            m.confidence,
            timestamp(&m.created_at),
        ],
    )?;

    Ok(changed == 1)
}

fn match_from_row(row: &Row) -> rusqlite::Result<Match> {
    Ok(Match {
        id: row.get(0)?,
        company_id: row.get(1)?,
        left_ref: row.get(2)?,
        left_type: enum_column(row, 3)?,
        right_ref: row.get(4)?,
        right_type: enum_column(row, 5)?,
        strategy: row.get(6)?,
        confidence: row.get(7)?,
        created_at: timestamp_column(row, 8)?,
    })
}

pub fn get_matches(conn: &Connection, company_id: &str) -> Result<Vec<Match>> {
    let mut stmt = conn.prepare(
        "SELECT match_id, company_id, left_ref, left_type, right_ref, right_type,
                strategy, confidence, created_at
         FROM matches
         WHERE company_id = ?1
         ORDER BY created_at, match_id",
    )?;

    let matches = stmt
        .query_map(params![company_id], match_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(matches)
}

/// Matches touching one record, on either side
pub fn get_matches_for_record(conn: &Connection, company_id: &str, key: &RecordKey) -> Result<Vec<Match>> {
    let mut stmt = conn.prepare(
        "SELECT match_id, company_id, left_ref, left_type, right_ref, right_type,
                strategy, confidence, created_at
         FROM matches
         WHERE company_id = ?1
           AND ((left_type = ?2 AND left_ref = ?3) OR (right_type = ?2 AND right_ref = ?3))
         ORDER BY created_at, match_id",
    )?;

    let matches = stmt
        .query_map(params![company_id, key.kind.as_str(), key.source_ref], match_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(matches)
}

// ============================================================================
// EXCEPTIONS
// ============================================================================

pub fn insert_exception(conn: &Connection, exception: &Exception) -> Result<()> {
    conn.execute(
        "INSERT INTO exceptions (
            exception_id, company_id, exception_type, severity, status,
            entity_refs, evidence, proposed_action, confidence, origin,
            created_at, resolved_at, resolved_by
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            exception.id,
            exception.company_id,
            enum_text(&exception.exception_type)?,
            enum_text(&exception.severity)?,
            enum_text(&exception.status)?,
            serde_json::to_string(&exception.entity_refs)?,
            serde_json::to_string(&exception.evidence)?,
            enum_text(&exception.proposed_action)?,
            exception.confidence,
            enum_text(&exception.origin)?,
            timestamp(&exception.created_at),
            exception.resolved_at.as_ref().map(timestamp),
            exception.resolved_by,
        ],
    )?;

    Ok(())
}

const EXCEPTION_COLUMNS: &str = "exception_id, company_id, exception_type, severity, status,
    entity_refs, evidence, proposed_action, confidence, origin,
    created_at, resolved_at, resolved_by";

fn exception_from_row(row: &Row) -> rusqlite::Result<Exception> {
    Ok(Exception {
        id: row.get(0)?,
        company_id: row.get(1)?,
        exception_type: enum_column(row, 2)?,
        severity: enum_column(row, 3)?,
        status: enum_column(row, 4)?,
        entity_refs: json_column(row, 5)?,
        evidence: json_column(row, 6)?,
        proposed_action: enum_column(row, 7)?,
        confidence: row.get(8)?,
        origin: enum_column(row, 9)?,
        created_at: timestamp_column(row, 10)?,
        resolved_at: optional_timestamp_column(row, 11)?,
        resolved_by: row.get(12)?,
    })
}

pub fn get_exception(conn: &Connection, exception_id: &str) -> Result<Exception> {
    let sql = format!(
        "SELECT {} FROM exceptions WHERE exception_id = ?1",
        EXCEPTION_COLUMNS
    );

    conn.query_row(&sql, params![exception_id], exception_from_row)
        .optional()?
        .ok_or_else(|| ReconError::not_found("exception", exception_id))
}

/// Exceptions for a company, optionally filtered by status.
/// Ordered by severity rank, then creation time.
pub fn get_exceptions(
    conn: &Connection,
    company_id: &str,
    status: Option<ExceptionStatus>,
) -> Result<Vec<Exception>> {
    let sql = format!(
        "SELECT {} FROM exceptions
         WHERE company_id = ?1 AND (?2 IS NULL OR status = ?2)
         ORDER BY created_at, exception_id",
        EXCEPTION_COLUMNS
    );
    let status_text = status.as_ref().map(enum_text).transpose()?;

    let mut stmt = conn.prepare(&sql)?;
    let mut exceptions = stmt
        .query_map(params![company_id, status_text], exception_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    exceptions.sort_by_key(|e| e.severity.rank());
    Ok(exceptions)
}

/// Move an open exception to a terminal status.
/// Returns false when the exception is no longer open.
pub fn update_exception_status(
    conn: &Connection,
    exception_id: &str,
    status: ExceptionStatus,
    resolved_by: &str,
    resolved_at: &DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE exceptions
         SET status = ?1, resolved_at = ?2, resolved_by = ?3
         WHERE exception_id = ?4 AND status = 'open'",
        params![
            enum_text(&status)?,
            timestamp(resolved_at),
            resolved_by,
            exception_id,
        ],
    )?;

    Ok(changed == 1)
}

/// Drop open exceptions of one origin so a run can regenerate them.
/// Resolved and ignored exceptions are never touched.
pub fn delete_open_exceptions(conn: &Connection, company_id: &str, origin: ExceptionOrigin) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM exceptions
         WHERE company_id = ?1 AND origin = ?2 AND status = 'open'",
        params![company_id, enum_text(&origin)?],
    )?;

    Ok(deleted)
}

// ============================================================================
// LEDGER LINKS
// ============================================================================

pub fn upsert_ledger_link(conn: &Connection, company_id: &str, external_ref: &str, ledger_ref: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO ledger_links (company_id, external_ref, ledger_ref, linked_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (company_id, external_ref)
         DO UPDATE SET ledger_ref = excluded.ledger_ref, linked_at = excluded.linked_at",
        params![company_id, external_ref, ledger_ref, timestamp(&Utc::now())],
    )?;

    Ok(())
}

pub fn get_ledger_link(conn: &Connection, company_id: &str, external_ref: &str) -> Result<Option<String>> {
    let ledger_ref = conn
        .query_row(
            "SELECT ledger_ref FROM ledger_links WHERE company_id = ?1 AND external_ref = ?2",
            params![company_id, external_ref],
            |row| row.get(0),
        )
        .optional()?;

    Ok(ledger_ref)
}

// ============================================================================
// TESTS
// ============================================================================
