// 📒 Ledger Linker - Idempotency-first lookup of ledger objects
//
// Lookup order for a source record:
//   1. Ledger directory, by deterministic external reference "{kind}:{ref}"
//   2. Ingested ledger objects stamped with that external reference
//   3. Fuzzy: closest ledger object inside the tolerance window
//
// On a miss the linker builds a ProposedLedgerEntry. Writing it is the job of
// an external LedgerWriter; the core only finalizes the link once the writer
// returns a ledger id.

use crate::db;
use crate::error::{ReconError, Result};
use crate::exceptions::{Exception, ExceptionStatus, ProposedAction};
use crate::lifecycle::{self, ExceptionAction};
use crate::matcher::{self, CandidatePool, Match, MatchCandidate, Tolerance};
use crate::normalize::NormalizedRecord;
use crate::records::{RecordKey, SourceKind};
use crate::retry::{with_retry, RetryConfig};
use crate::settings::Settings;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Deterministic external reference for a source record
pub fn external_ref(record: &NormalizedRecord) -> String {
    format!("{}:{}", record.source_kind, record.source_ref)
}

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Lookup of already-written ledger objects by external reference
pub trait LedgerDirectory {
    fn find_by_external_ref(&self, company_id: &str, external_ref: &str) -> Result<Option<String>>;
}

/// Directory backed by the local `ledger_links` table
pub struct StoreDirectory<'a> {
    conn: &'a Connection,
}

impl<'a> StoreDirectory<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        StoreDirectory { conn }
    }
}

impl LedgerDirectory for StoreDirectory<'_> {
    fn find_by_external_ref(&self, company_id: &str, external_ref: &str) -> Result<Option<String>> {
        db::get_ledger_link(self.conn, company_id, external_ref)
    }
}

/// Executes a proposal against the ledger system and returns its ledger id
pub trait LedgerWriter {
    fn write_entry(&self, entry: &ProposedLedgerEntry) -> Result<String>;
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMethod {
    ExternalRef,
    Fuzzy,
}

impl LinkMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkMethod::ExternalRef => "external_ref",
            LinkMethod::Fuzzy => "fuzzy",
        }
    }
}

/// An existing ledger object found for a source record
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerObject {
    pub ledger_ref: String,
    pub external_ref: String,

    /// The ingested ledger record, when it is in the local pool
    pub record: Option<NormalizedRecord>,

    pub method: LinkMethod,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedLedgerEntry {
    pub company_id: String,
    pub external_ref: String,
    pub entry_type: String,
    pub amount_minor: i64,
    pub currency: String,
    pub date: NaiveDate,
    pub memo: String,

    // Account ids are relayed from settings untouched
    pub debit_account_id: Option<String>,
    pub credit_account_id: Option<String>,

    pub source_ref: String,
    pub source_kind: SourceKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterpart_ref: Option<String>,
}

// ============================================================================
// LINKER
// ============================================================================

pub struct LedgerLinker<'a, D: LedgerDirectory> {
    directory: &'a D,
    settings: &'a Settings,
    tolerance: Tolerance,
    retry: RetryConfig,
}

impl<'a, D: LedgerDirectory> LedgerLinker<'a, D> {
    pub fn new(directory: &'a D, settings: &'a Settings) -> Self {
        LedgerLinker {
            directory,
            settings,
            tolerance: Tolerance::from_settings(settings),
            retry: RetryConfig::default(),
        }
    }

    /// Builder pattern: set retry policy for directory lookups
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Existing ledger object for `record`, or None.
    ///
    /// The fuzzy fallback is anchored on the counterpart (the bank deposit the
    /// payout landed as) when one is given, since that is what the ledger
    /// entry would have been booked from.
    pub fn find_existing_link(
        &self,
        company_id: &str,
        record: &NormalizedRecord,
        counterpart: Option<&NormalizedRecord>,
        pool: &CandidatePool,
    ) -> Result<Option<LedgerObject>> {
        let ext = external_ref(record);

        let found = with_retry(&self.retry, "ledger_lookup", || {
            self.directory.find_by_external_ref(company_id, &ext)
        })?;
        if let Some(ledger_ref) = found {
            debug!(external_ref = %ext, ledger_ref = %ledger_ref, "Ledger link found in directory");
            return Ok(Some(LedgerObject {
                record: pool.get(&ledger_ref).cloned(),
                ledger_ref,
                external_ref: ext,
                method: LinkMethod::ExternalRef,
                confidence: 1.0,
            }));
        }

        if let Some(stamped) = pool
            .available()
            .into_iter()
            .find(|r| r.external_ref.as_deref() == Some(ext.as_str()))
        {
            return Ok(Some(LedgerObject {
                ledger_ref: stamped.source_ref.clone(),
                external_ref: ext,
                record: Some(stamped.clone()),
                method: LinkMethod::ExternalRef,
                confidence: 1.0,
            }));
        }

        let anchor = counterpart.unwrap_or(record);
        let best = self.closest(anchor, pool);
        Ok(best.map(|candidate| LedgerObject {
            ledger_ref: candidate.record.source_ref.clone(),
            external_ref: ext,
            confidence: candidate.confidence,
            record: Some(candidate.record),
            method: LinkMethod::Fuzzy,
        }))
    }

    /// Highest-scoring ledger object in the tolerance window. Scores tie-break
    /// on the earliest date, as `find_candidates` ranks them.
    fn closest(&self, anchor: &NormalizedRecord, pool: &CandidatePool) -> Option<MatchCandidate> {
        matcher::find_candidates(anchor, pool, &self.tolerance)
            .into_iter()
            .next()
    }

    /// Deposit proposal for a record with no ledger object
    pub fn propose_creation(
        &self,
        company_id: &str,
        record: &NormalizedRecord,
        counterpart: Option<&NormalizedRecord>,
    ) -> ProposedLedgerEntry {
        let date = counterpart.map(|c| c.date).unwrap_or(record.date);
        let memo = match counterpart {
            Some(c) => format!(
                "{} {} deposited as {} {}",
                record.source_kind, record.source_ref, c.source_kind, c.source_ref
            ),
            None => format!("{} {}: {}", record.source_kind, record.source_ref, record.description),
        };

        ProposedLedgerEntry {
            company_id: company_id.to_string(),
            external_ref: external_ref(record),
            entry_type: "deposit".to_string(),
            amount_minor: record.amount_minor,
            currency: record.currency.clone(),
            date,
            memo,
            debit_account_id: self.settings.account_mapping.deposit_account_id.clone(),
            credit_account_id: self.settings.account_mapping.clearing_account_id.clone(),
            source_ref: record.source_ref.clone(),
            source_kind: record.source_kind,
            counterpart_ref: counterpart.map(|c| c.source_ref.clone()),
        }
    }
}

// ============================================================================
// FINALIZATION
// ============================================================================

/// Record a link between a source record and a ledger object inside the
/// caller's transaction. Returns the Match when one was created; the ledger
/// link is only written alongside a new Match.
#[allow(clippy::too_many_arguments)]
pub(crate) fn link_in(
    conn: &Connection,
    company_id: &str,
    source: &RecordKey,
    ledger_ref: &str,
    external_ref: &str,
    strategy: &str,
    confidence: f64,
    actor_id: &str,
) -> Result<Option<Match>> {
    let m = Match::new(
        company_id,
        source,
        &RecordKey::new(SourceKind::Ledger, ledger_ref),
        strategy,
        confidence,
    );

    if !matcher::insert_match_with_audit(conn, &m, actor_id)? {
        return Ok(None);
    }

    db::upsert_ledger_link(conn, company_id, external_ref, ledger_ref)?;
    Ok(Some(m))
}

/// Link an existing ledger object found by the linker
pub fn record_link(
    conn: &Connection,
    company_id: &str,
    source: &NormalizedRecord,
    object: &LedgerObject,
    strategy_prefix: &str,
    actor_id: &str,
) -> Result<Match> {
    let strategy = format!("{}_{}", strategy_prefix, object.method.as_str());
    let tx = db::begin_immediate(conn)?;

    let m = link_in(
        &tx,
        company_id,
        &source.key(),
        &object.ledger_ref,
        &object.external_ref,
        &strategy,
        object.confidence,
        actor_id,
    )?
    .ok_or_else(|| ReconError::StateConflict {
        id: source.key().to_string(),
        expected: "no ledger match".to_string(),
        actual: "already matched".to_string(),
    })?;

    tx.commit()?;
    Ok(m)
}

/// Open exceptions about `source` that a written ledger entry settles
fn settled_exceptions(conn: &Connection, company_id: &str, source: &RecordKey) -> Result<Vec<Exception>> {
    let open = db::get_exceptions(conn, company_id, Some(ExceptionStatus::Open))?;
    Ok(open
        .into_iter()
        .filter(|e| e.subject().as_ref() == Some(source))
        .filter(|e| {
            matches!(
                e.proposed_action,
                ProposedAction::CreateLedgerDeposit | ProposedAction::RecordCashDeposit
            )
        })
        .collect())
}

/// Finalize a proposal the ledger writer executed: link, match, audit, and
/// resolve the open exceptions that asked for the entry.
///
/// Idempotent per external reference: finalizing the same entry twice
/// returns None the second time and changes nothing.
pub fn finalize_written_entry(
    conn: &Connection,
    entry: &ProposedLedgerEntry,
    ledger_ref: &str,
    actor_id: &str,
) -> Result<Option<Match>> {
    let tx = db::begin_immediate(conn)?;
    let source = RecordKey::new(entry.source_kind, entry.source_ref.clone());

    let created = link_in(
        &tx,
        &entry.company_id,
        &source,
        ledger_ref,
        &entry.external_ref,
        "ledger_entry_created",
        1.0,
        actor_id,
    )?;

    let mut resolved = 0;
    if created.is_some() {
        for exception in settled_exceptions(&tx, &entry.company_id, &source)? {
            lifecycle::transition_in(&tx, &exception.id, &ExceptionAction::resolve(), actor_id)?;
            resolved += 1;
        }
    }
    tx.commit()?;

    if let Some(m) = &created {
        info!(
            company_id = %entry.company_id,
            external_ref = %entry.external_ref,
            ledger_ref = %ledger_ref,
            match_id = %m.id,
            resolved_exceptions = resolved,
            "Finalized ledger entry"
        );
    }

    Ok(created)
}

/// Hand a proposal to the writer and finalize the result.
///
/// Checks the directory first so a retried submission never writes twice.
pub fn submit_proposal<D: LedgerDirectory, W: LedgerWriter>(
    conn: &Connection,
    directory: &D,
    writer: &W,
    entry: &ProposedLedgerEntry,
    retry: &RetryConfig,
    actor_id: &str,
) -> Result<Option<Match>> {
    let existing = with_retry(retry, "ledger_lookup", || {
        directory.find_by_external_ref(&entry.company_id, &entry.external_ref)
    })?;

    let ledger_ref = match existing {
        Some(ledger_ref) => ledger_ref,
        None => with_retry(retry, "ledger_write", || writer.write_entry(entry))?,
    };

    finalize_written_entry(conn, entry, &ledger_ref, actor_id)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::records::{RawAmount, RawRecord};
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    fn record(kind: SourceKind, source_ref: &str, amount: i64, date: &str, description: &str) -> NormalizedRecord {
        normalize(
            &RawRecord::new(kind, source_ref, RawAmount::minor(amount), date, description).with_currency("CAD"),
            "CAD",
        )
    }

    /// Directory that fails transiently a fixed number of times
    struct FlakyDirectory {
        links: HashMap<String, String>,
        failures_left: Cell<u32>,
        calls: Cell<u32>,
    }

    impl FlakyDirectory {
        fn new(failures: u32) -> Self {
            FlakyDirectory {
                links: HashMap::new(),
                failures_left: Cell::new(failures),
                calls: Cell::new(0),
            }
        }
    }

    impl LedgerDirectory for FlakyDirectory {
        fn find_by_external_ref(&self, _company_id: &str, external_ref: &str) -> Result<Option<String>> {
            self.calls.set(self.calls.get() + 1);
            if self.failures_left.get() > 0 {
                self.failures_left.set(self.failures_left.get() - 1);
                return Err(ReconError::TransientProvider("rate limited".to_string()));
            }
            Ok(self.links.get(external_ref).cloned())
        }
    }

    struct RecordingWriter {
        written: RefCell<Vec<String>>,
    }

    impl LedgerWriter for RecordingWriter {
        fn write_entry(&self, entry: &ProposedLedgerEntry) -> Result<String> {
            self.written.borrow_mut().push(entry.external_ref.clone());
            Ok(format!("je_{}", self.written.borrow().len()))
        }
    }

    #[test]
    fn test_external_ref_format() {
        let payout = record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "");

        assert_eq!(external_ref(&payout), "payout:po_1");
    }

    #[test]
    fn test_directory_hit_wins_after_retry() {
        let settings = Settings::with_home_currency("CAD");
        let mut directory = FlakyDirectory::new(2);
        directory.links.insert("payout:po_1".to_string(), "je_77".to_string());
        let linker = LedgerLinker::new(&directory, &settings).with_retry(RetryConfig::immediate(3));
        let payout = record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "");

        let found = linker
            .find_existing_link("co_1", &payout, None, &CandidatePool::default())
            .unwrap()
            .unwrap();

        assert_eq!(found.ledger_ref, "je_77");
        assert_eq!(found.method, LinkMethod::ExternalRef);
        assert_eq!(directory.calls.get(), 3);
    }

    #[test]
    fn test_stamped_ledger_object_found() {
        let settings = Settings::with_home_currency("CAD");
        let directory = FlakyDirectory::new(0);
        let linker = LedgerLinker::new(&directory, &settings);
        let payout = record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "");
        let stamped = normalize(
            &RawRecord::new(SourceKind::Ledger, "je_5", RawAmount::minor(100000), "2025-02-01", "Deposit")
                .with_currency("CAD")
                .with_external_ref("payout:po_1"),
            "CAD",
        );

        let found = linker
            .find_existing_link("co_1", &payout, None, &CandidatePool::new(vec![stamped]))
            .unwrap()
            .unwrap();

        assert_eq!(found.ledger_ref, "je_5");
        assert_eq!(found.method, LinkMethod::ExternalRef);
    }

    #[test]
    fn test_fuzzy_fallback_anchored_on_counterpart() {
        let settings = Settings::with_home_currency("CAD");
        let directory = FlakyDirectory::new(0);
        let linker = LedgerLinker::new(&directory, &settings);
        let payout = record(SourceKind::Payout, "po_1", 100000, "2025-01-13", "STRIPE PAYOUT");
        let bank = record(SourceKind::Bank, "bt_1", 100000, "2025-01-15", "STRIPE TRANSFER");
        let pool = CandidatePool::new(vec![record(SourceKind::Ledger, "je_1", 100000, "2025-01-15", "Stripe deposit")]);

        let found = linker
            .find_existing_link("co_1", &payout, Some(&bank), &pool)
            .unwrap()
            .unwrap();

        assert_eq!(found.ledger_ref, "je_1");
        assert_eq!(found.method, LinkMethod::Fuzzy);
        assert_eq!(found.confidence, 1.0);
    }

    #[test]
    fn test_fuzzy_fallback_takes_closest_below_auto_threshold() {
        let settings = Settings::with_home_currency("CAD");
        let directory = FlakyDirectory::new(0);
        let linker = LedgerLinker::new(&directory, &settings);
        let payout = record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "STRIPE PAYOUT");
        let bank = record(SourceKind::Bank, "bt_1", 100000, "2025-01-15", "STRIPE TRANSFER");
        let pool = CandidatePool::new(vec![
            record(SourceKind::Ledger, "je_far", 100000, "2025-01-18", "Deposit"),
            record(SourceKind::Ledger, "je_near", 100000, "2025-01-17", "Deposit"),
        ]);

        let found = linker
            .find_existing_link("co_1", &payout, Some(&bank), &pool)
            .unwrap()
            .unwrap();

        // 0.4 + 0.2 + 0.3 × 0.85 (2 days) + 0.1 × 0 = 0.855
        assert_eq!(found.ledger_ref, "je_near");
        assert_eq!(found.method, LinkMethod::Fuzzy);
        assert_eq!(found.confidence, 0.855);
    }

    #[test]
    fn test_miss_and_permanent_error() {
        let settings = Settings::with_home_currency("CAD");
        let directory = FlakyDirectory::new(0);
        let linker = LedgerLinker::new(&directory, &settings);
        let payout = record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "");

        assert!(linker
            .find_existing_link("co_1", &payout, None, &CandidatePool::default())
            .unwrap()
            .is_none());

        let exhausted = FlakyDirectory::new(10);
        let linker = LedgerLinker::new(&exhausted, &settings).with_retry(RetryConfig::immediate(1));
        assert!(matches!(
            linker.find_existing_link("co_1", &payout, None, &CandidatePool::default()),
            Err(ReconError::TransientProvider(_))
        ));
    }

    #[test]
    fn test_proposal_uses_counterpart_date_and_accounts() {
        let mut settings = Settings::with_home_currency("CAD");
        settings.account_mapping.deposit_account_id = Some("acct_bank".to_string());
        settings.account_mapping.clearing_account_id = Some("acct_stripe".to_string());
        let directory = FlakyDirectory::new(0);
        let linker = LedgerLinker::new(&directory, &settings);
        let payout = record(SourceKind::Payout, "po_1", 100000, "2025-01-13", "STRIPE PAYOUT");
        let bank = record(SourceKind::Bank, "bt_1", 100000, "2025-01-15", "STRIPE TRANSFER");

        let proposal = linker.propose_creation("co_1", &payout, Some(&bank));

        assert_eq!(proposal.external_ref, "payout:po_1");
        assert_eq!(proposal.amount_minor, 100000);
        assert_eq!(proposal.date, bank.date);
        assert_eq!(proposal.debit_account_id.as_deref(), Some("acct_bank"));
        assert_eq!(proposal.credit_account_id.as_deref(), Some("acct_stripe"));
        assert_eq!(proposal.counterpart_ref.as_deref(), Some("bt_1"));
        assert!(proposal.memo.contains("po_1"));
    }

    #[test]
    fn test_submit_proposal_is_idempotent() {
        let conn = db::open_in_memory().unwrap();
        let settings = Settings::with_home_currency("CAD");
        let directory = StoreDirectory::new(&conn);
        let linker = LedgerLinker::new(&directory, &settings);
        let writer = RecordingWriter {
            written: RefCell::new(Vec::new()),
        };
        let payout = record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "");
        let proposal = linker.propose_creation("co_1", &payout, None);

        let first = submit_proposal(&conn, &directory, &writer, &proposal, &RetryConfig::no_retry(), "system").unwrap();
        let second = submit_proposal(&conn, &directory, &writer, &proposal, &RetryConfig::no_retry(), "system").unwrap();

        let m = first.unwrap();
        assert_eq!(m.strategy, "ledger_entry_created");
        assert_eq!(m.right_ref, "je_1");
        assert!(second.is_none());
        assert_eq!(writer.written.borrow().len(), 1);
        assert_eq!(db::get_ledger_link(&conn, "co_1", "payout:po_1").unwrap().as_deref(), Some("je_1"));
    }

    #[test]
    fn test_refinalize_keeps_link_and_match_in_step() {
        let conn = db::open_in_memory().unwrap();
        let settings = Settings::with_home_currency("CAD");
        let directory = StoreDirectory::new(&conn);
        let linker = LedgerLinker::new(&directory, &settings);
        let payout = record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "");
        let proposal = linker.propose_creation("co_1", &payout, None);

        let first = finalize_written_entry(&conn, &proposal, "je_1", "system").unwrap();
        let second = finalize_written_entry(&conn, &proposal, "je_2", "system").unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(db::get_ledger_link(&conn, "co_1", "payout:po_1").unwrap().as_deref(), Some("je_1"));
        let rights: Vec<String> = db::get_matches(&conn, "co_1")
            .unwrap()
            .into_iter()
            .map(|m| m.right_ref)
            .collect();
        assert_eq!(rights, vec!["je_1".to_string()]);
    }

    #[test]
    fn test_written_entry_resolves_its_exception() {
        let conn = db::open_in_memory().unwrap();
        let settings = Settings::with_home_currency("CAD");
        let directory = StoreDirectory::new(&conn);
        let linker = LedgerLinker::new(&directory, &settings);
        let writer = RecordingWriter {
            written: RefCell::new(Vec::new()),
        };
        let payout = record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "");
        let proposal = linker.propose_creation("co_1", &payout, None);

        let refs = crate::exceptions::entity_refs_for(&payout);
        let missing_in_ledger = Exception::new(
            "co_1",
            crate::exceptions::ExceptionType::PayoutMissingInLedger,
            refs.clone(),
            serde_json::json!({ "source_ref": "po_1" }),
            1.0,
            crate::exceptions::ExceptionOrigin::Matcher,
        );
        let missing_in_bank = Exception::new(
            "co_1",
            crate::exceptions::ExceptionType::PayoutMissingInBank,
            refs,
            serde_json::json!({ "source_ref": "po_1" }),
            0.0,
            crate::exceptions::ExceptionOrigin::Matcher,
        );
        crate::exceptions::persist_exception(&conn, &missing_in_ledger, "system").unwrap();
        crate::exceptions::persist_exception(&conn, &missing_in_bank, "system").unwrap();

        let m = submit_proposal(&conn, &directory, &writer, &proposal, &RetryConfig::no_retry(), "ledger-bot")
            .unwrap()
            .unwrap();

        let resolved = db::get_exception(&conn, &missing_in_ledger.id).unwrap();
        assert_eq!(resolved.status, ExceptionStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("ledger-bot"));
        assert!(resolved.resolved_at.is_some());
        assert_eq!(db::get_exception(&conn, &missing_in_bank.id).unwrap().status, ExceptionStatus::Open);

        let events = crate::audit::get_events_for_entity(&conn, "exception", &missing_in_ledger.id).unwrap();
        assert!(events.iter().any(|e| e.verb == "exception_resolved"));
        assert_eq!(m.right_ref, "je_1");
        assert!(crate::audit::verify_integrity(&conn, "co_1").unwrap().valid);
    }
}
