// 🚩 Exceptions Engine - Typed, prioritized records that need attention
//
// After the matching passes, every payout, bank transaction and ledger
// object without the links it should have becomes exactly one Exception:
//   - type from a closed taxonomy
//   - severity and proposed action from single type-keyed tables
//   - evidence describing the record (and search window / candidates)
//
// Regeneration is idempotent: open sweep exceptions are cleared and rebuilt
// from the current matched set; resolved/ignored exceptions are never touched.

use crate::audit;
use crate::db;
use crate::error::{ReconError, Result};
use crate::ledger::ProposedLedgerEntry;
use crate::matcher::{MatchCandidate, MatchedSet, SearchWindow};
use crate::normalize::{normalize, NormalizedRecord};
use crate::records::{RecordKey, SourceKind};
use crate::settings::Settings;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

// ============================================================================
// TAXONOMY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionType {
    /// Processor paid out but no bank deposit was found
    PayoutMissingInBank,

    /// Several bank transactions fit a payout equally well
    AmbiguousBankCandidates,

    /// Payout reached the bank but was never booked in the ledger
    PayoutMissingInLedger,

    /// Bank transaction with no payout or ledger counterpart
    BankTransactionUnmatched,

    /// Ledger object with no bank or payout counterpart
    LedgerTransactionUnmatched,

    /// Unmatched bank deposit that looks like cash
    CashDepositDetected,

    /// Unmatched bank transaction in a foreign currency
    MultiCurrencyReview,
}

impl ExceptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionType::PayoutMissingInBank => "PAYOUT_MISSING_IN_BANK",
            ExceptionType::AmbiguousBankCandidates => "AMBIGUOUS_BANK_CANDIDATES",
            ExceptionType::PayoutMissingInLedger => "PAYOUT_MISSING_IN_LEDGER",
            ExceptionType::BankTransactionUnmatched => "BANK_TRANSACTION_UNMATCHED",
            ExceptionType::LedgerTransactionUnmatched => "LEDGER_TRANSACTION_UNMATCHED",
            ExceptionType::CashDepositDetected => "CASH_DEPOSIT_DETECTED",
            ExceptionType::MultiCurrencyReview => "MULTI_CURRENCY_REVIEW",
        }
    }

    pub fn all() -> [ExceptionType; 7] {
        [
            ExceptionType::PayoutMissingInBank,
            ExceptionType::AmbiguousBankCandidates,
            ExceptionType::PayoutMissingInLedger,
            ExceptionType::BankTransactionUnmatched,
            ExceptionType::LedgerTransactionUnmatched,
            ExceptionType::CashDepositDetected,
            ExceptionType::MultiCurrencyReview,
        ]
    }

    /// The one severity table
    pub fn severity(&self) -> Severity {
        match self {
            ExceptionType::PayoutMissingInBank => Severity::Critical,
            ExceptionType::PayoutMissingInLedger => Severity::High,
            ExceptionType::AmbiguousBankCandidates => Severity::High,
            ExceptionType::BankTransactionUnmatched => Severity::Medium,
            ExceptionType::CashDepositDetected => Severity::Medium,
            ExceptionType::MultiCurrencyReview => Severity::Medium,
            ExceptionType::LedgerTransactionUnmatched => Severity::Low,
        }
    }

    /// The one remediation table
    pub fn proposed_action(&self) -> ProposedAction {
        match self {
            ExceptionType::PayoutMissingInBank => ProposedAction::InvestigatePayout,
            ExceptionType::AmbiguousBankCandidates => ProposedAction::LinkManually,
            ExceptionType::PayoutMissingInLedger => ProposedAction::CreateLedgerDeposit,
            ExceptionType::BankTransactionUnmatched => ProposedAction::CreateLedgerDeposit,
            ExceptionType::LedgerTransactionUnmatched => ProposedAction::Ignore,
            ExceptionType::CashDepositDetected => ProposedAction::RecordCashDeposit,
            ExceptionType::MultiCurrencyReview => ProposedAction::ReviewCurrency,
        }
    }

    /// Kind of the record the exception is about
    pub fn subject_kind(&self) -> SourceKind {
        match self {
            ExceptionType::PayoutMissingInBank
            | ExceptionType::AmbiguousBankCandidates
            | ExceptionType::PayoutMissingInLedger => SourceKind::Payout,
            ExceptionType::BankTransactionUnmatched
            | ExceptionType::CashDepositDetected
            | ExceptionType::MultiCurrencyReview => SourceKind::Bank,
            ExceptionType::LedgerTransactionUnmatched => SourceKind::Ledger,
        }
    }
}

impl fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExceptionType {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_uppercase();
        ExceptionType::all()
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| ReconError::Validation(format!("unknown exception type {:?}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Sort key, most urgent first
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposedAction {
    InvestigatePayout,
    LinkManually,
    CreateLedgerDeposit,
    RecordCashDeposit,
    ReviewCurrency,
    Ignore,
}

impl ProposedAction {
    pub fn label(&self) -> &'static str {
        match self {
            ProposedAction::InvestigatePayout => "Investigate payout with processor",
            ProposedAction::LinkManually => "Pick the matching bank transaction",
            ProposedAction::CreateLedgerDeposit => "Create ledger deposit",
            ProposedAction::RecordCashDeposit => "Record cash deposit",
            ProposedAction::ReviewCurrency => "Review currency conversion",
            ProposedAction::Ignore => "Ignore",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionStatus {
    Open,
    Resolved,
    Ignored,
}

impl ExceptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionStatus::Open => "open",
            ExceptionStatus::Resolved => "resolved",
            ExceptionStatus::Ignored => "ignored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExceptionStatus::Open)
    }
}

impl fmt::Display for ExceptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExceptionStatus {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(ExceptionStatus::Open),
            "resolved" => Ok(ExceptionStatus::Resolved),
            "ignored" => Ok(ExceptionStatus::Ignored),
            other => Err(ReconError::Validation(format!("unknown exception status {:?}", other))),
        }
    }
}

/// Which component raised an exception. Each origin is regenerated
/// independently: matcher exceptions at the start of a run, sweep
/// exceptions by the complement sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionOrigin {
    Matcher,
    Sweep,
}

pub type EntityRefs = BTreeMap<SourceKind, Vec<String>>;

// ============================================================================
// EXCEPTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    pub id: String,
    pub company_id: String,
    pub exception_type: ExceptionType,
    pub severity: Severity,
    pub status: ExceptionStatus,
    pub entity_refs: EntityRefs,
    pub evidence: serde_json::Value,
    pub proposed_action: ProposedAction,
    pub confidence: f64,
    pub origin: ExceptionOrigin,
    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl Exception {
    /// New open exception; severity and action come from the type tables
    pub fn new(
        company_id: &str,
        exception_type: ExceptionType,
        entity_refs: EntityRefs,
        evidence: serde_json::Value,
        confidence: f64,
        origin: ExceptionOrigin,
    ) -> Self {
        Exception {
            id: uuid::Uuid::new_v4().to_string(),
            company_id: company_id.to_string(),
            exception_type,
            severity: exception_type.severity(),
            status: ExceptionStatus::Open,
            entity_refs,
            evidence,
            proposed_action: exception_type.proposed_action(),
            confidence,
            origin,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        }
    }

    pub fn references(&self, kind: SourceKind) -> &[String] {
        self.entity_refs.get(&kind).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// The record this exception is about
    pub fn subject(&self) -> Option<RecordKey> {
        let kind = self.exception_type.subject_kind();
        self.references(kind)
            .first()
            .map(|r| RecordKey::new(kind, r.clone()))
    }

    pub fn mentions(&self, key: &RecordKey) -> bool {
        self.references(key.kind).iter().any(|r| r == &key.source_ref)
    }

    pub fn audit_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.exception_type,
            "severity": self.severity,
            "entity_refs": self.entity_refs,
            "proposed_action": self.proposed_action,
            "confidence": self.confidence,
            "origin": self.origin,
        })
    }
}

// ============================================================================
// ENTITY REFS & EVIDENCE
// ============================================================================

pub fn entity_refs_for(record: &NormalizedRecord) -> EntityRefs {
    let mut refs = EntityRefs::new();
    refs.insert(record.source_kind, vec![record.source_ref.clone()]);
    refs
}

pub fn entity_refs_with_candidates(source: &NormalizedRecord, candidates: &[MatchCandidate]) -> EntityRefs {
    let mut refs = entity_refs_for(source);
    for candidate in candidates {
        refs.entry(candidate.record.source_kind)
            .or_default()
            .push(candidate.record.source_ref.clone());
    }
    refs
}

/// Amount, currency, date, description and keywords of one record
pub fn record_evidence(record: &NormalizedRecord) -> serde_json::Value {
    serde_json::json!({
        "source_ref": record.source_ref,
        "source_kind": record.source_kind,
        "amount_minor": record.amount_minor,
        "currency": record.currency,
        "date": record.date.format("%Y-%m-%d").to_string(),
        "description": record.description,
        "keywords": record.keywords,
    })
}

fn with_fields(mut evidence: serde_json::Value, fields: Vec<(&str, serde_json::Value)>) -> serde_json::Value {
    if let Some(map) = evidence.as_object_mut() {
        for (key, value) in fields {
            map.insert(key.to_string(), value);
        }
    }
    evidence
}

pub fn missing_evidence(
    source: &NormalizedRecord,
    window: &SearchWindow,
    best_confidence: Option<f64>,
) -> serde_json::Value {
    with_fields(
        record_evidence(source),
        vec![
            ("search_window", serde_json::json!(window)),
            ("best_confidence", serde_json::json!(best_confidence)),
        ],
    )
}

pub fn ambiguous_evidence(
    source: &NormalizedRecord,
    candidates: &[MatchCandidate],
    window: &SearchWindow,
) -> serde_json::Value {
    let listed: Vec<serde_json::Value> = candidates.iter().map(|c| c.evidence()).collect();

    with_fields(
        record_evidence(source),
        vec![
            ("search_window", serde_json::json!(window)),
            ("candidates", serde_json::Value::Array(listed)),
        ],
    )
}

/// Evidence for a payout that reached the bank but not the ledger
pub fn proposal_evidence(source: &NormalizedRecord, proposal: &ProposedLedgerEntry) -> serde_json::Value {
    with_fields(
        record_evidence(source),
        vec![("proposal", serde_json::json!(proposal))],
    )
}

fn sweep_evidence(record: &NormalizedRecord, reason: &str) -> serde_json::Value {
    with_fields(
        record_evidence(record),
        vec![("reason", serde_json::json!(reason))],
    )
}

// ============================================================================
// PERSISTENCE
// ============================================================================

/// Insert an exception and its audit event inside the caller's transaction
pub(crate) fn insert_exception_with_audit(conn: &Connection, exception: &Exception, actor_id: &str) -> Result<()> {
    db::insert_exception(conn, exception)?;
    audit::append(
        conn,
        &exception.company_id,
        actor_id,
        "exception_created",
        "exception",
        &exception.id,
        &exception.audit_payload(),
    )?;
    Ok(())
}

/// Persist one exception atomically with its audit event
pub fn persist_exception(conn: &Connection, exception: &Exception, actor_id: &str) -> Result<()> {
    let tx = db::begin_immediate(conn)?;
    insert_exception_with_audit(&tx, exception, actor_id)?;
    tx.commit()?;
    Ok(())
}

/// Remove open exceptions of one origin (audited when anything was removed)
pub fn clear_open(conn: &Connection, company_id: &str, origin: ExceptionOrigin, actor_id: &str) -> Result<usize> {
    let tx = db::begin_immediate(conn)?;
    let cleared = clear_open_in(&tx, company_id, origin, actor_id)?;
    tx.commit()?;
    Ok(cleared)
}

fn clear_open_in(conn: &Connection, company_id: &str, origin: ExceptionOrigin, actor_id: &str) -> Result<usize> {
    let cleared = db::delete_open_exceptions(conn, company_id, origin)?;

    if cleared > 0 {
        audit::append(
            conn,
            company_id,
            actor_id,
            "exceptions_cleared",
            "company",
            company_id,
            &serde_json::json!({ "origin": origin, "count": cleared }),
        )?;
    }

    Ok(cleared)
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Type for a bank transaction with no counterpart at all
pub fn classify_bank(record: &NormalizedRecord, settings: &Settings) -> ExceptionType {
    if record.currency != settings.home_currency {
        ExceptionType::MultiCurrencyReview
    } else if record.keywords.contains("cash") || record.keywords.contains("atm") {
        ExceptionType::CashDepositDetected
    } else {
        ExceptionType::BankTransactionUnmatched
    }
}

/// Type for a payout missing one of its links, if any is missing
pub fn classify_payout(record: &NormalizedRecord, matched: &MatchedSet) -> Option<ExceptionType> {
    let key = record.key();
    if !matched.has_link(&key, SourceKind::Bank) {
        Some(ExceptionType::PayoutMissingInBank)
    } else if !matched.has_link(&key, SourceKind::Ledger) {
        Some(ExceptionType::PayoutMissingInLedger)
    } else {
        None
    }
}

fn sweep_reason(exception_type: ExceptionType) -> &'static str {
    match exception_type {
        ExceptionType::PayoutMissingInBank => "no bank transaction linked to payout",
        ExceptionType::PayoutMissingInLedger => "no ledger object linked to payout",
        ExceptionType::MultiCurrencyReview => "foreign-currency transaction with no counterpart",
        ExceptionType::CashDepositDetected => "cash deposit with no counterpart",
        ExceptionType::BankTransactionUnmatched => "bank transaction with no counterpart",
        ExceptionType::LedgerTransactionUnmatched => "ledger object with no counterpart",
        ExceptionType::AmbiguousBankCandidates => "multiple candidates",
    }
}

// ============================================================================
// COMPLEMENT SWEEP
// ============================================================================

/// Normalized records of one company, split by source
#[derive(Debug, Clone, Default)]
pub struct SourcePools {
    pub payouts: Vec<NormalizedRecord>,
    pub bank: Vec<NormalizedRecord>,
    pub ledger: Vec<NormalizedRecord>,

    /// Records that failed normalization and were left out of every pool
    pub degraded: Vec<RecordKey>,
}

impl SourcePools {
    pub fn load(conn: &Connection, company_id: &str, home_currency: &str) -> Result<Self> {
        let mut pools = SourcePools::default();

        for kind in SourceKind::all() {
            for raw in db::get_records(conn, company_id, kind)? {
                let record = normalize(&raw, home_currency);
                if record.degraded {
                    pools.degraded.push(record.key());
                    continue;
                }
                match kind {
                    SourceKind::Payout => pools.payouts.push(record),
                    SourceKind::Bank => pools.bank.push(record),
                    SourceKind::Ledger => pools.ledger.push(record),
                }
            }
        }

        Ok(pools)
    }

    pub fn get(&self, kind: SourceKind) -> &[NormalizedRecord] {
        match kind {
            SourceKind::Payout => &self.payouts,
            SourceKind::Bank => &self.bank,
            SourceKind::Ledger => &self.ledger,
        }
    }
}

/// `(subject, type)` pairs already closed out by a resolved or ignored exception
pub fn closed_subjects(exceptions: &[Exception]) -> HashSet<(RecordKey, ExceptionType)> {
    exceptions
        .iter()
        .filter(|e| e.status.is_terminal())
        .filter_map(|e| e.subject().map(|s| (s, e.exception_type)))
        .collect()
}

/// Complement sweep: one exception per record missing the links it needs.
///
/// In one transaction: clears open sweep exceptions, then inserts fresh ones
/// for every record that is not matched, not already covered by an open
/// exception, and not closed out by a terminal exception of the same type.
pub fn generate_exceptions(
    conn: &Connection,
    company_id: &str,
    settings: &Settings,
    pools: &SourcePools,
    matched: &MatchedSet,
    actor_id: &str,
) -> Result<Vec<Exception>> {
    let tx = db::begin_immediate(conn)?;
    let cleared = clear_open_in(&tx, company_id, ExceptionOrigin::Sweep, actor_id)?;

    let existing = db::get_exceptions(&tx, company_id, None)?;
    let covered: HashSet<RecordKey> = existing
        .iter()
        .filter(|e| e.status == ExceptionStatus::Open)
        .flat_map(|e| {
            e.entity_refs
                .iter()
                .flat_map(|(kind, refs)| refs.iter().map(move |r| RecordKey::new(*kind, r.clone())))
        })
        .collect();
    let closed = closed_subjects(&existing);

    let mut generated = Vec::new();

    let unmatched = pools
        .payouts
        .iter()
        .filter_map(|r| classify_payout(r, matched).map(|t| (r, t)))
        .chain(
            pools
                .bank
                .iter()
                .filter(|r| !matched.is_matched(&r.key()))
                .map(|r| (r, classify_bank(r, settings))),
        )
        .chain(
            pools
                .ledger
                .iter()
                .filter(|r| !matched.is_matched(&r.key()))
                .map(|r| (r, ExceptionType::LedgerTransactionUnmatched)),
        );

    for (record, exception_type) in unmatched {
        let key = record.key();
        if covered.contains(&key) || closed.contains(&(key, exception_type)) {
            continue;
        }

        let exception = Exception::new(
            company_id,
            exception_type,
            entity_refs_for(record),
            sweep_evidence(record, sweep_reason(exception_type)),
            0.0,
            ExceptionOrigin::Sweep,
        );
        insert_exception_with_audit(&tx, &exception, actor_id)?;
        generated.push(exception);
    }

    tx.commit()?;

    if !pools.degraded.is_empty() {
        warn!(
            company_id = %company_id,
            degraded = pools.degraded.len(),
            "Degraded records excluded from exception sweep"
        );
    }
    info!(
        company_id = %company_id,
        cleared = cleared,
        generated = generated.len(),
        "Generated exceptions"
    );

    Ok(generated)
}

/// Load pools and matches from the store, then sweep
pub fn generate_for_company(
    conn: &Connection,
    company_id: &str,
    settings: &Settings,
    actor_id: &str,
) -> Result<Vec<Exception>> {
    let pools = SourcePools::load(conn, company_id, &settings.home_currency)?;
    let matched = MatchedSet::from_matches(&db::get_matches(conn, company_id)?);
    generate_exceptions(conn, company_id, settings, &pools, &matched, actor_id)
}

// ============================================================================
// TESTS
// ============================================================================
