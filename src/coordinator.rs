// 🧭 Matching Coordinator - One reconciliation run for one company
//
// Stages, in order:
//   1. payout → bank     (candidate matcher; exceptions for misses/ambiguity)
//   2. payout → ledger   (only payouts that already have a bank match)
//   3. bank → ledger     (bank transactions with no counterpart; auto-match only)
//   4. sweep             (complement set → typed exceptions)
//
// A failure on one record is recorded in the report and the run moves on.

use crate::audit;
use crate::db;
use crate::error::{ReconError, Result};
use crate::exceptions::{self, EntityRefs, Exception, ExceptionOrigin, ExceptionType, SourcePools};
use crate::ledger::{self, LedgerLinker, StoreDirectory};
use crate::matcher::{CandidateMatcher, CandidatePool, MatchOutcome, MatchPass, MatchedSet, Tolerance};
use crate::normalize::NormalizedRecord;
use crate::records::{RecordKey, SourceKind};
use crate::retry::{with_retry, RetryConfig};
use crate::settings::Settings;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{info, instrument, warn};

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalize,
    PayoutBank,
    PayoutLedger,
    BankLedger,
    Sweep,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Normalize => "normalize",
            Stage::PayoutBank => "payout_bank",
            Stage::PayoutLedger => "payout_ledger",
            Stage::BankLedger => "bank_ledger",
            Stage::Sweep => "sweep",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub processed: usize,
    pub matched: usize,
    pub exceptions: usize,
    pub skipped: usize,
}

impl StageReport {
    fn new(stage: Stage) -> Self {
        StageReport {
            stage,
            processed: 0,
            matched: 0,
            exceptions: 0,
            skipped: 0,
        }
    }
}

/// A record (or stage) that failed; the rest of the run went ahead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    pub stage: Stage,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_kind: Option<SourceKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,

    pub kind: String,
    pub message: String,
}

impl RecordError {
    fn new(stage: Stage, key: Option<&RecordKey>, err: &ReconError) -> Self {
        RecordError {
            stage,
            source_kind: key.map(|k| k.kind),
            source_ref: key.map(|k| k.source_ref.clone()),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingReport {
    pub run_id: String,
    pub company_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stages: Vec<StageReport>,
    pub errors: Vec<RecordError>,
    pub success: bool,
}

impl MatchingReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn total_matched(&self) -> usize {
        self.stages.iter().map(|s| s.matched).sum()
    }

    pub fn total_exceptions(&self) -> usize {
        self.stages.iter().map(|s| s.exceptions).sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "Run {} for {}: {} matched, {} exceptions, {} errors in {}ms",
            self.run_id,
            self.company_id,
            self.total_matched(),
            self.total_exceptions(),
            self.errors.len(),
            self.duration_ms
        )
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

pub struct MatchingCoordinator<'a> {
    conn: &'a Connection,
    settings: Settings,
    retry: RetryConfig,
    actor_id: String,
}

impl<'a> MatchingCoordinator<'a> {
    pub fn new(conn: &'a Connection, settings: Settings) -> Self {
        MatchingCoordinator {
            conn,
            settings,
            retry: RetryConfig::default(),
            actor_id: "system".to_string(),
        }
    }

    /// Builder pattern: set retry policy for per-record writes and lookups
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Builder pattern: set the actor recorded on audit events
    pub fn with_actor(mut self, actor_id: &str) -> Self {
        self.actor_id = actor_id.to_string();
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run every stage for `company_id`.
    ///
    /// Returns Err only when the run cannot start (store unreadable). Anything
    /// after that lands in the report's error list.
    #[instrument(skip(self), fields(actor = %self.actor_id))]
    pub fn run_matching(&self, company_id: &str) -> Result<MatchingReport> {
        let timer = Instant::now();
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut errors = Vec::new();
        let mut stages = Vec::new();

        let pools = SourcePools::load(self.conn, company_id, &self.settings.home_currency)?;
        let mut normalize_stage = StageReport::new(Stage::Normalize);
        normalize_stage.processed = pools.payouts.len() + pools.bank.len() + pools.ledger.len() + pools.degraded.len();
        normalize_stage.skipped = pools.degraded.len();
        for key in &pools.degraded {
            let err = ReconError::Validation(format!("{} could not be normalized", key));
            errors.push(RecordError::new(Stage::Normalize, Some(key), &err));
        }
        stages.push(normalize_stage);

        exceptions::clear_open(self.conn, company_id, ExceptionOrigin::Matcher, &self.actor_id)?;
        audit::log_event(
            self.conn,
            company_id,
            &self.actor_id,
            "matching_run_started",
            "run",
            &run_id,
            &serde_json::json!({
                "payouts": pools.payouts.len(),
                "bank": pools.bank.len(),
                "ledger": pools.ledger.len(),
                "degraded": pools.degraded.len(),
            }),
        )?;

        let mut matched = MatchedSet::from_matches(&db::get_matches(self.conn, company_id)?);
        let closed = exceptions::closed_subjects(&db::get_exceptions(self.conn, company_id, None)?);

        info!(company_id = %company_id, run_id = %run_id, "Matching run started");

        stages.push(self.payout_bank_stage(company_id, &pools, &mut matched, &closed, &mut errors));
        stages.push(self.payout_ledger_stage(company_id, &pools, &mut matched, &closed, &mut errors));
        stages.push(self.bank_ledger_stage(company_id, &pools, &mut matched, &mut errors));

        let mut sweep = StageReport::new(Stage::Sweep);
        match exceptions::generate_exceptions(self.conn, company_id, &self.settings, &pools, &matched, &self.actor_id) {
            Ok(generated) => sweep.exceptions = generated.len(),
            Err(err) => {
                warn!(company_id = %company_id, error = %err, "Exception sweep failed");
                errors.push(RecordError::new(Stage::Sweep, None, &err));
            }
        }
        stages.push(sweep);

        let report = MatchingReport {
            run_id: run_id.clone(),
            company_id: company_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: timer.elapsed().as_millis() as u64,
            success: errors.is_empty(),
            stages,
            errors,
        };

        audit::log_event(
            self.conn,
            company_id,
            &self.actor_id,
            "matching_run_completed",
            "run",
            &run_id,
            &serde_json::json!({
                "matched": report.total_matched(),
                "exceptions": report.total_exceptions(),
                "errors": report.errors.len(),
                "success": report.success,
            }),
        )?;

        info!(
            company_id = %company_id,
            run_id = %run_id,
            matched = report.total_matched(),
            exceptions = report.total_exceptions(),
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "Matching run completed"
        );

        Ok(report)
    }

    // ========================================================================
    // STAGE 1: payout → bank
    // ========================================================================

    fn payout_bank_stage(
        &self,
        company_id: &str,
        pools: &SourcePools,
        matched: &mut MatchedSet,
        closed: &HashSet<(RecordKey, ExceptionType)>,
        errors: &mut Vec<RecordError>,
    ) -> StageReport {
        let mut stage = StageReport::new(Stage::PayoutBank);
        let matcher = CandidateMatcher::new(self.conn, Tolerance::from_settings(&self.settings), &self.actor_id);
        let mut bank_pool = CandidatePool::new(
            pools
                .bank
                .iter()
                .filter(|b| !matched.has_link(&b.key(), SourceKind::Payout))
                .cloned()
                .collect(),
        );

        for payout in &pools.payouts {
            let key = payout.key();
            if matched.has_link(&key, SourceKind::Bank)
                || closed.contains(&(key.clone(), ExceptionType::PayoutMissingInBank))
                || closed.contains(&(key.clone(), ExceptionType::AmbiguousBankCandidates))
            {
                stage.skipped += 1;
                continue;
            }
            stage.processed += 1;

            let outcome = with_retry(&self.retry, "payout_bank_match", || {
                matcher.match_record(company_id, payout, &mut bank_pool, MatchPass::PayoutBank)
            });

            match outcome {
                Ok(MatchOutcome::Matched(m)) => {
                    matched.add(&m);
                    stage.matched += 1;
                }
                Ok(MatchOutcome::Excepted(_)) => stage.exceptions += 1,
                Err(err) => {
                    warn!(source = %key, error = %err, "Payout → bank matching failed");
                    errors.push(RecordError::new(Stage::PayoutBank, Some(&key), &err));
                }
            }
        }

        stage
    }

    // ========================================================================
    // STAGE 2: payout → ledger
    // ========================================================================

    fn payout_ledger_stage(
        &self,
        company_id: &str,
        pools: &SourcePools,
        matched: &mut MatchedSet,
        closed: &HashSet<(RecordKey, ExceptionType)>,
        errors: &mut Vec<RecordError>,
    ) -> StageReport {
        let mut stage = StageReport::new(Stage::PayoutLedger);
        let directory = StoreDirectory::new(self.conn);
        let linker = LedgerLinker::new(&directory, &self.settings).with_retry(self.retry.clone());
        let bank_by_ref: HashMap<&str, &NormalizedRecord> =
            pools.bank.iter().map(|b| (b.source_ref.as_str(), b)).collect();
        let mut ledger_pool = CandidatePool::new(
            pools
                .ledger
                .iter()
                .filter(|l| !matched.has_link(&l.key(), SourceKind::Payout))
                .cloned()
                .collect(),
        );

        for payout in &pools.payouts {
            let key = payout.key();

            // No bank match, no ledger linking
            let bank_ref = match matched.counterpart(&key, SourceKind::Bank) {
                Some(bank_ref) => bank_ref.to_string(),
                None => continue,
            };
            if matched.has_link(&key, SourceKind::Ledger)
                || closed.contains(&(key.clone(), ExceptionType::PayoutMissingInLedger))
            {
                stage.skipped += 1;
                continue;
            }
            stage.processed += 1;

            let counterpart = bank_by_ref.get(bank_ref.as_str()).copied();
            let bank_confidence = matched.link_confidence(&key, SourceKind::Bank).unwrap_or(0.0);

            match self.link_payout(company_id, payout, counterpart, bank_confidence, &linker, &mut ledger_pool) {
                Ok(MatchOutcome::Matched(m)) => {
                    matched.add(&m);
                    stage.matched += 1;
                }
                Ok(MatchOutcome::Excepted(_)) => stage.exceptions += 1,
                Err(err) => {
                    warn!(source = %key, error = %err, "Payout → ledger linking failed");
                    errors.push(RecordError::new(Stage::PayoutLedger, Some(&key), &err));
                }
            }
        }

        stage
    }

    fn link_payout(
        &self,
        company_id: &str,
        payout: &NormalizedRecord,
        counterpart: Option<&NormalizedRecord>,
        bank_confidence: f64,
        linker: &LedgerLinker<'_, StoreDirectory<'_>>,
        ledger_pool: &mut CandidatePool,
    ) -> Result<MatchOutcome> {
        if let Some(object) = linker.find_existing_link(company_id, payout, counterpart, ledger_pool)? {
            let m = with_retry(&self.retry, "payout_ledger_link", || {
                ledger::record_link(
                    self.conn,
                    company_id,
                    payout,
                    &object,
                    MatchPass::PayoutLedger.as_str(),
                    &self.actor_id,
                )
            })?;
            ledger_pool.consume(&object.ledger_ref);
            return Ok(MatchOutcome::Matched(m));
        }

        let proposal = linker.propose_creation(company_id, payout, counterpart);
        let mut refs = EntityRefs::new();
        refs.insert(SourceKind::Payout, vec![payout.source_ref.clone()]);
        if let Some(bank) = counterpart {
            refs.insert(SourceKind::Bank, vec![bank.source_ref.clone()]);
        }

        let exception = Exception::new(
            company_id,
            ExceptionType::PayoutMissingInLedger,
            refs,
            exceptions::proposal_evidence(payout, &proposal),
            bank_confidence,
            ExceptionOrigin::Matcher,
        );
        with_retry(&self.retry, "payout_ledger_exception", || {
            exceptions::persist_exception(self.conn, &exception, &self.actor_id)
        })?;

        Ok(MatchOutcome::Excepted(exception))
    }

    // ========================================================================
    // STAGE 3: bank → ledger
    // ========================================================================

    fn bank_ledger_stage(
        &self,
        company_id: &str,
        pools: &SourcePools,
        matched: &mut MatchedSet,
        errors: &mut Vec<RecordError>,
    ) -> StageReport {
        let mut stage = StageReport::new(Stage::BankLedger);
        let matcher = CandidateMatcher::new(self.conn, Tolerance::from_settings(&self.settings), &self.actor_id);
        let mut ledger_pool = CandidatePool::new(
            pools
                .ledger
                .iter()
                .filter(|l| !matched.is_matched(&l.key()))
                .cloned()
                .collect(),
        );

        for bank in &pools.bank {
            let key = bank.key();
            if matched.is_matched(&key) {
                stage.skipped += 1;
                continue;
            }
            stage.processed += 1;

            let outcome = with_retry(&self.retry, "bank_ledger_match", || {
                matcher.auto_match(company_id, bank, &mut ledger_pool, MatchPass::BankLedger)
            });

            match outcome {
                Ok(Some(m)) => {
                    matched.add(&m);
                    stage.matched += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(source = %key, error = %err, "Bank → ledger matching failed");
                    errors.push(RecordError::new(Stage::BankLedger, Some(&key), &err));
                }
            }
        }

        stage
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exceptions::{ExceptionStatus, Severity};
    use crate::lifecycle::{bulk_transition, ExceptionAction};
    use crate::records::{RawAmount, RawRecord};

    fn create_test_record(kind: SourceKind, source_ref: &str, amount: i64, date: &str, description: &str) -> RawRecord {
        RawRecord::new(kind, source_ref, RawAmount::minor(amount), date, description).with_currency("CAD")
    }

    fn create_test_coordinator(conn: &Connection) -> MatchingCoordinator<'_> {
        MatchingCoordinator::new(conn, Settings::with_home_currency("CAD")).with_retry(RetryConfig::immediate(2))
    }

    fn open_exceptions(conn: &Connection) -> Vec<Exception> {
        db::get_exceptions(conn, "co_1", Some(ExceptionStatus::Open)).unwrap()
    }

    #[test]
    fn test_scenario_exact_payout_bank_match() {
        let conn = db::open_in_memory().unwrap();
        db::ingest_records(
            &conn,
            "co_1",
            &[
                create_test_record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "STRIPE PAYOUT"),
                create_test_record(SourceKind::Bank, "bt_1", 100000, "2025-01-15", "STRIPE TRANSFER"),
            ],
        )
        .unwrap();

        let report = create_test_coordinator(&conn).run_matching("co_1").unwrap();

        let matches = db::get_matches(&conn, "co_1").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].confidence, 1.0);
        assert_eq!(matches[0].strategy, "payout_bank_exact");
        assert_eq!(report.stage(Stage::PayoutBank).unwrap().matched, 1);
        assert!(report.success);

        // No ledger object yet: stage 2 proposes one
        let open = open_exceptions(&conn);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].exception_type, ExceptionType::PayoutMissingInLedger);
        assert_eq!(open[0].confidence, 1.0);
        assert_eq!(open[0].evidence["proposal"]["external_ref"], "payout:po_1");
        assert_eq!(open[0].evidence["proposal"]["amount_minor"], 100000);
    }

    #[test]
    fn test_scenario_two_identical_bank_candidates() {
        let conn = db::open_in_memory().unwrap();
        db::ingest_records(
            &conn,
            "co_1",
            &[
                create_test_record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "STRIPE PAYOUT"),
                create_test_record(SourceKind::Bank, "bt_1", 100000, "2025-01-15", "STRIPE TRANSFER"),
                create_test_record(SourceKind::Bank, "bt_2", 100000, "2025-01-15", "STRIPE TRANSFER"),
            ],
        )
        .unwrap();

        create_test_coordinator(&conn).run_matching("co_1").unwrap();

        let open = open_exceptions(&conn);
        assert!(db::get_matches(&conn, "co_1").unwrap().is_empty());
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].exception_type, ExceptionType::AmbiguousBankCandidates);
        assert_eq!(open[0].references(SourceKind::Bank), ["bt_1".to_string(), "bt_2".to_string()]);
        assert_eq!(open[0].evidence["candidates"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_scenario_payout_missing_in_bank() {
        let conn = db::open_in_memory().unwrap();
        db::ingest_records(
            &conn,
            "co_1",
            &[
                create_test_record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "STRIPE PAYOUT"),
                create_test_record(SourceKind::Bank, "bt_far", 100000, "2025-02-20", "STRIPE TRANSFER"),
            ],
        )
        .unwrap();

        let report = create_test_coordinator(&conn).run_matching("co_1").unwrap();

        let open = open_exceptions(&conn);
        let missing: Vec<&Exception> = open
            .iter()
            .filter(|e| e.exception_type == ExceptionType::PayoutMissingInBank)
            .collect();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].severity, Severity::Critical);
        assert!(missing[0].evidence["search_window"].is_object());
        // stage 2 never sees a payout without a bank match
        assert_eq!(report.stage(Stage::PayoutLedger).unwrap().processed, 0);
    }

    #[test]
    fn test_full_chain_links_payout_bank_and_ledger() {
        let conn = db::open_in_memory().unwrap();
        db::ingest_records(
            &conn,
            "co_1",
            &[
                create_test_record(SourceKind::Payout, "po_1", 100000, "2025-01-14", "STRIPE PAYOUT"),
                create_test_record(SourceKind::Bank, "bt_1", 100000, "2025-01-14", "STRIPE TRANSFER"),
                create_test_record(SourceKind::Ledger, "je_1", 100000, "2025-01-14", "Stripe deposit"),
                create_test_record(SourceKind::Bank, "bt_2", 4250, "2025-01-20", "INTERAC E-TRANSFER"),
                create_test_record(SourceKind::Ledger, "je_2", 4250, "2025-01-20", "Customer payment"),
            ],
        )
        .unwrap();

        let report = create_test_coordinator(&conn).run_matching("co_1").unwrap();

        let strategies: HashSet<String> = db::get_matches(&conn, "co_1")
            .unwrap()
            .into_iter()
            .map(|m| m.strategy)
            .collect();
        assert!(strategies.contains("payout_bank_exact"));
        assert!(strategies.contains("payout_ledger_fuzzy"));
        assert!(strategies.contains("bank_ledger_exact"));
        assert_eq!(report.total_matched(), 3);
        assert!(open_exceptions(&conn).is_empty());
        assert!(audit::verify_integrity(&conn, "co_1").unwrap().valid);
    }

    #[test]
    fn test_ledger_entry_two_days_off_is_linked() {
        let conn = db::open_in_memory().unwrap();
        db::ingest_records(
            &conn,
            "co_1",
            &[
                create_test_record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "STRIPE PAYOUT"),
                create_test_record(SourceKind::Bank, "bt_1", 100000, "2025-01-15", "STRIPE TRANSFER"),
                create_test_record(SourceKind::Ledger, "je_1", 100000, "2025-01-17", "Deposit"),
            ],
        )
        .unwrap();

        let report = create_test_coordinator(&conn).run_matching("co_1").unwrap();

        let ledger_match = db::get_matches(&conn, "co_1")
            .unwrap()
            .into_iter()
            .find(|m| m.right_type == SourceKind::Ledger)
            .unwrap();
        assert_eq!(ledger_match.left_ref, "po_1");
        assert_eq!(ledger_match.right_ref, "je_1");
        assert_eq!(ledger_match.strategy, "payout_ledger_fuzzy");
        assert_eq!(report.stage(Stage::PayoutLedger).unwrap().matched, 1);
        assert!(open_exceptions(&conn).is_empty());
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let conn = db::open_in_memory().unwrap();
        db::ingest_records(
            &conn,
            "co_1",
            &[
                create_test_record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "STRIPE PAYOUT"),
                create_test_record(SourceKind::Payout, "po_2", 55000, "2025-01-16", "STRIPE PAYOUT"),
                create_test_record(SourceKind::Payout, "po_3", 70000, "2025-01-10", "STRIPE PAYOUT"),
                create_test_record(SourceKind::Bank, "bt_1", 100000, "2025-01-15", "STRIPE TRANSFER"),
                create_test_record(SourceKind::Bank, "bt_2", 55000, "2025-01-17", "STRIPE TRANSFER"),
                create_test_record(SourceKind::Bank, "bt_3", 20000, "2025-01-18", "ATM CASH DEPOSIT"),
                create_test_record(SourceKind::Ledger, "je_1", 100000, "2025-01-15", "Stripe deposit"),
                create_test_record(SourceKind::Ledger, "je_9", 9900, "2025-01-03", "Invoice 1042"),
            ],
        )
        .unwrap();
        let coordinator = create_test_coordinator(&conn);

        coordinator.run_matching("co_1").unwrap();
        let matches_first = db::get_matches(&conn, "co_1").unwrap();
        let shape = |list: Vec<Exception>| {
            let mut shape: Vec<(ExceptionType, String)> = list
                .into_iter()
                .map(|e| (e.exception_type, e.evidence.to_string()))
                .collect();
            shape.sort();
            shape
        };
        let open_first = shape(open_exceptions(&conn));

        let second = coordinator.run_matching("co_1").unwrap();
        let matches_second = db::get_matches(&conn, "co_1").unwrap();

        assert_eq!(matches_first, matches_second);
        assert_eq!(open_first, shape(open_exceptions(&conn)));
        assert_eq!(second.total_matched(), 0);

        // Each record sits on each side of at most one match per counterpart kind
        let mut seen = HashSet::new();
        for m in &matches_second {
            assert!(seen.insert((m.left_key(), m.right_type)));
            assert!(seen.insert((m.right_key(), m.left_type)));
        }
        assert!(audit::verify_integrity(&conn, "co_1").unwrap().valid);
    }

    #[test]
    fn test_degraded_record_does_not_abort_run() {
        let conn = db::open_in_memory().unwrap();
        db::ingest_records(
            &conn,
            "co_1",
            &[
                RawRecord::new(SourceKind::Payout, "po_bad", RawAmount::decimal("n/a"), "2025-01-15", "")
                    .with_currency("CAD"),
                create_test_record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "STRIPE PAYOUT"),
                create_test_record(SourceKind::Bank, "bt_1", 100000, "2025-01-15", "STRIPE TRANSFER"),
            ],
        )
        .unwrap();

        let report = create_test_coordinator(&conn).run_matching("co_1").unwrap();

        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].source_ref.as_deref(), Some("po_bad"));
        assert_eq!(report.errors[0].kind, "validation");
        assert_eq!(report.stage(Stage::PayoutBank).unwrap().matched, 1);
    }

    #[test]
    fn test_ignored_exception_stays_closed_across_runs() {
        let conn = db::open_in_memory().unwrap();
        db::ingest_records(
            &conn,
            "co_1",
            &[create_test_record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "STRIPE PAYOUT")],
        )
        .unwrap();
        let coordinator = create_test_coordinator(&conn);
        coordinator.run_matching("co_1").unwrap();
        let ids: Vec<String> = open_exceptions(&conn).into_iter().map(|e| e.id).collect();
        assert_eq!(ids.len(), 1);

        let bulk = bulk_transition(&conn, &ids, &ExceptionAction::Ignore, "u_1");
        assert!(bulk.success);

        coordinator.run_matching("co_1").unwrap();
        assert!(open_exceptions(&conn).is_empty());
    }

    #[test]
    fn test_run_events_are_audited() {
        let conn = db::open_in_memory().unwrap();

        let report = create_test_coordinator(&conn).run_matching("co_1").unwrap();

        let events = audit::get_events_for_entity(&conn, "run", &report.run_id).unwrap();
        let verbs: Vec<&str> = events.iter().map(|e| e.verb.as_str()).collect();
        assert_eq!(verbs, vec!["matching_run_started", "matching_run_completed"]);
        assert!(report.success);
    }
}
