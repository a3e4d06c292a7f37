// 🎯 Candidate Matcher - Generic pairwise matcher with confidence scoring
//
// Used for payout↔bank and bank/payout↔ledger linking. Two passes per
// source record, highest confidence first:
//   1. Exact     - bucket-key lookup: same amount, same currency, ±2 days
//   2. Tolerance - window scan: amount within max(amount × pct, floor),
//                  date within ±D days
//
// Confidence = 0.40·amount + 0.20·currency + 0.30·date + 0.10·description.
// Identical amount, currency and date is always exactly 1.0.

use crate::audit;
use crate::db;
use crate::error::{ReconError, Result};
use crate::exceptions::{self, Exception, ExceptionOrigin, ExceptionType};
use crate::normalize::NormalizedRecord;
use crate::records::{RecordKey, SourceKind};
use crate::settings::Settings;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

pub const AMOUNT_WEIGHT: f64 = 0.40;
pub const CURRENCY_WEIGHT: f64 = 0.20;
pub const DATE_WEIGHT: f64 = 0.30;
pub const DESCRIPTION_WEIGHT: f64 = 0.10;

/// Ambiguous exceptions carry at most this many candidates
pub const MAX_AMBIGUOUS_CANDIDATES: usize = 3;

// ============================================================================
// MATCH (persisted link)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub company_id: String,
    pub left_ref: String,
    pub right_ref: String,
    pub left_type: SourceKind,
    pub right_type: SourceKind,
    pub strategy: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl Match {
    pub fn new(
        company_id: &str,
        left: &RecordKey,
        right: &RecordKey,
        strategy: &str,
        confidence: f64,
    ) -> Self {
        Match {
            id: uuid::Uuid::new_v4().to_string(),
            company_id: company_id.to_string(),
            left_ref: left.source_ref.clone(),
            right_ref: right.source_ref.clone(),
            left_type: left.kind,
            right_type: right.kind,
            strategy: strategy.to_string(),
            confidence,
            created_at: Utc::now(),
        }
    }

    pub fn left_key(&self) -> RecordKey {
        RecordKey::new(self.left_type, self.left_ref.clone())
    }

    pub fn right_key(&self) -> RecordKey {
        RecordKey::new(self.right_type, self.right_ref.clone())
    }

    pub fn audit_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "left": self.left_key().to_string(),
            "right": self.right_key().to_string(),
            "strategy": self.strategy,
            "confidence": self.confidence,
        })
    }
}

// ============================================================================
// MATCHED SET
// ============================================================================

/// Which records already have a Match, and with what on the other side
#[derive(Debug, Clone, Default)]
pub struct MatchedSet {
    links: HashMap<RecordKey, BTreeMap<SourceKind, (String, f64)>>,
}

impl MatchedSet {
    pub fn from_matches(matches: &[Match]) -> Self {
        let mut set = MatchedSet::default();
        for m in matches {
            set.add(m);
        }
        set
    }

    pub fn add(&mut self, m: &Match) {
        self.links
            .entry(m.left_key())
            .or_default()
            .insert(m.right_type, (m.right_ref.clone(), m.confidence));
        self.links
            .entry(m.right_key())
            .or_default()
            .insert(m.left_type, (m.left_ref.clone(), m.confidence));
    }

    pub fn is_matched(&self, key: &RecordKey) -> bool {
        self.links.get(key).map(|l| !l.is_empty()).unwrap_or(false)
    }

    pub fn has_link(&self, key: &RecordKey, counterpart: SourceKind) -> bool {
        self.counterpart(key, counterpart).is_some()
    }

    /// Reference of the record of kind `counterpart` matched to `key`
    pub fn counterpart(&self, key: &RecordKey, counterpart: SourceKind) -> Option<&str> {
        self.links
            .get(key)
            .and_then(|l| l.get(&counterpart))
            .map(|(r, _)| r.as_str())
    }

    pub fn link_confidence(&self, key: &RecordKey, counterpart: SourceKind) -> Option<f64> {
        self.links
            .get(key)
            .and_then(|l| l.get(&counterpart))
            .map(|(_, c)| *c)
    }

    /// Number of distinct records with at least one link
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

// ============================================================================
// TOLERANCE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Tolerance {
    pub amount_pct: f64,
    pub amount_floor_minor: i64,
    pub date_days: i64,
    pub auto_match_threshold: f64,
    pub ambiguous_threshold: f64,
}

impl Tolerance {
    pub fn from_settings(settings: &Settings) -> Self {
        Tolerance {
            amount_pct: settings.amount_tolerance_pct,
            amount_floor_minor: settings.amount_tolerance_floor_minor,
            date_days: settings.date_tolerance_days,
            auto_match_threshold: settings.auto_match_threshold,
            ambiguous_threshold: settings.ambiguous_threshold,
        }
    }

    /// max(|amount| × pct, floor), in minor units
    pub fn amount_tolerance(&self, amount_minor: i64) -> i64 {
        let pct = (amount_minor.unsigned_abs() as f64 * self.amount_pct).round() as i64;
        pct.max(self.amount_floor_minor)
    }

    pub fn window_for(&self, source: &NormalizedRecord) -> SearchWindow {
        let tolerance = self.amount_tolerance(source.amount_minor);
        let spread = Duration::days(self.date_days);
        SearchWindow {
            currency: source.currency.clone(),
            date_from: source.date.checked_sub_signed(spread).unwrap_or(NaiveDate::MIN),
            date_to: source.date.checked_add_signed(spread).unwrap_or(NaiveDate::MAX),
            amount_min_minor: source.amount_minor.saturating_sub(tolerance),
            amount_max_minor: source.amount_minor.saturating_add(tolerance),
        }
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance::from_settings(&Settings::default())
    }
}

/// The region of the target pool searched for one source record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchWindow {
    pub currency: String,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub amount_min_minor: i64,
    pub amount_max_minor: i64,
}

impl SearchWindow {
    pub fn contains(&self, record: &NormalizedRecord) -> bool {
        record.currency == self.currency
            && record.date >= self.date_from
            && record.date <= self.date_to
            && record.amount_minor >= self.amount_min_minor
            && record.amount_minor <= self.amount_max_minor
    }
}

// ============================================================================
// SCORING
// ============================================================================

/// 1.0 within tolerance, 0.8 within 2×, 0.6 within 3×, else 0
pub fn amount_score(diff_minor: i64, tolerance_minor: i64) -> f64 {
    let diff = diff_minor.unsigned_abs();
    let tolerance = tolerance_minor.max(0) as u64;

    if diff <= tolerance {
        1.0
    } else if diff <= tolerance.saturating_mul(2) {
        0.8
    } else if diff <= tolerance.saturating_mul(3) {
        0.6
    } else {
        0.0
    }
}

pub fn currency_score(a: &str, b: &str) -> f64 {
    if a == b {
        1.0
    } else {
        0.0
    }
}

pub fn date_score(days_apart: i64) -> f64 {
    match days_apart.abs() {
        0 => 1.0,
        1 => 0.95,
        2 => 0.85,
        3 => 0.7,
        4..=7 => 0.5,
        _ => 0.0,
    }
}

/// Share of description tokens the two records have in common (Jaccard).
/// 0.5 when either description is empty.
pub fn description_score(a: &NormalizedRecord, b: &NormalizedRecord) -> f64 {
    if a.description.is_empty() || b.description.is_empty() {
        return 0.5;
    }

    let tokens_a = a.description_tokens();
    let tokens_b = b.description_tokens();
    let union = tokens_a.union(&tokens_b).count();
    if union == 0 {
        return 0.5;
    }

    tokens_a.intersection(&tokens_b).count() as f64 / union as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub amount: f64,
    pub currency: f64,
    pub date: f64,
    pub description: f64,
    pub total: f64,
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

pub fn score(source: &NormalizedRecord, target: &NormalizedRecord, tolerance: &Tolerance) -> ScoreBreakdown {
    let diff = target.amount_minor.saturating_sub(source.amount_minor);
    let days = (target.date - source.date).num_days();

    let amount = amount_score(diff, tolerance.amount_tolerance(source.amount_minor));
    let currency = currency_score(&source.currency, &target.currency);
    let date = date_score(days);
    let description = description_score(source, target);

    let total = if diff == 0 && days == 0 && currency == 1.0 {
        1.0
    } else {
        round4(
            (AMOUNT_WEIGHT * amount
                + CURRENCY_WEIGHT * currency
                + DATE_WEIGHT * date
                + DESCRIPTION_WEIGHT * description)
                .clamp(0.0, 1.0),
        )
    };

    ScoreBreakdown {
        amount,
        currency,
        date,
        description: round4(description),
        total,
    }
}

// ============================================================================
// MATCH CANDIDATE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub record: NormalizedRecord,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub checks: Vec<String>,
}

impl MatchCandidate {
    pub fn scored(source: &NormalizedRecord, target: &NormalizedRecord, tolerance: &Tolerance) -> Self {
        let breakdown = score(source, target, tolerance);
        let diff = target.amount_minor.saturating_sub(source.amount_minor);
        let days = (target.date - source.date).num_days();

        let mut reasons = Vec::new();
        if diff == 0 {
            reasons.push("Same amount".to_string());
        } else {
            reasons.push(format!("Amount differs by {} minor units", diff.unsigned_abs()));
        }
        match days.abs() {
            0 => reasons.push("Same day".to_string()),
            1 => reasons.push("Dates 1 day apart".to_string()),
            n => reasons.push(format!("Dates {} days apart", n)),
        }
        let shared: Vec<String> = source
            .keywords
            .intersection(&target.keywords)
            .cloned()
            .collect();
        if !shared.is_empty() {
            reasons.push(format!("Shared keywords: {}", shared.join(", ")));
        }

        let checks = vec![
            format!("amount:{:.2}", breakdown.amount),
            format!("currency:{:.2}", breakdown.currency),
            format!("date:{:.2}", breakdown.date),
            format!("description:{:.2}", breakdown.description),
        ];

        MatchCandidate {
            record: target.clone(),
            confidence: breakdown.total,
            reasons,
            checks,
        }
    }

    pub fn evidence(&self) -> serde_json::Value {
        serde_json::json!({
            "source_ref": self.record.source_ref,
            "source_kind": self.record.source_kind,
            "confidence": self.confidence,
            "amount_minor": self.record.amount_minor,
            "currency": self.record.currency,
            "date": self.record.date.format("%Y-%m-%d").to_string(),
            "description": self.record.description,
            "reasons": self.reasons,
        })
    }
}

/// Descending confidence, then earliest date, then reference
fn rank(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.record.date.cmp(&b.record.date))
            .then_with(|| a.record.source_ref.cmp(&b.record.source_ref))
    });
}

// ============================================================================
// CANDIDATE POOL
// ============================================================================

/// Indexed target records for one pass. Consumed records are skipped.
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    records: Vec<NormalizedRecord>,
    by_bucket: HashMap<String, Vec<usize>>,
    by_currency_date: BTreeMap<(String, NaiveDate), Vec<usize>>,
    by_ref: HashMap<String, usize>,
    consumed: HashSet<usize>,
}

impl CandidatePool {
    /// Index records; degraded records are left out
    pub fn new(records: Vec<NormalizedRecord>) -> Self {
        let mut pool = CandidatePool::default();

        for record in records.into_iter().filter(|r| !r.degraded) {
            let idx = pool.records.len();
            pool.by_bucket
                .entry(record.primary_bucket_key())
                .or_default()
                .push(idx);
            pool.by_currency_date
                .entry((record.currency.clone(), record.date))
                .or_default()
                .push(idx);
            pool.by_ref.insert(record.source_ref.clone(), idx);
            pool.records.push(record);
        }

        pool
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, source_ref: &str) -> Option<&NormalizedRecord> {
        self.by_ref.get(source_ref).map(|&i| &self.records[i])
    }

    /// Mark a record as used by a Match; returns false if unknown
    pub fn consume(&mut self, source_ref: &str) -> bool {
        match self.by_ref.get(source_ref) {
            Some(&idx) => {
                self.consumed.insert(idx);
                true
            }
            None => false,
        }
    }

    pub fn is_consumed(&self, source_ref: &str) -> bool {
        self.by_ref
            .get(source_ref)
            .map(|idx| self.consumed.contains(idx))
            .unwrap_or(false)
    }

    /// Unconsumed records in reference order
    pub fn available(&self) -> Vec<&NormalizedRecord> {
        let mut available: Vec<&NormalizedRecord> = self
            .records
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.consumed.contains(i))
            .map(|(_, r)| r)
            .collect();
        available.sort_by(|a, b| a.source_ref.cmp(&b.source_ref));
        available
    }

    /// Records whose primary bucket key is one of the source's bucket keys
    pub fn exact_lookup(&self, source: &NormalizedRecord) -> Vec<&NormalizedRecord> {
        source
            .bucket_keys
            .iter()
            .filter_map(|key| self.by_bucket.get(key))
            .flatten()
            .filter(|idx| !self.consumed.contains(idx))
            .map(|&idx| &self.records[idx])
            .collect()
    }

    /// Unconsumed records of `currency` dated within [from, to]
    pub fn in_date_range(&self, currency: &str, from: NaiveDate, to: NaiveDate) -> Vec<&NormalizedRecord> {
        self.by_currency_date
            .range((currency.to_string(), from)..=(currency.to_string(), to))
            .flat_map(|(_, indices)| indices.iter())
            .filter(|idx| !self.consumed.contains(idx))
            .map(|&idx| &self.records[idx])
            .collect()
    }

    pub fn in_window(&self, window: &SearchWindow) -> Vec<&NormalizedRecord> {
        self.in_date_range(&window.currency, window.date_from, window.date_to)
            .into_iter()
            .filter(|r| window.contains(r))
            .collect()
    }
}

// ============================================================================
// CANDIDATE GENERATION & DECISION
// ============================================================================

/// Every candidate inside the tolerance window, scored and ranked
pub fn scan_window(source: &NormalizedRecord, pool: &CandidatePool, tolerance: &Tolerance) -> Vec<MatchCandidate> {
    let window = tolerance.window_for(source);
    let mut candidates: Vec<MatchCandidate> = pool
        .in_window(&window)
        .into_iter()
        .map(|target| MatchCandidate::scored(source, target, tolerance))
        .collect();

    rank(&mut candidates);
    candidates
}

/// Candidates in the tolerance window at or above the ambiguous threshold
pub fn find_candidates(source: &NormalizedRecord, pool: &CandidatePool, tolerance: &Tolerance) -> Vec<MatchCandidate> {
    scan_window(source, pool, tolerance)
        .into_iter()
        .filter(|c| c.confidence >= tolerance.ambiguous_threshold)
        .collect()
}

/// Which two sources a pass links; left side is always the first kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPass {
    PayoutBank,
    PayoutLedger,
    BankLedger,
}

impl MatchPass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPass::PayoutBank => "payout_bank",
            MatchPass::PayoutLedger => "payout_ledger",
            MatchPass::BankLedger => "bank_ledger",
        }
    }

    pub fn source_kind(&self) -> SourceKind {
        match self {
            MatchPass::PayoutBank | MatchPass::PayoutLedger => SourceKind::Payout,
            MatchPass::BankLedger => SourceKind::Bank,
        }
    }

    pub fn target_kind(&self) -> SourceKind {
        match self {
            MatchPass::PayoutBank => SourceKind::Bank,
            MatchPass::PayoutLedger | MatchPass::BankLedger => SourceKind::Ledger,
        }
    }

    pub fn strategy(&self, kind: PassKind) -> String {
        format!("{}_{}", self.as_str(), kind.as_str())
    }

    /// (missing, ambiguous) exception types, for passes that raise exceptions.
    /// Ledger passes only auto-match: the linker reports missing ledger
    /// entries and the sweep reports unmatched bank transactions.
    pub fn exception_types(&self) -> Option<(ExceptionType, ExceptionType)> {
        match self {
            MatchPass::PayoutBank => Some((
                ExceptionType::PayoutMissingInBank,
                ExceptionType::AmbiguousBankCandidates,
            )),
            MatchPass::PayoutLedger | MatchPass::BankLedger => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Exact,
    Tolerance,
}

impl PassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassKind::Exact => "exact",
            PassKind::Tolerance => "tolerance",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    /// Unique best candidate at or above the auto-match threshold
    AutoMatch {
        candidate: MatchCandidate,
        strategy: String,
    },

    /// Candidates above the ambiguous threshold, none decisive
    Ambiguous {
        candidates: Vec<MatchCandidate>,
        window: SearchWindow,
    },

    /// Nothing qualified
    Missing {
        window: SearchWindow,
        best_confidence: Option<f64>,
    },
}

/// Best candidate if it clears the auto threshold and the runner-up does not
fn unique_auto(candidates: &[MatchCandidate], tolerance: &Tolerance) -> Option<MatchCandidate> {
    let best = candidates.first()?;
    if best.confidence < tolerance.auto_match_threshold {
        return None;
    }

    match candidates.get(1) {
        Some(second) if second.confidence >= tolerance.auto_match_threshold => None,
        _ => Some(best.clone()),
    }
}

/// Pure decision for one source record against a pool
pub fn decide(source: &NormalizedRecord, pool: &CandidatePool, tolerance: &Tolerance, pass: MatchPass) -> MatchDecision {
    // Pass 1: exact bucket lookup
    let mut exact: Vec<MatchCandidate> = pool
        .exact_lookup(source)
        .into_iter()
        .filter(|r| (r.date - source.date).num_days().abs() <= tolerance.date_days)
        .map(|target| MatchCandidate::scored(source, target, tolerance))
        .collect();
    rank(&mut exact);

    if let Some(candidate) = unique_auto(&exact, tolerance) {
        return MatchDecision::AutoMatch {
            candidate,
            strategy: pass.strategy(PassKind::Exact),
        };
    }

    // Pass 2: tolerance window scan
    let window = tolerance.window_for(source);
    let scanned = scan_window(source, pool, tolerance);
    let best_observed = scanned.first().map(|c| c.confidence);

    let kept: Vec<MatchCandidate> = scanned
        .into_iter()
        .filter(|c| c.confidence >= tolerance.ambiguous_threshold)
        .collect();

    if kept.is_empty() {
        return MatchDecision::Missing {
            window,
            best_confidence: best_observed,
        };
    }

    if let Some(candidate) = unique_auto(&kept, tolerance) {
        return MatchDecision::AutoMatch {
            candidate,
            strategy: pass.strategy(PassKind::Tolerance),
        };
    }

    MatchDecision::Ambiguous {
        candidates: kept.into_iter().take(MAX_AMBIGUOUS_CANDIDATES).collect(),
        window,
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

/// Insert a Match and its audit event inside the caller's transaction.
/// Returns false when either side is already linked for this pass.
pub(crate) fn insert_match_with_audit(conn: &Connection, m: &Match, actor_id: &str) -> Result<bool> {
    if !db::insert_match(conn, m)? {
        return Ok(false);
    }

    audit::append(
        conn,
        &m.company_id,
        actor_id,
        "match_created",
        "match",
        &m.id,
        &m.audit_payload(),
    )?;

    Ok(true)
}

/// Persist a Match atomically with its audit event
pub fn persist_match(conn: &Connection, m: &Match, actor_id: &str) -> Result<()> {
    let tx = db::begin_immediate(conn)?;

    if !insert_match_with_audit(&tx, m, actor_id)? {
        return Err(ReconError::StateConflict {
            id: m.left_key().to_string(),
            expected: format!("no {} match", m.right_type),
            actual: "already matched".to_string(),
        });
    }

    tx.commit()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(Match),
    Excepted(Exception),
}

/// Runs the decision policy for one record and persists exactly one result
pub struct CandidateMatcher<'a> {
    conn: &'a Connection,
    tolerance: Tolerance,
    actor_id: String,
}

impl<'a> CandidateMatcher<'a> {
    pub fn new(conn: &'a Connection, tolerance: Tolerance, actor_id: &str) -> Self {
        CandidateMatcher {
            conn,
            tolerance,
            actor_id: actor_id.to_string(),
        }
    }

    pub fn tolerance(&self) -> &Tolerance {
        &self.tolerance
    }

    /// Decide and persist: one Match or one Exception, never both.
    ///
    /// The target is only marked consumed in `pool` after the write commits.
    pub fn match_record(
        &self,
        company_id: &str,
        source: &NormalizedRecord,
        pool: &mut CandidatePool,
        pass: MatchPass,
    ) -> Result<MatchOutcome> {
        if source.degraded {
            return Err(ReconError::Validation(format!(
                "{} could not be normalized",
                source.key()
            )));
        }
        let (missing_type, ambiguous_type) = pass.exception_types().ok_or_else(|| {
            ReconError::Validation(format!("{} pass only auto-matches", pass.as_str()))
        })?;

        match decide(source, pool, &self.tolerance, pass) {
            MatchDecision::AutoMatch { candidate, strategy } => {
                let m = Match::new(
                    company_id,
                    &source.key(),
                    &candidate.record.key(),
                    &strategy,
                    candidate.confidence,
                );
                persist_match(self.conn, &m, &self.actor_id)?;
                pool.consume(&candidate.record.source_ref);

                info!(
                    company_id = %company_id,
                    left = %m.left_key(),
                    right = %m.right_key(),
                    strategy = %m.strategy,
                    confidence = m.confidence,
                    "Auto-matched"
                );
                Ok(MatchOutcome::Matched(m))
            }
            MatchDecision::Ambiguous { candidates, window } => {
                let exception = Exception::new(
                    company_id,
                    ambiguous_type,
                    exceptions::entity_refs_with_candidates(source, &candidates),
                    exceptions::ambiguous_evidence(source, &candidates, &window),
                    candidates.first().map(|c| c.confidence).unwrap_or(0.0),
                    ExceptionOrigin::Matcher,
                );
                exceptions::persist_exception(self.conn, &exception, &self.actor_id)?;

                debug!(
                    company_id = %company_id,
                    source = %source.key(),
                    candidates = candidates.len(),
                    "Ambiguous candidates"
                );
                Ok(MatchOutcome::Excepted(exception))
            }
            MatchDecision::Missing {
                window,
                best_confidence,
            } => {
                let exception = Exception::new(
                    company_id,
                    missing_type,
                    exceptions::entity_refs_for(source),
                    exceptions::missing_evidence(source, &window, best_confidence),
                    best_confidence.unwrap_or(0.0),
                    ExceptionOrigin::Matcher,
                );
                exceptions::persist_exception(self.conn, &exception, &self.actor_id)?;

                debug!(
                    company_id = %company_id,
                    source = %source.key(),
                    best_confidence = ?best_confidence,
                    "No qualifying candidate"
                );
                Ok(MatchOutcome::Excepted(exception))
            }
        }
    }

    /// Persist only a decisive match; anything else leaves no trace
    pub fn auto_match(
        &self,
        company_id: &str,
        source: &NormalizedRecord,
        pool: &mut CandidatePool,
        pass: MatchPass,
    ) -> Result<Option<Match>> {
        match decide(source, pool, &self.tolerance, pass) {
            MatchDecision::AutoMatch { candidate, strategy } => {
                let m = Match::new(
                    company_id,
                    &source.key(),
                    &candidate.record.key(),
                    &strategy,
                    candidate.confidence,
                );
                persist_match(self.conn, &m, &self.actor_id)?;
                pool.consume(&candidate.record.source_ref);
                Ok(Some(m))
            }
            _ => Ok(None),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::records::{RawAmount, RawRecord};

    fn record(kind: SourceKind, source_ref: &str, amount: i64, date: &str, description: &str) -> NormalizedRecord {
        normalize(
            &RawRecord::new(kind, source_ref, RawAmount::minor(amount), date, description).with_currency("CAD"),
            "CAD",
        )
    }

    fn payout(amount: i64, date: &str) -> NormalizedRecord {
        record(SourceKind::Payout, "po_1", amount, date, "STRIPE PAYOUT")
    }

    fn bank(source_ref: &str, amount: i64, date: &str) -> NormalizedRecord {
        record(SourceKind::Bank, source_ref, amount, date, "STRIPE TRANSFER")
    }

    #[test]
    fn test_identical_records_score_one() {
        let tolerance = Tolerance::default();
        let source = record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "anything");
        let target = record(SourceKind::Bank, "bt_1", 100000, "2025-01-15", "completely different");

        assert_eq!(score(&source, &target, &tolerance).total, 1.0);
    }

    #[test]
    fn test_factor_scores() {
        assert_eq!(amount_score(0, 100), 1.0);
        assert_eq!(amount_score(-150, 100), 0.8);
        assert_eq!(amount_score(300, 100), 0.6);
        assert_eq!(amount_score(301, 100), 0.0);

        assert_eq!(date_score(0), 1.0);
        assert_eq!(date_score(-1), 0.95);
        assert_eq!(date_score(2), 0.85);
        assert_eq!(date_score(3), 0.7);
        assert_eq!(date_score(7), 0.5);
        assert_eq!(date_score(8), 0.0);

        assert_eq!(currency_score("CAD", "CAD"), 1.0);
        assert_eq!(currency_score("CAD", "USD"), 0.0);
    }

    #[test]
    fn test_description_score_neutral_when_empty() {
        let a = record(SourceKind::Payout, "po_1", 100, "2025-01-15", "");
        let b = record(SourceKind::Bank, "bt_1", 100, "2025-01-15", "STRIPE");

        assert_eq!(description_score(&a, &b), 0.5);
    }

    #[test]
    fn test_weighted_score_one_day_apart() {
        let tolerance = Tolerance::default();
        let source = payout(100000, "2025-01-15");
        let target = bank("bt_1", 100000, "2025-01-16");

        // 0.4 + 0.2 + 0.3 × 0.95 + 0.1 × jaccard({stripe, payout}, {stripe, transfer}) = 1/3
        let breakdown = score(&source, &target, &tolerance);
        assert_eq!(breakdown.date, 0.95);
        assert!((breakdown.total - 0.9183).abs() < 0.0001, "{}", breakdown.total);
    }

    #[test]
    fn test_amount_tolerance_uses_floor() {
        let tolerance = Tolerance::default();

        assert_eq!(tolerance.amount_tolerance(100000), 1000);
        assert_eq!(tolerance.amount_tolerance(5000), 100);
        assert_eq!(tolerance.amount_tolerance(-100000), 1000);
    }

    #[test]
    fn test_find_candidates_filters_window_and_sorts() {
        let tolerance = Tolerance::default();
        let source = payout(100000, "2025-01-15");
        let pool = CandidatePool::new(vec![
            bank("bt_far", 100000, "2025-01-25"),
            bank("bt_big", 150000, "2025-01-15"),
            bank("bt_late", 100000, "2025-01-16"),
            bank("bt_same", 100000, "2025-01-15"),
            record(SourceKind::Bank, "bt_usd", 100000, "2025-01-15", "x").clone(),
        ]);

        let candidates = find_candidates(&source, &pool, &tolerance);
        let refs: Vec<&str> = candidates.iter().map(|c| c.record.source_ref.as_str()).collect();

        assert_eq!(refs, vec!["bt_same", "bt_late"]);
        assert_eq!(candidates[0].confidence, 1.0);
    }

    #[test]
    fn test_ties_broken_by_earliest_date() {
        let tolerance = Tolerance::default();
        let source = payout(100000, "2025-01-15");
        let pool = CandidatePool::new(vec![
            bank("bt_after", 100000, "2025-01-16"),
            bank("bt_before", 100000, "2025-01-14"),
        ]);

        let candidates = find_candidates(&source, &pool, &tolerance);

        assert_eq!(candidates[0].confidence, candidates[1].confidence);
        assert_eq!(candidates[0].record.source_ref, "bt_before");
    }

    #[test]
    fn test_decide_exact_match() {
        let tolerance = Tolerance::default();
        let pool = CandidatePool::new(vec![bank("bt_1", 100000, "2025-01-15")]);

        match decide(&payout(100000, "2025-01-15"), &pool, &tolerance, MatchPass::PayoutBank) {
            MatchDecision::AutoMatch { candidate, strategy } => {
                assert_eq!(candidate.record.source_ref, "bt_1");
                assert_eq!(candidate.confidence, 1.0);
                assert_eq!(strategy, "payout_bank_exact");
            }
            other => panic!("expected auto-match, got {:?}", other),
        }
    }

    #[test]
    fn test_decide_two_identical_candidates_is_ambiguous() {
        let tolerance = Tolerance::default();
        let pool = CandidatePool::new(vec![
            bank("bt_1", 100000, "2025-01-15"),
            bank("bt_2", 100000, "2025-01-15"),
        ]);

        match decide(&payout(100000, "2025-01-15"), &pool, &tolerance, MatchPass::PayoutBank) {
            MatchDecision::Ambiguous { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("expected ambiguous, got {:?}", other),
        }
    }

    #[test]
    fn test_decide_missing_records_window() {
        let tolerance = Tolerance::default();
        let pool = CandidatePool::new(vec![bank("bt_1", 500000, "2025-01-15")]);

        match decide(&payout(100000, "2025-01-15"), &pool, &tolerance, MatchPass::PayoutBank) {
            MatchDecision::Missing { window, best_confidence } => {
                assert_eq!(best_confidence, None);
                assert_eq!(window.date_from, NaiveDate::from_ymd_opt(2025, 1, 12).unwrap());
                assert_eq!(window.amount_max_minor, 101000);
            }
            other => panic!("expected missing, got {:?}", other),
        }
    }

    #[test]
    fn test_decide_low_confidence_is_missing_with_best_observed() {
        let tolerance = Tolerance::default();
        // 0.4 + 0.2 + 0.3 × 0.7 (3 days) + 0.1 × 0.5 (empty description) = 0.86
        let strict = Tolerance {
            ambiguous_threshold: 0.9,
            ..tolerance
        };
        let source = record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "");
        let pool = CandidatePool::new(vec![bank("bt_1", 100000, "2025-01-18")]);

        match decide(&source, &pool, &strict, MatchPass::PayoutBank) {
            MatchDecision::Missing { best_confidence, .. } => {
                assert_eq!(best_confidence, Some(0.86));
            }
            other => panic!("expected missing, got {:?}", other),
        }
    }

    #[test]
    fn test_decide_tolerance_pass() {
        let tolerance = Tolerance::default();
        let source = record(SourceKind::Payout, "po_1", 100000, "2025-01-15", "STRIPE PAYOUT");
        let target = record(SourceKind::Bank, "bt_1", 99900, "2025-01-15", "STRIPE PAYOUT");
        let pool = CandidatePool::new(vec![target]);

        match decide(&source, &pool, &tolerance, MatchPass::PayoutBank) {
            MatchDecision::AutoMatch { strategy, candidate } => {
                assert_eq!(strategy, "payout_bank_tolerance");
                assert_eq!(candidate.confidence, 1.0);
            }
            other => panic!("expected auto-match, got {:?}", other),
        }
    }

    #[test]
    fn test_window_saturates_at_extremes() {
        let tolerance = Tolerance {
            date_days: 30,
            ..Tolerance::default()
        };
        let mut source = payout(i64::MAX, "2025-01-15");
        source.date = NaiveDate::MAX;

        let window = tolerance.window_for(&source);
        assert_eq!(window.date_to, NaiveDate::MAX);
        assert_eq!(window.amount_max_minor, i64::MAX);

        let mut target = bank("bt_1", i64::MIN, "2025-01-15");
        target.date = NaiveDate::MIN;
        assert_eq!(score(&source, &target, &tolerance).amount, 0.0);
    }

    #[test]
    fn test_failed_write_leaves_target_unconsumed() {
        let conn = db::open_in_memory().unwrap();
        let matcher = CandidateMatcher::new(&conn, Tolerance::default(), "system");
        let mut pool = CandidatePool::new(vec![bank("bt_1", 100000, "2025-01-15")]);

        // po_1 already has a bank match, so the unique index rejects a second one
        let earlier = Match::new(
            "co_1",
            &RecordKey::new(SourceKind::Payout, "po_1"),
            &RecordKey::new(SourceKind::Bank, "bt_0"),
            "payout_bank_exact",
            1.0,
        );
        persist_match(&conn, &earlier, "system").unwrap();

        let result = matcher.match_record("co_1", &payout(100000, "2025-01-15"), &mut pool, MatchPass::PayoutBank);
        assert!(matches!(result, Err(ReconError::StateConflict { .. })));
        assert!(!pool.is_consumed("bt_1"));

        conn.execute_batch("DROP TABLE matches").unwrap();
        let result = matcher.match_record("co_1", &payout(100000, "2025-01-15"), &mut pool, MatchPass::PayoutBank);
        assert!(matches!(result, Err(ReconError::Persistence(_))));
        assert!(!pool.is_consumed("bt_1"));
        assert_eq!(pool.available().len(), 1);
    }

    #[test]
    fn test_ledger_passes_only_auto_match() {
        let conn = db::open_in_memory().unwrap();
        let matcher = CandidateMatcher::new(&conn, Tolerance::default(), "system");
        let mut pool = CandidatePool::new(vec![record(SourceKind::Ledger, "je_1", 500000, "2025-01-15", "")]);

        assert!(MatchPass::PayoutBank.exception_types().is_some());
        assert!(MatchPass::BankLedger.exception_types().is_none());
        assert!(matches!(
            matcher.match_record("co_1", &bank("bt_1", 100000, "2025-01-15"), &mut pool, MatchPass::BankLedger),
            Err(ReconError::Validation(_))
        ));
        assert!(db::get_exceptions(&conn, "co_1", None).unwrap().is_empty());
    }

    #[test]
    fn test_consumed_records_are_skipped() {
        let tolerance = Tolerance::default();
        let mut pool = CandidatePool::new(vec![bank("bt_1", 100000, "2025-01-15")]);

        assert!(pool.consume("bt_1"));
        assert!(pool.is_consumed("bt_1"));
        assert!(find_candidates(&payout(100000, "2025-01-15"), &pool, &tolerance).is_empty());
        assert!(pool.available().is_empty());
    }

    #[test]
    fn test_degraded_records_not_indexed() {
        let degraded = normalize(
            &RawRecord::new(SourceKind::Bank, "bt_bad", RawAmount::decimal("??"), "2025-01-15", ""),
            "CAD",
        );
        let pool = CandidatePool::new(vec![degraded]);

        assert!(pool.is_empty());
    }

    #[test]
    fn test_matched_set_links() {
        let m = Match::new(
            "co_1",
            &RecordKey::new(SourceKind::Payout, "po_1"),
            &RecordKey::new(SourceKind::Bank, "bt_1"),
            "payout_bank_exact",
            1.0,
        );
        let set = MatchedSet::from_matches(&[m]);

        let payout_key = RecordKey::new(SourceKind::Payout, "po_1");
        assert!(set.is_matched(&payout_key));
        assert_eq!(set.counterpart(&payout_key, SourceKind::Bank), Some("bt_1"));
        assert!(!set.has_link(&payout_key, SourceKind::Ledger));
        assert!(set.is_matched(&RecordKey::new(SourceKind::Bank, "bt_1")));
        assert_eq!(set.len(), 2);
    }
}
