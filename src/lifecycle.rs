// 🔄 Exception Lifecycle - open → resolved | ignored
//
// Terminal states never change again. Resolving a payout exception with a
// resolving record also creates the Match the matcher could not, in the
// same transaction as the status change and its audit event.

use crate::audit;
use crate::db;
use crate::error::{ReconError, Result};
use crate::exceptions::{Exception, ExceptionStatus};
use crate::matcher::{self, Match};
use crate::records::{RecordKey, SourceKind};
use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const RETROACTIVE_STRATEGY: &str = "exception_resolved";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ExceptionAction {
    /// Close the exception. `resolving` names the record that settles it
    /// (e.g. the ledger object a missing payout was booked as).
    Resolve {
        #[serde(default)]
        resolving: Option<RecordKey>,
    },

    Ignore,
}

impl ExceptionAction {
    pub fn resolve() -> Self {
        ExceptionAction::Resolve { resolving: None }
    }

    pub fn resolve_with(resolving: RecordKey) -> Self {
        ExceptionAction::Resolve {
            resolving: Some(resolving),
        }
    }

    pub fn target_status(&self) -> ExceptionStatus {
        match self {
            ExceptionAction::Resolve { .. } => ExceptionStatus::Resolved,
            ExceptionAction::Ignore => ExceptionStatus::Ignored,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ExceptionAction::Resolve { .. } => "exception_resolved",
            ExceptionAction::Ignore => "exception_ignored",
        }
    }
}

/// The transition table
pub fn is_allowed(from: ExceptionStatus, to: ExceptionStatus) -> bool {
    matches!(
        (from, to),
        (ExceptionStatus::Open, ExceptionStatus::Resolved) | (ExceptionStatus::Open, ExceptionStatus::Ignored)
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionOutcome {
    pub exception: Exception,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retroactive_match: Option<Match>,

    pub audit_event_id: String,
}

fn conflict(exception_id: &str, actual: ExceptionStatus) -> ReconError {
    ReconError::StateConflict {
        id: exception_id.to_string(),
        expected: ExceptionStatus::Open.to_string(),
        actual: actual.to_string(),
    }
}

/// Link the exception's payout to the resolving record
fn retroactive_match(conn: &Connection, exception: &Exception, resolving: &RecordKey, actor_id: &str) -> Result<Option<Match>> {
    let payout_ref = match exception.references(SourceKind::Payout).first() {
        Some(r) => r.clone(),
        None => return Ok(None),
    };

    if resolving.kind == SourceKind::Payout {
        return Err(ReconError::Validation(format!(
            "{} cannot resolve a payout exception",
            resolving
        )));
    }
    if db::get_record(conn, &exception.company_id, resolving)?.is_none() {
        return Err(ReconError::not_found("record", resolving.to_string()));
    }

    let payout = RecordKey::new(SourceKind::Payout, payout_ref);
    let m = Match::new(
        &exception.company_id,
        &payout,
        resolving,
        RETROACTIVE_STRATEGY,
        exception.confidence,
    );

    if !matcher::insert_match_with_audit(conn, &m, actor_id)? {
        return Err(ReconError::StateConflict {
            id: payout.to_string(),
            expected: format!("no {} match", resolving.kind),
            actual: "already matched".to_string(),
        });
    }

    if resolving.kind == SourceKind::Ledger {
        db::upsert_ledger_link(conn, &exception.company_id, &payout.to_string(), &resolving.source_ref)?;
    }

    Ok(Some(m))
}

/// Apply one action to one exception inside the caller's transaction.
/// Nothing is logged; the caller commits.
pub(crate) fn transition_in(conn: &Connection, exception_id: &str, action: &ExceptionAction, actor_id: &str) -> Result<TransitionOutcome> {
    let mut exception = db::get_exception(conn, exception_id)?;
    let target = action.target_status();

    if !is_allowed(exception.status, target) {
        return Err(conflict(exception_id, exception.status));
    }

    let retroactive = match action {
        ExceptionAction::Resolve {
            resolving: Some(resolving),
        } => retroactive_match(conn, &exception, resolving, actor_id)?,
        _ => None,
    };

    let resolving_ref = match action {
        ExceptionAction::Resolve { resolving } => resolving.as_ref().map(|k| k.to_string()),
        ExceptionAction::Ignore => None,
    };

    let now = Utc::now();
    if !db::update_exception_status(conn, exception_id, target, actor_id, &now)? {
        return Err(conflict(exception_id, exception.status));
    }

    let event = audit::append(
        conn,
        &exception.company_id,
        actor_id,
        action.verb(),
        "exception",
        exception_id,
        &serde_json::json!({
            "type": exception.exception_type,
            "from": exception.status,
            "to": target,
            "resolving": resolving_ref,
            "match_id": retroactive.as_ref().map(|m| m.id.clone()),
        }),
    )?;

    exception.status = target;
    exception.resolved_at = Some(now);
    exception.resolved_by = Some(actor_id.to_string());

    Ok(TransitionOutcome {
        exception,
        retroactive_match: retroactive,
        audit_event_id: event.event_id,
    })
}

/// Apply one action to one exception, atomically
pub fn transition(conn: &Connection, exception_id: &str, action: &ExceptionAction, actor_id: &str) -> Result<TransitionOutcome> {
    let tx = db::begin_immediate(conn)?;
    let outcome = transition_in(&tx, exception_id, action, actor_id)?;
    tx.commit()?;

    info!(
        exception_id = %exception_id,
        status = %outcome.exception.status,
        actor = %actor_id,
        retroactive_match = outcome.retroactive_match.is_some(),
        "Exception transitioned"
    );

    Ok(outcome)
}

// ============================================================================
// BULK
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionFailure {
    pub exception_id: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkTransitionReport {
    pub succeeded: Vec<String>,
    pub failures: Vec<TransitionFailure>,
    pub success: bool,
}

/// Apply `action` to every id independently; failures are collected, never raised
pub fn bulk_transition(conn: &Connection, exception_ids: &[String], action: &ExceptionAction, actor_id: &str) -> BulkTransitionReport {
    let mut succeeded = Vec::new();
    let mut failures = Vec::new();

    for exception_id in exception_ids {
        match transition(conn, exception_id, action, actor_id) {
            Ok(_) => succeeded.push(exception_id.clone()),
            Err(err) => {
                warn!(exception_id = %exception_id, error = %err, "Bulk transition failed for exception");
                failures.push(TransitionFailure {
                    exception_id: exception_id.clone(),
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                });
            }
        }
    }

    BulkTransitionReport {
        success: failures.is_empty(),
        succeeded,
        failures,
    }
}

// ============================================================================
// TESTS
// ============================================================================
