// Trust Reconciliation - Core Library
// Payout ↔ bank ↔ ledger matching, exceptions and a hash-chained audit log.
// Exposes all modules for use in the CLI, the API server, and tests.

pub mod error;
pub mod settings;
pub mod config;
pub mod logging;
pub mod retry;
pub mod records;
pub mod normalize;     // Canonical form: minor units, currency, keywords, bucket keys
pub mod db;
pub mod audit;         // Per-company hash chain
pub mod matcher;       // Candidate generation, scoring, decision policy
pub mod ledger;        // External-ref lookup, fuzzy fallback, proposals
pub mod exceptions;    // Taxonomy, severity/action tables, complement sweep
pub mod lifecycle;     // open → resolved | ignored
pub mod coordinator;   // Staged matching run

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use error::{ReconError, Result};
pub use settings::{AccountMapping, Settings};
pub use config::AppConfig;
pub use retry::{with_retry, RetryConfig};
pub use records::{
    load_records_csv, parse_records_csv, CsvImport, RawAmount, RawRecord, RecordKey, RejectedRow,
    SourceKind,
};
pub use normalize::{normalize, NormalizedRecord};
pub use db::{
    open, open_in_memory, setup_database, begin_immediate,
    ingest_records, get_records, get_matches, get_exception, get_exceptions,
    IngestSummary,
};
pub use audit::{
    AuditEvent, EventRange, ExportFormat, IntegrityFailure, IntegrityReport,
    export_audit_trail, log_event, verify_integrity,
};
pub use matcher::{
    CandidateMatcher, CandidatePool, Match, MatchCandidate, MatchDecision, MatchOutcome,
    MatchPass, MatchedSet, SearchWindow, Tolerance, decide, find_candidates,
};
pub use ledger::{
    LedgerDirectory, LedgerLinker, LedgerObject, LedgerWriter, LinkMethod, ProposedLedgerEntry,
    StoreDirectory, finalize_written_entry, submit_proposal,
};
pub use exceptions::{
    EntityRefs, Exception, ExceptionOrigin, ExceptionStatus, ExceptionType, ProposedAction,
    Severity, SourcePools, generate_exceptions, generate_for_company,
};
pub use lifecycle::{
    BulkTransitionReport, ExceptionAction, TransitionFailure, TransitionOutcome,
    bulk_transition, transition,
};
pub use coordinator::{MatchingCoordinator, MatchingReport, RecordError, Stage, StageReport};
