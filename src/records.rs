// 📥 Raw Records - What the ingestion collaborator hands to the core
// Raw records are never mutated; normalization reads them and derives a
// NormalizedRecord on demand.

use crate::error::{ReconError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

// ============================================================================
// SOURCE KIND
// ============================================================================

/// Which system a record comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Payment processor payout
    Payout,

    /// Bank transaction feed
    Bank,

    /// General ledger object
    Ledger,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Payout => "payout",
            SourceKind::Bank => "bank",
            SourceKind::Ledger => "ledger",
        }
    }

    /// Human-readable name for display
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Payout => "Processor payout",
            SourceKind::Bank => "Bank transaction",
            SourceKind::Ledger => "Ledger object",
        }
    }

    pub fn all() -> [SourceKind; 3] {
        [SourceKind::Payout, SourceKind::Bank, SourceKind::Ledger]
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "payout" | "payouts" => Ok(SourceKind::Payout),
            "bank" | "bank_transaction" => Ok(SourceKind::Bank),
            "ledger" | "ledger_object" => Ok(SourceKind::Ledger),
            other => Err(ReconError::Validation(format!("unknown source kind {:?}", other))),
        }
    }
}

/// `(kind, source_ref)` - identifies one record within a company
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub kind: SourceKind,
    pub source_ref: String,
}

impl RecordKey {
    pub fn new(kind: SourceKind, source_ref: impl Into<String>) -> Self {
        RecordKey {
            kind,
            source_ref: source_ref.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.source_ref)
    }
}

impl FromStr for RecordKey {
    type Err = ReconError;

    /// Parses `kind:ref`, e.g. `ledger:je_1042`
    fn from_str(s: &str) -> Result<Self> {
        let (kind, source_ref) = s
            .split_once(':')
            .ok_or_else(|| ReconError::Validation(format!("expected kind:ref, got {:?}", s)))?;

        if source_ref.is_empty() {
            return Err(ReconError::Validation(format!("empty reference in {:?}", s)));
        }

        Ok(RecordKey::new(kind.parse()?, source_ref))
    }
}

// ============================================================================
// RAW AMOUNT
// ============================================================================

/// Amount exactly as the source system reported it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    /// Already in minor units, e.g. `{"minor_units": 100000}`
    Minor { minor_units: i64 },

    /// Decimal text in major units, e.g. `"1,000.00"`, `"(45.99)"`
    Decimal(String),

    /// Numeric major units, e.g. `1000.0`
    Float(f64),
}

impl RawAmount {
    pub fn minor(minor_units: i64) -> Self {
        RawAmount::Minor { minor_units }
    }

    pub fn decimal(text: &str) -> Self {
        RawAmount::Decimal(text.to_string())
    }
}

// ============================================================================
// RAW RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Identifier in the source system (payout id, bank txn id, ledger id)
    pub source_ref: String,

    pub kind: SourceKind,

    pub amount: RawAmount,

    // Sources disagree on where currency lives; normalization checks all of
    // these in order before falling back to the home currency.
    #[serde(default)]
    pub currency: Option<String>,

    #[serde(default)]
    pub currency_code: Option<String>,

    #[serde(default)]
    pub iso_currency: Option<String>,

    /// Date in any supported format (YYYY-MM-DD, MM/DD/YYYY, RFC 3339)
    pub date: String,

    #[serde(default)]
    pub description: String,

    /// Deterministic reference stamped on ledger objects created from a proposal
    #[serde(default)]
    pub external_ref: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl RawRecord {
    pub fn new(
        kind: SourceKind,
        source_ref: &str,
        amount: RawAmount,
        date: &str,
        description: &str,
    ) -> Self {
        RawRecord {
            source_ref: source_ref.to_string(),
            kind,
            amount,
            currency: None,
            currency_code: None,
            iso_currency: None,
            date: date.to_string(),
            description: description.to_string(),
            external_ref: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Builder pattern: set currency
    pub fn with_currency(mut self, currency: &str) -> Self {
        self.currency = Some(currency.to_string());
        self
    }

    /// Builder pattern: set external reference
    pub fn with_external_ref(mut self, external_ref: &str) -> Self {
        self.external_ref = Some(external_ref.to_string());
        self
    }

    /// Builder pattern: add metadata entry
    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.kind, self.source_ref.clone())
    }
}

// ============================================================================
// CSV LOADING
// ============================================================================

/// One row of an ingestion CSV export
#[derive(Debug, Deserialize)]
struct CsvRecordRow {
    source_ref: String,
    amount: String,
    #[serde(default)]
    currency: Option<String>,
    date: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    external_ref: Option<String>,
}

/// A CSV row that could not be turned into a record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRow {
    /// 1-based line number in the file, header included
    pub line: usize,
    pub message: String,
}

/// Records read from one CSV file, plus the rows that were skipped
#[derive(Debug, Clone, Default)]
pub struct CsvImport {
    pub records: Vec<RawRecord>,
    pub rejected: Vec<RejectedRow>,
}

impl CsvImport {
    pub fn summary(&self) -> String {
        format!("{} records read, {} rows rejected", self.records.len(), self.rejected.len())
    }
}

/// Load raw records of one kind from a CSV file with headers
/// `source_ref,amount,currency,date,description[,external_ref]`.
///
/// A bad row is skipped and reported; only an unreadable file fails.
pub fn load_records_csv(csv_path: &Path, kind: SourceKind) -> Result<CsvImport> {
    let mut rdr = csv::Reader::from_path(csv_path)?;
    read_records(&mut rdr, kind)
}

/// Same as `load_records_csv`, from in-memory CSV text
pub fn parse_records_csv(data: &str, kind: SourceKind) -> Result<CsvImport> {
    let mut rdr = csv::Reader::from_reader(data.as_bytes());
    read_records(&mut rdr, kind)
}

fn row_to_record(row: CsvRecordRow, kind: SourceKind) -> Result<RawRecord> {
    if row.source_ref.trim().is_empty() {
        return Err(ReconError::Validation("empty source_ref".to_string()));
    }

    Ok(RawRecord {
        source_ref: row.source_ref.trim().to_string(),
        kind,
        amount: RawAmount::Decimal(row.amount),
        currency: row.currency.filter(|c| !c.trim().is_empty()),
        currency_code: None,
        iso_currency: None,
        date: row.date,
        description: row.description,
        external_ref: row.external_ref.filter(|r| !r.trim().is_empty()),
        metadata: BTreeMap::new(),
    })
}

fn read_records<R: std::io::Read>(rdr: &mut csv::Reader<R>, kind: SourceKind) -> Result<CsvImport> {
    // Header problems make every row unreadable
    rdr.headers()?;

    let mut import = CsvImport::default();

    for (index, result) in rdr.deserialize::<CsvRecordRow>().enumerate() {
        let line = index + 2;
        let parsed = result
            .map_err(ReconError::from)
            .and_then(|row| row_to_record(row, kind));

        match parsed {
            Ok(record) => import.records.push(record),
            Err(err) => {
                warn!(source_kind = %kind, line, error = %err, "Skipping CSV row");
                import.rejected.push(RejectedRow {
                    line,
                    message: err.to_string(),
                });
            }
        }
    }

    Ok(import)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_amount_shapes() {
        let minor: RawAmount = serde_json::from_str(r#"{"minor_units": 100000}"#).unwrap();
        let decimal: RawAmount = serde_json::from_str(r#""1,000.00""#).unwrap();
        let float: RawAmount = serde_json::from_str("1000.5").unwrap();
        let integer: RawAmount = serde_json::from_str("1000").unwrap();

        assert_eq!(minor, RawAmount::minor(100000));
        assert_eq!(decimal, RawAmount::decimal("1,000.00"));
        assert_eq!(float, RawAmount::Float(1000.5));
        assert_eq!(integer, RawAmount::Float(1000.0));
    }

    #[test]
    fn test_record_key_parse() {
        let key: RecordKey = "ledger:je_1042".parse().unwrap();

        assert_eq!(key.kind, SourceKind::Ledger);
        assert_eq!(key.source_ref, "je_1042");
        assert_eq!(key.to_string(), "ledger:je_1042");
        assert!("je_1042".parse::<RecordKey>().is_err());
        assert!("vendor:x".parse::<RecordKey>().is_err());
    }

    #[test]
    fn test_parse_records_csv() {
        let data = "source_ref,amount,currency,date,description,external_ref\n\
                    bt_1,1000.00,CAD,2025-01-15,STRIPE TRANSFER,\n\
                    bt_2,\"2,500.10\",,01/16/2025,E-TRANSFER DEPOSIT,\n";

        let import = parse_records_csv(data, SourceKind::Bank).unwrap();
        let records = import.records;

        assert!(import.rejected.is_empty());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].currency.as_deref(), Some("CAD"));
        assert_eq!(records[0].external_ref, None);
        assert_eq!(records[1].amount, RawAmount::decimal("2,500.10"));
        assert_eq!(records[1].currency, None);
        assert_eq!(records[1].kind, SourceKind::Bank);
    }

    #[test]
    fn test_bad_rows_are_skipped_not_fatal() {
        let data = "source_ref,amount,currency,date,description\n\
                    je_1,10.00,USD,2025-01-15,ok\n\
                    \x20,10.00,USD,2025-01-15,blank ref\n\
                    je_3,10.00\n\
                    je_4,12.00,USD,2025-01-16,ok\n";

        let import = parse_records_csv(data, SourceKind::Ledger).unwrap();

        let refs: Vec<&str> = import.records.iter().map(|r| r.source_ref.as_str()).collect();
        assert_eq!(refs, vec!["je_1", "je_4"]);
        assert_eq!(import.rejected.len(), 2);
        assert_eq!(import.rejected[0].line, 3);
        assert!(import.rejected[0].message.contains("source_ref"));
        assert_eq!(import.rejected[1].line, 4);
        assert_eq!(import.summary(), "2 records read, 2 rows rejected");
    }
}
