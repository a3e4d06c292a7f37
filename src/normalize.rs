// 🧹 Normalization - Raw record → canonical NormalizedRecord
//
// Every matcher works on this one shape. Amounts are integer minor units,
// currency is an upper-case ISO code, dates are calendar dates, and each
// record carries the bucket keys used for indexed candidate lookup.
//
// Normalization never fails: input that cannot be parsed produces a
// zero-amount record flagged `degraded`, plus a warning in the log.

use crate::records::{RawAmount, RawRecord, RecordKey, SourceKind};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// Bucket keys cover this many days on each side of the record date
pub const BUCKET_DAY_SPREAD: i64 = 2;

// ============================================================================
// KEYWORD DICTIONARY
// ============================================================================

/// (keyword, pattern) - processor names, transaction-type words, channels
static KEYWORD_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    let patterns: [(&str, &str); 22] = [
        // Processors
        ("stripe", r"(?i)\bstripe\b"),
        ("shopify", r"(?i)\bshopify\b"),
        ("square", r"(?i)\bsquare\b|\bsq\s*\*"),
        ("paypal", r"(?i)\bpaypal\b|\bpp\s*\*"),
        ("adyen", r"(?i)\badyen\b"),
        ("wise", r"(?i)\bwise\b|\btransferwise\b"),
        // Transaction types
        ("payout", r"(?i)\bpay\s?outs?\b"),
        ("transfer", r"(?i)\btransfers?\b|\btrf\b|\bxfer\b"),
        ("deposit", r"(?i)\bdeposits?\b|\bdep\b"),
        ("refund", r"(?i)\brefund(s|ed)?\b"),
        ("fee", r"(?i)\bfees?\b"),
        ("chargeback", r"(?i)\bcharge\s?backs?\b|\bdispute\b"),
        ("invoice", r"(?i)\binvoices?\b|\binv\s?#?\d+"),
        ("payment", r"(?i)\bpayments?\b|\bpmt\b"),
        ("withdrawal", r"(?i)\bwithdrawals?\b|\bwdl\b"),
        // Channels
        ("ach", r"(?i)\bach\b"),
        ("wire", r"(?i)\bwire\b"),
        ("eft", r"(?i)\beft\b"),
        ("cash", r"(?i)\bcash\b"),
        ("atm", r"(?i)\batm\b"),
        ("etransfer", r"(?i)\be-?transfer\b|\binterac\b"),
        ("cheque", r"(?i)\bcheque\b|\bcheck\s?#?\d*\b|\bchq\b"),
    ];

    patterns
        .iter()
        .filter_map(|(keyword, pattern)| match Regex::new(pattern) {
            Ok(regex) => Some((*keyword, regex)),
            Err(e) => {
                warn!(keyword = *keyword, error = %e, "Skipping invalid keyword pattern");
                None
            }
        })
        .collect()
});

/// Keywords found in free text, in dictionary order
pub fn extract_keywords(text: &str) -> BTreeSet<String> {
    KEYWORD_PATTERNS
        .iter()
        .filter(|(_, regex)| regex.is_match(text))
        .map(|(keyword, _)| keyword.to_string())
        .collect()
}

// ============================================================================
// NORMALIZED RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub amount_minor: i64,
    pub currency: String,
    pub date: NaiveDate,
    pub keywords: BTreeSet<String>,
    pub bucket_keys: BTreeSet<String>,
    pub source_ref: String,
    pub source_kind: SourceKind,

    /// Original free text, used for the description score and as evidence
    pub description: String,

    pub external_ref: Option<String>,

    /// Amount or date could not be parsed; the record must not be matched
    pub degraded: bool,
}

impl NormalizedRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.source_kind, self.source_ref.clone())
    }

    /// The bucket this record is indexed under (its own date, offset 0)
    pub fn primary_bucket_key(&self) -> String {
        bucket_key(self.amount_minor, &self.currency, self.date)
    }

    /// Lower-case words of 3+ letters from the description, plus keywords
    pub fn description_tokens(&self) -> BTreeSet<String> {
        let mut tokens: BTreeSet<String> = self
            .description
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() >= 3 && !w.chars().all(|c| c.is_ascii_digit()))
            .map(|w| w.to_string())
            .collect();

        tokens.extend(self.keywords.iter().cloned());
        tokens
    }
}

pub fn bucket_key(amount_minor: i64, currency: &str, date: NaiveDate) -> String {
    format!("{}_{}_{}", amount_minor, currency, date.format("%Y-%m-%d"))
}

/// `{amount}_{currency}_{date+d}` for d in [-2, +2]
pub fn bucket_keys(amount_minor: i64, currency: &str, date: NaiveDate) -> BTreeSet<String> {
    (-BUCKET_DAY_SPREAD..=BUCKET_DAY_SPREAD)
        .filter_map(|d| date.checked_add_signed(Duration::days(d)))
        .map(|day| bucket_key(amount_minor, currency, day))
        .collect()
}

/// Whether the date can be shifted across the whole bucket spread
fn has_bucket_headroom(date: NaiveDate) -> bool {
    let spread = Duration::days(BUCKET_DAY_SPREAD);
    date.checked_sub_signed(spread).is_some() && date.checked_add_signed(spread).is_some()
}

// ============================================================================
// NORMALIZE
// ============================================================================

/// Convert a raw record into canonical form
pub fn normalize(raw: &RawRecord, home_currency: &str) -> NormalizedRecord {
    let currency = resolve_currency(raw, home_currency);
    let mut degraded = false;

    let amount_minor = match parse_amount_minor(&raw.amount, &currency) {
        Some(amount) => amount,
        None => {
            warn!(
                source_kind = %raw.kind,
                source_ref = %raw.source_ref,
                amount = ?raw.amount,
                "Unparseable amount, normalizing to zero"
            );
            degraded = true;
            0
        }
    };

    let date = match parse_date(&raw.date) {
        Some(date) if has_bucket_headroom(date) => date,
        Some(date) => {
            warn!(
                source_kind = %raw.kind,
                source_ref = %raw.source_ref,
                date = %date,
                "Date at the edge of the calendar, normalizing to zero amount"
            );
            degraded = true;
            NaiveDate::default()
        }
        None => {
            warn!(
                source_kind = %raw.kind,
                source_ref = %raw.source_ref,
                date = %raw.date,
                "Unparseable date, normalizing to zero amount"
            );
            degraded = true;
            NaiveDate::default()
        }
    };

    let amount_minor = if degraded { 0 } else { amount_minor };

    NormalizedRecord {
        amount_minor,
        bucket_keys: bucket_keys(amount_minor, &currency, date),
        keywords: extract_keywords(&raw.description),
        currency,
        date,
        source_ref: raw.source_ref.clone(),
        source_kind: raw.kind,
        description: raw.description.trim().to_string(),
        external_ref: raw.external_ref.clone(),
        degraded,
    }
}

/// First non-empty of currency / currency_code / iso_currency / metadata.currency
fn resolve_currency(raw: &RawRecord, home_currency: &str) -> String {
    let metadata_currency = raw
        .metadata
        .get("currency")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    [
        raw.currency.clone(),
        raw.currency_code.clone(),
        raw.iso_currency.clone(),
        metadata_currency,
    ]
    .into_iter()
    .flatten()
    .map(|c| c.trim().to_uppercase())
    .find(|c| c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic()))
    .unwrap_or_else(|| home_currency.to_uppercase())
}

/// Number of minor-unit digits for an ISO 4217 currency
pub fn currency_exponent(currency: &str) -> u32 {
    match currency {
        "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF"
        | "UGX" | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
        "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

pub fn parse_amount_minor(amount: &RawAmount, currency: &str) -> Option<i64> {
    let exponent = currency_exponent(currency);

    match amount {
        RawAmount::Minor { minor_units } => Some(*minor_units),
        RawAmount::Decimal(text) => parse_decimal_minor(text, exponent),
        RawAmount::Float(value) => {
            if !value.is_finite() {
                return None;
            }
            let scaled = (value * 10f64.powi(exponent as i32)).round();
            if scaled.abs() >= i64::MAX as f64 {
                return None;
            }
            Some(scaled as i64)
        }
    }
}

/// Parse decimal text in major units into minor units without floating point.
///
/// Accepts thousands separators, currency symbols, a leading or trailing minus
/// and accounting-style parentheses. Extra fraction digits round half away
/// from zero.
pub fn parse_decimal_minor(text: &str, exponent: u32) -> Option<i64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut negative = false;
    let mut body = trimmed;

    if body.starts_with('(') && body.ends_with(')') {
        negative = true;
        body = &body[1..body.len() - 1];
    }

    let cleaned: String = body
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '$' | '€' | '£' | '¥' | '_'))
        .collect();

    let mut digits = cleaned.as_str();
    if let Some(rest) = digits.strip_prefix('-') {
        negative = !negative;
        digits = rest;
    } else if let Some(rest) = digits.strip_suffix('-') {
        negative = !negative;
        digits = rest;
    } else if let Some(rest) = digits.strip_prefix('+') {
        digits = rest;
    }

    // Letters such as a trailing currency code ("1000.00 CAD")
    let digits = digits.trim_end_matches(|c: char| c.is_ascii_alphabetic());

    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };

    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let exp = exponent as usize;
    let mut minor: i64 = 0;

    for c in int_part.chars() {
        minor = minor.checked_mul(10)?.checked_add(c.to_digit(10)? as i64)?;
    }

    let frac_digits: Vec<u32> = frac_part.chars().filter_map(|c| c.to_digit(10)).collect();
    for i in 0..exp {
        let digit = frac_digits.get(i).copied().unwrap_or(0) as i64;
        minor = minor.checked_mul(10)?.checked_add(digit)?;
    }

    if frac_digits.get(exp).copied().unwrap_or(0) >= 5 {
        minor = minor.checked_add(1)?;
    }

    Some(if negative { -minor } else { minor })
}

/// Parse a date from the formats our sources use
pub fn parse_date(date_str: &str) -> Option<NaiveDate> {
    let s = date_str.trim();

    for format in ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%d %b %Y", "%b %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Some(date);
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }

    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.date());
    }

    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.date());
    }

    None
}

// ============================================================================
// TESTS
// ============================================================================
