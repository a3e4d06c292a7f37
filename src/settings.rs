// ⚙️ Company Settings - Tolerance windows, thresholds, account mapping
// Read-only input to the matching pipeline. Settings are data, not code:
// loaded from JSON with serde defaults for anything the file leaves out.

use crate::error::{ReconError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ============================================================================
// ACCOUNT MAPPING
// ============================================================================

/// Ledger account ids relayed verbatim into ledger-entry proposals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountMapping {
    /// Bank account the payout lands in (debit side of the deposit)
    pub deposit_account_id: Option<String>,

    /// Processor clearing account (credit side of the deposit)
    pub clearing_account_id: Option<String>,

    /// Processor fees expense account
    pub fee_account_id: Option<String>,
}

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Amount tolerance as a fraction of the source amount (0.01 = 1%)
    pub amount_tolerance_pct: f64,

    /// Minimum amount tolerance in minor units
    pub amount_tolerance_floor_minor: i64,

    /// Date window in days, applied on both sides of the source date
    pub date_tolerance_days: i64,

    /// Confidence at or above which a unique best candidate is auto-matched
    pub auto_match_threshold: f64,

    /// Confidence below which candidates are discarded
    pub ambiguous_threshold: f64,

    /// ISO 4217 code used when a raw record carries no currency
    pub home_currency: String,

    pub account_mapping: AccountMapping,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            amount_tolerance_pct: 0.01,
            amount_tolerance_floor_minor: 100,
            date_tolerance_days: 3,
            auto_match_threshold: 0.95,
            ambiguous_threshold: 0.80,
            home_currency: "USD".to_string(),
            account_mapping: AccountMapping::default(),
        }
    }
}

impl Settings {
    /// Default settings with a different home currency
    pub fn with_home_currency(home_currency: &str) -> Self {
        Settings {
            home_currency: home_currency.to_uppercase(),
            ..Default::default()
        }
    }

    /// Load settings from a JSON file and validate them
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ReconError::Config(format!(
                "Failed to read settings file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let mut settings: Settings = serde_json::from_str(content)
            .map_err(|e| ReconError::Config(format!("Failed to parse settings JSON: {}", e)))?;
        settings.home_currency = settings.home_currency.to_uppercase();
        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations that would make the decision policy meaningless
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.amount_tolerance_pct) {
            return Err(ReconError::Config(format!(
                "amount_tolerance_pct must be within [0, 1], got {}",
                self.amount_tolerance_pct
            )));
        }

        if self.amount_tolerance_floor_minor < 0 {
            return Err(ReconError::Config(
                "amount_tolerance_floor_minor must not be negative".to_string(),
            ));
        }

        if self.date_tolerance_days < 0 {
            return Err(ReconError::Config(
                "date_tolerance_days must not be negative".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.ambiguous_threshold)
            || !(0.0..=1.0).contains(&self.auto_match_threshold)
        {
            return Err(ReconError::Config(
                "thresholds must be within [0, 1]".to_string(),
            ));
        }

        if self.ambiguous_threshold > self.auto_match_threshold {
            return Err(ReconError::Config(format!(
                "ambiguous_threshold ({}) must not exceed auto_match_threshold ({})",
                self.ambiguous_threshold, self.auto_match_threshold
            )));
        }

        if self.home_currency.len() != 3 || !self.home_currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ReconError::Config(format!(
                "home_currency must be a 3-letter ISO code, got {:?}",
                self.home_currency
            )));
        }

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();

        assert_eq!(settings.auto_match_threshold, 0.95);
        assert_eq!(settings.ambiguous_threshold, 0.80);
        assert_eq!(settings.date_tolerance_days, 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings = Settings::from_json(
            r#"{"home_currency": "cad", "account_mapping": {"deposit_account_id": "acct_1010"}}"#,
        )
        .unwrap();

        assert_eq!(settings.home_currency, "CAD");
        assert_eq!(settings.amount_tolerance_floor_minor, 100);
        assert_eq!(
            settings.account_mapping.deposit_account_id.as_deref(),
            Some("acct_1010")
        );
        assert!(settings.account_mapping.clearing_account_id.is_none());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let result = Settings::from_json(r#"{"auto_match_threshold": 0.7, "ambiguous_threshold": 0.9}"#);

        assert!(matches!(result, Err(ReconError::Config(_))));
    }

    #[test]
    fn test_bad_home_currency_rejected() {
        let settings = Settings {
            home_currency: "DOLLARS".to_string(),
            ..Default::default()
        };

        assert!(settings.validate().is_err());
    }
}
