// 🔧 Process Configuration - Environment-driven settings for the binaries

use crate::error::{ReconError, Result};
use crate::settings::Settings;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database file
    pub db_path: PathBuf,

    /// Optional JSON settings file; defaults apply when absent
    pub settings_path: Option<PathBuf>,

    pub log_level: String,

    /// Emit logs as JSON lines instead of human-readable text
    pub log_json: bool,

    /// Listen address for the API server
    pub bind_addr: String,

    /// Actor id recorded in audit events written by this process
    pub actor_id: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            db_path: env::var("RECON_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reconciliation.db")),
            settings_path: env::var("RECON_SETTINGS_PATH").ok().map(PathBuf::from),
            log_level: env::var("RECON_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: parse_bool("RECON_LOG_JSON")?,
            bind_addr: env::var("RECON_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            actor_id: env::var("RECON_ACTOR_ID").unwrap_or_else(|_| "system".to_string()),
        })
    }

    /// Settings from `settings_path`, or defaults when no file is configured
    pub fn load_settings(&self) -> Result<Settings> {
        match &self.settings_path {
            Some(path) => Settings::from_file(path),
            None => Ok(Settings::default()),
        }
    }
}

fn parse_bool(key: &str) -> Result<bool> {
    match env::var(key) {
        Ok(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            other => Err(ReconError::Config(format!(
                "{} must be a boolean, got {:?}",
                key, other
            ))),
        },
        Err(_) => Ok(false),
    }
}
