// ⚙️ Configuration
//
// FacilityConfig lives in the store (`workplaces/<id>`) and is read-only for
// the core. AppConfig tells the CLI where the store is and which workplace
// document to read.

use anyhow::{Context as AnyhowContext, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_WORKPLACE_ID: &str = "main_office";
pub const DEFAULT_DATABASE_PATH: &str = "support-funnel.db";

pub const ENV_DATABASE_PATH: &str = "SUPPORT_FUNNEL_DB";
pub const ENV_WORKPLACE_ID: &str = "SUPPORT_FUNNEL_WORKPLACE";

// ============================================================================
// FACILITY CONFIG
// ============================================================================

/// Facility singleton. Both fields may be missing until staff fill them in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilityConfig {
    /// Regulatory headcount
    #[serde(default)]
    pub capacity: Option<u32>,

    /// Date the facility began operating
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
}

impl FacilityConfig {
    pub fn new(capacity: u32, start_date: NaiveDate) -> Self {
        FacilityConfig {
            capacity: Some(capacity),
            start_date: Some(start_date),
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self.capacity, Some(c) if c > 0) && self.start_date.is_some()
    }
}

// ============================================================================
// APP CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_workplace_id")]
    pub workplace_id: String,
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

fn default_workplace_id() -> String {
    DEFAULT_WORKPLACE_ID.to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            database_path: default_database_path(),
            workplace_id: default_workplace_id(),
        }
    }
}

impl AppConfig {
    /// Load from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        serde_json::from_str(&content).context("Failed to parse config JSON")
    }

    /// File (if any), then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => AppConfig::from_file(path)?,
            None => AppConfig::default(),
        };

        Ok(base.with_overrides(
            env::var(ENV_DATABASE_PATH).ok(),
            env::var(ENV_WORKPLACE_ID).ok(),
        ))
    }

    fn with_overrides(mut self, database_path: Option<String>, workplace_id: Option<String>) -> Self {
        if let Some(db) = database_path.filter(|v| !v.trim().is_empty()) {
            self.database_path = PathBuf::from(db);
        }
        if let Some(id) = workplace_id.filter(|v| !v.trim().is_empty()) {
            self.workplace_id = id;
        }
        self
    }
}

// ============================================================================
// TESTS
// ============================================================================
