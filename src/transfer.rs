//! Export and import payloads.
//!
//! The JSON bundle carries settings, the ids of enabled records and the audit
//! log, so a refresher setup can be moved between installations. Imports are
//! fully validated before anything is written.

use crate::error::ImportError;
use crate::record_store::RecordId;
use crate::settings::Settings;
use crate::state_store::AuditLogEntry;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const EXPORT_VERSION: &str = "1.0.0";
const SUPPORTED_MAJOR: &str = "1";

pub const RECORDS_CSV_HEADER: [&str; 6] = [
    "RecordID",
    "Title",
    "Category",
    "Created",
    "LastUpdate",
    "UpdateCount",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("unknown export format '{}'", other)),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => write!(f, "json"),
            ExportFormat::Csv => write!(f, "csv"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub version: String,
    #[serde(default)]
    pub export_date: String,
    #[serde(default)]
    pub settings: Option<Settings>,
    pub enabled_records: Vec<RecordId>,
    #[serde(default)]
    pub logs: Option<Vec<AuditLogEntry>>,
}

impl ExportBundle {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Parses and validates an import payload. Nothing is applied here.
pub fn parse_bundle(bytes: &[u8]) -> Result<ExportBundle, ImportError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| ImportError::Format(format!("invalid JSON: {}", e)))?;

    let version = value
        .get("version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ImportError::Format("missing 'version'".to_string()))?;
    if version.split('.').next() != Some(SUPPORTED_MAJOR) {
        return Err(ImportError::Format(format!(
            "unsupported version '{}', expected {}",
            version, EXPORT_VERSION
        )));
    }
    if !value
        .get("enabled_records")
        .map_or(false, serde_json::Value::is_array)
    {
        return Err(ImportError::Format(
            "missing 'enabled_records' list".to_string(),
        ));
    }

    serde_json::from_value(value).map_err(|e| ImportError::Format(e.to_string()))
}

/// One line of the records CSV export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordCsvRow {
    pub record_id: RecordId,
    pub title: String,
    pub category: String,
    pub created: String,
    pub last_update: Option<String>,
    pub update_count: u64,
}

pub fn records_csv(rows: &[RecordCsvRow]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(RECORDS_CSV_HEADER)?;
    for row in rows {
        writer.write_record([
            row.record_id.to_string(),
            row.title.clone(),
            row.category.clone(),
            row.created.clone(),
            row.last_update.clone().unwrap_or_else(|| "Never".to_string()),
            row.update_count.to_string(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to finish records CSV: {}", e.error()))
}
