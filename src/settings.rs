//! Refresher settings and their persistence.
//!
//! Settings are a single JSON document in the state store. Reads never fail
//! on bad content: a missing or unreadable document yields the defaults.
//! Writes sanitize instead of rejecting (batch size is clamped, an empty
//! category list falls back to the default category).

use crate::error::ConfigurationError;
use crate::state_store::StateStore;
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

pub const SETTINGS_KEY: &str = "settings";
pub const MIN_BATCH_SIZE: u32 = 1;
pub const MAX_BATCH_SIZE: u32 = 1000;
pub const DEFAULT_BATCH_SIZE: u32 = 50;
pub const DEFAULT_CATEGORY: &str = "post";

/// Daily fire time, server-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScheduleTime {
    hour: u32,
    minute: u32,
}

impl ScheduleTime {
    /// Out-of-range values are clamped to 23:59.
    pub fn new(hour: u32, minute: u32) -> Self {
        Self {
            hour: hour.min(23),
            minute: minute.min(59),
        }
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    pub fn naive_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl Default for ScheduleTime {
    fn default() -> Self {
        Self::new(3, 0)
    }
}

impl fmt::Display for ScheduleTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for ScheduleTime {
    type Err = ConfigurationError;

    /// Parses `HH:MM`. Non-numeric or malformed input is an error, numeric
    /// values out of range are clamped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigurationError::InvalidScheduleTime(s.to_string());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
        Ok(Self::new(hour, minute))
    }
}

impl TryFrom<String> for ScheduleTime {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScheduleTime> for String {
    fn from(value: ScheduleTime) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub enabled: bool,
    pub schedule_time: ScheduleTime,
    pub target_categories: Vec<String>,
    pub touch_creation_timestamp: bool,
    pub touch_modification_timestamp: bool,
    pub batch_size: u32,
    pub last_run_at: Option<NaiveDateTime>,
    pub total_updates_applied: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule_time: ScheduleTime::default(),
            target_categories: vec![DEFAULT_CATEGORY.to_string()],
            touch_creation_timestamp: true,
            touch_modification_timestamp: false,
            batch_size: DEFAULT_BATCH_SIZE,
            last_run_at: None,
            total_updates_applied: 0,
        }
    }
}

/// Which timestamp fields a run rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TouchedFields {
    pub creation: bool,
    pub modification: bool,
}

impl Settings {
    /// Fields to touch. With both flags off the creation timestamp is
    /// touched anyway, a run is never a silent no-op.
    pub fn touched_fields(&self) -> TouchedFields {
        if !self.touch_creation_timestamp && !self.touch_modification_timestamp {
            return TouchedFields {
                creation: true,
                modification: false,
            };
        }
        TouchedFields {
            creation: self.touch_creation_timestamp,
            modification: self.touch_modification_timestamp,
        }
    }

    fn sanitized(mut self) -> Self {
        self.batch_size = clamp_batch_size(self.batch_size);
        self.target_categories = sanitize_categories(self.target_categories);
        self
    }
}

pub fn clamp_batch_size(value: u32) -> u32 {
    value.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
}

fn sanitize_categories(categories: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = categories
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    cleaned.sort();
    cleaned.dedup();
    if cleaned.is_empty() {
        cleaned.push(DEFAULT_CATEGORY.to_string());
    }
    cleaned
}

/// Partial update for [`SettingsStore::save`]. Run counters are not part of
/// it; they only move through [`SettingsStore::record_run_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub enabled: Option<bool>,
    pub schedule_time: Option<ScheduleTime>,
    pub target_categories: Option<Vec<String>>,
    pub touch_creation_timestamp: Option<bool>,
    pub touch_modification_timestamp: Option<bool>,
    pub batch_size: Option<u32>,
}

impl SettingsPatch {
    fn apply_to(self, settings: &mut Settings) {
        if let Some(enabled) = self.enabled {
            settings.enabled = enabled;
        }
        if let Some(schedule_time) = self.schedule_time {
            settings.schedule_time = schedule_time;
        }
        if let Some(categories) = self.target_categories {
            settings.target_categories = categories;
        }
        if let Some(touch) = self.touch_creation_timestamp {
            settings.touch_creation_timestamp = touch;
        }
        if let Some(touch) = self.touch_modification_timestamp {
            settings.touch_modification_timestamp = touch;
        }
        if let Some(batch_size) = self.batch_size {
            settings.batch_size = batch_size;
        }
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    state: Arc<dyn StateStore>,
}

impl SettingsStore {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }

    /// Current settings, or the defaults when nothing (readable) is stored.
    /// Only a failing store is an error.
    pub fn get(&self) -> Result<Settings> {
        let Some(raw) = self.state.get_state(SETTINGS_KEY)? else {
            return Ok(Settings::default());
        };
        match serde_json::from_str::<Settings>(&raw) {
            Ok(settings) => Ok(settings.sanitized()),
            Err(e) => {
                warn!("Stored settings are unreadable, using defaults: {}", e);
                Ok(Settings::default())
            }
        }
    }

    pub fn save(&self, patch: SettingsPatch) -> Result<Settings> {
        let mut settings = self.get()?;
        patch.apply_to(&mut settings);
        self.replace(settings)
    }

    /// Stores a complete settings value, sanitized.
    pub fn replace(&self, settings: Settings) -> Result<Settings> {
        let settings = settings.sanitized();
        let raw = serde_json::to_string(&settings).context("Failed to serialize settings")?;
        self.state.set_state(SETTINGS_KEY, &raw)?;
        debug!(
            enabled = settings.enabled,
            schedule_time = %settings.schedule_time,
            batch_size = settings.batch_size,
            "Settings saved"
        );
        Ok(settings)
    }

    pub fn record_run_stats(&self, updated: usize, run_at: NaiveDateTime) -> Result<Settings> {
        let mut settings = self.get()?;
        settings.total_updates_applied += updated as u64;
        settings.last_run_at = Some(run_at);
        self.replace(settings)
    }

    /// Drops stored settings; the next read yields the defaults.
    pub fn reset(&self) -> Result<()> {
        self.state.delete_state(SETTINGS_KEY)
    }
}
