//! Per-record metadata owned by the refresher: the eligibility flag and the
//! update counters.

use crate::clock::format_local;
use crate::record_store::{RecordId, RecordStore};
use anyhow::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const META_AUTO_UPDATE_ENABLED: &str = "auto_update_enabled";
pub const META_LAST_AUTO_UPDATE: &str = "last_auto_update";
pub const META_UPDATE_COUNT: &str = "update_count";

/// Every meta key the refresher writes.
pub const ALL_META_KEYS: &[&str] = &[
    META_AUTO_UPDATE_ENABLED,
    META_LAST_AUTO_UPDATE,
    META_UPDATE_COUNT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EligibilityFlag {
    Yes,
    No,
    Unset,
}

impl EligibilityFlag {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            EligibilityFlag::Yes
        } else {
            EligibilityFlag::No
        }
    }

    /// Unset selects like `No`.
    pub fn is_enabled(&self) -> bool {
        matches!(self, EligibilityFlag::Yes)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EligibilityFlag::Yes => "yes",
            EligibilityFlag::No => "no",
            EligibilityFlag::Unset => "unset",
        }
    }

    pub fn from_meta(value: Option<&str>) -> Self {
        match value {
            Some("yes") => EligibilityFlag::Yes,
            Some(_) => EligibilityFlag::No,
            None => EligibilityFlag::Unset,
        }
    }
}

pub fn read_flag(records: &dyn RecordStore, id: RecordId) -> Result<EligibilityFlag> {
    let value = records.get_meta(id, META_AUTO_UPDATE_ENABLED)?;
    Ok(EligibilityFlag::from_meta(value.as_deref()))
}

pub fn write_flag(records: &dyn RecordStore, id: RecordId, enabled: bool) -> Result<()> {
    records.set_meta(
        id,
        META_AUTO_UPDATE_ENABLED,
        EligibilityFlag::from_enabled(enabled).as_str(),
    )
}

/// `update_count` and `last_auto_update` for one record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateCounters {
    pub update_count: u64,
    pub last_auto_update: Option<String>,
}

pub fn read_counters(records: &dyn RecordStore, id: RecordId) -> Result<UpdateCounters> {
    let update_count = records
        .get_meta(id, META_UPDATE_COUNT)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    Ok(UpdateCounters {
        update_count,
        last_auto_update: records.get_meta(id, META_LAST_AUTO_UPDATE)?,
    })
}

/// Bumps the update counter and stamps the last auto-update time.
pub fn bump_counters(records: &dyn RecordStore, id: RecordId, now: &NaiveDateTime) -> Result<u64> {
    let next = read_counters(records, id)?.update_count + 1;
    records.set_meta(id, META_UPDATE_COUNT, &next.to_string())?;
    records.set_meta(id, META_LAST_AUTO_UPDATE, &format_local(now))?;
    Ok(next)
}
