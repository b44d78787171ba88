use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RecordId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Published,
    Draft,
    Pending,
    Private,
    Trash,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Published => "published",
            RecordStatus::Draft => "draft",
            RecordStatus::Pending => "pending",
            RecordStatus::Private => "private",
            RecordStatus::Trash => "trash",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "published" => Some(RecordStatus::Published),
            "draft" => Some(RecordStatus::Draft),
            "pending" => Some(RecordStatus::Pending),
            "private" => Some(RecordStatus::Private),
            "trash" => Some(RecordStatus::Trash),
            _ => None,
        }
    }
}

/// A timestamp field as the record store keeps it: local wall time plus
/// its UTC counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampPair {
    pub local: NaiveDateTime,
    pub utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: RecordId,
    pub title: String,
    pub category: String,
    pub status: RecordStatus,
    pub created: TimestampPair,
    pub modified: TimestampPair,
}

/// Fields to rewrite on a record. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampUpdate {
    pub created: Option<TimestampPair>,
    pub modified: Option<TimestampPair>,
}

impl TimestampUpdate {
    pub fn is_empty(&self) -> bool {
        self.created.is_none() && self.modified.is_none()
    }
}

/// Restricts a query by the value of the `auto_update_enabled` meta key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EligibilityFilter {
    /// Flag is `yes`.
    Enabled,
    /// Flag is `no` or missing.
    Disabled,
    #[default]
    Any,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    /// Empty matches every category.
    pub categories: Vec<String>,
    pub status: Option<RecordStatus>,
    pub eligibility: EligibilityFilter,
}

/// Input for [`super::SqliteRecordStore::insert_record`].
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub id: Option<RecordId>,
    pub title: String,
    pub category: String,
    pub status: RecordStatus,
    pub created: TimestampPair,
    pub modified: TimestampPair,
}
