//! Single-step undo for the most recent bulk eligibility toggle.

use crate::clock::Clock;
use crate::eligibility::write_flag;
use crate::error::UndoError;
use crate::record_store::{RecordId, RecordStore};
use crate::state_store::StateStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const UNDO_BUFFER_KEY: &str = "last_bulk_action";
pub const UNDO_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    Enable,
    Disable,
}

impl BulkAction {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            BulkAction::Enable
        } else {
            BulkAction::Disable
        }
    }

    /// Flag value that undoes this action.
    pub fn inverse_flag(&self) -> bool {
        matches!(self, BulkAction::Disable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoBufferEntry {
    pub action: BulkAction,
    pub record_ids: Vec<RecordId>,
    pub captured_at: DateTime<Utc>,
}

impl UndoBufferEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.captured_at + Duration::seconds(UNDO_TTL_SECS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RevertOutcome {
    pub records_restored: usize,
    /// Captured records that were deleted or could not be written.
    pub records_skipped: usize,
}

/// At most one entry exists; a new capture overwrites it. Entries older than
/// [`UNDO_TTL_SECS`] are treated as absent.
#[derive(Clone)]
pub struct UndoBuffer {
    state: Arc<dyn StateStore>,
    records: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl UndoBuffer {
    pub fn new(
        state: Arc<dyn StateStore>,
        records: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state,
            records,
            clock,
        }
    }

    pub fn capture(&self, action: BulkAction, record_ids: Vec<RecordId>) -> Result<()> {
        let entry = UndoBufferEntry {
            action,
            record_ids,
            captured_at: self.clock.now_utc(),
        };
        let raw = serde_json::to_string(&entry).context("Failed to serialize undo buffer")?;
        self.state.set_state(UNDO_BUFFER_KEY, &raw)
    }

    /// The live entry, if any. An expired entry is deleted on read.
    pub fn current(&self) -> Result<Option<UndoBufferEntry>> {
        let Some(raw) = self.state.get_state(UNDO_BUFFER_KEY)? else {
            return Ok(None);
        };
        let entry = match serde_json::from_str::<UndoBufferEntry>(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Discarding unreadable undo buffer: {}", e);
                self.state.delete_state(UNDO_BUFFER_KEY)?;
                return Ok(None);
            }
        };
        if self.clock.now_utc() >= entry.expires_at() {
            self.state.delete_state(UNDO_BUFFER_KEY)?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Restores the flags changed by the captured action and consumes the
    /// buffer. Records deleted since the capture, or whose flag cannot be
    /// written, are skipped. Fails with [`UndoError::NoBufferOrExpired`] when
    /// there is nothing to undo, including on a second call.
    pub fn revert(&self) -> Result<RevertOutcome, UndoError> {
        let entry = self.current()?.ok_or(UndoError::NoBufferOrExpired)?;
        // Consumed up front so a bad record cannot pin the buffer.
        self.state.delete_state(UNDO_BUFFER_KEY)?;

        let restore_to = entry.action.inverse_flag();
        let mut outcome = RevertOutcome {
            records_restored: 0,
            records_skipped: 0,
        };
        for &id in &entry.record_ids {
            match self.restore_flag(id, restore_to) {
                Ok(true) => outcome.records_restored += 1,
                Ok(false) => {
                    debug!(record_id = id, "Undo skipping deleted record");
                    outcome.records_skipped += 1;
                }
                Err(e) => {
                    warn!(record_id = id, "Undo could not restore flag: {:#}", e);
                    outcome.records_skipped += 1;
                }
            }
        }

        info!(
            action = ?entry.action,
            restored = outcome.records_restored,
            skipped = outcome.records_skipped,
            "Reverted last bulk action"
        );
        Ok(outcome)
    }

    fn restore_flag(&self, id: RecordId, enabled: bool) -> Result<bool> {
        if self.records.get(id)?.is_none() {
            return Ok(false);
        }
        write_flag(self.records.as_ref(), id, enabled)?;
        Ok(true)
    }

    pub fn discard(&self) -> Result<()> {
        self.state.delete_state(UNDO_BUFFER_KEY)
    }
}
