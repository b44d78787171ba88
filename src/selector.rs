use crate::error::SelectionError;
use crate::record_store::{EligibilityFilter, RecordId, RecordQuery, RecordStatus, RecordStore};
use crate::settings::Settings;
use std::sync::Arc;

/// Finds the records a run may refresh: published, in one of the target
/// categories, flagged `yes`.
///
/// The full set is returned, ordered by id ascending. Truncation to the batch
/// size is the engine's job.
#[derive(Clone)]
pub struct RecordSelector {
    records: Arc<dyn RecordStore>,
}

impl RecordSelector {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    pub fn eligible_query(settings: &Settings) -> RecordQuery {
        RecordQuery {
            categories: settings.target_categories.clone(),
            status: Some(RecordStatus::Published),
            eligibility: EligibilityFilter::Enabled,
        }
    }

    pub fn select(&self, settings: &Settings) -> Result<Vec<RecordId>, SelectionError> {
        let mut ids = self.records.query(&Self::eligible_query(settings))?;
        // Store implementations are not required to sort.
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    pub fn count_eligible(&self, settings: &Settings) -> Result<usize, SelectionError> {
        Ok(self.select(settings)?.len())
    }
}
