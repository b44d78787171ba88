mod models;
mod schema;
mod sqlite_record_store;

pub use models::*;
pub use schema::RECORDS_VERSIONED_SCHEMAS;
pub use sqlite_record_store::SqliteRecordStore;

use anyhow::Result;

/// The host's record storage, as seen by the refresher.
pub trait RecordStore: Send + Sync {
    /// Ids of all records matching `query`, ascending.
    fn query(&self, query: &RecordQuery) -> Result<Vec<RecordId>>;
    fn get(&self, id: RecordId) -> Result<Option<Record>>;
    /// Rewrites the given timestamp fields. Returns false when the record does
    /// not exist (anymore) or the store refused the write.
    fn apply_timestamps(&self, id: RecordId, update: &TimestampUpdate) -> Result<bool>;
    fn get_meta(&self, id: RecordId, key: &str) -> Result<Option<String>>;
    fn set_meta(&self, id: RecordId, key: &str, value: &str) -> Result<()>;
    /// Deletes the given meta keys from every record, returning the number of
    /// rows removed.
    fn delete_meta_keys(&self, keys: &[&str]) -> Result<usize>;
}
