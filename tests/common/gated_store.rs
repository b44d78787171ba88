//! A record store wrapper that parks the first `query` call until released,
//! so a run can be held inside its critical section.

use anyhow::Result;
use daily_refresher::record_store::{
    Record, RecordId, RecordQuery, RecordStore, TimestampUpdate,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

pub struct GatedRecordStore {
    inner: Arc<dyn RecordStore>,
    armed: AtomicBool,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

#[allow(dead_code)]
impl GatedRecordStore {
    /// Returns the store, a receiver that fires when a query is parked and a
    /// sender that lets it continue.
    pub fn new(inner: Arc<dyn RecordStore>) -> (Arc<Self>, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        let store = Arc::new(Self {
            inner,
            armed: AtomicBool::new(true),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        (store, entered_rx, release_tx)
    }
}

impl RecordStore for GatedRecordStore {
    fn query(&self, query: &RecordQuery) -> Result<Vec<RecordId>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
        }
        self.inner.query(query)
    }

    fn get(&self, id: RecordId) -> Result<Option<Record>> {
        self.inner.get(id)
    }

    fn apply_timestamps(&self, id: RecordId, update: &TimestampUpdate) -> Result<bool> {
        self.inner.apply_timestamps(id, update)
    }

    fn get_meta(&self, id: RecordId, key: &str) -> Result<Option<String>> {
        self.inner.get_meta(id, key)
    }

    fn set_meta(&self, id: RecordId, key: &str, value: &str) -> Result<()> {
        self.inner.set_meta(id, key, value)
    }

    fn delete_meta_keys(&self, keys: &[&str]) -> Result<usize> {
        self.inner.delete_meta_keys(keys)
    }
}
