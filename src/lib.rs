//! Daily Refresher Library
//!
//! Scheduled batch refresh of record timestamps. The daemon and the admin CLI
//! are thin shells around [`service::RefresherService`]; the modules are
//! exposed for those binaries and for integration tests.

pub mod audit_log;
pub mod clock;
pub mod config;
pub mod eligibility;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod record_store;
pub mod scheduler;
pub mod selector;
pub mod service;
pub mod settings;
pub mod sqlite_persistence;
pub mod state_store;
pub mod transfer;
pub mod undo;

// Re-export commonly used types for convenience
pub use clock::{Clock, SystemClock};
pub use engine::{RefreshEngine, RunOutcome, RunResult};
pub use record_store::{RecordStore, SqliteRecordStore};
pub use scheduler::{RefreshScheduler, TokioTimerRegistrar};
pub use service::RefresherService;
pub use settings::{Settings, SettingsPatch};
pub use state_store::{SqliteStateStore, StateStore};
