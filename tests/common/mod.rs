//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestEnv, POST};
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnv::new();
//!     env.add_published(&[1, 2], POST);
//!     env.service.bulk_toggle(&[1, 2], true).unwrap();
//! }
//! ```

mod constants;
mod fixtures;
mod gated_store;

pub use constants::*;
pub use fixtures::{start_time, TestEnv};
#[allow(unused_imports)]
pub use gated_store::GatedRecordStore;
