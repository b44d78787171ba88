//! Shared constants for integration tests

/// Category every fixture record is created in unless a test says otherwise.
pub const POST: &str = "post";

pub const PAGE: &str = "page";

/// Ids of the three-record refresh scenario.
pub const SCENARIO_IDS: [i64; 3] = [101, 102, 103];

/// Age of fixture timestamps relative to the test clock's start.
pub const RECORD_AGE_DAYS: i64 = 45;
