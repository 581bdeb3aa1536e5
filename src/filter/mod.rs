//! Filtering of test results before multiple-testing correction

mod independent;

pub use independent::{independent_filtering, FilterOutcome};
