//! File input and output

mod csv;
mod results;

pub use self::csv::{
    read_calibration, read_count_table, read_sequences, write_results, write_summary, CountTable, ResultColumns,
};
pub use results::{ContrastFields, ContrastSummary, ResultRecord, RunSummary, ShrinkageSummary};
