//! Count matrix and typed sample design factors

mod count_matrix;
mod metadata;

pub use count_matrix::CountMatrix;
pub use metadata::{Batch, SampleLabel, SampleMetadata, TimePoint};
