//! Error types for peptide_odid

use thiserror::Error;

/// Main error type for the depletion/ODID pipeline
#[derive(Error, Debug)]
pub enum OdidError {
    #[error("Invalid design: {reason}")]
    InvalidDesign { reason: String },

    #[error("Missing calibration for timepoint {timepoint}")]
    MissingCalibration { timepoint: u32 },

    #[error("Invalid count matrix: {reason}")]
    InvalidCountMatrix { reason: String },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: String, got: String },

    #[error("Numerical instability in {operation}: {details}")]
    NumericalInstability { operation: String, details: String },

    #[error("Invalid contrast specification: {reason}")]
    InvalidContrast { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Empty data: {reason}")]
    EmptyData { reason: String },

    #[error("Size factor estimation failed: {reason}")]
    SizeFactorFailed { reason: String },

    #[error("Trend fitting failed: {reason}")]
    TrendFittingFailed { reason: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, OdidError>;
