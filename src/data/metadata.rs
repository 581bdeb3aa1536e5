//! Sample metadata: typed timepoint/batch factors parsed from sample names

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OdidError, Result};

/// An ordered sampling timepoint (e.g. the `3` in `3B`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimePoint(pub u32);

impl TimePoint {
    pub fn value(self) -> u32 {
        self.0
    }

    /// Column suffix used in result tables (`t3`)
    pub fn label(self) -> String {
        format!("t{}", self.0)
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An unordered batch / replicate tag (e.g. the `B` in `3B`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Batch(pub String);

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed (timepoint, batch) pair for one sample column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleLabel {
    pub timepoint: TimePoint,
    pub batch: Batch,
}

impl SampleLabel {
    /// Parse a sample column name.
    ///
    /// Accepted shape: an optional non-digit prefix (spreadsheet exports often
    /// add `X` or `t`), a decimal timepoint, then a non-empty batch tag that does
    /// not start with a digit. `3B`, `X0A`, `t12rep2` parse; `A`, `3`, `3.5B` do not.
    pub fn parse(name: &str) -> Result<Self> {
        let trimmed = name.trim();
        let digits_start = trimmed
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| invalid_name(name, "no timepoint digits"))?;
        let rest = &trimmed[digits_start..];
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| invalid_name(name, "missing batch tag"))?;

        let timepoint: u32 = rest[..digits_end]
            .parse()
            .map_err(|_| invalid_name(name, "timepoint out of range"))?;
        let tag = &rest[digits_end..];

        if !tag.chars().next().is_some_and(|c| c.is_alphabetic()) {
            return Err(invalid_name(name, "batch tag must start with a letter"));
        }

        Ok(Self {
            timepoint: TimePoint(timepoint),
            batch: Batch(tag.to_string()),
        })
    }
}

fn invalid_name(name: &str, why: &str) -> OdidError {
    OdidError::InvalidDesign {
        reason: format!("cannot parse sample name '{}': {}", name, why),
    }
}

/// Per-sample design factors.
///
/// Timepoint levels are sorted ascending so the earliest observed timepoint is
/// the baseline; batch levels are sorted lexicographically with the first as
/// reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleMetadata {
    sample_ids: Vec<String>,
    labels: Vec<SampleLabel>,
    timepoints: Vec<TimePoint>,
    batches: Vec<Batch>,
}

impl SampleMetadata {
    /// Parse every sample name; fails on the first unparseable one
    pub fn from_sample_names(names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Err(OdidError::InvalidDesign {
                reason: "no sample columns".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(OdidError::InvalidDesign {
                    reason: format!("duplicate sample name '{}'", name),
                });
            }
        }

        let labels = names
            .iter()
            .map(|n| SampleLabel::parse(n))
            .collect::<Result<Vec<_>>>()?;

        Self::from_labels(names.to_vec(), labels)
    }

    /// Build from already-typed labels
    pub fn from_labels(sample_ids: Vec<String>, labels: Vec<SampleLabel>) -> Result<Self> {
        if sample_ids.len() != labels.len() {
            return Err(OdidError::DimensionMismatch {
                expected: format!("{} labels", sample_ids.len()),
                got: format!("{} labels", labels.len()),
            });
        }

        let mut timepoints: Vec<TimePoint> = labels.iter().map(|l| l.timepoint).collect();
        timepoints.sort();
        timepoints.dedup();

        if timepoints.len() < 2 {
            return Err(OdidError::InvalidDesign {
                reason: format!(
                    "need at least two distinct timepoints, found {}",
                    timepoints.len()
                ),
            });
        }

        let mut batches: Vec<Batch> = labels.iter().map(|l| l.batch.clone()).collect();
        batches.sort();
        batches.dedup();

        Ok(Self {
            sample_ids,
            labels,
            timepoints,
            batches,
        })
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn label(&self, sample_idx: usize) -> &SampleLabel {
        &self.labels[sample_idx]
    }

    pub fn labels(&self) -> &[SampleLabel] {
        &self.labels
    }

    /// Timepoint levels, baseline first
    pub fn timepoints(&self) -> &[TimePoint] {
        &self.timepoints
    }

    /// Reference timepoint (smallest observed)
    pub fn baseline(&self) -> TimePoint {
        self.timepoints[0]
    }

    /// Timepoints other than the baseline, ascending
    pub fn non_baseline_timepoints(&self) -> &[TimePoint] {
        &self.timepoints[1..]
    }

    /// Batch levels, reference first
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Indices of samples taken at the given timepoint
    pub fn samples_at(&self, timepoint: TimePoint) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.timepoint == timepoint)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_plain_label() {
        let l = SampleLabel::parse("3B").unwrap();
        assert_eq!(l.timepoint, TimePoint(3));
        assert_eq!(l.batch, Batch("B".to_string()));
    }

    #[test]
    fn test_parse_prefixed_label() {
        let l = SampleLabel::parse("X12rep2").unwrap();
        assert_eq!(l.timepoint, TimePoint(12));
        assert_eq!(l.batch.0, "rep2");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["A", "3", "", "3.5B", "3_B"] {
            let err = SampleLabel::parse(bad).unwrap_err();
            assert!(matches!(err, OdidError::InvalidDesign { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_baseline_is_smallest_timepoint() {
        let meta = SampleMetadata::from_sample_names(&names(&["3A", "1A", "0B", "3B", "0A", "1B"])).unwrap();
        assert_eq!(meta.baseline(), TimePoint(0));
        assert_eq!(meta.timepoints(), &[TimePoint(0), TimePoint(1), TimePoint(3)]);
        assert_eq!(meta.non_baseline_timepoints(), &[TimePoint(1), TimePoint(3)]);
        assert_eq!(meta.batches()[0].0, "A");
        assert_eq!(meta.samples_at(TimePoint(0)), vec![2, 4]);
    }

    #[test]
    fn test_single_timepoint_rejected() {
        let err = SampleMetadata::from_sample_names(&names(&["2A", "2B", "2C"])).unwrap_err();
        assert!(matches!(err, OdidError::InvalidDesign { .. }));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = SampleMetadata::from_sample_names(&names(&["0A", "0A", "1A"])).unwrap_err();
        assert!(matches!(err, OdidError::InvalidDesign { .. }));
    }
}
