//! Optical-density calibration and per-feature concentration estimates (ODID)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::TimePoint;
use crate::error::{OdidError, Result};

/// Concentration assigned to every feature at the baseline timepoint
pub const BASELINE_OD: f64 = 0.2;

/// One replicate OD reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdMeasurement {
    pub timepoint: u32,
    pub replicate: String,
    pub od: f64,
}

/// Mean OD per timepoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationTable {
    means: BTreeMap<TimePoint, f64>,
    replicates: BTreeMap<TimePoint, usize>,
    baseline_od: f64,
}

impl CalibrationTable {
    /// Average replicate readings per timepoint
    pub fn from_measurements(measurements: &[OdMeasurement], baseline_od: f64) -> Result<Self> {
        if measurements.is_empty() {
            return Err(OdidError::EmptyData {
                reason: "Calibration table has no measurements".to_string(),
            });
        }

        let mut sums: BTreeMap<TimePoint, (f64, usize)> = BTreeMap::new();
        for m in measurements {
            if !m.od.is_finite() || m.od <= 0.0 {
                return Err(OdidError::InvalidInput {
                    reason: format!(
                        "OD for timepoint {} replicate {} must be positive, got {}",
                        m.timepoint, m.replicate, m.od
                    ),
                });
            }
            let entry = sums.entry(TimePoint(m.timepoint)).or_insert((0.0, 0));
            entry.0 += m.od;
            entry.1 += 1;
        }

        let means = sums.iter().map(|(&tp, &(sum, n))| (tp, sum / n as f64)).collect();
        let replicates = sums.iter().map(|(&tp, &(_, n))| (tp, n)).collect();
        Ok(Self {
            means,
            replicates,
            baseline_od,
        })
    }

    pub fn mean_od(&self, timepoint: TimePoint) -> Result<f64> {
        self.means
            .get(&timepoint)
            .copied()
            .ok_or(OdidError::MissingCalibration {
                timepoint: timepoint.value(),
            })
    }

    pub fn n_replicates(&self, timepoint: TimePoint) -> usize {
        self.replicates.get(&timepoint).copied().unwrap_or(0)
    }

    pub fn timepoints(&self) -> impl Iterator<Item = TimePoint> + '_ {
        self.means.keys().copied()
    }

    pub fn baseline_od(&self) -> f64 {
        self.baseline_od
    }

    /// Fail early if any of `timepoints` lacks a calibration entry
    pub fn require(&self, timepoints: &[TimePoint]) -> Result<()> {
        for &tp in timepoints {
            self.mean_od(tp)?;
        }
        Ok(())
    }

    /// `2^lfc * meanOD(t)`; the baseline is the fixed anchor regardless of `lfc`.
    /// An undefined fold change gives an undefined concentration.
    pub fn odid(&self, timepoint: TimePoint, baseline: TimePoint, shrunk_lfc: Option<f64>) -> Result<Option<f64>> {
        if timepoint == baseline {
            return Ok(Some(self.baseline_od));
        }
        let mean = self.mean_od(timepoint)?;
        Ok(shrunk_lfc.map(|lfc| 2f64.powf(lfc) * mean))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn measurement(tp: u32, rep: &str, od: f64) -> OdMeasurement {
        OdMeasurement {
            timepoint: tp,
            replicate: rep.to_string(),
            od,
        }
    }

    fn growth_curve() -> CalibrationTable {
        let data = [
            (0, [0.1995, 0.2, 0.1995]),
            (1, [0.705, 0.704, 0.697]),
            (2, [2.25, 2.19, 2.135]),
            (3, [4.085, 4.305, 3.83]),
        ];
        let measurements: Vec<OdMeasurement> = data
            .iter()
            .flat_map(|(tp, ods)| {
                ["A", "B", "C"]
                    .iter()
                    .zip(ods)
                    .map(move |(rep, &od)| measurement(*tp, rep, od))
            })
            .collect();
        CalibrationTable::from_measurements(&measurements, BASELINE_OD).unwrap()
    }

    #[test]
    fn test_mean_od_per_timepoint() {
        let table = growth_curve();
        let expected = [0.1997, 0.7020, 2.1917, 4.0733];
        for (tp, want) in expected.iter().enumerate() {
            let got = table.mean_od(TimePoint(tp as u32)).unwrap();
            assert_abs_diff_eq!((got * 1e4).round() / 1e4, *want, epsilon = 1e-12);
        }
        assert_eq!(table.n_replicates(TimePoint(2)), 3);
    }

    #[test]
    fn test_baseline_is_fixed() {
        let table = growth_curve();
        for lfc in [Some(-5.0), Some(0.0), Some(3.0), None] {
            assert_eq!(table.odid(TimePoint(0), TimePoint(0), lfc).unwrap(), Some(0.2));
        }
    }

    #[test]
    fn test_odid_scales_mean() {
        let table = growth_curve();
        let mean = table.mean_od(TimePoint(3)).unwrap();
        let od = table.odid(TimePoint(3), TimePoint(0), Some(-1.0)).unwrap().unwrap();
        assert_abs_diff_eq!(od, mean / 2.0, epsilon = 1e-12);
        assert_eq!(table.odid(TimePoint(3), TimePoint(0), None).unwrap(), None);
    }

    #[test]
    fn test_missing_timepoint() {
        let table = growth_curve();
        let err = table.odid(TimePoint(5), TimePoint(0), Some(0.0));
        assert!(matches!(err, Err(OdidError::MissingCalibration { timepoint: 5 })));
        assert!(table.require(&[TimePoint(1), TimePoint(7)]).is_err());
    }

    #[test]
    fn test_rejects_non_positive_od() {
        let err = CalibrationTable::from_measurements(&[measurement(0, "A", 0.0)], BASELINE_OD);
        assert!(matches!(err, Err(OdidError::InvalidInput { .. })));
        assert!(CalibrationTable::from_measurements(&[], BASELINE_OD).is_err());
    }
}
