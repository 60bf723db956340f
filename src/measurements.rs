//! C6: Measurement Comparator.
//!
//! Builds a dense `index -> acceptable digest set` map from the unioned
//! RIM golden values and walks the report's measurements in index order,
//! requiring each report digest to be a member of its slot's acceptable
//! set. A missing index on either side is a hard failure naming the
//! index and the side it was missing from.

use std::collections::BTreeMap;

use crate::error::{AttestError, AttestResult};
use crate::report::Measurement;

pub fn compare(
    report_measurements: &[Measurement],
    golden: &BTreeMap<u32, Vec<Vec<u8>>>,
) -> AttestResult<()> {
    for m in report_measurements {
        let acceptable = golden
            .get(&m.index)
            .ok_or_else(|| AttestError::MeasurementCoverage { index: m.index, source: "rim".into() })?;

        let matched = m.alternatives.iter().any(|digest| acceptable.contains(digest));
        if !matched {
            return Err(AttestError::MeasurementCoverage { index: m.index, source: "report".into() });
        }
    }

    for &index in golden.keys() {
        if !report_measurements.iter().any(|m| m.index == index) {
            return Err(AttestError::MeasurementCoverage { index, source: "report".into() });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meas(index: u32, alt: Vec<u8>) -> Measurement {
        Measurement { index, size: alt.len() as u16, alternatives: vec![alt] }
    }

    #[test]
    fn test_matching_digest_passes() {
        let report = vec![meas(0, vec![1, 2, 3])];
        let mut golden = BTreeMap::new();
        golden.insert(0, vec![vec![1, 2, 3]]);
        assert!(compare(&report, &golden).is_ok());
    }

    #[test]
    fn test_alternative_digest_passes() {
        let report = vec![meas(0, vec![9, 9, 9])];
        let mut golden = BTreeMap::new();
        golden.insert(0, vec![vec![1, 2, 3], vec![9, 9, 9]]);
        assert!(compare(&report, &golden).is_ok());
    }

    #[test]
    fn test_missing_rim_entry_fails_naming_index() {
        let report = vec![meas(3, vec![1])];
        let golden = BTreeMap::new();
        let err = compare(&report, &golden).unwrap_err();
        assert!(matches!(err, AttestError::MeasurementCoverage { index: 3, .. }));
    }

    #[test]
    fn test_missing_report_entry_fails_naming_index() {
        let report: Vec<Measurement> = vec![];
        let mut golden = BTreeMap::new();
        golden.insert(2, vec![vec![1]]);
        let err = compare(&report, &golden).unwrap_err();
        assert!(matches!(err, AttestError::MeasurementCoverage { index: 2, .. }));
    }

    #[test]
    fn test_digest_not_in_acceptable_set_fails() {
        let report = vec![meas(0, vec![0xFF])];
        let mut golden = BTreeMap::new();
        golden.insert(0, vec![vec![0x00]]);
        assert!(compare(&report, &golden).is_err());
    }
}
