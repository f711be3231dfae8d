use crate::encoder::level_order;
use crate::error::{DataIntegrityError, IecvError};
use crate::records::RecordSet;
use ahash::AHashMap;

/// Completes missing covariate values of a record set.
///
/// Implementations must return the same subjects in the same order with the
/// same covariate columns, and must only use the record set they are given.
pub trait Imputer: Sync {
    fn complete(&self, records: &RecordSet, seed: u64) -> Result<RecordSet, IecvError>;
}

/// Runs `imputer` and verifies that its output honours the imputation contract.
pub fn complete_checked(
    imputer: &dyn Imputer,
    records: &RecordSet,
    seed: u64,
) -> Result<RecordSet, IecvError> {
    let completed = imputer.complete(records, seed)?;
    let breach =
        |detail: String| -> IecvError { DataIntegrityError::ImputationContract(detail).into() };

    if completed.len() != records.len() {
        return Err(breach(format!(
            "{} rows in, {} rows out",
            records.len(),
            completed.len()
        )));
    }
    if completed.categorical_names() != records.categorical_names()
        || completed.continuous_names() != records.continuous_names()
    {
        return Err(breach("covariate columns were added, removed or reordered".to_string()));
    }
    for (row, (before, after)) in records
        .records()
        .iter()
        .zip(completed.records())
        .enumerate()
    {
        if before.cluster != after.cluster
            || before.time.to_bits() != after.time.to_bits()
            || before.status != after.status
        {
            return Err(breach(format!(
                "row {row} changed its cluster or outcome; rows must keep their order"
            )));
        }
    }
    if !completed.is_complete() {
        return Err(breach("output still contains missing covariate values".to_string()));
    }
    Ok(completed)
}

/// Fills continuous gaps with the column mean and categorical gaps with the
/// modal level, both computed from the record set being completed.
#[derive(Clone, Copy, Debug, Default)]
pub struct MarginalImputer;

impl Imputer for MarginalImputer {
    fn complete(&self, records: &RecordSet, seed: u64) -> Result<RecordSet, IecvError> {
        let _ = seed;
        let modes: Vec<Option<String>> = (0..records.categorical_names().len())
            .map(|c| {
                let mut counts: AHashMap<&str, usize> = AHashMap::new();
                for record in records.records() {
                    if let Some(level) = record.categorical[c].as_deref() {
                        *counts.entry(level).or_insert(0) += 1;
                    }
                }
                counts
                    .into_iter()
                    .max_by(|a, b| a.1.cmp(&b.1).then_with(|| level_order(b.0, a.0)))
                    .map(|(level, _)| level.to_string())
            })
            .collect();

        let means: Vec<Option<f64>> = (0..records.continuous_names().len())
            .map(|c| {
                let (sum, count) = records
                    .records()
                    .iter()
                    .filter_map(|record| record.continuous[c])
                    .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                (count > 0).then(|| sum / count as f64)
            })
            .collect();

        let mut filled = 0usize;
        let completed = records
            .records()
            .iter()
            .map(|record| {
                let mut record = record.clone();
                for (value, mode) in record.categorical.iter_mut().zip(&modes) {
                    if value.is_none() {
                        *value = mode.clone();
                        filled += 1;
                    }
                }
                for (value, mean) in record.continuous.iter_mut().zip(&means) {
                    if value.is_none() {
                        *value = *mean;
                        filled += 1;
                    }
                }
                record
            })
            .collect();
        log::debug!("Marginal imputation filled {filled} value(s) in {} rows", records.len());

        RecordSet::new(
            records.categorical_names().to_vec(),
            records.continuous_names().to_vec(),
            completed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{EventStatus, SubjectRecord};
    use approx::assert_abs_diff_eq;

    fn record(level: Option<&str>, age: Option<f64>) -> SubjectRecord {
        SubjectRecord {
            cluster: "east".to_string(),
            time: 10.0,
            status: EventStatus::Primary,
            categorical: vec![level.map(str::to_string)],
            continuous: vec![age],
        }
    }

    fn cohort(records: Vec<SubjectRecord>) -> RecordSet {
        RecordSet::new(vec!["smoking".into()], vec!["bmi".into()], records).unwrap()
    }

    #[test]
    fn marginal_imputer_uses_mean_and_mode() {
        let records = cohort(vec![
            record(Some("never"), Some(20.0)),
            record(Some("never"), None),
            record(Some("current"), Some(30.0)),
            record(None, Some(25.0)),
        ]);
        let completed = complete_checked(&MarginalImputer, &records, 7).unwrap();
        assert!(completed.is_complete());
        assert_abs_diff_eq!(completed.records()[1].continuous[0].unwrap(), 25.0);
        assert_eq!(completed.records()[3].categorical[0].as_deref(), Some("never"));
    }

    #[test]
    fn modal_ties_pick_the_first_level_in_order() {
        for _ in 0..50 {
            let records = cohort(vec![
                record(Some("ab"), Some(1.0)),
                record(Some("a b"), Some(1.0)),
                record(Some("a  b"), Some(1.0)),
                record(None, Some(1.0)),
            ]);
            let completed = complete_checked(&MarginalImputer, &records, 3).unwrap();
            assert_eq!(completed.records()[3].categorical[0].as_deref(), Some("a  b"));
        }
    }

    struct DroppingImputer;

    impl Imputer for DroppingImputer {
        fn complete(&self, records: &RecordSet, seed: u64) -> Result<RecordSet, IecvError> {
            let _ = seed;
            let keep: Vec<usize> = (1..records.len()).collect();
            Ok(records.subset(&keep))
        }
    }

    struct IdentityImputer;

    impl Imputer for IdentityImputer {
        fn complete(&self, records: &RecordSet, seed: u64) -> Result<RecordSet, IecvError> {
            let _ = seed;
            Ok(records.clone())
        }
    }

    #[test]
    fn contract_breaches_are_reported() {
        let records = cohort(vec![
            record(Some("never"), Some(20.0)),
            record(Some("current"), None),
        ]);
        assert!(matches!(
            complete_checked(&DroppingImputer, &records, 1),
            Err(IecvError::DataIntegrity(DataIntegrityError::ImputationContract(_)))
        ));
        let err = complete_checked(&IdentityImputer, &records, 1).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
