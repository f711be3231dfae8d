//! Treatment coding of categorical covariates.
//!
//! A [`FeatureSchema`] is fitted once on the training subjects of a fold and
//! then applied verbatim to every record set that must share the model's
//! column space. Levels are kept in natural order so that `grade_10` sorts
//! after `grade_9`, and the reference level of each covariate is the most
//! frequent one unless configured otherwise.

use crate::error::{DataIntegrityError, EncodingError, IecvError, SchemaMismatchError};
use crate::records::RecordSet;
use ahash::AHashMap;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Encoding of one categorical covariate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoricalEncoding {
    pub covariate: String,
    pub reference: String,
    /// Non-reference levels, one indicator column each, in natural order.
    pub levels: Vec<String>,
}

impl CategoricalEncoding {
    pub fn column_name(&self, level: &str) -> String {
        format!("{}_{}", self.covariate, level)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub columns: Vec<String>,
    pub continuous: Vec<String>,
    pub categorical: Vec<CategoricalEncoding>,
}

/// Encoded covariates together with the schema that produced them.
#[derive(Clone, Debug)]
pub struct DesignMatrix {
    pub values: Array2<f64>,
    pub schema: FeatureSchema,
}

impl DesignMatrix {
    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }
}

/// Natural order, made total by falling back to byte order for labels that
/// natord considers equal (such as `"a b"` and `"ab"`).
pub(crate) fn level_order(a: &str, b: &str) -> Ordering {
    natord::compare(a, b).then_with(|| a.cmp(b))
}

impl FeatureSchema {
    /// Learns levels and reference categories from `records`, which must be
    /// complete. `reference_levels` overrides the frequency rule per covariate.
    pub fn fit(
        records: &RecordSet,
        reference_levels: &BTreeMap<String, String>,
    ) -> Result<Self, IecvError> {
        let mut categorical = Vec::with_capacity(records.categorical_names().len());
        let mut columns = Vec::new();

        for (c, covariate) in records.categorical_names().iter().enumerate() {
            let mut counts: AHashMap<&str, usize> = AHashMap::new();
            for (row, record) in records.records().iter().enumerate() {
                let level = record.categorical[c].as_deref().ok_or_else(|| {
                    EncodingError::MissingValue {
                        covariate: covariate.clone(),
                        row,
                    }
                })?;
                *counts.entry(level).or_insert(0) += 1;
            }

            let mut observed: Vec<(&str, usize)> = counts.into_iter().collect();
            observed.sort_by(|a, b| level_order(a.0, b.0));

            let reference = match reference_levels.get(covariate) {
                Some(level) => {
                    if !observed.iter().any(|(l, _)| *l == level.as_str()) {
                        return Err(EncodingError::UnknownReference {
                            covariate: covariate.clone(),
                            level: level.clone(),
                        }
                        .into());
                    }
                    level.clone()
                }
                None => {
                    // Natural order is already ascending, so the first maximum wins ties.
                    let mut best: Option<(&str, usize)> = None;
                    for &(level, count) in &observed {
                        if best.is_none_or(|(_, top)| count > top) {
                            best = Some((level, count));
                        }
                    }
                    match best {
                        Some((level, _)) => level.to_string(),
                        None => {
                            return Err(EncodingError::NoObservedLevel(covariate.clone()).into());
                        }
                    }
                }
            };

            let encoding = CategoricalEncoding {
                covariate: covariate.clone(),
                levels: observed
                    .iter()
                    .filter(|(level, _)| *level != reference)
                    .map(|(level, _)| level.to_string())
                    .collect(),
                reference,
            };
            columns.extend(encoding.levels.iter().map(|level| encoding.column_name(level)));
            log::debug!(
                "Covariate '{}': reference '{}', {} indicator column(s)",
                encoding.covariate,
                encoding.reference,
                encoding.levels.len()
            );
            categorical.push(encoding);
        }

        let continuous: Vec<String> = records.continuous_names().to_vec();
        columns.extend(continuous.iter().cloned());

        Ok(Self {
            columns,
            continuous,
            categorical,
        })
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// Encodes `records` into the column space of this schema.
    pub fn transform(&self, records: &RecordSet) -> Result<DesignMatrix, IecvError> {
        let position = |names: &[String], wanted: &str| {
            names
                .iter()
                .position(|name| name == wanted)
                .ok_or_else(|| EncodingError::UnknownCovariate(wanted.to_string()))
        };

        let mut values = Array2::<f64>::zeros((records.len(), self.n_columns()));
        let mut offset = 0usize;

        for encoding in &self.categorical {
            let source = position(records.categorical_names(), &encoding.covariate)?;
            let mut lookup: AHashMap<&str, Option<usize>> =
                AHashMap::with_capacity(encoding.levels.len() + 1);
            lookup.insert(encoding.reference.as_str(), None);
            for (k, level) in encoding.levels.iter().enumerate() {
                lookup.insert(level.as_str(), Some(offset + k));
            }

            for (row, record) in records.records().iter().enumerate() {
                let level = record.categorical[source].as_deref().ok_or_else(|| {
                    EncodingError::MissingValue {
                        covariate: encoding.covariate.clone(),
                        row,
                    }
                })?;
                match lookup.get(level) {
                    Some(Some(column)) => values[[row, *column]] = 1.0,
                    Some(None) => {}
                    None => {
                        return Err(EncodingError::UnseenLevel {
                            covariate: encoding.covariate.clone(),
                            level: level.to_string(),
                            row,
                        }
                        .into());
                    }
                }
            }
            offset += encoding.levels.len();
        }

        for covariate in &self.continuous {
            let source = position(records.continuous_names(), covariate)?;
            for (row, record) in records.records().iter().enumerate() {
                let value = record.continuous[source].ok_or_else(|| EncodingError::MissingValue {
                    covariate: covariate.clone(),
                    row,
                })?;
                if !value.is_finite() {
                    return Err(DataIntegrityError::NonFiniteDesign {
                        row,
                        column: covariate.clone(),
                        value,
                    }
                    .into());
                }
                values[[row, offset]] = value;
            }
            offset += 1;
        }

        Ok(DesignMatrix {
            values,
            schema: self.clone(),
        })
    }

    /// Fails unless `other` describes exactly the same column space.
    pub fn ensure_identical(&self, other: &FeatureSchema) -> Result<(), SchemaMismatchError> {
        if self == other {
            return Ok(());
        }
        let detail = if self.columns != other.columns {
            let first = self
                .columns
                .iter()
                .zip(other.columns.iter())
                .position(|(a, b)| a != b)
                .unwrap_or(self.columns.len().min(other.columns.len()));
            format!(
                "column lists diverge at position {first} ({} vs {} columns)",
                self.columns.len(),
                other.columns.len()
            )
        } else {
            let covariate = self
                .categorical
                .iter()
                .zip(other.categorical.iter())
                .find(|(a, b)| a != b)
                .map(|(a, _)| a.covariate.clone())
                .unwrap_or_default();
            format!("reference levels differ for covariate '{covariate}'")
        };
        Err(SchemaMismatchError { detail })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{EventStatus, SubjectRecord};

    fn cohort(levels: &[&str], ages: &[f64]) -> RecordSet {
        let records = levels
            .iter()
            .zip(ages)
            .map(|(level, &age)| SubjectRecord {
                cluster: "north".to_string(),
                time: 100.0,
                status: EventStatus::Censored,
                categorical: vec![Some(level.to_string())],
                continuous: vec![Some(age)],
            })
            .collect();
        RecordSet::new(vec!["grade".into()], vec!["age".into()], records).unwrap()
    }

    #[test]
    fn most_frequent_level_becomes_reference() {
        let records = cohort(&["g2", "g10", "g2", "g1"], &[50.0, 60.0, 70.0, 80.0]);
        let schema = FeatureSchema::fit(&records, &BTreeMap::new()).unwrap();
        assert_eq!(schema.categorical[0].reference, "g2");
        assert_eq!(schema.columns, vec!["grade_g1", "grade_g10", "age"]);
    }

    #[test]
    fn frequency_ties_resolve_in_natural_order() {
        let records = cohort(&["g10", "g9", "g10", "g9"], &[1.0, 2.0, 3.0, 4.0]);
        let schema = FeatureSchema::fit(&records, &BTreeMap::new()).unwrap();
        assert_eq!(schema.categorical[0].reference, "g9");
        assert_eq!(schema.categorical[0].levels, vec!["g10"]);
    }

    #[test]
    fn levels_equal_under_natord_still_order_the_same_way_every_time() {
        let levels = ["a b", "ab", "a  b", "z", "z", "z"];
        let records = cohort(&levels, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        for _ in 0..50 {
            let schema = FeatureSchema::fit(&records, &BTreeMap::new()).unwrap();
            assert_eq!(schema.categorical[0].reference, "z");
            assert_eq!(schema.columns, vec!["grade_a  b", "grade_a b", "grade_ab", "age"]);
        }

        let tied = cohort(&["ab", "a b", "ab", "a b"], &[1.0, 2.0, 3.0, 4.0]);
        for _ in 0..50 {
            let schema = FeatureSchema::fit(&tied, &BTreeMap::new()).unwrap();
            assert_eq!(schema.categorical[0].reference, "a b");
        }
        assert_eq!(level_order("g9", "g10"), Ordering::Less);
    }

    #[test]
    fn configured_reference_overrides_frequency() {
        let records = cohort(&["a", "a", "b"], &[1.0, 2.0, 3.0]);
        let overrides = BTreeMap::from([("grade".to_string(), "b".to_string())]);
        let schema = FeatureSchema::fit(&records, &overrides).unwrap();
        assert_eq!(schema.categorical[0].reference, "b");

        let missing = BTreeMap::from([("grade".to_string(), "z".to_string())]);
        assert!(FeatureSchema::fit(&records, &missing).is_err());
    }

    #[test]
    fn transform_produces_indicators() {
        let records = cohort(&["a", "a", "b", "c"], &[1.0, 2.0, 3.0, 4.0]);
        let schema = FeatureSchema::fit(&records, &BTreeMap::new()).unwrap();
        let design = schema.transform(&records).unwrap();
        assert_eq!(design.values.shape(), &[4, 3]);
        assert_eq!(design.values.row(0).to_vec(), vec![0.0, 0.0, 1.0]);
        assert_eq!(design.values.row(2).to_vec(), vec![1.0, 0.0, 3.0]);
        assert_eq!(design.values.row(3).to_vec(), vec![0.0, 1.0, 4.0]);
        assert_eq!(design.schema, schema);
    }

    #[test]
    fn unseen_level_fails_with_context() {
        let train = cohort(&["a", "b"], &[1.0, 2.0]);
        let schema = FeatureSchema::fit(&train, &BTreeMap::new()).unwrap();
        let test = cohort(&["a", "rare"], &[1.0, 2.0]);
        match schema.transform(&test) {
            Err(IecvError::Encoding(EncodingError::UnseenLevel {
                covariate,
                level,
                row,
            })) => {
                assert_eq!(covariate, "grade");
                assert_eq!(level, "rare");
                assert_eq!(row, 1);
            }
            other => panic!("expected unseen level error, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_continuous_value_is_rejected() {
        let records = cohort(&["a", "b"], &[1.0, f64::NAN]);
        let schema = FeatureSchema::fit(&records, &BTreeMap::new()).unwrap();
        assert!(matches!(
            schema.transform(&records),
            Err(IecvError::DataIntegrity(
                DataIntegrityError::NonFiniteDesign { row: 1, .. }
            ))
        ));
    }

    #[test]
    fn schemas_from_different_training_sets_are_not_identical() {
        let first = FeatureSchema::fit(&cohort(&["a", "a", "b"], &[1.0; 3]), &BTreeMap::new())
            .unwrap();
        let second = FeatureSchema::fit(&cohort(&["a", "b", "b"], &[1.0; 3]), &BTreeMap::new())
            .unwrap();
        assert!(first.ensure_identical(&first.clone()).is_ok());
        let err = second.ensure_identical(&first).unwrap_err();
        assert!(err.detail.contains("column lists") || err.detail.contains("reference"));
    }
}
