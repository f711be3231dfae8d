use crate::error::{DataIntegrityError, IecvError};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Raw event indicator as recorded in the registry extract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    Censored,
    Primary,
    Competing,
}

impl EventStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Censored),
            1 => Some(Self::Primary),
            2 => Some(Self::Competing),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Censored => 0,
            Self::Primary => 1,
            Self::Competing => 2,
        }
    }
}

/// One subject: covariates, cluster membership and follow-up.
#[derive(Clone, Debug, PartialEq)]
pub struct SubjectRecord {
    pub cluster: String,
    pub time: f64,
    pub status: EventStatus,
    pub categorical: Vec<Option<String>>,
    pub continuous: Vec<Option<f64>>,
}

/// A cohort with named covariate columns. Covariate vectors of every record are
/// aligned with `categorical_names` and `continuous_names`.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordSet {
    categorical_names: Vec<String>,
    continuous_names: Vec<String>,
    records: Vec<SubjectRecord>,
}

impl RecordSet {
    pub fn new(
        categorical_names: Vec<String>,
        continuous_names: Vec<String>,
        records: Vec<SubjectRecord>,
    ) -> Result<Self, IecvError> {
        for (row, record) in records.iter().enumerate() {
            if record.cluster.trim().is_empty() {
                return Err(DataIntegrityError::MissingCluster { row }.into());
            }
            if record.categorical.len() != categorical_names.len() {
                return Err(DataIntegrityError::CovariateWidth {
                    row,
                    kind: "categorical",
                    expected: categorical_names.len(),
                    found: record.categorical.len(),
                }
                .into());
            }
            if record.continuous.len() != continuous_names.len() {
                return Err(DataIntegrityError::CovariateWidth {
                    row,
                    kind: "continuous",
                    expected: continuous_names.len(),
                    found: record.continuous.len(),
                }
                .into());
            }
        }
        Ok(Self {
            categorical_names,
            continuous_names,
            records,
        })
    }

    pub fn categorical_names(&self) -> &[String] {
        &self.categorical_names
    }

    pub fn continuous_names(&self) -> &[String] {
        &self.continuous_names
    }

    pub fn records(&self) -> &[SubjectRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows at `indices`, in the given order.
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            categorical_names: self.categorical_names.clone(),
            continuous_names: self.continuous_names.clone(),
            records: indices.iter().map(|&i| self.records[i].clone()).collect(),
        }
    }

    /// True when no covariate value is missing.
    pub fn is_complete(&self) -> bool {
        self.records.iter().all(|record| {
            record.categorical.iter().all(Option::is_some)
                && record.continuous.iter().all(Option::is_some)
        })
    }

    /// Checks the modelling invariants: finite positive times and a binary
    /// event indicator.
    pub fn validate_outcomes(&self) -> Result<(), IecvError> {
        for (row, record) in self.records.iter().enumerate() {
            if !record.time.is_finite() || record.time <= 0.0 {
                return Err(DataIntegrityError::InvalidEventTime {
                    row,
                    time: record.time,
                }
                .into());
            }
            if record.status == EventStatus::Competing {
                return Err(DataIntegrityError::NonBinaryEvent {
                    row,
                    status: record.status,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Binary survival outcome vectors. Fails on the first invariant breach.
    pub fn outcomes(&self) -> Result<Outcomes, IecvError> {
        self.validate_outcomes()?;
        let time = self.records.iter().map(|r| r.time).collect();
        let event = self
            .records
            .iter()
            .map(|r| u8::from(r.status == EventStatus::Primary))
            .collect();
        Ok(Outcomes { time, event })
    }
}

/// Follow-up time and a 0/1 event indicator per subject.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcomes {
    pub time: Array1<f64>,
    pub event: Array1<u8>,
}

impl Outcomes {
    pub fn new(time: Array1<f64>, event: Array1<u8>) -> Result<Self, IecvError> {
        if time.len() != event.len() {
            return Err(DataIntegrityError::DimensionMismatch(format!(
                "{} event times but {} event indicators",
                time.len(),
                event.len()
            ))
            .into());
        }
        for (row, (&t, &e)) in time.iter().zip(event.iter()).enumerate() {
            if !t.is_finite() || t <= 0.0 {
                return Err(DataIntegrityError::InvalidEventTime { row, time: t }.into());
            }
            if e > 1 {
                return Err(DataIntegrityError::NonBinaryEvent {
                    row,
                    status: EventStatus::Competing,
                }
                .into());
            }
        }
        Ok(Self { time, event })
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn n_events(&self) -> usize {
        self.event.iter().filter(|&&e| e == 1).count()
    }

    pub fn n_censored(&self) -> usize {
        self.len() - self.n_events()
    }

    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            time: indices.iter().map(|&i| self.time[i]).collect(),
            event: indices.iter().map(|&i| self.event[i]).collect(),
        }
    }
}

/// Merges competing events into censoring and censors follow-up beyond
/// `admin_horizon` days at the horizon.
pub fn prepare_outcomes(records: &RecordSet, admin_horizon: f64) -> RecordSet {
    let mut merged = 0usize;
    let mut truncated = 0usize;
    let prepared = records
        .records
        .iter()
        .map(|record| {
            let mut record = record.clone();
            if record.status == EventStatus::Competing {
                record.status = EventStatus::Censored;
                merged += 1;
            }
            if record.time > admin_horizon {
                record.time = admin_horizon;
                record.status = EventStatus::Censored;
                truncated += 1;
            }
            record
        })
        .collect();
    log::info!(
        "Outcome preparation: {merged} competing events merged into censoring, {truncated} subjects censored at {admin_horizon} days."
    );
    RecordSet {
        categorical_names: records.categorical_names.clone(),
        continuous_names: records.continuous_names.clone(),
        records: prepared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cluster: &str, time: f64, status: EventStatus) -> SubjectRecord {
        SubjectRecord {
            cluster: cluster.to_string(),
            time,
            status,
            categorical: vec![Some("a".to_string())],
            continuous: vec![Some(1.0)],
        }
    }

    fn set(records: Vec<SubjectRecord>) -> RecordSet {
        RecordSet::new(vec!["sex".into()], vec!["age".into()], records).unwrap()
    }

    #[test]
    fn empty_cluster_is_rejected() {
        let err = RecordSet::new(
            vec!["sex".into()],
            vec!["age".into()],
            vec![record(" ", 10.0, EventStatus::Primary)],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            IecvError::DataIntegrity(DataIntegrityError::MissingCluster { row: 0 })
        ));
    }

    #[test]
    fn covariate_width_is_checked() {
        let mut bad = record("a", 10.0, EventStatus::Primary);
        bad.continuous.push(Some(2.0));
        let err = RecordSet::new(vec!["sex".into()], vec!["age".into()], vec![bad]).unwrap_err();
        assert!(err.to_string().contains("continuous"));
    }

    #[test]
    fn competing_events_block_outcomes_until_prepared() {
        let records = set(vec![
            record("a", 10.0, EventStatus::Primary),
            record("a", 20.0, EventStatus::Competing),
            record("b", 3000.0, EventStatus::Primary),
        ]);
        assert!(records.outcomes().is_err());

        let prepared = prepare_outcomes(&records, 2190.0);
        let outcomes = prepared.outcomes().unwrap();
        assert_eq!(outcomes.event.to_vec(), vec![1, 0, 0]);
        assert_eq!(outcomes.time.to_vec(), vec![10.0, 20.0, 2190.0]);
        assert_eq!(outcomes.n_events(), 1);
        assert_eq!(outcomes.n_censored(), 2);
    }

    #[test]
    fn non_positive_times_are_rejected() {
        let records = set(vec![record("a", 0.0, EventStatus::Censored)]);
        assert!(matches!(
            records.outcomes(),
            Err(IecvError::DataIntegrity(
                DataIntegrityError::InvalidEventTime { row: 0, .. }
            ))
        ));
    }

    #[test]
    fn subset_keeps_order_and_names() {
        let records = set(vec![
            record("a", 1.0, EventStatus::Primary),
            record("b", 2.0, EventStatus::Censored),
            record("c", 3.0, EventStatus::Censored),
        ]);
        let picked = records.subset(&[2, 0]);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked.records()[0].cluster, "c");
        assert_eq!(picked.records()[1].cluster, "a");
        assert_eq!(picked.categorical_names(), records.categorical_names());
    }
}
