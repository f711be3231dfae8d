//! Reading a subject-level cohort table into a [`RecordSet`].
//!
//! Column lookup is case-insensitive. Outcome and cluster columns must be
//! complete; covariate columns may contain nulls, which become missing values
//! for the imputation step.

use crate::config::IecvConfig;
use crate::error::{DataIntegrityError, IecvError, InputError};
use crate::records::{EventStatus, RecordSet, SubjectRecord};
use ahash::AHashMap;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;

fn read_table(path: &Path) -> Result<DataFrame, IecvError> {
    let separator = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("csv") => b',',
        _ => b'\t',
    };
    let file = File::open(path)?;
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .map_parse_options(|options| options.with_separator(separator))
        .into_reader_with_file_handle(file)
        .finish()?;
    Ok(df)
}

struct Columns<'a> {
    df: &'a DataFrame,
    by_lowercase: AHashMap<String, String>,
}

impl<'a> Columns<'a> {
    fn new(df: &'a DataFrame) -> Self {
        let by_lowercase = df
            .get_column_names()
            .into_iter()
            .map(|name| (name.as_str().to_ascii_lowercase(), name.as_str().to_string()))
            .collect();
        Self { df, by_lowercase }
    }

    fn cast(
        &self,
        key: &str,
        dtype: DataType,
        expected: &'static str,
    ) -> Result<(String, Column), IecvError> {
        let actual = self
            .by_lowercase
            .get(&key.to_ascii_lowercase())
            .ok_or_else(|| InputError::ColumnNotFound(key.to_string()))?;
        let column = self
            .df
            .column(actual)
            .map_err(|_| InputError::ColumnNotFound(actual.clone()))?;
        let casted = column.cast(&dtype).map_err(|_| InputError::ColumnWrongType {
            column: actual.clone(),
            expected,
            found: column.dtype().to_string(),
        })?;
        if casted.null_count() > column.null_count() {
            return Err(InputError::ColumnWrongType {
                column: actual.clone(),
                expected,
                found: column.dtype().to_string(),
            }
            .into());
        }
        Ok((actual.clone(), casted))
    }

    fn floats(&self, key: &str) -> Result<Vec<Option<f64>>, IecvError> {
        let (_, column) = self.cast(key, DataType::Float64, "a number")?;
        Ok(column.f64()?.into_iter().collect())
    }

    fn strings(&self, key: &str) -> Result<Vec<Option<String>>, IecvError> {
        let (_, column) = self.cast(key, DataType::String, "text")?;
        Ok(column
            .str()?
            .into_iter()
            .map(|value| value.map(str::to_string))
            .collect())
    }

    fn required_floats(&self, key: &str) -> Result<Vec<f64>, IecvError> {
        self.floats(key)?
            .into_iter()
            .map(|value| value.ok_or_else(|| InputError::MissingValues(key.to_string()).into()))
            .collect()
    }

    fn event_codes(&self, key: &str) -> Result<Vec<EventStatus>, IecvError> {
        let (actual, column) = self.cast(key, DataType::Int64, "an integer")?;
        column
            .i64()?
            .into_iter()
            .enumerate()
            .map(|(row, code)| -> Result<EventStatus, IecvError> {
                let code = code.ok_or_else(|| InputError::MissingValues(actual.clone()))?;
                let status =
                    EventStatus::from_code(code).ok_or_else(|| InputError::InvalidEventCode {
                        column: actual.clone(),
                        row,
                        code,
                    })?;
                Ok(status)
            })
            .collect()
    }
}

/// Loads the configured outcome, cluster and covariate columns.
pub fn load_records(path: &Path, config: &IecvConfig) -> Result<RecordSet, IecvError> {
    let df = read_table(path)?;
    let columns = Columns::new(&df);
    let outcome = &config.outcome;

    let time = columns.required_floats(&outcome.time_column)?;
    let status = columns.event_codes(&outcome.event_column)?;
    let cluster = columns.strings(&outcome.cluster_column)?;
    let categorical = config
        .covariates
        .categorical
        .iter()
        .map(|name| columns.strings(name))
        .collect::<Result<Vec<_>, _>>()?;
    let continuous = config
        .covariates
        .continuous
        .iter()
        .map(|name| columns.floats(name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let cluster = cluster[row]
            .clone()
            .ok_or(DataIntegrityError::MissingCluster { row })?;
        records.push(SubjectRecord {
            cluster,
            time: time[row],
            status: status[row],
            categorical: categorical.iter().map(|values| values[row].clone()).collect(),
            continuous: continuous.iter().map(|values| values[row]).collect(),
        });
    }
    log::info!(
        "Loaded {} subjects with {} categorical and {} continuous covariates from {}",
        records.len(),
        categorical.len(),
        continuous.len(),
        path.display()
    );

    RecordSet::new(
        config.covariates.categorical.clone(),
        config.covariates.continuous.clone(),
        records,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config() -> IecvConfig {
        let mut config = IecvConfig::default();
        config.covariates.categorical = vec!["smoking".into()];
        config.covariates.continuous = vec!["age".into()];
        config
    }

    #[test]
    fn reads_tab_separated_cohort_with_missing_covariates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cohort.tsv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "Region\ttime\tstatus\tsmoking\tage").unwrap();
        writeln!(file, "north\t100.5\t1\tnever\t54.0").unwrap();
        writeln!(file, "south\t2400\t2\t\t61.5").unwrap();
        writeln!(file, "north\t30\t0\tcurrent\t").unwrap();
        drop(file);

        let records = load_records(&path, &config()).unwrap();
        assert_eq!(records.len(), 3);
        let second = &records.records()[1];
        assert_eq!(second.cluster, "south");
        assert_eq!(second.status, EventStatus::Competing);
        assert_eq!(second.categorical[0], None);
        assert_eq!(records.records()[2].continuous[0], None);
        assert!(!records.is_complete());
    }

    #[test]
    fn rejects_unknown_event_codes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cohort.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "region,time,status,smoking,age").unwrap();
        writeln!(file, "north,100,3,never,54").unwrap();
        drop(file);

        let err = load_records(&path, &config()).unwrap_err();
        assert!(matches!(err, IecvError::Input(InputError::InvalidEventCode { code: 3, .. })));
    }

    #[test]
    fn missing_column_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cohort.tsv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "region\ttime\tstatus\tage").unwrap();
        writeln!(file, "north\t100\t1\t54").unwrap();
        drop(file);

        let err = load_records(&path, &config()).unwrap_err();
        assert!(err.to_string().contains("smoking"));
    }
}
