//! Error taxonomy shared by every stage of the validation pipeline.
//!
//! Each kind maps to one failure class: data that cannot be modelled at all,
//! encodings that cannot be reproduced on new records, schema drift between
//! training and projection, and penalty-path selection that does not settle.
//! Only [`ConvergenceError`] is fold-local; everything else aborts a run.

use crate::records::EventStatus;
use thiserror::Error;

/// Input data that no downstream statistic can be trusted on.
#[derive(Debug, Error)]
pub enum DataIntegrityError {
    #[error("row {row}: the cluster identifier is missing or empty")]
    MissingCluster { row: usize },
    #[error("row {row}: event time {time} must be finite and strictly positive")]
    InvalidEventTime { row: usize, time: f64 },
    #[error(
        "row {row}: event indicator {status:?} is not binary; competing events must be merged into censoring before modelling"
    )]
    NonBinaryEvent { row: usize, status: EventStatus },
    #[error("row {row}: expected {expected} {kind} covariate values, found {found}")]
    CovariateWidth {
        row: usize,
        kind: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("design matrix holds non-finite value {value} at row {row}, column '{column}'")]
    NonFiniteDesign {
        row: usize,
        column: String,
        value: f64,
    },
    #[error(
        "fold '{cluster}': the training set has {events} events and {censored} censored subjects out of {rows}; both must be non-zero"
    )]
    DegenerateFold {
        cluster: String,
        rows: usize,
        events: usize,
        censored: usize,
    },
    #[error("at least two clusters are required for internal-external validation, found {0}")]
    TooFewClusters(usize),
    #[error(
        "design matrix with {rows} rows and {columns} columns admits no finite coefficient estimate: {reason}"
    )]
    RankDeficient {
        rows: usize,
        columns: usize,
        reason: String,
    },
    #[error("imputation contract violated: {0}")]
    ImputationContract(String),
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
}

/// A record set that cannot be encoded with a fitted schema.
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error(
        "row {row}: level '{level}' of categorical covariate '{covariate}' was not present when the schema was fitted; pool rare levels upstream"
    )]
    UnseenLevel {
        covariate: String,
        level: String,
        row: usize,
    },
    #[error("row {row}: covariate '{covariate}' is missing; impute before encoding")]
    MissingValue { covariate: String, row: usize },
    #[error("covariate '{0}' is not present in the record set")]
    UnknownCovariate(String),
    #[error("categorical covariate '{0}' has no observed level in the training records")]
    NoObservedLevel(String),
    #[error("reference level '{level}' requested for '{covariate}' is not an observed level")]
    UnknownReference { covariate: String, level: String },
}

/// The schema presented at projection time differs from the one the model was fitted under.
#[derive(Debug, Error)]
#[error("projection schema differs from the training schema: {detail}")]
pub struct SchemaMismatchError {
    pub detail: String,
}

/// Penalty selection or an auxiliary likelihood fit failed to settle.
#[derive(Debug, Error)]
pub enum ConvergenceError {
    #[error("none of the {folds} inner cross-validation folds could score a penalty strength")]
    NoUsableInnerFold { folds: usize },
    #[error(
        "coordinate descent did not converge within {iterations} iterations at lambda={lambda:.6e} (last change {change:.3e})"
    )]
    IterationLimit {
        iterations: usize,
        lambda: f64,
        change: f64,
    },
    #[error("{routine} did not converge within {iterations} Newton iterations")]
    AuxiliaryFit {
        routine: &'static str,
        iterations: usize,
    },
}

/// The input table does not have the expected shape.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("column '{0}' not found in the input table")]
    ColumnNotFound(String),
    #[error("column '{column}' could not be read as {expected}; found {found}")]
    ColumnWrongType {
        column: String,
        expected: &'static str,
        found: String,
    },
    #[error("column '{0}' contains missing values, which are only allowed in covariates")]
    MissingValues(String),
    #[error("row {row}: event code {code} in column '{column}' is not 0, 1 or 2")]
    InvalidEventCode { column: String, row: usize, code: i64 },
}

/// Top-level error for a validation run.
#[derive(Debug, Error)]
pub enum IecvError {
    #[error("data integrity error: {0}")]
    DataIntegrity(#[from] DataIntegrityError),
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatchError),
    #[error("convergence error: {0}")]
    Convergence(#[from] ConvergenceError),
    #[error("fold '{cluster}' ({rows} training rows): {source}")]
    Fold {
        cluster: String,
        rows: usize,
        #[source]
        source: Box<IecvError>,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("input error: {0}")]
    Input(#[from] InputError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to read input table: {0}")]
    Polars(#[from] polars::prelude::PolarsError),
    #[error("failed to write output table: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("failed to parse TOML: {0}")]
    TomlDeserialize(#[from] toml::de::Error),
}

impl IecvError {
    /// Attach the fold identifier and training size to an error raised inside a fold.
    pub fn in_fold(self, cluster: &str, rows: usize) -> Self {
        match self {
            already @ IecvError::Fold { .. } => already,
            other => IecvError::Fold {
                cluster: cluster.to_string(),
                rows,
                source: Box::new(other),
            },
        }
    }

    /// Whether the failure is confined to the fold that raised it.
    pub fn is_fold_local(&self) -> bool {
        match self {
            IecvError::Convergence(_) => true,
            IecvError::Fold { source, .. } => source.is_fold_local(),
            _ => false,
        }
    }
}
