use crate::decision::{MAX_THRESHOLDS, ThresholdGrid};
use crate::error::IecvError;
use crate::trainer::PenaltySettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Column names of the outcome and the fixed-horizon settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeConfig {
    pub time_column: String,
    pub event_column: String,
    pub cluster_column: String,
    pub prediction_horizon_days: f64,
    pub administrative_censoring_days: f64,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            time_column: "time".to_string(),
            event_column: "status".to_string(),
            cluster_column: "region".to_string(),
            prediction_horizon_days: 2190.0,
            administrative_censoring_days: 2190.0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CovariateConfig {
    pub categorical: Vec<String>,
    pub continuous: Vec<String>,
    /// Optional reference level per categorical covariate.
    pub reference_levels: BTreeMap<String, String>,
}

/// Penalty settings per training context. Fold models default to ridge and the
/// final model to the lasso.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyConfig {
    pub final_alpha: f64,
    pub fold_alpha: f64,
    pub inner_folds: usize,
    pub nlambda: usize,
    pub lambda_min_ratio: f64,
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            final_alpha: 1.0,
            fold_alpha: 0.0,
            inner_folds: 5,
            nlambda: 50,
            lambda_min_ratio: 1e-3,
            tolerance: 1e-7,
            max_iterations: 100,
        }
    }
}

impl PenaltyConfig {
    fn settings(&self, alpha: f64) -> PenaltySettings {
        PenaltySettings {
            alpha,
            inner_folds: self.inner_folds,
            nlambda: self.nlambda,
            lambda_min_ratio: self.lambda_min_ratio,
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
        }
    }

    pub fn fold_settings(&self) -> PenaltySettings {
        self.settings(self.fold_alpha)
    }

    pub fn final_settings(&self) -> PenaltySettings {
        self.settings(self.final_alpha)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionCurveConfig {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl Default for DecisionCurveConfig {
    fn default() -> Self {
        Self {
            start: 0.0,
            stop: 0.99,
            step: 0.01,
        }
    }
}

impl DecisionCurveConfig {
    pub fn grid(&self) -> ThresholdGrid {
        ThresholdGrid::regular(self.start, self.stop, self.step)
    }
}

/// Full run configuration, read from TOML. Every field has a default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IecvConfig {
    pub seed: u64,
    pub parallel_folds: bool,
    pub outcome: OutcomeConfig,
    pub covariates: CovariateConfig,
    pub penalty: PenaltyConfig,
    pub decision_curve: DecisionCurveConfig,
}

impl Default for IecvConfig {
    fn default() -> Self {
        Self {
            seed: 20240101,
            parallel_folds: false,
            outcome: OutcomeConfig::default(),
            covariates: CovariateConfig::default(),
            penalty: PenaltyConfig::default(),
            decision_curve: DecisionCurveConfig::default(),
        }
    }
}

impl IecvConfig {
    pub fn load(path: &Path) -> Result<Self, IecvError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, IecvError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), IecvError> {
        let fail = |message: String| Err(IecvError::Config(message));
        if self.covariates.categorical.is_empty() && self.covariates.continuous.is_empty() {
            return fail(
                "at least one categorical or continuous covariate must be configured".into(),
            );
        }
        for (name, alpha) in [
            ("final_alpha", self.penalty.final_alpha),
            ("fold_alpha", self.penalty.fold_alpha),
        ] {
            if !(0.0..=1.0).contains(&alpha) {
                return fail(format!("penalty.{name} must lie in [0, 1], got {alpha}"));
            }
        }
        if self.penalty.inner_folds < 2 {
            return fail(format!(
                "penalty.inner_folds must be at least 2, got {}",
                self.penalty.inner_folds
            ));
        }
        if self.penalty.nlambda == 0 {
            return fail("penalty.nlambda must be positive".into());
        }
        if !(self.penalty.lambda_min_ratio > 0.0 && self.penalty.lambda_min_ratio < 1.0) {
            return fail(format!(
                "penalty.lambda_min_ratio must lie in (0, 1), got {}",
                self.penalty.lambda_min_ratio
            ));
        }
        if !(self.penalty.tolerance > 0.0) || self.penalty.max_iterations == 0 {
            return fail("penalty.tolerance and penalty.max_iterations must be positive".into());
        }
        for (name, days) in [
            ("prediction_horizon_days", self.outcome.prediction_horizon_days),
            ("administrative_censoring_days", self.outcome.administrative_censoring_days),
        ] {
            if !(days > 0.0 && days.is_finite()) {
                return fail(format!(
                    "outcome.{name} must be a positive number of days, got {days}"
                ));
            }
        }
        if self.decision_curve.grid().is_empty() {
            return fail(format!(
                "decision_curve must produce between 1 and {MAX_THRESHOLDS} thresholds in [0, 1)"
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for name in self
            .covariates
            .categorical
            .iter()
            .chain(&self.covariates.continuous)
        {
            if !seen.insert(name) {
                return fail(format!("covariate '{name}' is listed more than once"));
            }
        }
        for name in self.covariates.reference_levels.keys() {
            if !self.covariates.categorical.contains(name) {
                return fail(format!(
                    "reference level given for '{name}', which is not a categorical covariate"
                ));
            }
        }
        Ok(())
    }
}
