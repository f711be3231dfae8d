//! Elastic-net penalized Cox regression.
//!
//! The penalized objective is
//!
//! ```text
//! -loglik(beta) / n + lambda * (alpha * |beta|_1 + (1 - alpha) / 2 * |beta|_2^2)
//! ```
//!
//! minimized on internally standardized columns by proximal Newton steps: each
//! outer iteration builds the diagonal quadratic approximation of the Breslow
//! partial likelihood and solves it by cyclic coordinate descent with soft
//! thresholding. The penalty strength is chosen on a log-spaced path by
//! seeded k-fold cross-validation of Harrell's C.

use crate::encoder::{DesignMatrix, FeatureSchema};
use crate::error::{ConvergenceError, DataIntegrityError, IecvError};
use crate::metrics::concordance;
use crate::records::Outcomes;
use crate::survival::{BaselineHazard, RiskSets};
use ndarray::{Array1, Array2, Axis, Zip};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

const ALPHA_FLOOR: f64 = 1e-3;
const ZERO_VARIANCE: f64 = 1e-12;
const MAX_COORDINATE_SWEEPS: usize = 1000;
const MAX_STEP_HALVINGS: usize = 30;

/// Penalty path and optimizer settings for one training context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PenaltySettings {
    /// Elastic-net mixing: 1 is the lasso, 0 is ridge.
    pub alpha: f64,
    pub inner_folds: usize,
    pub nlambda: usize,
    pub lambda_min_ratio: f64,
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for PenaltySettings {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            inner_folds: 5,
            nlambda: 50,
            lambda_min_ratio: 1e-3,
            tolerance: 1e-7,
            max_iterations: 100,
        }
    }
}

/// A trained Cox model on the original covariate scale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub lambda: f64,
    pub alpha: f64,
    /// Mean held-out concordance at the selected lambda; NaN when the strength
    /// was fixed rather than cross-validated.
    pub cv_concordance: f64,
    pub coefficients: Array1<f64>,
    pub baseline: BaselineHazard,
    pub schema: FeatureSchema,
}

impl FittedModel {
    /// (column name, coefficient) pairs in design order.
    pub fn named_coefficients(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.schema
            .columns
            .iter()
            .map(String::as_str)
            .zip(self.coefficients.iter().copied())
    }

    /// Saves the model as TOML.
    pub fn save(&self, path: &Path) -> Result<(), IecvError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, IecvError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        if model.coefficients.len() != model.schema.n_columns() {
            return Err(DataIntegrityError::DimensionMismatch(format!(
                "saved model has {} coefficients for {} schema columns",
                model.coefficients.len(),
                model.schema.n_columns()
            ))
            .into());
        }
        Ok(model)
    }
}

/// Column centring and scaling; columns without variance are inactive.
struct Standardizer {
    mean: Array1<f64>,
    scale: Array1<f64>,
    active: Vec<bool>,
}

impl Standardizer {
    fn fit(x: &Array2<f64>) -> Self {
        let n = x.nrows().max(1) as f64;
        let mut mean = Array1::<f64>::zeros(x.ncols());
        let mut scale = Array1::<f64>::ones(x.ncols());
        let mut active = vec![false; x.ncols()];
        for (j, column) in x.axis_iter(Axis(1)).enumerate() {
            let m = column.sum() / n;
            let sd = (column.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n).sqrt();
            mean[j] = m;
            if sd > ZERO_VARIANCE {
                scale[j] = sd;
                active[j] = true;
            }
        }
        Self {
            mean,
            scale,
            active,
        }
    }

    fn apply(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut out = x - &self.mean;
        out /= &self.scale;
        for (j, &active) in self.active.iter().enumerate() {
            if !active {
                out.column_mut(j).fill(0.0);
            }
        }
        out
    }

    fn unscale(&self, beta: &Array1<f64>) -> Array1<f64> {
        Array1::from_iter(
            (0..beta.len()).map(|j| if self.active[j] { beta[j] / self.scale[j] } else { 0.0 }),
        )
    }
}

fn soft_threshold(z: f64, gamma: f64) -> f64 {
    if z > gamma {
        z - gamma
    } else if z < -gamma {
        z + gamma
    } else {
        0.0
    }
}

/// A standardized design with its risk sets, solved along a lambda path.
struct PathProblem<'a> {
    x: Array2<f64>,
    sets: RiskSets,
    active: &'a [bool],
    alpha: f64,
    tolerance: f64,
    max_iterations: usize,
}

impl<'a> PathProblem<'a> {
    fn new(
        x: Array2<f64>,
        outcomes: &Outcomes,
        active: &'a [bool],
        alpha: f64,
        settings: &PenaltySettings,
    ) -> Self {
        Self {
            x,
            sets: RiskSets::new(outcomes),
            active,
            alpha,
            tolerance: settings.tolerance,
            max_iterations: settings.max_iterations,
        }
    }

    fn penalty(&self, beta: &Array1<f64>, lambda: f64) -> f64 {
        let l1: f64 = beta.iter().map(|b| b.abs()).sum();
        let l2: f64 = beta.iter().map(|b| b * b).sum();
        lambda * (self.alpha * l1 + 0.5 * (1.0 - self.alpha) * l2)
    }

    fn objective(&self, beta: &Array1<f64>, lambda: f64) -> f64 {
        let eta = self.x.dot(beta);
        let n = self.x.nrows() as f64;
        -self.sets.log_likelihood(eta.view()) / n + self.penalty(beta, lambda)
    }

    /// Smallest lambda at which every coefficient is zero.
    fn lambda_max(&self) -> f64 {
        let n = self.x.nrows() as f64;
        let state = self.sets.working_state(Array1::<f64>::zeros(self.x.nrows()).view());
        let score = self.x.t().dot(&state.gradient);
        let largest = score
            .iter()
            .zip(self.active)
            .filter(|(_, active)| **active)
            .fold(0.0_f64, |m, (g, _)| m.max(g.abs()));
        largest / n / self.alpha.max(ALPHA_FLOOR)
    }

    /// One sweep-until-stable coordinate descent on the quadratic model built
    /// at `beta`. Returns the minimizer of the penalized quadratic.
    fn coordinate_descent(&self, beta: &Array1<f64>, lambda: f64) -> Array1<f64> {
        let n = self.x.nrows() as f64;
        let eta = self.x.dot(beta);
        let state = self.sets.working_state(eta.view());
        let curvature: Vec<f64> = self
            .x
            .axis_iter(Axis(1))
            .map(|column| {
                Zip::from(&column)
                    .and(&state.weight)
                    .fold(0.0, |acc, &x, &w| acc + w * x * x)
                    / n
            })
            .collect();

        // Gradient of the quadratic model with respect to eta, kept in step
        // with every coordinate update.
        let mut residual = state.gradient;
        let mut candidate = beta.clone();
        for sweep in 0..MAX_COORDINATE_SWEEPS {
            let mut largest_step = 0.0_f64;
            for j in 0..candidate.len() {
                if !self.active[j] {
                    continue;
                }
                let denominator = curvature[j] + lambda * (1.0 - self.alpha);
                if denominator <= f64::EPSILON {
                    continue;
                }
                let column = self.x.column(j);
                let numerator = column.dot(&residual) / n + curvature[j] * candidate[j];
                let updated = soft_threshold(numerator, lambda * self.alpha) / denominator;
                let step = updated - candidate[j];
                if step != 0.0 {
                    Zip::from(&mut residual)
                        .and(&column)
                        .and(&state.weight)
                        .for_each(|r, &x, &w| *r -= w * x * step);
                    candidate[j] = updated;
                    largest_step = largest_step.max(step.abs());
                }
            }
            if largest_step < self.tolerance {
                log::debug!("coordinate descent settled after {} sweep(s)", sweep + 1);
                break;
            }
        }
        candidate
    }

    fn solve(&self, lambda: f64, start: &Array1<f64>) -> Result<Array1<f64>, ConvergenceError> {
        let mut beta = start.clone();
        let mut current = self.objective(&beta, lambda);
        let mut last_change = f64::INFINITY;

        for iteration in 0..self.max_iterations {
            let target = self.coordinate_descent(&beta, lambda);
            let direction = &target - &beta;

            let mut step = 1.0;
            let mut proposal = target;
            let mut value = self.objective(&proposal, lambda);
            let allowed = current + 1e-12 * current.abs().max(1.0);
            let mut halvings = 0;
            while !(value <= allowed) && halvings < MAX_STEP_HALVINGS {
                step *= 0.5;
                halvings += 1;
                proposal = &beta + &(&direction * step);
                value = self.objective(&proposal, lambda);
            }
            if !(value <= allowed) {
                log::warn!(
                    "Step halving could not reduce the penalized objective at lambda={lambda:.4e}; keeping the iterate from step {iteration}"
                );
                return Ok(beta);
            }
            if halvings > 0 {
                log::debug!(
                    "lambda={lambda:.4e}: step halved {halvings} time(s) at iteration {iteration}"
                );
            }

            last_change = (&proposal - &beta).iter().fold(0.0_f64, |m, v| m.max(v.abs()));
            let decrease = current - value;
            beta = proposal;
            current = value;
            log::debug!(
                "lambda={lambda:.4e} iteration {iteration}: objective {current:.10}, max change {last_change:.3e}"
            );
            if last_change < self.tolerance
                || decrease <= 1e-3 * self.tolerance * (1.0 + current.abs())
            {
                return Ok(beta);
            }
        }

        Err(ConvergenceError::IterationLimit {
            iterations: self.max_iterations,
            lambda,
            change: last_change,
        })
    }

    /// Warm-started solutions for every lambda of a decreasing path.
    fn solve_path(&self, lambdas: &[f64]) -> Result<Vec<Array1<f64>>, ConvergenceError> {
        let mut beta = Array1::<f64>::zeros(self.x.ncols());
        let mut path = Vec::with_capacity(lambdas.len());
        for &lambda in lambdas {
            beta = self.solve(lambda, &beta)?;
            path.push(beta.clone());
        }
        Ok(path)
    }
}

/// Log-spaced decreasing path from `lambda_max` to `lambda_max * ratio`.
pub fn lambda_path(lambda_max: f64, nlambda: usize, ratio: f64) -> Vec<f64> {
    if nlambda <= 1 {
        return vec![lambda_max];
    }
    let last = (nlambda - 1) as f64;
    (0..nlambda)
        .map(|k| lambda_max * ratio.powf(k as f64 / last))
        .collect()
}

/// Subject-to-fold assignment from a seeded shuffle.
pub fn inner_fold_assignment(n: usize, folds: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rng);
    let mut assignment = vec![0; n];
    for (position, &subject) in order.iter().enumerate() {
        assignment[subject] = position % folds.max(1);
    }
    assignment
}

struct Prepared {
    standardizer: Standardizer,
    x: Array2<f64>,
}

fn prepare(design: &DesignMatrix, outcomes: &Outcomes) -> Result<Prepared, IecvError> {
    if design.nrows() != outcomes.len() {
        return Err(DataIntegrityError::DimensionMismatch(format!(
            "design has {} rows but outcomes describe {} subjects",
            design.nrows(),
            outcomes.len()
        ))
        .into());
    }
    let rank_deficient = |reason: &str| -> IecvError {
        DataIntegrityError::RankDeficient {
            rows: design.nrows(),
            columns: design.ncols(),
            reason: reason.to_string(),
        }
        .into()
    };
    if outcomes.n_events() == 0 {
        return Err(rank_deficient("the training outcome has no events"));
    }
    let standardizer = Standardizer::fit(&design.values);
    if !standardizer.active.iter().any(|&a| a) {
        return Err(rank_deficient("no column carries variance"));
    }
    let x = standardizer.apply(&design.values);
    Ok(Prepared { standardizer, x })
}

fn finish(
    design: &DesignMatrix,
    outcomes: &Outcomes,
    prepared: &Prepared,
    beta: &Array1<f64>,
    lambda: f64,
    alpha: f64,
    cv_concordance: f64,
) -> Result<FittedModel, IecvError> {
    let coefficients = prepared.standardizer.unscale(beta);
    let eta = design.values.dot(&coefficients);
    let baseline = RiskSets::new(outcomes).breslow(eta.view());
    if coefficients.iter().any(|v| !v.is_finite()) || !baseline.is_finite() {
        return Err(DataIntegrityError::RankDeficient {
            rows: design.nrows(),
            columns: design.ncols(),
            reason: "the fitted coefficients are not finite".to_string(),
        }
        .into());
    }
    Ok(FittedModel {
        lambda,
        alpha,
        cv_concordance,
        coefficients,
        baseline,
        schema: design.schema.clone(),
    })
}

/// Index of the lambda with the highest event-weighted mean held-out
/// concordance, and that concordance. Ties keep the larger lambda.
fn select_lambda(
    x: &Array2<f64>,
    outcomes: &Outcomes,
    active: &[bool],
    lambdas: &[f64],
    settings: &PenaltySettings,
    seed: u64,
) -> Result<(usize, f64), IecvError> {
    let n = outcomes.len();
    let folds = settings.inner_folds.min(n).max(1);
    let assignment = inner_fold_assignment(n, folds, seed);
    let mut score = vec![0.0; lambdas.len()];
    let mut total_weight = 0.0;

    for fold in 0..folds {
        let (held, train): (Vec<usize>, Vec<usize>) = (0..n).partition(|&i| assignment[i] == fold);
        let train_outcomes = outcomes.select(&train);
        let held_outcomes = outcomes.select(&held);
        if train_outcomes.n_events() == 0 {
            log::warn!("Inner fold {fold}: training part has no events; skipped");
            continue;
        }
        let baseline_pairs = concordance(&held_outcomes, Array1::<f64>::zeros(held.len()).view());
        if baseline_pairs.comparable == 0.0 {
            log::warn!("Inner fold {fold}: held-out part has no comparable pairs; skipped");
            continue;
        }

        let problem = PathProblem::new(
            x.select(Axis(0), &train),
            &train_outcomes,
            active,
            settings.alpha,
            settings,
        );
        let x_held = x.select(Axis(0), &held);
        let path = problem.solve_path(lambdas)?;
        let events = held_outcomes.n_events() as f64;
        for (slot, beta) in score.iter_mut().zip(&path) {
            *slot += events * concordance(&held_outcomes, x_held.dot(beta).view()).c;
        }
        total_weight += events;
        log::debug!("Inner fold {fold}: {} training rows, {} held-out events", train.len(), events);
    }

    if total_weight <= 0.0 {
        return Err(ConvergenceError::NoUsableInnerFold { folds }.into());
    }
    let mut best = 0;
    for k in 1..lambdas.len() {
        if score[k] > score[best] {
            best = k;
        }
    }
    Ok((best, score[best] / total_weight))
}

/// Fits the penalized Cox model with the penalty strength chosen by internal
/// cross-validation, then refits on all rows at that strength.
pub fn train(
    design: &DesignMatrix,
    outcomes: &Outcomes,
    settings: &PenaltySettings,
    seed: u64,
) -> Result<FittedModel, IecvError> {
    let prepared = prepare(design, outcomes)?;
    let problem = PathProblem::new(
        prepared.x.clone(),
        outcomes,
        &prepared.standardizer.active,
        settings.alpha,
        settings,
    );
    let lambdas = lambda_path(problem.lambda_max(), settings.nlambda, settings.lambda_min_ratio);
    let (selected, cv_concordance) = select_lambda(
        &prepared.x,
        outcomes,
        &prepared.standardizer.active,
        &lambdas,
        settings,
        seed,
    )?;
    let lambda = lambdas[selected];
    log::info!(
        "Selected lambda={lambda:.4e} (path position {}/{}, alpha={}, cross-validated C={cv_concordance:.4})",
        selected + 1,
        lambdas.len(),
        settings.alpha
    );

    let path = problem.solve_path(&lambdas[..=selected])?;
    let beta = path
        .last()
        .cloned()
        .unwrap_or_else(|| Array1::zeros(design.ncols()));
    finish(design, outcomes, &prepared, &beta, lambda, settings.alpha, cv_concordance)
}

/// Fits at a fixed penalty strength without cross-validation. `lambda = 0`
/// gives the unpenalized partial-likelihood estimate.
pub fn fit_at_strength(
    design: &DesignMatrix,
    outcomes: &Outcomes,
    lambda: f64,
    settings: &PenaltySettings,
) -> Result<FittedModel, IecvError> {
    let prepared = prepare(design, outcomes)?;
    let problem = PathProblem::new(
        prepared.x.clone(),
        outcomes,
        &prepared.standardizer.active,
        settings.alpha,
        settings,
    );
    let beta = problem.solve(lambda, &Array1::zeros(design.ncols()))?;
    finish(design, outcomes, &prepared, &beta, lambda, settings.alpha, f64::NAN)
}
