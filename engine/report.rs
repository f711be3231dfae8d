//! Output tables and the pooled cross-cluster summary.

use crate::decision::Strategy;
use crate::error::IecvError;
use crate::orchestrator::{FoldEvaluation, FoldOutcome, IecvReport};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoefficientRow {
    pub column: String,
    pub coefficient: f64,
    pub hazard_ratio: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApparentRow {
    pub c_index: f64,
    pub c_index_se: f64,
    pub held_out_cluster: String,
    pub n_train: usize,
    pub events_train: usize,
    pub n_test: usize,
    pub events_test: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalRow {
    pub c_index: f64,
    pub c_index_se: f64,
    pub held_out_cluster: String,
    pub n_train: usize,
    pub events_train: usize,
    pub n_test: usize,
    pub events_test: usize,
    pub calibration_in_the_large: f64,
    pub calibration_slope: f64,
    pub cox_calibration_slope: f64,
    pub brier: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionCurveRow {
    pub held_out_cluster: String,
    pub threshold: f64,
    pub net_benefit: f64,
    pub strategy: Strategy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedFoldRow {
    pub held_out_cluster: String,
    pub n_train: usize,
    pub error: String,
}

/// Coefficients of the final model with hazard ratios, both rounded to three decimals.
pub fn coefficient_rows(report: &IecvReport) -> Vec<CoefficientRow> {
    report
        .final_model
        .model
        .named_coefficients()
        .map(|(column, coefficient)| CoefficientRow {
            column: column.to_string(),
            coefficient: round3(coefficient),
            hazard_ratio: round3(coefficient.exp()),
        })
        .collect()
}

pub fn apparent_rows(report: &IecvReport) -> Vec<ApparentRow> {
    report
        .completed()
        .map(|fold| ApparentRow {
            c_index: fold.apparent.concordance.c,
            c_index_se: fold.apparent.concordance.se,
            held_out_cluster: fold.cluster.clone(),
            n_train: fold.n_train,
            events_train: fold.events_train,
            n_test: fold.n_test,
            events_test: fold.events_test,
        })
        .collect()
}

pub fn external_rows(report: &IecvReport) -> Vec<ExternalRow> {
    report
        .completed()
        .map(|fold| ExternalRow {
            c_index: fold.external.concordance.c,
            c_index_se: fold.external.concordance.se,
            held_out_cluster: fold.cluster.clone(),
            n_train: fold.n_train,
            events_train: fold.events_train,
            n_test: fold.n_test,
            events_test: fold.events_test,
            calibration_in_the_large: fold.external.horizon_calibration.calibration_in_the_large,
            calibration_slope: fold.external.horizon_calibration.slope,
            cox_calibration_slope: fold.external.cox_calibration.slope,
            brier: fold.external.brier,
        })
        .collect()
}

pub fn decision_curve_rows(report: &IecvReport) -> Vec<DecisionCurveRow> {
    report
        .completed()
        .flat_map(|fold| {
            fold.decision_curve.iter().map(move |point| DecisionCurveRow {
                held_out_cluster: fold.cluster.clone(),
                threshold: point.threshold,
                net_benefit: point.net_benefit,
                strategy: point.strategy,
            })
        })
        .collect()
}

pub fn failed_fold_rows(report: &IecvReport) -> Vec<FailedFoldRow> {
    report
        .failed()
        .filter_map(|outcome| match outcome {
            FoldOutcome::Failed {
                cluster,
                n_train,
                error,
            } => Some(FailedFoldRow {
                held_out_cluster: cluster.clone(),
                n_train: *n_train,
                error: error.to_string(),
            }),
            FoldOutcome::Completed(_) => None,
        })
        .collect()
}

/// Fixed-effect and DerSimonian–Laird random-effects pooling of per-fold C.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PooledConcordance {
    pub folds: usize,
    pub fixed_effect: f64,
    pub fixed_effect_se: f64,
    pub random_effects: f64,
    pub random_effects_se: f64,
    pub tau_squared: f64,
    pub q_statistic: f64,
}

/// Pools `(c, se)` pairs, skipping folds without a finite positive standard error.
pub fn pool_concordance(estimates: &[(f64, f64)]) -> PooledConcordance {
    let usable: Vec<(f64, f64)> = estimates
        .iter()
        .copied()
        .filter(|(c, se)| c.is_finite() && se.is_finite() && *se > 0.0)
        .collect();
    if usable.is_empty() {
        return PooledConcordance {
            folds: 0,
            fixed_effect: f64::NAN,
            fixed_effect_se: f64::NAN,
            random_effects: f64::NAN,
            random_effects_se: f64::NAN,
            tau_squared: f64::NAN,
            q_statistic: f64::NAN,
        };
    }

    let weights: Vec<f64> = usable.iter().map(|(_, se)| 1.0 / (se * se)).collect();
    let total: f64 = weights.iter().sum();
    let fixed = usable.iter().zip(&weights).map(|((c, _), w)| w * c).sum::<f64>() / total;
    let q: f64 = usable
        .iter()
        .zip(&weights)
        .map(|((c, _), w)| w * (c - fixed).powi(2))
        .sum();
    let scaling = total - weights.iter().map(|w| w * w).sum::<f64>() / total;
    let df = (usable.len() - 1) as f64;
    let tau_squared = if scaling > 0.0 { ((q - df) / scaling).max(0.0) } else { 0.0 };

    let random_weights: Vec<f64> = usable
        .iter()
        .map(|(_, se)| 1.0 / (se * se + tau_squared))
        .collect();
    let random_total: f64 = random_weights.iter().sum();
    let random = usable
        .iter()
        .zip(&random_weights)
        .map(|((c, _), w)| w * c)
        .sum::<f64>()
        / random_total;

    PooledConcordance {
        folds: usable.len(),
        fixed_effect: fixed,
        fixed_effect_se: 1.0 / total.sqrt(),
        random_effects: random,
        random_effects_se: 1.0 / random_total.sqrt(),
        tau_squared,
        q_statistic: q,
    }
}

/// Mean and range over the finite values of one per-fold statistic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Spread {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl Spread {
    pub fn of(values: impl IntoIterator<Item = f64>) -> Self {
        let finite: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return Self {
                mean: f64::NAN,
                min: f64::NAN,
                max: f64::NAN,
            };
        }
        Self {
            mean: finite.iter().sum::<f64>() / finite.len() as f64,
            min: finite.iter().copied().fold(f64::INFINITY, f64::min),
            max: finite.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub horizon_days: f64,
    pub fold_alpha: f64,
    pub final_alpha: f64,
    pub final_lambda: f64,
    pub final_apparent_c_index: f64,
    pub completed_folds: usize,
    pub failed_folds: usize,
    pub concordance: PooledConcordance,
    pub calibration_slope: Spread,
    pub cox_calibration_slope: Spread,
    pub brier: Spread,
}

pub fn summarize(report: &IecvReport) -> Summary {
    let completed: Vec<&FoldEvaluation> = report.completed().collect();
    let estimates: Vec<(f64, f64)> = completed
        .iter()
        .map(|fold| (fold.external.concordance.c, fold.external.concordance.se))
        .collect();
    Summary {
        horizon_days: report.horizon,
        fold_alpha: report.fold_alpha,
        final_alpha: report.final_alpha,
        final_lambda: report.final_model.model.lambda,
        final_apparent_c_index: report.final_model.apparent.concordance.c,
        completed_folds: completed.len(),
        failed_folds: report.failed().count(),
        concordance: pool_concordance(&estimates),
        calibration_slope: Spread::of(
            completed
                .iter()
                .map(|f| f.external.horizon_calibration.slope),
        ),
        cox_calibration_slope: Spread::of(
            completed.iter().map(|f| f.external.cox_calibration.slope),
        ),
        brier: Spread::of(completed.iter().map(|f| f.external.brier)),
    }
}

/// Writes `rows` as a tab-separated table with a header line.
pub fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), IecvError> {
    let file = BufWriter::new(File::create(path)?);
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(file);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes every output table, the summary and the final model into `out_dir`.
/// Returns the paths written.
pub fn write_report(report: &IecvReport, out_dir: &Path) -> Result<Vec<PathBuf>, IecvError> {
    fs::create_dir_all(out_dir)?;
    let mut written = Vec::new();

    let path = out_dir.join("coefficients.tsv");
    write_table(&path, &coefficient_rows(report))?;
    written.push(path);

    let path = out_dir.join("apparent.tsv");
    write_table(&path, &apparent_rows(report))?;
    written.push(path);

    let path = out_dir.join("external.tsv");
    write_table(&path, &external_rows(report))?;
    written.push(path);

    let path = out_dir.join("decision_curve.tsv");
    write_table(&path, &decision_curve_rows(report))?;
    written.push(path);

    let failed = failed_fold_rows(report);
    if !failed.is_empty() {
        let path = out_dir.join("failed_folds.tsv");
        write_table(&path, &failed)?;
        written.push(path);
    }

    let path = out_dir.join("summary.toml");
    let mut file = BufWriter::new(File::create(&path)?);
    file.write_all(toml::to_string_pretty(&summarize(report))?.as_bytes())?;
    file.flush()?;
    written.push(path);

    let path = out_dir.join("final_model.toml");
    report.final_model.model.save(&path)?;
    written.push(path);

    for path in &written {
        log::info!("Wrote {}", path.display());
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn homogeneous_folds_pool_without_heterogeneity() {
        let pooled = pool_concordance(&[(0.7, 0.02), (0.7, 0.03), (0.7, 0.05)]);
        assert_eq!(pooled.folds, 3);
        assert_abs_diff_eq!(pooled.fixed_effect, 0.7, epsilon = 1e-12);
        assert_abs_diff_eq!(pooled.random_effects, 0.7, epsilon = 1e-12);
        assert_abs_diff_eq!(pooled.tau_squared, 0.0);
        assert_abs_diff_eq!(pooled.random_effects_se, pooled.fixed_effect_se, epsilon = 1e-12);
    }

    #[test]
    fn heterogeneous_folds_widen_the_random_effects_interval() {
        let pooled = pool_concordance(&[(0.60, 0.01), (0.80, 0.01), (0.70, 0.01)]);
        assert!(pooled.tau_squared > 0.0);
        assert!(pooled.random_effects_se > pooled.fixed_effect_se);
        assert_abs_diff_eq!(pooled.random_effects, 0.7, epsilon = 1e-9);
    }

    #[test]
    fn unusable_folds_are_skipped() {
        let pooled = pool_concordance(&[(f64::NAN, 0.1), (0.65, 0.0), (0.7, 0.02)]);
        assert_eq!(pooled.folds, 1);
        assert_abs_diff_eq!(pooled.fixed_effect, 0.7);
        assert!(pool_concordance(&[]).fixed_effect.is_nan());
    }

    #[test]
    fn spread_ignores_undefined_values() {
        let spread = Spread::of([1.0, f64::NAN, 3.0]);
        assert_abs_diff_eq!(spread.mean, 2.0);
        assert_abs_diff_eq!(spread.min, 1.0);
        assert_abs_diff_eq!(spread.max, 3.0);
    }

    #[test]
    fn tables_are_tab_separated_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curve.tsv");
        let rows = vec![DecisionCurveRow {
            held_out_cluster: "north".to_string(),
            threshold: 0.1,
            net_benefit: 0.05,
            strategy: Strategy::TreatAll,
        }];
        write_table(&path, &rows).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("held_out_cluster\tthreshold\tnet_benefit\tstrategy"));
        assert_eq!(lines.next(), Some("north\t0.1\t0.05\ttreat_all"));
        assert_abs_diff_eq!(round3(1.23456), 1.235);
    }
}
