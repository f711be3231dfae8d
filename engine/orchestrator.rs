//! Internal-external cross-validation across clusters.
//!
//! Every fold owns its state: imputed train and test sets, the schema fitted
//! on the training side and the model trained under that schema. Nothing
//! crosses fold boundaries except the immutable prepared cohort, so folds run
//! in any order, or concurrently, with identical results.

use crate::config::IecvConfig;
use crate::decision::{NetBenefitPoint, ThresholdGrid, decision_curve};
use crate::encoder::FeatureSchema;
use crate::error::IecvError;
use crate::impute::{Imputer, complete_checked};
use crate::metrics::{Performance, evaluate};
use crate::partition::{Fold, check_training_outcomes, fold_seed, folds, full_data_fold};
use crate::projector::{event_probability, project};
use crate::records::{Outcomes, RecordSet, prepare_outcomes};
use crate::trainer::{self, FittedModel, PenaltySettings};
use ndarray::Array1;
use rayon::prelude::*;

/// Observer for per-fold progress. Called from worker threads when folds run
/// in parallel.
pub trait FoldProgressObserver: Sync {
    fn on_run_start(&self, total_folds: usize) {
        let _ = total_folds;
    }
    fn on_fold_start(&self, cluster: &str) {
        let _ = cluster;
    }
    fn on_fold_finish(&self, cluster: &str, completed: bool) {
        let _ = (cluster, completed);
    }
    fn on_run_finish(&self) {}
}

#[derive(Default)]
pub struct NoopFoldProgress;

impl FoldProgressObserver for NoopFoldProgress {}

/// Results of one held-out cluster.
#[derive(Clone, Debug)]
pub struct FoldEvaluation {
    pub cluster: String,
    pub n_train: usize,
    pub events_train: usize,
    pub n_test: usize,
    pub events_test: usize,
    pub model: FittedModel,
    pub apparent: Performance,
    pub external: Performance,
    pub decision_curve: Vec<NetBenefitPoint>,
}

#[derive(Debug)]
pub enum FoldOutcome {
    Completed(Box<FoldEvaluation>),
    /// Penalty selection did not converge; the run carries on without this fold.
    Failed {
        cluster: String,
        n_train: usize,
        error: IecvError,
    },
}

impl FoldOutcome {
    pub fn cluster(&self) -> &str {
        match self {
            Self::Completed(evaluation) => &evaluation.cluster,
            Self::Failed { cluster, .. } => cluster,
        }
    }
}

/// The deployable model fitted on every subject.
#[derive(Clone, Debug)]
pub struct FinalModel {
    pub model: FittedModel,
    pub n: usize,
    pub events: usize,
    pub apparent: Performance,
}

#[derive(Debug)]
pub struct IecvReport {
    pub horizon: f64,
    pub fold_alpha: f64,
    pub final_alpha: f64,
    pub folds: Vec<FoldOutcome>,
    pub final_model: FinalModel,
}

impl IecvReport {
    pub fn completed(&self) -> impl Iterator<Item = &FoldEvaluation> {
        self.folds.iter().filter_map(|outcome| match outcome {
            FoldOutcome::Completed(evaluation) => Some(evaluation.as_ref()),
            FoldOutcome::Failed { .. } => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = &FoldOutcome> {
        self.folds
            .iter()
            .filter(|outcome| matches!(outcome, FoldOutcome::Failed { .. }))
    }
}

/// Immutable inputs shared by all folds.
struct RunContext<'a> {
    records: &'a RecordSet,
    outcomes: &'a Outcomes,
    config: &'a IecvConfig,
    imputer: &'a dyn Imputer,
    grid: ThresholdGrid,
}

/// State owned by a single fold while it is being processed.
struct FoldContext {
    seed: u64,
    train: RecordSet,
    train_outcomes: Outcomes,
    schema: FeatureSchema,
    model: FittedModel,
}

impl FoldContext {
    /// Imputes the training side, fits the schema on it and trains the model.
    fn fit(
        run: &RunContext<'_>,
        fold: &Fold,
        settings: &PenaltySettings,
    ) -> Result<Self, IecvError> {
        let seed = fold_seed(run.config.seed, &fold.cluster);
        let train = complete_checked(run.imputer, &run.records.subset(&fold.train), seed)?;
        let train_outcomes = run.outcomes.select(&fold.train);
        let schema = FeatureSchema::fit(&train, &run.config.covariates.reference_levels)?;
        let design = schema.transform(&train)?;
        let model = trainer::train(&design, &train_outcomes, settings, seed)?;
        Ok(Self {
            seed,
            train,
            train_outcomes,
            schema,
            model,
        })
    }

    /// Performance of the fold model on `records`, with the horizon probabilities.
    fn assess(
        &self,
        records: &RecordSet,
        outcomes: &Outcomes,
        horizon: f64,
    ) -> Result<(Performance, Array1<f64>), IecvError> {
        let pi = project(&self.model, &self.schema, records)?;
        let probability = event_probability(&self.model, pi.view(), horizon);
        let performance = evaluate(outcomes, pi.view(), probability.view(), horizon)?;
        Ok((performance, probability))
    }
}

fn run_fold(run: &RunContext<'_>, fold: &Fold) -> Result<FoldEvaluation, IecvError> {
    let horizon = run.config.outcome.prediction_horizon_days;
    let context = FoldContext::fit(run, fold, &run.config.penalty.fold_settings())?;

    let test = complete_checked(
        run.imputer,
        &run.records.subset(&fold.test),
        context.seed.wrapping_add(1),
    )?;
    let test_outcomes = run.outcomes.select(&fold.test);

    let (apparent, _) = context.assess(&context.train, &context.train_outcomes, horizon)?;
    let (external, probability) = context.assess(&test, &test_outcomes, horizon)?;
    let curve = decision_curve(&test_outcomes, probability.view(), horizon, &run.grid)?;

    log::info!(
        "Fold '{}': apparent C={:.3}, external C={:.3} (n_test={}, events={})",
        fold.cluster,
        apparent.concordance.c,
        external.concordance.c,
        test_outcomes.len(),
        test_outcomes.n_events()
    );

    Ok(FoldEvaluation {
        cluster: fold.cluster.clone(),
        n_train: fold.train.len(),
        events_train: context.train_outcomes.n_events(),
        n_test: fold.test.len(),
        events_test: test_outcomes.n_events(),
        model: context.model,
        apparent,
        external,
        decision_curve: curve,
    })
}

/// Runs leave-one-cluster-out validation and fits the final model on all
/// subjects. Folds whose penalty selection fails to converge are reported as
/// failed; every other error aborts the run.
pub fn run_iecv(
    records: &RecordSet,
    config: &IecvConfig,
    imputer: &dyn Imputer,
    observer: &dyn FoldProgressObserver,
) -> Result<IecvReport, IecvError> {
    config.validate()?;
    let prepared = prepare_outcomes(records, config.outcome.administrative_censoring_days);
    let outcomes = prepared.outcomes()?;
    let folds = folds(&prepared)?;
    for fold in &folds {
        check_training_outcomes(fold, &outcomes)?;
    }
    log::info!(
        "Internal-external validation over {} clusters ({} subjects, {} events)",
        folds.len(),
        outcomes.len(),
        outcomes.n_events()
    );

    let run = RunContext {
        records: &prepared,
        outcomes: &outcomes,
        config,
        imputer,
        grid: config.decision_curve.grid(),
    };

    observer.on_run_start(folds.len());
    let process = |fold: &Fold| {
        observer.on_fold_start(&fold.cluster);
        let result = run_fold(&run, fold).map_err(|e| e.in_fold(&fold.cluster, fold.train.len()));
        observer.on_fold_finish(&fold.cluster, result.is_ok());
        result
    };
    let results: Vec<Result<FoldEvaluation, IecvError>> = if config.parallel_folds {
        folds.par_iter().map(process).collect()
    } else {
        // Stop at the first error that would abort the run anyway.
        let mut results = Vec::with_capacity(folds.len());
        for fold in &folds {
            let result = process(fold);
            let fatal = matches!(&result, Err(error) if !error.is_fold_local());
            results.push(result);
            if fatal {
                break;
            }
        }
        results
    };

    let mut outcomes_by_fold = Vec::with_capacity(folds.len());
    for (fold, result) in folds.iter().zip(results) {
        match result {
            Ok(evaluation) => outcomes_by_fold.push(FoldOutcome::Completed(Box::new(evaluation))),
            Err(error) if error.is_fold_local() => {
                log::warn!("Recording fold '{}' as failed: {error}", fold.cluster);
                outcomes_by_fold.push(FoldOutcome::Failed {
                    cluster: fold.cluster.clone(),
                    n_train: fold.train.len(),
                    error,
                });
            }
            Err(error) => return Err(error),
        }
    }

    let full = full_data_fold(prepared.len());
    let horizon = config.outcome.prediction_horizon_days;
    let context = FoldContext::fit(&run, &full, &config.penalty.final_settings())
        .map_err(|e| e.in_fold(&full.cluster, full.train.len()))?;
    let (apparent, _) = context.assess(&context.train, &context.train_outcomes, horizon)?;
    observer.on_run_finish();
    log::info!(
        "Final model: {} of {} coefficients non-zero, apparent C={:.3}",
        context.model.coefficients.iter().filter(|&&b| b != 0.0).count(),
        context.model.coefficients.len(),
        apparent.concordance.c
    );

    Ok(IecvReport {
        horizon,
        fold_alpha: config.penalty.fold_alpha,
        final_alpha: config.penalty.final_alpha,
        folds: outcomes_by_fold,
        final_model: FinalModel {
            n: full.train.len(),
            events: context.train_outcomes.n_events(),
            model: context.model,
            apparent,
        },
    })
}
