mod common;

use approx::assert_abs_diff_eq;
use common::{cohort_config, simulated_cohort};
use iecv::decision::{event_rate, net_benefit};
use iecv::encoder::FeatureSchema;
use iecv::error::IecvError;
use iecv::impute::{MarginalImputer, complete_checked};
use iecv::metrics::{brier_score, concordance, cox_calibration, horizon_outcome};
use iecv::projector::{event_probability, linear_predictor, project};
use iecv::records::{Outcomes, RecordSet, prepare_outcomes};
use iecv::trainer::{PenaltySettings, fit_at_strength};
use ndarray::Array1;

const HORIZON: f64 = 2190.0;

fn prepared(seed: u64) -> (RecordSet, Outcomes) {
    let records = prepare_outcomes(&simulated_cohort(seed), HORIZON);
    let records = complete_checked(&MarginalImputer, &records, seed).unwrap();
    let outcomes = records.outcomes().unwrap();
    (records, outcomes)
}

#[test]
fn unpenalized_fit_is_perfectly_calibrated_on_its_own_data() {
    let (records, outcomes) = prepared(21);
    let references = cohort_config().covariates.reference_levels;
    let schema = FeatureSchema::fit(&records, &references).unwrap();
    let design = schema.transform(&records).unwrap();
    let model = fit_at_strength(&design, &outcomes, 0.0, &PenaltySettings::default()).unwrap();

    let pi = linear_predictor(&model, design.values.view()).unwrap();
    let calibration = cox_calibration(&outcomes, pi.view()).unwrap();
    assert_abs_diff_eq!(calibration.slope, 1.0, epsilon = 1e-2);
    assert!(calibration.se > 0.0);
}

#[test]
fn concordance_ignores_monotone_transforms() {
    let (records, outcomes) = prepared(22);
    let schema = FeatureSchema::fit(&records, &Default::default()).unwrap();
    let design = schema.transform(&records).unwrap();
    let model = fit_at_strength(&design, &outcomes, 0.01, &PenaltySettings::default()).unwrap();
    let pi = linear_predictor(&model, design.values.view()).unwrap();

    let original = concordance(&outcomes, pi.view());
    let probability = event_probability(&model, pi.view(), HORIZON);
    let transformed = concordance(&outcomes, pi.mapv(|v| 3.0 * v.exp() + 1.0).view());
    let via_risk = concordance(&outcomes, probability.view());
    assert_abs_diff_eq!(original.c, transformed.c, epsilon = 1e-12);
    assert_abs_diff_eq!(original.se, transformed.se, epsilon = 1e-12);
    assert_abs_diff_eq!(original.c, via_risk.c, epsilon = 1e-9);

    let reversed = concordance(&outcomes, pi.mapv(|v| -v).view());
    assert_abs_diff_eq!(original.c + reversed.c, 1.0, epsilon = 1e-9);
}

#[test]
fn projection_requires_the_training_schema() {
    let (records, outcomes) = prepared(23);
    let schema = FeatureSchema::fit(&records, &Default::default()).unwrap();
    let design = schema.transform(&records).unwrap();
    let model = fit_at_strength(&design, &outcomes, 0.05, &PenaltySettings::default()).unwrap();
    assert!(project(&model, &schema, &records).is_ok());

    let mut other_references = cohort_config().covariates.reference_levels;
    other_references.insert("smoking".to_string(), "current".to_string());
    let other = FeatureSchema::fit(&records, &other_references).unwrap();
    if other != schema {
        let err = project(&model, &other, &records).unwrap_err();
        assert!(matches!(err, IecvError::SchemaMismatch(_)), "{err}");
    }
}

#[test]
fn net_benefit_at_zero_threshold_is_the_event_rate() {
    let (_, outcomes) = prepared(24);
    let probability = Array1::from_elem(outcomes.len(), 0.3);
    let rate = event_rate(&outcomes, HORIZON);
    assert!(rate > 0.0 && rate < 1.0);
    assert_abs_diff_eq!(
        net_benefit(&outcomes, probability.view(), HORIZON, 0.0),
        rate,
        epsilon = 1e-12
    );
    assert_eq!(net_benefit(&outcomes, probability.view(), HORIZON, 0.5), 0.0);
}

#[test]
fn brier_score_stays_in_the_unit_interval() {
    let (_, outcomes) = prepared(25);
    let coin = Array1::from_elem(outcomes.len(), 0.5);
    let brier = brier_score(&outcomes, coin.view(), HORIZON).unwrap();
    assert_abs_diff_eq!(brier, 0.25, epsilon = 1e-12);

    let perfect = horizon_outcome(&outcomes, HORIZON).status;
    assert_eq!(brier_score(&outcomes, perfect.view(), HORIZON).unwrap(), 0.0);

    for p in [0.0, 0.1, 0.9, 1.0] {
        let constant = Array1::from_elem(outcomes.len(), p);
        let brier = brier_score(&outcomes, constant.view(), HORIZON).unwrap();
        assert!((0.0..=1.0).contains(&brier), "p={p}: {brier}");
    }
}
