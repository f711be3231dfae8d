//! Simulated multi-cluster cohort shared by the integration tests.

use iecv::IecvConfig;
use iecv::records::{EventStatus, RecordSet, SubjectRecord};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Normal};
use std::fmt::Write as _;
use std::path::Path;

pub const CLUSTERS: [&str; 3] = ["north", "south", "west"];
pub const SUBJECTS: usize = 1000;

const SMOKING: [&str; 3] = ["never", "former", "current"];

/// Exponential event, competing-event and censoring times with a proportional
/// hazard in age, smoking and sex. Regions differ in baseline risk. Roughly 3%
/// of ages and 2% of smoking values are missing.
pub fn simulated_cohort(seed: u64) -> RecordSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let age = Normal::new(60.0, 8.0).unwrap();
    let competing = Exp::new(1.0 / 8000.0).unwrap();

    let records = (0..SUBJECTS)
        .map(|i| {
            let cluster = CLUSTERS[i % CLUSTERS.len()];
            let region_effect = match cluster {
                "north" => 0.0,
                "south" => 0.2,
                _ => -0.15,
            };
            let age_years: f64 = age.sample(&mut rng);
            let smoking = SMOKING[rng.gen_range(0..SMOKING.len())];
            let sex = if rng.gen_bool(0.5) { "female" } else { "male" };
            let eta = 0.05 * (age_years - 60.0)
                + match smoking {
                    "current" => 0.7,
                    "former" => 0.3,
                    _ => 0.0,
                }
                + if sex == "male" { 0.25 } else { 0.0 }
                + region_effect;

            let event_rate = 1.5e-4 * f64::exp(eta);
            let event_time = Exp::new(event_rate).unwrap().sample(&mut rng);
            let competing_time = competing.sample(&mut rng);
            let censoring_time = rng.gen_range(500.0..3000.0);

            let (time, status) = if event_time <= competing_time && event_time <= censoring_time {
                (event_time, EventStatus::Primary)
            } else if competing_time <= censoring_time {
                (competing_time, EventStatus::Competing)
            } else {
                (censoring_time, EventStatus::Censored)
            };

            SubjectRecord {
                cluster: cluster.to_string(),
                time: time.max(1.0).round(),
                status,
                categorical: vec![
                    (!rng.gen_bool(0.02)).then(|| smoking.to_string()),
                    Some(sex.to_string()),
                ],
                continuous: vec![
                    (!rng.gen_bool(0.03)).then_some((age_years * 10.0).round() / 10.0),
                ],
            }
        })
        .collect();

    RecordSet::new(
        vec!["smoking".to_string(), "sex".to_string()],
        vec!["age".to_string()],
        records,
    )
    .unwrap()
}

/// Configuration matching [`simulated_cohort`] with a short penalty path.
pub fn cohort_config() -> IecvConfig {
    let mut config = IecvConfig::default();
    config.seed = 11;
    config.covariates.categorical = vec!["smoking".to_string(), "sex".to_string()];
    config.covariates.continuous = vec!["age".to_string()];
    config
        .covariates
        .reference_levels
        .extend([
            ("smoking".to_string(), "never".to_string()),
            ("sex".to_string(), "female".to_string()),
        ]);
    config.penalty.nlambda = 20;
    config.penalty.inner_folds = 3;
    config.decision_curve.step = 0.05;
    config.decision_curve.stop = 0.5;
    config
}

/// Writes `records` as the tab-separated table the loader expects.
pub fn write_cohort_tsv(records: &RecordSet, path: &Path) {
    let mut text = String::from("region\ttime\tstatus\tsmoking\tsex\tage\n");
    for record in records.records() {
        let field = |value: &Option<String>| value.clone().unwrap_or_default();
        writeln!(
            text,
            "{}\t{}\t{}\t{}\t{}\t{}",
            record.cluster,
            record.time,
            record.status.code(),
            field(&record.categorical[0]),
            field(&record.categorical[1]),
            record.continuous[0].map(|v| v.to_string()).unwrap_or_default()
        )
        .unwrap();
    }
    std::fs::write(path, text).unwrap();
}
