//! Survival decision-curve analysis.
//!
//! Net benefit at threshold `t` weighs true positives against false positives
//! at the exchange rate `t / (1 - t)`. With censored follow-up the event risk
//! among subjects classified high-risk is taken from their Kaplan–Meier curve
//! at the horizon.

use crate::error::{DataIntegrityError, IecvError};
use crate::records::Outcomes;
use crate::survival::kaplan_meier;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Model,
    TreatAll,
    TreatNone,
}

impl Strategy {
    pub fn label(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::TreatAll => "treat_all",
            Self::TreatNone => "treat_none",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetBenefitPoint {
    pub threshold: f64,
    pub net_benefit: f64,
    pub strategy: Strategy,
}

/// Largest number of points a regular grid may span.
pub const MAX_THRESHOLDS: usize = 10_000;

/// Risk thresholds in `[0, 1)`.
#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdGrid {
    thresholds: Vec<f64>,
}

impl ThresholdGrid {
    /// `start, start + step, ...` up to and including `stop`. Values outside
    /// `[0, 1)` are dropped since net benefit is undefined at 1. A grid that
    /// would span more than [`MAX_THRESHOLDS`] points comes back empty.
    pub fn regular(start: f64, stop: f64, step: f64) -> Self {
        if !(step > 0.0) || !start.is_finite() || !stop.is_finite() {
            return Self::from_values(Vec::new());
        }
        let count = ((stop - start) / step + 1e-9).floor();
        if !(count < MAX_THRESHOLDS as f64) {
            log::warn!(
                "Threshold grid from {start} to {stop} by {step} exceeds {MAX_THRESHOLDS} points"
            );
            return Self::from_values(Vec::new());
        }
        let values = (0..=count.max(-1.0) as i64)
            .map(|k| ((start + k as f64 * step) * 1e9).round() / 1e9)
            .collect();
        Self::from_values(values)
    }

    pub fn from_values(values: Vec<f64>) -> Self {
        let mut thresholds: Vec<f64> = values
            .into_iter()
            .filter(|t| t.is_finite() && (0.0..1.0).contains(t))
            .collect();
        thresholds.sort_by(f64::total_cmp);
        thresholds.dedup();
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }
}

/// Kaplan–Meier event probability by `horizon` among all subjects.
pub fn event_rate(outcomes: &Outcomes, horizon: f64) -> f64 {
    1.0 - kaplan_meier(outcomes.time.view(), outcomes.event.view()).at(horizon)
}

/// Net benefit of treating subjects whose predicted risk is at least `threshold`.
pub fn net_benefit(
    outcomes: &Outcomes,
    probability: ArrayView1<f64>,
    horizon: f64,
    threshold: f64,
) -> f64 {
    let selected: Vec<usize> = (0..outcomes.len())
        .filter(|&i| probability[i] >= threshold)
        .collect();
    if selected.is_empty() || outcomes.is_empty() {
        return 0.0;
    }
    let share = selected.len() as f64 / outcomes.len() as f64;
    let high_risk = outcomes.select(&selected);
    let survival = kaplan_meier(high_risk.time.view(), high_risk.event.view()).at(horizon);
    let odds = threshold / (1.0 - threshold);
    share * (1.0 - survival) - share * survival * odds
}

/// Model, treat-all and treat-none curves over `grid`, in that order.
pub fn decision_curve(
    outcomes: &Outcomes,
    probability: ArrayView1<f64>,
    horizon: f64,
    grid: &ThresholdGrid,
) -> Result<Vec<NetBenefitPoint>, IecvError> {
    if probability.len() != outcomes.len() {
        return Err(DataIntegrityError::DimensionMismatch(format!(
            "{} probabilities for {} subjects",
            probability.len(),
            outcomes.len()
        ))
        .into());
    }
    let rate = event_rate(outcomes, horizon);
    let mut points = Vec::with_capacity(3 * grid.thresholds().len());
    for strategy in [Strategy::Model, Strategy::TreatAll, Strategy::TreatNone] {
        for &threshold in grid.thresholds() {
            let net_benefit = match strategy {
                Strategy::Model => net_benefit(outcomes, probability, horizon, threshold),
                Strategy::TreatAll => rate - (1.0 - rate) * threshold / (1.0 - threshold),
                Strategy::TreatNone => 0.0,
            };
            points.push(NetBenefitPoint {
                threshold,
                net_benefit,
                strategy,
            });
        }
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn outcomes() -> Outcomes {
        Outcomes::new(
            array![1.0, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 10.0],
            array![1, 1, 0, 1, 0, 0, 0, 0],
        )
        .unwrap()
    }

    #[test]
    fn grid_excludes_unit_and_negative_thresholds() {
        let grid = ThresholdGrid::regular(-0.1, 1.0, 0.1);
        assert_abs_diff_eq!(grid.thresholds()[0], 0.0);
        assert_abs_diff_eq!(*grid.thresholds().last().unwrap(), 0.9, epsilon = 1e-12);
        assert_eq!(grid.thresholds().len(), 10);

        let default_grid = ThresholdGrid::regular(0.0, 0.99, 0.01);
        assert_eq!(default_grid.thresholds().len(), 100);
        assert!(ThresholdGrid::from_values(vec![1.0, f64::NAN]).is_empty());
    }

    #[test]
    fn oversized_grids_are_refused() {
        assert!(ThresholdGrid::regular(0.0, 0.99, 1e-300).is_empty());
        assert!(ThresholdGrid::regular(0.0, 0.99, f64::MIN_POSITIVE).is_empty());
        assert!(ThresholdGrid::regular(-1e12, 0.5, 0.01).is_empty());
        let finest = ThresholdGrid::regular(0.0, 0.9999, 1e-4);
        assert_eq!(finest.thresholds().len(), MAX_THRESHOLDS);
    }

    #[test]
    fn net_benefit_at_zero_is_event_rate() {
        let outcomes = outcomes();
        let probability = array![0.9, 0.8, 0.1, 0.6, 0.2, 0.1, 0.3, 0.05];
        let rate = event_rate(&outcomes, 5.0);
        assert_abs_diff_eq!(
            net_benefit(&outcomes, probability.view(), 5.0, 0.0),
            rate,
            epsilon = 1e-12
        );
        // Kaplan–Meier drops at days 1, 2 and 4.
        assert_abs_diff_eq!(rate, 1.0 - (7.0 / 8.0) * (6.0 / 7.0) * (4.0 / 5.0), epsilon = 1e-12);
    }

    #[test]
    fn nobody_above_threshold_gives_zero() {
        let outcomes = outcomes();
        let probability = ndarray::Array1::from_elem(8, 0.2);
        assert_abs_diff_eq!(net_benefit(&outcomes, probability.view(), 5.0, 0.5), 0.0);
    }

    #[test]
    fn curves_carry_all_strategies() {
        let outcomes = outcomes();
        let probability = array![0.9, 0.8, 0.1, 0.6, 0.2, 0.1, 0.3, 0.05];
        let grid = ThresholdGrid::from_values(vec![0.0, 0.5, 0.95]);
        let points = decision_curve(&outcomes, probability.view(), 5.0, &grid).unwrap();
        assert_eq!(points.len(), 9);
        let treat_all_zero = points
            .iter()
            .find(|p| p.strategy == Strategy::TreatAll && p.threshold == 0.0)
            .unwrap();
        let model_zero = points
            .iter()
            .find(|p| p.strategy == Strategy::Model && p.threshold == 0.0)
            .unwrap();
        assert_abs_diff_eq!(treat_all_zero.net_benefit, model_zero.net_benefit, epsilon = 1e-12);
        assert!(
            points
                .iter()
                .filter(|p| p.strategy == Strategy::TreatNone)
                .all(|p| p.net_benefit == 0.0)
        );
        let treat_all_high = points
            .iter()
            .find(|p| p.strategy == Strategy::TreatAll && p.threshold == 0.95)
            .unwrap();
        assert!(treat_all_high.net_benefit < 0.0);
        assert_eq!(Strategy::TreatAll.to_string(), "treat_all");
    }
}
