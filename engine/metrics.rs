//! Discrimination, calibration and overall accuracy of a prognostic index.
//!
//! The same routines score apparent (training) and external (held-out)
//! performance. Statistics that are undefined on a given sample, such as a
//! concordance without comparable pairs or a slope for a constant predictor,
//! are reported as NaN rather than failing.

use crate::error::{ConvergenceError, DataIntegrityError, IecvError};
use crate::records::Outcomes;
use crate::survival::{RiskSets, censoring_distribution};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

const NEWTON_ITERATIONS: usize = 50;
const NEWTON_TOLERANCE: f64 = 1e-10;
const MAX_STEP_HALVINGS: usize = 30;

/// Harrell's C with its U-statistic standard error.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Concordance {
    pub c: f64,
    pub se: f64,
    pub comparable: f64,
}

/// Slope of a one-covariate Cox model on the prognostic index.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoxCalibration {
    pub slope: f64,
    pub se: f64,
}

/// Logistic recalibration of fixed-horizon event probabilities.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HorizonCalibration {
    pub calibration_in_the_large: f64,
    pub slope: f64,
}

impl HorizonCalibration {
    fn undefined() -> Self {
        Self {
            calibration_in_the_large: f64::NAN,
            slope: f64::NAN,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub concordance: Concordance,
    pub cox_calibration: CoxCalibration,
    pub horizon_calibration: HorizonCalibration,
    pub brier: f64,
}

fn check_lengths(
    outcomes: &Outcomes,
    values: ArrayView1<f64>,
    what: &str,
) -> Result<(), IecvError> {
    if outcomes.len() != values.len() {
        return Err(DataIntegrityError::DimensionMismatch(format!(
            "{} {what} for {} subjects",
            values.len(),
            outcomes.len()
        ))
        .into());
    }
    Ok(())
}

/// Harrell's C. A pair is comparable when the subject with the event fails
/// strictly first, or at the same time as a censored subject. Higher
/// prognostic index means higher risk; ties in the index count one half.
pub fn concordance(outcomes: &Outcomes, pi: ArrayView1<f64>) -> Concordance {
    let n = outcomes.len().min(pi.len());
    let mut concordant_by_subject = vec![0.0; n];
    let mut comparable_by_subject = vec![0.0; n];

    for i in 0..n {
        if outcomes.event[i] != 1 {
            continue;
        }
        let ti = outcomes.time[i];
        for j in 0..n {
            if i == j {
                continue;
            }
            let tj = outcomes.time[j];
            let comparable = ti < tj || (ti == tj && outcomes.event[j] == 0);
            if !comparable {
                continue;
            }
            let score = if pi[i] > pi[j] {
                1.0
            } else if pi[i] == pi[j] {
                0.5
            } else {
                0.0
            };
            concordant_by_subject[i] += score;
            concordant_by_subject[j] += score;
            comparable_by_subject[i] += 1.0;
            comparable_by_subject[j] += 1.0;
        }
    }

    let total_comparable: f64 = comparable_by_subject.iter().sum();
    if total_comparable == 0.0 {
        return Concordance {
            c: f64::NAN,
            se: f64::NAN,
            comparable: 0.0,
        };
    }
    let c = concordant_by_subject.iter().sum::<f64>() / total_comparable;
    let spread: f64 = concordant_by_subject
        .iter()
        .zip(&comparable_by_subject)
        .map(|(h, r)| (h - c * r).powi(2))
        .sum();
    Concordance {
        c,
        se: 2.0 * spread.sqrt() / total_comparable,
        comparable: total_comparable / 2.0,
    }
}

/// Option 1: unpenalized Cox regression of the outcome on the prognostic index.
pub fn cox_calibration(
    outcomes: &Outcomes,
    pi: ArrayView1<f64>,
) -> Result<CoxCalibration, IecvError> {
    check_lengths(outcomes, pi, "prognostic index values")?;
    let undefined = CoxCalibration {
        slope: f64::NAN,
        se: f64::NAN,
    };
    let (lo, hi) = pi
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if outcomes.n_events() == 0 || !(hi - lo > 1e-12) {
        return Ok(undefined);
    }

    let sets = RiskSets::new(outcomes);
    let mut slope = 0.0;
    let mut fit = sets.single_covariate(pi, slope);
    for iteration in 0..NEWTON_ITERATIONS {
        if !(fit.information > 0.0) {
            return Ok(undefined);
        }
        let step = fit.score / fit.information;
        let mut scale = 1.0;
        let mut trial = sets.single_covariate(pi, slope + step);
        let mut halvings = 0;
        while !(trial.log_likelihood >= fit.log_likelihood) && halvings < MAX_STEP_HALVINGS {
            scale *= 0.5;
            halvings += 1;
            trial = sets.single_covariate(pi, slope + scale * step);
        }
        slope += scale * step;
        fit = trial;
        log::debug!(
            "Cox calibration iteration {iteration}: slope {slope:.6}, score {:.3e}",
            fit.score
        );
        if (scale * step).abs() < NEWTON_TOLERANCE {
            return Ok(CoxCalibration {
                slope,
                se: 1.0 / fit.information.sqrt(),
            });
        }
    }
    Err(ConvergenceError::AuxiliaryFit {
        routine: "Cox calibration",
        iterations: NEWTON_ITERATIONS,
    }
    .into())
}

/// Binary status at the horizon with inverse-probability-of-censoring weights.
#[derive(Clone, Debug)]
pub struct HorizonOutcome {
    pub status: Array1<f64>,
    pub weight: Array1<f64>,
}

/// Events up to `horizon` are cases weighted by 1/G(T-); subjects still
/// under observation at the horizon are controls weighted by 1/G(horizon-);
/// subjects censored before the horizon carry no weight.
pub fn horizon_outcome(outcomes: &Outcomes, horizon: f64) -> HorizonOutcome {
    let censoring = censoring_distribution(outcomes);
    let inverse = |g: f64| if g > 0.0 { 1.0 / g } else { 0.0 };
    let mut status = Array1::<f64>::zeros(outcomes.len());
    let mut weight = Array1::<f64>::zeros(outcomes.len());
    for i in 0..outcomes.len() {
        let t = outcomes.time[i];
        if outcomes.event[i] == 1 && t <= horizon {
            status[i] = 1.0;
            weight[i] = inverse(censoring.before(t));
        } else if t >= horizon {
            weight[i] = inverse(censoring.before(horizon));
        }
    }
    HorizonOutcome { status, weight }
}

/// IPCW Brier score at `horizon`, normalized by the weight total.
pub fn brier_score(
    outcomes: &Outcomes,
    probability: ArrayView1<f64>,
    horizon: f64,
) -> Result<f64, IecvError> {
    check_lengths(outcomes, probability, "event probabilities")?;
    let target = horizon_outcome(outcomes, horizon);
    let total: f64 = target.weight.sum();
    if total <= 0.0 {
        return Ok(f64::NAN);
    }
    let loss: f64 = target
        .weight
        .iter()
        .zip(target.status.iter())
        .zip(probability.iter())
        .map(|((w, y), p)| w * (y - p).powi(2))
        .sum();
    Ok(loss / total)
}

trait LogitExt {
    fn logit(self) -> f64;
}

impl LogitExt for f64 {
    fn logit(self) -> f64 {
        let clamped = self.max(1e-12).min(1.0 - 1e-12);
        (clamped / (1.0 - clamped)).ln()
    }
}

fn stable_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let exp_x = x.exp();
        exp_x / (1.0 + exp_x)
    }
}

fn stable_softplus(x: f64) -> f64 {
    if x > 20.0 {
        x
    } else if x < -20.0 {
        x.exp().ln_1p()
    } else {
        (1.0 + x.exp()).ln()
    }
}

/// Weighted binomial log-likelihood of `y` under `eta = intercept + slope * x`.
struct WeightedLogistic<'a> {
    x: &'a [f64],
    y: &'a [f64],
    w: &'a [f64],
}

impl WeightedLogistic<'_> {
    fn log_likelihood(&self, intercept: f64, slope: f64) -> f64 {
        self.x
            .iter()
            .zip(self.y)
            .zip(self.w)
            .map(|((&x, &y), &w)| {
                let eta = intercept + slope * x;
                w * (y * eta - stable_softplus(eta))
            })
            .sum()
    }

    /// Gradient and information of the log-likelihood in (intercept, slope).
    fn derivatives(&self, intercept: f64, slope: f64) -> ([f64; 2], [[f64; 2]; 2]) {
        let mut gradient = [0.0; 2];
        let mut information = [[0.0; 2]; 2];
        for ((&x, &y), &w) in self.x.iter().zip(self.y).zip(self.w) {
            let mu = stable_sigmoid(intercept + slope * x);
            let residual = w * (y - mu);
            let variance = w * mu * (1.0 - mu);
            gradient[0] += residual;
            gradient[1] += residual * x;
            information[0][0] += variance;
            information[0][1] += variance * x;
            information[1][1] += variance * x * x;
        }
        information[1][0] = information[0][1];
        (gradient, information)
    }

    /// Newton iterations with step halving. `free_slope == false` keeps the
    /// slope fixed at its starting value and fits the intercept only.
    fn fit(
        &self,
        start: [f64; 2],
        free_slope: bool,
        routine: &'static str,
    ) -> Result<Option<[f64; 2]>, IecvError> {
        let [mut intercept, mut slope] = start;
        let mut current = self.log_likelihood(intercept, slope);
        for iteration in 0..NEWTON_ITERATIONS {
            let (gradient, information) = self.derivatives(intercept, slope);
            let step = if free_slope {
                let det =
                    information[0][0] * information[1][1] - information[0][1] * information[1][0];
                if !(det > 1e-12 * information[0][0].max(1.0) * information[1][1].max(1.0)) {
                    return Ok(None);
                }
                [
                    (information[1][1] * gradient[0] - information[0][1] * gradient[1]) / det,
                    (information[0][0] * gradient[1] - information[1][0] * gradient[0]) / det,
                ]
            } else {
                if !(information[0][0] > 0.0) {
                    return Ok(None);
                }
                [gradient[0] / information[0][0], 0.0]
            };

            let mut scale = 1.0;
            let mut trial = self.log_likelihood(intercept + step[0], slope + step[1]);
            let mut halvings = 0;
            while !(trial >= current) && halvings < MAX_STEP_HALVINGS {
                scale *= 0.5;
                halvings += 1;
                trial = self.log_likelihood(intercept + scale * step[0], slope + scale * step[1]);
            }
            if halvings > 0 {
                log::debug!(
                    "{routine}: step halving after {halvings} attempt(s) at iteration {iteration}"
                );
            }
            intercept += scale * step[0];
            slope += scale * step[1];
            current = trial;
            if (scale * step[0]).abs().max((scale * step[1]).abs()) < NEWTON_TOLERANCE {
                return Ok(Some([intercept, slope]));
            }
        }
        Err(ConvergenceError::AuxiliaryFit {
            routine,
            iterations: NEWTON_ITERATIONS,
        }
        .into())
    }
}

/// Option 2: calibration-in-the-large (intercept with logit(p) as offset) and
/// calibration slope (coefficient of logit(p) with a free intercept).
pub fn horizon_calibration(
    outcomes: &Outcomes,
    probability: ArrayView1<f64>,
    horizon: f64,
) -> Result<HorizonCalibration, IecvError> {
    check_lengths(outcomes, probability, "event probabilities")?;
    let target = horizon_outcome(outcomes, horizon);

    let mut x = Vec::new();
    let mut y = Vec::new();
    let mut w = Vec::new();
    for i in 0..outcomes.len() {
        if target.weight[i] > 0.0 {
            x.push(probability[i].logit());
            y.push(target.status[i]);
            w.push(target.weight[i]);
        }
    }
    let cases: f64 = y.iter().zip(&w).map(|(y, w)| y * w).sum();
    let controls: f64 = y.iter().zip(&w).map(|(y, w)| (1.0 - y) * w).sum();
    if cases <= 0.0 || controls <= 0.0 {
        return Ok(HorizonCalibration::undefined());
    }

    let model = WeightedLogistic {
        x: &x,
        y: &y,
        w: &w,
    };
    let citl = model.fit([0.0, 1.0], false, "calibration-in-the-large")?;
    let slope = model.fit([0.0, 1.0], true, "calibration slope")?;
    Ok(HorizonCalibration {
        calibration_in_the_large: citl.map_or(f64::NAN, |[a, _]| a),
        slope: slope.map_or(f64::NAN, |[_, b]| b),
    })
}

/// All performance measures for one evaluation sample.
pub fn evaluate(
    outcomes: &Outcomes,
    pi: ArrayView1<f64>,
    probability: ArrayView1<f64>,
    horizon: f64,
) -> Result<Performance, IecvError> {
    check_lengths(outcomes, pi, "prognostic index values")?;
    Ok(Performance {
        concordance: concordance(outcomes, pi),
        cox_calibration: cox_calibration(outcomes, pi)?,
        horizon_calibration: horizon_calibration(outcomes, probability, horizon)?,
        brier: brier_score(outcomes, probability, horizon)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn outcomes() -> Outcomes {
        Outcomes::new(
            array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            array![1, 1, 0, 1, 0, 1, 0, 0],
        )
        .unwrap()
    }

    #[test]
    fn perfectly_ordered_index_has_unit_concordance() {
        let outcomes = outcomes();
        let pi = array![8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0];
        let result = concordance(&outcomes, pi.view());
        assert_abs_diff_eq!(result.c, 1.0);
        assert!(result.comparable > 0.0);

        let reversed = pi.mapv(|v| -v);
        assert_abs_diff_eq!(concordance(&outcomes, reversed.view()).c, 0.0);
    }

    #[test]
    fn constant_index_scores_one_half() {
        let outcomes = outcomes();
        let result = concordance(&outcomes, Array1::zeros(8).view());
        assert_abs_diff_eq!(result.c, 0.5);
    }

    #[test]
    fn concordance_counts_pairs_by_hand() {
        let outcomes = Outcomes::new(array![1.0, 2.0, 2.0], array![1, 1, 0]).unwrap();
        let pi = array![0.1, 0.5, 0.3];
        // Pairs: (0,1) discordant, (0,2) discordant, (1,2) concordant.
        let result = concordance(&outcomes, pi.view());
        assert_abs_diff_eq!(result.comparable, 3.0);
        assert_abs_diff_eq!(result.c, 1.0 / 3.0, epsilon = 1e-12);
        assert!(result.se > 0.0);
    }

    #[test]
    fn no_comparable_pairs_is_nan() {
        let outcomes = Outcomes::new(array![1.0, 2.0], array![0, 0]).unwrap();
        assert!(concordance(&outcomes, array![1.0, 2.0].view()).c.is_nan());
    }

    #[test]
    fn constant_index_has_undefined_cox_slope() {
        let outcomes = outcomes();
        let result = cox_calibration(&outcomes, Array1::from_elem(8, 0.3).view()).unwrap();
        assert!(result.slope.is_nan());
    }

    #[test]
    fn brier_is_zero_for_perfect_probabilities() {
        let outcomes = Outcomes::new(
            array![1.0, 2.0, 10.0, 10.0, 12.0],
            array![1, 1, 0, 0, 1],
        )
        .unwrap();
        let target = horizon_outcome(&outcomes, 10.0);
        let brier = brier_score(&outcomes, target.status.view(), 10.0).unwrap();
        assert_abs_diff_eq!(brier, 0.0);

        let worst = target.status.mapv(|y| 1.0 - y);
        let brier = brier_score(&outcomes, worst.view(), 10.0).unwrap();
        assert_abs_diff_eq!(brier, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn censoring_before_horizon_carries_no_weight() {
        let outcomes = Outcomes::new(array![1.0, 3.0, 5.0, 9.0], array![1, 0, 1, 0]).unwrap();
        let target = horizon_outcome(&outcomes, 6.0);
        assert_eq!(target.status.to_vec(), vec![1.0, 0.0, 1.0, 0.0]);
        assert_abs_diff_eq!(target.weight[1], 0.0);
        assert_abs_diff_eq!(target.weight[0], 1.0);
        // G(5-) = 2/3 after one censoring among three at risk at t=3.
        assert_abs_diff_eq!(target.weight[2], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(target.weight[3], 1.5, epsilon = 1e-12);
    }

    #[test]
    fn well_calibrated_probabilities_recover_unit_slope() {
        let n = 400;
        let mut time = Vec::with_capacity(n);
        let mut event = Vec::with_capacity(n);
        let mut probability = Vec::with_capacity(n);
        for i in 0..n {
            let p = 0.1 + 0.8 * (i % 20) as f64 / 19.0;
            let case = (i / 20) as f64 / 20.0 < p;
            probability.push(p);
            time.push(if case { 1.0 + (i % 7) as f64 } else { 20.0 });
            event.push(u8::from(case));
        }
        let outcomes = Outcomes::new(Array1::from(time), Array1::from(event)).unwrap();
        let probability = Array1::from(probability);
        let result = horizon_calibration(&outcomes, probability.view(), 10.0).unwrap();
        assert!((result.slope - 1.0).abs() < 0.3, "slope {}", result.slope);
        assert!(result.calibration_in_the_large.abs() < 0.3);
    }
}
