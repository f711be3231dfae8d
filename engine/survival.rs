//! Risk-set arithmetic for the Breslow partial likelihood and Kaplan–Meier
//! estimation.
//!
//! Everything here works on subjects grouped by distinct follow-up time in
//! ascending order. The risk set at a time `t` is every subject whose
//! follow-up is at least `t`, so cumulative sums over the groups run from the
//! latest time backwards.

use crate::records::Outcomes;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Subjects sharing one distinct follow-up time.
#[derive(Clone, Debug)]
struct TimeGroup {
    time: f64,
    /// Range into `RiskSets::order`.
    start: usize,
    end: usize,
    deaths: f64,
}

/// Subjects ordered and grouped by follow-up time.
#[derive(Clone, Debug)]
pub struct RiskSets {
    order: Vec<usize>,
    groups: Vec<TimeGroup>,
    event: Vec<bool>,
}

/// Per-subject quantities of the quadratic approximation of the partial
/// log-likelihood around the current linear predictor.
#[derive(Debug, Clone)]
pub struct CoxWorkingState {
    /// d loglik / d eta_i.
    pub gradient: Array1<f64>,
    /// Diagonal of the negative Hessian with respect to eta.
    pub weight: Array1<f64>,
    pub log_likelihood: f64,
}

/// Partial-likelihood summary for a single covariate with coefficient `b`.
#[derive(Debug, Clone, Copy)]
pub struct SingleCovariateFit {
    pub log_likelihood: f64,
    pub score: f64,
    pub information: f64,
}

fn ascending_groups(time: ArrayView1<f64>, event: &[bool]) -> (Vec<usize>, Vec<TimeGroup>) {
    let mut order: Vec<usize> = (0..time.len()).collect();
    order.sort_by(|&a, &b| time[a].total_cmp(&time[b]));

    let mut groups: Vec<TimeGroup> = Vec::new();
    for (pos, &i) in order.iter().enumerate() {
        let starts_group = groups.last().is_none_or(|g| g.time != time[i]);
        if starts_group {
            groups.push(TimeGroup {
                time: time[i],
                start: pos,
                end: pos,
                deaths: 0.0,
            });
        }
        if let Some(group) = groups.last_mut() {
            group.end = pos + 1;
            if event[i] {
                group.deaths += 1.0;
            }
        }
    }
    (order, groups)
}

impl RiskSets {
    pub fn new(outcomes: &Outcomes) -> Self {
        let event: Vec<bool> = outcomes.event.iter().map(|&e| e == 1).collect();
        let (order, groups) = ascending_groups(outcomes.time.view(), &event);
        Self {
            order,
            groups,
            event,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn n_events(&self) -> usize {
        self.event.iter().filter(|&&e| e).count()
    }

    /// Risk-set totals of `weights`, one per time group.
    fn risk_totals(&self, weights: &[f64]) -> Vec<f64> {
        let mut totals = vec![0.0; self.groups.len()];
        let mut running = 0.0;
        for (k, group) in self.groups.iter().enumerate().rev() {
            running += self.order[group.start..group.end]
                .iter()
                .map(|&i| weights[i])
                .sum::<f64>();
            totals[k] = running;
        }
        totals
    }

    fn shifted_exp(eta: ArrayView1<f64>) -> (f64, Vec<f64>) {
        let shift = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let shift = if shift.is_finite() { shift } else { 0.0 };
        (shift, eta.iter().map(|&e| (e - shift).exp()).collect())
    }

    /// Gradient, diagonal weight and log-likelihood of the Breslow partial
    /// likelihood at linear predictor `eta`.
    pub fn working_state(&self, eta: ArrayView1<f64>) -> CoxWorkingState {
        let n = self.len();
        let (shift, risk) = Self::shifted_exp(eta);
        let totals = self.risk_totals(&risk);

        let mut gradient = Array1::<f64>::zeros(n);
        let mut weight = Array1::<f64>::zeros(n);
        let mut log_likelihood = 0.0;
        let mut first_moment = 0.0;
        let mut second_moment = 0.0;

        for (k, group) in self.groups.iter().enumerate() {
            if group.deaths > 0.0 {
                first_moment += group.deaths / totals[k];
                second_moment += group.deaths / (totals[k] * totals[k]);
                log_likelihood -= group.deaths * (totals[k].ln() + shift);
            }
            for &i in &self.order[group.start..group.end] {
                let expected = risk[i] * first_moment;
                let delta = if self.event[i] { 1.0 } else { 0.0 };
                if self.event[i] {
                    log_likelihood += eta[i];
                }
                gradient[i] = delta - expected;
                weight[i] = (expected - risk[i] * risk[i] * second_moment).max(0.0);
            }
        }

        CoxWorkingState {
            gradient,
            weight,
            log_likelihood,
        }
    }

    /// Partial log-likelihood only.
    pub fn log_likelihood(&self, eta: ArrayView1<f64>) -> f64 {
        let (shift, risk) = Self::shifted_exp(eta);
        let totals = self.risk_totals(&risk);
        let mut value = 0.0;
        for (k, group) in self.groups.iter().enumerate() {
            for &i in &self.order[group.start..group.end] {
                if self.event[i] {
                    value += eta[i];
                }
            }
            if group.deaths > 0.0 {
                value -= group.deaths * (totals[k].ln() + shift);
            }
        }
        value
    }

    /// Score and observed information of the model `eta = b * x`.
    pub fn single_covariate(&self, x: ArrayView1<f64>, b: f64) -> SingleCovariateFit {
        let eta = x.mapv(|v| b * v);
        let (shift, risk) = Self::shifted_exp(eta.view());
        let weighted_x: Vec<f64> = risk.iter().zip(x.iter()).map(|(r, v)| r * v).collect();
        let weighted_x2: Vec<f64> = weighted_x.iter().zip(x.iter()).map(|(r, v)| r * v).collect();
        let s0 = self.risk_totals(&risk);
        let s1 = self.risk_totals(&weighted_x);
        let s2 = self.risk_totals(&weighted_x2);

        let mut fit = SingleCovariateFit {
            log_likelihood: 0.0,
            score: 0.0,
            information: 0.0,
        };
        for (k, group) in self.groups.iter().enumerate() {
            if group.deaths == 0.0 {
                continue;
            }
            for &i in &self.order[group.start..group.end] {
                if self.event[i] {
                    fit.log_likelihood += eta[i];
                    fit.score += x[i];
                }
            }
            let mean = s1[k] / s0[k];
            fit.log_likelihood -= group.deaths * (s0[k].ln() + shift);
            fit.score -= group.deaths * mean;
            fit.information += group.deaths * (s2[k] / s0[k] - mean * mean);
        }
        fit
    }

    /// Breslow estimate of the baseline cumulative hazard for linear predictor `eta`.
    pub fn breslow(&self, eta: ArrayView1<f64>) -> BaselineHazard {
        let (shift, risk) = Self::shifted_exp(eta);
        let totals = self.risk_totals(&risk);
        let scale = (-shift).exp();
        let mut times = Vec::new();
        let mut cumulative_hazard = Vec::new();
        let mut running = 0.0;
        for (k, group) in self.groups.iter().enumerate() {
            if group.deaths == 0.0 {
                continue;
            }
            running += group.deaths * scale / totals[k];
            times.push(group.time);
            cumulative_hazard.push(running);
        }
        BaselineHazard {
            times,
            cumulative_hazard,
        }
    }
}

/// Step-function baseline cumulative hazard at the distinct event times.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BaselineHazard {
    pub times: Vec<f64>,
    pub cumulative_hazard: Vec<f64>,
}

impl BaselineHazard {
    pub fn at(&self, t: f64) -> f64 {
        let idx = self.times.partition_point(|&x| x <= t);
        if idx == 0 {
            0.0
        } else {
            self.cumulative_hazard[idx - 1]
        }
    }

    pub fn is_finite(&self) -> bool {
        self.cumulative_hazard.iter().all(|v| v.is_finite())
    }
}

/// Right-continuous Kaplan–Meier survival step function.
#[derive(Clone, Debug, PartialEq)]
pub struct SurvivalCurve {
    times: Vec<f64>,
    survival: Vec<f64>,
}

impl SurvivalCurve {
    /// S(t), including drops at `t`.
    pub fn at(&self, t: f64) -> f64 {
        let idx = self.times.partition_point(|&x| x <= t);
        if idx == 0 { 1.0 } else { self.survival[idx - 1] }
    }

    /// S(t-), the left limit at `t`.
    pub fn before(&self, t: f64) -> f64 {
        let idx = self.times.partition_point(|&x| x < t);
        if idx == 0 { 1.0 } else { self.survival[idx - 1] }
    }
}

/// Kaplan–Meier estimate where `flag[i] == 1` marks the transition of interest.
pub fn kaplan_meier(time: ArrayView1<f64>, flag: ArrayView1<u8>) -> SurvivalCurve {
    let event: Vec<bool> = flag.iter().map(|&f| f == 1).collect();
    let (_, groups) = ascending_groups(time, &event);
    let mut at_risk = time.len() as f64;
    let mut current = 1.0;
    let mut times = Vec::new();
    let mut survival = Vec::new();
    for group in &groups {
        if group.deaths > 0.0 && at_risk > 0.0 {
            current *= 1.0 - group.deaths / at_risk;
            times.push(group.time);
            survival.push(current);
        }
        at_risk -= (group.end - group.start) as f64;
    }
    SurvivalCurve { times, survival }
}

/// Kaplan–Meier estimate of the censoring survivor function G. Censorings
/// tied with events are ordered after them, so subjects failing at `t` are no
/// longer at risk of censoring at `t`.
pub fn censoring_distribution(outcomes: &Outcomes) -> SurvivalCurve {
    let censored: Vec<bool> = outcomes.event.iter().map(|&e| e == 0).collect();
    let (_, groups) = ascending_groups(outcomes.time.view(), &censored);
    let mut at_risk = outcomes.len() as f64;
    let mut current = 1.0;
    let mut times = Vec::new();
    let mut survival = Vec::new();
    for group in &groups {
        let size = (group.end - group.start) as f64;
        let censorings = group.deaths;
        let exposed = at_risk - (size - censorings);
        if censorings > 0.0 && exposed > 0.0 {
            current *= 1.0 - censorings / exposed;
            times.push(group.time);
            survival.push(current);
        }
        at_risk -= size;
    }
    SurvivalCurve { times, survival }
}
