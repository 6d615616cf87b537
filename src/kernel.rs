//! BSM estimation kernel.
//!
//! Drives the outer maximum-likelihood loop as an explicit state machine:
//!
//! ```text
//! Initializing -> ScalingSearch -> FullOptimization -> SmallVariancePruning -> Done
//!                                                                          \-> Failed
//! ```
//!
//! In scaled mode one free variance is anchored at 1, the others are
//! estimated as ratios against it with the residual scale profiled out of
//! the likelihood, and the absolute variances are recovered at the end by
//! multiplying with the estimated scale. Pruning fixes near-zero variances
//! to exactly zero and re-optimizes the reduced specification.

use crate::error::{BsmError, Result};
use crate::filter::{filter, FilterTrace};
use crate::likelihood::{loglikelihood, loglikelihood_with_regressors, DiffuseLikelihood};
use crate::optimizer::{LbfgsMinimizer, MinimizeOutcome, Minimizer, Objective};
use crate::params::{BsmData, BsmMapping, FreeParam};
use crate::state_space::Ssm;
use crate::types::{BsmSpec, Component, ComponentUse, EstimationSpec};

/// Phases of the estimation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Initializing,
    ScalingSearch,
    FullOptimization,
    SmallVariancePruning,
    Done,
    Failed,
}

/// Finished estimation: parameters, the possibly pruned specification and
/// the sufficient statistics of the fit.
#[derive(Debug, Clone)]
pub struct BsmEstimate {
    /// Absolute component variances and cycle parameters.
    pub data: BsmData,
    /// The specification actually fitted; pruned components appear as
    /// `Fixed(0.0)`.
    pub spec: BsmSpec,
    pub period: usize,
    pub likelihood: DiffuseLikelihood,
    pub log_likelihood: f64,
    /// Profiled residual scale (1 when scaling is disabled).
    pub sigma2: f64,
    /// Whether the last minimization call converged under the fitted
    /// specification.
    pub converged: bool,
    /// True when pruning changed the caller's specification.
    pub spec_changed: bool,
    /// Total minimizer iterations across all phases.
    pub iterations: u64,
}

impl BsmEstimate {
    /// State-space model at the estimated absolute variances.
    pub fn model(&self) -> Result<Ssm> {
        Ssm::of_bsm(&self.data, self.period)
    }

    /// Forward filter of the fitted model over a series.
    pub fn filter(&self, y: &[f64], keep_states: bool) -> Result<FilterTrace> {
        Ok(filter(&self.model()?, y, keep_states))
    }
}

/// Negative log-likelihood over a free-parameter point.
struct LikelihoodObjective<'a> {
    y: &'a [f64],
    columns: &'a [Vec<f64>],
    mapping: BsmMapping,
    concentrated: bool,
}

impl LikelihoodObjective<'_> {
    fn evaluate(&self, point: &[f64]) -> Option<DiffuseLikelihood> {
        let mut p = point.to_vec();
        self.mapping.validate(&mut p);
        let data = self.mapping.map(&p).ok()?;
        let ssm = Ssm::of_bsm(&data, self.mapping.period()).ok()?;
        let trace = filter(&ssm, self.y, false);
        if self.columns.is_empty() {
            loglikelihood(&trace).ok()
        } else {
            loglikelihood_with_regressors(&ssm, &trace, self.columns).ok()
        }
    }
}

impl Objective for LikelihoodObjective<'_> {
    fn cost(&self, point: &[f64]) -> Option<f64> {
        let ll = self.evaluate(point)?;
        let v = if self.concentrated {
            ll.concentrated()
        } else {
            ll.full()
        };
        if v.is_finite() {
            Some(-v)
        } else {
            None
        }
    }
}

pub struct BsmKernel {
    settings: EstimationSpec,
    minimizer: LbfgsMinimizer,
}

impl BsmKernel {
    pub fn new(settings: EstimationSpec) -> Self {
        let minimizer = LbfgsMinimizer::new(settings.max_iter);
        Self {
            settings,
            minimizer,
        }
    }

    pub fn settings(&self) -> &EstimationSpec {
        &self.settings
    }

    /// Estimate a BSM over `y` (NaN marks missing values).
    pub fn estimate(&self, y: &[f64], period: usize, spec: &BsmSpec) -> Result<BsmEstimate> {
        self.estimate_with_regressors(y, period, spec, &[])
    }

    /// Estimate with regression columns profiled out of the likelihood.
    pub fn estimate_with_regressors(
        &self,
        y: &[f64],
        period: usize,
        spec: &BsmSpec,
        columns: &[Vec<f64>],
    ) -> Result<BsmEstimate> {
        spec.validate(period)?;
        if y.iter().filter(|v| v.is_finite()).count() < 2 {
            return Err(BsmError::DataError(
                "series has fewer than two observations".into(),
            ));
        }

        let mut state = KernelState::Initializing;
        let mut working = spec.clone();
        let mut anchor: Option<Component> = None;
        let mut mapping = BsmMapping::new(&working, period)?;
        let mut point: Vec<f64> = Vec::new();
        let mut last: Option<MinimizeOutcome> = None;
        let mut iterations: u64 = 0;
        let mut spec_changed = false;
        let mut prune_rounds = 0usize;
        let mut failure: Option<BsmError> = None;

        loop {
            match state {
                KernelState::Initializing => {
                    anchor = if self.settings.scaling {
                        self.choose_anchor(y, period, &working, columns)
                    } else {
                        None
                    };
                    mapping = BsmMapping::with_anchor(&working, period, anchor);
                    point = mapping.default_point();
                    state = if anchor.is_some() {
                        KernelState::ScalingSearch
                    } else {
                        KernelState::FullOptimization
                    };
                }

                KernelState::ScalingSearch => {
                    // Re-anchor on the largest variance until stable, at most
                    // three rounds.
                    let mut stable = false;
                    for _ in 0..3 {
                        let objective = LikelihoodObjective {
                            y,
                            columns,
                            mapping: mapping.clone(),
                            concentrated: true,
                        };
                        let outcome =
                            self.minimize(&objective, &mapping, point.clone())?;
                        iterations += outcome.iterations;

                        let mut p = outcome.point.clone();
                        mapping.validate(&mut p);
                        let mut data = mapping.map(&p)?;
                        let widest = working
                            .free_components()
                            .into_iter()
                            .map(|c| (c, data.variance(c)))
                            .max_by(|a, b| a.1.total_cmp(&b.1));
                        match widest {
                            Some((c, v)) if Some(c) != anchor && v > 1.0 => {
                                data.rescale_variances(1.0 / v);
                                anchor = Some(c);
                                mapping = BsmMapping::with_anchor(&working, period, anchor);
                                point = mapping.unmap(&data);
                                last = Some(outcome);
                            }
                            _ => {
                                last = Some(outcome);
                                stable = true;
                                break;
                            }
                        }
                    }
                    state = if stable {
                        KernelState::SmallVariancePruning
                    } else {
                        KernelState::FullOptimization
                    };
                }

                KernelState::FullOptimization => {
                    let objective = LikelihoodObjective {
                        y,
                        columns,
                        mapping: mapping.clone(),
                        concentrated: anchor.is_some(),
                    };
                    match self.minimize(&objective, &mapping, point.clone()) {
                        Ok(outcome) => {
                            iterations += outcome.iterations;
                            last = Some(outcome);
                            state = KernelState::SmallVariancePruning;
                        }
                        Err(e) => {
                            failure = Some(e);
                            state = KernelState::Failed;
                        }
                    }
                }

                KernelState::SmallVariancePruning => {
                    let outcome = match last.as_ref() {
                        Some(o) => o.clone(),
                        None => {
                            return Err(BsmError::OptimizationFailed(
                                "no minimization outcome to prune".into(),
                            ));
                        }
                    };
                    if prune_rounds >= self.settings.max_prune_rounds {
                        state = KernelState::Done;
                        continue;
                    }
                    let objective = LikelihoodObjective {
                        y,
                        columns,
                        mapping: mapping.clone(),
                        concentrated: anchor.is_some(),
                    };
                    match self.least_significant_variance(&objective, &mapping, &outcome) {
                        Some((c, lr)) if lr < self.settings.prune_threshold => {
                            working.set_component(c, ComponentUse::Fixed(0.0));
                            spec_changed = true;
                            prune_rounds += 1;
                            mapping = BsmMapping::with_anchor(&working, period, anchor);
                            point = prune_point(&outcome.point, &objective.mapping, c);
                            let objective = LikelihoodObjective {
                                y,
                                columns,
                                mapping: mapping.clone(),
                                concentrated: anchor.is_some(),
                            };
                            let reopt = self.minimize(&objective, &mapping, point.clone())?;
                            iterations += reopt.iterations;
                            last = Some(reopt);
                            // look for further prunable variances
                        }
                        _ => {
                            state = KernelState::Done;
                        }
                    }
                }

                KernelState::Done => {
                    let outcome = last.ok_or_else(|| {
                        BsmError::OptimizationFailed("estimation produced no outcome".into())
                    })?;
                    let mut p = outcome.point.clone();
                    mapping.validate(&mut p);
                    let mut data = mapping.map(&p)?;
                    let ssm = Ssm::of_bsm(&data, period)?;
                    let trace = filter(&ssm, y, false);
                    let likelihood = if columns.is_empty() {
                        loglikelihood(&trace)?
                    } else {
                        loglikelihood_with_regressors(&ssm, &trace, columns)?
                    };
                    let (sigma2, log_likelihood) = if anchor.is_some() {
                        let s2 = likelihood.sigma2();
                        data.rescale_variances(s2);
                        (s2, likelihood.concentrated())
                    } else {
                        (1.0, likelihood.full())
                    };
                    return Ok(BsmEstimate {
                        data,
                        spec: working,
                        period,
                        likelihood,
                        log_likelihood,
                        sigma2,
                        converged: outcome.converged,
                        spec_changed,
                        iterations,
                    });
                }

                KernelState::Failed => {
                    return Err(failure.take().unwrap_or_else(|| {
                        BsmError::OptimizationFailed("estimation kernel failed".into())
                    }));
                }
            }
        }
    }

    /// A mapping with no free parameters has nothing to minimize; report a
    /// converged zero-iteration outcome at the empty point.
    fn minimize(
        &self,
        objective: &LikelihoodObjective<'_>,
        mapping: &BsmMapping,
        start: Vec<f64>,
    ) -> Result<MinimizeOutcome> {
        if mapping.dim() == 0 {
            let cost = objective
                .cost(&[])
                .ok_or_else(|| BsmError::SingularSystem("fixed model is degenerate".into()))?;
            return Ok(MinimizeOutcome {
                point: Vec::new(),
                cost,
                iterations: 0,
                converged: true,
            });
        }
        self.minimizer.minimize(objective, start)
    }

    /// First guess for the anchor: a single concentrated-likelihood
    /// evaluation per candidate (its variance at 1, the others small), no
    /// per-candidate minimization. The scaling search re-anchors if the
    /// guess turns out wrong.
    fn choose_anchor(
        &self,
        y: &[f64],
        period: usize,
        spec: &BsmSpec,
        columns: &[Vec<f64>],
    ) -> Option<Component> {
        let candidates = spec.free_components();
        match candidates.len() {
            0 => return None,
            1 => return Some(candidates[0]),
            _ => {}
        }

        let mut best: Option<(Component, f64)> = None;
        for &candidate in &candidates {
            let mapping = BsmMapping::with_anchor(spec, period, Some(candidate));
            let objective = LikelihoodObjective {
                y,
                columns,
                mapping: mapping.clone(),
                concentrated: true,
            };
            let start: Vec<f64> = mapping
                .free_params()
                .iter()
                .zip(mapping.default_point())
                .map(|(p, d)| match p {
                    FreeParam::Variance(_) => 0.1_f64.sqrt(),
                    _ => d,
                })
                .collect();
            if let Some(cost) = objective.cost(&start) {
                let ll = -cost;
                match best {
                    Some((_, best_ll)) if ll <= best_ll => {}
                    _ => best = Some((candidate, ll)),
                }
            }
        }
        best.map(|(c, _)| c).or(Some(candidates[0]))
    }

    /// Likelihood-ratio statistic of forcing each free variance to zero;
    /// returns the least significant one.
    fn least_significant_variance(
        &self,
        objective: &LikelihoodObjective<'_>,
        mapping: &BsmMapping,
        outcome: &MinimizeOutcome,
    ) -> Option<(Component, f64)> {
        let mut weakest: Option<(Component, f64)> = None;
        for (i, p) in mapping.free_params().iter().enumerate() {
            let c = match p {
                FreeParam::Variance(c) => *c,
                _ => continue,
            };
            let mut zeroed = outcome.point.clone();
            zeroed[i] = 0.0;
            let cost0 = match objective.cost(&zeroed) {
                Some(v) => v,
                None => continue, // degenerate candidate, not prunable
            };
            let lr = 2.0 * (cost0 - outcome.cost);
            match weakest {
                Some((_, w)) if lr >= w => {}
                _ => weakest = Some((c, lr)),
            }
        }
        weakest
    }
}

impl Default for BsmKernel {
    fn default() -> Self {
        Self::new(EstimationSpec::default())
    }
}

/// Drop the pruned component's entry from a free-parameter point, keeping
/// every other coordinate in place.
fn prune_point(point: &[f64], old_mapping: &BsmMapping, pruned: Component) -> Vec<f64> {
    old_mapping
        .free_params()
        .iter()
        .zip(point.iter())
        .filter(|(p, _)| **p != FreeParam::Variance(pruned))
        .map(|(_, &v)| v)
        .collect()
}
