//! Automatic outlier detection around the estimation kernel.
//!
//! Forward phase: score every admissible (position, type) candidate with a
//! single-regressor t statistic computed from the filtered innovations, add
//! the strongest one to the registry and re-estimate while the maximum score
//! exceeds a length-dependent critical value. Backward phase: drop the least
//! significant registered outlier while its coefficient |t| falls below the
//! critical value.

use crate::error::{BsmError, Result};
use crate::filter::{filter, filter_auxiliary, FilterTrace};
use crate::kernel::{BsmEstimate, BsmKernel};
use crate::likelihood::{loglikelihood, loglikelihood_with_regressors, DiffuseLikelihood};
use crate::state_space::Ssm;
use crate::types::BsmSpec;

/// Supported outlier shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutlierType {
    /// One-off spike at a single position.
    Additive,
    /// Permanent level shift from a position onward.
    LevelShift,
    /// Permanent shift of one season against the others.
    SeasonalShift,
}

/// A flagged position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outlier {
    pub position: usize,
    pub kind: OutlierType,
}

/// Sorted, duplicate-free collection of flagged outliers.
#[derive(Debug, Clone, Default)]
pub struct OutlierRegistry {
    entries: Vec<Outlier>,
}

impl OutlierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, o: Outlier) -> bool {
        self.entries.iter().any(|e| *e == o)
    }

    /// Insert keeping (position, kind) order; duplicates are ignored.
    pub fn add(&mut self, o: Outlier) {
        if self.contains(o) {
            return;
        }
        let at = self
            .entries
            .partition_point(|e| (e.position, e.kind) < (o.position, o.kind));
        self.entries.insert(at, o);
    }

    pub fn remove(&mut self, index: usize) -> Outlier {
        self.entries.remove(index)
    }

    pub fn entries(&self) -> &[Outlier] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Outlier> {
        self.entries
    }
}

/// Configuration of the detection loop.
#[derive(Debug, Clone)]
pub struct OutliersDetection {
    pub additive: bool,
    pub level_shift: bool,
    pub seasonal_shift: bool,
    /// Detection threshold on |t|; `None` derives it from the series length.
    pub critical_value: Option<f64>,
    /// Scores at or above this absolute t trigger a full re-estimation;
    /// weaker detections only refresh the regression profile.
    pub full_estimation_threshold: f64,
    pub max_outliers: usize,
}

impl Default for OutliersDetection {
    fn default() -> Self {
        Self {
            additive: true,
            level_shift: true,
            seasonal_shift: false,
            critical_value: None,
            full_estimation_threshold: 5.0,
            max_outliers: 24,
        }
    }
}

impl OutliersDetection {
    fn enabled_types(&self) -> Vec<OutlierType> {
        let mut out = Vec::new();
        if self.additive {
            out.push(OutlierType::Additive);
        }
        if self.level_shift {
            out.push(OutlierType::LevelShift);
        }
        if self.seasonal_shift {
            out.push(OutlierType::SeasonalShift);
        }
        out
    }

    fn threshold(&self, n: usize) -> f64 {
        self.critical_value
            .unwrap_or_else(|| critical_value(n, self.enabled_types().len()))
    }
}

/// Length-dependent detection threshold, fitted empirically per number of
/// enabled outlier families.
pub fn critical_value(n: usize, families: usize) -> f64 {
    let ln_n = (n.max(2) as f64).ln();
    if families >= 3 {
        2.32 + 0.295 * ln_n
    } else {
        2.2 + 0.285 * ln_n
    }
}

/// Regression column of one outlier over `n` observations.
pub fn regressor(o: Outlier, n: usize, period: usize) -> Vec<f64> {
    let mut x = vec![0.0; n];
    match o.kind {
        OutlierType::Additive => {
            if o.position < n {
                x[o.position] = 1.0;
            }
        }
        OutlierType::LevelShift => {
            for v in x.iter_mut().skip(o.position) {
                *v = 1.0;
            }
        }
        OutlierType::SeasonalShift => {
            let season = o.position % period;
            let off = -1.0 / (period.max(2) as f64 - 1.0);
            for (t, v) in x.iter_mut().enumerate().skip(o.position) {
                *v = if t % period == season { 1.0 } else { off };
            }
        }
    }
    x
}

/// Result of the detection loop.
#[derive(Debug, Clone)]
pub struct OutlierFit {
    /// Estimation of the final augmented model.
    pub estimate: BsmEstimate,
    pub outliers: Vec<Outlier>,
    /// Outlier coefficients, aligned with `outliers`.
    pub coefficients: Vec<f64>,
    /// Their t statistics, aligned with `outliers`.
    pub t_stats: Vec<f64>,
    /// Log-likelihood of the clean model before any outlier was added.
    pub initial_log_likelihood: f64,
}

pub struct OutlierDetector {
    config: OutliersDetection,
    kernel: BsmKernel,
}

impl OutlierDetector {
    pub fn new(config: OutliersDetection, kernel: BsmKernel) -> Self {
        Self { config, kernel }
    }

    pub fn detect(&self, y: &[f64], period: usize, spec: &BsmSpec) -> Result<OutlierFit> {
        let n = y.len();
        let types = self.config.enabled_types();
        if types.is_empty() {
            return Err(BsmError::InvalidSpec(
                "outlier detection with no outlier types enabled".into(),
            ));
        }
        let cv = self.config.threshold(n);

        let mut estimate = self.kernel.estimate(y, period, spec)?;
        let initial_log_likelihood = estimate.log_likelihood;
        let mut registry = OutlierRegistry::new();

        // Forward scan
        while registry.len() < self.config.max_outliers {
            let columns = registry_columns(&registry, n, period);
            let (ssm, trace, ll) = self.augmented_stats(&estimate, y, &columns)?;
            let sigma2 = ll.sigma2();
            let resid = residual_innovations(&ssm, &trace, &ll, &columns);

            let mut best: Option<(Outlier, f64)> = None;
            for &kind in &types {
                for position in 1..n {
                    let candidate = Outlier { position, kind };
                    if registry.contains(candidate) {
                        continue;
                    }
                    let x = regressor(candidate, n, period);
                    let t = match score(&ssm, &trace, sigma2, &resid, &x) {
                        Some(t) => t,
                        None => continue, // degenerate candidate
                    };
                    match best {
                        Some((_, bt)) if t.abs() <= bt.abs() => {}
                        _ => best = Some((candidate, t)),
                    }
                }
            }

            let (found, t) = match best {
                Some(b) => b,
                None => break,
            };
            if t.abs() < cv {
                break;
            }
            registry.add(found);

            if t.abs() >= self.config.full_estimation_threshold {
                let columns = registry_columns(&registry, n, period);
                estimate = self.kernel.estimate_with_regressors(
                    y,
                    period,
                    &estimate.spec,
                    &columns,
                )?;
            }
            // Weaker detections reuse the current variances; the refreshed
            // regression profile is recomputed at the top of the loop.
        }

        // Backward pruning of insignificant coefficients
        while !registry.is_empty() {
            let columns = registry_columns(&registry, n, period);
            let (_, _, ll) = self.augmented_stats(&estimate, y, &columns)?;
            let t_stats = coefficient_t_stats(&ll, registry.len());
            let weakest = t_stats
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()));
            match weakest {
                Some((idx, &t)) if t.abs() < cv => {
                    registry.remove(idx);
                }
                _ => break,
            }
        }

        // Final fit of the surviving augmented model
        let columns = registry_columns(&registry, n, period);
        estimate = if columns.is_empty() {
            self.kernel.estimate(y, period, &estimate.spec)?
        } else {
            self.kernel
                .estimate_with_regressors(y, period, &estimate.spec, &columns)?
        };
        let (_, _, ll) = self.augmented_stats(&estimate, y, &columns)?;
        let t_stats = coefficient_t_stats(&ll, registry.len());
        let coefficients = ll
            .coefficients
            .as_ref()
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default();

        Ok(OutlierFit {
            estimate,
            outliers: registry.into_entries(),
            coefficients,
            t_stats,
            initial_log_likelihood,
        })
    }

    /// Filter and regression profile of the current absolute-variance model
    /// over the augmented column set.
    fn augmented_stats(
        &self,
        estimate: &BsmEstimate,
        y: &[f64],
        columns: &[Vec<f64>],
    ) -> Result<(Ssm, FilterTrace, DiffuseLikelihood)> {
        let ssm = estimate.model()?;
        let trace = filter(&ssm, y, false);
        let ll = if columns.is_empty() {
            loglikelihood(&trace)?
        } else {
            loglikelihood_with_regressors(&ssm, &trace, columns)?
        };
        Ok((ssm, trace, ll))
    }
}

fn registry_columns(registry: &OutlierRegistry, n: usize, period: usize) -> Vec<Vec<f64>> {
    registry
        .entries()
        .iter()
        .map(|&o| regressor(o, n, period))
        .collect()
}

/// Innovations of `y` with the profiled regression effects removed.
fn residual_innovations(
    ssm: &Ssm,
    trace: &FilterTrace,
    ll: &DiffuseLikelihood,
    columns: &[Vec<f64>],
) -> Vec<f64> {
    let mut resid: Vec<f64> = trace.steps.iter().map(|s| s.error).collect();
    if let Some(beta) = ll.coefficients.as_ref() {
        for (j, col) in columns.iter().enumerate() {
            let filtered = filter_auxiliary(ssm, trace, col);
            for (r, xf) in resid.iter_mut().zip(filtered) {
                *r -= beta[j] * xf;
            }
        }
    }
    resid
}

/// Single-regressor t statistic of a candidate column against the residual
/// innovations, weighted by the prediction variances.
fn score(
    ssm: &Ssm,
    trace: &FilterTrace,
    sigma2: f64,
    resid: &[f64],
    x: &[f64],
) -> Option<f64> {
    if !(sigma2 > 0.0) {
        return None;
    }
    let filtered = filter_auxiliary(ssm, trace, x);
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (t, step) in trace.steps.iter().enumerate() {
        if step.is_missing() || step.is_diffuse() || step.variance <= 0.0 {
            continue;
        }
        sxy += filtered[t] * resid[t] / step.variance;
        sxx += filtered[t] * filtered[t] / step.variance;
    }
    if sxx <= f64::EPSILON {
        return None;
    }
    let t = sxy / (sigma2 * sxx).sqrt();
    t.is_finite().then_some(t)
}

fn coefficient_t_stats(ll: &DiffuseLikelihood, k: usize) -> Vec<f64> {
    let sigma2 = ll.sigma2();
    match (ll.coefficients.as_ref(), ll.coefficients_cov.as_ref()) {
        (Some(beta), Some(cov)) => (0..k)
            .map(|j| {
                let se = (sigma2 * cov[(j, j)]).sqrt();
                if se > 0.0 {
                    beta[j] / se
                } else {
                    0.0
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}
