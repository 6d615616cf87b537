//! Gaussian log-likelihood of a filtered series, with the exact diffuse
//! correction and optional regression profiling.
//!
//! Diffuse steps contribute `ln f_inf` to the correction term instead of a
//! prediction-error term; regression coefficients are profiled out in closed
//! form from the filtered columns, adding their own correction.

use nalgebra::{DMatrix, DVector};

use crate::error::{BsmError, Result};
use crate::filter::{filter_auxiliary, FilterTrace};
use crate::state_space::Ssm;

const LN_2PI: f64 = 1.8378770664093453;

/// Likelihood decomposition of one filtered series.
#[derive(Debug, Clone)]
pub struct DiffuseLikelihood {
    /// Non-missing observations.
    pub n_obs: usize,
    /// Diffuse directions resolved by the data, regression columns included.
    pub diffuse_dim: usize,
    /// Weighted residual sum of squares over the regular steps.
    pub ssq: f64,
    /// Sum of `ln f` over the regular steps.
    pub log_det: f64,
    /// Diffuse correction: `ln f_inf` over the diffuse steps plus the
    /// regression column correction.
    pub diffuse_correction: f64,
    /// Profiled regression coefficients, when regressors were supplied.
    pub coefficients: Option<DVector<f64>>,
    /// Unscaled coefficient covariance `(X'WX)^-1`; multiply by the variance
    /// scale for standard errors.
    pub coefficients_cov: Option<DMatrix<f64>>,
}

impl DiffuseLikelihood {
    /// Effective sample size after the diffuse directions.
    pub fn neff(&self) -> usize {
        self.n_obs.saturating_sub(self.diffuse_dim)
    }

    /// Maximum-likelihood estimate of the common variance scale.
    pub fn sigma2(&self) -> f64 {
        let neff = self.neff();
        if neff == 0 {
            f64::NAN
        } else {
            self.ssq / neff as f64
        }
    }

    /// Log-likelihood with the variance scale profiled out.
    pub fn concentrated(&self) -> f64 {
        let neff = self.neff() as f64;
        -0.5 * (neff * (LN_2PI + 1.0 + (self.ssq / neff).ln())
            + self.log_det
            + self.diffuse_correction)
    }

    /// Log-likelihood at scale one.
    pub fn full(&self) -> f64 {
        let neff = self.neff() as f64;
        -0.5 * (neff * LN_2PI + self.ssq + self.log_det + self.diffuse_correction)
    }
}

/// Accumulate the likelihood terms of a finished forward pass.
pub fn loglikelihood(trace: &FilterTrace) -> Result<DiffuseLikelihood> {
    let mut n_obs = 0usize;
    let mut diffuse_dim = 0usize;
    let mut ssq = 0.0;
    let mut log_det = 0.0;
    let mut dcorr = 0.0;

    for step in &trace.steps {
        if step.is_missing() {
            continue;
        }
        n_obs += 1;
        if step.is_diffuse() {
            diffuse_dim += 1;
            dcorr += step.diffuse_variance.ln();
        } else if step.variance > 0.0 {
            ssq += step.error * step.error / step.variance;
            log_det += step.variance.ln();
        } else {
            return Err(BsmError::SingularSystem(
                "non-positive prediction variance".into(),
            ));
        }
    }
    if n_obs <= diffuse_dim {
        return Err(BsmError::DataError(format!(
            "{} observations cannot resolve {} diffuse directions",
            n_obs, diffuse_dim
        )));
    }
    Ok(DiffuseLikelihood {
        n_obs,
        diffuse_dim,
        ssq,
        log_det,
        diffuse_correction: dcorr,
        coefficients: None,
        coefficients_cov: None,
    })
}

/// Likelihood with regression columns profiled out.
///
/// Each column is passed through the same filter as the observations (the
/// innovation operator is linear and its gains do not depend on the data),
/// then the coefficients solve a weighted least-squares problem over the
/// regular steps. The columns are treated as diffuse: each adds one diffuse
/// direction and `2 ln |r_ii|` to the correction.
pub fn loglikelihood_with_regressors(
    ssm: &Ssm,
    trace: &FilterTrace,
    columns: &[Vec<f64>],
) -> Result<DiffuseLikelihood> {
    let mut base = loglikelihood(trace)?;
    if columns.is_empty() {
        return Ok(base);
    }
    let p = columns.len();
    for col in columns {
        if col.len() != trace.len() {
            return Err(BsmError::DataError(format!(
                "regressor length {} does not match series length {}",
                col.len(),
                trace.len()
            )));
        }
    }

    let filtered: Vec<Vec<f64>> = columns
        .iter()
        .map(|col| filter_auxiliary(ssm, trace, col))
        .collect();

    // Weighted rows over the regular non-missing steps.
    let rows: Vec<usize> = trace
        .steps
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_missing() && !s.is_diffuse() && s.variance > 0.0)
        .map(|(t, _)| t)
        .collect();
    if rows.len() < p {
        return Err(BsmError::DataError(format!(
            "{} usable steps cannot identify {} regression coefficients",
            rows.len(),
            p
        )));
    }

    let mut design = DMatrix::zeros(rows.len(), p);
    let mut target = DVector::zeros(rows.len());
    for (i, &t) in rows.iter().enumerate() {
        let w = trace.steps[t].variance.sqrt();
        target[i] = trace.steps[t].error / w;
        for (j, col) in filtered.iter().enumerate() {
            design[(i, j)] = col[t] / w;
        }
    }

    let qr = design.clone().qr();
    let r = qr.r();
    let mut col_corr = 0.0;
    for j in 0..p {
        let d = r[(j, j)].abs();
        if d <= f64::EPSILON {
            return Err(BsmError::SingularSystem(
                "collinear regression columns".into(),
            ));
        }
        col_corr += 2.0 * d.ln();
    }
    let qty = qr.q().transpose() * &target;
    let mut beta = DVector::zeros(p);
    for j in (0..p).rev() {
        let mut s = qty[j];
        for k in (j + 1)..p {
            s -= r[(j, k)] * beta[k];
        }
        beta[j] = s / r[(j, j)];
    }
    let resid = &target - &design * &beta;
    let rtr_inv = (r.transpose() * &r)
        .try_inverse()
        .ok_or_else(|| BsmError::SingularSystem("collinear regression columns".into()))?;

    base.ssq = resid.dot(&resid);
    base.diffuse_dim += p;
    base.diffuse_correction += col_corr;
    base.coefficients = Some(beta);
    base.coefficients_cov = Some(rtr_inv);
    if base.n_obs <= base.diffuse_dim {
        return Err(BsmError::DataError(
            "too few observations for the regression columns".into(),
        ));
    }
    Ok(base)
}

/// Innovations standardized by the estimated scale; NaN at missing and
/// diffuse positions.
pub fn standardized_residuals(trace: &FilterTrace, sigma2: f64) -> Vec<f64> {
    trace
        .steps
        .iter()
        .map(|s| {
            if s.is_missing() || s.is_diffuse() || s.variance <= 0.0 {
                f64::NAN
            } else {
                s.error / (sigma2 * s.variance).sqrt()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::filter;
    use crate::params::BsmData;
    use crate::state_space::Ssm;
    use crate::types::SeasonalModel;

    fn local_level(level_var: f64, noise_var: f64) -> Ssm {
        let data = BsmData {
            level_var,
            slope_var: -1.0,
            seasonal_var: -1.0,
            seasonal_model: SeasonalModel::Dummy,
            noise_var,
            cycle_var: -1.0,
            cycle_dumping_factor: 0.9,
            cycle_length: 60.0,
        };
        Ssm::of_bsm(&data, 12).unwrap()
    }

    fn noisy_line(n: usize) -> Vec<f64> {
        let mut state = 0x1234_5678_u64;
        (0..n)
            .map(|t| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let u = (state >> 33) as f64 / (1u64 << 31) as f64 - 1.0;
                t as f64 * 0.1 + u
            })
            .collect()
    }

    #[test]
    fn test_local_level_likelihood_terms() {
        let ssm = local_level(0.5, 1.0);
        let y = [1.0, 2.0, 1.5];
        let trace = filter(&ssm, &y, false);
        let ll = loglikelihood(&trace).unwrap();

        assert_eq!(ll.n_obs, 3);
        assert_eq!(ll.diffuse_dim, 1);
        assert_eq!(ll.neff(), 2);
        // first step is diffuse with f_inf = 1, so the correction vanishes
        assert!(ll.diffuse_correction.abs() < 1e-12);
        // remaining two steps: hand recursion with p_1 = h + q
        let (q, h) = (0.5, 1.0);
        let mut a = y[0];
        let mut p = h + q;
        let mut ssq = 0.0;
        let mut log_det = 0.0;
        for &obs in &y[1..] {
            let f = p + h;
            let e = obs - a;
            ssq += e * e / f;
            log_det += f.ln();
            a += p / f * e;
            p = p - p * p / f + q;
        }
        assert!((ll.ssq - ssq).abs() < 1e-10);
        assert!((ll.log_det - log_det).abs() < 1e-10);
    }

    #[test]
    fn test_missing_values_do_not_contribute() {
        let ssm = local_level(0.5, 1.0);
        let full: Vec<f64> = noisy_line(30);
        let mut gappy = full.clone();
        gappy[7] = f64::NAN;
        gappy[8] = f64::NAN;

        let ll_full = loglikelihood(&filter(&ssm, &full, false)).unwrap();
        let ll_gap = loglikelihood(&filter(&ssm, &gappy, false)).unwrap();
        assert_eq!(ll_full.n_obs, 30);
        assert_eq!(ll_gap.n_obs, 28);
        assert!(ll_gap.concentrated().is_finite());
        assert!(ll_gap.concentrated() != ll_full.concentrated());
    }

    #[test]
    fn test_concentrated_is_max_over_scale() {
        // the concentrated likelihood equals the full likelihood of the
        // model rescaled by its own sigma2 estimate
        let ssm = local_level(0.5, 1.0);
        let y = noisy_line(40);
        let trace = filter(&ssm, &y, false);
        let ll = loglikelihood(&trace).unwrap();
        let s2 = ll.sigma2();

        let scaled = local_level(0.5 * s2, s2);
        let trace2 = filter(&scaled, &y, false);
        let ll2 = loglikelihood(&trace2).unwrap();
        assert!((ll.concentrated() - ll2.full()).abs() < 1e-8);
    }

    #[test]
    fn test_regression_profiling_removes_trend() {
        // a strong linear regressor on a noisy line gets a coefficient near
        // its true slope and improves the fit
        let n = 60;
        let y = noisy_line(n);
        let x: Vec<f64> = (0..n).map(|t| t as f64).collect();
        let ssm = local_level(1e-6, 1.0);
        let trace = filter(&ssm, &y, false);

        let plain = loglikelihood(&trace).unwrap();
        let with_x = loglikelihood_with_regressors(&ssm, &trace, &[x]).unwrap();

        let beta = with_x.coefficients.as_ref().unwrap();
        assert!((beta[0] - 0.1).abs() < 0.05);
        assert_eq!(with_x.diffuse_dim, plain.diffuse_dim + 1);
        assert!(with_x.ssq < plain.ssq);
        assert!(with_x.coefficients_cov.as_ref().unwrap()[(0, 0)] > 0.0);
    }

    #[test]
    fn test_collinear_regressors_rejected() {
        let n = 30;
        let y = noisy_line(n);
        let x: Vec<f64> = (0..n).map(|t| t as f64).collect();
        let x2: Vec<f64> = x.iter().map(|v| 2.0 * v).collect();
        let ssm = local_level(0.1, 1.0);
        let trace = filter(&ssm, &y, false);
        assert!(loglikelihood_with_regressors(&ssm, &trace, &[x, x2]).is_err());
    }

    #[test]
    fn test_standardized_residuals_unit_scale() {
        let ssm = local_level(0.2, 1.0);
        let y = noisy_line(50);
        let trace = filter(&ssm, &y, false);
        let ll = loglikelihood(&trace).unwrap();
        let resid = standardized_residuals(&trace, ll.sigma2());

        assert!(resid[0].is_nan()); // diffuse step
        let finite: Vec<f64> = resid.iter().copied().filter(|r| r.is_finite()).collect();
        assert_eq!(finite.len(), ll.neff());
        let ssq: f64 = finite.iter().map(|r| r * r).sum();
        // by construction the standardized ssq equals neff
        assert!((ssq - ll.neff() as f64).abs() < 1e-8);
    }
}
