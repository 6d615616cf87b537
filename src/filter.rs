//! Diffuse ordinary Kalman filter.
//!
//! Forward recursion over the predicted mean `a` and the covariance split
//! `(P, P_inf)`: `P` is the proper part, `P_inf` the exact diffuse part.
//! Every informative observation with `Z P_inf Z' > 0` resolves one diffuse
//! direction; once all of them are resolved the recursion is an ordinary
//! Kalman filter. No large-variance approximation is made at any point.

use nalgebra::{DMatrix, DVector};

use crate::state_space::Ssm;

/// Threshold below which the diffuse prediction variance counts as zero.
pub const DIFFUSE_EPS: f64 = 1e-8;

/// One step of the filtering trace.
#[derive(Debug, Clone)]
pub struct FilterStep {
    /// One-step prediction error; NaN for a missing observation.
    pub error: f64,
    /// Regular prediction variance `Z P Z' + h`.
    pub variance: f64,
    /// Diffuse prediction variance `Z P_inf Z'`; positive only while the
    /// diffuse subspace is nonempty.
    pub diffuse_variance: f64,
    /// Regular gain numerator `P Z`.
    pub gain: DVector<f64>,
    /// Diffuse gain numerator `P_inf Z`.
    pub diffuse_gain: DVector<f64>,
}

impl FilterStep {
    pub fn is_missing(&self) -> bool {
        self.error.is_nan()
    }

    pub fn is_diffuse(&self) -> bool {
        self.diffuse_variance > DIFFUSE_EPS
    }
}

/// Append-only output of the forward pass.
#[derive(Debug, Clone)]
pub struct FilterTrace {
    pub steps: Vec<FilterStep>,
    /// First position at which the diffuse subspace is empty; equal to the
    /// series length when the design never resolves it.
    pub end_diffuse: usize,
    /// Predicted states `a_t`, kept only when requested for smoothing.
    pub states: Vec<DVector<f64>>,
    /// Predicted proper covariances `P_t`.
    pub covs: Vec<DMatrix<f64>>,
    /// Predicted diffuse covariances `P_inf_t`.
    pub diffuse_covs: Vec<DMatrix<f64>>,
}

impl FilterTrace {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn has_states(&self) -> bool {
        !self.states.is_empty()
    }
}

/// Run the diffuse filter over `y` (`NaN` marks missing observations).
///
/// With `keep_states` the predicted state and both covariance parts are
/// materialized per step, which the backward smoothers require.
pub fn filter(ssm: &Ssm, y: &[f64], keep_states: bool) -> FilterTrace {
    let n = y.len();
    let m = ssm.dim;
    let t_mat = &ssm.transition;
    let z = &ssm.loading;
    let h = ssm.measurement_var;

    let mut a = ssm.init.a0.clone();
    let mut p = ssm.init.p0.clone();
    let mut p_inf = ssm.init.p_inf.clone();
    let mut resolved = 0usize;
    let mut diffuse_done = ssm.init.diffuse_dim == 0;

    let mut trace = FilterTrace {
        steps: Vec::with_capacity(n),
        end_diffuse: 0,
        states: if keep_states { Vec::with_capacity(n) } else { Vec::new() },
        covs: if keep_states { Vec::with_capacity(n) } else { Vec::new() },
        diffuse_covs: if keep_states { Vec::with_capacity(n) } else { Vec::new() },
    };

    let invariant_q = if ssm.is_time_invariant() {
        Some(ssm.state_cov.clone())
    } else {
        None
    };

    for t in 0..n {
        let c_inf = &p_inf * z;
        let f_inf = z.dot(&c_inf);
        let c = &p * z;
        let f = z.dot(&c) + h;
        let missing = !y[t].is_finite();
        let e = if missing { f64::NAN } else { y[t] - z.dot(&a) };

        if keep_states {
            trace.states.push(a.clone());
            trace.covs.push(p.clone());
            trace.diffuse_covs.push(p_inf.clone());
        }
        trace.steps.push(FilterStep {
            error: e,
            variance: f,
            diffuse_variance: f_inf,
            gain: c.clone(),
            diffuse_gain: c_inf.clone(),
        });

        // Measurement update
        if !missing && f_inf > DIFFUSE_EPS {
            // Diffuse branch: resolves one diffuse direction.
            a += &c_inf * (e / f_inf);
            let cross = (&c_inf * c.transpose() + &c * c_inf.transpose()) / f_inf;
            p += &c_inf * c_inf.transpose() * (f / (f_inf * f_inf)) - cross;
            p_inf -= &c_inf * c_inf.transpose() / f_inf;
            resolved += 1;
            if resolved >= ssm.init.diffuse_dim {
                p_inf.fill(0.0);
            }
        } else if !missing && f > 0.0 {
            a += &c * (e / f);
            p -= &c * c.transpose() / f;
        }
        // Missing (or degenerate f): prediction only.

        if !diffuse_done && p_inf.norm() <= DIFFUSE_EPS {
            diffuse_done = true;
            trace.end_diffuse = t + 1;
        }

        // Time update
        a = t_mat * a;
        p = t_mat * &p * t_mat.transpose();
        match &invariant_q {
            Some(q) => p += q,
            None => p += ssm.state_cov_at(t),
        }
        // keep symmetry against floating drift
        p = (&p + p.transpose()) * 0.5;
        if !diffuse_done {
            p_inf = t_mat * &p_inf * t_mat.transpose();
            p_inf = (&p_inf + p_inf.transpose()) * 0.5;
        }
    }

    if !diffuse_done {
        // rank-deficient design: the diffuse phase never ends
        trace.end_diffuse = n;
    }
    trace
}

/// Replay the filter's (data-independent) gains on an auxiliary series,
/// producing its one-step innovations under the same linear transform that
/// was applied to `y`. Used for regression columns: the whole innovation
/// operator is linear, so regressors are filtered with zero initial state.
pub fn filter_auxiliary(ssm: &Ssm, trace: &FilterTrace, x: &[f64]) -> Vec<f64> {
    let t_mat = &ssm.transition;
    let z = &ssm.loading;
    let mut a: DVector<f64> = DVector::zeros(ssm.dim);
    let mut out = Vec::with_capacity(x.len());

    for (t, step) in trace.steps.iter().enumerate() {
        let e = x[t] - z.dot(&a);
        out.push(e);
        if !step.is_missing() {
            if step.is_diffuse() {
                a += &step.diffuse_gain * (e / step.diffuse_variance);
            } else if step.variance > 0.0 {
                a += &step.gain * (e / step.variance);
            }
        }
        a = t_mat * a;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::BsmData;
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

    fn cycle_only(var: f64, rho: f64, length: f64) -> Ssm {
        let data = BsmData {
            level_var: -1.0,
            slope_var: -1.0,
            seasonal_var: -1.0,
            seasonal_model: SeasonalModel::Dummy,
            noise_var: 1.0,
            cycle_var: var,
            cycle_dumping_factor: rho,
            cycle_length: length,
        };
        Ssm::of_bsm(&data, 12).unwrap()
    }

    #[test]
    fn test_local_level_collapses_after_one_observation() {
        let ssm = local_level(0.5, 1.0);
        let y = [1.0, 2.0, 1.5, 1.8];
        let trace = filter(&ssm, &y, false);

        assert_eq!(trace.end_diffuse, 1);
        assert!(trace.steps[0].is_diffuse());
        assert!(!trace.steps[1].is_diffuse());
        // after the collapse the filter is a steady ordinary recursion
        for step in &trace.steps[1..] {
            assert_eq!(step.diffuse_variance, 0.0);
            assert!(step.variance > 1.0); // h + positive level uncertainty
        }
    }

    #[test]
    fn test_local_level_regular_steps_match_hand_recursion() {
        // After the diffuse step, a local level filter obeys
        //   p_{t+1} = p_t - p_t^2/(p_t + h) + q,  a updated by gain p/(p+h).
        let q = 0.3;
        let h = 1.0;
        let ssm = local_level(q, h);
        let y = [2.0, 2.5, 1.5, 3.0, 2.2];
        let trace = filter(&ssm, &y, true);

        // exact diffuse step: a_1 = y_0 and p_1 = h + q
        assert!((trace.states[1][0] - y[0]).abs() < 1e-12);
        assert!((trace.covs[1][(0, 0)] - (h + q)).abs() < 1e-12);

        let mut a = y[0];
        let mut p = h + q;
        for t in 1..y.len() {
            let f = p + h;
            assert!((trace.steps[t].variance - f).abs() < 1e-12);
            assert!((trace.steps[t].error - (y[t] - a)).abs() < 1e-12);
            a += p / f * (y[t] - a);
            p = p - p * p / f + q;
        }
    }

    #[test]
    fn test_missing_observations_skip_update() {
        let ssm = local_level(0.5, 1.0);
        let y = [1.0, f64::NAN, 1.5];
        let trace = filter(&ssm, &y, true);

        assert!(trace.steps[1].is_missing());
        // state unchanged through the missing step, variance inflated by q
        assert!((trace.states[2][0] - trace.states[1][0]).abs() < 1e-12);
        assert!((trace.covs[2][(0, 0)] - (trace.covs[1][(0, 0)] + 0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_leading_missing_delays_collapse() {
        let ssm = local_level(0.5, 1.0);
        let y = [f64::NAN, f64::NAN, 1.0, 2.0];
        let trace = filter(&ssm, &y, false);
        // collapse needs one informative observation
        assert_eq!(trace.end_diffuse, 3);
        assert!(trace.steps[2].is_diffuse());
    }

    #[test]
    fn test_proper_model_reduces_to_ordinary_kalman() {
        // cycle + noise: no diffuse directions at all
        let ssm = cycle_only(0.4, 0.8, 20.0);
        assert_eq!(ssm.init.diffuse_dim, 0);
        let y = [0.5, -0.2, 0.7, 0.1, -0.4, 0.3];
        let trace = filter(&ssm, &y, false);

        assert_eq!(trace.end_diffuse, 0);

        // reference: plain Kalman filter written out directly
        let t_mat = &ssm.transition;
        let z = &ssm.loading;
        let mut a = ssm.init.a0.clone();
        let mut p = ssm.init.p0.clone();
        for (t, &obs) in y.iter().enumerate() {
            let c = &p * z;
            let f = z.dot(&c) + ssm.measurement_var;
            let e = obs - z.dot(&a);
            assert!(trace.steps[t].diffuse_variance.abs() < 1e-14);
            assert!((trace.steps[t].variance - f).abs() < 1e-12);
            assert!((trace.steps[t].error - e).abs() < 1e-12);
            a += &c * (e / f);
            p -= &c * c.transpose() / f;
            a = t_mat * a;
            p = t_mat * &p * t_mat.transpose() + &ssm.state_cov;
            p = (&p + p.transpose()) * 0.5;
        }
    }

    #[test]
    fn test_full_bsm_collapse_position() {
        let data = BsmData {
            level_var: 0.1,
            slope_var: 0.01,
            seasonal_var: 0.05,
            seasonal_model: SeasonalModel::Dummy,
            noise_var: 1.0,
            cycle_var: -1.0,
            cycle_dumping_factor: 0.9,
            cycle_length: 60.0,
        };
        let ssm = Ssm::of_bsm(&data, 12).unwrap();
        assert_eq!(ssm.init.diffuse_dim, 13);
        let y: Vec<f64> = (0..40).map(|t| (t as f64 * 0.7).sin()).collect();
        let trace = filter(&ssm, &y, false);
        // one diffuse direction per informative observation
        assert_eq!(trace.end_diffuse, 13);
        for step in &trace.steps[..13] {
            assert!(step.is_diffuse());
        }
        assert!(!trace.steps[13].is_diffuse());
    }

    #[test]
    fn test_auxiliary_filter_is_linear() {
        let ssm = local_level(0.5, 1.0);
        let y = [1.0, 2.0, 1.5, 1.8, 2.2];
        let trace = filter(&ssm, &y, false);

        let x1 = [1.0, 0.0, 0.0, 0.0, 0.0];
        let x2 = [0.0, 1.0, 1.0, 1.0, 1.0];
        let e1 = filter_auxiliary(&ssm, &trace, &x1);
        let e2 = filter_auxiliary(&ssm, &trace, &x2);
        let sum: Vec<f64> = x1.iter().zip(&x2).map(|(a, b)| 2.0 * a + 3.0 * b).collect();
        let es = filter_auxiliary(&ssm, &trace, &sum);
        for t in 0..y.len() {
            assert!((es[t] - (2.0 * e1[t] + 3.0 * e2[t])).abs() < 1e-10);
        }
    }

    #[test]
    fn test_auxiliary_filter_of_y_reproduces_errors() {
        let ssm = local_level(0.3, 1.0);
        let y = [1.0, 2.0, 1.5, 1.8, 2.2, 0.9];
        let trace = filter(&ssm, &y, false);
        let replay = filter_auxiliary(&ssm, &trace, &y);
        for (t, step) in trace.steps.iter().enumerate() {
            assert!((replay[t] - step.error).abs() < 1e-10);
        }
    }
}
