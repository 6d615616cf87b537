//! Backward smoothing passes over a finished forward filter.
//!
//! The state smoother carries the usual weighted-error vector `r` and
//! information matrix `N`, extended with first and second order terms while
//! the backward pass is inside the diffuse phase. The disturbance smoother
//! reads the same recursion before each backward update.

use nalgebra::{DMatrix, DVector};

use crate::error::{BsmError, Result};
use crate::filter::FilterTrace;
use crate::state_space::Ssm;
use crate::types::Component;

/// Smoothed state means and covariances, one per observation time.
#[derive(Debug, Clone)]
pub struct SmoothedStates {
    pub states: Vec<DVector<f64>>,
    pub covs: Vec<DMatrix<f64>>,
}

/// Smoothed disturbances of both equations.
#[derive(Debug, Clone)]
pub struct SmoothedDisturbances {
    /// State innovation means `E[eta_t | y]`.
    pub state: Vec<DVector<f64>>,
    /// Their covariances.
    pub state_var: Vec<DMatrix<f64>>,
    /// Measurement error means `E[eps_t | y]`; zero at missing times.
    pub measurement: Vec<f64>,
    pub measurement_var: Vec<f64>,
}

/// One smoothed component series with its pointwise standard errors.
#[derive(Debug, Clone)]
pub struct ComponentSeries {
    pub component: Component,
    pub values: Vec<f64>,
    pub stderr: Vec<f64>,
}

/// Smoothed decomposition of the observations into component series.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub series: Vec<ComponentSeries>,
}

impl Decomposition {
    pub fn component(&self, c: Component) -> Option<&ComponentSeries> {
        self.series.iter().find(|s| s.component == c)
    }
}

struct BackwardState {
    r0: DVector<f64>,
    r1: DVector<f64>,
    n0: DMatrix<f64>,
    n1: DMatrix<f64>,
    n2: DMatrix<f64>,
}

impl BackwardState {
    fn new(m: usize) -> Self {
        Self {
            r0: DVector::zeros(m),
            r1: DVector::zeros(m),
            n0: DMatrix::zeros(m, m),
            n1: DMatrix::zeros(m, m),
            n2: DMatrix::zeros(m, m),
        }
    }

    /// Absorb step `t` of the trace, moving from `(r_t, N_t)` to
    /// `(r_{t-1}, N_{t-1})`.
    fn absorb(&mut self, ssm: &Ssm, trace: &FilterTrace, t: usize) {
        let t_mat = &ssm.transition;
        let z = &ssm.loading;
        let step = &trace.steps[t];

        if !step.is_missing() && step.is_diffuse() {
            let f_inf = step.diffuse_variance;
            let f = step.variance;
            let k0 = t_mat * &step.diffuse_gain / f_inf;
            let k1 = t_mat * (&step.gain / f_inf - &step.diffuse_gain * (f / (f_inf * f_inf)));
            let l0 = t_mat - &k0 * z.transpose();
            let l1 = -&k1 * z.transpose();
            let zz = z * z.transpose();

            let r1 = z * (step.error / f_inf) + l0.transpose() * &self.r1
                + l1.transpose() * &self.r0;
            let r0 = l0.transpose() * &self.r0;
            let n2 = -&zz * (f / (f_inf * f_inf))
                + l0.transpose() * &self.n2 * &l0
                + l1.transpose() * &self.n1 * &l0
                + l0.transpose() * &self.n1 * &l1
                + l1.transpose() * &self.n0 * &l1;
            let n1 = &zz / f_inf
                + l0.transpose() * &self.n1 * &l0
                + l1.transpose() * &self.n0 * &l0
                + l0.transpose() * &self.n0 * &l1;
            let n0 = l0.transpose() * &self.n0 * &l0;
            self.r0 = r0;
            self.r1 = r1;
            self.n0 = n0;
            self.n1 = n1;
            self.n2 = n2;
        } else {
            // Missing observations and the post-collapse phase share one
            // recursion; a missing step simply has a zero gain.
            let l = if step.is_missing() || step.variance <= 0.0 {
                t_mat.clone()
            } else {
                t_mat - (t_mat * &step.gain / step.variance) * z.transpose()
            };
            if !step.is_missing() && step.variance > 0.0 {
                self.r0 = z * (step.error / step.variance) + l.transpose() * &self.r0;
                self.n0 = z * z.transpose() / step.variance + l.transpose() * &self.n0 * &l;
            } else {
                self.r0 = l.transpose() * &self.r0;
                self.n0 = l.transpose() * &self.n0 * &l;
            }
            self.r1 = l.transpose() * &self.r1;
            self.n1 = l.transpose() * &self.n1 * &l;
            self.n2 = l.transpose() * &self.n2 * &l;
        }
    }
}

fn require_states(trace: &FilterTrace) -> Result<()> {
    if !trace.has_states() {
        return Err(BsmError::StateSpaceError(
            "smoothing needs a trace filtered with kept states".into(),
        ));
    }
    Ok(())
}

/// Fixed-interval state smoother.
pub fn smooth_states(ssm: &Ssm, trace: &FilterTrace) -> Result<SmoothedStates> {
    require_states(trace)?;
    let n = trace.len();
    let mut bw = BackwardState::new(ssm.dim);
    let mut states = vec![DVector::zeros(ssm.dim); n];
    let mut covs = vec![DMatrix::zeros(ssm.dim, ssm.dim); n];

    for t in (0..n).rev() {
        bw.absorb(ssm, trace, t);
        let p = &trace.covs[t];
        let p_inf = &trace.diffuse_covs[t];
        states[t] = &trace.states[t] + p * &bw.r0 + p_inf * &bw.r1;
        let mut v = p - p * &bw.n0 * p
            - p * &bw.n1 * p_inf
            - p_inf * &bw.n1 * p
            - p_inf * &bw.n2 * p_inf;
        v = (&v + v.transpose()) * 0.5;
        covs[t] = v;
    }
    Ok(SmoothedStates { states, covs })
}

/// Disturbance smoother for both state innovations and measurement errors.
pub fn smooth_disturbances(ssm: &Ssm, trace: &FilterTrace) -> Result<SmoothedDisturbances> {
    require_states(trace)?;
    let n = trace.len();
    let h = ssm.measurement_var;
    let t_mat = &ssm.transition;
    let mut bw = BackwardState::new(ssm.dim);
    let mut out = SmoothedDisturbances {
        state: vec![DVector::zeros(ssm.dim); n],
        state_var: vec![DMatrix::zeros(ssm.dim, ssm.dim); n],
        measurement: vec![0.0; n],
        measurement_var: vec![h; n],
    };

    for t in (0..n).rev() {
        // eta_t and eps_t condition on the backward state before step t is
        // absorbed
        let q = if ssm.is_time_invariant() {
            ssm.state_cov.clone()
        } else {
            ssm.state_cov_at(t)
        };
        out.state[t] = &q * &bw.r0;
        let mut sv = &q - &q * &bw.n0 * &q;
        sv = (&sv + sv.transpose()) * 0.5;
        out.state_var[t] = sv;

        let step = &trace.steps[t];
        if !step.is_missing() {
            if step.is_diffuse() {
                let k0 = t_mat * &step.diffuse_gain / step.diffuse_variance;
                let u = -k0.dot(&bw.r0);
                out.measurement[t] = h * u;
                out.measurement_var[t] = h - h * h * (&k0.transpose() * &bw.n0 * &k0)[(0, 0)];
            } else if step.variance > 0.0 {
                let k = t_mat * &step.gain / step.variance;
                let u = step.error / step.variance - k.dot(&bw.r0);
                out.measurement[t] = h * u;
                out.measurement_var[t] = h
                    - h * h * (1.0 / step.variance + (&k.transpose() * &bw.n0 * &k)[(0, 0)]);
            }
        }

        bw.absorb(ssm, trace, t);
    }
    Ok(out)
}

/// Read each component series out of the smoothed states.
///
/// `sigma2` is the common variance scale estimated alongside the model;
/// standard errors are reported on the observation scale.
pub fn decompose(ssm: &Ssm, trace: &FilterTrace, sigma2: f64) -> Result<Decomposition> {
    let smoothed = smooth_states(ssm, trace)?;
    let n = trace.len();
    let mut series = Vec::new();

    for &(component, off, len) in &ssm.blocks {
        // The slope is not loaded into the observation; read it directly.
        let w = if component == Component::Slope {
            DVector::from_element(1, 1.0)
        } else {
            match ssm.block_loading(component) {
                Some(w) => w,
                None => continue,
            }
        };
        let mut values = Vec::with_capacity(n);
        let mut stderr = Vec::with_capacity(n);
        for t in 0..n {
            let a = smoothed.states[t].rows(off, len);
            let v = smoothed.covs[t].view((off, off), (len, len));
            values.push(w.dot(&a.clone_owned()));
            let var = (&w.transpose() * v * &w)[(0, 0)].max(0.0);
            stderr.push((sigma2 * var).sqrt());
        }
        series.push(ComponentSeries {
            component,
            values,
            stderr,
        });
    }
    Ok(Decomposition { series })
}
