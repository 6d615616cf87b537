//! Per-component state-space dynamics.
//!
//! Each structural component contributes a contiguous block of the state:
//! its transition block, observation loading, innovation covariance and
//! (proper or diffuse) initialization. Dispatch is by enum, not trait
//! objects, so the per-time-step filter loop stays monomorphic.

use nalgebra::{DMatrix, DVector};

use crate::types::SeasonalModel;

/// A structural component with concrete parameter values.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentKind {
    /// Local level, optionally with a stochastic slope (local linear trend).
    LocalLevel {
        level_var: f64,
        slope_var: Option<f64>,
    },
    /// Stochastic seasonal of the given period.
    Seasonal {
        model: SeasonalModel,
        period: usize,
        var: f64,
    },
    /// Damped stochastic cycle with frequency `2*pi/length`.
    Cycle {
        var: f64,
        dumping: f64,
        length: f64,
    },
}

impl ComponentKind {
    /// State dimension of the component's block.
    pub fn dim(&self) -> usize {
        match self {
            ComponentKind::LocalLevel { slope_var, .. } => {
                if slope_var.is_some() {
                    2
                } else {
                    1
                }
            }
            ComponentKind::Seasonal { period, .. } => period - 1,
            ComponentKind::Cycle { .. } => 2,
        }
    }

    /// Diffuse dimension: non-stationary components are fully diffuse, the
    /// cycle is stationary and contributes none.
    pub fn diffuse_dim(&self) -> usize {
        match self {
            ComponentKind::Cycle { .. } => 0,
            _ => self.dim(),
        }
    }

    /// Whether the component injects state noise at all; a zero variance
    /// collapses it to a deterministic recursion.
    pub fn has_innovations(&self) -> bool {
        match self {
            ComponentKind::LocalLevel {
                level_var,
                slope_var,
            } => *level_var > 0.0 || slope_var.map_or(false, |v| v > 0.0),
            ComponentKind::Seasonal { var, .. } => *var > 0.0,
            ComponentKind::Cycle { var, .. } => *var > 0.0,
        }
    }

    /// Write the transition block `T` at `(at, at)`.
    pub fn fill_transition(&self, t: &mut DMatrix<f64>, at: usize) {
        match self {
            ComponentKind::LocalLevel { slope_var, .. } => {
                t[(at, at)] = 1.0;
                if slope_var.is_some() {
                    t[(at, at + 1)] = 1.0;
                    t[(at + 1, at + 1)] = 1.0;
                }
            }
            ComponentKind::Seasonal { model, period, .. } => {
                let s = *period;
                match model {
                    SeasonalModel::Trigonometric => {
                        let mut off = at;
                        for j in 1..=(s / 2) {
                            let lambda = 2.0 * std::f64::consts::PI * j as f64 / s as f64;
                            let (sin, cos) = lambda.sin_cos();
                            if 2 * j < s {
                                t[(off, off)] = cos;
                                t[(off, off + 1)] = sin;
                                t[(off + 1, off)] = -sin;
                                t[(off + 1, off + 1)] = cos;
                                off += 2;
                            } else {
                                // Nyquist harmonic for even periods
                                t[(off, off)] = -1.0;
                                off += 1;
                            }
                        }
                    }
                    _ => {
                        // Sum-to-zero recursion: the new effect is minus the
                        // sum of the previous s-1, the rest shift down.
                        for j in 0..s - 1 {
                            t[(at, at + j)] = -1.0;
                        }
                        for i in 0..s - 2 {
                            t[(at + i + 1, at + i)] = 1.0;
                        }
                    }
                }
            }
            ComponentKind::Cycle {
                dumping, length, ..
            } => {
                let lambda = 2.0 * std::f64::consts::PI / length;
                let (sin, cos) = lambda.sin_cos();
                t[(at, at)] = dumping * cos;
                t[(at, at + 1)] = dumping * sin;
                t[(at + 1, at)] = -dumping * sin;
                t[(at + 1, at + 1)] = dumping * cos;
            }
        }
    }

    /// Write the observation loading `Z` at `at`.
    pub fn fill_loading(&self, z: &mut DVector<f64>, at: usize) {
        match self {
            ComponentKind::LocalLevel { .. } => z[at] = 1.0,
            ComponentKind::Seasonal { model, period, .. } => match model {
                SeasonalModel::Trigonometric => {
                    let s = *period;
                    let mut off = at;
                    for j in 1..=(s / 2) {
                        z[off] = 1.0;
                        off += if 2 * j < s { 2 } else { 1 };
                    }
                }
                _ => z[at] = 1.0,
            },
            ComponentKind::Cycle { .. } => z[at] = 1.0,
        }
    }

    /// Write the innovation covariance block `Q` at `(at, at)`.
    pub fn fill_innovation(&self, q: &mut DMatrix<f64>, at: usize) {
        match self {
            ComponentKind::LocalLevel {
                level_var,
                slope_var,
            } => {
                q[(at, at)] = level_var.max(0.0);
                if let Some(sv) = slope_var {
                    q[(at + 1, at + 1)] = sv.max(0.0);
                }
            }
            ComponentKind::Seasonal { model, period, var } => {
                let v = var.max(0.0);
                let m = period - 1;
                match model {
                    // Shock hits the current effect only.
                    SeasonalModel::Dummy => q[(at, at)] = v,
                    // Identical shock on every stored effect.
                    SeasonalModel::Crude => {
                        for i in 0..m {
                            for j in 0..m {
                                q[(at + i, at + j)] = v;
                            }
                        }
                    }
                    // Balanced shocks summing to zero over the full cycle.
                    SeasonalModel::HarrisonStevens => {
                        let s = *period as f64;
                        for i in 0..m {
                            for j in 0..m {
                                q[(at + i, at + j)] =
                                    if i == j { v * (1.0 - 1.0 / s) } else { -v / s };
                            }
                        }
                    }
                    SeasonalModel::Trigonometric => {
                        for i in 0..m {
                            q[(at + i, at + i)] = v;
                        }
                    }
                }
            }
            ComponentKind::Cycle { var, .. } => {
                let v = var.max(0.0);
                q[(at, at)] = v;
                q[(at + 1, at + 1)] = v;
            }
        }
    }

    /// Write the initial covariance contribution: proper (stationary)
    /// variance into `p0`, diffuse subspace indicator into `p_inf`.
    pub fn fill_initial(&self, p0: &mut DMatrix<f64>, p_inf: &mut DMatrix<f64>, at: usize) {
        match self {
            ComponentKind::Cycle { var, dumping, .. } => {
                // Stationary solution of P = rho^2 P + var I.
                let denom = (1.0 - dumping * dumping).max(f64::EPSILON);
                let v = var.max(0.0) / denom;
                p0[(at, at)] = v;
                p0[(at + 1, at + 1)] = v;
            }
            _ => {
                for i in 0..self.dim() {
                    p_inf[(at + i, at + i)] = 1.0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeros(n: usize) -> (DMatrix<f64>, DVector<f64>) {
        (DMatrix::zeros(n, n), DVector::zeros(n))
    }

    #[test]
    fn test_local_linear_trend_block() {
        let c = ComponentKind::LocalLevel {
            level_var: 0.1,
            slope_var: Some(0.01),
        };
        assert_eq!(c.dim(), 2);
        assert_eq!(c.diffuse_dim(), 2);

        let (mut t, mut z) = zeros(2);
        c.fill_transition(&mut t, 0);
        c.fill_loading(&mut z, 0);
        assert_eq!(t[(0, 0)], 1.0);
        assert_eq!(t[(0, 1)], 1.0);
        assert_eq!(t[(1, 0)], 0.0);
        assert_eq!(t[(1, 1)], 1.0);
        assert_eq!(z[0], 1.0);
        assert_eq!(z[1], 0.0);
    }

    #[test]
    fn test_dummy_seasonal_sums_to_zero() {
        let c = ComponentKind::Seasonal {
            model: SeasonalModel::Dummy,
            period: 4,
            var: 1.0,
        };
        assert_eq!(c.dim(), 3);

        let (mut t, mut z) = zeros(3);
        c.fill_transition(&mut t, 0);
        c.fill_loading(&mut z, 0);
        // gamma_{t+1} = -(gamma_t + gamma_{t-1} + gamma_{t-2})
        for j in 0..3 {
            assert_eq!(t[(0, j)], -1.0);
        }
        assert_eq!(t[(1, 0)], 1.0);
        assert_eq!(t[(2, 1)], 1.0);
        assert_eq!(z[0], 1.0);

        let mut q = DMatrix::zeros(3, 3);
        c.fill_innovation(&mut q, 0);
        assert_eq!(q[(0, 0)], 1.0);
        assert_eq!(q[(1, 1)], 0.0);
    }

    #[test]
    fn test_harrison_stevens_covariance_rows() {
        let c = ComponentKind::Seasonal {
            model: SeasonalModel::HarrisonStevens,
            period: 4,
            var: 2.0,
        };
        let mut q = DMatrix::zeros(3, 3);
        c.fill_innovation(&mut q, 0);
        assert!((q[(0, 0)] - 1.5).abs() < 1e-12); // 2*(1 - 1/4)
        assert!((q[(0, 1)] + 0.5).abs() < 1e-12); // -2/4
        // symmetric
        assert_eq!(q[(1, 2)], q[(2, 1)]);
    }

    #[test]
    fn test_trigonometric_even_period() {
        let c = ComponentKind::Seasonal {
            model: SeasonalModel::Trigonometric,
            period: 12,
            var: 1.0,
        };
        assert_eq!(c.dim(), 11);

        let (mut t, mut z) = zeros(11);
        c.fill_transition(&mut t, 0);
        c.fill_loading(&mut z, 0);

        // 5 rotation pairs + Nyquist state
        assert_eq!(t[(10, 10)], -1.0);
        // first harmonic: cos(pi/6)
        let cos = (std::f64::consts::PI / 6.0).cos();
        assert!((t[(0, 0)] - cos).abs() < 1e-12);
        assert!((t[(0, 1)] + t[(1, 0)]).abs() < 1e-12);
        // loading picks every cosine state plus the Nyquist state
        let loaded: Vec<usize> = (0..11).filter(|&i| z[i] != 0.0).collect();
        assert_eq!(loaded, vec![0, 2, 4, 6, 8, 10]);
    }

    #[test]
    fn test_trigonometric_odd_period() {
        let c = ComponentKind::Seasonal {
            model: SeasonalModel::Trigonometric,
            period: 5,
            var: 1.0,
        };
        assert_eq!(c.dim(), 4);
        let (mut t, mut z) = zeros(4);
        c.fill_transition(&mut t, 0);
        c.fill_loading(&mut z, 0);
        // two full rotation pairs, no Nyquist state
        let loaded: Vec<usize> = (0..4).filter(|&i| z[i] != 0.0).collect();
        assert_eq!(loaded, vec![0, 2]);
        assert!(t[(3, 3)] != -1.0);
    }

    #[test]
    fn test_cycle_is_stationary() {
        let c = ComponentKind::Cycle {
            var: 0.5,
            dumping: 0.8,
            length: 24.0,
        };
        assert_eq!(c.diffuse_dim(), 0);

        let mut p0 = DMatrix::zeros(2, 2);
        let mut p_inf = DMatrix::zeros(2, 2);
        c.fill_initial(&mut p0, &mut p_inf, 0);
        // var / (1 - rho^2)
        assert!((p0[(0, 0)] - 0.5 / 0.36).abs() < 1e-10);
        assert_eq!(p_inf[(0, 0)], 0.0);

        // transition is rho times an orthogonal rotation
        let mut t = DMatrix::zeros(2, 2);
        c.fill_transition(&mut t, 0);
        let tt = &t * t.transpose();
        assert!((tt[(0, 0)] - 0.64).abs() < 1e-12);
        assert!(tt[(0, 1)].abs() < 1e-12);
    }

    #[test]
    fn test_zero_variance_is_deterministic() {
        let c = ComponentKind::Seasonal {
            model: SeasonalModel::Dummy,
            period: 12,
            var: 0.0,
        };
        assert!(!c.has_innovations());
        let mut q = DMatrix::zeros(11, 11);
        c.fill_innovation(&mut q, 0);
        assert_eq!(q.norm(), 0.0);
    }
}
