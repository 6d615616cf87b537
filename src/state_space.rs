use nalgebra::{DMatrix, DVector};

use crate::components::ComponentKind;
use crate::error::{BsmError, Result};
use crate::initialization::DiffuseInit;
use crate::params::BsmData;
use crate::types::Component;

/// Composed linear-Gaussian state-space model.
///
/// State equation:  alpha_{t+1} = T * alpha_t + eta_t,  eta_t ~ N(0, Q_t)
/// Observation:     y_t         = Z' * alpha_t + eps_t, eps_t ~ N(0, h)
///
/// Immutable per estimation trial; safe to share read-only across threads.
#[derive(Debug, Clone)]
pub struct Ssm {
    pub dim: usize,
    pub transition: DMatrix<f64>,
    pub loading: DVector<f64>,
    /// Time-invariant part of the state innovation covariance.
    pub state_cov: DMatrix<f64>,
    /// Irregular (measurement) variance.
    pub measurement_var: f64,
    pub init: DiffuseInit,
    /// Component tag, state offset and block length, in state order.
    pub blocks: Vec<(Component, usize, usize)>,
    /// Heteroskedastic seasonal variant: per-time multiplicative factor on
    /// the seasonal innovation block. `None` means time-invariant.
    seasonal_scale: Option<Vec<f64>>,
    /// Seasonal innovation block alone, kept when `seasonal_scale` is set.
    seasonal_cov: Option<DMatrix<f64>>,
}

impl Ssm {
    /// Assemble the state space for a BSM. Components with negative variance
    /// are absent and allocate no state; the irregular maps to the
    /// measurement variance.
    pub fn of_bsm(data: &BsmData, period: usize) -> Result<Self> {
        Self::of_bsm_scaled(data, period, None)
    }

    /// Like [`of_bsm`](Self::of_bsm) but with a per-time variance factor on
    /// the seasonal innovations.
    pub fn of_bsm_scaled(
        data: &BsmData,
        period: usize,
        seasonal_scale: Option<Vec<f64>>,
    ) -> Result<Self> {
        let mut kinds: Vec<(Component, ComponentKind)> = Vec::new();

        if data.level_var >= 0.0 {
            kinds.push((
                Component::Level,
                ComponentKind::LocalLevel {
                    level_var: data.level_var,
                    slope_var: if data.slope_var >= 0.0 {
                        Some(data.slope_var)
                    } else {
                        None
                    },
                },
            ));
        } else if data.slope_var >= 0.0 {
            return Err(BsmError::StateSpaceError(
                "slope component requires a level component".into(),
            ));
        }

        if data.seasonal_var >= 0.0 {
            if period < 2 {
                return Err(BsmError::StateSpaceError(format!(
                    "seasonal component requires period >= 2, got {}",
                    period
                )));
            }
            kinds.push((
                Component::Seasonal,
                ComponentKind::Seasonal {
                    model: data.seasonal_model,
                    period,
                    var: data.seasonal_var,
                },
            ));
        }

        if data.cycle_var >= 0.0 {
            let rho = data.cycle_dumping_factor;
            if !(0.0 < rho && rho < 1.0) {
                return Err(BsmError::StateSpaceError(format!(
                    "cycle damping factor must lie in (0, 1), got {}",
                    rho
                )));
            }
            if data.cycle_length < 2.0 {
                return Err(BsmError::StateSpaceError(format!(
                    "cycle length must be >= 2, got {}",
                    data.cycle_length
                )));
            }
            kinds.push((
                Component::Cycle,
                ComponentKind::Cycle {
                    var: data.cycle_var,
                    dumping: rho,
                    length: data.cycle_length,
                },
            ));
        }

        if kinds.is_empty() && data.noise_var < 0.0 {
            return Err(BsmError::StateSpaceError("model has no components".into()));
        }

        let dim: usize = kinds.iter().map(|(_, k)| k.dim()).sum();
        let mut transition = DMatrix::zeros(dim, dim);
        let mut loading = DVector::zeros(dim);
        let mut state_cov = DMatrix::zeros(dim, dim);
        let mut p0 = DMatrix::zeros(dim, dim);
        let mut p_inf = DMatrix::zeros(dim, dim);
        let mut blocks = Vec::with_capacity(kinds.len());
        let mut seasonal_cov = None;

        let mut at = 0;
        let mut diffuse_dim = 0;
        for (tag, kind) in &kinds {
            kind.fill_transition(&mut transition, at);
            kind.fill_loading(&mut loading, at);
            kind.fill_innovation(&mut state_cov, at);
            kind.fill_initial(&mut p0, &mut p_inf, at);
            if *tag == Component::Seasonal && seasonal_scale.is_some() {
                let m = kind.dim();
                let mut block = DMatrix::zeros(dim, dim);
                kind.fill_innovation(&mut block, at);
                // subtract the unscaled block; it is re-added per time step
                state_cov
                    .view_mut((at, at), (m, m))
                    .iter_mut()
                    .for_each(|v| *v = 0.0);
                seasonal_cov = Some(block);
            }
            blocks.push((*tag, at, kind.dim()));
            diffuse_dim += kind.diffuse_dim();
            at += kind.dim();
        }

        if data.slope_var >= 0.0 {
            // the trend block reports as Level; expose the slope separately
            if let Some(pos) = blocks.iter().position(|(c, _, _)| *c == Component::Level) {
                let (_, off, _) = blocks[pos];
                blocks[pos] = (Component::Level, off, 1);
                blocks.insert(pos + 1, (Component::Slope, off + 1, 1));
            }
        }

        Ok(Self {
            dim,
            transition,
            loading,
            state_cov,
            measurement_var: data.noise_var.max(0.0),
            init: DiffuseInit {
                a0: DVector::zeros(dim),
                p0,
                p_inf,
                diffuse_dim,
            },
            blocks,
            seasonal_scale,
            seasonal_cov,
        })
    }

    /// State innovation covariance at time `t`.
    pub fn state_cov_at(&self, t: usize) -> DMatrix<f64> {
        match (&self.seasonal_scale, &self.seasonal_cov) {
            (Some(scale), Some(block)) => {
                let factor = scale.get(t).copied().unwrap_or(1.0);
                &self.state_cov + block * factor
            }
            _ => self.state_cov.clone(),
        }
    }

    pub fn is_time_invariant(&self) -> bool {
        self.seasonal_scale.is_none()
    }

    /// Offset and length of a component's state block, if present.
    pub fn block(&self, c: Component) -> Option<(usize, usize)> {
        self.blocks
            .iter()
            .find(|(tag, _, _)| *tag == c)
            .map(|&(_, off, len)| (off, len))
    }

    /// The loading restricted to one component's block; used to read a
    /// single component out of a smoothed state.
    pub fn block_loading(&self, c: Component) -> Option<DVector<f64>> {
        self.block(c).map(|(off, len)| {
            DVector::from_fn(len, |i, _| self.loading[off + i])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SeasonalModel;

    fn full_data() -> BsmData {
        BsmData {
            level_var: 0.1,
            slope_var: 0.01,
            seasonal_var: 0.05,
            seasonal_model: SeasonalModel::Dummy,
            noise_var: 1.0,
            cycle_var: 0.2,
            cycle_dumping_factor: 0.9,
            cycle_length: 60.0,
        }
    }

    #[test]
    fn test_full_model_dimensions() {
        let ssm = Ssm::of_bsm(&full_data(), 12).unwrap();
        // trend 2 + seasonal 11 + cycle 2
        assert_eq!(ssm.dim, 15);
        assert_eq!(ssm.init.diffuse_dim, 13);
        assert_eq!(ssm.measurement_var, 1.0);
        assert_eq!(ssm.block(Component::Level), Some((0, 1)));
        assert_eq!(ssm.block(Component::Slope), Some((1, 1)));
        assert_eq!(ssm.block(Component::Seasonal), Some((2, 11)));
        assert_eq!(ssm.block(Component::Cycle), Some((13, 2)));
    }

    #[test]
    fn test_unused_components_allocate_no_state() {
        let data = BsmData {
            slope_var: -1.0,
            seasonal_var: -1.0,
            cycle_var: -1.0,
            ..full_data()
        };
        let ssm = Ssm::of_bsm(&data, 12).unwrap();
        assert_eq!(ssm.dim, 1);
        assert_eq!(ssm.init.diffuse_dim, 1);
        assert!(ssm.block(Component::Seasonal).is_none());
    }

    #[test]
    fn test_loading_and_transition_placement() {
        let ssm = Ssm::of_bsm(&full_data(), 12).unwrap();
        // observation = level + current seasonal + cycle
        assert_eq!(ssm.loading[0], 1.0); // level
        assert_eq!(ssm.loading[1], 0.0); // slope
        assert_eq!(ssm.loading[2], 1.0); // seasonal
        assert_eq!(ssm.loading[13], 1.0); // cycle
        // trend block coupling
        assert_eq!(ssm.transition[(0, 1)], 1.0);
        // seasonal block does not leak into the cycle block
        assert_eq!(ssm.transition[(2, 13)], 0.0);
    }

    #[test]
    fn test_slope_without_level_rejected() {
        let data = BsmData {
            level_var: -1.0,
            ..full_data()
        };
        assert!(Ssm::of_bsm(&data, 12).is_err());
    }

    #[test]
    fn test_bad_cycle_parameters_rejected() {
        let mut data = full_data();
        data.cycle_dumping_factor = 1.2;
        assert!(Ssm::of_bsm(&data, 12).is_err());
        data.cycle_dumping_factor = 0.9;
        data.cycle_length = 1.0;
        assert!(Ssm::of_bsm(&data, 12).is_err());
    }

    #[test]
    fn test_seasonal_scale_varies_covariance() {
        let data = BsmData {
            cycle_var: -1.0,
            ..full_data()
        };
        let scale = vec![1.0, 4.0];
        let ssm = Ssm::of_bsm_scaled(&data, 12, Some(scale)).unwrap();
        assert!(!ssm.is_time_invariant());
        let (off, _) = ssm.block(Component::Seasonal).unwrap();
        let q0 = ssm.state_cov_at(0);
        let q1 = ssm.state_cov_at(1);
        assert!((q1[(off, off)] - 4.0 * q0[(off, off)]).abs() < 1e-12);
        // level block unaffected
        assert_eq!(q0[(0, 0)], q1[(0, 0)]);
    }

    #[test]
    fn test_time_invariant_cov_is_constant() {
        let ssm = Ssm::of_bsm(&full_data(), 12).unwrap();
        assert!(ssm.is_time_invariant());
        assert_eq!(ssm.state_cov_at(0), ssm.state_cov_at(57));
    }
}
