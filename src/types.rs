/// Structural components of a basic structural model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Level,
    Slope,
    Seasonal,
    Noise,
    Cycle,
}

impl Component {
    /// All components that carry an innovation variance, in canonical order.
    pub fn all() -> [Component; 5] {
        [
            Component::Level,
            Component::Slope,
            Component::Seasonal,
            Component::Noise,
            Component::Cycle,
        ]
    }
}

/// How a component enters the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComponentUse {
    /// Structurally absent: no state is allocated for it.
    Unused,
    /// Variance estimated by maximum likelihood.
    Free,
    /// Variance held at the given value during estimation.
    Fixed(f64),
}

impl ComponentUse {
    pub fn is_free(&self) -> bool {
        matches!(self, ComponentUse::Free)
    }

    pub fn is_used(&self) -> bool {
        !matches!(self, ComponentUse::Unused)
    }
}

/// Variant of the stochastic seasonal recursion.
///
/// The first three share the sum-to-zero dummy transition and differ only in
/// the innovation covariance; `Trigonometric` uses harmonic rotation blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeasonalModel {
    Dummy,
    Crude,
    HarrisonStevens,
    Trigonometric,
}

/// Declarative BSM specification: which components exist and how they are
/// estimated. This is the caller-facing contract; `BsmMapping` turns it into
/// a free-parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct BsmSpec {
    pub level: ComponentUse,
    pub slope: ComponentUse,
    pub seasonal: ComponentUse,
    pub seasonal_model: SeasonalModel,
    pub noise: ComponentUse,
    pub cycle: ComponentUse,
    /// Cycle damping factor in (0, 1); `None` means estimated.
    pub cycle_dumping_factor: Option<f64>,
    /// Cycle period in observation units; `None` means estimated.
    pub cycle_length: Option<f64>,
}

impl Default for BsmSpec {
    /// Level + slope + seasonal + noise free, no cycle: the standard BSM.
    fn default() -> Self {
        Self {
            level: ComponentUse::Free,
            slope: ComponentUse::Free,
            seasonal: ComponentUse::Free,
            seasonal_model: SeasonalModel::Trigonometric,
            noise: ComponentUse::Free,
            cycle: ComponentUse::Unused,
            cycle_dumping_factor: None,
            cycle_length: None,
        }
    }
}

impl BsmSpec {
    pub fn component(&self, c: Component) -> ComponentUse {
        match c {
            Component::Level => self.level,
            Component::Slope => self.slope,
            Component::Seasonal => self.seasonal,
            Component::Noise => self.noise,
            Component::Cycle => self.cycle,
        }
    }

    pub fn set_component(&mut self, c: Component, u: ComponentUse) {
        match c {
            Component::Level => self.level = u,
            Component::Slope => self.slope = u,
            Component::Seasonal => self.seasonal = u,
            Component::Noise => self.noise = u,
            Component::Cycle => self.cycle = u,
        }
    }

    /// Components with a freely estimated variance, canonical order.
    pub fn free_components(&self) -> Vec<Component> {
        Component::all()
            .into_iter()
            .filter(|&c| self.component(c).is_free())
            .collect()
    }

    /// A slope requires a level; a seasonal requires period > 1. Checked once
    /// when the mapping is built.
    pub fn validate(&self, period: usize) -> crate::error::Result<()> {
        if self.slope.is_used() && !self.level.is_used() {
            return Err(crate::error::BsmError::InvalidSpec(
                "slope component requires a level component".into(),
            ));
        }
        if self.seasonal.is_used() && period < 2 {
            return Err(crate::error::BsmError::InvalidSpec(format!(
                "seasonal component requires period >= 2, got {}",
                period
            )));
        }
        if !self.level.is_used()
            && !self.seasonal.is_used()
            && !self.cycle.is_used()
            && !self.noise.is_used()
        {
            return Err(crate::error::BsmError::InvalidSpec(
                "model has no components".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for the estimation kernel.
#[derive(Debug, Clone)]
pub struct EstimationSpec {
    /// Estimate variance ratios against a unit-scale anchor, then rescale by
    /// the profiled residual variance. When false the likelihood is not
    /// concentrated and variances are estimated in absolute terms.
    pub scaling: bool,
    /// Maximum minimizer iterations per optimization call.
    pub max_iter: u64,
    /// Likelihood-ratio threshold below which a free variance is fixed to
    /// zero after convergence (chi-square with one degree of freedom).
    pub prune_threshold: f64,
    /// Maximum number of pruning rounds.
    pub max_prune_rounds: usize,
}

impl Default for EstimationSpec {
    fn default() -> Self {
        Self {
            scaling: true,
            max_iter: 500,
            prune_threshold: 3.84,
            max_prune_rounds: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec_is_standard_bsm() {
        let spec = BsmSpec::default();
        assert!(spec.level.is_free());
        assert!(spec.slope.is_free());
        assert!(spec.seasonal.is_free());
        assert!(spec.noise.is_free());
        assert!(!spec.cycle.is_used());
        assert_eq!(
            spec.free_components(),
            vec![
                Component::Level,
                Component::Slope,
                Component::Seasonal,
                Component::Noise
            ]
        );
    }

    #[test]
    fn test_slope_without_level_rejected() {
        let spec = BsmSpec {
            level: ComponentUse::Unused,
            ..Default::default()
        };
        assert!(spec.validate(12).is_err());
    }

    #[test]
    fn test_seasonal_requires_period() {
        let spec = BsmSpec::default();
        assert!(spec.validate(1).is_err());
        assert!(spec.validate(12).is_ok());
    }

    #[test]
    fn test_component_roundtrip() {
        let mut spec = BsmSpec::default();
        spec.set_component(Component::Seasonal, ComponentUse::Fixed(0.0));
        assert_eq!(spec.component(Component::Seasonal), ComponentUse::Fixed(0.0));
        assert!(!spec
            .free_components()
            .contains(&Component::Seasonal));
    }
}
