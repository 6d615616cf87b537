use crate::error::{BsmError, Result};
use crate::types::{BsmSpec, Component, ComponentUse, SeasonalModel};

/// Admissible range for the cycle damping factor.
pub const CYCLE_DUMPING_BOUNDS: (f64, f64) = (1e-3, 0.999);
/// Admissible range for the cycle period, in observation units.
pub const CYCLE_LENGTH_BOUNDS: (f64, f64) = (2.0, 500.0);

/// Estimated BSM parameters: one variance per component plus the cycle's
/// dynamic parameters. A negative variance marks a structurally absent
/// component; zero collapses it to a deterministic recursion.
#[derive(Debug, Clone, PartialEq)]
pub struct BsmData {
    pub level_var: f64,
    pub slope_var: f64,
    pub seasonal_var: f64,
    pub seasonal_model: SeasonalModel,
    pub noise_var: f64,
    pub cycle_var: f64,
    pub cycle_dumping_factor: f64,
    pub cycle_length: f64,
}

impl BsmData {
    pub fn variance(&self, c: Component) -> f64 {
        match c {
            Component::Level => self.level_var,
            Component::Slope => self.slope_var,
            Component::Seasonal => self.seasonal_var,
            Component::Noise => self.noise_var,
            Component::Cycle => self.cycle_var,
        }
    }

    pub fn set_variance(&mut self, c: Component, v: f64) {
        match c {
            Component::Level => self.level_var = v,
            Component::Slope => self.slope_var = v,
            Component::Seasonal => self.seasonal_var = v,
            Component::Noise => self.noise_var = v,
            Component::Cycle => self.cycle_var = v,
        }
    }

    /// Multiply every present (non-negative) variance by `factor`.
    pub fn rescale_variances(&mut self, factor: f64) {
        for c in Component::all() {
            let v = self.variance(c);
            if v >= 0.0 {
                self.set_variance(c, v * factor);
            }
        }
    }

    /// Largest variance among present components, with its owner.
    pub fn max_variance(&self) -> Option<(Component, f64)> {
        Component::all()
            .into_iter()
            .filter(|&c| self.variance(c) >= 0.0)
            .map(|c| (c, self.variance(c)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// One entry of the free-parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeParam {
    /// Square-transformed variance of the tagged component.
    Variance(Component),
    CycleDumping,
    CycleLength,
}

/// Pure bijection between a free-parameter vector and `BsmData`.
///
/// Free variances are stored as square roots (so any real maps to a valid
/// non-negative variance); the cycle damping factor and length are stored
/// directly and clipped into their admissible ranges by [`validate`].
/// Repeated evaluation at the same point is reproducible: the mapping holds
/// no hidden state, which finite-difference derivatives rely on.
///
/// [`validate`]: BsmMapping::validate
#[derive(Debug, Clone)]
pub struct BsmMapping {
    spec: BsmSpec,
    period: usize,
    free: Vec<FreeParam>,
    anchor: Option<Component>,
}

impl BsmMapping {
    pub fn new(spec: &BsmSpec, period: usize) -> Result<Self> {
        spec.validate(period)?;
        Ok(Self::with_anchor(spec, period, None))
    }

    /// Build a mapping in which `anchor`'s variance is fixed to 1 and
    /// excluded from the free vector. Used during scaled estimation.
    pub fn with_anchor(spec: &BsmSpec, period: usize, anchor: Option<Component>) -> Self {
        let mut free = Vec::new();
        for c in Component::all() {
            if spec.component(c).is_free() && Some(c) != anchor {
                free.push(FreeParam::Variance(c));
            }
        }
        if spec.cycle.is_used() {
            if spec.cycle_dumping_factor.is_none() {
                free.push(FreeParam::CycleDumping);
            }
            if spec.cycle_length.is_none() {
                free.push(FreeParam::CycleLength);
            }
        }
        Self {
            spec: spec.clone(),
            period,
            free,
            anchor,
        }
    }

    pub fn spec(&self) -> &BsmSpec {
        &self.spec
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn anchor(&self) -> Option<Component> {
        self.anchor
    }

    pub fn dim(&self) -> usize {
        self.free.len()
    }

    pub fn free_params(&self) -> &[FreeParam] {
        &self.free
    }

    /// Default starting point: unit variance ratios, damping 0.9, a cycle of
    /// five seasonal periods.
    pub fn default_point(&self) -> Vec<f64> {
        self.free
            .iter()
            .map(|p| match p {
                FreeParam::Variance(_) => 1.0,
                FreeParam::CycleDumping => 0.9,
                FreeParam::CycleLength => {
                    (5.0 * self.period.max(1) as f64).clamp(CYCLE_LENGTH_BOUNDS.0, CYCLE_LENGTH_BOUNDS.1)
                }
            })
            .collect()
    }

    /// Clip the point into the admissible domain. Returns true if anything
    /// changed, so the caller can re-evaluate at the corrected point.
    pub fn validate(&self, point: &mut [f64]) -> bool {
        let mut changed = false;
        for (p, v) in self.free.iter().zip(point.iter_mut()) {
            let clipped = match p {
                // Square transform accepts any real; cap to avoid overflow in
                // the variance square.
                FreeParam::Variance(_) => v.clamp(-1e6, 1e6),
                FreeParam::CycleDumping => v.clamp(CYCLE_DUMPING_BOUNDS.0, CYCLE_DUMPING_BOUNDS.1),
                FreeParam::CycleLength => v.clamp(CYCLE_LENGTH_BOUNDS.0, CYCLE_LENGTH_BOUNDS.1),
            };
            if clipped != *v {
                *v = clipped;
                changed = true;
            }
        }
        changed
    }

    /// Free vector -> structured parameters.
    pub fn map(&self, point: &[f64]) -> Result<BsmData> {
        if point.len() != self.free.len() {
            return Err(BsmError::ParamLengthMismatch {
                expected: self.free.len(),
                got: point.len(),
            });
        }

        let mut data = BsmData {
            level_var: -1.0,
            slope_var: -1.0,
            seasonal_var: -1.0,
            seasonal_model: self.spec.seasonal_model,
            noise_var: -1.0,
            cycle_var: -1.0,
            cycle_dumping_factor: self.spec.cycle_dumping_factor.unwrap_or(0.9),
            cycle_length: self
                .spec
                .cycle_length
                .unwrap_or(5.0 * self.period.max(1) as f64),
        };

        for c in Component::all() {
            match self.spec.component(c) {
                ComponentUse::Unused => {}
                ComponentUse::Fixed(v) => data.set_variance(c, v),
                ComponentUse::Free => {
                    if Some(c) == self.anchor {
                        data.set_variance(c, 1.0);
                    }
                }
            }
        }

        for (p, &v) in self.free.iter().zip(point.iter()) {
            match p {
                FreeParam::Variance(c) => data.set_variance(*c, v * v),
                FreeParam::CycleDumping => data.cycle_dumping_factor = v,
                FreeParam::CycleLength => data.cycle_length = v,
            }
        }
        Ok(data)
    }

    /// Structured parameters -> free vector. Defined for every admissible
    /// `BsmData`; `map(unmap(d)) == d` within floating tolerance.
    pub fn unmap(&self, data: &BsmData) -> Vec<f64> {
        self.free
            .iter()
            .map(|p| match p {
                FreeParam::Variance(c) => data.variance(*c).max(0.0).sqrt(),
                FreeParam::CycleDumping => data.cycle_dumping_factor,
                FreeParam::CycleLength => data.cycle_length,
            })
            .collect()
    }
}
