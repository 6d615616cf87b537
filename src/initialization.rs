use nalgebra::{DMatrix, DVector};

/// Initial state distribution, partitioned into a proper part `(a0, p0)` and
/// a diffuse subspace tracked exactly through `p_inf` (a projector with unit
/// entries on the diffuse directions). No large-kappa approximation is
/// involved: the filter carries `p_inf` until observations exhaust it.
#[derive(Debug, Clone)]
pub struct DiffuseInit {
    pub a0: DVector<f64>,
    pub p0: DMatrix<f64>,
    pub p_inf: DMatrix<f64>,
    /// Rank of `p_inf`, fixed in closed form by the component spec.
    pub diffuse_dim: usize,
}

impl DiffuseInit {
    /// Fully proper initialization (no diffuse directions).
    pub fn proper(a0: DVector<f64>, p0: DMatrix<f64>) -> Self {
        let dim = a0.len();
        Self {
            a0,
            p0,
            p_inf: DMatrix::zeros(dim, dim),
            diffuse_dim: 0,
        }
    }

    pub fn is_diffuse(&self) -> bool {
        self.diffuse_dim > 0
    }

    pub fn dim(&self) -> usize {
        self.a0.len()
    }
}
