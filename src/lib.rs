//! Diffuse state-space filtering and basic structural model estimation.
//!
//! The crate decomposes a univariate series (missing values allowed) into
//! level, slope, seasonal, cycle and irregular components. Component
//! dynamics are assembled into a linear-Gaussian state-space model, filtered
//! with exact diffuse initialization, and the component variances are
//! estimated by maximum likelihood with the residual scale profiled out.
//! Smoothing produces the component decomposition; an optional detection
//! loop flags additive, level-shift and seasonal outliers.
//!
//! ```no_run
//! use bsm_rs::{BsmKernel, BsmSpec};
//!
//! let y: Vec<f64> = load_monthly_series();
//! let kernel = BsmKernel::default();
//! let fit = kernel.estimate(&y, 12, &BsmSpec::default())?;
//! let trace = fit.filter(&y, true)?;
//! let decomposition = bsm_rs::smoother::decompose(&fit.model()?, &trace, fit.sigma2)?;
//! # fn load_monthly_series() -> Vec<f64> { vec![] }
//! # Ok::<(), bsm_rs::BsmError>(())
//! ```

pub mod batch;
pub mod components;
pub mod error;
pub mod filter;
pub mod initialization;
pub mod kernel;
pub mod likelihood;
pub mod optimizer;
pub mod outliers;
pub mod params;
pub mod smoother;
pub mod state_space;
pub mod types;

pub use error::{BsmError, Result};
pub use filter::{filter, FilterTrace};
pub use kernel::{BsmEstimate, BsmKernel, KernelState};
pub use likelihood::{loglikelihood, DiffuseLikelihood};
pub use outliers::{Outlier, OutlierDetector, OutlierType, OutliersDetection};
pub use params::{BsmData, BsmMapping};
pub use smoother::{decompose, smooth_disturbances, smooth_states, Decomposition};
pub use state_space::Ssm;
pub use types::{BsmSpec, Component, ComponentUse, EstimationSpec, SeasonalModel};
