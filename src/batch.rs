//! Rayon-based parallel batch processing for multiple time series.
//!
//! Every series is estimated independently; the immutable specification and
//! settings are shared read-only across the worker threads and each worker
//! owns its own filter state.

use rayon::prelude::*;

use crate::error::Result;
use crate::filter::filter;
use crate::kernel::{BsmEstimate, BsmKernel};
use crate::likelihood::loglikelihood;
use crate::params::BsmData;
use crate::state_space::Ssm;
use crate::types::{BsmSpec, EstimationSpec};

/// Log-likelihood of one fixed parameter set over many series in parallel.
pub fn batch_loglike(series: &[Vec<f64>], data: &BsmData, period: usize) -> Vec<Result<f64>> {
    series
        .par_iter()
        .map(|y| {
            let ssm = Ssm::of_bsm(data, period)?;
            let trace = filter(&ssm, y, false);
            Ok(loglikelihood(&trace)?.full())
        })
        .collect()
}

/// Estimate the same specification over many series in parallel.
pub fn batch_estimate(
    series: &[Vec<f64>],
    period: usize,
    spec: &BsmSpec,
    settings: &EstimationSpec,
) -> Vec<Result<BsmEstimate>> {
    series
        .par_iter()
        .map(|y| BsmKernel::new(settings.clone()).estimate(y, period, spec))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ComponentUse, SeasonalModel};

    fn spec() -> BsmSpec {
        BsmSpec {
            level: ComponentUse::Free,
            slope: ComponentUse::Unused,
            seasonal: ComponentUse::Unused,
            seasonal_model: SeasonalModel::Dummy,
            noise: ComponentUse::Free,
            cycle: ComponentUse::Unused,
            cycle_dumping_factor: None,
            cycle_length: None,
        }
    }

    fn series(seed: u64, n: usize) -> Vec<f64> {
        let mut state = seed;
        let mut level = 1.0;
        (0..n)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let u = (state >> 33) as f64 / (1u64 << 31) as f64 - 1.0;
                level += 0.05 * u;
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                level + ((state >> 33) as f64 / (1u64 << 31) as f64 - 1.0)
            })
            .collect()
    }

    #[test]
    fn test_batch_matches_single_estimation() {
        let all: Vec<Vec<f64>> = (0..4).map(|i| series(1000 + i, 80)).collect();
        let settings = EstimationSpec::default();
        let batch = batch_estimate(&all, 4, &spec(), &settings);
        assert_eq!(batch.len(), 4);

        let single = BsmKernel::new(settings.clone())
            .estimate(&all[2], 4, &spec())
            .unwrap();
        let from_batch = batch[2].as_ref().unwrap();
        assert!((single.log_likelihood - from_batch.log_likelihood).abs() < 1e-9);
        assert!((single.data.noise_var - from_batch.data.noise_var).abs() < 1e-9);
    }

    #[test]
    fn test_batch_loglike_isolated_failures() {
        let good = series(5, 60);
        let bad = vec![f64::NAN; 60]; // all missing
        let data = BsmData {
            level_var: 0.01,
            slope_var: -1.0,
            seasonal_var: -1.0,
            seasonal_model: SeasonalModel::Dummy,
            noise_var: 1.0,
            cycle_var: -1.0,
            cycle_dumping_factor: 0.9,
            cycle_length: 20.0,
        };
        let out = batch_loglike(&[good, bad], &data, 4);
        assert!(out[0].is_ok());
        assert!(out[1].is_err(), "an all-missing series cannot be scored");
    }
}
