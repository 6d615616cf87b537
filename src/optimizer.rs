//! Numerical minimization via L-BFGS with Nelder-Mead fallback.
//!
//! The estimation kernel hands an [`Objective`] (negative log-likelihood over
//! a free-parameter point) to a [`Minimizer`]. The default minimizer runs
//! L-BFGS with a More-Thuente line search, restarts from deterministic
//! perturbations of the starting point, and refines the winner with
//! Nelder-Mead; the whole sequence shares one iteration budget.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;

use std::cell::RefCell;

use crate::error::{BsmError, Result};

/// A cost surface over a free-parameter point. `None` marks a point where
/// the cost is undefined (invalid parameters, filter breakdown); the
/// minimizer treats it as a large penalty.
pub trait Objective {
    fn cost(&self, point: &[f64]) -> Option<f64>;
}

/// Result of one minimization run.
#[derive(Debug, Clone)]
pub struct MinimizeOutcome {
    pub point: Vec<f64>,
    pub cost: f64,
    pub iterations: u64,
    pub converged: bool,
}

/// Strategy interface so the kernel does not depend on a concrete solver.
pub trait Minimizer {
    fn minimize(&self, objective: &dyn Objective, start: Vec<f64>) -> Result<MinimizeOutcome>;
}

const PENALTY: f64 = f64::MAX / 2.0;

/// Cached evaluation shared between `cost()` and `gradient()` calls at the
/// same point.
struct CachedEval {
    point: Vec<f64>,
    cost: f64,
}

/// Adapter exposing an [`Objective`] to argmin, with a forward-difference
/// gradient.
struct CostAdapter<'a> {
    obj: &'a dyn Objective,
    /// Single-entry cache: the last evaluated point and its cost, so a
    /// gradient() followed by cost() at the same point is free.
    cache: RefCell<Option<CachedEval>>,
}

impl<'a> CostAdapter<'a> {
    fn new(obj: &'a dyn Objective) -> Self {
        Self {
            obj,
            cache: RefCell::new(None),
        }
    }

    fn eval(&self, point: &[f64]) -> f64 {
        if let Some(ref cached) = *self.cache.borrow() {
            if cached.point == point {
                return cached.cost;
            }
        }
        let cost = match self.obj.cost(point) {
            Some(c) if c.is_finite() => c,
            _ => PENALTY,
        };
        *self.cache.borrow_mut() = Some(CachedEval {
            point: point.to_vec(),
            cost,
        });
        cost
    }
}

impl Clone for CostAdapter<'_> {
    fn clone(&self) -> Self {
        // cloned adapters start with an empty cache
        Self {
            obj: self.obj,
            cache: RefCell::new(None),
        }
    }
}

impl CostFunction for CostAdapter<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Vec<f64>) -> std::result::Result<f64, argmin::core::Error> {
        Ok(self.eval(param))
    }
}

impl Gradient for CostAdapter<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Vec<f64>) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        let n = param.len();
        let mut grad = vec![0.0; n];
        let eps = f64::EPSILON.sqrt();

        let f0 = self.eval(param);
        let mut p_work = param.clone();

        for i in 0..n {
            let orig = p_work[i];
            let h = eps * orig.abs().max(1.0);
            p_work[i] = orig + h;
            let f_plus = self.eval(&p_work);
            p_work[i] = orig;

            grad[i] = (f_plus - f0) / h;

            if !grad[i].is_finite() {
                p_work[i] = orig + h;
                let fp = self.eval(&p_work);
                p_work[i] = orig - h;
                let fm = self.eval(&p_work);
                p_work[i] = orig;
                grad[i] = (fp - fm) / (2.0 * h);
                if !grad[i].is_finite() {
                    grad[i] = 0.0;
                }
            }
        }
        Ok(grad)
    }
}

fn run_lbfgs(
    adapter: CostAdapter<'_>,
    init: Vec<f64>,
    maxiter: u64,
) -> std::result::Result<(Vec<f64>, f64, u64, bool), String> {
    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, 10)
        .with_tolerance_grad(1e-5)
        .map_err(|e| e.to_string())?
        .with_tolerance_cost(1e-9)
        .map_err(|e| e.to_string())?;

    let result = Executor::new(adapter, solver)
        .configure(
            |state: argmin::core::IterState<Vec<f64>, Vec<f64>, (), (), (), f64>| {
                state.param(init).max_iters(maxiter)
            },
        )
        .run()
        .map_err(|e| format!("L-BFGS failed: {}", e))?;

    let state = result.state();
    let best_param = state
        .get_best_param()
        .ok_or("L-BFGS: no best parameter found")?
        .clone();
    let best_cost = state.get_best_cost();
    let n_iter = state.get_iter();
    let term_reason = state.get_termination_reason();
    let converged = term_reason == Some(&TerminationReason::SolverConverged)
        || term_reason == Some(&TerminationReason::TargetCostReached);

    Ok((best_param, best_cost, n_iter, converged))
}

fn run_nelder_mead(
    adapter: CostAdapter<'_>,
    init: Vec<f64>,
    maxiter: u64,
) -> std::result::Result<(Vec<f64>, f64, u64, bool), String> {
    let n = init.len();

    // Build simplex: n+1 vertices
    let mut simplex = vec![init.clone()];
    for i in 0..n {
        let mut vertex = init.clone();
        let delta = if vertex[i].abs() > 1e-8 {
            vertex[i] * 0.05
        } else {
            0.00025
        };
        vertex[i] += delta;
        simplex.push(vertex);
    }

    let solver = NelderMead::new(simplex)
        .with_sd_tolerance(1e-6)
        .map_err(|e| e.to_string())?;

    let result = Executor::new(adapter, solver)
        .configure(
            |state: argmin::core::IterState<Vec<f64>, (), (), (), (), f64>| {
                state.max_iters(maxiter)
            },
        )
        .run()
        .map_err(|e| format!("Nelder-Mead failed: {}", e))?;

    let state = result.state();
    let best_param = state
        .get_best_param()
        .ok_or("Nelder-Mead: no best parameter found")?
        .clone();
    let best_cost = state.get_best_cost();
    let n_iter = state.get_iter();
    let term_reason = state.get_termination_reason();
    let converged = term_reason == Some(&TerminationReason::SolverConverged)
        || term_reason == Some(&TerminationReason::TargetCostReached);

    Ok((best_param, best_cost, n_iter, converged))
}

fn consume_budget(remaining: &mut u64, total_work: &mut u64, n: u64) {
    let used = n.min(*remaining);
    *total_work = total_work.saturating_add(used);
    *remaining = remaining.saturating_sub(used);
}

/// Default minimizer: multi-start L-BFGS plus a Nelder-Mead refinement.
#[derive(Debug, Clone)]
pub struct LbfgsMinimizer {
    pub max_iter: u64,
}

impl LbfgsMinimizer {
    pub fn new(max_iter: u64) -> Self {
        Self { max_iter }
    }
}

impl Default for LbfgsMinimizer {
    fn default() -> Self {
        Self { max_iter: 500 }
    }
}

impl Minimizer for LbfgsMinimizer {
    fn minimize(&self, objective: &dyn Objective, start: Vec<f64>) -> Result<MinimizeOutcome> {
        if start.is_empty() {
            return Err(BsmError::OptimizationFailed(
                "empty parameter point".into(),
            ));
        }
        if self.max_iter == 0 {
            let adapter = CostAdapter::new(objective);
            let cost = adapter.eval(&start);
            return Ok(MinimizeOutcome {
                point: start,
                cost,
                iterations: 0,
                converged: false,
            });
        }

        let adapter = CostAdapter::new(objective);
        let n = start.len();
        let n_restarts = if n >= 4 {
            3
        } else if n >= 3 {
            2
        } else if n >= 2 {
            1
        } else {
            0
        };

        let mut remaining = self.max_iter;
        let mut total_work: u64 = 0;

        let initial = match run_lbfgs(adapter.clone(), start.clone(), remaining) {
            Ok((p, c, used, conv)) => {
                consume_budget(&mut remaining, &mut total_work, used);
                Some((p, c, conv))
            }
            Err(_) => None,
        };

        let mut best = initial;
        let mut try_update = |p: Vec<f64>, c: f64, conv: bool| match &best {
            Some((_, best_cost, _)) if c < *best_cost => {
                best = Some((p, c, conv));
            }
            None => {
                best = Some((p, c, conv));
            }
            _ => {}
        };

        if n_restarts > 0 && remaining > 0 {
            // deterministic LCG perturbations of the starting point
            let mut rng_state: u64 = 12345;
            for _ in 0..n_restarts {
                if remaining == 0 {
                    break;
                }
                let mut perturbed = start.clone();
                for v in perturbed.iter_mut() {
                    rng_state = rng_state
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    let u = ((rng_state >> 33) as f64 / (1u64 << 31) as f64) - 0.5;
                    let scale = if v.abs() > 0.1 { v.abs() * 0.5 } else { 0.1 };
                    *v += u * scale;
                }
                if let Ok((p, c, used, conv)) = run_lbfgs(adapter.clone(), perturbed, remaining) {
                    consume_budget(&mut remaining, &mut total_work, used);
                    try_update(p, c, conv);
                }
            }
        }

        match best {
            Some((best_p, best_c, best_conv)) => {
                // NM refinement for multi-parameter surfaces
                if n >= 2 && remaining > 0 {
                    match run_nelder_mead(adapter.clone(), best_p.clone(), remaining) {
                        Ok((nm_p, nm_c, nm_used, nm_conv)) if nm_c < best_c => {
                            consume_budget(&mut remaining, &mut total_work, nm_used);
                            Ok(MinimizeOutcome {
                                point: nm_p,
                                cost: nm_c,
                                iterations: total_work,
                                converged: nm_conv,
                            })
                        }
                        Ok((_, _, nm_used, _)) => {
                            consume_budget(&mut remaining, &mut total_work, nm_used);
                            Ok(MinimizeOutcome {
                                point: best_p,
                                cost: best_c,
                                iterations: total_work,
                                converged: best_conv,
                            })
                        }
                        Err(_) => Ok(MinimizeOutcome {
                            point: best_p,
                            cost: best_c,
                            iterations: total_work,
                            converged: best_conv,
                        }),
                    }
                } else {
                    Ok(MinimizeOutcome {
                        point: best_p,
                        cost: best_c,
                        iterations: total_work,
                        converged: best_conv,
                    })
                }
            }
            None => {
                // every L-BFGS attempt failed, fall back to Nelder-Mead
                let (p, c, used, conv) = run_nelder_mead(adapter, start, remaining)
                    .map_err(BsmError::OptimizationFailed)?;
                consume_budget(&mut remaining, &mut total_work, used);
                Ok(MinimizeOutcome {
                    point: p,
                    cost: c,
                    iterations: total_work,
                    converged: conv,
                })
            }
        }
    }
}
