//! Optimizer contracts and the argmin-backed solvers that fulfil them.
//!
//! The model only produces an [`Objective`] and [`LinearConstraints`]; a
//! [`ConstrainedSolver`] turns them into an optimum. Two solvers are provided:
//! plain L-BFGS for unconstrained problems and an augmented Lagrangian outer
//! loop around L-BFGS for shape-constrained ones.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use argmin::core::{
    CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use log::{debug, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{BinomError, Result};
use crate::parameter::LinearConstraints;

/// Scalar objective with an analytic gradient.
pub trait Objective {
    fn value(&self, x: &DVector<f64>) -> Result<f64>;
    fn gradient(&self, x: &DVector<f64>) -> Result<DVector<f64>>;
}

/// Minimizes an [`Objective`] subject to `lower <= C x <= upper`.
pub trait ConstrainedSolver: fmt::Debug + Send + Sync {
    fn method(&self) -> SolverMethod;

    fn minimize(
        &self,
        objective: &dyn Objective,
        constraints: &LinearConstraints,
        x_init: &DVector<f64>,
    ) -> Result<Solution>;
}

/// Available optimization backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverMethod {
    /// Unconstrained limited-memory BFGS.
    Lbfgs,
    /// Augmented Lagrangian handling of linear inequality constraints.
    #[serde(rename = "auglag")]
    AugmentedLagrangian,
}

impl SolverMethod {
    /// Canonical configuration name.
    pub fn name(self) -> &'static str {
        match self {
            SolverMethod::Lbfgs => "lbfgs",
            SolverMethod::AugmentedLagrangian => "auglag",
        }
    }

    /// Whether the method can enforce linear inequality constraints.
    pub fn supports_constraints(self) -> bool {
        matches!(self, SolverMethod::AugmentedLagrangian)
    }
}

impl FromStr for SolverMethod {
    type Err = BinomError;

    /// Accepts `lbfgs` and `auglag`, plus `scipy` and `ipopt` for configs
    /// written against the older method names.
    fn from_str(value: &str) -> Result<Self> {
        match value {
            "lbfgs" | "scipy" => Ok(SolverMethod::Lbfgs),
            "auglag" | "augmented-lagrangian" | "ipopt" => Ok(SolverMethod::AugmentedLagrangian),
            other => Err(BinomError::UnknownSolverMethod {
                value: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for SolverMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tuning knobs shared by both solvers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Maximum L-BFGS iterations per (inner) solve.
    pub max_iterations: u64,
    /// Gradient-norm tolerance of the L-BFGS solve.
    pub gradient_tolerance: f64,
    /// Absolute cost-change tolerance of the L-BFGS solve.
    pub cost_tolerance: f64,
    /// Number of correction pairs kept by L-BFGS.
    pub memory: usize,
    /// Maximum augmented Lagrangian outer iterations.
    pub max_outer_iterations: usize,
    /// Largest acceptable constraint violation.
    pub constraint_tolerance: f64,
    /// Initial penalty parameter of the augmented Lagrangian.
    pub initial_penalty: f64,
    /// Factor applied to the penalty when the violation stalls.
    pub penalty_growth: f64,
    /// Upper bound on the penalty parameter.
    pub max_penalty: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            gradient_tolerance: 1e-6,
            cost_tolerance: 1e-10,
            memory: 10,
            max_outer_iterations: 50,
            constraint_tolerance: 1e-6,
            initial_penalty: 10.0,
            penalty_growth: 10.0,
            max_penalty: 1e10,
        }
    }
}

impl SolverOptions {
    /// Set the iteration limit of each L-BFGS run.
    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Set the gradient-norm stopping tolerance.
    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.gradient_tolerance = tolerance;
        self
    }

    /// Set the largest constraint violation accepted at convergence.
    pub fn with_constraint_tolerance(mut self, tolerance: f64) -> Self {
        self.constraint_tolerance = tolerance;
        self
    }

    /// Set the number of multiplier updates allowed.
    pub fn with_max_outer_iterations(mut self, iterations: usize) -> Self {
        self.max_outer_iterations = iterations.max(1);
        self
    }
}

/// Optimum reported by a solver, with diagnostics.
#[derive(Clone, Debug)]
pub struct Solution {
    /// Minimizing coefficient vector.
    pub x: DVector<f64>,
    /// Objective value at `x` (without augmented Lagrangian terms).
    pub objective: f64,
    /// Total L-BFGS iterations across all inner solves.
    pub iterations: u64,
    /// Whether the backend reported convergence and constraints are satisfied.
    pub converged: bool,
    /// Largest constraint violation at `x`.
    pub max_violation: f64,
}

/// Builds the solver for `method`.
pub fn build_solver(method: SolverMethod, options: SolverOptions) -> Arc<dyn ConstrainedSolver> {
    match method {
        SolverMethod::Lbfgs => Arc::new(LbfgsSolver::new(options)),
        SolverMethod::AugmentedLagrangian => Arc::new(AugmentedLagrangianSolver::new(options)),
    }
}

/// Unconstrained L-BFGS with More-Thuente line search.
#[derive(Clone, Debug, Default)]
pub struct LbfgsSolver {
    options: SolverOptions,
}

impl LbfgsSolver {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }
}

impl ConstrainedSolver for LbfgsSolver {
    fn method(&self) -> SolverMethod {
        SolverMethod::Lbfgs
    }

    fn minimize(
        &self,
        objective: &dyn Objective,
        constraints: &LinearConstraints,
        x_init: &DVector<f64>,
    ) -> Result<Solution> {
        if !constraints.is_empty() {
            return Err(BinomError::UnsupportedConstraints {
                method: self.method().name(),
                rows: constraints.row_count(),
            });
        }
        let problem = ArgminProblem {
            objective,
            penalty: None,
        };
        let inner = run_lbfgs(problem, x_init, &self.options)?;
        if !inner.converged {
            warn!("L-BFGS stopped without converging after {} iterations", inner.iterations);
        }
        Ok(Solution {
            objective: objective.value(&inner.x)?,
            x: inner.x,
            iterations: inner.iterations,
            converged: inner.converged,
            max_violation: 0.0,
        })
    }
}

/// Powell-Hestenes-Rockafellar augmented Lagrangian around L-BFGS.
///
/// Each two-sided row of `lower <= C x <= upper` contributes up to two
/// inequality constraints `g(x) <= 0`. The inner problem minimizes
/// `f(x) + (1 / 2rho) * sum(max(0, lambda + rho g(x))^2 - lambda^2)`.
#[derive(Clone, Debug, Default)]
pub struct AugmentedLagrangianSolver {
    options: SolverOptions,
}

impl AugmentedLagrangianSolver {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }
}

impl ConstrainedSolver for AugmentedLagrangianSolver {
    fn method(&self) -> SolverMethod {
        SolverMethod::AugmentedLagrangian
    }

    fn minimize(
        &self,
        objective: &dyn Objective,
        constraints: &LinearConstraints,
        x_init: &DVector<f64>,
    ) -> Result<Solution> {
        if constraints.is_empty() {
            return LbfgsSolver::new(self.options.clone()).minimize(objective, constraints, x_init);
        }
        if constraints.matrix().ncols() != x_init.len() {
            return Err(BinomError::dimension_mismatch(
                "constraint columns",
                x_init.len(),
                constraints.matrix().ncols(),
            ));
        }

        let rows = constraints.row_count();
        let mut penalty = Penalty {
            constraints,
            lambda_lower: DVector::zeros(rows),
            lambda_upper: DVector::zeros(rows),
            rho: self.options.initial_penalty,
        };
        let mut x = x_init.clone();
        let mut iterations = 0u64;
        let mut violation = constraints.max_violation(&x);
        let mut inner_converged = false;

        for outer in 0..self.options.max_outer_iterations {
            let problem = ArgminProblem {
                objective,
                penalty: Some(&penalty),
            };
            let inner = run_lbfgs(problem, &x, &self.options)?;
            iterations += inner.iterations;
            inner_converged = inner.converged;
            x = inner.x;

            let previous = violation;
            violation = constraints.max_violation(&x);
            penalty.update_multipliers(&x);
            debug!(
                "augmented Lagrangian outer iteration {outer}: violation {violation:.3e}, rho {:.1e}",
                penalty.rho
            );
            if violation <= self.options.constraint_tolerance {
                break;
            }
            if violation > 0.25 * previous {
                penalty.rho = (penalty.rho * self.options.penalty_growth).min(self.options.max_penalty);
            }
        }

        let feasible = violation <= self.options.constraint_tolerance;
        if !feasible {
            warn!(
                "augmented Lagrangian stopped with constraint violation {violation:.3e} after {} outer iterations",
                self.options.max_outer_iterations
            );
        }
        Ok(Solution {
            objective: objective.value(&x)?,
            x,
            iterations,
            converged: feasible && inner_converged,
            max_violation: violation,
        })
    }
}

/// Multipliers and penalty weight of the augmented Lagrangian.
struct Penalty<'a> {
    constraints: &'a LinearConstraints,
    lambda_lower: DVector<f64>,
    lambda_upper: DVector<f64>,
    rho: f64,
}

impl Penalty<'_> {
    /// Shifted multipliers `max(0, lambda + rho g)` for the lower and upper sides.
    fn shifted(&self, x: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        let values = self.constraints.matrix() * x;
        let lower = DVector::from_fn(values.len(), |i, _| {
            let bound = self.constraints.lower()[i];
            if bound.is_finite() {
                (self.lambda_lower[i] + self.rho * (bound - values[i])).max(0.0)
            } else {
                0.0
            }
        });
        let upper = DVector::from_fn(values.len(), |i, _| {
            let bound = self.constraints.upper()[i];
            if bound.is_finite() {
                (self.lambda_upper[i] + self.rho * (values[i] - bound)).max(0.0)
            } else {
                0.0
            }
        });
        (lower, upper)
    }

    fn value(&self, x: &DVector<f64>) -> f64 {
        let (lower, upper) = self.shifted(x);
        let active = lower.norm_squared() + upper.norm_squared();
        let baseline = self.lambda_lower.norm_squared() + self.lambda_upper.norm_squared();
        (active - baseline) / (2.0 * self.rho)
    }

    fn gradient(&self, x: &DVector<f64>) -> DVector<f64> {
        let (lower, upper) = self.shifted(x);
        self.constraints.matrix().tr_mul(&(upper - lower))
    }

    fn update_multipliers(&mut self, x: &DVector<f64>) {
        let (lower, upper) = self.shifted(x);
        self.lambda_lower = lower;
        self.lambda_upper = upper;
    }
}

/// Adapter exposing an [`Objective`] (plus optional penalty) to argmin.
struct ArgminProblem<'a> {
    objective: &'a dyn Objective,
    penalty: Option<&'a Penalty<'a>>,
}

impl CostFunction for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        let x = DVector::from_column_slice(params);
        let mut value = self
            .objective
            .value(&x)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))?;
        if let Some(penalty) = self.penalty {
            value += penalty.value(&x);
        }
        Ok(value)
    }
}

impl Gradient for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Self::Param) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        let x = DVector::from_column_slice(params);
        let mut gradient = self
            .objective
            .gradient(&x)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))?;
        if let Some(penalty) = self.penalty {
            gradient += penalty.gradient(&x);
        }
        Ok(gradient.as_slice().to_vec())
    }
}

struct InnerResult {
    x: DVector<f64>,
    iterations: u64,
    converged: bool,
}

fn run_lbfgs(problem: ArgminProblem<'_>, x_init: &DVector<f64>, options: &SolverOptions) -> Result<InnerResult> {
    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, options.memory)
        .with_tolerance_grad(options.gradient_tolerance)
        .map_err(BinomError::solver_failure)?
        .with_tolerance_cost(options.cost_tolerance)
        .map_err(BinomError::solver_failure)?;

    let init: Vec<f64> = x_init.as_slice().to_vec();
    let res = Executor::new(problem, solver)
        .configure(|state| state.param(init).max_iters(options.max_iterations))
        .run()
        .map_err(BinomError::solver_failure)?;

    let state = res.state();
    let best = state
        .get_best_param()
        .ok_or_else(|| BinomError::solver_failure("optimizer returned no parameters"))?;
    let converged = matches!(
        state.get_termination_status(),
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
    );
    Ok(InnerResult {
        x: DVector::from_column_slice(best),
        iterations: state.get_iter(),
        converged,
    })
}
