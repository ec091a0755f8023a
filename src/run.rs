//! End-to-end orchestration: configure, fit, predict and bootstrap one data set.

use std::sync::Arc;

use log::info;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::bootstrap::{BootstrapEngine, ReplicateSet, Resampling};
use crate::data::{validate_bernoulli, validate_counts, DataSpecs, DataType};
use crate::error::{BinomError, Result};
use crate::frame::Frame;
use crate::hierarchy::{HierarchicalFit, HierarchicalSolver};
use crate::model::{expit, BinomialModel};
use crate::options::RunOptions;
use crate::parameter::ParameterSet;
use crate::solving::{build_solver, ConstrainedSolver};
use crate::specs::DesignSpecs;

/// Coefficients produced by one fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitResult {
    /// A single coefficient vector for every row.
    Global(DVector<f64>),
    /// A population vector plus one vector per group.
    Hierarchical(HierarchicalFit),
}

impl FitResult {
    /// The all-rows coefficient vector.
    pub fn population(&self) -> &DVector<f64> {
        match self {
            FitResult::Global(x) => x,
            FitResult::Hierarchical(fit) => &fit.population,
        }
    }

    /// The group fits, when the run was hierarchical.
    pub fn hierarchical(&self) -> Option<&HierarchicalFit> {
        match self {
            FitResult::Global(_) => None,
            FitResult::Hierarchical(fit) => Some(fit),
        }
    }

    /// Probabilities for `frame` given the basis in `parameter_set`.
    ///
    /// Hierarchical fits need `col_group` to route rows to their group.
    pub fn predict(
        &self,
        parameter_set: &ParameterSet,
        col_group: Option<&str>,
        frame: &Frame,
    ) -> Result<DVector<f64>> {
        match self {
            FitResult::Global(x) => {
                let design = parameter_set.design_matrix(frame)?;
                if design.ncols() != x.len() {
                    return Err(BinomError::dimension_mismatch(
                        "coefficient vector",
                        design.ncols(),
                        x.len(),
                    ));
                }
                Ok((design * x).map(expit))
            }
            FitResult::Hierarchical(fit) => {
                let col_group = col_group.ok_or_else(|| BinomError::missing_component("group column"))?;
                fit.predict(parameter_set, col_group, frame)
            }
        }
    }
}

/// A configured model run over one observation table.
///
/// Rows are modeled as `success_i ~ Binomial(total_i, p_i)` with `p_i` the
/// expit of a linear predictor holding an intercept, the covariates and any
/// spline bases. With a group column the run fits a population model first
/// and then one prior-shrunk model per group.
#[derive(Debug)]
pub struct BinomRun {
    options: RunOptions,
    model: BinomialModel,
    solver: Arc<dyn ConstrainedSolver>,
    hierarchy: Option<HierarchicalSolver>,
    bootstrap: BootstrapEngine,
    params_init: DVector<f64>,
    params_opt: Option<FitResult>,
    replicates: Option<ReplicateSet>,
}

impl BinomRun {
    /// Validates `options`, then configures the design against `frame`.
    pub fn new(frame: impl Into<Arc<Frame>>, data_specs: DataSpecs, options: RunOptions) -> Result<Self> {
        options.validate()?;

        let frame = frame.into();
        let mut specs = DesignSpecs::new(data_specs.clone()).with_covariates(options.covariates.iter().cloned());
        for term in &options.splines {
            specs = specs.with_spline(term.covariate.clone(), term.options.clone())?;
        }
        let configured = specs.configure_data(frame.clone())?;
        let data = configured.data();
        match options.data_type {
            DataType::Bernoulli => validate_bernoulli(data.total().as_slice())?,
            DataType::Binomial => validate_counts(data.obs().as_slice(), data.total().as_slice())?,
        }
        let params_init = DVector::zeros(configured.num_fe());
        let model = BinomialModel::with_specs(Arc::new(configured));

        let solver = build_solver(options.solver_method, options.solver.clone());
        let hierarchy = match data_specs.col_group() {
            Some(_) => Some(HierarchicalSolver::new(
                solver.clone(),
                options.coefficient_prior_var.clone(),
            )?),
            None => None,
        };

        let resampling = match (options.data_type, data_specs.col_group()) {
            (DataType::Binomial, _) => Resampling::Binomial,
            (DataType::Bernoulli, Some(col_group)) => Resampling::StratifiedBernoulli {
                col_group: col_group.to_owned(),
            },
            (DataType::Bernoulli, None) => Resampling::Bernoulli,
        };
        let bootstrap = BootstrapEngine::new(frame, specs, resampling, options.bootstrap.clone())?;

        info!(
            "configured {} run: {} rows, {} coefficients, solver {}{}",
            options.data_type,
            model.design_matrix()?.nrows(),
            params_init.len(),
            options.solver_method,
            if hierarchy.is_some() { ", hierarchical" } else { "" }
        );

        Ok(Self {
            options,
            model,
            solver,
            hierarchy,
            bootstrap,
            params_init,
            params_opt: None,
            replicates: None,
        })
    }

    /// Options the run was validated with.
    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Model attached to the configured training data.
    pub fn model(&self) -> &BinomialModel {
        &self.model
    }

    /// Starting coefficients, all zero.
    pub fn params_init(&self) -> &DVector<f64> {
        &self.params_init
    }

    /// Fits the model on the configured data and stores the coefficients.
    pub fn fit(&mut self) -> Result<&FitResult> {
        self.params_opt = None;
        let result = match &mut self.hierarchy {
            Some(hierarchy) => FitResult::Hierarchical(hierarchy.fit(&self.model, &self.params_init)?.clone()),
            None => {
                let solution = self.model.fit(self.solver.as_ref(), &self.params_init)?;
                info!(
                    "fit finished after {} iterations (objective {:.6})",
                    solution.iterations, solution.objective
                );
                FitResult::Global(solution.x)
            }
        };
        Ok(self.params_opt.insert(result))
    }

    /// Coefficients of the last successful [`fit`](Self::fit).
    pub fn params_opt(&self) -> Option<&FitResult> {
        self.params_opt.as_ref()
    }

    /// Predicted probabilities for `frame`, or for the fitted rows when `None`.
    pub fn predict(&self, frame: Option<&Frame>) -> Result<DVector<f64>> {
        let fit = self.params_opt.as_ref().ok_or(BinomError::NotFitted {
            context: "prediction",
        })?;
        let specs = self.model.specs()?;
        let frame = match frame {
            Some(frame) => frame,
            None => specs.frame().as_ref(),
        };
        fit.predict(specs.parameter_set(), specs.data_specs().col_group(), frame)
    }

    /// Runs `n_boots` bootstrap replicates of the same fit procedure.
    pub fn make_uncertainty(&mut self, n_boots: usize) -> Result<&ReplicateSet> {
        if self.params_opt.is_none() {
            return Err(BinomError::NotFitted {
                context: "bootstrap uncertainty",
            });
        }
        self.replicates = None;
        let solver = self.solver.as_ref();
        let hierarchy = self.hierarchy.as_ref();
        let replicates = self
            .bootstrap
            .run(n_boots, |model| fit_once(solver, hierarchy, model))?;
        info!("stored {} bootstrap replicates", replicates.len());
        Ok(self.replicates.insert(replicates))
    }

    /// Replicates of the last successful [`make_uncertainty`](Self::make_uncertainty).
    pub fn replicates(&self) -> Option<&ReplicateSet> {
        self.replicates.as_ref()
    }

    /// Predicted probabilities for `frame` under every replicate, shaped replicates x rows.
    pub fn predict_draws(&self, frame: &Frame) -> Result<DMatrix<f64>> {
        self.replicates
            .as_ref()
            .ok_or(BinomError::NotFitted {
                context: "predictive draws",
            })?
            .predict_draws(frame)
    }
}

/// One complete fit of `model`, starting from zero coefficients.
fn fit_once(
    solver: &dyn ConstrainedSolver,
    hierarchy: Option<&HierarchicalSolver>,
    model: &BinomialModel,
) -> Result<FitResult> {
    let x_init = DVector::zeros(model.parameter_set()?.num_fe());
    match hierarchy {
        Some(hierarchy) => Ok(FitResult::Hierarchical(hierarchy.estimate(model, &x_init)?)),
        None => Ok(FitResult::Global(model.fit(solver, &x_init)?.x)),
    }
}
