//! Run-level configuration: typed options with chainable setters, and a
//! string-typed, JSON-friendly mirror that validates into them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bootstrap::BootstrapOptions;
use crate::data::DataType;
use crate::error::{BinomError, Result};
use crate::parameter::PriorVariance;
use crate::solving::{SolverMethod, SolverOptions};
use crate::specs::SplineTerm;
use crate::splines::{SplineOptions, CONSTRAINT_GRID_SIZE};

/// Everything a [`BinomRun`](crate::BinomRun) needs besides the data and its column roles.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOptions {
    /// Plain covariates; an intercept is always included and must not be listed.
    pub covariates: Vec<String>,
    /// Spline covariates in the order their coefficient blocks appear.
    pub splines: Vec<SplineTerm>,
    pub solver_method: SolverMethod,
    pub solver: SolverOptions,
    pub data_type: DataType,
    /// Variance of the group-level priors when a group column is declared.
    pub coefficient_prior_var: PriorVariance,
    pub bootstrap: BootstrapOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            covariates: Vec::new(),
            splines: Vec::new(),
            solver_method: SolverMethod::Lbfgs,
            solver: SolverOptions::default(),
            data_type: DataType::Bernoulli,
            coefficient_prior_var: PriorVariance::Shared(1.0),
            bootstrap: BootstrapOptions::default(),
        }
    }
}

impl RunOptions {
    /// Append plain covariates in coefficient order.
    pub fn with_covariates<I, S>(mut self, covariates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.covariates.extend(covariates.into_iter().map(Into::into));
        self
    }

    /// Append a spline covariate after any already declared.
    pub fn with_spline(mut self, covariate: impl Into<String>, options: SplineOptions) -> Self {
        self.splines.push(SplineTerm {
            covariate: covariate.into(),
            options,
        });
        self
    }

    /// Override the optimizer backend.
    pub fn with_solver_method(mut self, method: SolverMethod) -> Self {
        self.solver_method = method;
        self
    }

    /// Override the optimizer tolerances and iteration limits.
    pub fn with_solver_options(mut self, options: SolverOptions) -> Self {
        self.solver = options;
        self
    }

    /// Set whether rows are Bernoulli or binomial observations.
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Set the variance of the group-level priors.
    pub fn with_coefficient_prior_var(mut self, variance: impl Into<PriorVariance>) -> Self {
        self.coefficient_prior_var = variance.into();
        self
    }

    /// Override the bootstrap seed and scheduling.
    pub fn with_bootstrap(mut self, bootstrap: BootstrapOptions) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Checks the options on their own, before any data is touched.
    pub fn validate(&self) -> Result<()> {
        for term in &self.splines {
            term.options.validate(&term.covariate)?;
        }
        self.coefficient_prior_var.validate()?;
        self.coefficient_prior_var
            .check_variable_count(1 + self.covariates.len() + self.splines.len())?;

        let constrained = self.splines.iter().filter(|term| term.options.shape.is_some()).count();
        if constrained > 0 && !self.solver_method.supports_constraints() {
            return Err(BinomError::UnsupportedConstraints {
                method: self.solver_method.name(),
                rows: constrained * CONSTRAINT_GRID_SIZE,
            });
        }
        Ok(())
    }
}

/// Serializable run configuration with string-typed choices.
///
/// ```
/// use binomrs::options::RunConfig;
///
/// let config: RunConfig = serde_json::from_str(r#"{
///     "covariates": ["x1"],
///     "splines": {"x2": {"knots_type": "domain", "knots_num": 4, "concave": true}},
///     "solver_method": "auglag",
///     "data_type": "binomial"
/// }"#).unwrap();
/// let options = config.into_options().unwrap();
/// assert_eq!(options.splines.len(), 1);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub covariates: Vec<String>,
    /// Spline covariate name to untyped option map.
    pub splines: Map<String, Value>,
    pub solver_method: String,
    pub solver_options: SolverOptions,
    pub data_type: String,
    pub coefficient_prior_var: PriorVariance,
    pub bootstrap: BootstrapOptions,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            covariates: Vec::new(),
            splines: Map::new(),
            solver_method: SolverMethod::Lbfgs.name().to_owned(),
            solver_options: SolverOptions::default(),
            data_type: DataType::Bernoulli.to_string(),
            coefficient_prior_var: PriorVariance::Shared(1.0),
            bootstrap: BootstrapOptions::default(),
        }
    }
}

impl RunConfig {
    /// Parses every string-typed choice and validates the result.
    pub fn into_options(self) -> Result<RunOptions> {
        let data_type: DataType = self.data_type.parse()?;
        let solver_method: SolverMethod = self.solver_method.parse()?;
        let splines = self
            .splines
            .iter()
            .map(|(covariate, value)| {
                Ok(SplineTerm {
                    covariate: covariate.clone(),
                    options: SplineOptions::from_json(covariate, value)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let options = RunOptions {
            covariates: self.covariates,
            splines,
            solver_method,
            solver: self.solver_options,
            data_type,
            coefficient_prior_var: self.coefficient_prior_var,
            bootstrap: self.bootstrap,
        };
        options.validate()?;
        Ok(options)
    }
}
