//! Design specifications: which columns feed the model and how they are expanded.
//!
//! [`DesignSpecs`] is the immutable user configuration. Configuring it
//! against a frame yields a [`ConfiguredSpecs`] snapshot that owns the placed
//! spline knots, the processed outcome data and the source frame. Snapshots
//! are never mutated; new priors or new rows produce new snapshots.

use std::sync::Arc;

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde_json::Value;

use crate::data::{DataSpecs, ProcessedData};
use crate::error::{BinomError, Result};
use crate::frame::Frame;
use crate::parameter::{LinearConstraints, ParameterSet, PriorVariance, Variable};
use crate::splines::{SplineBasis, SplineOptions};

/// A spline covariate together with its options.
#[derive(Clone, Debug, PartialEq)]
pub struct SplineTerm {
    /// Column the basis is evaluated on.
    pub covariate: String,
    pub options: SplineOptions,
}

/// Column roles, covariates and spline configuration of a logistic regression.
#[derive(Clone, Debug, PartialEq)]
pub struct DesignSpecs {
    data: DataSpecs,
    covariates: Vec<String>,
    splines: Vec<SplineTerm>,
}

impl DesignSpecs {
    /// Starts from an intercept-only design.
    pub fn new(data: DataSpecs) -> Self {
        Self {
            data,
            covariates: Vec::new(),
            splines: Vec::new(),
        }
    }

    /// Adds plain covariates, kept in the order given.
    pub fn with_covariates<I, S>(mut self, covariates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.covariates.extend(covariates.into_iter().map(Into::into));
        self
    }

    /// Adds a spline covariate after validating its options.
    pub fn with_spline(mut self, covariate: impl Into<String>, options: SplineOptions) -> Result<Self> {
        let covariate = covariate.into();
        options.validate(&covariate)?;
        self.splines.push(SplineTerm { covariate, options });
        Ok(self)
    }

    /// Adds a spline covariate from an untyped JSON option map.
    pub fn with_spline_json(self, covariate: impl Into<String>, options: &Value) -> Result<Self> {
        let covariate = covariate.into();
        let options = SplineOptions::from_json(&covariate, options)?;
        self.with_spline(covariate, options)
    }

    /// Column roles of the outcome table.
    pub fn data_specs(&self) -> &DataSpecs {
        &self.data
    }

    /// Plain covariates in coefficient order.
    pub fn covariates(&self) -> &[String] {
        &self.covariates
    }

    /// Spline terms in coefficient order.
    pub fn splines(&self) -> &[SplineTerm] {
        &self.splines
    }

    /// Places spline knots from `frame` and builds the design and outcome data.
    pub fn configure_data(&self, frame: impl Into<Arc<Frame>>) -> Result<ConfiguredSpecs> {
        let frame = frame.into();
        if frame.is_empty() {
            return Err(BinomError::EmptyData {
                context: "design configuration",
            });
        }

        let mut variables = Vec::with_capacity(1 + self.covariates.len() + self.splines.len());
        variables.push(Variable::intercept());
        variables.extend(self.covariates.iter().map(Variable::covariate));
        for term in &self.splines {
            let values = frame.numeric(&term.covariate)?;
            let basis = SplineBasis::fit(&term.covariate, &values, &term.options)?;
            debug!(
                "spline `{}` placed knots {:?} ({} columns)",
                term.covariate,
                basis.knots(),
                basis.column_count()
            );
            variables.push(Variable::spline(
                term.covariate.clone(),
                basis,
                term.options.shape,
            ));
        }

        let parameter_set = Arc::new(ParameterSet::new(variables));
        ConfiguredSpecs::build(self.data.clone(), parameter_set, frame)
    }
}

/// Immutable snapshot of a [`DesignSpecs`] configured against one frame.
#[derive(Clone, Debug)]
pub struct ConfiguredSpecs {
    data_specs: DataSpecs,
    parameter_set: Arc<ParameterSet>,
    constraints: LinearConstraints,
    data: ProcessedData,
    frame: Arc<Frame>,
}

impl ConfiguredSpecs {
    fn build(data_specs: DataSpecs, parameter_set: Arc<ParameterSet>, frame: Arc<Frame>) -> Result<Self> {
        let design = parameter_set.design_matrix(&frame)?;
        let data = data_specs.process(&frame, design)?;
        let constraints = parameter_set.constraints();
        Ok(Self {
            data_specs,
            parameter_set,
            constraints,
            data,
            frame,
        })
    }

    /// Column roles the snapshot was built with.
    pub fn data_specs(&self) -> &DataSpecs {
        &self.data_specs
    }

    /// Variables with their placed knots and any priors.
    pub fn parameter_set(&self) -> &Arc<ParameterSet> {
        &self.parameter_set
    }

    /// Shape constraints of the parameter set, computed once per snapshot.
    pub fn constraints(&self) -> &LinearConstraints {
        &self.constraints
    }

    /// Outcomes, trials and design matrix of the configured rows.
    pub fn data(&self) -> &ProcessedData {
        &self.data
    }

    /// The frame this snapshot was configured against.
    pub fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }

    /// Length of the coefficient vector.
    pub fn num_fe(&self) -> usize {
        self.parameter_set.num_fe()
    }

    /// Builds a design matrix for new covariate values, reusing the placed knots.
    pub fn configure_new_data(&self, frame: &Frame) -> Result<DMatrix<f64>> {
        self.parameter_set.design_matrix(frame)
    }

    /// Configures a new set of rows against the same knots and priors.
    pub fn reconfigure(&self, frame: impl Into<Arc<Frame>>) -> Result<Self> {
        let frame = frame.into();
        if frame.is_empty() {
            return Err(BinomError::EmptyData {
                context: "design reconfiguration",
            });
        }
        Self::build(self.data_specs.clone(), self.parameter_set.clone(), frame)
    }

    /// Returns a snapshot whose parameter set carries Gaussian priors centred on `means`.
    pub fn with_priors(&self, means: &DVector<f64>, variance: &PriorVariance) -> Result<Self> {
        let parameter_set = Arc::new(self.parameter_set.with_priors(means, variance)?);
        Ok(Self {
            data_specs: self.data_specs.clone(),
            parameter_set,
            constraints: self.constraints.clone(),
            data: self.data.clone(),
            frame: self.frame.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splines::{KnotsType, ShapeConstraint};
    use serde_json::json;

    fn frame() -> Frame {
        let x: Vec<f64> = (0..40).map(|i| i as f64 / 4.0).collect();
        Frame::new()
            .with_column("success", vec![1.0; 40])
            .unwrap()
            .with_column("total", vec![2.0; 40])
            .unwrap()
            .with_column("x1", x.clone())
            .unwrap()
            .with_column("x2", x.iter().map(|v| v * v).collect::<Vec<_>>())
            .unwrap()
    }

    fn specs() -> DesignSpecs {
        DesignSpecs::new(DataSpecs::new("success", "total"))
            .with_covariates(["x1"])
            .with_spline(
                "x2",
                SplineOptions::default()
                    .with_knots(KnotsType::Domain, 3)
                    .with_shape(ShapeConstraint::Convex),
            )
            .unwrap()
    }

    #[test]
    fn configure_builds_design_in_variable_order() {
        let configured = specs().configure_data(frame()).unwrap();
        let design = configured.data().design();
        assert_eq!(design.shape(), (40, 2 + 4));
        assert!(design.column(0).iter().all(|v| *v == 1.0));
        assert_eq!(design[(8, 1)], 2.0);
        assert_eq!(configured.constraints().row_count(), 20);
    }

    #[test]
    fn new_data_reuses_knots() {
        let configured = specs().configure_data(frame()).unwrap();
        let narrow = frame().take(&[0, 1, 2, 3]);
        let refit = specs().configure_data(narrow.clone()).unwrap();
        let reused = configured.configure_new_data(&narrow).unwrap();
        let own = refit.data().design();
        assert_eq!(reused.shape(), own.shape());
        assert_ne!(&reused, own);
        assert_eq!(reused, configured.data().design().rows(0, 4).into_owned());
    }

    #[test]
    fn spline_json_options_flow_into_specs() {
        let specs = DesignSpecs::new(DataSpecs::new("success", "total"))
            .with_spline_json("x1", &json!({"knots_type": "domain", "knots_num": 4}))
            .unwrap();
        assert_eq!(specs.splines()[0].options.knots_num, 4);
        let bad = DesignSpecs::new(DataSpecs::new("success", "total"))
            .with_spline_json("x1", &json!({"degree": "3"}));
        assert!(bad.is_err());
    }

    #[test]
    fn missing_covariate_is_reported() {
        let specs = DesignSpecs::new(DataSpecs::new("success", "total")).with_covariates(["x9"]);
        let result = specs.configure_data(frame());
        assert!(matches!(result, Err(BinomError::MissingColumn { .. })));
    }
}
