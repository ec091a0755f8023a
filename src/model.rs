//! Binomial likelihood under the logit link, with per-block Gaussian penalties.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::data::ProcessedData;
use crate::error::{BinomError, Result};
use crate::parameter::{LinearConstraints, ParameterSet};
use crate::solving::{ConstrainedSolver, Objective, Solution};
use crate::specs::ConfiguredSpecs;

/// Numerically stable logistic function.
#[inline]
pub fn expit(x: f64) -> f64 {
    let e = (-x.abs()).exp();
    if x >= 0.0 {
        1.0 / (1.0 + e)
    } else {
        e / (1.0 + e)
    }
}

/// Log-odds of a probability.
#[inline]
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Stable `log(1 + exp(x))`.
#[inline]
fn log1pexp(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Evaluates the penalized binomial negative log-likelihood of an attached design.
///
/// The model itself is stateless between calls: it only remembers which
/// [`ConfiguredSpecs`] snapshot is attached, whose parameter set supplies the
/// priors and shape constraints.
#[derive(Clone, Debug, Default)]
pub struct BinomialModel {
    specs: Option<Arc<ConfiguredSpecs>>,
}

impl BinomialModel {
    /// A model without attached specs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor that attaches `specs` immediately.
    pub fn with_specs(specs: Arc<ConfiguredSpecs>) -> Self {
        Self { specs: Some(specs) }
    }

    /// Replaces the attached snapshot.
    pub fn attach_specs(&mut self, specs: Arc<ConfiguredSpecs>) {
        self.specs = Some(specs);
    }

    /// Releases the attached snapshot, returning it.
    pub fn detach_specs(&mut self) -> Option<Arc<ConfiguredSpecs>> {
        self.specs.take()
    }

    /// Whether a snapshot is attached.
    pub fn is_attached(&self) -> bool {
        self.specs.is_some()
    }

    /// The attached snapshot.
    pub fn specs(&self) -> Result<&Arc<ConfiguredSpecs>> {
        self.specs
            .as_ref()
            .ok_or_else(|| BinomError::missing_component("design specs"))
    }

    /// Parameter set of the attached snapshot.
    pub fn parameter_set(&self) -> Result<&ParameterSet> {
        Ok(self.specs()?.parameter_set())
    }

    /// Shape constraints `(C, c_lb, c_ub)` of the attached design.
    pub fn constraints(&self) -> Result<&LinearConstraints> {
        Ok(self.specs()?.constraints())
    }

    /// Design matrix of the attached training rows.
    pub fn design_matrix(&self) -> Result<&DMatrix<f64>> {
        Ok(self.specs()?.data().design())
    }

    fn check_dimensions(&self, x: &DVector<f64>, data: &ProcessedData) -> Result<&ParameterSet> {
        let parameter_set = self.parameter_set()?;
        if data.design().ncols() != parameter_set.num_fe() {
            return Err(BinomError::dimension_mismatch(
                "design columns",
                parameter_set.num_fe(),
                data.design().ncols(),
            ));
        }
        if x.len() != parameter_set.num_fe() {
            return Err(BinomError::dimension_mismatch(
                "coefficient vector",
                parameter_set.num_fe(),
                x.len(),
            ));
        }
        Ok(parameter_set)
    }

    /// `sum_i total_i * log(1 + exp(d_i x)) - obs' D x` plus every prior's penalty.
    pub fn objective(&self, x: &DVector<f64>, data: &ProcessedData) -> Result<f64> {
        let parameter_set = self.check_dimensions(x, data)?;
        let eta = data.design() * x;
        let likelihood: f64 = eta
            .iter()
            .zip(data.total().iter().zip(data.obs().iter()))
            .map(|(eta, (total, obs))| total * log1pexp(*eta) - obs * eta)
            .sum();
        let value = likelihood + parameter_set.prior_value(x);
        if !value.is_finite() {
            return Err(BinomError::NumericalError {
                context: "objective evaluation",
            });
        }
        Ok(value)
    }

    /// `D' diag(total) expit(D x) - D' obs` plus every prior's gradient.
    pub fn gradient(&self, x: &DVector<f64>, data: &ProcessedData) -> Result<DVector<f64>> {
        let parameter_set = self.check_dimensions(x, data)?;
        let eta = data.design() * x;
        let residual = DVector::from_iterator(
            eta.len(),
            eta.iter()
                .zip(data.total().iter().zip(data.obs().iter()))
                .map(|(eta, (total, obs))| total * expit(*eta) - obs),
        );
        let gradient = data.design().tr_mul(&residual) + parameter_set.prior_gradient(x);
        if gradient.iter().any(|g| !g.is_finite()) {
            return Err(BinomError::NumericalError {
                context: "gradient evaluation",
            });
        }
        Ok(gradient)
    }

    /// Predicted probabilities `expit(mat x)`; defaults to the attached design.
    pub fn forward(&self, x: &DVector<f64>, mat: Option<&DMatrix<f64>>) -> Result<DVector<f64>> {
        let mat = match mat {
            Some(mat) => mat,
            None => self.design_matrix()?,
        };
        if mat.ncols() != x.len() {
            return Err(BinomError::dimension_mismatch(
                "prediction design columns",
                x.len(),
                mat.ncols(),
            ));
        }
        Ok((mat * x).map(expit))
    }

    /// Binds the model to `data` as an optimizer objective.
    pub fn bind<'a>(&'a self, data: &'a ProcessedData) -> BoundObjective<'a> {
        BoundObjective { model: self, data }
    }

    /// Minimizes the objective over the attached data, starting from `x_init`.
    pub fn fit(&self, solver: &dyn ConstrainedSolver, x_init: &DVector<f64>) -> Result<Solution> {
        let specs = self.specs()?;
        let objective = self.bind(specs.data());
        solver.minimize(&objective, specs.constraints(), x_init)
    }
}

/// A [`BinomialModel`] paired with the data it is evaluated on.
#[derive(Clone, Copy, Debug)]
pub struct BoundObjective<'a> {
    model: &'a BinomialModel,
    data: &'a ProcessedData,
}

impl Objective for BoundObjective<'_> {
    fn value(&self, x: &DVector<f64>) -> Result<f64> {
        self.model.objective(x, self.data)
    }

    fn gradient(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        self.model.gradient(x, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataSpecs;
    use crate::frame::Frame;
    use crate::parameter::PriorVariance;
    use crate::specs::DesignSpecs;
    use approx::assert_relative_eq;

    fn configured() -> Arc<ConfiguredSpecs> {
        let frame = Frame::new()
            .with_column("success", vec![3.0, 7.0, 1.0, 9.0])
            .unwrap()
            .with_column("total", vec![10.0, 10.0, 5.0, 12.0])
            .unwrap()
            .with_column("x1", vec![-1.0, 0.5, -2.0, 1.5])
            .unwrap();
        let specs = DesignSpecs::new(DataSpecs::new("success", "total")).with_covariates(["x1"]);
        Arc::new(specs.configure_data(frame).unwrap())
    }

    #[test]
    fn expit_is_stable_and_bounded() {
        assert_relative_eq!(expit(0.0), 0.5);
        assert_eq!(expit(1e4), 1.0);
        assert_eq!(expit(-1e4), 0.0);
        assert_relative_eq!(logit(expit(1.3)), 1.3, epsilon = 1e-12);
        assert_relative_eq!(log1pexp(800.0), 800.0);
    }

    #[test]
    fn objective_matches_closed_form() {
        let specs = configured();
        let model = BinomialModel::with_specs(specs.clone());
        let x = DVector::from_vec(vec![0.2, 0.7]);
        let value = model.objective(&x, specs.data()).unwrap();

        let d = specs.data().design();
        let mut expected = 0.0;
        for i in 0..4 {
            let eta = d[(i, 0)] * x[0] + d[(i, 1)] * x[1];
            expected += specs.data().total()[i] * (1.0 + eta.exp()).ln()
                - specs.data().obs()[i] * eta;
        }
        assert_relative_eq!(value, expected, epsilon = 1e-10);
    }

    #[test]
    fn gradient_matches_finite_differences_with_priors() {
        let base = configured();
        let means = DVector::from_vec(vec![0.5, -0.3]);
        let specs = Arc::new(base.with_priors(&means, &PriorVariance::Shared(0.5)).unwrap());
        let model = BinomialModel::with_specs(specs.clone());
        let x = DVector::from_vec(vec![-0.4, 1.1]);
        let gradient = model.gradient(&x, specs.data()).unwrap();
        let h = 1e-6;
        for j in 0..2 {
            let mut plus = x.clone();
            plus[j] += h;
            let mut minus = x.clone();
            minus[j] -= h;
            let numeric = (model.objective(&plus, specs.data()).unwrap()
                - model.objective(&minus, specs.data()).unwrap())
                / (2.0 * h);
            assert_relative_eq!(gradient[j], numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn forward_stays_in_unit_interval() {
        let model = BinomialModel::with_specs(configured());
        let x = DVector::from_vec(vec![300.0, -900.0]);
        let p = model.forward(&x, None).unwrap();
        assert!(p.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn detached_model_reports_missing_specs() {
        let mut model = BinomialModel::with_specs(configured());
        assert!(model.detach_specs().is_some());
        let x = DVector::zeros(2);
        assert!(matches!(
            model.forward(&x, None),
            Err(BinomError::MissingComponent { .. })
        ));
    }
}
