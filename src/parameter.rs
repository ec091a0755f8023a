//! Fixed-effect variables, Gaussian priors and the linear constraints they induce.

use std::ops::Range;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{BinomError, Result};
use crate::frame::Frame;
use crate::splines::{ShapeConstraint, SplineBasis, CONSTRAINT_GRID_SIZE};

/// Independent Gaussian prior over a block of coefficients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaussianPrior {
    mean: DVector<f64>,
    std: DVector<f64>,
}

impl GaussianPrior {
    /// Checks lengths match and every standard deviation is positive.
    pub fn new(mean: DVector<f64>, std: DVector<f64>) -> Result<Self> {
        if mean.len() != std.len() {
            return Err(BinomError::dimension_mismatch(
                "prior std length",
                mean.len(),
                std.len(),
            ));
        }
        if std.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(BinomError::InvalidPrior {
                reason: "prior standard deviations must be positive and finite".to_owned(),
            });
        }
        if mean.iter().any(|m| !m.is_finite()) {
            return Err(BinomError::InvalidPrior {
                reason: "prior means must be finite".to_owned(),
            });
        }
        Ok(Self { mean, std })
    }

    /// Prior means, one per coefficient of the block.
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    /// Prior standard deviations, one per coefficient of the block.
    pub fn std(&self) -> &DVector<f64> {
        &self.std
    }

    /// Negative log density up to a constant: `0.5 * sum(((x - mean) / std)^2)`.
    pub fn error_value(&self, x: &[f64]) -> f64 {
        x.iter()
            .zip(self.mean.iter().zip(self.std.iter()))
            .map(|(x, (m, s))| {
                let z = (x - m) / s;
                0.5 * z * z
            })
            .sum()
    }

    /// Gradient of [`error_value`](Self::error_value): `(x - mean) / std^2`.
    pub fn gradient(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.mean.iter().zip(self.std.iter()))
            .map(|(x, (m, s))| (x - m) / (s * s))
            .collect()
    }
}

/// Variance handed down to group-level priors in a hierarchy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriorVariance {
    /// The same variance for every coefficient.
    Shared(f64),
    /// One variance per variable, applied to every coefficient of its block.
    PerVariable(Vec<f64>),
}

impl PriorVariance {
    /// Rejects empty, non-positive or non-finite variances.
    pub fn validate(&self) -> Result<()> {
        let values: &[f64] = match self {
            PriorVariance::Shared(value) => std::slice::from_ref(value),
            PriorVariance::PerVariable(values) => values,
        };
        if values.is_empty() || values.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
            return Err(BinomError::InvalidPrior {
                reason: format!("coefficient prior variance must be positive and finite, got {self:?}"),
            });
        }
        Ok(())
    }

    /// Checks that a per-variable vector holds one variance per variable.
    pub fn check_variable_count(&self, count: usize) -> Result<()> {
        match self {
            PriorVariance::PerVariable(values) if values.len() != count => Err(BinomError::InvalidPrior {
                reason: format!(
                    "expected {count} per-variable variances (intercept, covariates and splines), got {}",
                    values.len()
                ),
            }),
            _ => Ok(()),
        }
    }

    fn for_variable(&self, index: usize, count: usize) -> Result<f64> {
        match self {
            PriorVariance::Shared(value) => Ok(*value),
            PriorVariance::PerVariable(values) => {
                if values.len() != count {
                    return Err(BinomError::dimension_mismatch(
                        "per-variable prior variances",
                        count,
                        values.len(),
                    ));
                }
                Ok(values[index])
            }
        }
    }
}

impl From<f64> for PriorVariance {
    fn from(value: f64) -> Self {
        PriorVariance::Shared(value)
    }
}

/// What a variable contributes to the linear predictor.
#[derive(Clone, Debug, PartialEq)]
pub enum VariableKind {
    Intercept,
    Covariate(String),
    Spline {
        covariate: String,
        basis: SplineBasis,
        shape: Option<ShapeConstraint>,
    },
}

/// A block of fixed effects with an optional prior.
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    kind: VariableKind,
    prior: Option<GaussianPrior>,
}

impl Variable {
    /// A constant column of ones.
    pub fn intercept() -> Self {
        Self {
            kind: VariableKind::Intercept,
            prior: None,
        }
    }

    /// A covariate column entering the predictor linearly.
    pub fn covariate(name: impl Into<String>) -> Self {
        Self {
            kind: VariableKind::Covariate(name.into()),
            prior: None,
        }
    }

    /// A spline basis over `covariate` with an optional shape restriction.
    pub fn spline(
        covariate: impl Into<String>,
        basis: SplineBasis,
        shape: Option<ShapeConstraint>,
    ) -> Self {
        Self {
            kind: VariableKind::Spline {
                covariate: covariate.into(),
                basis,
                shape,
            },
            prior: None,
        }
    }

    /// Attaches a prior, checking it covers exactly this block.
    pub fn with_prior(mut self, prior: GaussianPrior) -> Result<Self> {
        if prior.mean().len() != self.num_fe() {
            return Err(BinomError::dimension_mismatch(
                "prior length",
                self.num_fe(),
                prior.mean().len(),
            ));
        }
        self.prior = Some(prior);
        Ok(self)
    }

    /// What the variable contributes to the linear predictor.
    pub fn kind(&self) -> &VariableKind {
        &self.kind
    }

    /// The prior over this block, if one was attached.
    pub fn prior(&self) -> Option<&GaussianPrior> {
        self.prior.as_ref()
    }

    /// `intercept`, or the name of the covariate column.
    pub fn name(&self) -> &str {
        match &self.kind {
            VariableKind::Intercept => "intercept",
            VariableKind::Covariate(name) => name,
            VariableKind::Spline { covariate, .. } => covariate,
        }
    }

    /// Number of coefficients owned by the variable.
    pub fn num_fe(&self) -> usize {
        match &self.kind {
            VariableKind::Intercept | VariableKind::Covariate(_) => 1,
            VariableKind::Spline { basis, .. } => basis.column_count(),
        }
    }

    /// Design block of this variable for the rows of `frame`.
    pub fn design_block(&self, frame: &Frame) -> Result<DMatrix<f64>> {
        match &self.kind {
            VariableKind::Intercept => Ok(DMatrix::from_element(frame.nrows(), 1, 1.0)),
            VariableKind::Covariate(name) => {
                let values = finite_values(frame, name)?;
                Ok(DMatrix::from_vec(values.len(), 1, values))
            }
            VariableKind::Spline {
                covariate, basis, ..
            } => Ok(basis.design_columns(&finite_values(frame, covariate)?)),
        }
    }

    /// Shape-constraint rows restricted to this block, with their bounds.
    fn constraint_block(&self) -> Option<(DMatrix<f64>, f64, f64)> {
        match &self.kind {
            VariableKind::Spline {
                basis,
                shape: Some(shape),
                ..
            } => {
                let rows = basis.derivative_rows(shape.derivative_order(), CONSTRAINT_GRID_SIZE);
                let (lower, upper) = shape.bounds();
                Some((rows, lower, upper))
            }
            _ => None,
        }
    }
}

fn finite_values(frame: &Frame, column: &str) -> Result<Vec<f64>> {
    let values = frame.numeric(column)?;
    match values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(BinomError::NonFiniteCovariate {
            column: column.to_owned(),
            index,
        }),
        None => Ok(values),
    }
}

/// Stacked linear inequality constraints `lower <= C x <= upper`.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearConstraints {
    matrix: DMatrix<f64>,
    lower: DVector<f64>,
    upper: DVector<f64>,
}

impl LinearConstraints {
    /// No constraints on a `num_fe`-dimensional coefficient vector.
    pub fn empty(num_fe: usize) -> Self {
        Self {
            matrix: DMatrix::zeros(0, num_fe),
            lower: DVector::zeros(0),
            upper: DVector::zeros(0),
        }
    }

    /// Checks that both bound vectors have one entry per row.
    pub fn new(matrix: DMatrix<f64>, lower: DVector<f64>, upper: DVector<f64>) -> Result<Self> {
        if lower.len() != matrix.nrows() || upper.len() != matrix.nrows() {
            return Err(BinomError::dimension_mismatch(
                "constraint bounds",
                matrix.nrows(),
                lower.len().min(upper.len()),
            ));
        }
        Ok(Self {
            matrix,
            lower,
            upper,
        })
    }

    /// The constraint matrix `C`.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Lower bounds, `-inf` where unbounded.
    pub fn lower(&self) -> &DVector<f64> {
        &self.lower
    }

    /// Upper bounds, `+inf` where unbounded.
    pub fn upper(&self) -> &DVector<f64> {
        &self.upper
    }

    /// Number of constraint rows.
    pub fn row_count(&self) -> usize {
        self.matrix.nrows()
    }

    /// Whether there are no constraint rows.
    pub fn is_empty(&self) -> bool {
        self.matrix.nrows() == 0
    }

    /// Largest amount by which `x` violates any bound (zero when feasible).
    pub fn max_violation(&self, x: &DVector<f64>) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let values = &self.matrix * x;
        values
            .iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .map(|(v, (lo, hi))| (lo - v).max(v - hi).max(0.0))
            .fold(0.0, f64::max)
    }
}

/// Ordered collection of variables defining the coefficient vector.
///
/// The intercept comes first, then covariates, then splines, each owning a
/// contiguous block of the coefficient vector.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterSet {
    variables: Vec<Variable>,
}

impl ParameterSet {
    /// Variables in coefficient order, intercept first.
    pub fn new(variables: Vec<Variable>) -> Self {
        Self { variables }
    }

    /// Variables in coefficient order.
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Total number of fixed-effect coefficients.
    pub fn num_fe(&self) -> usize {
        self.variables.iter().map(Variable::num_fe).sum()
    }

    /// Iterates over variables paired with their coefficient ranges.
    pub fn blocks(&self) -> impl Iterator<Item = (&Variable, Range<usize>)> {
        let mut start = 0usize;
        self.variables.iter().map(move |variable| {
            let range = start..start + variable.num_fe();
            start = range.end;
            (variable, range)
        })
    }

    /// Horizontally stacks every variable's design block.
    pub fn design_matrix(&self, frame: &Frame) -> Result<DMatrix<f64>> {
        let mut design = DMatrix::zeros(frame.nrows(), self.num_fe());
        for (variable, range) in self.blocks() {
            let block = variable.design_block(frame)?;
            design.columns_mut(range.start, range.len()).copy_from(&block);
        }
        Ok(design)
    }

    /// Concatenates the shape-constraint rows of every spline.
    pub fn constraints(&self) -> LinearConstraints {
        let p = self.num_fe();
        let blocks: Vec<(Range<usize>, DMatrix<f64>, f64, f64)> = self
            .blocks()
            .filter_map(|(variable, range)| {
                variable
                    .constraint_block()
                    .map(|(rows, lower, upper)| (range, rows, lower, upper))
            })
            .collect();
        let total_rows: usize = blocks.iter().map(|(_, rows, _, _)| rows.nrows()).sum();
        if total_rows == 0 {
            return LinearConstraints::empty(p);
        }

        let mut matrix = DMatrix::zeros(total_rows, p);
        let mut lower = DVector::zeros(total_rows);
        let mut upper = DVector::zeros(total_rows);
        let mut offset = 0usize;
        for (range, rows, lo, hi) in blocks {
            let count = rows.nrows();
            matrix
                .view_mut((offset, range.start), (count, range.len()))
                .copy_from(&rows);
            lower.rows_mut(offset, count).fill(lo);
            upper.rows_mut(offset, count).fill(hi);
            offset += count;
        }
        LinearConstraints {
            matrix,
            lower,
            upper,
        }
    }

    /// Sum of every attached prior's negative log density at `x`.
    pub fn prior_value(&self, x: &DVector<f64>) -> f64 {
        self.blocks()
            .filter_map(|(variable, range)| {
                variable
                    .prior()
                    .map(|prior| prior.error_value(&x.as_slice()[range]))
            })
            .sum()
    }

    /// Gradient of [`prior_value`](Self::prior_value), zero outside prior-carrying blocks.
    pub fn prior_gradient(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut gradient = DVector::zeros(x.len());
        for (variable, range) in self.blocks() {
            if let Some(prior) = variable.prior() {
                let block = prior.gradient(&x.as_slice()[range.clone()]);
                gradient.rows_mut(range.start, range.len()).copy_from_slice(&block);
            }
        }
        gradient
    }

    /// Returns a new parameter set whose every block carries a Gaussian prior
    /// centred on the matching block of `means`.
    pub fn with_priors(&self, means: &DVector<f64>, variance: &PriorVariance) -> Result<Self> {
        if means.len() != self.num_fe() {
            return Err(BinomError::dimension_mismatch(
                "prior means",
                self.num_fe(),
                means.len(),
            ));
        }
        variance.validate()?;

        let count = self.variables.len();
        let variables = self
            .blocks()
            .enumerate()
            .map(|(index, (variable, range))| {
                let std = variance.for_variable(index, count)?.sqrt();
                let prior = GaussianPrior::new(
                    DVector::from_column_slice(&means.as_slice()[range.clone()]),
                    DVector::from_element(range.len(), std),
                )?;
                variable.clone().with_prior(prior)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { variables })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splines::{KnotsType, SplineOptions};
    use approx::assert_relative_eq;

    fn frame() -> Frame {
        Frame::new()
            .with_column("x", (0..50).map(|i| i as f64 / 5.0).collect::<Vec<_>>())
            .unwrap()
    }

    fn parameter_set(shape: Option<ShapeConstraint>) -> ParameterSet {
        let options = SplineOptions::default().with_knots(KnotsType::Domain, 4);
        let basis = SplineBasis::fit("x", &frame().numeric("x").unwrap(), &options).unwrap();
        ParameterSet::new(vec![
            Variable::intercept(),
            Variable::covariate("x"),
            Variable::spline("x", basis, shape),
        ])
    }

    #[test]
    fn blocks_follow_variable_order() {
        let set = parameter_set(None);
        let ranges: Vec<Range<usize>> = set.blocks().map(|(_, range)| range).collect();
        assert_eq!(ranges, vec![0..1, 1..2, 2..7]);
        let design = set.design_matrix(&frame()).unwrap();
        assert_eq!(design.shape(), (50, 7));
        assert_eq!(design[(3, 0)], 1.0);
        assert_eq!(design[(3, 1)], 0.6);
    }

    #[test]
    fn non_finite_covariates_are_rejected() {
        let mut values: Vec<f64> = (0..50).map(|i| i as f64 / 5.0).collect();
        values[7] = f64::NAN;
        let frame = Frame::new().with_column("x", values).unwrap();
        let spline_only = ParameterSet::new(vec![
            Variable::intercept(),
            parameter_set(None).variables()[2].clone(),
        ]);
        assert!(matches!(
            spline_only.design_matrix(&frame),
            Err(BinomError::NonFiniteCovariate { index: 7, .. })
        ));
        let linear = ParameterSet::new(vec![Variable::intercept(), Variable::covariate("x")]);
        assert!(matches!(
            linear.design_matrix(&frame),
            Err(BinomError::NonFiniteCovariate { index: 7, .. })
        ));
    }

    #[test]
    fn constraints_cover_only_the_spline_block() {
        assert!(parameter_set(None).constraints().is_empty());

        let constraints = parameter_set(Some(ShapeConstraint::Increasing)).constraints();
        assert_eq!(constraints.row_count(), CONSTRAINT_GRID_SIZE);
        assert!(constraints.matrix().columns(0, 2).iter().all(|v| *v == 0.0));
        assert!(constraints.lower().iter().all(|v| *v == 0.0));
        assert!(constraints.upper().iter().all(|v| v.is_infinite()));
    }

    #[test]
    fn priors_are_rebuilt_without_touching_the_source() {
        let set = parameter_set(None);
        let means = DVector::from_fn(set.num_fe(), |i, _| i as f64);
        let with_priors = set.with_priors(&means, &PriorVariance::Shared(4.0)).unwrap();
        assert!(set.variables().iter().all(|v| v.prior().is_none()));

        assert_relative_eq!(with_priors.prior_value(&means), 0.0);
        let shifted = means.add_scalar(2.0);
        // Every coefficient sits one standard deviation away from its prior mean.
        assert_relative_eq!(with_priors.prior_value(&shifted), 0.5 * 7.0, epsilon = 1e-12);
        let gradient = with_priors.prior_gradient(&shifted);
        assert!(gradient.iter().all(|g| (g - 0.5).abs() < 1e-12));
    }

    #[test]
    fn per_variable_variance_must_match_variable_count() {
        let set = parameter_set(None);
        let means = DVector::zeros(set.num_fe());
        let result = set.with_priors(&means, &PriorVariance::PerVariable(vec![1.0, 2.0]));
        assert!(matches!(result, Err(BinomError::DimensionMismatch { .. })));
        assert!(set
            .with_priors(&means, &PriorVariance::Shared(-1.0))
            .is_err());
    }
}
