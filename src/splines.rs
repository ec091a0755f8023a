//! Spline options, knot placement and B-spline evaluation.
//!
//! A spline covariate is expanded into a B-spline basis whose knots are placed
//! once, from the data used at configuration time, and reused afterwards for
//! prediction. Shape restrictions are expressed as linear inequalities on the
//! first or second derivative of the fitted curve over a fixed grid.

use std::fmt;
use std::str::FromStr;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BinomError, Result};

/// Number of grid points on which shape constraints are enforced.
pub const CONSTRAINT_GRID_SIZE: usize = 20;

/// Strategy for placing knots over a covariate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnotsType {
    /// Knots evenly spaced between the covariate minimum and maximum.
    Domain,
    /// Knots placed at evenly spaced empirical quantiles.
    Frequency,
}

impl FromStr for KnotsType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, String> {
        match value {
            "domain" => Ok(KnotsType::Domain),
            "frequency" => Ok(KnotsType::Frequency),
            other => Err(other.to_owned()),
        }
    }
}

/// Shape restriction imposed on a spline's contribution to the linear predictor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeConstraint {
    Increasing,
    Decreasing,
    Concave,
    Convex,
}

impl ShapeConstraint {
    pub const ALL: [ShapeConstraint; 4] = [
        ShapeConstraint::Increasing,
        ShapeConstraint::Decreasing,
        ShapeConstraint::Concave,
        ShapeConstraint::Convex,
    ];

    /// Name of the shape flag in spline options.
    pub fn name(self) -> &'static str {
        match self {
            ShapeConstraint::Increasing => "increasing",
            ShapeConstraint::Decreasing => "decreasing",
            ShapeConstraint::Concave => "concave",
            ShapeConstraint::Convex => "convex",
        }
    }

    /// Order of the derivative the constraint acts on.
    pub fn derivative_order(self) -> usize {
        match self {
            ShapeConstraint::Increasing | ShapeConstraint::Decreasing => 1,
            ShapeConstraint::Concave | ShapeConstraint::Convex => 2,
        }
    }

    /// Bounds `(lower, upper)` on the constrained derivative.
    pub fn bounds(self) -> (f64, f64) {
        match self {
            ShapeConstraint::Increasing | ShapeConstraint::Convex => (0.0, f64::INFINITY),
            ShapeConstraint::Decreasing | ShapeConstraint::Concave => (f64::NEG_INFINITY, 0.0),
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|shape| shape.name() == name)
    }
}

impl fmt::Display for ShapeConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// User-facing configuration of one spline covariate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplineOptions {
    pub knots_type: KnotsType,
    /// Number of knots, including both boundary knots.
    pub knots_num: usize,
    pub degree: usize,
    /// Linear tail on the left-most knot interval.
    pub l_linear: bool,
    /// Linear tail on the right-most knot interval.
    pub r_linear: bool,
    pub shape: Option<ShapeConstraint>,
}

impl Default for SplineOptions {
    fn default() -> Self {
        Self {
            knots_type: KnotsType::Frequency,
            knots_num: 3,
            degree: 3,
            l_linear: false,
            r_linear: false,
            shape: None,
        }
    }
}

impl SplineOptions {
    /// Set the knot placement rule and knot count.
    pub fn with_knots(mut self, knots_type: KnotsType, knots_num: usize) -> Self {
        self.knots_type = knots_type;
        self.knots_num = knots_num;
        self
    }

    /// Set the polynomial degree of the basis.
    pub fn with_degree(mut self, degree: usize) -> Self {
        self.degree = degree;
        self
    }

    /// Replace the outer basis segments with linear tails.
    pub fn with_linear_tails(mut self, left: bool, right: bool) -> Self {
        self.l_linear = left;
        self.r_linear = right;
        self
    }

    /// Restrict the fitted curve to one shape.
    pub fn with_shape(mut self, shape: ShapeConstraint) -> Self {
        self.shape = Some(shape);
        self
    }

    /// Number of knots left for the polynomial part once linear tails are removed.
    pub fn effective_knots(&self) -> usize {
        self.knots_num
            .saturating_sub(self.l_linear as usize + self.r_linear as usize)
    }

    /// Checks that the options describe a buildable spline.
    pub fn validate(&self, spline: &str) -> Result<()> {
        if self.degree == 0 {
            return Err(BinomError::invalid_spline(spline, "degree must be at least 1"));
        }
        if self.effective_knots() < 2 {
            return Err(BinomError::invalid_spline(
                spline,
                format!(
                    "{} knots leave fewer than two knots once linear tails are removed",
                    self.knots_num
                ),
            ));
        }
        Ok(())
    }

    /// Parses options from a JSON object such as
    /// `{"knots_type": "domain", "knots_num": 3, "degree": 3, "convex": true}`.
    ///
    /// Every value must carry the exact JSON type of its option, and at most
    /// one of `increasing`, `decreasing`, `concave` and `convex` may be true.
    pub fn from_json(spline: &str, value: &Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| BinomError::InvalidSplineOption {
            spline: spline.to_owned(),
            option: "<options>".to_owned(),
            expected: "object",
            found: json_type_name(value),
        })?;

        let mut options = SplineOptions::default();
        let mut shapes = Vec::new();
        for (option, value) in object {
            let type_error = |expected: &'static str| BinomError::InvalidSplineOption {
                spline: spline.to_owned(),
                option: option.clone(),
                expected,
                found: json_type_name(value),
            };
            match option.as_str() {
                "knots_type" => {
                    let raw = value.as_str().ok_or_else(|| type_error("str"))?;
                    options.knots_type = raw.parse().map_err(|bad| {
                        BinomError::invalid_spline(
                            spline,
                            format!("knots_type must be 'domain' or 'frequency', got '{bad}'"),
                        )
                    })?;
                }
                "knots_num" => {
                    options.knots_num = json_usize(value).ok_or_else(|| type_error("int"))?;
                }
                "degree" => {
                    options.degree = json_usize(value).ok_or_else(|| type_error("int"))?;
                }
                "l_linear" => options.l_linear = value.as_bool().ok_or_else(|| type_error("bool"))?,
                "r_linear" => options.r_linear = value.as_bool().ok_or_else(|| type_error("bool"))?,
                name => match ShapeConstraint::from_name(name) {
                    Some(shape) => {
                        if value.as_bool().ok_or_else(|| type_error("bool"))? {
                            shapes.push(shape);
                        }
                    }
                    None => {
                        return Err(BinomError::UnknownSplineOption {
                            spline: spline.to_owned(),
                            option: name.to_owned(),
                        })
                    }
                },
            }
        }

        if shapes.len() > 1 {
            let names: Vec<&str> = shapes.iter().map(|shape| shape.name()).collect();
            return Err(BinomError::ConflictingShapeConstraints {
                spline: spline.to_owned(),
                constraints: names.join(", "),
            });
        }
        options.shape = shapes.pop();
        options.validate(spline)?;
        Ok(options)
    }
}

fn json_usize(value: &Value) -> Option<usize> {
    value.as_u64().and_then(|v| usize::try_from(v).ok())
}

fn json_type_name(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
    .to_owned()
}

/// A B-spline basis with fixed knot placement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplineBasis {
    knots: Vec<f64>,
    degree: usize,
    l_linear: bool,
    r_linear: bool,
    /// Clamped knot vector over the polynomial part of the domain.
    knot_vector: Vec<f64>,
}

impl SplineBasis {
    /// Places knots over `values` according to `options`.
    pub fn fit(spline: &str, values: &[f64], options: &SplineOptions) -> Result<Self> {
        options.validate(spline)?;
        if values.is_empty() {
            return Err(BinomError::EmptyData {
                context: "spline knot placement",
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(BinomError::NumericalError {
                context: "spline covariate",
            });
        }

        let positions: Vec<f64> = (0..options.knots_num)
            .map(|j| j as f64 / (options.knots_num - 1) as f64)
            .collect();
        let knots = match options.knots_type {
            KnotsType::Domain => {
                let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
                let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                positions.iter().map(|q| lo + (hi - lo) * q).collect()
            }
            KnotsType::Frequency => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                positions.iter().map(|&q| quantile_sorted(&sorted, q)).collect()
            }
        };

        Self::from_knots(spline, knots, options.degree, options.l_linear, options.r_linear)
    }

    /// Builds a basis from explicit knots (boundary knots included).
    pub fn from_knots(
        spline: &str,
        knots: Vec<f64>,
        degree: usize,
        l_linear: bool,
        r_linear: bool,
    ) -> Result<Self> {
        if knots.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(BinomError::invalid_spline(
                spline,
                "knots must be strictly increasing; the covariate has too few distinct values",
            ));
        }
        let start = l_linear as usize;
        let end = knots.len().saturating_sub(r_linear as usize);
        if degree == 0 || end < start + 2 {
            return Err(BinomError::invalid_spline(
                spline,
                "basis needs degree >= 1 and two knots outside the linear tails",
            ));
        }

        let inner = &knots[start..end];
        let mut knot_vector = vec![inner[0]; degree + 1];
        knot_vector.extend_from_slice(&inner[1..inner.len() - 1]);
        knot_vector.extend(std::iter::repeat(inner[inner.len() - 1]).take(degree + 1));

        Ok(Self {
            knots,
            degree,
            l_linear,
            r_linear,
            knot_vector,
        })
    }

    /// Interior and boundary knots, sorted.
    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    /// Polynomial degree of the basis.
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Boundary knots `(first, last)`.
    pub fn domain(&self) -> (f64, f64) {
        (self.knots[0], self.knots[self.knots.len() - 1])
    }

    /// Number of B-spline functions in the full basis.
    pub fn function_count(&self) -> usize {
        self.knot_vector.len() - self.degree - 1
    }

    /// Number of design columns; the first basis function is absorbed by the intercept.
    pub fn column_count(&self) -> usize {
        self.function_count() - 1
    }

    /// Evaluates the `order`-th derivative of every basis function at `x`.
    pub fn evaluate(&self, x: f64, order: usize) -> Vec<f64> {
        let lo = self.knot_vector[0];
        let hi = self.knot_vector[self.knot_vector.len() - 1];
        if x < lo {
            return self.extend_from(lo, x - lo, order, self.l_linear);
        }
        if x > hi {
            return self.extend_from(hi, x - hi, order, self.r_linear);
        }
        basis_derivative(x, self.degree, &self.knot_vector, order)
    }

    /// Design block for `values`: one row per value, `column_count` columns.
    pub fn design_columns(&self, values: &[f64]) -> DMatrix<f64> {
        let mut block = DMatrix::zeros(values.len(), self.column_count());
        for (row, &x) in values.iter().enumerate() {
            for (col, value) in self.evaluate(x, 0).into_iter().skip(1).enumerate() {
                block[(row, col)] = value;
            }
        }
        block
    }

    /// Derivative rows of the design block evaluated on a uniform grid over the knot domain.
    pub fn derivative_rows(&self, order: usize, grid_size: usize) -> DMatrix<f64> {
        let (lo, hi) = self.domain();
        let steps = grid_size.max(2) - 1;
        let grid: Vec<f64> = (0..=steps)
            .map(|i| lo + (hi - lo) * i as f64 / steps as f64)
            .collect();
        let mut rows = DMatrix::zeros(grid.len(), self.column_count());
        for (row, &x) in grid.iter().enumerate() {
            for (col, value) in self.evaluate(x, order).into_iter().skip(1).enumerate() {
                rows[(row, col)] = value;
            }
        }
        rows
    }

    /// Outside the polynomial domain the basis is either extended linearly or held constant.
    fn extend_from(&self, anchor: f64, offset: f64, order: usize, linear: bool) -> Vec<f64> {
        let count = self.function_count();
        match (order, linear) {
            (0, true) => {
                let value = basis_derivative(anchor, self.degree, &self.knot_vector, 0);
                let slope = basis_derivative(anchor, self.degree, &self.knot_vector, 1);
                value
                    .iter()
                    .zip(slope.iter())
                    .map(|(v, s)| v + s * offset)
                    .collect()
            }
            (0, false) => basis_derivative(anchor, self.degree, &self.knot_vector, 0),
            (1, true) => basis_derivative(anchor, self.degree, &self.knot_vector, 1),
            _ => vec![0.0; count],
        }
    }
}

/// Type-7 quantile of already sorted data.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let fraction = pos - lower as f64;
    sorted[lower] * (1.0 - fraction) + sorted[upper] * fraction
}

/// Cox-de Boor evaluation of all degree-`degree` B-splines on `knots` at `x`.
///
/// Intervals are half-open except the last non-degenerate one, which also
/// owns the right boundary knot.
fn cox_de_boor(x: f64, degree: usize, knots: &[f64]) -> Vec<f64> {
    let m = knots.len();
    let mut values: Vec<f64> = (0..m - 1)
        .map(|i| {
            if knots[i] <= x && x < knots[i + 1] {
                1.0
            } else {
                0.0
            }
        })
        .collect();
    if x >= knots[m - 1] {
        if let Some(i) = (0..m - 1).rev().find(|&i| knots[i] < knots[i + 1]) {
            values[i] = 1.0;
        }
    }

    for p in 1..=degree {
        values = (0..m - 1 - p)
            .map(|i| {
                let left_span = knots[i + p] - knots[i];
                let right_span = knots[i + p + 1] - knots[i + 1];
                let left = if left_span > 0.0 {
                    (x - knots[i]) / left_span * values[i]
                } else {
                    0.0
                };
                let right = if right_span > 0.0 {
                    (knots[i + p + 1] - x) / right_span * values[i + 1]
                } else {
                    0.0
                };
                left + right
            })
            .collect();
    }
    values
}

/// `order`-th derivative of all degree-`degree` B-splines, via the standard
/// recursion on lower-degree derivatives.
fn basis_derivative(x: f64, degree: usize, knots: &[f64], order: usize) -> Vec<f64> {
    if order == 0 {
        return cox_de_boor(x, degree, knots);
    }
    let count = knots.len() - degree - 1;
    if degree == 0 {
        return vec![0.0; count];
    }
    let lower = basis_derivative(x, degree - 1, knots, order - 1);
    let p = degree as f64;
    (0..count)
        .map(|i| {
            let left_span = knots[i + degree] - knots[i];
            let right_span = knots[i + degree + 1] - knots[i + 1];
            let left = if left_span > 0.0 { lower[i] / left_span } else { 0.0 };
            let right = if right_span > 0.0 {
                lower[i + 1] / right_span
            } else {
                0.0
            };
            p * (left - right)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    fn uniform_values() -> Vec<f64> {
        (0..=100).map(|i| i as f64 / 10.0).collect()
    }

    #[test]
    fn basis_is_a_partition_of_unity() {
        let options = SplineOptions::default().with_knots(KnotsType::Domain, 4);
        let basis = SplineBasis::fit("x", &uniform_values(), &options).unwrap();
        assert_eq!(basis.function_count(), 6);
        assert_eq!(basis.column_count(), 5);
        for x in [0.0, 1.3, 5.0, 9.99, 10.0] {
            let sum: f64 = basis.evaluate(x, 0).iter().sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-12);
            let slope: f64 = basis.evaluate(x, 1).iter().sum();
            assert_relative_eq!(slope, 0.0, epsilon = 1e-9);
            let curvature: f64 = basis.evaluate(x, 2).iter().sum();
            assert_relative_eq!(curvature, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn derivative_matches_finite_difference() {
        let options = SplineOptions::default().with_knots(KnotsType::Domain, 5);
        let basis = SplineBasis::fit("x", &uniform_values(), &options).unwrap();
        let h = 1e-6;
        for x in [0.7, 3.1, 6.4] {
            let analytic = basis.evaluate(x, 1);
            let plus = basis.evaluate(x + h, 0);
            let minus = basis.evaluate(x - h, 0);
            for j in 0..analytic.len() {
                assert_relative_eq!(analytic[j], (plus[j] - minus[j]) / (2.0 * h), epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn frequency_knots_follow_quantiles() {
        let values = vec![0.0, 1.0, 2.0, 3.0, 100.0];
        let basis = SplineBasis::fit("x", &values, &SplineOptions::default()).unwrap();
        assert_eq!(basis.knots(), &[0.0, 2.0, 100.0]);
    }

    #[test]
    fn linear_tails_extend_linearly() {
        let options = SplineOptions::default()
            .with_knots(KnotsType::Domain, 5)
            .with_linear_tails(true, true);
        let basis = SplineBasis::fit("x", &uniform_values(), &options).unwrap();
        assert_eq!(basis.column_count(), options.knots_num + options.degree - 4);
        let a = basis.evaluate(0.5, 0);
        let b = basis.evaluate(1.0, 0);
        let c = basis.evaluate(1.5, 0);
        for j in 0..a.len() {
            assert_relative_eq!(b[j] - a[j], c[j] - b[j], epsilon = 1e-9);
        }
        assert!(basis.evaluate(0.5, 2).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn json_options_are_type_checked() {
        let ok = SplineOptions::from_json(
            "x1",
            &json!({"knots_type": "domain", "knots_num": 4, "degree": 3, "concave": true, "convex": false}),
        )
        .unwrap();
        assert_eq!(ok.shape, Some(ShapeConstraint::Concave));
        assert_eq!(ok.knots_type, KnotsType::Domain);

        let wrong_type = SplineOptions::from_json("x1", &json!({"knots_num": 3.0}));
        assert!(matches!(wrong_type, Err(BinomError::InvalidSplineOption { .. })));

        let unknown = SplineOptions::from_json("x1", &json!({"smoothness": 1}));
        assert!(matches!(unknown, Err(BinomError::UnknownSplineOption { .. })));

        let conflicting =
            SplineOptions::from_json("x1", &json!({"increasing": true, "convex": true}));
        assert!(matches!(
            conflicting,
            Err(BinomError::ConflictingShapeConstraints { .. })
        ));
    }

    #[test]
    fn degenerate_covariate_is_rejected() {
        let values = vec![1.0; 10];
        let result = SplineBasis::fit("x", &values, &SplineOptions::default());
        assert!(matches!(result, Err(BinomError::InvalidSpline { .. })));
    }
}
