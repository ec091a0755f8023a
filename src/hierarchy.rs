//! Two-level fits: a population fit followed by prior-shrunk per-group refits.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{BinomError, Result};
use crate::frame::{Frame, GroupKey};
use crate::model::{expit, BinomialModel};
use crate::parameter::{ParameterSet, PriorVariance};
use crate::solving::ConstrainedSolver;

/// Coefficient vectors keyed by group, ordered by the group's natural order.
pub type GroupFits = BTreeMap<GroupKey, DVector<f64>>;

/// Outcome of a hierarchical fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HierarchicalFit {
    /// Coefficients fit on every row.
    pub population: DVector<f64>,
    /// Coefficients fit on each group's rows under priors centred on `population`.
    pub groups: GroupFits,
}

impl HierarchicalFit {
    /// Coefficients of one group.
    pub fn group(&self, key: &GroupKey) -> Option<&DVector<f64>> {
        self.groups.get(key)
    }

    /// Probabilities for `frame`, dispatching each row to its group's coefficients.
    ///
    /// `parameter_set` supplies the spline knots the coefficients refer to.
    pub fn predict(
        &self,
        parameter_set: &ParameterSet,
        col_group: &str,
        frame: &Frame,
    ) -> Result<DVector<f64>> {
        let design = parameter_set.design_matrix(frame)?;
        let keys = frame.group_keys(col_group)?;
        let mut probabilities = DVector::zeros(frame.nrows());
        for (row, key) in keys.iter().enumerate() {
            let x = self.groups.get(key).ok_or_else(|| self.missing_group(key))?;
            if x.len() != design.ncols() {
                return Err(BinomError::dimension_mismatch(
                    "group coefficient vector",
                    design.ncols(),
                    x.len(),
                ));
            }
            let eta: f64 = design.row(row).iter().zip(x.iter()).map(|(d, b)| d * b).sum();
            probabilities[row] = expit(eta);
        }
        Ok(probabilities)
    }

    fn missing_group(&self, key: &GroupKey) -> BinomError {
        let available = self
            .groups
            .keys()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        BinomError::MissingGroup {
            group: key.to_string(),
            available,
        }
    }
}

/// Wraps a [`ConstrainedSolver`] with population-to-group shrinkage.
///
/// The solver is either Unfit or Fit. [`fit`](Self::fit) discards any
/// previous result before starting, so a failed fit leaves it Unfit.
#[derive(Clone, Debug)]
pub struct HierarchicalSolver {
    solver: Arc<dyn ConstrainedSolver>,
    prior_variance: PriorVariance,
    result: Option<HierarchicalFit>,
}

impl HierarchicalSolver {
    /// `prior_variance` is the shrinkage knob: smaller values pull group
    /// coefficients harder towards the population fit.
    pub fn new(solver: Arc<dyn ConstrainedSolver>, prior_variance: impl Into<PriorVariance>) -> Result<Self> {
        let prior_variance = prior_variance.into();
        prior_variance.validate()?;
        Ok(Self {
            solver,
            prior_variance,
            result: None,
        })
    }

    /// Solver shared by the population and group fits.
    pub fn solver(&self) -> &Arc<dyn ConstrainedSolver> {
        &self.solver
    }

    /// Variance of the group-level priors.
    pub fn prior_variance(&self) -> &PriorVariance {
        &self.prior_variance
    }

    /// Whether the last fit succeeded.
    pub fn is_fit(&self) -> bool {
        self.result.is_some()
    }

    /// Result of the last successful fit.
    pub fn result(&self) -> Option<&HierarchicalFit> {
        self.result.as_ref()
    }

    /// Runs the hierarchical fit and stores the result.
    pub fn fit(&mut self, model: &BinomialModel, x_init: &DVector<f64>) -> Result<&HierarchicalFit> {
        self.result = None;
        let result = self.estimate(model, x_init)?;
        Ok(self.result.insert(result))
    }

    /// Runs the hierarchical fit without touching stored state.
    pub fn estimate(&self, model: &BinomialModel, x_init: &DVector<f64>) -> Result<HierarchicalFit> {
        let specs = model.specs()?;
        let col_group = specs
            .data_specs()
            .col_group()
            .ok_or_else(|| BinomError::missing_component("group column"))?;

        let population = model.fit(self.solver.as_ref(), x_init)?;
        info!(
            "population fit finished after {} iterations (objective {:.6})",
            population.iterations, population.objective
        );

        let prior_specs = specs.with_priors(&population.x, &self.prior_variance)?;
        let partitions = specs.frame().partition_by(col_group)?;
        let mut groups = GroupFits::new();
        for (key, rows) in partitions {
            let group_specs = prior_specs.reconfigure(specs.frame().take(&rows))?;
            let group_model = BinomialModel::with_specs(Arc::new(group_specs));
            let solution = group_model.fit(self.solver.as_ref(), &population.x)?;
            debug!(
                "group {key} ({} rows) fit after {} iterations",
                rows.len(),
                solution.iterations
            );
            groups.insert(key, solution.x);
        }
        info!("fit {} groups against the population prior", groups.len());

        Ok(HierarchicalFit {
            population: population.x,
            groups,
        })
    }

    /// Probabilities for `frame` under the stored group fits.
    ///
    /// Uses the attached specs of `model` for the knots and the group column.
    pub fn predict(&self, model: &BinomialModel, frame: &Frame) -> Result<DVector<f64>> {
        let result = self.result.as_ref().ok_or(BinomError::NotFitted {
            context: "hierarchical prediction",
        })?;
        let specs = model.specs()?;
        let col_group = specs
            .data_specs()
            .col_group()
            .ok_or_else(|| BinomError::missing_component("group column"))?;
        result.predict(specs.parameter_set(), col_group, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataSpecs;
    use crate::solving::{LbfgsSolver, SolverOptions};
    use crate::specs::DesignSpecs;

    fn grouped_frame() -> Frame {
        // Three groups with clearly different success rates.
        let group: Vec<i64> = (0..30).map(|i| i / 10).collect();
        let total = vec![50.0; 30];
        let success: Vec<f64> = group.iter().map(|g| [10.0, 25.0, 40.0][*g as usize]).collect();
        Frame::new()
            .with_column("success", success)
            .unwrap()
            .with_column("total", total)
            .unwrap()
            .with_column("g", group)
            .unwrap()
    }

    fn model() -> BinomialModel {
        let specs = DesignSpecs::new(DataSpecs::new("success", "total").with_group("g"))
            .configure_data(grouped_frame())
            .unwrap();
        BinomialModel::with_specs(Arc::new(specs))
    }

    fn solver(variance: f64) -> HierarchicalSolver {
        HierarchicalSolver::new(Arc::new(LbfgsSolver::new(SolverOptions::default())), variance).unwrap()
    }

    #[test]
    fn group_intercepts_follow_group_rates_with_weak_prior() {
        let model = model();
        let mut solver = solver(100.0);
        let fit = solver.fit(&model, &DVector::zeros(1)).unwrap().clone();
        assert_eq!(fit.groups.len(), 3);
        let rates: Vec<f64> = fit.groups.values().map(|x| expit(x[0])).collect();
        assert!((rates[0] - 0.2).abs() < 0.01);
        assert!((rates[1] - 0.5).abs() < 0.01);
        assert!((rates[2] - 0.8).abs() < 0.01);
    }

    #[test]
    fn strong_prior_shrinks_groups_to_population() {
        let model = model();
        let fit = solver(1e-6).estimate(&model, &DVector::zeros(1)).unwrap();
        for x in fit.groups.values() {
            assert!((x[0] - fit.population[0]).abs() < 0.01);
        }
    }

    #[test]
    fn unseen_group_is_named_in_the_error() {
        let model = model();
        let mut solver = solver(1.0);
        assert!(matches!(
            solver.predict(&model, &grouped_frame()),
            Err(BinomError::NotFitted { .. })
        ));
        solver.fit(&model, &DVector::zeros(1)).unwrap();

        let new = Frame::new().with_column("g", vec![1_i64, 7]).unwrap();
        match solver.predict(&model, &new) {
            Err(BinomError::MissingGroup { group, available }) => {
                assert_eq!(group, "7");
                assert_eq!(available, "0, 1, 2");
            }
            other => panic!("expected missing group error, got {other:?}"),
        }
    }

    #[test]
    fn ungrouped_specs_cannot_be_fit_hierarchically() {
        let specs = DesignSpecs::new(DataSpecs::new("success", "total"))
            .configure_data(grouped_frame())
            .unwrap();
        let model = BinomialModel::with_specs(Arc::new(specs));
        let result = solver(1.0).estimate(&model, &DVector::zeros(1));
        assert!(matches!(result, Err(BinomError::MissingComponent { .. })));
    }
}
