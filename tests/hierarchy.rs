mod common;

use std::sync::Arc;

use binomrs::data::{DataSpecs, DataType};
use binomrs::frame::{Frame, GroupKey};
use binomrs::hierarchy::HierarchicalSolver;
use binomrs::model::BinomialModel;
use binomrs::parameter::PriorVariance;
use binomrs::solving::{build_solver, SolverMethod, SolverOptions};
use binomrs::specs::DesignSpecs;
use binomrs::{BinomError, BinomRun, FitResult, RunOptions};
use common::{group_frame, max_abs_diff};
use nalgebra::DVector;

fn grouped_model(frame: Frame) -> BinomialModel {
    let specs = DesignSpecs::new(DataSpecs::new("success", "total").with_group("g"))
        .with_covariates(["x1"])
        .configure_data(frame)
        .unwrap();
    BinomialModel::with_specs(Arc::new(specs))
}

fn hierarchy(variance: f64) -> HierarchicalSolver {
    let solver = build_solver(SolverMethod::Lbfgs, SolverOptions::default());
    HierarchicalSolver::new(solver, variance).unwrap()
}

fn centred(values: &[f64]) -> Vec<f64> {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| v - mean).collect()
}

/// True offset of each group, in group order.
fn group_offsets(frame: &Frame) -> Vec<f64> {
    let u = frame.numeric("u").unwrap();
    frame
        .partition_by("g")
        .unwrap()
        .values()
        .map(|rows| u[rows[0]])
        .collect()
}

#[test]
fn group_intercepts_recover_random_effects() {
    let frame = group_frame(2000, 5, 100, 201);
    let model = grouped_model(frame.clone());
    let mut solver = hierarchy(1.0);
    assert_eq!(solver.prior_variance(), &PriorVariance::Shared(1.0));

    let fit = solver.fit(&model, &DVector::zeros(2)).unwrap().clone();
    assert_eq!(
        fit.groups.keys().cloned().collect::<Vec<_>>(),
        (0..5).map(GroupKey::Integer).collect::<Vec<_>>()
    );
    let intercepts: Vec<f64> = fit.groups.values().map(|x| x[0]).collect();
    let u_hat = centred(&intercepts);
    let u = centred(&group_offsets(&frame));
    assert!(max_abs_diff(&u_hat, &u) < 0.15, "{u_hat:?} vs {u:?}");

    let predicted = solver.predict(&model, &frame).unwrap();
    let truth = frame.numeric("p").unwrap();
    assert!(max_abs_diff(predicted.as_slice(), &truth) < 0.15);
}

#[test]
fn tight_prior_shrinks_group_intercepts_together() {
    let frame = group_frame(2000, 5, 100, 201);
    let model = grouped_model(frame);
    let fit = hierarchy(1e-6).estimate(&model, &DVector::zeros(2)).unwrap();
    let intercepts: Vec<f64> = fit.groups.values().map(|x| x[0]).collect();
    assert!(centred(&intercepts).iter().all(|d| d.abs() < 0.15));
}

#[test]
fn run_reports_unseen_groups_at_prediction() {
    let frame = group_frame(1000, 5, 100, 3);
    let options = RunOptions::default()
        .with_covariates(["x1"])
        .with_data_type(DataType::Binomial);
    let mut run = BinomRun::new(frame, DataSpecs::new("success", "total").with_group("g"), options).unwrap();
    assert!(matches!(run.fit().unwrap(), FitResult::Hierarchical(_)));

    let new = Frame::new()
        .with_column("x1", vec![0.0, 0.5])
        .unwrap()
        .with_column("g", vec![2_i64, 9])
        .unwrap();
    let err = run.predict(Some(&new)).unwrap_err();
    match &err {
        BinomError::MissingGroup { group, .. } => assert_eq!(group, "9"),
        other => panic!("expected a missing group error, got {other}"),
    }
    assert!(err.to_string().contains('9'));
}

#[test]
fn failed_group_fit_leaves_solver_unfit() {
    let frame = group_frame(500, 5, 100, 8);
    let model = grouped_model(frame.clone());
    let mut solver = hierarchy(1.0);
    solver.fit(&model, &DVector::zeros(2)).unwrap();
    assert!(solver.is_fit());

    // A wrongly sized start vector makes the population fit fail.
    assert!(solver.fit(&model, &DVector::zeros(3)).is_err());
    assert!(!solver.is_fit());
    assert!(matches!(
        solver.predict(&model, &frame),
        Err(BinomError::NotFitted { .. })
    ));
}
