//! Binomial logistic regression with shape-constrained splines, hierarchical
//! shrinkage and bootstrap uncertainty.
//!
//! Rows are modeled as `success_i ~ Binomial(total_i, p_i)` where `p_i` is the
//! expit of a linear predictor built from an intercept, plain covariates and
//! B-spline bases. The crate provides tools to
//!
//! - hold observation tables and column roles (`frame` and `data` modules),
//! - build spline bases and their shape constraints (`splines`),
//! - evaluate the penalized binomial likelihood (`model`),
//! - minimize it with or without linear constraints (`solving`),
//! - shrink per-group fits towards a population fit (`hierarchy`), and
//! - resample and refit to quantify uncertainty (`bootstrap`).
//!
//! [`BinomRun`] ties these together for the common case.
//!
//! # Quick start
//!
//! ```no_run
//! use binomrs::data::{DataSpecs, DataType};
//! use binomrs::frame::Frame;
//! use binomrs::{BinomRun, RunOptions};
//!
//! let frame = Frame::new()
//!     .with_column("deaths", vec![3.0, 8.0, 15.0, 24.0])?
//!     .with_column("cases", vec![40.0, 40.0, 40.0, 40.0])?
//!     .with_column("age", vec![20.0, 40.0, 60.0, 80.0])?;
//!
//! let options = RunOptions::default()
//!     .with_covariates(["age"])
//!     .with_data_type(DataType::Binomial);
//! let mut run = BinomRun::new(frame, DataSpecs::new("deaths", "cases"), options)?;
//!
//! run.fit()?;
//! let fitted = run.predict(None)?;
//! run.make_uncertainty(100)?;
//! println!("{fitted} {:?}", run.replicates().map(|set| set.len()));
//! # Ok::<(), binomrs::BinomError>(())
//! ```

pub mod bootstrap;
pub mod data;
pub mod error;
pub mod frame;
pub mod hierarchy;
pub mod model;
pub mod options;
pub mod parameter;
pub mod run;
pub mod solving;
pub mod specs;
pub mod splines;

pub use bootstrap::{BootstrapEngine, BootstrapOptions, ReplicateSet, Resampling};
pub use error::{BinomError, ErrorKind, Result};
pub use hierarchy::{HierarchicalFit, HierarchicalSolver};
pub use model::BinomialModel;
pub use options::{RunConfig, RunOptions};
pub use run::{BinomRun, FitResult};
pub use solving::{ConstrainedSolver, SolverMethod, SolverOptions};
