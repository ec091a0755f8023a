//! Resampling-based uncertainty for fitted coefficients and predictions.
//!
//! Every replicate rebuilds its design from the immutable source frame: it
//! draws a resampled frame with its own seeded RNG, configures a fresh
//! [`ConfiguredSpecs`](crate::specs::ConfiguredSpecs) snapshot, attaches it to
//! a fresh [`BinomialModel`] and hands that model to the caller's fit
//! callable. Replicates share nothing mutable, so they run in parallel.

use std::sync::Arc;

use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Binomial, Distribution};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::DataSpecs;
use crate::error::{BinomError, Result};
use crate::frame::{Column, Frame, GroupKey};
use crate::model::BinomialModel;
use crate::parameter::ParameterSet;
use crate::run::FitResult;
use crate::specs::DesignSpecs;

/// How a replicate's observation table is drawn from the source table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resampling {
    /// Redraw each row's successes from `Binomial(total, success / total)`.
    Binomial,
    /// Draw rows uniformly with replacement.
    Bernoulli,
    /// Draw rows with replacement independently within each group.
    StratifiedBernoulli { col_group: String },
}

impl Resampling {
    /// Draws one resampled table from `frame`.
    pub fn resample<R: Rng + ?Sized>(
        &self,
        frame: &Frame,
        data_specs: &DataSpecs,
        rng: &mut R,
    ) -> Result<Frame> {
        if frame.is_empty() {
            return Err(BinomError::EmptyData {
                context: "resampling",
            });
        }
        match self {
            Resampling::Binomial => resample_outcomes(frame, data_specs, rng),
            Resampling::Bernoulli => {
                let n = frame.nrows();
                let rows: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                Ok(frame.take(&rows))
            }
            Resampling::StratifiedBernoulli { col_group } => {
                let mut rows = Vec::with_capacity(frame.nrows());
                for members in frame.partition_by(col_group)?.values() {
                    rows.extend((0..members.len()).map(|_| members[rng.gen_range(0..members.len())]));
                }
                Ok(frame.take(&rows))
            }
        }
    }
}

fn resample_outcomes<R: Rng + ?Sized>(frame: &Frame, data_specs: &DataSpecs, rng: &mut R) -> Result<Frame> {
    let success = frame.numeric(data_specs.col_success())?;
    let total = frame.numeric(data_specs.col_total())?;

    let mut draws = Vec::with_capacity(success.len());
    for (index, (&s, &t)) in success.iter().zip(total.iter()).enumerate() {
        if !(t > 0.0) {
            return Err(BinomError::DegenerateProbability { index, total: t });
        }
        if t.fract() != 0.0 {
            return Err(BinomError::NonIntegralCount {
                index,
                role: "total",
                value: t,
            });
        }
        let p = (s / t).clamp(0.0, 1.0);
        let distribution = Binomial::new(t as u64, p).map_err(|_| BinomError::InvalidObservation {
            index,
            success: s,
            total: t,
        })?;
        draws.push(distribution.sample(rng));
    }

    let column = match frame.column(data_specs.col_success())? {
        Column::Integer(_) => Column::Integer(draws.into_iter().map(|k| k as i64).collect()),
        _ => Column::Float(draws.into_iter().map(|k| k as f64).collect()),
    };
    let mut resampled = frame.clone();
    resampled.insert_column(data_specs.col_success(), column)?;
    Ok(resampled)
}

/// Seed and scheduling of a bootstrap run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapOptions {
    /// Base seed; replicate `b` uses `seed + b` (wrapping).
    pub seed: u64,
    /// Run replicates on the rayon thread pool.
    pub parallel: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            parallel: true,
        }
    }
}

impl BootstrapOptions {
    /// Set the base seed of replicate RNGs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Enable or disable running replicates on the rayon pool.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// One resample-and-refit cycle.
#[derive(Clone, Debug)]
pub struct Replicate {
    parameter_set: Arc<ParameterSet>,
    fit: FitResult,
}

impl Replicate {
    /// Parameter set (knot placement) the replicate was fit with.
    pub fn parameter_set(&self) -> &Arc<ParameterSet> {
        &self.parameter_set
    }

    /// Coefficients fitted on the resampled table.
    pub fn fit(&self) -> &FitResult {
        &self.fit
    }

    /// Probabilities for `frame` under this replicate's coefficients and basis.
    pub fn predict(&self, frame: &Frame, col_group: Option<&str>) -> Result<DVector<f64>> {
        self.fit.predict(&self.parameter_set, col_group, frame)
    }
}

/// Drives bootstrap replicates over an immutable source frame.
#[derive(Clone, Debug)]
pub struct BootstrapEngine {
    source: Arc<Frame>,
    specs: DesignSpecs,
    resampling: Resampling,
    options: BootstrapOptions,
}

impl BootstrapEngine {
    /// Checks the source frame and resampling policy against the design.
    pub fn new(
        source: impl Into<Arc<Frame>>,
        specs: DesignSpecs,
        resampling: Resampling,
        options: BootstrapOptions,
    ) -> Result<Self> {
        let source = source.into();
        if source.is_empty() {
            return Err(BinomError::EmptyData {
                context: "bootstrap source",
            });
        }
        if let Resampling::StratifiedBernoulli { col_group } = &resampling {
            source.column(col_group)?;
        }
        Ok(Self {
            source,
            specs,
            resampling,
            options,
        })
    }

    /// Policy used to draw replicate tables.
    pub fn resampling(&self) -> &Resampling {
        &self.resampling
    }

    /// Seed and scheduling options.
    pub fn options(&self) -> &BootstrapOptions {
        &self.options
    }

    /// Runs replicate `index` with its deterministic RNG stream.
    pub fn replicate<F>(&self, index: usize, fit: &F) -> Result<Replicate>
    where
        F: Fn(&BinomialModel) -> Result<FitResult>,
    {
        let mut rng = SmallRng::seed_from_u64(self.options.seed.wrapping_add(index as u64));
        let frame = self
            .resampling
            .resample(&self.source, self.specs.data_specs(), &mut rng)?;
        let configured = Arc::new(self.specs.configure_data(frame)?);

        let mut model = BinomialModel::new();
        model.attach_specs(configured.clone());
        let result = fit(&model)?;
        debug!("bootstrap replicate {index} finished");

        Ok(Replicate {
            parameter_set: configured.parameter_set().clone(),
            fit: result,
        })
    }

    /// Runs `n_bootstraps` replicates, ordered by replicate index.
    ///
    /// Any failing replicate aborts the run; the lowest-index failure is returned.
    pub fn run<F>(&self, n_bootstraps: usize, fit: F) -> Result<ReplicateSet>
    where
        F: Fn(&BinomialModel) -> Result<FitResult> + Sync,
    {
        info!(
            "running {n_bootstraps} bootstrap replicates ({:?} resampling, seed {})",
            self.resampling, self.options.seed
        );
        let outcomes: Vec<Result<Replicate>> = if self.options.parallel {
            (0..n_bootstraps)
                .into_par_iter()
                .map(|index| self.replicate(index, &fit))
                .collect()
        } else {
            (0..n_bootstraps)
                .map(|index| self.replicate(index, &fit))
                .collect()
        };
        let replicates = outcomes.into_iter().collect::<Result<Vec<_>>>()?;

        Ok(ReplicateSet {
            replicates,
            col_group: self.specs.data_specs().col_group().map(str::to_owned),
        })
    }
}

/// Ordered replicates of one bootstrap run.
#[derive(Clone, Debug)]
pub struct ReplicateSet {
    replicates: Vec<Replicate>,
    col_group: Option<String>,
}

impl ReplicateSet {
    /// Number of stored replicates.
    pub fn len(&self) -> usize {
        self.replicates.len()
    }

    /// Whether no replicates were stored.
    pub fn is_empty(&self) -> bool {
        self.replicates.is_empty()
    }

    /// Replicates in index order.
    pub fn replicates(&self) -> &[Replicate] {
        &self.replicates
    }

    /// Iterates over replicates in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Replicate> {
        self.replicates.iter()
    }

    /// Population coefficients, one replicate per row.
    pub fn parameter_matrix(&self) -> Result<DMatrix<f64>> {
        self.stack("replicate coefficient vector", |replicate| {
            Ok(replicate.fit.population().clone())
        })
    }

    /// Coefficients of `group`, one replicate per row.
    pub fn group_parameter_matrix(&self, group: &GroupKey) -> Result<DMatrix<f64>> {
        self.stack("replicate group coefficient vector", |replicate| {
            let fit = replicate.fit.hierarchical().ok_or(BinomError::NotFitted {
                context: "group parameter summary",
            })?;
            fit.group(group)
                .cloned()
                .ok_or_else(|| BinomError::MissingGroup {
                    group: group.to_string(),
                    available: fit
                        .groups
                        .keys()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                })
        })
    }

    /// Predicted probabilities for `frame`, shaped replicates x rows.
    pub fn predict_draws(&self, frame: &Frame) -> Result<DMatrix<f64>> {
        let col_group = self.col_group.as_deref();
        self.stack("replicate prediction", |replicate| {
            replicate.predict(frame, col_group)
        })
    }

    fn stack<F>(&self, context: &'static str, row: F) -> Result<DMatrix<f64>>
    where
        F: Fn(&Replicate) -> Result<DVector<f64>>,
    {
        let rows = self.replicates.iter().map(row).collect::<Result<Vec<_>>>()?;
        let width = rows.first().map_or(0, |r| r.len());
        let mut matrix = DMatrix::zeros(rows.len(), width);
        for (i, values) in rows.iter().enumerate() {
            if values.len() != width {
                return Err(BinomError::dimension_mismatch(context, width, values.len()));
            }
            matrix.row_mut(i).tr_copy_from(values);
        }
        Ok(matrix)
    }
}

/// Linear-interpolation quantile of pre-sorted data; `NaN` when empty.
pub fn quantile_linear_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => return f64::NAN,
        1 => return sorted[0],
        _ => {}
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let t = pos - lo as f64;
    (1.0 - t) * sorted[lo] + t * sorted[hi]
}

/// Linear-interpolation quantile of unsorted data.
pub fn quantile_linear(data: &[f64], q: f64) -> f64 {
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    quantile_linear_sorted(&sorted, q)
}

/// Equal-tailed percentile interval at confidence `level`.
pub fn percentile_interval(samples: &[f64], level: f64) -> Result<(f64, f64)> {
    if samples.len() < 2 {
        return Err(BinomError::EmptyData {
            context: "percentile interval",
        });
    }
    if !(level.is_finite() && level > 0.0 && level < 1.0) {
        return Err(BinomError::NumericalError {
            context: "percentile interval level",
        });
    }
    let alpha = (1.0 - level) / 2.0;
    Ok((quantile_linear(samples, alpha), quantile_linear(samples, 1.0 - alpha)))
}

/// Per-column quantile of a draws matrix (replicates x rows).
pub fn column_quantiles(draws: &DMatrix<f64>, q: f64) -> DVector<f64> {
    DVector::from_iterator(
        draws.ncols(),
        draws
            .column_iter()
            .map(|column| quantile_linear(&column.iter().copied().collect::<Vec<_>>(), q)),
    )
}
