//! Column roles and validated outcome data used by the binomial likelihood.

use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{BinomError, Result};
use crate::frame::{Frame, GroupKey};

/// Shape of the outcome data.
///
/// Binomial data reads "k successes out of n trials"; Bernoulli data is
/// unit-record data where every row is a single trial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bernoulli,
    Binomial,
}

impl FromStr for DataType {
    type Err = BinomError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "bernoulli" => Ok(DataType::Bernoulli),
            "binomial" => Ok(DataType::Binomial),
            other => Err(BinomError::UnknownDataType {
                value: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bernoulli => f.write_str("bernoulli"),
            DataType::Binomial => f.write_str("binomial"),
        }
    }
}

/// Names the outcome, trial and group columns of an observation table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSpecs {
    col_success: String,
    col_total: String,
    col_group: Option<String>,
}

impl DataSpecs {
    /// Creates column roles for the success count and trial count.
    pub fn new(col_success: impl Into<String>, col_total: impl Into<String>) -> Self {
        Self {
            col_success: col_success.into(),
            col_total: col_total.into(),
            col_group: None,
        }
    }

    /// Declares the column that partitions rows into groups.
    pub fn with_group(mut self, col_group: impl Into<String>) -> Self {
        self.col_group = Some(col_group.into());
        self
    }

    /// Name of the success count column.
    pub fn col_success(&self) -> &str {
        &self.col_success
    }

    /// Name of the trial count column.
    pub fn col_total(&self) -> &str {
        &self.col_total
    }

    /// Name of the group column, if any.
    pub fn col_group(&self) -> Option<&str> {
        self.col_group.as_deref()
    }

    /// Extracts and validates outcomes from `frame` and pairs them with `design`.
    pub fn process(&self, frame: &Frame, design: DMatrix<f64>) -> Result<ProcessedData> {
        let n = frame.nrows();
        if design.nrows() != n {
            return Err(BinomError::dimension_mismatch(
                "design matrix rows",
                n,
                design.nrows(),
            ));
        }

        let obs = frame.numeric(&self.col_success)?;
        let total = frame.numeric(&self.col_total)?;
        validate_outcomes(&obs, &total)?;

        let groups = match &self.col_group {
            Some(column) => Some(frame.group_keys(column)?),
            None => None,
        };

        Ok(ProcessedData {
            obs: DVector::from_vec(obs),
            total: DVector::from_vec(total),
            groups,
            design,
        })
    }
}

/// Checks `0 <= success <= total` with finite values for every row.
pub fn validate_outcomes(obs: &[f64], total: &[f64]) -> Result<()> {
    if obs.len() != total.len() {
        return Err(BinomError::dimension_mismatch(
            "total length",
            obs.len(),
            total.len(),
        ));
    }
    for (index, (&success, &trials)) in obs.iter().zip(total.iter()).enumerate() {
        if !success.is_finite() || !trials.is_finite() {
            return Err(BinomError::NumericalError {
                context: "outcome validation",
            });
        }
        if success < 0.0 || success > trials {
            return Err(BinomError::InvalidObservation {
                index,
                success,
                total: trials,
            });
        }
    }
    Ok(())
}

/// Checks that binomial success and trial counts are whole numbers.
pub fn validate_counts(obs: &[f64], total: &[f64]) -> Result<()> {
    let columns = [("success", obs), ("total", total)];
    for (role, values) in columns {
        if let Some(index) = values.iter().position(|v| v.fract() != 0.0) {
            return Err(BinomError::NonIntegralCount {
                index,
                role,
                value: values[index],
            });
        }
    }
    Ok(())
}

/// Checks that every row of a Bernoulli data set is a single trial.
pub fn validate_bernoulli(total: &[f64]) -> Result<()> {
    match total.iter().position(|&t| t != 1.0) {
        Some(index) => Err(BinomError::NotBernoulli {
            index,
            total: total[index],
        }),
        None => Ok(()),
    }
}

/// Numeric view of an observation table, ready for likelihood evaluation.
#[derive(Clone, Debug)]
pub struct ProcessedData {
    obs: DVector<f64>,
    total: DVector<f64>,
    groups: Option<Vec<GroupKey>>,
    design: DMatrix<f64>,
}

impl ProcessedData {
    /// Number of observation rows.
    pub fn row_count(&self) -> usize {
        self.obs.len()
    }

    /// Success counts.
    pub fn obs(&self) -> &DVector<f64> {
        &self.obs
    }

    /// Trial counts.
    pub fn total(&self) -> &DVector<f64> {
        &self.total
    }

    /// Group identifier of every row, when a group column was declared.
    pub fn groups(&self) -> Option<&[GroupKey]> {
        self.groups.as_deref()
    }

    /// Fixed-effects design matrix (`n x p`).
    pub fn design(&self) -> &DMatrix<f64> {
        &self.design
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::new()
            .with_column("k", vec![3.0, 0.0, 5.0])
            .unwrap()
            .with_column("n", vec![10.0, 4.0, 5.0])
            .unwrap()
            .with_column("g", vec![2_i64, 1, 2])
            .unwrap()
    }

    #[test]
    fn processes_outcomes_and_groups() {
        let specs = DataSpecs::new("k", "n").with_group("g");
        let data = specs.process(&frame(), DMatrix::from_element(3, 1, 1.0)).unwrap();
        assert_eq!(data.row_count(), 3);
        assert_eq!(data.total()[1], 4.0);
        assert_eq!(data.groups().unwrap()[1], GroupKey::Integer(1));
    }

    #[test]
    fn rejects_success_above_total() {
        let frame = frame().with_column("k", vec![3.0, 5.0, 5.0]).unwrap();
        let result = DataSpecs::new("k", "n").process(&frame, DMatrix::zeros(3, 1));
        assert!(matches!(
            result,
            Err(BinomError::InvalidObservation { index: 1, .. })
        ));
    }

    #[test]
    fn data_type_parsing_is_strict() {
        assert_eq!("binomial".parse::<DataType>().unwrap(), DataType::Binomial);
        assert!(matches!(
            "poisson".parse::<DataType>(),
            Err(BinomError::UnknownDataType { .. })
        ));
        assert!(validate_bernoulli(&[1.0, 1.0]).is_ok());
        assert!(validate_bernoulli(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn binomial_counts_must_be_whole() {
        assert!(validate_counts(&[3.0, 0.0], &[10.0, 4.0]).is_ok());
        let err = validate_counts(&[2.0, 1.0], &[2.5, 4.0]).unwrap_err();
        assert!(matches!(
            err,
            BinomError::NonIntegralCount {
                index: 0,
                role: "total",
                ..
            }
        ));
        assert!(matches!(
            validate_counts(&[1.0, 0.5], &[4.0, 4.0]),
            Err(BinomError::NonIntegralCount { index: 1, role: "success", .. })
        ));
    }
}
