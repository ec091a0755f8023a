//! Column-oriented observation table consumed by the design builders.
//!
//! A [`Frame`] is deliberately small: named columns of equal length, numeric
//! access, row gathering and group partitioning. That is everything the
//! design, hierarchy and bootstrap layers need from a data table.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BinomError, Result};

/// A single named column of a [`Frame`].
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    Float(Vec<f64>),
    Integer(Vec<i64>),
    Label(Vec<String>),
}

impl Column {
    /// Number of rows held by the column.
    pub fn len(&self) -> usize {
        match self {
            Column::Float(values) => values.len(),
            Column::Integer(values) => values.len(),
            Column::Label(values) => values.len(),
        }
    }

    /// Whether the column holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short name of the stored value kind, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Column::Float(_) => "float",
            Column::Integer(_) => "integer",
            Column::Label(_) => "label",
        }
    }

    fn take(&self, indices: &[usize]) -> Column {
        match self {
            Column::Float(values) => Column::Float(indices.iter().map(|&i| values[i]).collect()),
            Column::Integer(values) => {
                Column::Integer(indices.iter().map(|&i| values[i]).collect())
            }
            Column::Label(values) => {
                Column::Label(indices.iter().map(|&i| values[i].clone()).collect())
            }
        }
    }
}

impl From<Vec<f64>> for Column {
    fn from(values: Vec<f64>) -> Self {
        Column::Float(values)
    }
}

impl From<Vec<i64>> for Column {
    fn from(values: Vec<i64>) -> Self {
        Column::Integer(values)
    }
}

impl From<Vec<String>> for Column {
    fn from(values: Vec<String>) -> Self {
        Column::Label(values)
    }
}

impl From<Vec<&str>> for Column {
    fn from(values: Vec<&str>) -> Self {
        Column::Label(values.into_iter().map(str::to_owned).collect())
    }
}

/// Identifier of a group partition.
///
/// Integer keys order numerically and label keys lexicographically, which
/// fixes the order in which hierarchical group fits run.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupKey {
    Integer(i64),
    Label(String),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Integer(value) => write!(f, "{value}"),
            GroupKey::Label(value) => f.write_str(value),
        }
    }
}

impl From<i64> for GroupKey {
    fn from(value: i64) -> Self {
        GroupKey::Integer(value)
    }
}

impl From<&str> for GroupKey {
    fn from(value: &str) -> Self {
        GroupKey::Label(value.to_owned())
    }
}

/// Named columns of equal length.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Frame {
    columns: BTreeMap<String, Column>,
    nrows: usize,
}

impl Frame {
    /// Creates an empty frame without rows or columns.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style variant of [`insert_column`](Self::insert_column).
    pub fn with_column(mut self, name: impl Into<String>, column: impl Into<Column>) -> Result<Self> {
        self.insert_column(name, column)?;
        Ok(self)
    }

    /// Inserts or replaces a column. The first column fixes the row count.
    pub fn insert_column(&mut self, name: impl Into<String>, column: impl Into<Column>) -> Result<()> {
        let name = name.into();
        let column = column.into();
        let replaces_only_column = self.columns.len() == 1 && self.columns.contains_key(&name);
        if self.columns.is_empty() || replaces_only_column {
            self.nrows = column.len();
        } else if column.len() != self.nrows {
            return Err(BinomError::dimension_mismatch(
                "frame column length",
                self.nrows,
                column.len(),
            ));
        }
        self.columns.insert(name, column);
        Ok(())
    }

    /// Number of rows shared by every column.
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Whether the frame holds no rows.
    pub fn is_empty(&self) -> bool {
        self.nrows == 0
    }

    /// Whether a column named `name` exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Iterates over the column names in lexicographic order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Result<&Column> {
        self.columns
            .get(name)
            .ok_or_else(|| BinomError::missing_column(name))
    }

    /// Returns a column as floating point values. Integer columns are widened.
    pub fn numeric(&self, name: &str) -> Result<Vec<f64>> {
        match self.column(name)? {
            Column::Float(values) => Ok(values.clone()),
            Column::Integer(values) => Ok(values.iter().map(|&v| v as f64).collect()),
            other => Err(BinomError::ColumnType {
                column: name.to_owned(),
                expected: "numeric",
                found: other.type_name(),
            }),
        }
    }

    /// Interprets a column as group identifiers.
    ///
    /// Float columns are accepted when every value is integral.
    pub fn group_keys(&self, name: &str) -> Result<Vec<GroupKey>> {
        match self.column(name)? {
            Column::Integer(values) => Ok(values.iter().map(|&v| GroupKey::Integer(v)).collect()),
            Column::Label(values) => Ok(values.iter().cloned().map(GroupKey::Label).collect()),
            Column::Float(values) => values
                .iter()
                .map(|&v| {
                    if v.is_finite() && v.fract() == 0.0 {
                        Ok(GroupKey::Integer(v as i64))
                    } else {
                        Err(BinomError::ColumnType {
                            column: name.to_owned(),
                            expected: "integral or label",
                            found: "fractional float",
                        })
                    }
                })
                .collect(),
        }
    }

    /// Partitions row indices by the values of a group column.
    pub fn partition_by(&self, name: &str) -> Result<BTreeMap<GroupKey, Vec<usize>>> {
        let mut partitions: BTreeMap<GroupKey, Vec<usize>> = BTreeMap::new();
        for (index, key) in self.group_keys(name)?.into_iter().enumerate() {
            partitions.entry(key).or_default().push(index);
        }
        Ok(partitions)
    }

    /// Gathers rows by index. Indices may repeat, which is how resampling
    /// with replacement is expressed.
    pub fn take(&self, indices: &[usize]) -> Frame {
        let columns = self
            .columns
            .iter()
            .map(|(name, column)| (name.clone(), column.take(indices)))
            .collect();
        Frame {
            columns,
            nrows: indices.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame::new()
            .with_column("y", vec![1.0, 0.0, 1.0, 1.0])
            .unwrap()
            .with_column("g", vec!["b", "a", "b", "c"])
            .unwrap()
    }

    #[test]
    fn rejects_columns_of_different_length() {
        let result = sample().with_column("x", vec![1.0, 2.0]);
        assert!(matches!(result, Err(BinomError::DimensionMismatch { .. })));
    }

    #[test]
    fn partitions_follow_natural_order() {
        let frame = sample();
        let parts = frame.partition_by("g").unwrap();
        let keys: Vec<String> = parts.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(parts[&GroupKey::from("b")], vec![0, 2]);
    }

    #[test]
    fn integral_floats_become_integer_keys() {
        let frame = Frame::new()
            .with_column("g", vec![10.0, 2.0, 2.0])
            .unwrap();
        let parts = frame.partition_by("g").unwrap();
        let keys: Vec<&GroupKey> = parts.keys().collect();
        assert_eq!(keys, vec![&GroupKey::Integer(2), &GroupKey::Integer(10)]);

        let bad = Frame::new().with_column("g", vec![0.5]).unwrap();
        assert!(bad.group_keys("g").is_err());
    }

    #[test]
    fn take_repeats_rows() {
        let frame = sample().take(&[3, 3, 0]);
        assert_eq!(frame.nrows(), 3);
        assert_eq!(frame.numeric("y").unwrap(), vec![1.0, 1.0, 1.0]);
        assert!(matches!(
            frame.numeric("g"),
            Err(BinomError::ColumnType { .. })
        ));
    }
}
