use thiserror::Error;

/// Unified error type for `binomrs` operations.
#[derive(Debug, Error)]
pub enum BinomError {
    /// Raised when provided arrays or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, often the model-implied value.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when a column named in the configuration is absent from a frame.
    #[error("column `{column}` is not present in the data")]
    MissingColumn { column: String },

    /// Raised when a column holds values of the wrong kind for its role.
    #[error("column `{column}` must hold {expected} values, found {found}")]
    ColumnType {
        column: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Raised when an outcome row violates `0 <= success <= total`.
    #[error("row {index} has success {success} outside [0, total = {total}]")]
    InvalidObservation {
        index: usize,
        success: f64,
        total: f64,
    },

    /// Raised when binomial data carries a fractional success or trial count.
    #[error("binomial {role} counts must be whole numbers, row {index} has {value}")]
    NonIntegralCount {
        index: usize,
        role: &'static str,
        value: f64,
    },

    /// Raised when a covariate column feeding the design holds NaN or infinities.
    #[error("covariate `{column}` has a non-finite value at row {index}")]
    NonFiniteCovariate { column: String, index: usize },

    /// Raised when Bernoulli data carries a trial count other than one.
    #[error("bernoulli data requires total == 1, row {index} has total {total}")]
    NotBernoulli { index: usize, total: f64 },

    /// Raised for an unrecognized data type string.
    #[error("data type must be one of 'bernoulli' or 'binomial', got `{value}`")]
    UnknownDataType { value: String },

    /// Raised for an unrecognized solver method string.
    #[error("unrecognized solver method `{value}`; expected one of 'lbfgs' or 'auglag'")]
    UnknownSolverMethod { value: String },

    /// Raised when a solver method cannot honour the linear constraints of the model.
    #[error("solver method `{method}` cannot enforce {rows} shape constraint rows")]
    UnsupportedConstraints { method: &'static str, rows: usize },

    /// Raised when a spline option key is not recognized.
    #[error("unknown option `{option}` for spline `{spline}`")]
    UnknownSplineOption { spline: String, option: String },

    /// Raised when a recognized spline option carries a value of the wrong type.
    #[error("invalid type of spline option `{option}` for spline `{spline}`: expected {expected}, got {found}")]
    InvalidSplineOption {
        spline: String,
        option: String,
        expected: &'static str,
        found: String,
    },

    /// Raised when more than one shape constraint is requested for one spline.
    #[error("spline `{spline}` requests conflicting shape constraints: {constraints}")]
    ConflictingShapeConstraints { spline: String, constraints: String },

    /// Raised when a spline cannot be built from its options and data.
    #[error("spline `{spline}` is invalid: {reason}")]
    InvalidSpline { spline: String, reason: String },

    /// Raised when a prior variance is non-positive, non-finite, or mis-sized.
    #[error("invalid prior specification: {reason}")]
    InvalidPrior { reason: String },

    /// Raised at prediction time for a group never seen during the hierarchical fit.
    #[error("could not find group identifier `{group}` in the hierarchical fit; available groups are [{available}]")]
    MissingGroup { group: String, available: String },

    /// Raised when binomial resampling meets a row without trials.
    #[error("cannot resample row {index}: success probability is undefined for total {total}")]
    DegenerateProbability { index: usize, total: f64 },

    /// Raised when the optimizer backend fails.
    #[error("solver failure: {message}")]
    SolverFailure { message: String },

    /// Raised when numerical routines produce NaN or infinities.
    #[error("encountered a non-finite value during {context}")]
    NumericalError { context: &'static str },

    /// Raised when a required component has not been provided or attached.
    #[error("{component} must be provided before this operation")]
    MissingComponent { component: &'static str },

    /// Raised when an operation needs a fit that has not happened yet.
    #[error("{context} requires a completed fit")]
    NotFitted { context: &'static str },

    /// Raised when an operation receives no rows to work with.
    #[error("{context} received no rows")]
    EmptyData { context: &'static str },
}

/// Coarse classification of [`BinomError`] values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid user configuration, detected at construction time.
    Configuration,
    /// Malformed or inconsistent data.
    Data,
    /// Prediction for a group that was not fit.
    MissingGroup,
    /// Resampling with an undefined success probability.
    DegenerateProbability,
    /// Failure inside the optimizer.
    Solver,
    /// Operation invoked in the wrong lifecycle state.
    State,
}

impl BinomError {
    /// Helper to format a [`DimensionMismatch`](BinomError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for bubbling up missing component errors.
    pub fn missing_component(component: &'static str) -> Self {
        Self::MissingComponent { component }
    }

    /// Helper for a [`MissingColumn`](BinomError::MissingColumn) error.
    pub fn missing_column(column: impl Into<String>) -> Self {
        Self::MissingColumn {
            column: column.into(),
        }
    }

    /// Helper for an [`InvalidSpline`](BinomError::InvalidSpline) error.
    pub fn invalid_spline(spline: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSpline {
            spline: spline.into(),
            reason: reason.into(),
        }
    }

    /// Wraps an optimizer backend error message.
    pub fn solver_failure(message: impl std::fmt::Display) -> Self {
        Self::SolverFailure {
            message: message.to_string(),
        }
    }

    /// Maps the error onto the coarse taxonomy used by callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownDataType { .. }
            | Self::UnknownSolverMethod { .. }
            | Self::UnsupportedConstraints { .. }
            | Self::UnknownSplineOption { .. }
            | Self::InvalidSplineOption { .. }
            | Self::ConflictingShapeConstraints { .. }
            | Self::InvalidSpline { .. }
            | Self::InvalidPrior { .. } => ErrorKind::Configuration,
            Self::DimensionMismatch { .. }
            | Self::MissingColumn { .. }
            | Self::ColumnType { .. }
            | Self::InvalidObservation { .. }
            | Self::NotBernoulli { .. }
            | Self::NonIntegralCount { .. }
            | Self::NonFiniteCovariate { .. }
            | Self::EmptyData { .. } => ErrorKind::Data,
            Self::MissingGroup { .. } => ErrorKind::MissingGroup,
            Self::DegenerateProbability { .. } => ErrorKind::DegenerateProbability,
            Self::SolverFailure { .. } | Self::NumericalError { .. } => ErrorKind::Solver,
            Self::MissingComponent { .. } | Self::NotFitted { .. } => ErrorKind::State,
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, BinomError>;
