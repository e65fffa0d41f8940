use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        what: &'static str,
        got: (usize, usize),
        expected: (usize, usize),
    },
    InvalidInput(&'static str),
    NonFiniteProbabilities {
        row: usize,
    },
    GraftBothCurvatureAware,
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => format!("There's a size mismatch in {what}, got {got} and expected {expected}"),
            MlErr::ShapeMismatch {
                what,
                got,
                expected,
            } => format!("There's a shape mismatch in {what}, got {got:?} and expected {expected:?}"),
            MlErr::InvalidInput(msg) => format!("Invalid input: {msg}"),
            MlErr::NonFiniteProbabilities { row } => {
                format!("Cannot sample a label for row {row}, its probabilities are not finite")
            }
            MlErr::GraftBothCurvatureAware => {
                "Both graft constituents are curvature-aware, at most one of them can be".to_string()
            }
        };

        write!(f, "{s}")
    }
}

impl Error for MlErr {}
