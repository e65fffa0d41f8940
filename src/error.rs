use std::{fmt, io, path::PathBuf};

use machine_learning::MlErr;

/// The result type used across the training harness.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// All errors that can occur while setting up or running a training job.
#[derive(Debug)]
pub enum TrainErr {
    /// The optimizer name, or one of the graft constituents, is not known.
    UnsupportedOptimizer(String),
    UnknownDataset(String),
    UnknownNetwork(String),
    /// Invalid configuration, caught before training starts.
    InvalidConfig(String),
    /// The checkpoint to resume from is missing or cannot be read.
    CheckpointNotFound { path: PathBuf, reason: String },
    /// A curvature-aware optimizer was requested but the resolved one exposes no statistics.
    MissingCurvatureCapability(String),
    /// A dataset file exists but does not hold whole records.
    MalformedDataset { path: PathBuf, reason: String },
    Serialization(String),
    Io(io::Error),
    Ml(MlErr),
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedOptimizer(name) => write!(f, "unsupported optimizer: {name}"),
            Self::UnknownDataset(name) => write!(f, "unknown dataset: {name}"),
            Self::UnknownNetwork(name) => write!(f, "unknown network: {name}"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::CheckpointNotFound { path, reason } => {
                write!(f, "no checkpoint found at {}: {reason}", path.display())
            }
            Self::MissingCurvatureCapability(tag) => {
                write!(f, "optimizer {tag} should expose curvature statistics but does not")
            }
            Self::MalformedDataset { path, reason } => {
                write!(f, "malformed dataset file {}: {reason}", path.display())
            }
            Self::Serialization(msg) => write!(f, "serialization error: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Ml(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TrainErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Ml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<MlErr> for TrainErr {
    fn from(e: MlErr) -> Self {
        Self::Ml(e)
    }
}

impl From<serde_json::Error> for TrainErr {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<safetensors::SafeTensorError> for TrainErr {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Self::Serialization(e.to_string())
    }
}
