use std::{fmt, str::FromStr};

use crate::TrainErr;

/// The optimizers a graft composite can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraftPart {
    Sgd,
    Kfac,
}

impl GraftPart {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sgd => "sgd",
            Self::Kfac => "kfac",
        }
    }

    pub fn is_curvature_aware(self) -> bool {
        matches!(self, Self::Kfac)
    }
}

impl FromStr for GraftPart {
    type Err = TrainErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "kfac" => Ok(Self::Kfac),
            other => Err(TrainErr::UnsupportedOptimizer(format!(
                "graft constituent '{other}'"
            ))),
        }
    }
}

/// Every optimizer a training job can run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
    Kfac,
    Ekfac,
    Graft {
        magnitude: GraftPart,
        direction: GraftPart,
    },
}

impl OptimizerKind {
    /// Parses an optimizer name, `graft` also reads its two constituents.
    ///
    /// # Arguments
    /// * `name` - One of `sgd`, `adam`, `kfac`, `ekfac` or `graft`, case insensitive.
    /// * `graft_m` - The magnitude constituent, only read for `graft`.
    /// * `graft_d` - The direction constituent, only read for `graft`.
    ///
    /// # Returns
    /// The parsed kind or `UnsupportedOptimizer`, also for a graft whose constituents are both
    /// curvature-aware.
    pub fn parse(name: &str, graft_m: &str, graft_d: &str) -> Result<Self, TrainErr> {
        let kind = match name.to_lowercase().as_str() {
            "sgd" => Self::Sgd,
            "adam" => Self::Adam,
            "kfac" => Self::Kfac,
            "ekfac" => Self::Ekfac,
            "graft" => {
                let magnitude: GraftPart = graft_m.parse()?;
                let direction: GraftPart = graft_d.parse()?;

                if magnitude.is_curvature_aware() && direction.is_curvature_aware() {
                    return Err(TrainErr::UnsupportedOptimizer(format!(
                        "graft_{}_{}: at most one constituent may be curvature-aware",
                        magnitude.name(),
                        direction.name()
                    )));
                }

                Self::Graft {
                    magnitude,
                    direction,
                }
            }
            other => return Err(TrainErr::UnsupportedOptimizer(other.to_string())),
        };

        Ok(kind)
    }

    /// Returns true if training must run statistics passes for this optimizer.
    pub fn expects_curvature(&self) -> bool {
        match self {
            Self::Sgd | Self::Adam => false,
            Self::Kfac | Self::Ekfac => true,
            Self::Graft {
                magnitude,
                direction,
            } => magnitude.is_curvature_aware() || direction.is_curvature_aware(),
        }
    }

    /// The name used in logs, run directories and checkpoint files.
    pub fn tag(&self) -> String {
        match self {
            Self::Sgd => "sgd".to_string(),
            Self::Adam => "adam".to_string(),
            Self::Kfac => "kfac".to_string(),
            Self::Ekfac => "ekfac".to_string(),
            Self::Graft {
                magnitude,
                direction,
            } => format!("graft_{}_{}", magnitude.name(), direction.name()),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}
