use ndarray::Array2;

use super::{CurvatureStats, Optimizer};
use crate::{MlErr, ParamSet, Result};

/// Composes two optimizers over the same parameters: one decides how far each tensor moves and
/// the other in which direction.
///
/// Both sources compute their updates from the same gradients, advancing their own state as if
/// they were running alone. Each tensor then moves along the direction update, rescaled to the
/// norm of the magnitude update.
pub struct Graft {
    magnitude: Box<dyn Optimizer>,
    direction: Box<dyn Optimizer>,
}

impl Graft {
    /// Creates a new `Graft` optimizer.
    ///
    /// # Arguments
    /// * `magnitude` - The optimizer providing the norm of every update.
    /// * `direction` - The optimizer providing the direction of every update.
    ///
    /// # Returns
    /// A new `Graft` instance or an error if both sources are curvature-aware.
    pub fn new(magnitude: Box<dyn Optimizer>, direction: Box<dyn Optimizer>) -> Result<Self> {
        if magnitude.curvature().is_some() && direction.curvature().is_some() {
            return Err(MlErr::GraftBothCurvatureAware);
        }

        Ok(Self {
            magnitude,
            direction,
        })
    }
}

/// Rescales `direction` to the norm of `magnitude`, zero if the direction vanishes.
fn graft_tensor(magnitude: &Array2<f32>, mut direction: Array2<f32>) -> Array2<f32> {
    let norm = |u: &Array2<f32>| u.iter().map(|x| x * x).sum::<f32>().sqrt();
    let d_norm = norm(&direction);

    if d_norm == 0. {
        direction.fill(0.);
        return direction;
    }

    let scale = norm(magnitude) / d_norm;
    direction.mapv_inplace(|x| x * scale);
    direction
}

impl Optimizer for Graft {
    fn updates(&mut self, params: &ParamSet) -> Result<Vec<Array2<f32>>> {
        let magnitudes = self.magnitude.updates(params)?;
        let directions = self.direction.updates(params)?;

        if magnitudes.len() != directions.len() {
            return Err(MlErr::SizeMismatch {
                what: "graft updates",
                got: directions.len(),
                expected: magnitudes.len(),
            });
        }

        Ok(magnitudes
            .iter()
            .zip(directions)
            .map(|(m, d)| graft_tensor(m, d))
            .collect())
    }

    fn learning_rate(&self) -> f32 {
        self.magnitude.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.magnitude.set_learning_rate(lr);
        self.direction.set_learning_rate(lr);
    }

    fn curvature(&self) -> Option<&dyn CurvatureStats> {
        self.magnitude
            .curvature()
            .or_else(|| self.direction.curvature())
    }

    fn curvature_mut(&mut self) -> Option<&mut dyn CurvatureStats> {
        match self.magnitude.curvature_mut() {
            Some(stats) => Some(stats),
            None => self.direction.curvature_mut(),
        }
    }
}
