use ndarray::Array2;

use super::CurvatureStats;
use crate::{MlErr, ParamSet, Result};

/// Defines the strategy for updating model parameters based on their accumulated gradients.
pub trait Optimizer {
    /// Computes the update of every parameter tensor for the current gradient without applying
    /// it. The optimizer's own state (step counters, momentum buffers, curvature estimates)
    /// advances exactly as if the update had been applied.
    ///
    /// # Arguments
    /// * `params` - The parameters and their accumulated gradients.
    ///
    /// # Returns
    /// One update per tensor, to be added to the parameters, or an error if `params` does not
    /// match the layout this optimizer was built for.
    fn updates(&mut self, params: &ParamSet) -> Result<Vec<Array2<f32>>>;

    /// Computes this step's updates and applies them.
    fn step(&mut self, params: &mut ParamSet) -> Result<()> {
        let updates = self.updates(params)?;
        params.apply(&updates)
    }

    /// Clears the gradients of every parameter this optimizer governs.
    fn zero_grad(&mut self, params: &mut ParamSet) {
        params.zero_grad();
    }

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);

    /// Returns the curvature statistics capability, only curvature-aware optimizers have one.
    fn curvature(&self) -> Option<&dyn CurvatureStats> {
        None
    }

    /// Mutable counterpart of `curvature`.
    fn curvature_mut(&mut self) -> Option<&mut dyn CurvatureStats> {
        None
    }
}

impl<T: Optimizer + ?Sized> Optimizer for Box<T> {
    fn updates(&mut self, params: &ParamSet) -> Result<Vec<Array2<f32>>> {
        (**self).updates(params)
    }

    fn step(&mut self, params: &mut ParamSet) -> Result<()> {
        (**self).step(params)
    }

    fn zero_grad(&mut self, params: &mut ParamSet) {
        (**self).zero_grad(params)
    }

    fn learning_rate(&self) -> f32 {
        (**self).learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f32) {
        (**self).set_learning_rate(lr)
    }

    fn curvature(&self) -> Option<&dyn CurvatureStats> {
        (**self).curvature()
    }

    fn curvature_mut(&mut self) -> Option<&mut dyn CurvatureStats> {
        (**self).curvature_mut()
    }
}

/// Checks that `params` has one tensor per expected shape.
pub(super) fn check_layout(params: &ParamSet, dims: &[(usize, usize)]) -> Result<()> {
    if params.len() != dims.len() {
        return Err(MlErr::SizeMismatch {
            what: "optimizer parameters",
            got: params.len(),
            expected: dims.len(),
        });
    }

    for (param, &dim) in params.iter().zip(dims) {
        if param.dim() != dim {
            return Err(MlErr::ShapeMismatch {
                what: "optimizer parameters",
                got: param.dim(),
                expected: dim,
            });
        }
    }

    Ok(())
}

/// Heavy-ball momentum: `v <- mu * v + d` and an update of `-lr * v`.
pub(super) fn momentum_update(
    velocity: &mut Array2<f32>,
    d: &Array2<f32>,
    momentum: f32,
    lr: f32,
) -> Array2<f32> {
    velocity.zip_mut_with(d, |v, &d| *v = momentum * *v + d);
    velocity.mapv(|v| -lr * v)
}
