use ndarray::Array2;

use super::{
    Optimizer,
    optimizer::{check_layout, momentum_update},
};
use crate::{ParamSet, Result};

/// Stochastic gradient descent with heavy-ball momentum and L2 weight decay.
#[derive(Debug)]
pub struct GradientDescent {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    dims: Vec<(usize, usize)>,
    velocity: Vec<Array2<f32>>,
}

impl GradientDescent {
    /// Creates a new `GradientDescent` optimizer.
    ///
    /// # Arguments
    /// * `params` - The parameters this instance will update, only their shapes are read.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - How much of the previous velocity is kept on each step, zero disables it.
    /// * `weight_decay` - The L2 penalty added to the gradient.
    ///
    /// # Returns
    /// A new `GradientDescent` instance.
    pub fn new(params: &ParamSet, learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        let dims: Vec<_> = params.iter().map(|p| p.dim()).collect();
        let velocity = dims.iter().map(|&dim| Array2::zeros(dim)).collect();

        Self {
            learning_rate,
            momentum,
            weight_decay,
            dims,
            velocity,
        }
    }
}

impl Optimizer for GradientDescent {
    fn updates(&mut self, params: &ParamSet) -> Result<Vec<Array2<f32>>> {
        check_layout(params, &self.dims)?;

        let Self {
            learning_rate: lr,
            momentum: mu,
            weight_decay: wd,
            ..
        } = *self;

        let updates = params
            .iter()
            .zip(self.velocity.iter_mut())
            .map(|(param, velocity)| {
                let mut d = param.grad().clone();
                if wd != 0. {
                    d.scaled_add(wd, param.value());
                }

                momentum_update(velocity, &d, mu, lr)
            })
            .collect();

        Ok(updates)
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}
