use ndarray::{Array2, Zip};

use super::{Optimizer, optimizer::check_layout};
use crate::{ParamSet, Result};

#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    epsilon: f32,
    weight_decay: f32,
    dims: Vec<(usize, usize)>,
    v: Vec<Array2<f32>>,
    s: Vec<Array2<f32>>,
}

impl Adam {
    /// Creates a new `Adam` optimizer with the usual `beta1 = 0.9`, `beta2 = 0.999` and
    /// `epsilon = 1e-8`.
    ///
    /// # Arguments
    /// * `params` - The parameters this instance will update, only their shapes are read.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `weight_decay` - The L2 penalty added to the gradient.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(params: &ParamSet, learning_rate: f32, weight_decay: f32) -> Self {
        Self::with_betas(params, learning_rate, weight_decay, 0.9, 0.999, 1e-8)
    }

    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `params` - The parameters this instance will update, only their shapes are read.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `weight_decay` - The L2 penalty added to the gradient.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn with_betas(
        params: &ParamSet,
        learning_rate: f32,
        weight_decay: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    ) -> Self {
        let dims: Vec<_> = params.iter().map(|p| p.dim()).collect();
        let zeros = || dims.iter().map(|&dim| Array2::zeros(dim)).collect();

        Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            epsilon,
            weight_decay,
            v: zeros(),
            s: zeros(),
            dims,
        }
    }
}

impl Optimizer for Adam {
    fn updates(&mut self, params: &ParamSet) -> Result<Vec<Array2<f32>>> {
        check_layout(params, &self.dims)?;

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            weight_decay: wd,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = lr * (bc2.sqrt() / bc1);

        let updates = params
            .iter()
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .map(|((param, v), s)| {
                let mut update = Array2::zeros(param.dim());

                Zip::from(&mut update)
                    .and(param.value())
                    .and(param.grad())
                    .and(v)
                    .and(s)
                    .for_each(|u, &p, &g, v, s| {
                        let g = g + wd * p;
                        *v = b1 * *v + (1. - b1) * g;
                        *s = b2 * *s + (1. - b2) * g.powi(2);
                        *u = -step_size * *v / (s.sqrt() + eps);
                    });

                update
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

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn first_step_has_learning_rate_length() {
        let mut params = ParamSet::new([array![[0., 0.]]]);
        params.get_mut(0).unwrap().grad_mut().assign(&array![[3., -0.5]]);

        let mut adam = Adam::new(&params, 0.1, 0.);
        let update = adam.updates(&params).unwrap().remove(0);

        assert!((update[[0, 0]] + 0.1).abs() < 1e-5);
        assert!((update[[0, 1]] - 0.1).abs() < 1e-5);
    }
}
