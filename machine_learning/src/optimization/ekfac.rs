use log::debug;
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use super::{
    CurvatureConfig, CurvatureStats, Optimizer,
    curvature::{KroneckerFactors, homogeneous, kl_clip_factor, running_average},
    optimizer::{check_layout, momentum_update},
};
use crate::{ParamSet, Result, arch::CurvatureObserver};

/// Per-example statistics of one layer kept for the next scale refresh.
#[derive(Debug, Clone)]
struct ScaleSample {
    /// Homogeneous inputs, `(batch, in + 1)`.
    a: Array2<f32>,
    /// Output gradients with the batch mean undone, `(batch, out)`.
    g: Array2<f32>,
}

/// Eigenvalue-corrected K-FAC.
///
/// Works like [`super::Kfac`] but, instead of trusting the product of the factors' spectra,
/// keeps a running estimate of the gradient's second moment in the Kronecker eigenbasis and
/// divides by it.
#[derive(Debug)]
pub struct Ekfac {
    config: CurvatureConfig,
    dims: Vec<(usize, usize)>,
    factors: Vec<KroneckerFactors>,
    scale: Vec<Array2<f32>>,
    samples: Vec<Option<ScaleSample>>,
    velocity: Vec<Array2<f32>>,
    steps: usize,
    accumulating: bool,
}

impl Ekfac {
    /// Creates a new `Ekfac` optimizer.
    ///
    /// # Arguments
    /// * `params` - The parameters this instance will update, one `(in + 1, out)` tensor per layer.
    /// * `config` - The hyperparameters, `t_scal` sets how often the eigenbasis scale is refreshed.
    ///
    /// # Returns
    /// A new `Ekfac` instance.
    pub fn new(params: &ParamSet, config: CurvatureConfig) -> Self {
        let dims: Vec<_> = params.iter().map(|p| p.dim()).collect();

        Self {
            config,
            factors: dims.iter().map(|&dim| KroneckerFactors::new(dim)).collect(),
            scale: dims.iter().map(|&dim| Array2::ones(dim)).collect(),
            samples: vec![None; dims.len()],
            velocity: dims.iter().map(|&dim| Array2::zeros(dim)).collect(),
            dims,
            steps: 0,
            accumulating: false,
        }
    }

    pub fn config(&self) -> &CurvatureConfig {
        &self.config
    }

    /// Folds the stored per-example gradients of `layer` into its eigenbasis scale.
    fn refresh_scale(&mut self, layer: usize) {
        let Some(ScaleSample { a, g }) = self.samples[layer].take() else {
            return;
        };

        let factors = &self.factors[layer];
        let batch = a.nrows().max(1) as f32;
        let a = a.dot(&factors.q_a).mapv(|x| x * x);
        let g = g.dot(&factors.q_g).mapv(|x| x * x);
        let fresh = a.t().dot(&g) / batch;

        running_average(&mut self.scale[layer], &fresh, self.config.stat_decay);
    }

    fn natural_gradient(&self, layer: usize, grad: &Array2<f32>) -> Array2<f32> {
        let factors = &self.factors[layer];
        let damping = self.config.damping;
        let mut v = factors.to_eigenbasis(grad);
        v.zip_mut_with(&self.scale[layer], |v, &s| *v /= s + damping);
        factors.from_eigenbasis(&v)
    }
}

impl Optimizer for Ekfac {
    fn updates(&mut self, params: &ParamSet) -> Result<Vec<Array2<f32>>> {
        check_layout(params, &self.dims)?;

        if self.steps % self.config.t_inv.max(1) == 0 {
            debug!("refreshing curvature eigenbases at step {}", self.steps);
            self.factors
                .par_iter_mut()
                .zip(self.scale.par_iter_mut())
                .for_each(|(f, s)| {
                    f.update_eigen();
                    *s = f.eigen_outer();
                });
        }

        if self.steps != 0 && self.steps % self.config.t_scal.max(1) == 0 {
            for layer in 0..self.dims.len() {
                self.refresh_scale(layer);
            }
        }

        let grads: Vec<_> = params.iter().map(|p| p.grad()).collect();
        let naturals: Vec<_> = grads
            .iter()
            .enumerate()
            .map(|(i, grad)| self.natural_gradient(i, grad))
            .collect();

        let lr = self.config.learning_rate;
        let nu = kl_clip_factor(naturals.iter().zip(grads.iter().copied()), lr, self.config.kl_clip);
        let wd = self.config.weight_decay;
        let decay_active = wd != 0. && self.steps >= 20 * self.config.t_cov;

        let updates = naturals
            .into_iter()
            .zip(params.iter())
            .zip(self.velocity.iter_mut())
            .map(|((mut d, param), velocity)| {
                d.mapv_inplace(|x| x * nu);
                if decay_active {
                    d.scaled_add(wd, param.value());
                }

                momentum_update(velocity, &d, self.config.momentum, lr)
            })
            .collect();

        self.steps += 1;
        Ok(updates)
    }

    fn learning_rate(&self) -> f32 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.config.learning_rate = lr;
    }

    fn curvature(&self) -> Option<&dyn CurvatureStats> {
        Some(self)
    }

    fn curvature_mut(&mut self) -> Option<&mut dyn CurvatureStats> {
        Some(self)
    }
}

impl CurvatureObserver for Ekfac {
    fn is_accumulating(&self) -> bool {
        self.accumulating
    }

    fn observe(&mut self, layer: usize, input: ArrayView2<f32>, grad_output: ArrayView2<f32>) {
        let Some(factors) = self.factors.get_mut(layer) else {
            return;
        };

        factors.accumulate(input, grad_output, self.config.stat_decay);

        if self.steps % self.config.t_scal.max(1) == 0 {
            let batch = grad_output.nrows() as f32;
            self.samples[layer] = Some(ScaleSample {
                a: homogeneous(input),
                g: grad_output.mapv(|x| x * batch),
            });
        }
    }
}

impl CurvatureStats for Ekfac {
    fn steps(&self) -> usize {
        self.steps
    }

    fn stats_period(&self) -> usize {
        self.config.t_cov
    }

    fn set_accumulating(&mut self, accumulating: bool) {
        self.accumulating = accumulating;
    }

    fn as_observer(&mut self) -> &mut dyn CurvatureObserver {
        self
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn config() -> CurvatureConfig {
        CurvatureConfig {
            learning_rate: 1.,
            momentum: 0.,
            stat_decay: 0.,
            damping: 1.,
            kl_clip: 1e6,
            weight_decay: 0.,
            t_cov: 1,
            t_scal: 1,
            t_inv: 100,
        }
    }

    fn params_with_grad(grad: Array2<f32>) -> ParamSet {
        let mut params = ParamSet::new([Array2::zeros(grad.raw_dim())]);
        params.get_mut(0).unwrap().grad_mut().assign(&grad);
        params
    }

    #[test]
    fn first_step_matches_kfac() {
        let params = params_with_grad(array![[1.], [1.]]);
        let mut ekfac = Ekfac::new(&params, config());
        let mut kfac = crate::optimization::Kfac::new(&params, config());

        for opt in [&mut ekfac as &mut dyn CurvatureStats, &mut kfac] {
            opt.set_accumulating(true);
            opt.observe(0, array![[3.]].view(), array![[1.]].view());
            opt.set_accumulating(false);
        }

        let a = ekfac.updates(&params).unwrap();
        let b = kfac.updates(&params).unwrap();
        for (x, y) in a[0].iter().zip(b[0].iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn scale_follows_observed_gradients() {
        let params = params_with_grad(array![[0.], [0.]]);
        let mut ekfac = Ekfac::new(&params, config());

        // Step 0 only computes the eigenbases of the identity factors.
        ekfac.updates(&params).unwrap();

        ekfac.set_accumulating(true);
        ekfac.observe(0, array![[2.], [0.]].view(), array![[0.5], [0.5]].view());
        ekfac.set_accumulating(false);
        ekfac.updates(&params).unwrap();

        // With identity eigenbases s = mean((a, 1)² ⊗ (g · batch)²) = [[(4 + 0) / 2], [1]].
        let scale = &ekfac.scale[0];
        assert!((scale[[0, 0]] - 2.).abs() < 1e-5);
        assert!((scale[[1, 0]] - 1.).abs() < 1e-5);
        assert!(ekfac.samples[0].is_none());
    }

    #[test]
    fn only_stashes_on_scale_steps() {
        let params = params_with_grad(array![[0.], [0.]]);
        let mut ekfac = Ekfac::new(&params, CurvatureConfig { t_scal: 2, ..config() });
        ekfac.updates(&params).unwrap();

        ekfac.set_accumulating(true);
        ekfac.observe(0, array![[1.]].view(), array![[1.]].view());
        assert!(ekfac.samples[0].is_none());
    }
}
