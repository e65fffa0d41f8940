use log::debug;
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use super::{
    CurvatureConfig, CurvatureStats, Optimizer,
    curvature::{KroneckerFactors, kl_clip_factor},
    optimizer::{check_layout, momentum_update},
};
use crate::{ParamSet, Result, arch::CurvatureObserver};

/// Kronecker-factored approximate curvature.
///
/// Preconditions every layer's gradient with the inverse of `A ⊗ G`, where `A` is the second
/// moment of the layer inputs and `G` the second moment of its pre-activation gradients, both
/// gathered on the statistics passes. The preconditioned step is scaled to keep the predicted
/// change of the output distribution within `kl_clip` and then fed through momentum SGD.
#[derive(Debug)]
pub struct Kfac {
    config: CurvatureConfig,
    dims: Vec<(usize, usize)>,
    factors: Vec<KroneckerFactors>,
    velocity: Vec<Array2<f32>>,
    steps: usize,
    accumulating: bool,
}

impl Kfac {
    /// Creates a new `Kfac` optimizer.
    ///
    /// # Arguments
    /// * `params` - The parameters this instance will update, one `(in + 1, out)` tensor per layer.
    /// * `config` - The hyperparameters.
    ///
    /// # Returns
    /// A new `Kfac` instance.
    pub fn new(params: &ParamSet, config: CurvatureConfig) -> Self {
        let dims: Vec<_> = params.iter().map(|p| p.dim()).collect();

        Self {
            config,
            factors: dims.iter().map(|&dim| KroneckerFactors::new(dim)).collect(),
            velocity: dims.iter().map(|&dim| Array2::zeros(dim)).collect(),
            dims,
            steps: 0,
            accumulating: false,
        }
    }

    pub fn config(&self) -> &CurvatureConfig {
        &self.config
    }

    fn natural_gradient(&self, layer: usize, grad: &Array2<f32>) -> Array2<f32> {
        let factors = &self.factors[layer];
        let damping = self.config.damping;
        let mut v = factors.to_eigenbasis(grad);
        v.zip_mut_with(&factors.eigen_outer(), |v, &d| *v /= d + damping);
        factors.from_eigenbasis(&v)
    }
}

impl Optimizer for Kfac {
    fn updates(&mut self, params: &ParamSet) -> Result<Vec<Array2<f32>>> {
        check_layout(params, &self.dims)?;

        if self.steps % self.config.t_inv.max(1) == 0 {
            debug!("refreshing curvature eigenbases at step {}", self.steps);
            self.factors.par_iter_mut().for_each(|f| f.update_eigen());
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

impl CurvatureObserver for Kfac {
    fn is_accumulating(&self) -> bool {
        self.accumulating
    }

    fn observe(&mut self, layer: usize, input: ArrayView2<f32>, grad_output: ArrayView2<f32>) {
        if let Some(factors) = self.factors.get_mut(layer) {
            factors.accumulate(input, grad_output, self.config.stat_decay);
        }
    }
}

impl CurvatureStats for Kfac {
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
            damping: 0.,
            kl_clip: 1e6,
            weight_decay: 0.,
            t_cov: 1,
            t_inv: 1,
            ..Default::default()
        }
    }

    #[test]
    fn without_statistics_it_behaves_like_sgd() {
        let mut params = ParamSet::new([array![[0., 0.], [0., 0.]]]);
        params.get_mut(0).unwrap().grad_mut().assign(&array![[1., -2.], [0.5, 3.]]);
        let mut kfac = Kfac::new(&params, config());

        let u = kfac.updates(&params).unwrap();
        for (x, y) in u[0].iter().zip([-1., 2., -0.5, -3.]) {
            assert!((x - y).abs() < 1e-5, "{x} != {y}");
        }
        assert_eq!(kfac.steps(), 1);
    }

    #[test]
    fn statistics_precondition_the_gradient() {
        let mut params = ParamSet::new([Array2::zeros((2, 1))]);
        params.get_mut(0).unwrap().grad_mut().assign(&array![[1.], [1.]]);
        let mut kfac = Kfac::new(
            &params,
            CurvatureConfig {
                stat_decay: 0.,
                damping: 1.,
                ..config()
            },
        );

        // A single example with input 3 gives A = [[9, 3], [3, 1]] and G = [[1]].
        kfac.set_accumulating(true);
        kfac.observe(0, array![[3.]].view(), array![[1.]].view());
        kfac.set_accumulating(false);

        // With G = 1 the step is (A + I)⁻¹ g = [[2, -3], [-3, 10]] / 11 · [1, 1].
        let u = kfac.updates(&params).unwrap();
        assert!((u[0][[0, 0]] - 1. / 11.).abs() < 1e-4);
        assert!((u[0][[1, 0]] + 7. / 11.).abs() < 1e-4);
    }

    #[test]
    fn kl_clip_bounds_the_step() {
        let mut params = ParamSet::new([array![[0.]]]);
        params.get_mut(0).unwrap().grad_mut().fill(10.);
        let mut kfac = Kfac::new(
            &params,
            CurvatureConfig {
                kl_clip: 1.,
                damping: 1.,
                ..config()
            },
        );

        // Identity factors with damping 1 halve the gradient, the clip then limits v·g to 1.
        let u = kfac.updates(&params).unwrap();
        let v = 5.;
        let nu = (1f32 / (v * 10.)).sqrt();
        assert!((u[0][[0, 0]] + nu * v).abs() < 1e-5);
    }

    #[test]
    fn weight_decay_waits_for_warmup() {
        let params = ParamSet::new([array![[1.]]]);
        let mut kfac = Kfac::new(
            &params,
            CurvatureConfig {
                weight_decay: 0.5,
                t_cov: 1,
                ..config()
            },
        );

        for _ in 0..20 {
            assert_eq!(kfac.updates(&params).unwrap()[0], array![[0.]]);
        }
        assert_eq!(kfac.updates(&params).unwrap()[0], array![[-0.5]]);
    }

    #[test]
    fn exposes_curvature_capability() {
        let params = ParamSet::new([Array2::zeros((2, 2))]);
        let mut kfac = Kfac::new(&params, config());
        assert!(kfac.curvature().is_some());
        let stats = kfac.curvature_mut().unwrap();
        stats.set_accumulating(true);
        assert!(stats.as_observer().is_accumulating());
        assert_eq!(stats.stats_period(), 1);
    }
}
