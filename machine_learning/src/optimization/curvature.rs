use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate};

use super::symmetric_eigen;
use crate::arch::CurvatureObserver;

/// The capability exposed by curvature-aware optimizers.
///
/// Every `stats_period` steps the optimizer must see one backward pass with `accumulating` set,
/// driven by labels sampled from the model itself, so that its curvature estimate follows the
/// true Fisher information.
pub trait CurvatureStats: CurvatureObserver {
    /// The amount of steps taken so far.
    fn steps(&self) -> usize;

    /// The amount of steps between statistics passes.
    fn stats_period(&self) -> usize;

    /// Toggles whether the next backward pass is recorded.
    fn set_accumulating(&mut self, accumulating: bool);

    fn as_observer(&mut self) -> &mut dyn CurvatureObserver;
}

/// Hyperparameters shared by the Kronecker-factored optimizers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvatureConfig {
    pub learning_rate: f32,
    pub momentum: f32,
    pub stat_decay: f32,
    pub damping: f32,
    pub kl_clip: f32,
    pub weight_decay: f32,
    /// Steps between statistics passes.
    pub t_cov: usize,
    /// Steps between eigenbasis scale refreshes, only used by E-KFAC.
    pub t_scal: usize,
    /// Steps between eigendecompositions of the factors.
    pub t_inv: usize,
}

impl Default for CurvatureConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            momentum: 0.9,
            stat_decay: 0.95,
            damping: 1e-3,
            kl_clip: 1e-2,
            weight_decay: 5e-5,
            t_cov: 10,
            t_scal: 10,
            t_inv: 100,
        }
    }
}

/// Running Kronecker factors of one layer and their eigendecompositions.
///
/// For a layer with parameters of shape `(n + 1, m)`, `aa` is the `(n + 1, n + 1)` second moment
/// of its homogeneous inputs and `gg` the `(m, m)` second moment of its output gradients.
#[derive(Debug, Clone)]
pub(super) struct KroneckerFactors {
    pub aa: Array2<f32>,
    pub gg: Array2<f32>,
    pub d_a: Array1<f32>,
    pub q_a: Array2<f32>,
    pub d_g: Array1<f32>,
    pub q_g: Array2<f32>,
    initialized: bool,
}

impl KroneckerFactors {
    pub fn new((rows, cols): (usize, usize)) -> Self {
        Self {
            aa: Array2::eye(rows),
            gg: Array2::eye(cols),
            d_a: Array1::ones(rows),
            q_a: Array2::eye(rows),
            d_g: Array1::ones(cols),
            q_g: Array2::eye(cols),
            initialized: false,
        }
    }

    /// Folds one batch of statistics into the running factors.
    pub fn accumulate(&mut self, input: ArrayView2<f32>, grad_output: ArrayView2<f32>, decay: f32) {
        let batch = input.nrows().max(1) as f32;
        let a = homogeneous(input);
        let aa = a.t().dot(&a) / batch;
        // The output gradient of a batch-mean loss carries a 1/batch factor, undo it.
        let gg = grad_output.t().dot(&grad_output) * batch;

        if !self.initialized {
            self.aa = Array2::eye(aa.nrows());
            self.gg = Array2::eye(gg.nrows());
            self.initialized = true;
        }

        running_average(&mut self.aa, &aa, decay);
        running_average(&mut self.gg, &gg, decay);
    }

    pub fn update_eigen(&mut self) {
        (self.d_a, self.q_a) = symmetric_eigen(self.aa.view());
        (self.d_g, self.q_g) = symmetric_eigen(self.gg.view());
    }

    /// Projects a gradient of shape `(n + 1, m)` into the factors' eigenbasis.
    pub fn to_eigenbasis(&self, grad: &Array2<f32>) -> Array2<f32> {
        self.q_a.t().dot(grad).dot(&self.q_g)
    }

    /// Projects back from the eigenbasis.
    pub fn from_eigenbasis(&self, v: &Array2<f32>) -> Array2<f32> {
        self.q_a.dot(v).dot(&self.q_g.t())
    }

    /// The Kronecker product of both spectra laid out like the parameters.
    pub fn eigen_outer(&self) -> Array2<f32> {
        outer(&self.d_a, &self.d_g)
    }
}

/// Appends a column of ones to the layer inputs, matching the bias row of the parameters.
pub(super) fn homogeneous(input: ArrayView2<f32>) -> Array2<f32> {
    let ones = Array2::ones((input.nrows(), 1));
    concatenate![Axis(1), input, ones]
}

/// `m <- decay * m + (1 - decay) * new`.
pub(super) fn running_average(m: &mut Array2<f32>, new: &Array2<f32>, decay: f32) {
    m.zip_mut_with(new, |m, &x| *m = decay * *m + (1. - decay) * x);
}

pub(super) fn outer(a: &Array1<f32>, b: &Array1<f32>) -> Array2<f32> {
    let a = a.view().insert_axis(Axis(1));
    let b = b.view().insert_axis(Axis(0));
    a.dot(&b)
}

/// Computes the trust region factor `min(1, sqrt(kl_clip / Σ v·g·lr²))` over every layer.
///
/// A non-positive quadratic term means the preconditioned step does not move along the gradient
/// at all and is left unscaled.
pub(super) fn kl_clip_factor<'a, I>(pairs: I, lr: f32, kl_clip: f32) -> f32
where
    I: IntoIterator<Item = (&'a Array2<f32>, &'a Array2<f32>)>,
{
    let vg_sum: f32 = pairs
        .into_iter()
        .map(|(v, g)| (v * g).sum() * lr * lr)
        .sum();

    if vg_sum > 0. {
        (kl_clip / vg_sum).sqrt().min(1.)
    } else {
        1.
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn factors_start_from_identity() {
        let mut factors = KroneckerFactors::new((3, 1));
        factors.accumulate(array![[1., 1.]].view(), array![[2.]].view(), 0.5);

        // aa = 0.5 * I + 0.5 * [1, 1, 1]ᵀ[1, 1, 1]
        assert_eq!(factors.aa, array![[1., 0.5, 0.5], [0.5, 1., 0.5], [0.5, 0.5, 1.]]);
        assert_eq!(factors.gg, array![[2.5]]);
    }

    #[test]
    fn identity_factors_leave_gradients_untouched() {
        let mut factors = KroneckerFactors::new((2, 2));
        factors.update_eigen();
        let grad = array![[1., 2.], [3., 4.]];
        let v = factors.from_eigenbasis(&factors.to_eigenbasis(&grad));

        for (x, y) in v.iter().zip(grad.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn kl_clip_shrinks_large_steps() {
        let v = array![[10.]];
        let g = array![[10.]];
        let nu = kl_clip_factor([(&v, &g)], 1., 1.);
        assert!((nu - 0.1).abs() < 1e-6);

        let small = array![[0.01]];
        assert_eq!(kl_clip_factor([(&small, &small)], 1., 1.), 1.);
    }
}
