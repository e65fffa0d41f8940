use ndarray::{Axis, prelude::*};

use crate::{MlErr, Result, arch::activations::ActFn};

/// A fully connected layer.
///
/// Its parameters live in a single `(n + 1, m)` matrix: the first `n` rows are the weights and the
/// last one is the bias, so the layer computes `z = [x, 1] · params`. Curvature-aware optimizers
/// rely on this homogeneous layout to precondition weights and bias together.
#[derive(Debug, Clone)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<ActFn>,

    // Forward metadata
    x: Array2<f32>,
    z: Array2<f32>,
}

impl Dense {
    /// Creates a new `Dense` layer.
    ///
    /// # Arguments
    /// * `dim` - The amount of inputs and outputs of the layer.
    /// * `act_fn` - The activation applied to the outputs, `None` for a linear layer.
    pub fn new(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Self {
            dim,
            act_fn,
            x: Array2::zeros((0, dim.0)),
            z: Array2::zeros((0, dim.1)),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    /// Returns the shape of this layer's parameter matrix.
    pub fn param_dim(&self) -> (usize, usize) {
        (self.dim.0 + 1, self.dim.1)
    }

    /// The input seen by the last `forward` call.
    pub fn input(&self) -> ArrayView2<'_, f32> {
        self.x.view()
    }

    /// Computes the layer's output without caching anything.
    pub fn predict(&self, params: &Array2<f32>, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let z = self.linear(params, x)?;
        Ok(self.activate(z))
    }

    /// Computes the layer's output and keeps the metadata needed by `backward`.
    pub fn forward(&mut self, params: &Array2<f32>, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let z = self.linear(params, x)?;
        self.x = x.to_owned();
        self.z = z.clone();
        Ok(self.activate(z))
    }

    /// Turns the gradient with respect to the layer's output into the gradient with respect to
    /// its pre-activation, the signal curvature statistics are built from.
    pub fn delta(&self, d: ArrayView2<f32>) -> Result<Array2<f32>> {
        if d.dim() != self.z.dim() {
            return Err(MlErr::ShapeMismatch {
                what: "output gradient",
                got: d.dim(),
                expected: self.z.dim(),
            });
        }

        let mut delta = d.to_owned();

        if let Some(act_fn) = &self.act_fn {
            delta.zip_mut_with(&self.z, |d, &z| *d *= act_fn.df(z));
        }

        Ok(delta)
    }

    /// Accumulates this layer's gradient into `grad` and returns the gradient with respect to its
    /// input. The forward metadata is left untouched, so it may be called more than once per
    /// forward pass.
    pub fn backward(
        &self,
        params: &Array2<f32>,
        grad: &mut Array2<f32>,
        delta: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        self.check_params(params)?;
        let n = self.dim.0;

        {
            let (mut dw, mut db) = grad.view_mut().split_at(Axis(0), n);
            dw += &self.x.t().dot(&delta);
            let mut db = db.row_mut(0);
            db += &delta.sum_axis(Axis(0));
        }

        let w = params.slice(s![..n, ..]);
        Ok(delta.dot(&w.t()))
    }

    fn linear(&self, params: &Array2<f32>, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_params(params)?;

        if x.ncols() != self.dim.0 {
            return Err(MlErr::SizeMismatch {
                what: "layer inputs",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let n = self.dim.0;
        let w = params.slice(s![..n, ..]);
        let b = params.row(n);
        Ok(x.dot(&w) + &b)
    }

    fn activate(&self, mut z: Array2<f32>) -> Array2<f32> {
        if let Some(act_fn) = &self.act_fn {
            z.mapv_inplace(|z| act_fn.f(z));
        }

        z
    }

    fn check_params(&self, params: &Array2<f32>) -> Result<()> {
        if params.dim() != self.param_dim() {
            return Err(MlErr::ShapeMismatch {
                what: "dense parameters",
                got: params.dim(),
                expected: self.param_dim(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn forward_appends_bias_row() {
        let layer = Dense::new((2, 1), None);
        let params = array![[1.], [2.], [0.5]];
        let y = layer.predict(&params, array![[1., 1.], [0., 2.]].view()).unwrap();
        assert_eq!(y, array![[3.5], [4.5]]);
    }

    #[test]
    fn backward_accumulates_and_keeps_cache() {
        let mut layer = Dense::new((2, 1), None);
        let params = array![[1.], [2.], [0.5]];
        let mut grad = Array2::zeros((3, 1));
        layer.forward(&params, array![[1., 3.]].view()).unwrap();

        let delta = layer.delta(array![[1.]].view()).unwrap();
        let d_in = layer.backward(&params, &mut grad, delta.view()).unwrap();
        assert_eq!(d_in, array![[1., 2.]]);
        assert_eq!(grad, array![[1.], [3.], [1.]]);

        // A second pass over the same forward adds on top of the first one.
        layer.backward(&params, &mut grad, delta.view()).unwrap();
        assert_eq!(grad, array![[2.], [6.], [2.]]);
    }

    #[test]
    fn rejects_mismatched_params() {
        let layer = Dense::new((2, 2), Some(ActFn::relu()));
        let err = layer
            .predict(&Array2::zeros((2, 2)), array![[1., 1.]].view())
            .unwrap_err();
        assert!(matches!(err, MlErr::ShapeMismatch { .. }));
    }
}
