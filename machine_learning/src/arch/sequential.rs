use ndarray::{Array2, ArrayView2, s};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::{CurvatureObserver, Model, activations::ActFn, layers::Dense};
use crate::{MlErr, ParamSet, Result};

/// A sequential model: information flows forward when computing an output and backward when
/// computing the *deltas* of its layers.
#[derive(Debug, Clone)]
pub struct Sequential {
    layers: Vec<Dense>,
}

impl Sequential {
    /// Creates a new `Sequential`.
    ///
    /// # Arguments
    /// * `layers` - The layers the sequential is composed of.
    ///
    /// # Returns
    /// A new `Sequential` instance.
    pub fn new<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = Dense>,
    {
        Self {
            layers: layers.into_iter().collect(),
        }
    }

    /// Creates a multilayer perceptron with `depth` hidden layers of `width` units each, ReLU
    /// activations in between and a linear head producing one logit per class.
    ///
    /// # Arguments
    /// * `inputs` - The amount of input features.
    /// * `width` - The amount of units of each hidden layer.
    /// * `depth` - The amount of hidden layers, zero yields a single linear layer.
    /// * `classes` - The amount of outputs.
    pub fn mlp(inputs: usize, width: usize, depth: usize, classes: usize) -> Self {
        let mut layers = Vec::with_capacity(depth + 1);
        let mut fan_in = inputs;

        for _ in 0..depth {
            layers.push(Dense::new((fan_in, width), Some(ActFn::relu())));
            fan_in = width;
        }

        layers.push(Dense::new((fan_in, classes), None));
        Self::new(layers)
    }

    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    fn check_params(&self, params: &ParamSet) -> Result<()> {
        if params.len() != self.layers.len() {
            return Err(MlErr::SizeMismatch {
                what: "layers",
                got: params.len(),
                expected: self.layers.len(),
            });
        }

        Ok(())
    }
}

impl Model for Sequential {
    fn init_params<R: Rng>(&self, rng: &mut R) -> Result<ParamSet> {
        let mut values = Vec::with_capacity(self.layers.len());

        for layer in &self.layers {
            let (n, m) = layer.dim();
            let std_dev = (2. / n as f32).sqrt();
            let normal = Normal::new(0., std_dev)
                .map_err(|_| MlErr::InvalidInput("layer has no inputs"))?;

            // Kaiming initialized weights followed by a zeroed bias row.
            let mut value = Array2::zeros((n + 1, m));
            value
                .slice_mut(s![..n, ..])
                .mapv_inplace(|_| normal.sample(rng));
            values.push(value);
        }

        Ok(ParamSet::new(values))
    }

    fn predict(&self, params: &ParamSet, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_params(params)?;
        let mut x = x.to_owned();

        for (layer, param) in self.layers.iter().zip(params.iter()) {
            x = layer.predict(param.value(), x.view())?;
        }

        Ok(x)
    }

    fn forward(&mut self, params: &ParamSet, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_params(params)?;
        let mut x = x.to_owned();

        for (layer, param) in self.layers.iter_mut().zip(params.iter()) {
            x = layer.forward(param.value(), x.view())?;
        }

        Ok(x)
    }

    fn backward(
        &mut self,
        params: &mut ParamSet,
        mut d: Array2<f32>,
        mut observer: Option<&mut dyn CurvatureObserver>,
    ) -> Result<()> {
        self.check_params(params)?;

        for (i, layer) in self.layers.iter().enumerate().rev() {
            let delta = layer.delta(d.view())?;

            if let Some(obs) = observer.as_deref_mut() {
                if obs.is_accumulating() {
                    obs.observe(i, layer.input(), delta.view());
                }
            }

            let (value, grad) = params
                .get_mut(i)
                .ok_or(MlErr::InvalidInput("missing layer parameters"))?
                .split_mut();

            d = layer.backward(value, grad, delta.view())?;
        }

        Ok(())
    }
}
