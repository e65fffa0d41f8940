use ndarray::{Array2, ArrayView2};
use rand::Rng;

use crate::{ParamSet, Result};

/// Receives the per-layer signals curvature statistics are estimated from.
///
/// The network notifies its observer during a backward pass, but only while the observer
/// reports that it is accumulating. Outside those passes the observer sees nothing.
pub trait CurvatureObserver {
    /// Returns true if the next backward pass should be reported.
    fn is_accumulating(&self) -> bool;

    /// Reports one layer of the current backward pass.
    ///
    /// # Arguments
    /// * `layer` - The index of the parameter tensor the signals belong to.
    /// * `input` - The layer's input activations, one row per example.
    /// * `grad_output` - The gradient of the loss with respect to the layer's pre-activation.
    fn observe(&mut self, layer: usize, input: ArrayView2<f32>, grad_output: ArrayView2<f32>);
}

/// A differentiable network. It does not own its parameters, those live in a `ParamSet`.
pub trait Model {
    /// Creates a freshly initialized set of parameters for this network.
    fn init_params<R: Rng>(&self, rng: &mut R) -> Result<ParamSet>;

    /// Computes the network's output without keeping any backward metadata.
    fn predict(&self, params: &ParamSet, x: ArrayView2<f32>) -> Result<Array2<f32>>;

    /// Computes the network's output and keeps what `backward` needs.
    fn forward(&mut self, params: &ParamSet, x: ArrayView2<f32>) -> Result<Array2<f32>>;

    /// Propagates `d`, the gradient of the loss with respect to the last output, back through
    /// the network and **adds** the resulting gradient into `params`.
    ///
    /// The forward metadata is retained, so several backward passes may follow one forward.
    ///
    /// # Arguments
    /// * `params` - The parameters used on the last forward pass.
    /// * `d` - The gradient of the loss with respect to the output.
    /// * `observer` - Notified with every layer's signals while it is accumulating.
    fn backward(
        &mut self,
        params: &mut ParamSet,
        d: Array2<f32>,
        observer: Option<&mut dyn CurvatureObserver>,
    ) -> Result<()>;
}
