use ndarray::{Array2, ArrayView2, Zip};

use crate::{MlErr, Result};

/// A single trainable tensor together with its gradient buffer.
#[derive(Debug, Clone)]
pub struct Param {
    value: Array2<f32>,
    grad: Array2<f32>,
}

impl Param {
    /// Creates a new `Param` with a zeroed gradient.
    ///
    /// # Arguments
    /// * `value` - The initial value of the tensor.
    pub fn new(value: Array2<f32>) -> Self {
        let grad = Array2::zeros(value.raw_dim());
        Self { value, grad }
    }

    pub fn value(&self) -> &Array2<f32> {
        &self.value
    }

    pub fn grad(&self) -> &Array2<f32> {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> &mut Array2<f32> {
        &mut self.grad
    }

    pub fn dim(&self) -> (usize, usize) {
        self.value.dim()
    }

    /// Borrows the value and the gradient buffer at the same time.
    pub fn split_mut(&mut self) -> (&Array2<f32>, &mut Array2<f32>) {
        (&self.value, &mut self.grad)
    }
}

/// The parameters of a network, one tensor per layer that owns parameters.
///
/// Both the network and the optimizers work over the same `ParamSet`: the network accumulates
/// into the gradient buffers on each backward pass and the optimizers read them to produce
/// their updates.
#[derive(Debug, Clone, Default)]
pub struct ParamSet {
    params: Vec<Param>,
}

impl ParamSet {
    /// Creates a new `ParamSet`.
    ///
    /// # Arguments
    /// * `values` - The initial values of every tensor, in layer order.
    pub fn new<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Array2<f32>>,
    {
        Self {
            params: values.into_iter().map(Param::new).collect(),
        }
    }

    /// Returns the amount of tensors.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Param> {
        self.params.get(i)
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut Param> {
        self.params.get_mut(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    /// Sets every gradient buffer to zero.
    pub fn zero_grad(&mut self) {
        for param in &mut self.params {
            param.grad.fill(0.);
        }
    }

    /// Returns true if no gradient has been accumulated since the last `zero_grad`.
    pub fn grads_are_zero(&self) -> bool {
        self.params
            .iter()
            .all(|p| p.grad.iter().all(|&g| g == 0.))
    }

    /// Applies one update per tensor, that is, `p <- p + u`.
    ///
    /// # Arguments
    /// * `updates` - The updates, in the same order and with the same shapes as the tensors.
    ///
    /// # Returns
    /// An error if the amount of updates or any of their shapes do not match.
    pub fn apply(&mut self, updates: &[Array2<f32>]) -> Result<()> {
        self.check_layout(updates.iter().map(|u| u.dim()), "updates")?;

        for (param, update) in self.params.iter_mut().zip(updates) {
            Zip::from(&mut param.value)
                .and(update)
                .for_each(|p, &u| *p += u);
        }

        Ok(())
    }

    /// Returns a view of every tensor's value.
    pub fn values(&self) -> Vec<ArrayView2<'_, f32>> {
        self.params.iter().map(|p| p.value.view()).collect()
    }

    /// Overwrites every tensor's value, for instance when restoring a checkpoint.
    ///
    /// # Arguments
    /// * `values` - The new values, in layer order.
    ///
    /// # Returns
    /// An error if the amount of tensors or any of their shapes do not match.
    pub fn load_values(&mut self, values: Vec<Array2<f32>>) -> Result<()> {
        self.check_layout(values.iter().map(|v| v.dim()), "loaded values")?;

        for (param, value) in self.params.iter_mut().zip(values) {
            param.value = value;
        }

        Ok(())
    }

    fn check_layout<I>(&self, dims: I, what: &'static str) -> Result<()>
    where
        I: ExactSizeIterator<Item = (usize, usize)>,
    {
        if dims.len() != self.params.len() {
            return Err(MlErr::SizeMismatch {
                what,
                got: dims.len(),
                expected: self.params.len(),
            });
        }

        for (param, dim) in self.params.iter().zip(dims) {
            if param.dim() != dim {
                return Err(MlErr::ShapeMismatch {
                    what,
                    got: dim,
                    expected: param.dim(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn apply_adds_updates_in_place() {
        let mut params = ParamSet::new([array![[1., 2.], [3., 4.]]]);
        params.apply(&[array![[0.5, -1.], [0., 1.]]]).unwrap();
        assert_eq!(params.get(0).unwrap().value(), &array![[1.5, 1.], [3., 5.]]);
    }

    #[test]
    fn apply_rejects_wrong_shapes() {
        let mut params = ParamSet::new([Array2::zeros((2, 2))]);
        let err = params.apply(&[Array2::zeros((3, 2))]).unwrap_err();
        assert!(matches!(err, MlErr::ShapeMismatch { .. }));

        let err = params.apply(&[]).unwrap_err();
        assert!(matches!(err, MlErr::SizeMismatch { got: 0, expected: 1, .. }));
    }

    #[test]
    fn zero_grad_clears_every_buffer() {
        let mut params = ParamSet::new([Array2::zeros((2, 1)), Array2::zeros((1, 3))]);
        params.get_mut(1).unwrap().grad_mut().fill(2.);
        assert!(!params.grads_are_zero());

        params.zero_grad();
        assert!(params.grads_are_zero());
    }
}
