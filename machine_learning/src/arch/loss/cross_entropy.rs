use ndarray::{Array2, ArrayView2, Axis};

use super::LossFn;
use crate::{MlErr, Result};

/// Softmax cross-entropy loss over logits, averaged over the batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropy;

impl CrossEntropy {
    /// Returns a new `CrossEntropy`.
    pub fn new() -> Self {
        Self
    }

    /// Computes the row-wise softmax of `logits`.
    pub fn probabilities(&self, logits: ArrayView2<f32>) -> Array2<f32> {
        let mut probs = logits.to_owned();

        for mut row in probs.axis_iter_mut(Axis(0)) {
            let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
            row.mapv_inplace(|x| (x - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|x| x / sum);
        }

        probs
    }

    fn check(&self, y_pred: ArrayView2<f32>, y: &[usize]) -> Result<()> {
        if y_pred.nrows() != y.len() {
            return Err(MlErr::SizeMismatch {
                what: "labels",
                got: y.len(),
                expected: y_pred.nrows(),
            });
        }

        if y.iter().any(|&label| label >= y_pred.ncols()) {
            return Err(MlErr::InvalidInput("label out of range for the logits"));
        }

        Ok(())
    }
}

impl LossFn for CrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: &[usize]) -> Result<f32> {
        self.check(y_pred, y)?;

        if y.is_empty() {
            return Ok(0.);
        }

        let total: f32 = y_pred
            .axis_iter(Axis(0))
            .zip(y)
            .map(|(row, &label)| {
                let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
                let lse = row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
                lse - row[label]
            })
            .sum();

        Ok(total / y.len() as f32)
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: &[usize]) -> Result<Array2<f32>> {
        self.check(y_pred, y)?;

        let mut d = self.probabilities(y_pred);
        for (mut row, &label) in d.axis_iter_mut(Axis(0)).zip(y) {
            row[label] -= 1.;
        }

        let n = y.len().max(1) as f32;
        d.mapv_inplace(|x| x / n);
        Ok(d)
    }
}

/// Counts the rows whose highest logit is the expected label.
pub fn count_correct(y_pred: ArrayView2<f32>, y: &[usize]) -> usize {
    y_pred
        .axis_iter(Axis(0))
        .zip(y)
        .filter(|(row, label)| {
            let argmax = row
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &x)| {
                    if x > best.1 { (i, x) } else { best }
                })
                .0;
            argmax == **label
        })
        .count()
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn uniform_logits_give_log_classes() {
        let loss = CrossEntropy.loss(Array2::zeros((2, 4)).view(), &[0, 3]).unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn gradient_is_softmax_minus_onehot_over_batch() {
        let logits = array![[0., 0.], [0., 0.]];
        let d = CrossEntropy.loss_prime(logits.view(), &[0, 1]).unwrap();
        assert_eq!(d, array![[-0.25, 0.25], [0.25, -0.25]]);
    }

    #[test]
    fn probabilities_are_shift_invariant_and_normalized() {
        let p = CrossEntropy.probabilities(array![[1000., 1000.], [1., 3.]].view());
        assert_eq!(p.row(0), array![0.5, 0.5]);
        assert!((p.row(1).sum() - 1.).abs() < 1e-6);
        assert!(p[[1, 1]] > p[[1, 0]]);
    }

    #[test]
    fn rejects_labels_out_of_range() {
        let err = CrossEntropy.loss(Array2::zeros((1, 2)).view(), &[2]).unwrap_err();
        assert_eq!(err, MlErr::InvalidInput("label out of range for the logits"));
    }

    #[test]
    fn counts_argmax_hits() {
        let logits = array![[0.1, 0.9], [0.8, 0.2], [0.3, 0.7]];
        assert_eq!(count_correct(logits.view(), &[1, 1, 1]), 2);
    }
}
