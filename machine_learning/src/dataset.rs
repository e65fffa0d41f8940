use std::num::NonZeroUsize;

use ndarray::{Array2, Axis};
use rand::{Rng, seq::SliceRandom};

use crate::{MlErr, Result};

/// An in-memory labeled dataset, one example per row.
#[derive(Debug, Clone)]
pub struct Dataset {
    x: Array2<f32>,
    y: Vec<usize>,
    num_classes: usize,
    order: Vec<usize>,
}

impl Dataset {
    /// Creates a new `Dataset`.
    ///
    /// # Arguments
    /// * `x` - The features, one example per row.
    /// * `y` - The label of each example.
    /// * `num_classes` - The amount of classes, every label must be lower than it.
    ///
    /// # Returns
    /// An error if the amount of rows and labels differ or a label is out of range.
    pub fn new(x: Array2<f32>, y: Vec<usize>, num_classes: usize) -> Result<Self> {
        if x.nrows() != y.len() {
            return Err(MlErr::SizeMismatch {
                what: "dataset labels",
                got: y.len(),
                expected: x.nrows(),
            });
        }

        if y.iter().any(|&label| label >= num_classes) {
            return Err(MlErr::InvalidInput("dataset label out of range"));
        }

        let order = (0..y.len()).collect();

        Ok(Self {
            x,
            y,
            num_classes,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.x.ncols()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Returns the amount of batches `batches` yields for the given size.
    pub fn num_batches(&self, batch_size: NonZeroUsize) -> usize {
        self.len().div_ceil(batch_size.get())
    }

    /// Shuffles the order in which `batches` yields the examples.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        self.order.shuffle(rng);
    }

    /// Iterates the dataset in batches of `batch_size` examples, the last one may be shorter.
    pub fn batches(&self, batch_size: NonZeroUsize) -> impl Iterator<Item = (Array2<f32>, Vec<usize>)> + '_ {
        self.order.chunks(batch_size.get()).map(|idx| {
            let x = self.x.select(Axis(0), idx);
            let y = idx.iter().map(|&i| self.y[i]).collect();
            (x, y)
        })
    }
}
