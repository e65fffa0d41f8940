mod cross_entropy;
mod loss_fn;

pub use cross_entropy::{CrossEntropy, count_correct};
pub use loss_fn::LossFn;
