use log::trace;
use machine_learning::{
    MlErr, ParamSet,
    arch::{
        Model,
        loss::{CrossEntropy, LossFn},
    },
    optimization::Optimizer,
};
use ndarray::{ArrayView2, Axis};
use rand::{
    Rng,
    distr::{Distribution, weighted::WeightedIndex},
};

use crate::{Result, TrainErr};

/// Decides, on every training batch, whether the curvature-aware optimizer needs a statistics
/// pass before the real backward pass, and runs it.
///
/// A statistics pass backpropagates the loss against labels sampled from the model's own
/// predictive distribution, so the recorded factors estimate the true Fisher rather than the
/// empirical one. Its gradients are discarded afterwards.
#[derive(Debug)]
pub struct CurvatureScheduler<R: Rng> {
    tag: String,
    expects_curvature: bool,
    rng: R,
    passes: usize,
}

impl<R: Rng> CurvatureScheduler<R> {
    /// Creates a new `CurvatureScheduler`.
    ///
    /// # Arguments
    /// * `tag` - The optimizer tag, used in errors and logs.
    /// * `expects_curvature` - Whether the optimizer must expose curvature statistics.
    /// * `rng` - The source of the sampled labels.
    pub fn new(tag: String, expects_curvature: bool, rng: R) -> Self {
        Self {
            tag,
            expects_curvature,
            rng,
            passes: 0,
        }
    }

    /// The amount of statistics passes run so far.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Runs a statistics pass if the optimizer is due for one.
    ///
    /// Must be called after the forward pass and before the real backward pass. When a pass
    /// runs, the gradients are zero again on return.
    ///
    /// # Arguments
    /// * `optimizer` - The optimizer about to take a step.
    /// * `model` - The model whose last forward produced `logits`.
    /// * `params` - The parameters used on that forward pass.
    /// * `logits` - The output of that forward pass.
    ///
    /// # Returns
    /// Whether a statistics pass ran, or an error if the optimizer was expected to be
    /// curvature-aware but is not.
    pub fn before_backward<M: Model>(
        &mut self,
        optimizer: &mut dyn Optimizer,
        model: &mut M,
        params: &mut ParamSet,
        logits: ArrayView2<f32>,
    ) -> Result<bool> {
        let Some(stats) = optimizer.curvature_mut() else {
            if self.expects_curvature {
                return Err(TrainErr::MissingCurvatureCapability(self.tag.clone()));
            }

            return Ok(false);
        };

        let steps = stats.steps();
        if steps % stats.stats_period().max(1) != 0 {
            return Ok(false);
        }

        trace!("[{}] statistics pass at step {steps}", self.tag);

        let sampled = self.sample_labels(logits)?;
        let d = CrossEntropy.loss_prime(logits, &sampled)?;

        stats.set_accumulating(true);
        let result = model.backward(params, d, Some(stats.as_observer()));
        stats.set_accumulating(false);
        result?;

        optimizer.zero_grad(params);
        self.passes += 1;
        Ok(true)
    }

    /// Draws one label per row from the softmax of `logits`.
    fn sample_labels(&mut self, logits: ArrayView2<f32>) -> Result<Vec<usize>> {
        let probs = CrossEntropy.probabilities(logits);

        probs
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(row, p)| -> Result<usize> {
                let dist = WeightedIndex::new(p.iter().copied())
                    .map_err(|_| MlErr::NonFiniteProbabilities { row })?;
                Ok(dist.sample(&mut self.rng))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use machine_learning::{
        arch::{CurvatureObserver, Sequential},
        optimization::{CurvatureConfig, CurvatureStats, GradientDescent, Kfac},
    };
    use ndarray::{Array2, array};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn setup() -> (Sequential, ParamSet, Array2<f32>) {
        let mut model = Sequential::mlp(2, 4, 1, 3);
        let params = model.init_params(&mut StdRng::seed_from_u64(3)).unwrap();
        let x = array![[1., 0.], [0., 1.], [1., 1.], [-1., 0.5]];
        let logits = model.forward(&params, x.view()).unwrap();
        (model, params, logits)
    }

    fn scheduler(expects: bool) -> CurvatureScheduler<StdRng> {
        CurvatureScheduler::new("kfac".to_string(), expects, StdRng::seed_from_u64(0))
    }

    #[test]
    fn triggered_pass_leaves_clean_gradients_and_resets_the_flag() {
        let (mut model, mut params, logits) = setup();
        let mut kfac = Kfac::new(
            &params,
            CurvatureConfig {
                t_cov: 2,
                ..Default::default()
            },
        );
        let mut scheduler = scheduler(true);

        let ran = scheduler
            .before_backward(&mut kfac, &mut model, &mut params, logits.view())
            .unwrap();
        assert!(ran);
        assert!(params.grads_are_zero());
        assert!(!kfac.is_accumulating());

        // Step 1 is off period.
        kfac.updates(&params).unwrap();
        let ran = scheduler
            .before_backward(&mut kfac, &mut model, &mut params, logits.view())
            .unwrap();
        assert!(!ran);
        assert_eq!(scheduler.passes(), 1);
        assert_eq!(kfac.steps(), 1);
    }

    /// A curvature-aware optimizer that only records what it observes.
    #[derive(Default)]
    struct Recording {
        steps: usize,
        accumulating: bool,
        seen: Vec<(usize, bool)>,
    }

    impl Optimizer for Recording {
        fn updates(&mut self, params: &ParamSet) -> machine_learning::Result<Vec<Array2<f32>>> {
            self.steps += 1;
            Ok(params.iter().map(|p| Array2::zeros(p.dim())).collect())
        }

        fn learning_rate(&self) -> f32 {
            0.
        }

        fn set_learning_rate(&mut self, _: f32) {}

        fn curvature(&self) -> Option<&dyn CurvatureStats> {
            Some(self)
        }

        fn curvature_mut(&mut self) -> Option<&mut dyn CurvatureStats> {
            Some(self)
        }
    }

    impl CurvatureObserver for Recording {
        fn is_accumulating(&self) -> bool {
            self.accumulating
        }

        fn observe(&mut self, layer: usize, _: ArrayView2<f32>, _: ArrayView2<f32>) {
            self.seen.push((layer, self.accumulating));
        }
    }

    impl CurvatureStats for Recording {
        fn steps(&self) -> usize {
            self.steps
        }

        fn stats_period(&self) -> usize {
            2
        }

        fn set_accumulating(&mut self, accumulating: bool) {
            self.accumulating = accumulating;
        }

        fn as_observer(&mut self) -> &mut dyn CurvatureObserver {
            self
        }
    }

    #[test]
    fn statistics_pass_observes_every_layer_once_while_accumulating() {
        let (mut model, mut params, logits) = setup();
        let mut stats = Recording::default();
        let mut scheduler = scheduler(true);

        assert!(
            scheduler
                .before_backward(&mut stats, &mut model, &mut params, logits.view())
                .unwrap()
        );
        assert_eq!(stats.seen, vec![(1, true), (0, true)]);
        assert!(!stats.accumulating);

        stats.steps = 1;
        assert!(
            !scheduler
                .before_backward(&mut stats, &mut model, &mut params, logits.view())
                .unwrap()
        );
        assert_eq!(stats.seen.len(), 2);

        stats.steps = 2;
        scheduler
            .before_backward(&mut stats, &mut model, &mut params, logits.view())
            .unwrap();
        assert_eq!(stats.seen, vec![(1, true), (0, true), (1, true), (0, true)]);
        assert_eq!(scheduler.passes(), 2);
    }

    #[test]
    fn first_order_optimizers_are_skipped() {
        let (mut model, mut params, logits) = setup();
        let mut sgd = GradientDescent::new(&params, 0.1, 0.9, 0.);
        let ran = scheduler(false)
            .before_backward(&mut sgd, &mut model, &mut params, logits.view())
            .unwrap();
        assert!(!ran);
    }

    #[test]
    fn missing_capability_is_fatal() {
        let (mut model, mut params, logits) = setup();
        let mut sgd = GradientDescent::new(&params, 0.1, 0.9, 0.);
        let err = scheduler(true)
            .before_backward(&mut sgd, &mut model, &mut params, logits.view())
            .unwrap_err();
        assert!(matches!(err, TrainErr::MissingCurvatureCapability(tag) if tag == "kfac"));
    }

    #[test]
    fn sampled_labels_are_valid_classes() {
        let mut scheduler = scheduler(true);
        let logits = array![[0., 0., 0.], [100., -100., -100.]];
        let labels = scheduler.sample_labels(logits.view()).unwrap();
        assert_eq!(labels.len(), 2);
        assert!(labels[0] < 3);
        assert_eq!(labels[1], 0);
    }

    #[test]
    fn non_finite_logits_cannot_be_sampled() {
        let mut scheduler = scheduler(true);
        let logits = array![[0., 0.], [f32::NAN, 0.]];
        let err = scheduler.sample_labels(logits.view()).unwrap_err();
        assert!(matches!(err, TrainErr::Ml(MlErr::NonFiniteProbabilities { row: 1 })));
    }
}
