use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use log::{debug, info};
use machine_learning::{
    ParamSet,
    arch::{
        Model,
        loss::{CrossEntropy, LossFn, count_correct},
    },
    dataset::Dataset,
    optimization::Optimizer,
};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{EpochMetrics, MultiStepLr, ScalarSink};
use crate::{
    Result, RunConfig,
    checkpoint::{CheckpointKey, CheckpointManager, CheckpointMeta},
    optimization::{CurvatureScheduler, resolve},
};

/// Where the driver is within the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Training,
    Evaluating,
    Finished,
}

/// The best test accuracy seen so far and the checkpoint that holds it.
///
/// Starts at zero and only ever moves up, on a strict improvement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BestState {
    acc: f64,
    checkpoint: Option<PathBuf>,
}

impl BestState {
    pub fn acc(&self) -> f64 {
        self.acc
    }

    pub fn checkpoint(&self) -> Option<&Path> {
        self.checkpoint.as_deref()
    }

    /// Returns true if `acc` strictly beats the best accuracy so far.
    pub fn improves(&self, acc: f64) -> bool {
        acc > self.acc
    }

    /// Records `acc` and its checkpoint if it is a strict improvement.
    ///
    /// # Returns
    /// Whether the state changed.
    pub fn update(&mut self, acc: f64, checkpoint: PathBuf) -> bool {
        if !self.improves(acc) {
            return false;
        }

        self.acc = acc;
        self.checkpoint = Some(checkpoint);
        true
    }
}

/// How many times each phase of a training step ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCounters {
    pub stats_passes: usize,
    pub backward_passes: usize,
    pub optimizer_steps: usize,
}

/// Runs the train/evaluate loop of a job.
///
/// Every epoch trains over the shuffled train split, advances the learning rate schedule once
/// and evaluates on the test split. A checkpoint is written whenever the test accuracy strictly
/// improves on the best one.
pub struct EpochDriver<M: Model, S: ScalarSink> {
    config: RunConfig,
    model: M,
    params: ParamSet,
    optimizer: Box<dyn Optimizer>,
    tag: String,
    scheduler: CurvatureScheduler<StdRng>,
    lr_schedule: MultiStepLr,
    checkpoints: CheckpointManager,
    sink: S,
    best: BestState,
    state: DriverState,
    start_epoch: usize,
    counters: StepCounters,
    rng: StdRng,
}

impl<M: Model, S: ScalarSink> EpochDriver<M, S> {
    /// Creates a new `EpochDriver`.
    ///
    /// # Arguments
    /// * `config` - The run config, validated here.
    /// * `model` - The network to train.
    /// * `params` - Its initialized parameters.
    /// * `sink` - Receives the per-epoch scalars.
    /// * `rng` - Drives shuffling and the sampled labels of statistics passes.
    ///
    /// # Returns
    /// The driver, or an error if the config is invalid or names an unsupported optimizer.
    pub fn new(
        config: RunConfig,
        model: M,
        params: ParamSet,
        sink: S,
        mut rng: StdRng,
    ) -> Result<Self> {
        config.validate()?;

        let resolved = resolve(&config, &params)?;
        let tag = resolved.tag();
        let scheduler = CurvatureScheduler::new(
            tag.clone(),
            resolved.kind.expects_curvature(),
            StdRng::seed_from_u64(rng.random()),
        );
        let lr_schedule = MultiStepLr::new(config.learning_rate as f32, config.milestones()?);
        let checkpoints = CheckpointManager::new(CheckpointKey::new(&config, tag.as_str()));

        Ok(Self {
            config,
            model,
            params,
            optimizer: resolved.optimizer,
            tag,
            scheduler,
            lr_schedule,
            checkpoints,
            sink,
            best: BestState::default(),
            state: DriverState::Idle,
            start_epoch: 0,
            counters: StepCounters::default(),
            rng,
        })
    }

    /// Continues from the checkpoint at `path`: restores the parameters, the best accuracy and
    /// the epoch to start from, and moves the learning rate schedule to that epoch.
    pub fn resume<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let state = self.checkpoints.resume(path, &mut self.params)?;

        self.best = BestState {
            acc: state.best_acc,
            checkpoint: Some(state.path),
        };
        self.start_epoch = state.start_epoch;

        let lr = self.lr_schedule.seek(state.start_epoch);
        self.optimizer.set_learning_rate(lr);
        Ok(())
    }

    /// Trains until the configured amount of epochs is reached.
    ///
    /// # Returns
    /// The best test accuracy.
    pub fn run(&mut self, train: &mut Dataset, test: &Dataset) -> Result<f64> {
        for epoch in self.start_epoch..self.config.epoch {
            let start = Instant::now();
            self.train_epoch(epoch, train)?;
            info!("train epoch completed in {:.2} s", start.elapsed().as_secs_f64());
            self.evaluate(epoch, test)?;
        }

        self.state = DriverState::Finished;
        Ok(self.best.acc)
    }

    /// Runs one training epoch.
    pub fn train_epoch(&mut self, epoch: usize, train: &mut Dataset) -> Result<EpochMetrics> {
        self.state = DriverState::Training;
        info!("epoch: {epoch}");

        let lr = self.lr_schedule.last_lr();
        self.sink.add_scalar("train/lr", lr as f64, epoch)?;

        let batch_size = self.config.batch_size()?;
        let num_batches = train.num_batches(batch_size);
        let mut metrics = EpochMetrics::default();
        train.shuffle(&mut self.rng);

        for (i, (x, y)) in train.batches(batch_size).enumerate() {
            self.optimizer.zero_grad(&mut self.params);

            let logits = self.model.forward(&self.params, x.view())?;
            let loss = CrossEntropy.loss(logits.view(), &y)?;

            if self.scheduler.before_backward(
                self.optimizer.as_mut(),
                &mut self.model,
                &mut self.params,
                logits.view(),
            )? {
                self.counters.stats_passes += 1;
            }

            let d = CrossEntropy.loss_prime(logits.view(), &y)?;
            self.model.backward(&mut self.params, d, None)?;
            self.counters.backward_passes += 1;

            self.optimizer.step(&mut self.params)?;
            self.counters.optimizer_steps += 1;

            metrics.record(loss, count_correct(logits.view(), &y), y.len());
            debug!(
                "[{}][LR={lr}] batch {}/{num_batches} Loss: {:.3} | Acc: {:.3}% ({}/{})",
                self.tag,
                i + 1,
                metrics.mean_loss(),
                metrics.accuracy(),
                metrics.correct(),
                metrics.total()
            );
        }

        let next_lr = self.lr_schedule.step();
        self.optimizer.set_learning_rate(next_lr);

        info!(
            "[{}][LR={lr}] Loss: {:.3} | Acc: {:.3}% ({}/{})",
            self.tag,
            metrics.mean_loss(),
            metrics.accuracy(),
            metrics.correct(),
            metrics.total()
        );
        self.sink.add_scalar("train/loss", metrics.mean_loss(), epoch)?;
        self.sink.add_scalar("train/acc", metrics.accuracy(), epoch)?;

        self.state = DriverState::Idle;
        Ok(metrics)
    }

    /// Evaluates on `test` and saves a checkpoint if the accuracy strictly improves.
    pub fn evaluate(&mut self, epoch: usize, test: &Dataset) -> Result<EpochMetrics> {
        self.state = DriverState::Evaluating;

        let mut metrics = EpochMetrics::default();
        for (x, y) in test.batches(self.config.test_batch_size()?) {
            let logits = self.model.predict(&self.params, x.view())?;
            let loss = CrossEntropy.loss(logits.view(), &y)?;
            metrics.record(loss, count_correct(logits.view(), &y), y.len());
        }

        let acc = metrics.accuracy();
        info!(
            "[{}][LR={}] Loss: {:.3} | Acc: {:.3}% ({}/{})",
            self.tag,
            self.lr_schedule.last_lr(),
            metrics.mean_loss(),
            acc,
            metrics.correct(),
            metrics.total()
        );
        self.sink.add_scalar("test/loss", metrics.mean_loss(), epoch)?;
        self.sink.add_scalar("test/acc", acc, epoch)?;

        if self.best.improves(acc) {
            let meta = CheckpointMeta {
                acc,
                epoch,
                loss: metrics.mean_loss(),
                config: self.config.clone(),
            };
            let path = self.checkpoints.save(&self.params, &meta)?;
            self.best.update(acc, path);
        }

        self.state = DriverState::Idle;
        Ok(metrics)
    }

    pub fn params(&self) -> &ParamSet {
        &self.params
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn best(&self) -> &BestState {
        &self.best
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn counters(&self) -> StepCounters {
        self.counters
    }

    pub fn checkpoint_key(&self) -> &CheckpointKey {
        self.checkpoints.key()
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_state_only_moves_on_strict_improvements() {
        let mut best = BestState::default();
        assert_eq!(best.acc(), 0.);
        assert!(!best.update(0., PathBuf::from("a")));
        assert!(best.update(10., PathBuf::from("b")));
        assert!(!best.update(10., PathBuf::from("c")));
        assert!(!best.update(5., PathBuf::from("d")));

        assert_eq!(best.acc(), 10.);
        assert_eq!(best.checkpoint(), Some(Path::new("b")));
    }
}
