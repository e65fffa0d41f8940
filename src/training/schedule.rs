/// Piecewise constant learning rate decay.
///
/// The rate starts at `base_lr` and is multiplied by `GAMMA` every time the epoch counter reaches
/// one of the milestones. Repeated milestones decay more than once.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiStepLr {
    base_lr: f32,
    milestones: Vec<usize>,
    epoch: usize,
}

impl MultiStepLr {
    /// The decay factor applied at every milestone.
    pub const GAMMA: f32 = 0.1;

    /// Creates a new `MultiStepLr` that decays by `GAMMA`.
    ///
    /// # Arguments
    /// * `base_lr` - The learning rate before the first milestone.
    /// * `milestones` - The epochs at which the rate decays, in any order.
    pub fn new(base_lr: f32, mut milestones: Vec<usize>) -> Self {
        milestones.sort_unstable();

        Self {
            base_lr,
            milestones,
            epoch: 0,
        }
    }

    /// The amount of times `step` has been called.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// The learning rate for the current epoch.
    pub fn last_lr(&self) -> f32 {
        let decays = self.milestones.iter().take_while(|&&m| m <= self.epoch).count();
        self.base_lr * Self::GAMMA.powi(decays as i32)
    }

    /// Advances one epoch and returns the new learning rate.
    pub fn step(&mut self) -> f32 {
        self.epoch += 1;
        self.last_lr()
    }

    /// Moves the schedule to `epoch`, as if `step` had been called that many times.
    pub fn seek(&mut self, epoch: usize) -> f32 {
        self.epoch = epoch;
        self.last_lr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() <= 1e-6 * b.abs().max(1.)
    }

    #[test]
    fn default_milestones_give_three_plateaus() {
        let mut schedule = MultiStepLr::new(1., vec![50, 75]);
        let mut lrs = vec![schedule.last_lr()];
        lrs.extend((0..99).map(|_| schedule.step()));

        assert!(lrs[..50].iter().all(|&lr| close(lr, 1.)));
        assert!(lrs[50..75].iter().all(|&lr| close(lr, 0.1)));
        assert!(lrs[75..].iter().all(|&lr| close(lr, 0.01)));
    }

    #[test]
    fn repeated_milestones_stack() {
        let mut schedule = MultiStepLr::new(2., vec![1, 1]);
        assert!(close(schedule.step(), 0.02));
    }

    #[test]
    fn seek_matches_stepping() {
        let mut a = MultiStepLr::new(0.5, vec![3, 1]);
        let mut b = a.clone();
        for _ in 0..4 {
            a.step();
        }
        assert_eq!(b.seek(4), a.last_lr());
        assert_eq!(b, a);
    }
}
