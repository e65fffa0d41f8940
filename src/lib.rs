pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod network;
pub mod optimization;
pub mod training;

use log::info;
use machine_learning::arch::Model;
use rand::{SeedableRng, rngs::StdRng};

pub use config::RunConfig;
pub use error::{Result, TrainErr};

use crate::{
    checkpoint::CheckpointKey,
    data::DatasetKey,
    optimization::OptimizerKind,
    training::{EpochDriver, JsonlSink},
};

/// Runs a whole training job: loads the dataset, builds the network and the optimizer, resumes
/// from a checkpoint if asked to and trains for the configured amount of epochs.
///
/// The dataset and optimizer names are checked before any data is read.
///
/// # Returns
/// The best test accuracy, in percent.
pub fn run(config: RunConfig) -> Result<f64> {
    config.validate()?;
    let dataset = config.dataset.parse::<DatasetKey>()?;
    let kind = OptimizerKind::parse(&config.optimizer, &config.graft_m, &config.graft_d)?;

    let (mut train, test) = dataset.load(&config.data_dir)?;
    let model = network::build(&config, train.num_features(), dataset.num_classes())?;

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let params = model.init_params(&mut rng)?;

    let run_dir = CheckpointKey::new(&config, kind.tag()).run_dir();
    let sink = JsonlSink::create(&run_dir)?;
    info!("writing scalars to {}", sink.path().display());

    let resume = config.resume.then(|| config.load_path.clone());
    let mut driver = EpochDriver::new(config, model, params, sink, rng)?;
    if let Some(path) = resume {
        driver.resume(path)?;
    }

    let best = driver.run(&mut train, &test)?;
    info!("best test accuracy: {best:.3}%");
    Ok(best)
}
