use std::env;

use anyhow::Context;
use log::info;

use curvature_harness::RunConfig;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => RunConfig::from_json_file(&path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => RunConfig::default(),
    };
    info!("starting run with {config:?}");

    curvature_harness::run(config)?;
    Ok(())
}
