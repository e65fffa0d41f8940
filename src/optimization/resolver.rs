use log::info;
use machine_learning::{
    ParamSet,
    optimization::{Adam, Ekfac, GradientDescent, Graft, Kfac, Optimizer},
};

use super::{GraftPart, OptimizerKind};
use crate::{Result, RunConfig};

/// An optimizer built from the run config, together with the kind it was built from.
pub struct ResolvedOptimizer {
    pub kind: OptimizerKind,
    pub optimizer: Box<dyn Optimizer>,
}

impl ResolvedOptimizer {
    pub fn tag(&self) -> String {
        self.kind.tag()
    }
}

/// Builds the optimizer named by the config.
///
/// # Arguments
/// * `config` - The run config, its optimizer name and hyperparameters are read.
/// * `params` - The parameters the optimizer will update, only their shapes are read.
///
/// # Returns
/// The resolved optimizer or an error if the name, or one of the graft constituents, is unknown.
pub fn resolve(config: &RunConfig, params: &ParamSet) -> Result<ResolvedOptimizer> {
    let kind = OptimizerKind::parse(&config.optimizer, &config.graft_m, &config.graft_d)?;

    let optimizer: Box<dyn Optimizer> = match kind {
        OptimizerKind::Sgd => Box::new(sgd(config, params)),
        OptimizerKind::Adam => Box::new(Adam::new(
            params,
            config.learning_rate as f32,
            config.weight_decay as f32,
        )),
        OptimizerKind::Kfac => Box::new(Kfac::new(params, config.curvature())),
        OptimizerKind::Ekfac => Box::new(Ekfac::new(params, config.curvature())),
        OptimizerKind::Graft {
            magnitude,
            direction,
        } => {
            info!("using graft optimizer with M={} and D={}", magnitude.name(), direction.name());
            let m = graft_part(magnitude, config, params);
            let d = graft_part(direction, config, params);
            Box::new(Graft::new(m, d)?)
        }
    };

    Ok(ResolvedOptimizer { kind, optimizer })
}

fn sgd(config: &RunConfig, params: &ParamSet) -> GradientDescent {
    GradientDescent::new(
        params,
        config.learning_rate as f32,
        config.momentum as f32,
        config.weight_decay as f32,
    )
}

fn graft_part(part: GraftPart, config: &RunConfig, params: &ParamSet) -> Box<dyn Optimizer> {
    match part {
        GraftPart::Sgd => Box::new(sgd(config, params)),
        GraftPart::Kfac => Box::new(Kfac::new(params, config.curvature())),
    }
}
