use machine_learning::arch::Sequential;

use crate::{Result, RunConfig, TrainErr};

/// Builds the network named by `config.network`.
///
/// `mlp` stacks `depth` hidden layers of `width` units with ReLU activations, `logistic` is a
/// single linear layer.
///
/// # Arguments
/// * `config` - The run config.
/// * `inputs` - The amount of input features.
/// * `classes` - The amount of output logits.
pub fn build(config: &RunConfig, inputs: usize, classes: usize) -> Result<Sequential> {
    match config.network.as_str() {
        "mlp" => Ok(Sequential::mlp(inputs, config.width, config.depth, classes)),
        "logistic" => Ok(Sequential::mlp(inputs, 0, 0, classes)),
        other => Err(TrainErr::UnknownNetwork(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_known_networks() {
        let config = RunConfig {
            width: 8,
            depth: 2,
            ..Default::default()
        };
        let dims: Vec<_> = build(&config, 4, 3)
            .unwrap()
            .layers()
            .iter()
            .map(|l| l.dim())
            .collect();
        assert_eq!(dims, vec![(4, 8), (8, 8), (8, 3)]);

        let config = RunConfig {
            network: "logistic".to_string(),
            ..Default::default()
        };
        assert_eq!(build(&config, 4, 3).unwrap().layers().len(), 1);
    }

    #[test]
    fn rejects_unknown_networks() {
        let config = RunConfig {
            network: "vgg16_bn".to_string(),
            ..Default::default()
        };
        assert!(matches!(build(&config, 4, 3), Err(TrainErr::UnknownNetwork(_))));
    }
}
