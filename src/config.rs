use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use machine_learning::optimization::CurvatureConfig;
use serde::{Deserialize, Serialize};

use crate::{Result, TrainErr};

/// The hyperparameters of a training job.
///
/// The config is read once at startup and never changes afterwards, every checkpoint embeds it
/// verbatim. Missing keys take their default value, so a JSON document only needs to name what
/// it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub network: String,
    pub depth: usize,
    /// Hidden units per layer of the `mlp` network.
    pub width: usize,
    pub dataset: String,
    pub data_dir: PathBuf,

    pub optimizer: String,
    #[serde(rename = "graftM")]
    pub graft_m: String,
    #[serde(rename = "graftD")]
    pub graft_d: String,

    pub learning_rate: f64,
    pub momentum: f64,
    pub stat_decay: f64,
    pub damping: f64,
    pub kl_clip: f64,
    pub weight_decay: f64,
    #[serde(rename = "TCov")]
    pub t_cov: usize,
    #[serde(rename = "TScal")]
    pub t_scal: usize,
    #[serde(rename = "TInv")]
    pub t_inv: usize,

    pub batch_size: usize,
    pub test_batch_size: usize,
    pub epoch: usize,
    /// Comma separated epochs at which the learning rate decays.
    pub milestone: Option<String>,

    pub resume: bool,
    pub load_path: PathBuf,
    pub log_dir: PathBuf,
    pub device: String,
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            network: "mlp".to_string(),
            depth: 3,
            width: 512,
            dataset: "cifar10".to_string(),
            data_dir: PathBuf::from("data"),
            optimizer: "kfac".to_string(),
            graft_m: "sgd".to_string(),
            graft_d: "kfac".to_string(),
            learning_rate: 1e-3,
            momentum: 0.9,
            stat_decay: 0.95,
            damping: 1e-3,
            kl_clip: 1e-2,
            weight_decay: 5e-5,
            t_cov: 10,
            t_scal: 10,
            t_inv: 100,
            batch_size: 64,
            test_batch_size: 256,
            epoch: 100,
            milestone: None,
            resume: false,
            load_path: PathBuf::new(),
            log_dir: PathBuf::from("runs/pretrain"),
            device: "cpu".to_string(),
            seed: None,
        }
    }
}

impl RunConfig {
    /// Loads a `RunConfig` from a JSON file.
    ///
    /// # Arguments
    /// * `path` - The path of the JSON document.
    ///
    /// # Returns
    /// The parsed config or an error if the file cannot be read or parsed.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            TrainErr::InvalidConfig(format!("cannot read '{}': {e}", path.display()))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| TrainErr::InvalidConfig(format!("invalid JSON in '{}': {e}", path.display())))
    }

    /// Returns the epochs at which the learning rate decays.
    ///
    /// Without an explicit `milestone` list these are half and three quarters of the run.
    pub fn milestones(&self) -> Result<Vec<usize>> {
        let Some(list) = &self.milestone else {
            return Ok(vec![self.epoch / 2, self.epoch * 3 / 4]);
        };

        list.split(',')
            .map(|m| {
                m.trim()
                    .parse()
                    .map_err(|_| TrainErr::InvalidConfig(format!("invalid milestone '{m}'")))
            })
            .collect()
    }

    /// Checks the invariants the rest of the harness relies on.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("test_batch_size", self.test_batch_size),
            ("epoch", self.epoch),
            ("TCov", self.t_cov),
            ("TScal", self.t_scal),
            ("TInv", self.t_inv),
        ];

        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(TrainErr::InvalidConfig(format!("{name} must be positive")));
        }

        if self.device != "cpu" {
            return Err(TrainErr::InvalidConfig(format!(
                "unsupported device '{}', only cpu is available",
                self.device
            )));
        }

        if self.resume && self.load_path.as_os_str().is_empty() {
            return Err(TrainErr::InvalidConfig(
                "resume requires a load_path".to_string(),
            ));
        }

        self.milestones()?;
        Ok(())
    }

    pub fn batch_size(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.batch_size)
            .ok_or_else(|| TrainErr::InvalidConfig("batch_size must be positive".to_string()))
    }

    pub fn test_batch_size(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.test_batch_size)
            .ok_or_else(|| TrainErr::InvalidConfig("test_batch_size must be positive".to_string()))
    }

    /// The hyperparameters handed to the curvature-aware optimizers.
    pub fn curvature(&self) -> CurvatureConfig {
        CurvatureConfig {
            learning_rate: self.learning_rate as f32,
            momentum: self.momentum as f32,
            stat_decay: self.stat_decay as f32,
            damping: self.damping as f32,
            kl_clip: self.kl_clip as f32,
            weight_decay: self.weight_decay as f32,
            t_cov: self.t_cov,
            t_scal: self.t_scal,
            t_inv: self.t_inv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let config: RunConfig =
            serde_json::from_str(r#"{"optimizer": "graft", "graftD": "kfac", "TCov": 1}"#).unwrap();

        assert_eq!(config.optimizer, "graft");
        assert_eq!(config.graft_m, "sgd");
        assert_eq!(config.t_cov, 1);
        assert_eq!(config.t_inv, 100);
        assert_eq!(config.batch_size, 64);
    }

    #[test]
    fn default_milestones_split_the_run() {
        let config = RunConfig::default();
        assert_eq!(config.milestones().unwrap(), vec![50, 75]);

        let config = RunConfig {
            epoch: 7,
            ..Default::default()
        };
        assert_eq!(config.milestones().unwrap(), vec![3, 5]);
    }

    #[test]
    fn explicit_milestones_are_parsed() {
        let config = RunConfig {
            milestone: Some("30, 60,90".to_string()),
            ..Default::default()
        };
        assert_eq!(config.milestones().unwrap(), vec![30, 60, 90]);

        let config = RunConfig {
            milestone: Some("30,x".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.milestones(), Err(TrainErr::InvalidConfig(_))));
    }

    #[test]
    fn validation_rejects_unusable_configs() {
        assert!(RunConfig::default().validate().is_ok());

        let cases = [
            RunConfig {
                t_cov: 0,
                ..Default::default()
            },
            RunConfig {
                device: "cuda".to_string(),
                ..Default::default()
            },
            RunConfig {
                resume: true,
                ..Default::default()
            },
        ];

        for config in cases {
            assert!(matches!(config.validate(), Err(TrainErr::InvalidConfig(_))));
        }
    }

    #[test]
    fn serializes_with_original_key_names() {
        let json = serde_json::to_value(RunConfig::default()).unwrap();
        assert_eq!(json["TCov"], 10);
        assert_eq!(json["graftM"], "sgd");
    }
}
