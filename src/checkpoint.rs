use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::info;
use machine_learning::ParamSet;
use ndarray::Array2;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{Result, RunConfig, TrainErr};

const EXTENSION: &str = "safetensors";

/// Identifies where the best checkpoint of a run lives.
///
/// The run directory groups runs by dataset, network and optimizer and then by the
/// hyperparameters that usually get swept, the file name repeats the identifying fields so files
/// stay recognizable once moved out of their directory.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointKey {
    pub log_dir: PathBuf,
    pub dataset: String,
    pub network: String,
    pub depth: usize,
    pub optimizer_tag: String,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub damping: f64,
}

impl CheckpointKey {
    /// Builds the key of a run.
    ///
    /// # Arguments
    /// * `config` - The run config.
    /// * `optimizer_tag` - The resolved optimizer's tag, `graft_<M>_<D>` for graft composites.
    pub fn new(config: &RunConfig, optimizer_tag: impl Into<String>) -> Self {
        Self {
            log_dir: config.log_dir.clone(),
            dataset: config.dataset.clone(),
            network: config.network.clone(),
            depth: config.depth,
            optimizer_tag: optimizer_tag.into(),
            learning_rate: config.learning_rate,
            weight_decay: config.weight_decay,
            damping: config.damping,
        }
    }

    /// `<log_dir>/<dataset>/<network>/<tag>/lr<lr>_wd<wd>_damping<damping>`.
    pub fn run_dir(&self) -> PathBuf {
        self.log_dir
            .join(&self.dataset)
            .join(&self.network)
            .join(&self.optimizer_tag)
            .join(format!(
                "lr{:.3}_wd{:.4}_damping{:.4}",
                self.learning_rate, self.weight_decay, self.damping
            ))
    }

    /// `<tag>_<dataset>_<network><depth>_best.safetensors`.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}{}_best.{EXTENSION}",
            self.optimizer_tag, self.dataset, self.network, self.depth
        )
    }

    pub fn path(&self) -> PathBuf {
        self.run_dir().join(self.file_name())
    }
}

/// Everything stored next to the parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    /// Test accuracy, in percent.
    pub acc: f64,
    pub epoch: usize,
    /// Mean test loss.
    pub loss: f64,
    pub config: RunConfig,
}

/// A checkpoint read back from disk.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub values: Vec<Array2<f32>>,
    pub meta: CheckpointMeta,
}

/// What a resumed run continues from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeState {
    pub best_acc: f64,
    pub start_epoch: usize,
    pub path: PathBuf,
}

/// Saves the best parameters of a run and restores them.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    key: CheckpointKey,
}

impl CheckpointManager {
    pub fn new(key: CheckpointKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &CheckpointKey {
        &self.key
    }

    /// Writes `params` and `meta` to the key's path, replacing any previous checkpoint.
    ///
    /// # Returns
    /// The path written to.
    pub fn save(&self, params: &ParamSet, meta: &CheckpointMeta) -> Result<PathBuf> {
        let path = self.key.path();
        fs::create_dir_all(self.key.run_dir())?;

        let tensors: Vec<_> = params
            .iter()
            .enumerate()
            .map(|(i, param)| {
                let (rows, cols) = param.dim();
                let floats: Vec<f32> = param.value().iter().copied().collect();
                let bytes = bytemuck::cast_slice::<f32, u8>(&floats).to_vec();
                (format!("layer{i}"), vec![rows, cols], bytes)
            })
            .collect();

        let views = tensors
            .iter()
            .map(|(name, shape, bytes)| tensor_view(name, shape, bytes))
            .collect::<Result<Vec<_>>>()?;

        let metadata = HashMap::from([
            ("acc".to_string(), meta.acc.to_string()),
            ("epoch".to_string(), meta.epoch.to_string()),
            ("loss".to_string(), meta.loss.to_string()),
            ("config".to_string(), serde_json::to_string(&meta.config)?),
        ]);

        let bytes = safetensors::serialize(views, &Some(metadata))?;
        fs::write(&path, bytes)?;

        info!(
            "saved checkpoint at epoch {} with acc {:.3}% to {}",
            meta.epoch,
            meta.acc,
            path.display()
        );
        Ok(path)
    }

    /// Restores the parameters stored at `path` into `params`.
    ///
    /// # Returns
    /// The best accuracy and the epoch to continue from, `CheckpointNotFound` if the file is
    /// missing or unreadable, or an error if it does not match `params`.
    pub fn resume<P: AsRef<Path>>(&self, path: P, params: &mut ParamSet) -> Result<ResumeState> {
        let path = path.as_ref();
        let checkpoint = load(path)?;
        params.load_values(checkpoint.values)?;

        info!(
            "loaded checkpoint at epoch {}, acc: {:.2}%",
            checkpoint.meta.epoch, checkpoint.meta.acc
        );

        Ok(ResumeState {
            best_acc: checkpoint.meta.acc,
            start_epoch: checkpoint.meta.epoch,
            path: path.to_path_buf(),
        })
    }
}

/// Reads the checkpoint stored at `path`.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| TrainErr::CheckpointNotFound {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let (_, header) = SafeTensors::read_metadata(&bytes)?;
    let metadata = header
        .metadata()
        .as_ref()
        .ok_or_else(|| TrainErr::Serialization("checkpoint has no metadata".to_string()))?;

    let meta = CheckpointMeta {
        acc: field(metadata, "acc")?,
        epoch: field(metadata, "epoch")?,
        loss: field(metadata, "loss")?,
        config: serde_json::from_str(raw_field(metadata, "config")?)?,
    };

    let tensors = SafeTensors::deserialize(&bytes)?;
    let values = (0..tensors.len())
        .map(|i| -> Result<Array2<f32>> {
            let view = tensors.tensor(&format!("layer{i}"))?;
            read_matrix(&view)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Checkpoint { values, meta })
}

fn tensor_view<'a>(
    name: &'a str,
    shape: &[usize],
    bytes: &'a [u8],
) -> Result<(&'a str, TensorView<'a>)> {
    let view = TensorView::new(Dtype::F32, shape.to_vec(), bytes)?;
    Ok((name, view))
}

fn raw_field<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| TrainErr::Serialization(format!("checkpoint metadata lacks '{key}'")))
}

fn field<T: FromStr>(metadata: &HashMap<String, String>, key: &str) -> Result<T> {
    raw_field(metadata, key)?
        .parse()
        .map_err(|_| TrainErr::Serialization(format!("invalid checkpoint metadata '{key}'")))
}

fn read_matrix(view: &TensorView<'_>) -> Result<Array2<f32>> {
    let &[rows, cols] = view.shape() else {
        return Err(TrainErr::Serialization(format!(
            "expected a matrix, got shape {:?}",
            view.shape()
        )));
    };

    if view.dtype() != Dtype::F32 {
        return Err(TrainErr::Serialization(format!(
            "expected f32 tensors, got {:?}",
            view.dtype()
        )));
    }

    let floats = bytemuck::pod_collect_to_vec::<u8, f32>(view.data());
    Array2::from_shape_vec((rows, cols), floats).map_err(|e| TrainErr::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn key(log_dir: &Path) -> CheckpointKey {
        let config = RunConfig {
            log_dir: log_dir.to_path_buf(),
            ..Default::default()
        };
        CheckpointKey::new(&config, "graft_sgd_kfac")
    }

    fn meta(acc: f64, epoch: usize) -> CheckpointMeta {
        CheckpointMeta {
            acc,
            epoch,
            loss: 1.25,
            config: RunConfig::default(),
        }
    }

    #[test]
    fn key_layout_is_deterministic() {
        let key = key(Path::new("runs/pretrain"));
        assert_eq!(
            key.path(),
            PathBuf::from(
                "runs/pretrain/cifar10/mlp/graft_sgd_kfac/lr0.001_wd0.0001_damping0.0010/graft_sgd_kfac_cifar10_mlp3_best.safetensors"
            )
        );
    }

    #[test]
    fn saved_checkpoints_resume() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(key(dir.path()));
        let params = ParamSet::new([array![[1., 2., 3.], [4., 5., 6.]], array![[-1.], [0.5]]]);

        let path = manager.save(&params, &meta(55.5, 7)).unwrap();
        assert_eq!(path, manager.key().path());

        let mut restored = ParamSet::new([Array2::zeros((2, 3)), Array2::zeros((2, 1))]);
        let state = manager.resume(&path, &mut restored).unwrap();

        assert_eq!(state.best_acc, 55.5);
        assert_eq!(state.start_epoch, 7);
        assert_eq!(restored.values(), params.values());

        let checkpoint = load(&path).unwrap();
        assert_eq!(checkpoint.meta, meta(55.5, 7));
    }

    #[test]
    fn missing_checkpoints_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(key(dir.path()));
        let mut params = ParamSet::new([Array2::zeros((1, 1))]);

        let err = manager
            .resume(dir.path().join("nope.safetensors"), &mut params)
            .unwrap_err();
        assert!(matches!(err, TrainErr::CheckpointNotFound { .. }));
    }

    #[test]
    fn resuming_into_another_network_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(key(dir.path()));
        let path = manager
            .save(&ParamSet::new([Array2::zeros((2, 2))]), &meta(1., 0))
            .unwrap();

        let mut params = ParamSet::new([Array2::zeros((3, 2))]);
        let err = manager.resume(&path, &mut params).unwrap_err();
        assert!(matches!(err, TrainErr::Ml(_)));
    }
}
