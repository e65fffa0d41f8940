use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::info;
use machine_learning::dataset::Dataset;
use ndarray::Array2;

use crate::{Result, TrainErr};

const CHANNEL_SIZE: usize = 32 * 32;
/// Features of one flattened image.
pub const IMAGE_SIZE: usize = 3 * CHANNEL_SIZE;

const MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
const STD: [f32; 3] = [0.2023, 0.1994, 0.2010];

/// The datasets a run can train on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKey {
    Cifar10,
    Cifar100,
}

impl FromStr for DatasetKey {
    type Err = TrainErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cifar10" => Ok(Self::Cifar10),
            "cifar100" => Ok(Self::Cifar100),
            other => Err(TrainErr::UnknownDataset(other.to_string())),
        }
    }
}

impl DatasetKey {
    pub fn num_classes(self) -> usize {
        match self {
            Self::Cifar10 => 10,
            Self::Cifar100 => 100,
        }
    }

    /// Bytes preceding the pixels of every record, the last one is the label used.
    fn label_bytes(self) -> usize {
        match self {
            Self::Cifar10 => 1,
            Self::Cifar100 => 2,
        }
    }

    fn files(self, data_dir: &Path) -> (Vec<PathBuf>, PathBuf) {
        match self {
            Self::Cifar10 => {
                let dir = data_dir.join("cifar-10-batches-bin");
                let train = (1..=5)
                    .map(|i| dir.join(format!("data_batch_{i}.bin")))
                    .collect();
                (train, dir.join("test_batch.bin"))
            }
            Self::Cifar100 => {
                let dir = data_dir.join("cifar-100-binary");
                (vec![dir.join("train.bin")], dir.join("test.bin"))
            }
        }
    }

    /// Loads the train and test splits from the binary distribution under `data_dir`.
    ///
    /// # Returns
    /// The `(train, test)` datasets, or an error if a file is missing or truncated.
    pub fn load(self, data_dir: &Path) -> Result<(Dataset, Dataset)> {
        let (train_files, test_file) = self.files(data_dir);
        let train = self.read_split(&train_files)?;
        let test = self.read_split(&[test_file])?;

        info!(
            "loaded {self:?}: {} train and {} test images",
            train.len(),
            test.len()
        );
        Ok((train, test))
    }

    fn read_split(self, files: &[PathBuf]) -> Result<Dataset> {
        let mut bytes = Vec::new();
        for path in files {
            let chunk = fs::read(path)?;
            let record = self.label_bytes() + IMAGE_SIZE;

            if chunk.len() % record != 0 {
                return Err(TrainErr::MalformedDataset {
                    path: path.clone(),
                    reason: format!("{} bytes is not a whole number of {record} byte records", chunk.len()),
                });
            }

            bytes.extend(chunk);
        }

        decode_records(&bytes, self.label_bytes(), self.num_classes())
    }
}

/// Decodes `[labels.., r.., g.., b..]` records into normalized features and labels.
fn decode_records(bytes: &[u8], label_bytes: usize, num_classes: usize) -> Result<Dataset> {
    let record = label_bytes + IMAGE_SIZE;
    let n = bytes.len() / record;
    let mut x = Array2::zeros((n, IMAGE_SIZE));
    let mut y = Vec::with_capacity(n);

    for (mut row, rec) in x.rows_mut().into_iter().zip(bytes.chunks_exact(record)) {
        y.push(rec[label_bytes - 1] as usize);

        for (i, (dst, &px)) in row.iter_mut().zip(&rec[label_bytes..]).enumerate() {
            let c = i / CHANNEL_SIZE;
            *dst = (px as f32 / 255. - MEAN[c]) / STD[c];
        }
    }

    Ok(Dataset::new(x, y, num_classes)?)
}
