use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::Result;

/// The running totals of one train or test epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochMetrics {
    loss_sum: f64,
    batches: usize,
    correct: usize,
    total: usize,
}

impl EpochMetrics {
    /// Accounts for one batch.
    ///
    /// # Arguments
    /// * `loss` - The batch's mean loss.
    /// * `correct` - The amount of correctly classified examples.
    /// * `count` - The amount of examples in the batch.
    pub fn record(&mut self, loss: f32, correct: usize, count: usize) {
        self.loss_sum += loss as f64;
        self.batches += 1;
        self.correct += correct;
        self.total += count;
    }

    /// The mean of the per-batch mean losses.
    pub fn mean_loss(&self) -> f64 {
        if self.batches == 0 {
            return 0.;
        }

        self.loss_sum / self.batches as f64
    }

    /// The percentage of correctly classified examples over the whole epoch.
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.;
        }

        100. * self.correct as f64 / self.total as f64
    }

    pub fn correct(&self) -> usize {
        self.correct
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn batches(&self) -> usize {
        self.batches
    }
}

/// A single scalar emitted during training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub tag: String,
    pub value: f64,
    pub step: usize,
}

/// Receives the per-epoch scalars, for instance `train/loss` keyed by epoch.
pub trait ScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;
}

/// Appends every scalar as one JSON line to `<run_dir>/scalars.jsonl`.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub const FILE_NAME: &'static str = "scalars.jsonl";

    /// Opens the sink, creating `run_dir` if needed. Existing lines are kept.
    pub fn create<P: AsRef<Path>>(run_dir: P) -> Result<Self> {
        let run_dir = run_dir.as_ref();
        fs::create_dir_all(run_dir)?;

        let path = run_dir.join(Self::FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScalarSink for JsonlSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let scalar = Scalar {
            tag: tag.to_string(),
            value,
            step,
        };

        serde_json::to_writer(&mut self.writer, &scalar)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every scalar in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub scalars: Vec<Scalar>,
}

impl MemorySink {
    /// Returns the `(step, value)` pairs recorded under `tag`, in emission order.
    pub fn series(&self, tag: &str) -> Vec<(usize, f64)> {
        self.scalars
            .iter()
            .filter(|s| s.tag == tag)
            .map(|s| (s.step, s.value))
            .collect()
    }
}

impl ScalarSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.scalars.push(Scalar {
            tag: tag.to_string(),
            value,
            step,
        });
        Ok(())
    }
}

impl<S: ScalarSink + ?Sized> ScalarSink for &mut S {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        (**self).add_scalar(tag, value, step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_is_averaged_per_batch_and_accuracy_per_example() {
        let mut metrics = EpochMetrics::default();
        metrics.record(1., 3, 4);
        metrics.record(2., 0, 1);

        assert_eq!(metrics.mean_loss(), 1.5);
        assert_eq!(metrics.accuracy(), 60.);
        assert_eq!((metrics.correct(), metrics.total()), (3, 5));
    }

    #[test]
    fn empty_epochs_report_zero() {
        let metrics = EpochMetrics::default();
        assert_eq!(metrics.mean_loss(), 0.);
        assert_eq!(metrics.accuracy(), 0.);
    }

    #[test]
    fn jsonl_sink_appends_one_line_per_scalar() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::create(dir.path().join("run")).unwrap();
        sink.add_scalar("train/loss", 0.5, 0).unwrap();
        sink.add_scalar("test/acc", 42., 0).unwrap();

        let content = fs::read_to_string(sink.path()).unwrap();
        let scalars: Vec<Scalar> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(scalars.len(), 2);
        assert_eq!(scalars[1].tag, "test/acc");
        assert_eq!(scalars[1].value, 42.);
    }
}
