mod driver;
mod metrics;
mod schedule;

pub use driver::{BestState, DriverState, EpochDriver, StepCounters};
pub use metrics::{EpochMetrics, JsonlSink, MemorySink, Scalar, ScalarSink};
pub use schedule::MultiStepLr;
