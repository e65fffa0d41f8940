mod kind;
mod resolver;
mod scheduler;

pub use kind::{GraftPart, OptimizerKind};
pub use resolver::{ResolvedOptimizer, resolve};
pub use scheduler::CurvatureScheduler;
