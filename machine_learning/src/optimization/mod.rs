mod adam;
mod curvature;
mod eigen;
mod ekfac;
mod gradient_descent;
mod graft;
mod kfac;
mod optimizer;

pub use adam::Adam;
pub use curvature::{CurvatureConfig, CurvatureStats};
pub use eigen::symmetric_eigen;
pub use ekfac::Ekfac;
pub use gradient_descent::GradientDescent;
pub use graft::Graft;
pub use kfac::Kfac;
pub use optimizer::Optimizer;
