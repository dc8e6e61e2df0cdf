//! Pipeline orchestration and run metrics.

mod driver;
mod metrics;

#[cfg(test)]
mod driver_integration_tests;

pub use driver::{
    solver_paths, synthesize_directory, ArtifactDirs, BatchReport, PipelineDriver, PipelineStats,
};
pub(crate) use driver::absolute;
pub use metrics::{Metrics, MetricsSnapshot};
