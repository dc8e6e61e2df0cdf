//! astrogen
//!
//! Batches FITS images from a remote collection onto local disk, plate-solves
//! each batch with `solve-field` through a Makeflow task graph, and turns the
//! solver output into per-image Astrometrica configuration files.
//!
//! # Architecture
//!
//! - **I/O**: remote listing and fetching through object_store, local
//!   directory housekeeping
//! - **Batch**: capacity-bounded accumulation of fetched images
//! - **Workflow**: Makeflow task graph generation and execution backends
//! - **Solve**: extraction of solved parameters and configuration synthesis
//! - **Pipeline**: the batch-by-batch driver and run metrics
//!
//! # Usage
//!
//! ```no_run
//! use astrogen::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"astrogen.yaml".into())?;
//!     run_pipeline(config).await?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod io;
pub mod pipeline;
pub mod solve;
pub mod workflow;

pub use batch::{Admission, BatchAccumulator};
pub use config::Config;
pub use pipeline::{Metrics, PipelineDriver, PipelineStats};
pub use solve::{ConfigSynthesizer, SolverResult};
pub use workflow::{Executor, TaskGraph, TaskGraphBuilder, WorkflowExecutor};

use anyhow::{Context, Result};
use std::path::Path;

/// Run the full pipeline with the given configuration.
pub async fn run_pipeline(config: Config) -> Result<PipelineStats> {
    config.validate()?;

    tracing::info!("Starting astrogen pipeline");
    tracing::info!("Reading images from {}", config.remote.path_display());

    let store = io::create_remote_store(&config.remote)?;
    let executor = Executor::from_config(&config.workflow);
    let metrics = Metrics::new();

    let mut driver = PipelineDriver::from_config(&config, store, executor, metrics.clone()).await?;
    let stats = driver.run().await?;

    tracing::info!("Pipeline complete: {}", stats);

    if let Some(path) = &config.processing.metrics_output_path {
        metrics.snapshot().save_to_file(path)?;
    }

    Ok(stats)
}

/// Write a task graph for the images already present in `dir`.
///
/// Images are picked by extension and sorted by name; every task reads its
/// image from `dir`.
pub async fn workflow_for_directory(config: &Config, dir: &Path, output: &Path) -> Result<TaskGraph> {
    let dir = pipeline::absolute(dir)?;
    let images: Vec<String> = io::fs::files_with_extensions(&dir, io::LOCAL_IMAGE_EXTENSIONS)
        .await?
        .iter()
        .filter_map(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect();

    if images.is_empty() {
        tracing::warn!("No images found in {}", dir.display());
    }

    let builder = TaskGraphBuilder::new(pipeline::solver_paths(&config.solver)?, &dir);
    let graph = builder
        .build(&images)
        .with_context(|| format!("Failed to build task graph for {}", dir.display()))?;
    graph.write_to(output).await?;

    Ok(graph)
}

/// Extract results from the captures in `dir` and write a configuration file
/// for each solved image to `output.config_dir`.
pub async fn extract_directory(config: &Config, dir: &Path) -> Result<Vec<(String, SolverResult)>> {
    io::ensure_dir(&config.output.config_dir).await?;
    let synthesizer =
        ConfigSynthesizer::from_template_file(&config.output.template_path, &config.output.config_dir)
            .await
            .context("Failed to load configuration template")?;

    let metrics = Metrics::new();
    let results = pipeline::synthesize_directory(dir, &synthesizer, &metrics).await?;
    tracing::info!("{}", metrics.snapshot());

    Ok(results)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
