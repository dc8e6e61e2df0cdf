//! Batch-by-batch orchestration.
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌────────────┐   ┌──────────┐   ┌────────────┐
//! │  Lister  │──▶│ Accumulator │──▶│ Task graph │──▶│ Executor │──▶│ Extract +  │
//! │ (remote) │   │ (batch dir) │   │  builder   │   │ (extern) │   │ synthesize │
//! └──────────┘   └─────────────┘   └────────────┘   └──────────┘   └────────────┘
//!                       ▲                                                 │
//!                       └──────────── clear after relocation ─────────────┘
//! ```
//!
//! Everything here runs sequentially; the only parallelism is whatever the
//! execution backend does with the submitted graph.

use anyhow::{Context, Result};
use object_store::ObjectStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::batch::{Admission, Batch, BatchAccumulator};
use crate::config::{Config, SolverConfig};
use crate::io::{fs, ImageLister};
use crate::pipeline::Metrics;
use crate::solve::{read_capture, ConfigSynthesizer, OpticalConfig, SolverResult};
use crate::workflow::{
    SolverPaths, TaskCompletion, TaskGraphBuilder, WorkflowExecutor, CAPTURE_EXTENSION,
};

/// Output locations the driver relocates artifacts to.
#[derive(Debug, Clone)]
pub struct ArtifactDirs {
    pub workflow_path: PathBuf,
    pub config_dir: PathBuf,
    pub solutions_dir: PathBuf,
    pub modified_dir: PathBuf,
}

impl ArtifactDirs {
    fn relocation_targets(&self) -> fs::RelocationTargets {
        fs::RelocationTargets {
            config_dir: self.config_dir.clone(),
            solutions_dir: self.solutions_dir.clone(),
            modified_dir: self.modified_dir.clone(),
        }
    }
}

/// Outcome of one dispatched batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub images: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub configs: Vec<OpticalConfig>,
    pub config_failures: Vec<(String, String)>,
}

/// Drives listing, batching, solving and configuration synthesis.
pub struct PipelineDriver<E> {
    lister: ImageLister,
    accumulator: BatchAccumulator,
    builder: TaskGraphBuilder,
    executor: E,
    synthesizer: ConfigSynthesizer,
    dirs: ArtifactDirs,
    metrics: Arc<Metrics>,
}

impl<E: WorkflowExecutor> PipelineDriver<E> {
    /// Assemble a driver from its parts.
    pub fn new(
        lister: ImageLister,
        accumulator: BatchAccumulator,
        builder: TaskGraphBuilder,
        executor: E,
        synthesizer: ConfigSynthesizer,
        dirs: ArtifactDirs,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            lister,
            accumulator,
            builder,
            executor,
            synthesizer,
            dirs,
            metrics,
        }
    }

    /// Build a driver from configuration. All paths are made absolute so the
    /// generated workflow does not depend on the backend's working directory.
    pub async fn from_config(
        config: &Config,
        store: Arc<dyn ObjectStore>,
        executor: E,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let batch_dir = absolute(&config.batch.batch_dir)?;

        let paths = solver_paths(&config.solver)?;

        let dirs = ArtifactDirs {
            workflow_path: absolute(&config.workflow.path)?,
            config_dir: absolute(&config.output.config_dir)?,
            solutions_dir: absolute(&config.output.solutions_dir)?,
            modified_dir: absolute(&config.output.modified_dir)?,
        };

        let lister = ImageLister::new(store.clone(), &config.remote.prefix);
        let accumulator =
            BatchAccumulator::open(store, &batch_dir, config.batch.max_batch_size, metrics.clone())
                .await?;
        let builder = TaskGraphBuilder::new(paths, &batch_dir);
        let synthesizer =
            ConfigSynthesizer::from_template_file(&config.output.template_path, &batch_dir)
                .await
                .context("Failed to load configuration template")?;

        Ok(Self::new(
            lister,
            accumulator,
            builder,
            executor,
            synthesizer,
            dirs,
            metrics,
        ))
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Process every image in the remote collection.
    pub async fn run(&mut self) -> Result<PipelineStats> {
        let objects = self.lister.list().await?;
        let mut stats = PipelineStats {
            objects_listed: objects.len(),
            ..Default::default()
        };

        for object in &objects {
            let mut admission = self.accumulator.admit(object).await?;
            if let Admission::BatchFull { occupied } = admission {
                tracing::info!(
                    "Batch full ({} / {} bytes), dispatching {} images",
                    occupied,
                    self.accumulator.max_batch_size(),
                    self.accumulator.len()
                );
                let report = self.dispatch().await?;
                stats.record(&report);
                admission = self.accumulator.admit(object).await?;
            }

            match admission {
                Admission::Admitted { .. } => stats.images_admitted += 1,
                Admission::Rejected { .. } => stats.images_rejected += 1,
                Admission::BatchFull { occupied } => {
                    // Only possible if the directory is still full after clearing
                    tracing::warn!(
                        "Skipping {}: batch directory still holds {} bytes after dispatch",
                        object.name,
                        occupied
                    );
                    stats.images_rejected += 1;
                }
            }
        }

        if !self.accumulator.is_empty() {
            tracing::info!("Dispatching final batch of {} images", self.accumulator.len());
            let report = self.dispatch().await?;
            stats.record(&report);
        }

        tracing::info!("Run finished: {}", self.metrics.snapshot());
        Ok(stats)
    }

    /// Solve the current batch, write configurations, relocate artifacts and
    /// clear the batch directory.
    pub async fn dispatch(&mut self) -> Result<BatchReport> {
        let batch = self.accumulator.dispatch();
        let report = if batch.is_empty() {
            BatchReport::default()
        } else {
            self.solve_batch(&batch).await?
        };

        fs::relocate_artifacts(&batch.dir, &self.dirs.relocation_targets()).await?;
        self.accumulator.clear().await?;

        Ok(report)
    }

    async fn solve_batch(&self, batch: &Batch) -> Result<BatchReport> {
        let graph = self.builder.build(&batch.image_names())?;
        graph.write_to(&self.dirs.workflow_path).await?;

        let start = Instant::now();
        let completions = self
            .executor
            .execute(&graph, &self.dirs.workflow_path, &batch.dir)
            .await?;
        self.metrics.add_execute_time(start.elapsed());

        let mut report = self.process_completions(&completions).await;
        report.images = batch.len();

        tracing::info!(
            "Batch done: {} tasks succeeded, {} failed, {} configs written",
            report.tasks_succeeded,
            report.tasks_failed,
            report.configs.len()
        );
        Ok(report)
    }

    /// Extract and synthesize for every successful task with output.
    pub async fn process_completions(&self, completions: &[TaskCompletion]) -> BatchReport {
        let mut report = BatchReport::default();

        for completion in completions {
            if !completion.succeeded() {
                tracing::warn!("Solver task for {} failed: {:?}", completion.image, completion.status);
                self.metrics.add_task_failed();
                report.tasks_failed += 1;
                continue;
            }
            self.metrics.add_task_succeeded();
            report.tasks_succeeded += 1;

            if !completion.has_output() {
                tracing::debug!("No solver output for {}, skipping", completion.image);
                continue;
            }

            let result = SolverResult::parse(&completion.output);
            match self.synthesizer.synthesize(&completion.image, &result).await {
                Ok(config) => {
                    self.metrics.add_config_written();
                    report.configs.push(config);
                }
                Err(e) => {
                    tracing::warn!("No configuration for {}: {}", completion.image, e);
                    self.metrics.add_config_failure();
                    report.config_failures.push((completion.image.clone(), e.to_string()));
                }
            }
        }

        report
    }
}

/// Run extraction and synthesis over the capture files already in `dir`.
pub async fn synthesize_directory(
    dir: &Path,
    synthesizer: &ConfigSynthesizer,
    metrics: &Metrics,
) -> Result<Vec<(String, SolverResult)>> {
    let mut results = Vec::new();

    for capture in fs::files_with_extensions(dir, &[CAPTURE_EXTENSION]).await? {
        let Some(text) = read_capture(&capture).await? else {
            tracing::debug!("{} is empty, skipping", capture.display());
            continue;
        };
        let name = capture
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let result = SolverResult::parse(&text);
        match synthesizer.synthesize(&name, &result).await {
            Ok(_) => metrics.add_config_written(),
            Err(e) => {
                tracing::warn!("No configuration for {}: {}", name, e);
                metrics.add_config_failure();
            }
        }
        results.push((name, result));
    }

    Ok(results)
}

/// Solver paths from configuration, made absolute.
pub fn solver_paths(solver: &SolverConfig) -> Result<SolverPaths> {
    Ok(SolverPaths {
        solve_field: absolute(&solver.solve_field)?,
        toolset_dir: absolute(&solver.toolset_dir)?,
        backend_config: absolute(&solver.backend_config)?,
    })
}

pub(crate) fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Failed to resolve {}", path.display()))
}

/// Statistics from a pipeline run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    pub objects_listed: usize,
    pub images_admitted: usize,
    pub images_rejected: usize,
    pub batches: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub configs_written: usize,
    pub config_failures: usize,
}

impl PipelineStats {
    fn record(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.tasks_succeeded += report.tasks_succeeded;
        self.tasks_failed += report.tasks_failed;
        self.configs_written += report.configs.len();
        self.config_failures += report.config_failures.len();
    }
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Listed: {}, Admitted: {}, Rejected: {}, Batches: {}, Solved: {}, Failed: {}, Configs: {}",
            self.objects_listed,
            self.images_admitted,
            self.images_rejected,
            self.batches,
            self.tasks_succeeded,
            self.tasks_failed,
            self.configs_written
        )
    }
}
