//! End-to-end tests for the pipeline driver.
//!
//! Images come from an in-memory object store and the execution backend is
//! replaced by a stub that writes canned solver output, so the whole
//! list/admit/dispatch/extract/synthesize/relocate loop runs without the
//! solver or makeflow installed.

use super::driver::{ArtifactDirs, PipelineDriver};
use super::Metrics;
use crate::batch::BatchAccumulator;
use crate::io::ImageLister;
use crate::solve::ConfigSynthesizer;
use crate::workflow::{SolverPaths, TaskCompletion, TaskGraph, TaskGraphBuilder, TaskStatus, WorkflowExecutor};
use anyhow::Result;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const TEMPLATE: &str = "[Telescope]\nFocalLength=1000\nPA=0\nVarPA=0.5\n";

const SOLVED: &str = "\
  log-odds ratio 113.642 (2.25997e+49), 19 match, 0 conflict, 67 distractors, 32 index.
  RA,Dec = (358.242,64.0045), pixel scale 2.0 arcsec/pix.
Field center: (RA H:M:S, Dec D:M:S) = (23:52:58.233, +64:00:14.433).
Field rotation angle: up is -152.913 degrees E of N
";

/// Writes canned captures instead of running the solver.
///
/// Images whose name contains `fail` report a failed task; `unsolved` ones
/// succeed with an empty capture; `noscale` ones produce output without a
/// pixel scale.
#[derive(Default, Clone)]
struct StubExecutor {
    batches: Arc<Mutex<Vec<Vec<String>>>>,
}

impl StubExecutor {
    fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

impl WorkflowExecutor for StubExecutor {
    async fn execute(
        &self,
        graph: &TaskGraph,
        workflow_path: &Path,
        workdir: &Path,
    ) -> Result<Vec<TaskCompletion>> {
        assert!(workflow_path.exists(), "workflow must be written before execution");
        {
            let mut batches = self.batches.lock().unwrap();
            batches.push(graph.tasks.iter().map(|t| t.image.clone()).collect());
        }

        let mut completions = Vec::new();
        for task in &graph.tasks {
            let (status, output) = if task.image.contains("fail") {
                (TaskStatus::Failed { exit_code: Some(1) }, String::new())
            } else if task.image.contains("unsolved") {
                (TaskStatus::Succeeded, String::new())
            } else if task.image.contains("noscale") {
                (
                    TaskStatus::Succeeded,
                    "Field rotation angle: up is 3.0 degrees E of N\n".to_string(),
                )
            } else {
                (TaskStatus::Succeeded, SOLVED.to_string())
            };

            let output_path = workdir.join(&task.output);
            tokio::fs::write(&output_path, &output).await?;
            // Solver byproducts that must be relocated with the capture
            let stem = task.output.trim_end_matches(".out");
            tokio::fs::write(workdir.join(format!("{}.axy", stem)), b"axy").await?;
            if output == SOLVED {
                tokio::fs::write(workdir.join(format!("{}.new", stem)), b"new").await?;
            }

            completions.push(TaskCompletion {
                image: task.image.clone(),
                output_path,
                status,
                output,
            });
        }
        Ok(completions)
    }
}

struct Fixture {
    _root: TempDir,
    batch_dir: PathBuf,
    dirs: ArtifactDirs,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let base = root.path().to_path_buf();
        Self {
            batch_dir: base.join("fits_files"),
            dirs: ArtifactDirs {
                workflow_path: base.join("output.mf"),
                config_dir: base.join("config_files"),
                solutions_dir: base.join("other_solution_files"),
                modified_dir: base.join("modified_fits_files"),
            },
            _root: root,
        }
    }

    async fn driver(
        &self,
        store: Arc<InMemory>,
        max_batch_size: u64,
        executor: &StubExecutor,
    ) -> PipelineDriver<StubExecutor> {
        let metrics = Metrics::new();
        let store: Arc<dyn ObjectStore> = store;
        let accumulator =
            BatchAccumulator::open(store.clone(), &self.batch_dir, max_batch_size, metrics.clone())
                .await
                .unwrap();
        let builder = TaskGraphBuilder::new(
            SolverPaths {
                solve_field: PathBuf::from("/opt/astrometry/bin/solve-field"),
                toolset_dir: PathBuf::from("/opt/netpbm/bin"),
                backend_config: PathBuf::from("/opt/astrometry/astrometry.cfg"),
            },
            &self.batch_dir,
        );

        PipelineDriver::new(
            ImageLister::new(store, "night1"),
            accumulator,
            builder,
            executor.clone(),
            ConfigSynthesizer::new(TEMPLATE, &self.batch_dir),
            self.dirs.clone(),
            metrics,
        )
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

async fn put(store: &InMemory, key: &str, size: usize) {
    store
        .put(&StorePath::from(key), PutPayload::from(vec![1u8; size]))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_run_batches_by_capacity_and_writes_configs() {
    let fixture = Fixture::new();
    let store = Arc::new(InMemory::new());
    put(&store, "night1/a.fits", 600).await;
    put(&store, "night1/b.fits", 600).await;
    put(&store, "night1/c.fits", 600).await;
    put(&store, "night1/readme.txt", 10).await;
    put(&store, "night2/d.fits", 600).await;

    let executor = StubExecutor::default();
    let mut driver = fixture.driver(store, 1000, &executor).await;
    let stats = driver.run().await.unwrap();

    // a fits, b overshoots, c waits for the next batch
    assert_eq!(
        executor.batches(),
        vec![
            vec!["a.fits".to_string(), "b.fits".to_string()],
            vec!["c.fits".to_string()],
        ]
    );

    assert_eq!(stats.objects_listed, 3);
    assert_eq!(stats.images_admitted, 3);
    assert_eq!(stats.batches, 2);
    assert_eq!(stats.tasks_succeeded, 3);
    assert_eq!(stats.configs_written, 3);

    assert_eq!(
        Fixture::files_in(&fixture.dirs.config_dir),
        vec!["a.cfg", "b.cfg", "c.cfg"]
    );
    assert_eq!(
        Fixture::files_in(&fixture.dirs.solutions_dir),
        vec!["a.axy", "a.out", "b.axy", "b.out", "c.axy", "c.out"]
    );
    assert_eq!(
        Fixture::files_in(&fixture.dirs.modified_dir),
        vec!["a.new", "b.new", "c.new"]
    );
    assert!(Fixture::files_in(&fixture.batch_dir).is_empty());

    let cfg = std::fs::read_to_string(fixture.dirs.config_dir.join("a.cfg")).unwrap();
    assert_eq!(cfg, "[Telescope]\nFocalLength=3093.975\nPA=-152.913\nVarPA=0.5\n");

    let snapshot = driver.metrics().snapshot();
    assert_eq!(snapshot.batches_dispatched, 2);
    assert_eq!(snapshot.images_fetched, 3);
    assert_eq!(snapshot.bytes_fetched, 1800);
}

#[tokio::test]
async fn test_run_skips_failed_and_empty_tasks() {
    let fixture = Fixture::new();
    let store = Arc::new(InMemory::new());
    put(&store, "night1/good.fits", 10).await;
    put(&store, "night1/fail.fits", 10).await;
    put(&store, "night1/unsolved.fits", 10).await;
    put(&store, "night1/noscale.fits", 10).await;

    let executor = StubExecutor::default();
    let mut driver = fixture.driver(store, 1024 * 1024, &executor).await;
    let stats = driver.run().await.unwrap();

    assert_eq!(stats.batches, 1);
    assert_eq!(stats.tasks_succeeded, 3);
    assert_eq!(stats.tasks_failed, 1);
    assert_eq!(stats.configs_written, 1);
    assert_eq!(stats.config_failures, 1);

    assert_eq!(Fixture::files_in(&fixture.dirs.config_dir), vec!["good.cfg"]);

    let snapshot = driver.metrics().snapshot();
    assert_eq!(snapshot.tasks_failed, 1);
    assert_eq!(snapshot.config_failures, 1);
}

#[tokio::test]
async fn test_run_with_no_images_dispatches_nothing() {
    let fixture = Fixture::new();
    let store = Arc::new(InMemory::new());

    let executor = StubExecutor::default();
    let mut driver = fixture.driver(store, 1000, &executor).await;
    let stats = driver.run().await.unwrap();

    assert_eq!(stats.objects_listed, 0);
    assert_eq!(stats.batches, 0);
    assert!(executor.batches().is_empty());
    assert!(!fixture.dirs.workflow_path.exists());
}

#[tokio::test]
async fn test_colliding_stems_are_suffixed() {
    let fixture = Fixture::new();
    let store = Arc::new(InMemory::new());
    put(&store, "night1/a/frame.fits", 10).await;
    put(&store, "night1/b/frame.fits", 10).await;

    let executor = StubExecutor::default();
    let mut driver = fixture.driver(store, 1024 * 1024, &executor).await;
    let stats = driver.run().await.unwrap();

    assert_eq!(
        executor.batches(),
        vec![vec!["frame.fits".to_string(), "frame_1.fits".to_string()]]
    );
    assert_eq!(stats.configs_written, 2);
    assert_eq!(
        Fixture::files_in(&fixture.dirs.config_dir),
        vec!["frame.cfg", "frame_1.cfg"]
    );
}

#[tokio::test]
async fn test_colliding_stems_in_separate_batches_keep_both_outputs() {
    let fixture = Fixture::new();
    let store = Arc::new(InMemory::new());
    put(&store, "night1/a/frame.fits", 600).await;
    put(&store, "night1/b/frame.fits", 600).await;

    let executor = StubExecutor::default();
    let mut driver = fixture.driver(store, 500, &executor).await;
    let stats = driver.run().await.unwrap();

    assert_eq!(
        executor.batches(),
        vec![vec!["frame.fits".to_string()], vec!["frame_1.fits".to_string()]]
    );
    assert_eq!(stats.batches, 2);
    assert_eq!(stats.configs_written, 2);
    assert_eq!(
        Fixture::files_in(&fixture.dirs.config_dir),
        vec!["frame.cfg", "frame_1.cfg"]
    );
    assert_eq!(
        Fixture::files_in(&fixture.dirs.solutions_dir),
        vec!["frame.axy", "frame.out", "frame_1.axy", "frame_1.out"]
    );
    assert_eq!(
        Fixture::files_in(&fixture.dirs.modified_dir),
        vec!["frame.new", "frame_1.new"]
    );
}

#[tokio::test]
async fn test_workflow_file_holds_last_batch() {
    let fixture = Fixture::new();
    let store = Arc::new(InMemory::new());
    put(&store, "night1/a.fits", 600).await;
    put(&store, "night1/b.fits", 600).await;

    let executor = StubExecutor::default();
    let mut driver = fixture.driver(store, 500, &executor).await;
    driver.run().await.unwrap();

    assert_eq!(executor.batches().len(), 2);
    let workflow = std::fs::read_to_string(&fixture.dirs.workflow_path).unwrap();
    assert!(workflow.starts_with("export PATH=/opt/astrometry/bin:/opt/netpbm/bin:$PATH\n"));
    assert!(workflow.contains("b.out :"));
    assert!(!workflow.contains("a.out :"));
}
