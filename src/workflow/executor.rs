//! Execution backends for task graphs.
//!
//! A backend runs every task of a [`TaskGraph`] and reports one
//! [`TaskCompletion`] per task: the exit status it observed plus whatever the
//! task captured on stdout. Callers never have to infer completion from the
//! filesystem themselves.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::task_graph::{Task, TaskGraph};
use crate::config::{ExecutorKind, WorkflowConfig};
use crate::io::fs;

/// Final state of one task as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    /// The task ran and failed. `exit_code` is `None` when the backend does
    /// not expose it or the process was killed by a signal.
    Failed { exit_code: Option<i32> },
    /// The backend finished without ever running the task.
    NotRun,
}

/// Status and captured stdout of a finished task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCompletion {
    /// Image the task solved
    pub image: String,

    /// Path of the capture file
    pub output_path: PathBuf,

    pub status: TaskStatus,

    /// Captured solver stdout (empty if nothing was written)
    pub output: String,
}

impl TaskCompletion {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    /// Whether the capture holds anything to parse.
    pub fn has_output(&self) -> bool {
        !self.output.trim().is_empty()
    }
}

/// Runs a task graph to completion.
pub trait WorkflowExecutor {
    /// Execute `graph`, whose makeflow text has been written to
    /// `workflow_path`, with `workdir` as the working directory of every task.
    fn execute(
        &self,
        graph: &TaskGraph,
        workflow_path: &Path,
        workdir: &Path,
    ) -> impl Future<Output = Result<Vec<TaskCompletion>>> + Send;
}

/// Read a task's capture file; a missing file reads as empty.
async fn read_capture(workdir: &Path, task: &Task) -> Result<(PathBuf, String)> {
    let path = workdir.join(&task.output);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok((path, String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((path, String::new())),
        Err(e) => Err(e).with_context(|| format!("Failed to read capture {}", path.display())),
    }
}

/// Runs tasks one after another with `sh -c` on this machine.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl WorkflowExecutor for ShellExecutor {
    async fn execute(
        &self,
        graph: &TaskGraph,
        _workflow_path: &Path,
        workdir: &Path,
    ) -> Result<Vec<TaskCompletion>> {
        let mut completions = Vec::with_capacity(graph.len());

        for task in &graph.tasks {
            let script = format!("{}\n{}", graph.preamble, task.command);
            let status = match Command::new("sh")
                .arg("-c")
                .arg(&script)
                .current_dir(workdir)
                .status()
                .await
            {
                Ok(exit) if exit.success() => TaskStatus::Succeeded,
                Ok(exit) => TaskStatus::Failed {
                    exit_code: exit.code(),
                },
                Err(e) => {
                    tracing::warn!("Failed to spawn task for {}: {}", task.image, e);
                    TaskStatus::NotRun
                }
            };

            let (output_path, output) = read_capture(workdir, task).await?;
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

/// Makeflow node states as written to the transaction log.
const NODE_COMPLETE: u8 = 2;
const NODE_FAILED: u8 = 3;
const NODE_ABORTED: u8 = 4;

/// Submits the graph to makeflow with the Work Queue batch system.
#[derive(Debug, Clone)]
pub struct MakeflowExecutor {
    makeflow: String,
    project_name: String,
    wrapper: Option<String>,
    submit_workers: Option<String>,
}

impl MakeflowExecutor {
    pub fn new(config: &WorkflowConfig) -> Self {
        Self {
            makeflow: config.makeflow.clone(),
            project_name: config.project_name.clone(),
            wrapper: config.wrapper.clone(),
            submit_workers: config.submit_workers.clone(),
        }
    }

    /// Arguments passed to `makeflow` for `workflow_path`.
    pub fn makeflow_args(&self, workflow_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(),
            "wq".to_string(),
            "-a".to_string(),
            "-N".to_string(),
            self.project_name.clone(),
        ];
        if let Some(wrapper) = &self.wrapper {
            args.push("--wrapper".to_string());
            args.push(wrapper.clone());
        }
        args.push(workflow_path.display().to_string());
        args
    }

    async fn submit_workers(&self) -> Result<()> {
        let Some(cmd) = &self.submit_workers else {
            return Ok(());
        };
        tracing::info!("Submitting workers: {}", cmd);
        let status = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .await
            .context("Failed to run worker submission command")?;
        if !status.success() {
            anyhow::bail!("Worker submission exited with {}", status);
        }
        Ok(())
    }
}

impl WorkflowExecutor for MakeflowExecutor {
    async fn execute(
        &self,
        graph: &TaskGraph,
        workflow_path: &Path,
        workdir: &Path,
    ) -> Result<Vec<TaskCompletion>> {
        // makeflow appends to its logs; states left by an earlier batch on the
        // same script path must not be read as this run's.
        for stale in [makeflow_log_path(workflow_path), makeflow_batchlog_path(workflow_path)] {
            if fs::remove_file_if_exists(&stale).await? {
                tracing::debug!("Removed previous log {}", stale.display());
            }
        }

        self.submit_workers().await?;

        tracing::info!(
            "Running makeflow project {} on {} ({} tasks)",
            self.project_name,
            workflow_path.display(),
            graph.len()
        );
        let exit = Command::new(&self.makeflow)
            .args(self.makeflow_args(workflow_path))
            .current_dir(workdir)
            .status()
            .await
            .with_context(|| format!("Failed to run {}", self.makeflow))?;
        if !exit.success() {
            tracing::warn!("makeflow exited with {}", exit);
        }

        let log_path = makeflow_log_path(workflow_path);
        let node_states = match tokio::fs::read_to_string(&log_path).await {
            Ok(log) => Some(parse_makeflow_log(&log)),
            Err(e) => {
                tracing::warn!("No makeflow log at {}: {}", log_path.display(), e);
                None
            }
        };

        let mut completions = Vec::with_capacity(graph.len());
        for (node_id, task) in graph.tasks.iter().enumerate() {
            let status = match &node_states {
                Some(states) => {
                    node_status(states.get(&node_id).copied(), exit.success(), exit.code())
                }
                None if exit.success() => TaskStatus::Succeeded,
                None => TaskStatus::Failed {
                    exit_code: exit.code(),
                },
            };

            let (output_path, output) = read_capture(workdir, task).await?;
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

/// Status of one node from its last logged state and makeflow's exit.
///
/// A node without a terminal state only counts as not run when makeflow
/// itself succeeded; otherwise the run's failure is attributed to it.
fn node_status(state: Option<u8>, exit_ok: bool, exit_code: Option<i32>) -> TaskStatus {
    match state {
        Some(NODE_COMPLETE) => TaskStatus::Succeeded,
        Some(NODE_FAILED) | Some(NODE_ABORTED) => TaskStatus::Failed { exit_code: None },
        _ if exit_ok => TaskStatus::NotRun,
        _ => TaskStatus::Failed { exit_code },
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the transaction log makeflow writes next to the script.
pub fn makeflow_log_path(workflow_path: &Path) -> PathBuf {
    with_suffix(workflow_path, ".makeflowlog")
}

/// Path of the batch-system log makeflow writes next to the script.
pub fn makeflow_batchlog_path(workflow_path: &Path) -> PathBuf {
    with_suffix(workflow_path, ".batchlog")
}

/// Last recorded state of every node in a makeflow transaction log.
///
/// State lines read `<timestamp> <node_id> <new_state> <job_id> ...`; comment
/// lines start with `#`. Node ids follow rule order in the script.
pub fn parse_makeflow_log(log: &str) -> HashMap<usize, u8> {
    let mut states = HashMap::new();
    for line in log.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace().skip(1);
        let (Some(node), Some(state)) = (fields.next(), fields.next()) else {
            continue;
        };
        if let (Ok(node), Ok(state)) = (node.parse::<usize>(), state.parse::<u8>()) {
            states.insert(node, state);
        }
    }
    states
}

/// Backend selected by configuration.
#[derive(Debug, Clone)]
pub enum Executor {
    Makeflow(MakeflowExecutor),
    Shell(ShellExecutor),
}

impl Executor {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        match config.executor {
            ExecutorKind::Makeflow => Executor::Makeflow(MakeflowExecutor::new(config)),
            ExecutorKind::Local => Executor::Shell(ShellExecutor),
        }
    }
}

impl WorkflowExecutor for Executor {
    async fn execute(
        &self,
        graph: &TaskGraph,
        workflow_path: &Path,
        workdir: &Path,
    ) -> Result<Vec<TaskCompletion>> {
        match self {
            Executor::Makeflow(inner) => inner.execute(graph, workflow_path, workdir).await,
            Executor::Shell(inner) => inner.execute(graph, workflow_path, workdir).await,
        }
    }
}
