//! Makeflow task graph generation.
//!
//! A batch becomes a flat DAG: one preamble line that puts the solver and the
//! netpbm tools on `PATH`, followed by one independent rule per image.
//!
//! ```text
//! export PATH=<solver_dir>:<toolset_dir>:$PATH
//! <stem>.out : <batch_dir>/<image> <solve-field>
//! 	<solve-field> <fixed flags> --backend-config <cfg> --overwrite <batch_dir>/<image> > <stem>.out
//!
//! ```
//!
//! Rules share no edges, so the execution backend is free to run all of them
//! at once.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension of the files stdout of each solver invocation is captured in.
pub const CAPTURE_EXTENSION: &str = "out";

/// solve-field flags used for every image, in order.
///
/// Grid search, app-per-pixel scale units bounded to [0.3, 3.0], a 600 s CPU
/// limit, and no WCS/correlation/SCAMP/PNM products.
#[rustfmt::skip]
pub const SOLVE_FIELD_FLAGS: &[&str] = &[
    "-g",
    "-u", "app",
    "-L", "0.3",
    "-p",
    "--cpulimit", "600",
    "--wcs", "none",
    "--corr", "none",
    "--scamp-ref", "none",
    "--pnm", "none",
    "-H", "3.0",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskGraphError {
    #[error("Image name is not a plain file name of [A-Za-z0-9._+-]: {0:?}")]
    InvalidImageName(String),

    #[error("Images {first:?} and {second:?} would both capture output to {capture:?}")]
    DuplicateCapture {
        first: String,
        second: String,
        capture: String,
    },
}

/// Paths of the external tools invoked by every task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolverPaths {
    /// Absolute path to solve-field
    pub solve_field: PathBuf,

    /// Absolute path to the netpbm tool directory
    pub toolset_dir: PathBuf,

    /// Absolute path to the solver backend configuration
    pub backend_config: PathBuf,
}

/// One solver invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Image file name inside the batch directory
    pub image: String,

    /// Absolute path of the image
    pub input: PathBuf,

    /// Capture file name, relative to the batch directory
    pub output: String,

    /// Shell command of the rule body, including the stdout redirect
    pub command: String,
}

/// A batch's full set of tasks plus the shared PATH preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGraph {
    pub preamble: String,
    pub solve_field: PathBuf,
    pub tasks: Vec<Task>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Render the makeflow text.
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Write the makeflow text to `path`, creating parent directories.
    pub async fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            crate::io::ensure_dir(parent).await?;
        }
        tokio::fs::write(path, self.render()).await?;
        tracing::info!("Wrote {} task makeflow to {}", self.len(), path.display());
        Ok(())
    }
}

impl fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.preamble)?;
        for task in &self.tasks {
            writeln!(
                f,
                "{} : {} {}",
                task.output,
                task.input.display(),
                self.solve_field.display()
            )?;
            writeln!(f, "\t{}", task.command)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Builds task graphs for batches in one directory.
#[derive(Debug, Clone)]
pub struct TaskGraphBuilder {
    paths: SolverPaths,
    batch_dir: PathBuf,
}

impl TaskGraphBuilder {
    pub fn new(paths: SolverPaths, batch_dir: impl Into<PathBuf>) -> Self {
        Self {
            paths,
            batch_dir: batch_dir.into(),
        }
    }

    pub fn batch_dir(&self) -> &Path {
        &self.batch_dir
    }

    /// `export PATH=...` line for the solver and toolset directories.
    pub fn preamble(&self) -> String {
        let solver_dir = self
            .paths
            .solve_field
            .parent()
            .unwrap_or_else(|| Path::new(""));
        format!(
            "export PATH={}:{}:$PATH",
            solver_dir.display(),
            self.paths.toolset_dir.display()
        )
    }

    /// Build one task per image, preserving order.
    pub fn build<S: AsRef<str>>(&self, images: &[S]) -> Result<TaskGraph, TaskGraphError> {
        let mut seen: HashSet<String> = HashSet::with_capacity(images.len());
        let mut owners: Vec<(String, String)> = Vec::with_capacity(images.len());
        let mut tasks = Vec::with_capacity(images.len());

        for image in images {
            let image = image.as_ref();
            let output = capture_name(image)?;

            if !seen.insert(output.clone()) {
                let first = owners
                    .iter()
                    .find(|(capture, _)| *capture == output)
                    .map(|(_, owner)| owner.clone())
                    .unwrap_or_default();
                return Err(TaskGraphError::DuplicateCapture {
                    first,
                    second: image.to_string(),
                    capture: output,
                });
            }
            owners.push((output.clone(), image.to_string()));

            let input = self.batch_dir.join(image);
            let command = format!(
                "{} {} --backend-config {} --overwrite {} > {}",
                self.paths.solve_field.display(),
                SOLVE_FIELD_FLAGS.join(" "),
                self.paths.backend_config.display(),
                input.display(),
                output
            );

            tasks.push(Task {
                image: image.to_string(),
                input,
                output,
                command,
            });
        }

        Ok(TaskGraph {
            preamble: self.preamble(),
            solve_field: self.paths.solve_field.clone(),
            tasks,
        })
    }
}

/// Characters that pass unquoted through both a makeflow rule and `sh -c`.
fn is_safe_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+')
}

/// Replace every character [`capture_name`] would refuse with `_`.
pub fn sanitize_image_name(name: &str) -> String {
    name.chars()
        .map(|c| if is_safe_name_char(c) { c } else { '_' })
        .collect()
}

/// Capture file name for an image: its extension replaced by `.out`.
///
/// Names are pasted into the rule and the shell command unquoted, so anything
/// outside `[A-Za-z0-9._+-]` is refused.
pub fn capture_name(image: &str) -> Result<String, TaskGraphError> {
    if !image.chars().all(is_safe_name_char) {
        return Err(TaskGraphError::InvalidImageName(image.to_string()));
    }
    let path = Path::new(image);
    match path.file_stem() {
        Some(stem) if !stem.is_empty() && path.file_name() == Some(path.as_os_str()) => {
            Ok(format!("{}.{}", stem.to_string_lossy(), CAPTURE_EXTENSION))
        }
        _ => Err(TaskGraphError::InvalidImageName(image.to_string())),
    }
}
