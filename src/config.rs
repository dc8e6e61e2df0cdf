//! Configuration for the astrogen pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the astrometry pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the images are listed and fetched from
    pub remote: RemoteConfig,

    /// Local batching configuration
    #[serde(default)]
    pub batch: BatchConfig,

    /// Plate solver paths
    pub solver: SolverConfig,

    /// Workflow generation and execution
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Generated configuration files and relocated artifacts
    pub output: OutputConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Remote image source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Local filesystem directory to read images from.
    /// Mutually exclusive with bucket.
    #[serde(default)]
    pub local_path: Option<String>,

    /// S3 bucket holding the images
    #[serde(default)]
    pub bucket: Option<String>,

    /// Key prefix of the image collection inside the store
    #[serde(default)]
    pub prefix: String,

    /// AWS region of the bucket
    #[serde(default = "default_region")]
    pub region: String,

    /// Skip request signing (public buckets)
    #[serde(default)]
    pub anonymous: bool,

    /// Custom S3 endpoint (MinIO, LocalStack, ...)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Transport-level retries for store requests. Zero disables retrying.
    #[serde(default)]
    pub max_retries: usize,
}

impl RemoteConfig {
    /// Get the source as a display string (local path or s3:// URI).
    pub fn path_display(&self) -> String {
        if let Some(path) = &self.local_path {
            format!("{}/{}", path.trim_end_matches('/'), self.prefix)
        } else {
            format!("s3://{}/{}", self.bucket.as_deref().unwrap_or(""), self.prefix)
        }
    }
}

/// Local batch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum occupied bytes of a batch before it is dispatched
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u64,

    /// Directory the batch is materialized in
    #[serde(default = "default_batch_dir")]
    pub batch_dir: PathBuf,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            batch_dir: default_batch_dir(),
        }
    }
}

/// Plate solver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Path to the solve-field executable
    pub solve_field: PathBuf,

    /// Directory of the netpbm image conversion tools
    pub toolset_dir: PathBuf,

    /// Backend configuration file passed via --backend-config
    #[serde(default = "default_backend_config")]
    pub backend_config: PathBuf,
}

/// Which backend runs the generated task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Makeflow with a Work Queue worker pool
    Makeflow,
    /// Sequential `sh -c` execution on this machine
    Local,
}

/// Workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Where the generated makeflow script is written
    #[serde(default = "default_workflow_path")]
    pub path: PathBuf,

    /// Execution backend
    #[serde(default = "default_executor")]
    pub executor: ExecutorKind,

    /// makeflow executable, looked up on PATH unless absolute
    #[serde(default = "default_makeflow")]
    pub makeflow: String,

    /// Work Queue project name
    #[serde(default = "default_project_name")]
    pub project_name: String,

    /// Optional makeflow --wrapper command (e.g. a module init script)
    #[serde(default)]
    pub wrapper: Option<String>,

    /// Optional shell command run before makeflow to submit workers
    #[serde(default)]
    pub submit_workers: Option<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            path: default_workflow_path(),
            executor: default_executor(),
            makeflow: default_makeflow(),
            project_name: default_project_name(),
            wrapper: None,
            submit_workers: None,
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Astrometrica configuration template
    pub template_path: PathBuf,

    /// Destination of generated .cfg files
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Destination of solver byproducts
    #[serde(default = "default_solutions_dir")]
    pub solutions_dir: PathBuf,

    /// Destination of the solved images (`.new`, carrying the WCS header)
    #[serde(default = "default_modified_dir")]
    pub modified_dir: PathBuf,
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            metrics_output_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        match (&self.remote.local_path, &self.remote.bucket) {
            (Some(_), Some(_)) => {
                anyhow::bail!("Cannot specify both remote.local_path and remote.bucket");
            }
            (None, None) => {
                anyhow::bail!("Must specify either remote.local_path or remote.bucket");
            }
            _ => {}
        }

        if self.batch.max_batch_size == 0 {
            anyhow::bail!("max_batch_size must be > 0");
        }
        if self.solver.solve_field.as_os_str().is_empty() {
            anyhow::bail!("solver.solve_field must be set");
        }
        if self.output.template_path.as_os_str().is_empty() {
            anyhow::bail!("output.template_path must be set");
        }
        if self.workflow.makeflow.trim().is_empty() {
            anyhow::bail!("workflow.makeflow must not be empty");
        }
        if self.workflow.project_name.trim().is_empty() {
            anyhow::bail!("workflow.project_name must not be empty");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_region() -> String { "us-west-2".to_string() }
fn default_max_batch_size() -> u64 { 100 * 1024 }
fn default_batch_dir() -> PathBuf { PathBuf::from("resources/fits_files") }
fn default_backend_config() -> PathBuf { PathBuf::from("resources/astrometry.cfg") }
fn default_workflow_path() -> PathBuf { PathBuf::from("output/makeflows/output.mf") }
fn default_executor() -> ExecutorKind { ExecutorKind::Makeflow }
fn default_makeflow() -> String { "makeflow".to_string() }
fn default_project_name() -> String { "SONORAN".to_string() }
fn default_config_dir() -> PathBuf { PathBuf::from("output/config_files") }
fn default_solutions_dir() -> PathBuf { PathBuf::from("output/other_solution_files") }
fn default_modified_dir() -> PathBuf { PathBuf::from("output/modified_fits_files") }
