//! astrogen CLI
//!
//! Plate-solve remote FITS images in batches and generate Astrometrica
//! configuration files.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use astrogen::{build_runtime, extract_directory, io, run_pipeline, workflow_for_directory, Config};

#[derive(Parser)]
#[command(name = "astrogen")]
#[command(about = "Plate-solve remote FITS images and generate Astrometrica configurations", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "astrogen.yaml", global = true)]
    config: PathBuf,

    /// Override the maximum batch size in bytes
    #[arg(long, global = true)]
    max_batch_size: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run {
        /// Read images from this S3 location instead of the configured source
        #[arg(long, value_name = "s3://BUCKET/PREFIX")]
        source: Option<String>,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "astrogen.yaml")]
        output: PathBuf,
    },

    /// Write a makeflow script for the images in a local directory
    Workflow {
        /// Directory holding the images
        dir: PathBuf,

        /// Where to write the script (defaults to workflow.path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Extract solver results from the .out captures in a directory
    Extract {
        /// Directory holding the captures
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => {
            run_command(cli.config, cli.max_batch_size, None)?;
        }

        Some(Commands::Run { source }) => {
            run_command(cli.config, cli.max_batch_size, source)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }

        Some(Commands::Workflow { dir, output }) => {
            workflow_command(cli.config, dir, output)?;
        }

        Some(Commands::Extract { dir }) => {
            extract_command(cli.config, dir)?;
        }
    }

    Ok(())
}

fn run_command(config_path: PathBuf, max_batch_size: Option<u64>, source: Option<String>) -> Result<()> {
    let mut config = Config::from_file(&config_path)?;

    // Apply overrides
    if let Some(size) = max_batch_size {
        config.batch.max_batch_size = size;
    }
    if let Some(uri) = source {
        let (bucket, prefix) = io::parse_s3_uri(&uri)?;
        config.remote.bucket = Some(bucket.to_string());
        config.remote.prefix = prefix.to_string();
        config.remote.local_path = None;
    }

    config.validate()?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    let stats = runtime.block_on(async { run_pipeline(config).await })?;
    println!("{}", stats);

    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn workflow_command(config_path: PathBuf, dir: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    let output = output.unwrap_or_else(|| config.workflow.path.clone());

    let runtime = build_runtime(Some(1))?;
    let graph = runtime.block_on(workflow_for_directory(&config, &dir, &output))?;
    println!("Wrote {} tasks to {}", graph.len(), output.display());

    Ok(())
}

fn extract_command(config_path: PathBuf, dir: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;

    let runtime = build_runtime(Some(1))?;
    let results = runtime.block_on(extract_directory(&config, &dir))?;

    for (name, result) in &results {
        println!("{}: {}", name, serde_json::to_string(result)?);
    }

    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# astrogen Configuration

# === REMOTE: Where to list and fetch images from ===
# Choose ONE of: local_path (local disk) OR bucket (S3)
remote:
  # Option 1: Read from a local directory
  # local_path: "/data/images"

  # Option 2: Read from S3
  bucket: "iplant"

  # Key prefix of the image collection. Only .fits and .arch objects are used.
  prefix: "astrometry/test_fits"

  # AWS region of the bucket
  region: "us-west-2"

  # Send unsigned requests (public buckets)
  anonymous: false

  # Custom S3 endpoint (for LocalStack, MinIO, etc.)
  # endpoint_url: "http://localhost:4566"

  # Transport retries per request. 0 reports a failed fetch immediately and
  # the image is skipped.
  max_retries: 0

# === BATCH: Local staging of fetched images ===
batch:
  # A batch is dispatched once the directory holds at least this many bytes.
  # The image that crosses the limit is still admitted.
  max_batch_size: 102400

  # Directory images are fetched into. Emptied after every batch.
  batch_dir: "resources/fits_files"

# === SOLVER: astrometry.net installation ===
solver:
  solve_field: "/opt/astrometry.net-0.50/blind/solve-field"

  # netpbm tools used by solve-field for image conversion
  toolset_dir: "/opt/netpbm/bin"

  # Passed as --backend-config
  backend_config: "resources/astrometry.cfg"

# === WORKFLOW: Task graph generation and execution ===
workflow:
  # Where the makeflow script is written (overwritten for every batch)
  path: "output/makeflows/output.mf"

  # makeflow (Work Queue) or local (sequential sh -c)
  executor: makeflow

  # makeflow binary (name on PATH or absolute path)
  makeflow: "makeflow"

  # Work Queue project name workers connect to
  project_name: "SONORAN"

  # Optional makeflow --wrapper command
  # wrapper: "source /etc/profile.d/modules.sh"

  # Optional command run before every makeflow invocation to start workers
  # submit_workers: "pbs_submit_workers -N SONORAN 20"

# === OUTPUT: Generated configuration files ===
output:
  # Astrometrica template; FocalLength and PA lines are rewritten per image
  template_path: "resources/template.cfg"

  # Destination of <image>.cfg files
  config_dir: "output/config_files"

  # Destination of solver byproducts (.out, .axy, .xyls, .match, ...)
  solutions_dir: "output/other_solution_files"

  # Destination of the solved images (.new, FITS with the WCS header)
  modified_dir: "output/modified_fits_files"

# === PROCESSING ===
processing:
  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 4

  # Save run metrics as JSON
  # metrics_output_path: "output/metrics.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
