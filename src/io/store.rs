//! Object store configuration for S3 and local filesystem access.

use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RemoteConfig;

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
///
/// # Errors
/// Returns an error if the URI is malformed (missing scheme, bucket, or key).
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))?;

    without_scheme
        .split_once('/')
        .with_context(|| format!("Invalid S3 URI: expected 's3://bucket/key' format in '{}'", uri))
}

/// Client options for long single-object downloads.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        // FITS files can be large, allow a generous per-request budget
        .with_timeout(Duration::from_secs(300))
        .with_pool_idle_timeout(Duration::from_secs(90))
}

/// Retry configuration. `max_retries` of zero means a failed request surfaces
/// immediately as a fetch error.
fn create_retry_config(max_retries: usize) -> RetryConfig {
    RetryConfig {
        max_retries,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an S3 client for the image bucket.
///
/// Credentials and region are loaded from the environment unless `anonymous`
/// is set, in which case requests are sent unsigned.
pub fn create_s3_store(bucket: &str, remote: &RemoteConfig) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!(
        "Creating {} S3 client for bucket: {}",
        if remote.anonymous { "anonymous" } else { "authenticated" },
        bucket
    );

    let mut builder = if remote.anonymous {
        AmazonS3Builder::new().with_skip_signature(true)
    } else {
        AmazonS3Builder::from_env()
    };

    builder = builder
        .with_bucket_name(bucket)
        .with_region(&remote.region)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config(remote.max_retries));

    if let Some(endpoint) = &remote.endpoint_url {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"))
            .with_virtual_hosted_style_request(false);
    }

    Ok(Arc::new(builder.build()?))
}

/// Create the store images are listed and fetched from.
/// Uses LocalFileSystem if local_path is set, otherwise S3.
pub fn create_remote_store(remote: &RemoteConfig) -> Result<Arc<dyn ObjectStore>> {
    match (&remote.local_path, &remote.bucket) {
        (Some(local_path), _) => {
            let path = std::path::Path::new(local_path);
            tracing::info!("Creating LocalFileSystem store at: {}", path.display());
            let store = LocalFileSystem::new_with_prefix(path)
                .with_context(|| format!("Failed to open local image store at {}", path.display()))?;
            Ok(Arc::new(store))
        }
        (_, Some(bucket)) => create_s3_store(bucket, remote),
        _ => anyhow::bail!("Invalid config: no remote image source"),
    }
}
