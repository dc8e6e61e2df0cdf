//! Listing and streaming of remote image objects.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::{BoxStream, TryStreamExt};
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt};
use std::sync::Arc;

/// Extensions of remote objects worth fetching (compared case-insensitively).
pub const REMOTE_IMAGE_EXTENSIONS: &[&str] = &["fits", "arch"];

/// An image object in the remote collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteImageObject {
    /// File name (last path segment)
    pub name: String,

    /// Full location inside the store
    pub location: Path,

    /// Size in bytes as reported by the listing
    pub size: u64,
}

impl RemoteImageObject {
    /// Open the object as a stream of byte chunks.
    pub async fn open(
        &self,
        store: &dyn ObjectStore,
    ) -> Result<BoxStream<'static, object_store::Result<Bytes>>> {
        let result = store
            .get(&self.location)
            .await
            .with_context(|| format!("Failed to open remote object {}", self.location))?;
        Ok(result.into_stream())
    }
}

/// Whether a remote object name carries an accepted image extension.
pub fn is_remote_image(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    REMOTE_IMAGE_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{}", ext)))
}

/// Lists image objects under a prefix of an object store.
pub struct ImageLister {
    store: Arc<dyn ObjectStore>,
    prefix: Option<Path>,
}

impl ImageLister {
    /// Create a lister for `prefix` (empty means the store root).
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        let prefix = (!prefix.is_empty()).then(|| Path::from(prefix));
        Self { store, prefix }
    }

    /// The store objects are listed from.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// List all image objects, sorted by location.
    ///
    /// Listing order from object stores is unspecified, so results are sorted
    /// to keep batch composition reproducible between runs.
    pub async fn list(&self) -> Result<Vec<RemoteImageObject>> {
        let metas: Vec<_> = self
            .store
            .list(self.prefix.as_ref())
            .try_collect()
            .await
            .context("Failed to list remote image collection")?;

        let total = metas.len();
        let mut objects: Vec<RemoteImageObject> = metas
            .into_iter()
            .filter_map(|meta| {
                let name = meta.location.filename()?.to_string();
                is_remote_image(&name).then(|| RemoteImageObject {
                    name,
                    location: meta.location,
                    size: meta.size,
                })
            })
            .collect();

        objects.sort_by(|a, b| a.location.as_ref().cmp(b.location.as_ref()));

        tracing::info!(
            "Listed {} image objects ({} skipped by extension)",
            objects.len(),
            total - objects.len()
        );

        Ok(objects)
    }
}
