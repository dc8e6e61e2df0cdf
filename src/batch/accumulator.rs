//! Capacity-bounded local batch of fetched images.

use anyhow::{Context, Result};
use futures::StreamExt;
use object_store::ObjectStore;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::io::{fs, RemoteImageObject};
use crate::pipeline::Metrics;
use crate::workflow::sanitize_image_name;

/// An image materialized in the batch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchImage {
    /// Local file name inside the batch directory
    pub name: String,

    /// Location of the source object in the remote store
    pub source: String,

    /// Bytes written for this image
    pub bytes: u64,
}

/// A dispatched batch, handed to the task graph builder.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Directory holding the images
    pub dir: PathBuf,

    /// Admitted images, in admission order
    pub images: Vec<BatchImage>,

    /// Occupied bytes of the directory at dispatch time
    pub occupied: u64,
}

impl Batch {
    /// Local file names of the images, in admission order.
    pub fn image_names(&self) -> Vec<String> {
        self.images.iter().map(|img| img.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Result of offering an object to the accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Image stored locally. `occupied_after` may exceed the maximum: the
    /// capacity check only happens before an admission.
    Admitted {
        name: String,
        occupied_before: u64,
        occupied_after: u64,
    },

    /// The fetch failed; the object was skipped.
    Rejected { name: String, reason: String },

    /// The batch is at capacity. Nothing was fetched; dispatch and clear
    /// before offering the object again.
    BatchFull { occupied: u64 },
}

impl Admission {
    /// Bytes past `max_batch_size` after this admission, if any.
    pub fn overshoot(&self, max_batch_size: u64) -> Option<u64> {
        match self {
            Admission::Admitted { occupied_after, .. } if *occupied_after > max_batch_size => {
                Some(occupied_after - max_batch_size)
            }
            _ => None,
        }
    }
}

/// Admits fetched images into a local batch directory until it is full.
pub struct BatchAccumulator {
    store: Arc<dyn ObjectStore>,
    dir: PathBuf,
    max_batch_size: u64,
    images: Vec<BatchImage>,
    /// Capture stems handed out so far. Kept across batches so relocated
    /// `<stem>.out` and `<stem>.cfg` files never replace each other.
    stems: HashSet<String>,
    occupied: u64,
    metrics: Arc<Metrics>,
}

impl BatchAccumulator {
    /// Create an accumulator over `dir`, creating the directory if needed.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        dir: impl Into<PathBuf>,
        max_batch_size: u64,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::ensure_dir(&dir).await?;

        let occupied = fs::dir_size(&dir).await?;
        if occupied > 0 {
            tracing::warn!(
                "Batch directory {} is not empty ({} bytes), leftover files count toward the first batch",
                dir.display(),
                occupied
            );
        }

        Ok(Self {
            store,
            dir,
            max_batch_size,
            images: Vec::new(),
            stems: HashSet::new(),
            occupied,
            metrics,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_batch_size(&self) -> u64 {
        self.max_batch_size
    }

    /// Occupied bytes as of the last recomputation.
    pub fn occupied(&self) -> u64 {
        self.occupied
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Whether the next admission would be refused.
    pub fn is_full(&self) -> bool {
        self.occupied >= self.max_batch_size
    }

    /// Fetch `object` into the batch directory if there is room.
    ///
    /// Occupancy is recomputed from the directory after every attempt rather
    /// than incremented, so partially written files are accounted for.
    pub async fn admit(&mut self, object: &RemoteImageObject) -> Result<Admission> {
        if self.is_full() {
            return Ok(Admission::BatchFull {
                occupied: self.occupied,
            });
        }

        let occupied_before = self.occupied;
        let local_name = self.local_name_for(&object.name);
        let path = self.dir.join(&local_name);

        let admission = match self.fetch_to(object, &path).await {
            Ok(bytes) => {
                self.stems.insert(capture_stem(&local_name));
                self.images.push(BatchImage {
                    name: local_name.clone(),
                    source: object.location.to_string(),
                    bytes,
                });
                self.metrics.add_image_fetched(bytes);
                None
            }
            Err(e) => {
                tracing::warn!("File rejected: {}: {:#}", object.name, e);
                self.metrics.add_image_rejected();
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("Failed to remove partial file {}: {}", path.display(), e);
                    }
                }
                Some(Admission::Rejected {
                    name: object.name.clone(),
                    reason: format!("{:#}", e),
                })
            }
        };

        self.occupied = fs::dir_size(&self.dir).await?;

        Ok(admission.unwrap_or_else(|| {
            if self.occupied > self.max_batch_size {
                tracing::debug!(
                    "Admitting {} pushed batch to {} bytes (limit {})",
                    local_name,
                    self.occupied,
                    self.max_batch_size
                );
            }
            Admission::Admitted {
                name: local_name,
                occupied_before,
                occupied_after: self.occupied,
            }
        }))
    }

    /// Hand the admitted images over for processing.
    ///
    /// Files stay on disk until [`clear`](Self::clear) is called.
    pub fn dispatch(&mut self) -> Batch {
        self.metrics.add_batch_dispatched();
        Batch {
            dir: self.dir.clone(),
            images: std::mem::take(&mut self.images),
            occupied: self.occupied,
        }
    }

    /// Remove every file from the batch directory and reset occupancy.
    pub async fn clear(&mut self) -> Result<()> {
        for path in fs::list_files(&self.dir).await? {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        self.images.clear();
        self.occupied = fs::dir_size(&self.dir).await?;
        Ok(())
    }

    /// Local file name for an object: unsafe characters replaced, suffixed
    /// when its capture stem is already taken in this run.
    fn local_name_for(&self, name: &str) -> String {
        let name = sanitize_image_name(name);
        let stem = capture_stem(&name);
        if !self.stems.contains(&stem) {
            return name;
        }

        let ext = Path::new(&name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        (1..)
            .map(|n| format!("{}_{}", stem, n))
            .find(|candidate| !self.stems.contains(candidate))
            .map(|candidate| format!("{}{}", candidate, ext))
            .unwrap_or(name)
    }

    async fn fetch_to(&self, object: &RemoteImageObject, path: &Path) -> Result<u64> {
        let mut stream = object.open(self.store.as_ref()).await?;
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Read failed for {}", object.location))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

fn capture_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::path::Path as StorePath;
    use object_store::{ObjectStoreExt, PutPayload};
    use tempfile::TempDir;

    async fn put(store: &InMemory, key: &str, size: usize) -> RemoteImageObject {
        let location = StorePath::from(key);
        store
            .put(&location, PutPayload::from(vec![7u8; size]))
            .await
            .unwrap();
        RemoteImageObject {
            name: location.filename().unwrap().to_string(),
            location,
            size: size as u64,
        }
    }

    async fn accumulator(store: Arc<InMemory>, dir: &TempDir, max: u64) -> BatchAccumulator {
        BatchAccumulator::open(store, dir.path().join("fits_files"), max, Metrics::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_admit_until_full() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        let a = put(&store, "c/a.fits", 40).await;
        let b = put(&store, "c/b.fits", 40).await;
        let c = put(&store, "c/c.fits", 40).await;
        let d = put(&store, "c/d.fits", 40).await;

        let mut acc = accumulator(store, &dir, 100).await;

        for object in [&a, &b, &c] {
            match acc.admit(object).await.unwrap() {
                Admission::Admitted { occupied_before, .. } => assert!(occupied_before < 100),
                other => panic!("unexpected {:?}", other),
            }
        }

        // Third admission started at 80 < 100 and overshoots to 120
        assert_eq!(acc.occupied(), 120);
        assert!(acc.is_full());

        let refused = acc.admit(&d).await.unwrap();
        assert_eq!(refused, Admission::BatchFull { occupied: 120 });
        assert_eq!(acc.len(), 3);
    }

    #[tokio::test]
    async fn test_overshoot_is_reported_not_clamped() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        let big = put(&store, "big.fits", 500).await;

        let mut acc = accumulator(store, &dir, 100).await;
        let admission = acc.admit(&big).await.unwrap();

        assert_eq!(
            admission,
            Admission::Admitted {
                name: "big.fits".to_string(),
                occupied_before: 0,
                occupied_after: 500,
            }
        );
        assert_eq!(admission.overshoot(100), Some(400));
        assert_eq!(acc.occupied(), 500);
    }

    #[tokio::test]
    async fn test_missing_object_is_rejected_and_batch_continues() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        let good = put(&store, "good.fits", 10).await;
        let missing = RemoteImageObject {
            name: "missing.fits".to_string(),
            location: StorePath::from("missing.fits"),
            size: 10,
        };

        let mut acc = accumulator(store, &dir, 100).await;

        let rejected = acc.admit(&missing).await.unwrap();
        assert!(matches!(rejected, Admission::Rejected { ref name, .. } if name == "missing.fits"));
        assert!(!acc.dir().join("missing.fits").exists());
        assert_eq!(acc.occupied(), 0);

        assert!(matches!(acc.admit(&good).await.unwrap(), Admission::Admitted { .. }));
        assert_eq!(acc.len(), 1);
        assert_eq!(acc.metrics.snapshot().images_rejected, 1);
    }

    #[tokio::test]
    async fn test_colliding_capture_names_get_suffix() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        let fits = put(&store, "x/night.fits", 5).await;
        let arch = put(&store, "x/night.arch", 5).await;
        let again = put(&store, "y/night.fits", 5).await;

        let mut acc = accumulator(store, &dir, 1000).await;
        acc.admit(&fits).await.unwrap();
        acc.admit(&arch).await.unwrap();
        acc.admit(&again).await.unwrap();

        let batch = acc.dispatch();
        assert_eq!(
            batch.image_names(),
            vec!["night.fits", "night_1.arch", "night_2.fits"]
        );
        assert_eq!(batch.images[2].source, "y/night.fits");
    }

    #[tokio::test]
    async fn test_dispatch_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        let a = put(&store, "a.fits", 60).await;
        let b = put(&store, "b.fits", 60).await;

        let mut acc = accumulator(store, &dir, 100).await;
        acc.admit(&a).await.unwrap();
        acc.admit(&b).await.unwrap();
        assert!(acc.is_full());

        let batch = acc.dispatch();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.occupied, 120);
        assert!(acc.is_empty());

        // Files remain until cleared
        assert!(batch.dir.join("a.fits").exists());

        acc.clear().await.unwrap();
        assert_eq!(acc.occupied(), 0);
        assert!(!acc.is_full());
        assert!(!batch.dir.join("a.fits").exists());
    }

    #[tokio::test]
    async fn test_unsafe_names_are_sanitized() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        let hostile = put(&store, "c/x;touch marker;.fits", 5).await;
        let spaced = put(&store, "c/night one.fits", 5).await;

        let mut acc = accumulator(store, &dir, 1000).await;
        acc.admit(&hostile).await.unwrap();
        acc.admit(&spaced).await.unwrap();

        let batch = acc.dispatch();
        assert_eq!(
            batch.image_names(),
            vec!["x_touch_marker_.fits", "night_one.fits"]
        );
        assert!(batch.dir.join("x_touch_marker_.fits").exists());
        assert_eq!(batch.images[0].source, "c/x;touch marker;.fits");
    }

    #[tokio::test]
    async fn test_stems_stay_unique_across_batches() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        let first = put(&store, "a/frame.fits", 60).await;
        let second = put(&store, "b/frame.fits", 60).await;

        let mut acc = accumulator(store, &dir, 50).await;
        acc.admit(&first).await.unwrap();
        assert_eq!(acc.dispatch().image_names(), vec!["frame.fits"]);
        acc.clear().await.unwrap();

        acc.admit(&second).await.unwrap();
        assert_eq!(acc.dispatch().image_names(), vec!["frame_1.fits"]);
    }
}
