//! Local filesystem helpers: idempotent directory creation, directory sizing,
//! and relocation of solver artifacts.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Solver byproducts moved to the solutions directory after a batch.
pub const SOLUTION_EXTENSIONS: &[&str] = &["out", "axy", "xyls", "match", "rdls", "solved"];

/// Solved images written by solve-field, moved to the modified-images directory.
pub const MODIFIED_IMAGE_EXTENSIONS: &[&str] = &["new"];

/// Image extensions picked up when generating a workflow for a local directory.
pub const LOCAL_IMAGE_EXTENSIONS: &[&str] = &["fit", "fits", "FIT", "FITS", "fts"];

/// Outcome of [`ensure_dir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirStatus {
    Created,
    AlreadyExists,
}

/// Create `path` (and parents) unless it already exists as a directory.
pub async fn ensure_dir(path: &Path) -> Result<DirStatus> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => return Ok(DirStatus::AlreadyExists),
        Ok(_) => anyhow::bail!("{} exists and is not a directory", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to stat {}", path.display()));
        }
    }

    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create directory {}", path.display()))?;
    Ok(DirStatus::Created)
}

/// Sum of the sizes of all regular files directly inside `dir`.
pub async fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for path in list_files(dir).await? {
        total += tokio::fs::metadata(&path).await?.len();
    }
    Ok(total)
}

/// Regular files directly inside `dir`, sorted by path.
pub async fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read directory {}", dir.display()))?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Files in `dir` whose extension is one of `extensions`.
pub async fn files_with_extensions(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    Ok(list_files(dir)
        .await?
        .into_iter()
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| extensions.contains(&e))
        })
        .collect())
}

/// Remove `path` if it exists. Returns whether a file was removed.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Move `src` into directory `dst_dir`, keeping its file name.
///
/// Falls back to copy + remove when a rename is not possible
/// (e.g. across filesystems).
pub async fn move_into(src: &Path, dst_dir: &Path) -> Result<PathBuf> {
    let file_name = src
        .file_name()
        .with_context(|| format!("No file name in {}", src.display()))?;
    let dst = dst_dir.join(file_name);
    if tokio::fs::try_exists(&dst).await.unwrap_or(false) {
        tracing::warn!("Replacing existing {}", dst.display());
    }

    if tokio::fs::rename(src, &dst).await.is_err() {
        tokio::fs::copy(src, &dst)
            .await
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
        tokio::fs::remove_file(src).await?;
    }
    Ok(dst)
}

/// Counts of relocated artifacts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelocationStats {
    pub configs_moved: usize,
    pub solutions_moved: usize,
    pub modified_moved: usize,
}

/// Destinations of the artifacts a batch leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationTargets {
    pub config_dir: PathBuf,
    pub solutions_dir: PathBuf,
    pub modified_dir: PathBuf,
}

/// Move generated `.cfg` files, solver byproducts and solved images out of
/// the batch directory.
pub async fn relocate_artifacts(
    batch_dir: &Path,
    targets: &RelocationTargets,
) -> Result<RelocationStats> {
    ensure_dir(&targets.config_dir).await?;
    ensure_dir(&targets.solutions_dir).await?;
    ensure_dir(&targets.modified_dir).await?;

    let mut stats = RelocationStats::default();

    for cfg in files_with_extensions(batch_dir, &["cfg"]).await? {
        move_into(&cfg, &targets.config_dir).await?;
        stats.configs_moved += 1;
    }

    for solution in files_with_extensions(batch_dir, SOLUTION_EXTENSIONS).await? {
        move_into(&solution, &targets.solutions_dir).await?;
        stats.solutions_moved += 1;
    }

    for image in files_with_extensions(batch_dir, MODIFIED_IMAGE_EXTENSIONS).await? {
        move_into(&image, &targets.modified_dir).await?;
        stats.modified_moved += 1;
    }

    tracing::debug!(
        "Relocated {} config files, {} solution files and {} solved images",
        stats.configs_moved,
        stats.solutions_moved,
        stats.modified_moved
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ensure_dir_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a").join("b");

        assert_eq!(ensure_dir(&target).await.unwrap(), DirStatus::Created);
        assert_eq!(ensure_dir(&target).await.unwrap(), DirStatus::AlreadyExists);
    }

    #[tokio::test]
    async fn test_ensure_dir_rejects_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();

        assert!(ensure_dir(&file).await.is_err());
    }

    #[tokio::test]
    async fn test_dir_size_counts_only_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.fits"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("b.fits"), vec![0u8; 50]).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("c.fits"), vec![0u8; 1000]).unwrap();

        assert_eq!(dir_size(dir.path()).await.unwrap(), 150);
    }

    #[tokio::test]
    async fn test_relocate_artifacts() {
        let dir = TempDir::new().unwrap();
        let batch = dir.path().join("batch");
        std::fs::create_dir(&batch).unwrap();
        for name in ["a.fits", "a.out", "a.axy", "a.solved", "a.new", "a.cfg", "b.cfg"] {
            std::fs::write(batch.join(name), name).unwrap();
        }

        let targets = RelocationTargets {
            config_dir: dir.path().join("config_files"),
            solutions_dir: dir.path().join("other_solution_files"),
            modified_dir: dir.path().join("modified_fits_files"),
        };
        let stats = relocate_artifacts(&batch, &targets).await.unwrap();

        assert_eq!(
            stats,
            RelocationStats {
                configs_moved: 2,
                solutions_moved: 3,
                modified_moved: 1,
            }
        );
        assert!(targets.config_dir.join("b.cfg").exists());
        assert!(targets.solutions_dir.join("a.solved").exists());
        assert!(targets.modified_dir.join("a.new").exists());
        assert!(!targets.solutions_dir.join("a.new").exists());

        // Only the image stays behind
        let remaining = list_files(&batch).await.unwrap();
        assert_eq!(remaining, vec![batch.join("a.fits")]);
    }
}
