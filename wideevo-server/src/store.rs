//! Filesystem input/output and the in-memory batch registry.

use crate::pipeline::{BatchOutcome, EncodedPhoto};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use glob::glob;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Expand `patterns` (plain paths or globs) into `(file name, bytes)` inputs,
/// in argument order. Missing or unreadable files are skipped with a warning.
pub async fn collect_inputs(patterns: &[String]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let matched: Vec<PathBuf> = glob(pattern)
            .with_context(|| format!("evaluating glob {pattern}"))?
            .flatten()
            .collect();
        if matched.is_empty() {
            tracing::warn!(pattern = %pattern, "no file matches, skipping");
        }
        paths.extend(matched);
    }

    let mut inputs = Vec::with_capacity(paths.len());
    for path in paths {
        if !path.is_file() {
            continue;
        }
        match fs::read(&path).await {
            Ok(bytes) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                inputs.push((name, bytes));
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "unreadable input, skipping"),
        }
    }
    tracing::info!(total = inputs.len(), "inputs collected");
    Ok(inputs)
}

/// Write each photo to `dir/<filename>` (tmp file + rename). Creates `dir`.
/// Fails before writing anything if one of the names is already taken.
pub async fn save_outputs(dir: &Path, photos: &[EncodedPhoto]) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating output directory {}", dir.display()))?;
    for photo in photos {
        let path = dir.join(&photo.filename);
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            bail!("refusing to overwrite existing {}", path.display());
        }
    }
    let mut written = Vec::with_capacity(photos.len());
    for photo in photos {
        let path = dir.join(&photo.filename);
        let tmp = path.with_extension("JPG.tmp");
        fs::write(&tmp, &photo.bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        tracing::debug!(path = %path.display(), bytes = photo.bytes.len(), "wrote photo");
        written.push(path);
    }
    Ok(written)
}

/// Pack the photos into an uncompressed zip, one entry per file name.
/// JPEG data does not deflate, so entries are stored as-is.
pub fn build_archive(photos: &[EncodedPhoto]) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for photo in photos {
        zip.start_file(photo.filename.as_str(), options)
            .with_context(|| format!("adding {} to archive", photo.filename))?;
        zip.write_all(&photo.bytes)
            .with_context(|| format!("writing {} to archive", photo.filename))?;
    }
    let bytes = zip.finish().context("finishing archive")?.into_inner();
    tracing::debug!(entries = photos.len(), bytes = bytes.len(), "archive built");
    Ok(bytes)
}

/// A finished batch kept for the HTTP API.
#[derive(Debug)]
pub struct StoredBatch {
    pub outcome: BatchOutcome,
    pub created_at: DateTime<Utc>,
    pub archive_name: String,
}

impl StoredBatch {
    pub fn photo(&self, filename: &str) -> Option<&EncodedPhoto> {
        self.outcome.done.iter().find(|p| p.filename == filename)
    }
}

#[derive(Debug)]
pub struct BatchStore {
    next_id: AtomicU64,
    batches: RwLock<HashMap<u64, Arc<StoredBatch>>>,
}

impl BatchStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            batches: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, outcome: BatchOutcome, archive_name: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stored = StoredBatch {
            outcome,
            created_at: Utc::now(),
            archive_name: archive_name.to_string(),
        };
        self.batches.write().insert(id, Arc::new(stored));
        id
    }

    pub fn get(&self, id: u64) -> Option<Arc<StoredBatch>> {
        self.batches.read().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> bool {
        self.batches.write().remove(&id).is_some()
    }
}

impl Default for BatchStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn photo(name: &str, bytes: &[u8]) -> EncodedPhoto {
        EncodedPhoto {
            filename: name.to_string(),
            width: 2560,
            height: 1920,
            original_name: "in.png".into(),
            bytes: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn writes_every_photo_under_its_name() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("nested");
        let paths = save_outputs(
            &out,
            &[photo("DSCF0001.JPG", b"one"), photo("DSCF0002.JPG", b"two")],
        )
        .await
        .unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(std::fs::read(out.join("DSCF0001.JPG")).unwrap(), b"one");
        assert_eq!(std::fs::read(out.join("DSCF0002.JPG")).unwrap(), b"two");
        let leftovers = std::fs::read_dir(&out)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn existing_files_are_never_replaced() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("DSCF0001.JPG"), b"old1").unwrap();
        std::fs::write(dir.path().join("DSCF0003.JPG"), b"old3").unwrap();

        let err = save_outputs(
            dir.path(),
            &[photo("DSCF0002.JPG", b"new2"), photo("DSCF0003.JPG", b"new3")],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("DSCF0003.JPG"));
        assert_eq!(std::fs::read(dir.path().join("DSCF0003.JPG")).unwrap(), b"old3");
        // nothing from the rejected batch lands on disk
        assert!(!dir.path().join("DSCF0002.JPG").exists());
    }

    #[tokio::test]
    async fn gapped_directory_gets_a_fresh_run_of_names() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("DSCF0001.JPG"), b"old1").unwrap();
        std::fs::write(dir.path().join("DSCF0003.JPG"), b"old3").unwrap();

        let start = crate::naming::first_free_index(dir.path(), "DSCF", 1, 2);
        let photos: Vec<_> = (0..2)
            .map(|i| photo(&crate::naming::next_name("DSCF", start + i), b"new"))
            .collect();
        save_outputs(dir.path(), &photos).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("DSCF0001.JPG")).unwrap(), b"old1");
        assert_eq!(std::fs::read(dir.path().join("DSCF0003.JPG")).unwrap(), b"old3");
        assert_eq!(std::fs::read(dir.path().join("DSCF0004.JPG")).unwrap(), b"new");
        assert_eq!(std::fs::read(dir.path().join("DSCF0005.JPG")).unwrap(), b"new");
    }

    #[test]
    fn archive_holds_every_photo_by_name() {
        let bytes = build_archive(&[
            photo("DSCF0001.JPG", b"one"),
            photo("DSCF0002.JPG", b"two"),
        ])
        .unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut archive.by_name("DSCF0002.JPG").unwrap(), &mut contents)
            .unwrap();
        assert_eq!(contents, b"two");
        assert_eq!(archive.by_index(0).unwrap().name(), "DSCF0001.JPG");
    }

    #[tokio::test]
    async fn inputs_expand_globs_and_skip_missing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"a").unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"b").unwrap();
        std::fs::write(dir.path().join("c.png"), b"c").unwrap();
        let patterns = vec![
            dir.path().join("*.jpg").display().to_string(),
            dir.path().join("missing.png").display().to_string(),
            dir.path().join("c.png").display().to_string(),
        ];
        let inputs = collect_inputs(&patterns).await.unwrap();
        let names: Vec<_> = inputs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["a.jpg", "b.jpg", "c.png"]);
        assert_eq!(inputs[2].1, b"c");
    }

    #[test]
    fn batch_store_hands_out_fresh_ids() {
        let store = BatchStore::new();
        let outcome = BatchOutcome {
            done: vec![photo("DSCF0001.JPG", b"x")],
            errors: vec![("bad.jpg".into(), "failed to decode image".into())],
        };
        let first = store.insert(outcome, "WideEvo_Photos.zip");
        let second = store.insert(BatchOutcome::default(), "WideEvo_Photos.zip");
        assert_ne!(first, second);

        let stored = store.get(first).unwrap();
        assert_eq!(stored.archive_name, "WideEvo_Photos.zip");
        assert!(stored.photo("DSCF0001.JPG").is_some());
        assert!(stored.photo("DSCF0002.JPG").is_none());

        assert!(store.remove(first));
        assert!(!store.remove(first));
        assert!(store.get(first).is_none());
        assert!(store.get(second).is_some());
    }
}
