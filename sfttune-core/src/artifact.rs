//! The persisted adapter artifact: a directory of weight deltas and tokenizer files.
//!
//! The artifact is identified only by its path. It is the hand-off point between
//! fine-tuning and verification, so nothing here caches its contents in memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{Result, TuneError};

/// File the adapter provider writes next to the weights.
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// Run manifest written alongside the weights.
pub const MANIFEST_FILE: &str = "sfttune_manifest.json";

const WEIGHT_FILES: &[&str] = &["adapter_model.safetensors", "adapter_model.bin"];

/// A validated adapter artifact directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterArtifact {
    dir: PathBuf,
}

impl AdapterArtifact {
    /// Open `dir`, requiring an adapter config to be present.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(TuneError::artifact(format!(
                "adapter directory {} does not exist",
                dir.display()
            )));
        }
        if !dir.join(ADAPTER_CONFIG_FILE).is_file() {
            return Err(TuneError::artifact(format!(
                "{} has no {ADAPTER_CONFIG_FILE}; it is not an adapter artifact",
                dir.display()
            )));
        }
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Weight file inside the artifact, if the provider wrote a known one.
    pub fn weights_file(&self) -> Option<PathBuf> {
        WEIGHT_FILES
            .iter()
            .map(|name| self.dir.join(name))
            .find(|p| p.is_file())
    }

    /// Relative paths of every regular file, sorted.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.dir).follow_links(false) {
            let entry = entry.map_err(|e| TuneError::Io(io::Error::other(e)))?;
            if entry.file_type().is_file() {
                let rel = entry
                    .path()
                    .strip_prefix(&self.dir)
                    .map_err(|e| TuneError::artifact(e.to_string()))?;
                files.push(rel.to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    /// SHA-256 of every file except the manifest itself.
    pub fn digests(&self) -> Result<Vec<FileDigest>> {
        let mut digests = Vec::new();
        for rel in self.files()? {
            if rel == Path::new(MANIFEST_FILE) {
                continue;
            }
            let bytes = std::fs::read(self.dir.join(&rel))?;
            digests.push(FileDigest {
                path: rel.to_string_lossy().replace('\\', "/"),
                sha256: format!("{:x}", Sha256::digest(&bytes)),
                size_bytes: bytes.len() as u64,
            });
        }
        Ok(digests)
    }

    /// Recursively copy the artifact into `dest` and open the copy.
    pub fn mirror_to(&self, dest: &Path) -> Result<AdapterArtifact> {
        std::fs::create_dir_all(dest)?;
        if dest.canonicalize()? == self.dir.canonicalize()? {
            return Err(TuneError::artifact(format!(
                "mirror directory {} is the artifact itself",
                dest.display()
            )));
        }
        for rel in self.files()? {
            let target = dest.join(&rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(self.dir.join(&rel), &target)?;
        }
        info!(from = %self.dir.display(), to = %dest.display(), "Adapter artifact mirrored");
        AdapterArtifact::open(dest)
    }

    pub fn read_manifest(&self) -> Result<Option<RunManifest>> {
        let path = self.dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn write_manifest(&self, manifest: &RunManifest) -> Result<()> {
        atomic_write_json(&self.dir.join(MANIFEST_FILE), manifest)?;
        Ok(())
    }
}

/// Digest of one artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Provenance of a persisted adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub base_model: String,
    pub backend: String,
    pub dataset_records: usize,
    pub effective_batch_size: u32,
    pub global_steps: u64,
    pub training_loss: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<FileDigest>,
}

impl RunManifest {
    /// Recompute digests and report files whose content no longer matches.
    pub fn verify_against(&self, artifact: &AdapterArtifact) -> Result<Vec<String>> {
        let current = artifact.digests()?;
        let mut mismatched = Vec::new();
        for recorded in &self.files {
            match current.iter().find(|d| d.path == recorded.path) {
                Some(d) if d.sha256 == recorded.sha256 => {}
                _ => mismatched.push(recorded.path.clone()),
            }
        }
        Ok(mismatched)
    }
}

/// Write JSON to a sibling temp file, then rename over the target.
pub(crate) fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}
