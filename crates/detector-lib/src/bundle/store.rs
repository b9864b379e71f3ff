//! Durable bundle storage
//!
//! Layout under the store root:
//! - `<version>.bundle`: one encoded [`ModelBundle`] per version
//! - `LATEST`: the version name the serving process should load
//!
//! Every file is written to a temp path, synced and renamed into place, so a
//! reader never observes a partially written bundle or pointer.

use super::ModelBundle;
use crate::error::{DetectorError, Result};
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Name of the pointer file holding the latest version
pub const LATEST_POINTER: &str = "LATEST";

const BUNDLE_EXTENSION: &str = "bundle";

/// Read/write access to versioned bundles
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Load whatever version the latest pointer names
    async fn load_latest(&self) -> Result<ModelBundle>;

    async fn load_version(&self, version: &str) -> Result<ModelBundle>;

    /// Persist a bundle and make it the latest
    async fn save(&self, bundle: &ModelBundle) -> Result<()>;

    /// Stored versions, oldest first
    async fn versions(&self) -> Result<Vec<String>>;
}

/// Configuration for the filesystem store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding bundle files
    pub root: PathBuf,
    /// Number of versions kept after a save
    pub versions_to_keep: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/anomaly-detector/models"),
            versions_to_keep: 5,
        }
    }
}

/// Filesystem-backed [`ArtifactStore`]
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    config: StoreConfig,
}

impl FsArtifactStore {
    /// Create the store, making sure its directory exists
    pub fn new(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.root).map_err(|e| {
            DetectorError::Storage(format!(
                "failed to create model directory {}: {}",
                config.root.display(),
                e
            ))
        })?;
        Ok(Self { config })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn bundle_path(&self, version: &str) -> PathBuf {
        self.config
            .root
            .join(format!("{}.{}", version, BUNDLE_EXTENSION))
    }

    fn read_bundle(&self, version: &str) -> Result<ModelBundle> {
        let path = self.bundle_path(version);
        let bytes = fs::read(&path).map_err(|e| {
            DetectorError::ModelLoad(format!("failed to read {}: {}", path.display(), e))
        })?;
        let bundle = ModelBundle::from_bytes(&bytes)?;
        if bundle.version() != version {
            return Err(DetectorError::ModelLoad(format!(
                "{} holds version {}",
                path.display(),
                bundle.version()
            )));
        }
        debug!(version = %version, size = bytes.len(), "Bundle read");
        Ok(bundle)
    }

    fn read_latest(&self) -> Result<ModelBundle> {
        let pointer = self.config.root.join(LATEST_POINTER);
        let version = fs::read_to_string(&pointer).map_err(|e| {
            DetectorError::ModelLoad(format!("failed to read {}: {}", pointer.display(), e))
        })?;
        let version = version.trim();
        if version.is_empty() {
            return Err(DetectorError::ModelLoad(
                "latest pointer is empty".to_string(),
            ));
        }
        self.read_bundle(version)
    }

    fn write_bundle(&self, bundle: &ModelBundle) -> Result<()> {
        check_version_name(bundle.version())?;
        let bytes = bundle.to_bytes()?;
        write_atomic(&self.bundle_path(bundle.version()), &bytes)?;
        write_atomic(
            &self.config.root.join(LATEST_POINTER),
            bundle.version().as_bytes(),
        )?;

        info!(
            version = %bundle.version(),
            size = bytes.len(),
            "Bundle saved"
        );

        self.prune(bundle.version());
        Ok(())
    }

    fn list_versions(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.config.root).map_err(|e| {
            DetectorError::ModelLoad(format!(
                "failed to list {}: {}",
                self.config.root.display(),
                e
            ))
        })?;

        let mut found: Vec<(SystemTime, String)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BUNDLE_EXTENSION) {
                continue;
            }
            let Some(version) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, version.to_string()));
        }
        found.sort();
        Ok(found.into_iter().map(|(_, v)| v).collect())
    }

    /// Remove the oldest versions beyond the configured count
    fn prune(&self, keep: &str) {
        let versions = match self.list_versions() {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to list bundles for pruning");
                return;
            }
        };
        let excess = versions
            .len()
            .saturating_sub(self.config.versions_to_keep.max(1));
        for version in versions.iter().filter(|v| *v != keep).take(excess) {
            let path = self.bundle_path(version);
            if let Err(e) = fs::remove_file(&path) {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to remove old bundle"
                );
            } else {
                debug!(version = %version, "Pruned old bundle");
            }
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn load_latest(&self) -> Result<ModelBundle> {
        let store = self.clone();
        blocking(move || store.read_latest()).await
    }

    async fn load_version(&self, version: &str) -> Result<ModelBundle> {
        let store = self.clone();
        let version = version.to_string();
        blocking(move || store.read_bundle(&version)).await
    }

    async fn save(&self, bundle: &ModelBundle) -> Result<()> {
        let store = self.clone();
        let bundle = bundle.clone();
        blocking(move || store.write_bundle(&bundle)).await
    }

    async fn versions(&self) -> Result<Vec<String>> {
        let store = self.clone();
        blocking(move || store.list_versions()).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DetectorError::Storage(format!("store task failed: {}", e)))?
}

fn check_version_name(version: &str) -> Result<()> {
    let valid = !version.is_empty()
        && version != LATEST_POINTER
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !version.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(DetectorError::Storage(format!(
            "invalid bundle version name {:?}",
            version
        )))
    }
}

/// Write to a sibling temp file, sync, then rename over `path`
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let io_err = |what: &str, e: std::io::Error| {
        DetectorError::Storage(format!("{} {}: {}", what, path.display(), e))
    };

    let mut file = File::create(&temp_path).map_err(|e| io_err("failed to create temp file for", e))?;
    file.write_all(data)
        .map_err(|e| io_err("failed to write", e))?;
    file.sync_all().map_err(|e| io_err("failed to sync", e))?;
    fs::rename(&temp_path, path).map_err(|e| io_err("failed to rename temp file onto", e))?;
    Ok(())
}
