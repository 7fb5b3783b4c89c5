//! On-disk peer directory
//!
//! The directory lives in a YAML file holding a single `peers` list.
//! [`load`] never fails: a missing or corrupt file reads as an empty
//! directory. [`save`] fully rewrites the file, replacing a filesystem
//! directory that squats on the target path.
//!
//! [`PeerStore`] is the only component that mutates the file at runtime.
//! Every load-mutate-save cycle runs under one async mutex so concurrent
//! connection handlers and the tap-sync task cannot lose each other's updates.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::peer::PeerDirectory;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML encoding error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// File layout of the persisted directory
#[derive(Debug, Default, Serialize, Deserialize)]
struct PeerFile {
    #[serde(default)]
    peers: PeerDirectory,
}

/// Read the directory at `path`
///
/// Missing, unreadable or malformed files yield an empty directory.
pub async fn load(path: &Path) -> PeerDirectory {
    read_peer_file(path).await.0
}

/// Like [`load`], also reporting whether the file exists but did not parse
async fn read_peer_file(path: &Path) -> (PeerDirectory, bool) {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(target: "peers", path = %path.display(), "No peer file yet");
            return (PeerDirectory::new(), false);
        }
        Err(e) => {
            error!(target: "peers", path = %path.display(), error = %e, "Failed to read peer file");
            return (PeerDirectory::new(), false);
        }
    };

    match serde_yaml::from_str::<PeerFile>(&content) {
        Ok(file) => (file.peers, false),
        Err(e) => {
            error!(target: "peers", path = %path.display(), error = %e, "Failed to parse peer file");
            (PeerDirectory::new(), true)
        }
    }
}

/// Move an unparsable peer file out of the way so it is not overwritten
async fn set_aside(path: &Path) {
    let aside = sibling_path(path, ".corrupt");
    match tokio::fs::rename(path, &aside).await {
        Ok(()) => warn!(
            target: "peers",
            path = %path.display(),
            kept = %aside.display(),
            "Moved unparsable peer file aside"
        ),
        Err(e) => error!(
            target: "peers",
            path = %path.display(),
            error = %e,
            "Failed to move unparsable peer file aside"
        ),
    }
}

/// Write `dir` to `path`, replacing whatever was there
pub async fn save(path: &Path, dir: &PeerDirectory) -> Result<(), StoreError> {
    if let Ok(meta) = tokio::fs::metadata(path).await {
        if meta.is_dir() {
            warn!(
                target: "peers",
                path = %path.display(),
                "A directory exists where the peer file belongs, removing it"
            );
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| StoreError::io(path, e))?;
        }
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
    }

    let yaml = serde_yaml::to_string(&PeerFile { peers: dir.clone() })?;

    let tmp = sibling_path(path, ".tmp");
    tokio::fs::write(&tmp, yaml)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))?;

    debug!(target: "peers", path = %path.display(), count = dir.len(), "Saved peers");
    Ok(())
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "peers".into());
    name.push(suffix);
    path.with_file_name(name)
}

/// Serialized access to the peer file
#[derive(Clone, Debug)]
pub struct PeerStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl PeerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the directory as currently persisted
    pub async fn read(&self) -> PeerDirectory {
        let _guard = self.lock.lock().await;
        load(&self.path).await
    }

    /// Load, apply `f`, persist, all under the store lock
    ///
    /// Nothing is written when `f` leaves the directory unchanged. A failed
    /// save is logged; the value produced by `f` is returned either way and
    /// the next cycle starts from whatever is on disk.
    pub async fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut PeerDirectory) -> R,
    {
        let _guard = self.lock.lock().await;
        let (mut dir, corrupt) = read_peer_file(&self.path).await;
        if corrupt {
            set_aside(&self.path).await;
        }

        let before = dir.clone();
        let out = f(&mut dir);
        if dir != before {
            if let Err(e) = save(&self.path, &dir).await {
                error!(target: "peers", error = %e, "Failed to persist peer directory");
            }
        }
        out
    }

    /// Overwrite the directory with `dir`
    pub async fn replace(&self, dir: PeerDirectory) {
        self.update(move |current| *current = dir).await
    }

    /// Peers other than `self_id` seen within the last hour
    pub async fn active_peer_count(&self, self_id: &str) -> usize {
        self.read().await.active_peer_count(self_id, Utc::now())
    }
}
