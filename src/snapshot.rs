use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
struct Cached<T> {
    modified: Option<SystemTime>,
    value: Arc<T>,
}

/// Caller-owned cache of one JSON file, reloaded when its mtime changes.
///
/// A missing file yields `None` (and drops any cached value); callers
/// decide when to call [`SnapshotCache::get`], which is the refresh cadence.
#[derive(Debug)]
pub struct SnapshotCache<T> {
    path: PathBuf,
    cached: Option<Cached<T>>,
}

impl<T: DeserializeOwned> SnapshotCache<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&mut self) -> Result<Option<Arc<T>>, SnapshotError> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.cached = None;
                return Ok(None);
            }
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let modified = meta.modified().ok();

        if let Some(cached) = &self.cached
            && modified.is_some()
            && cached.modified == modified
        {
            return Ok(Some(Arc::clone(&cached.value)));
        }

        let raw = fs::read_to_string(&self.path).map_err(|source| SnapshotError::Io {
            path: self.path.clone(),
            source,
        })?;
        let value = serde_json::from_str::<T>(&raw).map_err(|source| SnapshotError::Parse {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "snapshot reloaded");

        let value = Arc::new(value);
        self.cached = Some(Cached {
            modified,
            value: Arc::clone(&value),
        });
        Ok(Some(value))
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}
