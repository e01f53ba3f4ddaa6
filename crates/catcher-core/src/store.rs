//! File-backed [`SharedStore`]: one small file per key inside a directory
//! shared by every instance on the machine.
//!
//! Writes go to `<key>.tmp` first and are renamed into place, so a reader
//! sees either the old value or the new one, never a partial write.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::AppError;
use crate::traits::SharedStore;

/// Well-known store keys.
pub mod keys {
    use crate::models::GroupKey;

    /// Global kill flag, shared by every group.
    pub const KILL: &str = "kill";
    /// Set while a verification challenge is being handled. No start or stop
    /// operation writes this key.
    pub const CHALLENGE_RESUME: &str = "challenge.resume";
    /// Whether this machine's engine was running when it last changed state.
    pub const WAS_RUNNING: &str = "was_running";

    /// Local RUN/STOP key of one operator group.
    pub fn run(group: &GroupKey) -> String {
        format!("run.{}", group.as_str())
    }
}

/// Encodes a boolean flag the way every store key expects it.
pub fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

/// Reads a boolean flag written with [`flag`].
pub fn is_set(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some("1") | Some("true"))
}

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: Arc<PathBuf>,
}

impl FileStore {
    /// Open (and create if needed) the store directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, AppError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            AppError::Store(format!("cannot create store dir {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir: Arc::new(dir.to_path_buf()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, AppError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(AppError::Store(format!("invalid store key '{key}'")));
        }
        Ok(self.dir.join(key))
    }
}

impl SharedStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Store(format!("read {key}: {e}"))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension(format!("{}.tmp", crate::util::random_token()));
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| AppError::Store(format!("write {key}: {e}")))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(AppError::Store(format!("rename {key}: {e}")));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AppError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Store(format!("remove {key}: {e}"))),
        }
    }
}
