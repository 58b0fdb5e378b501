// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Checkpoint persistence.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::Checkpoint;
use crate::error::{Error, Result};

/// Default checkpoint directory: `${HOME}/.freightliner/checkpoints`
pub fn checkpoint_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".freightliner")
        .join("checkpoints")
}

/// Pluggable checkpoint persistence
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, replacing any previous version
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    /// Load a checkpoint by identifier
    async fn load(&self, id: &str) -> Result<Checkpoint>;
    /// List all stored checkpoints
    async fn list(&self) -> Result<Vec<Checkpoint>>;
    /// Delete a checkpoint
    async fn delete(&self, id: &str) -> Result<()>;
}

/// One JSON file per checkpoint under a directory
pub struct FileCheckpointStore {
    directory: PathBuf,
}

impl FileCheckpointStore {
    /// Open a store rooted at `directory`, creating it if absent
    pub fn new(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    /// Open the default store under the home directory
    pub fn default_location() -> Result<Self> {
        Self::new(checkpoint_dir())
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        // Identifiers become file names; refuse anything that could escape
        if id.is_empty() || id.contains('/') || id.contains("..") {
            return Err(Error::invalid_input(format!(
                "invalid checkpoint id {id:?}"
            )));
        }
        Ok(self.directory.join(format!("{id}.json")))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.id)?;
        let payload = serde_json::to_vec_pretty(checkpoint)?;
        // Write then rename so a crash never leaves a torn file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &payload).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(id = %checkpoint.id, path = %path.display(), "checkpoint saved");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Checkpoint> {
        let path = self.path_for(id)?;
        let payload = tokio::fs::read(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("checkpoint {id} not found"))
            } else {
                err.into()
            }
        })?;
        Ok(serde_json::from_slice(&payload)?)
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(payload) => match serde_json::from_slice::<Checkpoint>(&payload) {
                    Ok(cp) => found.push(cp),
                    Err(err) => {
                        debug!(path = %path.display(), %err, "skipping unreadable checkpoint")
                    }
                },
                Err(err) => debug!(path = %path.display(), %err, "skipping unreadable file"),
            }
        }
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        tokio::fs::remove_file(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("checkpoint {id} not found"))
            } else {
                err.into()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();

        let mut cp = Checkpoint::new("job-1", "ecr/prod", "gcr.io/proj");
        cp.set_plan(vec!["prod/app:v1".to_string()]);
        store.save(&cp).await.unwrap();

        let loaded = store.load("job-1").await.unwrap();
        assert_eq!(loaded, cp);
    }

    #[tokio::test]
    async fn test_list_sorted_by_creation() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();

        for id in ["a", "b", "c"] {
            store
                .save(&Checkpoint::new(id, "src", "dst"))
                .await
                .unwrap();
        }

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();

        store
            .save(&Checkpoint::new("gone", "s", "d"))
            .await
            .unwrap();
        store.delete("gone").await.unwrap();

        let err = store.load("gone").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);

        let err = store.delete("gone").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_rejects_path_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();

        let err = store.load("../etc/passwd").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }
}
