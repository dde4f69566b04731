use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;

use super::{validate_name, DurableStore, StoreError};

/// One file per snapshot name under `root`. Writes go to a temporary sibling
/// first and are renamed into place, so a reader never sees a torn snapshot.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn write(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_name(name)?;
        tokio::fs::create_dir_all(&self.root).await?;

        let target = self.root.join(name);
        let staging = self
            .root
            .join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));

        tokio::fs::write(&staging, bytes).await?;
        if let Err(err) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err.into());
        }

        tracing::debug!(path = %target.display(), bytes = bytes.len(), "snapshot file written");
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_name(name)?;
        match tokio::fs::read(self.root.join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
