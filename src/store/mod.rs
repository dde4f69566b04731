mod file;
mod memory;
mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

/// Long-term copy of the roster, written on checkpoint and read at bootstrap.
/// A write replaces whatever was stored under the name before.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn write(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// `Ok(None)` when nothing has been stored under `name` yet.
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid snapshot name: {0:?}")]
    InvalidName(String),
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}
