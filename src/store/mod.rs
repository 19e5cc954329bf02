//! Catalog storage.
//!
//! The request pipeline only reads folders and mocks and appends request-log
//! records; both concerns are expressed as traits so the pipeline does not
//! care whether the catalog lives in Postgres or in memory.

mod memory;
mod postgres;

pub use memory::{CatalogFile, MemoryCatalog};
pub use postgres::{DatabaseConfig, PgCatalog};

use crate::model::{Folder, FolderKey, Mock};
use crate::request_log::RequestLogRecord;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("folder {0} not found")]
    FolderNotFound(FolderKey),
    #[error("folder name `{0}` is already used by a root folder")]
    NameConflict(String),
    #[error("folder {0} cannot be renamed or deleted")]
    ProtectedFolder(FolderKey),
    #[error("invalid folder name: `{0}`")]
    InvalidName(String),
    #[error("folders nest at most two levels: {0}")]
    TooDeep(FolderKey),
    #[error("cannot decode stored record: {0}")]
    Decode(String),
}

/// Read side of the catalog used on the request path.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Root folder named `name`, if any.
    async fn find_root_folder(&self, name: &str) -> Result<Option<Folder>, StoreError>;

    /// Subfolder `name` directly under root `parent`, if any.
    async fn find_subfolder(&self, name: &str, parent: &str) -> Result<Option<Folder>, StoreError>;

    /// Active mocks belonging to `folder`.
    async fn active_mocks(&self, folder: &FolderKey) -> Result<Vec<Mock>, StoreError>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Append-only destination for request-log records.
#[async_trait]
pub trait RequestLogSink: Send + Sync {
    async fn append(&self, record: &RequestLogRecord) -> Result<(), StoreError>;
}
