//! In-process catalog, seeded from a YAML file or built up in tests.

use super::{CatalogStore, RequestLogSink, StoreError};
use crate::model::{Folder, FolderKey, Mock};
use crate::request_log::RequestLogRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// On-disk catalog layout.
///
/// ```yaml
/// folders:
///   - name: api
///   - name: v1
///     parent_name: api
/// mocks:
///   - folder_name: api
///     method: GET
///     path: /users?x=1
///     response_body: {ok: true}
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogFile {
    #[serde(default)]
    pub folders: Vec<Folder>,

    #[serde(default)]
    pub mocks: Vec<Mock>,
}

#[derive(Debug, Default)]
struct Catalog {
    folders: BTreeMap<FolderKey, Folder>,
    mocks: BTreeMap<Uuid, Mock>,
    logs: Vec<RequestLogRecord>,
}

impl Catalog {
    fn with_default_root() -> Self {
        let mut catalog = Self::default();
        let key = FolderKey::default_root();
        catalog.folders.insert(key.clone(), Folder::new(key));
        catalog
    }

    fn is_root_name(&self, name: &str) -> bool {
        self.folders.contains_key(&FolderKey::root(name))
    }

    fn is_subfolder_name(&self, name: &str) -> bool {
        self.folders.keys().any(|k| !k.is_root() && k.name == name)
    }

    fn put_folder(&mut self, folder: Folder) -> Result<(), StoreError> {
        let key = folder.key();
        if key.name.is_empty() || key.name.contains('/') {
            return Err(StoreError::InvalidName(key.name));
        }

        if key.is_root() {
            if self.is_subfolder_name(&key.name) {
                return Err(StoreError::NameConflict(key.name));
            }
        } else {
            if self.is_root_name(&key.name) {
                return Err(StoreError::NameConflict(key.name));
            }
            if !self.is_root_name(&key.parent) {
                if self.is_subfolder_name(&key.parent) {
                    return Err(StoreError::TooDeep(key));
                }
                return Err(StoreError::FolderNotFound(FolderKey::root(key.parent)));
            }
        }

        self.folders.insert(key, folder);
        Ok(())
    }

    fn put_mock(&mut self, mut mock: Mock) -> Result<(), StoreError> {
        mock.normalize();
        let key = mock.folder_key();
        if !self.folders.contains_key(&key) {
            return Err(StoreError::FolderNotFound(key));
        }
        self.mocks.insert(mock.id, mock);
        Ok(())
    }

    fn remove_folder(&mut self, key: &FolderKey) -> Result<usize, StoreError> {
        if key.is_default_root() {
            return Err(StoreError::ProtectedFolder(key.clone()));
        }
        if !self.folders.contains_key(key) {
            return Err(StoreError::FolderNotFound(key.clone()));
        }

        let mut doomed = BTreeSet::new();
        doomed.insert(key.clone());
        if key.is_root() {
            doomed.extend(
                self.folders
                    .keys()
                    .filter(|k| k.parent == key.name)
                    .cloned(),
            );
        }

        self.folders.retain(|k, _| !doomed.contains(k));
        self.mocks.retain(|_, m| !doomed.contains(&m.folder_key()));
        self.logs.retain(|r| !doomed.contains(&r.folder));
        Ok(doomed.len())
    }
}

/// Catalog held entirely in memory.
#[derive(Debug)]
pub struct MemoryCatalog {
    inner: RwLock<Catalog>,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalog {
    /// Empty catalog holding only the `default` root.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Catalog::with_default_root()),
        }
    }

    /// Build a catalog from parsed file contents. Roots are inserted before
    /// subfolders so file order does not matter.
    pub fn from_catalog(file: CatalogFile) -> Result<Self, StoreError> {
        let mut catalog = Catalog::with_default_root();

        let (roots, children): (Vec<_>, Vec<_>) =
            file.folders.into_iter().partition(|f| f.parent_name.is_empty());
        for folder in roots.into_iter().chain(children) {
            catalog.put_folder(folder)?;
        }
        for mock in file.mocks {
            catalog.put_mock(mock)?;
        }

        Ok(Self {
            inner: RwLock::new(catalog),
        })
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml)?;
        Ok(Self::from_catalog(file)?)
    }

    /// Load a catalog from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let catalog = Self::from_yaml(&content)
            .map_err(|e| anyhow::anyhow!("Catalog {}: {}", path.display(), e))?;
        info!(path = %path.display(), "Loaded catalog file");
        Ok(catalog)
    }

    /// Insert or replace a folder.
    pub async fn insert_folder(&self, folder: Folder) -> Result<(), StoreError> {
        self.inner.write().await.put_folder(folder)
    }

    /// Insert or replace a mock; its folder must exist.
    pub async fn insert_mock(&self, mock: Mock) -> Result<(), StoreError> {
        self.inner.write().await.put_mock(mock)
    }

    /// Delete a folder with its subfolders, mocks and request logs.
    /// Returns the number of folders removed.
    pub async fn delete_folder(&self, key: &FolderKey) -> Result<usize, StoreError> {
        self.inner.write().await.remove_folder(key)
    }

    pub async fn folder_count(&self) -> usize {
        self.inner.read().await.folders.len()
    }

    pub async fn mock_count(&self) -> usize {
        self.inner.read().await.mocks.len()
    }

    pub async fn request_logs(&self) -> Vec<RequestLogRecord> {
        self.inner.read().await.logs.clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn find_root_folder(&self, name: &str) -> Result<Option<Folder>, StoreError> {
        Ok(self.inner.read().await.folders.get(&FolderKey::root(name)).cloned())
    }

    async fn find_subfolder(&self, name: &str, parent: &str) -> Result<Option<Folder>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .folders
            .get(&FolderKey::child(name, parent))
            .cloned())
    }

    async fn active_mocks(&self, folder: &FolderKey) -> Result<Vec<Mock>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .mocks
            .values()
            .filter(|m| m.active && m.folder_key() == *folder)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl RequestLogSink for MemoryCatalog {
    async fn append(&self, record: &RequestLogRecord) -> Result<(), StoreError> {
        self.inner.write().await.logs.push(record.clone());
        Ok(())
    }
}
