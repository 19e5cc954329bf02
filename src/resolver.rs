//! Folder-prefix resolution.
//!
//! The first path segment may name a root folder and, if it does, the next
//! may name one of its subfolders. Anything else falls through to the
//! `default` root with nothing consumed.
//!
//! Segments are percent-decoded before lookup, so folder names and mock paths
//! are stored and compared in their plain form.

use crate::model::{Folder, FolderKey, DEFAULT_FOLDER};
use crate::store::{CatalogStore, StoreError};
use percent_encoding::percent_decode_str;

/// Where a request path landed.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub folder: Folder,
    /// Remaining path after folder stripping, without query
    pub inner_path: String,
    /// Inner path with the request query re-attached
    pub inner_full_path: String,
    /// Inner path and query as received, still percent-encoded
    pub upstream_path: String,
}

impl Resolution {
    pub fn folder_key(&self) -> FolderKey {
        self.folder.key()
    }
}

pub async fn resolve(
    store: &dyn CatalogStore,
    path: &str,
    query: Option<&str>,
) -> Result<Resolution, StoreError> {
    let raw_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let segments: Vec<String> = raw_segments
        .iter()
        .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
        .collect();
    let mut consumed = 0;

    let folder = match segments.first() {
        Some(first) => match store.find_root_folder(first).await? {
            Some(root) => {
                consumed = 1;
                match segments.get(1) {
                    Some(second) => match store.find_subfolder(second, &root.name).await? {
                        Some(child) => {
                            consumed = 2;
                            child
                        }
                        None => root,
                    },
                    None => root,
                }
            }
            None => default_folder(store).await?,
        },
        None => default_folder(store).await?,
    };

    let inner_path = format!("/{}", segments[consumed..].join("/"));
    let raw_inner_path = format!("/{}", raw_segments[consumed..].join("/"));
    let (inner_full_path, upstream_path) = match query.filter(|q| !q.is_empty()) {
        Some(query) => (
            format!("{}?{}", inner_path, query),
            format!("{}?{}", raw_inner_path, query),
        ),
        None => (inner_path.clone(), raw_inner_path),
    };

    Ok(Resolution {
        folder,
        inner_path,
        inner_full_path,
        upstream_path,
    })
}

async fn default_folder(store: &dyn CatalogStore) -> Result<Folder, StoreError> {
    Ok(store
        .find_root_folder(DEFAULT_FOLDER)
        .await?
        .unwrap_or_else(|| Folder::new(FolderKey::default_root())))
}
