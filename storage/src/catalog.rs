//! The persisted set of known storages and storage auths.
//!
//! The catalog is append-only: nodes are never edited once inserted, only
//! reused or deleted. On disk it is a JSON document in which parents and
//! auths are referenced by their index.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::registry::HandlerRegistry;
use crate::{Error, StorageAuth, StorageNode};

/// Checks a storage against the capabilities of its handler and its parent's
/// handler.
pub fn validate_storage(registry: &HandlerRegistry, node: &StorageNode) -> Result<(), Error> {
    let descriptor = registry.descriptor(&node.storage_type)?;

    if let Some(parent) = &node.parent {
        let parent_descriptor = registry.descriptor(&parent.storage_type)?;
        if !descriptor.allows_parent_storage {
            return Err(Error::InvalidStorage(format!(
                "storage type {} does not support parent storages",
                descriptor.name
            )));
        }
        if !parent_descriptor.allows_child_storages {
            return Err(Error::InvalidStorage(format!(
                "storage type {} does not support child storages",
                parent_descriptor.name
            )));
        }
    }

    if let Some(auth) = &node.auth {
        auth.validate()?;
    }

    Ok(())
}

#[derive(Debug, Default)]
struct CatalogInner {
    // parents always come before their children.
    storages: Vec<Arc<StorageNode>>,
    auths: Vec<Arc<StorageAuth>>,
}

/// Shared, read-mostly set of storages and storage auths.
#[derive(Debug, Default)]
pub struct Catalog {
    inner: RwLock<CatalogInner>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storages(&self) -> Vec<Arc<StorageNode>> {
        self.inner.read().storages.clone()
    }

    pub fn auths(&self) -> Vec<Arc<StorageAuth>> {
        self.inner.read().auths.clone()
    }

    pub fn storage_by_name(&self, name: &str) -> Option<Arc<StorageNode>> {
        self.inner
            .read()
            .storages
            .iter()
            .find(|s| s.name.as_deref() == Some(name))
            .cloned()
    }

    /// Finds a named storage nested in exactly the given parent.
    pub fn storage_by_name_in(
        &self,
        name: &str,
        parent: Option<&Arc<StorageNode>>,
    ) -> Option<Arc<StorageNode>> {
        self.inner
            .read()
            .storages
            .iter()
            .find(|s| s.name.as_deref() == Some(name) && s.has_parent(parent))
            .cloned()
    }

    /// Finds a storage with the same type and url, nested in exactly the given
    /// parent.
    pub fn find_storage(
        &self,
        storage_type: &str,
        url: &str,
        parent: Option<&Arc<StorageNode>>,
    ) -> Option<Arc<StorageNode>> {
        self.inner
            .read()
            .storages
            .iter()
            .find(|s| {
                s.storage_type.eq_ignore_ascii_case(storage_type)
                    && s.url == url
                    && s.has_parent(parent)
            })
            .cloned()
    }

    pub fn auth_by_name(&self, name: &str) -> Option<Arc<StorageAuth>> {
        self.inner
            .read()
            .auths
            .iter()
            .find(|a| a.name.as_deref() == Some(name))
            .cloned()
    }

    /// Validates and inserts a storage.
    ///
    /// An identical storage (same type, url and parent) already in the catalog
    /// is returned instead of inserting a duplicate. The parent must already
    /// be part of the catalog.
    #[instrument(skip_all, err, fields(storage.type = %node.storage_type, storage.url = %node.url))]
    pub fn insert_storage(
        &self,
        registry: &HandlerRegistry,
        node: StorageNode,
    ) -> Result<Arc<StorageNode>, Error> {
        validate_storage(registry, &node)?;

        let mut inner = self.inner.write();
        if let Some(parent) = &node.parent {
            if !inner.storages.iter().any(|s| Arc::ptr_eq(s, parent)) {
                return Err(Error::InvalidStorage(format!(
                    "parent storage {} is not part of the catalog",
                    parent
                )));
            }
        }
        if let Some(existing) = inner.storages.iter().find(|s| {
            s.storage_type == node.storage_type
                && s.url == node.url
                && s.has_parent(node.parent.as_ref())
                && (node.name.is_none() || s.name == node.name)
        }) {
            debug!("reusing existing storage");
            return Ok(existing.clone());
        }
        if let Some(name) = &node.name {
            if inner.storages.iter().any(|s| s.name.as_ref() == Some(name)) {
                return Err(Error::InvalidStorage(format!(
                    "a storage named {:?} already exists",
                    name
                )));
            }
        }

        if let Some(auth) = &node.auth {
            if !inner.auths.iter().any(|a| Arc::ptr_eq(a, auth)) {
                inner.auths.push(auth.clone());
            }
        }

        let node = Arc::new(node);
        inner.storages.push(node.clone());
        debug!("inserted storage");
        Ok(node)
    }

    pub fn insert_auth(&self, auth: StorageAuth) -> Result<Arc<StorageAuth>, Error> {
        auth.validate()?;

        let mut inner = self.inner.write();
        if let Some(name) = &auth.name {
            if inner.auths.iter().any(|a| a.name.as_ref() == Some(name)) {
                return Err(Error::InvalidStorage(format!(
                    "a storage auth named {:?} already exists",
                    name
                )));
            }
        }
        let auth = Arc::new(auth);
        inner.auths.push(auth.clone());
        Ok(auth)
    }

    /// Deletes the named storage along with every storage nested in it.
    /// Returns how many storages were removed.
    #[instrument(skip(self), err)]
    pub fn delete_storage(&self, name: &str) -> Result<usize, Error> {
        let mut inner = self.inner.write();
        let target = inner
            .storages
            .iter()
            .find(|s| s.name.as_deref() == Some(name))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no storage named {:?}", name)))?;

        let before = inner.storages.len();
        inner
            .storages
            .retain(|s| !s.ancestry().any(|n| std::ptr::eq(n, target.as_ref())));
        let removed = before - inner.storages.len();

        debug!(removed, "deleted storage");
        Ok(removed)
    }

    pub fn to_snapshot(&self) -> CatalogSnapshot {
        let inner = self.inner.read();
        let index_of_storage = |node: &Arc<StorageNode>| {
            inner.storages.iter().position(|s| Arc::ptr_eq(s, node))
        };
        let index_of_auth =
            |auth: &Arc<StorageAuth>| inner.auths.iter().position(|a| Arc::ptr_eq(a, auth));

        CatalogSnapshot {
            auths: inner.auths.iter().map(|a| a.as_ref().clone()).collect(),
            storages: inner
                .storages
                .iter()
                .map(|s| StorageRecord {
                    name: s.name.clone(),
                    storage_type: s.storage_type.clone(),
                    url: s.url.clone(),
                    parent: s.parent.as_ref().and_then(index_of_storage),
                    auth: s.auth.as_ref().and_then(index_of_auth),
                })
                .collect(),
        }
    }

    /// Rebuilds a catalog from a snapshot, rejecting dangling references,
    /// cyclic parent chains and storages that fail validation.
    pub fn from_snapshot(
        registry: &HandlerRegistry,
        snapshot: CatalogSnapshot,
    ) -> Result<Self, Error> {
        let auths: Vec<Arc<StorageAuth>> = snapshot
            .auths
            .into_iter()
            .map(|a| a.validate().map(|_| Arc::new(a)))
            .collect::<Result<_, _>>()?;

        let records = snapshot.storages;
        let mut built: Vec<Option<Arc<StorageNode>>> = vec![None; records.len()];
        let mut storages = Vec::with_capacity(records.len());

        for start in 0..records.len() {
            // walk up until an already built node or a root, then build the
            // collected chain top down.
            let mut chain = Vec::new();
            let mut cursor = Some(start);
            while let Some(idx) = cursor {
                let record = records.get(idx).ok_or_else(|| {
                    Error::InvalidStorage(format!("storage refers to missing parent #{}", idx))
                })?;
                if built[idx].is_some() {
                    break;
                }
                if chain.contains(&idx) {
                    return Err(Error::InvalidStorage(format!(
                        "circular reference in parents of storage #{}",
                        start
                    )));
                }
                chain.push(idx);
                cursor = record.parent;
            }

            for &idx in chain.iter().rev() {
                let record = &records[idx];
                let mut node = StorageNode::new(&record.storage_type, &record.url);
                node.name = record.name.clone();
                node.parent = record.parent.and_then(|p| built[p].clone());
                node.auth = match record.auth {
                    Some(a) => Some(auths.get(a).cloned().ok_or_else(|| {
                        Error::InvalidStorage(format!("storage refers to missing auth #{}", a))
                    })?),
                    None => None,
                };
                validate_storage(registry, &node)?;
                let node = Arc::new(node);
                storages.push(node.clone());
                built[idx] = Some(node);
            }
        }

        Ok(Self {
            inner: RwLock::new(CatalogInner { storages, auths }),
        })
    }

    /// Loads a catalog from a JSON file. A missing file is an empty catalog.
    #[instrument(skip(registry), err)]
    pub fn load(registry: &HandlerRegistry, path: &Path) -> Result<Self, Error> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let snapshot: CatalogSnapshot = serde_json::from_slice(&data)
            .map_err(|e| Error::InvalidStorage(format!("unable to parse catalog: {}", e)))?;
        Self::from_snapshot(registry, snapshot)
    }

    /// Writes the catalog to a JSON file, replacing it atomically.
    #[instrument(skip(self), err)]
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, &self.to_snapshot())
            .map_err(|e| Error::Io(format!("unable to write catalog: {}", e)))?;
        file.persist(path).map_err(|e| Error::from(e.error))?;
        Ok(())
    }
}

/// The serialized form of a [Catalog].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub auths: Vec<StorageAuth>,
    #[serde(default)]
    pub storages: Vec<StorageRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageRecord {
    #[serde(default)]
    pub name: Option<String>,
    pub storage_type: String,
    pub url: String,
    /// Index of the parent storage.
    #[serde(default)]
    pub parent: Option<usize>,
    /// Index of the storage auth.
    #[serde(default)]
    pub auth: Option<usize>,
}
