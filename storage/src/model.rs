//! Descriptions of storages, packages and the data items living in them.
//!
//! Nodes are immutable once built and shared through [Arc]s. A node only ever
//! points at nodes that existed before it, so an ancestry built from these
//! types is always finite. Snapshots that refer to parents by index are
//! checked for cycles when loaded, see [crate::catalog].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Credentials and endpoint overrides needed to talk to a storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAuth {
    #[serde(default)]
    pub name: Option<String>,
    pub auth_type: String,
    pub url: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl StorageAuth {
    pub fn new(auth_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: None,
            auth_type: auth_type.into(),
            url: url.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        match self.auth_type.as_str() {
            "S3" => Ok(()),
            crate::keystone::AUTH_TYPE => crate::keystone::validate(&self.parameters),
            "swift" => {
                if self.parameters.contains_key("auth_token") {
                    Ok(())
                } else {
                    Err(Error::InvalidStorage(
                        "swift storage auth requires an auth_token parameter".to_string(),
                    ))
                }
            }
            other => Err(Error::InvalidStorage(format!(
                "storage auth type {:?} is not supported",
                other
            ))),
        }
    }

    /// The environment a reader of virtual paths needs to access storages
    /// using this auth.
    pub fn vsi_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        match self.auth_type.as_str() {
            "S3" => {
                env.insert(
                    "AWS_HTTPS".to_string(),
                    std::env::var("AWS_HTTPS").unwrap_or_else(|_| "NO".to_string()),
                );
                env.insert("AWS_S3_ENDPOINT".to_string(), self.url.clone());
                env.insert(
                    "AWS_VIRTUAL_HOSTING".to_string(),
                    std::env::var("AWS_VIRTUAL_HOSTING").unwrap_or_else(|_| "FALSE".to_string()),
                );
                for (key, param) in [
                    ("AWS_ACCESS_KEY_ID", "ACCESS_KEY_ID"),
                    ("AWS_SECRET_ACCESS_KEY", "SECRET_ACCESS_KEY"),
                    ("AWS_REGION", "AWS_REGION"),
                ] {
                    if let Some(value) = self.parameters.get(param) {
                        env.insert(key.to_string(), value.clone());
                    }
                }
            }
            "swift" => {
                env.insert("SWIFT_STORAGE_URL".to_string(), self.url.clone());
                if let Some(token) = self.parameters.get("auth_token") {
                    env.insert("SWIFT_AUTH_TOKEN".to_string(), token.clone());
                }
            }
            _ => {}
        }
        env
    }
}

/// One storage medium, possibly nested inside a parent medium.
#[derive(Debug)]
pub struct StorageNode {
    pub name: Option<String>,
    pub storage_type: String,
    pub url: String,
    pub parent: Option<Arc<StorageNode>>,
    pub auth: Option<Arc<StorageAuth>>,
}

impl StorageNode {
    pub fn new(storage_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: None,
            storage_type: storage_type.into(),
            url: url.into(),
            parent: None,
            auth: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent(mut self, parent: Arc<StorageNode>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_auth(mut self, auth: Arc<StorageAuth>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Iterates over this node and all its ancestors, innermost first.
    pub fn ancestry(&self) -> impl Iterator<Item = &StorageNode> {
        std::iter::successors(Some(self), |node| node.parent.as_deref())
    }

    /// Whether `parent` is the very node this one is nested in.
    pub fn has_parent(&self, parent: Option<&Arc<StorageNode>>) -> bool {
        match (&self.parent, parent) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Display for StorageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({}: {})", name, self.storage_type, self.url),
            None => write!(f, "{}: {}", self.storage_type, self.url),
        }
    }
}

/// An archive living inside a storage or another package.
#[derive(Debug, Clone)]
pub struct PackageNode {
    pub location: String,
    pub format: Option<String>,
    pub storage: Option<Arc<StorageNode>>,
    pub package: Option<Arc<PackageNode>>,
}

impl PackageNode {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            format: None,
            storage: None,
            package: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn in_storage(mut self, storage: Arc<StorageNode>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn in_package(mut self, package: Arc<PackageNode>) -> Self {
        self.package = Some(package);
        self
    }

    /// The package itself, seen as an item to retrieve from its own parent.
    pub fn as_data_item(&self) -> DataItem {
        DataItem {
            location: self.location.clone(),
            format: self.format.clone(),
            semantic: None,
            storage: self.storage.clone(),
            package: self.package.clone(),
        }
    }
}

/// The leaf descriptor handed in by callers.
///
/// If `package` is set it takes precedence over `storage`. With neither set,
/// `location` is a plain local path.
#[derive(Debug, Clone)]
pub struct DataItem {
    pub location: String,
    pub format: Option<String>,
    pub semantic: Option<String>,
    pub storage: Option<Arc<StorageNode>>,
    pub package: Option<Arc<PackageNode>>,
}

impl DataItem {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            format: None,
            semantic: None,
            storage: None,
            package: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_semantic(mut self, semantic: impl Into<String>) -> Self {
        self.semantic = Some(semantic.into());
        self
    }

    pub fn in_storage(mut self, storage: Arc<StorageNode>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn in_package(mut self, package: Arc<PackageNode>) -> Self {
        self.package = Some(package);
        self
    }
}

impl std::fmt::Display for DataItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.format {
            Some(format) => write!(f, "{} ({})", self.location, format),
            None => write!(f, "{}", self.location),
        }
    }
}
