use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::{instrument, warn};

use super::{compile_pattern, Connection, HandlerDescriptor, Retrieved, StorageHandler};
use crate::{Error, StorageAuth};

pub(crate) static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "directory",
    allows_child_storages: true,
    allows_parent_storage: true,
    is_local: true,
};

pub(crate) fn test(locator: &str) -> bool {
    Path::new(locator).is_dir()
}

/// A plain directory on the local file system. Members are never copied,
/// retrieval hands out their path inside the directory.
#[derive(Debug, Clone)]
pub struct DirectoryStorageHandler {
    root: PathBuf,
}

impl DirectoryStorageHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_url(
        url: &str,
        _auth: Option<Arc<StorageAuth>>,
    ) -> Result<Box<dyn StorageHandler>, Error> {
        Ok(Box::new(Self::new(url)))
    }
}

#[async_trait]
impl StorageHandler for DirectoryStorageHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &DESCRIPTOR
    }

    #[instrument(skip_all, err, fields(storage.url = %self.root.display()))]
    async fn open(&self) -> Result<Box<dyn Connection>, Error> {
        let metadata = tokio::fs::metadata(&self.root).await.map_err(|e| {
            Error::Connection(format!("unable to open {}: {}", self.root.display(), e))
        })?;
        if !metadata.is_dir() {
            return Err(Error::Connection(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }

        Ok(Box::new(DirectoryConnection {
            root: self.root.clone(),
        }))
    }

    fn vsi_path(&self, location: &str) -> String {
        self.root.join(location).to_string_lossy().into_owned()
    }
}

struct DirectoryConnection {
    root: PathBuf,
}

#[async_trait]
impl Connection for DirectoryConnection {
    #[instrument(skip_all, err, fields(item.location = location))]
    async fn retrieve(&mut self, location: &str, _hint: &Path) -> Result<Retrieved, Error> {
        let path = self.root.join(location);
        if !tokio::fs::try_exists(&path).await? {
            return Err(Error::NotFound(format!(
                "{} does not exist",
                path.display()
            )));
        }
        Ok(Retrieved::Relocated(path))
    }

    fn list_files<'a>(
        &'a mut self,
        pattern: Option<&'a str>,
    ) -> BoxStream<'a, Result<String, Error>> {
        Box::pin(try_stream! {
            // validates the pattern before it is glued to the root.
            compile_pattern(pattern)?;
            let full = self.root.join(pattern.unwrap_or("*"));
            let full = full.to_string_lossy().into_owned();

            let paths = glob::glob(&full)
                .map_err(|e| Error::InvalidStorage(format!("invalid glob pattern: {}", e)))?;
            for entry in paths {
                match entry {
                    Ok(path) => yield path.to_string_lossy().into_owned(),
                    Err(e) => warn!(err = %e, "skipping unreadable directory entry"),
                }
            }
        })
    }
}
