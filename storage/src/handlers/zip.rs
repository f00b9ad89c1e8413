use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::{debug, instrument};
use zip::ZipArchive;

use super::{
    compile_pattern, matches, prepare_hint, Connection, HandlerDescriptor, Retrieved,
    StorageHandler,
};
use crate::{vsi, Error, StorageAuth};

pub(crate) static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "ZIP",
    allows_child_storages: true,
    allows_parent_storage: true,
    is_local: true,
};

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: [u8; 4] = *b"PK\x05\x06";

/// Checks the local file header magic, without parsing the archive.
pub(crate) fn test(locator: &str) -> bool {
    let mut magic = [0u8; 4];
    match File::open(locator).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => magic == ZIP_MAGIC || magic == ZIP_EMPTY_MAGIC,
        Err(_) => false,
    }
}

/// A ZIP archive on the local file system.
#[derive(Debug, Clone)]
pub struct ZipStorageHandler {
    package: PathBuf,
}

impl ZipStorageHandler {
    pub fn new(package: impl Into<PathBuf>) -> Self {
        Self {
            package: package.into(),
        }
    }

    pub fn from_url(
        url: &str,
        _auth: Option<Arc<StorageAuth>>,
    ) -> Result<Box<dyn StorageHandler>, Error> {
        Ok(Box::new(Self::new(url)))
    }
}

#[async_trait]
impl StorageHandler for ZipStorageHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &DESCRIPTOR
    }

    #[instrument(skip_all, err, fields(storage.url = %self.package.display()))]
    async fn open(&self) -> Result<Box<dyn Connection>, Error> {
        let package = self.package.clone();
        let archive = tokio::task::spawn_blocking(move || {
            let file = File::open(&package)?;
            ZipArchive::new(file)
        })
        .await?
        .map_err(|e| {
            Error::Connection(format!(
                "unable to open zip archive {}: {}",
                self.package.display(),
                e
            ))
        })?;

        debug!(entries = archive.len(), "opened zip archive");

        Ok(Box::new(ZipConnection {
            archive: Some(archive),
        }))
    }

    fn vsi_path(&self, location: &str) -> String {
        vsi::join(&format!("/vsizip/{}", self.package.display()), location)
    }
}

struct ZipConnection {
    // moved onto the blocking pool while in use.
    archive: Option<ZipArchive<File>>,
}

impl ZipConnection {
    fn take_archive(&mut self) -> Result<ZipArchive<File>, Error> {
        self.archive
            .take()
            .ok_or_else(|| Error::Io("zip archive is no longer available".to_string()))
    }
}

#[async_trait]
impl Connection for ZipConnection {
    #[instrument(skip_all, err, fields(item.location = location, hint = %hint.display()))]
    async fn retrieve(&mut self, location: &str, hint: &Path) -> Result<Retrieved, Error> {
        prepare_hint(hint).await?;

        let mut archive = self.take_archive()?;
        let location = location.to_string();
        let hint = hint.to_path_buf();
        let (archive, result) = tokio::task::spawn_blocking(move || {
            let result = (|| -> Result<u64, Error> {
                let mut member = archive.by_name(&location).map_err(|e| match e {
                    zip::result::ZipError::FileNotFound => {
                        Error::NotFound(format!("{} is not a member of the archive", location))
                    }
                    e => e.into(),
                })?;
                let mut out = File::create(&hint)?;
                Ok(std::io::copy(&mut member, &mut out)?)
            })();
            (archive, result)
        })
        .await?;
        self.archive = Some(archive);

        let size = result?;
        debug!(size, "extracted zip member");

        Ok(Retrieved::AtHint)
    }

    fn list_files<'a>(
        &'a mut self,
        pattern: Option<&'a str>,
    ) -> BoxStream<'a, Result<String, Error>> {
        Box::pin(try_stream! {
            let pattern = compile_pattern(pattern)?;
            let archive = self
                .archive
                .as_ref()
                .ok_or_else(|| Error::Io("zip archive is no longer available".to_string()))?;
            for name in archive.file_names() {
                if matches(&pattern, name) {
                    yield name.to_string();
                }
            }
        })
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        drop(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use futures::TryStreamExt;
    use tempfile::TempDir;

    use super::*;
    use crate::fixtures::write_zip;

    #[test]
    fn sniffs_zip_files() {
        let tmp = TempDir::new().unwrap();
        let zip = tmp.path().join("a.zip");
        write_zip(&zip, &[("band1.tif", "tif")]);
        let other = tmp.path().join("a.txt");
        std::fs::File::create(&other)
            .unwrap()
            .write_all(b"hello world")
            .unwrap();

        assert!(test(zip.to_str().unwrap()));
        assert!(!test(other.to_str().unwrap()));
        assert!(!test(tmp.path().to_str().unwrap()));
        assert!(!test("/does/not/exist.zip"));
    }

    #[tokio::test]
    async fn extracts_member_to_hint() {
        let tmp = TempDir::new().unwrap();
        let zip = tmp.path().join("scene.zip");
        write_zip(&zip, &[("band1.tif", "tif data"), ("meta.xml", "<xml/>")]);

        let handler = ZipStorageHandler::new(&zip);
        let mut conn = handler.open().await.expect("must open");
        let hint = tmp.path().join("out").join("band1.tif");
        let retrieved = conn.retrieve("band1.tif", &hint).await.expect("must retrieve");

        assert_eq!(Retrieved::AtHint, retrieved);
        assert_eq!(b"tif data".to_vec(), std::fs::read(&hint).unwrap());

        // the connection stays usable after a retrieval.
        let files: Vec<String> = conn.list_files(Some("*.xml")).try_collect().await.unwrap();
        assert_eq!(vec!["meta.xml".to_string()], files);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_member() {
        let tmp = TempDir::new().unwrap();
        let zip = tmp.path().join("scene.zip");
        write_zip(&zip, &[("band1.tif", "tif data")]);

        let handler = ZipStorageHandler::new(&zip);
        let mut conn = handler.open().await.unwrap();
        let res = conn.retrieve("band2.tif", &tmp.path().join("band2.tif")).await;

        assert!(matches!(res, Err(Error::NotFound(_))), "{:?}", res);
    }

    #[tokio::test]
    async fn corrupt_archive_fails_to_open() {
        let tmp = TempDir::new().unwrap();
        let zip = tmp.path().join("broken.zip");
        std::fs::write(&zip, b"PK\x03\x04 definitely not a zip").unwrap();

        let handler = ZipStorageHandler::new(&zip);
        assert!(matches!(handler.open().await, Err(Error::Connection(_))));
    }

    #[test]
    fn vsi_path() {
        let handler = ZipStorageHandler::new("/data/scene.zip");
        assert_eq!("/vsizip//data/scene.zip/band1.tif", handler.vsi_path("band1.tif"));
    }
}
