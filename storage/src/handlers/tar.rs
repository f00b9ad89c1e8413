use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_compression::tokio::bufread::GzipDecoder;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_tar::{Archive, ArchiveBuilder};
use tracing::{debug, instrument};

use super::{
    compile_pattern, matches, prepare_hint, Connection, HandlerDescriptor, Retrieved,
    StorageHandler,
};
use crate::{vsi, Error, StorageAuth};

pub(crate) static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "TAR",
    allows_child_storages: true,
    allows_parent_storage: true,
    is_local: true,
};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const USTAR_MAGIC: &[u8] = b"ustar";
const USTAR_MAGIC_OFFSET: usize = 257;

/// Recognizes POSIX/GNU tarballs by their header magic, and gzip-compressed
/// ones by magic and file extension.
pub(crate) fn test(locator: &str) -> bool {
    let mut header = [0u8; 512];
    let read = match File::open(locator).and_then(|mut f| f.read(&mut header)) {
        Ok(read) => read,
        Err(_) => return false,
    };
    let header = &header[..read];

    if header.starts_with(&GZIP_MAGIC) {
        return locator.ends_with(".tar.gz") || locator.ends_with(".tgz");
    }

    header
        .get(USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + USTAR_MAGIC.len())
        .map_or(false, |magic| magic == USTAR_MAGIC)
}

/// A tarball on the local file system, optionally gzip-compressed.
///
/// Tarballs can only be read front to back, so every operation on a
/// connection scans the archive from the start.
#[derive(Debug, Clone)]
pub struct TarStorageHandler {
    package: PathBuf,
}

impl TarStorageHandler {
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

/// Opens the tarball, popping a gzip layer if there is one.
async fn open_archive(
    package: &Path,
) -> std::io::Result<Archive<Box<dyn AsyncRead + Send + Unpin>>> {
    let file = tokio::fs::File::open(package).await?;
    let mut reader = BufReader::new(file);
    let compressed = reader.fill_buf().await?.starts_with(&GZIP_MAGIC);

    let reader: Box<dyn AsyncRead + Send + Unpin> = if compressed {
        Box::new(GzipDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    // extracted members age from their extraction, as retention expects.
    Ok(ArchiveBuilder::new(reader).set_preserve_mtime(false).build())
}

/// Member names are compared without a leading `./`.
fn normalize(name: &str) -> &str {
    name.trim_start_matches("./")
}

#[async_trait]
impl StorageHandler for TarStorageHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &DESCRIPTOR
    }

    #[instrument(skip_all, err, fields(storage.url = %self.package.display()))]
    async fn open(&self) -> Result<Box<dyn Connection>, Error> {
        let to_connection_error = |e: std::io::Error| {
            Error::Connection(format!(
                "unable to open tarball {}: {}",
                self.package.display(),
                e
            ))
        };

        // read the first header, to fail early on something that isn't a
        // tarball at all.
        let mut archive = open_archive(&self.package)
            .await
            .map_err(to_connection_error)?;
        let mut entries = archive.entries().map_err(to_connection_error)?;
        if let Some(first) = entries.next().await {
            first.map_err(to_connection_error)?;
        }

        Ok(Box::new(TarConnection {
            package: self.package.clone(),
        }))
    }

    fn vsi_path(&self, location: &str) -> String {
        vsi::join(&format!("/vsitar/{}", self.package.display()), location)
    }
}

struct TarConnection {
    package: PathBuf,
}

#[async_trait]
impl Connection for TarConnection {
    #[instrument(skip_all, err, fields(item.location = location, hint = %hint.display()))]
    async fn retrieve(&mut self, location: &str, hint: &Path) -> Result<Retrieved, Error> {
        prepare_hint(hint).await?;

        let mut archive = open_archive(&self.package).await?;
        let mut entries = archive.entries()?;
        while let Some(entry) = entries.next().await {
            let mut entry = entry?;
            if normalize(&entry.path()?.to_string_lossy()) != normalize(location) {
                continue;
            }
            if !entry.header().entry_type().is_file() {
                return Err(Error::NotFound(format!(
                    "{} is not a regular file in the tarball",
                    location
                )));
            }

            entry.unpack(hint).await?;
            debug!("extracted tar member");
            return Ok(Retrieved::AtHint);
        }

        Err(Error::NotFound(format!(
            "{} is not a member of {}",
            location,
            self.package.display()
        )))
    }

    fn list_files<'a>(
        &'a mut self,
        pattern: Option<&'a str>,
    ) -> BoxStream<'a, Result<String, Error>> {
        Box::pin(try_stream! {
            let pattern = compile_pattern(pattern)?;
            let mut archive = open_archive(&self.package).await?;
            let mut entries = archive.entries()?;
            while let Some(entry) = entries.next().await {
                let entry = entry?;
                let name = entry.path()?.to_string_lossy().into_owned();
                if matches(&pattern, normalize(&name)) {
                    yield name;
                }
            }
        })
    }
}
