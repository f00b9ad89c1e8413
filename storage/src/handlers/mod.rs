use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, TryStreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::io::{InspectReader, StreamReader};
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::registry::HandlerRegistry;
use crate::Error;

mod directory;
mod ftp;
mod http;
#[cfg(feature = "cloud")]
mod s3;
mod swift;
mod tar;
mod zip;

pub use self::directory::DirectoryStorageHandler;
pub use self::ftp::FtpStorageHandler;
pub use self::http::HttpStorageHandler;
pub(crate) use self::http::http_client;
#[cfg(feature = "cloud")]
pub use self::s3::S3StorageHandler;
pub use self::swift::SwiftStorageHandler;
pub use self::tar::TarStorageHandler;
pub use self::zip::ZipStorageHandler;

/// Static capabilities of a kind of storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerDescriptor {
    /// The `storage_type` this handler is registered under.
    pub name: &'static str,
    /// Whether other storages may be nested inside this one.
    pub allows_child_storages: bool,
    /// Whether this storage may itself be nested inside another one.
    pub allows_parent_storage: bool,
    /// Whether members are addressable on the local file system, which means
    /// the storage must be materialized before it can be opened.
    pub is_local: bool,
}

/// Where a retrieved member ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retrieved {
    /// The member was written to the hint path passed in.
    AtHint,
    /// The handler chose another path, which callers must use from now on.
    Relocated(PathBuf),
}

impl Retrieved {
    pub fn into_path(self, hint: &Path) -> PathBuf {
        match self {
            Retrieved::AtHint => hint.to_path_buf(),
            Retrieved::Relocated(path) => path,
        }
    }
}

/// The base trait all storage handlers need to implement.
///
/// A handler is bound to one storage url and is cheap to construct: nothing is
/// touched until [StorageHandler::open] is called. Virtual paths can be
/// produced without ever opening the storage.
#[async_trait]
pub trait StorageHandler: Send + Sync {
    fn descriptor(&self) -> &'static HandlerDescriptor;

    /// Opens the storage, e.g. by mounting an archive or logging into a
    /// remote server. The returned [Connection] must be closed after use.
    async fn open(&self) -> Result<Box<dyn Connection>, Error>;

    /// Returns a path a GDAL-style reader can use to access `location`
    /// without materializing a copy.
    fn vsi_path(&self, location: &str) -> String;

    /// Additional environment needed to interpret [StorageHandler::vsi_path].
    fn vsi_env(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// An open session on a storage.
///
/// Dropping a connection releases its resources as well, [Connection::close]
/// exists so that errors on shutdown can be observed.
#[async_trait]
pub trait Connection: Send {
    /// Materializes `location`, preferably at `hint`.
    async fn retrieve(&mut self, location: &str, hint: &Path) -> Result<Retrieved, Error>;

    /// Lists the members of the storage, optionally filtered by a shell-style
    /// glob pattern.
    fn list_files<'a>(
        &'a mut self,
        _pattern: Option<&'a str>,
    ) -> BoxStream<'a, Result<String, Error>> {
        Box::pin(futures::stream::once(async {
            Err(Error::Unsupported("listing files".to_string()))
        }))
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        Ok(())
    }
}

/// Register the builtin handlers with the given registry, in their default
/// order.
pub fn add_default_handlers(reg: &mut HandlerRegistry) {
    reg.register(
        &directory::DESCRIPTOR,
        directory::test,
        DirectoryStorageHandler::from_url,
    );
    reg.register(&zip::DESCRIPTOR, zip::test, ZipStorageHandler::from_url);
    reg.register(&tar::DESCRIPTOR, tar::test, TarStorageHandler::from_url);
    reg.register(&http::DESCRIPTOR, http::test, HttpStorageHandler::from_url);
    reg.register(&ftp::DESCRIPTOR, ftp::test, FtpStorageHandler::from_url);
    #[cfg(feature = "cloud")]
    reg.register(&s3::DESCRIPTOR, |_| false, S3StorageHandler::from_url);
    reg.register(&swift::DESCRIPTOR, |_| false, SwiftStorageHandler::from_url);
}

/// Compiles an optional shell-style pattern.
pub(crate) fn compile_pattern(pattern: Option<&str>) -> Result<Option<glob::Pattern>, Error> {
    pattern
        .map(|p| {
            glob::Pattern::new(p)
                .map_err(|e| Error::InvalidStorage(format!("invalid glob pattern {:?}: {}", p, e)))
        })
        .transpose()
}

pub(crate) fn matches(pattern: &Option<glob::Pattern>, name: &str) -> bool {
    pattern.as_ref().map_or(true, |p| p.matches(name))
}

/// Makes sure the directory a member is going to be written to exists.
pub(crate) async fn prepare_hint(hint: &Path) -> Result<(), Error> {
    if let Some(parent) = hint.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Writes a stream of chunks to `hint`, advancing the progress bar of the
/// current span as data comes in. Returns the number of bytes written.
pub(crate) async fn write_stream<S, E>(stream: S, hint: &Path) -> Result<u64, Error>
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Into<Error>,
{
    prepare_hint(hint).await?;

    let span = Span::current();
    let reader = StreamReader::new(Box::pin(stream.map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::Other, Into::<Error>::into(e))
    })));
    let mut reader = InspectReader::new(reader, |chunk| span.pb_inc(chunk.len() as u64));

    let mut file = tokio::fs::File::create(hint).await?;
    let written = tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(|e| {
            // failures of the stream itself come back wrapped.
            match e.get_ref().and_then(|inner| inner.downcast_ref::<Error>()) {
                Some(inner) => inner.clone(),
                None => Error::from(e),
            }
        })?;
    file.flush().await?;

    Ok(written)
}
