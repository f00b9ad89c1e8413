use std::path::Path;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use suppaftp::types::FileType;
use suppaftp::{AsyncFtpStream, FtpError, Status};
use tokio::io::AsyncWriteExt;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::io::InspectReader;
use tracing::{debug, instrument, warn, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use url::Url;

use super::{
    compile_pattern, matches, prepare_hint, Connection, HandlerDescriptor, Retrieved,
    StorageHandler,
};
use crate::{Error, StorageAuth};

pub(crate) static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "FTP",
    allows_child_storages: true,
    allows_parent_storage: false,
    is_local: false,
};

const DEFAULT_USER: &str = "anonymous";

pub(crate) fn test(locator: &str) -> bool {
    Url::parse(locator)
        .map(|url| url.scheme() == "ftp")
        .unwrap_or(false)
}

/// `550`, the server's answer for missing files and empty directories alike.
fn is_unavailable(e: &FtpError) -> bool {
    matches!(e, FtpError::UnexpectedResponse(resp) if resp.status == Status::FileUnavailable)
}

fn retrieve_error(remote: &str, e: FtpError) -> Error {
    if is_unavailable(&e) {
        Error::NotFound(format!("{} is not available: {}", remote, e))
    } else if let FtpError::ConnectionError(io) = e {
        Error::Connection(format!("lost ftp session retrieving {}: {}", remote, io))
    } else {
        Error::Io(format!("unable to retrieve {}: {}", remote, e))
    }
}

/// A directory on an FTP server. Credentials are taken from the url, falling
/// back to an anonymous login.
#[derive(Debug, Clone)]
pub struct FtpStorageHandler {
    url: Url,
}

impl FtpStorageHandler {
    pub fn new(url: Url) -> Result<Self, Error> {
        if url.host_str().is_none() {
            return Err(Error::InvalidStorage(format!("{} has no host", url)));
        }
        Ok(Self { url })
    }

    pub fn from_url(
        url: &str,
        _auth: Option<Arc<StorageAuth>>,
    ) -> Result<Box<dyn StorageHandler>, Error> {
        Ok(Box::new(Self::new(Url::parse(url)?)?))
    }

    /// Path of `location` on the server. Absolute locations are taken as is.
    fn remote_path(&self, location: &str) -> String {
        if location.starts_with('/') {
            location.to_string()
        } else {
            format!("{}/{}", self.url.path().trim_end_matches('/'), location)
        }
    }
}

#[async_trait]
impl StorageHandler for FtpStorageHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &DESCRIPTOR
    }

    #[instrument(skip_all, err, fields(storage.url = %super::http::redact_url(&self.url)))]
    async fn open(&self) -> Result<Box<dyn Connection>, Error> {
        let host = self.url.host_str().unwrap_or_default();
        let port = self.url.port_or_known_default().unwrap_or(21);
        let user = match self.url.username() {
            "" => DEFAULT_USER,
            user => user,
        };
        let password = self.url.password().unwrap_or(DEFAULT_USER);

        let session = async {
            let mut stream = AsyncFtpStream::connect((host, port)).await?;
            stream.login(user, password).await?;
            stream.transfer_type(FileType::Binary).await?;
            Ok::<_, FtpError>(stream)
        }
        .await
        .map_err(|e| Error::Connection(format!("unable to open ftp session: {}", e)))?;

        debug!("logged in");

        Ok(Box::new(FtpConnection {
            handler: self.clone(),
            stream: session,
        }))
    }

    fn vsi_path(&self, location: &str) -> String {
        match self.url.join(location) {
            Ok(url) => format!("/vsicurl/{}", url),
            Err(_) => format!("/vsicurl/{}", crate::vsi::join(self.url.as_str(), location)),
        }
    }
}

/// An FTP session. Dropping it, e.g. when a deadline passes mid transfer,
/// closes the control and data connections.
struct FtpConnection {
    handler: FtpStorageHandler,
    stream: AsyncFtpStream,
}

#[async_trait]
impl Connection for FtpConnection {
    #[instrument(skip_all, err, fields(item.location = location, hint = %hint.display(), indicatif.pb_show = 1))]
    async fn retrieve(&mut self, location: &str, hint: &Path) -> Result<Retrieved, Error> {
        prepare_hint(hint).await?;
        let remote = self.handler.remote_path(location);

        let span = Span::current();
        span.pb_set_message(&format!("Downloading {}", location));

        let data = self
            .stream
            .retr_as_stream(&remote)
            .await
            .map_err(|e| retrieve_error(&remote, e))?;
        let mut reader = InspectReader::new(data.compat(), |chunk| span.pb_inc(chunk.len() as u64));

        let mut out = tokio::fs::File::create(hint).await?;
        let size = tokio::io::copy(&mut reader, &mut out).await?;
        out.flush().await?;

        // the server only confirms the transfer once the data connection is
        // gone.
        drop(reader);
        self.stream
            .read_response_in(&[Status::ClosingDataConnection, Status::RequestedFileActionOk])
            .await
            .map_err(|e| retrieve_error(&remote, e))?;

        debug!(size, "retrieved");
        Ok(Retrieved::AtHint)
    }

    fn list_files<'a>(
        &'a mut self,
        pattern: Option<&'a str>,
    ) -> BoxStream<'a, Result<String, Error>> {
        Box::pin(try_stream! {
            let pattern = compile_pattern(pattern)?;
            let dir = self.handler.url.path().to_string();
            let dir = Some(dir.as_str()).filter(|d| !d.is_empty() && *d != "/");

            let names = match self.stream.nlst(dir).await {
                Ok(names) => names,
                // an empty or missing directory
                Err(e) if is_unavailable(&e) => Vec::new(),
                Err(e) => Err(Error::Io(format!("unable to list files: {}", e)))?,
            };

            for name in names {
                // some servers answer with full paths.
                let name = name.rsplit('/').next().unwrap_or_default().to_string();
                if !name.is_empty() && matches(&pattern, &name) {
                    yield name;
                }
            }
        })
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        let mut conn = self;
        let res = conn
            .stream
            .quit()
            .await
            .map_err(|e| Error::Connection(format!("unable to quit ftp session: {}", e)));
        if let Err(e) = &res {
            warn!(err = %e, "ftp session did not shut down cleanly");
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::fixtures::serve_ftp;

    #[rstest]
    #[case("ftp://example.com/pub/", true)]
    #[case("FTP://example.com/pub/", true)]
    #[case("http://example.com/pub/", false)]
    #[case("/pub/", false)]
    fn sniffs_ftp_urls(#[case] locator: &str, #[case] exp: bool) {
        assert_eq!(exp, test(locator));
    }

    #[rstest]
    #[case("ftp://host/pub/", "band1.tif", "/pub/band1.tif")]
    #[case("ftp://host/pub", "band1.tif", "/pub/band1.tif")]
    #[case("ftp://host", "band1.tif", "/band1.tif")]
    #[case("ftp://host/pub/", "/other/band1.tif", "/other/band1.tif")]
    fn remote_paths(#[case] url: &str, #[case] location: &str, #[case] exp: &str) {
        let handler = FtpStorageHandler::new(Url::parse(url).unwrap()).unwrap();
        assert_eq!(exp, handler.remote_path(location));
    }

    #[test]
    fn vsi_path() {
        let handler = FtpStorageHandler::new(Url::parse("ftp://host/pub/").unwrap()).unwrap();
        assert_eq!("/vsicurl/ftp://host/pub/band1.tif", handler.vsi_path("band1.tif"));
    }

    #[tokio::test]
    async fn unreachable_server_is_connection_error() {
        // bind and drop, so nothing is listening on that port anymore.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let handler = FtpStorageHandler::from_url(&format!("ftp://127.0.0.1:{}/", port), None)
            .unwrap();

        let res = handler.open().await;
        assert!(matches!(res, Err(Error::Connection(_))));
        assert!(res.err().unwrap().is_retryable());
    }

    #[tokio::test]
    async fn retrieves_and_lists() {
        let base = serve_ftp(&[
            ("/pub/band1.tif", "tif data"),
            ("/pub/meta.xml", "<meta/>"),
        ])
        .await;
        let tmp = TempDir::new().unwrap();

        let handler = FtpStorageHandler::from_url(&format!("{}/pub/", base), None).unwrap();
        let mut conn = handler.open().await.expect("must log in");

        let hint = tmp.path().join("slot").join("band1.tif");
        assert_eq!(Retrieved::AtHint, conn.retrieve("band1.tif", &hint).await.unwrap());
        assert_eq!("tif data", std::fs::read_to_string(&hint).unwrap());

        let files: Vec<String> = conn.list_files(Some("*.tif")).try_collect().await.unwrap();
        assert_eq!(vec!["band1.tif".to_string()], files);

        conn.close().await.expect("must quit");
    }

    #[tokio::test]
    async fn unavailable_is_not_found_or_empty() {
        let base = serve_ftp(&[("/pub/band1.tif", "tif data")]).await;
        let tmp = TempDir::new().unwrap();

        let handler = FtpStorageHandler::from_url(&format!("{}/pub/", base), None).unwrap();
        let mut conn = handler.open().await.unwrap();
        let res = conn.retrieve("band9.tif", &tmp.path().join("band9.tif")).await;
        assert!(matches!(res, Err(Error::NotFound(_))), "{:?}", res);

        // the session survives a missing file.
        conn.retrieve("band1.tif", &tmp.path().join("band1.tif"))
            .await
            .expect("must retrieve after a miss");

        let handler = FtpStorageHandler::from_url(&format!("{}/empty/", base), None).unwrap();
        let mut conn = handler.open().await.unwrap();
        let files: Vec<String> = conn.list_files(None).try_collect().await.unwrap();
        assert!(files.is_empty());
    }
}
