use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use tracing::{debug, instrument, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use super::{
    compile_pattern, matches, write_stream, Connection, HandlerDescriptor, Retrieved,
    StorageHandler,
};
use crate::{vsi, Error, StorageAuth};

pub(crate) static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "S3",
    allows_child_storages: true,
    allows_parent_storage: false,
    is_local: false,
};

/// A bucket in an S3 compatible object store.
///
/// Endpoint and credentials come from the storage auth if one is attached,
/// and from the usual `AWS_*` environment variables otherwise.
#[derive(Debug, Clone)]
pub struct S3StorageHandler {
    bucket: String,
    auth: Option<Arc<StorageAuth>>,
    // set up on open unless given.
    store: Option<Arc<dyn ObjectStore>>,
}

impl S3StorageHandler {
    pub fn new(bucket: impl Into<String>, auth: Option<Arc<StorageAuth>>) -> Self {
        Self {
            bucket: bucket.into(),
            auth,
            store: None,
        }
    }

    /// Serves the bucket from an already configured [ObjectStore], e.g.
    /// [object_store::memory::InMemory].
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn from_url(
        url: &str,
        auth: Option<Arc<StorageAuth>>,
    ) -> Result<Box<dyn StorageHandler>, Error> {
        let bucket = url.strip_prefix("s3://").unwrap_or(url).trim_matches('/');
        Ok(Box::new(Self::new(bucket, auth)))
    }

    fn build_store(&self) -> Result<Arc<dyn ObjectStore>, Error> {
        if let Some(store) = &self.store {
            return Ok(store.clone());
        }
        if self.bucket.is_empty() {
            return Err(Error::InvalidStorage("S3 storage without a bucket".to_string()));
        }

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&self.bucket);
        if let Some(auth) = &self.auth {
            builder = builder
                .with_endpoint(&auth.url)
                .with_allow_http(auth.url.starts_with("http://"))
                .with_virtual_hosted_style_request(
                    std::env::var("AWS_VIRTUAL_HOSTING")
                        .map(|v| v.eq_ignore_ascii_case("TRUE"))
                        .unwrap_or(false),
                );
            if let Some(key) = auth.parameters.get("ACCESS_KEY_ID") {
                builder = builder.with_access_key_id(key);
            }
            if let Some(secret) = auth.parameters.get("SECRET_ACCESS_KEY") {
                builder = builder.with_secret_access_key(secret);
            }
            if let Some(region) = auth.parameters.get("AWS_REGION") {
                builder = builder.with_region(region);
            }
        }

        let store = builder
            .build()
            .map_err(|e| Error::InvalidStorage(format!("unable to configure S3 client: {}", e)))?;
        Ok(Arc::new(store))
    }
}

fn object_path(location: &str) -> object_store::path::Path {
    object_store::path::Path::from(location.trim_start_matches('/'))
}

#[async_trait]
impl StorageHandler for S3StorageHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &DESCRIPTOR
    }

    #[instrument(skip_all, err, fields(storage.url = %self.bucket))]
    async fn open(&self) -> Result<Box<dyn Connection>, Error> {
        Ok(Box::new(S3Connection {
            store: self.build_store()?,
        }))
    }

    fn vsi_path(&self, location: &str) -> String {
        if self.bucket.is_empty() {
            vsi::join("/vsis3", location)
        } else {
            vsi::join(&format!("/vsis3/{}", self.bucket), location)
        }
    }

    fn vsi_env(&self) -> BTreeMap<String, String> {
        self.auth
            .as_ref()
            .map(|auth| auth.vsi_env())
            .unwrap_or_default()
    }
}

struct S3Connection {
    store: Arc<dyn ObjectStore>,
}

#[async_trait]
impl Connection for S3Connection {
    #[instrument(skip_all, err, fields(item.location = location, indicatif.pb_show = 1))]
    async fn retrieve(&mut self, location: &str, hint: &Path) -> Result<Retrieved, Error> {
        let span = Span::current();
        span.pb_set_style(&vsistore_tracing::PB_TRANSFER_STYLE);
        span.pb_set_message(&format!("Downloading {}", location));

        let result = self.store.get(&object_path(location)).await?;
        span.pb_set_length(result.meta.size as u64);

        let size = write_stream(result.into_stream(), hint).await?;
        debug!(size, "downloaded");
        Ok(Retrieved::AtHint)
    }

    fn list_files<'a>(
        &'a mut self,
        pattern: Option<&'a str>,
    ) -> BoxStream<'a, Result<String, Error>> {
        Box::pin(try_stream! {
            let pattern = compile_pattern(pattern)?;
            let mut objects = self.store.list(None).map_err(Error::from);
            while let Some(meta) = objects.next().await {
                let name = meta?.location.to_string();
                if matches(&pattern, &name) {
                    yield name;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    async fn bucket_with(objects: &[(&str, &'static str)]) -> S3StorageHandler {
        let store = InMemory::new();
        for (name, body) in objects {
            store.put(&object_path(name), (*body).into()).await.unwrap();
        }
        S3StorageHandler::new("bucket", None).with_store(Arc::new(store))
    }

    #[rstest]
    #[case("bucket", "a/b.tif", "/vsis3/bucket/a/b.tif")]
    #[case("s3://bucket/", "/a/b.tif", "/vsis3/bucket/a/b.tif")]
    #[case("", "a/b.tif", "/vsis3/a/b.tif")]
    fn vsi_path(#[case] url: &str, #[case] location: &str, #[case] exp: &str) {
        let handler = S3StorageHandler::from_url(url, None).unwrap();
        assert_eq!(exp, handler.vsi_path(location));
    }

    #[test]
    fn vsi_env_comes_from_auth() {
        let auth = Arc::new(
            StorageAuth::new("S3", "http://minio:9000").with_parameter("AWS_REGION", "eu-1"),
        );
        let handler = S3StorageHandler::new("bucket", Some(auth));
        let env = handler.vsi_env();

        assert_eq!(Some("http://minio:9000"), env.get("AWS_S3_ENDPOINT").map(String::as_str));
        assert_eq!(Some("eu-1"), env.get("AWS_REGION").map(String::as_str));

        assert!(S3StorageHandler::new("bucket", None).vsi_env().is_empty());
    }

    #[tokio::test]
    async fn open_requires_bucket() {
        let handler = S3StorageHandler::new("", None);
        assert!(matches!(handler.open().await, Err(Error::InvalidStorage(_))));
    }

    #[test]
    fn object_paths_are_relative() {
        assert_eq!("a/b.tif", object_path("/a/b.tif").as_ref());
    }

    #[tokio::test]
    async fn retrieves_objects() {
        let tmp = TempDir::new().unwrap();
        let handler = bucket_with(&[("scenes/band1.tif", "band1")]).await;
        let mut conn = handler.open().await.unwrap();

        let hint = tmp.path().join("band1.tif");
        assert_eq!(
            Retrieved::AtHint,
            conn.retrieve("/scenes/band1.tif", &hint).await.unwrap()
        );
        assert_eq!("band1", std::fs::read_to_string(&hint).unwrap());

        let err = conn
            .retrieve("scenes/band9.tif", &tmp.path().join("band9.tif"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "unexpected error: {}", err);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn lists_objects_matching_a_pattern() {
        let handler = bucket_with(&[
            ("scenes/band1.tif", "band1"),
            ("scenes/band2.tif", "band2"),
            ("scenes/metadata.xml", "<xml/>"),
        ])
        .await;
        let mut conn = handler.open().await.unwrap();

        let mut files: Vec<String> = conn
            .list_files(Some("scenes/*.tif"))
            .try_collect()
            .await
            .unwrap();
        files.sort();
        assert_eq!(vec!["scenes/band1.tif", "scenes/band2.tif"], files);

        let all: Vec<String> = conn.list_files(None).try_collect().await.unwrap();
        assert_eq!(3, all.len());
    }
}
