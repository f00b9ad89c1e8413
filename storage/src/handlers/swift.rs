use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::{debug, instrument, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use super::http::{download, http_client};
use super::{compile_pattern, matches, Connection, HandlerDescriptor, Retrieved, StorageHandler};
use crate::{vsi, Error, StorageAuth};

pub(crate) static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "swift",
    allows_child_storages: true,
    allows_parent_storage: false,
    is_local: false,
};

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// A container in an OpenStack Swift object store.
///
/// The attached storage auth carries the storage url and a token, either
/// directly or, for keystone auths, once resolved by
/// [crate::keystone::resolve].
#[derive(Debug, Clone)]
pub struct SwiftStorageHandler {
    container: String,
    auth: Option<Arc<StorageAuth>>,
}

impl SwiftStorageHandler {
    pub fn new(container: impl Into<String>, auth: Option<Arc<StorageAuth>>) -> Self {
        Self {
            container: container.into(),
            auth,
        }
    }

    pub fn from_url(
        url: &str,
        auth: Option<Arc<StorageAuth>>,
    ) -> Result<Box<dyn StorageHandler>, Error> {
        Ok(Box::new(Self::new(url.trim_matches('/'), auth)))
    }
}

#[async_trait]
impl StorageHandler for SwiftStorageHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &DESCRIPTOR
    }

    #[instrument(skip_all, err, fields(storage.url = %self.container))]
    async fn open(&self) -> Result<Box<dyn Connection>, Error> {
        let auth = self.auth.as_ref().ok_or_else(|| {
            Error::Connection(format!(
                "swift container {} has no storage auth attached",
                self.container
            ))
        })?;
        let token = auth.parameters.get("auth_token").ok_or_else(|| {
            Error::Connection("swift storage auth has no auth_token".to_string())
        })?;

        Ok(Box::new(SwiftConnection {
            client: http_client()?,
            container_url: vsi::join(&auth.url, &self.container),
            token: token.clone(),
        }))
    }

    fn vsi_path(&self, location: &str) -> String {
        vsi::join(&format!("/vsiswift/{}", self.container), location)
    }

    fn vsi_env(&self) -> BTreeMap<String, String> {
        self.auth
            .as_ref()
            .map(|auth| auth.vsi_env())
            .unwrap_or_default()
    }
}

struct SwiftConnection {
    client: &'static reqwest::Client,
    container_url: String,
    token: String,
}

#[async_trait]
impl Connection for SwiftConnection {
    #[instrument(skip_all, err, fields(item.location = location, indicatif.pb_show = 1))]
    async fn retrieve(&mut self, location: &str, hint: &Path) -> Result<Retrieved, Error> {
        Span::current().pb_set_message(&format!("Downloading {}", location));

        let request = self
            .client
            .get(vsi::join(&self.container_url, location))
            .header(AUTH_TOKEN_HEADER, &self.token);
        let size = download(request, hint).await?;
        debug!(size, "downloaded");

        Ok(Retrieved::AtHint)
    }

    /// Swift answers a plain GET on a container with one object name per
    /// line.
    fn list_files<'a>(
        &'a mut self,
        pattern: Option<&'a str>,
    ) -> BoxStream<'a, Result<String, Error>> {
        Box::pin(try_stream! {
            let pattern = compile_pattern(pattern)?;
            let listing = self
                .client
                .get(&self.container_url)
                .header(AUTH_TOKEN_HEADER, &self.token)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;

            for name in listing.lines().filter(|l| !l.is_empty()) {
                if matches(&pattern, name) {
                    yield name.to_string();
                }
            }
        })
    }
}
