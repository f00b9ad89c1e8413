//! Access to data items, either by a virtual path a reader can stream from,
//! or by materializing them into a cache scope.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use tracing::{debug, info_span, instrument, warn, Instrument};

use crate::cache::stage;
use crate::config::Config;
use crate::handlers::{Retrieved, StorageHandler};
use crate::registry::HandlerRegistry;
use crate::{keystone, CacheScope, DataItem, Error, ItemId, PackageNode, StorageAuth, StorageNode};

/// A virtual path along with the environment needed to read from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub path: String,
    pub env: BTreeMap<String, String>,
}

pub struct AccessPipeline<'r> {
    registry: &'r HandlerRegistry,
    timeout: Option<Duration>,
}

impl<'r> AccessPipeline<'r> {
    pub fn new(registry: &'r HandlerRegistry) -> Self {
        Self {
            registry,
            timeout: None,
        }
    }

    pub fn from_config(registry: &'r HandlerRegistry, config: &Config) -> Self {
        Self::new(registry).with_timeout(config.timeout())
    }

    /// Sets a deadline for every open, retrieve and close on a storage.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The fast path: a virtual path to stream the item from, without
    /// materializing anything.
    ///
    /// Only items directly inside a remote storage can be streamed. For
    /// everything else, `None` signals that [AccessPipeline::retrieve] is
    /// needed.
    #[instrument(skip_all, err, fields(item.location = %item.location))]
    pub async fn connect(&self, item: &DataItem) -> Result<Option<Connected>, Error> {
        if item.package.is_some() {
            return Ok(None);
        }
        let Some(storage) = &item.storage else {
            return Ok(None);
        };
        if storage.parent.is_some() {
            return Ok(None);
        }

        let entry = self
            .registry
            .by_name(&storage.storage_type)
            .ok_or_else(|| Error::UnknownStorageType(storage.storage_type.clone()))?;
        if entry.descriptor().is_local {
            return Ok(None);
        }

        let handler = entry.build(&storage.url, keystone::resolve(storage.auth.as_ref()).await?)?;
        Ok(Some(Connected {
            path: handler.vsi_path(&item.location),
            env: handler.vsi_env(),
        }))
    }

    /// The slow path: materializes the item, along with every package and
    /// storage it lives in, and returns its local path.
    ///
    /// Items are materialized at most once per cache scope. Items without
    /// storage and package are local paths already and returned as they are.
    pub async fn retrieve(&self, item: &DataItem, cache: &CacheScope) -> Result<PathBuf, Error> {
        self.retrieve_inner(item, cache, Vec::new()).await
    }

    // `stack` holds the ids of the items currently being retrieved further
    // up, an item showing up again would wait on itself forever.
    fn retrieve_inner<'a>(
        &'a self,
        item: &'a DataItem,
        cache: &'a CacheScope,
        mut stack: Vec<ItemId>,
    ) -> BoxFuture<'a, Result<PathBuf, Error>> {
        if item.package.is_none() && item.storage.is_none() {
            return futures::future::ok(PathBuf::from(&item.location)).boxed();
        }

        let id = ItemId::new(&item.location, item.format.as_deref());
        let span = info_span!("retrieve", item.location = %item.location, item.id = %id);

        async move {
            if stack.contains(&id) {
                return Err(Error::InvalidStorage(format!(
                    "circular reference: {} is contained in itself",
                    item
                )));
            }
            stack.push(id.clone());

            let hint = cache.hint_path(&id, &item.location);
            cache
                .get_or_materialize(&id, move || async move {
                    let handler = match (&item.package, &item.storage) {
                        (Some(package), _) => {
                            let package_item = package.as_data_item();
                            let local = self.retrieve_inner(&package_item, cache, stack).await?;
                            self.package_handler(package, &local)?
                        }
                        (None, Some(storage)) => {
                            self.storage_handler(storage, cache, stack).await?
                        }
                        (None, None) => return Ok(PathBuf::from(&item.location)),
                    };
                    self.retrieve_from(handler.as_ref(), &item.location, &hint)
                        .await
                })
                .await
        }
        .instrument(span)
        .boxed()
    }

    /// The handler to open an already materialized package with, chosen by
    /// the package format or, lacking one, by sniffing the file.
    fn package_handler(
        &self,
        package: &PackageNode,
        local: &Path,
    ) -> Result<Box<dyn StorageHandler>, Error> {
        let local = local.to_string_lossy();
        let entry = match package.format.as_deref() {
            Some(format) => self.registry.by_name(format),
            None => None,
        }
        .or_else(|| self.registry.by_test(&local))
        .ok_or_else(|| Error::UnresolvedLocator(package.location.clone()))?;

        entry.build(&local, None)
    }

    /// The handler for a storage. A storage nested in another one is
    /// materialized first and opened from its local copy.
    async fn storage_handler(
        &self,
        storage: &Arc<StorageNode>,
        cache: &CacheScope,
        stack: Vec<ItemId>,
    ) -> Result<Box<dyn StorageHandler>, Error> {
        let url = match &storage.parent {
            Some(parent) => {
                let carrier = DataItem::new(storage.url.clone()).in_storage(parent.clone());
                let local = self.retrieve_inner(&carrier, cache, stack).await?;
                local.to_string_lossy().into_owned()
            }
            None => storage.url.clone(),
        };
        self.build_handler(&storage.storage_type, &url, storage.auth.as_ref())
            .await
    }

    /// Builds a handler, logging into keystone first if its auth asks for it.
    async fn build_handler(
        &self,
        storage_type: &str,
        url: &str,
        auth: Option<&Arc<StorageAuth>>,
    ) -> Result<Box<dyn StorageHandler>, Error> {
        let auth = keystone::resolve(auth).await?;
        self.registry.build(storage_type, url, auth)
    }

    async fn with_deadline<T>(
        &self,
        what: &str,
        fut: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut).await.map_err(|_| {
                Error::Timeout(format!("{} did not finish within {:?}", what, timeout))
            })?,
            None => fut.await,
        }
    }

    /// Opens the storage, retrieves one member and closes the storage again,
    /// on every path.
    ///
    /// The member is written to a staging file which only takes the name of
    /// `hint` once complete. Whatever happens to the staging file otherwise,
    /// including this future being dropped, removes it.
    async fn retrieve_from(
        &self,
        handler: &dyn StorageHandler,
        location: &str,
        hint: &Path,
    ) -> Result<PathBuf, Error> {
        let staged = stage(hint).await?;
        let mut conn = self.with_deadline("open", handler.open()).await?;
        let res = self
            .with_deadline("retrieve", conn.retrieve(location, &staged))
            .await;
        if let Err(e) = self.with_deadline("close", conn.close()).await {
            warn!(err = %e, "unable to close storage");
        }

        match res {
            Ok(Retrieved::AtHint) => {
                staged.persist(hint).map_err(|e| Error::from(e.error))?;
                debug!(path = %hint.display(), "retrieved");
                Ok(hint.to_path_buf())
            }
            res => {
                drop(staged);
                // the slot stays if anything else lives in it.
                if let Some(slot) = hint.parent() {
                    let _ = tokio::fs::remove_dir(slot).await;
                }
                let path = res?.into_path(hint);
                debug!(path = %path.display(), "retrieved");
                Ok(path)
            }
        }
    }

    /// Lists the members of a storage, optionally filtered by a shell-style
    /// glob pattern. Storages nested in archives are materialized through
    /// the cache first.
    #[instrument(skip_all, err, fields(storage.type = %storage.storage_type, storage.url = %storage.url))]
    pub async fn list_files(
        &self,
        storage: &Arc<StorageNode>,
        pattern: Option<&str>,
        cache: &CacheScope,
    ) -> Result<Vec<String>, Error> {
        let handler = self.storage_handler(storage, cache, Vec::new()).await?;
        let mut conn = self.with_deadline("open", handler.open()).await?;
        let res = self
            .with_deadline("list", conn.list_files(pattern).try_collect::<Vec<_>>())
            .await;
        if let Err(e) = self.with_deadline("close", conn.close()).await {
            warn!(err = %e, "unable to close storage");
        }
        res
    }

    /// A virtual path for the item, composed across all packages and storages
    /// it lives in, e.g. `/vsizip//vsicurl/http://host/a.zip/band1.tif`.
    #[instrument(skip_all, err, fields(item.location = %item.location))]
    pub fn vsi_path(&self, item: &DataItem) -> Result<String, Error> {
        if let Some(package) = &item.package {
            let base = self.vsi_path(&package.as_data_item())?;
            let entry = match package.format.as_deref() {
                Some(format) => self.registry.by_name(format),
                None => None,
            }
            .or_else(|| self.registry.by_test(&base))
            .ok_or_else(|| Error::UnresolvedLocator(package.location.clone()))?;

            return Ok(entry.build(&base, None)?.vsi_path(&item.location));
        }

        match &item.storage {
            Some(storage) => Ok(self.vsi_handler(storage)?.vsi_path(&item.location)),
            None => Ok(item.location.clone()),
        }
    }

    fn vsi_handler(&self, storage: &StorageNode) -> Result<Box<dyn StorageHandler>, Error> {
        let url = match &storage.parent {
            Some(parent) => self.vsi_handler(parent)?.vsi_path(&storage.url),
            None => storage.url.clone(),
        };
        self.registry
            .build(&storage.storage_type, &url, storage.auth.clone())
    }

    /// The environment needed to read from [AccessPipeline::vsi_path], merged
    /// across all storages the item lives in. Inner storages win.
    pub async fn vsi_env(&self, item: &DataItem) -> Result<BTreeMap<String, String>, Error> {
        let mut env = BTreeMap::new();
        let mut item = item.clone();
        while let Some(package) = item.package.take() {
            item = package.as_data_item();
        }
        if let Some(storage) = &item.storage {
            // outermost first, so inner storages override.
            let chain: Vec<&StorageNode> = storage.ancestry().collect();
            for node in chain.into_iter().rev() {
                // nothing to log into for local storages.
                if self
                    .registry
                    .by_name(&node.storage_type)
                    .is_some_and(|entry| entry.descriptor().is_local)
                {
                    continue;
                }
                let handler = self
                    .build_handler(&node.storage_type, &node.url, node.auth.as_ref())
                    .await?;
                env.extend(handler.vsi_env());
            }
        }
        Ok(env)
    }
}
