use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{instrument, warn};
use vsistore_storage::{
    vsi, AccessPipeline, CacheScope, Catalog, Config, Connected, DataItem, HandlerRegistry,
    LocatorResolver, StorageAuth, StorageNode,
};

pub mod args;
mod errors;

pub use args::{AuthCommand, Cli, Commands, StorageCommand};
pub use errors::Error;

/// Everything a command needs besides its own arguments.
pub struct Context<'r> {
    pub registry: &'r HandlerRegistry,
    pub config: Config,
    pub catalog_path: PathBuf,
}

impl Context<'_> {
    fn load_catalog(&self) -> Result<Catalog, Error> {
        Ok(Catalog::load(self.registry, &self.catalog_path)?)
    }

    fn save_catalog(&self, catalog: &Catalog) -> Result<(), Error> {
        Ok(catalog.save(&self.catalog_path)?)
    }

    fn pipeline(&self) -> AccessPipeline<'_> {
        AccessPipeline::from_config(self.registry, &self.config)
    }

    /// Resolves a chain of locators that names storages only.
    fn resolve_storage(&self, catalog: &Catalog, locators: &[String]) -> Result<Arc<StorageNode>, Error> {
        LocatorResolver::new(self.registry, catalog)
            .resolve_chain(locators, false)?
            .ok_or_else(|| Error::MissingLocation(locators.join(" ")))
    }
}

/// Runs a command, writing its output to `out`.
pub async fn run<W: Write>(ctx: &Context<'_>, command: Commands, out: &mut W) -> Result<(), Error> {
    match command {
        Commands::Storage(cmd) => storage(ctx, cmd, out).await,
        Commands::Auth(cmd) => auth(ctx, cmd, out),
        Commands::Retrieve {
            locators,
            format,
            materialize,
        } => retrieve(ctx, &locators, format, materialize, out).await,
    }
}

async fn storage<W: Write>(ctx: &Context<'_>, cmd: StorageCommand, out: &mut W) -> Result<(), Error> {
    let catalog = ctx.load_catalog()?;

    match cmd {
        StorageCommand::Create {
            name,
            url,
            storage_type,
            parent,
            auth,
        } => {
            let storage_type = match storage_type {
                Some(storage_type) => ctx
                    .registry
                    .by_name(&storage_type)
                    .ok_or(vsistore_storage::Error::UnknownStorageType(storage_type))?
                    .name(),
                None => ctx
                    .registry
                    .by_test(&url)
                    .ok_or_else(|| Error::UndetectedType(url.clone()))?
                    .name(),
            };

            let mut node = StorageNode::new(storage_type, url).with_name(&name);
            if let Some(parent) = parent {
                let parent_node = catalog.storage_by_name(&parent).ok_or(Error::NoSuch {
                    kind: "storage",
                    name: parent,
                })?;
                node = node.with_parent(parent_node);
            }
            if let Some(auth) = auth {
                let auth_node = catalog.auth_by_name(&auth).ok_or(Error::NoSuch {
                    kind: "storage auth",
                    name: auth,
                })?;
                node = node.with_auth(auth_node);
            }

            catalog.insert_storage(ctx.registry, node)?;
            ctx.save_catalog(&catalog)?;
            writeln!(out, "Successfully created storage {} ({})", name, storage_type)?;
        }

        StorageCommand::Delete { name } => {
            let Some(storage) = catalog.storage_by_name(&name) else {
                return Err(Error::NoSuch {
                    kind: "storage",
                    name,
                });
            };
            let removed = catalog.delete_storage(&name)?;
            ctx.save_catalog(&catalog)?;

            writeln!(
                out,
                "Successfully deleted storage {} ({})",
                name, storage.storage_type
            )?;
            if removed > 1 {
                writeln!(out, "Also deleted {} nested storages", removed - 1)?;
            }
        }

        StorageCommand::List {
            name,
            paths,
            pattern,
        } => {
            let mut locators = vec![name];
            locators.extend(paths);

            // a trailing path that doesn't name a storage narrows the listing.
            let (storage, prefix) = if locators.len() == 1 {
                (ctx.resolve_storage(&catalog, &locators)?, None)
            } else {
                let (storage, leaf) = LocatorResolver::new(ctx.registry, &catalog)
                    .resolve_chain_and_leaf(&locators, false)?;
                let storage =
                    storage.ok_or_else(|| Error::MissingLocation(locators.join(" ")))?;
                (storage, leaf)
            };
            let pattern = match prefix {
                Some(prefix) => Some(vsi::join(&prefix, pattern.as_deref().unwrap_or("*"))),
                None => pattern,
            };

            let cache = CacheScope::open_scope(&ctx.config.cache)?;
            let files = ctx
                .pipeline()
                .list_files(&storage, pattern.as_deref(), &cache)
                .await?;
            for file in files {
                writeln!(out, "{}", file)?;
            }
        }

        StorageCommand::Env { name, paths } => {
            let mut locators = vec![name];
            locators.extend(paths);

            let storage = ctx.resolve_storage(&catalog, &locators)?;
            let env = ctx
                .pipeline()
                .vsi_env(&DataItem::new("").in_storage(storage))
                .await?;
            for (key, value) in env {
                writeln!(out, "{}=\"{}\"", key, value)?;
            }
        }
    }

    Ok(())
}

fn auth<W: Write>(ctx: &Context<'_>, cmd: AuthCommand, out: &mut W) -> Result<(), Error> {
    let catalog = ctx.load_catalog()?;

    match cmd {
        AuthCommand::Create {
            name,
            url,
            auth_type,
            parameters,
        } => {
            let mut auth = StorageAuth::new(&auth_type, url).with_name(&name);
            for (key, value) in parameters {
                auth = auth.with_parameter(key, value);
            }

            catalog.insert_auth(auth)?;
            ctx.save_catalog(&catalog)?;
            writeln!(out, "Successfully created storage auth {} ({})", name, auth_type)?;
        }
    }

    Ok(())
}

#[instrument(skip_all, err, fields(locators = ?locators))]
async fn retrieve<W: Write>(
    ctx: &Context<'_>,
    locators: &[String],
    format: Option<String>,
    materialize: bool,
    out: &mut W,
) -> Result<(), Error> {
    let catalog = ctx.load_catalog()?;
    let (storage, leaf) =
        LocatorResolver::new(ctx.registry, &catalog).resolve_chain_and_leaf(locators, false)?;
    let leaf = leaf.ok_or_else(|| Error::MissingLocation(locators.join(" ")))?;

    let mut item = DataItem::new(leaf);
    if let Some(format) = format {
        item = item.with_format(format);
    }
    if let Some(storage) = storage {
        item = item.in_storage(storage);
    }
    let label = item.to_string();
    let dataset = |source| Error::Dataset {
        item: label.clone(),
        source,
    };

    let pipeline = ctx.pipeline();
    if materialize {
        if ctx.config.cache.directory.is_none() {
            warn!("no cache directory configured, materialized files are removed on exit");
        }
        let cache = CacheScope::open_scope(&ctx.config.cache)?;
        let path = pipeline.retrieve(&item, &cache).await.map_err(dataset)?;
        writeln!(out, "{}", path.display())?;
        return Ok(());
    }

    let connected = match pipeline.connect(&item).await.map_err(dataset)? {
        Some(connected) => connected,
        None => Connected {
            path: pipeline.vsi_path(&item).map_err(dataset)?,
            env: pipeline.vsi_env(&item).await.map_err(dataset)?,
        },
    };
    writeln!(out, "{}", connected.path)?;
    for (key, value) in connected.env {
        writeln!(out, "{}=\"{}\"", key, value)?;
    }

    Ok(())
}
