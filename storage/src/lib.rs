mod errors;
mod item_id;
mod model;

pub mod cache;
pub mod catalog;
pub mod config;
pub mod handlers;
pub mod keystone;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod vsi;

pub use cache::CacheScope;
pub use catalog::Catalog;
pub use config::{CacheConfig, Config};
pub use errors::Error;
pub use item_id::{ItemId, ITEM_ID_LEN};
pub use model::{DataItem, PackageNode, StorageAuth, StorageNode};
pub use pipeline::{AccessPipeline, Connected};
pub use registry::HandlerRegistry;
pub use resolver::LocatorResolver;

#[cfg(test)]
mod fixtures;
