//! Turns chains of locators into storage nodes.
//!
//! A locator is either the name of a storage already in the catalog, a url or
//! path one of the handlers recognizes, or an explicit `type:value` pair.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::catalog::{validate_storage, Catalog};
use crate::registry::HandlerRegistry;
use crate::{Error, StorageNode};

/// Splits an explicit `type:value` locator. Urls like `http://host` are not
/// considered typed, their scheme is not a storage type.
fn split_typed(locator: &str) -> Option<(&str, &str)> {
    let (storage_type, value) = locator.split_once(':')?;
    if storage_type.is_empty() || value.starts_with("//") {
        return None;
    }
    Some((storage_type, value))
}

pub struct LocatorResolver<'r> {
    registry: &'r HandlerRegistry,
    catalog: &'r Catalog,
}

impl<'r> LocatorResolver<'r> {
    pub fn new(registry: &'r HandlerRegistry, catalog: &'r Catalog) -> Self {
        Self { registry, catalog }
    }

    /// Resolves a chain of locators, outermost first, into the innermost
    /// storage node. Each storage becomes the parent of the next one.
    ///
    /// Storages already in the catalog are reused. New ones are validated and,
    /// if `save` is set, inserted into the catalog. An empty chain resolves to
    /// no storage at all.
    #[instrument(skip_all, err, fields(chain = ?locators.iter().map(|l| l.as_ref()).collect::<Vec<&str>>()))]
    pub fn resolve_chain<S: AsRef<str>>(
        &self,
        locators: &[S],
        save: bool,
    ) -> Result<Option<Arc<StorageNode>>, Error> {
        let mut parent: Option<Arc<StorageNode>> = None;
        for locator in locators {
            parent = Some(self.resolve_one(locator.as_ref(), parent, save)?);
        }
        Ok(parent)
    }

    /// Like [LocatorResolver::resolve_chain], but the last locator is taken as
    /// the location inside the resolved storage, unless it explicitly names a
    /// storage type.
    pub fn resolve_chain_and_leaf<S: AsRef<str>>(
        &self,
        locators: &[S],
        save: bool,
    ) -> Result<(Option<Arc<StorageNode>>, Option<String>), Error> {
        let (last, outer) = locators
            .split_last()
            .ok_or_else(|| Error::UnresolvedLocator(String::new()))?;
        let last = last.as_ref();

        let typed = split_typed(last)
            .map(|(storage_type, _)| self.registry.by_name(storage_type).is_some())
            .unwrap_or(false);
        if typed {
            Ok((self.resolve_chain(locators, save)?, None))
        } else {
            Ok((self.resolve_chain(outer, save)?, Some(last.to_string())))
        }
    }

    fn resolve_one(
        &self,
        locator: &str,
        parent: Option<Arc<StorageNode>>,
        save: bool,
    ) -> Result<Arc<StorageNode>, Error> {
        // names are unique in the catalog, so the head of a chain may name a
        // nested storage directly.
        let named = match &parent {
            Some(parent) => self.catalog.storage_by_name_in(locator, Some(parent)),
            None => self.catalog.storage_by_name(locator),
        };
        if let Some(named) = named {
            debug!(locator, "reusing named storage");
            return Ok(named);
        }

        let (storage_type, url) = match self.registry.by_test(locator) {
            Some(entry) => (entry.name(), locator),
            None => split_typed(locator)
                .and_then(|(storage_type, url)| {
                    self.registry
                        .by_name(storage_type)
                        .map(|entry| (entry.name(), url))
                })
                .ok_or_else(|| Error::UnresolvedLocator(locator.to_string()))?,
        };

        if let Some(existing) = self.catalog.find_storage(storage_type, url, parent.as_ref()) {
            debug!(locator, "reusing storage");
            return Ok(existing);
        }

        let mut node = StorageNode::new(storage_type, url);
        node.parent = parent;
        if save {
            self.catalog.insert_storage(self.registry, node)
        } else {
            validate_storage(self.registry, &node)?;
            Ok(Arc::new(node))
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    #[rstest]
    #[case("zip:a.zip", Some(("zip", "a.zip")))]
    #[case("S3:bucket", Some(("S3", "bucket")))]
    #[case("http://host/a.zip", None)]
    #[case("band1.tif", None)]
    #[case(":oops", None)]
    fn typed_locators(#[case] locator: &str, #[case] exp: Option<(&str, &str)>) {
        assert_eq!(exp, split_typed(locator));
    }

    #[cfg(feature = "cloud")]
    #[test]
    fn chain_reuse() {
        let reg = HandlerRegistry::default();
        let catalog = Catalog::new();
        let resolver = LocatorResolver::new(&reg, &catalog);

        let a = resolver
            .resolve_chain(&["s3:bucket", "zip:archive.zip"], true)
            .unwrap()
            .unwrap();
        let b = resolver
            .resolve_chain(&["s3:bucket", "zip:archive.zip"], true)
            .unwrap()
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!("ZIP", a.storage_type);
        assert_eq!("S3", a.parent.as_ref().unwrap().storage_type);
        assert_eq!(2, catalog.storages().len());
    }

    #[test]
    fn sniffs_before_typed_prefix() {
        let tmp = TempDir::new().unwrap();
        let reg = HandlerRegistry::default();
        let catalog = Catalog::new();
        let resolver = LocatorResolver::new(&reg, &catalog);

        let dir = tmp.path().to_str().unwrap();
        let node = resolver.resolve_chain(&[dir], true).unwrap().unwrap();
        assert_eq!("directory", node.storage_type);
        assert_eq!(dir, node.url);

        let node = resolver
            .resolve_chain(&["http://host/data/"], true)
            .unwrap()
            .unwrap();
        assert_eq!("HTTP", node.storage_type);
    }

    #[test]
    fn named_storage_is_reused() {
        let reg = HandlerRegistry::default();
        let catalog = Catalog::new();
        let named = catalog
            .insert_storage(&reg, StorageNode::new("directory", "/data").with_name("data"))
            .unwrap();
        let resolver = LocatorResolver::new(&reg, &catalog);

        let node = resolver
            .resolve_chain(&["data", "zip:a.zip"], true)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&named, node.parent.as_ref().unwrap()));
    }

    #[test]
    fn nested_storage_by_its_own_name() {
        let reg = HandlerRegistry::default();
        let catalog = Catalog::new();
        let data = catalog
            .insert_storage(&reg, StorageNode::new("directory", "/data").with_name("data"))
            .unwrap();
        let scene = catalog
            .insert_storage(
                &reg,
                StorageNode::new("ZIP", "scene.zip")
                    .with_name("scene")
                    .with_parent(data.clone()),
            )
            .unwrap();
        let resolver = LocatorResolver::new(&reg, &catalog);

        let node = resolver.resolve_chain(&["scene"], false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&scene, &node));

        // the full chain still resolves to the same node.
        let node = resolver
            .resolve_chain(&["data", "scene"], false)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&scene, &node));

        // further down a chain, names only match below their parent.
        catalog
            .insert_storage(&reg, StorageNode::new("directory", "/other").with_name("other"))
            .unwrap();
        assert!(!Arc::ptr_eq(
            &scene,
            &resolver
                .resolve_chain(&["other", "zip:scene.zip"], false)
                .unwrap()
                .unwrap()
        ));
        assert!(matches!(
            resolver.resolve_chain(&["other", "scene"], false),
            Err(Error::UnresolvedLocator(_))
        ));
    }

    #[test]
    fn unresolved_locator() {
        let reg = HandlerRegistry::default();
        let catalog = Catalog::new();
        let resolver = LocatorResolver::new(&reg, &catalog);

        assert_eq!(
            Error::UnresolvedLocator("gopher:thing".into()),
            resolver.resolve_chain(&["gopher:thing"], true).unwrap_err()
        );
    }

    #[test]
    fn without_save_nothing_is_persisted_but_everything_validated() {
        let reg = HandlerRegistry::default();
        let catalog = Catalog::new();
        let resolver = LocatorResolver::new(&reg, &catalog);

        let node = resolver
            .resolve_chain(&["http://host/", "zip:a.zip"], false)
            .unwrap();
        assert!(node.is_some());
        assert!(catalog.storages().is_empty());

        // HTTP storages can't be nested.
        assert!(matches!(
            resolver.resolve_chain(&["zip:a.zip", "http://host/"], false),
            Err(Error::InvalidStorage(_))
        ));
    }

    #[test]
    fn leaf_split() {
        let reg = HandlerRegistry::default();
        let catalog = Catalog::new();
        let resolver = LocatorResolver::new(&reg, &catalog);

        let (storage, leaf) = resolver
            .resolve_chain_and_leaf(&["http://host/data/", "band1.tif"], false)
            .unwrap();
        assert_eq!("HTTP", storage.unwrap().storage_type);
        assert_eq!(Some("band1.tif".to_string()), leaf);

        let (storage, leaf) = resolver
            .resolve_chain_and_leaf(&["http://host/data/", "zip:scene.zip"], false)
            .unwrap();
        assert_eq!("ZIP", storage.unwrap().storage_type);
        assert_eq!(None, leaf);

        // a single plain locator is just a local path.
        let (storage, leaf) = resolver
            .resolve_chain_and_leaf(&["/data/band1.tif"], false)
            .unwrap();
        assert!(storage.is_none());
        assert_eq!(Some("/data/band1.tif".to_string()), leaf);

        assert!(resolver
            .resolve_chain_and_leaf::<&str>(&[], false)
            .is_err());
    }
}
