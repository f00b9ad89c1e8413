//! The registry of storage handlers available to resolve and open storages.
//!
//! Order matters: when a locator carries no explicit type, handlers are asked
//! in registration order whether they recognize it, and the first one to say
//! yes wins.

use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::handlers::{add_default_handlers, HandlerDescriptor, StorageHandler};
use crate::{Error, StorageAuth};

pub type TestFn = Box<dyn Fn(&str) -> bool + Send + Sync>;
pub type BuildFn = Box<
    dyn Fn(&str, Option<Arc<StorageAuth>>) -> Result<Box<dyn StorageHandler>, Error>
        + Send
        + Sync,
>;

pub struct RegistryEntry {
    descriptor: &'static HandlerDescriptor,
    test: TestFn,
    build: BuildFn,
}

impl RegistryEntry {
    pub fn descriptor(&self) -> &'static HandlerDescriptor {
        self.descriptor
    }

    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }

    /// Cheap sniff of whether this handler can open `locator`. Never fails.
    pub fn test(&self, locator: &str) -> bool {
        (self.test)(locator)
    }

    /// Binds a handler to the given storage url.
    pub fn build(
        &self,
        url: &str,
        auth: Option<Arc<StorageAuth>>,
    ) -> Result<Box<dyn StorageHandler>, Error> {
        (self.build)(url, auth)
    }
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("descriptor", self.descriptor)
            .finish_non_exhaustive()
    }
}

/// An ordered list of storage handlers.
#[derive(Debug)]
pub struct HandlerRegistry {
    entries: Vec<RegistryEntry>,
}

impl HandlerRegistry {
    /// A registry without any handlers.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers a handler after all previously registered ones. A handler
    /// registered under an existing name replaces it in place.
    pub fn register(
        &mut self,
        descriptor: &'static HandlerDescriptor,
        test: impl Fn(&str) -> bool + Send + Sync + 'static,
        build: impl Fn(&str, Option<Arc<StorageAuth>>) -> Result<Box<dyn StorageHandler>, Error>
            + Send
            + Sync
            + 'static,
    ) {
        let entry = RegistryEntry {
            descriptor,
            test: Box::new(test),
            build: Box::new(build),
        };
        match self
            .entries
            .iter_mut()
            .find(|e| e.name().eq_ignore_ascii_case(descriptor.name))
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Builds a registry containing the named builtin handlers, in the given
    /// order.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, Error> {
        let mut builtin = Self::empty();
        add_default_handlers(&mut builtin);

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let pos = builtin
                .entries
                .iter()
                .position(|e| e.name().eq_ignore_ascii_case(name))
                .ok_or_else(|| Error::UnknownStorageType(name.to_string()))?;
            entries.push(builtin.entries.remove(pos));
        }

        Ok(Self { entries })
    }

    /// Looks up a handler by its name, ignoring case.
    pub fn by_name(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries
            .iter()
            .find(|e| e.name().eq_ignore_ascii_case(name))
    }

    /// Returns the first handler recognizing `locator`.
    pub fn by_test(&self, locator: &str) -> Option<&RegistryEntry> {
        let found = self.entries.iter().find(|e| e.test(locator));
        debug!(locator, handler = found.map(|e| e.name()), "sniffed locator");
        found
    }

    pub fn descriptor(&self, storage_type: &str) -> Result<&'static HandlerDescriptor, Error> {
        self.by_name(storage_type)
            .map(RegistryEntry::descriptor)
            .ok_or_else(|| Error::UnknownStorageType(storage_type.to_string()))
    }

    /// Builds a handler of type `storage_type` bound to `url`.
    pub fn build(
        &self,
        storage_type: &str,
        url: &str,
        auth: Option<Arc<StorageAuth>>,
    ) -> Result<Box<dyn StorageHandler>, Error> {
        self.by_name(storage_type)
            .ok_or_else(|| Error::UnknownStorageType(storage_type.to_string()))?
            .build(url, auth)
    }

    /// Names of the registered handlers, in order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(RegistryEntry::name)
    }
}

impl Default for HandlerRegistry {
    /// All builtin handlers, in their default order.
    fn default() -> Self {
        let mut reg = Self::empty();
        add_default_handlers(&mut reg);
        reg
    }
}

static GLOBAL: OnceLock<HandlerRegistry> = OnceLock::new();

/// Initializes the process-wide registry with the named handlers.
///
/// Calling this again with the same list is a no-op. A different list, or a
/// call after [global] already initialized the registry with the defaults
/// differing from it, is an error.
pub fn init_once<S: AsRef<str>>(names: &[S]) -> Result<&'static HandlerRegistry, Error> {
    let wanted = HandlerRegistry::from_names(names)?;
    let wanted_names: Vec<&'static str> = wanted.names().collect();

    let reg = GLOBAL.get_or_init(|| wanted);
    if reg.names().ne(wanted_names.iter().copied()) {
        return Err(Error::InvalidStorage(format!(
            "storage handlers already initialized as {:?}",
            reg.names().collect::<Vec<_>>()
        )));
    }
    Ok(reg)
}

/// The process-wide registry, initialized with all builtin handlers on first
/// use unless [init_once] ran before.
pub fn global() -> &'static HandlerRegistry {
    GLOBAL.get_or_init(HandlerRegistry::default)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::fixtures::write_zip;

    #[test]
    fn default_order() {
        let reg = HandlerRegistry::default();
        let mut exp = vec!["directory", "ZIP", "TAR", "HTTP", "FTP"];
        if cfg!(feature = "cloud") {
            exp.push("S3");
        }
        exp.push("swift");

        assert_eq!(exp, reg.names().collect::<Vec<_>>());
    }

    #[test]
    fn by_name_ignores_case() {
        let reg = HandlerRegistry::default();
        assert_eq!("ZIP", reg.by_name("zip").unwrap().name());
        assert_eq!("HTTP", reg.by_name("http").unwrap().name());
        assert!(reg.by_name("gopher").is_none());
    }

    #[test]
    fn by_test_first_match_wins() {
        let tmp = TempDir::new().unwrap();
        let zip = tmp.path().join("scene.zip");
        write_zip(&zip, &[("band1.tif", "tif")]);

        let reg = HandlerRegistry::default();
        assert_eq!("ZIP", reg.by_test(zip.to_str().unwrap()).unwrap().name());
        assert_eq!("directory", reg.by_test(tmp.path().to_str().unwrap()).unwrap().name());
        assert_eq!("HTTP", reg.by_test("http://host/a.tif").unwrap().name());
        assert!(reg.by_test("bucket").is_none());

        // with zip taken out, nothing recognizes the archive anymore.
        let reg = HandlerRegistry::from_names(&["directory", "HTTP"]).unwrap();
        assert!(reg.by_test(zip.to_str().unwrap()).is_none());
    }

    #[test]
    fn from_names_keeps_order() {
        let reg = HandlerRegistry::from_names(&["HTTP", "zip", "directory"]).unwrap();
        assert_eq!(vec!["HTTP", "ZIP", "directory"], reg.names().collect::<Vec<_>>());
    }

    // the process-wide registry is shared by every test in this binary, so
    // it is only ever initialized with the defaults.
    #[test]
    fn process_wide_registry() {
        let defaults: Vec<&str> = HandlerRegistry::default().names().collect();

        let reg = init_once(&defaults).unwrap();
        assert!(std::ptr::eq(reg, init_once(&defaults).unwrap()));
        assert!(std::ptr::eq(reg, global()));
        assert_eq!(defaults, global().names().collect::<Vec<_>>());

        assert!(matches!(
            init_once(&["directory", "ZIP"]),
            Err(Error::InvalidStorage(_))
        ));
        assert!(matches!(
            init_once(&["gopher"]),
            Err(Error::UnknownStorageType(_))
        ));
        // refused calls leave the registry alone.
        assert!(std::ptr::eq(reg, global()));
    }

    #[test]
    fn from_names_unknown() {
        assert_eq!(
            Error::UnknownStorageType("gopher".into()),
            HandlerRegistry::from_names(&["directory", "gopher"]).unwrap_err()
        );
    }

    #[test]
    fn register_replaces_by_name() {
        static FAKE: HandlerDescriptor = HandlerDescriptor {
            name: "zip",
            allows_child_storages: false,
            allows_parent_storage: false,
            is_local: true,
        };
        let mut reg = HandlerRegistry::default();
        let before = reg.names().count();
        reg.register(&FAKE, |_| false, |_, _| Err(Error::Unsupported("fake".into())));

        assert_eq!(before, reg.names().count());
        assert!(!reg.descriptor("ZIP").unwrap().allows_child_storages);
    }

    #[test]
    fn build_unknown_type() {
        let reg = HandlerRegistry::default();
        assert!(matches!(
            reg.build("gopher", "gopher://host", None),
            Err(Error::UnknownStorageType(_))
        ));
    }
}
