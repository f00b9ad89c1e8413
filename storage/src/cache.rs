//! A content addressed cache of materialized items, bound to one top-level
//! operation.
//!
//! Each item id owns a slot directory below the cache root. Items are
//! materialized at most once per scope: concurrent requests for an id that is
//! being materialized wait for the first one and share its result.
//!
//! Members are written to a staging file in the slot first, see [stage], and
//! only take their final name once complete. Staging files are never served.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tempfile::{TempDir, TempPath};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::config::CacheConfig;
use crate::{Error, ItemId};

type Shared = Option<Result<PathBuf, Error>>;

const STAGING_PREFIX: &str = ".partial-";

enum Slot {
    /// Someone is materializing the item, the channel carries the outcome.
    InProgress(watch::Receiver<Shared>),
    Done(PathBuf),
}

/// What a caller of [CacheScope::get_or_materialize] has to do.
enum Turn {
    Ready(PathBuf),
    Wait(watch::Receiver<Shared>),
    Materialize(watch::Sender<Shared>),
}

pub struct CacheScope {
    root: PathBuf,
    // removed along with everything in it when the scope ends.
    temp: Option<TempDir>,
    retention: Option<Duration>,
    slots: Mutex<HashMap<ItemId, Slot>>,
    // files below `root` materialized by this scope.
    created: Mutex<Vec<PathBuf>>,
}

impl CacheScope {
    /// Opens a scope. Without a configured directory, a temporary one is used.
    #[instrument(skip_all, err, fields(cache.directory = ?config.directory))]
    pub fn open_scope(config: &CacheConfig) -> Result<Self, Error> {
        let (root, temp) = match &config.directory {
            Some(directory) => {
                std::fs::create_dir_all(directory)?;
                (directory.clone(), None)
            }
            None => {
                let temp = tempfile::Builder::new().prefix("vsistore-cache").tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };
        debug!(root = %root.display(), "opened cache scope");

        Ok(Self {
            root,
            temp,
            retention: config.retention(),
            slots: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `location` of the item with the given id should be materialized.
    pub fn hint_path(&self, id: &ItemId, location: &str) -> PathBuf {
        let name = Path::new(location)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "item".into());
        id.slot_path(&self.root).join(name)
    }

    /// Whether the item was materialized, by this scope or, with a retention
    /// period, by an earlier one.
    pub fn contains(&self, id: &ItemId) -> bool {
        let done = matches!(self.slots.lock().get(id), Some(Slot::Done(_)));
        done || self.retained(id).is_some()
    }

    /// The path an item resolves to. For items not materialized yet, this is
    /// their slot directory, which may not exist.
    pub fn path_for(&self, id: &ItemId) -> PathBuf {
        if let Some(Slot::Done(path)) = self.slots.lock().get(id) {
            return path.clone();
        }
        self.retained(id)
            .unwrap_or_else(|| id.slot_path(&self.root))
    }

    /// Records that the item now resolves to `path`.
    ///
    /// Registering the same path again is a no-op, registering a different one
    /// is refused.
    pub fn register(&self, id: &ItemId, path: &Path) -> Result<(), Error> {
        let mut slots = self.slots.lock();
        if let Some(Slot::Done(existing)) = slots.get(id) {
            if existing == path {
                return Ok(());
            }
            return Err(Error::CacheConsistency {
                id: id.to_string(),
                existing: existing.clone(),
                new: path.to_path_buf(),
            });
        }
        slots.insert(id.clone(), Slot::Done(path.to_path_buf()));
        drop(slots);

        if self.temp.is_none() && self.retention.is_none() && path.starts_with(&self.root) {
            self.created.lock().push(path.to_path_buf());
        }
        debug!(item.id = %id, path = %path.display(), "registered");
        Ok(())
    }

    /// Number of items registered in this scope.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| matches!(s, Slot::Done(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A file left in the item's slot by an earlier scope, still within the
    /// retention period.
    fn retained(&self, id: &ItemId) -> Option<PathBuf> {
        let retention = self.retention?;
        let entries = std::fs::read_dir(id.slot_path(&self.root)).ok()?;
        entries.flatten().find_map(|entry| {
            let metadata = entry.metadata().ok()?;
            is_fresh(&entry.file_name(), &metadata, retention).then(|| entry.path())
        })
    }

    async fn find_retained(&self, id: &ItemId) -> Option<PathBuf> {
        let retention = self.retention?;
        let mut entries = tokio::fs::read_dir(id.slot_path(&self.root)).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if is_fresh(&entry.file_name(), &metadata, retention) {
                return Some(entry.path());
            }
        }
        None
    }

    // `retained` is looked up before, so the lock is never held across the
    // file system.
    fn take_turn(&self, id: &ItemId, retained: Option<PathBuf>) -> Turn {
        let mut slots = self.slots.lock();
        match slots.get(id) {
            Some(Slot::Done(path)) => Turn::Ready(path.clone()),
            Some(Slot::InProgress(rx)) => Turn::Wait(rx.clone()),
            None => {
                if let Some(path) = retained {
                    debug!(item.id = %id, "reusing retained file");
                    slots.insert(id.clone(), Slot::Done(path.clone()));
                    return Turn::Ready(path);
                }
                let (tx, rx) = watch::channel(None);
                slots.insert(id.clone(), Slot::InProgress(rx));
                Turn::Materialize(tx)
            }
        }
    }

    /// Returns the path of the item, running `materialize` to produce it if
    /// nobody did so far. Concurrent callers for the same id wait for the
    /// running materialization instead of starting their own.
    ///
    /// Failures are handed to everyone waiting, but not remembered: a later
    /// call tries again.
    pub async fn get_or_materialize<F, Fut>(
        &self,
        id: &ItemId,
        materialize: F,
    ) -> Result<PathBuf, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PathBuf, Error>>,
    {
        let mut materialize = Some(materialize);
        loop {
            let retained = self.find_retained(id).await;
            match self.take_turn(id, retained) {
                Turn::Ready(path) => return Ok(path),
                Turn::Wait(mut rx) => {
                    match rx.wait_for(Option::is_some).await {
                        Ok(res) => {
                            if let Some(res) = &*res {
                                return res.clone();
                            }
                        }
                        // the materializing caller went away without a
                        // result, start over.
                        Err(_) => continue,
                    }
                }
                Turn::Materialize(tx) => {
                    let Some(materialize) = materialize.take() else {
                        return Err(Error::Io(format!("unable to materialize {}", id)));
                    };
                    let mut guard = InFlight {
                        scope: self,
                        id,
                        finished: false,
                    };

                    let res = match materialize().await {
                        Ok(path) => {
                            guard.forget();
                            self.register(id, &path).map(|_| path)
                        }
                        Err(e) => Err(e),
                    };
                    if res.is_err() {
                        guard.forget();
                        self.slots.lock().remove(id);
                    }

                    // nobody waiting is fine.
                    let _ = tx.send(Some(res.clone()));
                    return res;
                }
            }
        }
    }
}

fn is_fresh(name: &std::ffi::OsStr, metadata: &std::fs::Metadata, retention: Duration) -> bool {
    if name.to_string_lossy().starts_with(STAGING_PREFIX) || !metadata.is_file() {
        return false;
    }
    let age = metadata
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default();
    age < retention
}

/// A fresh staging file next to `hint`, to write a member into before it is
/// complete. It is removed when dropped, unless persisted to `hint`.
pub(crate) async fn stage(hint: &Path) -> Result<TempPath, Error> {
    let Some(slot) = hint.parent().map(Path::to_path_buf) else {
        return Err(Error::Io(format!("{} has no slot directory", hint.display())));
    };
    tokio::fs::create_dir_all(&slot).await?;
    let file = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(slot)
    })
    .await??;
    Ok(file.into_temp_path())
}

/// Clears an in-progress slot if its materialization is dropped before it
/// finished, e.g. on timeout, so waiters can take over.
struct InFlight<'a> {
    scope: &'a CacheScope,
    id: &'a ItemId,
    finished: bool,
}

impl InFlight<'_> {
    fn forget(&mut self) {
        self.finished = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let mut slots = self.scope.slots.lock();
            if matches!(slots.get(self.id), Some(Slot::InProgress(_))) {
                slots.remove(self.id);
            }
        }
    }
}

impl Drop for CacheScope {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            debug!(root = %self.root.display(), "removing temporary cache");
            if let Err(e) = temp.close() {
                warn!(err = %e, "unable to remove temporary cache directory");
            }
            return;
        }

        for path in self.created.get_mut().drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), err = %e, "unable to remove cached file");
                continue;
            }
            // the slot directory, if nothing else lives in it.
            if let Some(slot) = path.parent() {
                let _ = std::fs::remove_dir(slot);
            }
        }
    }
}
