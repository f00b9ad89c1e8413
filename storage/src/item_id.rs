use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER;

pub const ITEM_ID_LEN: usize = 32;

/// Content identity of a retrievable item, derived from its location and
/// format only. Items with equal `(location, format)` share an id no matter
/// which storage or package they were reached through.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ItemId([u8; ITEM_ID_LEN]);

impl ItemId {
    pub fn new(location: &str, format: Option<&str>) -> Self {
        let mut hasher = blake3::Hasher::new();
        // length-prefix both fields, so ("ab", "c") and ("a", "bc") differ.
        hasher.update(&(location.len() as u64).to_le_bytes());
        hasher.update(location.as_bytes());
        match format {
            Some(format) => {
                hasher.update(&[1]);
                hasher.update(&(format.len() as u64).to_le_bytes());
                hasher.update(format.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// The directory for this id below `root`, sharded after the first byte
    /// to keep directories small.
    pub fn slot_path(&self, root: &Path) -> PathBuf {
        root.join(HEXLOWER.encode(&self.0[..1]))
            .join(HEXLOWER.encode(&self.0))
    }
}

impl From<&[u8; ITEM_ID_LEN]> for ItemId {
    fn from(value: &[u8; ITEM_ID_LEN]) -> Self {
        Self(*value)
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b3:{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b3:{}", HEXLOWER.encode(&self.0))
    }
}
