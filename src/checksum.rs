//! Keys, checksums and the comparison primitives the rest of the sync engine
//! is built on.
//!
//! A checksum is an opaque equality token handed out by the platform. We only
//! ever compute one ourselves to recognise our own writes and to have
//! something to compare when the platform has not told us anything yet.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Identifies a theme file, e.g. `templates/index.json`. Always `/`-separated.
pub type Key = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checksum {
    pub key: Key,
    pub checksum: String,
}

impl Checksum {
    pub fn new(key: impl Into<Key>, checksum: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            checksum: checksum.into(),
        }
    }
}

/// Fingerprints raw file contents as lowercase MD5 hex, the same token the
/// platform reports for files it stored unmodified.
pub fn compute_checksum(contents: &[u8]) -> String {
    format!("{:x}", md5::compute(contents))
}

/// Builds a key-indexed view of a checksum list. Later entries win when a
/// key is repeated.
pub fn index_checksums(list: &[Checksum]) -> BTreeMap<&str, &str> {
    list.iter()
        .map(|entry| (entry.key.as_str(), entry.checksum.as_str()))
        .collect()
}

/// Difference between two remote snapshots, compared by key and checksum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumDelta {
    pub added: BTreeSet<Key>,
    pub removed: BTreeSet<Key>,
    pub changed: BTreeSet<Key>,
}

impl ChecksumDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }
}

pub fn diff_snapshots(old: &[Checksum], new: &[Checksum]) -> ChecksumDelta {
    let old = index_checksums(old);
    let new = index_checksums(new);
    let mut delta = ChecksumDelta::default();

    for (key, checksum) in &new {
        match old.get(key) {
            None => {
                delta.added.insert(key.to_string());
            }
            Some(previous) if previous != checksum => {
                delta.changed.insert(key.to_string());
            }
            Some(_) => {}
        }
    }

    for key in old.keys() {
        if !new.contains_key(key) {
            delta.removed.insert(key.to_string());
        }
    }

    delta
}
