//! Fingerprint-based change detection.
use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::db::models::FileRecord;

/// Four disjoint, sorted path sets.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub unchanged: BTreeSet<String>,
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl ChangeSet {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty())
    }
}

/// Classify files by comparing current fingerprints (`path -> fingerprint`)
/// with what the index last recorded.
pub fn detect<'a, I>(current: I, stored: &HashMap<String, FileRecord>) -> ChangeSet
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut changes = ChangeSet::default();
    let mut seen = BTreeSet::new();

    for (path, fingerprint) in current {
        seen.insert(path);
        match stored.get(path) {
            None => {
                changes.added.insert(path.to_string());
            }
            Some(record) if record.fingerprint == fingerprint => {
                changes.unchanged.insert(path.to_string());
            }
            Some(_) => {
                changes.modified.insert(path.to_string());
            }
        }
    }

    for path in stored.keys() {
        if !seen.contains(path.as_str()) {
            changes.deleted.insert(path.clone());
        }
    }

    changes
}
