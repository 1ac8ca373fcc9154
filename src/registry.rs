//! In-memory snapshot registry shared by every probe and the query path.
//!
//! Rows are ordered by `(SnapshotKey, source)`. Because the key carries the
//! inverse slot, the first row of a `(group, target)` range is the newest one,
//! so `latest` is a single range seek.
//!
//! One `RwLock` guards the map. Writers hold it only for in-memory work, never
//! across I/O; readers collect what they need and release it before returning.

use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use crate::key::{SnapshotEntry, SnapshotKey};

type RowId = (SnapshotKey, String);

#[derive(Debug, Default)]
pub struct Registry {
    rows: RwLock<BTreeMap<RowId, Arc<SnapshotEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // Poisoning is ignored: every mutation is a single map call.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<RowId, Arc<SnapshotEntry>>> {
        self.rows.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<RowId, Arc<SnapshotEntry>>> {
        self.rows.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace the row at `(entry.key, entry.source)`. Last call wins.
    pub fn upsert(&self, entry: SnapshotEntry) {
        let id = (entry.key.clone(), entry.source.clone());
        self.write().insert(id, Arc::new(entry));
    }

    /// Apply a whole listing under one write lock.
    pub fn upsert_many<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = SnapshotEntry>,
    {
        let prepared: Vec<(RowId, Arc<SnapshotEntry>)> = entries
            .into_iter()
            .map(|e| ((e.key.clone(), e.source.clone()), Arc::new(e)))
            .collect();
        let n = prepared.len();
        if n == 0 {
            return 0;
        }
        let mut rows = self.write();
        for (id, e) in prepared {
            rows.insert(id, e);
        }
        n
    }

    /// Newest entry of `(group, target)`, or `None` when nothing was observed yet.
    pub fn latest(&self, group: &str, target: &str) -> Result<Option<Arc<SnapshotEntry>>> {
        check_name("group", group)?;
        check_name("target", target)?;

        let start = (SnapshotKey::prefix_start(group, target), String::new());
        let rows = self.read();
        let found = rows
            .range(start..)
            .next()
            .filter(|((k, _), _)| k.group == group && k.target == target)
            .map(|(_, e)| e.clone());
        Ok(found)
    }

    /// Every entry of `group`, ordered by target, then newest slot first.
    ///
    /// The result is a consistent copy taken under one read lock. Calling it
    /// again starts over from the current state.
    pub fn list(&self, group: &str) -> Result<Vec<Arc<SnapshotEntry>>> {
        check_name("group", group)?;

        let start = (SnapshotKey::prefix_start(group, ""), String::new());
        let rows = self.read();
        Ok(rows
            .range(start..)
            .take_while(|((k, _), _)| k.group == group)
            .map(|(_, e)| e.clone())
            .collect())
    }

    /// Distinct groups currently holding at least one entry.
    pub fn groups(&self) -> Vec<String> {
        let rows = self.read();
        let set: BTreeSet<&str> = rows.keys().map(|(k, _)| k.group.as_str()).collect();
        set.into_iter().map(str::to_string).collect()
    }

    /// Drop every entry older than `max_age` at `now`. Returns the number removed.
    ///
    /// An entry exactly `max_age` old is kept; entries stamped after `now`
    /// (clock skew) are kept as well.
    pub fn prune(&self, max_age: Duration, now: SystemTime) -> usize {
        let mut rows = self.write();
        let before = rows.len();
        rows.retain(|_, e| match now.duration_since(e.updated_at) {
            Ok(age) => age <= max_age,
            Err(_) => true,
        });
        before - rows.len()
    }

    /// Drop every entry of `(group, target)`, whichever node reported it.
    pub fn remove(&self, group: &str, target: &str) -> usize {
        self.remove_where(group, target, |_| true)
    }

    /// Drop the entries of `(group, target)` reported by one node.
    pub fn remove_source(&self, group: &str, target: &str, source: &str) -> usize {
        self.remove_where(group, target, |s| s == source)
    }

    fn remove_where<F: Fn(&str) -> bool>(&self, group: &str, target: &str, pred: F) -> usize {
        let start = (SnapshotKey::prefix_start(group, target), String::new());
        let mut rows = self.write();
        let doomed: Vec<RowId> = rows
            .range(start..)
            .take_while(|((k, _), _)| k.group == group && k.target == target)
            .filter(|((_, src), _)| pred(src))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            rows.remove(id);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

fn check_name(what: &str, v: &str) -> Result<()> {
    if v.trim().is_empty() {
        bail!("{} must not be empty", what);
    }
    Ok(())
}
