//! Snapshot identity and ordering.
//!
//! A key stores the bitwise complement of the slot, so ascending key order is
//! newest-first within a `(group, target)` prefix: the first key of a prefix
//! range is always the highest slot.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Composite identity and sort key of a snapshot.
///
/// Field order matters: the derived `Ord` compares `group`, `target`,
/// `inverse_slot`, `base_slot` in that order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotKey {
    pub group: String,
    pub target: String,
    /// `!slot`, newest-to-oldest sort.
    pub inverse_slot: u64,
    pub base_slot: u64,
}

impl SnapshotKey {
    pub fn new(group: &str, target: &str, slot: u64, base_slot: u64) -> Self {
        Self {
            group: group.to_string(),
            target: target.to_string(),
            inverse_slot: !slot,
            base_slot,
        }
    }

    /// Slot derived from the stored complement.
    #[inline]
    pub fn slot(&self) -> u64 {
        !self.inverse_slot
    }

    /// Smallest key that can exist under `(group, target)`.
    pub fn prefix_start(group: &str, target: &str) -> Self {
        Self {
            group: group.to_string(),
            target: target.to_string(),
            inverse_slot: 0,
            base_slot: 0,
        }
    }

    /// Full snapshots have no base, or name themselves as their base.
    pub fn is_incremental(&self) -> bool {
        self.base_slot != 0 && self.base_slot != self.slot()
    }
}

/// One snapshot record as the sidecar reports it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub group: String,
    pub target: String,
    pub slot: u64,
    #[serde(default)]
    pub base_slot: u64,
    /// Opaque payload (size, location, checksum...). Passed through untouched.
    #[serde(default)]
    pub info: serde_json::Value,
}

/// An observation of one snapshot on one node.
///
/// Never mutated after construction; a refresh replaces the whole entry.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotEntry {
    pub key: SnapshotKey,
    /// Sidecar address of the node that reported it.
    pub source: String,
    pub info: serde_json::Value,
    pub updated_at: SystemTime,
}

impl SnapshotEntry {
    pub fn new(key: SnapshotKey, source: &str, info: serde_json::Value, updated_at: SystemTime) -> Self {
        Self {
            key,
            source: source.to_string(),
            info,
            updated_at,
        }
    }

    pub fn from_record(rec: SnapshotRecord, source: &str, now: SystemTime) -> Self {
        let key = SnapshotKey::new(&rec.group, &rec.target, rec.slot, rec.base_slot);
        Self::new(key, source, rec.info, now)
    }

    pub fn slot(&self) -> u64 {
        self.key.slot()
    }

    /// JSON view served to fetch jobs. `updated_at` is unix milliseconds.
    pub fn to_json(&self) -> serde_json::Value {
        let updated_ms = self
            .updated_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        serde_json::json!({
            "group": self.key.group,
            "target": self.key.target,
            "slot": self.key.slot(),
            "base_slot": self.key.base_slot,
            "incremental": self.key.is_incremental(),
            "source": self.source,
            "info": self.info,
            "updated_at": updated_ms,
        })
    }
}
