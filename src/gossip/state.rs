//! Last-writer-wins key/value state replicated by the gossip mesh.
//!
//! Every entry carries a version stamp. A higher stamp always wins; at
//! equal stamps data beats a tombstone, and between two data payloads the
//! greater payload wins so that all peers settle on the same value.
//! Tombstones are never collected, which keeps stale peers from
//! resurrecting deleted keys.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

use crate::metrics;

/// One replicated entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRecord {
    /// Payload; empty for tombstones.
    #[serde(default)]
    pub value: String,
    /// Version stamp of the write.
    pub version: u64,
    /// Delete marker.
    #[serde(default)]
    pub tombstone: bool,
}

impl KvRecord {
    /// A data entry.
    pub fn data(value: impl Into<String>, version: u64) -> Self {
        Self {
            value: value.into(),
            version,
            tombstone: false,
        }
    }

    /// A delete marker.
    pub fn tombstone(version: u64) -> Self {
        Self {
            value: String::new(),
            version,
            tombstone: true,
        }
    }

    /// Whether `self` should replace `existing`.
    pub fn supersedes(&self, existing: &KvRecord) -> bool {
        match self.version.cmp(&existing.version) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match (self.tombstone, existing.tombstone) {
                (false, true) => true,
                (true, _) => false,
                (false, false) => self.value > existing.value,
            },
        }
    }
}

/// Map of key -> entry, as exchanged between peers.
pub type KvRecords = BTreeMap<String, KvRecord>;

/// Consistent view of the live (non-tombstoned) values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvSnapshot {
    /// key -> payload
    pub values: BTreeMap<String, String>,
    /// State version the view was taken at.
    pub version: u64,
}

/// Thread-safe LWW state.
#[derive(Debug, Clone, Default)]
pub struct KvState {
    inner: Arc<RwLock<KvStateInner>>,
}

#[derive(Debug, Default)]
struct KvStateInner {
    records: KvRecords,
    /// Bumped on every local mutation or merge that changed state.
    version: u64,
    /// Highest stamp issued locally or seen in a merge.
    last_stamp: u64,
    /// Snapshot valid for `version`.
    snapshot: Option<Arc<KvSnapshot>>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl KvState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live value of a key.
    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.read();
        inner
            .records
            .get(key)
            .filter(|r| !r.tombstone)
            .map(|r| r.value.clone())
    }

    /// Raw entry of a key, tombstones included.
    pub fn get_record(&self, key: &str) -> Option<KvRecord> {
        self.inner.read().records.get(key).cloned()
    }

    /// Current state version.
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// True when the map holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    /// Live values at the current version; cached until the version moves.
    pub fn snapshot(&self) -> Arc<KvSnapshot> {
        {
            let inner = self.inner.read();
            if let Some(snapshot) = &inner.snapshot {
                if snapshot.version == inner.version {
                    return snapshot.clone();
                }
            }
        }

        let mut inner = self.inner.write();
        if let Some(snapshot) = &inner.snapshot {
            if snapshot.version == inner.version {
                return snapshot.clone();
            }
        }
        let snapshot = Arc::new(KvSnapshot {
            values: inner
                .records
                .iter()
                .filter(|(_, r)| !r.tombstone)
                .map(|(k, r)| (k.clone(), r.value.clone()))
                .collect(),
            version: inner.version,
        });
        inner.snapshot = Some(snapshot.clone());
        snapshot
    }

    /// Every entry including tombstones, for full-state exchange.
    pub fn records(&self) -> KvRecords {
        self.inner.read().records.clone()
    }

    /// Apply local removals and puts with a fresh stamp.
    ///
    /// Returns the entries that changed, ready to broadcast. The change is
    /// visible to readers before this returns.
    pub fn update_values(&self, remove: &[String], put: &BTreeMap<String, String>) -> KvRecords {
        let mut inner = self.inner.write();
        let stamp = unix_now().max(inner.last_stamp + 1);

        let mut delta = KvRecords::new();
        for key in remove {
            let live = inner.records.get(key).is_some_and(|r| !r.tombstone);
            if !live {
                trace!(key, "skipping removal of absent key");
                continue;
            }
            delta.insert(key.clone(), KvRecord::tombstone(stamp));
        }
        for (key, value) in put {
            let unchanged = inner
                .records
                .get(key)
                .is_some_and(|r| !r.tombstone && &r.value == value);
            if unchanged {
                trace!(key, "skipping unchanged put");
                continue;
            }
            delta.insert(key.clone(), KvRecord::data(value.clone(), stamp));
        }

        if delta.is_empty() {
            return delta;
        }

        inner.last_stamp = stamp;
        for (key, record) in &delta {
            inner.records.insert(key.clone(), record.clone());
        }
        inner.version += 1;
        debug!(
            changes = delta.len(),
            stamp,
            version = inner.version,
            "applied local gossip update"
        );
        delta
    }

    /// Merge entries received from a peer; returns the entries that changed.
    pub fn merge(&self, other: &KvRecords) -> KvRecords {
        let mut inner = self.inner.write();

        let mut delta = KvRecords::new();
        for (key, update) in other {
            let replace = match inner.records.get(key) {
                None => true,
                Some(existing) => update.supersedes(existing),
            };
            inner.last_stamp = inner.last_stamp.max(update.version);
            if replace {
                inner.records.insert(key.clone(), update.clone());
                delta.insert(key.clone(), update.clone());
            }
        }

        if !delta.is_empty() {
            inner.version += 1;
            debug!(
                received = other.len(),
                changed = delta.len(),
                version = inner.version,
                "merged gossip state"
            );
        }
        metrics::record_gossip_merge(delta.len());
        delta
    }
}
