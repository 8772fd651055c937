//! Uniform surface over DNS providers.
//!
//! A [`DnsProvider`] lists [`Zone`]s; a zone hands out a [`RecordSets`] API
//! which builds [`ResourceRecordSet`]s and starts [`Changeset`]s. Concrete
//! cloud providers live outside this crate; [`memory`] and the gossip zone
//! in [`crate::gossip_dns`] are the in-tree implementations.

pub mod memory;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{DnsError, Result};
use crate::record::{normalize_fqdn, RecordType};

/// A set of values published under one `(name, type)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecordSet {
    /// Owner name.
    pub name: String,
    /// Record type.
    pub record_type: RecordType,
    /// TTL in seconds.
    pub ttl: u32,
    /// Values (addresses, CNAME target).
    pub values: Vec<String>,
}

impl ResourceRecordSet {
    /// Build a record set.
    pub fn new(name: &str, values: Vec<String>, ttl: u32, record_type: RecordType) -> Self {
        Self {
            name: name.to_string(),
            record_type,
            ttl,
            values,
        }
    }

    /// Canonical `(name, type)` identity.
    pub fn key(&self) -> (String, RecordType) {
        (normalize_fqdn(&self.name), self.record_type)
    }
}

impl fmt::Display for ResourceRecordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} [{}]",
            self.name,
            self.ttl,
            self.record_type,
            self.values.join(",")
        )
    }
}

/// One queued operation in a changeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Create or replace the record set.
    Upsert(ResourceRecordSet),
    /// Delete the record set.
    Remove(ResourceRecordSet),
}

impl Change {
    /// Record set the change targets.
    pub fn record_set(&self) -> &ResourceRecordSet {
        match self {
            Change::Upsert(rrs) | Change::Remove(rrs) => rrs,
        }
    }
}

/// Ordered batch of changes with at most one change per `(name, type)`.
///
/// Backends embed this in their [`Changeset`] to get the duplicate check.
#[derive(Debug, Default, Clone)]
pub struct ChangeBatch {
    changes: Vec<Change>,
    keys: HashSet<(String, RecordType)>,
}

impl ChangeBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a change, refusing a second change to the same record set.
    pub fn push(&mut self, change: Change) -> Result<()> {
        let key = change.record_set().key();
        if !self.keys.insert(key.clone()) {
            return Err(DnsError::DuplicateKeyInChangeset {
                name: key.0,
                record_type: key.1.to_string(),
            });
        }
        self.changes.push(change);
        Ok(())
    }

    /// Queued changes in submission order.
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of queued changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Drain the batch after a successful apply.
    pub fn clear(&mut self) {
        self.changes.clear();
        self.keys.clear();
    }
}

/// Source of zones (one per DNS service account / gossip mesh).
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Every zone this provider can manage.
    async fn list_zones(&self) -> Result<Vec<Arc<dyn Zone>>>;
}

/// A managed zone.
pub trait Zone: Send + Sync + fmt::Debug {
    /// Zone name, ending with a dot.
    fn name(&self) -> &str;

    /// Provider-specific zone id; distinguishes zones sharing a name.
    fn id(&self) -> &str;

    /// Record-set API, if the zone supports record management.
    fn record_sets(&self) -> Option<Arc<dyn RecordSets>>;

    /// Key used to group changesets per zone.
    fn cache_key(&self) -> String {
        format!("{}::{}", self.name(), self.id())
    }
}

/// Record-set API of a zone.
#[async_trait]
pub trait RecordSets: Send + Sync {
    /// Whether `list` is supported; otherwise callers probe with `get`.
    fn supports_list(&self) -> bool {
        true
    }

    /// All record sets in the zone.
    async fn list(&self) -> Result<Vec<ResourceRecordSet>>;

    /// Record sets with the given owner name.
    async fn get(&self, name: &str) -> Result<Vec<ResourceRecordSet>>;

    /// Build a record set suitable for this backend.
    fn new_record_set(
        &self,
        name: &str,
        values: Vec<String>,
        ttl: u32,
        record_type: RecordType,
    ) -> ResourceRecordSet {
        ResourceRecordSet::new(name, values, ttl, record_type)
    }

    /// Start a batch of changes against the zone.
    fn start_changeset(&self) -> Box<dyn Changeset>;
}

/// In-flight batch of changes against one zone.
#[async_trait]
pub trait Changeset: Send {
    /// Queue a create-or-replace.
    fn upsert(&mut self, rrs: ResourceRecordSet) -> Result<()>;

    /// Queue a deletion.
    fn remove(&mut self, rrs: ResourceRecordSet) -> Result<()>;

    /// True when nothing is queued.
    fn is_empty(&self) -> bool;

    /// Apply all queued changes. Errors are scoped to this zone.
    async fn apply(&mut self) -> Result<()>;
}

struct CachedZones {
    fetched: Instant,
    zones: Vec<Arc<dyn Zone>>,
}

/// Zone listing shared across ticks, refreshed after a validity window.
pub struct ZoneCache {
    providers: Vec<Arc<dyn DnsProvider>>,
    cached: Mutex<Option<CachedZones>>,
}

impl ZoneCache {
    /// Cache over the given providers.
    pub fn new(providers: Vec<Arc<dyn DnsProvider>>) -> Self {
        Self {
            providers,
            cached: Mutex::new(None),
        }
    }

    /// Zones of every provider, reusing a listing younger than `validity`.
    pub async fn list_zones(&self, validity: Duration) -> Result<Vec<Arc<dyn Zone>>> {
        let fresh = self
            .cached
            .lock()
            .as_ref()
            .filter(|cached| cached.fetched.elapsed() < validity)
            .map(|cached| cached.zones.clone());
        if let Some(zones) = fresh {
            return Ok(zones);
        }

        let mut zones = Vec::new();
        for provider in &self.providers {
            debug!(provider = provider.name(), "querying all DNS zones");
            let listed =
                provider
                    .list_zones()
                    .await
                    .map_err(|e| DnsError::BackendUnavailable {
                        zone: provider.name().to_string(),
                        reason: e.to_string(),
                    })?;
            zones.extend(listed);
        }

        *self.cached.lock() = Some(CachedZones {
            fetched: Instant::now(),
            zones: zones.clone(),
        });
        Ok(zones)
    }

    /// Drop the cached listing so the next call re-queries providers.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}
