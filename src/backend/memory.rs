//! In-memory DNS provider.
//!
//! Keeps zones and record sets in process memory. It serves dry runs and
//! stands in for cloud providers in tests: every applied change is logged,
//! list support can be switched off to exercise the `get` probing path,
//! apply failures can be injected per zone, and a hook can observe each
//! successful apply.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::backend::{
    Change, ChangeBatch, Changeset, DnsProvider, RecordSets, ResourceRecordSet, Zone,
};
use crate::error::{DnsError, Result};
use crate::record::{ensure_dot_suffix, normalize_fqdn, RecordType};

/// Provider holding zones in memory.
#[derive(Debug)]
pub struct MemoryProvider {
    name: String,
    zones: Mutex<Vec<Arc<MemoryZone>>>,
    list_calls: AtomicUsize,
}

impl MemoryProvider {
    /// Create an empty provider.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            zones: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Add a zone supporting bulk listing.
    pub fn add_zone(&self, name: &str, id: &str) -> Arc<MemoryZone> {
        self.insert_zone(MemoryZone::new(name, id, true))
    }

    /// Add a zone that must be probed with `get`.
    pub fn add_zone_without_list(&self, name: &str, id: &str) -> Arc<MemoryZone> {
        self.insert_zone(MemoryZone::new(name, id, false))
    }

    fn insert_zone(&self, zone: MemoryZone) -> Arc<MemoryZone> {
        let zone = Arc::new(zone);
        self.zones.lock().push(zone.clone());
        zone
    }

    /// Number of `list_zones` calls served.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_zones(&self) -> Result<Vec<Arc<dyn Zone>>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .zones
            .lock()
            .iter()
            .map(|z| z.clone() as Arc<dyn Zone>)
            .collect())
    }
}

/// A zone kept in memory.
#[derive(Debug)]
pub struct MemoryZone {
    name: String,
    id: String,
    data: Arc<ZoneData>,
}

type ApplyHook = Arc<dyn Fn() + Send + Sync>;

struct ZoneData {
    zone_name: String,
    supports_list: bool,
    state: Mutex<ZoneState>,
    on_apply: Mutex<Option<ApplyHook>>,
}

impl fmt::Debug for ZoneData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneData")
            .field("zone_name", &self.zone_name)
            .field("supports_list", &self.supports_list)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct ZoneState {
    /// (fqdn, type) -> record set
    records: BTreeMap<(String, RecordType), ResourceRecordSet>,
    /// Every change applied, in order.
    applied: Vec<Change>,
    /// Number of upcoming applies that fail.
    failing_applies: usize,
}

impl MemoryZone {
    fn new(name: &str, id: &str, supports_list: bool) -> Self {
        let name = ensure_dot_suffix(name);
        Self {
            data: Arc::new(ZoneData {
                zone_name: name.clone(),
                supports_list,
                state: Mutex::new(ZoneState::default()),
                on_apply: Mutex::new(None),
            }),
            name,
            id: id.to_string(),
        }
    }

    /// Seed a record set without going through a changeset.
    pub fn insert(&self, rrs: ResourceRecordSet) {
        self.data.state.lock().records.insert(rrs.key(), rrs);
    }

    /// Current record sets, ordered by name and type.
    pub fn records(&self) -> Vec<ResourceRecordSet> {
        self.data.state.lock().records.values().cloned().collect()
    }

    /// Values currently published for `(fqdn, type)`.
    pub fn values(&self, fqdn: &str, record_type: RecordType) -> Option<Vec<String>> {
        self.data
            .state
            .lock()
            .records
            .get(&(normalize_fqdn(fqdn), record_type))
            .map(|rrs| rrs.values.clone())
    }

    /// Every change applied so far.
    pub fn applied(&self) -> Vec<Change> {
        self.data.state.lock().applied.clone()
    }

    /// Make the next `count` applies fail.
    pub fn fail_next_applies(&self, count: usize) {
        self.data.state.lock().failing_applies = count;
    }

    /// Run `hook` after every successful apply.
    pub fn on_apply(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.data.on_apply.lock() = Some(Arc::new(hook));
    }
}

impl Zone for MemoryZone {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn record_sets(&self) -> Option<Arc<dyn RecordSets>> {
        Some(Arc::new(MemoryRecordSets {
            data: self.data.clone(),
        }))
    }
}

struct MemoryRecordSets {
    data: Arc<ZoneData>,
}

#[async_trait]
impl RecordSets for MemoryRecordSets {
    fn supports_list(&self) -> bool {
        self.data.supports_list
    }

    async fn list(&self) -> Result<Vec<ResourceRecordSet>> {
        if !self.data.supports_list {
            return Err(DnsError::BackendUnavailable {
                zone: self.data.zone_name.clone(),
                reason: "listing record sets is not supported".to_string(),
            });
        }
        Ok(self.data.state.lock().records.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Vec<ResourceRecordSet>> {
        let name = normalize_fqdn(name);
        Ok(self
            .data
            .state
            .lock()
            .records
            .values()
            .filter(|rrs| normalize_fqdn(&rrs.name) == name)
            .cloned()
            .collect())
    }

    fn start_changeset(&self) -> Box<dyn Changeset> {
        Box::new(MemoryChangeset {
            data: self.data.clone(),
            batch: ChangeBatch::new(),
        })
    }
}

struct MemoryChangeset {
    data: Arc<ZoneData>,
    batch: ChangeBatch,
}

#[async_trait]
impl Changeset for MemoryChangeset {
    fn upsert(&mut self, rrs: ResourceRecordSet) -> Result<()> {
        self.batch.push(Change::Upsert(rrs))
    }

    fn remove(&mut self, rrs: ResourceRecordSet) -> Result<()> {
        self.batch.push(Change::Remove(rrs))
    }

    fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    async fn apply(&mut self) -> Result<()> {
        let mut state = self.data.state.lock();
        if state.failing_applies > 0 {
            state.failing_applies -= 1;
            return Err(DnsError::BackendUnavailable {
                zone: self.data.zone_name.clone(),
                reason: "injected apply failure".to_string(),
            });
        }

        for change in self.batch.changes() {
            match change {
                Change::Upsert(rrs) => {
                    state.records.insert(rrs.key(), rrs.clone());
                }
                Change::Remove(rrs) => {
                    state.records.remove(&rrs.key());
                }
            }
            state.applied.push(change.clone());
        }
        debug!(
            zone = %self.data.zone_name,
            changes = self.batch.len(),
            "applied in-memory changeset"
        );
        drop(state);
        self.batch.clear();

        let hook = self.data.on_apply.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_upsert_and_remove() {
        let provider = MemoryProvider::new("mem");
        let zone = provider.add_zone("example.com", "z1");
        assert_eq!(zone.name(), "example.com.");

        let rrs_api = zone.record_sets().unwrap();
        let mut cs = rrs_api.start_changeset();
        cs.upsert(rrs_api.new_record_set(
            "api.example.com.",
            vec!["1.1.1.1".to_string()],
            60,
            RecordType::A,
        ))
        .unwrap();
        assert!(!cs.is_empty());
        cs.apply().await.unwrap();
        assert!(cs.is_empty());

        assert_eq!(
            zone.values("api.example.com.", RecordType::A),
            Some(vec!["1.1.1.1".to_string()])
        );

        let existing = rrs_api.get("api.example.com").await.unwrap();
        let mut cs = rrs_api.start_changeset();
        cs.remove(existing[0].clone()).unwrap();
        cs.apply().await.unwrap();
        assert!(zone.records().is_empty());
        assert_eq!(zone.applied().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_keeps_state() {
        let provider = MemoryProvider::new("mem");
        let zone = provider.add_zone("example.com.", "z1");
        zone.fail_next_applies(1);

        let rrs_api = zone.record_sets().unwrap();
        let mut cs = rrs_api.start_changeset();
        cs.upsert(ResourceRecordSet::new(
            "api.example.com.",
            vec!["1.1.1.1".to_string()],
            60,
            RecordType::A,
        ))
        .unwrap();

        assert!(cs.apply().await.is_err());
        assert!(zone.records().is_empty());
        cs.apply().await.unwrap();
        assert_eq!(zone.records().len(), 1);
    }

    #[tokio::test]
    async fn test_list_unsupported() {
        let provider = MemoryProvider::new("mem");
        let zone = provider.add_zone_without_list("example.com.", "z1");
        let rrs_api = zone.record_sets().unwrap();
        assert!(!rrs_api.supports_list());
        assert!(rrs_api.list().await.is_err());
        assert!(rrs_api.get("api.example.com.").await.unwrap().is_empty());
    }
}
