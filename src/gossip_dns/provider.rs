//! Gossip state exposed as a DNS provider, so the controller can publish
//! into the mesh like into any other backend.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::backend::{
    Change, ChangeBatch, Changeset, DnsProvider, RecordSets, ResourceRecordSet, Zone,
};
use crate::error::{DnsError, Result};
use crate::gossip::GossipState;
use crate::gossip_dns::{encode_values, record_key, DnsView, GOSSIP_TTL};
use crate::record::{is_within_zone, normalize_fqdn, RecordType};

/// DNS provider backed by gossip state.
pub struct GossipDnsProvider {
    view: Arc<DnsView>,
    /// Zones served even while empty.
    declared: Vec<String>,
}

impl GossipDnsProvider {
    /// Provider over a DNS view, always listing the declared zones.
    pub fn new<S: AsRef<str>>(view: Arc<DnsView>, declared: &[S]) -> Self {
        Self {
            view,
            declared: declared
                .iter()
                .map(|z| z.as_ref().trim())
                .filter(|z| !z.is_empty())
                .map(normalize_fqdn)
                .collect(),
        }
    }
}

#[async_trait]
impl DnsProvider for GossipDnsProvider {
    fn name(&self) -> &str {
        "gossip"
    }

    async fn list_zones(&self) -> Result<Vec<Arc<dyn Zone>>> {
        let snapshot = self.view.snapshot();
        let names: BTreeSet<String> = self
            .declared
            .iter()
            .cloned()
            .chain(snapshot.zones().map(String::from))
            .collect();

        Ok(names
            .into_iter()
            .map(|name| {
                Arc::new(GossipZone {
                    name,
                    view: self.view.clone(),
                }) as Arc<dyn Zone>
            })
            .collect())
    }
}

/// One zone of the gossip state; its id is its name.
pub struct GossipZone {
    name: String,
    view: Arc<DnsView>,
}

impl fmt::Debug for GossipZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GossipZone")
            .field("name", &self.name)
            .finish()
    }
}

impl Zone for GossipZone {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> &str {
        &self.name
    }

    fn record_sets(&self) -> Option<Arc<dyn RecordSets>> {
        Some(Arc::new(GossipRecordSets {
            zone: self.name.clone(),
            view: self.view.clone(),
        }))
    }
}

struct GossipRecordSets {
    zone: String,
    view: Arc<DnsView>,
}

#[async_trait]
impl RecordSets for GossipRecordSets {
    async fn list(&self) -> Result<Vec<ResourceRecordSet>> {
        Ok(self.view.snapshot().zone_records(&self.zone).to_vec())
    }

    async fn get(&self, name: &str) -> Result<Vec<ResourceRecordSet>> {
        let name = normalize_fqdn(name);
        Ok(self
            .view
            .snapshot()
            .zone_records(&self.zone)
            .iter()
            .filter(|rrs| rrs.name == name)
            .cloned()
            .collect())
    }

    fn new_record_set(
        &self,
        name: &str,
        values: Vec<String>,
        _ttl: u32,
        record_type: RecordType,
    ) -> ResourceRecordSet {
        ResourceRecordSet::new(&normalize_fqdn(name), values, GOSSIP_TTL, record_type)
    }

    fn start_changeset(&self) -> Box<dyn Changeset> {
        Box::new(GossipChangeset {
            zone: self.zone.clone(),
            gossip: self.view.gossip().clone(),
            batch: ChangeBatch::new(),
        })
    }
}

struct GossipChangeset {
    zone: String,
    gossip: Arc<dyn GossipState>,
    batch: ChangeBatch,
}

impl GossipChangeset {
    fn push(&mut self, change: Change) -> Result<()> {
        let name = &change.record_set().name;
        if !is_within_zone(name, &self.zone) {
            return Err(DnsError::RecordOutsideZone {
                name: name.clone(),
                zone: self.zone.clone(),
            });
        }
        self.batch.push(change)
    }
}

#[async_trait]
impl Changeset for GossipChangeset {
    fn upsert(&mut self, rrs: ResourceRecordSet) -> Result<()> {
        self.push(Change::Upsert(rrs))
    }

    fn remove(&mut self, rrs: ResourceRecordSet) -> Result<()> {
        self.push(Change::Remove(rrs))
    }

    fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    async fn apply(&mut self) -> Result<()> {
        let mut remove = Vec::new();
        let mut put = BTreeMap::new();
        for change in self.batch.changes() {
            let rrs = change.record_set();
            let key = record_key(&self.zone, rrs.record_type, &rrs.name);
            match change {
                Change::Upsert(_) => {
                    put.insert(key, encode_values(&rrs.values));
                }
                Change::Remove(_) => remove.push(key),
            }
        }

        self.gossip.update_values(&remove, &put)?;
        debug!(
            zone = %self.zone,
            removed = remove.len(),
            updated = put.len(),
            "applied gossip DNS changeset"
        );
        self.batch.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::KvState;
    use crate::gossip_dns::DEFAULT_ZONE_NAME;

    fn provider(state: &Arc<KvState>) -> GossipDnsProvider {
        let view = Arc::new(DnsView::new(state.clone()));
        GossipDnsProvider::new(view, &[DEFAULT_ZONE_NAME])
    }

    fn rrs(name: &str, values: &[&str]) -> ResourceRecordSet {
        ResourceRecordSet::new(
            name,
            values.iter().map(|v| v.to_string()).collect(),
            300,
            RecordType::A,
        )
    }

    #[tokio::test]
    async fn test_declared_zone_listed_while_empty() {
        let state = Arc::new(KvState::new());
        let zones = provider(&state).list_zones().await.unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].name(), "local.");
        assert_eq!(zones[0].id(), "local.");
    }

    #[tokio::test]
    async fn test_zones_discovered_from_keys() {
        let state = Arc::new(KvState::new());
        state.update_values(
            &[],
            &BTreeMap::from([("dns/k8s/A/etcd.k8s".to_string(), "10.0.0.1".to_string())]),
        );
        let zones = provider(&state).list_zones().await.unwrap();
        let names: Vec<&str> = zones.iter().map(|z| z.name()).collect();
        assert_eq!(names, vec!["k8s.", "local."]);
    }

    #[tokio::test]
    async fn test_changeset_writes_gossip_keys() {
        let state = Arc::new(KvState::new());
        let zones = provider(&state).list_zones().await.unwrap();
        let rrs_api = zones[0].record_sets().unwrap();

        let mut cs = rrs_api.start_changeset();
        cs.upsert(rrs("api.local.", &["10.0.0.2", "10.0.0.1"])).unwrap();
        cs.apply().await.unwrap();
        assert_eq!(
            state.get("dns/local/A/api.local"),
            Some("10.0.0.1,10.0.0.2".to_string())
        );

        let listed = rrs_api.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].ttl, GOSSIP_TTL);

        let mut cs = rrs_api.start_changeset();
        cs.remove(listed[0].clone()).unwrap();
        cs.apply().await.unwrap();
        assert_eq!(state.get("dns/local/A/api.local"), None);
        assert!(rrs_api.get("api.local.").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_changeset_refuses_foreign_names_and_duplicates() {
        let state = Arc::new(KvState::new());
        let zones = provider(&state).list_zones().await.unwrap();
        let mut cs = zones[0].record_sets().unwrap().start_changeset();

        assert!(matches!(
            cs.upsert(rrs("api.example.com.", &["10.0.0.1"])),
            Err(DnsError::RecordOutsideZone { .. })
        ));

        cs.upsert(rrs("api.local.", &["10.0.0.1"])).unwrap();
        assert!(matches!(
            cs.remove(rrs("api.local.", &["10.0.0.1"])),
            Err(DnsError::DuplicateKeyInChangeset { .. })
        ));
    }
}
