//! DNS records stored in gossip state.
//!
//! Each record set lives under `dns/<zone>/<TYPE>/<fqdn>`, with both names
//! lowercased and without their trailing dot. The value is the
//! ascending-sorted, comma-joined list of record values.

pub mod provider;

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

use crate::backend::ResourceRecordSet;
use crate::gossip::GossipState;
use crate::record::{normalize_fqdn, RecordType};

pub use provider::GossipDnsProvider;

/// Zone served when no zone is declared.
pub const DEFAULT_ZONE_NAME: &str = "local.";

/// TTL reported for every gossip record; TTLs are not replicated.
pub const GOSSIP_TTL: u32 = 60;

const KEY_PREFIX: &str = "dns/";

fn strip_dot(name: &str) -> String {
    normalize_fqdn(name).trim_end_matches('.').to_string()
}

/// Gossip key of a record set.
pub fn record_key(zone: &str, record_type: RecordType, fqdn: &str) -> String {
    format!(
        "{KEY_PREFIX}{}/{}/{}",
        strip_dot(zone),
        record_type,
        strip_dot(fqdn)
    )
}

/// Split a gossip key into `(zone, type, fqdn)`, names with trailing dots.
pub fn parse_key(key: &str) -> Option<(String, RecordType, String)> {
    let rest = key.strip_prefix(KEY_PREFIX)?;
    let mut parts = rest.splitn(3, '/');
    let zone = parts.next().filter(|z| !z.is_empty())?;
    let record_type = parts.next()?.parse().ok()?;
    let fqdn = parts.next().filter(|f| !f.is_empty())?;
    Some((normalize_fqdn(zone), record_type, normalize_fqdn(fqdn)))
}

/// Gossip value of a list of record values.
pub fn encode_values(values: &[String]) -> String {
    let mut values: Vec<&str> = values.iter().map(|v| v.trim()).collect();
    values.sort_unstable();
    values.dedup();
    values.join(",")
}

/// Record values of a gossip value.
pub fn decode_values(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}

/// DNS records parsed from one gossip snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsViewSnapshot {
    /// Gossip version the records were parsed at.
    pub version: u64,
    /// zone -> record sets ordered by name and type
    zones: BTreeMap<String, Vec<ResourceRecordSet>>,
}

impl DnsViewSnapshot {
    /// Zones that hold at least one record.
    pub fn zones(&self) -> impl Iterator<Item = &str> {
        self.zones.keys().map(String::as_str)
    }

    /// Record sets of one zone.
    pub fn zone_records(&self, zone: &str) -> &[ResourceRecordSet] {
        self.zones
            .get(&normalize_fqdn(zone))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every record set across all zones.
    pub fn records(&self) -> impl Iterator<Item = &ResourceRecordSet> {
        self.zones.values().flatten()
    }

    /// address -> names (without trailing dot) for every A and AAAA record.
    pub fn address_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut addresses: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for rrs in self.records().filter(|rrs| rrs.record_type.is_address()) {
            let name = rrs.name.trim_end_matches('.');
            for value in &rrs.values {
                addresses
                    .entry(value.clone())
                    .or_default()
                    .push(name.to_string());
            }
        }
        for names in addresses.values_mut() {
            names.sort();
            names.dedup();
        }
        addresses
    }
}

/// Parsed DNS records of the gossip state, re-parsed only when the gossip
/// version moves.
pub struct DnsView {
    gossip: Arc<dyn GossipState>,
    cached: Mutex<Option<Arc<DnsViewSnapshot>>>,
}

impl DnsView {
    /// View over a gossip state.
    pub fn new(gossip: Arc<dyn GossipState>) -> Self {
        Self {
            gossip,
            cached: Mutex::new(None),
        }
    }

    /// Gossip state the view reads.
    pub fn gossip(&self) -> &Arc<dyn GossipState> {
        &self.gossip
    }

    /// Records at the current gossip version.
    pub fn snapshot(&self) -> Arc<DnsViewSnapshot> {
        let kv = self.gossip.snapshot();
        let mut cached = self.cached.lock();
        if let Some(snapshot) = cached.as_ref() {
            if snapshot.version == kv.version {
                return snapshot.clone();
            }
        }

        let mut zones: BTreeMap<String, Vec<ResourceRecordSet>> = BTreeMap::new();
        for (key, value) in &kv.values {
            let Some((zone, record_type, fqdn)) = parse_key(key) else {
                trace!(key = %key, "skipping non-DNS gossip key");
                continue;
            };
            zones.entry(zone).or_default().push(ResourceRecordSet::new(
                &fqdn,
                decode_values(value),
                GOSSIP_TTL,
                record_type,
            ));
        }

        let snapshot = Arc::new(DnsViewSnapshot {
            version: kv.version,
            zones,
        });
        *cached = Some(snapshot.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::KvState;

    #[test]
    fn test_record_key_format() {
        assert_eq!(
            record_key("local.", RecordType::A, "API.local."),
            "dns/local/A/api.local"
        );
        assert_eq!(
            parse_key("dns/local/AAAA/api.local"),
            Some((
                "local.".to_string(),
                RecordType::Aaaa,
                "api.local.".to_string()
            ))
        );
        assert_eq!(parse_key("other/local/A/api.local"), None);
        assert_eq!(parse_key("dns/local/MX/api.local"), None);
        assert_eq!(parse_key("dns/local/A"), None);
    }

    #[test]
    fn test_values_are_sorted_and_joined() {
        let values = vec!["10.0.0.2".to_string(), "10.0.0.1".to_string()];
        assert_eq!(encode_values(&values), "10.0.0.1,10.0.0.2");
        assert_eq!(decode_values("10.0.0.1,10.0.0.2"), vec!["10.0.0.1", "10.0.0.2"]);
        assert!(decode_values("").is_empty());
    }

    #[test]
    fn test_view_groups_by_zone_and_caches() {
        let state = Arc::new(KvState::new());
        state.update_values(
            &[],
            &BTreeMap::from([
                ("dns/local/A/api.local".to_string(), "10.0.0.1".to_string()),
                ("dns/k8s/A/etcd.k8s".to_string(), "10.0.0.2".to_string()),
                ("unrelated".to_string(), "x".to_string()),
            ]),
        );
        let view = DnsView::new(state.clone());

        let first = view.snapshot();
        assert_eq!(first.zones().collect::<Vec<_>>(), vec!["k8s.", "local."]);
        assert_eq!(first.zone_records("local")[0].name, "api.local.");
        assert!(Arc::ptr_eq(&first, &view.snapshot()));

        state.update_values(&["dns/k8s/A/etcd.k8s".to_string()], &BTreeMap::new());
        let second = view.snapshot();
        assert_eq!(second.zones().collect::<Vec<_>>(), vec!["local."]);
    }

    #[test]
    fn test_address_map_skips_non_address_records() {
        let state = Arc::new(KvState::new());
        state.update_values(
            &[],
            &BTreeMap::from([
                ("dns/local/A/api.local".to_string(), "10.0.0.1".to_string()),
                ("dns/local/A/etcd.local".to_string(), "10.0.0.1".to_string()),
                ("dns/local/CNAME/www.local".to_string(), "api.local".to_string()),
            ]),
        );
        let view = DnsView::new(state);

        let addresses = view.snapshot().address_map();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses["10.0.0.1"], vec!["api.local", "etcd.local"]);
    }
}
