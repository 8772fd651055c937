//! Shared test infrastructure for dnsmesh integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dnsmesh::backend::memory::{MemoryProvider, MemoryZone};
use dnsmesh::backend::{Change, DnsProvider};
use dnsmesh::gossip::{KvState, MeshConfig, MeshGossiper, StaticSeedProvider};
use dnsmesh::shutdown::{Shutdown, ShutdownTrigger};
use dnsmesh::{DnsController, Record, RecordType, ZoneRuleSet};

// --- Controller fixtures ---

/// A controller over one memory provider holding the given `(name, id)` zones.
pub struct ControllerFixture {
    pub controller: DnsController,
    pub provider: Arc<MemoryProvider>,
    pub zones: Vec<Arc<MemoryZone>>,
}

impl ControllerFixture {
    pub fn new(zones: &[(&str, &str)], rules: ZoneRuleSet) -> Self {
        let provider = Arc::new(MemoryProvider::new("mem"));
        let zones = zones
            .iter()
            .map(|(name, id)| provider.add_zone(name, id))
            .collect();
        let controller = DnsController::new(
            vec![provider.clone() as Arc<dyn DnsProvider>],
            rules,
            Duration::from_secs(60),
        );
        Self {
            controller,
            provider,
            zones,
        }
    }

    /// Fixture with a single wildcard-managed `example.com.` zone.
    pub fn example_com() -> Self {
        Self::new(&[("example.com.", "z1")], ZoneRuleSet::wildcard())
    }

    pub fn zone(&self, index: usize) -> &Arc<MemoryZone> {
        &self.zones[index]
    }

    pub async fn tick(&self) -> dnsmesh::error::Result<dnsmesh::TickOutcome> {
        self.controller.run_once(&Shutdown::never()).await
    }
}

// --- Record builders ---

pub fn a(fqdn: &str, value: &str) -> Record {
    Record::new(RecordType::A, fqdn, value)
}

pub fn upserted(changes: &[Change]) -> Vec<(String, RecordType, Vec<String>, u32)> {
    changes
        .iter()
        .filter_map(|c| match c {
            Change::Upsert(rrs) => Some((
                rrs.name.clone(),
                rrs.record_type,
                rrs.values.clone(),
                rrs.ttl,
            )),
            Change::Remove(_) => None,
        })
        .collect()
}

pub fn removed(changes: &[Change]) -> Vec<(String, RecordType)> {
    changes
        .iter()
        .filter_map(|c| match c {
            Change::Remove(rrs) => Some((rrs.name.clone(), rrs.record_type)),
            Change::Upsert(_) => None,
        })
        .collect()
}

// --- Gossip fixtures ---

/// Start a mesh node on a free loopback port, seeded with `seeds`.
pub async fn start_mesh(name: &str, seeds: &[String]) -> (ShutdownTrigger, MeshGossiper) {
    let (trigger, shutdown) = Shutdown::new();
    let mut config = MeshConfig::new("127.0.0.1:0".parse().unwrap(), name);
    config.seed_retry = Duration::from_millis(100);
    config.sync_interval = Duration::from_millis(200);
    let mesh = MeshGossiper::start(
        config,
        KvState::new(),
        Arc::new(StaticSeedProvider::new(seeds)),
        shutdown,
    )
    .await
    .expect("failed to start mesh");
    (trigger, mesh)
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
