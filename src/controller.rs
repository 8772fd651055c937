//! DNS controller: applies the desired state of the scope registry to the
//! DNS backends.
//!
//! Every tick takes a registry snapshot, expands aliases, diffs the result
//! against the last snapshot that applied cleanly, and pushes the minimal
//! set of upserts and removals through one changeset per zone. A tick only
//! becomes the new baseline when every changeset applied, so failed keys are
//! retried on the next tick.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::backend::{Changeset, DnsProvider, ResourceRecordSet, Zone, ZoneCache};
use crate::error::{DnsError, Result};
use crate::metrics::{self, TickResult, Timer};
use crate::record::{
    ensure_dot_suffix, fix_wildcards, normalize_alias_key, normalize_values, Record, RecordKey,
    RecordType,
};
use crate::scope::{RegistrySnapshot, Scope, ScopeRegistry};
use crate::shutdown::Shutdown;
use crate::zone_rules::{ZoneMatcher, ZoneRuleSet};

/// TTL used when no producer sets one.
pub const DEFAULT_TTL: u32 = 60;

/// Default delay between ticks.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

/// How long a zone listing is reused across ticks.
pub const ZONE_LIST_CACHE_VALIDITY: Duration = Duration::from_secs(15 * 60);

/// Values and TTL desired for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordValues {
    /// Sorted, de-duplicated values.
    pub values: Vec<String>,
    /// TTL in seconds.
    pub ttl: u32,
}

/// Resolved desired state at one change count.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Registry change count the snapshot was built from.
    pub change_count: u64,
    /// key -> values
    pub values: HashMap<RecordKey, RecordValues>,
}

/// What a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// At least one scope has not been marked ready.
    NotReady,
    /// Nothing changed since the last successful apply.
    Unchanged,
    /// Changes were computed and applied.
    Applied {
        /// Number of non-empty changesets applied.
        changesets: usize,
    },
}

/// Expand aliases and build the key -> values map of a registry snapshot.
///
/// Alias targets are indexed by their symbolic key and never published
/// themselves. Only one level of aliasing is resolved. Missing alias targets
/// are logged once per alias key and produce no entries.
pub fn resolve_snapshot(snapshot: &RegistrySnapshot, default_ttl: u32) -> Snapshot {
    let mut alias_targets: HashMap<String, Vec<&Record>> = HashMap::new();
    let mut published: Vec<&Record> = Vec::new();
    for record in &snapshot.records {
        if record.alias_target {
            alias_targets
                .entry(normalize_alias_key(&record.fqdn))
                .or_default()
                .push(record);
        } else {
            published.push(record);
        }
    }

    let mut values: HashMap<RecordKey, (Vec<String>, Option<u32>)> = HashMap::new();
    let mut push = |key: RecordKey, value: &str, ttl: Option<u32>| {
        let entry = values.entry(key).or_default();
        entry.0.push(value.to_string());
        entry.1 = match (entry.1, ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    };

    let mut missing_aliases = BTreeSet::new();
    for record in published {
        if record.record_type != RecordType::Alias {
            push(record.key(), &record.value, record.ttl);
            continue;
        }

        let alias_key = normalize_alias_key(&record.value);
        let Some(targets) = alias_targets.get(&alias_key) else {
            missing_aliases.insert(alias_key);
            continue;
        };
        for target in targets {
            if target.record_type == RecordType::Alias {
                debug!(alias = %alias_key, "ignoring chained alias target");
                continue;
            }
            push(
                RecordKey::new(target.record_type, &record.fqdn),
                &target.value,
                record.ttl.or(target.ttl),
            );
        }
    }

    for alias_key in missing_aliases {
        info!(
            alias = %alias_key,
            error = %DnsError::AliasTargetMissing(alias_key.clone()),
            "alias specified but no records were found for that name"
        );
        metrics::record_alias_target_missing();
    }

    Snapshot {
        change_count: snapshot.change_count,
        values: values
            .into_iter()
            .map(|(key, (values, ttl))| {
                (
                    key,
                    RecordValues {
                        values: normalize_values(values),
                        ttl: ttl.unwrap_or(default_ttl),
                    },
                )
            })
            .collect(),
    }
}

/// Applies the desired DNS state to the DNS backends.
pub struct DnsController {
    registry: ScopeRegistry,
    zone_rules: ZoneRuleSet,
    zone_cache: ZoneCache,
    update_interval: Duration,
    default_ttl: u32,
    /// Last snapshot applied without error; the diff baseline.
    last_applied: Mutex<Option<Arc<Snapshot>>>,
}

impl DnsController {
    /// Create a controller over the given providers.
    pub fn new(
        providers: Vec<Arc<dyn DnsProvider>>,
        zone_rules: ZoneRuleSet,
        update_interval: Duration,
    ) -> Self {
        Self {
            registry: ScopeRegistry::new(),
            zone_rules,
            zone_cache: ZoneCache::new(providers),
            update_interval,
            default_ttl: DEFAULT_TTL,
            last_applied: Mutex::new(None),
        }
    }

    /// Override the TTL used when producers set none.
    pub fn with_default_ttl(mut self, ttl: u32) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Registry producers publish into.
    pub fn registry(&self) -> &ScopeRegistry {
        &self.registry
    }

    /// Create a producer scope.
    pub fn create_scope(&self, name: &str) -> Result<Scope> {
        self.registry.create_scope(name)
    }

    /// Last snapshot applied without error.
    pub fn last_applied(&self) -> Option<Arc<Snapshot>> {
        self.last_applied.lock().clone()
    }

    /// Run ticks until shutdown. Errors double the delay before the next tick.
    pub async fn run(&self, shutdown: Shutdown) {
        info!(
            interval_secs = self.update_interval.as_secs(),
            "starting DNS controller"
        );

        loop {
            let result = self.run_once(&shutdown).await;
            if shutdown.is_shutting_down() {
                info!("exiting DNS controller loop");
                return;
            }

            let delay = match result {
                Ok(_) => self.update_interval,
                Err(e) => {
                    warn!(error = %e, "unexpected error in DNS controller, will retry");
                    self.update_interval * 2
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait() => {
                    info!("exiting DNS controller loop");
                    return;
                }
            }
        }
    }

    /// One reconcile tick.
    pub async fn run_once(&self, shutdown: &Shutdown) -> Result<TickOutcome> {
        let timer = Timer::start();
        let result = self.reconcile(shutdown).await;

        let tick_result = match &result {
            Ok(TickOutcome::NotReady) => TickResult::NotReady,
            Ok(TickOutcome::Unchanged) => TickResult::Unchanged,
            Ok(TickOutcome::Applied { .. }) => TickResult::Applied,
            Err(_) => TickResult::Error,
        };
        metrics::record_tick(tick_result, timer.elapsed());
        result
    }

    async fn reconcile(&self, shutdown: &Shutdown) -> Result<TickOutcome> {
        if shutdown.is_shutting_down() {
            return Err(DnsError::StopRequested);
        }

        let registry_snapshot = self.registry.snapshot();
        if !registry_snapshot.is_ready() {
            info!(scopes = ?registry_snapshot.not_ready, "scopes not yet ready");
            return Ok(TickOutcome::NotReady);
        }

        let last_applied = self.last_applied();
        if let Some(last) = &last_applied {
            if last.change_count == registry_snapshot.change_count {
                trace!("no changes since DNS values last successfully applied");
                return Ok(TickOutcome::Unchanged);
            }
        }

        metrics::record_desired_state(
            self.registry.scope_count(),
            registry_snapshot.records.len(),
        );
        let snapshot = resolve_snapshot(&registry_snapshot, self.default_ttl);
        let empty: HashMap<RecordKey, RecordValues> = HashMap::new();
        let old_values = last_applied.as_ref().map_or(&empty, |s| &s.values);

        let mut op = DnsOp::new(&self.zone_rules, &self.zone_cache).await?;

        // One bad key must not block every other request.
        let mut errors = Vec::new();

        // Sorted for a stable order of changes within each changeset.
        let mut changed: Vec<(&RecordKey, &RecordValues)> = snapshot
            .values
            .iter()
            .filter(|(key, new)| old_values.get(*key) != Some(*new))
            .collect();
        changed.sort_by(|a, b| a.0.cmp(b.0));

        for (key, new) in changed {
            if shutdown.is_shutting_down() {
                return Err(DnsError::StopRequested);
            }
            debug!(
                key = %key,
                old = ?old_values.get(key).map(|v| &v.values),
                new = ?new.values,
                ttl = new.ttl,
                "updating records"
            );
            if let Err(e) = op.update_records(key, &new.values, new.ttl).await {
                warn!(key = %key, error = %e, "error updating records");
                errors.push(e);
            }
        }

        let mut removed: Vec<&RecordKey> = old_values
            .keys()
            .filter(|key| !snapshot.values.contains_key(*key))
            .collect();
        removed.sort();

        for key in removed {
            if shutdown.is_shutting_down() {
                return Err(DnsError::StopRequested);
            }
            if let Err(e) = op.delete_records(key).await {
                warn!(key = %key, error = %e, "error deleting records");
                errors.push(e);
            }
        }

        let applied = op.apply(shutdown, &mut errors).await?;

        if !errors.is_empty() {
            // Zones may have been created or deleted since the cached listing.
            if errors.iter().any(|e| {
                matches!(
                    e,
                    DnsError::NoZoneForFqdn(_) | DnsError::BackendUnavailable { .. }
                )
            }) {
                self.zone_cache.invalidate();
            }
            return Err(errors.swap_remove(0));
        }

        info!(
            change_count = snapshot.change_count,
            keys = snapshot.values.len(),
            changesets = applied,
            "DNS state applied"
        );
        *self.last_applied.lock() = Some(Arc::new(snapshot));
        Ok(TickOutcome::Applied {
            changesets: applied,
        })
    }

    /// Delete the given records from their zones right away, outside the tick.
    pub async fn remove_records_immediate(&self, records: &[Record]) -> Result<()> {
        let mut op = DnsOp::new(&self.zone_rules, &self.zone_cache).await?;
        let mut errors = Vec::new();

        let keys: BTreeSet<RecordKey> = records.iter().map(Record::key).collect();
        for key in &keys {
            if let Err(e) = op.delete_records(key).await {
                warn!(key = %key, error = %e, "error deleting records");
                errors.push(e);
            }
        }

        op.apply(&Shutdown::never(), &mut errors).await?;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.swap_remove(0))
        }
    }
}

/// A single reconcile pass; caches zone records and changesets for its lifetime.
struct DnsOp {
    matcher: ZoneMatcher,
    /// zone key -> listed record sets (fetched at most once per pass)
    records_cache: HashMap<String, Vec<ResourceRecordSet>>,
    /// zone key -> (zone, changeset)
    changesets: BTreeMap<String, (Arc<dyn Zone>, Box<dyn Changeset>)>,
}

impl DnsOp {
    async fn new(zone_rules: &ZoneRuleSet, zone_cache: &ZoneCache) -> Result<Self> {
        let zones = zone_cache.list_zones(ZONE_LIST_CACHE_VALIDITY).await?;
        Ok(Self {
            matcher: ZoneMatcher::new(zone_rules, zones),
            records_cache: HashMap::new(),
            changesets: BTreeMap::new(),
        })
    }

    fn changeset(&mut self, zone: &Arc<dyn Zone>) -> Result<&mut Box<dyn Changeset>> {
        let key = zone.cache_key();
        if !self.changesets.contains_key(&key) {
            let rrs = zone
                .record_sets()
                .ok_or_else(|| DnsError::ZoneNotWritable(zone.name().to_string()))?;
            self.changesets
                .insert(key.clone(), (zone.clone(), rrs.start_changeset()));
        }
        match self.changesets.get_mut(&key) {
            Some((_, changeset)) => Ok(changeset),
            None => Err(DnsError::ZoneNotWritable(zone.name().to_string())),
        }
    }

    /// Record sets of a zone with a matching name and type.
    ///
    /// Zones without bulk listing are probed by name; listings are cached
    /// for the rest of the pass.
    async fn existing(
        &mut self,
        zone: &Arc<dyn Zone>,
        fqdn: &str,
        record_type: RecordType,
    ) -> Result<Vec<ResourceRecordSet>> {
        let rrs_api = zone
            .record_sets()
            .ok_or_else(|| DnsError::ZoneNotWritable(zone.name().to_string()))?;

        let candidates = if rrs_api.supports_list() {
            let key = zone.cache_key();
            if !self.records_cache.contains_key(&key) {
                debug!(zone = %zone.name(), "querying all records for zone");
                let listed = rrs_api
                    .list()
                    .await
                    .map_err(|e| DnsError::BackendUnavailable {
                        zone: zone.name().to_string(),
                        reason: e.to_string(),
                    })?;
                self.records_cache.insert(key.clone(), listed);
            }
            self.records_cache.get(&key).cloned().unwrap_or_default()
        } else {
            rrs_api
                .get(fqdn)
                .await
                .map_err(|e| DnsError::BackendUnavailable {
                    zone: zone.name().to_string(),
                    reason: e.to_string(),
                })?
        };

        Ok(candidates
            .into_iter()
            .filter(|rr| {
                let name = ensure_dot_suffix(&fix_wildcards(&rr.name)).to_ascii_lowercase();
                if name != fqdn {
                    trace!(record = %name, fqdn, "skipping record (name differs)");
                    return false;
                }
                rr.record_type == record_type
            })
            .collect())
    }

    async fn update_records(&mut self, key: &RecordKey, values: &[String], ttl: u32) -> Result<()> {
        let zone = self.matcher.find_zone(&key.fqdn)?;
        let rrs_api = zone
            .record_sets()
            .ok_or_else(|| DnsError::ZoneNotWritable(zone.name().to_string()))?;

        let existing = self.existing(&zone, &key.fqdn, key.record_type).await?;
        if existing.len() > 1 {
            warn!(key = %key, count = existing.len(), "found multiple matching records");
        }
        if let Some(existing) = existing.last() {
            trace!(key = %key, existing = %existing, "found matching record");
        }

        let rr = rrs_api.new_record_set(&key.fqdn, values.to_vec(), ttl, key.record_type);
        debug!(key = %key, record = %rr, "adding DNS change to batch");
        self.changeset(&zone)?.upsert(rr)
    }

    async fn delete_records(&mut self, key: &RecordKey) -> Result<()> {
        debug!(key = %key, "deleting all records");
        let zone = self.matcher.find_zone(&key.fqdn)?;

        let existing = self.existing(&zone, &key.fqdn, key.record_type).await?;
        if existing.is_empty() {
            debug!(key = %key, "no records to delete");
            return Ok(());
        }

        let changeset = self.changeset(&zone)?;
        for rr in existing {
            debug!(record = %rr, "deleting resource record");
            changeset.remove(rr)?;
        }
        Ok(())
    }

    /// Apply every non-empty changeset, pushing per-zone errors onto `errors`.
    async fn apply(&mut self, shutdown: &Shutdown, errors: &mut Vec<DnsError>) -> Result<usize> {
        let mut applied = 0;
        for (key, (zone, changeset)) in self.changesets.iter_mut() {
            if changeset.is_empty() {
                continue;
            }
            if shutdown.is_shutting_down() {
                return Err(DnsError::StopRequested);
            }

            debug!(zone = %key, "applying DNS changeset");
            match changeset.apply().await {
                Ok(()) => {
                    applied += 1;
                    metrics::record_changeset(zone.name(), true);
                }
                Err(e) => {
                    warn!(zone = %key, error = %e, "error applying DNS changeset");
                    metrics::record_changeset(zone.name(), false);
                    errors.push(DnsError::BackendUnavailable {
                        zone: key.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_of(records: Vec<Record>) -> RegistrySnapshot {
        RegistrySnapshot {
            change_count: 1,
            not_ready: Vec::new(),
            records,
        }
    }

    #[test]
    fn test_resolve_expands_alias_one_hop() {
        let resolved = resolve_snapshot(
            &snapshot_of(vec![
                Record::alias_target(RecordType::A, "node-a/external", "54.0.0.1"),
                Record::alias("svc.example.com.", "node-a/external"),
            ]),
            DEFAULT_TTL,
        );

        assert_eq!(resolved.values.len(), 1);
        let values = &resolved.values[&RecordKey::new(RecordType::A, "svc.example.com.")];
        assert_eq!(values.values, vec!["54.0.0.1"]);
        assert_eq!(values.ttl, DEFAULT_TTL);
    }

    #[test]
    fn test_resolve_missing_alias_produces_nothing() {
        let resolved = resolve_snapshot(
            &snapshot_of(vec![Record::alias("svc.example.com.", "node-b/external")]),
            DEFAULT_TTL,
        );
        assert!(resolved.values.is_empty());
    }

    #[test]
    fn test_resolve_does_not_follow_chained_aliases() {
        let resolved = resolve_snapshot(
            &snapshot_of(vec![
                Record::alias_target(RecordType::A, "node-a/external", "54.0.0.1"),
                Record {
                    alias_target: true,
                    ..Record::alias("group/external", "node-a/external")
                },
                Record::alias("svc.example.com.", "group/external"),
            ]),
            DEFAULT_TTL,
        );
        assert!(resolved.values.is_empty());
    }

    #[test]
    fn test_resolve_dedupes_and_sorts_values() {
        let resolved = resolve_snapshot(
            &snapshot_of(vec![
                Record::new(RecordType::A, "api.example.com.", "1.1.1.2"),
                Record::new(RecordType::A, "API.example.com", "1.1.1.1"),
                Record::new(RecordType::A, "api.example.com.", "1.1.1.2"),
            ]),
            DEFAULT_TTL,
        );
        let values = &resolved.values[&RecordKey::new(RecordType::A, "api.example.com.")];
        assert_eq!(values.values, vec!["1.1.1.1", "1.1.1.2"]);
    }

    #[test]
    fn test_resolve_picks_smallest_producer_ttl() {
        let resolved = resolve_snapshot(
            &snapshot_of(vec![
                Record::new(RecordType::A, "api.example.com.", "1.1.1.1").with_ttl(300),
                Record::new(RecordType::A, "api.example.com.", "1.1.1.2").with_ttl(30),
                Record::new(RecordType::A, "www.example.com.", "1.1.1.3"),
            ]),
            DEFAULT_TTL,
        );
        assert_eq!(
            resolved.values[&RecordKey::new(RecordType::A, "api.example.com.")].ttl,
            30
        );
        assert_eq!(
            resolved.values[&RecordKey::new(RecordType::A, "www.example.com.")].ttl,
            DEFAULT_TTL
        );
    }

    #[test]
    fn test_resolve_alias_targets_never_published() {
        let resolved = resolve_snapshot(
            &snapshot_of(vec![Record::alias_target(
                RecordType::A,
                "node-a/external",
                "54.0.0.1",
            )]),
            DEFAULT_TTL,
        );
        assert!(resolved.values.is_empty());
    }
}
