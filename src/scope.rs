//! Scope registry: producers publish desired records here.
//!
//! Each producer owns one named [`Scope`] and replaces its records by an
//! opaque key (e.g. `ns/name`). The controller reads a consistent
//! [`RegistrySnapshot`] of all scopes once per tick. A process-wide change
//! counter lets the controller skip ticks where nothing changed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::DnsError;
use crate::record::Record;

/// Registry of all producer scopes.
#[derive(Debug, Clone, Default)]
pub struct ScopeRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// Scopes in creation order.
    scopes: Mutex<Vec<Scope>>,
    /// Bumped by every mutation that actually changes state.
    change_count: Arc<AtomicU64>,
}

/// A named, producer-owned contribution of records.
#[derive(Debug, Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

#[derive(Debug)]
struct ScopeInner {
    name: String,
    change_count: Arc<AtomicU64>,
    state: Mutex<ScopeState>,
}

#[derive(Debug, Default)]
struct ScopeState {
    /// Set once the producer has completed an initial sync.
    ready: bool,
    /// key -> records
    records: HashMap<String, Vec<Record>>,
}

/// Consistent read of every scope at one instant.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    /// Change counter observed while all scopes were locked.
    pub change_count: u64,
    /// Names of scopes that have not been marked ready.
    pub not_ready: Vec<String>,
    /// Every record from every scope.
    pub records: Vec<Record>,
}

impl RegistrySnapshot {
    /// True when every scope has been marked ready.
    pub fn is_ready(&self) -> bool {
        self.not_ready.is_empty()
    }
}

impl ScopeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a scope name. Scopes start not-ready and empty.
    pub fn create_scope(&self, name: &str) -> Result<Scope, DnsError> {
        let mut scopes = self.inner.scopes.lock();
        if scopes.iter().any(|s| s.name() == name) {
            return Err(DnsError::DuplicateScope(name.to_string()));
        }

        let scope = Scope {
            inner: Arc::new(ScopeInner {
                name: name.to_string(),
                change_count: self.inner.change_count.clone(),
                state: Mutex::new(ScopeState::default()),
            }),
        };
        scopes.push(scope.clone());
        debug!(scope = name, "created scope");
        Ok(scope)
    }

    /// Current value of the change counter.
    pub fn change_count(&self) -> u64 {
        self.inner.change_count.load(Ordering::SeqCst)
    }

    /// Number of registered scopes.
    pub fn scope_count(&self) -> usize {
        self.inner.scopes.lock().len()
    }

    /// Take a consistent cross-scope snapshot.
    ///
    /// All scope locks are held together while copying, so no producer
    /// update can land half-way through the read.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let scopes = self.inner.scopes.lock();
        let guards: Vec<_> = scopes.iter().map(|s| s.inner.state.lock()).collect();

        let change_count = self.inner.change_count.load(Ordering::SeqCst);

        let not_ready = scopes
            .iter()
            .zip(guards.iter())
            .filter(|(_, state)| !state.ready)
            .map(|(scope, _)| scope.name().to_string())
            .collect();

        let record_count = guards
            .iter()
            .flat_map(|state| state.records.values())
            .map(Vec::len)
            .sum();
        let mut records = Vec::with_capacity(record_count);
        for state in &guards {
            for scope_records in state.records.values() {
                records.extend(scope_records.iter().cloned());
            }
        }

        RegistrySnapshot {
            change_count,
            not_ready,
            records,
        }
    }
}

impl Scope {
    /// Scope name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark the scope ready. Idempotent; never reverts.
    pub fn mark_ready(&self) {
        let mut state = self.inner.state.lock();
        if !state.ready {
            debug!(scope = %self.inner.name, "scope ready");
        }
        state.ready = true;
    }

    /// Whether the producer has marked this scope ready.
    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().ready
    }

    /// Replace the records stored at `key`. An empty list deletes the key.
    ///
    /// Replacing a list with a field-wise equal list is a no-op and does not
    /// advance the change counter.
    pub fn replace(&self, key: &str, records: Vec<Record>) {
        let mut state = self.inner.state.lock();

        if records.is_empty() {
            if state.records.remove(key).is_none() {
                trace!(scope = %self.inner.name, key, "skipping spurious removal");
                return;
            }
            debug!(scope = %self.inner.name, key, "removed desired records");
        } else {
            if state.records.get(key) == Some(&records) {
                trace!(scope = %self.inner.name, key, "skipping spurious update");
                return;
            }
            debug!(scope = %self.inner.name, key, records = ?records, "updated desired records");
            state.records.insert(key.to_string(), records);
        }

        // Bumped under the scope lock so snapshots see records and counter together.
        self.inner.change_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Every key currently held, for producers computing deletions on relist.
    pub fn all_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.state.lock().records.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Records currently stored at `key`.
    pub fn get(&self, key: &str) -> Option<Vec<Record>> {
        self.inner.state.lock().records.get(key).cloned()
    }
}
