//! Gossip-replicated key/value state.
//!
//! [`state`] holds the last-writer-wins map, [`wire`] the framing,
//! [`transport`] the TCP mesh that keeps peers converged and [`seeds`]
//! the sources of initial peers.

pub mod seeds;
pub mod state;
pub mod transport;
pub mod wire;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;

pub use seeds::{SeedProvider, StaticSeedProvider};
pub use state::{KvRecord, KvRecords, KvSnapshot, KvState};
pub use transport::{MeshConfig, MeshGossiper, PeerInfo};

/// Read/write access to replicated state.
///
/// [`KvState`] is the local-only implementation; [`MeshGossiper`] also
/// broadcasts every local change to its peers.
pub trait GossipState: Send + Sync {
    /// Live value of a key.
    fn get(&self, key: &str) -> Option<String>;

    /// Consistent view of all live values.
    fn snapshot(&self) -> Arc<KvSnapshot>;

    /// Remove and put keys in one versioned step.
    fn update_values(&self, remove: &[String], put: &BTreeMap<String, String>) -> Result<()>;
}

impl GossipState for KvState {
    fn get(&self, key: &str) -> Option<String> {
        KvState::get(self, key)
    }

    fn snapshot(&self) -> Arc<KvSnapshot> {
        KvState::snapshot(self)
    }

    fn update_values(&self, remove: &[String], put: &BTreeMap<String, String>) -> Result<()> {
        KvState::update_values(self, remove, put);
        Ok(())
    }
}
