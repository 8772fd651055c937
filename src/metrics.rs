//! Metrics instrumentation for dnsmesh.
//!
//! All metrics are prefixed with `dnsmesh.`

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Reconcile tick result for metrics.
#[derive(Debug, Clone, Copy)]
pub enum TickResult {
    /// Changes were applied.
    Applied,
    /// Nothing changed since the last successful apply.
    Unchanged,
    /// A scope has not been marked ready.
    NotReady,
    /// The tick failed and will be retried.
    Error,
}

/// Record a reconcile tick.
pub fn record_tick(result: TickResult, duration: Duration) {
    let result_str = match result {
        TickResult::Applied => "applied",
        TickResult::Unchanged => "unchanged",
        TickResult::NotReady => "not_ready",
        TickResult::Error => "error",
    };

    counter!("dnsmesh.controller.tick.count", "result" => result_str).increment(1);
    histogram!("dnsmesh.controller.tick.duration.seconds").record(duration.as_secs_f64());
}

/// Record a changeset apply against a zone.
pub fn record_changeset(zone: &str, success: bool) {
    let result_str = if success { "success" } else { "error" };
    counter!("dnsmesh.controller.changeset.count", "zone" => zone.to_string(), "result" => result_str)
        .increment(1);
}

/// Record an alias reference whose targets are missing.
pub fn record_alias_target_missing() {
    counter!("dnsmesh.controller.alias_missing.count").increment(1);
}

/// Record the size of the desired state.
pub fn record_desired_state(scopes: usize, records: usize) {
    gauge!("dnsmesh.controller.scopes.count").set(scopes as f64);
    gauge!("dnsmesh.controller.records.count").set(records as f64);
}

/// Record a gossip merge and how many entries it changed.
pub fn record_gossip_merge(changed: usize) {
    counter!("dnsmesh.gossip.merge.count").increment(1);
    counter!("dnsmesh.gossip.merge.changed").increment(changed as u64);
}

/// Record a gossip payload that failed to decode.
pub fn record_gossip_decode_error() {
    counter!("dnsmesh.gossip.decode_error.count").increment(1);
}

/// Gossip connection events.
#[derive(Debug, Clone, Copy)]
pub enum PeerEvent {
    /// Peer completed the handshake.
    Connected,
    /// Peer connection closed.
    Disconnected,
    /// Handshake refused (self, duplicate, wrong channel).
    Rejected,
    /// Outbound dial failed.
    DialFailed,
    /// Peer dropped because its send queue filled.
    Lagging,
}

/// Record a gossip connection event.
pub fn record_peer_event(event: PeerEvent) {
    let event_str = match event {
        PeerEvent::Connected => "connected",
        PeerEvent::Disconnected => "disconnected",
        PeerEvent::Rejected => "rejected",
        PeerEvent::DialFailed => "dial_failed",
        PeerEvent::Lagging => "lagging",
    };
    counter!("dnsmesh.gossip.peer.event.count", "event" => event_str).increment(1);
}

/// Record gossip state size.
pub fn record_gossip_state(peers: usize, keys: usize, version: u64) {
    gauge!("dnsmesh.gossip.peers.count").set(peers as f64);
    gauge!("dnsmesh.gossip.keys.count").set(keys as f64);
    gauge!("dnsmesh.gossip.version").set(version as f64);
}

/// Record a seeding pass.
pub fn record_seeding_pass(success: bool) {
    let result_str = if success { "success" } else { "error" };
    counter!("dnsmesh.gossip.seeding.count", "result" => result_str).increment(1);
}

/// Record a hosts file update attempt.
pub fn record_hosts_update(written: bool, success: bool) {
    let result_str = match (success, written) {
        (false, _) => "error",
        (true, true) => "written",
        (true, false) => "unchanged",
    };
    counter!("dnsmesh.hosts.update.count", "result" => result_str).increment(1);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
