//! Error types for dnsmesh.

use thiserror::Error;

/// Errors that can occur in the DNS controller and the gossip substrate.
#[derive(Debug, Error)]
pub enum DnsError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Unknown record type string
    #[error("Invalid record type: {0}")]
    InvalidRecordType(String),

    /// Zone rule that does not follow the `<name>/<id>` grammar
    #[error("Invalid zone rule: {0}")]
    InvalidZoneRule(String),

    /// No managed zone owns the name
    #[error("No suitable zone found for {0:?}")]
    NoZoneForFqdn(String),

    /// More than one zone matched and the rules do not disambiguate
    #[error("Found {count} zones named {zone:?} for {fqdn:?}, refusing to manage (provide a zone id rule)")]
    AmbiguousZone {
        /// Name being routed.
        fqdn: String,
        /// Zone name shared by the candidates.
        zone: String,
        /// Number of candidate zones.
        count: usize,
    },

    /// Zone does not expose a record-set API
    #[error("Zone does not support resource records: {0:?}")]
    ZoneNotWritable(String),

    /// Provider or zone could not be reached
    #[error("DNS backend unavailable for {zone}: {reason}")]
    BackendUnavailable {
        /// Zone (or provider) that failed.
        zone: String,
        /// Underlying failure.
        reason: String,
    },

    /// A scope with this name already exists
    #[error("Duplicate scope: {0:?}")]
    DuplicateScope(String),

    /// Two operations in one changeset target the same record set
    #[error("Duplicate record set {record_type} {name} in changeset")]
    DuplicateKeyInChangeset {
        /// Record set name.
        name: String,
        /// Record set type.
        record_type: String,
    },

    /// Record does not belong to the zone it was submitted to
    #[error("Record {name:?} is not inside zone {zone:?}")]
    RecordOutsideZone {
        /// Record set name.
        name: String,
        /// Zone name.
        zone: String,
    },

    /// Alias reference without any alias target records
    #[error("No alias target records found for {0:?}")]
    AliasTargetMissing(String),

    /// Cooperative cancellation
    #[error("Stop requested")]
    StopRequested,

    /// Malformed gossip payload from a peer
    #[error("Failed to decode gossip message: {0}")]
    GossipMergeDecode(String),

    /// Failed to encode a gossip message
    #[error("Failed to encode gossip message: {0}")]
    Encode(String),

    /// Hosts file could not be rewritten safely
    #[error("Hosts file error: {0}")]
    HostsFile(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DnsError>;
