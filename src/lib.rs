//! dnsmesh - cluster DNS controller with a gossip-replicated DNS zone.
//!
//! Producers publish desired records into named scopes; the controller
//! periodically reconciles the union of all ready scopes against DNS
//! backends. One backend is a zone kept in an eventually-consistent
//! key/value map that nodes replicate over a TCP gossip mesh, and that map
//! can also be rendered into the local hosts file.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            dnsmesh                               │
//! │                                                                  │
//! │  producers ──▶ ScopeRegistry ──▶ DnsController ──▶ DnsProvider   │
//! │                 (scopes)          (ticks, diff)      │   │       │
//! │                                                      │   ▼       │
//! │                                          memory ◀────┘ GossipDns │
//! │                                                          │       │
//! │           peers ◀──▶ MeshGossiper ◀──▶ KvState ◀─────────┘       │
//! │                                           │                      │
//! │                                           ▼                      │
//! │                                       DnsView ──▶ /etc/hosts     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use dnsmesh::{Config, DnsNode, Shutdown};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (shutdown, worker) = Shutdown::new_signals();
//!     tokio::spawn(worker);
//!
//!     let node = DnsNode::start(Config::default(), shutdown).await.unwrap();
//!     let scope = node.controller().unwrap().create_scope("nodes").unwrap();
//!     scope.replace(
//!         "node-a",
//!         vec![dnsmesh::Record::new(dnsmesh::RecordType::A, "api.local.", "10.0.0.1")],
//!     );
//!     scope.mark_ready();
//!     node.wait().await;
//! }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod gossip;
pub mod gossip_dns;
pub mod hosts;
pub mod metrics;
pub mod record;
pub mod scope;
pub mod server;
pub mod shutdown;
pub mod telemetry;
pub mod zone_rules;

// Re-export main types
pub use config::{Config, ControllerConfig, GossipConfig, HostsConfig, TelemetryConfig};
pub use controller::{DnsController, TickOutcome};
pub use error::DnsError;
pub use record::{Record, RecordKey, RecordType};
pub use scope::{Scope, ScopeRegistry};
pub use server::DnsNode;
pub use shutdown::Shutdown;
pub use zone_rules::ZoneRuleSet;
