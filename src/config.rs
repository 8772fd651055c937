//! Configuration types for dnsmesh.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::DnsError;
use crate::gossip::transport::DEFAULT_PEER_QUEUE;
use crate::gossip::MeshConfig;
use crate::gossip_dns::DEFAULT_ZONE_NAME;
use crate::hosts::DEFAULT_TAG;
use crate::record::Record;
use crate::zone_rules::ZoneRuleSet;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// DNS controller configuration.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Gossip mesh configuration; no mesh when absent.
    #[serde(default)]
    pub gossip: Option<GossipConfig>,

    /// Hosts-file sink configuration; requires the gossip mesh.
    #[serde(default)]
    pub hosts: Option<HostsConfig>,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Check cross-section constraints.
    pub fn validate(&self) -> Result<(), DnsError> {
        self.controller.zone_rules()?;

        let needs_gossip = self.hosts.is_some()
            || (self.controller.enabled && self.controller.backends.contains(&BackendKind::Gossip));
        if needs_gossip && self.gossip.is_none() {
            return Err(DnsError::Config(
                "gossip backend and hosts sink need a [gossip] section".to_string(),
            ));
        }
        if self.controller.enabled && self.controller.backends.is_empty() {
            return Err(DnsError::Config(
                "controller is enabled but no backends are configured".to_string(),
            ));
        }

        let mut periods = vec![(
            "controller.update_interval_secs",
            self.controller.update_interval_secs,
        )];
        if let Some(gossip) = &self.gossip {
            periods.extend([
                ("gossip.seed_refresh_secs", gossip.seed_refresh_secs),
                ("gossip.seed_retry_secs", gossip.seed_retry_secs),
                ("gossip.sync_interval_secs", gossip.sync_interval_secs),
                ("gossip.peer_queue_len", gossip.peer_queue_len as u64),
            ]);
        }
        if let Some(hosts) = &self.hosts {
            periods.push(("hosts.interval_secs", hosts.interval_secs));
        }
        if let Some((name, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(DnsError::Config(format!("{name} must be greater than zero")));
        }
        Ok(())
    }
}

/// DNS backends the controller can publish to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Zones replicated by the gossip mesh.
    Gossip,
    /// In-process zones; nothing leaves the process.
    Memory,
}

/// DNS controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Run the controller.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between reconcile ticks.
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,

    /// Zone rules (`*`, `<name>`, `*/<id>`, `<name>/<id>`); empty means all zones.
    #[serde(default)]
    pub zones: Vec<String>,

    /// TTL for records whose producers set none.
    #[serde(default = "default_ttl")]
    pub default_ttl: u32,

    /// Records published under the `static` scope.
    #[serde(default)]
    pub static_records: Vec<Record>,

    /// Backends to publish to.
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendKind>,

    /// Zones served by the memory backend.
    #[serde(default)]
    pub memory_zones: Vec<String>,
}

impl ControllerConfig {
    /// Parsed zone rules.
    pub fn zone_rules(&self) -> Result<ZoneRuleSet, DnsError> {
        ZoneRuleSet::parse(&self.zones)
    }

    /// Delay between ticks.
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            update_interval_secs: default_update_interval_secs(),
            zones: Vec::new(),
            default_ttl: default_ttl(),
            static_records: Vec::new(),
            backends: default_backends(),
            memory_zones: Vec::new(),
        }
    }
}

/// Gossip mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Address to accept peers on.
    #[serde(default = "default_gossip_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Unique node name; defaults to the host name.
    #[serde(default)]
    pub node_name: Option<String>,

    /// Mesh channel; peers on other channels are dropped.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Static seed endpoints (`host:port`).
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Seconds between seeding passes after a clean pass.
    #[serde(default = "default_seed_refresh_secs")]
    pub seed_refresh_secs: u64,

    /// Seconds before retrying a failed seeding pass.
    #[serde(default = "default_seed_retry_secs")]
    pub seed_retry_secs: u64,

    /// Seconds between full-state pushes.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Frames queued per peer before a slow peer is disconnected.
    #[serde(default = "default_peer_queue_len")]
    pub peer_queue_len: usize,

    /// Zones served by the gossip backend even while empty.
    #[serde(default = "default_gossip_zones")]
    pub zones: Vec<String>,
}

impl GossipConfig {
    /// Node name from configuration, `HOSTNAME`, or `/etc/hostname`.
    pub fn resolve_node_name(&self) -> String {
        if let Some(name) = self.node_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.trim().to_string();
        }
        if let Some(name) = std::env::var("HOSTNAME")
            .ok()
            .filter(|n| !n.trim().is_empty())
        {
            return name.trim().to_string();
        }
        if let Some(name) = std::fs::read_to_string("/etc/hostname")
            .ok()
            .filter(|n| !n.trim().is_empty())
        {
            return name.trim().to_string();
        }
        format!("dnsmesh-{}", std::process::id())
    }

    /// Transport settings.
    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            listen_addr: self.listen_addr,
            node_name: self.resolve_node_name(),
            channel: self.channel.clone(),
            seed_refresh: Duration::from_secs(self.seed_refresh_secs),
            seed_retry: Duration::from_secs(self.seed_retry_secs),
            sync_interval: Duration::from_secs(self.sync_interval_secs),
            peer_queue: self.peer_queue_len,
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_gossip_listen_addr(),
            node_name: None,
            channel: default_channel(),
            seeds: Vec::new(),
            seed_refresh_secs: default_seed_refresh_secs(),
            seed_retry_secs: default_seed_retry_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            peer_queue_len: default_peer_queue_len(),
            zones: default_gossip_zones(),
        }
    }
}

/// Hosts-file sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostsConfig {
    /// Hosts file to manage.
    #[serde(default = "default_hosts_path")]
    pub path: PathBuf,

    /// Tag in the guard markers.
    #[serde(default = "default_hosts_tag")]
    pub tag: String,

    /// Seconds between checks for gossip changes.
    #[serde(default = "default_hosts_interval_secs")]
    pub interval_secs: u64,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            path: default_hosts_path(),
            tag: default_hosts_tag(),
            interval_secs: default_hosts_interval_secs(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "dnsmesh=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_update_interval_secs() -> u64 {
    60
}

fn default_ttl() -> u32 {
    60
}

fn default_backends() -> Vec<BackendKind> {
    vec![BackendKind::Gossip]
}

fn default_gossip_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3999))
}

fn default_channel() -> String {
    "dns".to_string()
}

fn default_seed_refresh_secs() -> u64 {
    3600
}

fn default_seed_retry_secs() -> u64 {
    60
}

fn default_sync_interval_secs() -> u64 {
    30
}

fn default_peer_queue_len() -> usize {
    DEFAULT_PEER_QUEUE
}

fn default_gossip_zones() -> Vec<String> {
    vec![DEFAULT_ZONE_NAME.to_string()]
}

fn default_hosts_path() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

fn default_hosts_tag() -> String {
    DEFAULT_TAG.to_string()
}

fn default_hosts_interval_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;

    fn load(toml: &str) -> Config {
        ::config::Config::builder()
            .add_source(::config::File::from_str(toml, ::config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = load("[gossip]\nchannel = \"dns\"\n");
        assert!(config.controller.enabled);
        assert_eq!(config.controller.update_interval_secs, 60);
        assert_eq!(config.controller.backends, vec![BackendKind::Gossip]);

        let gossip = config.gossip.as_ref().unwrap();
        assert_eq!(gossip.listen_addr.port(), 3999);
        assert_eq!(gossip.channel, "dns");
        assert_eq!(gossip.zones, vec!["local."]);
        assert!(config.hosts.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_file() {
        let config = load(
            r#"
            [controller]
            update_interval_secs = 10
            zones = ["example.com/Z1", "*"]
            backends = ["memory"]
            memory_zones = ["example.com."]

            [[controller.static_records]]
            record_type = "A"
            fqdn = "api.example.com."
            value = "10.0.0.1"

            [hosts]
            path = "/tmp/hosts"

            [gossip]
            node_name = "n1"
            seeds = ["10.0.0.2:3999"]
            "#,
        );

        assert_eq!(config.controller.update_interval(), Duration::from_secs(10));
        let rules = config.controller.zone_rules().unwrap();
        assert!(rules.wildcard);
        assert_eq!(rules.rules.len(), 1);
        assert_eq!(
            config.controller.static_records[0].record_type,
            RecordType::A
        );
        assert_eq!(config.hosts.as_ref().unwrap().tag, "dnsmesh");
        assert_eq!(config.gossip.as_ref().unwrap().resolve_node_name(), "n1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_gossip_backend_requires_gossip_section() {
        let config = load("[controller]\nbackends = [\"gossip\"]\n");
        assert!(matches!(config.validate(), Err(DnsError::Config(_))));
    }

    #[test]
    fn test_zero_periods_rejected() {
        for toml in [
            "[controller]\nupdate_interval_secs = 0\nbackends = [\"memory\"]\n",
            "[gossip]\nsync_interval_secs = 0\n",
            "[gossip]\nseed_refresh_secs = 0\n",
            "[gossip]\nseed_retry_secs = 0\n",
            "[gossip]\npeer_queue_len = 0\n",
            "[gossip]\nchannel = \"dns\"\n[hosts]\ninterval_secs = 0\n",
        ] {
            let err = load(toml).validate().unwrap_err();
            assert!(
                matches!(&err, DnsError::Config(msg) if msg.contains("greater than zero")),
                "{toml}: {err}"
            );
        }
    }

    #[test]
    fn test_bad_zone_rule_rejected() {
        let config = load("[controller]\nzones = [\"a/b/c\"]\nbackends = [\"memory\"]\n");
        assert!(matches!(
            config.validate(),
            Err(DnsError::InvalidZoneRule(_))
        ));
    }
}
