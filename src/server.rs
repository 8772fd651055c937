//! Node setup and lifecycle management.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::backend::memory::MemoryProvider;
use crate::backend::DnsProvider;
use crate::config::{BackendKind, Config};
use crate::controller::DnsController;
use crate::error::DnsError;
use crate::gossip::{GossipState, KvState, MeshGossiper, StaticSeedProvider};
use crate::gossip_dns::{DnsView, GossipDnsProvider};
use crate::hosts::{run_hosts_updates, HostsFile};
use crate::shutdown::Shutdown;

/// Interval for emitting state metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Scope holding the records from configuration.
pub const STATIC_SCOPE: &str = "static";

/// Periodically emit mesh metrics.
async fn metrics_loop(mesh: MeshGossiper, shutdown: Shutdown) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                mesh.emit_metrics();
                debug!(
                    peers = mesh.peers().len(),
                    keys = mesh.state().len(),
                    version = mesh.state().version(),
                    "emitted gossip metrics"
                );
            }
            _ = shutdown.wait() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// A running node: controller, gossip mesh and hosts sink under one
/// shutdown signal.
pub struct DnsNode {
    controller: Option<Arc<DnsController>>,
    mesh: Option<MeshGossiper>,
    view: Option<Arc<DnsView>>,
    tasks: Vec<JoinHandle<()>>,
}

impl DnsNode {
    /// Start every configured component.
    pub async fn start(config: Config, shutdown: Shutdown) -> Result<Self, DnsError> {
        config.validate()?;

        let mut tasks = Vec::new();

        let mut mesh = None;
        let mut view = None;
        if let Some(gossip) = &config.gossip {
            let gossiper = MeshGossiper::start(
                gossip.mesh_config(),
                KvState::new(),
                Arc::new(StaticSeedProvider::new(&gossip.seeds)),
                shutdown.clone(),
            )
            .await?;
            view = Some(Arc::new(DnsView::new(
                Arc::new(gossiper.clone()) as Arc<dyn GossipState>
            )));

            tasks.push(tokio::spawn(metrics_loop(gossiper.clone(), shutdown.clone())));
            mesh = Some(gossiper);
        }

        let controller = if config.controller.enabled {
            let controller = Arc::new(Self::build_controller(&config, view.as_ref())?);
            tasks.push(tokio::spawn({
                let controller = controller.clone();
                let shutdown = shutdown.clone();
                async move { controller.run(shutdown).await }
            }));
            Some(controller)
        } else {
            info!("DNS controller disabled");
            None
        };

        if let (Some(hosts), Some(view)) = (&config.hosts, &view) {
            let hosts_file = HostsFile::new(hosts.path.clone(), hosts.tag.clone());
            tasks.push(tokio::spawn(run_hosts_updates(
                hosts_file,
                view.clone(),
                Duration::from_secs(hosts.interval_secs),
                shutdown.clone(),
            )));
        }

        info!(
            controller = controller.is_some(),
            gossip = mesh.is_some(),
            hosts = config.hosts.is_some(),
            "dnsmesh node started"
        );

        Ok(Self {
            controller,
            mesh,
            view,
            tasks,
        })
    }

    fn build_controller(config: &Config, view: Option<&Arc<DnsView>>) -> Result<DnsController, DnsError> {
        let controller_config = &config.controller;

        let mut providers: Vec<Arc<dyn DnsProvider>> = Vec::new();
        for backend in &controller_config.backends {
            match backend {
                BackendKind::Gossip => {
                    let (Some(view), Some(gossip)) = (view, &config.gossip) else {
                        return Err(DnsError::Config(
                            "gossip backend needs a [gossip] section".to_string(),
                        ));
                    };
                    providers.push(Arc::new(GossipDnsProvider::new(view.clone(), &gossip.zones)));
                }
                BackendKind::Memory => {
                    let provider = MemoryProvider::new("memory");
                    for zone in &controller_config.memory_zones {
                        provider.add_zone(zone, zone);
                    }
                    providers.push(Arc::new(provider));
                }
            }
        }

        let controller = DnsController::new(
            providers,
            controller_config.zone_rules()?,
            controller_config.update_interval(),
        )
        .with_default_ttl(controller_config.default_ttl);

        let scope = controller.create_scope(STATIC_SCOPE)?;
        if !controller_config.static_records.is_empty() {
            scope.replace("config", controller_config.static_records.clone());
        }
        scope.mark_ready();

        Ok(controller)
    }

    /// The DNS controller, when enabled; producers create scopes on it.
    pub fn controller(&self) -> Option<&Arc<DnsController>> {
        self.controller.as_ref()
    }

    /// The gossip mesh, when configured.
    pub fn mesh(&self) -> Option<&MeshGossiper> {
        self.mesh.as_ref()
    }

    /// DNS view over the gossip state, when configured.
    pub fn view(&self) -> Option<&Arc<DnsView>> {
        self.view.as_ref()
    }

    /// Wait until every component has stopped after shutdown.
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("dnsmesh task panicked: {}", e);
            }
        }
        if let Some(mesh) = &self.mesh {
            mesh.wait_stopped().await;
        }
        info!("dnsmesh node stopped");
    }
}
