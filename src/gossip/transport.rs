//! TCP mesh keeping [`KvState`] converged across peers.
//!
//! Every connection starts with a hello exchange; peers on another channel,
//! connections to ourselves and duplicate connections are dropped. A new
//! peer receives our full state, after which local changes go out as
//! deltas from the broadcaster task. Merges that change state are
//! forwarded to every other peer, and the full state is pushed on every
//! sync interval to repair anything a dropped delta missed.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::error::{DnsError, Result};
use crate::gossip::seeds::SeedProvider;
use crate::gossip::state::{KvRecords, KvSnapshot, KvState};
use crate::gossip::wire::{read_frame, write_frame, write_message, GossipMessage};
use crate::gossip::GossipState;
use crate::metrics::{self, PeerEvent};
use crate::shutdown::Shutdown;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on waiting for mesh tasks after shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Frames queued per peer before the peer is dropped as too slow.
pub const DEFAULT_PEER_QUEUE: usize = 256;

/// Mesh settings.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Address to accept peers on; port 0 picks a free port.
    pub listen_addr: SocketAddr,
    /// Unique name of this node.
    pub node_name: String,
    /// Peers must use the same channel.
    pub channel: String,
    /// Delay between seeding passes after a clean pass.
    pub seed_refresh: Duration,
    /// Delay before the next seeding pass after a failure.
    pub seed_retry: Duration,
    /// Interval of full-state pushes.
    pub sync_interval: Duration,
    /// Outgoing frames queued per peer; a peer whose queue fills is
    /// disconnected and repaired by the full state when it reconnects.
    pub peer_queue: usize,
}

impl MeshConfig {
    /// Settings with the default channel and intervals.
    pub fn new(listen_addr: SocketAddr, node_name: impl Into<String>) -> Self {
        Self {
            listen_addr,
            node_name: node_name.into(),
            channel: "dns".to_string(),
            seed_refresh: Duration::from_secs(60 * 60),
            seed_retry: Duration::from_secs(60),
            sync_interval: Duration::from_secs(30),
            peer_queue: DEFAULT_PEER_QUEUE,
        }
    }
}

/// A connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Peer's node name.
    pub node: String,
    /// Remote address of the connection.
    pub addr: SocketAddr,
    /// Whether we dialed the connection.
    pub outbound: bool,
}

struct PeerHandle {
    id: u64,
    addr: SocketAddr,
    outbound: bool,
    /// Seed endpoint this connection was dialed from.
    seed: Option<String>,
    /// Connection the pair keeps when both sides dial each other.
    preferred: bool,
    tx: mpsc::Sender<Arc<Vec<u8>>>,
    /// Dropping the handle closes the reader and the writer.
    _close: watch::Sender<()>,
}

struct MeshInner {
    config: MeshConfig,
    state: KvState,
    local_addr: SocketAddr,
    peers: Mutex<HashMap<String, PeerHandle>>,
    broadcast_tx: mpsc::UnboundedSender<KvRecords>,
    next_peer_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Shutdown,
}

/// Gossip mesh member.
#[derive(Clone)]
pub struct MeshGossiper {
    inner: Arc<MeshInner>,
}

impl MeshGossiper {
    /// Bind the listener and start the accept, broadcast, sync and
    /// seeding tasks.
    pub async fn start(
        config: MeshConfig,
        state: KvState,
        seeds: Arc<dyn SeedProvider>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        if config.sync_interval.is_zero()
            || config.seed_refresh.is_zero()
            || config.seed_retry.is_zero()
        {
            return Err(DnsError::Config(
                "gossip intervals must be greater than zero".to_string(),
            ));
        }
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();

        info!(
            node = %config.node_name,
            channel = %config.channel,
            addr = %local_addr,
            "gossip mesh listening"
        );

        let gossiper = Self {
            inner: Arc::new(MeshInner {
                config,
                state,
                local_addr,
                peers: Mutex::new(HashMap::new()),
                broadcast_tx,
                next_peer_id: AtomicU64::new(1),
                tasks: Mutex::new(Vec::new()),
                shutdown,
            }),
        };

        gossiper.spawn(gossiper.clone().accept_loop(listener));
        gossiper.spawn(gossiper.clone().broadcast_loop(broadcast_rx));
        gossiper.spawn(gossiper.clone().sync_loop());
        gossiper.spawn(gossiper.clone().seeding_loop(seeds));
        Ok(gossiper)
    }

    /// Address the mesh accepts peers on.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// This node's name.
    pub fn node_name(&self) -> &str {
        &self.inner.config.node_name
    }

    /// Replicated state.
    pub fn state(&self) -> &KvState {
        &self.inner.state
    }

    /// Connected peers, ordered by node name.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .inner
            .peers
            .lock()
            .iter()
            .map(|(node, peer)| PeerInfo {
                node: node.clone(),
                addr: peer.addr,
                outbound: peer.outbound,
            })
            .collect();
        peers.sort_by(|a, b| a.node.cmp(&b.node));
        peers
    }

    /// Publish mesh gauges.
    pub fn emit_metrics(&self) {
        metrics::record_gossip_state(
            self.inner.peers.lock().len(),
            self.inner.state.len(),
            self.inner.state.version(),
        );
    }

    /// Dial an endpoint and join it to the mesh.
    ///
    /// Returns `Ok(false)` when the handshake completed but the peer was
    /// dropped (ourselves, another channel, or a duplicate).
    pub async fn connect(&self, endpoint: &str) -> Result<bool> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(endpoint))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("timed out dialing {endpoint}"),
                )
            })??;
        let addr = stream.peer_addr()?;
        self.establish(stream, addr, Some(endpoint.to_string()))
            .await
    }

    /// One seeding pass. Returns false if listing or any dial failed.
    pub async fn seed_once(&self, seeds: &dyn SeedProvider) -> bool {
        let seeds = match seeds.get_seeds().await {
            Ok(seeds) => seeds,
            Err(e) => {
                warn!(error = %e, "failed to list gossip seeds");
                return false;
            }
        };

        let mut ok = true;
        for seed in seeds {
            if self.is_connected_to_seed(&seed) {
                trace!(seed = %seed, "already connected to seed");
                continue;
            }
            match self.connect(&seed).await {
                Ok(_) => {}
                Err(e) => {
                    warn!(seed = %seed, error = %e, "failed to connect to gossip seed");
                    metrics::record_peer_event(PeerEvent::DialFailed);
                    ok = false;
                }
            }
        }
        ok
    }

    /// Wait for the mesh tasks to finish after shutdown, aborting any
    /// still running after [`SHUTDOWN_GRACE`].
    pub async fn wait_stopped(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        match timeout(SHUTDOWN_GRACE, join_all(handles)).await {
            Ok(results) => {
                for e in results.into_iter().filter_map(|r| r.err()) {
                    if e.is_panic() {
                        error!(error = %e, "gossip task panicked");
                    }
                }
            }
            Err(_) => {
                warn!("gossip tasks did not stop in time, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }
        self.inner.peers.lock().clear();
        info!(node = %self.inner.config.node_name, "gossip mesh stopped");
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn is_connected_to_seed(&self, seed: &str) -> bool {
        self.inner
            .peers
            .lock()
            .values()
            .any(|peer| peer.seed.as_deref() == Some(seed))
    }

    async fn accept_loop(self, listener: TcpListener) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    debug!("gossip listener shutting down");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let gossiper = self.clone();
                        self.spawn(async move {
                            if let Err(e) = gossiper.establish(stream, addr, None).await {
                                debug!(peer = %addr, error = %e, "inbound gossip connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept gossip connection");
                        sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<(String, String)> {
        let hello = GossipMessage::Hello {
            node: self.inner.config.node_name.clone(),
            channel: self.inner.config.channel.clone(),
        };
        write_message(stream, &hello).await?;

        let frame = read_frame(stream).await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed connection during handshake",
            )
        })?;
        match GossipMessage::decode(&frame)? {
            GossipMessage::Hello { node, channel } => Ok((node, channel)),
            _ => Err(DnsError::GossipMergeDecode(
                "expected hello as first frame".to_string(),
            )),
        }
    }

    /// Handshake, register and start the reader and writer of a connection.
    async fn establish(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
        seed: Option<String>,
    ) -> Result<bool> {
        let outbound = seed.is_some();
        let (node, channel) = timeout(HANDSHAKE_TIMEOUT, self.handshake(&mut stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "gossip handshake timed out"))??;

        let config = &self.inner.config;
        if node == config.node_name {
            debug!(peer = %addr, "dropping connection to self");
            metrics::record_peer_event(PeerEvent::Rejected);
            return Ok(false);
        }
        if channel != config.channel {
            warn!(
                peer = %addr,
                node = %node,
                channel = %channel,
                expected = %config.channel,
                "dropping peer on another gossip channel"
            );
            metrics::record_peer_event(PeerEvent::Rejected);
            return Ok(false);
        }

        // Both sides agree to keep the connection dialed by the lower name.
        let dialer = if outbound { &config.node_name } else { &node };
        let preferred = dialer == std::cmp::min(&config.node_name, &node);

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(config.peer_queue.max(1));
        let (close_tx, close_rx) = watch::channel(());
        let id = self.inner.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let handle = PeerHandle {
            id,
            addr,
            outbound,
            seed,
            preferred,
            tx: tx.clone(),
            _close: close_tx,
        };

        if !self.register(&node, handle) {
            debug!(peer = %addr, node = %node, "dropping duplicate gossip connection");
            metrics::record_peer_event(PeerEvent::Rejected);
            return Ok(false);
        }

        info!(peer = %addr, node = %node, outbound, "gossip peer connected");
        metrics::record_peer_event(PeerEvent::Connected);

        let full_state = GossipMessage::State {
            records: self.inner.state.records(),
        };
        match full_state.encode() {
            Ok(frame) => {
                let _ = tx.try_send(Arc::new(frame));
            }
            Err(e) => warn!(node = %node, error = %e, "failed to encode gossip state"),
        }

        self.spawn(write_loop(node.clone(), write_half, rx, close_rx.clone()));
        self.spawn(self.clone().read_loop(node, id, read_half, close_rx));
        Ok(true)
    }

    fn register(&self, node: &str, handle: PeerHandle) -> bool {
        let mut peers = self.inner.peers.lock();
        if let Some(existing) = peers.get(node) {
            if !handle.preferred || existing.preferred {
                return false;
            }
            debug!(node, "replacing duplicate gossip connection");
        }
        peers.insert(node.to_string(), handle);
        true
    }

    fn unregister(&self, node: &str, id: u64) {
        let mut peers = self.inner.peers.lock();
        if peers.get(node).is_some_and(|peer| peer.id == id) {
            peers.remove(node);
            info!(node, "gossip peer disconnected");
            metrics::record_peer_event(PeerEvent::Disconnected);
        }
    }

    async fn read_loop(
        self,
        node: String,
        id: u64,
        mut reader: OwnedReadHalf,
        mut close_rx: watch::Receiver<()>,
    ) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            let frame = tokio::select! {
                _ = shutdown.wait() => break,
                _ = close_rx.changed() => break,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(Some(payload)) => self.handle_frame(&node, &payload),
                Ok(None) => {
                    debug!(node = %node, "gossip peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "error reading from gossip peer");
                    break;
                }
            }
        }
        self.unregister(&node, id);
    }

    fn handle_frame(&self, node: &str, payload: &[u8]) {
        let message = match GossipMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(node, error = %e, "dropping malformed gossip frame");
                metrics::record_gossip_decode_error();
                return;
            }
        };

        let records = match message {
            GossipMessage::State { records } | GossipMessage::Delta { records } => records,
            GossipMessage::Hello { .. } => {
                debug!(node, "ignoring repeated hello");
                return;
            }
        };

        let delta = self.inner.state.merge(&records);
        if !delta.is_empty() {
            trace!(node, changed = delta.len(), "forwarding merged gossip changes");
            self.send_to_peers(&GossipMessage::Delta { records: delta }, Some(node));
        }
    }

    fn send_to_peers(&self, message: &GossipMessage, except: Option<&str>) {
        let frame = match message.encode() {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                warn!(error = %e, "failed to encode gossip message");
                return;
            }
        };
        let mut peers = self.inner.peers.lock();
        let mut lagging = Vec::new();
        for (node, peer) in peers.iter() {
            if Some(node.as_str()) == except {
                continue;
            }
            match peer.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => lagging.push(node.clone()),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(node = %node, "gossip peer writer closed");
                }
            }
        }
        for node in lagging {
            // Dropping the handle stops its reader and writer.
            if let Some(peer) = peers.remove(&node) {
                warn!(node = %node, peer = %peer.addr, "gossip peer is not keeping up, disconnecting");
                metrics::record_peer_event(PeerEvent::Lagging);
            }
        }
    }

    async fn broadcast_loop(self, mut rx: mpsc::UnboundedReceiver<KvRecords>) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                delta = rx.recv() => match delta {
                    Some(records) => {
                        trace!(changes = records.len(), "broadcasting local gossip changes");
                        self.send_to_peers(&GossipMessage::Delta { records }, None);
                    }
                    None => return,
                },
            }
        }
    }

    async fn sync_loop(self) {
        let shutdown = self.inner.shutdown.clone();
        let mut interval = tokio::time::interval(self.inner.config.sync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; new peers already got our state.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = interval.tick() => {
                    if self.inner.peers.lock().is_empty() {
                        continue;
                    }
                    let records = self.inner.state.records();
                    trace!(keys = records.len(), "pushing full gossip state");
                    self.send_to_peers(&GossipMessage::State { records }, None);
                }
            }
        }
    }

    async fn seeding_loop(self, seeds: Arc<dyn SeedProvider>) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            if shutdown.is_shutting_down() {
                return;
            }

            let ok = self.seed_once(seeds.as_ref()).await;
            metrics::record_seeding_pass(ok);
            let delay = if ok {
                self.inner.config.seed_refresh
            } else {
                self.inner.config.seed_retry
            };
            debug!(ok, delay_secs = delay.as_secs(), "gossip seeding pass done");

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.wait() => {
                    debug!("gossip seeding shutting down");
                    return;
                }
            }
        }
    }
}

async fn write_loop(
    node: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Arc<Vec<u8>>>,
    mut close_rx: watch::Receiver<()>,
) {
    loop {
        let frame = tokio::select! {
            _ = close_rx.changed() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        // A peer that stopped reading must not hold the writer past its eviction.
        tokio::select! {
            _ = close_rx.changed() => break,
            written = write_frame(&mut writer, &frame) => {
                if let Err(e) = written {
                    debug!(node = %node, error = %e, "error writing to gossip peer");
                    return;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

impl GossipState for MeshGossiper {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.state.get(key)
    }

    fn snapshot(&self) -> Arc<KvSnapshot> {
        self.inner.state.snapshot()
    }

    fn update_values(&self, remove: &[String], put: &BTreeMap<String, String>) -> Result<()> {
        let delta = self.inner.state.update_values(remove, put);
        if !delta.is_empty() && self.inner.broadcast_tx.send(delta).is_err() {
            debug!("gossip broadcaster stopped; change spreads with the next full sync");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::seeds::StaticSeedProvider;
    use crate::shutdown::ShutdownTrigger;

    async fn node(name: &str, channel: &str) -> (ShutdownTrigger, MeshGossiper) {
        let (trigger, shutdown) = Shutdown::new();
        let mut config = MeshConfig::new("127.0.0.1:0".parse().unwrap(), name);
        config.channel = channel.to_string();
        let gossiper = MeshGossiper::start(
            config,
            KvState::new(),
            Arc::new(StaticSeedProvider::default()),
            shutdown,
        )
        .await
        .unwrap();
        (trigger, gossiper)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_connect_to_self_is_dropped() {
        let (_trigger, a) = node("a", "dns").await;
        let connected = a.connect(&a.local_addr().to_string()).await.unwrap();
        assert!(!connected);
        assert!(a.peers().is_empty());
    }

    #[tokio::test]
    async fn test_other_channel_is_dropped() {
        let (_ta, a) = node("a", "dns").await;
        let (_tb, b) = node("b", "other").await;
        let connected = a.connect(&b.local_addr().to_string()).await.unwrap();
        assert!(!connected);
        assert!(a.peers().is_empty());
    }

    #[tokio::test]
    async fn test_peers_exchange_state_and_deltas() {
        let (_ta, a) = node("a", "dns").await;
        let (_tb, b) = node("b", "dns").await;

        a.update_values(&[], &BTreeMap::from([("k1".to_string(), "v1".to_string())]))
            .unwrap();
        assert!(a.connect(&b.local_addr().to_string()).await.unwrap());

        assert!(eventually(|| b.get("k1").as_deref() == Some("v1")).await);
        assert!(eventually(|| b.peers().len() == 1).await);

        b.update_values(&[], &BTreeMap::from([("k2".to_string(), "v2".to_string())]))
            .unwrap();
        assert!(eventually(|| a.get("k2").as_deref() == Some("v2")).await);
    }

    #[tokio::test]
    async fn test_peer_that_stops_reading_is_disconnected() {
        let (_trigger, shutdown) = Shutdown::new();
        let mut config = MeshConfig::new("127.0.0.1:0".parse().unwrap(), "a");
        config.peer_queue = 2;
        let a = MeshGossiper::start(
            config,
            KvState::new(),
            Arc::new(StaticSeedProvider::default()),
            shutdown,
        )
        .await
        .unwrap();

        // Complete the hello, then never read again.
        let mut stalled = TcpStream::connect(a.local_addr()).await.unwrap();
        let hello = GossipMessage::Hello {
            node: "stalled".to_string(),
            channel: "dns".to_string(),
        };
        write_message(&mut stalled, &hello).await.unwrap();
        read_frame(&mut stalled).await.unwrap().unwrap();
        assert!(eventually(|| a.peers().len() == 1).await);

        let value = "x".repeat(256 * 1024);
        for i in 0..400 {
            if a.peers().is_empty() {
                break;
            }
            a.update_values(&[], &BTreeMap::from([("k".to_string(), format!("{i}{value}"))]))
                .unwrap();
            sleep(Duration::from_millis(1)).await;
        }
        assert!(eventually(|| a.peers().is_empty()).await);
        drop(stalled);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_peers() {
        let (ta, a) = node("a", "dns").await;
        let (_tb, b) = node("b", "dns").await;
        assert!(a.connect(&b.local_addr().to_string()).await.unwrap());
        assert!(eventually(|| b.peers().len() == 1).await);

        ta.trigger();
        timeout(SHUTDOWN_GRACE + Duration::from_secs(1), a.wait_stopped())
            .await
            .unwrap();
        assert!(a.peers().is_empty());
        assert!(eventually(|| b.peers().is_empty()).await);
    }
}
