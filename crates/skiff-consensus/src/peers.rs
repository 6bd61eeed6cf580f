//! Peer proxies and per-peer replication workers.
//!
//! The transport lives behind [`PeerProxy`]: the tablet server plugs in its
//! RPC client, tests plug in in-process channels. Each remote member of the
//! active config gets a [`Peer`] worker task while this replica leads; the
//! worker wakes on demand (new data, commit advance) or on the heartbeat
//! tick, drains the queue for its peer, and feeds responses back.

use crate::config::{PeerInfo, RaftConfig};
use crate::error::Result;
use crate::options::RaftOptions;
use crate::queue::PeerMessageQueue;
use crate::types::{PeerId, TabletId, UpdateRequest, UpdateResponse, VoteRequest, VoteResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Transport handle to one remote replica.
///
/// Implementations own connection management, serialization, and transient
/// retries. Calls must be safely concurrent with shutdown; cancellation is
/// best-effort (a dropped future abandons the in-flight RPC).
#[async_trait]
pub trait PeerProxy: Send + Sync {
    /// Send an AppendEntries-equivalent Update.
    async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse>;

    /// Send a RequestVote.
    async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse>;
}

/// Builds proxies for config members as they are tracked.
pub trait PeerProxyFactory: Send + Sync {
    fn new_proxy(&self, peer: &PeerInfo) -> Result<Arc<dyn PeerProxy>>;
}

/// Replication worker for one remote peer.
pub struct Peer {
    peer_info: PeerInfo,
    tablet_id: TabletId,
    queue: Arc<PeerMessageQueue>,
    proxy: Arc<dyn PeerProxy>,
    notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Spawn the worker task. It sends an initial probe immediately so a
    /// new leader discovers the peer's position without waiting a tick.
    pub fn start(
        peer_info: PeerInfo,
        tablet_id: TabletId,
        opts: &RaftOptions,
        queue: Arc<PeerMessageQueue>,
        proxy: Arc<dyn PeerProxy>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer = Arc::new(Peer {
            peer_info,
            tablet_id,
            queue,
            proxy,
            notify: Notify::new(),
            shutdown_tx,
            handle: Mutex::new(None),
        });
        let heartbeat = opts.heartbeat_interval;
        let rpc_timeout = opts.rpc_timeout;
        let handle = tokio::spawn(Self::run(peer.clone(), shutdown_rx, heartbeat, rpc_timeout));
        *peer.handle.lock() = Some(handle);
        peer.signal_request();
        peer
    }

    pub fn uuid(&self) -> &PeerId {
        &self.peer_info.uuid
    }

    /// Wake the worker: there is (or may be) something new to send.
    pub fn signal_request(&self) {
        self.notify.notify_one();
    }

    /// Ask the worker to exit without waiting for it.
    pub fn request_stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.notify.notify_one();
    }

    /// Stop the worker and join it, letting any in-flight RPC resolve.
    pub async fn stop(&self) {
        self.request_stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
        heartbeat: std::time::Duration,
        rpc_timeout: std::time::Duration,
    ) {
        let uuid = self.peer_info.uuid.clone();
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(heartbeat) => {}
                _ = shutdown_rx.changed() => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }

            // Drain: keep sending while the queue has more for this peer.
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }
                let request = match self.queue.request_for_peer(&uuid) {
                    Ok(request) => request,
                    // Stepped down or peer untracked; go back to idling.
                    Err(_) => break,
                };
                match tokio::time::timeout(rpc_timeout, self.proxy.update(request)).await {
                    Ok(Ok(response)) => {
                        if !self.queue.response_from_peer(&uuid, &response) {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(
                            tablet = %self.tablet_id,
                            peer = %uuid,
                            "update to peer failed: {}",
                            e
                        );
                        self.queue.exchange_failed(&uuid);
                        break;
                    }
                    Err(_) => {
                        tracing::debug!(
                            tablet = %self.tablet_id,
                            peer = %uuid,
                            "update to peer timed out"
                        );
                        self.queue.exchange_failed(&uuid);
                        break;
                    }
                }
            }
        }
    }
}

/// Lifecycle of the peer workers: spawn on becoming leader or on config
/// change, retire on stepdown or peer removal.
pub struct PeerManager {
    tablet_id: TabletId,
    local_uuid: PeerId,
    opts: RaftOptions,
    queue: Arc<PeerMessageQueue>,
    proxy_factory: Arc<dyn PeerProxyFactory>,
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
}

impl PeerManager {
    pub fn new(
        tablet_id: TabletId,
        local_uuid: PeerId,
        opts: RaftOptions,
        queue: Arc<PeerMessageQueue>,
        proxy_factory: Arc<dyn PeerProxyFactory>,
    ) -> Arc<Self> {
        Arc::new(PeerManager {
            tablet_id,
            local_uuid,
            opts,
            queue,
            proxy_factory,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Reconcile workers with `config`: spawn for new remote members,
    /// retire workers for removed ones.
    pub fn update_config(&self, config: &RaftConfig) -> Result<()> {
        let mut peers = self.peers.lock();

        let mut retired: Vec<Arc<Peer>> = Vec::new();
        peers.retain(|uuid, peer| {
            if config.has_peer(uuid) {
                true
            } else {
                retired.push(peer.clone());
                false
            }
        });

        for member in &config.members {
            if member.uuid == self.local_uuid || peers.contains_key(&member.uuid) {
                continue;
            }
            let proxy = self.proxy_factory.new_proxy(member)?;
            let peer = Peer::start(
                member.clone(),
                self.tablet_id.clone(),
                &self.opts,
                self.queue.clone(),
                proxy,
            );
            peers.insert(member.uuid.clone(), peer);
        }
        drop(peers);

        for peer in retired {
            peer.request_stop();
            tokio::spawn(async move { peer.stop().await });
        }
        Ok(())
    }

    /// Wake every worker.
    pub fn signal_request_all(&self) {
        for peer in self.peers.lock().values() {
            peer.signal_request();
        }
    }

    /// Retire all workers without waiting (stepdown path).
    pub fn clear(&self) {
        let retired: Vec<Arc<Peer>> = self.peers.lock().drain().map(|(_, p)| p).collect();
        for peer in retired {
            peer.request_stop();
            tokio::spawn(async move { peer.stop().await });
        }
    }

    /// Retire all workers and join them (shutdown path).
    pub async fn close(&self) {
        let retired: Vec<Arc<Peer>> = self.peers.lock().drain().map(|(_, p)| p).collect();
        for peer in retired {
            peer.stop().await;
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}
