//! Network manager: accept loop, outbound dialing, and the connected-peer
//! registry.
//!
//! The registry mutex guards membership only; it is never held across I/O.
//! Fan-out is best effort: a slow or closed peer drops that one delivery
//! and nothing else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use squeak_core::{Message, Network, PeerAddress};

use crate::error::{NodeError, Result};
use crate::peer::{run_session, PeerEventSink, PeerHandle};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives network-level events; implemented by the controller.
#[async_trait]
pub trait NetworkHandler: Send + Sync {
    async fn on_peer_connected(&self, peer: &Arc<PeerHandle>) -> Result<()>;
    async fn on_peer_message(&self, peer: &Arc<PeerHandle>, message: Message) -> Result<()>;
    async fn on_peer_disconnected(&self, peer: &Arc<PeerHandle>);
}

pub struct NetworkManager {
    network: Network,
    local_nonce: u64,
    max_peers: usize,
    peers: StdMutex<HashMap<PeerAddress, Arc<PeerHandle>>>,
    handler: OnceLock<Weak<dyn NetworkHandler>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl NetworkManager {
    pub fn new(network: Network, max_peers: usize) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        Arc::new(NetworkManager {
            network,
            local_nonce: rand::thread_rng().r#gen(),
            max_peers,
            peers: StdMutex::new(HashMap::new()),
            handler: OnceLock::new(),
            stop_tx,
            stop_rx,
        })
    }

    /// Install the message handler. Must be called before any connection is
    /// accepted or dialed.
    pub fn set_handler(&self, handler: Weak<dyn NetworkHandler>) {
        let _ = self.handler.set(handler);
    }

    fn handler(&self) -> Result<Arc<dyn NetworkHandler>> {
        self.handler
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| NodeError::Unavailable("network handler is gone".to_string()))
    }

    /// Bind the listen port and start accepting inbound peers. Returns the
    /// actually bound address (useful with port 0).
    pub async fn start_listening(self: &Arc<Self>, port: u16) -> Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| NodeError::Unavailable(format!("cannot bind peer port {port}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NodeError::Unavailable(format!("listener address: {e}")))?;
        info!(%local_addr, "listening for peers");

        let manager = self.clone();
        let mut stop = self.stop_rx.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return;
                        }
                        continue;
                    }
                };
                match accepted {
                    Ok((stream, remote)) => {
                        let address = PeerAddress::new(remote.ip().to_string(), remote.port());
                        debug!(peer = %address, "accepted inbound connection");
                        manager.spawn_session(stream, address, false);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        Ok(local_addr)
    }

    /// Dial a peer. Returns once the TCP connection is up; the handshake
    /// completes asynchronously and the peer appears in the connected set
    /// when it does.
    pub async fn connect_peer(self: &Arc<Self>, address: PeerAddress) -> Result<()> {
        if address.use_tor {
            return Err(NodeError::Unavailable(format!(
                "peer {address} requires a tor transport, none is configured"
            )));
        }
        if self.get_connected_peer(&address).is_some() {
            return Err(NodeError::AlreadyExists(format!("peer {address}")));
        }
        let stream = tokio::time::timeout(
            DIAL_TIMEOUT,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await
        .map_err(|_| NodeError::Unavailable(format!("dial {address}: timed out")))?
        .map_err(|e| NodeError::Unavailable(format!("dial {address}: {e}")))?;
        debug!(peer = %address, "dialed outbound connection");
        self.spawn_session(stream, address, true);
        Ok(())
    }

    fn spawn_session(self: &Arc<Self>, stream: TcpStream, address: PeerAddress, outbound: bool) {
        let sink = self.clone() as Arc<dyn PeerEventSink>;
        let network = self.network;
        let nonce = self.local_nonce;
        tokio::spawn(run_session(stream, address, outbound, network, nonce, sink));
    }

    pub fn get_connected_peer(&self, address: &PeerAddress) -> Option<Arc<PeerHandle>> {
        self.peers.lock().ok()?.get(address).cloned()
    }

    pub fn connected_handles(&self) -> Vec<Arc<PeerHandle>> {
        match self.peers.lock() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn num_connected_peers(&self) -> usize {
        self.peers.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Best-effort fan-out to every connected peer.
    pub fn broadcast(&self, message: Message) {
        for peer in self.connected_handles() {
            peer.try_send(message.clone());
        }
    }

    pub fn disconnect_peer(&self, address: &PeerAddress) -> Result<()> {
        match self.get_connected_peer(address) {
            Some(peer) => {
                peer.disconnect();
                Ok(())
            }
            None => Err(NodeError::NotFound(format!("connected peer {address}"))),
        }
    }

    /// Stop accepting and close every session.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        for peer in self.connected_handles() {
            peer.disconnect();
        }
    }

    /// Insert a ready peer, evicting the idlest inbound peer if the table
    /// is full. Refuses the newcomer when nothing can be evicted.
    fn register(&self, peer: &Arc<PeerHandle>) -> Result<()> {
        let evict = {
            let mut guard = self
                .peers
                .lock()
                .map_err(|_| NodeError::Unavailable("peer registry poisoned".to_string()))?;
            if guard.contains_key(peer.address()) {
                return Err(NodeError::AlreadyExists(format!(
                    "peer {}",
                    peer.address()
                )));
            }
            let mut evict = None;
            if guard.len() >= self.max_peers {
                let idlest = guard
                    .values()
                    .filter(|p| !p.outbound())
                    .min_by_key(|p| p.snapshot().last_msg_recv_time_s)
                    .cloned();
                match idlest {
                    Some(victim) => {
                        guard.remove(victim.address());
                        evict = Some(victim);
                    }
                    None => {
                        return Err(NodeError::Unavailable(format!(
                            "peer table full ({} peers)",
                            guard.len()
                        )));
                    }
                }
            }
            guard.insert(peer.address().clone(), peer.clone());
            evict
        };
        if let Some(victim) = evict {
            info!(peer = %victim.address(), "evicting idle inbound peer");
            victim.disconnect();
        }
        Ok(())
    }

    fn unregister(&self, peer: &Arc<PeerHandle>) {
        if let Ok(mut guard) = self.peers.lock() {
            if let Some(current) = guard.get(peer.address()) {
                if Arc::ptr_eq(current, peer) {
                    guard.remove(peer.address());
                }
            }
        }
    }
}

#[async_trait]
impl PeerEventSink for NetworkManager {
    async fn peer_ready(&self, peer: &Arc<PeerHandle>) -> Result<()> {
        self.register(peer)?;
        let handler = self.handler()?;
        if let Err(e) = handler.on_peer_connected(peer).await {
            self.unregister(peer);
            return Err(e);
        }
        Ok(())
    }

    async fn peer_message(&self, peer: &Arc<PeerHandle>, message: Message) -> Result<()> {
        self.handler()?.on_peer_message(peer, message).await
    }

    async fn peer_disconnected(&self, peer: &Arc<PeerHandle>) {
        self.unregister(peer);
        if let Ok(handler) = self.handler() {
            handler.on_peer_disconnected(peer).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        connected: Mutex<Vec<PeerAddress>>,
        disconnected: Mutex<Vec<PeerAddress>>,
        messages: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl NetworkHandler for RecordingHandler {
        async fn on_peer_connected(&self, peer: &Arc<PeerHandle>) -> Result<()> {
            self.connected.lock().unwrap().push(peer.address().clone());
            Ok(())
        }
        async fn on_peer_message(&self, _peer: &Arc<PeerHandle>, message: Message) -> Result<()> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
        async fn on_peer_disconnected(&self, peer: &Arc<PeerHandle>) {
            self.disconnected.lock().unwrap().push(peer.address().clone());
        }
    }

    async fn wait_until<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    fn manager_with_handler(max_peers: usize) -> (Arc<NetworkManager>, Arc<RecordingHandler>) {
        let manager = NetworkManager::new(Network::Regtest, max_peers);
        let handler = Arc::new(RecordingHandler::default());
        let dyn_handler: Arc<dyn NetworkHandler> = handler.clone();
        manager.set_handler(Arc::downgrade(&dyn_handler));
        // keep the handler alive for the duration of the test
        std::mem::forget(dyn_handler);
        (manager, handler)
    }

    #[tokio::test]
    async fn inbound_and_outbound_peers_connect() {
        let (server, server_handler) = manager_with_handler(8);
        let (client, client_handler) = manager_with_handler(8);

        let addr = server.start_listening(0).await.unwrap();
        client
            .connect_peer(PeerAddress::new("127.0.0.1", addr.port()))
            .await
            .unwrap();

        wait_until(|| {
            !server_handler.connected.lock().unwrap().is_empty()
                && !client_handler.connected.lock().unwrap().is_empty()
        })
        .await;
        assert_eq!(server.num_connected_peers(), 1);
        assert_eq!(client.num_connected_peers(), 1);

        // disconnect shows up on both sides
        let peer_addr = PeerAddress::new("127.0.0.1", addr.port());
        client.disconnect_peer(&peer_addr).unwrap();
        wait_until(|| client.num_connected_peers() == 0 && server.num_connected_peers() == 0).await;

        server.stop();
        client.stop();
    }

    #[tokio::test]
    async fn tor_peers_require_a_proxy() {
        let (manager, _) = manager_with_handler(8);
        let err = manager
            .connect_peer(PeerAddress::new("peer.onion", 8555))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Unavailable(_)));
    }

    #[tokio::test]
    async fn broadcast_reaches_connected_peers() {
        let (server, server_handler) = manager_with_handler(8);
        let (client, client_handler) = manager_with_handler(8);

        let addr = server.start_listening(0).await.unwrap();
        client
            .connect_peer(PeerAddress::new("127.0.0.1", addr.port()))
            .await
            .unwrap();
        wait_until(|| !client_handler.connected.lock().unwrap().is_empty()).await;

        client.broadcast(Message::GetAddr);
        wait_until(|| !server_handler.messages.lock().unwrap().is_empty()).await;
        assert!(matches!(
            server_handler.messages.lock().unwrap()[0],
            Message::GetAddr
        ));

        server.stop();
        client.stop();
    }
}
