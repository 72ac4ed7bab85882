//! One peer session per TCP connection: framed message I/O, the handshake
//! state machine, the remote subscription filter, and per-peer counters.
//!
//! A session owns its socket. Reads happen on the session task; writes are
//! serialized through a bounded per-peer queue drained by a writer task, so
//! send ordering equals invocation ordering. Cross-thread access goes
//! through [`PeerHandle`], which only exposes the queue and atomic
//! snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use squeak_core::messages::{
    decode_header, decode_message, encode_message, HEADER_LENGTH, PROTOCOL_VERSION,
};
use squeak_core::{Address, Message, Network, PeerAddress, SubscribeMessage, VersionMessage};

use crate::error::{NodeError, Result};
use crate::now_s;
use crate::types::ConnectedPeer;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const PING_INTERVAL_S: u64 = 60;
pub const DEAD_PEER_TIMEOUT_S: u64 = 90;
pub const SEND_QUEUE_CAPACITY: usize = 100;

/// Callbacks a session drives. The network manager implements this,
/// registering ready peers and routing messages to the controller.
#[async_trait]
pub trait PeerEventSink: Send + Sync {
    /// Handshake completed. An error here refuses the peer and closes the
    /// connection (e.g. the peer cap is exhausted).
    async fn peer_ready(&self, peer: &Arc<PeerHandle>) -> Result<()>;

    /// A post-handshake message arrived. An error closes the connection.
    async fn peer_message(&self, peer: &Arc<PeerHandle>, message: Message) -> Result<()>;

    /// The session ended. Only called for peers that reached ready.
    async fn peer_disconnected(&self, peer: &Arc<PeerHandle>);
}

#[derive(Debug, Default)]
struct PeerCounters {
    last_msg_recv_s: AtomicU64,
    num_msgs_received: AtomicU64,
    num_msgs_sent: AtomicU64,
    num_bytes_received: AtomicU64,
    num_bytes_sent: AtomicU64,
}

/// Shared view of a live peer session.
pub struct PeerHandle {
    address: PeerAddress,
    outbound: bool,
    connect_time_s: u64,
    sender: mpsc::Sender<Message>,
    shutdown: watch::Sender<bool>,
    counters: Arc<PeerCounters>,
    remote_subscription: StdMutex<Option<SubscribeMessage>>,
}

impl PeerHandle {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn outbound(&self) -> bool {
        self.outbound
    }

    /// Queue a message for this peer, waiting for queue space.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| NodeError::Unavailable(format!("peer {} is gone", self.address)))
    }

    /// Best-effort queue for fan-out: a full queue or closed session drops
    /// the message for this recipient only.
    pub fn try_send(&self, message: Message) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %self.address, error = %e, "dropping fan-out message");
                false
            }
        }
    }

    pub fn set_remote_subscription(&self, subscription: SubscribeMessage) {
        if let Ok(mut guard) = self.remote_subscription.lock() {
            *guard = Some(subscription);
        }
    }

    /// Whether the remote asked for squeaks by this author at this height.
    pub fn is_remote_subscribed(&self, address: &Address, block_height: u32) -> bool {
        match self.remote_subscription.lock() {
            Ok(guard) => guard
                .as_ref()
                .map(|sub| sub.matches(address, block_height))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn snapshot(&self) -> ConnectedPeer {
        ConnectedPeer {
            address: self.address.clone(),
            outbound: self.outbound,
            connect_time_s: self.connect_time_s,
            last_msg_recv_time_s: self.counters.last_msg_recv_s.load(Ordering::Relaxed),
            num_msgs_received: self.counters.num_msgs_received.load(Ordering::Relaxed),
            num_msgs_sent: self.counters.num_msgs_sent.load(Ordering::Relaxed),
            num_bytes_received: self.counters.num_bytes_received.load(Ordering::Relaxed),
            num_bytes_sent: self.counters.num_bytes_sent.load(Ordering::Relaxed),
            saved_peer: None,
        }
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("address", &self.address)
            .field("outbound", &self.outbound)
            .finish()
    }
}

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    network: Network,
) -> Result<(Message, u64)> {
    let mut header_bytes = [0u8; HEADER_LENGTH];
    reader
        .read_exact(&mut header_bytes)
        .await
        .map_err(|e| NodeError::Unavailable(format!("connection closed: {e}")))?;
    let header = decode_header(network, &header_bytes)?;
    let mut payload = vec![0u8; header.payload_length as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| NodeError::Unavailable(format!("connection closed: {e}")))?;
    let message = decode_message(&header, &payload)?;
    Ok((message, (HEADER_LENGTH + payload.len()) as u64))
}

/// Drive one connection from handshake to close.
pub async fn run_session<S>(
    stream: S,
    address: PeerAddress,
    outbound: bool,
    network: Network,
    local_nonce: u64,
    sink: Arc<dyn PeerEventSink>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Message>(SEND_QUEUE_CAPACITY);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let counters = Arc::new(PeerCounters::default());

    // reader task: frames flow through a channel so the session loop can
    // apply timeouts without cancelling a read mid-frame
    let (frames_tx, mut frames) = mpsc::channel::<Result<(Message, u64)>>(8);
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader, network).await {
                Ok(frame) => {
                    if frames_tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = frames_tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });

    let peer = Arc::new(PeerHandle {
        address: address.clone(),
        outbound,
        connect_time_s: now_s(),
        sender: tx,
        shutdown: shutdown_tx,
        counters: counters.clone(),
        remote_subscription: StdMutex::new(None),
    });

    // writer task: single drain point for this peer's outgoing messages
    let write_counters = counters.clone();
    let write_address = address.clone();
    let mut write_shutdown = shutdown_rx.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(m) => m,
                    None => break,
                },
                _ = write_shutdown.changed() => {
                    if *write_shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let bytes = encode_message(network, &message);
            if let Err(e) = writer.write_all(&bytes).await {
                debug!(peer = %write_address, error = %e, "write failed");
                break;
            }
            write_counters
                .num_msgs_sent
                .fetch_add(1, Ordering::Relaxed);
            write_counters
                .num_bytes_sent
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        let _ = writer.shutdown().await;
    });

    let result = drive_session(
        &mut frames,
        &peer,
        local_nonce,
        sink.clone(),
        &mut shutdown_rx,
    )
    .await;

    match &result {
        Ok(was_ready) => {
            if *was_ready {
                sink.peer_disconnected(&peer).await;
            }
        }
        Err((was_ready, e)) => {
            debug!(peer = %address, error = %e, "peer session ended");
            if *was_ready {
                sink.peer_disconnected(&peer).await;
            }
        }
    }
    peer.disconnect();
    reader_task.abort();
    let _ = writer_task.await;
}

/// Returns whether the session got past the handshake; errors carry the
/// same flag so the caller knows whether to emit a disconnect event.
async fn drive_session(
    frames: &mut mpsc::Receiver<Result<(Message, u64)>>,
    peer: &Arc<PeerHandle>,
    local_nonce: u64,
    sink: Arc<dyn PeerEventSink>,
    shutdown: &mut watch::Receiver<bool>,
) -> std::result::Result<bool, (bool, NodeError)> {
    // HANDSHAKING: send our version, wait for version + verack
    peer.send(Message::Version(VersionMessage {
        protocol_version: PROTOCOL_VERSION,
        timestamp: now_s(),
        nonce: local_nonce,
    }))
    .await
    .map_err(|e| (false, e))?;

    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let mut got_version = false;
        let mut got_verack = false;
        while !(got_version && got_verack) {
            let (message, bytes) = match frames.recv().await {
                Some(frame) => frame?,
                None => {
                    return Err(NodeError::Unavailable(format!(
                        "peer {} closed during handshake",
                        peer.address()
                    )));
                }
            };
            record_recv(peer, bytes);
            match message {
                Message::Version(version) => {
                    if version.nonce == local_nonce {
                        return Err(NodeError::ProtocolViolation {
                            peer: peer.address().to_string(),
                            reason: "connected to self".to_string(),
                        });
                    }
                    got_version = true;
                    peer.send(Message::Verack).await?;
                }
                Message::Verack => {
                    got_verack = true;
                }
                other => {
                    return Err(NodeError::ProtocolViolation {
                        peer: peer.address().to_string(),
                        reason: format!("{} before handshake completed", other.command()),
                    });
                }
            }
        }
        Ok(())
    })
    .await;
    match handshake {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err((false, e)),
        Err(_) => {
            return Err((
                false,
                NodeError::ProtocolViolation {
                    peer: peer.address().to_string(),
                    reason: "handshake timed out".to_string(),
                },
            ));
        }
    }

    // READY
    sink.peer_ready(peer).await.map_err(|e| (false, e))?;

    loop {
        let frame = tokio::select! {
            frame = tokio::time::timeout(
                Duration::from_secs(PING_INTERVAL_S),
                frames.recv(),
            ) => frame,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(true);
                }
                continue;
            }
        };
        let (message, bytes) = match frame {
            Ok(Some(Ok(ok))) => ok,
            Ok(Some(Err(e))) => return Err((true, e)),
            Ok(None) => {
                return Err((
                    true,
                    NodeError::Unavailable(format!("peer {} closed", peer.address())),
                ));
            }
            Err(_elapsed) => {
                let idle = now_s().saturating_sub(peer.counters.last_msg_recv_s.load(Ordering::Relaxed));
                if idle >= DEAD_PEER_TIMEOUT_S {
                    return Err((
                        true,
                        NodeError::Unavailable(format!(
                            "peer {} idle for {idle}s",
                            peer.address()
                        )),
                    ));
                }
                let _ = peer.try_send(Message::Ping(rand::random()));
                continue;
            }
        };
        record_recv(peer, bytes);
        match message {
            Message::Ping(nonce) => {
                peer.send(Message::Pong(nonce)).await.map_err(|e| (true, e))?;
            }
            Message::Pong(_) => {}
            Message::Version(_) | Message::Verack => {
                return Err((
                    true,
                    NodeError::ProtocolViolation {
                        peer: peer.address().to_string(),
                        reason: "handshake message repeated".to_string(),
                    },
                ));
            }
            Message::Subscribe(subscription) => {
                peer.set_remote_subscription(subscription.clone());
                sink.peer_message(peer, Message::Subscribe(subscription))
                    .await
                    .map_err(|e| (true, e))?;
            }
            other => {
                if let Err(e) = sink.peer_message(peer, other).await {
                    warn!(peer = %peer.address(), error = %e, "closing peer after handler error");
                    return Err((true, e));
                }
            }
        }
    }
}

fn record_recv(peer: &Arc<PeerHandle>, bytes: u64) {
    peer.counters.last_msg_recv_s.store(now_s(), Ordering::Relaxed);
    peer.counters.num_msgs_received.fetch_add(1, Ordering::Relaxed);
    peer.counters.num_bytes_received.fetch_add(bytes, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const NET: Network = Network::Regtest;

    #[derive(Default)]
    struct RecordingSink {
        ready: Mutex<Vec<PeerAddress>>,
        messages: Mutex<Vec<Message>>,
        disconnected: Mutex<Vec<PeerAddress>>,
    }

    #[async_trait]
    impl PeerEventSink for RecordingSink {
        async fn peer_ready(&self, peer: &Arc<PeerHandle>) -> Result<()> {
            self.ready.lock().unwrap().push(peer.address().clone());
            Ok(())
        }

        async fn peer_message(&self, _peer: &Arc<PeerHandle>, message: Message) -> Result<()> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }

        async fn peer_disconnected(&self, peer: &Arc<PeerHandle>) {
            self.disconnected.lock().unwrap().push(peer.address().clone());
        }
    }

    async fn wait_until<F: Fn() -> bool>(predicate: F) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn sessions_handshake_over_duplex() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let sink_a = Arc::new(RecordingSink::default());
        let sink_b = Arc::new(RecordingSink::default());

        let task_a = tokio::spawn(run_session(
            a,
            PeerAddress::new("peer-b", 1),
            true,
            NET,
            1,
            sink_a.clone() as Arc<dyn PeerEventSink>,
        ));
        let task_b = tokio::spawn(run_session(
            b,
            PeerAddress::new("peer-a", 2),
            false,
            NET,
            2,
            sink_b.clone() as Arc<dyn PeerEventSink>,
        ));

        wait_until(|| {
            !sink_a.ready.lock().unwrap().is_empty() && !sink_b.ready.lock().unwrap().is_empty()
        })
        .await;

        task_a.abort();
        task_b.abort();
    }

    #[tokio::test]
    async fn self_connection_is_refused() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let sink = Arc::new(RecordingSink::default());

        // both ends advertise the same nonce
        let task_a = tokio::spawn(run_session(
            a,
            PeerAddress::new("peer", 1),
            true,
            NET,
            7,
            sink.clone() as Arc<dyn PeerEventSink>,
        ));
        let task_b = tokio::spawn(run_session(
            b,
            PeerAddress::new("peer", 2),
            false,
            NET,
            7,
            sink.clone() as Arc<dyn PeerEventSink>,
        ));
        let _ = task_a.await;
        let _ = task_b.await;
        assert!(sink.ready.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ping_gets_pong_and_messages_reach_sink() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let sink_a = Arc::new(RecordingSink::default());
        let sink_b = Arc::new(RecordingSink::default());

        struct CapturingSink {
            inner: Arc<RecordingSink>,
            handle: Mutex<Option<Arc<PeerHandle>>>,
        }

        #[async_trait]
        impl PeerEventSink for CapturingSink {
            async fn peer_ready(&self, peer: &Arc<PeerHandle>) -> Result<()> {
                *self.handle.lock().unwrap() = Some(peer.clone());
                self.inner.peer_ready(peer).await
            }
            async fn peer_message(&self, peer: &Arc<PeerHandle>, message: Message) -> Result<()> {
                self.inner.peer_message(peer, message).await
            }
            async fn peer_disconnected(&self, peer: &Arc<PeerHandle>) {
                self.inner.peer_disconnected(peer).await
            }
        }

        let capturing = Arc::new(CapturingSink {
            inner: sink_a.clone(),
            handle: Mutex::new(None),
        });

        tokio::spawn(run_session(
            a,
            PeerAddress::new("peer-b", 1),
            true,
            NET,
            1,
            capturing.clone() as Arc<dyn PeerEventSink>,
        ));
        tokio::spawn(run_session(
            b,
            PeerAddress::new("peer-a", 2),
            false,
            NET,
            2,
            sink_b.clone() as Arc<dyn PeerEventSink>,
        ));

        wait_until(|| capturing.handle.lock().unwrap().is_some()).await;
        let handle = capturing.handle.lock().unwrap().clone().unwrap();

        handle
            .send(Message::GetOffer(squeak_core::SqueakHash::from_bytes([1u8; 32])))
            .await
            .unwrap();

        wait_until(|| !sink_b.messages.lock().unwrap().is_empty()).await;
        match &sink_b.messages.lock().unwrap()[0] {
            Message::GetOffer(hash) => {
                assert_eq!(*hash, squeak_core::SqueakHash::from_bytes([1u8; 32]))
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // disconnect propagates to the other side
        handle.disconnect();
        wait_until(|| !sink_b.disconnected.lock().unwrap().is_empty()).await;
    }

    #[tokio::test]
    async fn subscription_filter_is_applied() {
        let (tx, _rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        let peer = PeerHandle {
            address: PeerAddress::new("x", 1),
            outbound: false,
            connect_time_s: 0,
            sender: tx,
            shutdown,
            counters: Arc::new(PeerCounters::default()),
            remote_subscription: StdMutex::new(None),
        };
        let key = squeak_core::SigningKey::generate();
        let address = key.verifying_key().address(NET);
        assert!(!peer.is_remote_subscribed(&address, 5));
        peer.set_remote_subscription(SubscribeMessage {
            addresses: vec![address.clone()],
            min_block: 0,
            max_block: 10,
        });
        assert!(peer.is_remote_subscribed(&address, 5));
        assert!(!peer.is_remote_subscribed(&address, 11));
    }
}
