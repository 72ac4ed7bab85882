//! The controller: facade over store, network, exchange engine, and
//! adapters, exposing the API the admin glue consumes and reacting to wire
//! messages from peer sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use squeak_core::{
    make_squeak, Address, Inventory, Message, Network, OfferMessage, PeerAddress, SigningKey,
    Squeak, SqueakHash, SubscribeMessage, INV_TYPE_SECRET_KEY, INV_TYPE_SQUEAK,
};

use crate::bitcoin_client::BitcoinClient;
use crate::config::{default_peer_port, Config};
use crate::error::{NodeError, Result};
use crate::event::{EventBus, PeerEvent, SqueakUpdate, Subscription};
use crate::exchange::ExchangeEngine;
use crate::lightning_client::LightningClient;
use crate::network::{NetworkHandler, NetworkManager};
use crate::peer::PeerHandle;
use crate::store::SqueakStore;
use crate::types::{
    ConnectedPeer, ReceivedOffer, ReceivedPayment, ReceivedPaymentSummary, SentOffer, SentPayment,
    SentPaymentSummary, SqueakEntry, SqueakPeer, SqueakProfile,
};
use crate::{now_s, worker};

/// Block range requested when downloading squeaks from peers.
const DOWNLOAD_BLOCK_RANGE: u32 = 1008;
/// How long a download request keeps its addresses/hashes interesting.
const DOWNLOAD_INTEREST_TTL_S: u64 = 60;
/// Capacity of the per-subscriber entry streams handed to consumers.
const ENTRY_STREAM_CAPACITY: usize = 16;

pub struct SqueakController {
    config: Config,
    store: Arc<SqueakStore>,
    bitcoin: Arc<dyn BitcoinClient>,
    lightning: Arc<dyn LightningClient>,
    network: Arc<NetworkManager>,
    exchange: ExchangeEngine,
    events: EventBus,
    best_block_height: AtomicU32,
    /// Addresses and hashes recently requested for download; received
    /// squeaks matching them are accepted even if not followed.
    requested_addresses: StdMutex<HashMap<Address, u64>>,
    requested_hashes: StdMutex<HashMap<SqueakHash, u64>>,
    payment_replay: tokio::sync::Notify,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl SqueakController {
    pub fn new(
        config: Config,
        store: Arc<SqueakStore>,
        bitcoin: Arc<dyn BitcoinClient>,
        lightning: Arc<dyn LightningClient>,
        network: Arc<NetworkManager>,
    ) -> Arc<Self> {
        let exchange = ExchangeEngine::new(
            store.clone(),
            lightning.clone(),
            config.network(),
            config.node.price_msat,
            config.node.max_offer_price_msat,
            config.lnd.host.clone(),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        Arc::new(SqueakController {
            config,
            store,
            bitcoin,
            lightning,
            network,
            exchange,
            events: EventBus::new(),
            best_block_height: AtomicU32::new(0),
            requested_addresses: StdMutex::new(HashMap::new()),
            requested_hashes: StdMutex::new(HashMap::new()),
            payment_replay: tokio::sync::Notify::new(),
            stop_tx,
            stop_rx,
        })
    }

    /// Wire the controller into the network manager, bind the peer port,
    /// and start the periodic workers. Returns the bound listen address.
    pub async fn start(self: &Arc<Self>) -> Result<std::net::SocketAddr> {
        let handler: Arc<dyn NetworkHandler> = self.clone();
        self.network.set_handler(Arc::downgrade(&handler));
        drop(handler);

        let height = self.bitcoin.get_block_count().await?;
        self.best_block_height.store(height, Ordering::Relaxed);

        let port = self.config.node.peer_port(self.network_kind());
        let bound = self.network.start_listening(port).await?;
        worker::spawn_all(self);
        info!(network = %self.network_kind(), peer_port = bound.port(), "squeaknode started");
        Ok(bound)
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.network.stop();
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn exchange(&self) -> &ExchangeEngine {
        &self.exchange
    }

    pub(crate) fn lightning(&self) -> &Arc<dyn LightningClient> {
        &self.lightning
    }

    pub(crate) fn bitcoin(&self) -> &Arc<dyn BitcoinClient> {
        &self.bitcoin
    }

    pub(crate) fn network_manager(&self) -> &Arc<NetworkManager> {
        &self.network
    }

    pub(crate) fn store(&self) -> &Arc<SqueakStore> {
        &self.store
    }

    pub(crate) fn payment_replay(&self) -> &tokio::sync::Notify {
        &self.payment_replay
    }

    fn network_kind(&self) -> Network {
        self.config.network()
    }

    pub fn best_block_height(&self) -> u32 {
        self.best_block_height.load(Ordering::Relaxed)
    }

    pub(crate) fn set_best_block_height(&self, height: u32) {
        self.best_block_height.store(height, Ordering::Relaxed);
    }

    // ==================================================================
    // Profiles
    // ==================================================================

    pub fn create_signing_profile(&self, profile_name: &str) -> Result<i64> {
        let signing_key = SigningKey::generate();
        let address = signing_key.verifying_key().address(self.network_kind());
        self.store.insert_profile(
            profile_name,
            Some(&signing_key.to_bytes()),
            &address,
            true,
        )
    }

    pub fn import_signing_profile(&self, profile_name: &str, private_key: &[u8]) -> Result<i64> {
        let signing_key = SigningKey::from_bytes(private_key)?;
        let address = signing_key.verifying_key().address(self.network_kind());
        self.store.insert_profile(
            profile_name,
            Some(&signing_key.to_bytes()),
            &address,
            true,
        )
    }

    pub fn create_contact_profile(&self, profile_name: &str, address: &Address) -> Result<i64> {
        self.store.insert_profile(profile_name, None, address, true)
    }

    pub fn get_profiles(&self) -> Result<Vec<SqueakProfile>> {
        self.store.get_profiles()
    }

    pub fn get_signing_profiles(&self) -> Result<Vec<SqueakProfile>> {
        self.store.get_signing_profiles()
    }

    pub fn get_contact_profiles(&self) -> Result<Vec<SqueakProfile>> {
        self.store.get_contact_profiles()
    }

    pub fn get_squeak_profile(&self, profile_id: i64) -> Result<Option<SqueakProfile>> {
        self.store.get_profile(profile_id)
    }

    pub fn get_squeak_profile_by_address(&self, address: &Address) -> Result<Option<SqueakProfile>> {
        self.store.get_profile_by_address(address)
    }

    pub fn get_squeak_profile_by_name(&self, name: &str) -> Result<Option<SqueakProfile>> {
        self.store.get_profile_by_name(name)
    }

    pub fn set_squeak_profile_following(&self, profile_id: i64, following: bool) -> Result<()> {
        self.store.set_profile_following(profile_id, following)
    }

    pub fn set_squeak_profile_use_custom_price(
        &self,
        profile_id: i64,
        use_custom_price: bool,
    ) -> Result<()> {
        self.store
            .set_profile_use_custom_price(profile_id, use_custom_price)
    }

    pub fn set_squeak_profile_custom_price(&self, profile_id: i64, price_msat: u64) -> Result<()> {
        self.store.set_profile_custom_price_msat(profile_id, price_msat)
    }

    pub fn rename_squeak_profile(&self, profile_id: i64, profile_name: &str) -> Result<()> {
        self.store.set_profile_name(profile_id, profile_name)
    }

    pub fn set_squeak_profile_image(&self, profile_id: i64, image: &[u8]) -> Result<()> {
        self.store.set_profile_image(profile_id, Some(image))
    }

    pub fn clear_squeak_profile_image(&self, profile_id: i64) -> Result<()> {
        self.store.set_profile_image(profile_id, None)
    }

    pub fn get_squeak_profile_private_key(&self, profile_id: i64) -> Result<Vec<u8>> {
        let profile = self
            .store
            .get_profile(profile_id)?
            .ok_or_else(|| NodeError::NotFound(format!("profile {profile_id}")))?;
        profile
            .private_key
            .ok_or_else(|| NodeError::PermissionDenied(format!("profile {profile_id} has no key")))
    }

    pub fn delete_squeak_profile(&self, profile_id: i64) -> Result<()> {
        self.store.delete_profile(profile_id)
    }

    // ==================================================================
    // Squeaks
    // ==================================================================

    /// Author a squeak with a signing profile, anchored at the current
    /// chain tip, and store it unlocked.
    pub async fn make_squeak(
        &self,
        profile_id: i64,
        content: &str,
        reply_to: Option<SqueakHash>,
    ) -> Result<SqueakHash> {
        let private_key = self.get_squeak_profile_private_key(profile_id)?;
        let signing_key = SigningKey::from_bytes(&private_key)?;

        let height = self.bitcoin.get_block_count().await?;
        let block = self.bitcoin.get_block_info(height).await?;
        let (squeak, secret_key) = make_squeak(
            &signing_key,
            content,
            block.height,
            block.hash,
            reply_to,
            now_s() as u32,
        )?;
        let hash = self
            .insert_squeak_checked(&squeak, block.time)?
            .ok_or_else(|| NodeError::AlreadyExists(format!("squeak {}", squeak.hash())))?;
        self.store
            .set_squeak_decryption_key(hash, &secret_key, content)?;
        self.events.publish_new_squeak(squeak);
        Ok(hash)
    }

    fn insert_squeak_checked(&self, squeak: &Squeak, block_time: u32) -> Result<Option<SqueakHash>> {
        let count = self.store.get_number_of_squeaks()?;
        if count >= self.config.node.max_squeaks {
            return Err(NodeError::PermissionDenied(format!(
                "store is full ({count} squeaks)"
            )));
        }
        self.store.insert_squeak(squeak, block_time)
    }

    pub fn get_squeak(&self, squeak_hash: SqueakHash) -> Result<Option<Squeak>> {
        self.store.get_squeak(squeak_hash)
    }

    pub fn get_squeak_entry(&self, squeak_hash: SqueakHash) -> Result<Option<SqueakEntry>> {
        self.store.get_squeak_entry(squeak_hash)
    }

    pub fn get_timeline_squeak_entries(
        &self,
        limit: usize,
        last_entry: Option<&SqueakEntry>,
    ) -> Result<Vec<SqueakEntry>> {
        self.store.get_timeline_squeak_entries(limit, last_entry)
    }

    pub fn get_squeak_entries_for_address(
        &self,
        address: &Address,
        limit: usize,
        last_entry: Option<&SqueakEntry>,
    ) -> Result<Vec<SqueakEntry>> {
        self.store
            .get_squeak_entries_for_address(address, limit, last_entry)
    }

    pub fn get_squeak_entries_for_text_search(
        &self,
        text: &str,
        limit: usize,
        last_entry: Option<&SqueakEntry>,
    ) -> Result<Vec<SqueakEntry>> {
        self.store
            .get_squeak_entries_for_text_search(text, limit, last_entry)
    }

    pub fn get_ancestor_squeak_entries(&self, squeak_hash: SqueakHash) -> Result<Vec<SqueakEntry>> {
        self.store.get_ancestor_squeak_entries(squeak_hash)
    }

    pub fn get_reply_squeak_entries(
        &self,
        squeak_hash: SqueakHash,
        limit: usize,
        last_entry: Option<&SqueakEntry>,
    ) -> Result<Vec<SqueakEntry>> {
        self.store
            .get_reply_squeak_entries(squeak_hash, limit, last_entry)
    }

    pub fn get_liked_squeak_entries(
        &self,
        limit: usize,
        last_entry: Option<&SqueakEntry>,
    ) -> Result<Vec<SqueakEntry>> {
        self.store.get_liked_squeak_entries(limit, last_entry)
    }

    pub fn like_squeak(&self, squeak_hash: SqueakHash) -> Result<()> {
        self.store.set_squeak_liked(squeak_hash)?;
        self.events.publish_squeak_update(squeak_hash);
        Ok(())
    }

    pub fn unlike_squeak(&self, squeak_hash: SqueakHash) -> Result<()> {
        self.store.set_squeak_unliked(squeak_hash)?;
        self.events.publish_squeak_update(squeak_hash);
        Ok(())
    }

    pub fn delete_squeak(&self, squeak_hash: SqueakHash) -> Result<()> {
        self.store.delete_squeak(squeak_hash)?;
        self.store.delete_offers_for_squeak(squeak_hash)?;
        self.events.publish_squeak_update(squeak_hash);
        Ok(())
    }

    // ==================================================================
    // Peers
    // ==================================================================

    pub fn create_peer(
        &self,
        peer_name: &str,
        address: &PeerAddress,
        autoconnect: bool,
    ) -> Result<i64> {
        let resolved = address.with_default_port(self.get_default_peer_port());
        self.store.insert_peer(peer_name, &resolved, autoconnect)
    }

    pub fn get_peer(&self, peer_id: i64) -> Result<Option<SqueakPeer>> {
        self.store.get_peer(peer_id)
    }

    pub fn get_peer_by_address(&self, address: &PeerAddress) -> Result<Option<SqueakPeer>> {
        self.store.get_peer_by_address(address)
    }

    pub fn get_peers(&self) -> Result<Vec<SqueakPeer>> {
        self.store.get_peers()
    }

    pub fn rename_peer(&self, peer_id: i64, peer_name: &str) -> Result<()> {
        self.store.set_peer_name(peer_id, peer_name)
    }

    pub fn set_peer_autoconnect(&self, peer_id: i64, autoconnect: bool) -> Result<()> {
        self.store.set_peer_autoconnect(peer_id, autoconnect)
    }

    pub fn delete_peer(&self, peer_id: i64) -> Result<()> {
        self.store.delete_peer(peer_id)
    }

    pub async fn connect_peer(&self, address: &PeerAddress) -> Result<()> {
        let resolved = address.with_default_port(self.get_default_peer_port());
        self.network.connect_peer(resolved).await
    }

    pub fn disconnect_peer(&self, address: &PeerAddress) -> Result<()> {
        self.network.disconnect_peer(address)
    }

    pub fn get_connected_peers(&self) -> Result<Vec<ConnectedPeer>> {
        self.network
            .connected_handles()
            .into_iter()
            .map(|handle| self.fill_saved_peer(handle.snapshot()))
            .collect()
    }

    pub fn get_connected_peer(&self, address: &PeerAddress) -> Result<Option<ConnectedPeer>> {
        match self.network.get_connected_peer(address) {
            Some(handle) => Ok(Some(self.fill_saved_peer(handle.snapshot())?)),
            None => Ok(None),
        }
    }

    fn fill_saved_peer(&self, mut snapshot: ConnectedPeer) -> Result<ConnectedPeer> {
        snapshot.saved_peer = self.store.get_peer_by_address(&snapshot.address)?;
        Ok(snapshot)
    }

    // ==================================================================
    // Downloads
    // ==================================================================

    /// Ask connected peers for recent squeaks from all followed authors.
    pub fn download_squeaks(&self) -> Result<()> {
        let addresses: Vec<Address> = self
            .store
            .get_following_profiles()?
            .into_iter()
            .map(|p| p.address)
            .collect();
        self.broadcast_download_subscription(addresses)
    }

    pub fn download_address_squeaks(&self, address: &Address) -> Result<()> {
        self.mark_address_requested(address);
        self.broadcast_download_subscription(vec![address.clone()])
    }

    /// Ask peers for replies to a squeak. The subscribe filter cannot name
    /// a parent hash, so this widens to followed authors from the parent's
    /// block onward; the reply link is checked on arrival.
    pub fn download_replies(&self, squeak_hash: SqueakHash) -> Result<()> {
        self.mark_hash_requested(squeak_hash);
        self.download_squeaks()
    }

    pub fn download_single_squeak(&self, squeak_hash: SqueakHash) -> Result<()> {
        self.mark_hash_requested(squeak_hash);
        self.network
            .broadcast(Message::GetData(vec![Inventory::squeak(squeak_hash)]));
        Ok(())
    }

    /// Request offers for a squeak from every connected peer.
    pub fn download_offers(&self, squeak_hash: SqueakHash) -> Result<()> {
        self.network.broadcast(Message::GetOffer(squeak_hash));
        Ok(())
    }

    fn broadcast_download_subscription(&self, addresses: Vec<Address>) -> Result<()> {
        if addresses.is_empty() {
            return Ok(());
        }
        for address in &addresses {
            self.mark_address_requested(address);
        }
        let max_block = self.best_block_height();
        let subscription = SubscribeMessage {
            addresses,
            min_block: max_block.saturating_sub(DOWNLOAD_BLOCK_RANGE),
            max_block,
        };
        self.network.broadcast(Message::Subscribe(subscription));
        Ok(())
    }

    fn mark_address_requested(&self, address: &Address) {
        if let Ok(mut guard) = self.requested_addresses.lock() {
            guard.retain(|_, expiry| *expiry > now_s());
            guard.insert(address.clone(), now_s() + DOWNLOAD_INTEREST_TTL_S);
        }
    }

    fn mark_hash_requested(&self, squeak_hash: SqueakHash) {
        if let Ok(mut guard) = self.requested_hashes.lock() {
            guard.retain(|_, expiry| *expiry > now_s());
            guard.insert(squeak_hash, now_s() + DOWNLOAD_INTEREST_TTL_S);
        }
    }

    fn is_address_requested(&self, address: &Address) -> bool {
        self.requested_addresses
            .lock()
            .map(|g| g.get(address).map(|e| *e > now_s()).unwrap_or(false))
            .unwrap_or(false)
    }

    fn is_hash_requested(&self, squeak_hash: &SqueakHash) -> bool {
        self.requested_hashes
            .lock()
            .map(|g| g.get(squeak_hash).map(|e| *e > now_s()).unwrap_or(false))
            .unwrap_or(false)
    }

    // ==================================================================
    // Exchange
    // ==================================================================

    pub fn get_received_offers(&self, squeak_hash: SqueakHash) -> Result<Vec<ReceivedOffer>> {
        self.store.get_received_offers(squeak_hash)
    }

    pub fn get_received_offer(&self, received_offer_id: i64) -> Result<Option<ReceivedOffer>> {
        self.store.get_received_offer(received_offer_id)
    }

    /// Pay a received offer and unlock its squeak.
    pub async fn pay_offer(&self, received_offer_id: i64) -> Result<SentPayment> {
        let offer = self
            .store
            .get_received_offer(received_offer_id)?
            .ok_or_else(|| NodeError::NotFound(format!("received offer {received_offer_id}")))?;
        let payment = self.exchange.pay_offer(&offer).await?;
        self.events.publish_new_secret_key(offer.squeak_hash);
        Ok(payment)
    }

    pub fn get_sent_payments(
        &self,
        limit: usize,
        last_payment: Option<&SentPayment>,
    ) -> Result<Vec<SentPayment>> {
        self.store.get_sent_payments(limit, last_payment)
    }

    pub fn get_sent_payment(&self, sent_payment_id: i64) -> Result<Option<SentPayment>> {
        self.store.get_sent_payment(sent_payment_id)
    }

    pub fn get_sent_offers(&self) -> Result<Vec<SentOffer>> {
        self.store.get_sent_offers()
    }

    pub fn get_received_payments(
        &self,
        limit: usize,
        last_payment: Option<&ReceivedPayment>,
    ) -> Result<Vec<ReceivedPayment>> {
        self.store.get_received_payments(limit, last_payment)
    }

    pub fn get_received_payment_summary(&self) -> Result<ReceivedPaymentSummary> {
        self.store.get_received_payment_summary()
    }

    pub fn get_sent_payment_summary(&self) -> Result<SentPaymentSummary> {
        self.store.get_sent_payment_summary()
    }

    /// Clear settle indices and replay the invoice subscription from the
    /// beginning, re-recording any settled payments that were missed.
    pub fn reprocess_received_payments(&self) -> Result<()> {
        self.store.clear_received_payment_settle_indices()?;
        self.payment_replay.notify_one();
        Ok(())
    }

    /// Sweep expired offers on both sides of the exchange.
    pub async fn delete_expired_offers(&self) -> Result<()> {
        let received = self.store.delete_expired_received_offers()?;
        if received > 0 {
            debug!(count = received, "swept expired received offers");
        }
        let sent = self
            .exchange
            .cancel_expired_sent_offers(self.config.node.offer_deletion_interval_s)
            .await?;
        if sent > 0 {
            debug!(count = sent, "swept expired sent offers");
        }
        Ok(())
    }

    /// Delete squeaks past retention that are neither liked nor authored
    /// by a local signing profile.
    pub fn delete_old_squeaks(&self) -> Result<()> {
        let hashes = self
            .store
            .get_old_squeaks_to_delete(self.config.node.squeak_retention_s)?;
        for hash in hashes {
            self.store.delete_squeak(hash)?;
            self.store.delete_offers_for_squeak(hash)?;
            debug!(squeak_hash = %hash, "swept old squeak");
        }
        Ok(())
    }

    // ==================================================================
    // Node info
    // ==================================================================

    pub fn get_network(&self) -> Network {
        self.network_kind()
    }

    pub fn get_external_address(&self) -> PeerAddress {
        let host = self
            .config
            .node
            .external_address
            .clone()
            .unwrap_or_default();
        PeerAddress::new(host, self.config.node.peer_port(self.network_kind()))
    }

    pub fn get_default_peer_port(&self) -> u16 {
        default_peer_port(self.network_kind())
    }

    // ==================================================================
    // Subscriptions
    // ==================================================================

    pub fn subscribe_new_squeaks(&self, stop: watch::Receiver<bool>) -> Subscription<Squeak> {
        self.events.subscribe_new_squeaks(stop)
    }

    pub fn subscribe_received_payments(
        &self,
        stop: watch::Receiver<bool>,
    ) -> Subscription<ReceivedPayment> {
        self.events.subscribe_received_payments(stop)
    }

    pub fn subscribe_connected_peers(
        self: &Arc<Self>,
        stop: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Vec<ConnectedPeer>> {
        let controller = self.clone();
        let mut events = self.events.subscribe_peer_events(stop);
        let (tx, rx) = mpsc::channel(ENTRY_STREAM_CAPACITY);
        tokio::spawn(async move {
            let initial = controller.get_connected_peers().unwrap_or_default();
            if tx.send(initial).await.is_err() {
                return;
            }
            while events.recv().await.is_some() {
                let peers = controller.get_connected_peers().unwrap_or_default();
                if tx.send(peers).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    pub fn subscribe_connected_peer(
        self: &Arc<Self>,
        address: &PeerAddress,
        stop: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Option<ConnectedPeer>> {
        let controller = self.clone();
        let address = address.clone();
        let mut events = self.events.subscribe_peer_events(stop);
        let (tx, rx) = mpsc::channel(ENTRY_STREAM_CAPACITY);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let relevant = match &event {
                    PeerEvent::Connected(a) | PeerEvent::Disconnected(a) => *a == address,
                };
                if !relevant {
                    continue;
                }
                let snapshot = controller.get_connected_peer(&address).unwrap_or(None);
                if tx.send(snapshot).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    pub fn subscribe_received_offers_for_squeak(
        self: &Arc<Self>,
        squeak_hash: SqueakHash,
        stop: watch::Receiver<bool>,
    ) -> mpsc::Receiver<ReceivedOffer> {
        let mut events = self.events.subscribe_received_offers(stop);
        let (tx, rx) = mpsc::channel(ENTRY_STREAM_CAPACITY);
        tokio::spawn(async move {
            while let Some(offer) = events.recv().await {
                if offer.squeak_hash != squeak_hash {
                    continue;
                }
                if tx.send(offer).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    /// Stream refreshed entries for squeak updates selected by `filter`.
    fn entry_update_stream<F>(
        self: &Arc<Self>,
        stop: watch::Receiver<bool>,
        filter: F,
    ) -> mpsc::Receiver<SqueakEntry>
    where
        F: Fn(&SqueakController, &SqueakEntry) -> bool + Send + 'static,
    {
        let controller = self.clone();
        let mut events = self.events.subscribe_squeak_updates(stop);
        let (tx, rx) = mpsc::channel(ENTRY_STREAM_CAPACITY);
        tokio::spawn(async move {
            while let Some(SqueakUpdate { squeak_hash }) = events.recv().await {
                let entry = match controller.get_squeak_entry(squeak_hash) {
                    Ok(Some(entry)) => entry,
                    _ => continue,
                };
                if !filter(&controller, &entry) {
                    continue;
                }
                if tx.send(entry).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    pub fn subscribe_squeak_entries(
        self: &Arc<Self>,
        stop: watch::Receiver<bool>,
    ) -> mpsc::Receiver<SqueakEntry> {
        self.entry_update_stream(stop, |_, _| true)
    }

    pub fn subscribe_squeak_entry(
        self: &Arc<Self>,
        squeak_hash: SqueakHash,
        stop: watch::Receiver<bool>,
    ) -> mpsc::Receiver<SqueakEntry> {
        self.entry_update_stream(stop, move |_, entry| entry.squeak_hash == squeak_hash)
    }

    pub fn subscribe_squeak_reply_entries(
        self: &Arc<Self>,
        squeak_hash: SqueakHash,
        stop: watch::Receiver<bool>,
    ) -> mpsc::Receiver<SqueakEntry> {
        self.entry_update_stream(stop, move |_, entry| entry.reply_to == Some(squeak_hash))
    }

    pub fn subscribe_squeak_address_entries(
        self: &Arc<Self>,
        address: Address,
        stop: watch::Receiver<bool>,
    ) -> mpsc::Receiver<SqueakEntry> {
        self.entry_update_stream(stop, move |_, entry| entry.author_address == address)
    }

    pub fn subscribe_timeline_squeak_entries(
        self: &Arc<Self>,
        stop: watch::Receiver<bool>,
    ) -> mpsc::Receiver<SqueakEntry> {
        self.entry_update_stream(stop, |_, entry| {
            entry
                .author
                .as_ref()
                .map(|profile| profile.following)
                .unwrap_or(false)
        })
    }

    /// Stream the recomputed ancestor chain whenever a member changes.
    pub fn subscribe_squeak_ancestor_entries(
        self: &Arc<Self>,
        squeak_hash: SqueakHash,
        stop: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Vec<SqueakEntry>> {
        let controller = self.clone();
        let mut events = self.events.subscribe_squeak_updates(stop);
        let (tx, rx) = mpsc::channel(ENTRY_STREAM_CAPACITY);
        tokio::spawn(async move {
            while let Some(SqueakUpdate { squeak_hash: updated }) = events.recv().await {
                let chain = match controller.get_ancestor_squeak_entries(squeak_hash) {
                    Ok(chain) => chain,
                    Err(_) => continue,
                };
                let in_chain = chain.iter().any(|e| e.squeak_hash == updated);
                if !in_chain && updated != squeak_hash {
                    continue;
                }
                if tx.send(chain).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    // ==================================================================
    // Wire-side behaviors
    // ==================================================================

    /// Our standing interest: followed addresses up to the current tip.
    fn local_subscription(&self) -> Result<SubscribeMessage> {
        let addresses: Vec<Address> = self
            .store
            .get_following_profiles()?
            .into_iter()
            .map(|p| p.address)
            .collect();
        Ok(SubscribeMessage {
            addresses,
            min_block: 0,
            max_block: self.best_block_height(),
        })
    }

    /// Re-announce our subscription to every peer; runs on each new block
    /// so the filter's max_block keeps advancing.
    pub(crate) fn update_subscriptions(&self) -> Result<()> {
        let subscription = self.local_subscription()?;
        self.network.broadcast(Message::Subscribe(subscription));
        Ok(())
    }

    /// Whether a squeak is interesting to this node right now.
    fn is_interesting(&self, squeak: &Squeak) -> Result<bool> {
        let hash = squeak.hash();
        if self.is_hash_requested(&hash) {
            return Ok(true);
        }
        if let Some(parent) = squeak.reply_to() {
            if self.is_hash_requested(&parent) {
                return Ok(true);
            }
        }
        let address = squeak.author_address(self.network_kind());
        if self.is_address_requested(&address) {
            return Ok(true);
        }
        match self.store.get_profile_by_address(&address)? {
            Some(profile) => Ok(profile.following),
            None => Ok(false),
        }
    }

    /// Validate and store a squeak arriving from a peer. Signature or
    /// anchor failures are protocol violations and close the connection;
    /// a transiently unavailable bitcoin client just drops the squeak.
    async fn handle_received_squeak(
        &self,
        peer: &Arc<PeerHandle>,
        squeak: Squeak,
    ) -> Result<()> {
        let hash = squeak.hash();
        if let Err(e) = squeak.verify() {
            warn!(squeak_hash = %hash, peer = %peer.address(), error = %e, "rejecting squeak");
            return Err(NodeError::InvalidSignature(hash.to_string()));
        }
        if !self.is_interesting(&squeak)? {
            debug!(squeak_hash = %hash, "ignoring uninteresting squeak");
            return Ok(());
        }

        let block = match self.bitcoin.get_block_info(squeak.block_height()).await {
            Ok(block) => block,
            Err(NodeError::Unavailable(reason)) => {
                warn!(squeak_hash = %hash, reason, "cannot verify block anchor, dropping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if block.hash != *squeak.block_hash() {
            warn!(squeak_hash = %hash, peer = %peer.address(), "bad block anchor");
            return Err(NodeError::InvalidBlockAnchor {
                squeak_hash: hash.to_string(),
                height: squeak.block_height(),
                block_hash: hex::encode(squeak.block_hash()),
            });
        }

        match self.insert_squeak_checked(&squeak, block.time) {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(()),
            Err(NodeError::PermissionDenied(reason)) => {
                warn!(squeak_hash = %hash, reason, "dropping squeak");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        info!(squeak_hash = %hash, peer = %peer.address(), "stored squeak");
        self.events.publish_new_squeak(squeak);
        Ok(())
    }

    async fn handle_inv(&self, peer: &Arc<PeerHandle>, invs: Vec<Inventory>) -> Result<()> {
        let mut wanted = Vec::new();
        for inv in invs {
            match inv.inv_type {
                INV_TYPE_SQUEAK => {
                    if self.store.get_squeak(inv.hash)?.is_none() {
                        wanted.push(Inventory::squeak(inv.hash));
                    }
                }
                INV_TYPE_SECRET_KEY => {
                    // a key became available upstream: fetch an offer if
                    // the squeak is still locked here
                    if self.store.get_squeak(inv.hash)?.is_some()
                        && self.store.get_squeak_secret_key(inv.hash)?.is_none()
                    {
                        peer.send(Message::GetOffer(inv.hash)).await?;
                    }
                }
                other => {
                    debug!(inv_type = other, "ignoring unknown inventory type");
                }
            }
        }
        if !wanted.is_empty() {
            peer.send(Message::GetData(wanted)).await?;
        }
        Ok(())
    }

    async fn handle_getdata(&self, peer: &Arc<PeerHandle>, invs: Vec<Inventory>) -> Result<()> {
        let mut not_found = Vec::new();
        for inv in invs {
            match inv.inv_type {
                INV_TYPE_SQUEAK => match self.store.get_squeak(inv.hash)? {
                    Some(squeak) => {
                        peer.send(Message::Squeak(squeak)).await?;
                    }
                    None => not_found.push(inv),
                },
                _ => not_found.push(inv),
            }
        }
        if !not_found.is_empty() {
            peer.send(Message::NotFound(not_found)).await?;
        }
        Ok(())
    }

    async fn handle_getoffer(&self, peer: &Arc<PeerHandle>, squeak_hash: SqueakHash) -> Result<()> {
        match self.exchange.create_offer(squeak_hash, peer.address()).await {
            Ok(offer) => peer.send(Message::Offer(offer)).await,
            Err(NodeError::NotFound(_)) | Err(NodeError::PermissionDenied(_)) => {
                peer.send(Message::NotFound(vec![Inventory::squeak(squeak_hash)]))
                    .await
            }
            Err(e) => {
                warn!(squeak_hash = %squeak_hash, error = %e, "failed to create offer");
                Ok(())
            }
        }
    }

    fn handle_offer(&self, peer: &Arc<PeerHandle>, offer: OfferMessage) -> Result<()> {
        let squeak = self
            .store
            .get_squeak(offer.squeak_hash)?
            .ok_or_else(|| NodeError::NotFound(format!("squeak {}", offer.squeak_hash)))?;
        let received = self
            .exchange
            .validate_received_offer(&squeak, &offer, peer.address())?;
        if let Some(id) = self.store.insert_received_offer(&received)? {
            let stored = ReceivedOffer {
                received_offer_id: id,
                ..received
            };
            info!(
                squeak_hash = %stored.squeak_hash,
                peer = %peer.address(),
                price_msat = stored.price_msat,
                "stored received offer"
            );
            self.events.publish_received_offer(stored);
        }
        Ok(())
    }

    async fn handle_subscribe(
        &self,
        peer: &Arc<PeerHandle>,
        subscription: SubscribeMessage,
    ) -> Result<()> {
        if subscription.addresses.is_empty() {
            return Ok(());
        }
        // answer with everything we already have that matches
        let hashes = self.store.lookup_squeaks(
            &subscription.addresses,
            Some(subscription.min_block),
            Some(subscription.max_block),
            None,
            true,
        )?;
        if !hashes.is_empty() {
            let invs: Vec<Inventory> = hashes.into_iter().map(Inventory::squeak).collect();
            peer.send(Message::Inv(invs)).await?;
        }
        Ok(())
    }

    async fn handle_getaddr(&self, peer: &Arc<PeerHandle>) -> Result<()> {
        let addresses: Vec<PeerAddress> = self
            .store
            .get_peers()?
            .into_iter()
            .map(|p| p.address)
            .take(100)
            .collect();
        peer.send(Message::Addr(addresses)).await
    }
}

#[async_trait]
impl NetworkHandler for SqueakController {
    async fn on_peer_connected(&self, peer: &Arc<PeerHandle>) -> Result<()> {
        info!(peer = %peer.address(), outbound = peer.outbound(), "peer connected");
        peer.send(Message::Subscribe(self.local_subscription()?))
            .await?;
        self.events
            .publish_peer_event(PeerEvent::Connected(peer.address().clone()));
        Ok(())
    }

    async fn on_peer_message(&self, peer: &Arc<PeerHandle>, message: Message) -> Result<()> {
        match message {
            Message::Squeak(squeak) => self.handle_received_squeak(peer, squeak).await,
            Message::Inv(invs) => self.handle_inv(peer, invs).await,
            Message::GetData(invs) => self.handle_getdata(peer, invs).await,
            Message::GetOffer(squeak_hash) => self.handle_getoffer(peer, squeak_hash).await,
            Message::Offer(offer) => match self.handle_offer(peer, offer) {
                // a missing squeak or stale offer is not the peer's fault
                Err(NodeError::NotFound(reason)) | Err(NodeError::Expired(reason)) => {
                    debug!(peer = %peer.address(), reason, "discarding offer");
                    Ok(())
                }
                Err(NodeError::PermissionDenied(reason)) => {
                    debug!(peer = %peer.address(), reason, "offer over price ceiling");
                    Ok(())
                }
                other => other,
            },
            Message::Subscribe(subscription) => self.handle_subscribe(peer, subscription).await,
            Message::GetAddr => self.handle_getaddr(peer).await,
            Message::Addr(addresses) => {
                debug!(peer = %peer.address(), count = addresses.len(), "received addresses");
                Ok(())
            }
            Message::NotFound(invs) => {
                debug!(peer = %peer.address(), count = invs.len(), "peer reported not found");
                Ok(())
            }
            // handshake and keepalive are handled by the session
            Message::Version(_) | Message::Verack | Message::Ping(_) | Message::Pong(_) => Ok(()),
        }
    }

    async fn on_peer_disconnected(&self, peer: &Arc<PeerHandle>) {
        info!(peer = %peer.address(), "peer disconnected");
        self.events
            .publish_peer_event(PeerEvent::Disconnected(peer.address().clone()));
    }
}
