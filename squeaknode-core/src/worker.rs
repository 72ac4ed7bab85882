//! Periodic and event-driven workers.
//!
//! Every worker is a tokio task driven by the controller's shared stop
//! flag; no task is spawned from inside a message handler. Periodic
//! workers tick at their configured interval, event workers drain a bus
//! subscription, and the payment processor owns the lnd invoice stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use squeak_core::{Inventory, Message, PeerAddress};

use crate::bitcoin_client::spawn_block_watcher;
use crate::controller::SqueakController;
use crate::now_s;

/// How often the autoconnect worker looks for peers to redial.
const PEER_CONNECT_INTERVAL: Duration = Duration::from_secs(10);
/// Reconnect backoff bounds.
const BACKOFF_INITIAL_S: u64 = 1;
const BACKOFF_CAP_S: u64 = 60;
/// Poll interval of the chain-tip watcher.
const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) fn spawn_all(controller: &Arc<SqueakController>) {
    spawn_offer_expiry_worker(controller.clone());
    spawn_squeak_deletion_worker(controller.clone());
    spawn_peer_connect_worker(controller.clone());
    spawn_payment_processor(controller.clone());
    spawn_new_squeak_forwarder(controller.clone());
    spawn_secret_key_forwarder(controller.clone());
    spawn_block_forwarder(controller.clone());
}

async fn tick(interval: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        changed = stop.changed() => !(changed.is_err() || *stop.borrow()),
    }
}

fn spawn_offer_expiry_worker(controller: Arc<SqueakController>) {
    let interval = Duration::from_secs(controller.config().node.offer_deletion_interval_s);
    let mut stop = controller.stop_signal();
    tokio::spawn(async move {
        debug!("offer expiry worker started");
        while tick(interval, &mut stop).await {
            if let Err(e) = controller.delete_expired_offers().await {
                error!(error = %e, "offer expiry sweep failed");
            }
        }
    });
}

fn spawn_squeak_deletion_worker(controller: Arc<SqueakController>) {
    let interval = Duration::from_secs(controller.config().node.squeak_deletion_interval_s);
    let mut stop = controller.stop_signal();
    tokio::spawn(async move {
        debug!("squeak retention worker started");
        while tick(interval, &mut stop).await {
            if let Err(e) = controller.delete_old_squeaks() {
                error!(error = %e, "squeak retention sweep failed");
            }
        }
    });
}

/// Redial saved autoconnect peers, with per-peer exponential backoff
/// (initial 1 s, cap 60 s, reset once connected).
fn spawn_peer_connect_worker(controller: Arc<SqueakController>) {
    let mut stop = controller.stop_signal();
    tokio::spawn(async move {
        debug!("peer connect worker started");
        let mut backoff: HashMap<PeerAddress, (u64, u64)> = HashMap::new(); // (delay_s, not_before)
        while tick(PEER_CONNECT_INTERVAL, &mut stop).await {
            let peers = match controller.get_peers() {
                Ok(peers) => peers,
                Err(e) => {
                    error!(error = %e, "cannot list peers for autoconnect");
                    continue;
                }
            };
            for peer in peers.into_iter().filter(|p| p.autoconnect) {
                if controller
                    .get_connected_peer(&peer.address)
                    .ok()
                    .flatten()
                    .is_some()
                {
                    backoff.remove(&peer.address);
                    continue;
                }
                let now = now_s();
                let (delay, not_before) = *backoff
                    .entry(peer.address.clone())
                    .or_insert((BACKOFF_INITIAL_S, 0));
                if now < not_before {
                    continue;
                }
                match controller.connect_peer(&peer.address).await {
                    Ok(()) => {
                        debug!(peer = %peer.address, "autoconnect dialed");
                        backoff.remove(&peer.address);
                    }
                    Err(e) => {
                        debug!(peer = %peer.address, error = %e, "autoconnect failed");
                        backoff.insert(
                            peer.address.clone(),
                            ((delay * 2).min(BACKOFF_CAP_S), now + delay),
                        );
                    }
                }
            }
        }
    });
}

/// Drive the lnd invoice subscription: settle accepted hold invoices and
/// record settled payments. Restarts the stream with bounded retry delay
/// when it drops, and immediately on a replay request.
fn spawn_payment_processor(controller: Arc<SqueakController>) {
    let retry = Duration::from_secs(controller.config().node.subscribe_invoices_retry_s);
    let mut stop = controller.stop_signal();
    tokio::spawn(async move {
        debug!("payment processor started");
        loop {
            if *stop.borrow() {
                return;
            }
            let start_index = match controller.store().get_latest_settle_index() {
                Ok(index) => index,
                Err(e) => {
                    error!(error = %e, "cannot read settle index");
                    0
                }
            };
            let mut updates = match controller
                .lightning()
                .subscribe_invoices(start_index, stop.clone())
                .await
            {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "invoice subscription unavailable, retrying");
                    if !tick(retry, &mut stop).await {
                        return;
                    }
                    continue;
                }
            };
            info!(start_index, "invoice subscription open");
            loop {
                let update = tokio::select! {
                    update = updates.recv() => update,
                    _ = controller.payment_replay().notified() => {
                        info!("replaying received payments from the start");
                        break;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return;
                        }
                        continue;
                    }
                };
                let Some(update) = update else {
                    warn!("invoice subscription closed");
                    if !tick(retry, &mut stop).await {
                        return;
                    }
                    break;
                };
                match controller.exchange().handle_invoice_update(update).await {
                    Ok(Some(payment)) => {
                        controller.events().publish_received_payment(payment);
                    }
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "invoice update failed"),
                }
            }
        }
    });
}

/// Announce newly stored squeaks to peers whose subscription matches.
fn spawn_new_squeak_forwarder(controller: Arc<SqueakController>) {
    let stop = controller.stop_signal();
    let mut squeaks = controller.events().subscribe_new_squeaks(stop);
    tokio::spawn(async move {
        debug!("new squeak forwarder started");
        while let Some(squeak) = squeaks.recv().await {
            let hash = squeak.hash();
            let address = squeak.author_address(controller.get_network());
            let inv = Message::Inv(vec![Inventory::squeak(hash)]);
            for peer in controller.network_manager().connected_handles() {
                if peer.is_remote_subscribed(&address, squeak.block_height()) {
                    debug!(squeak_hash = %hash, peer = %peer.address(), "forwarding squeak");
                    peer.try_send(inv.clone());
                }
            }
        }
    });
}

/// Announce newly learned secret keys so peers can come buy them.
fn spawn_secret_key_forwarder(controller: Arc<SqueakController>) {
    let stop = controller.stop_signal();
    let mut keys = controller.events().subscribe_new_secret_keys(stop);
    tokio::spawn(async move {
        debug!("secret key forwarder started");
        while let Some(squeak_hash) = keys.recv().await {
            let squeak = match controller.get_squeak(squeak_hash) {
                Ok(Some(squeak)) => squeak,
                _ => continue,
            };
            let address = squeak.author_address(controller.get_network());
            let inv = Message::Inv(vec![Inventory::secret_key(squeak_hash)]);
            for peer in controller.network_manager().connected_handles() {
                if peer.is_remote_subscribed(&address, squeak.block_height()) {
                    peer.try_send(inv.clone());
                }
            }
        }
    });
}

/// Track the chain tip and refresh peer subscriptions as it advances.
fn spawn_block_forwarder(controller: Arc<SqueakController>) {
    let stop = controller.stop_signal();
    let mut tips = spawn_block_watcher(controller.bitcoin().clone(), BLOCK_POLL_INTERVAL, stop);
    tokio::spawn(async move {
        debug!("block forwarder started");
        while let Some(tip) = tips.recv().await {
            info!(height = tip.height, "chain tip advanced");
            controller.set_best_block_height(tip.height);
            if let Err(e) = controller.update_subscriptions() {
                error!(error = %e, "failed to refresh peer subscriptions");
            }
        }
    });
}
