//! Event bus for node-internal fan-out.
//!
//! Broadcast channels with a fixed capacity; a subscriber that falls more
//! than the capacity behind skips the oldest events instead of blocking the
//! publisher. Every subscription carries a caller-supplied stop flag and
//! unblocks within one tick of it flipping.

use tokio::sync::{broadcast, watch};

use squeak_core::{PeerAddress, Squeak, SqueakHash};

use crate::types::{ReceivedOffer, ReceivedPayment};

pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected(PeerAddress),
    Disconnected(PeerAddress),
}

/// Change notification for a stored squeak (new key, like, delete).
#[derive(Debug, Clone)]
pub struct SqueakUpdate {
    pub squeak_hash: SqueakHash,
}

pub struct EventBus {
    new_squeaks: broadcast::Sender<Squeak>,
    new_secret_keys: broadcast::Sender<SqueakHash>,
    squeak_updates: broadcast::Sender<SqueakUpdate>,
    peer_events: broadcast::Sender<PeerEvent>,
    received_payments: broadcast::Sender<ReceivedPayment>,
    received_offers: broadcast::Sender<ReceivedOffer>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            new_squeaks: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            new_secret_keys: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            squeak_updates: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            peer_events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            received_payments: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            received_offers: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }

    pub fn publish_new_squeak(&self, squeak: Squeak) {
        let hash = squeak.hash();
        let _ = self.new_squeaks.send(squeak);
        let _ = self.squeak_updates.send(SqueakUpdate { squeak_hash: hash });
    }

    pub fn publish_new_secret_key(&self, squeak_hash: SqueakHash) {
        let _ = self.new_secret_keys.send(squeak_hash);
        let _ = self.squeak_updates.send(SqueakUpdate { squeak_hash });
    }

    pub fn publish_squeak_update(&self, squeak_hash: SqueakHash) {
        let _ = self.squeak_updates.send(SqueakUpdate { squeak_hash });
    }

    pub fn publish_peer_event(&self, event: PeerEvent) {
        let _ = self.peer_events.send(event);
    }

    pub fn publish_received_payment(&self, payment: ReceivedPayment) {
        let _ = self.received_payments.send(payment);
    }

    pub fn publish_received_offer(&self, offer: ReceivedOffer) {
        let _ = self.received_offers.send(offer);
    }

    pub fn subscribe_new_squeaks(&self, stop: watch::Receiver<bool>) -> Subscription<Squeak> {
        Subscription::new(self.new_squeaks.subscribe(), stop)
    }

    pub fn subscribe_new_secret_keys(
        &self,
        stop: watch::Receiver<bool>,
    ) -> Subscription<SqueakHash> {
        Subscription::new(self.new_secret_keys.subscribe(), stop)
    }

    pub fn subscribe_squeak_updates(
        &self,
        stop: watch::Receiver<bool>,
    ) -> Subscription<SqueakUpdate> {
        Subscription::new(self.squeak_updates.subscribe(), stop)
    }

    pub fn subscribe_peer_events(&self, stop: watch::Receiver<bool>) -> Subscription<PeerEvent> {
        Subscription::new(self.peer_events.subscribe(), stop)
    }

    pub fn subscribe_received_payments(
        &self,
        stop: watch::Receiver<bool>,
    ) -> Subscription<ReceivedPayment> {
        Subscription::new(self.received_payments.subscribe(), stop)
    }

    pub fn subscribe_received_offers(
        &self,
        stop: watch::Receiver<bool>,
    ) -> Subscription<ReceivedOffer> {
        Subscription::new(self.received_offers.subscribe(), stop)
    }
}

/// A cancellable event stream. `recv` returns `None` once the stop flag
/// flips or the bus is gone; lagged events are skipped, never delivered out
/// of order.
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
    stop: watch::Receiver<bool>,
}

impl<T: Clone> Subscription<T> {
    fn new(rx: broadcast::Receiver<T>, stop: watch::Receiver<bool>) -> Self {
        Subscription { rx, stop }
    }

    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if *self.stop.borrow() {
                return None;
            }
            tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        return None;
                    }
                }
                event = self.rx.recv() => match event {
                    Ok(value) => return Some(value),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}

/// A fresh stop flag: flip with the sender, hand the receiver to
/// subscriptions.
pub fn stop_flag() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscription_receives_published_events() {
        let bus = EventBus::new();
        let (_stop_tx, stop_rx) = stop_flag();
        let mut sub = bus.subscribe_peer_events(stop_rx);
        bus.publish_peer_event(PeerEvent::Connected(PeerAddress::new("h", 1)));
        match sub.recv().await {
            Some(PeerEvent::Connected(addr)) => assert_eq!(addr.host, "h"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_flag_unblocks_receiver() {
        let bus = EventBus::new();
        let (stop_tx, stop_rx) = stop_flag();
        let mut sub = bus.subscribe_new_secret_keys(stop_rx);
        let waiter = tokio::spawn(async move { sub.recv().await });
        stop_tx.send(true).unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_but_continues() {
        let bus = EventBus::new();
        let (_stop_tx, stop_rx) = stop_flag();
        let mut sub = bus.subscribe_squeak_updates(stop_rx);
        for i in 0..(EVENT_CHANNEL_CAPACITY + 10) {
            bus.publish_squeak_update(SqueakHash::from_bytes([(i % 256) as u8; 32]));
        }
        // oldest events were dropped, but the stream still yields
        assert!(sub.recv().await.is_some());
    }
}
