//! Exchange engine tests: offer minting, validation, payment, and the
//! failure paths around a cheating or unreachable counterparty.

mod common;

use std::sync::Arc;

use squeak_core::{make_squeak, Network, OfferMessage, PeerAddress, SigningKey};
use squeaknode_core::error::NodeError;
use squeaknode_core::exchange::ExchangeEngine;
use squeaknode_core::lightning_client::LightningClient;
use squeaknode_core::store::SqueakStore;

use common::MockLightningClient;

const NET: Network = Network::Regtest;

struct Harness {
    store: Arc<SqueakStore>,
    lightning: Arc<MockLightningClient>,
    engine: ExchangeEngine,
}

fn harness(seed: u8, default_price: u64, max_price: u64) -> Harness {
    let store = Arc::new(SqueakStore::open_in_memory(NET).unwrap());
    let lightning = MockLightningClient::new(seed);
    let engine = ExchangeEngine::new(
        store.clone(),
        lightning.clone(),
        NET,
        default_price,
        max_price,
        "seller.example.com".to_string(),
    );
    Harness {
        store,
        lightning,
        engine,
    }
}

fn peer() -> PeerAddress {
    PeerAddress::new("buyer.example.com", 18666)
}

/// An unlocked squeak in the seller's store, as after make_squeak.
fn seeded_squeak(store: &SqueakStore) -> (squeak_core::Squeak, [u8; 32]) {
    let key = SigningKey::generate();
    let (squeak, secret_key) = make_squeak(&key, "for sale", 10, [10u8; 32], None, 1000).unwrap();
    store.insert_squeak(&squeak, 1000).unwrap();
    store
        .set_squeak_decryption_key(squeak.hash(), &secret_key, "for sale")
        .unwrap();
    (squeak, secret_key)
}

#[tokio::test]
async fn create_offer_mints_and_reuses_invoice() {
    let seller = harness(11, 1000, 0);
    let (squeak, _) = seeded_squeak(&seller.store);

    let offer = seller.engine.create_offer(squeak.hash(), &peer()).await.unwrap();
    assert_eq!(offer.price_msat, 1000);
    assert_eq!(offer.squeak_hash, squeak.hash());

    // a second getoffer from the same peer reuses the same invoice
    let again = seller.engine.create_offer(squeak.hash(), &peer()).await.unwrap();
    assert_eq!(again.payment_request, offer.payment_request);
    assert_eq!(seller.store.get_sent_offers().unwrap().len(), 1);

    // a different peer gets a fresh invoice
    let other = seller
        .engine
        .create_offer(squeak.hash(), &PeerAddress::new("other.example.com", 1))
        .await
        .unwrap();
    assert_ne!(other.payment_request, offer.payment_request);
    assert_eq!(seller.store.get_sent_offers().unwrap().len(), 2);
}

#[tokio::test]
async fn create_offer_requires_secret_key() {
    let seller = harness(12, 1000, 0);
    let key = SigningKey::generate();
    let (squeak, _) = make_squeak(&key, "locked", 10, [10u8; 32], None, 1000).unwrap();
    seller.store.insert_squeak(&squeak, 1000).unwrap();

    let err = seller
        .engine
        .create_offer(squeak.hash(), &peer())
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::PermissionDenied(_)));
}

#[tokio::test]
async fn custom_profile_price_is_used() {
    let seller = harness(13, 1000, 0);
    let key = SigningKey::generate();
    let (squeak, secret_key) = make_squeak(&key, "priced", 10, [10u8; 32], None, 1000).unwrap();
    seller.store.insert_squeak(&squeak, 1000).unwrap();
    seller
        .store
        .set_squeak_decryption_key(squeak.hash(), &secret_key, "priced")
        .unwrap();
    let profile_id = seller
        .store
        .insert_profile("author", None, &key.verifying_key().address(NET), true)
        .unwrap();
    seller.store.set_profile_use_custom_price(profile_id, true).unwrap();
    seller.store.set_profile_custom_price_msat(profile_id, 250).unwrap();

    let offer = seller.engine.create_offer(squeak.hash(), &peer()).await.unwrap();
    assert_eq!(offer.price_msat, 250);
}

/// Full happy path between a seller engine and a buyer engine linked
/// through the mock lightning channel.
#[tokio::test]
async fn paid_unlock_happy_path() {
    let seller = harness(21, 1000, 0);
    let buyer = harness(22, 1000, 0);
    MockLightningClient::link(&seller.lightning, &buyer.lightning);

    let (squeak, _) = seeded_squeak(&seller.store);
    // the buyer has the ciphertext but no key
    buyer.store.insert_squeak(&squeak, 1000).unwrap();

    let offer_msg = seller.engine.create_offer(squeak.hash(), &peer()).await.unwrap();
    let received = buyer
        .engine
        .validate_received_offer(&squeak, &offer_msg, &peer())
        .unwrap();
    buyer.store.insert_received_offer(&received).unwrap();

    // the seller's invoice worker: settle once the HTLC is accepted
    let seller_engine_store = seller.store.clone();
    let seller_lightning = seller.lightning.clone();
    let settle_task = tokio::spawn(async move {
        let engine = ExchangeEngine::new(
            seller_engine_store,
            seller_lightning.clone(),
            NET,
            1000,
            0,
            "seller.example.com".to_string(),
        );
        let (_tx, stop) = tokio::sync::watch::channel(false);
        let mut updates = seller_lightning.subscribe_invoices(0, stop).await.unwrap();
        while let Some(update) = updates.recv().await {
            if let Some(payment) = engine.handle_invoice_update(update).await.unwrap() {
                return payment;
            }
        }
        panic!("no received payment");
    });

    // let the settle task open its invoice subscription first
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let payment = buyer.engine.pay_offer(&received).await.unwrap();
    assert!(payment.valid);
    assert_eq!(payment.price_msat, 1000);

    // buyer side: squeak is unlocked and the offer is marked paid
    let entry = buyer.store.get_squeak_entry(squeak.hash()).unwrap().unwrap();
    assert!(entry.is_unlocked());
    assert_eq!(entry.content.as_deref(), Some("for sale"));
    assert_eq!(buyer.store.get_sent_payments(10, None).unwrap().len(), 1);

    // seller side: received payment recorded with the asking price
    let received_payment =
        tokio::time::timeout(std::time::Duration::from_secs(5), settle_task)
            .await
            .unwrap()
            .unwrap();
    assert_eq!(received_payment.price_msat, 1000);
    assert!(received_payment.settle_index > 0);
    let summary = seller.store.get_received_payment_summary().unwrap();
    assert_eq!(summary.num_received_payments, 1);
}

#[tokio::test]
async fn cheating_offer_is_rejected_before_payment() {
    let seller = harness(31, 1000, 0);
    let buyer = harness(32, 1000, 0);
    MockLightningClient::link(&seller.lightning, &buyer.lightning);

    let (squeak, _) = seeded_squeak(&seller.store);
    buyer.store.insert_squeak(&squeak, 1000).unwrap();

    let mut offer_msg = seller.engine.create_offer(squeak.hash(), &peer()).await.unwrap();
    // tamper: claim a payment point that does not commit to the real key
    offer_msg.payment_point = squeak_core::payment_point(&[9u8; 32]).unwrap();

    let err = buyer
        .engine
        .validate_received_offer(&squeak, &offer_msg, &peer())
        .unwrap_err();
    assert!(matches!(err, NodeError::KeyMismatch(_)));
    assert_eq!(buyer.lightning.payments_attempted(), 0);
}

#[tokio::test]
async fn price_ceiling_rejects_expensive_offers() {
    let seller = harness(41, 50_000, 0);
    let buyer = harness(42, 1000, 10_000);
    MockLightningClient::link(&seller.lightning, &buyer.lightning);

    let (squeak, _) = seeded_squeak(&seller.store);
    buyer.store.insert_squeak(&squeak, 1000).unwrap();

    let offer_msg = seller.engine.create_offer(squeak.hash(), &peer()).await.unwrap();
    let err = buyer
        .engine
        .validate_received_offer(&squeak, &offer_msg, &peer())
        .unwrap_err();
    assert!(matches!(err, NodeError::PermissionDenied(_)));
}

#[tokio::test]
async fn mismatched_invoice_amount_is_rejected() {
    let seller = harness(51, 1000, 0);
    let buyer = harness(52, 1000, 0);
    let (squeak, _) = seeded_squeak(&seller.store);
    buyer.store.insert_squeak(&squeak, 1000).unwrap();

    let mut offer_msg = seller.engine.create_offer(squeak.hash(), &peer()).await.unwrap();
    // advertised price disagrees with the signed invoice
    offer_msg.price_msat = 1;

    let err = buyer
        .engine
        .validate_received_offer(&squeak, &offer_msg, &peer())
        .unwrap_err();
    assert!(matches!(err, NodeError::ProtocolViolation { .. }));
}

#[tokio::test]
async fn failed_payment_records_invalid_sent_payment() {
    let seller = harness(61, 1000, 0);
    let buyer = harness(62, 1000, 0);
    MockLightningClient::link(&seller.lightning, &buyer.lightning);

    let (squeak, _) = seeded_squeak(&seller.store);
    buyer.store.insert_squeak(&squeak, 1000).unwrap();

    let offer_msg = seller.engine.create_offer(squeak.hash(), &peer()).await.unwrap();
    let received = buyer
        .engine
        .validate_received_offer(&squeak, &offer_msg, &peer())
        .unwrap();
    buyer.store.insert_received_offer(&received).unwrap();

    buyer.lightning.fail_next_payments(1);
    let err = buyer.engine.pay_offer(&received).await.unwrap_err();
    assert!(matches!(err, NodeError::PaymentFailed(_)));

    // the failure left a ledger row and no key
    let payments = buyer.store.get_sent_payments(10, None).unwrap();
    assert_eq!(payments.len(), 1);
    assert!(!payments[0].valid);
    let entry = buyer.store.get_squeak_entry(squeak.hash()).unwrap().unwrap();
    assert!(!entry.is_unlocked());
}

#[tokio::test]
async fn expired_offer_is_filtered_and_swept() {
    let seller = harness(71, 1000, 0);
    let buyer = harness(72, 1000, 0);
    let (squeak, _) = seeded_squeak(&seller.store);
    buyer.store.insert_squeak(&squeak, 1000).unwrap();

    let offer_msg = seller.engine.create_offer(squeak.hash(), &peer()).await.unwrap();
    let mut received = buyer
        .engine
        .validate_received_offer(&squeak, &offer_msg, &peer())
        .unwrap();
    // age the invoice past its expiry
    received.invoice_timestamp = squeaknode_core::now_s() - received.invoice_expiry - 10;
    buyer.store.insert_received_offer(&received).unwrap();

    assert!(buyer.store.get_received_offers(squeak.hash()).unwrap().is_empty());
    assert_eq!(buyer.store.delete_expired_received_offers().unwrap(), 1);

    let err = buyer.engine.pay_offer(&received).await.unwrap_err();
    assert!(matches!(err, NodeError::Expired(_)));
}

#[tokio::test]
async fn offer_for_wrong_squeak_is_rejected() {
    let seller = harness(81, 1000, 0);
    let buyer = harness(82, 1000, 0);
    let (squeak, _) = seeded_squeak(&seller.store);
    let key = SigningKey::generate();
    let (other_squeak, _) = make_squeak(&key, "other", 10, [10u8; 32], None, 1).unwrap();
    buyer.store.insert_squeak(&squeak, 1000).unwrap();

    let offer_msg: OfferMessage = seller.engine.create_offer(squeak.hash(), &peer()).await.unwrap();
    let err = buyer
        .engine
        .validate_received_offer(&other_squeak, &offer_msg, &peer())
        .unwrap_err();
    assert!(matches!(err, NodeError::ProtocolViolation { .. }));
}
