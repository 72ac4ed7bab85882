//! End-to-end node tests: two controllers wired through real TCP sessions
//! with mock chain and lightning adapters.

mod common;

use std::sync::Arc;
use std::time::Duration;

use squeak_core::{Network, PeerAddress};
use squeaknode_core::network::NetworkManager;
use squeaknode_core::store::SqueakStore;
use squeaknode_core::{Config, SqueakController};

use common::{MockBitcoinClient, MockLightningClient};

const NET: Network = Network::Regtest;

struct TestNode {
    controller: Arc<SqueakController>,
    lightning: Arc<MockLightningClient>,
    address: PeerAddress,
}

async fn start_node(
    bitcoin: &Arc<MockBitcoinClient>,
    lightning_seed: u8,
    price_msat: u64,
) -> TestNode {
    let mut config = Config::parse("").unwrap();
    config.network.name = NET;
    config.node.peer_port = Some(0);
    config.node.price_msat = price_msat;
    config.node.offer_deletion_interval_s = 1;
    config.node.squeak_deletion_interval_s = 3600;

    let store = Arc::new(SqueakStore::open_in_memory(NET).unwrap());
    let lightning = MockLightningClient::new(lightning_seed);
    let network_manager = NetworkManager::new(NET, config.node.max_peers);
    let controller = SqueakController::new(
        config,
        store,
        bitcoin.clone(),
        lightning.clone(),
        network_manager,
    );
    let bound = controller.start().await.unwrap();
    TestNode {
        controller,
        lightning,
        address: PeerAddress::new("127.0.0.1", bound.port()),
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..300 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn connect(a: &TestNode, b: &TestNode) {
    a.controller.connect_peer(&b.address).await.unwrap();
    wait_until("nodes to connect", || {
        a.controller
            .get_connected_peers()
            .map(|p| !p.is_empty())
            .unwrap_or(false)
            && b.controller
                .get_connected_peers()
                .map(|p| !p.is_empty())
                .unwrap_or(false)
    })
    .await;
    // give the subscribe handshake a moment to land on both sides
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Local make and fetch: a signing profile's own squeak is stored
/// unlocked.
#[tokio::test]
async fn make_and_fetch_own_squeak() {
    let bitcoin = MockBitcoinClient::with_tip(5);
    let node = start_node(&bitcoin, 1, 1000).await;

    let profile_id = node.controller.create_signing_profile("alice").unwrap();
    let hash = node
        .controller
        .make_squeak(profile_id, "hello!", None)
        .await
        .unwrap();

    let entry = node.controller.get_squeak_entry(hash).unwrap().unwrap();
    assert!(entry.is_unlocked());
    assert_eq!(entry.content.as_deref(), Some("hello!"));
    assert_eq!(entry.block_height, 5);
    assert_eq!(
        entry.author.as_ref().map(|p| p.profile_name.as_str()),
        Some("alice")
    );

    let timeline = node.controller.get_timeline_squeak_entries(10, None).unwrap();
    assert_eq!(timeline.len(), 1);

    node.controller.stop();
}

/// Subscribe and forward: a followed author's squeak published on one
/// node reaches a connected follower.
#[tokio::test]
async fn squeak_is_forwarded_to_subscribed_peer() {
    let bitcoin = MockBitcoinClient::with_tip(5);
    let node_a = start_node(&bitcoin, 2, 1000).await;
    let node_b = start_node(&bitcoin, 3, 1000).await;

    // author X lives on node B; node A follows X
    let profile_id = node_b.controller.create_signing_profile("author-x").unwrap();
    let profile = node_b
        .controller
        .get_squeak_profile(profile_id)
        .unwrap()
        .unwrap();
    node_a
        .controller
        .create_contact_profile("x", &profile.address)
        .unwrap();

    connect(&node_a, &node_b).await;

    let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let mut new_squeaks = node_a.controller.subscribe_new_squeaks(stop_rx);

    let hash = node_b
        .controller
        .make_squeak(profile_id, "fresh squeak", None)
        .await
        .unwrap();

    let arrived = tokio::time::timeout(Duration::from_secs(2), new_squeaks.recv())
        .await
        .expect("squeak did not arrive within 2s")
        .expect("subscription closed");
    assert_eq!(arrived.hash(), hash);

    let timeline = node_a.controller.get_timeline_squeak_entries(10, None).unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].squeak_hash, hash);
    // the ciphertext traveled, the key did not
    assert!(!timeline[0].is_unlocked());

    node_a.controller.stop();
    node_b.controller.stop();
}

/// Paid unlock happy path across two live nodes, plus resale: a third
/// follower hears the new-key announcement and receives an offer from
/// the fresh unlocker.
#[tokio::test]
async fn paid_unlock_over_the_wire() {
    let bitcoin = MockBitcoinClient::with_tip(5);
    let node_a = start_node(&bitcoin, 4, 1000).await;
    let node_b = start_node(&bitcoin, 5, 1000).await;
    let node_c = start_node(&bitcoin, 6, 1000).await;
    MockLightningClient::link(&node_a.lightning, &node_b.lightning);

    let profile_id = node_b.controller.create_signing_profile("seller").unwrap();
    let profile = node_b
        .controller
        .get_squeak_profile(profile_id)
        .unwrap()
        .unwrap();
    node_a
        .controller
        .create_contact_profile("seller", &profile.address)
        .unwrap();
    node_c
        .controller
        .create_contact_profile("seller", &profile.address)
        .unwrap();

    connect(&node_a, &node_b).await;
    connect(&node_c, &node_a).await;

    let hash = node_b
        .controller
        .make_squeak(profile_id, "secret wisdom", None)
        .await
        .unwrap();

    // the ciphertext replicates to A, locked
    wait_until("squeak to replicate", || {
        node_a
            .controller
            .get_squeak_entry(hash)
            .map(|e| e.is_some())
            .unwrap_or(false)
    })
    .await;
    assert!(!node_a
        .controller
        .get_squeak_entry(hash)
        .unwrap()
        .unwrap()
        .is_unlocked());
    wait_until("squeak to replicate to node C", || {
        node_c
            .controller
            .get_squeak_entry(hash)
            .map(|e| e.is_some())
            .unwrap_or(false)
    })
    .await;

    // buy the key
    node_a.controller.download_offers(hash).unwrap();
    wait_until("offer to arrive", || {
        node_a
            .controller
            .get_received_offers(hash)
            .map(|o| !o.is_empty())
            .unwrap_or(false)
    })
    .await;
    let offers = node_a.controller.get_received_offers(hash).unwrap();
    assert_eq!(offers[0].price_msat, 1000);

    let payment = node_a
        .controller
        .pay_offer(offers[0].received_offer_id)
        .await
        .unwrap();
    assert!(payment.valid);
    assert_eq!(payment.price_msat, 1000);

    let entry = node_a.controller.get_squeak_entry(hash).unwrap().unwrap();
    assert!(entry.is_unlocked());
    assert_eq!(entry.content.as_deref(), Some("secret wisdom"));

    let sent = node_a.controller.get_sent_payments(10, None).unwrap();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].valid);
    assert_eq!(sent[0].price_msat, 1000);

    // seller records the received payment via its invoice worker
    wait_until("received payment to be recorded", || {
        node_b
            .controller
            .get_received_payments(10, None)
            .map(|p| p.len() == 1)
            .unwrap_or(false)
    })
    .await;
    let received = node_b.controller.get_received_payments(10, None).unwrap();
    assert_eq!(received[0].price_msat, 1000);

    // resale: node C held the ciphertext, hears A's new-key inv, asks A
    // for an offer, and stores it after validation
    wait_until("resale offer to reach node C", || {
        node_c
            .controller
            .get_received_offers(hash)
            .map(|o| !o.is_empty())
            .unwrap_or(false)
    })
    .await;
    let resale = node_c.controller.get_received_offers(hash).unwrap();
    assert_eq!(resale[0].price_msat, 1000);
    assert!(!resale[0].paid);

    node_a.controller.stop();
    node_b.controller.stop();
    node_c.controller.stop();
}

/// A duplicate squeak import is an idempotent no-op.
#[tokio::test]
async fn duplicate_squeak_import_is_idempotent() {
    let key = squeak_core::SigningKey::generate();
    let (squeak, _) =
        squeak_core::make_squeak(&key, "dup", 3, common::mock_block_hash(3), None, 1000).unwrap();

    let store = Arc::new(SqueakStore::open_in_memory(NET).unwrap());
    assert!(store.insert_squeak(&squeak, 1000).unwrap().is_some());
    assert!(store.insert_squeak(&squeak, 1000).unwrap().is_none());
    assert_eq!(store.get_number_of_squeaks().unwrap(), 1);
    assert!(store.get_squeak_entry(squeak.hash()).unwrap().is_some());
}
