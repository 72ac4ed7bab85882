//! The paid-unlock exchange engine.
//!
//! Sell side: mint offers against locally-unlocked squeaks, one hold
//! invoice per (squeak, peer), settle with the preimage when the buyer's
//! payment is accepted. Buy side: validate peer offers against the squeak's
//! embedded payment point before any money moves, then pay and recover the
//! content key from the preimage.

use std::str::FromStr;
use std::sync::Arc;

use lightning_invoice::{Bolt11Invoice, Currency};
use tracing::{debug, info, warn};

use squeak_core::payment::{
    expected_offer_point, generate_nonce, payment_hash, payment_point_for_offer, payment_preimage,
    secret_key_from_preimage,
};
use squeak_core::{Network, OfferMessage, PeerAddress, Squeak, SqueakHash};

use crate::error::{NodeError, Result};
use crate::lightning_client::{InvoiceState, InvoiceUpdate, LightningClient};
use crate::now_s;
use crate::store::SqueakStore;
use crate::types::{ReceivedOffer, ReceivedPayment, SentOffer, SentPayment};

/// Expiry for hold invoices backing sent offers.
pub const SENT_OFFER_INVOICE_EXPIRY_S: u64 = 3600;
/// Conventional lightning p2p port, advertised in offers.
const LIGHTNING_P2P_PORT: u16 = 9735;

pub struct ExchangeEngine {
    store: Arc<SqueakStore>,
    lightning: Arc<dyn LightningClient>,
    network: Network,
    default_price_msat: u64,
    /// Ceiling on offers we will accept; 0 disables the check.
    max_offer_price_msat: u64,
    /// Lightning endpoint advertised to buyers.
    lightning_host: String,
    node_pubkey: tokio::sync::OnceCell<String>,
}

impl ExchangeEngine {
    pub fn new(
        store: Arc<SqueakStore>,
        lightning: Arc<dyn LightningClient>,
        network: Network,
        default_price_msat: u64,
        max_offer_price_msat: u64,
        lightning_host: String,
    ) -> Self {
        ExchangeEngine {
            store,
            lightning,
            network,
            default_price_msat,
            max_offer_price_msat,
            lightning_host,
            node_pubkey: tokio::sync::OnceCell::new(),
        }
    }

    async fn node_pubkey(&self) -> Result<[u8; 33]> {
        let hex_key = self
            .node_pubkey
            .get_or_try_init(|| async {
                self.lightning.get_info().await.map(|i| i.identity_pubkey)
            })
            .await?;
        let bytes = hex::decode(hex_key)
            .map_err(|e| NodeError::Unavailable(format!("bad lightning pubkey: {e}")))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| NodeError::Unavailable("lightning pubkey is not 33 bytes".to_string()))
    }

    /// The asking price for a squeak: the author profile's custom price
    /// when enabled, the node-wide default otherwise.
    pub fn price_for_squeak(&self, squeak: &Squeak) -> Result<u64> {
        let address = squeak.author_address(self.network);
        match self.store.get_profile_by_address(&address)? {
            Some(profile) if profile.use_custom_price => Ok(profile.custom_price_msat),
            _ => Ok(self.default_price_msat),
        }
    }

    // ------------------------------------------------------------------
    // Sell path
    // ------------------------------------------------------------------

    /// Answer a `getoffer`: reuse the unexpired offer already minted for
    /// this peer, or create a fresh hold invoice and persist a sent offer.
    /// Fails with `PermissionDenied` when the squeak is still locked here.
    pub async fn create_offer(
        &self,
        squeak_hash: SqueakHash,
        peer_address: &PeerAddress,
    ) -> Result<OfferMessage> {
        let squeak = self
            .store
            .get_squeak(squeak_hash)?
            .ok_or_else(|| NodeError::NotFound(format!("squeak {squeak_hash}")))?;
        let secret_key = self
            .store
            .get_squeak_secret_key(squeak_hash)?
            .ok_or_else(|| {
                NodeError::PermissionDenied(format!("squeak {squeak_hash} has no secret key"))
            })?;

        if let Some(existing) = self
            .store
            .get_sent_offer_for_squeak_and_peer(squeak_hash, peer_address)?
        {
            debug!(squeak_hash = %squeak_hash, peer = %peer_address, "reusing sent offer");
            return self.offer_message_for(&existing).await;
        }

        let price_msat = self.price_for_squeak(&squeak)?;
        let nonce = generate_nonce();
        let preimage_hash = payment_hash(&secret_key, &nonce);
        let payment_request = self
            .lightning
            .add_hold_invoice(
                &preimage_hash,
                price_msat,
                SENT_OFFER_INVOICE_EXPIRY_S,
                &format!("squeak {}", squeak_hash.display_hex()),
            )
            .await?;

        let invoice = Bolt11Invoice::from_str(&payment_request).map_err(|e| {
            NodeError::InvoiceCreateFailed(format!("lightning returned a bad invoice: {e}"))
        })?;
        let sent_offer = SentOffer {
            sent_offer_id: 0,
            created_time_ms: 0,
            squeak_hash,
            payment_hash: preimage_hash,
            secret_key,
            nonce,
            price_msat,
            payment_request,
            invoice_timestamp: invoice.duration_since_epoch().as_secs(),
            invoice_expiry: invoice.expiry_time().as_secs(),
            peer_address: peer_address.clone(),
            paid: false,
        };
        self.store.insert_sent_offer(&sent_offer)?;
        info!(
            squeak_hash = %squeak_hash,
            peer = %peer_address,
            price_msat,
            payment_hash = %hex::encode(preimage_hash),
            "minted offer"
        );
        self.offer_message_for(&sent_offer).await
    }

    async fn offer_message_for(&self, offer: &SentOffer) -> Result<OfferMessage> {
        Ok(OfferMessage {
            squeak_hash: offer.squeak_hash,
            nonce: offer.nonce,
            payment_point: payment_point_for_offer(&offer.secret_key, &offer.nonce)?,
            payment_request: offer.payment_request.clone(),
            host: self.lightning_host.clone(),
            port: LIGHTNING_P2P_PORT,
            destination: self.node_pubkey().await?,
            price_msat: offer.price_msat,
        })
    }

    /// React to an invoice state change from the lightning node. Returns
    /// the received payment when one was recorded.
    pub async fn handle_invoice_update(
        &self,
        update: InvoiceUpdate,
    ) -> Result<Option<ReceivedPayment>> {
        let Some(offer) = self
            .store
            .get_sent_offer_by_payment_hash(&update.payment_hash)?
        else {
            return Ok(None);
        };
        match update.state {
            InvoiceState::Open | InvoiceState::Canceled => Ok(None),
            InvoiceState::Accepted => {
                let preimage = payment_preimage(&offer.secret_key, &offer.nonce);
                self.lightning.settle_hold_invoice(&preimage).await?;
                info!(
                    payment_hash = %hex::encode(update.payment_hash),
                    squeak_hash = %offer.squeak_hash,
                    "settled hold invoice"
                );
                Ok(None)
            }
            InvoiceState::Settled => {
                self.store.set_sent_offer_paid(&update.payment_hash, true)?;
                let payment = ReceivedPayment {
                    received_payment_id: 0,
                    created_time_ms: 0,
                    squeak_hash: offer.squeak_hash,
                    payment_hash: update.payment_hash,
                    price_msat: offer.price_msat,
                    settle_index: update.settle_index,
                    peer_address: offer.peer_address.clone(),
                };
                match self.store.insert_received_payment(&payment)? {
                    Some(id) => {
                        info!(
                            payment_hash = %hex::encode(update.payment_hash),
                            price_msat = offer.price_msat,
                            "received payment"
                        );
                        Ok(Some(ReceivedPayment {
                            received_payment_id: id,
                            ..payment
                        }))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Cancel the hold invoices behind swept sent offers.
    pub async fn cancel_expired_sent_offers(&self, grace_s: u64) -> Result<usize> {
        let payment_hashes = self.store.delete_expired_sent_offers(grace_s)?;
        let count = payment_hashes.len();
        for hash in payment_hashes {
            if let Err(e) = self.lightning.cancel_hold_invoice(&hash).await {
                warn!(payment_hash = %hex::encode(hash), error = %e, "failed to cancel hold invoice");
            }
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Buy path
    // ------------------------------------------------------------------

    /// Validate a peer's offer before storing it. An offer is acceptable
    /// when its invoice is current, the invoice amount equals the offered
    /// price, and the payment point equals `squeak.payment_point + n·G` so
    /// that the preimage is guaranteed to reveal the content key.
    pub fn validate_received_offer(
        &self,
        squeak: &Squeak,
        offer: &OfferMessage,
        peer_address: &PeerAddress,
    ) -> Result<ReceivedOffer> {
        let squeak_hash = squeak.hash();
        if offer.squeak_hash != squeak_hash {
            return Err(NodeError::ProtocolViolation {
                peer: peer_address.to_string(),
                reason: "offer for a different squeak".to_string(),
            });
        }

        let expected = expected_offer_point(squeak.payment_point(), &offer.nonce)?;
        if expected != offer.payment_point {
            return Err(NodeError::KeyMismatch(squeak_hash.to_string()));
        }

        let invoice = Bolt11Invoice::from_str(&offer.payment_request).map_err(|e| {
            NodeError::ProtocolViolation {
                peer: peer_address.to_string(),
                reason: format!("unparseable invoice: {e}"),
            }
        })?;
        if invoice.currency() != currency_for(self.network) {
            return Err(NodeError::ProtocolViolation {
                peer: peer_address.to_string(),
                reason: "invoice for the wrong network".to_string(),
            });
        }
        let invoice_amount = invoice.amount_milli_satoshis().unwrap_or(0);
        if invoice_amount != offer.price_msat {
            return Err(NodeError::ProtocolViolation {
                peer: peer_address.to_string(),
                reason: format!(
                    "invoice amount {invoice_amount} msat does not match offered price {}",
                    offer.price_msat
                ),
            });
        }
        let payee = invoice.recover_payee_pub_key().serialize();
        if payee != offer.destination {
            return Err(NodeError::ProtocolViolation {
                peer: peer_address.to_string(),
                reason: "invoice payee does not match offer destination".to_string(),
            });
        }

        let invoice_timestamp = invoice.duration_since_epoch().as_secs();
        let invoice_expiry = invoice.expiry_time().as_secs();
        if now_s() >= invoice_timestamp + invoice_expiry {
            return Err(NodeError::Expired(format!(
                "offer for squeak {squeak_hash}"
            )));
        }

        if self.max_offer_price_msat > 0 && offer.price_msat > self.max_offer_price_msat {
            return Err(NodeError::PermissionDenied(format!(
                "offer price {} msat exceeds ceiling {}",
                offer.price_msat, self.max_offer_price_msat
            )));
        }

        let mut payment_hash = [0u8; 32];
        payment_hash.copy_from_slice(invoice.payment_hash().as_ref());

        Ok(ReceivedOffer {
            received_offer_id: 0,
            created_time_ms: 0,
            squeak_hash,
            payment_hash,
            nonce: offer.nonce,
            payment_point: offer.payment_point,
            invoice_timestamp,
            invoice_expiry,
            price_msat: offer.price_msat,
            payment_request: offer.payment_request.clone(),
            destination: hex::encode(offer.destination),
            lightning_address: PeerAddress::new(offer.host.clone(), offer.port),
            peer_address: peer_address.clone(),
            paid: false,
        })
    }

    /// Pay a stored offer. On success the squeak's key and plaintext are
    /// persisted atomically and a valid sent payment is recorded; a
    /// settled payment that reveals a bogus key records an invalid sent
    /// payment and surfaces `SellerCheated` without storing the key.
    pub async fn pay_offer(&self, offer: &ReceivedOffer) -> Result<SentPayment> {
        let squeak = self
            .store
            .get_squeak(offer.squeak_hash)?
            .ok_or_else(|| NodeError::NotFound(format!("squeak {}", offer.squeak_hash)))?;
        if now_s() >= offer.expires_at() {
            return Err(NodeError::Expired(format!(
                "offer {} for squeak {}",
                offer.received_offer_id, offer.squeak_hash
            )));
        }

        let mut payment = SentPayment {
            sent_payment_id: 0,
            created_time_ms: 0,
            peer_address: offer.peer_address.clone(),
            squeak_hash: offer.squeak_hash,
            payment_hash: offer.payment_hash,
            secret_key: [0u8; 32],
            price_msat: offer.price_msat,
            node_pubkey: offer.destination.clone(),
            valid: false,
        };

        let paid = match self.lightning.pay_invoice(&offer.payment_request).await {
            Ok(paid) => paid,
            Err(e) => {
                warn!(
                    squeak_hash = %offer.squeak_hash,
                    payment_hash = %hex::encode(offer.payment_hash),
                    error = %e,
                    "payment failed"
                );
                self.record_sent_payment(&mut payment)?;
                return Err(e);
            }
        };

        let secret_key = secret_key_from_preimage(&paid.preimage, &offer.nonce);
        payment.secret_key = secret_key;
        match squeak.decrypt(&secret_key) {
            Ok(content) => {
                payment.valid = true;
                self.store
                    .set_squeak_decryption_key(offer.squeak_hash, &secret_key, &content)?;
                self.store.set_received_offer_paid(&offer.payment_hash, true)?;
                let id = self.record_sent_payment(&mut payment)?;
                payment.sent_payment_id = id;
                info!(
                    squeak_hash = %offer.squeak_hash,
                    price_msat = offer.price_msat,
                    "unlocked squeak with paid key"
                );
                Ok(payment)
            }
            Err(e) => {
                warn!(
                    squeak_hash = %offer.squeak_hash,
                    payment_hash = %hex::encode(offer.payment_hash),
                    error = %e,
                    "paid preimage does not reveal the content key"
                );
                payment.valid = false;
                self.record_sent_payment(&mut payment)?;
                Err(NodeError::SellerCheated(offer.squeak_hash.to_string()))
            }
        }
    }

    fn record_sent_payment(&self, payment: &mut SentPayment) -> Result<i64> {
        match self.store.insert_sent_payment(payment) {
            Ok(id) => Ok(id),
            // a retried payment keeps its original ledger row
            Err(NodeError::AlreadyExists(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn currency_for(network: Network) -> Currency {
    match network {
        Network::Mainnet => Currency::Bitcoin,
        Network::Testnet => Currency::BitcoinTestnet,
        Network::Signet => Currency::Signet,
        Network::Regtest => Currency::Regtest,
    }
}
