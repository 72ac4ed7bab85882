//! In-memory mock adapters for node tests.
//!
//! The mock lightning client signs real BOLT11 invoices and simulates the
//! hold-invoice dance between two linked nodes: paying an invoice parks
//! the HTLC as ACCEPTED on the remote mock until the remote settles with
//! the preimage.

#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::Hash as _;
use lightning_invoice::{Bolt11Invoice, Currency, InvoiceBuilder, PaymentSecret};
use secp256k1::{Message, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc, watch};

use squeaknode_core::bitcoin_client::{BitcoinClient, BlockInfo};
use squeaknode_core::error::{NodeError, Result};
use squeaknode_core::lightning_client::{
    InvoiceState, InvoiceUpdate, LightningClient, LightningInfo, PaymentResult,
};

// ----------------------------------------------------------------------
// Bitcoin
// ----------------------------------------------------------------------

/// Deterministic in-memory chain shared between test nodes.
pub struct MockBitcoinClient {
    blocks: StdMutex<Vec<BlockInfo>>,
}

pub fn mock_block_hash(height: u32) -> [u8; 32] {
    Sha256::digest(format!("mock-block-{height}")).into()
}

fn mock_block(height: u32) -> BlockInfo {
    let mut header_bytes = vec![0u8; 80];
    let time = 1_600_000_000 + height * 600;
    header_bytes[68..72].copy_from_slice(&time.to_le_bytes());
    BlockInfo {
        height,
        hash: mock_block_hash(height),
        header_bytes,
        time,
    }
}

impl MockBitcoinClient {
    /// A chain with blocks 0..=tip.
    pub fn with_tip(tip: u32) -> Arc<Self> {
        let blocks = (0..=tip).map(mock_block).collect();
        Arc::new(MockBitcoinClient {
            blocks: StdMutex::new(blocks),
        })
    }

    pub fn mine_block(&self) -> BlockInfo {
        let mut blocks = self.blocks.lock().unwrap();
        let block = mock_block(blocks.len() as u32);
        blocks.push(block.clone());
        block
    }
}

#[async_trait]
impl BitcoinClient for MockBitcoinClient {
    async fn get_block_count(&self) -> Result<u32> {
        let blocks = self.blocks.lock().unwrap();
        Ok((blocks.len() - 1) as u32)
    }

    async fn get_block_hash(&self, height: u32) -> Result<[u8; 32]> {
        self.get_block_info(height).await.map(|b| b.hash)
    }

    async fn get_block_info(&self, height: u32) -> Result<BlockInfo> {
        let blocks = self.blocks.lock().unwrap();
        blocks
            .get(height as usize)
            .cloned()
            .ok_or_else(|| NodeError::Unavailable(format!("no block at height {height}")))
    }
}

// ----------------------------------------------------------------------
// Lightning
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
struct HoldInvoice {
    amount_msat: u64,
    state: InvoiceState,
    preimage: Option<[u8; 32]>,
}

pub struct MockLightningClient {
    node_key: SecretKey,
    currency: Currency,
    invoices: StdMutex<HashMap<[u8; 32], HoldInvoice>>,
    updates: broadcast::Sender<InvoiceUpdate>,
    settle_counter: AtomicU64,
    /// The mock on the other side of our "channel".
    remote: StdMutex<Option<Arc<MockLightningClient>>>,
    payments_attempted: AtomicU64,
    fail_payments: AtomicU64,
}

impl MockLightningClient {
    pub fn new(seed: u8) -> Arc<Self> {
        let node_key = SecretKey::from_slice(&[seed.max(1); 32]).unwrap();
        Arc::new(MockLightningClient {
            node_key,
            currency: Currency::Regtest,
            invoices: StdMutex::new(HashMap::new()),
            updates: broadcast::channel(64).0,
            settle_counter: AtomicU64::new(0),
            remote: StdMutex::new(None),
            payments_attempted: AtomicU64::new(0),
            fail_payments: AtomicU64::new(0),
        })
    }

    /// Link two mocks so payments route between them.
    pub fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *a.remote.lock().unwrap() = Some(b.clone());
        *b.remote.lock().unwrap() = Some(a.clone());
    }

    /// Make the next `n` payments fail.
    pub fn fail_next_payments(&self, n: u64) {
        self.fail_payments.store(n, Ordering::SeqCst);
    }

    pub fn payments_attempted(&self) -> u64 {
        self.payments_attempted.load(Ordering::SeqCst)
    }

    pub fn node_pubkey(&self) -> String {
        let secp = Secp256k1::new();
        hex::encode(
            secp256k1::PublicKey::from_secret_key(&secp, &self.node_key).serialize(),
        )
    }

    /// An incoming HTLC for one of our hold invoices: park it as ACCEPTED
    /// and wait for the owner to settle or cancel.
    async fn receive_htlc(&self, payment_hash: [u8; 32]) -> Result<[u8; 32]> {
        {
            let mut invoices = self.invoices.lock().unwrap();
            let invoice = invoices
                .get_mut(&payment_hash)
                .ok_or_else(|| NodeError::PaymentFailed("unknown invoice".to_string()))?;
            if invoice.state == InvoiceState::Canceled {
                return Err(NodeError::PaymentFailed("invoice canceled".to_string()));
            }
            invoice.state = InvoiceState::Accepted;
        }
        let _ = self.updates.send(InvoiceUpdate {
            payment_hash,
            settle_index: 0,
            state: InvoiceState::Accepted,
        });

        // wait for settle_hold_invoice to supply the preimage
        for _ in 0..500 {
            {
                let mut invoices = self.invoices.lock().unwrap();
                let invoice = invoices
                    .get_mut(&payment_hash)
                    .ok_or_else(|| NodeError::PaymentFailed("invoice vanished".to_string()))?;
                if invoice.state == InvoiceState::Canceled {
                    return Err(NodeError::PaymentFailed("invoice canceled".to_string()));
                }
                if let Some(preimage) = invoice.preimage {
                    invoice.state = InvoiceState::Settled;
                    let settle_index = self.settle_counter.fetch_add(1, Ordering::SeqCst) + 1;
                    let _ = self.updates.send(InvoiceUpdate {
                        payment_hash,
                        settle_index,
                        state: InvoiceState::Settled,
                    });
                    return Ok(preimage);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(NodeError::PaymentFailed(
            "hold invoice never settled".to_string(),
        ))
    }
}

#[async_trait]
impl LightningClient for MockLightningClient {
    async fn get_info(&self) -> Result<LightningInfo> {
        Ok(LightningInfo {
            identity_pubkey: self.node_pubkey(),
        })
    }

    async fn add_hold_invoice(
        &self,
        payment_hash: &[u8; 32],
        amount_msat: u64,
        expiry_s: u64,
        memo: &str,
    ) -> Result<String> {
        let secp = Secp256k1::new();
        let hash = bitcoin::hashes::sha256::Hash::from_slice(payment_hash)
            .map_err(|e| NodeError::InvoiceCreateFailed(e.to_string()))?;
        let mut builder = InvoiceBuilder::new(self.currency.clone())
            .description(memo.to_string())
            .payment_hash(hash)
            .payment_secret(PaymentSecret([7u8; 32]))
            .duration_since_epoch(Duration::from_secs(squeaknode_core::now_s()))
            .min_final_cltv_expiry_delta(18)
            .expiry_time(Duration::from_secs(expiry_s));
        if amount_msat > 0 {
            builder = builder.amount_milli_satoshis(amount_msat);
        }
        let invoice = builder
            .build_signed(|hash| {
                secp.sign_ecdsa_recoverable(&Message::from_digest(*hash.as_ref()), &self.node_key)
            })
            .map_err(|e| NodeError::InvoiceCreateFailed(format!("{e:?}")))?;

        self.invoices.lock().unwrap().insert(
            *payment_hash,
            HoldInvoice {
                amount_msat,
                state: InvoiceState::Open,
                preimage: None,
            },
        );
        Ok(invoice.to_string())
    }

    async fn settle_hold_invoice(&self, preimage: &[u8; 32]) -> Result<()> {
        let payment_hash: [u8; 32] = Sha256::digest(preimage).into();
        let mut invoices = self.invoices.lock().unwrap();
        let invoice = invoices
            .get_mut(&payment_hash)
            .ok_or_else(|| NodeError::Unavailable("no invoice held for preimage".to_string()))?;
        invoice.preimage = Some(*preimage);
        Ok(())
    }

    async fn cancel_hold_invoice(&self, payment_hash: &[u8; 32]) -> Result<()> {
        if let Some(invoice) = self.invoices.lock().unwrap().get_mut(payment_hash) {
            invoice.state = InvoiceState::Canceled;
        }
        Ok(())
    }

    async fn subscribe_invoices(
        &self,
        _start_settle_index: u64,
        mut stop: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<InvoiceUpdate>> {
        let mut updates = self.updates.subscribe();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Ok(update) => {
                            if tx.send(update).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn pay_invoice(&self, payment_request: &str) -> Result<PaymentResult> {
        self.payments_attempted.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_payments
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(NodeError::PaymentFailed("mock payment failure".to_string()));
        }

        let invoice = Bolt11Invoice::from_str(payment_request)
            .map_err(|e| NodeError::PaymentFailed(format!("bad invoice: {e}")))?;
        let mut payment_hash = [0u8; 32];
        payment_hash.copy_from_slice(invoice.payment_hash().as_ref());
        let amount_msat = invoice.amount_milli_satoshis().unwrap_or(0);

        let remote = self
            .remote
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| NodeError::PaymentFailed("no route".to_string()))?;
        let preimage = remote.receive_htlc(payment_hash).await?;
        let check: [u8; 32] = Sha256::digest(preimage).into();
        if check != payment_hash {
            return Err(NodeError::PaymentFailed(
                "remote revealed a bad preimage".to_string(),
            ));
        }
        Ok(PaymentResult {
            preimage,
            amount_paid_msat: amount_msat,
        })
    }
}
