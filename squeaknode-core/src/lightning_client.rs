//! Lightning adapter: hold invoices, settlement, and payment over lnd's
//! REST gateway.
//!
//! The exchange engine needs exactly five operations from the Lightning
//! node: create a hold invoice keyed by a payment hash, settle it with the
//! preimage, cancel it, watch invoice state changes, and pay someone else's
//! invoice returning the preimage. All of them may block on the network and
//! are only ever called from worker tasks, never from the peer I/O path.

use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{NodeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
    Open,
    Accepted,
    Settled,
    Canceled,
}

/// One event from the invoice subscription stream.
#[derive(Debug, Clone)]
pub struct InvoiceUpdate {
    pub payment_hash: [u8; 32],
    pub settle_index: u64,
    pub state: InvoiceState,
}

#[derive(Debug, Clone)]
pub struct PaymentResult {
    pub preimage: [u8; 32],
    pub amount_paid_msat: u64,
}

#[derive(Debug, Clone)]
pub struct LightningInfo {
    /// Our own node pubkey, hex.
    pub identity_pubkey: String,
}

#[async_trait]
pub trait LightningClient: Send + Sync {
    async fn get_info(&self) -> Result<LightningInfo>;

    /// Create a hold invoice keyed by `payment_hash`; returns the bolt11
    /// payment request.
    async fn add_hold_invoice(
        &self,
        payment_hash: &[u8; 32],
        amount_msat: u64,
        expiry_s: u64,
        memo: &str,
    ) -> Result<String>;

    async fn settle_hold_invoice(&self, preimage: &[u8; 32]) -> Result<()>;

    async fn cancel_hold_invoice(&self, payment_hash: &[u8; 32]) -> Result<()>;

    /// Stream invoice updates starting after `start_settle_index`. The
    /// producer stops when the stop flag flips or the receiver is dropped.
    async fn subscribe_invoices(
        &self,
        start_settle_index: u64,
        stop: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<InvoiceUpdate>>;

    /// Pay a bolt11 invoice and return the revealed preimage.
    async fn pay_invoice(&self, payment_request: &str) -> Result<PaymentResult>;
}

/// Client for lnd's REST gateway, authenticated with the admin macaroon.
pub struct LndRestClient {
    base_url: String,
    macaroon_hex: String,
    client: reqwest::Client,
}

impl LndRestClient {
    pub fn new(
        host: &str,
        rpc_port: u16,
        tls_cert_path: &Path,
        macaroon_path: &Path,
    ) -> Result<Self> {
        let cert_pem = std::fs::read(tls_cert_path).map_err(|e| {
            NodeError::Unavailable(format!(
                "cannot read lnd tls cert {}: {e}",
                tls_cert_path.display()
            ))
        })?;
        let cert = reqwest::Certificate::from_pem(&cert_pem)
            .map_err(|e| NodeError::Unavailable(format!("bad lnd tls cert: {e}")))?;
        let macaroon = std::fs::read(macaroon_path).map_err(|e| {
            NodeError::Unavailable(format!(
                "cannot read lnd macaroon {}: {e}",
                macaroon_path.display()
            ))
        })?;
        let client = reqwest::Client::builder()
            .add_root_certificate(cert)
            .danger_accept_invalid_certs(true) // lnd certs are self-signed
            .build()
            .map_err(|e| NodeError::Unavailable(format!("lnd http client: {e}")))?;
        Ok(LndRestClient {
            base_url: format!("https://{host}:{rpc_port}"),
            macaroon_hex: hex::encode(macaroon),
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(&body)
            .send()
            .await
            .map_err(|e| NodeError::Unavailable(format!("lnd {path}: {e}")))?;
        let status = response.status();
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NodeError::Unavailable(format!("lnd {path}: {e}")))?;
        if !status.is_success() {
            return Err(NodeError::Unavailable(format!("lnd {path}: {value}")));
        }
        Ok(value)
    }
}

#[async_trait]
impl LightningClient for LndRestClient {
    async fn get_info(&self) -> Result<LightningInfo> {
        let response = self
            .request(reqwest::Method::GET, "/v1/getinfo")
            .send()
            .await
            .map_err(|e| NodeError::Unavailable(format!("lnd getinfo: {e}")))?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NodeError::Unavailable(format!("lnd getinfo: {e}")))?;
        let identity_pubkey = value
            .get("identity_pubkey")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NodeError::Unavailable("lnd getinfo: missing identity_pubkey".into()))?
            .to_string();
        Ok(LightningInfo { identity_pubkey })
    }

    async fn add_hold_invoice(
        &self,
        payment_hash: &[u8; 32],
        amount_msat: u64,
        expiry_s: u64,
        memo: &str,
    ) -> Result<String> {
        let body = json!({
            "hash": BASE64.encode(payment_hash),
            "value_msat": amount_msat.to_string(),
            "expiry": expiry_s.to_string(),
            "memo": memo,
        });
        let value = self
            .post_json("/v2/invoices/hodl", body)
            .await
            .map_err(|e| NodeError::InvoiceCreateFailed(e.to_string()))?;
        value
            .get("payment_request")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                NodeError::InvoiceCreateFailed("missing payment_request in response".to_string())
            })
    }

    async fn settle_hold_invoice(&self, preimage: &[u8; 32]) -> Result<()> {
        self.post_json(
            "/v2/invoices/settle",
            json!({ "preimage": BASE64.encode(preimage) }),
        )
        .await?;
        Ok(())
    }

    async fn cancel_hold_invoice(&self, payment_hash: &[u8; 32]) -> Result<()> {
        self.post_json(
            "/v2/invoices/cancel",
            json!({ "payment_hash": BASE64.encode(payment_hash) }),
        )
        .await?;
        Ok(())
    }

    async fn subscribe_invoices(
        &self,
        start_settle_index: u64,
        mut stop: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<InvoiceUpdate>> {
        let path = format!(
            "/v2/invoices/subscribe?add_index=0&settle_index={start_settle_index}"
        );
        let response = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|e| NodeError::Unavailable(format!("lnd subscribe_invoices: {e}")))?;
        if !response.status().is_success() {
            return Err(NodeError::Unavailable(format!(
                "lnd subscribe_invoices: HTTP {}",
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                let chunk = tokio::select! {
                    chunk = stream.next() => chunk,
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return;
                        }
                        continue;
                    }
                };
                let chunk = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        warn!(error = %e, "invoice subscription stream error");
                        return;
                    }
                    None => {
                        debug!("invoice subscription stream closed by lnd");
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    match parse_invoice_line(&line) {
                        Ok(Some(update)) => {
                            if tx.send(update).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "bad invoice subscription event"),
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn pay_invoice(&self, payment_request: &str) -> Result<PaymentResult> {
        let value = self
            .post_json(
                "/v1/channels/transactions",
                json!({ "payment_request": payment_request }),
            )
            .await
            .map_err(|e| NodeError::PaymentFailed(e.to_string()))?;

        if let Some(err) = value.get("payment_error").and_then(|v| v.as_str()) {
            if !err.is_empty() {
                return Err(NodeError::PaymentFailed(err.to_string()));
            }
        }
        let preimage_b64 = value
            .get("payment_preimage")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NodeError::PaymentFailed("missing payment_preimage".to_string()))?;
        let preimage_bytes = BASE64
            .decode(preimage_b64)
            .map_err(|e| NodeError::PaymentFailed(format!("bad preimage encoding: {e}")))?;
        let preimage: [u8; 32] = preimage_bytes
            .as_slice()
            .try_into()
            .map_err(|_| NodeError::PaymentFailed("preimage is not 32 bytes".to_string()))?;
        let amount_paid_msat = value
            .get("payment_route")
            .and_then(|r| r.get("total_amt_msat"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(PaymentResult {
            preimage,
            amount_paid_msat,
        })
    }
}

/// Parse one ndjson line from `/v2/invoices/subscribe`. Returns `None` for
/// blank lines and events without a state we track.
fn parse_invoice_line(line: &[u8]) -> Result<Option<InvoiceUpdate>> {
    let trimmed: &[u8] = {
        let s = line;
        let start = s.iter().position(|&b| !b.is_ascii_whitespace()).unwrap_or(s.len());
        &s[start..]
    };
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: serde_json::Value = serde_json::from_slice(trimmed)
        .map_err(|e| NodeError::Unavailable(format!("invoice event: {e}")))?;
    // the REST gateway wraps each event as {"result": {...}}
    let invoice = value.get("result").unwrap_or(&value);

    let r_hash = invoice
        .get("r_hash")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NodeError::Unavailable("invoice event: missing r_hash".to_string()))?;
    let hash_bytes = BASE64
        .decode(r_hash)
        .map_err(|e| NodeError::Unavailable(format!("invoice event: bad r_hash: {e}")))?;
    let payment_hash: [u8; 32] = hash_bytes
        .as_slice()
        .try_into()
        .map_err(|_| NodeError::Unavailable("invoice event: r_hash not 32 bytes".to_string()))?;

    let state = match invoice.get("state").and_then(|v| v.as_str()) {
        Some("OPEN") => InvoiceState::Open,
        Some("ACCEPTED") => InvoiceState::Accepted,
        Some("SETTLED") => InvoiceState::Settled,
        Some("CANCELED") => InvoiceState::Canceled,
        other => {
            debug!(state = ?other, "ignoring invoice event with unknown state");
            return Ok(None);
        }
    };
    let settle_index = invoice
        .get("settle_index")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(Some(InvoiceUpdate {
        payment_hash,
        settle_index,
        state,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_settled_invoice_event() {
        let payment_hash = [5u8; 32];
        let line = format!(
            r#"{{"result": {{"r_hash": "{}", "state": "SETTLED", "settle_index": "12"}}}}"#,
            BASE64.encode(payment_hash)
        );
        let update = parse_invoice_line(line.as_bytes()).unwrap().unwrap();
        assert_eq!(update.payment_hash, payment_hash);
        assert_eq!(update.state, InvoiceState::Settled);
        assert_eq!(update.settle_index, 12);
    }

    #[test]
    fn parse_skips_blank_lines_and_unknown_states() {
        assert!(parse_invoice_line(b"\n").unwrap().is_none());
        let line = format!(
            r#"{{"result": {{"r_hash": "{}", "state": "FLYING"}}}}"#,
            BASE64.encode([0u8; 32])
        );
        assert!(parse_invoice_line(line.as_bytes()).unwrap().is_none());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_invoice_line(b"not json\n").is_err());
    }
}
