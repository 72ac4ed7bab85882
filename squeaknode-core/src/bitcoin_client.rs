//! Bitcoin adapter: block lookups over Bitcoin Core's JSON-RPC interface
//! and a polling new-block watcher.
//!
//! The node only ever asks two things of the chain: "what is the block at
//! height h" (to validate squeak anchors) and "tell me when the tip moves"
//! (to advance peer subscriptions). No retries happen in here; the caller
//! decides how transient an `Unavailable` is.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{NodeError, Result};

/// A resolved block: everything a squeak anchor check needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub height: u32,
    /// Block hash in display byte order (big-endian), as stored in squeaks.
    pub hash: [u8; 32],
    /// Raw 80-byte header.
    pub header_bytes: Vec<u8>,
    /// Header nTime.
    pub time: u32,
}

/// A new chain tip observed by the block watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTip {
    pub height: u32,
    pub hash: [u8; 32],
}

#[async_trait]
pub trait BitcoinClient: Send + Sync {
    async fn get_block_count(&self) -> Result<u32>;
    async fn get_block_hash(&self, height: u32) -> Result<[u8; 32]>;
    async fn get_block_info(&self, height: u32) -> Result<BlockInfo>;
}

/// JSON-RPC client for Bitcoin Core.
pub struct BitcoinCoreRpcClient {
    url: String,
    auth: Option<(String, String)>,
    client: reqwest::Client,
}

impl BitcoinCoreRpcClient {
    pub fn new(
        host: &str,
        port: u16,
        user: Option<String>,
        pass: Option<String>,
        use_ssl: bool,
    ) -> Self {
        let scheme = if use_ssl { "https" } else { "http" };
        let auth = match (user, pass) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        };
        BitcoinCoreRpcClient {
            url: format!("{scheme}://{host}:{port}"),
            auth,
            client: reqwest::Client::new(),
        }
    }

    async fn rpc_call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let request_body = json!({
            "jsonrpc": "2.0",
            "id": "squeaknode",
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(&self.url).json(&request_body);
        if let Some((username, password)) = &self.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| NodeError::Unavailable(format!("bitcoin rpc {method}: {e}")))?;
        if !response.status().is_success() {
            return Err(NodeError::Unavailable(format!(
                "bitcoin rpc {method}: HTTP {status}",
                status = response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NodeError::Unavailable(format!("bitcoin rpc {method}: {e}")))?;
        if let Some(error) = body.get("error") {
            if !error.is_null() {
                return Err(NodeError::Unavailable(format!(
                    "bitcoin rpc {method}: {error}"
                )));
            }
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| NodeError::Unavailable(format!("bitcoin rpc {method}: missing result")))
    }
}

#[async_trait]
impl BitcoinClient for BitcoinCoreRpcClient {
    async fn get_block_count(&self) -> Result<u32> {
        let result = self.rpc_call("getblockcount", json!([])).await?;
        result
            .as_u64()
            .map(|h| h as u32)
            .ok_or_else(|| NodeError::Unavailable("getblockcount: not a number".to_string()))
    }

    async fn get_block_hash(&self, height: u32) -> Result<[u8; 32]> {
        let result = self.rpc_call("getblockhash", json!([height])).await?;
        let hex_str = result
            .as_str()
            .ok_or_else(|| NodeError::Unavailable("getblockhash: not a string".to_string()))?;
        decode_hash(hex_str)
    }

    async fn get_block_info(&self, height: u32) -> Result<BlockInfo> {
        let hash = self.get_block_hash(height).await?;
        let result = self
            .rpc_call("getblockheader", json!([hex::encode(hash), false]))
            .await?;
        let header_hex = result
            .as_str()
            .ok_or_else(|| NodeError::Unavailable("getblockheader: not a string".to_string()))?;
        let header_bytes = hex::decode(header_hex)
            .map_err(|e| NodeError::Unavailable(format!("getblockheader: bad hex: {e}")))?;
        if header_bytes.len() != 80 {
            return Err(NodeError::Unavailable(format!(
                "getblockheader: expected 80 bytes, got {}",
                header_bytes.len()
            )));
        }
        // nTime lives at offset 68 of the serialized header
        let time = u32::from_le_bytes([
            header_bytes[68],
            header_bytes[69],
            header_bytes[70],
            header_bytes[71],
        ]);
        Ok(BlockInfo {
            height,
            hash,
            header_bytes,
            time,
        })
    }
}

fn decode_hash(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| NodeError::Unavailable(format!("bad block hash hex: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| NodeError::Unavailable(format!("block hash is {} bytes", bytes.len())))
}

/// Probe the bitcoin client with bounded retries; used only at startup.
pub async fn wait_until_available(
    client: &dyn BitcoinClient,
    attempts: u32,
    delay: Duration,
) -> Result<u32> {
    let mut last_err = NodeError::Unavailable("bitcoin client never probed".to_string());
    for attempt in 1..=attempts {
        match client.get_block_count().await {
            Ok(count) => return Ok(count),
            Err(e) => {
                warn!(attempt, error = %e, "bitcoin client not ready");
                last_err = e;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Err(last_err)
}

/// Spawn a polling watcher that emits a [`BlockTip`] whenever the chain tip
/// advances. Single consumer; the task exits when the stop flag flips or
/// the receiver is dropped.
pub fn spawn_block_watcher(
    client: Arc<dyn BitcoinClient>,
    poll_interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> mpsc::Receiver<BlockTip> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut last_height: Option<u32> = None;
        loop {
            match client.get_block_count().await {
                Ok(height) if last_height != Some(height) => {
                    match client.get_block_hash(height).await {
                        Ok(hash) => {
                            last_height = Some(height);
                            debug!(height, hash = %hex::encode(hash), "new chain tip");
                            if tx.send(BlockTip { height, hash }).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(height, error = %e, "failed to fetch tip hash"),
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "block poll failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    });
    rx
}
