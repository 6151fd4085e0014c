// Node Transaction Client - fetches and decodes raw transactions over the
// node's local IPC socket. One long-lived connection, request-id correlated,
// explicit per-call timeout.

use crate::errors::{BalanceProcessorError, Result};
use crate::metrics::NODE_CALLS_TOTAL;
use crate::models::{DecodedTransaction, Prevout, TxOutput};
use async_trait::async_trait;
use bitcoin::consensus::encode;
use bitcoin::{Address, Network};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

/// Source of decoded transactions, keyed by txid
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransactionSource: Send + Sync {
    async fn fetch_transaction(&self, txid: &str) -> Result<DecodedTransaction>;
}

#[derive(Debug, Serialize)]
struct NodeRequest<'a> {
    id: u64,
    method: &'a str,
    params: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct NodeReply {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Node-side outcome of one correlated call: the method result, or the
/// error string the node reported
type CallOutcome = std::result::Result<Value, String>;

pub struct NodeClient {
    socket_path: PathBuf,
    network: Network,
    request_timeout: Duration,
    // (generation, write half); the generation lets a dead reader clear
    // only its own connection, never a newer one
    writer: Arc<Mutex<Option<(u64, OwnedWriteHalf)>>>,
    pending: Arc<DashMap<u64, oneshot::Sender<CallOutcome>>>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
}

impl NodeClient {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        network: Network,
        request_timeout: Duration,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            network,
            request_timeout,
            writer: Arc::new(Mutex::new(None)),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Map the configured network profile to an address-derivation network
    pub fn network_from_profile(profile: &str) -> Result<Network> {
        match profile {
            "main" => Ok(Network::Bitcoin),
            "test" => Ok(Network::Testnet),
            other => Err(BalanceProcessorError::Decode(format!(
                "unknown network profile: {}",
                other
            ))),
        }
    }

    /// Establish the socket connection if there is none, spawning the
    /// reader task that routes replies to their pending calls
    async fn ensure_connected(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return Ok(());
        }

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            BalanceProcessorError::NodeUnavailable(format!(
                "connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        let (read_half, write_half) = stream.into_split();

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        *writer = Some((generation, write_half));

        let pending = self.pending.clone();
        let writer_slot = self.writer.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<NodeReply>(&line) {
                        Ok(reply) => {
                            if let Some((_, sender)) = pending.remove(&reply.id) {
                                let outcome = match (reply.result, reply.error) {
                                    (_, Some(node_error)) => Err(node_error),
                                    (Some(result), None) => Ok(result),
                                    (None, None) => Err("empty node reply".to_string()),
                                };
                                let _ = sender.send(outcome);
                            } else {
                                warn!("Uncorrelated node reply for id {}", reply.id);
                            }
                        }
                        Err(e) => warn!("Discarding unparseable node reply: {}", e),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        error!("Node socket read failed: {}", e);
                        break;
                    }
                }
            }

            // Connection is gone: release the write half (unless a newer
            // connection replaced it) and fail whatever is still in flight
            let mut slot = writer_slot.lock().await;
            if matches!(*slot, Some((g, _)) if g == generation) {
                *slot = None;
            }
            drop(slot);

            let stale: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
            for id in stale {
                if let Some((_, sender)) = pending.remove(&id) {
                    let _ = sender.send(Err("node connection closed".to_string()));
                }
            }
        });

        info!("Connected to node IPC at {}", self.socket_path.display());
        Ok(())
    }

    /// Issue one correlated method call. The outer error is transport
    /// (connect/write/timeout); the inner result carries the node's answer.
    async fn call(&self, method: &str, params: Vec<&str>) -> Result<CallOutcome> {
        self.ensure_connected().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id, sender);

        let request = NodeRequest { id, method, params };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');

        {
            let mut writer = self.writer.lock().await;
            let written = match writer.as_mut() {
                Some((_, write_half)) => write_half.write_all(&line).await,
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "connection lost before write",
                )),
            };
            if let Err(e) = written {
                *writer = None;
                self.pending.remove(&id);
                NODE_CALLS_TOTAL.with_label_values(&[method, "error"]).inc();
                return Err(BalanceProcessorError::NodeUnavailable(format!(
                    "write {} request: {}",
                    method, e
                )));
            }
        }

        match tokio::time::timeout(self.request_timeout, receiver).await {
            Ok(Ok(outcome)) => {
                NODE_CALLS_TOTAL.with_label_values(&[method, "success"]).inc();
                Ok(outcome)
            }
            Ok(Err(_)) => {
                NODE_CALLS_TOTAL.with_label_values(&[method, "error"]).inc();
                Err(BalanceProcessorError::NodeUnavailable(
                    "node connection closed".to_string(),
                ))
            }
            Err(_) => {
                self.pending.remove(&id);
                NODE_CALLS_TOTAL.with_label_values(&[method, "timeout"]).inc();
                Err(BalanceProcessorError::NodeUnavailable(format!(
                    "{} timed out after {:?}",
                    method, self.request_timeout
                )))
            }
        }
    }
}

#[async_trait]
impl TransactionSource for NodeClient {
    async fn fetch_transaction(&self, txid: &str) -> Result<DecodedTransaction> {
        let raw = match self.call("getrawtransaction", vec![txid]).await? {
            Ok(value) => value
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| {
                    BalanceProcessorError::Decode(format!(
                        "non-string raw transaction for {}",
                        txid
                    ))
                })?,
            Err(node_error) => {
                return Err(BalanceProcessorError::TxNotFound(format!(
                    "{}: {}",
                    txid, node_error
                )))
            }
        };

        decode_raw_transaction(&raw, self.network)
    }
}

/// Decode a hex-encoded raw transaction into prevout references and
/// address/value outputs. Outputs whose script has no standard address
/// form keep a value but no address.
pub fn decode_raw_transaction(raw: &str, network: Network) -> Result<DecodedTransaction> {
    let bytes = hex::decode(raw.trim())
        .map_err(|e| BalanceProcessorError::Decode(format!("invalid transaction hex: {}", e)))?;

    let tx: bitcoin::Transaction = encode::deserialize(&bytes)
        .map_err(|e| BalanceProcessorError::Decode(format!("malformed raw transaction: {}", e)))?;

    let inputs = tx
        .input
        .iter()
        .map(|input| Prevout {
            txid: input.previous_output.txid.to_string(),
            vout: input.previous_output.vout,
        })
        .collect();

    let outputs = tx
        .output
        .iter()
        .map(|output| TxOutput {
            address: Address::from_script(output.script_pubkey.as_script(), network)
                .ok()
                .map(|address| address.to_string()),
            value: output.value.to_sat() as i64,
        })
        .collect();

    Ok(DecodedTransaction {
        txid: tx.compute_txid().to_string(),
        inputs,
        outputs,
    })
}
