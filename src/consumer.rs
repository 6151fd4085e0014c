// Reconciliation Consumer - applies transaction and block-confirmation
// events to tracked accounts. Both queues follow the same
// commit-then-acknowledge discipline: handler success acks, handler
// failure naks for redelivery, an unparseable payload is terminated.

use crate::balance_index::BalanceSource;
use crate::errors::{BalanceProcessorError, Result};
use crate::metrics::{EVENTS_RECEIVED_TOTAL, RECONCILIATION_DURATION};
use crate::models::{Account, BlockMessage, PendingTxRef, TransactionMessage};
use crate::publisher::BalancePublisher;
use crate::store::AccountStore;
use crate::tx_resolver::TxResolver;
use async_nats::jetstream::{self, consumer, AckKind};
use dashmap::DashMap;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Confirmation depths at which a transaction's tier bucket flips
const TIER_DEPTHS: [i64; 3] = [0, 3, 6];
/// Depth beyond which a pending tx can no longer change tier
const MAX_TRACKED_DEPTH: i64 = 6;
/// Broker-side bound on unacknowledged deliveries per queue
const PREFETCH_LIMIT: i64 = 2;

/// Pending entries sitting exactly at a tier boundary relative to `block`;
/// only these are resolved and republished during a block pass
pub fn tier_flips(last_txs: &[PendingTxRef], block: i64) -> Vec<PendingTxRef> {
    last_txs
        .iter()
        .filter(|pending| TIER_DEPTHS.contains(&(block - pending.block)))
        .cloned()
        .collect()
}

/// Pending entries still shallow enough to flip a tier at a future height;
/// everything deeper is dropped for good
pub fn retain_tracked(last_txs: &[PendingTxRef], block: i64) -> Vec<PendingTxRef> {
    last_txs
        .iter()
        .filter(|pending| block - pending.block <= MAX_TRACKED_DEPTH)
        .cloned()
        .collect()
}

/// Per-address mutation locks: deliveries touching the same address are
/// serialized, deliveries for different addresses proceed concurrently
#[derive(Default)]
struct AddressLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AddressLocks {
    fn for_address(&self, address: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}

pub struct ReconciliationConsumer {
    client: async_nats::Client,
    stream_name: String,
    prefix: String,
    store: Arc<AccountStore>,
    resolver: Arc<TxResolver>,
    balance_source: Arc<dyn BalanceSource>,
    publisher: Arc<BalancePublisher>,
    address_locks: AddressLocks,
}

impl ReconciliationConsumer {
    pub fn new(
        client: async_nats::Client,
        prefix: &str,
        store: Arc<AccountStore>,
        resolver: Arc<TxResolver>,
        balance_source: Arc<dyn BalanceSource>,
        publisher: Arc<BalancePublisher>,
    ) -> Self {
        Self {
            client,
            stream_name: format!("{}_events", prefix),
            prefix: prefix.to_string(),
            store,
            resolver,
            balance_source,
            publisher,
            address_locks: AddressLocks::default(),
        }
    }

    async fn ensure_consumer(
        &self,
        js: &jetstream::Context,
        durable: &str,
        filter_subject: String,
    ) -> Result<consumer::Consumer<consumer::pull::Config>> {
        let stream = match js.get_stream(&self.stream_name).await {
            Ok(stream) => stream,
            Err(_) => {
                info!("Stream {} not found, creating...", self.stream_name);
                js.create_stream(jetstream::stream::Config {
                    name: self.stream_name.clone(),
                    subjects: vec![
                        format!("{}.transaction.*", self.prefix),
                        format!("{}.block", self.prefix),
                    ],
                    ..Default::default()
                })
                .await
                .map_err(|e| BalanceProcessorError::Broker(e.to_string()))?
            }
        };

        let consumer = match stream.get_consumer(durable).await {
            Ok(consumer) => consumer,
            Err(_) => {
                info!("Consumer {} not found, creating...", durable);
                stream
                    .create_consumer(consumer::pull::Config {
                        durable_name: Some(durable.to_string()),
                        filter_subject,
                        ack_policy: consumer::AckPolicy::Explicit,
                        max_ack_pending: PREFETCH_LIMIT,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| BalanceProcessorError::Broker(e.to_string()))?
            }
        };

        Ok(consumer)
    }

    /// Consume new-transaction events ({prefix}.transaction.*)
    pub async fn start_transaction_consumer(&self) -> Result<()> {
        let js = jetstream::new(self.client.clone());
        let consumer = self
            .ensure_consumer(
                &js,
                "balance_processor_tx",
                format!("{}.transaction.*", self.prefix),
            )
            .await?;

        info!("Transaction consumer ready on {}.transaction.*", self.prefix);

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BalanceProcessorError::Broker(e.to_string()))?;

        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => self.process_transaction_message(message).await,
                Err(e) => error!("Error receiving transaction message: {}", e),
            }
        }

        Ok(())
    }

    /// Consume block-confirmation events ({prefix}.block)
    pub async fn start_block_consumer(&self) -> Result<()> {
        let js = jetstream::new(self.client.clone());
        let consumer = self
            .ensure_consumer(
                &js,
                "balance_processor_block",
                format!("{}.block", self.prefix),
            )
            .await?;

        info!("Block consumer ready on {}.block", self.prefix);

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BalanceProcessorError::Broker(e.to_string()))?;

        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => self.process_block_message(message).await,
                Err(e) => error!("Error receiving block message: {}", e),
            }
        }

        Ok(())
    }

    async fn process_transaction_message(&self, message: jetstream::Message) {
        let start = Instant::now();

        match serde_json::from_slice::<TransactionMessage>(&message.payload) {
            Ok(payload) => match self.handle_transaction(&payload).await {
                Ok(published) => {
                    EVENTS_RECEIVED_TOTAL
                        .with_label_values(&["tx", "success"])
                        .inc();
                    info!(
                        "balance updated for {} ({} events published)",
                        payload.address, published
                    );
                    if let Err(e) = message.ack().await {
                        error!("Failed to ack tx message for {}: {}", payload.address, e);
                    }
                }
                Err(e) => {
                    EVENTS_RECEIVED_TOTAL
                        .with_label_values(&["tx", "error"])
                        .inc();
                    error!(
                        "Transaction pass failed for {}: {}. Will retry (message not acked)",
                        payload.address, e
                    );
                    if let Err(nak_err) = message.ack_with(AckKind::Nak(None)).await {
                        error!("Failed to nak tx message: {}", nak_err);
                    }
                }
            },
            Err(e) => {
                EVENTS_RECEIVED_TOTAL
                    .with_label_values(&["tx", "parse_error"])
                    .inc();
                warn!("Malformed transaction payload: {}. Terminating message", e);
                if let Err(term_err) = message.ack_with(AckKind::Term).await {
                    error!("Failed to terminate bad message: {}", term_err);
                }
            }
        }

        RECONCILIATION_DURATION
            .with_label_values(&["tx"])
            .observe(start.elapsed().as_secs_f64());
    }

    async fn process_block_message(&self, message: jetstream::Message) {
        let start = Instant::now();

        match serde_json::from_slice::<BlockMessage>(&message.payload) {
            Ok(payload) => match self.handle_block(&payload).await {
                Ok(()) => {
                    EVENTS_RECEIVED_TOTAL
                        .with_label_values(&["block", "success"])
                        .inc();
                    if let Err(e) = message.ack().await {
                        error!("Failed to ack block message at {}: {}", payload.block, e);
                    }
                }
                Err(e) => {
                    EVENTS_RECEIVED_TOTAL
                        .with_label_values(&["block", "error"])
                        .inc();
                    error!(
                        "Block pass failed at height {}: {}. Will retry (message not acked)",
                        payload.block, e
                    );
                    if let Err(nak_err) = message.ack_with(AckKind::Nak(None)).await {
                        error!("Failed to nak block message: {}", nak_err);
                    }
                }
            },
            Err(e) => {
                EVENTS_RECEIVED_TOTAL
                    .with_label_values(&["block", "parse_error"])
                    .inc();
                warn!("Malformed block payload: {}. Terminating message", e);
                if let Err(term_err) = message.ack_with(AckKind::Term).await {
                    error!("Failed to terminate bad message: {}", term_err);
                }
            }
        }

        RECONCILIATION_DURATION
            .with_label_values(&["block"])
            .observe(start.elapsed().as_secs_f64());
    }

    /// New-transaction pass: snapshot, persist (height-guarded, refs
    /// appended), then resolve and publish one event per txid
    async fn handle_transaction(&self, payload: &TransactionMessage) -> Result<usize> {
        let lock = self.address_locks.for_address(&payload.address);
        let _guard = lock.lock().await;

        let snapshot = self.balance_source.fetch_balance(&payload.address).await?;

        let new_refs: Vec<PendingTxRef> = payload
            .txs
            .iter()
            .map(|txid| PendingTxRef {
                txid: txid.clone(),
                block: payload.block,
            })
            .collect();

        let applied = self
            .store
            .apply_transaction_update(&payload.address, &snapshot, &new_refs)
            .await?;
        if !applied {
            warn!(
                "Account {} already reconciled past height {}, balances left untouched",
                payload.address, snapshot.last_block_check
            );
        }

        let mut published = 0;
        for txid in &payload.txs {
            let tx = self.resolver.resolve(txid).await?;
            self.publisher
                .publish_balance_update(&payload.address, &snapshot.balances, &tx)
                .await?;
            published += 1;
        }

        Ok(published)
    }

    /// Block pass: re-check every account whose tiers disagree and which
    /// is behind this height. Accounts are independent; one failing
    /// account never aborts the rest of the batch.
    async fn handle_block(&self, payload: &BlockMessage) -> Result<()> {
        let accounts = self.store.find_unsettled_below(payload.block).await?;

        for account in accounts {
            if let Err(e) = self.reconcile_account(&account, payload.block).await {
                error!(
                    "Reconciliation failed for {} at height {}: {}",
                    account.address, payload.block, e
                );
            }
        }

        Ok(())
    }

    /// One block-triggered pass for a single account: snapshot, resolve
    /// and publish the tier-flipping pending txs, then persist the new
    /// balances with the pruned pending list
    async fn reconcile_account(&self, account: &Account, block: i64) -> Result<()> {
        let lock = self.address_locks.for_address(&account.address);
        let _guard = lock.lock().await;

        let snapshot = self.balance_source.fetch_balance(&account.address).await?;

        for pending in tier_flips(&account.last_txs, block) {
            let tx = self.resolver.resolve(&pending.txid).await?;
            self.publisher
                .publish_balance_update(&account.address, &snapshot.balances, &tx)
                .await?;
        }

        let retained = retain_tracked(&account.last_txs, block);
        let applied = self
            .store
            .apply_block_update(&account.address, block, &snapshot.balances, &retained)
            .await?;
        if !applied {
            warn!(
                "Account {} already reconciled past height {}, skipping persist",
                account.address, block
            );
        }

        Ok(())
    }

    /// Run both consumption loops until shutdown, reopening on error
    pub async fn run_forever(self: Arc<Self>) {
        let consumer = self.clone();
        tokio::spawn(async move {
            loop {
                info!("Starting transaction consumption loop");
                if let Err(e) = consumer.start_transaction_consumer().await {
                    error!("Transaction consumer error: {}. Restarting in 5 seconds...", e);
                    tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                }
            }
        });

        loop {
            info!("Starting block consumption loop");
            if let Err(e) = self.start_block_consumer().await {
                error!("Block consumer error: {}. Restarting in 5 seconds...", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(txid: &str, block: i64) -> PendingTxRef {
        PendingTxRef {
            txid: txid.to_string(),
            block,
        }
    }

    #[test]
    fn flips_only_at_tier_boundaries() {
        let last_txs = vec![
            pending("tx-a", 100), // diff 0
            pending("tx-b", 99),  // diff 1
            pending("tx-c", 97),  // diff 3
            pending("tx-d", 95),  // diff 5
            pending("tx-e", 94),  // diff 6
        ];

        let flips = tier_flips(&last_txs, 100);
        let txids: Vec<&str> = flips.iter().map(|p| p.txid.as_str()).collect();
        assert_eq!(txids, vec!["tx-a", "tx-c", "tx-e"]);
    }

    #[test]
    fn retains_everything_within_tracking_depth() {
        let last_txs = vec![
            pending("tx-a", 100), // diff 4: not a flip, but still tracked
            pending("tx-b", 98),  // diff 6: last chance, tracked
            pending("tx-c", 97),  // diff 7: dropped for good
        ];

        let retained = retain_tracked(&last_txs, 104);
        let txids: Vec<&str> = retained.iter().map(|p| p.txid.as_str()).collect();
        assert_eq!(txids, vec!["tx-a", "tx-b"]);
    }

    #[test]
    fn future_entries_are_retained_but_never_flip() {
        // a ref recorded at a height above the current one (out-of-order
        // delivery) must survive until the chain catches up
        let last_txs = vec![pending("tx-a", 110)];

        assert!(tier_flips(&last_txs, 104).is_empty());
        assert_eq!(retain_tracked(&last_txs, 104).len(), 1);
    }
}
