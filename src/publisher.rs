// Outbound balance-update publisher

use crate::errors::Result;
use crate::metrics::BALANCE_UPDATES_PUBLISHED_TOTAL;
use crate::models::{AccountBalances, BalanceUpdate, ResolvedTransaction};
use async_nats::Client;
use tracing::info;

pub struct BalancePublisher {
    client: Client,
    prefix: String,
}

impl BalancePublisher {
    pub fn new(client: Client, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
        }
    }

    /// Publish one balance-update event; the routing key is derived from
    /// the account address
    pub async fn publish_balance_update(
        &self,
        address: &str,
        balances: &AccountBalances,
        tx: &ResolvedTransaction,
    ) -> Result<()> {
        let subject = format!("{}.balance.{}", self.prefix, address);
        let update = BalanceUpdate {
            address: address.to_string(),
            balances: *balances,
            tx: tx.clone(),
        };
        let payload = serde_json::to_vec(&update)?;

        match self.client.publish(subject.clone(), payload.into()).await {
            Ok(()) => {
                BALANCE_UPDATES_PUBLISHED_TOTAL
                    .with_label_values(&["success"])
                    .inc();
                info!(
                    "Published balance update for {} (tx {}) to {}",
                    address, tx.txid, subject
                );
                Ok(())
            }
            Err(e) => {
                BALANCE_UPDATES_PUBLISHED_TOTAL
                    .with_label_values(&["error"])
                    .inc();
                Err(e.into())
            }
        }
    }
}
