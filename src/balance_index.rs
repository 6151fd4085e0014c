// Balance Snapshot Fetcher - confirmation-tiered balances for one address
// from the external balance index

use crate::errors::{BalanceProcessorError, Result};
use crate::models::BalanceSnapshot;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Source of confirmation-tiered balance snapshots. Opaque query, no side
/// effects; this service only consumes the result shape.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn fetch_balance(&self, address: &str) -> Result<BalanceSnapshot>;
}

pub struct BalanceIndexClient {
    base_url: String,
    http_client: Client,
}

impl BalanceIndexClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.into(),
            http_client,
        }
    }
}

#[async_trait]
impl BalanceSource for BalanceIndexClient {
    async fn fetch_balance(&self, address: &str) -> Result<BalanceSnapshot> {
        let url = format!("{}/addresses/{}/balance", self.base_url, address);

        let response = self.http_client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(BalanceProcessorError::BalanceIndex(format!(
                "balance index returned {} for {}",
                response.status(),
                address
            )));
        }

        Ok(response.json::<BalanceSnapshot>().await?)
    }
}
