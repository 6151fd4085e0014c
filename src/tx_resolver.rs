// Fee/Value Resolver - rewrites inputs to their source outputs and
// computes aggregate values and the fee

use crate::errors::{BalanceProcessorError, Result};
use crate::models::{DecodedTransaction, ResolvedTransaction, TxOutput};
use crate::node_client::TransactionSource;
use std::sync::Arc;

pub struct TxResolver {
    source: Arc<dyn TransactionSource>,
}

impl TxResolver {
    pub fn new(source: Arc<dyn TransactionSource>) -> Self {
        Self { source }
    }

    /// Resolve a transaction by txid: fetch it, rewrite every input from
    /// its prevout reference to the source output it spends, then compute
    /// value totals. One node round-trip per input, strictly sequential;
    /// any failed input fails the whole resolution.
    pub async fn resolve(&self, txid: &str) -> Result<ResolvedTransaction> {
        let tx = self.source.fetch_transaction(txid).await?;
        self.resolve_decoded(tx).await
    }

    pub async fn resolve_decoded(&self, tx: DecodedTransaction) -> Result<ResolvedTransaction> {
        let mut inputs = Vec::with_capacity(tx.inputs.len());
        for prevout in &tx.inputs {
            let source_tx = self.source.fetch_transaction(&prevout.txid).await?;
            let output = source_tx
                .outputs
                .get(prevout.vout as usize)
                .cloned()
                .ok_or_else(|| {
                    BalanceProcessorError::Decode(format!(
                        "prevout {}:{} out of range ({} outputs)",
                        prevout.txid,
                        prevout.vout,
                        source_tx.outputs.len()
                    ))
                })?;
            inputs.push(output);
        }

        Ok(aggregate(tx.txid, inputs, tx.outputs))
    }
}

/// value_in and value_out are plain sums; fee is their exact difference
fn aggregate(txid: String, inputs: Vec<TxOutput>, outputs: Vec<TxOutput>) -> ResolvedTransaction {
    let value_in: i64 = inputs.iter().map(|input| input.value).sum();
    let value_out: i64 = outputs.iter().map(|output| output.value).sum();

    ResolvedTransaction {
        txid,
        value_in,
        value_out,
        fee: value_in - value_out,
        inputs,
        outputs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Prevout;
    use crate::node_client::MockTransactionSource;

    fn output(address: &str, value: i64) -> TxOutput {
        TxOutput {
            address: Some(address.to_string()),
            value,
        }
    }

    fn funding_tx(txid: &str, outputs: Vec<TxOutput>) -> DecodedTransaction {
        DecodedTransaction {
            txid: txid.to_string(),
            inputs: vec![Prevout {
                txid: "00".repeat(32),
                vout: 0,
            }],
            outputs,
        }
    }

    #[tokio::test]
    async fn resolves_inputs_and_computes_fee() {
        let mut source = MockTransactionSource::new();
        source.expect_fetch_transaction().returning(|txid| match txid {
            "spend" => Ok(DecodedTransaction {
                txid: "spend".to_string(),
                inputs: vec![
                    Prevout {
                        txid: "funding-a".to_string(),
                        vout: 0,
                    },
                    Prevout {
                        txid: "funding-b".to_string(),
                        vout: 1,
                    },
                ],
                outputs: vec![output("carol", 700)],
            }),
            "funding-a" => Ok(funding_tx("funding-a", vec![output("alice", 500)])),
            "funding-b" => Ok(funding_tx(
                "funding-b",
                vec![output("unrelated", 10), output("bob", 300)],
            )),
            other => Err(BalanceProcessorError::TxNotFound(other.to_string())),
        });

        let resolver = TxResolver::new(Arc::new(source));
        let resolved = resolver.resolve("spend").await.unwrap();

        assert_eq!(resolved.inputs, vec![output("alice", 500), output("bob", 300)]);
        assert_eq!(resolved.value_in, 800);
        assert_eq!(resolved.value_out, 700);
        assert_eq!(resolved.fee, 100);
        assert_eq!(
            resolved.fee,
            resolved.value_in - resolved.value_out
        );
    }

    #[tokio::test]
    async fn out_of_range_prevout_fails_resolution() {
        let mut source = MockTransactionSource::new();
        source.expect_fetch_transaction().returning(|txid| match txid {
            "spend" => Ok(DecodedTransaction {
                txid: "spend".to_string(),
                inputs: vec![Prevout {
                    txid: "funding".to_string(),
                    vout: 5,
                }],
                outputs: vec![output("carol", 90)],
            }),
            "funding" => Ok(funding_tx("funding", vec![output("alice", 100)])),
            other => Err(BalanceProcessorError::TxNotFound(other.to_string())),
        });

        let resolver = TxResolver::new(Arc::new(source));
        let result = resolver.resolve("spend").await;

        assert!(matches!(result, Err(BalanceProcessorError::Decode(_))));
    }

    #[tokio::test]
    async fn missing_prevout_tx_fails_resolution() {
        let mut source = MockTransactionSource::new();
        source.expect_fetch_transaction().returning(|txid| match txid {
            "spend" => Ok(DecodedTransaction {
                txid: "spend".to_string(),
                inputs: vec![Prevout {
                    txid: "gone".to_string(),
                    vout: 0,
                }],
                outputs: vec![output("carol", 90)],
            }),
            other => Err(BalanceProcessorError::TxNotFound(other.to_string())),
        });

        let resolver = TxResolver::new(Arc::new(source));
        let result = resolver.resolve("spend").await;

        assert!(matches!(result, Err(BalanceProcessorError::TxNotFound(_))));
    }

    #[tokio::test]
    async fn fee_goes_negative_on_malformed_input_values() {
        // outputs exceeding inputs only happens on malformed data; the
        // arithmetic must stay exact rather than clamp
        let mut source = MockTransactionSource::new();
        source.expect_fetch_transaction().returning(|txid| match txid {
            "spend" => Ok(DecodedTransaction {
                txid: "spend".to_string(),
                inputs: vec![Prevout {
                    txid: "funding".to_string(),
                    vout: 0,
                }],
                outputs: vec![output("carol", 150)],
            }),
            "funding" => Ok(funding_tx("funding", vec![output("alice", 100)])),
            other => Err(BalanceProcessorError::TxNotFound(other.to_string())),
        });

        let resolver = TxResolver::new(Arc::new(source));
        let resolved = resolver.resolve("spend").await.unwrap();

        assert_eq!(resolved.fee, -50);
    }
}
