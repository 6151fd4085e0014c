// Data models for the balance processor service

use serde::{Deserialize, Serialize};

/// Confirmation-tiered totals for one tracked address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalances {
    pub confirmations0: i64,
    pub confirmations3: i64,
    pub confirmations6: i64,
}

impl AccountBalances {
    /// All three tiers agree: no pending activity left to reconcile
    pub fn is_settled(&self) -> bool {
        self.confirmations0 == self.confirmations3 && self.confirmations3 == self.confirmations6
    }
}

/// A transaction awaiting re-check at a future confirmation depth
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTxRef {
    pub txid: String,
    pub block: i64,
}

/// Tracked address with its reconciliation state.
/// Created externally when the address is registered; this service only
/// selects and updates.
#[derive(Debug, Clone)]
pub struct Account {
    pub address: String,
    pub balances: AccountBalances,
    pub last_block_check: i64,
    pub last_txs: Vec<PendingTxRef>,
}

/// Previous-output reference carried by an unresolved input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prevout {
    pub txid: String,
    pub vout: u32,
}

/// A transaction output: destination address (where derivable) and value
/// in the smallest unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: Option<String>,
    pub value: i64,
}

/// Transaction as decoded from the node, inputs still unresolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransaction {
    pub txid: String,
    pub inputs: Vec<Prevout>,
    pub outputs: Vec<TxOutput>,
}

/// Transaction with every input rewritten to its source output and value
/// totals computed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTransaction {
    pub txid: String,
    pub inputs: Vec<TxOutput>,
    pub outputs: Vec<TxOutput>,
    pub value_in: i64,
    pub value_out: i64,
    pub fee: i64,
}

/// Net balance movement for one address implied by a resolved transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressBalanceChange {
    pub address: String,
    pub delta: i64,
}

impl ResolvedTransaction {
    /// Per-address balance deltas. Outputs are paired positionally with the
    /// inputs funding them; pairs whose source and destination coincide
    /// carry no movement.
    pub fn balance_changes(&self) -> Vec<AddressBalanceChange> {
        let transfers: Vec<(Option<&str>, Option<&str>, i64)> = self
            .outputs
            .iter()
            .take(self.inputs.len())
            .zip(self.inputs.iter())
            .map(|(output, input)| (input.address.as_deref(), output.address.as_deref(), output.value))
            .filter(|(from, to, _)| from != to)
            .collect();

        let mut addresses: Vec<&str> = transfers
            .iter()
            .flat_map(|(from, to, _)| [*from, *to])
            .flatten()
            .collect();
        addresses.sort_unstable();
        addresses.dedup();

        addresses
            .into_iter()
            .map(|address| {
                let outcome: i64 = transfers
                    .iter()
                    .filter(|(from, _, _)| *from == Some(address))
                    .map(|(_, _, value)| *value)
                    .sum();
                let income: i64 = transfers
                    .iter()
                    .filter(|(_, to, _)| *to == Some(address))
                    .map(|(_, _, value)| *value)
                    .sum();

                AddressBalanceChange {
                    address: address.to_string(),
                    delta: income - outcome,
                }
            })
            .collect()
    }
}

/// Inbound "new transaction" payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMessage {
    pub address: String,
    pub block: i64,
    pub txs: Vec<String>,
}

/// Inbound "new block" payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMessage {
    pub block: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Outbound balance-update event, one per balance-affecting transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub address: String,
    pub balances: AccountBalances,
    pub tx: ResolvedTransaction,
}

/// Balance index reply for one address
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    pub balances: AccountBalances,
    pub last_block_check: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(address: Option<&str>, value: i64) -> TxOutput {
        TxOutput {
            address: address.map(str::to_string),
            value,
        }
    }

    fn resolved(inputs: Vec<TxOutput>, outputs: Vec<TxOutput>) -> ResolvedTransaction {
        let value_in: i64 = inputs.iter().map(|i| i.value).sum();
        let value_out: i64 = outputs.iter().map(|o| o.value).sum();
        ResolvedTransaction {
            txid: "ab".repeat(32),
            inputs,
            outputs,
            value_in,
            value_out,
            fee: value_in - value_out,
        }
    }

    #[test]
    fn settled_when_all_tiers_agree() {
        let balances = AccountBalances {
            confirmations0: 5000,
            confirmations3: 5000,
            confirmations6: 5000,
        };
        assert!(balances.is_settled());
    }

    #[test]
    fn unsettled_when_any_tier_disagrees() {
        let balances = AccountBalances {
            confirmations0: 5200,
            confirmations3: 5000,
            confirmations6: 5000,
        };
        assert!(!balances.is_settled());
    }

    #[test]
    fn balance_changes_simple_transfer() {
        let tx = resolved(
            vec![output(Some("alice"), 500)],
            vec![output(Some("bob"), 480)],
        );

        let changes = tx.balance_changes();
        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&AddressBalanceChange {
            address: "alice".to_string(),
            delta: -480,
        }));
        assert!(changes.contains(&AddressBalanceChange {
            address: "bob".to_string(),
            delta: 480,
        }));
    }

    #[test]
    fn balance_changes_skips_self_transfers() {
        let tx = resolved(
            vec![output(Some("alice"), 500)],
            vec![output(Some("alice"), 490)],
        );

        assert!(tx.balance_changes().is_empty());
    }

    #[test]
    fn balance_changes_ignores_unpaired_change_output() {
        // Second output has no paired input and is not counted as a transfer
        let tx = resolved(
            vec![output(Some("alice"), 1000)],
            vec![output(Some("bob"), 300), output(Some("alice"), 690)],
        );

        let changes = tx.balance_changes();
        assert!(changes.contains(&AddressBalanceChange {
            address: "alice".to_string(),
            delta: -300,
        }));
        assert!(changes.contains(&AddressBalanceChange {
            address: "bob".to_string(),
            delta: 300,
        }));
    }
}
