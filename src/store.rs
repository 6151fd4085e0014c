// Account persistence - height-guarded conditional updates over Postgres
//
// Table:
//   accounts(address TEXT PRIMARY KEY,
//            confirmations0 BIGINT, confirmations3 BIGINT, confirmations6 BIGINT,
//            last_block_check BIGINT, last_txs JSONB)
//
// Every update is guarded by last_block_check in the WHERE clause, so a
// stale or duplicate delivery can never regress an account to an older
// height.

use crate::errors::Result;
use crate::models::{Account, AccountBalances, BalanceSnapshot, PendingTxRef};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::time::Duration;

#[derive(Debug, FromRow)]
struct AccountRow {
    address: String,
    confirmations0: i64,
    confirmations3: i64,
    confirmations6: i64,
    last_block_check: i64,
    last_txs: Json<Vec<PendingTxRef>>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            address: row.address,
            balances: AccountBalances {
                confirmations0: row.confirmations0,
                confirmations3: row.confirmations3,
                confirmations6: row.confirmations6,
            },
            last_block_check: row.last_block_check,
            last_txs: row.last_txs.0,
        }
    }
}

pub struct AccountStore {
    pool: PgPool,
}

impl AccountStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(AccountStore { pool })
    }

    /// Accounts whose confirmation tiers disagree and which have not been
    /// reconciled at `block` yet: the candidates for a block pass
    pub async fn find_unsettled_below(&self, block: i64) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT address, confirmations0, confirmations3, confirmations6,
                   last_block_check, last_txs
            FROM accounts
            WHERE NOT (confirmations0 = confirmations3 AND confirmations3 = confirmations6)
              AND last_block_check < $1
            "#,
        )
        .bind(block)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Account::from).collect())
    }

    /// Transaction-pass update: set the tier balances and checkpoint from
    /// the snapshot and append the new pending refs. Returns whether the
    /// guarded update applied.
    pub async fn apply_transaction_update(
        &self,
        address: &str,
        snapshot: &BalanceSnapshot,
        new_refs: &[PendingTxRef],
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET confirmations0 = $2,
                confirmations3 = $3,
                confirmations6 = $4,
                last_block_check = $5,
                last_txs = last_txs || $6
            WHERE address = $1 AND last_block_check < $5
            "#,
        )
        .bind(address)
        .bind(snapshot.balances.confirmations0)
        .bind(snapshot.balances.confirmations3)
        .bind(snapshot.balances.confirmations6)
        .bind(snapshot.last_block_check)
        .bind(Json(new_refs))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Block-pass update: set the tier balances, advance the checkpoint to
    /// the block height and replace the pending list with the pruned one.
    /// Returns whether the guarded update applied.
    pub async fn apply_block_update(
        &self,
        address: &str,
        block: i64,
        balances: &AccountBalances,
        retained: &[PendingTxRef],
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET confirmations0 = $2,
                confirmations3 = $3,
                confirmations6 = $4,
                last_block_check = $5,
                last_txs = $6
            WHERE address = $1 AND last_block_check < $5
            "#,
        )
        .bind(address)
        .bind(balances.confirmations0)
        .bind(balances.confirmations3)
        .bind(balances.confirmations6)
        .bind(block)
        .bind(Json(retained))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
