//! 交易记录 Repository
//!
//! tx_hash 在插入时确定且不再修改；状态只能由 PENDING 前进到终态

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use super::{classify, to_i64, to_u64, RepoError, RepoResult};
use crate::{domain::TransactionStatus, infrastructure::db::PgPool};

#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub from_wallet_id: Uuid,
    pub to_address: String,
    /// ether，18位小数
    pub amount: Decimal,
    /// gwei
    pub gas_price: Decimal,
    pub gas_used: Option<u64>,
    pub tx_hash: String,
    pub status: TransactionStatus,
    pub nonce: u64,
    /// 已签名的原始交易（0x hex），用于多签达成后广播及重广播
    #[serde(skip_serializing)]
    pub raw_transaction: String,
    /// 尚未确认被网络收到时为 None（等待多签，或广播结果不明）
    pub broadcast_at: Option<DateTime<Utc>>,
    /// 需要多签达成后才能广播
    pub quorum_gated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn is_broadcast(&self) -> bool {
        self.broadcast_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub from_wallet_id: Uuid,
    pub to_address: String,
    pub amount: Decimal,
    pub gas_price: Decimal,
    pub tx_hash: String,
    pub nonce: u64,
    pub raw_transaction: String,
    /// false 表示尚未确认广播（等待多签，或广播结果不明）
    pub broadcast: bool,
    pub quorum_gated: bool,
}

/// 对账分页游标：(created_at, id) 严格递增
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl From<&Transaction> for PendingCursor {
    fn from(tx: &Transaction) -> Self {
        Self {
            created_at: tx.created_at,
            id: tx.id,
        }
    }
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// tx_hash 或 (钱包, nonce) 重复时返回 Conflict
    async fn insert(&self, input: NewTransaction) -> RepoResult<Transaction>;

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Transaction>>;

    async fn find_by_hash(&self, tx_hash: &str) -> RepoResult<Option<Transaction>>;

    /// 仍为 PENDING 的交易（含未确认广播的），按 (created_at, id) 升序，从游标之后开始
    async fn list_pending(
        &self,
        after: Option<PendingCursor>,
        limit: i64,
    ) -> RepoResult<Vec<Transaction>>;

    /// 钱包已记录的最大 nonce（包括 FAILED 和尚未广播的交易）
    async fn max_nonce(&self, wallet_id: Uuid) -> RepoResult<Option<u64>>;

    /// 标记已广播（幂等：已有时间戳时保持不变）
    async fn mark_broadcast(&self, id: Uuid) -> RepoResult<Transaction>;

    /// 条件更新到终态：只有仍为 PENDING 时才生效，返回是否更新
    ///
    /// 有回执说明网络收到过这笔交易，未记录广播时间的一并补上
    async fn finalize(
        &self,
        id: Uuid,
        status: TransactionStatus,
        gas_used: Option<u64>,
    ) -> RepoResult<bool>;

    /// 从给定钱包发出或发往给定地址的交易，按时间倒序
    async fn list_history(
        &self,
        wallet_ids: &[Uuid],
        addresses: &[String],
        limit: i64,
    ) -> RepoResult<Vec<Transaction>>;
}

// ============ PostgreSQL 实现 ============

const TX_COLUMNS: &str = "id, from_wallet_id, to_address, amount, gas_price, gas_used, tx_hash, \
                          status, nonce, raw_transaction, broadcast_at, quorum_gated, created_at, \
                          updated_at";

#[derive(FromRow)]
struct TransactionRow {
    id: Uuid,
    from_wallet_id: Uuid,
    to_address: String,
    amount: Decimal,
    gas_price: Decimal,
    gas_used: Option<i64>,
    tx_hash: String,
    status: String,
    nonce: i64,
    raw_transaction: String,
    broadcast_at: Option<DateTime<Utc>>,
    quorum_gated: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = RepoError;

    fn try_from(r: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: r.id,
            from_wallet_id: r.from_wallet_id,
            to_address: r.to_address,
            amount: r.amount,
            gas_price: r.gas_price,
            gas_used: r.gas_used.map(|g| to_u64(g, "gas_used")).transpose()?,
            tx_hash: r.tx_hash,
            status: r
                .status
                .parse()
                .map_err(|e| RepoError::Corrupt(format!("transaction {}: {e}", r.id)))?,
            nonce: to_u64(r.nonce, "nonce")?,
            raw_transaction: r.raw_transaction,
            broadcast_at: r.broadcast_at,
            quorum_gated: r.quorum_gated,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

fn convert_all(rows: Vec<TransactionRow>) -> RepoResult<Vec<Transaction>> {
    rows.into_iter().map(Transaction::try_from).collect()
}

pub struct PgTransactionRepository {
    pool: PgPool,
}

impl PgTransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionRepository for PgTransactionRepository {
    async fn insert(&self, input: NewTransaction) -> RepoResult<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            INSERT INTO transactions
                (id, from_wallet_id, to_address, amount, gas_price, tx_hash, status, nonce,
                 raw_transaction, broadcast_at, quorum_gated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                    CASE WHEN $10 THEN CURRENT_TIMESTAMP ELSE NULL END, $11)
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.from_wallet_id)
        .bind(&input.to_address)
        .bind(input.amount)
        .bind(input.gas_price)
        .bind(&input.tx_hash)
        .bind(TransactionStatus::Pending.to_db_string())
        .bind(to_i64(input.nonce, "nonce")?)
        .bind(&input.raw_transaction)
        .bind(input.broadcast)
        .bind(input.quorum_gated)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify(e, &format!("transaction {} / nonce {}", input.tx_hash, input.nonce)))?;

        row.try_into()
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TX_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Transaction::try_from).transpose()
    }

    async fn find_by_hash(&self, tx_hash: &str) -> RepoResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TX_COLUMNS} FROM transactions WHERE tx_hash = $1"
        ))
        .bind(tx_hash.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Transaction::try_from).transpose()
    }

    async fn list_pending(
        &self,
        after: Option<PendingCursor>,
        limit: i64,
    ) -> RepoResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {TX_COLUMNS} FROM transactions
            WHERE status = 'pending'
              AND ($1::timestamptz IS NULL OR (created_at, id) > ($1, $2))
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(after.map(|c| c.created_at))
        .bind(after.map(|c| c.id))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn max_nonce(&self, wallet_id: Uuid) -> RepoResult<Option<u64>> {
        let (max,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(nonce) FROM transactions WHERE from_wallet_id = $1")
                .bind(wallet_id)
                .fetch_one(&self.pool)
                .await?;
        max.map(|n| to_u64(n, "nonce")).transpose()
    }

    async fn mark_broadcast(&self, id: Uuid) -> RepoResult<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            UPDATE transactions
            SET broadcast_at = COALESCE(broadcast_at, CURRENT_TIMESTAMP),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| RepoError::NotFound(format!("transaction {id}")))?
            .try_into()
    }

    async fn finalize(
        &self,
        id: Uuid,
        status: TransactionStatus,
        gas_used: Option<u64>,
    ) -> RepoResult<bool> {
        if !TransactionStatus::Pending.can_transition_to(&status) {
            return Err(RepoError::Corrupt(format!(
                "illegal transition pending -> {status}"
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $1, gas_used = $2,
                broadcast_at = COALESCE(broadcast_at, CURRENT_TIMESTAMP),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $3 AND status = 'pending'
            "#,
        )
        .bind(status.to_db_string())
        .bind(gas_used.map(|g| to_i64(g, "gas_used")).transpose()?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_history(
        &self,
        wallet_ids: &[Uuid],
        addresses: &[String],
        limit: i64,
    ) -> RepoResult<Vec<Transaction>> {
        let lowered: Vec<String> = addresses.iter().map(|a| a.to_lowercase()).collect();

        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {TX_COLUMNS} FROM transactions
            WHERE from_wallet_id = ANY($1) OR lower(to_address) = ANY($2)
            ORDER BY created_at DESC
            LIMIT $3
            "#
        ))
        .bind(wallet_ids)
        .bind(&lowered)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }
}
