//! 多签交易与签名记录 Repository
//!
//! 签名表是唯一事实来源；current_signatures 只是缓存，每次都由计数重算

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use super::{classify, to_u32, RepoError, RepoResult};
use crate::infrastructure::db::PgPool;

#[derive(Debug, Clone, Serialize)]
pub struct MultiSigTransaction {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub required_signatures: u32,
    /// 缓存值，等于签名记录数
    pub current_signatures: u32,
    pub expires_at: DateTime<Utc>,
    /// 执行触发时间（达到法定数时由唯一的获胜者设置）
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MultiSigTransaction {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn quorum_reached(&self) -> bool {
        self.current_signatures >= self.required_signatures
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TransactionSignature {
    pub id: Uuid,
    pub multisig_id: Uuid,
    pub signer_wallet_id: Uuid,
    /// 65字节签名（0x hex）
    pub signature: String,
    pub signed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMultiSig {
    pub transaction_id: Uuid,
    pub required_signatures: u32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSignature {
    pub multisig_id: Uuid,
    pub signer_wallet_id: Uuid,
    pub signature: String,
}

/// 签名写入后的计数结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureTally {
    pub current: u32,
    pub required: u32,
    /// 本次写入是否赢得了执行权（全局只会有一次为 true）
    pub execution_claimed: bool,
}

impl SignatureTally {
    pub fn quorum_reached(&self) -> bool {
        self.current >= self.required
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(SignatureTally),
    AlreadySigned,
    QuorumAlreadyMet,
    Expired,
}

#[async_trait]
pub trait MultiSigRepository: Send + Sync {
    /// 每笔交易最多一个多签记录，重复时返回 Conflict
    async fn create(&self, input: NewMultiSig) -> RepoResult<MultiSigTransaction>;

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<MultiSigTransaction>>;

    async fn find_by_transaction(&self, transaction_id: Uuid)
        -> RepoResult<Option<MultiSigTransaction>>;

    async fn has_signed(&self, multisig_id: Uuid, wallet_id: Uuid) -> RepoResult<bool>;

    /// 按签名时间排序
    async fn list_signatures(&self, multisig_id: Uuid) -> RepoResult<Vec<TransactionSignature>>;

    async fn count_signatures(&self, multisig_id: Uuid) -> RepoResult<u32>;

    /// 原子地：复核（已签 / 已满 / 过期）→ 写入签名 → 重新计数 → 回写缓存 → 抢占执行权
    async fn append_signature(
        &self,
        input: NewSignature,
        now: DateTime<Utc>,
    ) -> RepoResult<AppendOutcome>;
}

// ============ PostgreSQL 实现 ============

const MULTISIG_COLUMNS: &str =
    "id, transaction_id, required_signatures, current_signatures, expires_at, executed_at, created_at";
const SIGNATURE_COLUMNS: &str = "id, multisig_id, signer_wallet_id, signature, signed_at";

#[derive(FromRow)]
struct MultiSigRow {
    id: Uuid,
    transaction_id: Uuid,
    required_signatures: i32,
    current_signatures: i32,
    expires_at: DateTime<Utc>,
    executed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MultiSigRow> for MultiSigTransaction {
    type Error = RepoError;

    fn try_from(r: MultiSigRow) -> Result<Self, Self::Error> {
        Ok(MultiSigTransaction {
            id: r.id,
            transaction_id: r.transaction_id,
            required_signatures: to_u32(r.required_signatures, "required_signatures")?,
            current_signatures: to_u32(r.current_signatures, "current_signatures")?,
            expires_at: r.expires_at,
            executed_at: r.executed_at,
            created_at: r.created_at,
        })
    }
}

pub struct PgMultiSigRepository {
    pool: PgPool,
}

impl PgMultiSigRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn count_to_u32(count: i64) -> RepoResult<u32> {
    u32::try_from(count).map_err(|_| RepoError::Corrupt(format!("signature count {count}")))
}

/// 计数写入 INTEGER 列
fn count_to_i32(count: u32, field: &str) -> RepoResult<i32> {
    i32::try_from(count).map_err(|_| RepoError::Corrupt(format!("{field} out of range: {count}")))
}

#[async_trait]
impl MultiSigRepository for PgMultiSigRepository {
    async fn create(&self, input: NewMultiSig) -> RepoResult<MultiSigTransaction> {
        let required = count_to_i32(input.required_signatures, "required_signatures")?;

        let row = sqlx::query_as::<_, MultiSigRow>(&format!(
            r#"
            INSERT INTO multisig_transactions
                (id, transaction_id, required_signatures, current_signatures, expires_at)
            VALUES ($1, $2, $3, 0, $4)
            RETURNING {MULTISIG_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.transaction_id)
        .bind(required)
        .bind(input.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify(e, &format!("multisig for transaction {}", input.transaction_id)))?;

        row.try_into()
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<MultiSigTransaction>> {
        let row = sqlx::query_as::<_, MultiSigRow>(&format!(
            "SELECT {MULTISIG_COLUMNS} FROM multisig_transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(MultiSigTransaction::try_from).transpose()
    }

    async fn find_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> RepoResult<Option<MultiSigTransaction>> {
        let row = sqlx::query_as::<_, MultiSigRow>(&format!(
            "SELECT {MULTISIG_COLUMNS} FROM multisig_transactions WHERE transaction_id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(MultiSigTransaction::try_from).transpose()
    }

    async fn has_signed(&self, multisig_id: Uuid, wallet_id: Uuid) -> RepoResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM transaction_signatures \
             WHERE multisig_id = $1 AND signer_wallet_id = $2)",
        )
        .bind(multisig_id)
        .bind(wallet_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn list_signatures(&self, multisig_id: Uuid) -> RepoResult<Vec<TransactionSignature>> {
        let rows = sqlx::query_as::<_, TransactionSignature>(&format!(
            "SELECT {SIGNATURE_COLUMNS} FROM transaction_signatures \
             WHERE multisig_id = $1 ORDER BY signed_at, id"
        ))
        .bind(multisig_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_signatures(&self, multisig_id: Uuid) -> RepoResult<u32> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM transaction_signatures WHERE multisig_id = $1")
                .bind(multisig_id)
                .fetch_one(&self.pool)
                .await?;
        count_to_u32(count)
    }

    async fn append_signature(
        &self,
        input: NewSignature,
        now: DateTime<Utc>,
    ) -> RepoResult<AppendOutcome> {
        let mut tx = self.pool.begin().await?;

        // 行锁：同一多签记录的签名串行化，不同记录互不影响
        let multisig: MultiSigTransaction = sqlx::query_as::<_, MultiSigRow>(&format!(
            "SELECT {MULTISIG_COLUMNS} FROM multisig_transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(input.multisig_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepoError::NotFound(format!("multisig {}", input.multisig_id)))?
        .try_into()?;

        let (already,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM transaction_signatures \
             WHERE multisig_id = $1 AND signer_wallet_id = $2)",
        )
        .bind(input.multisig_id)
        .bind(input.signer_wallet_id)
        .fetch_one(&mut *tx)
        .await?;
        if already {
            return Ok(AppendOutcome::AlreadySigned);
        }

        let (before,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM transaction_signatures WHERE multisig_id = $1")
                .bind(input.multisig_id)
                .fetch_one(&mut *tx)
                .await?;
        if count_to_u32(before)? >= multisig.required_signatures {
            return Ok(AppendOutcome::QuorumAlreadyMet);
        }

        if multisig.is_expired_at(now) {
            return Ok(AppendOutcome::Expired);
        }

        sqlx::query(
            "INSERT INTO transaction_signatures (id, multisig_id, signer_wallet_id, signature, signed_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(input.multisig_id)
        .bind(input.signer_wallet_id)
        .bind(&input.signature)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| classify(e, "signature"))?;

        // 重新计数，不做 +1
        let (after,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM transaction_signatures WHERE multisig_id = $1")
                .bind(input.multisig_id)
                .fetch_one(&mut *tx)
                .await?;
        let current = count_to_u32(after)?;
        let execution_claimed =
            current >= multisig.required_signatures && multisig.executed_at.is_none();
        let stored_count = count_to_i32(current, "current_signatures")?;

        sqlx::query(
            r#"
            UPDATE multisig_transactions
            SET current_signatures = $1,
                executed_at = CASE WHEN $2 THEN $3 ELSE executed_at END
            WHERE id = $4
            "#,
        )
        .bind(stored_count)
        .bind(execution_claimed)
        .bind(now)
        .bind(input.multisig_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AppendOutcome::Appended(SignatureTally {
            current,
            required: multisig.required_signatures,
            execution_claimed,
        }))
    }
}
