//! 托管钱包 Repository

use async_trait::async_trait;
use ethers::types::Address;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use super::{classify, constraint_name, RepoError, RepoResult};
use crate::infrastructure::db::PgPool;

/// 托管钱包
///
/// 私钥只以密文保存；除了 is_primary 重新选举和主密钥轮换，记录创建后不再修改
#[derive(Clone, Serialize, FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub owner_id: Uuid,
    /// EIP-55 格式
    pub address: String,
    #[serde(skip_serializing)]
    pub encrypted_private_key: String,
    pub is_primary: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Wallet {
    pub fn parsed_address(&self) -> RepoResult<Address> {
        self.address
            .parse::<Address>()
            .map_err(|e| RepoError::Corrupt(format!("wallet {} address: {e}", self.id)))
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("address", &self.address)
            .field("encrypted_private_key", &"<sealed>")
            .field("is_primary", &self.is_primary)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct NewWallet {
    pub owner_id: Uuid,
    pub address: String,
    pub encrypted_private_key: String,
}

#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// 创建钱包；该用户还没有钱包时自动成为主钱包（与插入在同一条语句内决定）
    async fn create(&self, input: NewWallet) -> RepoResult<Wallet>;

    async fn find_by_id(&self, wallet_id: Uuid) -> RepoResult<Option<Wallet>>;

    async fn find_by_address(&self, address: &str) -> RepoResult<Option<Wallet>>;

    /// 按创建时间排序
    async fn list_by_owner(&self, owner_id: Uuid) -> RepoResult<Vec<Wallet>>;

    async fn find_primary(&self, owner_id: Uuid) -> RepoResult<Option<Wallet>>;

    /// 重新选举主钱包（降级旧主钱包与提升新主钱包原子完成）
    async fn set_primary(&self, owner_id: Uuid, wallet_id: Uuid) -> RepoResult<Wallet>;

    /// 删除钱包；仍被交易引用时返回 Referenced
    async fn delete(&self, wallet_id: Uuid) -> RepoResult<()>;

    /// 全量列出（主密钥轮换）
    async fn list_all(&self) -> RepoResult<Vec<Wallet>>;

    async fn update_encrypted_key(&self, wallet_id: Uuid, encrypted_private_key: &str)
        -> RepoResult<()>;
}

// ============ PostgreSQL 实现 ============

const WALLET_COLUMNS: &str = "id, owner_id, address, encrypted_private_key, is_primary, created_at";
const PRIMARY_INDEX: &str = "uq_wallets_primary_per_owner";

pub struct PgWalletRepository {
    pool: PgPool,
}

impl PgWalletRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, input: &NewWallet, elect_primary: bool) -> Result<Wallet, sqlx::Error> {
        sqlx::query_as::<_, Wallet>(&format!(
            r#"
            INSERT INTO wallets (id, owner_id, address, encrypted_private_key, is_primary)
            SELECT $1, $2, $3, $4,
                   $5 AND NOT EXISTS (SELECT 1 FROM wallets WHERE owner_id = $2)
            RETURNING {WALLET_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.owner_id)
        .bind(&input.address)
        .bind(&input.encrypted_private_key)
        .bind(elect_primary)
        .fetch_one(&self.pool)
        .await
    }
}

#[async_trait]
impl WalletRepository for PgWalletRepository {
    async fn create(&self, input: NewWallet) -> RepoResult<Wallet> {
        match self.insert(&input, true).await {
            Ok(wallet) => Ok(wallet),
            // 同一用户并发创建首个钱包：部分唯一索引拦下第二个主钱包，改为普通钱包重试
            Err(e) if constraint_name(&e).as_deref() == Some(PRIMARY_INDEX) => self
                .insert(&input, false)
                .await
                .map_err(|e| classify(e, "wallet address")),
            Err(e) => Err(classify(e, "wallet address")),
        }
    }

    async fn find_by_id(&self, wallet_id: Uuid) -> RepoResult<Option<Wallet>> {
        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE id = $1"
        ))
        .bind(wallet_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(wallet)
    }

    async fn find_by_address(&self, address: &str) -> RepoResult<Option<Wallet>> {
        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE lower(address) = lower($1)"
        ))
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(wallet)
    }

    async fn list_by_owner(&self, owner_id: Uuid) -> RepoResult<Vec<Wallet>> {
        let wallets = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE owner_id = $1 ORDER BY created_at, id"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(wallets)
    }

    async fn find_primary(&self, owner_id: Uuid) -> RepoResult<Option<Wallet>> {
        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE owner_id = $1 AND is_primary"
        ))
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(wallet)
    }

    async fn set_primary(&self, owner_id: Uuid, wallet_id: Uuid) -> RepoResult<Wallet> {
        let mut tx = self.pool.begin().await?;

        let target: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM wallets WHERE id = $1 AND owner_id = $2 FOR UPDATE")
                .bind(wallet_id)
                .bind(owner_id)
                .fetch_optional(&mut *tx)
                .await?;
        if target.is_none() {
            return Err(RepoError::NotFound(format!("wallet {wallet_id} of owner {owner_id}")));
        }

        sqlx::query("UPDATE wallets SET is_primary = FALSE WHERE owner_id = $1 AND is_primary")
            .bind(owner_id)
            .execute(&mut *tx)
            .await?;

        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "UPDATE wallets SET is_primary = TRUE WHERE id = $1 RETURNING {WALLET_COLUMNS}"
        ))
        .bind(wallet_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| classify(e, "primary wallet"))?;

        tx.commit().await?;
        Ok(wallet)
    }

    async fn delete(&self, wallet_id: Uuid) -> RepoResult<()> {
        let result = sqlx::query("DELETE FROM wallets WHERE id = $1")
            .bind(wallet_id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, &format!("wallet {wallet_id} has transactions")))?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("wallet {wallet_id}")));
        }
        Ok(())
    }

    async fn list_all(&self) -> RepoResult<Vec<Wallet>> {
        let wallets = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(wallets)
    }

    async fn update_encrypted_key(
        &self,
        wallet_id: Uuid,
        encrypted_private_key: &str,
    ) -> RepoResult<()> {
        let result = sqlx::query("UPDATE wallets SET encrypted_private_key = $1 WHERE id = $2")
            .bind(encrypted_private_key)
            .bind(wallet_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("wallet {wallet_id}")));
        }
        Ok(())
    }
}
