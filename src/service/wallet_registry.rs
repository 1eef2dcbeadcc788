//! 钱包注册表
//! 用户 → 托管钱包；每个用户最多一个主钱包，第一个钱包默认为主钱包

use std::sync::Arc;

use ethers::{
    signers::{LocalWallet, Signer},
    types::U256,
};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{
    domain::amount,
    error::{AppError, AppResult},
    infrastructure::{key_vault::KeyVault, keyed_lock::KeyedLocks},
    metrics,
    repository::{NewWallet, Wallet, WalletRepository},
    service::chain_gateway::ChainGateway,
    utils::address_validator,
};

/// 单个钱包的余额；节点查询失败只影响该条目
#[derive(Debug, Clone, Serialize)]
pub struct WalletBalance {
    pub wallet: Wallet,
    pub balance_wei: Option<U256>,
    pub balance: Option<Decimal>,
    pub error: Option<String>,
}

pub struct WalletRegistry {
    wallets: Arc<dyn WalletRepository>,
    gateway: Arc<dyn ChainGateway>,
    vault: Arc<KeyVault>,
    owner_locks: KeyedLocks<Uuid>,
}

impl WalletRegistry {
    pub fn new(
        wallets: Arc<dyn WalletRepository>,
        gateway: Arc<dyn ChainGateway>,
        vault: Arc<KeyVault>,
    ) -> Self {
        Self {
            wallets,
            gateway,
            vault,
            owner_locks: KeyedLocks::new(),
        }
    }

    /// 生成新密钥对并托管
    ///
    /// 密文和地址在一次插入中写入，要么都存在要么都不存在
    pub async fn create_wallet(&self, owner_id: Uuid) -> AppResult<Wallet> {
        let _guard = self.owner_locks.acquire(owner_id).await;
        self.create_locked(owner_id).await
    }

    /// 首次使用时自动创建；已有钱包时返回主钱包
    pub async fn ensure_wallet(&self, owner_id: Uuid) -> AppResult<Wallet> {
        let _guard = self.owner_locks.acquire(owner_id).await;

        if let Some(primary) = self.wallets.find_primary(owner_id).await? {
            return Ok(primary);
        }
        if let Some(first) = self.wallets.list_by_owner(owner_id).await?.into_iter().next() {
            return Ok(first);
        }

        tracing::info!(%owner_id, "No wallet yet, creating one");
        self.create_locked(owner_id).await
    }

    async fn create_locked(&self, owner_id: Uuid) -> AppResult<Wallet> {
        let signer = LocalWallet::new(&mut rand::thread_rng());
        let address = address_validator::checksum(&signer.address());

        let sealed = {
            let raw_key = Zeroizing::new(signer.signer().to_bytes().to_vec());
            self.vault
                .encrypt(&raw_key)
                .map_err(|e| AppError::Storage(format!("failed to seal new key: {e}")))?
        };
        drop(signer);

        let wallet = self
            .wallets
            .create(NewWallet {
                owner_id,
                address,
                encrypted_private_key: sealed,
            })
            .await?;

        metrics::wallet_created();
        tracing::info!(
            wallet_id = %wallet.id,
            %owner_id,
            address = %wallet.address,
            is_primary = wallet.is_primary,
            "Wallet created"
        );
        Ok(wallet)
    }

    pub async fn list_wallets(&self, owner_id: Uuid) -> AppResult<Vec<Wallet>> {
        Ok(self.wallets.list_by_owner(owner_id).await?)
    }

    pub async fn get_primary(&self, owner_id: Uuid) -> AppResult<Wallet> {
        self.wallets
            .find_primary(owner_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("primary wallet of owner {owner_id}")))
    }

    pub async fn get_wallet(&self, wallet_id: Uuid) -> AppResult<Wallet> {
        self.wallets
            .find_by_id(wallet_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("wallet {wallet_id}")))
    }

    /// 显式重新选举主钱包
    pub async fn set_primary(&self, owner_id: Uuid, wallet_id: Uuid) -> AppResult<Wallet> {
        let _guard = self.owner_locks.acquire(owner_id).await;
        let wallet = self.wallets.set_primary(owner_id, wallet_id).await?;
        tracing::info!(%owner_id, %wallet_id, "Primary wallet changed");
        Ok(wallet)
    }

    /// 用户所有钱包的链上余额（并发查询）
    pub async fn wallet_balances(&self, owner_id: Uuid) -> AppResult<Vec<WalletBalance>> {
        let wallets = self.wallets.list_by_owner(owner_id).await?;

        let lookups = wallets.into_iter().map(|wallet| async move {
            match self.balance_of(&wallet).await {
                Ok((wei, ether)) => WalletBalance {
                    wallet,
                    balance_wei: Some(wei),
                    balance: Some(ether),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(wallet_id = %wallet.id, error = %e, "Balance lookup failed");
                    WalletBalance {
                        wallet,
                        balance_wei: None,
                        balance: None,
                        error: Some(e.to_string()),
                    }
                }
            }
        });

        Ok(join_all(lookups).await)
    }

    async fn balance_of(&self, wallet: &Wallet) -> AppResult<(U256, Decimal)> {
        let address = wallet
            .parsed_address()
            .map_err(|e| AppError::Storage(e.to_string()))?;
        let wei = self.gateway.get_balance(address).await?;
        Ok((wei, amount::wei_to_ether(wei)?))
    }
}
