//! Nonce 管理器
//!
//! 每个钱包一把异步锁，从分配 nonce 一直持有到交易落库；
//! 下一个 nonce = max(链上 pending nonce, 本地已记录最大 nonce + 1)

use std::sync::Arc;

use ethers::types::Address;
use uuid::Uuid;

use crate::{
    error::AppResult,
    infrastructure::keyed_lock::{KeyedGuard, KeyedLocks},
    repository::TransactionRepository,
    service::chain_gateway::ChainGateway,
};

/// 已分配的 nonce；释放前同一钱包的其他转账会等待
pub struct NonceLease {
    pub wallet_id: Uuid,
    pub nonce: u64,
    _guard: KeyedGuard<Uuid>,
}

impl std::fmt::Debug for NonceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceLease")
            .field("wallet_id", &self.wallet_id)
            .field("nonce", &self.nonce)
            .finish()
    }
}

pub struct NonceManager {
    locks: KeyedLocks<Uuid>,
    transactions: Arc<dyn TransactionRepository>,
    gateway: Arc<dyn ChainGateway>,
}

impl NonceManager {
    pub fn new(transactions: Arc<dyn TransactionRepository>, gateway: Arc<dyn ChainGateway>) -> Self {
        Self {
            locks: KeyedLocks::new(),
            transactions,
            gateway,
        }
    }

    /// 锁定钱包并分配下一个 nonce
    ///
    /// 本地记录包含 FAILED 和尚未广播的多签交易，因此 nonce 永不复用
    pub async fn reserve(&self, wallet_id: Uuid, address: Address) -> AppResult<NonceLease> {
        let guard = self.locks.acquire(wallet_id).await;

        let chain_nonce = self.gateway.get_nonce(address).await?;
        let local_max = self.transactions.max_nonce(wallet_id).await?;
        let nonce = next_nonce(chain_nonce, local_max);

        if local_max.map_or(false, |n| n >= chain_nonce) {
            tracing::debug!(
                %wallet_id,
                chain_nonce,
                ?local_max,
                nonce,
                "Local records are ahead of the node"
            );
        }

        Ok(NonceLease {
            wallet_id,
            nonce,
            _guard: guard,
        })
    }
}

pub fn next_nonce(chain_nonce: u64, local_max: Option<u64>) -> u64 {
    match local_max {
        Some(local) => chain_nonce.max(local + 1),
        None => chain_nonce,
    }
}
