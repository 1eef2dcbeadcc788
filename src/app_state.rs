use std::sync::Arc;

use crate::{
    config::Config,
    infrastructure::{db::PgPool, key_vault::KeyVault},
    repository::{
        MemoryStore, MultiSigRepository, PgMultiSigRepository, PgTransactionRepository,
        PgWalletRepository, TransactionRepository, WalletRepository,
    },
    service::{
        chain_gateway::ChainGateway, nonce_manager::NonceManager, MultiSigCoordinator,
        Reconciler, TransactionEngine, WalletRegistry,
    },
};

/// 应用状态
/// 包含所有共享资源
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub vault: Arc<KeyVault>,
    pub gateway: Arc<dyn ChainGateway>,
    pub wallets: Arc<dyn WalletRepository>,
    pub transactions: Arc<dyn TransactionRepository>,
    pub multisigs: Arc<dyn MultiSigRepository>,
    pub nonces: Arc<NonceManager>,
    pub registry: Arc<WalletRegistry>,
    pub engine: Arc<TransactionEngine>,
    pub coordinator: Arc<MultiSigCoordinator>,
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    /// 生产装配：PostgreSQL 仓储
    pub fn new(
        pool: PgPool,
        config: Arc<Config>,
        gateway: Arc<dyn ChainGateway>,
        vault: Arc<KeyVault>,
    ) -> Self {
        Self::assemble(
            config,
            gateway,
            vault,
            Arc::new(PgWalletRepository::new(pool.clone())),
            Arc::new(PgTransactionRepository::new(pool.clone())),
            Arc::new(PgMultiSigRepository::new(pool)),
        )
    }

    /// 内存装配（测试和本地联调）
    pub fn in_memory(
        config: Arc<Config>,
        gateway: Arc<dyn ChainGateway>,
        vault: Arc<KeyVault>,
    ) -> Self {
        let store = MemoryStore::new();
        Self::assemble(
            config,
            gateway,
            vault,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store),
        )
    }

    fn assemble(
        config: Arc<Config>,
        gateway: Arc<dyn ChainGateway>,
        vault: Arc<KeyVault>,
        wallets: Arc<dyn WalletRepository>,
        transactions: Arc<dyn TransactionRepository>,
        multisigs: Arc<dyn MultiSigRepository>,
    ) -> Self {
        let nonces = Arc::new(NonceManager::new(transactions.clone(), gateway.clone()));
        let registry = Arc::new(WalletRegistry::new(
            wallets.clone(),
            gateway.clone(),
            vault.clone(),
        ));
        let engine = Arc::new(TransactionEngine::new(
            wallets.clone(),
            transactions.clone(),
            multisigs.clone(),
            gateway.clone(),
            vault.clone(),
            nonces.clone(),
            config.chain.chain_id,
        ));
        let coordinator = Arc::new(MultiSigCoordinator::new(
            wallets.clone(),
            transactions.clone(),
            multisigs.clone(),
            engine.clone(),
            vault.clone(),
            config.multisig.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            transactions.clone(),
            gateway.clone(),
            &config.reconciler,
        ));

        Self {
            config,
            vault,
            gateway,
            wallets,
            transactions,
            multisigs,
            nonces,
            registry,
            engine,
            coordinator,
            reconciler,
        }
    }
}
