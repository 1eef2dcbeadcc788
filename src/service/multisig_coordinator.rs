//! 多签协调器
//!
//! 签名表是事实来源：写入签名后重新计数，不做原地 +1。
//! 同一笔多签交易的「复核 → 写入 → 重算 → 抢占执行权」在进程内锁和数据库行锁下串行，
//! 不同多签交易之间互不阻塞

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use ethers::{
    types::{Address, Signature},
    utils::hash_message,
};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    config::MultisigConfig,
    error::{AppError, AppResult},
    infrastructure::{key_vault::KeyVault, keyed_lock::KeyedLocks},
    metrics,
    repository::{
        AppendOutcome, MultiSigRepository, MultiSigTransaction, NewMultiSig, NewSignature,
        RepoError, Transaction, TransactionRepository, TransactionSignature, WalletRepository,
    },
    service::transaction_engine::TransactionEngine,
};

/// 审批消息：绑定交易哈希和签名者地址
pub fn approval_message(tx_hash: &str, signer_address: &str) -> String {
    format!("{tx_hash}:{signer_address}")
}

/// 校验已存储的审批签名（EIP-191 personal_sign）
pub fn verify_approval(signature_hex: &str, tx_hash: &str, signer_address: &str) -> bool {
    let Ok(signature) = signature_hex.trim_start_matches("0x").parse::<Signature>() else {
        return false;
    };
    let Ok(address) = signer_address.parse::<Address>() else {
        return false;
    };
    signature
        .verify(approval_message(tx_hash, signer_address), address)
        .is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// 本次签名没有触发执行
    NotTriggered,
    Broadcast { tx_hash: String },
    /// 执行权已占用但广播失败；可用 retry_execution 重发同一份字节
    Failed { code: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SignOutcome {
    pub accepted: bool,
    pub quorum_reached: bool,
    pub current_signatures: u32,
    pub required_signatures: u32,
    pub execution: ExecutionOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuorumStatus {
    pub multisig: MultiSigTransaction,
    pub transaction: Transaction,
    pub signatures: Vec<TransactionSignature>,
    pub quorum_reached: bool,
    pub expired: bool,
    pub executed: bool,
    /// 过期且未执行：交易仍占用该 nonce，同一钱包之后的交易在链上都会卡住
    pub blocking_nonce: Option<u64>,
}

impl QuorumStatus {
    /// 该钱包现在能否签名
    pub fn can_sign(&self, wallet_id: Uuid) -> bool {
        !self.expired
            && !self.quorum_reached
            && !self
                .signatures
                .iter()
                .any(|s| s.signer_wallet_id == wallet_id)
    }
}

pub struct MultiSigCoordinator {
    wallets: Arc<dyn WalletRepository>,
    transactions: Arc<dyn TransactionRepository>,
    multisigs: Arc<dyn MultiSigRepository>,
    engine: Arc<TransactionEngine>,
    vault: Arc<KeyVault>,
    locks: KeyedLocks<Uuid>,
    defaults: MultisigConfig,
}

impl MultiSigCoordinator {
    pub fn new(
        wallets: Arc<dyn WalletRepository>,
        transactions: Arc<dyn TransactionRepository>,
        multisigs: Arc<dyn MultiSigRepository>,
        engine: Arc<TransactionEngine>,
        vault: Arc<KeyVault>,
        defaults: MultisigConfig,
    ) -> Self {
        Self {
            wallets,
            transactions,
            multisigs,
            engine,
            vault,
            locks: KeyedLocks::new(),
            defaults,
        }
    }

    /// 为尚未广播的交易建立法定签名数要求
    pub async fn create_quorum(
        &self,
        transaction_id: Uuid,
        required_signatures: u32,
        ttl: Duration,
    ) -> AppResult<MultiSigTransaction> {
        let ttl = validate_quorum(required_signatures, ttl)?;

        let tx = self
            .transactions
            .find_by_id(transaction_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("transaction {transaction_id}")))?;
        if tx.is_broadcast() || tx.status.is_final() {
            return Err(AppError::invalid_input(format!(
                "transaction {transaction_id} was already broadcast"
            )));
        }
        if !tx.quorum_gated {
            return Err(AppError::invalid_input(format!(
                "transaction {transaction_id} was not signed for a quorum"
            )));
        }

        let multisig = self
            .multisigs
            .create(NewMultiSig {
                transaction_id,
                required_signatures,
                expires_at: Utc::now() + ttl,
            })
            .await
            .map_err(|e| match e {
                RepoError::Conflict(_) => AppError::invalid_input(format!(
                    "transaction {transaction_id} already has a quorum"
                )),
                other => other.into(),
            })?;

        tracing::info!(
            multisig_id = %multisig.id,
            %transaction_id,
            required_signatures,
            expires_at = %multisig.expires_at,
            "Quorum created"
        );
        Ok(multisig)
    }

    /// 发起多签转账：签名并保留载荷，然后建立法定签名数要求
    ///
    /// 未指定时使用默认配置（2 个签名，24 小时）
    pub async fn propose_transfer(
        &self,
        from_wallet_id: Uuid,
        to_address: &str,
        amount: Decimal,
        required_signatures: Option<u32>,
        ttl: Option<Duration>,
    ) -> AppResult<(Transaction, MultiSigTransaction)> {
        let required = required_signatures.unwrap_or(self.defaults.default_required_signatures);
        let ttl = ttl.unwrap_or_else(|| self.defaults.default_ttl());
        // 先校验参数，避免无效请求占用 nonce
        validate_quorum(required, ttl)?;

        let tx = self
            .engine
            .prepare_deferred(from_wallet_id, to_address, amount)
            .await?;

        let multisig = self.create_quorum(tx.id, required, ttl).await.map_err(|e| {
            tracing::error!(
                transaction_id = %tx.id,
                nonce = tx.nonce,
                error = %e,
                "Deferred transaction recorded without a quorum"
            );
            e
        })?;

        Ok((tx, multisig))
    }

    /// 用指定钱包签名
    ///
    /// 检查顺序：已签名 → 已达法定数 → 已过期
    pub async fn sign(&self, multisig_id: Uuid, signer_wallet_id: Uuid) -> AppResult<SignOutcome> {
        let result = self.sign_inner(multisig_id, signer_wallet_id).await;
        match &result {
            Ok(_) => metrics::signature("accepted"),
            Err(e) => metrics::signature(e.code()),
        }
        result
    }

    /// 用该用户的主钱包签名
    pub async fn sign_as_owner(&self, multisig_id: Uuid, owner_id: Uuid) -> AppResult<SignOutcome> {
        let wallet = self
            .wallets
            .find_primary(owner_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("primary wallet of owner {owner_id}")))?;
        self.sign(multisig_id, wallet.id).await
    }

    async fn sign_inner(
        &self,
        multisig_id: Uuid,
        signer_wallet_id: Uuid,
    ) -> AppResult<SignOutcome> {
        let _guard = self.locks.acquire(multisig_id).await;

        let multisig = self.load_multisig(multisig_id).await?;

        // 预检，避免无谓的解密；写入时仓库层会再复核一次
        if self.multisigs.has_signed(multisig_id, signer_wallet_id).await? {
            return Err(AppError::AlreadySigned);
        }
        if self.multisigs.count_signatures(multisig_id).await? >= multisig.required_signatures {
            return Err(AppError::QuorumAlreadyMet);
        }
        if multisig.is_expired_at(Utc::now()) {
            return Err(AppError::Expired);
        }

        let tx = self.load_transaction(multisig.transaction_id).await?;
        let wallet = self
            .wallets
            .find_by_id(signer_wallet_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("wallet {signer_wallet_id}")))?;
        let address = wallet
            .parsed_address()
            .map_err(|e| AppError::Storage(e.to_string()))?;

        let message = approval_message(&tx.tx_hash, &wallet.address);
        let signature = {
            let signer = self
                .vault
                .unseal_signer(&wallet.encrypted_private_key, address)
                .map_err(|e| {
                    tracing::error!(wallet_id = %wallet.id, error = %e, "Wallet key could not be unsealed");
                    AppError::key_corruption(wallet.id, e)
                })?;
            signer
                .sign_hash(hash_message(&message))
                .map_err(|e| AppError::SigningFailed {
                    nonce: tx.nonce,
                    reason: e.to_string(),
                })?
        };

        signature
            .verify(message.as_str(), address)
            .map_err(|e| AppError::SigningFailed {
                nonce: tx.nonce,
                reason: format!("approval signature does not verify: {e}"),
            })?;

        let outcome = self
            .multisigs
            .append_signature(
                NewSignature {
                    multisig_id,
                    signer_wallet_id,
                    signature: format!("0x{}", hex::encode(signature.to_vec())),
                },
                Utc::now(),
            )
            .await?;

        let tally = match outcome {
            AppendOutcome::Appended(tally) => tally,
            AppendOutcome::AlreadySigned => return Err(AppError::AlreadySigned),
            AppendOutcome::QuorumAlreadyMet => return Err(AppError::QuorumAlreadyMet),
            AppendOutcome::Expired => return Err(AppError::Expired),
        };

        tracing::info!(
            %multisig_id,
            signer_wallet_id = %signer_wallet_id,
            current = tally.current,
            required = tally.required,
            "Signature accepted"
        );

        let execution = if tally.execution_claimed {
            self.execute(multisig_id, tx.id).await
        } else {
            ExecutionOutcome::NotTriggered
        };

        Ok(SignOutcome {
            accepted: true,
            quorum_reached: tally.quorum_reached(),
            current_signatures: tally.current,
            required_signatures: tally.required,
            execution,
        })
    }

    /// 只由赢得执行权的签名调用一次
    async fn execute(&self, multisig_id: Uuid, transaction_id: Uuid) -> ExecutionOutcome {
        match self.engine.broadcast_prepared(transaction_id).await {
            Ok(tx) => {
                metrics::quorum_executed();
                tracing::info!(%multisig_id, tx_hash = %tx.tx_hash, "Quorum reached, transaction broadcast");
                ExecutionOutcome::Broadcast { tx_hash: tx.tx_hash }
            }
            Err(e) => {
                tracing::error!(%multisig_id, %transaction_id, error = %e, "Quorum execution failed");
                ExecutionOutcome::Failed {
                    code: e.code().to_string(),
                    message: e.to_string(),
                }
            }
        }
    }

    /// 执行权已占用但广播失败时重试（重发同一份已签名字节）
    pub async fn retry_execution(&self, multisig_id: Uuid) -> AppResult<Transaction> {
        let _guard = self.locks.acquire(multisig_id).await;

        let multisig = self.load_multisig(multisig_id).await?;
        if multisig.executed_at.is_none() {
            return Err(AppError::QuorumNotReached);
        }

        let tx = self.engine.broadcast_prepared(multisig.transaction_id).await?;
        tracing::info!(%multisig_id, tx_hash = %tx.tx_hash, "Quorum execution retried");
        Ok(tx)
    }

    pub async fn quorum_status(&self, multisig_id: Uuid) -> AppResult<QuorumStatus> {
        let multisig = self.load_multisig(multisig_id).await?;
        let transaction = self.load_transaction(multisig.transaction_id).await?;
        let signatures = self.multisigs.list_signatures(multisig_id).await?;

        let now: DateTime<Utc> = Utc::now();
        let quorum_reached = signatures.len() as u32 >= multisig.required_signatures;
        let expired = multisig.is_expired_at(now);
        let executed = multisig.executed_at.is_some();

        let blocking_nonce = (expired
            && !executed
            && !transaction.is_broadcast()
            && !transaction.status.is_final())
        .then_some(transaction.nonce);
        if let Some(nonce) = blocking_nonce {
            tracing::warn!(
                %multisig_id,
                wallet_id = %transaction.from_wallet_id,
                nonce,
                "Expired quorum still holds a nonce"
            );
        }

        Ok(QuorumStatus {
            expired,
            executed,
            quorum_reached,
            blocking_nonce,
            multisig,
            transaction,
            signatures,
        })
    }

    async fn load_multisig(&self, multisig_id: Uuid) -> AppResult<MultiSigTransaction> {
        self.multisigs
            .find_by_id(multisig_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("multisig {multisig_id}")))
    }

    async fn load_transaction(&self, transaction_id: Uuid) -> AppResult<Transaction> {
        self.transactions
            .find_by_id(transaction_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("transaction {transaction_id}")))
    }
}

fn validate_quorum(required_signatures: u32, ttl: Duration) -> AppResult<chrono::Duration> {
    if required_signatures < 1 {
        return Err(AppError::invalid_input("required_signatures must be at least 1"));
    }
    if ttl.is_zero() {
        return Err(AppError::invalid_input("ttl must be greater than zero"));
    }
    chrono::Duration::from_std(ttl).map_err(|e| AppError::invalid_input(format!("ttl out of range: {e}")))
}
