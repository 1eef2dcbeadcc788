//! 交易引擎
//!
//! 转账流程：校验 → 余额预检 → 锁定钱包并分配 nonce → gas 价格 → 解密签名 → 广播 → 落库(PENDING)
//!
//! 余额预检只是预检：与同一钱包的其他并发转账之间存在竞争，链上余额才是唯一依据
//!
//! 广播结果不明（连接中断、超时）时载荷作为未确认记录保存，nonce 继续占用；
//! 只有节点明确拒绝才释放 nonce

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use ethers::types::Address;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    domain::amount,
    error::{AppError, AppResult},
    infrastructure::{key_vault::KeyVault, log_redact},
    metrics,
    repository::{
        MultiSigRepository, NewTransaction, Transaction, TransactionRepository, Wallet,
        WalletRepository,
    },
    service::{
        chain_gateway::{ChainGateway, Receipt},
        nonce_manager::{NonceLease, NonceManager},
        transaction_builder::{self, SignedTransfer, TransferRequest},
    },
    utils::address_validator,
};

/// 已签名但尚未广播/落库的转账
struct PreparedTransfer {
    wallet_id: Uuid,
    to_address: String,
    amount: Decimal,
    gas_price_gwei: Decimal,
    nonce: u64,
    signed: SignedTransfer,
    lease: NonceLease,
}

impl PreparedTransfer {
    fn record(&self, broadcast: bool, quorum_gated: bool) -> NewTransaction {
        NewTransaction {
            from_wallet_id: self.wallet_id,
            to_address: self.to_address.clone(),
            amount: self.amount,
            gas_price: self.gas_price_gwei,
            tx_hash: self.signed.tx_hash.clone(),
            nonce: self.nonce,
            raw_transaction: self.signed.raw_hex(),
            broadcast,
            quorum_gated,
        }
    }
}

/// 交易详情（记录 + 链上回执）
#[derive(Debug, Clone, Serialize)]
pub struct TransactionView {
    pub transaction: Transaction,
    pub receipt: Option<Receipt>,
    pub block_timestamp: Option<DateTime<Utc>>,
    pub confirmations: Option<u64>,
    /// 节点查询失败时只返回本地记录，并附上错误信息
    pub node_error: Option<String>,
}

pub struct TransactionEngine {
    wallets: Arc<dyn WalletRepository>,
    transactions: Arc<dyn TransactionRepository>,
    multisigs: Arc<dyn MultiSigRepository>,
    gateway: Arc<dyn ChainGateway>,
    vault: Arc<KeyVault>,
    nonces: Arc<NonceManager>,
    chain_id: u64,
}

impl TransactionEngine {
    pub fn new(
        wallets: Arc<dyn WalletRepository>,
        transactions: Arc<dyn TransactionRepository>,
        multisigs: Arc<dyn MultiSigRepository>,
        gateway: Arc<dyn ChainGateway>,
        vault: Arc<KeyVault>,
        nonces: Arc<NonceManager>,
        chain_id: u64,
    ) -> Self {
        Self {
            wallets,
            transactions,
            multisigs,
            gateway,
            vault,
            nonces,
            chain_id,
        }
    }

    /// 立即广播的转账，成功后返回 PENDING 记录
    ///
    /// 一旦开始广播，广播与落库在独立任务中完成：调用方中途放弃也不会丢失交易哈希
    pub async fn transfer(
        &self,
        from_wallet_id: Uuid,
        to_address: &str,
        amount: Decimal,
    ) -> AppResult<Transaction> {
        let result = self.transfer_inner(from_wallet_id, to_address, amount).await;
        match &result {
            Ok(_) => metrics::transfer("submitted"),
            Err(e) => metrics::transfer(e.code()),
        }
        result
    }

    async fn transfer_inner(
        &self,
        from_wallet_id: Uuid,
        to_address: &str,
        amount: Decimal,
    ) -> AppResult<Transaction> {
        let prepared = self.prepare(from_wallet_id, to_address, amount).await?;

        let gateway = self.gateway.clone();
        let transactions = self.transactions.clone();
        tokio::spawn(submit_and_record(gateway, transactions, prepared))
            .await
            .map_err(|e| AppError::Storage(format!("transfer task aborted: {e}")))?
    }

    /// 多签转账：签名并保留载荷，记录为未广播的 PENDING 交易
    ///
    /// nonce 在此时就被占用，哈希由签名字节确定，审批消息可以绑定它
    pub async fn prepare_deferred(
        &self,
        from_wallet_id: Uuid,
        to_address: &str,
        amount: Decimal,
    ) -> AppResult<Transaction> {
        let prepared = self.prepare(from_wallet_id, to_address, amount).await?;

        let tx = self
            .transactions
            .insert(prepared.record(false, true))
            .await
            .map_err(|e| {
                tracing::error!(
                    wallet_id = %prepared.wallet_id,
                    nonce = prepared.nonce,
                    tx_hash = %prepared.signed.tx_hash,
                    error = %e,
                    "Failed to record deferred transaction"
                );
                AppError::from(e)
            })?;

        tracing::info!(
            transaction_id = %tx.id,
            wallet_id = %tx.from_wallet_id,
            nonce = tx.nonce,
            tx_hash = %tx.tx_hash,
            "Deferred transaction signed and recorded"
        );

        drop(prepared.lease);
        Ok(tx)
    }

    /// 广播事先签好的交易：多签达成后的执行，或广播结果不明时重发
    ///
    /// 幂等：已广播的交易直接返回；重试只会重发同一份字节，不会产生第二笔交易。
    /// 多签交易必须已被多签记录占用执行权
    pub async fn broadcast_prepared(&self, transaction_id: Uuid) -> AppResult<Transaction> {
        let tx = self
            .transactions
            .find_by_id(transaction_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("transaction {transaction_id}")))?;

        if tx.is_broadcast() || tx.status.is_final() {
            return Ok(tx);
        }

        if tx.quorum_gated {
            let claimed = self
                .multisigs
                .find_by_transaction(tx.id)
                .await?
                .map_or(false, |m| m.executed_at.is_some());
            if !claimed {
                tracing::warn!(
                    %transaction_id,
                    tx_hash = %tx.tx_hash,
                    "Refused to broadcast a quorum-gated transaction before its quorum"
                );
                return Err(AppError::QuorumNotReached);
            }
        }

        let gateway = self.gateway.clone();
        let transactions = self.transactions.clone();
        tokio::spawn(rebroadcast(gateway, transactions, tx))
            .await
            .map_err(|e| AppError::Storage(format!("broadcast task aborted: {e}")))?
    }

    /// 交易详情：本地记录 + 回执 + 区块时间 + 确认数
    pub async fn transaction_status(&self, tx_hash: &str) -> AppResult<TransactionView> {
        let transaction = self
            .transactions
            .find_by_hash(tx_hash)
            .await?
            .ok_or_else(|| AppError::not_found(format!("transaction {tx_hash}")))?;

        let mut view = TransactionView {
            transaction,
            receipt: None,
            block_timestamp: None,
            confirmations: None,
            node_error: None,
        };

        // 等待多签的交易还没有发出；结果不明的交易仍按哈希查询
        if !view.transaction.is_broadcast() && view.transaction.quorum_gated {
            return Ok(view);
        }

        match self.chain_details(&view.transaction.tx_hash).await {
            Ok((receipt, block_timestamp, confirmations)) => {
                view.receipt = receipt;
                view.block_timestamp = block_timestamp;
                view.confirmations = confirmations;
            }
            Err(e) => {
                tracing::warn!(tx_hash = %view.transaction.tx_hash, error = %e, "Receipt lookup failed");
                view.node_error = Some(e.to_string());
            }
        }

        Ok(view)
    }

    async fn chain_details(
        &self,
        tx_hash: &str,
    ) -> AppResult<(Option<Receipt>, Option<DateTime<Utc>>, Option<u64>)> {
        let Some(receipt) = self.gateway.get_receipt(tx_hash).await? else {
            return Ok((None, None, None));
        };

        let block = self.gateway.get_block(receipt.block_number).await?;
        let head = self.gateway.get_block_number().await?;

        let timestamp = i64::try_from(block.timestamp)
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        let confirmations = head.saturating_sub(receipt.block_number);

        Ok((Some(receipt), timestamp, Some(confirmations)))
    }

    /// 用户的交易历史：从其钱包发出或发往其钱包地址，按时间倒序
    pub async fn transaction_history(
        &self,
        owner_id: Uuid,
        limit: i64,
    ) -> AppResult<Vec<Transaction>> {
        let wallets = self.wallets.list_by_owner(owner_id).await?;
        if wallets.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = wallets.iter().map(|w| w.id).collect();
        let addresses: Vec<String> = wallets.iter().map(|w| w.address.clone()).collect();

        Ok(self
            .transactions
            .list_history(&ids, &addresses, limit.max(1))
            .await?)
    }

    /// 步骤 1-4：校验、预检、分配 nonce、签名
    ///
    /// 这里返回之前没有任何外部副作用，调用方放弃 future 即可取消
    async fn prepare(
        &self,
        from_wallet_id: Uuid,
        to_address: &str,
        amount: Decimal,
    ) -> AppResult<PreparedTransfer> {
        // 1. 校验
        let to = address_validator::parse_address(to_address)?;
        if amount <= Decimal::ZERO {
            return Err(AppError::invalid_input("amount must be greater than zero"));
        }
        let value = amount::ether_to_wei(amount)?;

        let wallet = self.load_wallet(from_wallet_id).await?;
        let from = wallet
            .parsed_address()
            .map_err(|e| AppError::Storage(e.to_string()))?;

        // 2. 余额预检
        let balance = self.gateway.get_balance(from).await?;
        if balance < value {
            tracing::info!(
                wallet_id = %wallet.id,
                required = %value,
                available = %balance,
                "Transfer rejected by balance pre-check"
            );
            return Err(AppError::InsufficientFunds {
                required: value,
                available: balance,
            });
        }

        // 3. nonce 与 gas 价格
        let lease = self.nonces.reserve(wallet.id, from).await?;
        let gas_price = self.gateway.get_gas_price().await?;

        // 4. 解密并签名，签名器离开作用域即丢弃
        let request = TransferRequest {
            nonce: lease.nonce,
            gas_price,
            to,
            value,
            chain_id: self.chain_id,
        };
        let signed = self.sign(&wallet, from, &request)?;

        Ok(PreparedTransfer {
            wallet_id: wallet.id,
            to_address: address_validator::checksum(&to),
            amount,
            gas_price_gwei: amount::wei_to_gwei(gas_price)?,
            nonce: request.nonce,
            signed,
            lease,
        })
    }

    fn sign(&self, wallet: &Wallet, from: Address, request: &TransferRequest) -> AppResult<SignedTransfer> {
        let signer = self
            .vault
            .unseal_signer(&wallet.encrypted_private_key, from)
            .map_err(|e| {
                tracing::error!(wallet_id = %wallet.id, error = %e, "Wallet key could not be unsealed");
                AppError::key_corruption(wallet.id, e)
            })?;

        transaction_builder::sign_transfer(&signer, request)
    }

    async fn load_wallet(&self, wallet_id: Uuid) -> AppResult<Wallet> {
        self.wallets
            .find_by_id(wallet_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("wallet {wallet_id}")))
    }
}

/// 步骤 5-6：广播并落库；持有 nonce 租约直到记录写入（含未确认记录）
async fn submit_and_record(
    gateway: Arc<dyn ChainGateway>,
    transactions: Arc<dyn TransactionRepository>,
    prepared: PreparedTransfer,
) -> AppResult<Transaction> {
    let raw_hex = prepared.signed.raw_hex();

    match gateway.submit_raw_transaction(&prepared.signed.raw).await {
        Ok(node_hash) => {
            if !node_hash.eq_ignore_ascii_case(&prepared.signed.tx_hash) {
                tracing::warn!(
                    expected = %prepared.signed.tx_hash,
                    reported = %node_hash,
                    "Node reported a different transaction hash"
                );
            }
        }
        Err(source) => {
            tracing::warn!(
                wallet_id = %prepared.wallet_id,
                nonce = prepared.nonce,
                tx_hash = %prepared.signed.tx_hash,
                raw = %log_redact::redact_raw_transaction(&raw_hex),
                error = %source,
                "Transaction submission failed"
            );
            let transaction_id = if source.is_ambiguous() {
                keep_unconfirmed(transactions.as_ref(), &prepared).await
            } else {
                None
            };
            return Err(AppError::SubmissionFailed {
                nonce: prepared.nonce,
                tx_hash: prepared.signed.tx_hash.clone(),
                raw_transaction: raw_hex,
                transaction_id,
                source,
            });
        }
    }

    let tx = transactions
        .insert(prepared.record(true, false))
        .await
        .map_err(|e| {
            // 已广播但没有记录：必须人工介入
            tracing::error!(
                wallet_id = %prepared.wallet_id,
                nonce = prepared.nonce,
                tx_hash = %prepared.signed.tx_hash,
                raw = %log_redact::redact_raw_transaction(&raw_hex),
                error = %e,
                "Broadcast transaction could not be recorded"
            );
            AppError::PersistenceFailed {
                tx_hash: prepared.signed.tx_hash.clone(),
                reason: e.to_string(),
            }
        })?;

    tracing::info!(
        transaction_id = %tx.id,
        wallet_id = %tx.from_wallet_id,
        nonce = tx.nonce,
        tx_hash = %tx.tx_hash,
        "Transaction submitted"
    );

    drop(prepared.lease);
    Ok(tx)
}

/// 节点可能已收到交易：保存载荷以占住 nonce，返回记录 id
async fn keep_unconfirmed(
    transactions: &dyn TransactionRepository,
    prepared: &PreparedTransfer,
) -> Option<Uuid> {
    match transactions.insert(prepared.record(false, false)).await {
        Ok(tx) => {
            tracing::warn!(
                transaction_id = %tx.id,
                wallet_id = %tx.from_wallet_id,
                nonce = tx.nonce,
                tx_hash = %tx.tx_hash,
                "Submission outcome unknown, payload kept and nonce reserved"
            );
            Some(tx.id)
        }
        Err(e) => {
            tracing::error!(
                wallet_id = %prepared.wallet_id,
                nonce = prepared.nonce,
                tx_hash = %prepared.signed.tx_hash,
                error = %e,
                "Unconfirmed transaction could not be recorded"
            );
            None
        }
    }
}

async fn rebroadcast(
    gateway: Arc<dyn ChainGateway>,
    transactions: Arc<dyn TransactionRepository>,
    tx: Transaction,
) -> AppResult<Transaction> {
    let signed = SignedTransfer::from_raw_hex(&tx.raw_transaction).map_err(|e| {
        AppError::Storage(format!("transaction {} has unreadable payload: {e}", tx.id))
    })?;

    if let Err(source) = gateway.submit_raw_transaction(&signed.raw).await {
        tracing::warn!(
            transaction_id = %tx.id,
            nonce = tx.nonce,
            tx_hash = %tx.tx_hash,
            error = %source,
            "Prepared transaction broadcast failed"
        );
        return Err(AppError::SubmissionFailed {
            nonce: tx.nonce,
            tx_hash: tx.tx_hash.clone(),
            raw_transaction: tx.raw_transaction.clone(),
            transaction_id: Some(tx.id),
            source,
        });
    }

    let updated = transactions.mark_broadcast(tx.id).await.map_err(|e| {
        tracing::error!(
            transaction_id = %tx.id,
            tx_hash = %tx.tx_hash,
            error = %e,
            "Broadcast transaction could not be marked"
        );
        AppError::PersistenceFailed {
            tx_hash: tx.tx_hash.clone(),
            reason: e.to_string(),
        }
    })?;

    tracing::info!(
        transaction_id = %updated.id,
        tx_hash = %updated.tx_hash,
        "Prepared transaction broadcast"
    );
    Ok(updated)
}
