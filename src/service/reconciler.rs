//! 交易对账服务
//!
//! 后台循环：每轮按 (created_at, id) 分页遍历全部 PENDING 交易，查询回执并推进到终态。
//! 广播结果不明的交易也在其中，按确定的哈希确认是否上链。
//! 单笔交易的错误只记录日志，不会中断本轮对账

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};

use crate::{
    config::ReconcilerConfig,
    domain::TransactionStatus,
    error::AppResult,
    metrics,
    repository::{PendingCursor, Transaction, TransactionRepository},
    service::chain_gateway::{ChainGateway, ReceiptStatus},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub errors: usize,
}

enum ItemOutcome {
    Finalized(TransactionStatus),
    StillPending,
    /// 已被其他对账者推进到终态
    AlreadyFinal,
}

pub struct Reconciler {
    transactions: Arc<dyn TransactionRepository>,
    gateway: Arc<dyn ChainGateway>,
    interval: Duration,
    batch_size: i64,
}

impl Reconciler {
    pub fn new(
        transactions: Arc<dyn TransactionRepository>,
        gateway: Arc<dyn ChainGateway>,
        config: &ReconcilerConfig,
    ) -> Self {
        Self {
            transactions,
            gateway,
            interval: config.interval(),
            batch_size: config.batch_size.max(1),
        }
    }

    /// 执行一轮对账
    ///
    /// batch_size 只决定每页大小；卡住的旧交易不会挡住后面的交易
    pub async fn reconcile_once(&self) -> AppResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut cursor: Option<PendingCursor> = None;

        loop {
            let page = self
                .transactions
                .list_pending(cursor, self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(PendingCursor::from(last));
            let full_page = page.len() as i64 >= self.batch_size;

            for tx in &page {
                report.checked += 1;
                match self.reconcile_one(tx).await {
                    Ok(ItemOutcome::Finalized(TransactionStatus::Completed)) => {
                        report.completed += 1
                    }
                    Ok(ItemOutcome::Finalized(_)) => report.failed += 1,
                    Ok(ItemOutcome::StillPending) => report.still_pending += 1,
                    Ok(ItemOutcome::AlreadyFinal) => {}
                    Err(e) => {
                        report.errors += 1;
                        tracing::warn!(
                            transaction_id = %tx.id,
                            tx_hash = %tx.tx_hash,
                            error = %e,
                            "Failed to reconcile transaction"
                        );
                    }
                }
            }

            if !full_page {
                break;
            }
        }

        metrics::reconcile_pass(
            report.completed as u64,
            report.failed as u64,
            report.errors as u64,
        );
        Ok(report)
    }

    async fn reconcile_one(&self, tx: &Transaction) -> AppResult<ItemOutcome> {
        let Some(receipt) = self.gateway.get_receipt(&tx.tx_hash).await? else {
            return Ok(ItemOutcome::StillPending);
        };

        let status = match receipt.status {
            ReceiptStatus::Success => TransactionStatus::Completed,
            ReceiptStatus::Failure => TransactionStatus::Failed,
        };

        let updated = self
            .transactions
            .finalize(tx.id, status, Some(receipt.gas_used))
            .await?;

        if !updated {
            return Ok(ItemOutcome::AlreadyFinal);
        }

        if !tx.is_broadcast() {
            tracing::warn!(
                transaction_id = %tx.id,
                tx_hash = %tx.tx_hash,
                "Receipt found for a transaction never confirmed as broadcast"
            );
        }

        tracing::info!(
            transaction_id = %tx.id,
            tx_hash = %tx.tx_hash,
            %status,
            gas_used = receipt.gas_used,
            block_number = receipt.block_number,
            "Transaction finalized"
        );
        Ok(ItemOutcome::Finalized(status))
    }

    /// 固定间隔循环，直到收到关闭信号
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Reconciler started, interval={}s, batch_size={}",
            self.interval.as_secs(),
            self.batch_size
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(report) if report.checked > 0 => {
                            tracing::info!(
                                checked = report.checked,
                                completed = report.completed,
                                failed = report.failed,
                                still_pending = report.still_pending,
                                errors = report.errors,
                                "Reconcile pass finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = ?e, "Reconcile pass failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Reconciler stopped");
    }
}
