//! 链上对账：回执 → 终态，幂等，单笔错误不影响整轮

mod common;

use std::{sync::Arc, time::Duration};

use common::{ether, external_address, test_context, TestContext};
use ironvault::{
    config::ReconcilerConfig,
    domain::TransactionStatus,
    error::AppError,
    repository::Transaction,
    service::{
        chain_gateway::{GatewayError, ReceiptStatus},
        reconciler::ReconcileReport,
        Reconciler,
    },
};
use rust_decimal::Decimal;
use tokio::sync::watch;
use uuid::Uuid;

async fn submit(ctx: &TestContext, count: usize) -> Vec<Transaction> {
    let wallet = ctx
        .state
        .registry
        .create_wallet(Uuid::new_v4())
        .await
        .unwrap();
    ctx.chain
        .set_balance(wallet.parsed_address().unwrap(), ether(100));

    let mut txs = Vec::with_capacity(count);
    for _ in 0..count {
        txs.push(
            ctx.state
                .engine
                .transfer(wallet.id, &external_address(), Decimal::ONE)
                .await
                .unwrap(),
        );
    }
    txs
}

async fn status_of(ctx: &TestContext, tx: &Transaction) -> Transaction {
    ctx.state
        .transactions
        .find_by_id(tx.id)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_receipts_finalize_transactions() {
    let ctx = test_context();
    let txs = submit(&ctx, 3).await;

    ctx.chain
        .set_receipt(&txs[0].tx_hash, ReceiptStatus::Success, 21_000);
    ctx.chain
        .set_receipt(&txs[1].tx_hash, ReceiptStatus::Failure, 20_500);

    let report = ctx.state.reconciler.reconcile_once().await.unwrap();
    assert_eq!(
        report,
        ReconcileReport {
            checked: 3,
            completed: 1,
            failed: 1,
            still_pending: 1,
            errors: 0,
        }
    );

    let completed = status_of(&ctx, &txs[0]).await;
    assert_eq!(completed.status, TransactionStatus::Completed);
    assert_eq!(completed.gas_used, Some(21_000));

    let failed = status_of(&ctx, &txs[1]).await;
    assert_eq!(failed.status, TransactionStatus::Failed);
    assert_eq!(failed.gas_used, Some(20_500));

    assert_eq!(status_of(&ctx, &txs[2]).await.status, TransactionStatus::Pending);
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let ctx = test_context();
    let txs = submit(&ctx, 1).await;
    ctx.chain
        .set_receipt(&txs[0].tx_hash, ReceiptStatus::Success, 21_000);

    let first = ctx.state.reconciler.reconcile_once().await.unwrap();
    assert_eq!(first.completed, 1);

    // 终态交易不再被拉取
    let second = ctx.state.reconciler.reconcile_once().await.unwrap();
    assert_eq!(second, ReconcileReport::default());
    assert_eq!(
        status_of(&ctx, &txs[0]).await.status,
        TransactionStatus::Completed
    );
}

#[tokio::test]
async fn test_node_errors_are_isolated_per_transaction() {
    let ctx = test_context();
    let txs = submit(&ctx, 2).await;

    ctx.chain.fail_receipt(
        &txs[0].tx_hash,
        GatewayError::NodeUnreachable("timeout".into()),
    );
    ctx.chain
        .set_receipt(&txs[1].tx_hash, ReceiptStatus::Success, 21_000);

    let report = ctx.state.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(report.completed, 1);

    assert_eq!(status_of(&ctx, &txs[0]).await.status, TransactionStatus::Pending);
    assert_eq!(
        status_of(&ctx, &txs[1]).await.status,
        TransactionStatus::Completed
    );
}

#[tokio::test]
async fn test_stuck_transactions_do_not_hide_newer_ones() {
    let ctx = test_context();
    let txs = submit(&ctx, 5).await;
    let newest = txs.last().unwrap();
    ctx.chain
        .set_receipt(&newest.tx_hash, ReceiptStatus::Success, 21_000);

    let reconciler = Reconciler::new(
        ctx.state.transactions.clone(),
        ctx.chain.clone(),
        &ReconcilerConfig {
            interval_secs: 1,
            batch_size: 2,
        },
    );

    let report = reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.checked, 5);
    assert_eq!(report.completed, 1);
    assert_eq!(report.still_pending, 4);
    assert_eq!(status_of(&ctx, newest).await.status, TransactionStatus::Completed);

    let again = reconciler.reconcile_once().await.unwrap();
    assert_eq!(again.checked, 4);
    assert_eq!(again.still_pending, 4);
}

#[tokio::test]
async fn test_unconfirmed_submission_is_confirmed_by_hash() {
    let ctx = test_context();
    let wallet = ctx
        .state
        .registry
        .create_wallet(Uuid::new_v4())
        .await
        .unwrap();
    ctx.chain
        .set_balance(wallet.parsed_address().unwrap(), ether(10));

    // 节点收下了交易，但应答丢失
    ctx.chain.lose_responses(true);
    let err = ctx
        .state
        .engine
        .transfer(wallet.id, &external_address(), Decimal::ONE)
        .await
        .unwrap_err();
    let (tx_hash, transaction_id) = match err {
        AppError::SubmissionFailed {
            tx_hash,
            transaction_id: Some(id),
            ..
        } => (tx_hash, id),
        other => panic!("unexpected error: {other:?}"),
    };
    assert_eq!(ctx.chain.submitted().len(), 1);

    ctx.chain.set_receipt(&tx_hash, ReceiptStatus::Success, 21_000);
    let report = ctx.state.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.completed, 1);

    let confirmed = ctx
        .state
        .transactions
        .find_by_id(transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(confirmed.status, TransactionStatus::Completed);
    assert!(confirmed.is_broadcast());
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() {
    let ctx = test_context();
    let txs = submit(&ctx, 1).await;
    ctx.chain
        .set_receipt(&txs[0].tx_hash, ReceiptStatus::Success, 21_000);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&ctx.state.reconciler).run(shutdown_rx));

    // 第一次 tick 立即触发
    let mut finalized = false;
    for _ in 0..50 {
        if status_of(&ctx, &txs[0]).await.status == TransactionStatus::Completed {
            finalized = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(finalized);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("reconciler did not stop")
        .unwrap();
}
