//! PostgreSQL 仓储集成测试
//!
//! 需要可用的数据库：TEST_DATABASE_URL=postgres://... cargo test -- --ignored

use std::sync::Arc;

use chrono::{Duration, Utc};
use ironvault::{
    domain::TransactionStatus,
    infrastructure::db::PgPool,
    repository::{
        AppendOutcome, MultiSigRepository, NewMultiSig, NewSignature, NewTransaction,
        NewWallet, PendingCursor, PgMultiSigRepository, PgTransactionRepository, PgWalletRepository, RepoError,
        TransactionRepository, WalletRepository,
    },
};
use rust_decimal::Decimal;
use uuid::Uuid;

fn test_database_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgres://postgres@localhost:5432/ironvault_test".into())
}

async fn create_test_pool() -> PgPool {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&test_database_url())
        .await
        .expect("Failed to create test database pool");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

fn random_address() -> String {
    format!("0x{}", hex::encode(Uuid::new_v4().as_bytes()) + &"ab".repeat(4))
}

fn new_wallet(owner_id: Uuid) -> NewWallet {
    NewWallet {
        owner_id,
        address: random_address(),
        encrypted_private_key: "c2VhbGVk".into(),
    }
}

fn new_tx(wallet_id: Uuid, nonce: u64) -> NewTransaction {
    NewTransaction {
        from_wallet_id: wallet_id,
        to_address: random_address(),
        amount: Decimal::new(15, 1),
        gas_price: Decimal::from(20),
        tx_hash: format!("0x{}{}", hex::encode(Uuid::new_v4().as_bytes()), "cd".repeat(16)),
        nonce,
        raw_transaction: "0xf86c".into(),
        broadcast: true,
        quorum_gated: false,
    }
}

#[tokio::test]
#[ignore]
async fn test_pg_primary_wallet_election() {
    let repo = PgWalletRepository::new(create_test_pool().await);
    let owner = Uuid::new_v4();

    let first = repo.create(new_wallet(owner)).await.unwrap();
    let second = repo.create(new_wallet(owner)).await.unwrap();
    assert!(first.is_primary);
    assert!(!second.is_primary);

    repo.set_primary(owner, second.id).await.unwrap();
    assert_eq!(repo.find_primary(owner).await.unwrap().unwrap().id, second.id);

    let err = repo.set_primary(Uuid::new_v4(), first.id).await.unwrap_err();
    assert!(matches!(err, RepoError::NotFound(_)));
}

#[tokio::test]
#[ignore]
async fn test_pg_concurrent_creates_keep_one_primary() {
    let repo = Arc::new(PgWalletRepository::new(create_test_pool().await));
    let owner = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move { repo.create(new_wallet(owner)).await }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let wallets = repo.list_by_owner(owner).await.unwrap();
    assert_eq!(wallets.len(), 5);
    assert_eq!(wallets.iter().filter(|w| w.is_primary).count(), 1);
}

#[tokio::test]
#[ignore]
async fn test_pg_transaction_constraints() {
    let pool = create_test_pool().await;
    let wallets = PgWalletRepository::new(pool.clone());
    let transactions = PgTransactionRepository::new(pool);

    let wallet = wallets.create(new_wallet(Uuid::new_v4())).await.unwrap();
    let tx = transactions.insert(new_tx(wallet.id, 0)).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(tx.amount, Decimal::new(15, 1));
    assert_eq!(transactions.max_nonce(wallet.id).await.unwrap(), Some(0));

    let dup_nonce = transactions.insert(new_tx(wallet.id, 0)).await.unwrap_err();
    assert!(matches!(dup_nonce, RepoError::Conflict(_)));

    let mut dup_hash = new_tx(wallet.id, 1);
    dup_hash.tx_hash = tx.tx_hash.clone();
    assert!(matches!(
        transactions.insert(dup_hash).await.unwrap_err(),
        RepoError::Conflict(_)
    ));

    assert!(transactions
        .finalize(tx.id, TransactionStatus::Completed, Some(21_000))
        .await
        .unwrap());
    assert!(!transactions
        .finalize(tx.id, TransactionStatus::Failed, None)
        .await
        .unwrap());

    let stored = transactions.find_by_hash(&tx.tx_hash).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Completed);
    assert_eq!(stored.gas_used, Some(21_000));

    let err = wallets.delete(wallet.id).await.unwrap_err();
    assert!(matches!(err, RepoError::Referenced(_)));
}

#[tokio::test]
#[ignore]
async fn test_pg_parallel_signatures_claim_execution_once() {
    let pool = create_test_pool().await;
    let wallets = PgWalletRepository::new(pool.clone());
    let transactions = PgTransactionRepository::new(pool.clone());
    let multisigs = Arc::new(PgMultiSigRepository::new(pool));

    let source = wallets.create(new_wallet(Uuid::new_v4())).await.unwrap();
    let mut deferred = new_tx(source.id, 0);
    deferred.broadcast = false;
    deferred.quorum_gated = true;
    let tx = transactions.insert(deferred).await.unwrap();
    assert!(!tx.is_broadcast());
    assert!(tx.quorum_gated);

    let multisig = multisigs
        .create(NewMultiSig {
            transaction_id: tx.id,
            required_signatures: 2,
            expires_at: Utc::now() + Duration::hours(1),
        })
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let signer = wallets.create(new_wallet(Uuid::new_v4())).await.unwrap();
        let multisigs = multisigs.clone();
        let multisig_id = multisig.id;
        handles.push(tokio::spawn(async move {
            multisigs
                .append_signature(
                    NewSignature {
                        multisig_id,
                        signer_wallet_id: signer.id,
                        signature: "0x00".into(),
                    },
                    Utc::now(),
                )
                .await
        }));
    }

    let mut claimed = 0;
    let mut appended = 0;
    for h in handles {
        match h.await.unwrap().unwrap() {
            AppendOutcome::Appended(tally) => {
                appended += 1;
                if tally.execution_claimed {
                    claimed += 1;
                }
            }
            AppendOutcome::QuorumAlreadyMet => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(appended, 2);
    assert_eq!(claimed, 1);

    let stored = multisigs.find_by_id(multisig.id).await.unwrap().unwrap();
    assert_eq!(stored.current_signatures, 2);
    assert!(stored.executed_at.is_some());
    assert_eq!(multisigs.count_signatures(multisig.id).await.unwrap(), 2);
}

#[tokio::test]
#[ignore]
async fn test_pg_pending_pages_include_unconfirmed_rows() {
    let pool = create_test_pool().await;
    let wallets = PgWalletRepository::new(pool.clone());
    let transactions = PgTransactionRepository::new(pool);

    let wallet = wallets.create(new_wallet(Uuid::new_v4())).await.unwrap();
    let mut unconfirmed = new_tx(wallet.id, 0);
    unconfirmed.broadcast = false;
    let unconfirmed = transactions.insert(unconfirmed).await.unwrap();
    let mut ours = vec![unconfirmed.id];
    for nonce in 1..4 {
        ours.push(transactions.insert(new_tx(wallet.id, nonce)).await.unwrap().id);
    }

    // 库里可能还有其他测试留下的行，只核对本钱包的
    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = transactions.list_pending(cursor, 2).await.unwrap();
        let Some(last) = page.last() else { break };
        cursor = Some(PendingCursor::from(last));
        seen.extend(
            page.iter()
                .filter(|t| t.from_wallet_id == wallet.id)
                .map(|t| t.id),
        );
    }
    assert_eq!(seen.len(), ours.len());
    for id in &ours {
        assert!(seen.contains(id));
    }

    assert!(transactions
        .finalize(unconfirmed.id, TransactionStatus::Completed, Some(21_000))
        .await
        .unwrap());
    let stored = transactions.find_by_id(unconfirmed.id).await.unwrap().unwrap();
    assert!(stored.is_broadcast());
}
