//! 内存存储
//!
//! 与 PostgreSQL 实现保持相同的约束语义（唯一性、外键 RESTRICT、条件更新），
//! 供测试和无数据库的本地联调使用

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AppendOutcome, MultiSigRepository, MultiSigTransaction, NewMultiSig, NewSignature,
    NewTransaction, NewWallet, PendingCursor, RepoError, RepoResult, SignatureTally, Transaction,
    TransactionRepository, TransactionSignature, Wallet, WalletRepository,
};
use crate::domain::TransactionStatus;

#[derive(Default)]
struct Tables {
    wallets: Vec<Wallet>,
    transactions: Vec<Transaction>,
    multisigs: Vec<MultiSigTransaction>,
    signatures: Vec<TransactionSignature>,
}

impl Tables {
    fn signature_count(&self, multisig_id: Uuid) -> u32 {
        self.signatures
            .iter()
            .filter(|s| s.multisig_id == multisig_id)
            .count() as u32
    }
}

/// 三张表共用一把读写锁
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletRepository for MemoryStore {
    async fn create(&self, input: NewWallet) -> RepoResult<Wallet> {
        let mut tables = self.tables.write().await;

        if tables
            .wallets
            .iter()
            .any(|w| w.address.eq_ignore_ascii_case(&input.address))
        {
            return Err(RepoError::Conflict("wallet address".into()));
        }

        let is_primary = !tables.wallets.iter().any(|w| w.owner_id == input.owner_id);
        let wallet = Wallet {
            id: Uuid::new_v4(),
            owner_id: input.owner_id,
            address: input.address,
            encrypted_private_key: input.encrypted_private_key,
            is_primary,
            created_at: Utc::now(),
        };
        tables.wallets.push(wallet.clone());
        Ok(wallet)
    }

    async fn find_by_id(&self, wallet_id: Uuid) -> RepoResult<Option<Wallet>> {
        let tables = self.tables.read().await;
        Ok(tables.wallets.iter().find(|w| w.id == wallet_id).cloned())
    }

    async fn find_by_address(&self, address: &str) -> RepoResult<Option<Wallet>> {
        let tables = self.tables.read().await;
        Ok(tables
            .wallets
            .iter()
            .find(|w| w.address.eq_ignore_ascii_case(address))
            .cloned())
    }

    async fn list_by_owner(&self, owner_id: Uuid) -> RepoResult<Vec<Wallet>> {
        let tables = self.tables.read().await;
        Ok(tables
            .wallets
            .iter()
            .filter(|w| w.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn find_primary(&self, owner_id: Uuid) -> RepoResult<Option<Wallet>> {
        let tables = self.tables.read().await;
        Ok(tables
            .wallets
            .iter()
            .find(|w| w.owner_id == owner_id && w.is_primary)
            .cloned())
    }

    async fn set_primary(&self, owner_id: Uuid, wallet_id: Uuid) -> RepoResult<Wallet> {
        let mut tables = self.tables.write().await;

        if !tables
            .wallets
            .iter()
            .any(|w| w.id == wallet_id && w.owner_id == owner_id)
        {
            return Err(RepoError::NotFound(format!(
                "wallet {wallet_id} of owner {owner_id}"
            )));
        }

        let mut promoted = None;
        for wallet in tables.wallets.iter_mut().filter(|w| w.owner_id == owner_id) {
            wallet.is_primary = wallet.id == wallet_id;
            if wallet.is_primary {
                promoted = Some(wallet.clone());
            }
        }
        promoted.ok_or_else(|| RepoError::NotFound(format!("wallet {wallet_id}")))
    }

    async fn delete(&self, wallet_id: Uuid) -> RepoResult<()> {
        let mut tables = self.tables.write().await;

        if tables
            .transactions
            .iter()
            .any(|t| t.from_wallet_id == wallet_id)
        {
            return Err(RepoError::Referenced(format!(
                "wallet {wallet_id} has transactions"
            )));
        }

        let before = tables.wallets.len();
        tables.wallets.retain(|w| w.id != wallet_id);
        if tables.wallets.len() == before {
            return Err(RepoError::NotFound(format!("wallet {wallet_id}")));
        }
        Ok(())
    }

    async fn list_all(&self) -> RepoResult<Vec<Wallet>> {
        Ok(self.tables.read().await.wallets.clone())
    }

    async fn update_encrypted_key(
        &self,
        wallet_id: Uuid,
        encrypted_private_key: &str,
    ) -> RepoResult<()> {
        let mut tables = self.tables.write().await;
        let wallet = tables
            .wallets
            .iter_mut()
            .find(|w| w.id == wallet_id)
            .ok_or_else(|| RepoError::NotFound(format!("wallet {wallet_id}")))?;
        wallet.encrypted_private_key = encrypted_private_key.to_string();
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for MemoryStore {
    async fn insert(&self, input: NewTransaction) -> RepoResult<Transaction> {
        let mut tables = self.tables.write().await;

        if !tables.wallets.iter().any(|w| w.id == input.from_wallet_id) {
            return Err(RepoError::Referenced(format!(
                "wallet {} does not exist",
                input.from_wallet_id
            )));
        }
        if tables.transactions.iter().any(|t| {
            t.tx_hash == input.tx_hash
                || (t.from_wallet_id == input.from_wallet_id && t.nonce == input.nonce)
        }) {
            return Err(RepoError::Conflict(format!(
                "transaction {} / nonce {}",
                input.tx_hash, input.nonce
            )));
        }

        let now = Utc::now();
        let tx = Transaction {
            id: Uuid::new_v4(),
            from_wallet_id: input.from_wallet_id,
            to_address: input.to_address,
            amount: input.amount,
            gas_price: input.gas_price,
            gas_used: None,
            tx_hash: input.tx_hash,
            status: TransactionStatus::Pending,
            nonce: input.nonce,
            raw_transaction: input.raw_transaction,
            broadcast_at: input.broadcast.then_some(now),
            quorum_gated: input.quorum_gated,
            created_at: now,
            updated_at: now,
        };
        tables.transactions.push(tx.clone());
        Ok(tx)
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn find_by_hash(&self, tx_hash: &str) -> RepoResult<Option<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .iter()
            .find(|t| t.tx_hash.eq_ignore_ascii_case(tx_hash))
            .cloned())
    }

    async fn list_pending(
        &self,
        after: Option<PendingCursor>,
        limit: i64,
    ) -> RepoResult<Vec<Transaction>> {
        let tables = self.tables.read().await;
        let mut pending: Vec<Transaction> = tables
            .transactions
            .iter()
            .filter(|t| t.status == TransactionStatus::Pending)
            .filter(|t| after.map_or(true, |cursor| PendingCursor::from(*t) > cursor))
            .cloned()
            .collect();
        pending.sort_by_key(|t| PendingCursor::from(t));
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn max_nonce(&self, wallet_id: Uuid) -> RepoResult<Option<u64>> {
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .iter()
            .filter(|t| t.from_wallet_id == wallet_id)
            .map(|t| t.nonce)
            .max())
    }

    async fn mark_broadcast(&self, id: Uuid) -> RepoResult<Transaction> {
        let mut tables = self.tables.write().await;
        let tx = tables
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| RepoError::NotFound(format!("transaction {id}")))?;

        let now = Utc::now();
        if tx.broadcast_at.is_none() {
            tx.broadcast_at = Some(now);
        }
        tx.updated_at = now;
        Ok(tx.clone())
    }

    async fn finalize(
        &self,
        id: Uuid,
        status: TransactionStatus,
        gas_used: Option<u64>,
    ) -> RepoResult<bool> {
        if !TransactionStatus::Pending.can_transition_to(&status) {
            return Err(RepoError::Corrupt(format!(
                "illegal transition pending -> {status}"
            )));
        }

        let mut tables = self.tables.write().await;
        let tx = tables
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| RepoError::NotFound(format!("transaction {id}")))?;

        if tx.status != TransactionStatus::Pending {
            return Ok(false);
        }
        let now = Utc::now();
        tx.status = status;
        tx.gas_used = gas_used;
        tx.broadcast_at.get_or_insert(now);
        tx.updated_at = now;
        Ok(true)
    }

    async fn list_history(
        &self,
        wallet_ids: &[Uuid],
        addresses: &[String],
        limit: i64,
    ) -> RepoResult<Vec<Transaction>> {
        let tables = self.tables.read().await;
        let mut history: Vec<Transaction> = tables
            .transactions
            .iter()
            .rev()
            .filter(|t| {
                wallet_ids.contains(&t.from_wallet_id)
                    || addresses
                        .iter()
                        .any(|a| a.eq_ignore_ascii_case(&t.to_address))
            })
            .cloned()
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        history.truncate(limit.max(0) as usize);
        Ok(history)
    }
}

#[async_trait]
impl MultiSigRepository for MemoryStore {
    async fn create(&self, input: NewMultiSig) -> RepoResult<MultiSigTransaction> {
        let mut tables = self.tables.write().await;

        if !tables
            .transactions
            .iter()
            .any(|t| t.id == input.transaction_id)
        {
            return Err(RepoError::Referenced(format!(
                "transaction {} does not exist",
                input.transaction_id
            )));
        }
        if tables
            .multisigs
            .iter()
            .any(|m| m.transaction_id == input.transaction_id)
        {
            return Err(RepoError::Conflict(format!(
                "multisig for transaction {}",
                input.transaction_id
            )));
        }

        let multisig = MultiSigTransaction {
            id: Uuid::new_v4(),
            transaction_id: input.transaction_id,
            required_signatures: input.required_signatures,
            current_signatures: 0,
            expires_at: input.expires_at,
            executed_at: None,
            created_at: Utc::now(),
        };
        tables.multisigs.push(multisig.clone());
        Ok(multisig)
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<MultiSigTransaction>> {
        let tables = self.tables.read().await;
        Ok(tables.multisigs.iter().find(|m| m.id == id).cloned())
    }

    async fn find_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> RepoResult<Option<MultiSigTransaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .multisigs
            .iter()
            .find(|m| m.transaction_id == transaction_id)
            .cloned())
    }

    async fn has_signed(&self, multisig_id: Uuid, wallet_id: Uuid) -> RepoResult<bool> {
        let tables = self.tables.read().await;
        Ok(tables
            .signatures
            .iter()
            .any(|s| s.multisig_id == multisig_id && s.signer_wallet_id == wallet_id))
    }

    async fn list_signatures(&self, multisig_id: Uuid) -> RepoResult<Vec<TransactionSignature>> {
        let tables = self.tables.read().await;
        Ok(tables
            .signatures
            .iter()
            .filter(|s| s.multisig_id == multisig_id)
            .cloned()
            .collect())
    }

    async fn count_signatures(&self, multisig_id: Uuid) -> RepoResult<u32> {
        Ok(self.tables.read().await.signature_count(multisig_id))
    }

    async fn append_signature(
        &self,
        input: NewSignature,
        now: DateTime<Utc>,
    ) -> RepoResult<AppendOutcome> {
        let mut tables = self.tables.write().await;

        let multisig = tables
            .multisigs
            .iter()
            .find(|m| m.id == input.multisig_id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(format!("multisig {}", input.multisig_id)))?;

        if tables.signatures.iter().any(|s| {
            s.multisig_id == input.multisig_id && s.signer_wallet_id == input.signer_wallet_id
        }) {
            return Ok(AppendOutcome::AlreadySigned);
        }
        if tables.signature_count(input.multisig_id) >= multisig.required_signatures {
            return Ok(AppendOutcome::QuorumAlreadyMet);
        }
        if multisig.is_expired_at(now) {
            return Ok(AppendOutcome::Expired);
        }

        tables.signatures.push(TransactionSignature {
            id: Uuid::new_v4(),
            multisig_id: input.multisig_id,
            signer_wallet_id: input.signer_wallet_id,
            signature: input.signature,
            signed_at: now,
        });

        let current = tables.signature_count(input.multisig_id);
        let execution_claimed =
            current >= multisig.required_signatures && multisig.executed_at.is_none();

        if let Some(record) = tables.multisigs.iter_mut().find(|m| m.id == input.multisig_id) {
            record.current_signatures = current;
            if execution_claimed {
                record.executed_at = Some(now);
            }
        }

        Ok(AppendOutcome::Appended(SignatureTally {
            current,
            required: multisig.required_signatures,
            execution_claimed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    fn new_wallet(owner_id: Uuid, n: u8) -> NewWallet {
        NewWallet {
            owner_id,
            address: format!("0x{}", format!("{n:02x}").repeat(20)),
            encrypted_private_key: "sealed".into(),
        }
    }

    fn new_tx(wallet_id: Uuid, nonce: u64) -> NewTransaction {
        NewTransaction {
            from_wallet_id: wallet_id,
            to_address: format!("0x{}", "ab".repeat(20)),
            amount: Decimal::ONE,
            gas_price: Decimal::from(20),
            tx_hash: format!("0x{:064x}", nonce + 1),
            nonce,
            raw_transaction: "0xf86c".into(),
            broadcast: true,
            quorum_gated: false,
        }
    }

    #[tokio::test]
    async fn test_first_wallet_is_primary() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();

        let first = WalletRepository::create(&store, new_wallet(owner, 1)).await.unwrap();
        let second = WalletRepository::create(&store, new_wallet(owner, 2)).await.unwrap();
        assert!(first.is_primary);
        assert!(!second.is_primary);

        let promoted = store.set_primary(owner, second.id).await.unwrap();
        assert!(promoted.is_primary);
        let primaries: Vec<_> = store
            .list_by_owner(owner)
            .await
            .unwrap()
            .into_iter()
            .filter(|w| w.is_primary)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].id, second.id);
    }

    #[tokio::test]
    async fn test_duplicate_address_conflicts() {
        let store = MemoryStore::new();
        let input = new_wallet(Uuid::new_v4(), 7);
        WalletRepository::create(&store, input.clone()).await.unwrap();

        let mut shouted = input;
        shouted.address = shouted.address.to_uppercase().replacen("0X", "0x", 1);
        assert!(matches!(
            WalletRepository::create(&store, shouted).await,
            Err(RepoError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_wallet_with_transactions_is_protected() {
        let store = MemoryStore::new();
        let wallet = WalletRepository::create(&store, new_wallet(Uuid::new_v4(), 3))
            .await
            .unwrap();
        store.insert(new_tx(wallet.id, 0)).await.unwrap();

        assert!(matches!(
            store.delete(wallet.id).await,
            Err(RepoError::Referenced(_))
        ));
    }

    #[tokio::test]
    async fn test_nonce_and_hash_are_unique() {
        let store = MemoryStore::new();
        let wallet = WalletRepository::create(&store, new_wallet(Uuid::new_v4(), 4))
            .await
            .unwrap();
        store.insert(new_tx(wallet.id, 0)).await.unwrap();

        let mut same_nonce = new_tx(wallet.id, 0);
        same_nonce.tx_hash = format!("0x{}", "cd".repeat(32));
        assert!(matches!(
            store.insert(same_nonce).await,
            Err(RepoError::Conflict(_))
        ));
        assert_eq!(store.max_nonce(wallet.id).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_finalize_is_conditional() {
        let store = MemoryStore::new();
        let wallet = WalletRepository::create(&store, new_wallet(Uuid::new_v4(), 5))
            .await
            .unwrap();
        let tx = store.insert(new_tx(wallet.id, 0)).await.unwrap();

        assert!(store
            .finalize(tx.id, TransactionStatus::Completed, Some(21000))
            .await
            .unwrap());
        assert!(!store
            .finalize(tx.id, TransactionStatus::Failed, Some(1))
            .await
            .unwrap());

        let stored = TransactionRepository::find_by_id(&store, tx.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TransactionStatus::Completed);
        assert_eq!(stored.gas_used, Some(21000));
    }

    #[tokio::test]
    async fn test_pending_pages_cover_every_row() {
        let store = MemoryStore::new();
        let wallet = WalletRepository::create(&store, new_wallet(Uuid::new_v4(), 6))
            .await
            .unwrap();
        let mut deferred = new_tx(wallet.id, 0);
        deferred.broadcast = false;
        deferred.quorum_gated = true;
        store.insert(deferred).await.unwrap();
        for nonce in 1..5 {
            store.insert(new_tx(wallet.id, nonce)).await.unwrap();
        }
        let done = store.insert(new_tx(wallet.id, 5)).await.unwrap();
        store
            .finalize(done.id, TransactionStatus::Completed, Some(21000))
            .await
            .unwrap();

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = store.list_pending(cursor, 2).await.unwrap();
            let Some(last) = page.last() else { break };
            cursor = Some(PendingCursor::from(last));
            seen.extend(page.iter().map(|t| t.nonce));
        }

        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_finalize_marks_unconfirmed_record_broadcast() {
        let store = MemoryStore::new();
        let wallet = WalletRepository::create(&store, new_wallet(Uuid::new_v4(), 8))
            .await
            .unwrap();
        let mut unconfirmed = new_tx(wallet.id, 0);
        unconfirmed.broadcast = false;
        let tx = store.insert(unconfirmed).await.unwrap();
        assert!(!tx.is_broadcast());

        store
            .finalize(tx.id, TransactionStatus::Failed, Some(21000))
            .await
            .unwrap();
        let stored = TransactionRepository::find_by_id(&store, tx.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_broadcast());
    }
}
