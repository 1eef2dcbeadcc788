//! 数据访问层
//! 每个实体一个 Repository trait，PostgreSQL 实现用于生产，MemoryStore 用于测试和本地联调

use thiserror::Error;

pub mod memory;
pub mod multisig;
pub mod transactions;
pub mod wallets;

pub use memory::MemoryStore;
pub use multisig::{
    AppendOutcome, MultiSigRepository, MultiSigTransaction, NewMultiSig, NewSignature,
    PgMultiSigRepository, SignatureTally, TransactionSignature,
};
pub use transactions::{
    NewTransaction, PendingCursor, PgTransactionRepository, Transaction, TransactionRepository,
};
pub use wallets::{NewWallet, PgWalletRepository, Wallet, WalletRepository};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("{0} not found")]
    NotFound(String),

    /// 唯一约束冲突
    #[error("conflict: {0}")]
    Conflict(String),

    /// 仍被其他记录引用（外键 RESTRICT）
    #[error("still referenced: {0}")]
    Referenced(String),

    /// 库中数据无法映射为领域类型
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type RepoResult<T> = Result<T, RepoError>;

const PG_UNIQUE_VIOLATION: &str = "23505";
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";

/// 把约束冲突从通用数据库错误里区分出来
pub(crate) fn classify(err: sqlx::Error, what: &str) -> RepoError {
    let code = err
        .as_database_error()
        .and_then(|db| db.code())
        .map(|c| c.into_owned());

    match code.as_deref() {
        Some(PG_UNIQUE_VIOLATION) => RepoError::Conflict(what.to_string()),
        Some(PG_FOREIGN_KEY_VIOLATION) => RepoError::Referenced(what.to_string()),
        _ => RepoError::Database(err),
    }
}

/// 违反的约束名（用于区分同一张表上的多个唯一约束）
pub(crate) fn constraint_name(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.constraint())
        .map(str::to_string)
}

pub(crate) fn to_u64(value: i64, field: &str) -> RepoResult<u64> {
    u64::try_from(value).map_err(|_| RepoError::Corrupt(format!("{field} is negative: {value}")))
}

pub(crate) fn to_u32(value: i32, field: &str) -> RepoResult<u32> {
    u32::try_from(value).map_err(|_| RepoError::Corrupt(format!("{field} is negative: {value}")))
}

pub(crate) fn to_i64(value: u64, field: &str) -> RepoResult<i64> {
    i64::try_from(value).map_err(|_| RepoError::Corrupt(format!("{field} out of range: {value}")))
}
