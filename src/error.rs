//! 统一错误类型
//! 托管核心的错误分类：每个失败路径都保留具体出错的步骤

use ethers::types::U256;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    infrastructure::key_vault::VaultError, repository::RepoError,
    service::chain_gateway::GatewayError,
};

/// 核心错误
#[derive(Debug, Error)]
pub enum AppError {
    /// 地址/金额等输入不合法（调用方错误，不重试）
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// 预检余额不足（仅预检，不保证与并发发送无竞争）
    #[error("insufficient funds: required {required} wei, available {available} wei")]
    InsufficientFunds { required: U256, available: U256 },

    /// 密文被篡改或使用了其他主密钥
    #[error("key material corrupted for wallet {wallet_id}: {reason}")]
    KeyCorruption { wallet_id: Uuid, reason: String },

    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("node error {code}: {message}")]
    NodeError { code: i64, message: String },

    #[error("wallet has already signed this transaction")]
    AlreadySigned,

    #[error("transaction already has the required signatures")]
    QuorumAlreadyMet,

    #[error("multisig transaction has expired")]
    Expired,

    /// 多签交易尚未占用执行权，不能广播
    #[error("multisig quorum not reached")]
    QuorumNotReached,

    /// 签名失败：该nonce视为可能已消耗，复用前必须重新核对
    #[error("signing failed at nonce {nonce}: {reason}")]
    SigningFailed { nonce: u64, reason: String },

    /// 广播失败：已签名的载荷原样交还调用方
    ///
    /// transaction_id 为 Some 时载荷已作为未确认记录保存，nonce 仍被占用，
    /// 用 broadcast_prepared 重发同一份字节或等待对账确认；
    /// None 表示节点明确拒绝，nonce 已释放
    #[error("submission of {tx_hash} (nonce {nonce}) failed: {source}")]
    SubmissionFailed {
        nonce: u64,
        tx_hash: String,
        raw_transaction: String,
        transaction_id: Option<Uuid>,
        #[source]
        source: GatewayError,
    },

    /// 交易已广播但落库失败
    #[error("transaction {tx_hash} was broadcast but could not be recorded: {reason}")]
    PersistenceFailed { tx_hash: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl AppError {
    /// 稳定的错误码（供上层 web/RPC 层映射）
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::KeyCorruption { .. } => "key_corruption",
            Self::NodeUnreachable(_) => "node_unreachable",
            Self::NodeError { .. } => "node_error",
            Self::AlreadySigned => "already_signed",
            Self::QuorumAlreadyMet => "quorum_already_met",
            Self::Expired => "expired",
            Self::QuorumNotReached => "quorum_not_reached",
            Self::SigningFailed { .. } => "signing_failed",
            Self::SubmissionFailed { .. } => "submission_failed",
            Self::PersistenceFailed { .. } => "persistence_failed",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage_error",
        }
    }

    /// 是否可由调用方带退避重试
    ///
    /// 只有读路径上的节点错误可重试；广播错误必须先确认前一次是否已上链
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NodeUnreachable(_) | Self::NodeError { .. })
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub(crate) fn key_corruption(wallet_id: Uuid, err: VaultError) -> Self {
        Self::KeyCorruption {
            wallet_id,
            reason: err.to_string(),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NodeUnreachable(msg) => Self::NodeUnreachable(msg),
            GatewayError::NodeError { code, message } => Self::NodeError { code, message },
        }
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(what) => Self::NotFound(what),
            other => Self::Storage(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
