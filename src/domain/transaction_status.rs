//! 交易状态机
//! PENDING 只能前进到 COMPLETED / FAILED，两者都是终态

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// 已签名（多签交易尚未广播）或已广播，等待回执
    Pending,

    /// 回执 status = 1
    Completed,

    /// 回执 status = 0（链上执行失败或revert）
    Failed,
}

impl TransactionStatus {
    /// 是否为最终状态（不可再转换）
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// 验证状态转换合法性
    pub fn can_transition_to(&self, target: &Self) -> bool {
        use TransactionStatus::*;

        matches!((self, target), (Pending, Completed) | (Pending, Failed))
    }

    /// 转换为数据库字符串
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// 未知状态字符串
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown transaction status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for TransactionStatus {
    type Err = UnknownStatus;

    /// 数据库里的状态必须精确匹配，不做默认回退
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use TransactionStatus::*;

        assert!(Pending.can_transition_to(&Completed));
        assert!(Pending.can_transition_to(&Failed));

        assert!(!Pending.can_transition_to(&Pending));
        assert!(!Completed.can_transition_to(&Pending));
        assert!(!Completed.can_transition_to(&Failed));
        assert!(!Failed.can_transition_to(&Completed));
    }

    #[test]
    fn test_is_final() {
        assert!(!TransactionStatus::Pending.is_final());
        assert!(TransactionStatus::Completed.is_final());
        assert!(TransactionStatus::Failed.is_final());
    }

    #[test]
    fn test_db_string_round_trip() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
        ] {
            assert_eq!(status.to_db_string().parse::<TransactionStatus>(), Ok(status));
        }
        assert!("confirmed".parse::<TransactionStatus>().is_err());
    }
}
