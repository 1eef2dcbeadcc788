//! IronVault - 托管式以太坊钱包核心
//!
//! 私钥由服务端以 AES-256-GCM 加密保管；转账、多签审批与链上对账都在这里完成

pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod metrics;
pub mod repository;
pub mod service;
pub mod utils;

// 重新导出常用类型
pub use app_state::AppState;
pub use error::{AppError, AppResult};

pub mod prelude {
    pub use crate::{
        app_state::AppState,
        domain::TransactionStatus,
        error::{AppError, AppResult},
        service::{MultiSigCoordinator, TransactionEngine, WalletRegistry},
    };
}
