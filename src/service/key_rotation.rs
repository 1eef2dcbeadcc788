//! 主密钥轮换
//! 用旧主密钥解密、新主密钥重新加密所有钱包私钥；单个钱包失败不影响其他钱包

use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::AppResult, infrastructure::key_vault::KeyVault, metrics, repository::WalletRepository,
};

#[derive(Debug, Clone, Serialize)]
pub struct RotationFailure {
    pub wallet_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationReport {
    pub rotated: usize,
    pub failed: Vec<RotationFailure>,
}

pub async fn rotate_master_key(
    wallets: &dyn WalletRepository,
    old: &KeyVault,
    new: &KeyVault,
) -> AppResult<RotationReport> {
    let mut report = RotationReport::default();

    for wallet in wallets.list_all().await? {
        let address = match wallet.parsed_address() {
            Ok(address) => address,
            Err(e) => {
                report.failed.push(RotationFailure {
                    wallet_id: wallet.id,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        // 先确认旧密文能解出与地址一致的私钥，再写入新密文
        let resealed = old
            .unseal_signer(&wallet.encrypted_private_key, address)
            .and_then(|_| old.reencrypt(&wallet.encrypted_private_key, new));

        let resealed = match resealed {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::warn!(wallet_id = %wallet.id, error = %e, "Skipping wallet during key rotation");
                report.failed.push(RotationFailure {
                    wallet_id: wallet.id,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        match wallets.update_encrypted_key(wallet.id, &resealed).await {
            Ok(()) => report.rotated += 1,
            Err(e) => {
                tracing::error!(wallet_id = %wallet.id, error = %e, "Failed to store re-encrypted key");
                report.failed.push(RotationFailure {
                    wallet_id: wallet.id,
                    reason: e.to_string(),
                });
            }
        }
    }

    metrics::keys_rotated(report.rotated as u64);
    tracing::info!(
        rotated = report.rotated,
        failed = report.failed.len(),
        "Master key rotation finished"
    );
    Ok(report)
}
