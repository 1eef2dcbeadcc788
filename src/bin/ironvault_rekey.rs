//! 主密钥轮换工具
//!
//! WALLET_ENC_KEY 为当前主密钥，WALLET_ENC_KEY_NEW 为新主密钥。
//! 全部钱包重新加密成功后，再把新主密钥切换为 WALLET_ENC_KEY 重启服务

use anyhow::{Context, Result};
use ironvault::{
    config::DatabaseConfig,
    infrastructure::{
        db,
        key_vault::{EncryptionKey, KeyVault},
        logging,
    },
    repository::PgWalletRepository,
    service::key_rotation::rotate_master_key,
};

fn load_vault(var: &str) -> Result<KeyVault> {
    let raw = std::env::var(var).with_context(|| format!("{var} must be set"))?;
    let key = EncryptionKey::parse(&raw).with_context(|| format!("{var} is not a valid key"))?;
    KeyVault::new(key).with_context(|| format!("{var} rejected by cipher"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = logging::init_default_logging();

    let old = load_vault("WALLET_ENC_KEY")?;
    let new = load_vault("WALLET_ENC_KEY_NEW")?;

    let pool = db::init_pool(&DatabaseConfig::default())
        .await
        .context("Failed to connect to database")?;
    let wallets = PgWalletRepository::new(pool);

    let report = rotate_master_key(&wallets, &old, &new).await?;

    for failure in &report.failed {
        tracing::error!(
            wallet_id = %failure.wallet_id,
            reason = %failure.reason,
            "❌ wallet key not rotated"
        );
    }
    tracing::info!(
        rotated = report.rotated,
        failed = report.failed.len(),
        "✅ Master key rotation finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.failed.is_empty() {
        anyhow::bail!("{} wallet(s) could not be rotated", report.failed.len());
    }
    Ok(())
}
