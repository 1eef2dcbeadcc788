//! IronVault 主入口
//! 装配仓储与服务，启动链上对账循环，直到收到 Ctrl-C

use std::sync::Arc;

use anyhow::{Context, Result};
use ironvault::{
    app_state::AppState,
    config::Config,
    infrastructure::{db, key_vault::KeyVault, logging},
    metrics,
    service::{ChainGateway, JsonRpcGateway},
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // ✅ 1. 加载环境变量与配置文件
    dotenvy::dotenv().ok();

    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = Config::from_env_and_file(config_path.as_deref())
        .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // ✅ 2. 初始化日志（guard 必须存活到进程结束）
    let _log_guard = logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to initialize logging")?;

    tracing::info!("🚀 Starting IronVault custody core");

    // ✅ 3. 主密钥
    let vault = Arc::new(
        KeyVault::from_config(&config.vault).context("Failed to load wallet master key")?,
    );

    // ✅ 4. 连接数据库并运行迁移
    let pool = db::init_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("✅ Database connected");

    if std::env::var("SKIP_MIGRATIONS").is_err() {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Database migrations failed")?;
        tracing::info!("✅ Database migrations completed");
    } else {
        tracing::info!("⏭️ Database migrations skipped (SKIP_MIGRATIONS=1)");
    }

    // ✅ 5. 以太坊节点，启动时核对 chain id，防止签错链
    let gateway = Arc::new(JsonRpcGateway::new(&config.chain)?);
    match gateway.get_chain_id().await {
        Ok(chain_id) if chain_id != config.chain.chain_id => {
            anyhow::bail!(
                "node reports chain id {}, configured {}",
                chain_id,
                config.chain.chain_id
            );
        }
        Ok(chain_id) => tracing::info!(chain_id, "✅ Ethereum node connected"),
        Err(e) => tracing::warn!(error = %e, "⚠️ Ethereum node not reachable at startup"),
    }

    let config = Arc::new(config);
    let state = AppState::new(pool, config, gateway, vault);

    // ✅ 6. 启动后台对账
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = tokio::spawn(state.reconciler.clone().run(shutdown_rx));
    tracing::info!("✅ Transaction reconciler started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("🛑 Shutdown requested");

    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler.await {
        tracing::error!(error = %e, "reconciler task terminated abnormally");
    }

    tracing::info!(metrics = %metrics::render_prometheus(), "👋 IronVault stopped");
    Ok(())
}
