//! 配置管理模块
//! 支持从环境变量和配置文件加载配置

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 应用配置结构体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub chain: ChainConfig,
    pub vault: VaultConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub multisig: MultisigConfig,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_file_logging: bool,
    pub log_file_path: Option<String>,
}

/// 以太坊节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    /// 单次RPC请求超时
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

/// 私钥加密配置
///
/// 主密钥只在启动时提供，不从用户输入派生
#[derive(Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub master_key: String,
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("master_key", &"<redacted>")
            .finish()
    }
}

/// 交易对账配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
    pub batch_size: i64,
}

/// 多签默认参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultisigConfig {
    pub default_required_signatures: u32,
    pub default_ttl_hours: i64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://postgres@localhost:5432/ironvault".into()),
            max_connections: env_or("DB_MAX_CONNS", 16),
            min_connections: env_or("DB_MIN_CONNS", 2),
            acquire_timeout_secs: env_or("DB_ACQ_TIMEOUT_SECS", 5),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", 300),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
            enable_file_logging: std::env::var("LOG_FILE_ENABLED")
                .ok()
                .map(|v| v == "1")
                .unwrap_or(false),
            log_file_path: std::env::var("LOG_FILE_PATH").ok(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: std::env::var("ETH_RPC_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8545".into()),
            chain_id: env_or("CHAIN_ID", 1),
            request_timeout_secs: env_or("RPC_TIMEOUT_SECS", 15),
            connect_timeout_secs: env_or("RPC_CONNECT_TIMEOUT_SECS", 5),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            master_key: std::env::var("WALLET_ENC_KEY").unwrap_or_default(),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: env_or("RECONCILE_INTERVAL_SECS", 15),
            batch_size: env_or("RECONCILE_BATCH_SIZE", 100),
        }
    }
}

impl Default for MultisigConfig {
    fn default() -> Self {
        Self {
            default_required_signatures: env_or("MULTISIG_DEFAULT_REQUIRED", 2),
            default_ttl_hours: env_or("MULTISIG_DEFAULT_TTL_HOURS", 24),
        }
    }
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl MultisigConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_hours.max(0) as u64 * 3600)
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            chain: ChainConfig::default(),
            vault: VaultConfig::default(),
            reconciler: ReconcilerConfig::default(),
            multisig: MultisigConfig::default(),
        })
    }

    /// 从配置文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// 从环境变量和配置文件合并加载（配置文件优先级更高）
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = Self::from_env()?;

        if let Some(path) = path {
            if path.as_ref().exists() {
                config = Self::from_file(path)?;
            }
        }

        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        if !self.database.url.starts_with("postgres://")
            && !self.database.url.starts_with("postgresql://")
        {
            anyhow::bail!("DATABASE_URL must start with postgres:// or postgresql://");
        }

        if !self.chain.rpc_url.starts_with("http://") && !self.chain.rpc_url.starts_with("https://")
        {
            anyhow::bail!("ETH_RPC_URL must be an http(s) URL");
        }

        if self.chain.chain_id == 0 {
            anyhow::bail!("CHAIN_ID must be non-zero");
        }

        if self.chain.request_timeout_secs == 0 {
            anyhow::bail!("RPC_TIMEOUT_SECS must be greater than 0");
        }

        if self.reconciler.interval_secs == 0 {
            anyhow::bail!("RECONCILE_INTERVAL_SECS must be greater than 0");
        }

        if self.reconciler.batch_size <= 0 {
            anyhow::bail!("RECONCILE_BATCH_SIZE must be greater than 0");
        }

        if self.multisig.default_required_signatures == 0 {
            anyhow::bail!("MULTISIG_DEFAULT_REQUIRED must be at least 1");
        }

        if self.multisig.default_ttl_hours <= 0 {
            anyhow::bail!("MULTISIG_DEFAULT_TTL_HOURS must be greater than 0");
        }

        if self.vault.master_key.is_empty() {
            anyhow::bail!("WALLET_ENC_KEY must be set");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("LOG_LEVEL must be one of: {:?}", valid_levels);
        }

        if self.logging.format != "json" && self.logging.format != "text" {
            anyhow::bail!("LOG_FORMAT must be 'json' or 'text'");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[database]
url = "postgres://test@localhost/test"
max_connections = 20
min_connections = 5
acquire_timeout_secs = 30
idle_timeout_secs = 600

[logging]
level = "info"
format = "json"
enable_file_logging = false

[chain]
rpc_url = "http://localhost:8545"
chain_id = 11155111
request_timeout_secs = 10
connect_timeout_secs = 3

[vault]
master_key = "{TEST_KEY}"

[reconciler]
interval_secs = 30
batch_size = 50
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.chain.chain_id, 11155111);
        assert_eq!(config.reconciler.interval(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_rejects_zero_interval() {
        let mut config = Config::from_env().unwrap();
        config.database.url = "postgres://localhost/db".into();
        config.chain.rpc_url = "http://localhost:8545".into();
        config.chain.chain_id = 1;
        config.vault.master_key = TEST_KEY.into();
        config.logging.level = "info".into();
        config.logging.format = "text".into();
        config.multisig.default_required_signatures = 2;
        config.multisig.default_ttl_hours = 24;
        config.reconciler.batch_size = 10;
        config.reconciler.interval_secs = 15;
        assert!(config.validate().is_ok());

        config.reconciler.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vault_config_debug_is_redacted() {
        let vault = VaultConfig {
            master_key: TEST_KEY.into(),
        };
        let rendered = format!("{:?}", vault);
        assert!(!rendered.contains(TEST_KEY));
        assert!(rendered.contains("redacted"));
    }
}
