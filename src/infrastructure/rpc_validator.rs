// RPC响应校验模块 - 防止链上数据污染

use anyhow::{Context, Result};
use ethers::types::U256;

/// 验证RPC返回的数量值（余额、gas价格），最多32字节
pub fn validate_quantity(quantity_hex: &str) -> Result<U256> {
    let digits = strip_hex_prefix(quantity_hex)?;

    if digits.is_empty() {
        anyhow::bail!("Empty quantity");
    }

    // 最多32字节 = 64个十六进制字符
    if digits.len() > 64 {
        anyhow::bail!("Quantity hex string too long: {}", digits.len());
    }

    U256::from_str_radix(digits, 16)
        .map_err(|e| anyhow::anyhow!("Failed to parse quantity from hex: {:?}", e))
}

/// 验证RPC返回的u64数量（nonce、区块号、gas用量、时间戳）
pub fn validate_u64(value_hex: &str) -> Result<u64> {
    let digits = strip_hex_prefix(value_hex)?;

    if digits.is_empty() {
        anyhow::bail!("Empty quantity");
    }

    // u64最多16个十六进制字符
    if digits.len() > 16 {
        anyhow::bail!("u64 hex string too long: {}", digits.len());
    }

    u64::from_str_radix(digits, 16).context("Failed to parse u64 from hex")
}

/// 验证交易哈希格式，返回小写 0x 前缀形式
pub fn validate_tx_hash(tx_hash: &str) -> Result<String> {
    let hash = strip_hex_prefix(tx_hash)?;

    // 以太坊交易哈希为32字节 = 64个十六进制字符
    if hash.len() != 64 {
        anyhow::bail!(
            "Invalid transaction hash length: expected 64, got {}",
            hash.len()
        );
    }

    if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        anyhow::bail!("Invalid transaction hash format: contains non-hex characters");
    }

    Ok(format!("0x{}", hash.to_lowercase()))
}

fn strip_hex_prefix(value: &str) -> Result<&str> {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .context("Hex value must start with 0x")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_quantity() {
        assert_eq!(
            validate_quantity("0xde0b6b3a7640000").unwrap(),
            U256::exp10(18)
        );
        assert_eq!(validate_quantity("0x0").unwrap(), U256::zero());
        assert!(validate_quantity("de0b6b3a7640000").is_err());
        assert!(validate_quantity("0x").is_err());
        assert!(validate_quantity(&format!("0x{}", "f".repeat(65))).is_err());
    }

    #[test]
    fn test_validate_u64() {
        assert_eq!(validate_u64("0x5208").unwrap(), 21000);
        assert!(validate_u64("0xzz").is_err());
        assert!(validate_u64(&format!("0x{}", "1".repeat(17))).is_err());
    }

    #[test]
    fn test_validate_tx_hash() {
        let upper = format!("0x{}", "AB".repeat(32));
        assert_eq!(
            validate_tx_hash(&upper).unwrap(),
            format!("0x{}", "ab".repeat(32))
        );
        assert!(validate_tx_hash("0x1234").is_err());
        assert!(validate_tx_hash(&format!("0x{}", "g".repeat(64))).is_err());
    }
}
