//! 地址验证模块
//!
//! EVM地址：0x + 40位十六进制；包含大写字母时必须通过 EIP-55 Checksum

use ethers::{types::Address, utils::to_checksum};

use crate::error::{AppError, AppResult};

/// 解析并校验地址
///
/// - 全小写 / 全大写：不带校验信息，按原样接受
/// - 大小写混合：必须与 EIP-55 编码完全一致
pub fn parse_address(address: &str) -> AppResult<Address> {
    let hex_part = address
        .strip_prefix("0x")
        .ok_or_else(|| AppError::invalid_input("address must start with 0x"))?;

    if hex_part.len() != 40 {
        return Err(AppError::invalid_input(format!(
            "address must be 20 bytes, got {} hex chars",
            hex_part.len()
        )));
    }

    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AppError::invalid_input("address contains non-hex characters"));
    }

    let bytes = hex::decode(hex_part)
        .map_err(|e| AppError::invalid_input(format!("invalid address hex: {e}")))?;
    let parsed = Address::from_slice(&bytes);

    let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
    if has_upper && has_lower && to_checksum(&parsed, None) != address {
        return Err(AppError::invalid_input("address checksum mismatch (EIP-55)"));
    }

    Ok(parsed)
}

/// 地址的 EIP-55 规范形式（落库统一使用）
pub fn checksum(address: &Address) -> String {
    to_checksum(address, None)
}

pub fn is_valid_address(address: &str) -> bool {
    parse_address(address).is_ok()
}
