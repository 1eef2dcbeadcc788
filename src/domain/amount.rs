//! 金额换算
//! 记录层使用 18 位小数的 ether（Decimal），链上使用 wei（U256）；gas 价格以 gwei 记录

use ethers::types::U256;
use rust_decimal::Decimal;

use crate::error::{AppError, AppResult};

pub const ETHER_DECIMALS: u32 = 18;
pub const GWEI_DECIMALS: u32 = 9;

/// ether -> wei，小数位超过18位视为非法输入
pub fn ether_to_wei(amount: Decimal) -> AppResult<U256> {
    to_base_units(amount, ETHER_DECIMALS)
}

/// gwei -> wei
pub fn gwei_to_wei(amount: Decimal) -> AppResult<U256> {
    to_base_units(amount, GWEI_DECIMALS)
}

/// wei -> ether
pub fn wei_to_ether(wei: U256) -> AppResult<Decimal> {
    from_base_units(wei, ETHER_DECIMALS)
}

/// wei -> gwei
pub fn wei_to_gwei(wei: U256) -> AppResult<Decimal> {
    from_base_units(wei, GWEI_DECIMALS)
}

fn to_base_units(amount: Decimal, decimals: u32) -> AppResult<U256> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(AppError::invalid_input("amount must not be negative"));
    }

    let normalized = amount.normalize();
    let scale = normalized.scale();
    if scale > decimals {
        return Err(AppError::invalid_input(format!(
            "amount has more than {decimals} decimal places"
        )));
    }

    // mantissa 最多96位，乘以 10^18 仍在 U256 范围内
    let mantissa = normalized.mantissa().unsigned_abs();
    Ok(U256::from(mantissa) * U256::exp10((decimals - scale) as usize))
}

fn from_base_units(value: U256, decimals: u32) -> AppResult<Decimal> {
    if value > U256::from(u128::MAX) {
        return Err(AppError::invalid_input(format!(
            "value {value} exceeds representable range"
        )));
    }

    let raw = value.as_u128();
    let signed = i128::try_from(raw)
        .map_err(|_| AppError::invalid_input(format!("value {value} exceeds representable range")))?;

    Decimal::try_from_i128_with_scale(signed, decimals)
        .map(|d| d.normalize())
        .map_err(|e| AppError::invalid_input(format!("value {value} not representable: {e}")))
}
