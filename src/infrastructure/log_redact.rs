//! 日志脱敏
//! 签名后的原始交易、私钥相关数据只以截断形式进入日志

/// 脱敏十六进制字符串（显示前缀和后缀）
pub fn redact_hex_string(hex: &str, show_chars: usize) -> String {
    if hex.len() <= show_chars * 2 {
        return "*".repeat(hex.len());
    }

    let prefix = &hex[..show_chars];
    let suffix = &hex[hex.len() - show_chars..];
    format!("{}...{}", prefix, suffix)
}

/// 原始签名交易的日志形式
pub fn redact_raw_transaction(raw_hex: &str) -> String {
    format!("{} ({} bytes)", redact_hex_string(raw_hex, 10), raw_hex.len().saturating_sub(2) / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_hex_string() {
        let hex = "0x1234567890abcdef1234567890abcdef12345678";
        let redacted = redact_hex_string(hex, 10);
        assert_eq!(redacted, "0x12345678...ef12345678");
    }

    #[test]
    fn test_redact_short_hex_fully() {
        assert_eq!(redact_hex_string("0xabcd", 10), "******");
    }

    #[test]
    fn test_redact_raw_transaction() {
        let raw = format!("0x{}", "f8".repeat(110));
        let redacted = redact_raw_transaction(&raw);
        assert!(redacted.starts_with("0xf8f8f8f8..."));
        assert!(redacted.ends_with("(110 bytes)"));
    }
}
