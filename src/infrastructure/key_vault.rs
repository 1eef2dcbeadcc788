//! AES-256-GCM 私钥保险库
//! 托管私钥只以密文形式落库，解密结果用完即清零

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use ethers::{
    signers::{LocalWallet, Signer},
    types::Address,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::VaultConfig;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    /// 密文被篡改，或由其他主密钥加密
    #[error("key corruption: {0}")]
    KeyCorruption(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("invalid master key: {0}")]
    InvalidMasterKey(String),
}

/// 主密钥（使用Zeroize保护）
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// 解析主密钥
    ///
    /// - 64位十六进制：直接作为32字节密钥
    /// - 其他长度 >= 16 的口令：SHA-256 拉伸
    pub fn parse(key_str: &str) -> Result<Self, VaultError> {
        if key_str.is_empty() {
            return Err(VaultError::InvalidMasterKey("WALLET_ENC_KEY empty".into()));
        }

        let mut key = [0u8; 32];
        if key_str.len() == 64 && key_str.chars().all(|c| c.is_ascii_hexdigit()) {
            let mut bytes = Zeroizing::new(
                hex::decode(key_str)
                    .map_err(|e| VaultError::InvalidMasterKey(format!("invalid hex key: {e}")))?,
            );
            key.copy_from_slice(&bytes);
            bytes.zeroize();
        } else if key_str.len() >= 16 {
            let mut hasher = Sha256::new();
            hasher.update(key_str.as_bytes());
            key.copy_from_slice(&hasher.finalize());
        } else {
            return Err(VaultError::InvalidMasterKey(
                "WALLET_ENC_KEY too short (min 16)".into(),
            ));
        }

        Ok(Self { key })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.key
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// 私钥保险库
///
/// 进程级主密钥在启动时提供；其他组件只能通过这里解密
pub struct KeyVault {
    cipher: Aes256Gcm,
}

impl KeyVault {
    pub fn new(key: EncryptionKey) -> Result<Self, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| VaultError::InvalidMasterKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn from_config(config: &VaultConfig) -> Result<Self, VaultError> {
        Self::new(EncryptionKey::parse(&config.master_key)?)
    }

    /// 加密原始私钥，返回 base64(nonce || ciphertext)
    pub fn encrypt(&self, raw_key: &[u8]) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, raw_key)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    /// 解密私钥；任何格式或认证失败都视为密钥损坏
    pub fn decrypt(&self, sealed: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(sealed.trim())
            .map_err(|e| VaultError::KeyCorruption(format!("invalid encoding: {e}")))?;

        if bytes.len() <= NONCE_LEN {
            return Err(VaultError::KeyCorruption("ciphertext too short".into()));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                VaultError::KeyCorruption("authentication failed (tampered or foreign key)".into())
            })?;

        Ok(Zeroizing::new(plaintext))
    }

    /// 解密并构造签名器，同时校验派生地址与记录一致
    pub fn unseal_signer(
        &self,
        sealed: &str,
        expected_address: Address,
    ) -> Result<LocalWallet, VaultError> {
        let raw_key = self.decrypt(sealed)?;
        let signer = LocalWallet::from_bytes(&raw_key)
            .map_err(|e| VaultError::KeyCorruption(format!("invalid secp256k1 key: {e}")))?;

        if signer.address() != expected_address {
            return Err(VaultError::KeyCorruption(
                "derived address does not match wallet address".into(),
            ));
        }

        Ok(signer)
    }

    /// 用新的主密钥重新加密（主密钥轮换）
    pub fn reencrypt(&self, sealed: &str, target: &KeyVault) -> Result<String, VaultError> {
        let raw_key = self.decrypt(sealed)?;
        target.encrypt(&raw_key)
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyVault(<sealed>)")
    }
}
