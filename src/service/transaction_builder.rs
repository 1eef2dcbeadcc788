//! 交易构建与签名
//! 原生币转账：legacy EIP-155 交易，gas 固定 21000，无 data

use ethers::{
    signers::{LocalWallet, Signer},
    types::{transaction::eip2718::TypedTransaction, Address, Bytes, TransactionRequest, U256},
    utils::keccak256,
};

use crate::error::{AppError, AppResult};

pub const TRANSFER_GAS_LIMIT: u64 = 21_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub nonce: u64,
    pub gas_price: U256,
    pub to: Address,
    pub value: U256,
    pub chain_id: u64,
}

/// 已签名交易；哈希由原始字节确定，同一份字节重复广播不会产生第二笔交易
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransfer {
    pub raw: Bytes,
    pub tx_hash: String,
}

impl SignedTransfer {
    pub fn raw_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.raw))
    }

    pub fn from_raw_hex(raw_hex: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(raw_hex.trim_start_matches("0x"))?;
        Ok(Self::from_raw(Bytes::from(bytes)))
    }

    fn from_raw(raw: Bytes) -> Self {
        let tx_hash = format!("0x{}", hex::encode(keccak256(&raw)));
        Self { raw, tx_hash }
    }
}

pub fn build_transfer(from: Address, request: &TransferRequest) -> TypedTransaction {
    TransactionRequest::new()
        .from(from)
        .to(request.to)
        .value(request.value)
        .gas(TRANSFER_GAS_LIMIT)
        .gas_price(request.gas_price)
        .nonce(request.nonce)
        .chain_id(request.chain_id)
        .into()
}

/// 签名转账；失败时该 nonce 视为可能已消耗
pub fn sign_transfer(signer: &LocalWallet, request: &TransferRequest) -> AppResult<SignedTransfer> {
    let tx = build_transfer(signer.address(), request);

    let signature = signer
        .sign_transaction_sync(&tx)
        .map_err(|e| AppError::SigningFailed {
            nonce: request.nonce,
            reason: e.to_string(),
        })?;

    Ok(SignedTransfer::from_raw(tx.rlp_signed(&signature)))
}

#[cfg(test)]
mod tests {
    use ethers::utils::rlp;

    use super::*;

    fn request() -> TransferRequest {
        TransferRequest {
            nonce: 7,
            gas_price: U256::from(20_000_000_000u64),
            to: "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap(),
            value: U256::exp10(17),
            chain_id: 11_155_111,
        }
    }

    #[test]
    fn test_signed_transfer_decodes() {
        let signer = LocalWallet::new(&mut rand::thread_rng());
        let signed = sign_transfer(&signer, &request()).unwrap();

        let decoded: ethers::types::Transaction = rlp::decode(&signed.raw).unwrap();
        assert_eq!(decoded.nonce, U256::from(7));
        assert_eq!(decoded.to, Some(request().to));
        assert_eq!(decoded.value, U256::exp10(17));
        assert_eq!(decoded.gas, U256::from(TRANSFER_GAS_LIMIT));
        assert_eq!(decoded.gas_price, Some(U256::from(20_000_000_000u64)));
        assert_eq!(decoded.chain_id, Some(U256::from(11_155_111u64)));
        assert_eq!(decoded.recover_from().unwrap(), signer.address());
        assert_eq!(format!("{:#x}", decoded.hash), signed.tx_hash);
    }

    #[test]
    fn test_hash_is_deterministic_over_raw_bytes() {
        let signer = LocalWallet::new(&mut rand::thread_rng());
        let signed = sign_transfer(&signer, &request()).unwrap();

        let reparsed = SignedTransfer::from_raw_hex(&signed.raw_hex()).unwrap();
        assert_eq!(reparsed, signed);
        assert_eq!(signed.tx_hash.len(), 66);
    }

    #[test]
    fn test_different_nonce_different_hash() {
        let signer = LocalWallet::new(&mut rand::thread_rng());
        let a = sign_transfer(&signer, &request()).unwrap();
        let mut next = request();
        next.nonce += 1;
        let b = sign_transfer(&signer, &next).unwrap();
        assert_ne!(a.tx_hash, b.tx_hash);
    }
}
