//! 测试辅助模块
//! 内存版节点网关 + 内存仓储装配的 AppState

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use ethers::{
    signers::{LocalWallet, Signer},
    types::{Address, Bytes, U256},
    utils::keccak256,
};
use ironvault::{
    app_state::AppState,
    config::Config,
    infrastructure::key_vault::{EncryptionKey, KeyVault},
    service::chain_gateway::{
        BlockInfo, ChainGateway, GatewayError, GatewayResult, Receipt, ReceiptStatus,
    },
};

pub const TEST_CHAIN_ID: u64 = 11_155_111;
pub const HEAD_BLOCK: u64 = 100;
pub const RECEIPT_BLOCK: u64 = 90;

#[derive(Default)]
struct ChainState {
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
    receipts: HashMap<String, Receipt>,
    receipt_errors: HashMap<String, GatewayError>,
    submitted: Vec<Bytes>,
    submit_error: Option<GatewayError>,
    // 节点收下交易，但应答在返回途中丢失
    lose_responses: bool,
}

/// 可编程的内存节点
pub struct MockGateway {
    state: Mutex<ChainState>,
    gas_price: U256,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState::default()),
            gas_price: U256::from(20_000_000_000u64),
        }
    }

    pub fn set_balance(&self, address: Address, wei: U256) {
        self.state.lock().unwrap().balances.insert(address, wei);
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state.lock().unwrap().nonces.insert(address, nonce);
    }

    /// 连接失败，节点没有收到交易
    pub fn fail_submissions(&self, fail: bool) {
        self.state.lock().unwrap().submit_error =
            fail.then(|| GatewayError::NodeUnreachable("connection reset".into()));
    }

    /// 节点明确拒绝
    pub fn reject_submissions(&self, message: &str) {
        self.state.lock().unwrap().submit_error = Some(GatewayError::NodeError {
            code: -32000,
            message: message.into(),
        });
    }

    pub fn lose_responses(&self, lose: bool) {
        self.state.lock().unwrap().lose_responses = lose;
    }

    pub fn submitted(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn set_receipt(&self, tx_hash: &str, status: ReceiptStatus, gas_used: u64) {
        let receipt = Receipt {
            tx_hash: tx_hash.to_lowercase(),
            block_number: RECEIPT_BLOCK,
            gas_used,
            effective_gas_price: Some(self.gas_price),
            status,
        };
        self.state
            .lock()
            .unwrap()
            .receipts
            .insert(tx_hash.to_lowercase(), receipt);
    }

    pub fn fail_receipt(&self, tx_hash: &str, err: GatewayError) {
        self.state
            .lock()
            .unwrap()
            .receipt_errors
            .insert(tx_hash.to_lowercase(), err);
    }
}

#[async_trait]
impl ChainGateway for MockGateway {
    async fn get_balance(&self, address: Address) -> GatewayResult<U256> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn get_nonce(&self, address: Address) -> GatewayResult<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nonces
            .get(&address)
            .copied()
            .unwrap_or(0))
    }

    async fn get_gas_price(&self) -> GatewayResult<U256> {
        Ok(self.gas_price)
    }

    async fn submit_raw_transaction(&self, raw: &Bytes) -> GatewayResult<String> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = &state.submit_error {
            return Err(err.clone());
        }
        state.submitted.push(raw.clone());
        if state.lose_responses {
            return Err(GatewayError::NodeUnreachable("read timed out".into()));
        }
        Ok(format!("0x{}", hex::encode(keccak256(raw))))
    }

    async fn get_receipt(&self, tx_hash: &str) -> GatewayResult<Option<Receipt>> {
        let state = self.state.lock().unwrap();
        if let Some(err) = state.receipt_errors.get(&tx_hash.to_lowercase()) {
            return Err(err.clone());
        }
        Ok(state.receipts.get(&tx_hash.to_lowercase()).cloned())
    }

    async fn get_block(&self, number: u64) -> GatewayResult<BlockInfo> {
        Ok(BlockInfo {
            number,
            hash: format!("0x{:064x}", number),
            timestamp: 1_700_000_000 + number * 12,
        })
    }

    async fn get_block_number(&self) -> GatewayResult<u64> {
        Ok(HEAD_BLOCK)
    }

    async fn get_chain_id(&self) -> GatewayResult<u64> {
        Ok(TEST_CHAIN_ID)
    }
}

pub fn test_config() -> Config {
    let mut config = Config::from_env().expect("config from env");
    config.chain.chain_id = TEST_CHAIN_ID;
    config.vault.master_key = "07".repeat(32);
    config.multisig.default_required_signatures = 2;
    config.multisig.default_ttl_hours = 24;
    config.reconciler.batch_size = 100;
    config
}

pub fn test_vault() -> Arc<KeyVault> {
    Arc::new(KeyVault::new(EncryptionKey::new([7u8; 32])).expect("vault"))
}

pub struct TestContext {
    pub state: AppState,
    pub chain: Arc<MockGateway>,
}

pub fn test_context() -> TestContext {
    let chain = Arc::new(MockGateway::new());
    let state = AppState::in_memory(Arc::new(test_config()), chain.clone(), test_vault());
    TestContext { state, chain }
}

pub fn ether(n: u64) -> U256 {
    U256::exp10(18) * U256::from(n)
}

/// 随机外部收款地址（EIP-55）
pub fn external_address() -> String {
    let wallet = LocalWallet::new(&mut rand::thread_rng());
    ethers::utils::to_checksum(&wallet.address(), None)
}
