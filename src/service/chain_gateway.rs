//! 以太坊节点网关
//!
//! 纯适配层，不持有本地状态，也不做重试（重试策略由调用方决定）。
//! 超时在这一层统一设置

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{config::ChainConfig, infrastructure::rpc_validator, metrics};

/// JSON-RPC 解析错误码，节点返回内容无法识别时使用
pub const PARSE_ERROR: i64 = -32700;
/// 请求的对象不存在（区块等）
pub const RESOURCE_NOT_FOUND: i64 = -32001;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// 连接失败或超时：不知道节点是否收到了请求
    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("node error {code}: {message}")]
    NodeError { code: i64, message: String },
}

impl GatewayError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::NodeError {
            code: PARSE_ERROR,
            message: message.into(),
        }
    }

    /// 无法判断节点是否已收到请求
    ///
    /// 连接失败/超时、HTTP 5xx 和无法解析的应答都可能发生在节点处理之后；
    /// 只有节点明确返回的 JSON-RPC 错误才算拒绝
    pub fn is_ambiguous(&self) -> bool {
        match self {
            Self::NodeUnreachable(_) => true,
            Self::NodeError { code, .. } => *code == PARSE_ERROR || (500..600).contains(code),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Failure,
}

/// 交易回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: u64,
    pub gas_used: u64,
    pub effective_gas_price: Option<U256>,
    pub status: ReceiptStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: String,
    /// unix 秒
    pub timestamp: u64,
}

#[async_trait]
pub trait ChainGateway: Send + Sync {
    async fn get_balance(&self, address: Address) -> GatewayResult<U256>;

    /// 包含 pending 交易的 nonce
    async fn get_nonce(&self, address: Address) -> GatewayResult<u64>;

    async fn get_gas_price(&self) -> GatewayResult<U256>;

    /// 广播已签名交易，返回节点给出的交易哈希
    async fn submit_raw_transaction(&self, raw: &Bytes) -> GatewayResult<String>;

    /// None 表示尚未打包
    async fn get_receipt(&self, tx_hash: &str) -> GatewayResult<Option<Receipt>>;

    async fn get_block(&self, number: u64) -> GatewayResult<BlockInfo>;

    async fn get_block_number(&self) -> GatewayResult<u64>;

    async fn get_chain_id(&self) -> GatewayResult<u64>;
}

// ============ JSON-RPC 实现 ============

pub struct JsonRpcGateway {
    http_client: reqwest::Client,
    rpc_url: String,
    request_id: AtomicU64,
}

impl JsonRpcGateway {
    pub fn new(config: &ChainConfig) -> GatewayResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| GatewayError::NodeUnreachable(format!("failed to build client: {e}")))?;

        Ok(Self {
            http_client,
            rpc_url: config.rpc_url.clone(),
            request_id: AtomicU64::new(1),
        })
    }

    /// 发送一次 JSON-RPC 调用，返回 result 字段（可能为 null）
    async fn call(&self, method: &str, params: Value) -> GatewayResult<Value> {
        let started = Instant::now();
        let result = self.send_request(method, params).await;
        metrics::observe_rpc_latency_ms(started.elapsed().as_millis(), result.is_ok());
        result
    }

    async fn send_request(&self, method: &str, params: Value) -> GatewayResult<Value> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .http_client
            .post(&self.rpc_url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(method, error = %e, "RPC transport failure");
                GatewayError::NodeUnreachable(format!("{method}: {e}"))
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::NodeUnreachable(format!("{method}: reading body: {e}")))?;

        if !status.is_success() {
            return Err(GatewayError::NodeError {
                code: i64::from(status.as_u16()),
                message: format!("{method}: HTTP {status}: {}", truncate(&body, 200)),
            });
        }

        let mut json: Value = serde_json::from_str(&body)
            .map_err(|e| GatewayError::malformed(format!("{method}: invalid JSON: {e}")))?;

        if let Some(error) = json.get("error").filter(|e| !e.is_null()) {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown RPC error")
                .to_string();
            return Err(GatewayError::NodeError { code, message });
        }

        json.get_mut("result")
            .map(Value::take)
            .ok_or_else(|| GatewayError::malformed(format!("{method}: missing result field")))
    }

    async fn call_quantity(&self, method: &str, params: Value) -> GatewayResult<U256> {
        let result = self.call(method, params).await?;
        parse_quantity(&result, method)
    }

    async fn call_u64(&self, method: &str, params: Value) -> GatewayResult<u64> {
        let result = self.call(method, params).await?;
        parse_u64(&result, method)
    }
}

#[async_trait]
impl ChainGateway for JsonRpcGateway {
    async fn get_balance(&self, address: Address) -> GatewayResult<U256> {
        self.call_quantity(
            "eth_getBalance",
            serde_json::json!([format!("{address:?}"), "latest"]),
        )
        .await
    }

    async fn get_nonce(&self, address: Address) -> GatewayResult<u64> {
        self.call_u64(
            "eth_getTransactionCount",
            serde_json::json!([format!("{address:?}"), "pending"]),
        )
        .await
    }

    async fn get_gas_price(&self) -> GatewayResult<U256> {
        self.call_quantity("eth_gasPrice", serde_json::json!([])).await
    }

    async fn submit_raw_transaction(&self, raw: &Bytes) -> GatewayResult<String> {
        let raw_hex = format!("0x{}", hex::encode(raw));
        let result = self
            .call("eth_sendRawTransaction", serde_json::json!([raw_hex]))
            .await?;

        let hash = result
            .as_str()
            .ok_or_else(|| GatewayError::malformed("eth_sendRawTransaction: result is not a string"))?;
        rpc_validator::validate_tx_hash(hash)
            .map_err(|e| GatewayError::malformed(format!("eth_sendRawTransaction: {e}")))
    }

    async fn get_receipt(&self, tx_hash: &str) -> GatewayResult<Option<Receipt>> {
        let result = self
            .call("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await?;
        parse_receipt(&result)
    }

    async fn get_block(&self, number: u64) -> GatewayResult<BlockInfo> {
        let result = self
            .call(
                "eth_getBlockByNumber",
                serde_json::json!([format!("0x{number:x}"), false]),
            )
            .await?;
        parse_block(&result)?.ok_or_else(|| GatewayError::NodeError {
            code: RESOURCE_NOT_FOUND,
            message: format!("block {number} not found"),
        })
    }

    async fn get_block_number(&self) -> GatewayResult<u64> {
        self.call_u64("eth_blockNumber", serde_json::json!([])).await
    }

    async fn get_chain_id(&self) -> GatewayResult<u64> {
        self.call_u64("eth_chainId", serde_json::json!([])).await
    }
}

// ============ 响应解析 ============

fn parse_quantity(value: &Value, field: &str) -> GatewayResult<U256> {
    let text = value
        .as_str()
        .ok_or_else(|| GatewayError::malformed(format!("{field}: expected hex string")))?;
    rpc_validator::validate_quantity(text)
        .map_err(|e| GatewayError::malformed(format!("{field}: {e}")))
}

fn parse_u64(value: &Value, field: &str) -> GatewayResult<u64> {
    let text = value
        .as_str()
        .ok_or_else(|| GatewayError::malformed(format!("{field}: expected hex string")))?;
    rpc_validator::validate_u64(text).map_err(|e| GatewayError::malformed(format!("{field}: {e}")))
}

fn required<'a>(obj: &'a Value, field: &str) -> GatewayResult<&'a Value> {
    obj.get(field)
        .filter(|v| !v.is_null())
        .ok_or_else(|| GatewayError::malformed(format!("missing field {field}")))
}

/// 解析 eth_getTransactionReceipt 的结果；null 或尚无区块号表示仍在等待
pub fn parse_receipt(value: &Value) -> GatewayResult<Option<Receipt>> {
    if value.is_null() {
        return Ok(None);
    }
    if !value.is_object() {
        return Err(GatewayError::malformed("receipt is not an object"));
    }
    if value.get("blockNumber").map_or(true, Value::is_null) {
        return Ok(None);
    }

    let tx_hash = required(value, "transactionHash")?
        .as_str()
        .ok_or_else(|| GatewayError::malformed("transactionHash: expected string"))?;
    let tx_hash = rpc_validator::validate_tx_hash(tx_hash)
        .map_err(|e| GatewayError::malformed(format!("transactionHash: {e}")))?;

    let block_number = parse_u64(required(value, "blockNumber")?, "blockNumber")?;
    let gas_used = parse_u64(required(value, "gasUsed")?, "gasUsed")?;
    let effective_gas_price = match value.get("effectiveGasPrice") {
        Some(v) if !v.is_null() => Some(parse_quantity(v, "effectiveGasPrice")?),
        _ => None,
    };

    // 拜占庭分叉前的回执没有 status 字段，无法判断结果
    let status = match parse_u64(required(value, "status")?, "status")? {
        1 => ReceiptStatus::Success,
        0 => ReceiptStatus::Failure,
        other => {
            return Err(GatewayError::malformed(format!(
                "status: unexpected value {other}"
            )))
        }
    };

    Ok(Some(Receipt {
        tx_hash,
        block_number,
        gas_used,
        effective_gas_price,
        status,
    }))
}

/// 解析 eth_getBlockByNumber 的结果
pub fn parse_block(value: &Value) -> GatewayResult<Option<BlockInfo>> {
    if value.is_null() {
        return Ok(None);
    }

    let number = parse_u64(required(value, "number")?, "number")?;
    let timestamp = parse_u64(required(value, "timestamp")?, "timestamp")?;
    let hash = required(value, "hash")?
        .as_str()
        .ok_or_else(|| GatewayError::malformed("hash: expected string"))?;
    let hash = rpc_validator::validate_tx_hash(hash)
        .map_err(|e| GatewayError::malformed(format!("hash: {e}")))?;

    Ok(Some(BlockInfo {
        number,
        hash,
        timestamp,
    }))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
