use std::sync::{Arc, Mutex};
use std::time::Duration;

use ckb_jsonrpc_types::{BlockNumber, BlockView, TransactionView};
use ckb_types::{core, H256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("node returned error {}: {}", .0.code, .0.message)]
    Node(JsonRpcError),
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A JSONRPC request object
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    /// The name of the RPC call
    pub method: &'a str,
    /// Parameters to the RPC call
    pub params: &'a [Value],
    /// Identifier for this Request, which should appear in the response
    pub id: Value,
    /// jsonrpc field, MUST be "2.0"
    pub jsonrpc: Option<&'a str>,
}

/// A JSONRPC response object
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcResponse {
    /// A result if there is one, or null
    pub result: Option<Value>,
    /// An error if there is one, or null
    pub error: Option<JsonRpcError>,
    /// Identifier for this Request, which should match that of the request
    pub id: Value,
    /// jsonrpc field, MUST be "2.0"
    pub jsonrpc: Option<String>,
}

/// A JSONRPC error object
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct JsonRpcError {
    /// The integer identifier of the error
    pub code: i32,
    /// A string describing the error
    pub message: String,
    /// Additional data specific to the error
    pub data: Option<Value>,
}

/// The `get_transaction` envelope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransactionWithStatus {
    pub transaction: Option<TransactionView>,
    pub tx_status: TxStatus,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TxStatus {
    pub status: String,
    pub block_hash: Option<H256>,
}

/// The slice of the node RPC this crate consumes. The follower and the
/// transaction collector only see this seam, so tests drive them with a
/// scripted chain instead of a node.
pub trait ChainRpc: Send + Sync {
    fn get_block_by_number(&self, number: u64) -> Result<Option<core::BlockView>, RpcError>;

    fn get_transaction(&self, tx_hash: &H256)
        -> Result<Option<TransactionWithStatus>, RpcError>;
}

impl<T: ChainRpc + ?Sized> ChainRpc for &T {
    fn get_block_by_number(&self, number: u64) -> Result<Option<core::BlockView>, RpcError> {
        (**self).get_block_by_number(number)
    }

    fn get_transaction(
        &self,
        tx_hash: &H256,
    ) -> Result<Option<TransactionWithStatus>, RpcError> {
        (**self).get_transaction(tx_hash)
    }
}

impl<T: ChainRpc + ?Sized> ChainRpc for Arc<T> {
    fn get_block_by_number(&self, number: u64) -> Result<Option<core::BlockView>, RpcError> {
        (**self).get_block_by_number(number)
    }

    fn get_transaction(
        &self,
        tx_hash: &H256,
    ) -> Result<Option<TransactionWithStatus>, RpcError> {
        (**self).get_transaction(tx_hash)
    }
}

#[derive(Clone)]
pub struct HttpClient {
    uri: String,
    timeout: Duration,
    id: Arc<Mutex<u64>>,
}

impl HttpClient {
    pub fn new<S: Into<String>>(uri: S, timeout: Duration) -> Self {
        HttpClient {
            uri: uri.into(),
            timeout,
            id: Arc::new(Mutex::new(0)),
        }
    }

    fn build_request<'a>(&self, method: &'a str, params: &'a [Value]) -> RpcRequest<'a> {
        let mut id = self.id.lock().expect("rpc id lock poisoned");
        *id += 1;
        RpcRequest {
            method,
            params,
            id: (*id).into(),
            jsonrpc: Some("2.0"),
        }
    }

    async fn send_request(&self, request: &RpcRequest<'_>) -> Result<RpcResponse, RpcError> {
        let data = serde_json::json!(request);
        surf::post(&self.uri)
            .body_json(&data)
            .map_err(|e| RpcError::Transport(e.to_string()))?
            .recv_json::<RpcResponse>()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))
    }

    /// One call with the configured deadline; a `null` result becomes `None`.
    fn call(&self, method: &str, params: &[Value]) -> Result<Option<Value>, RpcError> {
        let request = self.build_request(method, params);
        let response = async_std::task::block_on(async {
            async_std::future::timeout(self.timeout, self.send_request(&request)).await
        })
        .map_err(|_| RpcError::Timeout(self.timeout))??;
        if let Some(error) = response.error {
            return Err(RpcError::Node(error));
        }
        match response.result {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(value)),
        }
    }
}

impl ChainRpc for HttpClient {
    fn get_block_by_number(&self, number: u64) -> Result<Option<core::BlockView>, RpcError> {
        let params = [serde_json::json!(BlockNumber::from(number))];
        match self.call("get_block_by_number", &params)? {
            None => Ok(None),
            Some(value) => {
                let block: BlockView = serde_json::from_value(value)?;
                Ok(Some(block.into()))
            }
        }
    }

    fn get_transaction(
        &self,
        tx_hash: &H256,
    ) -> Result<Option<TransactionWithStatus>, RpcError> {
        let params = [serde_json::json!(tx_hash)];
        match self.call("get_transaction", &params)? {
            None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_increase() {
        let client = HttpClient::new("http://127.0.0.1:8114", Duration::from_secs(5));
        let first = client.build_request("get_tip_block_number", &[]);
        assert_eq!(first.id, serde_json::json!(1));
        assert_eq!(first.jsonrpc, Some("2.0"));
        let second = client.build_request("get_tip_block_number", &[]);
        assert_eq!(second.id, serde_json::json!(2));
    }

    #[test]
    fn request_serializes_hex_block_number() {
        let params = [serde_json::json!(BlockNumber::from(0x400u64))];
        let client = HttpClient::new("http://127.0.0.1:8114", Duration::from_secs(5));
        let request = client.build_request("get_block_by_number", &params);
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["params"][0], serde_json::json!("0x400"));
    }

    #[test]
    #[ignore = "requires a ckb node listening on 127.0.0.1:8114"]
    fn get_block_by_number_works() {
        let client = HttpClient::new("http://127.0.0.1:8114", Duration::from_secs(5));
        let block = client.get_block_by_number(0).unwrap();
        assert!(block.is_some());
    }
}
