/// Market RPC client - deal and operator lookups, deal termination
///
/// JSON-RPC over HTTP against the marketplace node, guarded by a circuit
/// breaker so a dead market endpoint does not hammer every tracking pass.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Buf, Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::metrics::prometheus as metrics;

/// Read-only view of a deal, resolved from the market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSnapshot {
    pub deal_id: i64,
    pub operator_id: String,
    /// Identity of the worker serving this deal.
    pub worker_id: String,
    /// Hashrate (H/s) the worker committed to when the deal was struck.
    pub bid_hashrate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub operator_id: String,
}

/// Resolves deals to their committed terms; can tear a deal down.
#[async_trait]
pub trait ContractRegistry: Send + Sync {
    async fn resolve(&self, deal_id: i64) -> Result<ContractSnapshot>;
    async fn terminate(&self, deal_id: i64) -> Result<()>;
}

/// Enumerates the workers fielded by an operator.
#[async_trait]
pub trait OperatorRegistry: Send + Sync {
    async fn list_workers(&self, operator_id: &str) -> Result<Vec<WorkerIdentity>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            is_open: false,
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());

        if self.failures >= self.max_failures {
            self.is_open = true;
            tracing::error!(
                "Market RPC circuit breaker tripped after {} failures, pausing for {}s",
                self.failures,
                self.reset_timeout.as_secs()
            );
        }
    }

    fn record_success(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            tracing::info!("Market RPC circuit breaker reset (successful call)");
        }
    }

    fn check(&mut self) -> Result<()> {
        if self.is_open {
            if let Some(last_fail) = self.last_failure {
                if last_fail.elapsed() > self.reset_timeout {
                    tracing::info!("Market RPC circuit breaker half-open, retrying");
                    self.is_open = false;
                    self.failures = 0;
                } else {
                    return Err(anyhow!("market RPC circuit breaker is open"));
                }
            }
        }
        Ok(())
    }
}

pub struct MarketRpcClient {
    base_url: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    circuit_breaker: Arc<RwLock<CircuitBreaker>>,
}

impl MarketRpcClient {
    pub fn new(base_url: String, timeout: Option<Duration>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();

        tracing::info!("MarketRpcClient initialized: {}", base_url);

        Self {
            base_url,
            timeout: timeout.unwrap_or(Duration::from_secs(30)),
            client,
            circuit_breaker: Arc::new(RwLock::new(CircuitBreaker::new())),
        }
    }

    /// Make RPC call to the market node
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        metrics::inc_rpc_requests();

        let res: Result<Value> = async {
            {
                let mut breaker = self.circuit_breaker.write().await;
                breaker.check()?;
            }

            let payload = RpcRequest {
                jsonrpc: "2.0".to_string(),
                id: 1,
                method: method.to_string(),
                params,
            };

            let body_bytes = serde_json::to_vec(&payload)?;
            let body = Full::new(Bytes::from(body_bytes));

            let req = Request::builder()
                .method(Method::POST)
                .uri(&self.base_url)
                .header("Content-Type", "application/json")
                .body(body)?;

            let response = tokio::time::timeout(self.timeout, self.client.request(req))
                .await
                .map_err(|_| anyhow!("market RPC request timeout"))?
                .map_err(|e| anyhow!("market RPC connection failed: {}", e))?;

            let status = response.status();
            if !status.is_success() {
                let mut breaker = self.circuit_breaker.write().await;
                breaker.record_failure();
                return Err(anyhow!("market RPC HTTP error: {}", status));
            }

            let body = response.into_body();
            let body_bytes = body.collect().await?.to_bytes();
            let rpc_response: RpcResponse = serde_json::from_reader(body_bytes.reader())?;

            // Application-level errors do not trip the breaker
            if let Some(error) = rpc_response.error {
                tracing::error!("market RPC error: {:?}", error);
                return Err(anyhow!("market RPC error: {:?}", error));
            }

            {
                let mut breaker = self.circuit_breaker.write().await;
                breaker.record_success();
            }

            Ok(rpc_response.result.unwrap_or(Value::Null))
        }
        .await;

        if res.is_err() {
            metrics::inc_rpc_errors();
        }

        res
    }
}

#[async_trait]
impl ContractRegistry for MarketRpcClient {
    async fn resolve(&self, deal_id: i64) -> Result<ContractSnapshot> {
        let result = self
            .call("deal_status", json!({ "deal_id": deal_id }))
            .await?;

        let snapshot: ContractSnapshot = serde_json::from_value(result)
            .map_err(|e| anyhow!("malformed deal_status reply for deal {}: {}", deal_id, e))?;
        Ok(snapshot)
    }

    async fn terminate(&self, deal_id: i64) -> Result<()> {
        let result = self
            .call("destroy_deal", json!({ "deal_id": deal_id }))
            .await?;

        let accepted = if let Some(b) = result.as_bool() {
            b
        } else if let Some(obj) = result.as_object() {
            obj.get("status")
                .and_then(|s| s.as_str())
                .map(|s| s.eq_ignore_ascii_case("destroyed") || s.eq_ignore_ascii_case("ok"))
                .unwrap_or(false)
        } else {
            false
        };

        if !accepted {
            return Err(anyhow!("destroy_deal rejected for deal {}: {:?}", deal_id, result));
        }
        Ok(())
    }
}

#[async_trait]
impl OperatorRegistry for MarketRpcClient {
    async fn list_workers(&self, operator_id: &str) -> Result<Vec<WorkerIdentity>> {
        let result = self
            .call("worker_list", json!({ "operator_id": operator_id }))
            .await?;

        let workers = result
            .get("workers")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        let list: Vec<WorkerIdentity> = serde_json::from_value(workers)
            .map_err(|e| anyhow!("malformed worker_list reply for {}: {}", operator_id, e))?;
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_breaker() {
        let mut breaker = CircuitBreaker::new();

        assert!(!breaker.is_open);

        for _ in 0..4 {
            breaker.record_failure();
            assert!(!breaker.is_open);
        }

        // 5th failure trips it
        breaker.record_failure();
        assert!(breaker.is_open);
        assert!(breaker.check().is_err());
    }

    #[tokio::test]
    async fn test_breaker_resets_on_success() {
        let mut breaker = CircuitBreaker::new();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failures, 0);
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn test_snapshot_parsing() {
        let value = json!({
            "deal_id": 9001,
            "operator_id": "0xfeed",
            "worker_id": "0xbeef",
            "bid_hashrate": 185_000_000u64,
        });
        let snapshot: ContractSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(snapshot.deal_id, 9001);
        assert_eq!(snapshot.bid_hashrate, 185_000_000);
    }
}
