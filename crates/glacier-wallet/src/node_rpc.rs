//! bitcoind JSON-RPC chain source.
//!
//! Implements [`ChainBackend`] over the node's HTTP JSON-RPC interface with
//! basic auth. UTXO discovery uses `scantxoutset`, so no node-side wallet
//! needs to be loaded.

use std::sync::atomic::{AtomicU64, Ordering};

use glacier_core::error::ChainError;
use glacier_core::traits::ChainBackend;
use glacier_core::types::{btc_to_sats, OutPoint, RawTransactionInfo, ScannedOutput, Txid};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::config::NodeRpcConfig;
use crate::error::WalletError;

/// `RPC_INVALID_ADDRESS_OR_KEY`, also returned for unknown transactions.
const RPC_NOT_FOUND: i64 = -5;
/// `RPC_VERIFY_ERROR`, `RPC_VERIFY_REJECTED`, `RPC_VERIFY_ALREADY_IN_CHAIN`.
const RPC_REJECTED: [i64; 3] = [-25, -26, -27];

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct ScanResult {
    #[serde(default)]
    success: bool,
    height: u64,
    #[serde(default)]
    unspents: Vec<ScanUnspent>,
}

#[derive(Deserialize)]
struct ScanUnspent {
    txid: String,
    vout: u32,
    amount: f64,
    height: u64,
    #[serde(default)]
    coinbase: bool,
}

/// Blocking client for one bitcoind instance.
pub struct NodeRpcClient {
    url: String,
    endpoint: String,
    user: String,
    password: String,
    client: Client,
    next_id: AtomicU64,
}

impl NodeRpcClient {
    pub fn new(config: &NodeRpcConfig) -> Result<Self, WalletError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| WalletError::InvalidConfiguration(format!("http client: {e}")))?;
        Ok(Self {
            url: config.url(),
            endpoint: config.endpoint(),
            user: config.rpc_user.clone(),
            password: config.rpc_password.clone(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(method, id, "node rpc");
        let request = JsonRpcRequest { jsonrpc: "1.0", id, method, params };

        let resp = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&request)
            .send()
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ChainError::Transport(format!(
                "{} rejected the rpc credentials (HTTP {status})",
                self.endpoint
            )));
        }
        let body = resp.text().map_err(|e| self.transport_error(e))?;
        let parsed: JsonRpcResponse = serde_json::from_str(&body)
            .map_err(|e| ChainError::InvalidResponse(format!("{method}: HTTP {status}: {e}")))?;

        if let Some(err) = parsed.error {
            debug!(method, code = err.code, message = %err.message, "node rpc error");
            return Err(rpc_error(err.code, err.message));
        }
        parsed
            .result
            .ok_or_else(|| ChainError::InvalidResponse(format!("{method}: response without result")))
    }

    fn transport_error(&self, err: reqwest::Error) -> ChainError {
        if err.is_connect() {
            ChainError::ConnectionRefused { endpoint: self.endpoint.clone() }
        } else if err.is_timeout() {
            ChainError::Timeout(format!("{}: {err}", self.endpoint))
        } else {
            ChainError::Transport(err.to_string())
        }
    }
}

impl ChainBackend for NodeRpcClient {
    fn scan_address(&self, address: &str) -> Result<Vec<ScannedOutput>, ChainError> {
        let result = self.call("scantxoutset", json!(["start", [format!("addr({address})")]]))?;
        parse_scan(result, address)
    }

    fn raw_transaction(&self, txid: &Txid) -> Result<RawTransactionInfo, ChainError> {
        let result = self.call("getrawtransaction", json!([txid.to_string(), true]))?;
        RawTransactionInfo::from_verbose_json(&result)
    }

    fn broadcast(&self, raw_tx: &[u8]) -> Result<Txid, ChainError> {
        let result = self
            .call("sendrawtransaction", json!([hex::encode(raw_tx)]))
            .map_err(|e| match e {
                ChainError::Rpc { message, .. } => ChainError::Rejected(message),
                other => other,
            })?;
        result
            .as_str()
            .ok_or_else(|| ChainError::InvalidResponse(format!("sendrawtransaction returned {result}")))?
            .parse()
    }

    fn block_count(&self) -> Result<u64, ChainError> {
        let result = self.call("getblockcount", json!([]))?;
        result
            .as_u64()
            .ok_or_else(|| ChainError::InvalidResponse(format!("getblockcount returned {result}")))
    }

    fn estimate_fee_rate(&self, target_blocks: u16) -> Result<Option<u64>, ChainError> {
        let result = self.call("estimatesmartfee", json!([target_blocks]))?;
        Ok(result.get("feerate").and_then(Value::as_f64).map(btc_per_kvb_to_sat_per_vb))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

fn rpc_error(code: i64, message: String) -> ChainError {
    match code {
        RPC_NOT_FOUND => ChainError::NotFound(message),
        c if RPC_REJECTED.contains(&c) => ChainError::Rejected(message),
        _ => ChainError::Rpc { code, message },
    }
}

/// `scantxoutset` result to scanned outputs of `address`.
fn parse_scan(result: Value, address: &str) -> Result<Vec<ScannedOutput>, ChainError> {
    let scan: ScanResult = serde_json::from_value(result)
        .map_err(|e| ChainError::InvalidResponse(format!("scantxoutset: {e}")))?;
    if !scan.success {
        return Err(ChainError::InvalidResponse("scantxoutset did not complete".into()));
    }
    scan.unspents
        .into_iter()
        .map(|u| {
            Ok(ScannedOutput {
                outpoint: OutPoint::new(u.txid.parse()?, u.vout),
                amount: btc_to_sats(u.amount)?,
                address: address.to_string(),
                confirmations: (scan.height + 1).saturating_sub(u.height) as u32,
                coinbase: u.coinbase,
            })
        })
        .collect()
}

/// BTC/kvB to sat/vB, rounded up, at least 1.
pub fn btc_per_kvb_to_sat_per_vb(btc_per_kvb: f64) -> u64 {
    let sat_per_kvb = (btc_per_kvb * 1e8).round().max(0.0) as u64;
    sat_per_kvb.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Answer one HTTP request with `status` and `body`; the join handle
    /// yields the raw request.
    fn serve_once(status: &'static str, body: String) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut head = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = v.trim().parse().unwrap();
                }
                head.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            let mut req_body = vec![0u8; content_length];
            reader.read_exact(&mut req_body).unwrap();
            let mut stream = reader.into_inner();
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            head + &String::from_utf8(req_body).unwrap()
        });
        (port, handle)
    }

    fn client(port: u16) -> NodeRpcClient {
        NodeRpcClient::new(&NodeRpcConfig {
            rpc_host: "127.0.0.1".into(),
            rpc_port: port,
            timeout_secs: 5,
            ..NodeRpcConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn refused_connection_is_distinct() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = client(port).block_count().unwrap_err();
        assert_eq!(err, ChainError::ConnectionRefused { endpoint: format!("127.0.0.1:{port}") });
        assert!(matches!(WalletError::from(err), WalletError::NodeUnreachable { .. }));
    }

    #[test]
    fn block_count_with_basic_auth() {
        let (port, server) = serve_once("200 OK", r#"{"result":321,"error":null,"id":1}"#.into());
        assert_eq!(client(port).block_count().unwrap(), 321);
        let request = server.join().unwrap();
        // user:password
        assert!(request.contains("dXNlcjpwYXNzd29yZA=="), "{request}");
        assert!(request.contains(r#""method":"getblockcount""#));
    }

    #[test]
    fn rejected_broadcast() {
        let body = r#"{"result":null,"error":{"code":-26,"message":"min relay fee not met"},"id":1}"#;
        let (port, _server) = serve_once("500 Internal Server Error", body.into());
        let err = client(port).broadcast(&[0u8; 10]).unwrap_err();
        assert_eq!(err, ChainError::Rejected("min relay fee not met".into()));
    }

    #[test]
    fn bad_credentials_reported() {
        let (port, _server) = serve_once("401 Unauthorized", String::new());
        let err = client(port).block_count().unwrap_err();
        assert!(matches!(err, ChainError::Transport(m) if m.contains("credentials")));
    }

    #[test]
    fn fee_estimate_without_data_is_none() {
        let body = r#"{"result":{"errors":["Insufficient data or no feerate found"],"blocks":6},"error":null,"id":1}"#;
        let (port, _server) = serve_once("200 OK", body.into());
        assert_eq!(client(port).estimate_fee_rate(6).unwrap(), None);
    }

    #[test]
    fn fee_rate_conversion() {
        assert_eq!(btc_per_kvb_to_sat_per_vb(0.00012), 12);
        assert_eq!(btc_per_kvb_to_sat_per_vb(0.00001001), 2);
        assert_eq!(btc_per_kvb_to_sat_per_vb(0.0), 1);
    }

    #[test]
    fn scan_result_parsed() {
        let result = json!({
            "success": true,
            "txouts": 1000,
            "height": 150,
            "unspents": [
                { "txid": "aa".repeat(32), "vout": 1, "amount": 0.5, "height": 150, "coinbase": false,
                  "scriptPubKey": "0014", "desc": "addr(bcrt1q...)" },
                { "txid": "bb".repeat(32), "vout": 0, "amount": 50.0, "height": 60, "coinbase": true }
            ],
            "total_amount": 50.5
        });
        let outputs = parse_scan(result, "bcrt1qexample").unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].amount, 50_000_000);
        assert_eq!(outputs[0].confirmations, 1);
        assert_eq!(outputs[0].outpoint.vout, 1);
        assert_eq!(outputs[1].confirmations, 91);
        assert!(outputs[1].coinbase);
        assert_eq!(outputs[1].address, "bcrt1qexample");
    }

    #[test]
    fn rpc_codes_classified() {
        assert_eq!(rpc_error(-5, "No such mempool transaction".into()), ChainError::NotFound("No such mempool transaction".into()));
        assert!(matches!(rpc_error(-8, "Scan already in progress".into()), ChainError::Rpc { code: -8, .. }));
    }
}
