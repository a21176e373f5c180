//! Electrum client connection state machine.
//!
//! ```text
//! DISCONNECTED ──connect──▶ CONNECTING ──tls + server.version──▶ CONNECTED
//!       ▲                                                          │
//!       └────────────── any i/o error, timeout, or close ◀─────────┘
//! ```
//!
//! Every request runs up to `max_retries` full connect-negotiate-request
//! cycles with exponential backoff between them. Before an existing socket
//! is reused it is probed with `server.ping`. A read that is interrupted
//! before the deadline is retried in place, briefly. Any other read failure,
//! including the `InvalidData` or `UnexpectedEof` rustls reports for a
//! damaged TLS record, tears the connection down so the request is retried
//! on a fresh one.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::thread;
use std::time::{Duration, Instant};

use glacier_core::constants::COINBASE_MATURITY;
use glacier_core::error::ChainError;
use glacier_core::traits::ChainBackend;
use glacier_core::types::{OutPoint, RawTransactionInfo, ScannedOutput, Txid};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ElectrumConfig;
use crate::error::ElectrumError;
use crate::protocol::{self, Request};
use crate::rate_limiter::RequestRateLimiter;
use crate::transport::Transport;

/// Confirmation targets queried by [`ChainDataClient::fee_estimates`].
pub const FEE_TARGETS: [u16; 6] = [1, 2, 4, 6, 12, 24];

/// In-place retries of a transient read error before reconnecting.
const TRANSIENT_READ_RETRIES: u32 = 3;
const TRANSIENT_READ_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Entry of `blockchain.scripthash.get_history`. `height <= 0` is mempool.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct HistoryItem {
    pub tx_hash: String,
    pub height: i64,
}

/// Reply of `blockchain.scripthash.get_balance`, in satoshis.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AddressBalance {
    pub confirmed: i64,
    pub unconfirmed: i64,
}

#[derive(Debug, Deserialize)]
struct UnspentItem {
    tx_hash: String,
    tx_pos: u32,
    height: i64,
    value: u64,
}

/// Confirmation status of a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionStatus {
    pub confirmed: bool,
    pub confirmations: u32,
}

struct Inner {
    state: ConnectionState,
    conn: Option<BufReader<Transport>>,
    next_id: u64,
    limiter: RequestRateLimiter,
    protocol_version: Option<String>,
    last_used: Option<Instant>,
}

impl Inner {
    fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.get_mut().shutdown();
            debug!("electrum: disconnected");
        }
        self.state = ConnectionState::Disconnected;
        self.protocol_version = None;
        self.last_used = None;
    }

    /// One request/response exchange on the open connection.
    fn exchange(&mut self, method: &str, params: &[Value], timeout: Duration) -> Result<Value, ElectrumError> {
        self.limiter.acquire();
        self.next_id += 1;
        let id = self.next_id;
        let line = Request::new(id, method, params).to_line()?;

        let conn = self.conn.as_mut().ok_or(ElectrumError::NotConnected)?;
        conn.get_ref().set_timeouts(timeout).map_err(io_error)?;
        conn.get_mut().write_all(&line).map_err(io_error)?;
        conn.get_mut().flush().map_err(io_error)?;
        debug!(id, method, "electrum: request sent");

        let value = read_response(conn, id, Instant::now() + timeout, timeout)?;
        self.last_used = Some(Instant::now());
        Ok(value)
    }
}

fn io_error(e: std::io::Error) -> ElectrumError {
    ElectrumError::Io(e.to_string())
}

/// Read lines until the response for `id` arrives or `deadline` passes.
fn read_response(
    conn: &mut BufReader<Transport>,
    id: u64,
    deadline: Instant,
    timeout: Duration,
) -> Result<Value, ElectrumError> {
    let mut line = Vec::new();
    let mut transient = 0;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(ElectrumError::Timeout(timeout));
        }
        conn.get_ref().set_timeouts(deadline - now).map_err(io_error)?;

        match conn.read_until(b'\n', &mut line) {
            Ok(0) => return Err(ElectrumError::Io("connection closed by server".into())),
            Ok(_) if line.last() != Some(&b'\n') => continue,
            Ok(_) => {
                let response = protocol::parse_response(&line)?;
                line.clear();
                match response.id {
                    Some(rid) if rid == id => return response.outcome,
                    other => debug!(?other, expected = id, "electrum: skipping unrelated message"),
                }
            }
            Err(e) => match classify_read_error(e.kind(), Instant::now() < deadline) {
                ReadFailure::Retry if transient < TRANSIENT_READ_RETRIES => {
                    transient += 1;
                    debug!(attempt = transient, error = %e, "electrum: interrupted read, retrying in place");
                    thread::sleep(TRANSIENT_READ_DELAY);
                }
                ReadFailure::Timeout => return Err(ElectrumError::Timeout(timeout)),
                ReadFailure::Retry | ReadFailure::Fatal => return Err(io_error(e)),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadFailure {
    /// Same socket, after a short pause.
    Retry,
    Timeout,
    /// The connection is unusable.
    Fatal,
}

fn classify_read_error(kind: ErrorKind, before_deadline: bool) -> ReadFailure {
    match kind {
        ErrorKind::Interrupted => ReadFailure::Retry,
        ErrorKind::WouldBlock if before_deadline => ReadFailure::Retry,
        ErrorKind::WouldBlock | ErrorKind::TimedOut => ReadFailure::Timeout,
        _ => ReadFailure::Fatal,
    }
}

/// Retrying, reconnecting Electrum client.
///
/// All requests are serialized through one connection. Connecting is lazy:
/// the first request (or an explicit [`connect`](Self::connect)) opens it.
pub struct ChainDataClient {
    config: ElectrumConfig,
    inner: Mutex<Inner>,
    /// Whether a transaction is a coinbase, by txid. Never changes once known.
    coinbase: Mutex<HashMap<Txid, bool>>,
}

impl ChainDataClient {
    pub fn new(config: ElectrumConfig) -> Self {
        let limiter = RequestRateLimiter::per_second(config.max_requests_per_second);
        Self {
            config,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                conn: None,
                next_id: 0,
                limiter,
                protocol_version: None,
                last_used: None,
            }),
            coinbase: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ElectrumConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Protocol version agreed with the server, while connected.
    pub fn protocol_version(&self) -> Option<String> {
        self.inner.lock().protocol_version.clone()
    }

    /// Connect and negotiate now rather than on the first request.
    pub fn connect(&self) -> Result<(), ElectrumError> {
        let mut inner = self.inner.lock();
        self.ensure_connected(&mut inner)
    }

    /// Close the connection. The next request reconnects.
    pub fn close(&self) {
        self.inner.lock().disconnect();
    }

    fn ensure_connected(&self, inner: &mut Inner) -> Result<(), ElectrumError> {
        if inner.state == ConnectionState::Connected && inner.conn.is_some() {
            let idle = inner.last_used.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
            if idle < self.config.liveness_idle() && !self.config.liveness_idle().is_zero() {
                return Ok(());
            }
            match inner.exchange("server.ping", &[], self.config.operation_timeout()) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "electrum: liveness probe failed, reconnecting");
                    inner.disconnect();
                }
            }
        }

        inner.state = ConnectionState::Connecting;
        info!(endpoint = %self.config.endpoint(), tls = self.config.use_tls, "electrum: connecting");
        let transport = match Transport::connect(&self.config) {
            Ok(t) => t,
            Err(e) => {
                inner.disconnect();
                return Err(e);
            }
        };
        inner.conn = Some(BufReader::new(transport));

        match self.negotiate(inner) {
            Ok(version) => {
                info!(endpoint = %self.config.endpoint(), %version, "electrum: connected");
                inner.protocol_version = Some(version);
                inner.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                inner.disconnect();
                Err(e)
            }
        }
    }

    /// Offer each known protocol version, newest first, until one is accepted.
    fn negotiate(&self, inner: &mut Inner) -> Result<String, ElectrumError> {
        for version in &self.config.protocol_versions {
            let params = [json!(self.config.client_name), json!(version)];
            match inner.exchange("server.version", &params, self.config.negotiation_timeout()) {
                Ok(reply) => {
                    debug!(%version, server = %reply, "electrum: version accepted");
                    return Ok(version.clone());
                }
                Err(ElectrumError::Server { code, message }) => {
                    warn!(%version, code, %message, "electrum: version rejected");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ElectrumError::NegotiationFailed { offered: self.config.protocol_versions.join(", ") })
    }

    /// Send a request, retrying the full connect-negotiate-request cycle on
    /// connection-level failures.
    pub fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, ElectrumError> {
        let attempts = self.config.max_retries.max(1);
        let mut last = ElectrumError::NotConnected;
        for attempt in 0..attempts {
            let result = {
                let mut inner = self.inner.lock();
                let result = match self.ensure_connected(&mut inner) {
                    Ok(()) => inner.exchange(method, &params, self.config.operation_timeout()),
                    Err(e) => Err(e),
                };
                if matches!(&result, Err(e) if e.is_retryable()) {
                    inner.disconnect();
                }
                result
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(method, attempt = attempt + 1, of = attempts, error = %e,
                        "electrum: request failed");
                    last = e;
                    if attempt + 1 < attempts {
                        thread::sleep(self.config.backoff(attempt));
                    }
                }
            }
        }
        Err(ElectrumError::RetriesExhausted { attempts, last: Box::new(last) })
    }

    // --- queries ---

    pub fn ping(&self) -> Result<(), ElectrumError> {
        self.request("server.ping", vec![]).map(|_| ())
    }

    /// Raw transaction hex.
    pub fn transaction(&self, txid: &Txid) -> Result<String, ElectrumError> {
        let v = self.request("blockchain.transaction.get", vec![json!(txid.to_string())])?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| ElectrumError::Protocol("transaction reply is not a string".into()))
    }

    /// Decoded transaction with confirmation depth (verbose get).
    pub fn transaction_verbose(&self, txid: &Txid) -> Result<RawTransactionInfo, ElectrumError> {
        let v = self.request(
            "blockchain.transaction.get",
            vec![json!(txid.to_string()), json!(true)],
        )?;
        RawTransactionInfo::from_verbose_json(&v).map_err(|e| ElectrumError::Protocol(e.to_string()))
    }

    pub fn transaction_status(&self, txid: &Txid) -> Result<TransactionStatus, ElectrumError> {
        let info = self.transaction_verbose(txid)?;
        Ok(TransactionStatus { confirmed: info.confirmations > 0, confirmations: info.confirmations })
    }

    /// Merkle branch proving `txid` is in the block at `height`.
    pub fn merkle(&self, txid: &Txid, height: u64) -> Result<Value, ElectrumError> {
        self.request(
            "blockchain.transaction.get_merkle",
            vec![json!(txid.to_string()), json!(height)],
        )
    }

    /// 80-byte block header at `height`, hex.
    pub fn block_header(&self, height: u64) -> Result<String, ElectrumError> {
        let v = self.request("blockchain.block.header", vec![json!(height)])?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| ElectrumError::Protocol("header reply is not a string".into()))
    }

    pub fn address_history(&self, address: &str) -> Result<Vec<HistoryItem>, ElectrumError> {
        let hash = protocol::address_script_hash(address)?;
        let v = self.request("blockchain.scripthash.get_history", vec![json!(hash)])?;
        decode(v)
    }

    pub fn address_balance(&self, address: &str) -> Result<AddressBalance, ElectrumError> {
        let hash = protocol::address_script_hash(address)?;
        let v = self.request("blockchain.scripthash.get_balance", vec![json!(hash)])?;
        decode(v)
    }

    /// Unspent outputs of `address` with confirmation depths.
    ///
    /// `listunspent` does not say whether an output is a coinbase, so the
    /// funding transaction of every confirmed output below maturity depth is
    /// fetched and decoded. Deeper outputs are spendable either way and are
    /// only flagged when the answer is already cached.
    pub fn list_unspent(&self, address: &str) -> Result<Vec<ScannedOutput>, ElectrumError> {
        let hash = protocol::address_script_hash(address)?;
        let tip = self.current_height()?;
        let items: Vec<UnspentItem> =
            decode(self.request("blockchain.scripthash.listunspent", vec![json!(hash)])?)?;

        items
            .into_iter()
            .map(|item| {
                let txid: Txid = item
                    .tx_hash
                    .parse()
                    .map_err(|e: ChainError| ElectrumError::Protocol(e.to_string()))?;
                let confirmations = if item.height > 0 {
                    (tip as i64 - item.height + 1).max(0) as u32
                } else {
                    0
                };
                let coinbase = match confirmations {
                    0 => false,
                    c if c < COINBASE_MATURITY => self.is_coinbase(&txid)?,
                    _ => self.coinbase.lock().get(&txid).copied().unwrap_or(false),
                };
                Ok(ScannedOutput {
                    outpoint: OutPoint::new(txid, item.tx_pos),
                    amount: item.value,
                    address: address.to_string(),
                    confirmations,
                    coinbase,
                })
            })
            .collect()
    }

    /// Whether `txid` is a coinbase transaction. Cached per txid.
    pub fn is_coinbase(&self, txid: &Txid) -> Result<bool, ElectrumError> {
        if let Some(known) = self.coinbase.lock().get(txid) {
            return Ok(*known);
        }
        let raw = hex::decode(self.transaction(txid)?)
            .map_err(|e| ElectrumError::Protocol(format!("transaction {txid} is not hex: {e}")))?;
        let tx: bitcoin::Transaction = bitcoin::consensus::deserialize(&raw)
            .map_err(|e| ElectrumError::Protocol(format!("transaction {txid} does not decode: {e}")))?;
        let coinbase = tx.is_coinbase();
        self.coinbase.lock().insert(*txid, coinbase);
        Ok(coinbase)
    }

    /// Fee estimate in BTC/kvB per confirmation target. `None` where the
    /// server has no estimate.
    pub fn fee_estimates(&self) -> Result<BTreeMap<u16, Option<f64>>, ElectrumError> {
        let mut out = BTreeMap::new();
        for target in FEE_TARGETS {
            out.insert(target, self.estimate_fee(target)?);
        }
        Ok(out)
    }

    fn estimate_fee(&self, target: u16) -> Result<Option<f64>, ElectrumError> {
        let v = self.request("blockchain.estimatefee", vec![json!(target)])?;
        Ok(v.as_f64().filter(|rate| *rate > 0.0))
    }

    /// Height of the server's best block.
    pub fn current_height(&self) -> Result<u64, ElectrumError> {
        let v = self.request("blockchain.headers.subscribe", vec![])?;
        v.get("height")
            .and_then(Value::as_u64)
            .ok_or_else(|| ElectrumError::Protocol("headers reply without height".into()))
    }

    /// Mempool fee histogram as `(fee_rate, vsize)` pairs.
    pub fn fee_histogram(&self) -> Result<Vec<(f64, u64)>, ElectrumError> {
        decode(self.request("mempool.get_fee_histogram", vec![])?)
    }

    pub fn broadcast_hex(&self, raw_tx_hex: &str) -> Result<Txid, ElectrumError> {
        let v = self.request("blockchain.transaction.broadcast", vec![json!(raw_tx_hex)])?;
        v.as_str()
            .ok_or_else(|| ElectrumError::Protocol("broadcast reply is not a txid".into()))?
            .parse()
            .map_err(|e: ChainError| ElectrumError::Protocol(e.to_string()))
    }
}

fn decode<T: serde::de::DeserializeOwned>(v: Value) -> Result<T, ElectrumError> {
    serde_json::from_value(v).map_err(|e| ElectrumError::Protocol(e.to_string()))
}

impl ChainBackend for ChainDataClient {
    fn scan_address(&self, address: &str) -> Result<Vec<ScannedOutput>, ChainError> {
        Ok(self.list_unspent(address)?)
    }

    fn raw_transaction(&self, txid: &Txid) -> Result<RawTransactionInfo, ChainError> {
        Ok(self.transaction_verbose(txid)?)
    }

    fn broadcast(&self, raw_tx: &[u8]) -> Result<Txid, ChainError> {
        self.broadcast_hex(&hex::encode(raw_tx)).map_err(|e| match e.root() {
            ElectrumError::Server { message, .. } => ChainError::Rejected(message.clone()),
            _ => e.into(),
        })
    }

    fn block_count(&self) -> Result<u64, ChainError> {
        Ok(self.current_height()?)
    }

    fn estimate_fee_rate(&self, target_blocks: u16) -> Result<Option<u64>, ChainError> {
        // BTC/kvB to sat/vB, rounded up.
        Ok(self
            .estimate_fee(target_blocks)?
            .map(|btc_per_kvb| ((btc_per_kvb * 100_000_000.0).round() as u64).div_ceil(1000)))
    }

    fn endpoint(&self) -> String {
        self.config.endpoint()
    }
}

impl Drop for ChainDataClient {
    fn drop(&mut self) {
        self.inner.get_mut().disconnect();
    }
}
