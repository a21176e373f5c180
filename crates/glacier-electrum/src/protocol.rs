//! Electrum wire format: one JSON-RPC 2.0 object per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ElectrumError;

#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a [Value],
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a [Value]) -> Self {
        Self { jsonrpc: "2.0", id, method, params }
    }

    /// Serialized request terminated by `\n`.
    pub fn to_line(&self) -> Result<Vec<u8>, ElectrumError> {
        let mut line = serde_json::to_vec(self).map_err(|e| ElectrumError::Protocol(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// A parsed server message. Notifications carry no id.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<u64>,
    pub outcome: Result<Value, ElectrumError>,
}

/// Parse one line received from the server.
pub fn parse_response(line: &[u8]) -> Result<Response, ElectrumError> {
    let raw: RawResponse = serde_json::from_slice(line)
        .map_err(|e| ElectrumError::Protocol(format!("malformed response: {e}")))?;
    let id = raw.id.as_ref().and_then(Value::as_u64);
    let outcome = match raw.error {
        Some(err) if !err.is_null() => Err(server_error(&err)),
        _ => Ok(raw.result.unwrap_or(Value::Null)),
    };
    Ok(Response { id, outcome })
}

fn server_error(err: &Value) -> ElectrumError {
    match err {
        Value::Object(map) => ElectrumError::Server {
            code: map.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        },
        Value::String(s) => ElectrumError::Server { code: -1, message: s.clone() },
        other => ElectrumError::Server { code: -1, message: other.to_string() },
    }
}

/// Electrum script hash: SHA-256 of the output script, byte-reversed, hex.
pub fn script_hash(script_pubkey: &[u8]) -> String {
    let mut digest: [u8; 32] = Sha256::digest(script_pubkey).into();
    digest.reverse();
    hex::encode(digest)
}

/// Script hash of an address string (any network).
pub fn address_script_hash(address: &str) -> Result<String, ElectrumError> {
    let parsed: bitcoin::Address<bitcoin::address::NetworkUnchecked> = address
        .parse()
        .map_err(|e| ElectrumError::InvalidAddress(format!("{address}: {e}")))?;
    Ok(script_hash(parsed.assume_checked().script_pubkey().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_line_is_newline_terminated() {
        let params = [json!("glacier"), json!("1.4")];
        let line = Request::new(7, "server.version", &params).to_line().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        let v: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["method"], "server.version");
        assert_eq!(v["params"][1], "1.4");
    }

    #[test]
    fn parse_result() {
        let r = parse_response(br#"{"jsonrpc":"2.0","id":3,"result":{"height":10}}"#).unwrap();
        assert_eq!(r.id, Some(3));
        assert_eq!(r.outcome.unwrap()["height"], 10);
    }

    #[test]
    fn parse_null_result() {
        let r = parse_response(br#"{"jsonrpc":"2.0","id":4,"result":null}"#).unwrap();
        assert_eq!(r.outcome.unwrap(), Value::Null);
    }

    #[test]
    fn parse_error_object() {
        let r = parse_response(br#"{"id":5,"error":{"code":1,"message":"unsupported protocol version"}}"#)
            .unwrap();
        assert_eq!(
            r.outcome.unwrap_err(),
            ElectrumError::Server { code: 1, message: "unsupported protocol version".into() }
        );
    }

    #[test]
    fn parse_notification_has_no_id() {
        let r = parse_response(br#"{"jsonrpc":"2.0","method":"blockchain.headers.subscribe","params":[{"height":1}]}"#)
            .unwrap();
        assert_eq!(r.id, None);
    }

    #[test]
    fn parse_garbage_is_protocol_error() {
        assert!(matches!(parse_response(b"not json"), Err(ElectrumError::Protocol(_))));
    }

    #[test]
    fn genesis_p2pkh_script_hash() {
        let script = hex::decode("76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac").unwrap();
        assert_eq!(
            script_hash(&script),
            "8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161"
        );
        assert_eq!(
            address_script_hash("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").unwrap(),
            script_hash(&script)
        );
    }

    #[test]
    fn invalid_address_rejected() {
        assert!(matches!(address_script_hash("nonsense"), Err(ElectrumError::InvalidAddress(_))));
    }
}
