//! Error types for addresses, key derivation and chain-data collaborators.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid HRP")] InvalidHrp,
    #[error("invalid length")] InvalidLength,
    #[error("invalid checksum")] InvalidChecksum,
    #[error("invalid character: {0}")] InvalidCharacter(char),
    #[error("invalid witness version: {0}")] InvalidVersion(u8),
    #[error("invalid padding bits")] InvalidPadding,
    #[error("unknown network: {0}")] UnknownNetwork(String),
    #[error("missing separator")] MissingSeparator,
    #[error("mixed case")] MixedCase,
    #[error("witness version {version} uses the wrong checksum variant")] WrongVariant { version: u8 },
    #[error("invalid witness program length: {0}")] InvalidProgramLength(usize),
    #[error("unrecognized address format: {0}")] Unrecognized(String),
    #[error("unknown address type: {0}")] UnknownAddressType(String),
    #[error("invalid public key: {0}")] InvalidKey(String),
}

/// Key derivation failures (bad seed or malformed path).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid seed: {0}")] InvalidSeed(String),
    #[error("malformed derivation path: {0}")] InvalidPath(String),
    #[error("derivation failed: {0}")] Derivation(String),
}

/// Failures reported by a chain-data source (trusted node or indexing server).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("connection refused by {endpoint}")] ConnectionRefused { endpoint: String },
    #[error("request timed out: {0}")] Timeout(String),
    #[error("rpc error {code}: {message}")] Rpc { code: i64, message: String },
    #[error("transaction rejected: {0}")] Rejected(String),
    #[error("not found: {0}")] NotFound(String),
    #[error("transport: {0}")] Transport(String),
    #[error("invalid response: {0}")] InvalidResponse(String),
}

impl ChainError {
    /// True when the source could not be reached at all, as opposed to
    /// answering with an error.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, ChainError::ConnectionRefused { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_error_display() {
        assert_eq!(AddressError::InvalidChecksum.to_string(), "invalid checksum");
        assert_eq!(
            AddressError::WrongVariant { version: 1 }.to_string(),
            "witness version 1 uses the wrong checksum variant"
        );
    }

    #[test]
    fn key_error_display() {
        let e = KeyError::InvalidSeed("too short".into());
        assert_eq!(e.to_string(), "invalid seed: too short");
    }

    #[test]
    fn chain_error_refused_is_distinct() {
        let refused = ChainError::ConnectionRefused { endpoint: "127.0.0.1:18443".into() };
        assert!(refused.is_connection_refused());
        assert!(!ChainError::Transport("reset".into()).is_connection_refused());
        assert_eq!(refused.to_string(), "connection refused by 127.0.0.1:18443");
    }
}
