//! Electrum client errors.
use glacier_core::ChainError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ElectrumError {
    #[error("connection refused by {endpoint}")] ConnectionRefused { endpoint: String },
    #[error("i/o: {0}")] Io(String),
    #[error("tls: {0}")] Tls(String),
    #[error("timed out after {0:?}")] Timeout(std::time::Duration),
    #[error("not connected")] NotConnected,
    #[error("no protocol version accepted (offered {offered})")] NegotiationFailed { offered: String },
    #[error("server error {code}: {message}")] Server { code: i64, message: String },
    #[error("protocol: {0}")] Protocol(String),
    #[error("invalid address: {0}")] InvalidAddress(String),
    #[error("gave up after {attempts} attempts: {last}")] RetriesExhausted { attempts: u32, last: Box<ElectrumError> },
}

impl ElectrumError {
    /// Whether a fresh connect-negotiate-request cycle could succeed.
    ///
    /// Errors the server answered with, and local argument errors, are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ElectrumError::ConnectionRefused { .. }
                | ElectrumError::Io(_)
                | ElectrumError::Tls(_)
                | ElectrumError::Timeout(_)
                | ElectrumError::NotConnected
                | ElectrumError::Protocol(_)
        )
    }

    /// The innermost error, unwrapping [`ElectrumError::RetriesExhausted`].
    pub fn root(&self) -> &ElectrumError {
        match self {
            ElectrumError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

impl From<ElectrumError> for ChainError {
    fn from(err: ElectrumError) -> Self {
        match err.root() {
            ElectrumError::ConnectionRefused { endpoint } => {
                ChainError::ConnectionRefused { endpoint: endpoint.clone() }
            }
            ElectrumError::Timeout(d) => ChainError::Timeout(format!("{d:?}")),
            ElectrumError::Server { code, message } => {
                ChainError::Rpc { code: *code, message: message.clone() }
            }
            ElectrumError::Protocol(m) => ChainError::InvalidResponse(m.clone()),
            _ => ChainError::Transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_final() {
        let e = ElectrumError::Server { code: -32600, message: "bad".into() };
        assert!(!e.is_retryable());
        assert!(ElectrumError::Io("reset".into()).is_retryable());
    }

    #[test]
    fn refused_survives_retry_wrapping() {
        let e = ElectrumError::RetriesExhausted {
            attempts: 3,
            last: Box::new(ElectrumError::ConnectionRefused { endpoint: "h:1".into() }),
        };
        assert!(ChainError::from(e).is_connection_refused());
    }

    #[test]
    fn exhausted_display_includes_cause() {
        let e = ElectrumError::RetriesExhausted {
            attempts: 2,
            last: Box::new(ElectrumError::Io("broken pipe".into())),
        };
        assert_eq!(e.to_string(), "gave up after 2 attempts: i/o: broken pipe");
    }
}
