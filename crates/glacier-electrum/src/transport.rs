//! Byte stream to an Electrum server: plain TCP or TLS over TCP.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme, StreamOwned};
use tracing::{debug, warn};

use crate::config::ElectrumConfig;
use crate::error::ElectrumError;

pub enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Transport {
    /// Open a TCP connection and, if configured, complete the TLS handshake.
    pub fn connect(config: &ElectrumConfig) -> Result<Self, ElectrumError> {
        let tcp = connect_tcp(config)?;
        if !config.use_tls {
            return Ok(Transport::Plain(tcp));
        }

        let tls_config = client_tls_config(config.accept_invalid_certs)?;
        let server_name = ServerName::try_from(config.host.clone())
            .map_err(|e| ElectrumError::Tls(format!("invalid server name {}: {e}", config.host)))?;
        let mut conn = ClientConnection::new(tls_config, server_name)
            .map_err(|e| ElectrumError::Tls(e.to_string()))?;

        let mut tcp = tcp;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp)
                .map_err(|e| ElectrumError::Tls(format!("handshake with {}: {e}", config.endpoint())))?;
        }
        debug!(endpoint = %config.endpoint(), "electrum: tls handshake complete");
        Ok(Transport::Tls(Box::new(StreamOwned::new(conn, tcp))))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(s) => &s.sock,
        }
    }

    pub fn set_timeouts(&self, timeout: Duration) -> io::Result<()> {
        let tcp = self.tcp();
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))
    }

    /// Best-effort close: TLS close_notify, then TCP shutdown.
    pub fn shutdown(&mut self) {
        if let Transport::Tls(s) = self {
            s.conn.send_close_notify();
            let _ = s.conn.complete_io(&mut s.sock);
        }
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

fn connect_tcp(config: &ElectrumConfig) -> Result<TcpStream, ElectrumError> {
    let endpoint = config.endpoint();
    let addrs = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| ElectrumError::Io(format!("resolve {endpoint}: {e}")))?;

    let mut last_err = ElectrumError::Io(format!("{endpoint} resolved to no addresses"));
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(config.connect_timeout()))
                    .and_then(|_| stream.set_write_timeout(Some(config.connect_timeout())))
                    .and_then(|_| stream.set_nodelay(true))
                    .map_err(|e| ElectrumError::Io(e.to_string()))?;
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                last_err = ElectrumError::ConnectionRefused { endpoint: endpoint.clone() };
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                last_err = ElectrumError::Timeout(config.connect_timeout());
            }
            Err(e) => last_err = ElectrumError::Io(format!("connect {addr}: {e}")),
        }
    }
    Err(last_err)
}

fn client_tls_config(accept_invalid_certs: bool) -> Result<Arc<ClientConfig>, ElectrumError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ElectrumError::Tls(e.to_string()))?;

    let config = if accept_invalid_certs {
        warn!("electrum: server certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore { roots: webpki_roots::TLS_SERVER_ROOTS.to_vec() };
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn refused_connection_is_distinct() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let config = ElectrumConfig { connect_timeout_secs: 2, ..ElectrumConfig::local_plaintext(port) };
        assert!(matches!(
            Transport::connect(&config),
            Err(ElectrumError::ConnectionRefused { .. })
        ));
    }

    #[test]
    fn tls_config_builds_both_ways() {
        assert!(client_tls_config(true).is_ok());
        assert!(client_tls_config(false).is_ok());
    }
}
