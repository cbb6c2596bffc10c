//! QUIC networking layer
//!
//! Handles endpoint creation, connection establishment and message framing
//! over QUIC.
//!
//! # Security
//!
//! Hosts present a self-signed certificate. Clients accept it when it either
//! matches a pinned fingerprint or, without a pin, when the SPAKE2 handshake
//! later confirms the fingerprint the client saw (see `auth`). TLS handshake
//! signatures are always verified against the presented certificate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{
    ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig,
    VarInt,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use thiserror::Error;
use tracing::{debug, info, warn};

use tarship_core::crypto::CertFingerprint;
use tarship_core::{
    deserialize_message, serialize_message, NetMessage, ProtocolError, MAX_MESSAGE_SIZE,
};

/// Keepalive interval, well under common NAT timeouts
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Default idle timeout
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// QUIC connection wrapper
#[derive(Clone)]
pub struct QuicConnection {
    connection: Connection,
}

impl QuicConnection {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Open a bidirectional stream
    pub async fn open_stream(&self) -> Result<(SendStream, RecvStream), ConnectionError> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| ConnectionError::StreamOpen(e.to_string()))?;
        Ok((send, recv))
    }

    /// Accept an incoming bidirectional stream
    pub async fn accept_stream(&self) -> Result<(SendStream, RecvStream), ConnectionError> {
        let (send, recv) = self
            .connection
            .accept_bi()
            .await
            .map_err(|e| ConnectionError::StreamAccept(e.to_string()))?;
        Ok((send, recv))
    }

    /// Get remote address
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Fingerprint of the certificate the peer presented
    pub fn peer_fingerprint(&self) -> Option<CertFingerprint> {
        let identity = self.connection.peer_identity()?;
        let certs = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
        certs.first().map(compute_cert_fingerprint)
    }

    /// Close the connection
    pub fn close(&self, code: u32, reason: &str) {
        self.connection.close(code.into(), reason.as_bytes());
    }
}

/// Connection errors
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("failed to open stream: {0}")]
    StreamOpen(String),
    #[error("failed to accept stream: {0}")]
    StreamAccept(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("timed out")]
    Timeout,
}

/// Send a message on a stream
pub async fn send_message(stream: &mut SendStream, msg: &NetMessage) -> Result<(), ConnectionError> {
    let data = serialize_message(msg)
        .map_err(|e| ConnectionError::Protocol(ProtocolError::Serialization(e.to_string())))?;

    stream
        .write_all(&data)
        .await
        .map_err(|e| ConnectionError::Send(e.to_string()))?;

    Ok(())
}

/// Receive a message from a stream
pub async fn recv_message(stream: &mut RecvStream) -> Result<NetMessage, ConnectionError> {
    // Read length prefix
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| ConnectionError::Receive(e.to_string()))?;

    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(ConnectionError::Protocol(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        }));
    }

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| ConnectionError::Receive(e.to_string()))?;

    let msg = deserialize_message(&payload)
        .map_err(|e| ConnectionError::Protocol(ProtocolError::Deserialization(e.to_string())))?;

    Ok(msg)
}

/// Generate a self-signed certificate for the given names
pub fn generate_self_signed_cert(
    names: Vec<String>,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ConnectionError> {
    let cert = rcgen::generate_simple_self_signed(names)
        .map_err(|e| ConnectionError::Tls(e.to_string()))?;
    let key_der = cert.get_key_pair().serialize_der();
    let cert_der = cert
        .serialize_der()
        .map_err(|e| ConnectionError::Tls(e.to_string()))?;
    let key = PrivatePkcs8KeyDer::from(key_der).into();
    Ok((vec![CertificateDer::from(cert_der)], key))
}

/// Compute BLAKE3 fingerprint of a certificate
pub fn compute_cert_fingerprint(cert: &CertificateDer<'_>) -> CertFingerprint {
    tarship_core::crypto::checksum(cert.as_ref())
}

/// Transport configuration shared by both sides
pub fn create_transport_config(idle_timeout: Duration) -> Result<TransportConfig, ConnectionError> {
    let mut transport = TransportConfig::default();

    transport.keep_alive_interval(Some(KEEPALIVE_INTERVAL.min(idle_timeout / 2)));
    transport.max_idle_timeout(Some(
        idle_timeout
            .try_into()
            .map_err(|_| ConnectionError::Connect(format!("idle timeout {:?} out of range", idle_timeout)))?,
    ));
    transport.initial_rtt(Duration::from_millis(100));

    // One stream per request; a transfer rarely has more than a few open
    transport.max_concurrent_bidi_streams(VarInt::from_u32(64));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));

    Ok(transport)
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Create a QUIC client endpoint bound to `bind_addr`
///
/// With `pinned` set the host certificate must match that fingerprint.
/// Without it any certificate is accepted at the TLS layer and the
/// fingerprint is confirmed by the authentication handshake instead.
pub fn create_client_endpoint(
    bind_addr: SocketAddr,
    pinned: Option<CertFingerprint>,
    idle_timeout: Duration,
) -> Result<Endpoint, ConnectionError> {
    let mut endpoint =
        Endpoint::client(bind_addr).map_err(|e| ConnectionError::Connect(e.to_string()))?;

    let provider = crypto_provider();
    let verifier = FingerprintVerifier::new(pinned, provider.signature_verification_algorithms);

    let crypto = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ConnectionError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| ConnectionError::Tls(e.to_string()))?;
    let mut config = ClientConfig::new(Arc::new(quic_crypto));
    config.transport_config(Arc::new(create_transport_config(idle_timeout)?));

    endpoint.set_default_client_config(config);
    Ok(endpoint)
}

/// Create a QUIC server endpoint with a fresh self-signed certificate
///
/// Returns the endpoint along with its certificate fingerprint, which
/// clients may pin.
pub fn create_server_endpoint(
    bind_addr: SocketAddr,
    server_names: Vec<String>,
    idle_timeout: Duration,
) -> Result<(Endpoint, CertFingerprint), ConnectionError> {
    let (certs, key) = generate_self_signed_cert(server_names)?;
    let fingerprint = compute_cert_fingerprint(&certs[0]);

    let crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ConnectionError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConnectionError::Tls(e.to_string()))?;

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .map_err(|e| ConnectionError::Tls(e.to_string()))?;
    let mut config = ServerConfig::with_crypto(Arc::new(quic_crypto));
    config.transport_config(Arc::new(create_transport_config(idle_timeout)?));

    let endpoint =
        Endpoint::server(config, bind_addr).map_err(|e| ConnectionError::Connect(e.to_string()))?;

    info!("Server endpoint created with cert fingerprint: {}", hex::encode(fingerprint));
    Ok((endpoint, fingerprint))
}

/// Connect to a QUIC server
pub async fn connect(
    endpoint: &Endpoint,
    addr: SocketAddr,
    server_name: &str,
) -> Result<QuicConnection, ConnectionError> {
    let connection = endpoint
        .connect(addr, server_name)
        .map_err(|e| ConnectionError::Connect(e.to_string()))?
        .await
        .map_err(|e| ConnectionError::Connect(e.to_string()))?;

    info!("Connected to {}", addr);
    Ok(QuicConnection::new(connection))
}

/// Server certificate verifier keyed on the certificate fingerprint
#[derive(Debug)]
struct FingerprintVerifier {
    expected: Option<CertFingerprint>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl FingerprintVerifier {
    fn new(expected: Option<CertFingerprint>, algorithms: WebPkiSupportedAlgorithms) -> Self {
        Self {
            expected,
            algorithms,
        }
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual = compute_cert_fingerprint(end_entity);

        match self.expected {
            Some(expected) if expected != actual => {
                warn!(
                    "Certificate fingerprint mismatch! Expected: {}, Got: {}",
                    hex::encode(expected),
                    hex::encode(actual)
                );
                Err(rustls::Error::General("certificate fingerprint mismatch".into()))
            }
            Some(_) => {
                debug!("Certificate fingerprint verified: {}", hex::encode(actual));
                Ok(ServerCertVerified::assertion())
            }
            None => {
                debug!(
                    "Accepting unpinned certificate {}; the handshake must confirm it",
                    hex::encode(actual)
                );
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
