//! Cryptographic utilities for tarship sessions
//!
//! Provides:
//! - Credential digests (what the host stores instead of passwords)
//! - SPAKE2 password-authenticated key exchange (PAKE)
//! - Key confirmation bound to the host's certificate fingerprint

use spake2::{Ed25519Group, Identity, Password, Spake2};
use tracing::debug;

/// Size of PAKE output message
pub const PAKE_MESSAGE_SIZE: usize = 33;

/// Size of shared key derived from PAKE
pub const SHARED_KEY_SIZE: usize = 32;

/// Size of a credential digest / confirmation tag
pub const DIGEST_SIZE: usize = 32;

/// Context string for credential digests
const CREDENTIAL_CONTEXT: &str = "tarship 2024 credential digest v1";

/// PAKE identities for the two sides
const HOST_IDENTITY: &[u8] = b"tarship-host";
const CLIENT_IDENTITY_PREFIX: &[u8] = b"tarship-client:";

/// Certificate fingerprint - BLAKE3 hash of DER-encoded certificate
pub type CertFingerprint = [u8; 32];

/// Derive the credential digest for a user/password pair.
///
/// Both sides feed this value into SPAKE2, so the host only ever stores the
/// digest.
pub fn credential_digest(user: &str, password: &str) -> [u8; DIGEST_SIZE] {
    let mut hasher = blake3::Hasher::new_derive_key(CREDENTIAL_CONTEXT);
    hasher.update(user.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Parse a hex encoded credential digest
pub fn parse_digest(hex_digest: &str) -> Option<[u8; DIGEST_SIZE]> {
    let bytes = hex::decode(hex_digest.trim()).ok()?;
    bytes.try_into().ok()
}

/// Compute BLAKE3 checksum of data
pub fn checksum(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Fill a buffer with random bytes from the OS
pub fn random_id() -> Result<[u8; 16], getrandom::Error> {
    let mut id = [0u8; 16];
    getrandom::fill(&mut id)?;
    Ok(id)
}

/// Role in PAKE handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PakeRole {
    /// The side serving files
    Host,
    /// The side opening the session
    Client,
}

impl PakeRole {
    fn tag(self) -> &'static [u8] {
        match self {
            PakeRole::Host => b"host-confirm",
            PakeRole::Client => b"client-confirm",
        }
    }
}

/// PAKE handshake state machine
///
/// SPAKE2 over Ed25519 with the credential digest as password. The client
/// identity carries the user name, so a digest for one user can't be
/// replayed as another.
pub struct PakeHandshake {
    state: Option<Spake2<Ed25519Group>>,
    outbound_msg: Vec<u8>,
    role: PakeRole,
}

impl PakeHandshake {
    /// Start as host (SPAKE2 side A)
    pub fn start_host(user: &str, digest: &[u8; DIGEST_SIZE]) -> Self {
        let password = Password::new(digest);
        let client_identity = Identity::new(&client_identity(user));
        let host_identity = Identity::new(HOST_IDENTITY);

        let (state, outbound_msg) =
            Spake2::<Ed25519Group>::start_a(&password, &host_identity, &client_identity);

        debug!("Started PAKE handshake as host for {}", user);

        Self {
            state: Some(state),
            outbound_msg,
            role: PakeRole::Host,
        }
    }

    /// Start as client (SPAKE2 side B)
    pub fn start_client(user: &str, digest: &[u8; DIGEST_SIZE]) -> Self {
        let password = Password::new(digest);
        let client_identity = Identity::new(&client_identity(user));
        let host_identity = Identity::new(HOST_IDENTITY);

        let (state, outbound_msg) =
            Spake2::<Ed25519Group>::start_b(&password, &host_identity, &client_identity);

        debug!("Started PAKE handshake as client");

        Self {
            state: Some(state),
            outbound_msg,
            role: PakeRole::Client,
        }
    }

    /// Get the outbound PAKE message to send to the peer
    pub fn outbound_message(&self) -> &[u8] {
        &self.outbound_msg
    }

    /// Get the role of this handshake
    pub fn role(&self) -> PakeRole {
        self.role
    }

    /// Complete the handshake with the peer's message
    pub fn finish(mut self, peer_message: &[u8]) -> Result<SessionKey, PakeError> {
        let state = self.state.take().ok_or(PakeError::AlreadyFinished)?;

        let shared_key = state
            .finish(peer_message)
            .map_err(|_| PakeError::HandshakeFailed)?;

        if shared_key.len() != SHARED_KEY_SIZE {
            return Err(PakeError::HandshakeFailed);
        }
        let mut key = [0u8; SHARED_KEY_SIZE];
        key.copy_from_slice(&shared_key);

        debug!("PAKE handshake completed");
        Ok(SessionKey { key })
    }
}

fn client_identity(user: &str) -> Vec<u8> {
    let mut identity = CLIENT_IDENTITY_PREFIX.to_vec();
    identity.extend_from_slice(user.as_bytes());
    identity
}

/// Shared key produced by a finished PAKE handshake
pub struct SessionKey {
    key: [u8; SHARED_KEY_SIZE],
}

impl SessionKey {
    /// Confirmation tag proving knowledge of the key, bound to the TLS
    /// certificate the client actually saw.
    pub fn confirmation(&self, role: PakeRole, fingerprint: &CertFingerprint) -> [u8; DIGEST_SIZE] {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(role.tag());
        hasher.update(fingerprint);
        *hasher.finalize().as_bytes()
    }

    /// Verify a peer's confirmation tag in constant time
    pub fn verify(
        &self,
        role: PakeRole,
        fingerprint: &CertFingerprint,
        tag: &[u8; DIGEST_SIZE],
    ) -> bool {
        let expected = blake3::Hash::from(self.confirmation(role, fingerprint));
        expected == blake3::Hash::from(*tag)
    }
}

/// PAKE errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PakeError {
    /// Handshake already completed
    AlreadyFinished,
    /// Handshake failed (corrupted message)
    HandshakeFailed,
}

impl std::fmt::Display for PakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PakeError::AlreadyFinished => write!(f, "PAKE handshake already finished"),
            PakeError::HandshakeFailed => write!(f, "PAKE handshake failed"),
        }
    }
}

impl std::error::Error for PakeError {}
