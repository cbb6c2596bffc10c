//! Session authentication
//!
//! Runs on the first bidirectional stream of every connection:
//!
//! ```text
//! client                                   host
//!   │ Hello{user, spake2 B}                  │
//!   ├───────────────────────────────────────►│
//!   │        HelloAck{spake2 A, host tag}    │
//!   │◄───────────────────────────────────────┤
//!   │ Confirm{client tag}                    │
//!   ├───────────────────────────────────────►│
//!   │        AuthOk{session id}  | Error     │
//!   │◄───────────────────────────────────────┤
//! ```
//!
//! Both tags are keyed with the SPAKE2 output and cover the host's
//! certificate fingerprint, so a man in the middle re-terminating TLS is
//! caught even without a pinned certificate.

use std::collections::BTreeMap;

use quinn::{RecvStream, SendStream};
use thiserror::Error;
use tracing::{debug, info, warn};

use tarship_core::crypto::{
    random_id, CertFingerprint, PakeHandshake, PakeRole, DIGEST_SIZE,
};
use tarship_core::{
    AuthOkMessage, ConfirmMessage, ErrorCode, ErrorMessage, HelloAckMessage, HelloMessage,
    NetMessage, ProtocolError, PROTOCOL_VERSION,
};

use crate::net::{recv_message, send_message, ConnectionError, QuicConnection};

/// Why a handshake didn't produce a session
#[derive(Debug, Error)]
pub enum AuthError {
    /// Wrong credentials, unknown user, or refused by the host
    #[error("{0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// What the client learns from a successful handshake
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub session_id: [u8; 16],
    pub host_name: String,
}

/// Authenticate to the host as `user`
pub async fn client_handshake(
    conn: &QuicConnection,
    user: &str,
    digest: &[u8; DIGEST_SIZE],
) -> Result<AuthenticatedSession, AuthError> {
    let fingerprint = conn
        .peer_fingerprint()
        .ok_or_else(|| AuthError::Protocol("host presented no certificate".into()))?;

    let (mut send, mut recv) = conn.open_stream().await?;

    let client_id = random_id().map_err(|e| AuthError::Protocol(format!("RNG failed: {}", e)))?;
    let pake = PakeHandshake::start_client(user, digest);

    let hello = NetMessage::Hello(HelloMessage {
        protocol_version: PROTOCOL_VERSION,
        client_id,
        user: user.to_string(),
        pake_message: pake.outbound_message().to_vec(),
    });
    send_message(&mut send, &hello).await?;

    let ack = match recv_message(&mut recv).await? {
        NetMessage::HelloAck(ack) => ack,
        NetMessage::Error(e) => return Err(refusal(e)),
        other => {
            return Err(AuthError::Protocol(format!(
                "expected HelloAck, got {}",
                other.kind()
            )))
        }
    };

    if ack.protocol_version != PROTOCOL_VERSION {
        return Err(AuthError::Protocol(
            ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: ack.protocol_version,
            }
            .to_string(),
        ));
    }

    let key = pake
        .finish(&ack.pake_message)
        .map_err(|e| AuthError::Protocol(e.to_string()))?;

    if !key.verify(PakeRole::Host, &fingerprint, &ack.confirmation) {
        warn!("Host key confirmation failed for user {}", user);
        return Err(AuthError::Rejected(
            "host could not prove knowledge of the credential (wrong password?)".into(),
        ));
    }

    let confirm = NetMessage::Confirm(ConfirmMessage {
        confirmation: key.confirmation(PakeRole::Client, &fingerprint),
    });
    send_message(&mut send, &confirm).await?;

    let session = match recv_message(&mut recv).await? {
        NetMessage::AuthOk(ok) => AuthenticatedSession {
            session_id: ok.session_id,
            host_name: ok.host_name,
        },
        NetMessage::Error(e) => return Err(refusal(e)),
        other => {
            return Err(AuthError::Protocol(format!(
                "expected AuthOk, got {}",
                other.kind()
            )))
        }
    };

    let _ = send.finish();
    info!(
        "Authenticated to {} as {} (session {})",
        session.host_name,
        user,
        hex::encode(&session.session_id[..4])
    );
    Ok(session)
}

fn refusal(e: ErrorMessage) -> AuthError {
    match e.code {
        ErrorCode::AuthFailed | ErrorCode::RateLimited | ErrorCode::PermissionDenied => {
            AuthError::Rejected(e.message)
        }
        _ => AuthError::Protocol(format!("{:?}: {}", e.code, e.message)),
    }
}

/// Host side of the handshake. Returns the authenticated user name.
pub async fn host_handshake(
    send: &mut SendStream,
    recv: &mut RecvStream,
    users: &BTreeMap<String, [u8; DIGEST_SIZE]>,
    fingerprint: &CertFingerprint,
    host_name: &str,
) -> Result<(String, AuthenticatedSession), AuthError> {
    let hello = match recv_message(recv).await? {
        NetMessage::Hello(h) => h,
        other => {
            return Err(AuthError::Protocol(format!(
                "expected Hello, got {}",
                other.kind()
            )))
        }
    };

    if hello.protocol_version != PROTOCOL_VERSION {
        let error = NetMessage::Error(ErrorMessage {
            code: ErrorCode::ProtocolError,
            message: format!(
                "protocol version mismatch: expected {}, got {}",
                PROTOCOL_VERSION, hello.protocol_version
            ),
        });
        send_message(send, &error).await?;
        return Err(AuthError::Protocol(
            ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: hello.protocol_version,
            }
            .to_string(),
        ));
    }

    debug!(
        "Hello from {:?} (client {})",
        hello.user,
        hex::encode(&hello.client_id[..4])
    );

    // Unknown users run the exchange against a random digest so they fail
    // at the same point, and in the same way, as a wrong password
    let digest = match users.get(&hello.user) {
        Some(digest) => *digest,
        None => {
            debug!("Unknown user {:?}", hello.user);
            let mut decoy = [0u8; DIGEST_SIZE];
            getrandom::fill(&mut decoy)
                .map_err(|e| AuthError::Protocol(format!("RNG failed: {}", e)))?;
            decoy
        }
    };

    let pake = PakeHandshake::start_host(&hello.user, &digest);
    let outbound = pake.outbound_message().to_vec();
    let key = pake
        .finish(&hello.pake_message)
        .map_err(|e| AuthError::Protocol(e.to_string()))?;

    let ack = NetMessage::HelloAck(HelloAckMessage {
        protocol_version: PROTOCOL_VERSION,
        pake_message: outbound,
        confirmation: key.confirmation(PakeRole::Host, fingerprint),
    });
    send_message(send, &ack).await?;

    // Past this point the client can tell whether its guess was right, so
    // every way of not confirming counts as a failed login
    let confirm = match recv_message(recv).await {
        Ok(NetMessage::Confirm(c)) => c,
        Ok(other) => {
            return Err(AuthError::Rejected(format!(
                "user {:?} answered HelloAck with {}",
                hello.user,
                other.kind()
            )))
        }
        Err(e) => {
            return Err(AuthError::Rejected(format!(
                "user {:?} abandoned the handshake: {}",
                hello.user, e
            )))
        }
    };

    if !key.verify(PakeRole::Client, fingerprint, &confirm.confirmation) {
        let error = NetMessage::Error(ErrorMessage {
            code: ErrorCode::AuthFailed,
            message: "authentication failed".into(),
        });
        send_message(send, &error).await?;
        let _ = send.finish();
        return Err(AuthError::Rejected(format!(
            "bad credentials for user {:?}",
            hello.user
        )));
    }

    let session_id = random_id().map_err(|e| AuthError::Protocol(format!("RNG failed: {}", e)))?;
    let ok = NetMessage::AuthOk(AuthOkMessage {
        session_id,
        host_name: host_name.to_string(),
    });
    send_message(send, &ok).await?;
    let _ = send.finish();

    Ok((
        hello.user,
        AuthenticatedSession {
            session_id,
            host_name: host_name.to_string(),
        },
    ))
}

/// Tell a client it is locked out, before any handshake work is done
pub async fn refuse(send: &mut SendStream, code: ErrorCode, message: &str) -> Result<(), AuthError> {
    let error = NetMessage::Error(ErrorMessage {
        code,
        message: message.to_string(),
    });
    send_message(send, &error).await?;
    let _ = send.finish();
    Ok(())
}
