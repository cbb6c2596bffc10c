//! Wire protocol definitions
//!
//! All session messages are defined here. Messages are serialized with bincode
//! and prefixed with a 4-byte little-endian length. File payloads are not
//! wrapped in messages: after an `OpenReadResponse` or `OpenWriteResponse` the
//! raw bytes follow on the same stream until it is finished.

use serde::{Deserialize, Serialize};

use crate::crypto::DIGEST_SIZE;
use crate::error::ErrorCode;
use crate::session::{RemoteKind, RemoteMetadata};

/// All possible network messages
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NetMessage {
    // Handshake
    Hello(HelloMessage),
    HelloAck(HelloAckMessage),
    Confirm(ConfirmMessage),
    AuthOk(AuthOkMessage),

    // File access
    OpenRead(OpenReadRequest),
    OpenReadResponse(OpenReadResponse),
    OpenWrite(OpenWriteRequest),
    OpenWriteResponse(OpenWriteResponse),
    WriteComplete(WriteCompleteMessage),

    // Metadata
    MakeDir(MakeDirRequest),
    Stat(StatRequest),
    StatResponse(StatResponse),
    Symlink(SymlinkRequest),
    SetPermissions(SetPermissionsRequest),
    Done,

    // Control
    Error(ErrorMessage),
    Goodbye(GoodbyeMessage),
}

impl NetMessage {
    /// Short name used in logs and protocol errors
    pub fn kind(&self) -> &'static str {
        match self {
            NetMessage::Hello(_) => "Hello",
            NetMessage::HelloAck(_) => "HelloAck",
            NetMessage::Confirm(_) => "Confirm",
            NetMessage::AuthOk(_) => "AuthOk",
            NetMessage::OpenRead(_) => "OpenRead",
            NetMessage::OpenReadResponse(_) => "OpenReadResponse",
            NetMessage::OpenWrite(_) => "OpenWrite",
            NetMessage::OpenWriteResponse(_) => "OpenWriteResponse",
            NetMessage::WriteComplete(_) => "WriteComplete",
            NetMessage::MakeDir(_) => "MakeDir",
            NetMessage::Stat(_) => "Stat",
            NetMessage::StatResponse(_) => "StatResponse",
            NetMessage::Symlink(_) => "Symlink",
            NetMessage::SetPermissions(_) => "SetPermissions",
            NetMessage::Done => "Done",
            NetMessage::Error(_) => "Error",
            NetMessage::Goodbye(_) => "Goodbye",
        }
    }
}

// === Handshake Messages ===

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloMessage {
    pub protocol_version: u32,
    pub client_id: [u8; 16],
    pub user: String,
    pub pake_message: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloAckMessage {
    pub protocol_version: u32,
    pub pake_message: Vec<u8>,
    /// Host key confirmation over its certificate fingerprint
    pub confirmation: [u8; DIGEST_SIZE],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfirmMessage {
    pub confirmation: [u8; DIGEST_SIZE],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthOkMessage {
    pub session_id: [u8; 16],
    pub host_name: String,
}

// === File Messages ===

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenReadRequest {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenReadResponse {
    /// Size of the file at open time; exactly this many bytes follow
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenWriteRequest {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenWriteResponse {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteCompleteMessage {
    /// Bytes durably written by the host
    pub bytes_written: u64,
}

// === Metadata Messages ===

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MakeDirRequest {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatRequest {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatResponse {
    pub kind: RemoteKind,
    pub size: u64,
    pub mode: u32,
}

impl From<StatResponse> for RemoteMetadata {
    fn from(r: StatResponse) -> Self {
        RemoteMetadata {
            kind: r.kind,
            size: r.size,
            mode: r.mode,
        }
    }
}

impl From<RemoteMetadata> for StatResponse {
    fn from(m: RemoteMetadata) -> Self {
        StatResponse {
            kind: m.kind,
            size: m.size,
            mode: m.mode,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SymlinkRequest {
    pub target: String,
    pub link: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetPermissionsRequest {
    pub path: String,
    pub mode: u32,
}

// === Control Messages ===

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorMessage {
    /// Build an error message from a local I/O error
    pub fn from_io(e: &std::io::Error) -> Self {
        Self {
            code: ErrorCode::from(e),
            message: e.to_string(),
        }
    }

    /// Turn a received error back into a local I/O error
    pub fn into_io(self) -> std::io::Error {
        std::io::Error::new(self.code.to_io_kind(), self.message)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GoodbyeMessage {
    pub reason: String,
}

// === Serialization ===

/// Serialize a message with length prefix
pub fn serialize_message(msg: &NetMessage) -> Result<Vec<u8>, bincode::Error> {
    let payload = bincode::serialize(msg)?;
    let len = payload.len() as u32;

    let mut result = Vec::with_capacity(4 + payload.len());
    result.extend_from_slice(&len.to_le_bytes());
    result.extend_from_slice(&payload);

    Ok(result)
}

/// Deserialize a message (without length prefix)
pub fn deserialize_message(data: &[u8]) -> Result<NetMessage, bincode::Error> {
    bincode::deserialize(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_framing() {
        let msg = NetMessage::Hello(HelloMessage {
            protocol_version: 1,
            client_id: [1; 16],
            user: "alice".into(),
            pake_message: vec![9; 33],
        });

        let bytes = serialize_message(&msg).unwrap();
        let len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - 4);

        match deserialize_message(&bytes[4..]).unwrap() {
            NetMessage::Hello(h) => {
                assert_eq!(h.user, "alice");
                assert_eq!(h.pake_message.len(), 33);
            }
            other => panic!("wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_error_message_maps_to_io_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let msg = ErrorMessage::from_io(&io);
        assert_eq!(msg.code, ErrorCode::FileNotFound);

        let back = msg.into_io();
        assert_eq!(back.kind(), std::io::ErrorKind::NotFound);
        assert!(back.to_string().contains("no such file"));
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(deserialize_message(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
