//! Error types for tarship

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the pack, ship and unpack operations
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),
}

impl TransferError {
    /// Wrap an arbitrary message as an I/O error of the given kind
    pub fn io(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        TransferError::Io(io::Error::new(kind, message.into()))
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("protocol version mismatch (expected {expected}, got {actual})")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> Self {
        let kind = match e {
            ProtocolError::InvalidPath(_) => io::ErrorKind::PermissionDenied,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e)
    }
}

/// Wire error codes (sent over network)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    // General (0-99)
    ProtocolError = 2,
    NotImplemented = 3,

    // File errors (100-199)
    FileNotFound = 100,
    NotAFile = 102,
    PermissionDenied = 103,
    AlreadyExists = 106,

    // I/O errors (200-299)
    IoError = 200,
    ShortWrite = 201,

    // Session errors (400-499)
    RateLimited = 401,
    AuthFailed = 403,
}

impl From<&io::Error> for ErrorCode {
    fn from(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            io::ErrorKind::AlreadyExists => ErrorCode::AlreadyExists,
            io::ErrorKind::InvalidInput => ErrorCode::NotAFile,
            io::ErrorKind::WriteZero => ErrorCode::ShortWrite,
            _ => ErrorCode::IoError,
        }
    }
}

impl ErrorCode {
    /// Map a wire error code back to the closest local I/O error kind
    pub fn to_io_kind(self) -> io::ErrorKind {
        match self {
            ErrorCode::FileNotFound => io::ErrorKind::NotFound,
            ErrorCode::PermissionDenied | ErrorCode::AuthFailed => io::ErrorKind::PermissionDenied,
            ErrorCode::AlreadyExists => io::ErrorKind::AlreadyExists,
            ErrorCode::NotAFile => io::ErrorKind::InvalidInput,
            ErrorCode::ShortWrite => io::ErrorKind::WriteZero,
            ErrorCode::ProtocolError => io::ErrorKind::InvalidData,
            ErrorCode::NotImplemented => io::ErrorKind::Unsupported,
            _ => io::ErrorKind::Other,
        }
    }
}
