//! Tarship Core - archive, ship and unpack pipeline
//!
//! This crate packs a directory tree into a tar archive, ships it to a remote
//! host over a [`SecureSession`] and extracts it there, reporting progress
//! along the way. It has no dependencies on networking code; the QUIC
//! session lives in `tarship-daemon`.

pub mod archive;
pub mod config;
pub mod crypto;
pub mod error;
pub mod path;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod ship;
pub mod task;
pub mod unpack;

pub use archive::{list, pack, ArchiveEntry, EntryKind};
pub use config::{Config, ConfigError, HostConfig, ProgressMode, RemoteConfig, TransferConfig};
pub use error::*;
pub use progress::{LogProgress, NullProgress, Progress, ProgressEvent, ProgressSink, TerminalProgress};
pub use protocol::*;
pub use session::{
    create_remote_dir, make_dir_all, LocalSession, RemoteKind, RemoteMetadata, RemoteSink,
    RemoteTarget, SecureSession, SessionGuard, SessionProvider,
};
pub use ship::{ship, ShipOptions};
pub use task::TransferTask;
pub use unpack::unpack;

/// Copy buffer size for entry payloads and remote reads (128 KB)
pub const CHUNK_SIZE: usize = 128 * 1024;

/// Default shipping chunk size (10 MB)
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
