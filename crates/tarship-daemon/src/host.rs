//! Tarship host - serves a local directory to authenticated sessions
//!
//! Every request arrives on its own bidirectional stream: one framed
//! request, one framed response, and for file transfers the raw bytes in
//! between. All paths are confined to the served root.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use quinn::{Endpoint, RecvStream, SendStream};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use tarship_core::crypto::{CertFingerprint, DIGEST_SIZE};
use tarship_core::path::{confine, refuse_symlink};
use tarship_core::session::{apply_mode, create_symlink};
use tarship_core::{
    ErrorCode, ErrorMessage, NetMessage, OpenReadResponse, OpenWriteResponse, RemoteMetadata,
    StatResponse, WriteCompleteMessage, CHUNK_SIZE,
};

use crate::auth::{host_handshake, refuse, AuthError};
use crate::net::{create_server_endpoint, recv_message, send_message, ConnectionError, QuicConnection};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};

/// How long a refused client gets to read its error before we hang up
const REFUSAL_GRACE: Duration = Duration::from_secs(5);

/// Host configuration
pub struct HostConfig {
    pub bind_addr: SocketAddr,
    pub root: PathBuf,
    pub max_connections: usize,
    pub host_name: String,
    pub users: BTreeMap<String, [u8; DIGEST_SIZE]>,
    pub idle_timeout: Duration,
    pub rate_limit: RateLimiterConfig,
}

impl HostConfig {
    pub fn new(bind_addr: SocketAddr, root: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr,
            root: root.into(),
            max_connections: 10,
            host_name: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "tarship-host".into()),
            users: BTreeMap::new(),
            idle_timeout: crate::net::IDLE_TIMEOUT,
            rate_limit: RateLimiterConfig::default(),
        }
    }

    /// Build from the `[host]` section of the config file
    pub fn from_config(config: &tarship_core::HostConfig) -> Result<Self, HostError> {
        let root = config
            .root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let mut host = Self::new(SocketAddr::new(config.bind, config.port), root);
        host.max_connections = config.max_connections;
        host.users = config
            .user_digests()
            .map_err(|e| HostError::Config(e.to_string()))?;
        host.rate_limit.max_failures = config.max_auth_failures;
        Ok(host)
    }

    pub fn with_user(mut self, user: impl Into<String>, digest: [u8; DIGEST_SIZE]) -> Self {
        self.users.insert(user.into(), digest);
        self
    }
}

/// State shared by every connection task
struct HostContext {
    root: PathBuf,
    users: BTreeMap<String, [u8; DIGEST_SIZE]>,
    fingerprint: CertFingerprint,
    host_name: String,
    limiter: RateLimiter,
}

/// Tarship host server
pub struct TarshipHost {
    endpoint: Endpoint,
    context: Arc<HostContext>,
    connection_semaphore: Arc<Semaphore>,
}

impl TarshipHost {
    /// Validate the root, generate a certificate and bind the endpoint.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: HostConfig) -> Result<Self, HostError> {
        let root = config
            .root
            .canonicalize()
            .map_err(|e| HostError::Io(format!("{}: {}", config.root.display(), e)))?;
        if !root.is_dir() {
            return Err(HostError::Io(format!("{} is not a directory", root.display())));
        }
        if config.users.is_empty() {
            warn!("No users configured; every login will fail");
        }

        let names = vec!["localhost".to_string(), config.host_name.clone()];
        let (endpoint, fingerprint) =
            create_server_endpoint(config.bind_addr, names, config.idle_timeout)
                .map_err(|e| HostError::Bind(e.to_string()))?;

        Ok(Self {
            endpoint,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            context: Arc::new(HostContext {
                root,
                users: config.users,
                fingerprint,
                host_name: config.host_name,
                limiter: RateLimiter::new(config.rate_limit),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HostError> {
        self.endpoint
            .local_addr()
            .map_err(|e| HostError::Io(e.to_string()))
    }

    pub fn fingerprint(&self) -> CertFingerprint {
        self.context.fingerprint
    }

    pub fn root(&self) -> &Path {
        &self.context.root
    }

    /// Accept connections until the endpoint is closed
    pub async fn serve(&self) -> Result<(), HostError> {
        info!(
            "Tarship host listening on {} serving {:?}",
            self.local_addr()?,
            self.context.root
        );

        while let Some(incoming) = self.endpoint.accept().await {
            let permit = match self.connection_semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("connection limiter closed");
                    break;
                }
            };

            let context = self.context.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => {
                        let remote = connection.remote_address();
                        info!("New connection from {}", remote);

                        if let Err(e) = handle_connection(connection, context).await {
                            error!("Connection error from {}: {}", remote, e);
                        }
                    }
                    Err(e) => {
                        warn!("Connection failed: {}", e);
                    }
                }
                drop(permit);
            });

            self.context.limiter.prune();
        }

        Ok(())
    }

    /// Stop accepting and close every open connection
    pub fn shutdown(&self) {
        self.endpoint.close(0u32.into(), b"host shutting down");
    }
}

/// Authenticate one client, then serve its requests
async fn handle_connection(
    connection: quinn::Connection,
    context: Arc<HostContext>,
) -> Result<(), HostError> {
    let conn = QuicConnection::new(connection.clone());
    let ip = conn.remote_address().ip();
    let (mut send, mut recv) = conn.accept_stream().await?;

    if let Err(left) = context.limiter.check(ip) {
        warn!("Refusing {}: locked out for {}s", ip, left.as_secs());
        let message = format!("too many failed logins, retry in {}s", left.as_secs().max(1));
        refuse(&mut send, ErrorCode::RateLimited, &message).await?;
        let _ = tokio::time::timeout(REFUSAL_GRACE, connection.closed()).await;
        return Ok(());
    }

    let handshake = host_handshake(
        &mut send,
        &mut recv,
        &context.users,
        &context.fingerprint,
        &context.host_name,
    )
    .await;

    let user = match handshake {
        Ok((user, session)) => {
            context.limiter.record_success(ip);
            info!(
                "{} authenticated from {}, session {}",
                user,
                ip,
                hex::encode(&session.session_id[..4])
            );
            user
        }
        Err(AuthError::Rejected(reason)) => {
            warn!("Authentication from {} failed: {}", ip, reason);
            context.limiter.record_failure(ip);
            let _ = tokio::time::timeout(REFUSAL_GRACE, connection.closed()).await;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let root = context.root.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_request(send, recv, &root).await {
                        debug!("Request error: {}", e);
                    }
                });
            }
            Err(quinn::ConnectionError::ApplicationClosed(_)) => {
                info!("{} disconnected", user);
                break;
            }
            Err(quinn::ConnectionError::LocallyClosed) => break,
            Err(e) => {
                warn!("Connection from {} lost: {}", ip, e);
                break;
            }
        }
    }

    Ok(())
}

/// Handle a single request stream
async fn handle_request(
    mut send: SendStream,
    mut recv: RecvStream,
    root: &Path,
) -> Result<(), ConnectionError> {
    let request = recv_message(&mut recv).await?;
    debug!("request: {}", request.kind());

    match request {
        NetMessage::OpenRead(req) => serve_read(&mut send, root, &req.path).await?,
        NetMessage::OpenWrite(req) => serve_write(&mut send, &mut recv, root, &req.path).await?,
        other => {
            let response = handle_metadata(other, root).await;
            send_message(&mut send, &response).await?;
        }
    }

    let _ = send.finish();
    Ok(())
}

/// Requests answered with a single message
async fn handle_metadata(request: NetMessage, root: &Path) -> NetMessage {
    let result = match request {
        NetMessage::MakeDir(req) => make_dir(root, &req.path).await.map(|_| NetMessage::Done),
        NetMessage::Stat(req) => stat(root, &req.path)
            .await
            .map(|meta| NetMessage::StatResponse(StatResponse::from(meta))),
        NetMessage::Symlink(req) => symlink(root, &req.target, &req.link)
            .await
            .map(|_| NetMessage::Done),
        NetMessage::SetPermissions(req) => set_permissions(root, &req.path, req.mode)
            .await
            .map(|_| NetMessage::Done),
        NetMessage::Goodbye(bye) => {
            debug!("client says goodbye: {}", bye.reason);
            Ok(NetMessage::Done)
        }
        other => {
            return NetMessage::Error(ErrorMessage {
                code: ErrorCode::NotImplemented,
                message: format!("{} is not a request", other.kind()),
            })
        }
    };

    result.unwrap_or_else(|e| NetMessage::Error(ErrorMessage::from_io(&e)))
}

async fn make_dir(root: &Path, remote: &str) -> io::Result<()> {
    let path = confine(root, remote)?;
    match fs::create_dir(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let meta = fs::symlink_metadata(&path).await?;
            if meta.is_dir() {
                Ok(())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a directory", remote),
                ))
            }
        }
        Err(e) => Err(e),
    }
}

async fn stat(root: &Path, remote: &str) -> io::Result<RemoteMetadata> {
    let path = confine(root, remote)?;
    let meta = fs::symlink_metadata(&path).await?;
    Ok(RemoteMetadata::from_fs(&meta))
}

async fn symlink(root: &Path, target: &str, link: &str) -> io::Result<()> {
    let link = confine(root, link)?;
    let target = PathBuf::from(target);
    tokio::task::spawn_blocking(move || create_symlink(&target, &link))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

async fn set_permissions(root: &Path, remote: &str, mode: u32) -> io::Result<()> {
    let path = confine(root, remote)?;
    refuse_symlink(&path)?;
    tokio::task::spawn_blocking(move || apply_mode(&path, mode))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Send a file: `OpenReadResponse{size}` followed by exactly `size` bytes
async fn serve_read(send: &mut SendStream, root: &Path, remote: &str) -> Result<(), ConnectionError> {
    let opened = async {
        let path = confine(root, remote)?;
        refuse_symlink(&path)?;
        let file = File::open(&path).await?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", remote),
            ));
        }
        Ok((file, meta.len()))
    }
    .await;

    let (file, size) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            debug!("open_read {} failed: {}", remote, e);
            return send_message(send, &NetMessage::Error(ErrorMessage::from_io(&e))).await;
        }
    };

    send_message(send, &NetMessage::OpenReadResponse(OpenReadResponse { size })).await?;

    let mut reader = file.take(size);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| ConnectionError::Send(e.to_string()))?;
        if n == 0 {
            break;
        }
        send.write_all(&buf[..n])
            .await
            .map_err(|e| ConnectionError::Send(e.to_string()))?;
        sent += n as u64;
    }

    if sent != size {
        // File shrank under us; the client sees a short stream
        warn!("{} shrank while being read ({} of {} bytes)", remote, sent, size);
        let _ = send.reset(1u32.into());
    }
    debug!("served {} ({} bytes)", remote, sent);
    Ok(())
}

/// Receive a file until the client finishes its side of the stream, then
/// acknowledge with `WriteComplete`
async fn serve_write(
    send: &mut SendStream,
    recv: &mut RecvStream,
    root: &Path,
    remote: &str,
) -> Result<(), ConnectionError> {
    let created = async {
        let path = confine(root, remote)?;
        refuse_symlink(&path)?;
        File::create(&path).await
    }
    .await;

    let mut file = match created {
        Ok(file) => file,
        Err(e) => {
            debug!("open_write {} failed: {}", remote, e);
            let _ = recv.stop(0u32.into());
            return send_message(send, &NetMessage::Error(ErrorMessage::from_io(&e))).await;
        }
    };

    send_message(send, &NetMessage::OpenWriteResponse(OpenWriteResponse {})).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let n = match recv.read(&mut buf).await {
            Ok(Some(n)) => n,
            Ok(None) => break,
            Err(e) => {
                warn!("upload of {} aborted after {} bytes: {}", remote, written, e);
                return Err(ConnectionError::Receive(e.to_string()));
            }
        };

        if let Err(e) = file.write_all(&buf[..n]).await {
            error!("writing {} failed: {}", remote, e);
            let _ = recv.stop(0u32.into());
            return send_message(send, &NetMessage::Error(ErrorMessage::from_io(&e))).await;
        }
        written += n as u64;
    }

    let synced = async {
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = synced {
        return send_message(send, &NetMessage::Error(ErrorMessage::from_io(&e))).await;
    }

    debug!("received {} ({} bytes)", remote, written);
    send_message(
        send,
        &NetMessage::WriteComplete(WriteCompleteMessage {
            bytes_written: written,
        }),
    )
    .await
}

/// Host errors
#[derive(Debug, Error)]
pub enum HostError {
    #[error("bind failed: {0}")]
    Bind(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("bad host configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarship_core::{MakeDirRequest, RemoteKind, SetPermissionsRequest, StatRequest, SymlinkRequest};
    use tempfile::TempDir;

    fn canonical_root() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        (temp, root)
    }

    #[tokio::test]
    async fn test_make_dir_and_stat() {
        let (_temp, root) = canonical_root();

        let response = handle_metadata(
            NetMessage::MakeDir(MakeDirRequest { path: "/out".into() }),
            &root,
        )
        .await;
        assert!(matches!(response, NetMessage::Done));

        // Again: already there is fine
        let response = handle_metadata(
            NetMessage::MakeDir(MakeDirRequest { path: "out".into() }),
            &root,
        )
        .await;
        assert!(matches!(response, NetMessage::Done));

        match handle_metadata(NetMessage::Stat(StatRequest { path: "/out".into() }), &root).await {
            NetMessage::StatResponse(r) => assert_eq!(r.kind, RemoteKind::Directory),
            other => panic!("unexpected response: {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_make_dir_over_file() {
        let (_temp, root) = canonical_root();
        std::fs::write(root.join("taken"), b"x").unwrap();

        match handle_metadata(
            NetMessage::MakeDir(MakeDirRequest { path: "taken".into() }),
            &root,
        )
        .await
        {
            NetMessage::Error(e) => assert_eq!(e.code, ErrorCode::AlreadyExists),
            other => panic!("unexpected response: {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_stat_missing() {
        let (_temp, root) = canonical_root();

        match handle_metadata(NetMessage::Stat(StatRequest { path: "nope.tar".into() }), &root).await {
            NetMessage::Error(e) => assert_eq!(e.code, ErrorCode::FileNotFound),
            other => panic!("unexpected response: {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (_temp, root) = canonical_root();

        match handle_metadata(
            NetMessage::MakeDir(MakeDirRequest { path: "../evil".into() }),
            &root,
        )
        .await
        {
            NetMessage::Error(e) => assert_eq!(e.code, ErrorCode::PermissionDenied),
            other => panic!("unexpected response: {}", other.kind()),
        }
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlink_then_permissions_refused() {
        let (_temp, root) = canonical_root();
        std::fs::write(root.join("run.sh"), b"#!/bin/sh\n").unwrap();

        let response = handle_metadata(
            NetMessage::Symlink(SymlinkRequest {
                target: "run.sh".into(),
                link: "go".into(),
            }),
            &root,
        )
        .await;
        assert!(matches!(response, NetMessage::Done));
        assert_eq!(
            std::fs::read_link(root.join("go")).unwrap(),
            PathBuf::from("run.sh")
        );

        match handle_metadata(
            NetMessage::SetPermissions(SetPermissionsRequest {
                path: "go".into(),
                mode: 0o777,
            }),
            &root,
        )
        .await
        {
            NetMessage::Error(e) => assert_eq!(e.code, ErrorCode::PermissionDenied),
            other => panic!("unexpected response: {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_non_request_rejected() {
        let (_temp, root) = canonical_root();
        match handle_metadata(NetMessage::Done, &root).await {
            NetMessage::Error(e) => assert_eq!(e.code, ErrorCode::NotImplemented),
            other => panic!("unexpected response: {}", other.kind()),
        }
    }

    #[test]
    fn test_config_from_file_section() {
        let mut section = tarship_core::HostConfig::default();
        section.port = 5000;
        section.max_auth_failures = 2;
        section.users.insert(
            "alice".into(),
            hex::encode(tarship_core::crypto::credential_digest("alice", "pw")),
        );

        let config = HostConfig::from_config(&section).unwrap();
        assert_eq!(config.bind_addr.port(), 5000);
        assert_eq!(config.rate_limit.max_failures, 2);
        assert!(config.users.contains_key("alice"));
    }
}
