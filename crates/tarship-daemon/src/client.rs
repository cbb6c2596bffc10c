//! QUIC secure session
//!
//! The pipeline in `tarship-core` is blocking, the transport is not. Each
//! [`QuicSession`] owns a handle to a tokio runtime and drives every request
//! to completion with `block_on`, so it must never be used from inside an
//! async task.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use quinn::{Endpoint, RecvStream, SendStream};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use tarship_core::crypto::credential_digest;
use tarship_core::{
    ErrorMessage, GoodbyeMessage, MakeDirRequest, NetMessage, OpenReadRequest, OpenWriteRequest,
    ProtocolError, RemoteMetadata, RemoteSink, RemoteTarget, SecureSession, SessionProvider,
    SetPermissionsRequest, StatRequest, SymlinkRequest, TransferError,
};

use crate::auth::{client_handshake, AuthError, AuthenticatedSession};
use crate::net::{connect, create_client_endpoint, recv_message, send_message, ConnectionError, QuicConnection};

/// How long `close` waits for the host to see the connection go away
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens authenticated QUIC sessions
pub struct QuicConnector {
    runtime: Arc<Runtime>,
}

impl QuicConnector {
    /// Start a small dedicated runtime for network I/O
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tarship-net")
            .enable_all()
            .build()?;
        Ok(Self::with_runtime(Arc::new(runtime)))
    }

    pub fn with_runtime(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }
}

impl SessionProvider for QuicConnector {
    type Session = QuicSession;

    fn connect(&self, target: &RemoteTarget) -> tarship_core::Result<QuicSession> {
        let addr = resolve(&target.address())?;
        let bind_addr: SocketAddr = if addr.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        let digest = credential_digest(&target.user, &target.credential);

        debug!("connecting to {} as {}", addr, target.user);
        let (endpoint, connection, session) = self
            .runtime
            .block_on(open_connection(target, addr, bind_addr, &digest))?;

        info!("session open to {} ({})", session.host_name, addr);
        Ok(QuicSession {
            runtime: self.runtime.clone(),
            endpoint,
            connection,
            session,
            closed: false,
        })
    }
}

/// Connect within the target's timeout, then authenticate
async fn open_connection(
    target: &RemoteTarget,
    addr: SocketAddr,
    bind_addr: SocketAddr,
    digest: &[u8; 32],
) -> tarship_core::Result<(Endpoint, QuicConnection, AuthenticatedSession)> {
    let endpoint = create_client_endpoint(bind_addr, target.fingerprint, target.idle_timeout)
        .map_err(|e| TransferError::Connect(e.to_string()))?;

    let connection = tokio::time::timeout(
        target.connect_timeout,
        connect(&endpoint, addr, &target.server_name),
    )
    .await
    .map_err(|_| {
        TransferError::Connect(format!(
            "{} did not answer within {}s",
            addr,
            target.connect_timeout.as_secs()
        ))
    })?
    .map_err(|e| TransferError::Connect(e.to_string()))?;

    match client_handshake(&connection, &target.user, digest).await {
        Ok(session) => Ok((endpoint, connection, session)),
        Err(e) => {
            connection.close(1, "authentication failed");
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, endpoint.wait_idle()).await;
            Err(match e {
                AuthError::Rejected(reason) => TransferError::Auth(reason),
                other => TransferError::Connect(other.to_string()),
            })
        }
    }
}

fn resolve(address: &str) -> tarship_core::Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|e| TransferError::Connect(format!("cannot resolve {}: {}", address, e)))?
        .next()
        .ok_or_else(|| TransferError::Connect(format!("{} resolved to no addresses", address)))
}

/// An authenticated connection to a tarship host
pub struct QuicSession {
    runtime: Arc<Runtime>,
    endpoint: Endpoint,
    connection: QuicConnection,
    session: AuthenticatedSession,
    closed: bool,
}

impl QuicSession {
    pub fn host_name(&self) -> &str {
        &self.session.host_name
    }

    pub fn session_id(&self) -> [u8; 16] {
        self.session.session_id
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "session is closed"));
        }
        Ok(())
    }

    /// One request, one response, on a fresh stream
    fn request(&self, message: NetMessage) -> io::Result<NetMessage> {
        self.ensure_open()?;
        let conn = &self.connection;
        self.runtime.block_on(async {
            let (mut send, mut recv) = conn.open_stream().await.map_err(transport_error)?;
            send_message(&mut send, &message).await.map_err(transport_error)?;
            let _ = send.finish();
            recv_message(&mut recv).await.map_err(transport_error)
        })
    }

    fn request_done(&self, message: NetMessage) -> io::Result<()> {
        match self.request(message)? {
            NetMessage::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Open a stream, send `message` and wait for the host to accept it
    fn open(&self, message: NetMessage) -> io::Result<(SendStream, RecvStream, NetMessage)> {
        self.ensure_open()?;
        let conn = &self.connection;
        self.runtime.block_on(async {
            let (mut send, mut recv) = conn.open_stream().await.map_err(transport_error)?;
            send_message(&mut send, &message).await.map_err(transport_error)?;
            let response = recv_message(&mut recv).await.map_err(transport_error)?;
            Ok((send, recv, response))
        })
    }
}

impl SecureSession for QuicSession {
    fn open_read(&mut self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let (mut send, recv, response) = self.open(NetMessage::OpenRead(OpenReadRequest {
            path: path.to_string(),
        }))?;
        let _ = send.finish();

        match response {
            NetMessage::OpenReadResponse(r) => {
                debug!("reading {} ({} bytes)", path, r.size);
                Ok(Box::new(RemoteReader {
                    runtime: self.runtime.clone(),
                    recv,
                    size: r.size,
                    remaining: r.size,
                }))
            }
            other => Err(unexpected(other)),
        }
    }

    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn RemoteSink>> {
        let (send, recv, response) = self.open(NetMessage::OpenWrite(OpenWriteRequest {
            path: path.to_string(),
        }))?;

        match response {
            NetMessage::OpenWriteResponse(_) => Ok(Box::new(RemoteWriter {
                runtime: self.runtime.clone(),
                send,
                recv,
                path: path.to_string(),
                written: 0,
                finished: false,
            })),
            other => Err(unexpected(other)),
        }
    }

    fn make_dir(&mut self, path: &str) -> io::Result<()> {
        self.request_done(NetMessage::MakeDir(MakeDirRequest {
            path: path.to_string(),
        }))
    }

    fn stat(&mut self, path: &str) -> io::Result<RemoteMetadata> {
        match self.request(NetMessage::Stat(StatRequest {
            path: path.to_string(),
        }))? {
            NetMessage::StatResponse(r) => Ok(r.into()),
            other => Err(unexpected(other)),
        }
    }

    fn symlink(&mut self, target: &str, link: &str) -> io::Result<()> {
        self.request_done(NetMessage::Symlink(SymlinkRequest {
            target: target.to_string(),
            link: link.to_string(),
        }))
    }

    fn set_permissions(&mut self, path: &str, mode: u32) -> io::Result<()> {
        self.request_done(NetMessage::SetPermissions(SetPermissionsRequest {
            path: path.to_string(),
            mode,
        }))
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }

        let goodbye = self.request(NetMessage::Goodbye(GoodbyeMessage {
            reason: "transfer finished".into(),
        }));
        if let Err(e) = goodbye {
            debug!("goodbye not acknowledged: {}", e);
        }

        self.closed = true;
        self.connection.close(0, "goodbye");
        let endpoint = &self.endpoint;
        let idle = self
            .runtime
            .block_on(async { tokio::time::timeout(CLOSE_TIMEOUT, endpoint.wait_idle()).await });
        if idle.is_err() {
            warn!("connection to {} did not close cleanly", self.session.host_name);
        }
        info!("session to {} closed", self.session.host_name);
        Ok(())
    }
}

impl Drop for QuicSession {
    fn drop(&mut self) {
        if !self.closed {
            self.connection.close(0, "dropped");
        }
    }
}

/// Blocking reader over the raw bytes that follow an `OpenReadResponse`
struct RemoteReader {
    runtime: Arc<Runtime>,
    recv: RecvStream,
    size: u64,
    remaining: u64,
}

impl Read for RemoteReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let recv = &mut self.recv;
        match self.runtime.block_on(recv.read(&mut buf[..max])) {
            Ok(Some(n)) => {
                self.remaining -= n as u64;
                Ok(n)
            }
            Ok(None) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "stream ended after {} of {} bytes",
                    self.size - self.remaining,
                    self.size
                ),
            )),
            Err(e) => Err(io::Error::new(io::ErrorKind::ConnectionReset, e)),
        }
    }
}

/// Blocking writer for an accepted `OpenWrite`
struct RemoteWriter {
    runtime: Arc<Runtime>,
    send: SendStream,
    recv: RecvStream,
    path: String,
    written: u64,
    finished: bool,
}

impl RemoteWriter {
    /// The host stopped our stream; its reason is waiting on `recv`
    fn host_error(&mut self, fallback: io::Error) -> io::Error {
        let recv = &mut self.recv;
        let reply = self.runtime.block_on(async {
            tokio::time::timeout(CLOSE_TIMEOUT, recv_message(recv)).await
        });
        match reply {
            Ok(Ok(NetMessage::Error(e))) => e.into_io(),
            _ => fallback,
        }
    }
}

impl Write for RemoteWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let send = &mut self.send;
        match self.runtime.block_on(send.write(buf)) {
            Ok(n) => {
                self.written += n as u64;
                Ok(n)
            }
            Err(quinn::WriteError::Stopped(_)) => {
                let fallback = io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("host stopped accepting {}", self.path),
                );
                Err(self.host_error(fallback))
            }
            Err(e) => Err(io::Error::new(io::ErrorKind::ConnectionReset, e)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RemoteSink for RemoteWriter {
    fn finish(mut self: Box<Self>) -> io::Result<u64> {
        self.finished = true;
        self.send
            .finish()
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;

        let recv = &mut self.recv;
        let reply = self
            .runtime
            .block_on(recv_message(recv))
            .map_err(transport_error)?;

        match reply {
            NetMessage::WriteComplete(done) => {
                debug!(
                    "{}: sent {} bytes, host wrote {}",
                    self.path, self.written, done.bytes_written
                );
                Ok(done.bytes_written)
            }
            other => Err(unexpected(other)),
        }
    }
}

impl Drop for RemoteWriter {
    fn drop(&mut self) {
        if !self.finished {
            debug!("abandoning upload of {} after {} bytes", self.path, self.written);
            let _ = self.send.reset(0u32.into());
        }
    }
}

fn transport_error(e: ConnectionError) -> io::Error {
    match e {
        ConnectionError::Protocol(p) => p.into(),
        ConnectionError::Timeout => io::Error::new(io::ErrorKind::TimedOut, "request timed out"),
        other => io::Error::new(io::ErrorKind::ConnectionReset, other.to_string()),
    }
}

/// An `Error` reply becomes the matching I/O error; anything else is a
/// protocol violation
fn unexpected(message: NetMessage) -> io::Error {
    match message {
        NetMessage::Error(e) => ErrorMessage::into_io(e),
        other => ProtocolError::UnexpectedMessage(format!("{} in response", other.kind())).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarship_core::ErrorCode;

    #[test]
    fn test_error_reply_keeps_kind() {
        let err = unexpected(NetMessage::Error(ErrorMessage {
            code: ErrorCode::FileNotFound,
            message: "site.tar".into(),
        }));
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("site.tar"));
    }

    #[test]
    fn test_wrong_reply_is_invalid_data() {
        let err = unexpected(NetMessage::Done);
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("unexpected message: Done"), "{}", err);
    }

    #[test]
    fn test_protocol_errors_keep_their_kind() {
        let err = transport_error(ConnectionError::Protocol(
            ProtocolError::InvalidPath("../x".into()),
        ));
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        let err = transport_error(ConnectionError::Receive("reset".into()));
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_unresolvable_host_is_connect_error() {
        match resolve("no port here") {
            Err(TransferError::Connect(_)) => {}
            other => panic!("expected Connect, got {:?}", other.map(|_| ())),
        }
    }
}
