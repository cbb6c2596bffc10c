//! Secure session abstraction
//!
//! The pipeline never talks to a transport directly. It consumes a
//! [`SecureSession`]: something that can open remote files, create
//! directories and be closed. The daemon crate provides the QUIC
//! implementation; [`LocalSession`] maps the same operations onto a local
//! directory for tests and loopback use.
//!
//! File handles returned by a session own their resources and don't borrow
//! the session, so an archive can be read from one handle while entries are
//! written through others.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::path::{confine, refuse_symlink};

/// Kind of a remote filesystem object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RemoteKind {
    File = 0,
    Directory = 1,
    Symlink = 2,
    Other = 3,
}

/// Metadata of a remote file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub kind: RemoteKind,
    pub size: u64,
    pub mode: u32,
}

impl RemoteMetadata {
    pub fn from_fs(meta: &fs::Metadata) -> Self {
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            RemoteKind::Symlink
        } else if file_type.is_dir() {
            RemoteKind::Directory
        } else if file_type.is_file() {
            RemoteKind::File
        } else {
            RemoteKind::Other
        };
        Self {
            kind,
            size: meta.len(),
            mode: mode_of(meta),
        }
    }
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Write side of a remote file
///
/// Bytes written are not guaranteed to be on the remote side until
/// [`RemoteSink::finish`] returns. Dropping a sink without finishing it
/// abandons the write.
pub trait RemoteSink: Write + Send {
    /// Flush, close and return the byte count the remote side acknowledged
    fn finish(self: Box<Self>) -> io::Result<u64>;
}

/// Authenticated connection able to manipulate remote files
pub trait SecureSession {
    /// Open a remote file for one forward-only read
    fn open_read(&mut self, path: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Open a remote file for writing, creating or truncating it
    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn RemoteSink>>;

    /// Create one directory. Succeeds if it already exists.
    fn make_dir(&mut self, path: &str) -> io::Result<()>;

    /// Metadata for a remote path (symlinks are not followed)
    fn stat(&mut self, path: &str) -> io::Result<RemoteMetadata>;

    /// Create a symlink at `link` pointing to `target`
    fn symlink(&mut self, target: &str, link: &str) -> io::Result<()>;

    /// Set permission bits on a remote path
    fn set_permissions(&mut self, path: &str, mode: u32) -> io::Result<()>;

    /// Tear the session down. Called exactly once.
    fn close(&mut self) -> io::Result<()>;
}

/// Where and as whom to open a session
#[derive(Clone, Debug)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: String,
    /// TLS server name presented to the host
    pub server_name: String,
    /// Expected certificate fingerprint; PAKE binding alone when `None`
    pub fingerprint: Option<[u8; 32]>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            credential: credential.into(),
            server_name: "localhost".into(),
            fingerprint: None,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Opens sessions; fails with `TransferError::Auth` or `TransferError::Connect`
pub trait SessionProvider {
    type Session: SecureSession;

    fn connect(&self, target: &RemoteTarget) -> Result<Self::Session>;
}

/// Owns a session for the duration of one operation and guarantees it is
/// closed exactly once.
///
/// On the success path call [`SessionGuard::close`] so close errors reach
/// the caller. On error paths the guard closes the session when dropped and
/// only logs close failures, so the original error is what propagates.
pub struct SessionGuard<S: SecureSession> {
    session: S,
    closed: bool,
}

impl<S: SecureSession> SessionGuard<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            closed: false,
        }
    }

    pub fn session(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn close(mut self) -> io::Result<()> {
        self.closed = true;
        self.session.close()
    }
}

impl<S: SecureSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!("closing session on error path");
            if let Err(e) = self.session.close() {
                warn!("failed to close session: {}", e);
            }
        }
    }
}

/// Create a remote directory and all of its parents. Idempotent.
pub fn make_dir_all<S: SecureSession + ?Sized>(session: &mut S, path: &str) -> io::Result<()> {
    let absolute = path.starts_with('/');
    let mut current = String::new();

    for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(part);
        session.make_dir(&current)?;
    }
    Ok(())
}

/// Bootstrap a remote directory (recursive, "already exists" is success)
pub fn create_remote_dir<S: SecureSession + ?Sized>(session: &mut S, path: &str) -> io::Result<()> {
    debug!("creating remote directory {}", path);
    make_dir_all(session, path)
}

/// Session over a local directory
///
/// Remote paths are confined to `root` with the same rules the host
/// applies, so `LocalSession` behaves like a jailed remote filesystem.
#[derive(Debug)]
pub struct LocalSession {
    root: PathBuf,
    closed: bool,
}

impl LocalSession {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            closed: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "session closed"));
        }
        let root = self.root.canonicalize()?;
        confine(&root, path)
    }
}

impl SecureSession for LocalSession {
    fn open_read(&mut self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let full = self.resolve(path)?;
        refuse_symlink(&full)?;
        Ok(Box::new(File::open(full)?))
    }

    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn RemoteSink>> {
        let full = self.resolve(path)?;
        refuse_symlink(&full)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(full)?;
        Ok(Box::new(LocalSink {
            writer: BufWriter::new(file),
            written: 0,
        }))
    }

    fn make_dir(&mut self, path: &str) -> io::Result<()> {
        let full = self.resolve(path)?;
        match fs::create_dir(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && full.is_dir() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn stat(&mut self, path: &str) -> io::Result<RemoteMetadata> {
        let meta = fs::symlink_metadata(self.resolve(path)?)?;
        Ok(RemoteMetadata::from_fs(&meta))
    }

    fn symlink(&mut self, target: &str, link: &str) -> io::Result<()> {
        let link = self.resolve(link)?;
        create_symlink(Path::new(target), &link)
    }

    fn set_permissions(&mut self, path: &str, mode: u32) -> io::Result<()> {
        let full = self.resolve(path)?;
        refuse_symlink(&full)?;
        apply_mode(&full, mode)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

struct LocalSink {
    writer: BufWriter<File>,
    written: u64,
}

impl Write for LocalSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl RemoteSink for LocalSink {
    fn finish(self: Box<Self>) -> io::Result<u64> {
        let written = self.written;
        let file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(written)
    }
}

/// Create a symlink, replacing nothing
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

/// Apply permission bits to a local path
#[cfg(unix)]
pub fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
pub fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_local_write_then_read() {
        let dir = tempdir().unwrap();
        let mut session = LocalSession::new(dir.path());

        let mut sink = session.open_write("/a.bin").unwrap();
        sink.write_all(b"hello").unwrap();
        assert_eq!(sink.finish().unwrap(), 5);

        let mut data = Vec::new();
        session.open_read("a.bin").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello");

        let meta = session.stat("a.bin").unwrap();
        assert_eq!(meta.kind, RemoteKind::File);
        assert_eq!(meta.size, 5);
    }

    #[test]
    fn test_make_dir_idempotent() {
        let dir = tempdir().unwrap();
        let mut session = LocalSession::new(dir.path());

        session.make_dir("out").unwrap();
        session.make_dir("out").unwrap();
        assert!(dir.path().join("out").is_dir());
    }

    #[test]
    fn test_make_dir_over_file_fails() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("taken"), b"x").unwrap();
        let mut session = LocalSession::new(dir.path());

        assert!(session.make_dir("taken").is_err());
    }

    #[test]
    fn test_make_dir_all_nested_twice() {
        let dir = tempdir().unwrap();
        let mut session = LocalSession::new(dir.path());

        make_dir_all(&mut session, "/a/b/./c/").unwrap();
        create_remote_dir(&mut session, "a/b/c").unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
    }

    #[test]
    fn test_local_session_rejects_escape() {
        let dir = tempdir().unwrap();
        let mut session = LocalSession::new(dir.path());

        let err = session.open_write("../outside.txt").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_closed_session_refuses_work() {
        let dir = tempdir().unwrap();
        let mut session = LocalSession::new(dir.path());
        session.close().unwrap();
        assert!(session.is_closed());
        assert!(session.make_dir("x").is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_symlink_and_permissions() {
        let dir = tempdir().unwrap();
        let mut session = LocalSession::new(dir.path());

        let mut sink = session.open_write("run.sh").unwrap();
        sink.write_all(b"#!/bin/sh\n").unwrap();
        sink.finish().unwrap();
        session.set_permissions("run.sh", 0o755).unwrap();
        assert_eq!(session.stat("run.sh").unwrap().mode, 0o755);

        session.symlink("run.sh", "link").unwrap();
        assert_eq!(session.stat("link").unwrap().kind, RemoteKind::Symlink);
    }
}
