//! Shipper: local file → remote file over a secure session
//!
//! The file is read in fixed-size chunks. Each chunk is filled completely
//! before it's written, so only the final chunk may be short. One chunk
//! buffer is allocated per transfer.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::path::remote_parent;
use crate::progress::{format_bytes, Progress, ProgressSink, ProgressUnit};
use crate::session::{make_dir_all, SecureSession, SessionGuard};
use crate::DEFAULT_CHUNK_SIZE;

/// Tuning for [`ship`]
#[derive(Clone, Debug)]
pub struct ShipOptions {
    /// Bytes read and written per step
    pub chunk_size: usize,
    /// Create the remote parent directory before writing
    pub create_parent: bool,
}

impl Default for ShipOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            create_parent: true,
        }
    }
}

impl From<&TransferConfig> for ShipOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            create_parent: config.create_remote_parent,
        }
    }
}

/// Copy `local` to `remote` through `session`, then close the session.
///
/// The session is closed exactly once whether the transfer succeeds or not.
/// On failure the remote file may be partial.
pub fn ship<S: SecureSession>(
    session: S,
    local: &Path,
    remote: &str,
    options: &ShipOptions,
    sink: &dyn ProgressSink,
) -> Result<String> {
    let mut guard = SessionGuard::new(session);
    let sent = send_file(guard.session(), local, remote, options, sink)?;
    guard.close()?;

    info!("Shipped {:?} to {} ({})", local, remote, format_bytes(sent));
    Ok(remote.to_string())
}

fn send_file<S: SecureSession>(
    session: &mut S,
    local: &Path,
    remote: &str,
    options: &ShipOptions,
    sink: &dyn ProgressSink,
) -> Result<u64> {
    if options.chunk_size == 0 {
        return Err(TransferError::io(
            io::ErrorKind::InvalidInput,
            "chunk size must be positive",
        ));
    }

    let meta = match fs::metadata(local) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(TransferError::NotFound(local.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() {
        return Err(TransferError::io(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", local.display()),
        ));
    }
    let total = meta.len();

    if options.create_parent {
        if let Some(parent) = remote_parent(remote) {
            make_dir_all(session, parent)?;
        }
    }

    // Reading is capped at the size seen at start; growth after that is ignored
    let mut reader = File::open(local)?.take(total);
    let mut writer = session.open_write(remote)?;
    let mut buf = vec![0u8; options.chunk_size];

    let label = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| remote.to_string());
    let mut progress = Progress::new(sink, label, ProgressUnit::Bytes, Some(total));

    let mut sent = 0u64;
    let mut chunk = 0usize;
    loop {
        let n = read_chunk(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        sent += n as u64;
        chunk += 1;
        debug!("chunk {} written ({} bytes, {}/{})", chunk, n, sent, total);
        progress.advance(n as u64);
    }

    if sent != total {
        return Err(TransferError::io(
            io::ErrorKind::UnexpectedEof,
            format!(
                "{} shrank during transfer: expected {} bytes, read {}",
                local.display(),
                total,
                sent
            ),
        ));
    }

    let acknowledged = writer.finish()?;
    if acknowledged != total {
        return Err(TransferError::io(
            io::ErrorKind::WriteZero,
            format!(
                "remote acknowledged {} of {} bytes for {}",
                acknowledged, total, remote
            ),
        ));
    }

    progress.finish();
    Ok(sent)
}

/// Read until `buf` is full or the reader is exhausted
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{NullProgress, ProgressEvent};
    use crate::session::{LocalSession, RemoteMetadata, RemoteSink};
    use std::cell::RefCell;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Default)]
    struct Journal {
        writes: Vec<usize>,
        dirs: Vec<String>,
        closes: usize,
    }

    /// Session that records what the shipper asks of it
    struct RecordingSession {
        journal: Arc<Mutex<Journal>>,
        fail_writes_after: Option<usize>,
        short_ack: bool,
    }

    impl RecordingSession {
        fn new() -> (Self, Arc<Mutex<Journal>>) {
            let journal = Arc::new(Mutex::new(Journal::default()));
            (
                Self {
                    journal: journal.clone(),
                    fail_writes_after: None,
                    short_ack: false,
                },
                journal,
            )
        }
    }

    struct RecordingSink {
        journal: Arc<Mutex<Journal>>,
        fail_after: Option<usize>,
        short_ack: bool,
        total: u64,
    }

    impl Write for RecordingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut journal = self.journal.lock().unwrap();
            if Some(journal.writes.len()) == self.fail_after {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link dropped"));
            }
            journal.writes.push(buf.len());
            self.total += buf.len() as u64;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl RemoteSink for RecordingSink {
        fn finish(self: Box<Self>) -> io::Result<u64> {
            Ok(if self.short_ack { self.total / 2 } else { self.total })
        }
    }

    impl SecureSession for RecordingSession {
        fn open_read(&mut self, _path: &str) -> io::Result<Box<dyn Read + Send>> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "write only"))
        }

        fn open_write(&mut self, _path: &str) -> io::Result<Box<dyn RemoteSink>> {
            Ok(Box::new(RecordingSink {
                journal: self.journal.clone(),
                fail_after: self.fail_writes_after,
                short_ack: self.short_ack,
                total: 0,
            }))
        }

        fn make_dir(&mut self, path: &str) -> io::Result<()> {
            self.journal.lock().unwrap().dirs.push(path.to_string());
            Ok(())
        }

        fn stat(&mut self, _path: &str) -> io::Result<RemoteMetadata> {
            Err(io::Error::new(io::ErrorKind::NotFound, "nothing here"))
        }

        fn symlink(&mut self, _target: &str, _link: &str) -> io::Result<()> {
            Ok(())
        }

        fn set_permissions(&mut self, _path: &str, _mode: u32) -> io::Result<()> {
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            self.journal.lock().unwrap().closes += 1;
            Ok(())
        }
    }

    const MIB: usize = 1024 * 1024;

    #[test]
    fn test_chunks_are_full_except_last() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("big.tar");
        fs::write(&local, vec![3u8; 25 * MIB]).unwrap();

        let (session, journal) = RecordingSession::new();
        let result = ship(
            session,
            &local,
            "/remote/big.tar",
            &ShipOptions::default(),
            &NullProgress,
        )
        .unwrap();

        assert_eq!(result, "/remote/big.tar");
        let journal = journal.lock().unwrap();
        assert_eq!(journal.writes, vec![10 * MIB, 10 * MIB, 5 * MIB]);
        assert_eq!(journal.dirs, vec!["/remote".to_string()]);
        assert_eq!(journal.closes, 1);
    }

    #[test]
    fn test_progress_counts_bytes() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("a.tar");
        fs::write(&local, vec![1u8; 2500]).unwrap();

        let deltas = RefCell::new(Vec::new());
        let sink = |event: &ProgressEvent<'_>| {
            if let ProgressEvent::Advanced { delta, state } = event {
                assert_eq!(state.total, Some(2500));
                deltas.borrow_mut().push(*delta);
            }
        };

        let (session, _journal) = RecordingSession::new();
        let options = ShipOptions {
            chunk_size: 1000,
            create_parent: false,
        };
        ship(session, &local, "a.tar", &options, &sink).unwrap();

        assert_eq!(*deltas.borrow(), vec![1000, 1000, 500]);
    }

    #[test]
    fn test_empty_file_ships_without_writes() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("empty.tar");
        File::create(&local).unwrap();

        let (session, journal) = RecordingSession::new();
        ship(session, &local, "empty.tar", &ShipOptions::default(), &NullProgress).unwrap();

        let journal = journal.lock().unwrap();
        assert!(journal.writes.is_empty());
        assert_eq!(journal.closes, 1);
    }

    #[test]
    fn test_session_closed_once_on_write_failure() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("a.tar");
        fs::write(&local, vec![0u8; 4000]).unwrap();

        let (mut session, journal) = RecordingSession::new();
        session.fail_writes_after = Some(1);
        let options = ShipOptions {
            chunk_size: 1000,
            create_parent: true,
        };

        let err = ship(session, &local, "out/a.tar", &options, &NullProgress).unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
        assert_eq!(journal.lock().unwrap().closes, 1);
    }

    #[test]
    fn test_missing_local_file() {
        let temp = tempdir().unwrap();
        let (session, journal) = RecordingSession::new();

        let err = ship(
            session,
            &temp.path().join("missing.tar"),
            "x.tar",
            &ShipOptions::default(),
            &NullProgress,
        )
        .unwrap_err();

        assert!(matches!(err, TransferError::NotFound(_)));
        assert!(journal.lock().unwrap().writes.is_empty());
        assert_eq!(journal.lock().unwrap().closes, 1);
    }

    #[test]
    fn test_short_acknowledgement_fails() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("a.tar");
        fs::write(&local, vec![9u8; 64]).unwrap();

        let (mut session, journal) = RecordingSession::new();
        session.short_ack = true;

        let err = ship(session, &local, "a.tar", &ShipOptions::default(), &NullProgress).unwrap_err();
        match err {
            TransferError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::WriteZero),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(journal.lock().unwrap().closes, 1);
    }

    #[test]
    fn test_ship_into_local_session() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("payload.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&local, &data).unwrap();

        let remote_root = temp.path().join("remote");
        fs::create_dir(&remote_root).unwrap();

        let options = ShipOptions {
            chunk_size: 4096,
            create_parent: true,
        };
        ship(
            LocalSession::new(&remote_root),
            &local,
            "/incoming/deep/payload.bin",
            &options,
            &NullProgress,
        )
        .unwrap();

        let shipped = fs::read(remote_root.join("incoming/deep/payload.bin")).unwrap();
        assert_eq!(shipped, data);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let temp = tempdir().unwrap();
        let local = temp.path().join("a.tar");
        fs::write(&local, b"x").unwrap();

        let (session, journal) = RecordingSession::new();
        let options = ShipOptions {
            chunk_size: 0,
            create_parent: false,
        };
        assert!(ship(session, &local, "a.tar", &options, &NullProgress).is_err());
        assert_eq!(journal.lock().unwrap().closes, 1);
    }
}
