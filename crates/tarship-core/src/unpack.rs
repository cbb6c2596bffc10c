//! Unpacker: remote tar archive → remote directory, streamed
//!
//! The archive is read forward-only through one session handle and each
//! entry is written back through the same session. Nothing is staged
//! locally and at most one copy buffer is held at a time.

use std::cell::Cell;
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::archive::EntryKind;
use crate::error::{Result, TransferError};
use crate::path::{entry_relative_path, join_remote, remote_parent};
use crate::progress::{Progress, ProgressSink, ProgressUnit};
use crate::session::{SecureSession, SessionGuard};
use crate::CHUNK_SIZE;

/// Extract `remote_archive` into `destination_dir` on the same remote side,
/// then close the session.
///
/// Progress is reported in archive bytes consumed. The first entry that
/// can't be written aborts the whole extraction; entries already written
/// stay where they are.
pub fn unpack<S: SecureSession>(
    session: S,
    remote_archive: &str,
    destination_dir: &str,
    sink: &dyn ProgressSink,
) -> Result<String> {
    let mut guard = SessionGuard::new(session);
    let summary = extract(guard.session(), remote_archive, destination_dir, sink)?;
    guard.close()?;

    info!(
        "Unpacked {} into {} ({} entries, {} skipped)",
        remote_archive, destination_dir, summary.entries, summary.skipped
    );
    Ok(destination_dir.to_string())
}

#[derive(Debug, Default)]
struct Summary {
    entries: u64,
    skipped: u64,
}

/// Byte position and transport health of the archive stream, shared with
/// the reader owned by `tar::Archive`
#[derive(Clone, Default)]
struct StreamCursor {
    position: Rc<Cell<u64>>,
    failed: Rc<Cell<bool>>,
}

impl StreamCursor {
    fn position(&self) -> u64 {
        self.position.get()
    }

    fn transport_failed(&self) -> bool {
        self.failed.get()
    }

    /// Errors from the transport stay I/O errors; everything the tar
    /// decoder complains about otherwise means the archive is bad.
    fn classify(&self, e: io::Error) -> TransferError {
        if self.transport_failed() {
            TransferError::Io(e)
        } else {
            TransferError::CorruptArchive(e.to_string())
        }
    }
}

struct CountingReader<R> {
    inner: R,
    cursor: StreamCursor,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(n) => {
                self.cursor.position.set(self.cursor.position.get() + n as u64);
                Ok(n)
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::Interrupted {
                    self.cursor.failed.set(true);
                }
                Err(e)
            }
        }
    }
}

/// Remote directories known to exist, so each is created once
struct KnownDirs {
    dirs: HashSet<String>,
}

impl KnownDirs {
    fn new() -> Self {
        Self {
            dirs: HashSet::new(),
        }
    }

    fn ensure<S: SecureSession + ?Sized>(&mut self, session: &mut S, path: &str) -> io::Result<()> {
        if self.dirs.contains(path) {
            return Ok(());
        }

        let absolute = path.starts_with('/');
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            if absolute || !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            if !self.dirs.contains(&current) {
                session.make_dir(&current)?;
                self.dirs.insert(current.clone());
            }
        }
        self.dirs.insert(path.to_string());
        Ok(())
    }
}

fn extract<S: SecureSession>(
    session: &mut S,
    remote_archive: &str,
    destination: &str,
    sink: &dyn ProgressSink,
) -> Result<Summary> {
    let total = match session.stat(remote_archive) {
        Ok(meta) => meta.size,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(TransferError::NotFound(PathBuf::from(remote_archive)));
        }
        Err(e) => return Err(e.into()),
    };

    let mut known = KnownDirs::new();
    known.ensure(session, destination)?;

    let cursor = StreamCursor::default();
    let stream = session.open_read(remote_archive)?;
    let mut archive = tar::Archive::new(CountingReader {
        inner: stream,
        cursor: cursor.clone(),
    });

    let mut progress = Progress::new(sink, remote_archive, ProgressUnit::Bytes, Some(total));
    let mut summary = Summary::default();
    let mut deferred_modes: Vec<(String, u32)> = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    let entries = archive.entries().map_err(|e| cursor.classify(e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| cursor.classify(e))?;

        let header_path = entry.path().map_err(|e| cursor.classify(e))?.into_owned();
        let relative = entry_relative_path(&header_path)
            .map_err(|e| TransferError::CorruptArchive(format!("{}: {}", header_path.display(), e)))?;
        let Some(relative) = relative else {
            progress.set_position(cursor.position());
            continue;
        };

        let entry_type = entry.header().entry_type();
        let mode = entry.header().mode().ok();
        let target = join_remote(destination, &relative);

        match EntryKind::from_tar(entry_type) {
            Some(EntryKind::Directory) => {
                known.ensure(session, &target)?;
                if let Some(mode) = mode {
                    // Applied last so a read-only directory can still be filled
                    deferred_modes.push((target.clone(), mode));
                }
            }
            Some(EntryKind::File) => {
                if let Some(parent) = remote_parent(&target) {
                    known.ensure(session, parent)?;
                }
                copy_entry(&mut entry, session, &target, &cursor, &mut buf)?;
                if let Some(mode) = mode {
                    session.set_permissions(&target, mode)?;
                }
            }
            Some(EntryKind::Symlink) => {
                let link_target = entry
                    .link_name()
                    .map_err(|e| cursor.classify(e))?
                    .ok_or_else(|| {
                        TransferError::CorruptArchive(format!("symlink {} has no target", relative))
                    })?;
                if let Some(parent) = remote_parent(&target) {
                    known.ensure(session, parent)?;
                }
                session.symlink(&link_target.to_string_lossy(), &target)?;
            }
            None => {
                warn!("skipping {} ({:?} entries are not extracted)", relative, entry_type);
                summary.skipped += 1;
                progress.set_position(cursor.position());
                continue;
            }
        }

        debug!("extracted {}", relative);
        summary.entries += 1;
        progress.set_position(cursor.position());
    }

    // Consume trailing padding so the stream ends cleanly
    let mut rest = archive.into_inner();
    io::copy(&mut rest, &mut io::sink())?;
    progress.set_position(cursor.position());

    for (path, mode) in deferred_modes.into_iter().rev() {
        session.set_permissions(&path, mode)?;
    }

    progress.finish();
    Ok(summary)
}

/// Stream one file entry into a remote file and check it against its header
fn copy_entry<R: Read, S: SecureSession>(
    entry: &mut tar::Entry<'_, R>,
    session: &mut S,
    target: &str,
    cursor: &StreamCursor,
    buf: &mut [u8],
) -> Result<()> {
    let declared = entry.size();
    let mut writer = session.open_write(target)?;
    let mut copied = 0u64;

    loop {
        let n = match entry.read(buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(cursor.classify(e)),
        };
        writer.write_all(&buf[..n])?;
        copied += n as u64;
    }

    if copied != declared {
        return Err(TransferError::CorruptArchive(format!(
            "{} is truncated: header declares {} bytes, archive holds {}",
            target, declared, copied
        )));
    }

    let written = writer.finish()?;
    if written != copied {
        return Err(TransferError::io(
            io::ErrorKind::WriteZero,
            format!("remote acknowledged {} of {} bytes for {}", written, copied, target),
        ));
    }
    Ok(())
}
